//! Connection state machine and reconnect backoff.
//!
//! Pure bookkeeping: no sockets, no timers. The manager feeds it events
//! and acts on the returned decisions, which keeps every transition
//! testable without a network.
//!
//! ```text
//!  Disconnected ── connect ──► Connecting ── open ──► Connected
//!                               │      │                 │
//!                  config error │      │ handshake       │ unexpected close
//!                               ▼      ▼ failed          ▼
//!                             Error   Reconnecting ◄─────┘
//!                                          │
//!                                          └── timer ──► Connecting
//!
//!  disconnect() or retries exhausted ──► Disconnected (from any live state)
//!  explicit connect/reconnect        ──► Connecting   (from Error)
//! ```

use std::time::Duration;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    /// Whether `self -> next` is an edge of the connection state machine.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Error, Connecting)
                | (Error, Disconnected)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Reconnecting)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnected)
        )
    }

    /// Whether a connect request should be ignored in this state.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Reconnect policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Schedule reconnects after unexpected closes
    pub enabled: bool,
    /// Delay before the first retry; doubled per attempt
    pub base: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Retries allowed before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max_delay)`, saturating.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What the manager should do after the transport closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Arm the backoff timer for `delay`; this is retry number `attempt`.
    Retry { delay: Duration, attempt: u32 },
    /// Stay disconnected.
    GiveUp,
}

/// Connection state plus the reconnect attempt counter.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ConnectionState,
    attempts: u32,
    policy: ReconnectPolicy,
}

impl StateMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Retries scheduled since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            log::warn!("Ignoring invalid connection transition {} -> {}", self.state, next);
            return false;
        }
        log::debug!("Connection state {} -> {}", self.state, next);
        self.state = next;
        true
    }

    /// A connect attempt starts (user request or backoff timer).
    ///
    /// Returns `false` when already connecting or connected.
    pub fn begin_attempt(&mut self) -> bool {
        if self.state.is_active() {
            return false;
        }
        self.transition(ConnectionState::Connecting)
    }

    /// Transport opened.
    pub fn opened(&mut self) -> bool {
        let moved = self.transition(ConnectionState::Connected);
        if moved {
            self.attempts = 0;
        }
        moved
    }

    /// Endpoint validation or transport construction failed.
    pub fn configuration_failed(&mut self) -> bool {
        self.transition(ConnectionState::Error)
    }

    /// Transport closed without being asked to (or the handshake failed).
    pub fn connection_lost(&mut self) -> CloseOutcome {
        if !matches!(self.state, ConnectionState::Connected | ConnectionState::Connecting) {
            return CloseOutcome::GiveUp;
        }
        if self.policy.enabled && self.attempts < self.policy.max_attempts {
            let delay = self.policy.delay_for(self.attempts);
            self.attempts += 1;
            self.transition(ConnectionState::Reconnecting);
            CloseOutcome::Retry {
                delay,
                attempt: self.attempts,
            }
        } else {
            self.transition(ConnectionState::Disconnected);
            CloseOutcome::GiveUp
        }
    }

    /// Backoff timer fired.
    pub fn timer_fired(&mut self) -> bool {
        if self.state != ConnectionState::Reconnecting {
            return false;
        }
        self.transition(ConnectionState::Connecting)
    }

    /// Intentional close.
    pub fn disconnected(&mut self) -> bool {
        self.transition(ConnectionState::Disconnected)
    }

    /// Manual reconnect: attempts start over.
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }
}
