//! Presence tracking: local liveness, cursor and selection, plus the
//! set of remote participants.
//!
//! ## Architecture
//!
//! ```text
//! ActivityFeed::signal()      update_cursor() / update_selection()
//!       │                               │
//!       ▼                               ▼
//!  listener task ──────────► PresenceTracker ──► rearm idle/away timer
//!                                   │
//!                                   │  throttled (status changes bypass)
//!                                   ▼
//!                            PresenceSink(&PresenceRecord)
//!                                   │
//!                                   ▼   (caller's transport)
//!                       remote PresenceTracker::upsert_remote()
//! ```
//!
//! The tracker never touches a transport; outbound records go to the
//! caller-supplied sink.

use std::collections::HashMap;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::CurrentUser;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Cursor position in document coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, element_id: None }
    }

    pub fn in_element(mut self, element_id: impl Into<String>) -> Self {
        self.element_id = Some(element_id.into());
        self
    }
}

/// Text selection range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRange {
    pub start: u32,
    pub end: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
}

impl SelectionRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end, element_id: None }
    }

    pub fn in_element(mut self, element_id: impl Into<String>) -> Self {
        self.element_id = Some(element_id.into());
        self
    }
}

/// Participant liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Active,
    Idle,
    Away,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PresenceStatus::Active => "active",
            PresenceStatus::Idle => "idle",
            PresenceStatus::Away => "away",
        };
        f.write_str(s)
    }
}

/// One participant's published presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
    pub status: PresenceStatus,
    pub last_activity: DateTime<Utc>,
}

/// User input that counts as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySignal {
    PointerMove,
    KeyPress,
    Touch,
    Scroll,
    Click,
}

/// Outcome of [`PresenceTracker::upsert_remote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteUpdate {
    /// First record seen for this participant
    Joined,
    /// Existing participant updated
    Updated,
    /// Own record, or older than the stored one
    Ignored,
}

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Participant color palette.
pub const PALETTE: [&str; 15] = [
    "#ef4444", "#f97316", "#f59e0b", "#eab308", "#84cc16",
    "#22c55e", "#10b981", "#14b8a6", "#06b6d4", "#0ea5e9",
    "#3b82f6", "#6366f1", "#8b5cf6", "#a855f7", "#ec4899",
];

/// Stable color for a user id.
///
/// Pure: the same id yields the same color in every process. Distinct
/// ids may collide.
pub fn user_id_to_color(user_id: &str) -> &'static str {
    let hash = user_id
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)));
    PALETTE[hash.unsigned_abs() as usize % PALETTE.len()]
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Presence configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceConfig {
    /// Minimum interval between throttled sends
    pub throttle: Duration,
    /// Inactivity before `Idle`
    pub idle_timeout: Duration,
    /// Inactivity before `Away`, measured from the last activity
    pub away_timeout: Duration,
    /// Send the latest record once the throttle window closes
    pub trailing_edge: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(60),
            away_timeout: Duration::from_secs(300),
            trailing_edge: false,
        }
    }
}

impl PresenceConfig {
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_timeouts(mut self, idle: Duration, away: Duration) -> Self {
        self.idle_timeout = idle;
        self.away_timeout = away;
        self
    }

    pub fn with_trailing_edge(mut self, enabled: bool) -> Self {
        self.trailing_edge = enabled;
        self
    }
}

/// Outbound presence callback.
pub type PresenceSink = Arc<dyn Fn(&PresenceRecord) + Send + Sync>;

struct LocalState {
    cursor: Option<CursorPosition>,
    selection: Option<SelectionRange>,
    status: PresenceStatus,
    last_activity: DateTime<Utc>,
    last_send: Option<Instant>,
    /// Bumped on every rearm; a timer only applies its own generation
    generation: u64,
    liveness_timer: Option<JoinHandle<()>>,
    trailing: Option<JoinHandle<()>>,
}

struct Shared {
    user: CurrentUser,
    color: &'static str,
    config: PresenceConfig,
    sink: PresenceSink,
    /// Runtime the tracker was created on; timers spawn here from any thread
    runtime: Handle,
    local: Mutex<LocalState>,
    remotes: RwLock<HashMap<String, PresenceRecord>>,
}

impl Shared {
    fn local(&self) -> MutexGuard<'_, LocalState> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, state: &LocalState) -> PresenceRecord {
        PresenceRecord {
            user_id: self.user.id.clone(),
            user_name: self.user.name.clone(),
            avatar: self.user.avatar.clone(),
            color: self.color.to_string(),
            cursor: state.cursor.clone(),
            selection: state.selection.clone(),
            status: state.status,
            last_activity: state.last_activity,
        }
    }

    /// Mark active and restart the idle/away countdown.
    ///
    /// Returns whether the status changed.
    fn touch(self: &Arc<Self>, state: &mut LocalState) -> bool {
        let changed = state.status != PresenceStatus::Active;
        state.status = PresenceStatus::Active;
        state.last_activity = Utc::now();
        self.rearm(state);
        changed
    }

    fn rearm(self: &Arc<Self>, state: &mut LocalState) {
        if let Some(timer) = state.liveness_timer.take() {
            timer.abort();
        }
        state.generation += 1;

        let generation = state.generation;
        let idle = self.config.idle_timeout;
        let away_after = self.config.away_timeout.saturating_sub(idle);
        let weak = Arc::downgrade(self);
        state.liveness_timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(idle).await;
            match weak.upgrade() {
                Some(shared) => shared.expire(generation, PresenceStatus::Idle),
                None => return,
            }
            tokio::time::sleep(away_after).await;
            if let Some(shared) = weak.upgrade() {
                shared.expire(generation, PresenceStatus::Away);
            }
        }));
    }

    fn expire(&self, generation: u64, status: PresenceStatus) {
        let record = {
            let mut state = self.local();
            if state.generation != generation || state.status == status {
                return;
            }
            log::debug!("Presence {} -> {}", state.status, status);
            state.status = status;
            state.last_send = Some(Instant::now());
            self.record(&state)
        };
        (self.sink)(&record);
    }

    /// Apply a local change, then send per the throttle rules.
    fn update(self: &Arc<Self>, apply: impl FnOnce(&mut LocalState)) {
        let outgoing = {
            let mut state = self.local();
            apply(&mut *state);
            let status_changed = self.touch(&mut state);

            let now = Instant::now();
            let window_open = state
                .last_send
                .map_or(true, |last| now.duration_since(last) >= self.config.throttle);

            if status_changed || window_open {
                if let Some(trailing) = state.trailing.take() {
                    trailing.abort();
                }
                state.last_send = Some(now);
                Some(self.record(&state))
            } else {
                if self.config.trailing_edge && state.trailing.is_none() {
                    self.schedule_trailing(&mut state);
                }
                None
            }
        };
        if let Some(record) = outgoing {
            (self.sink)(&record);
        }
    }

    fn schedule_trailing(self: &Arc<Self>, state: &mut LocalState) {
        let Some(last) = state.last_send else {
            return;
        };
        let deadline = last + self.config.throttle;
        let weak = Arc::downgrade(self);
        state.trailing = Some(self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = weak.upgrade() {
                shared.flush_trailing();
            }
        }));
    }

    fn flush_trailing(&self) {
        let record = {
            let mut state = self.local();
            if state.trailing.take().is_none() {
                return;
            }
            state.last_send = Some(Instant::now());
            self.record(&state)
        };
        log::trace!("Trailing presence send");
        (self.sink)(&record);
    }

    fn on_activity(self: &Arc<Self>, signal: ActivitySignal) {
        let record = {
            let mut state = self.local();
            if !self.touch(&mut state) {
                return;
            }
            log::debug!("Presence active again ({signal:?})");
            state.last_send = Some(Instant::now());
            self.record(&state)
        };
        (self.sink)(&record);
    }
}

/// Tracks the local participant's presence and the remote participants.
///
/// Must be created inside a tokio runtime: the activity listener and the
/// idle/away timer are tasks owned by the tracker and aborted on drop.
/// Once created, every method may be called from any thread, including
/// threads outside the runtime.
pub struct PresenceTracker {
    shared: Arc<Shared>,
    activity_tx: mpsc::UnboundedSender<ActivitySignal>,
    listener: JoinHandle<()>,
}

impl PresenceTracker {
    /// Create a tracker for `user`, sending outbound records to `sink`.
    ///
    /// Starts `Active` with the idle countdown armed. Nothing is sent
    /// until the first update or [`announce`](Self::announce).
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(user: CurrentUser, config: PresenceConfig, sink: PresenceSink) -> Self {
        let color = user_id_to_color(&user.id);
        let runtime = Handle::current();
        let shared = Arc::new(Shared {
            user,
            color,
            config,
            sink,
            runtime: runtime.clone(),
            local: Mutex::new(LocalState {
                cursor: None,
                selection: None,
                status: PresenceStatus::Active,
                last_activity: Utc::now(),
                last_send: None,
                generation: 0,
                liveness_timer: None,
                trailing: None,
            }),
            remotes: RwLock::new(HashMap::new()),
        });
        {
            let mut state = shared.local();
            shared.rearm(&mut state);
        }

        let (activity_tx, activity_rx) = mpsc::unbounded_channel();
        let listener = runtime.spawn(listen(Arc::downgrade(&shared), activity_rx));

        Self {
            shared,
            activity_tx,
            listener,
        }
    }

    /// Handle for feeding activity signals from an input source.
    pub fn activity_feed(&self) -> ActivityFeed {
        ActivityFeed {
            tx: self.activity_tx.clone(),
        }
    }

    /// Record activity synchronously.
    pub fn record_activity(&self, signal: ActivitySignal) {
        self.shared.on_activity(signal);
    }

    pub fn update_cursor(&self, position: CursorPosition) {
        self.shared.update(|state| state.cursor = Some(position));
    }

    pub fn update_selection(&self, range: SelectionRange) {
        self.shared.update(|state| state.selection = Some(range));
    }

    pub fn clear_selection(&self) {
        self.shared.update(|state| state.selection = None);
    }

    /// Send the current local record, ignoring the throttle.
    pub fn announce(&self) {
        let record = {
            let mut state = self.shared.local();
            state.last_send = Some(Instant::now());
            self.shared.record(&state)
        };
        (self.shared.sink)(&record);
    }

    pub fn status(&self) -> PresenceStatus {
        self.shared.local().status
    }

    pub fn cursor(&self) -> Option<CursorPosition> {
        self.shared.local().cursor.clone()
    }

    pub fn selection(&self) -> Option<SelectionRange> {
        self.shared.local().selection.clone()
    }

    /// Snapshot of the local participant's record.
    pub fn local_record(&self) -> PresenceRecord {
        let state = self.shared.local();
        self.shared.record(&state)
    }

    pub fn user(&self) -> &CurrentUser {
        &self.shared.user
    }

    pub fn color(&self) -> &'static str {
        self.shared.color
    }

    // ── Remote participants ────────────────────────────────────────

    fn remotes_read(&self) -> RwLockReadGuard<'_, HashMap<String, PresenceRecord>> {
        self.shared.remotes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn remotes_write(&self) -> RwLockWriteGuard<'_, HashMap<String, PresenceRecord>> {
        self.shared.remotes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a remote participant's record.
    ///
    /// Own records and records older than the stored one are ignored.
    pub fn upsert_remote(&self, record: PresenceRecord) -> RemoteUpdate {
        if record.user_id == self.shared.user.id {
            return RemoteUpdate::Ignored;
        }

        let mut remotes = self.remotes_write();
        let stored_at = remotes.get(&record.user_id).map(|existing| existing.last_activity);
        match stored_at {
            Some(at) if at > record.last_activity => {
                log::trace!("Ignoring stale presence for {}", record.user_id);
                RemoteUpdate::Ignored
            }
            Some(_) => {
                remotes.insert(record.user_id.clone(), record);
                RemoteUpdate::Updated
            }
            None => {
                log::debug!("Participant joined: {} ({})", record.user_name, record.user_id);
                remotes.insert(record.user_id.clone(), record);
                RemoteUpdate::Joined
            }
        }
    }

    pub fn remove_remote(&self, user_id: &str) -> Option<PresenceRecord> {
        let removed = self.remotes_write().remove(user_id);
        if removed.is_some() {
            log::debug!("Participant left: {user_id}");
        }
        removed
    }

    pub fn remote(&self, user_id: &str) -> Option<PresenceRecord> {
        self.remotes_read().get(user_id).cloned()
    }

    /// Remote participants ordered by user id.
    pub fn remote_participants(&self) -> Vec<PresenceRecord> {
        let mut participants: Vec<PresenceRecord> =
            self.remotes_read().values().cloned().collect();
        participants.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        participants
    }

    /// Remote participants plus the local one.
    pub fn participant_count(&self) -> usize {
        self.remotes_read().len() + 1
    }

    /// Forget every remote participant. Returns the removed user ids.
    pub fn clear_remotes(&self) -> Vec<String> {
        let mut removed: Vec<String> = self.remotes_write().drain().map(|(id, _)| id).collect();
        removed.sort();
        if !removed.is_empty() {
            log::debug!("Cleared {} remote participant(s)", removed.len());
        }
        removed
    }

    /// Drop remote participants whose last activity is older than `max_age`.
    ///
    /// Returns the removed user ids.
    pub fn prune_stale(&self, max_age: Duration) -> Vec<String> {
        let now = Utc::now();
        let mut removed = Vec::new();
        self.remotes_write().retain(|id, record| {
            let stale = now
                .signed_duration_since(record.last_activity)
                .to_std()
                .is_ok_and(|age| age > max_age);
            if stale {
                removed.push(id.clone());
            }
            !stale
        });
        removed.sort();
        removed
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.listener.abort();
        let mut state = self.shared.local();
        if let Some(timer) = state.liveness_timer.take() {
            timer.abort();
        }
        if let Some(trailing) = state.trailing.take() {
            trailing.abort();
        }
    }
}

async fn listen(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<ActivitySignal>) {
    while let Some(signal) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.on_activity(signal);
    }
}

/// Sender side of a tracker's activity listener.
#[derive(Debug, Clone)]
pub struct ActivityFeed {
    tx: mpsc::UnboundedSender<ActivitySignal>,
}

impl ActivityFeed {
    /// Report activity. Returns `false` once the tracker is gone.
    pub fn signal(&self, signal: ActivitySignal) -> bool {
        self.tx.send(signal).is_ok()
    }
}
