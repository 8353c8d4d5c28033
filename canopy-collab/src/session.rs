//! Collaboration session: one channel connection wired to presence and
//! conflict tracking.
//!
//! ```text
//!             ┌──────────────────── CollabSession ────────────────────┐
//!  inbound    │  presence ─► PresenceTracker::upsert_remote()         │
//!  ─────────► │  leave    ─► PresenceTracker::remove_remote()         │ ─► SessionEvent
//!             │  edit     ─► ConflictResolver::reconcile_remote()     │
//!             │                                                       │
//!  outbound   │  PresenceSink ─► Outbox ─► ConnectionManager::send()  │
//!  ◄───────── │  commit()     ─► record_version() + one edit/field    │
//!             └───────────────────────────────────────────────────────┘
//! ```
//!
//! Local presence is announced every time the connection opens, including
//! automatic reconnects, and again whenever a new participant appears so
//! newcomers learn about everyone already present. The remote roster
//! survives a `Reconnecting` outage and is cleared once the connection
//! settles in `Disconnected` or `Error`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::conflict::{
    ChangeSet, ConflictId, ConflictResolver, Reconciliation, RemoteEdit, ResolverConfig,
    VersionId,
};
use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionState, Subscription};
use crate::presence::{
    PresenceConfig, PresenceRecord, PresenceSink, PresenceTracker, RemoteUpdate,
};
use crate::protocol::{ChannelMessage, CurrentUser, MessageKind, ProtocolError};

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A remote edit applied cleanly; the caller should write it
    RemoteEdit(RemoteEdit),
    /// A remote edit diverged from local state
    ConflictDetected { id: ConflictId, field: String },
    ParticipantJoined(PresenceRecord),
    ParticipantLeft { user_id: String },
}

/// Payload of a `leave` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveNotice {
    pub user_id: String,
}

/// Session configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub presence: PresenceConfig,
    pub resolver: ResolverConfig,
}

/// A participant's view of one collaborative channel.
pub struct CollabSession {
    user: CurrentUser,
    connection: ConnectionManager,
    presence: Arc<PresenceTracker>,
    resolver: Arc<Mutex<ConflictResolver>>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    _subscriptions: Vec<Subscription>,
    state_watcher: JoinHandle<()>,
}

impl CollabSession {
    /// Build a session. Must be called inside a tokio runtime.
    ///
    /// Outbound messages are stamped with the user's id unless the
    /// connection config names another sender.
    pub fn new(user: CurrentUser, mut config: SessionConfig) -> Self {
        if config.connection.sender.is_none() {
            config.connection.sender = Some(user.id.clone());
        }
        let connection = ConnectionManager::new(config.connection);

        let outbox = connection.outbox();
        let sink: PresenceSink = Arc::new(move |record: &PresenceRecord| {
            if let Err(e) = outbox.send(MessageKind::Presence, record) {
                log::warn!("Failed to encode presence: {e}");
            }
        });
        let presence = Arc::new(PresenceTracker::new(user.clone(), config.presence, sink));
        let resolver = Arc::new(Mutex::new(ConflictResolver::new(user.clone(), config.resolver)));

        let (event_tx, event_rx) = mpsc::channel(256);
        let state_watcher = tokio::spawn(follow_connection(
            connection.watch_state(),
            Arc::downgrade(&presence),
            event_tx.clone(),
        ));
        let subscriptions = vec![
            subscribe_presence(&connection, &presence, event_tx.clone()),
            subscribe_leave(&connection, &presence, event_tx.clone()),
            subscribe_edits(&connection, &resolver, &user, event_tx),
        ];

        Self {
            user,
            connection,
            presence,
            resolver,
            event_rx: Some(event_rx),
            _subscriptions: subscriptions,
            state_watcher,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Connect. Local presence is announced once the connection opens.
    pub async fn connect(&self) {
        self.connection.connect().await;
    }

    /// Record a local version and publish one `edit` per changed field.
    pub fn commit(
        &self,
        changes: ChangeSet,
        message: Option<String>,
    ) -> Result<VersionId, ProtocolError> {
        let timestamp = Utc::now();
        let edits: Vec<RemoteEdit> = changes
            .iter()
            .map(|(field, change)| RemoteEdit {
                field: field.clone(),
                before: change.before.clone(),
                after: change.after.clone(),
                user_id: self.user.id.clone(),
                timestamp,
            })
            .collect();

        let id = self.resolver().record_version(changes, message);
        for edit in &edits {
            self.connection.send(MessageKind::Edit, edit)?;
        }
        Ok(id)
    }

    /// Announce departure (when connected) and disconnect.
    ///
    /// The remote roster is cleared once the disconnect is observed.
    pub fn shutdown(&self) {
        if self.connection.is_connected() {
            let notice = LeaveNotice {
                user_id: self.user.id.clone(),
            };
            if let Err(e) = self.connection.send(MessageKind::Leave, &notice) {
                log::warn!("Failed to encode leave notice: {e}");
            }
        }
        self.connection.disconnect();
    }

    pub fn user(&self) -> &CurrentUser {
        &self.user
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Lock the resolver. Do not hold the guard across `.await`.
    pub fn resolver(&self) -> MutexGuard<'_, ConflictResolver> {
        self.resolver.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        self.state_watcher.abort();
    }
}

fn emit(event_tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if let Err(e) = event_tx.try_send(event) {
        log::warn!("Dropping session event: {e}");
    }
}

fn subscribe_presence(
    connection: &ConnectionManager,
    presence: &Arc<PresenceTracker>,
    event_tx: mpsc::Sender<SessionEvent>,
) -> Subscription {
    let presence = presence.clone();
    connection.subscribe_data(MessageKind::Presence, move |msg: ChannelMessage<PresenceRecord>| {
        let record = msg.data;
        if presence.upsert_remote(record.clone()) == RemoteUpdate::Joined {
            emit(&event_tx, SessionEvent::ParticipantJoined(record));
            // The newcomer has not seen us yet.
            presence.announce();
        }
    })
}

/// Announce on every open; clear the roster once the connection settles
/// outside the channel.
async fn follow_connection(
    mut states: watch::Receiver<ConnectionState>,
    presence: Weak<PresenceTracker>,
    event_tx: mpsc::Sender<SessionEvent>,
) {
    while states.changed().await.is_ok() {
        let state = *states.borrow_and_update();
        let Some(presence) = presence.upgrade() else {
            break;
        };
        match state {
            // The watch only wakes on a changed state, so this is a new open
            // even when the intermediate states were coalesced.
            ConnectionState::Connected => {
                log::debug!("Connection open, announcing presence");
                presence.announce();
            }
            ConnectionState::Disconnected | ConnectionState::Error => {
                for user_id in presence.clear_remotes() {
                    emit(&event_tx, SessionEvent::ParticipantLeft { user_id });
                }
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {}
        }
    }
}

fn subscribe_leave(
    connection: &ConnectionManager,
    presence: &Arc<PresenceTracker>,
    event_tx: mpsc::Sender<SessionEvent>,
) -> Subscription {
    let presence = presence.clone();
    connection.subscribe_data(MessageKind::Leave, move |msg: ChannelMessage<LeaveNotice>| {
        if presence.remove_remote(&msg.data.user_id).is_some() {
            emit(&event_tx, SessionEvent::ParticipantLeft { user_id: msg.data.user_id });
        }
    })
}

fn subscribe_edits(
    connection: &ConnectionManager,
    resolver: &Arc<Mutex<ConflictResolver>>,
    user: &CurrentUser,
    event_tx: mpsc::Sender<SessionEvent>,
) -> Subscription {
    let resolver = resolver.clone();
    let own_id = user.id.clone();
    connection.subscribe_data(MessageKind::Edit, move |msg: ChannelMessage<RemoteEdit>| {
        let edit = msg.data;
        if edit.user_id == own_id {
            return;
        }
        let outcome = resolver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reconcile_remote(&edit);
        match outcome {
            Reconciliation::Apply => emit(&event_tx, SessionEvent::RemoteEdit(edit)),
            Reconciliation::Conflict(id) => emit(
                &event_tx,
                SessionEvent::ConflictDetected {
                    id,
                    field: edit.field,
                },
            ),
            Reconciliation::Duplicate => log::trace!("Duplicate edit on '{}'", edit.field),
        }
    })
}
