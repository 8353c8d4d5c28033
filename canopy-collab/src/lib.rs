//! # canopy-collab: client-side realtime collaboration layer
//!
//! Keeps one participant attached to a shared channel over WebSocket,
//! broadcasts their presence, and tracks field-level versions and
//! conflicts against other participants' edits.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐    JSON envelopes    ┌─────────────┐
//! │ ConnectionManager │ ◄──────────────────► │ relay server│
//! │ (per channel)     │      WebSocket       │ (external)  │
//! └─────────┬─────────┘                      └─────────────┘
//!           │ presence / leave / edit
//!           ▼
//! ┌───────────────────┐        ┌──────────────────┐
//! │ PresenceTracker   │        │ ConflictResolver │
//! │ (liveness, cursor)│        │ (versions)       │
//! └───────────────────┘        └──────────────────┘
//!           ▲                           ▲
//!           └─────── CollabSession ─────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire envelope (`ChannelMessage`) and message kinds
//! - [`connection`]: connection state machine, backoff, buffering, dispatch
//! - [`presence`]: local liveness and remote participant tracking
//! - [`conflict`]: version history, diffing and conflict adjudication
//! - [`session`]: the three wired together for one participant

pub mod protocol;
pub mod connection;
pub mod presence;
pub mod conflict;
pub mod session;

// Re-exports for convenience
pub use protocol::{ChannelMessage, CurrentUser, MessageKind, ProtocolError};
pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionManager, ConnectionState, ConnectionStats,
    Delivery, Outbox, ReconnectPolicy, Subscription,
};
pub use presence::{
    ActivityFeed, ActivitySignal, CursorPosition, PresenceConfig, PresenceRecord, PresenceSink,
    PresenceStatus, PresenceTracker, RemoteUpdate, SelectionRange, user_id_to_color,
};
pub use conflict::{
    ChangeSet, ConflictDetails, ConflictId, ConflictRecord, ConflictResolver, FieldChange,
    Reconciliation, RemoteEdit, Resolution, ResolvedConflict, ResolverConfig, Snapshot,
    VersionEntry, VersionId,
};
pub use session::{CollabSession, LeaveNotice, SessionConfig, SessionEvent};
