//! Client connection to a single collaboration channel.
//!
//! Architecture:
//! ```text
//! ┌───────────────────┐  send()   ┌────────────────┐  not connected
//! │ ConnectionManager │ ────────► │ writer task    │ ◄──────────┐
//! │ (StateMachine)    │           │ (+ heartbeat)  │            │
//! └─────────┬─────────┘           └────────────────┘   ┌────────┴───────┐
//!           │ open: flush FIFO ──────────────────────► │ OutboundBuffer │
//!           │                                          └────────────────┘
//!           ▼
//! ┌───────────────────┐  decode   ┌─────────────────┐
//! │ reader task       │ ────────► │ HandlerRegistry │ ──► handlers by kind
//! └───────────────────┘           └─────────────────┘
//! ```
//!
//! - [`state`]: connection states, transitions and backoff
//! - [`buffer`]: bounded FIFO of frames sent while disconnected
//! - [`handlers`]: per-kind handler lists and `Subscription` guards
//! - [`manager`]: the tokio-tungstenite client tying them together

pub mod buffer;
pub mod handlers;
pub mod manager;
pub mod state;

pub use buffer::OutboundBuffer;
pub use handlers::{Handler, HandlerRegistry, Subscription};
pub use manager::{
    ConnectionConfig, ConnectionError, ConnectionManager, ConnectionStats, Delivery, Outbox,
};
pub use state::{CloseOutcome, ConnectionState, ReconnectPolicy, StateMachine};
