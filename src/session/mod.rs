//! # Sessions
//!
//! Everything that lives for the duration of one WebSocket connection:
//!
//! - **transport**: the frame sink a connection writes to, and the outbox
//!   that serializes and chunks protocol messages onto it
//! - **registry**: per-session state and the process-wide session map
//! - **connection**: inbound frame handling and the session state machine
//! - **sweeper**: heartbeat and idle-reaper background sweeps

pub mod connection;
pub mod registry;
pub mod sweeper;
pub mod transport;

pub use connection::{Connection, SessionServices};
pub use registry::SessionRegistry;
pub use sweeper::SessionSweeper;
pub use transport::{CloseCode, FrameSink, OutboundFrame, TransportClosed};
