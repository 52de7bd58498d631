//! Client side of the realtime conversation channel.
//!
//! - `transport`: opens the bidirectional channel (WebSocket by default) and
//!   exposes it as a pair of in-order message queues.
//! - `client`: typed helpers for every outbound message the session needs.
//! - `error`: the connection error taxonomy.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{RealtimeClient, samples_to_ms};
pub use error::ConnectionError;
pub use oracle_realtime_types as types;
pub use transport::{ConnectionGuard, RealtimeConnection, RealtimeTransport, WebSocketTransport};
