//! Wire types for the realtime conversation protocol.
//!
//! Outbound messages are modelled by [`ClientEvent`], inbound ones by
//! [`ServerEvent`]. Both are tagged by their `type` field on the wire. Inbound
//! frames are first kept as raw JSON in an [`InboundMessage`] so that unknown or
//! malformed events can still be logged before any typed interpretation.

pub mod client;
pub mod item;
pub mod server;
pub mod session;

pub use client::ClientEvent;
pub use item::{ContentPart, ContentType, Item, ItemRole, ItemStatus, ItemType};
pub use server::{ApiError, InboundMessage, ServerEvent};
pub use session::{AudioFormat, AudioTranscription, SessionConfig, ToolDefinition, TurnDetection};
