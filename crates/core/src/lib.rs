//! Session logic of the Oracle voice companion.
//!
//! - `session`: the controller that ties the realtime channel, audio devices,
//!   conversation state, memory and tools together.
//! - `conversation`: reconciles server events into displayable items.
//! - `memory` / `context`: persistent facts and the instructions built from them.
//! - `tools`: the memory tools the model can call.
//! - `turn`: push-to-talk versus server VAD.
//! - `event_log`: collapsed log of protocol traffic.

pub mod context;
pub mod conversation;
pub mod error;
pub mod event_log;
pub mod memory;
pub mod session;
pub mod tools;
pub mod turn;

pub use context::{BASE_INSTRUCTIONS, compose_instructions, render_memory_context};
pub use conversation::{ConversationItem, ConversationReconciler, FunctionCall};
pub use error::{MemoryError, ProtocolEventError, SessionError, ToolInvocationError, TurnError};
pub use event_log::{EventLog, EventSource, RealtimeEvent};
pub use memory::{FileMemoryBackend, MemoryBackend, MemoryMap, MemoryStore};
pub use session::{ConnectionState, SessionController, SessionSettings};
pub use tools::ToolRegistry;
pub use turn::{PushToTalk, TurnMode};
