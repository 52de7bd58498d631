//! Error taxonomy of the session core.

use oracle_native_utils::DeviceError;
use oracle_realtime::ConnectionError;
use thiserror::Error;

/// Failures loading or persisting the memory record.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Memory storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Memory record is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Memory record has an unexpected shape: {0}")]
    InvalidRecord(String),
}

/// Failures inside a tool call. These never leave the registry.
#[derive(Error, Debug)]
pub enum ToolInvocationError {
    #[error("Unknown tool '{0}'")]
    UnknownTool(String),
    #[error("Invalid arguments for tool '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },
    #[error("Tool service unavailable: {0}")]
    Service(String),
    #[error("Tool '{name}' failed: {reason}")]
    Failed { name: String, reason: String },
}

/// An inbound event that could not be interpreted, or an error reported by
/// the remote service. Logged; the session continues.
#[derive(Error, Debug)]
pub enum ProtocolEventError {
    #[error("Malformed '{kind}' event: {reason}")]
    Malformed { kind: String, reason: String },
    #[error("Server reported an error: {message}")]
    Server { code: Option<String>, message: String },
}

/// Rejected push-to-talk requests.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnError {
    #[error("Push-to-talk requires a connected session")]
    NotConnected,
    #[error("Push-to-talk is unavailable while voice activity detection is on")]
    AutomaticMode,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error(transparent)]
    Tool(#[from] ToolInvocationError),
    #[error("Session is not connected")]
    NotConnected,
    #[error("Connect was superseded by a newer lifecycle request")]
    Superseded,
}
