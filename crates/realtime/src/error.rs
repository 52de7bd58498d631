/// Failures while establishing or using the realtime channel.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("No API key configured for the realtime endpoint")]
    MissingCredential,
    #[error("No realtime endpoint configured")]
    MissingEndpoint,
    #[error("Invalid realtime endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Realtime handshake failed: {0}")]
    Handshake(String),
    #[error("Realtime channel is closed")]
    ChannelClosed,
    #[error("Realtime channel is full")]
    ChannelFull,
}
