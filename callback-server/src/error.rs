//! Error types for the callback server.

/// Errors starting or stopping a [`CallbackServer`](crate::CallbackServer).
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Every port in the requested range is taken
    #[error("No available port found in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },

    /// The server task ended before it was ready
    #[error("Server failed to start")]
    StartupFailed,

    /// The server task panicked or was aborted
    #[error("Server shutdown failed: {0}")]
    ShutdownFailed(String),
}
