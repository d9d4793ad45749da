//! Error taxonomy for hub channel operations.

use std::time::Duration;

/// Everything that can go wrong while talking to a hub.
///
/// `Cancelled` is not a failure: it marks an intentional shutdown and
/// callers are expected to unwind without logging it as an error.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// No live connection to the hub.
    #[error("not connected to the hub")]
    NotConnected,

    /// The hub reported the operation unknown or its handler errored.
    #[error("operation rejected by hub: {0}")]
    RemoteRejected(String),

    /// No completion arrived within the invoke window.
    #[error("no response from hub within {0:?}")]
    Timeout(Duration),

    /// Transport-level failure (dial, socket, encode).
    #[error("transport error: {0}")]
    Transport(String),

    /// The operation was interrupted by shutdown.
    #[error("cancelled")]
    Cancelled,
}
