//! Error taxonomy for the streaming comparison pipeline.
//!
//! Local errors (device, config) abort a session before any network resource
//! is touched. Transport errors tear the whole session down. Provider errors
//! are scoped to the failing provider and never affect the other stream.

/// Errors raised while starting or running a comparison session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Capture device unavailable or permission denied. Fatal, raised before
    /// any network resource is acquired.
    #[error("audio device error: {0}")]
    Device(String),

    /// No provider has a credential configured; a session cannot start.
    #[error("configuration error: {0}")]
    ConfigValidation(String),

    /// Handshake failure or unexpected close on the client transport channel.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors scoped to a single upstream provider connection.
///
/// These never end the session on their own; the session ends only when
/// every provider has failed.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider rejected our credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The provider sent something we could not parse, or violated the
    /// expected message sequence.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The upstream connection dropped unexpectedly.
    #[error("disconnected: {0}")]
    Disconnected(String),
}
