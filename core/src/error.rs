//! Error types for vahti sinks

use thiserror::Error;

/// Error type for sink operations
///
/// Every sink failure is best-effort from the pipeline's point of view: the
/// event is not retried and the failure is recorded against the category's
/// health record as `SinkUnavailable`.
///
/// # Example
///
/// ```
/// use vahti_core::SinkError;
///
/// fn post_marker() -> Result<(), SinkError> {
///     Err(SinkError::Unavailable("connection refused".to_string()))
/// }
///
/// match post_marker() {
///     Ok(()) => println!("posted"),
///     Err(SinkError::Unavailable(msg)) => println!("sink down: {}", msg),
///     Err(e) => println!("other error: {}", e),
/// }
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Destination could not be reached or answered with a server error
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// Destination refused the payload (4xx)
    #[error("sink rejected event with status {status}: {message}")]
    Rejected {
        /// HTTP status returned by the destination
        status: u16,
        /// Short description, never a response body with secrets
        message: String,
    },

    /// Delivery exceeded the configured timeout
    #[error("sink timed out")]
    Timeout,

    /// Event could not be encoded for the destination
    #[error("encode failed: {0}")]
    Encode(String),

    /// Sink is not configured or not ready yet
    #[error("sink not ready")]
    NotReady,
}
