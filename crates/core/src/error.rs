//! Error types for the Valet domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Valet operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Errors raised by a generation engine.
///
/// `Clone` so stub engines in tests can return the same error repeatedly
/// and so a failed-tier error can be logged and still propagated.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Engine request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by engine, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Engine not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Errors raised by the device-action collaborator.
///
/// These never reach a caller as fatal: the dispatcher demotes them to a
/// fall-through into normal generation.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("No device backend configured")]
    NotConfigured,

    #[error("Device command failed: {command}: {reason}")]
    ExecutionFailed { command: String, reason: String },

    #[error("Device command timed out: {command} after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },
}

/// Errors raised by the session cache.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A generation is already in flight for this session and the busy
    /// policy is `reject`.
    #[error("Session busy: a generation is already in flight for '{0}'")]
    Busy(String),

    #[error("Session not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_displays_correctly() {
        let err = Error::Engine(EngineError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn session_busy_displays_session_id() {
        let err = Error::Session(SessionError::Busy("kitchen-panel".into()));
        assert!(err.to_string().contains("kitchen-panel"));
    }

    #[test]
    fn device_error_displays_command() {
        let err = DeviceError::ExecutionFailed {
            command: "lock the doors".into(),
            reason: "hub offline".into(),
        };
        assert!(err.to_string().contains("lock the doors"));
        assert!(err.to_string().contains("hub offline"));
    }
}
