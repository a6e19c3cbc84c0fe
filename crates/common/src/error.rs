use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical PDQ error taxonomy used across crates.
///
/// Classification guidance:
/// - [`PdqError::UserCode`]: a mapper or sketch returned an error; the
///   producing dataset remains valid for retries
/// - [`PdqError::TypeMismatch`]: zip between incompatible dataset shapes or
///   element types; fatal to the operation
/// - [`PdqError::ShapeMismatch`]: parallel zip with unequal child counts;
///   fatal to the operation
/// - [`PdqError::ObjectNotFound`]: an RPC referenced an unknown handle id
/// - [`PdqError::SessionBusy`]: second request on a session with an
///   in-flight operation; the session itself stays intact
/// - [`PdqError::Transport`]: RPC connection loss; partial results already
///   delivered remain valid
/// - [`PdqError::Cancelled`]: subscriber disposed; never delivered to the
///   disposing subscriber itself
/// - [`PdqError::InvalidConfig`]: configuration/environment contract
///   violations
/// - [`PdqError::Serde`]: envelope or payload encode/decode failures
/// - [`PdqError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum PdqError {
    /// A user-supplied mapper or sketch failed.
    #[error("user code failure: {0}")]
    UserCode(String),

    /// Zip between incompatible dataset variants or element types.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Parallel zip with mismatched child counts.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// An RPC referenced a handle id not present in the registry.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// A second request arrived on a session with an in-flight operation.
    #[error("session busy: {0}")]
    SessionBusy(String),

    /// RPC transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The subscription was disposed before the stream terminated.
    #[error("cancelled")]
    Cancelled,

    /// Runtime execution failure inside the framework itself.
    #[error("execution error: {0}")]
    Execution(String),

    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Envelope/payload serialization failure.
    #[error("serialization error: {0}")]
    Serde(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PdqError {
    /// Stable machine-readable code for UI-facing replies.
    pub fn code(&self) -> &'static str {
        match self {
            PdqError::UserCode(_) => "USER_CODE_FAILURE",
            PdqError::TypeMismatch(_) => "TYPE_MISMATCH",
            PdqError::ShapeMismatch(_) => "SHAPE_MISMATCH",
            PdqError::ObjectNotFound(_) => "OBJECT_NOT_FOUND",
            PdqError::SessionBusy(_) => "SESSION_BUSY",
            PdqError::Transport(_) => "TRANSPORT_ERROR",
            PdqError::Cancelled => "CANCELLED",
            PdqError::Execution(_) => "EXECUTION_ERROR",
            PdqError::InvalidConfig(_) => "INVALID_CONFIG",
            PdqError::Serde(_) => "SERDE_ERROR",
            PdqError::Io(_) => "IO_ERROR",
        }
    }

    /// Renders this error into the report form sent to UI clients.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code().to_string(),
            message: self.to_string(),
            trace: format!("{self:?}"),
        }
    }
}

impl Clone for PdqError {
    fn clone(&self) -> Self {
        match self {
            PdqError::UserCode(m) => PdqError::UserCode(m.clone()),
            PdqError::TypeMismatch(m) => PdqError::TypeMismatch(m.clone()),
            PdqError::ShapeMismatch(m) => PdqError::ShapeMismatch(m.clone()),
            PdqError::ObjectNotFound(m) => PdqError::ObjectNotFound(m.clone()),
            PdqError::SessionBusy(m) => PdqError::SessionBusy(m.clone()),
            PdqError::Transport(m) => PdqError::Transport(m.clone()),
            PdqError::Cancelled => PdqError::Cancelled,
            PdqError::Execution(m) => PdqError::Execution(m.clone()),
            PdqError::InvalidConfig(m) => PdqError::InvalidConfig(m.clone()),
            PdqError::Serde(m) => PdqError::Serde(m.clone()),
            PdqError::Io(e) => PdqError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// UI-facing error rendering: stable code, human message, debug trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReport {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Debug trace string for diagnostics.
    pub trace: String,
}

/// Standard PDQ result alias.
pub type Result<T> = std::result::Result<T, PdqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_carries_stable_code() {
        let err = PdqError::SessionBusy("session s1".to_string());
        let report = err.report();
        assert_eq!(report.code, "SESSION_BUSY");
        assert!(report.message.contains("session s1"));
        assert!(!report.trace.is_empty());
    }

    #[test]
    fn io_errors_clone_with_kind() {
        let err = PdqError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "peer gone",
        ));
        match err.clone() {
            PdqError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
            other => panic!("unexpected clone: {other:?}"),
        }
    }
}
