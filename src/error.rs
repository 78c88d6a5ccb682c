use thiserror::Error;

/// Result type alias for control plane operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the mapper registry, instance registry and session manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("no mapper registered for feature area '{0}'")]
    UnsupportedFeatureArea(String),

    #[error("version '{version}' is not supported for feature area '{area}'")]
    UnsupportedVersion { area: String, version: String },

    #[error("instance '{0}' is not registered")]
    UnknownInstance(String),

    #[error("instance '{0}' is already registered")]
    DuplicateInstance(String),

    #[error("connection to instance '{instance}' failed: {detail}")]
    ConnectionError { instance: String, detail: String },

    #[error("{operation} on instance '{instance}' timed out")]
    TransportTimeout { instance: String, operation: &'static str },

    #[error("instance '{0}' has an apply in flight")]
    Busy(String),

    #[error("device rejected '{command}': {detail}")]
    CommandRejected { command: String, detail: String },

    #[error("session for instance '{0}' was closed")]
    SessionClosed(String),

    #[error("invalid intent: {0}")]
    InvalidIntent(String),
}

impl CoreError {
    pub fn unsupported_version(area: impl ToString, version: impl Into<String>) -> Self {
        Self::UnsupportedVersion {
            area: area.to_string(),
            version: version.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidIntent(msg.into())
    }
}
