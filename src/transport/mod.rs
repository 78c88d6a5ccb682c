//! Device transport seam used by the session manager.
//!
//! A transport owns one live management connection to one instance and
//! drives a single configuration transaction on it: stage commands, then
//! commit or discard.

#[cfg(test)]
pub mod mock;
pub mod ssh;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Instance;

pub use ssh::SshTransportFactory;

/// Transport-level failures, before they are mapped onto apply results
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Could not reach or authenticate against the device
    #[error("connection failed: {0}")]
    Connection(String),

    /// The device refused a command or the commit
    #[error("rejected: {0}")]
    Rejected(String),

    /// The connection broke mid-transaction
    #[error("i/o error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::Connection(d) | Self::Rejected(d) | Self::Io(d) => d,
        }
    }
}

/// One live configuration session on a device
#[async_trait]
pub trait Transport: Send {
    /// Stage one command in the pending transaction
    async fn stage(&mut self, command: &str) -> Result<(), TransportError>;

    async fn commit(&mut self) -> Result<(), TransportError>;

    /// Drop everything staged since the last commit
    async fn discard(&mut self) -> Result<(), TransportError>;

    /// Running software version as the device reports it (e.g. "1.4.0")
    async fn detect_version(&mut self) -> Result<String, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports for registered instances
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, instance: &Instance) -> Result<Box<dyn Transport>, TransportError>;
}

/// Reduce a reported release string to the `major.minor` registry key.
///
/// "1.4.0" → "1.4", "1.5-rolling-202405010019" → "1.5", "1.3.8" → "1.3".
/// Returns None when no numeric major.minor prefix is present.
pub fn normalize_version(raw: &str) -> Option<String> {
    let re = regex_lite::Regex::new(r"^v?(\d+)\.(\d+)").ok()?;
    let caps = re.captures(raw.trim())?;
    Some(format!("{}.{}", &caps[1], &caps[2]))
}
