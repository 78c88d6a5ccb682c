use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Why a command was not applied without being rejected itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// An earlier command in the same call was rejected
    PriorRejection,
    /// Staged successfully, then discarded with the rest of the transaction
    RolledBack,
    ConnectionError(String),
    TransportTimeout,
    SessionClosed,
    Cancelled,
}

/// Per-command outcome of an apply call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Rejected { error: String },
    Skipped { reason: SkipReason },
}

/// ApplyResult pairs a native command with what happened to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub command: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl ApplyResult {
    pub fn applied(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            outcome: Outcome::Applied,
        }
    }

    pub fn rejected(command: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            outcome: Outcome::Rejected { error: error.into() },
        }
    }

    pub fn skipped(command: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            command: command.into(),
            outcome: Outcome::Skipped { reason },
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self.outcome, Outcome::Applied)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.outcome, Outcome::Rejected { .. })
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match &self.outcome {
            Outcome::Skipped { reason } => Some(reason),
            _ => None,
        }
    }

    /// The device rejection carried by this result, as a core error
    pub fn rejection(&self) -> Option<CoreError> {
        match &self.outcome {
            Outcome::Rejected { error } => Some(CoreError::CommandRejected {
                command: self.command.clone(),
                detail: error.clone(),
            }),
            _ => None,
        }
    }
}

/// Mark every command in a batch as skipped for the same reason
pub fn skipped_all(commands: &[String], reason: SkipReason) -> Vec<ApplyResult> {
    commands
        .iter()
        .map(|c| ApplyResult::skipped(c.clone(), reason.clone()))
        .collect()
}

/// True when every result in a batch was committed
pub fn all_applied(results: &[ApplyResult]) -> bool {
    results.iter().all(ApplyResult::is_applied)
}

/// How an apply call treats commands after the first rejection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    /// Stop staging at the first rejection; later commands are skipped
    #[default]
    Atomic,
    /// Keep staging after a rejection so every rejection is reported.
    /// The transaction is still discarded.
    BestEffort,
}
