use alloy::primitives::B256;
use common::engine::types::PayloadStatusKind;
use std::fmt;

#[derive(Debug)]
pub enum ConsensusError {
    /// Fork choice was accepted but the client started no build job.
    BuildRejected,
    /// The client refused a payload it was asked to validate.
    ValidationRejected {
        status: PayloadStatusKind,
        validation_error: Option<String>,
    },
    SubmissionFailure(String),
    /// A transaction the setup depends on never got a receipt.
    ConfirmationTimeout { tx_hash: B256, attempts: u32 },
    Cancelled,
    Engine(anyhow::Error),
}

impl ConsensusError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildRejected => {
                write!(f, "fork choice accepted but no payload id was returned")
            }
            Self::ValidationRejected {
                status,
                validation_error,
            } => match validation_error {
                Some(msg) => write!(f, "payload rejected with status {status}: {msg}"),
                None => write!(f, "payload rejected with status {status}"),
            },
            Self::SubmissionFailure(msg) => write!(f, "transaction submission failed: {msg}"),
            Self::ConfirmationTimeout { tx_hash, attempts } => write!(
                f,
                "transaction {tx_hash} not confirmed after {attempts} attempts"
            ),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Engine(e) => write!(f, "engine call failed: {e}"),
        }
    }
}

impl std::error::Error for ConsensusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Engine(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}
