//! Transfer outcome reported by a sender.

use crate::splitter::SplitError;

#[derive(Debug)]
pub enum TransferStatus {
    /// Every chunk including the terminal one was handed to the splitter.
    Success,
    Failure(TransferError),
    Cancelled,
}

impl TransferStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn error(&self) -> Option<&TransferError> {
        match self {
            Self::Failure(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure(e) => write!(f, "failure: {e}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("reading source failed: {0}")]
    SourceRead(#[source] std::io::Error),

    #[error("chunk {chunk_index} could not be sent: {source}")]
    Split {
        chunk_index: u32,
        #[source]
        source: SplitError,
    },

    #[error("source exceeds the maximum chunk count")]
    TooManyChunks,

    #[error("transfer aborted: {0}")]
    Aborted(String),
}
