//! Remote write errors.

/// Failure reported by a [`RemoteWritePort`](super::RemoteWritePort).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Network unreachable, timed out, or the remote is temporarily down.
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    /// The remote refused the request as invalid. Resending it unchanged
    /// will not help.
    #[error("Rejected by remote ({status}): {reason}")]
    Rejected { status: u16, reason: String },
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}
