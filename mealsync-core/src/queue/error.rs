use std::path::PathBuf;

/// Failures of the local durable store.
///
/// These are the only errors that escape a sync pass: they mean a record may
/// not be durably queued (or its status not durably recorded).
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Failed to create queue directory '{}': {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to encode nutrients: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Corrupt queue row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl QueueError {
    pub(crate) fn corrupt(id: &str, reason: impl Into<String>) -> Self {
        QueueError::Corrupt {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}
