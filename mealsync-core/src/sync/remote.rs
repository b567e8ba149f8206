//! The port through which the engine reaches the remote meal store.

use async_trait::async_trait;
use uuid::Uuid;

use super::error::RemoteError;
use crate::models::MealPayload;

/// Remote persistence for meals, keyed by the client-generated id.
///
/// Implementations must treat `upsert_meal` as an idempotent upsert: sending
/// the same id twice leaves one remote record. The engine relies on this to
/// resend after a crash without duplicating.
#[async_trait]
pub trait RemoteWritePort: Send + Sync {
    async fn upsert_meal(&self, id: Uuid, payload: &MealPayload) -> Result<(), RemoteError>;

    /// Best-effort removal. Deleting an id the remote does not know is success.
    async fn delete_meal(&self, id: Uuid) -> Result<(), RemoteError>;
}
