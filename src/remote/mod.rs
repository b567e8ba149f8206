//! Network side of sync: the HTTP meal server client and the reachability
//! monitor that feeds the engine's connectivity signal.

mod connectivity;
mod http;

pub use connectivity::spawn_monitor;
pub use http::{HttpRemote, HttpRemoteError};

use async_trait::async_trait;
use uuid::Uuid;

use mealsync_core::{MealPayload, RemoteError, RemoteWritePort};

/// Stand-in port when no server is configured. Never reached in practice,
/// since the connectivity signal stays `false` without a server.
pub struct Unconfigured;

#[async_trait]
impl RemoteWritePort for Unconfigured {
    async fn upsert_meal(&self, _id: Uuid, _payload: &MealPayload) -> Result<(), RemoteError> {
        Err(RemoteError::Unavailable("sync not configured".to_string()))
    }

    async fn delete_meal(&self, _id: Uuid) -> Result<(), RemoteError> {
        Err(RemoteError::Unavailable("sync not configured".to_string()))
    }
}
