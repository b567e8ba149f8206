//! Mealsync Core Library
//!
//! Meal models, the durable local queue and the offline-first sync engine
//! shared by mealsync front ends.

pub mod models;
pub mod queue;
pub mod repository;
pub mod sync;

#[cfg(test)]
mod testing;

pub use models::{
    sum_nutrients, DaySummary, FailureKind, MealPayload, MealType, Nutrient, QueuedMeal,
    SyncStatus,
};
pub use queue::{MealQueue, PendingDeletion, QueueError, Removal, StatusCounts};
pub use repository::{MealRepository, RepositoryError};
pub use sync::{
    PassReport, RemoteError, RemoteWritePort, RetryPolicy, SyncEngine, SyncEvent, Trigger,
    TriggerOutcome,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
