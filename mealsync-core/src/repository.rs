//! Read/write entry point for presentation code.
//!
//! Writes land in the local queue and return immediately; the engine is nudged
//! afterwards and does the network work on its own schedule. Reads never touch
//! the network.

use chrono::{Local, NaiveDate};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{DaySummary, MealPayload, QueuedMeal, SyncStatus};
use crate::queue::{MealQueue, PayloadUpdate, QueueError, Removal, StatusCounts};
use crate::sync::{SyncEngine, TriggerOutcome};

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Meal not found: {0}")]
    NotFound(Uuid),

    #[error("Meal {0} is being synced right now, try again shortly")]
    Busy(Uuid),
}

#[derive(Clone)]
pub struct MealRepository {
    queue: MealQueue,
    engine: SyncEngine,
}

impl MealRepository {
    pub fn new(queue: MealQueue, engine: SyncEngine) -> Self {
        Self { queue, engine }
    }

    pub fn queue(&self) -> &MealQueue {
        &self.queue
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Queues a new meal as `pending` and asks the engine to try it.
    ///
    /// Succeeds offline; only a local storage failure is an error.
    pub async fn save(&self, payload: MealPayload) -> Result<QueuedMeal, RepositoryError> {
        let meal = QueuedMeal::new(payload);
        self.queue.insert(&meal).await?;
        info!(id = %meal.id, date = %meal.payload.date, meal_type = %meal.payload.meal_type, "Meal queued");

        self.nudge();
        Ok(meal)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<QueuedMeal>, RepositoryError> {
        Ok(self.queue.get(id).await?)
    }

    /// Meals logged for today's local date.
    pub async fn list_today(&self) -> Result<Vec<QueuedMeal>, RepositoryError> {
        let today = Local::now().date_naive();
        self.list_range(today, today).await
    }

    /// Meals with `start <= date <= end`, ordered by date then time logged.
    pub async fn list_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<QueuedMeal>, RepositoryError> {
        Ok(self.queue.list_range(start, end).await?)
    }

    /// Replaces a meal's content.
    ///
    /// A meal the remote has not accepted yet is edited in place and goes
    /// back to `pending` under the same id. A synced meal stays untouched:
    /// it is deleted (remote delete queued) and the new content is logged as
    /// a new meal, whose id is the one returned.
    pub async fn update(&self, id: Uuid, payload: MealPayload) -> Result<QueuedMeal, RepositoryError> {
        match self.queue.update_payload(id, &payload).await? {
            PayloadUpdate::Updated => {
                info!(%id, "Meal updated");
                self.nudge();
                self.queue.get(id).await?.ok_or(RepositoryError::NotFound(id))
            }
            PayloadUpdate::Synced => {
                let replacement = QueuedMeal::new(payload);
                if !self.queue.replace_synced(id, &replacement).await? {
                    // Synced rows only ever go away.
                    return Err(RepositoryError::NotFound(id));
                }
                info!(%id, replacement = %replacement.id, "Synced meal replaced");
                self.nudge();
                Ok(replacement)
            }
            PayloadUpdate::Busy => Err(RepositoryError::Busy(id)),
            PayloadUpdate::NotFound => Err(RepositoryError::NotFound(id)),
        }
    }

    /// Puts a failed meal back in line, rejected ones included. Meals that
    /// are not failed are returned unchanged, unless a pass holds them.
    pub async fn retry(&self, id: Uuid) -> Result<QueuedMeal, RepositoryError> {
        let requeued = self.queue.requeue(id).await?;
        let meal = self
            .queue
            .get(id)
            .await?
            .ok_or(RepositoryError::NotFound(id))?;

        if requeued {
            info!(%id, attempts = meal.attempt_count, "Meal requeued");
            self.nudge();
        } else if meal.sync_status == SyncStatus::Syncing {
            return Err(RepositoryError::Busy(id));
        }
        Ok(meal)
    }

    /// Deletes a meal locally. When the remote may hold a copy, a remote
    /// delete is queued and sent in the background.
    pub async fn delete(&self, id: Uuid) -> Result<Removal, RepositoryError> {
        let removal = self
            .queue
            .remove(id)
            .await?
            .ok_or(RepositoryError::NotFound(id))?;

        info!(%id, remote_delete = removal.remote_delete_queued, "Meal deleted");
        if removal.remote_delete_queued {
            self.nudge();
        }
        Ok(removal)
    }

    /// Gives remote deletes the server refused another chance, for instance
    /// after fixing the API key. Returns how many were requeued.
    pub async fn retry_deletions(&self) -> Result<u64, RepositoryError> {
        let requeued = self.queue.requeue_deletions().await?;
        if requeued > 0 {
            info!(requeued, "Refused remote deletes requeued");
            self.nudge();
        }
        Ok(requeued)
    }

    /// Manual refresh: fresh retry window, then a pass if online.
    pub fn refresh(&self) -> TriggerOutcome {
        self.engine.refresh()
    }

    pub async fn day_summary(&self, date: NaiveDate) -> Result<DaySummary, RepositoryError> {
        let meals = self.queue.list_range(date, date).await?;
        Ok(DaySummary::from_meals(date, meals))
    }

    pub async fn status_counts(&self) -> Result<StatusCounts, RepositoryError> {
        Ok(self.queue.status_counts().await?)
    }

    fn nudge(&self) {
        let outcome = self.engine.notify_enqueued();
        debug!(?outcome, "Engine nudged");
    }
}
