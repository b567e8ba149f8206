//! Durable on-device queue of logged meals.
//!
//! Every meal lives in `queued_meals` with its sync bookkeeping. The queue
//! knows nothing about the network; it stores rows and enforces the legal
//! status transitions in the `WHERE` clause of each mutator:
//!
//! ```text
//! pending -> syncing -> synced
//!              |  ^
//!              v  |
//!             failed
//! ```
//!
//! A `synced` row is never changed again. It can only be removed, and editing
//! one replaces it with a new row under a fresh id.
//!
//! Remote deletions that are still owed for locally removed meals are kept in
//! `pending_deletions`.

mod error;

pub use error::QueueError;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{FailureKind, MealPayload, MealType, Nutrient, QueuedMeal, SyncStatus};

/// Handle to the local queue. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct MealQueue {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct MealRow {
    id: String,
    date: String,
    meal_type: String,
    description: Option<String>,
    image_ref: Option<String>,
    nutrients: String,
    logged_at: String,
    sync_status: String,
    last_error: Option<String>,
    failure_kind: Option<String>,
    attempt_count: i64,
    ever_synced: bool,
    queued_at: String,
    updated_at: String,
}

#[derive(sqlx::FromRow)]
struct DeletionRow {
    id: String,
    requested_at: String,
    attempt_count: i64,
    last_error: Option<String>,
    failure_kind: Option<String>,
}

/// A remote delete still owed for a meal that is gone locally.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDeletion {
    pub id: Uuid,
    pub requested_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// `Rejected` once the remote refused the delete. Such tombstones are kept
    /// but left out of automatic runs.
    pub failure_kind: Option<FailureKind>,
}

/// Result of removing a meal from the queue.
#[derive(Debug, Clone)]
pub struct Removal {
    pub meal: QueuedMeal,
    /// True when the remote may hold the meal and a delete was queued for it.
    pub remote_delete_queued: bool,
}

/// Outcome of replacing a row's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadUpdate {
    Updated,
    /// The row is held by a running pass.
    Busy,
    /// The row is synced and can only be replaced, see [`MealQueue::replace_synced`].
    Synced,
    NotFound,
}

/// Row counts per sync status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub syncing: u64,
    pub synced: u64,
    pub failed: u64,
    /// Subset of `failed` that the remote refused.
    pub rejected: u64,
    pub pending_deletions: u64,
    /// Subset of `pending_deletions` that the remote refused.
    pub rejected_deletions: u64,
}

impl StatusCounts {
    /// Rows that are not yet confirmed by the remote.
    pub fn unsynced(&self) -> u64 {
        self.pending + self.syncing + self.failed
    }
}

const DELETION_COLUMNS: &str = "id, requested_at, attempt_count, last_error, failure_kind";

const MEAL_COLUMNS: &str = "id, date, meal_type, description, image_ref, nutrients, logged_at, \
     sync_status, last_error, failure_kind, attempt_count, ever_synced, queued_at, updated_at";

fn format_ts(ts: &DateTime<Utc>) -> String {
    // Fixed width and `Z` suffix so that text ordering is time ordering.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(id: &str, field: &str, value: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueueError::corrupt(id, format!("bad {} '{}': {}", field, value, e)))
}

fn now() -> String {
    format_ts(&Utc::now())
}

impl MealQueue {
    /// Opens (creating if needed) the queue database at `path` and runs migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| QueueError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::debug!(path = %path.display(), "Opened meal queue");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the underlying pool, waiting for checked-out connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn insert(&self, meal: &QueuedMeal) -> Result<(), QueueError> {
        insert_meal(&self.pool, meal).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<QueuedMeal>, QueueError> {
        let row: Option<MealRow> = sqlx::query_as(&format!(
            "SELECT {} FROM queued_meals WHERE id = ?",
            MEAL_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(hydrate).transpose()
    }

    /// Meals dated within `from..=to`, by date then time eaten.
    pub async fn list_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<QueuedMeal>, QueueError> {
        let rows: Vec<MealRow> = sqlx::query_as(&format!(
            "SELECT {} FROM queued_meals WHERE date >= ? AND date <= ? ORDER BY date, logged_at",
            MEAL_COLUMNS
        ))
        .bind(from.to_string())
        .bind(to.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate).collect()
    }

    /// Rows a sync pass should attempt: pending, plus failures that are worth
    /// retrying. Oldest meal first.
    pub async fn list_syncable(&self) -> Result<Vec<QueuedMeal>, QueueError> {
        let rows: Vec<MealRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM queued_meals
            WHERE sync_status = 'pending'
               OR (sync_status = 'failed' AND COALESCE(failure_kind, 'transient') = 'transient')
            ORDER BY logged_at, queued_at
            "#,
            MEAL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate).collect()
    }

    pub async fn list_by_status(&self, status: SyncStatus) -> Result<Vec<QueuedMeal>, QueueError> {
        let rows: Vec<MealRow> = sqlx::query_as(&format!(
            "SELECT {} FROM queued_meals WHERE sync_status = ? ORDER BY logged_at, queued_at",
            MEAL_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate).collect()
    }

    /// Claims a row for a pass. Returns false if the row is gone or not in a
    /// claimable state.
    pub async fn mark_syncing(&self, id: Uuid) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE queued_meals SET sync_status = 'syncing', updated_at = ?
            WHERE id = ? AND sync_status IN ('pending', 'failed')
            "#,
        )
        .bind(now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_synced(&self, id: Uuid) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE queued_meals
            SET sync_status = 'synced', last_error = NULL, failure_kind = NULL,
                attempt_count = 0, ever_synced = 1, updated_at = ?
            WHERE id = ? AND sync_status = 'syncing'
            "#,
        )
        .bind(now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        kind: FailureKind,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE queued_meals
            SET sync_status = 'failed', last_error = ?, failure_kind = ?,
                attempt_count = attempt_count + 1, updated_at = ?
            WHERE id = ? AND sync_status = 'syncing'
            "#,
        )
        .bind(error)
        .bind(kind.as_str())
        .bind(now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Puts rows left in `syncing` by an interrupted process back to `pending`.
    pub async fn recover_interrupted(&self) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "UPDATE queued_meals SET sync_status = 'pending', updated_at = ? WHERE sync_status = 'syncing'",
        )
        .bind(now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Replaces the payload of a row that has not reached the remote yet
    /// (`pending` or `failed`). The row goes back to `pending` with its
    /// failure bookkeeping cleared.
    pub async fn update_payload(
        &self,
        id: Uuid,
        payload: &MealPayload,
    ) -> Result<PayloadUpdate, QueueError> {
        let nutrients = serde_json::to_string(&payload.nutrients)?;

        let result = sqlx::query(
            r#"
            UPDATE queued_meals
            SET date = ?, meal_type = ?, description = ?, image_ref = ?, nutrients = ?,
                logged_at = ?, sync_status = 'pending', last_error = NULL,
                failure_kind = NULL, attempt_count = 0, updated_at = ?
            WHERE id = ? AND sync_status IN ('pending', 'failed')
            "#,
        )
        .bind(payload.date.to_string())
        .bind(payload.meal_type.as_str())
        .bind(&payload.description)
        .bind(&payload.image_ref)
        .bind(nutrients)
        .bind(format_ts(&payload.logged_at))
        .bind(now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(PayloadUpdate::Updated);
        }
        match self.get(id).await?.map(|meal| meal.sync_status) {
            Some(SyncStatus::Synced) => Ok(PayloadUpdate::Synced),
            Some(_) => Ok(PayloadUpdate::Busy),
            None => Ok(PayloadUpdate::NotFound),
        }
    }

    /// Swaps a synced row for `replacement` in one transaction: the old row is
    /// removed, a remote delete is owed for its id and the replacement is
    /// queued. Returns false, changing nothing, if `id` is not a synced row.
    pub async fn replace_synced(
        &self,
        id: Uuid,
        replacement: &QueuedMeal,
    ) -> Result<bool, QueueError> {
        let id_str = id.to_string();
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM queued_meals WHERE id = ? AND sync_status = 'synced'")
            .bind(&id_str)
            .execute(&mut *tx)
            .await?;
        if removed.rows_affected() == 0 {
            return Ok(false);
        }

        insert_tombstone(&mut *tx, &id_str).await?;
        insert_meal(&mut *tx, replacement).await?;
        tx.commit().await?;

        Ok(true)
    }

    /// Moves a failed row (of either kind) back to `pending`.
    pub async fn requeue(&self, id: Uuid) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE queued_meals
            SET sync_status = 'pending', last_error = NULL, failure_kind = NULL, updated_at = ?
            WHERE id = ? AND sync_status = 'failed'
            "#,
        )
        .bind(now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Deletes a meal locally. If the remote may hold it (it reached `synced`
    /// at some point, or a pass is sending it right now) a remote delete is
    /// queued in the same transaction.
    pub async fn remove(&self, id: Uuid) -> Result<Option<Removal>, QueueError> {
        let id_str = id.to_string();
        let mut tx = self.pool.begin().await?;

        let row: Option<MealRow> = sqlx::query_as(&format!(
            "SELECT {} FROM queued_meals WHERE id = ?",
            MEAL_COLUMNS
        ))
        .bind(&id_str)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let meal = hydrate(row)?;

        sqlx::query("DELETE FROM queued_meals WHERE id = ?")
            .bind(&id_str)
            .execute(&mut *tx)
            .await?;

        let remote_delete_queued = meal.ever_synced || meal.sync_status == SyncStatus::Syncing;
        if remote_delete_queued {
            insert_tombstone(&mut *tx, &id_str).await?;
        }

        tx.commit().await?;

        Ok(Some(Removal {
            meal,
            remote_delete_queued,
        }))
    }

    /// Owed remote deletes that automatic runs should send. With
    /// `fresh_only`, only those never attempted. Refused ones are left out.
    pub async fn list_deletions(&self, fresh_only: bool) -> Result<Vec<PendingDeletion>, QueueError> {
        let filter = if fresh_only { " AND attempt_count = 0" } else { "" };
        let rows: Vec<DeletionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM pending_deletions \
             WHERE COALESCE(failure_kind, 'transient') = 'transient'{} ORDER BY requested_at",
            DELETION_COLUMNS, filter
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate_deletion).collect()
    }

    /// Every owed remote delete, refused ones included.
    pub async fn list_all_deletions(&self) -> Result<Vec<PendingDeletion>, QueueError> {
        let rows: Vec<DeletionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM pending_deletions ORDER BY requested_at",
            DELETION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate_deletion).collect()
    }

    pub async fn complete_deletion(&self, id: Uuid) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM pending_deletions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_deletion_failed(
        &self,
        id: Uuid,
        error: &str,
        kind: FailureKind,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE pending_deletions
            SET attempt_count = attempt_count + 1, last_error = ?, failure_kind = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(kind.as_str())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Makes refused remote deletes eligible again, as if never attempted.
    pub async fn requeue_deletions(&self) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE pending_deletions
            SET attempt_count = 0, last_error = NULL, failure_kind = NULL
            WHERE failure_kind = 'rejected'
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Work the backoff timer should come back for: transient failures of
    /// either meals or deletions.
    pub async fn count_retryable(&self) -> Result<u64, QueueError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM queued_meals
                 WHERE sync_status = 'failed'
                   AND COALESCE(failure_kind, 'transient') = 'transient')
              + (SELECT COUNT(*) FROM pending_deletions
                 WHERE COALESCE(failure_kind, 'transient') = 'transient')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    pub async fn status_counts(&self) -> Result<StatusCounts, QueueError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT sync_status, COUNT(*) FROM queued_meals GROUP BY sync_status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.parse::<SyncStatus>() {
                Ok(SyncStatus::Pending) => counts.pending = count,
                Ok(SyncStatus::Syncing) => counts.syncing = count,
                Ok(SyncStatus::Synced) => counts.synced = count,
                Ok(SyncStatus::Failed) => counts.failed = count,
                Err(e) => return Err(QueueError::corrupt("*", e)),
            }
        }

        let (rejected,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queued_meals WHERE sync_status = 'failed' AND failure_kind = 'rejected'",
        )
        .fetch_one(&self.pool)
        .await?;
        counts.rejected = rejected.max(0) as u64;

        let (deletions,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_deletions")
            .fetch_one(&self.pool)
            .await?;
        counts.pending_deletions = deletions.max(0) as u64;

        let (rejected_deletions,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pending_deletions WHERE failure_kind = 'rejected'",
        )
        .fetch_one(&self.pool)
        .await?;
        counts.rejected_deletions = rejected_deletions.max(0) as u64;

        Ok(counts)
    }
}

async fn insert_meal<'e, E>(executor: E, meal: &QueuedMeal) -> Result<(), QueueError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let p = &meal.payload;
    let nutrients = serde_json::to_string(&p.nutrients)?;

    sqlx::query(
        r#"
        INSERT INTO queued_meals (
            id, date, meal_type, description, image_ref, nutrients, logged_at,
            sync_status, last_error, failure_kind, attempt_count, ever_synced,
            queued_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(meal.id.to_string())
    .bind(p.date.to_string())
    .bind(p.meal_type.as_str())
    .bind(&p.description)
    .bind(&p.image_ref)
    .bind(nutrients)
    .bind(format_ts(&p.logged_at))
    .bind(meal.sync_status.as_str())
    .bind(&meal.last_error)
    .bind(meal.failure_kind.map(|k| k.as_str()))
    .bind(meal.attempt_count as i64)
    .bind(meal.ever_synced)
    .bind(format_ts(&meal.queued_at))
    .bind(format_ts(&meal.updated_at))
    .execute(executor)
    .await?;

    Ok(())
}

async fn insert_tombstone<'e, E>(executor: E, id: &str) -> Result<(), QueueError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO pending_deletions (id, requested_at, attempt_count, last_error, failure_kind)
        VALUES (?, ?, 0, NULL, NULL)
        "#,
    )
    .bind(id)
    .bind(now())
    .execute(executor)
    .await?;
    Ok(())
}

fn hydrate_deletion(row: DeletionRow) -> Result<PendingDeletion, QueueError> {
    let id = Uuid::parse_str(&row.id).map_err(|e| QueueError::corrupt(&row.id, e.to_string()))?;
    let failure_kind = row
        .failure_kind
        .as_deref()
        .map(str::parse::<FailureKind>)
        .transpose()
        .map_err(|e| QueueError::corrupt(&row.id, e))?;

    Ok(PendingDeletion {
        id,
        requested_at: parse_ts(&row.id, "requested_at", &row.requested_at)?,
        attempt_count: row.attempt_count.max(0) as u32,
        last_error: row.last_error,
        failure_kind,
    })
}

fn hydrate(row: MealRow) -> Result<QueuedMeal, QueueError> {
    let id = Uuid::parse_str(&row.id).map_err(|e| QueueError::corrupt(&row.id, e.to_string()))?;
    let date = NaiveDate::parse_from_str(&row.date, "%Y-%m-%d")
        .map_err(|e| QueueError::corrupt(&row.id, format!("bad date '{}': {}", row.date, e)))?;
    let meal_type: MealType = row
        .meal_type
        .parse()
        .map_err(|e: String| QueueError::corrupt(&row.id, e))?;
    let sync_status: SyncStatus = row
        .sync_status
        .parse()
        .map_err(|e: String| QueueError::corrupt(&row.id, e))?;
    let failure_kind = row
        .failure_kind
        .as_deref()
        .map(str::parse::<FailureKind>)
        .transpose()
        .map_err(|e| QueueError::corrupt(&row.id, e))?;
    let nutrients: Vec<Nutrient> = serde_json::from_str(&row.nutrients)
        .map_err(|e| QueueError::corrupt(&row.id, format!("bad nutrients: {}", e)))?;

    Ok(QueuedMeal {
        id,
        payload: MealPayload {
            date,
            meal_type,
            description: row.description,
            image_ref: row.image_ref,
            nutrients,
            logged_at: parse_ts(&row.id, "logged_at", &row.logged_at)?,
        },
        sync_status,
        last_error: row.last_error,
        failure_kind,
        attempt_count: row.attempt_count.max(0) as u32,
        ever_synced: row.ever_synced,
        queued_at: parse_ts(&row.id, "queued_at", &row.queued_at)?,
        updated_at: parse_ts(&row.id, "updated_at", &row.updated_at)?,
    })
}
