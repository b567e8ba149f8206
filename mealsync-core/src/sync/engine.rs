//! The offline-first sync engine.
//!
//! One engine instance per process. A run is started by a [`Trigger`] when
//! the engine is idle and connectivity is up; triggers arriving while a run is
//! in progress are coalesced, since the run re-scans for freshly pending rows
//! before it goes idle.
//!
//! ## Run
//!
//! 1. Send owed remote deletions.
//! 2. Upsert every pending or transiently failed meal, oldest first, one at a
//!    time. A failure is recorded on the row and the run moves on.
//! 3. Repeat for rows that became pending meanwhile.
//! 4. If retryable work is left, schedule a re-trigger with exponential
//!    backoff; once the ceiling is hit, stop until connectivity comes back or
//!    a manual refresh.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::RemoteError;
use super::events::{PassReport, SyncEvent, Trigger, TriggerOutcome};
use super::remote::RemoteWritePort;
use super::retry::{Backoff, RetryPolicy};
use crate::models::{FailureKind, QueuedMeal, SyncStatus};
use crate::queue::{MealQueue, PendingDeletion, QueueError};

const EVENT_CAPACITY: usize = 64;

/// Handle to the sync engine. Clones share the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    queue: MealQueue,
    remote: Arc<dyn RemoteWritePort>,
    connectivity: watch::Receiver<bool>,
    events: broadcast::Sender<SyncEvent>,
    running: watch::Sender<bool>,
    /// Set by every trigger that gets past the offline check; cleared at the
    /// top of each pass.
    rescan: AtomicBool,
    backoff: Mutex<Backoff>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

/// Holds the engine's running flag; clears it on drop, even if a run fails.
struct RunGuard {
    inner: Arc<Inner>,
}

impl RunGuard {
    fn acquire(inner: &Arc<Inner>) -> Option<Self> {
        let acquired = inner.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        });
        acquired.then(|| RunGuard {
            inner: Arc::clone(inner),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.running.send_replace(false);
    }
}

impl SyncEngine {
    pub fn new(
        queue: MealQueue,
        remote: Arc<dyn RemoteWritePort>,
        connectivity: watch::Receiver<bool>,
        policy: RetryPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (running, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                queue,
                remote,
                connectivity,
                events,
                running,
                rescan: AtomicBool::new(false),
                backoff: Mutex::new(Backoff::new(policy)),
                retry_task: Mutex::new(None),
                listener_task: Mutex::new(None),
            }),
        }
    }

    /// Recovers rows left `syncing` by an interrupted process, starts
    /// listening for connectivity changes and kicks off a first run.
    ///
    /// Returns the number of recovered rows.
    pub async fn start(&self) -> Result<u64, QueueError> {
        let recovered = self.recover().await?;

        let mut connectivity = self.inner.connectivity.clone();
        let mut was_online = *connectivity.borrow_and_update();
        let inner = Arc::clone(&self.inner);
        let listener = tokio::spawn(async move {
            while connectivity.changed().await.is_ok() {
                let online = *connectivity.borrow_and_update();
                if online && !was_online {
                    info!("Connectivity regained");
                    inner.trigger(Trigger::ConnectivityRegained);
                } else if !online && was_online {
                    info!("Connectivity lost");
                }
                was_online = online;
            }
            debug!("Connectivity signal closed");
        });
        if let Some(previous) = lock(&self.inner.listener_task).replace(listener) {
            previous.abort();
        }

        self.inner.trigger(Trigger::Startup);
        Ok(recovered)
    }

    /// Puts rows left `syncing` by a previous process back to `pending`.
    ///
    /// Only call this while no run is in progress.
    pub async fn recover(&self) -> Result<u64, QueueError> {
        let recovered = self.inner.queue.recover_interrupted().await?;
        if recovered > 0 {
            warn!(recovered, "Re-queued meals interrupted mid-sync");
        }
        Ok(recovered)
    }

    /// Subscribes to engine notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Manual refresh: opens a fresh retry window and runs if possible.
    pub fn refresh(&self) -> TriggerOutcome {
        self.inner.trigger(Trigger::ManualRefresh)
    }

    /// Best-effort "try now" after a local write.
    pub fn notify_enqueued(&self) -> TriggerOutcome {
        self.inner.trigger(Trigger::NewRecord)
    }

    pub fn trigger(&self, trigger: Trigger) -> TriggerOutcome {
        self.inner.trigger(trigger)
    }

    /// Runs a manual refresh on the caller's task and returns its report.
    ///
    /// `None` when offline or when another run holds the engine.
    pub async fn sync_now(&self) -> Result<Option<PassReport>, QueueError> {
        if !self.is_online() {
            return Ok(None);
        }
        let Some(guard) = RunGuard::acquire(&self.inner) else {
            return Ok(None);
        };
        Inner::run(&self.inner, Trigger::ManualRefresh, guard)
            .await
            .map(Some)
    }

    pub fn is_online(&self) -> bool {
        self.inner.is_online()
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.borrow()
    }

    /// Waits until no run is in progress.
    pub async fn wait_idle(&self) {
        let mut running = self.inner.running.subscribe();
        // The sender lives in `inner`, so this cannot observe a closed channel.
        let _ = running.wait_for(|running| !*running).await;
    }

    /// Automatic retries scheduled since the last reset.
    pub fn retries_scheduled(&self) -> u32 {
        lock(&self.inner.backoff).scheduled()
    }

    pub fn has_pending_retry(&self) -> bool {
        lock(&self.inner.retry_task)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stops background tasks. A run in progress finishes on its own.
    pub fn shutdown(&self) {
        if let Some(task) = lock(&self.inner.listener_task).take() {
            task.abort();
        }
        self.inner.cancel_retry();
    }
}

impl Inner {
    fn is_online(&self) -> bool {
        *self.connectivity.borrow()
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn trigger(self: &Arc<Self>, trigger: Trigger) -> TriggerOutcome {
        if !self.is_online() {
            debug!(?trigger, "Offline, not syncing");
            return TriggerOutcome::Offline;
        }
        // Raised before claiming, so a run that is wrapping up sees it.
        self.rescan.store(true, Ordering::SeqCst);
        let Some(guard) = RunGuard::acquire(self) else {
            debug!(?trigger, "Sync already running, coalesced");
            return TriggerOutcome::Coalesced;
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            // Failures are logged and published inside `run`.
            let _ = Inner::run(&inner, trigger, guard).await;
        });
        TriggerOutcome::Started
    }

    async fn run(
        self: &Arc<Self>,
        trigger: Trigger,
        guard: RunGuard,
    ) -> Result<PassReport, QueueError> {
        self.cancel_retry();
        if trigger.resets_backoff() {
            lock(&self.backoff).reset();
        }

        info!(?trigger, "Sync started");
        self.emit(SyncEvent::PassStarted { trigger });

        let result = match self.run_passes().await {
            Ok(report) => self.schedule_follow_up(&report).await.map(|()| report),
            Err(e) => Err(e),
        };

        match &result {
            Ok(report) => {
                info!(
                    passes = report.passes,
                    attempted = report.attempted,
                    synced = report.synced,
                    failed = report.failed,
                    rejected = report.rejected,
                    "Sync finished"
                );
                self.emit(SyncEvent::PassFinished(report.clone()));
            }
            Err(e) => {
                error!(error = %e, "Sync aborted, local queue failed");
                // Still holding the run, so any `syncing` row is one we claimed.
                match self.queue.recover_interrupted().await {
                    Ok(0) => {}
                    Ok(released) => warn!(released, "Released meals claimed by the aborted run"),
                    Err(release_err) => {
                        error!(error = %release_err, "Could not release claimed meals")
                    }
                }
                self.emit(SyncEvent::PassAborted {
                    error: e.to_string(),
                });
            }
        }

        drop(guard);
        // A trigger may have landed after the last scan but before the flag
        // cleared.
        if result.is_ok() && self.rescan.swap(false, Ordering::SeqCst) {
            debug!("Work arrived while finishing, running again");
            self.trigger(Trigger::NewRecord);
        }
        result
    }

    async fn run_passes(&self) -> Result<PassReport, QueueError> {
        let mut report = PassReport::default();
        let mut first = true;

        loop {
            self.rescan.store(false, Ordering::SeqCst);
            // The first pass takes everything due; later passes only pick up
            // work that arrived while we were busy.
            let deletions = self.queue.list_deletions(!first).await?;
            let meals = if first {
                self.queue.list_syncable().await?
            } else {
                self.queue.list_by_status(SyncStatus::Pending).await?
            };
            if deletions.is_empty() && meals.is_empty() {
                break;
            }

            report.passes += 1;
            debug!(
                pass = report.passes,
                meals = meals.len(),
                deletions = deletions.len(),
                "Sync pass"
            );

            for deletion in deletions {
                self.send_deletion(&deletion, &mut report).await?;
            }
            for meal in meals {
                self.sync_meal(&meal, &mut report).await?;
            }
            first = false;
        }

        Ok(report)
    }

    async fn sync_meal(&self, meal: &QueuedMeal, report: &mut PassReport) -> Result<(), QueueError> {
        if !self.queue.mark_syncing(meal.id).await? {
            debug!(id = %meal.id, "Meal changed since listing, skipped");
            return Ok(());
        }
        // Re-read under the claim so an edit made after listing is what we send.
        let Some(meal) = self.queue.get(meal.id).await? else {
            return Ok(());
        };

        report.attempted += 1;
        debug!(id = %meal.id, previous_attempts = meal.attempt_count, "Upserting meal");

        match self.remote.upsert_meal(meal.id, &meal.payload).await {
            Ok(()) => {
                if self.queue.mark_synced(meal.id).await? {
                    report.synced += 1;
                    self.emit(SyncEvent::RecordSynced { id: meal.id });
                } else {
                    debug!(id = %meal.id, "Meal removed while syncing");
                }
            }
            Err(err) => {
                let retryable = err.is_retryable();
                let kind = if retryable {
                    FailureKind::Transient
                } else {
                    FailureKind::Rejected
                };
                let message = err.to_string();
                self.queue.mark_failed(meal.id, &message, kind).await?;

                if retryable {
                    report.failed += 1;
                    warn!(id = %meal.id, error = %message, "Meal sync failed");
                } else {
                    report.rejected += 1;
                    warn!(id = %meal.id, error = %message, "Meal rejected by remote");
                }
                self.emit(SyncEvent::RecordFailed {
                    id: meal.id,
                    error: message,
                    retryable,
                });
            }
        }

        Ok(())
    }

    async fn send_deletion(
        &self,
        deletion: &PendingDeletion,
        report: &mut PassReport,
    ) -> Result<(), QueueError> {
        match self.remote.delete_meal(deletion.id).await {
            Ok(()) => {
                self.queue.complete_deletion(deletion.id).await?;
                report.deletions_sent += 1;
                debug!(id = %deletion.id, "Remote delete done");
            }
            Err(RemoteError::Rejected { status: 404 | 410, .. }) => {
                self.queue.complete_deletion(deletion.id).await?;
                report.deletions_sent += 1;
                debug!(id = %deletion.id, "Meal already gone on remote");
            }
            Err(err @ RemoteError::Rejected { .. }) => {
                self.queue
                    .mark_deletion_failed(deletion.id, &err.to_string(), FailureKind::Rejected)
                    .await?;
                report.deletions_rejected += 1;
                warn!(id = %deletion.id, error = %err, "Remote delete refused, kept until requeued");
            }
            Err(err) => {
                self.queue
                    .mark_deletion_failed(deletion.id, &err.to_string(), FailureKind::Transient)
                    .await?;
                report.deletions_failed += 1;
                warn!(id = %deletion.id, error = %err, "Remote delete failed");
            }
        }
        Ok(())
    }

    async fn schedule_follow_up(self: &Arc<Self>, report: &PassReport) -> Result<(), QueueError> {
        let remaining = self.queue.count_retryable().await?;

        let next = {
            let mut backoff = lock(&self.backoff);
            if report.is_clean() || remaining == 0 {
                backoff.reset();
            }
            if remaining == 0 {
                return Ok(());
            }
            if backoff.is_exhausted() {
                None
            } else {
                backoff.next_delay()
            }
        };

        match next {
            Some((attempt, delay)) => {
                info!(attempt, delay_ms = delay.as_millis() as u64, remaining, "Retry scheduled");
                let inner = Arc::clone(self);
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // The run that scheduled us may still be wrapping up.
                    loop {
                        let mut running = inner.running.subscribe();
                        let _ = running.wait_for(|running| !*running).await;
                        if inner.trigger(Trigger::ScheduledRetry) != TriggerOutcome::Coalesced {
                            break;
                        }
                    }
                });
                if let Some(previous) = lock(&self.retry_task).replace(task) {
                    previous.abort();
                }
                self.emit(SyncEvent::RetryScheduled { attempt, delay });
            }
            None => {
                warn!(remaining, "Retry limit reached, waiting for refresh or reconnect");
                self.emit(SyncEvent::RetriesExhausted { remaining });
            }
        }

        Ok(())
    }

    fn cancel_retry(&self) {
        if let Some(task) = lock(&self.retry_task).take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MealPayload, MealType, Nutrient};
    use crate::testing::{next_event, FakeRemote};
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::time::Duration;
    use tempfile::TempDir;

    struct TestContext {
        engine: SyncEngine,
        queue: MealQueue,
        remote: Arc<FakeRemote>,
        online: watch::Sender<bool>,
        _temp_dir: TempDir,
    }

    async fn setup(online: bool) -> TestContext {
        setup_with(online, FakeRemote::new(), Duration::from_millis(5)).await
    }

    async fn setup_with(online: bool, remote: FakeRemote, base_delay: Duration) -> TestContext {
        let temp_dir = TempDir::new().unwrap();
        let queue = MealQueue::open(temp_dir.path().join("queue.db"))
            .await
            .unwrap();
        let remote = Arc::new(remote);
        let (online_tx, online_rx) = watch::channel(online);
        let engine = SyncEngine::new(
            queue.clone(),
            remote.clone(),
            online_rx,
            RetryPolicy::new(base_delay, 5),
        );
        TestContext {
            engine,
            queue,
            remote,
            online: online_tx,
            _temp_dir: temp_dir,
        }
    }

    async fn enqueue(queue: &MealQueue, hour: u32, description: &str) -> QueuedMeal {
        let meal = QueuedMeal::new(
            MealPayload::new(NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(), MealType::Lunch)
                .with_description(description)
                .with_nutrients(vec![Nutrient::new("calories", 400.0, "kcal")])
                .logged_at(Utc.with_ymd_and_hms(2025, 2, 1, hour, 0, 0).unwrap()),
        );
        queue.insert(&meal).await.unwrap();
        meal
    }

    async fn status_of(queue: &MealQueue, meal: &QueuedMeal) -> QueuedMeal {
        queue.get(meal.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_offline_meal_syncs_when_connectivity_returns() {
        let ctx = setup(false).await;
        let meal = enqueue(&ctx.queue, 12, "A").await;
        let mut events = ctx.engine.subscribe();

        ctx.engine.start().await.unwrap();
        assert_eq!(ctx.engine.refresh(), TriggerOutcome::Offline);
        assert_eq!(
            status_of(&ctx.queue, &meal).await.sync_status,
            SyncStatus::Pending
        );

        ctx.online.send(true).unwrap();
        let started = next_event(&mut events, |e| matches!(e, SyncEvent::PassStarted { .. })).await;
        assert_eq!(
            started,
            SyncEvent::PassStarted {
                trigger: Trigger::ConnectivityRegained
            }
        );
        next_event(&mut events, |e| matches!(e, SyncEvent::PassFinished(_))).await;

        assert_eq!(
            status_of(&ctx.queue, &meal).await.sync_status,
            SyncStatus::Synced
        );
        assert_eq!(ctx.remote.record(meal.id), Some(meal.payload.clone()));
    }

    #[tokio::test]
    async fn test_transient_failures_then_success_resets_counters() {
        let ctx = setup(true).await;
        let meal = enqueue(&ctx.queue, 12, "B").await;
        ctx.remote
            .fail_upserts(meal.id, 3, RemoteError::Unavailable("503".into()));
        let mut events = ctx.engine.subscribe();

        assert_eq!(ctx.engine.refresh(), TriggerOutcome::Started);
        next_event(&mut events, |e| matches!(e, SyncEvent::RecordSynced { .. })).await;
        ctx.engine.wait_idle().await;

        let synced = status_of(&ctx.queue, &meal).await;
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        assert_eq!(synced.attempt_count, 0);
        assert!(synced.last_error.is_none());
        assert_eq!(ctx.remote.upsert_calls_for(meal.id), 4);
        assert_eq!(ctx.engine.retries_scheduled(), 0);
        assert!(!ctx.engine.has_pending_retry());
    }

    #[tokio::test]
    async fn test_retry_ceiling_then_manual_refresh() {
        let ctx = setup(true).await;
        let meal = enqueue(&ctx.queue, 12, "C").await;
        ctx.remote
            .fail_upserts(meal.id, 6, RemoteError::Unavailable("timeout".into()));
        let mut events = ctx.engine.subscribe();

        ctx.engine.refresh();
        let exhausted =
            next_event(&mut events, |e| matches!(e, SyncEvent::RetriesExhausted { .. })).await;
        assert_eq!(exhausted, SyncEvent::RetriesExhausted { remaining: 1 });
        ctx.engine.wait_idle().await;

        let failed = status_of(&ctx.queue, &meal).await;
        assert_eq!(failed.sync_status, SyncStatus::Failed);
        assert_eq!(failed.attempt_count, 6);
        assert_eq!(ctx.engine.retries_scheduled(), 5);
        assert!(!ctx.engine.has_pending_retry());

        // Nothing else fires on its own
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.remote.upsert_calls_for(meal.id), 6);

        assert_eq!(ctx.engine.refresh(), TriggerOutcome::Started);
        next_event(&mut events, |e| matches!(e, SyncEvent::RecordSynced { .. })).await;
        ctx.engine.wait_idle().await;

        assert_eq!(
            status_of(&ctx.queue, &meal).await.sync_status,
            SyncStatus::Synced
        );
        assert_eq!(ctx.engine.retries_scheduled(), 0);
    }

    #[tokio::test]
    async fn test_retry_delays_increase() {
        let ctx = setup(true).await;
        let meal = enqueue(&ctx.queue, 12, "slow").await;
        ctx.remote
            .fail_upserts(meal.id, 6, RemoteError::Unavailable("down".into()));
        let mut events = ctx.engine.subscribe();

        ctx.engine.refresh();
        let mut delays = Vec::new();
        loop {
            match next_event(&mut events, |e| {
                matches!(
                    e,
                    SyncEvent::RetryScheduled { .. } | SyncEvent::RetriesExhausted { .. }
                )
            })
            .await
            {
                SyncEvent::RetryScheduled { attempt, delay } => {
                    assert_eq!(attempt as usize, delays.len() + 1);
                    delays.push(delay);
                }
                _ => break,
            }
        }

        assert_eq!(delays.len(), 5);
        assert!(delays.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(delays[0], Duration::from_millis(5));
        assert_eq!(delays[4], Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        // Long backoff so the retry cannot race the assertions
        let ctx = setup_with(true, FakeRemote::new(), Duration::from_secs(60)).await;
        let d = enqueue(&ctx.queue, 9, "D").await;
        let e = enqueue(&ctx.queue, 10, "E").await;
        ctx.remote
            .fail_upserts(d.id, 1, RemoteError::Unavailable("reset by peer".into()));
        let mut events = ctx.engine.subscribe();

        ctx.engine.refresh();
        let finished = next_event(&mut events, |e| matches!(e, SyncEvent::PassFinished(_))).await;

        let SyncEvent::PassFinished(report) = finished else {
            unreachable!()
        };
        assert_eq!(report.attempted, 2);
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(status_of(&ctx.queue, &d).await.sync_status, SyncStatus::Failed);
        assert_eq!(status_of(&ctx.queue, &e).await.sync_status, SyncStatus::Synced);
        // Oldest meal goes first
        assert_eq!(ctx.remote.upsert_order(), vec![d.id, e.id]);
        assert!(ctx.engine.has_pending_retry());
        ctx.engine.shutdown();
        assert!(!ctx.engine.has_pending_retry());
    }

    #[tokio::test]
    async fn test_interrupted_sync_is_recovered_on_start() {
        let ctx = setup(true).await;
        let meal = enqueue(&ctx.queue, 12, "F").await;
        ctx.queue.mark_syncing(meal.id).await.unwrap();
        // The crashed process got its upsert through before dying
        ctx.remote.upsert_meal(meal.id, &meal.payload).await.unwrap();
        let mut events = ctx.engine.subscribe();

        assert_eq!(ctx.engine.start().await.unwrap(), 1);
        next_event(&mut events, |e| matches!(e, SyncEvent::PassFinished(_))).await;

        assert_eq!(
            status_of(&ctx.queue, &meal).await.sync_status,
            SyncStatus::Synced
        );
        assert_eq!(ctx.remote.upsert_calls_for(meal.id), 2);
        assert_eq!(ctx.remote.record_count(), 1);
        assert_eq!(ctx.remote.record(meal.id), Some(meal.payload.clone()));
        ctx.engine.shutdown();
    }

    #[tokio::test]
    async fn test_manual_refresh_during_run_is_coalesced() {
        let remote = FakeRemote::gated();
        let ctx = setup_with(true, remote, Duration::from_millis(5)).await;
        let meal = enqueue(&ctx.queue, 12, "G").await;

        assert_eq!(ctx.engine.refresh(), TriggerOutcome::Started);
        ctx.remote.wait_entered().await;
        assert!(ctx.engine.is_running());

        assert_eq!(ctx.engine.refresh(), TriggerOutcome::Coalesced);
        assert_eq!(ctx.engine.sync_now().await.unwrap(), None);

        ctx.remote.release(1);
        ctx.engine.wait_idle().await;

        assert_eq!(ctx.remote.max_in_flight(), 1);
        assert_eq!(ctx.remote.upsert_calls_for(meal.id), 1);
        assert_eq!(
            status_of(&ctx.queue, &meal).await.sync_status,
            SyncStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_meal_enqueued_during_run_is_picked_up() {
        let remote = FakeRemote::gated();
        let ctx = setup_with(true, remote, Duration::from_millis(5)).await;
        let first = enqueue(&ctx.queue, 8, "first").await;

        ctx.engine.refresh();
        ctx.remote.wait_entered().await;

        let late = enqueue(&ctx.queue, 9, "late").await;
        assert_eq!(ctx.engine.notify_enqueued(), TriggerOutcome::Coalesced);

        ctx.remote.release(2);
        ctx.engine.wait_idle().await;

        assert_eq!(
            status_of(&ctx.queue, &first).await.sync_status,
            SyncStatus::Synced
        );
        assert_eq!(
            status_of(&ctx.queue, &late).await.sync_status,
            SyncStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_rejected_meal_is_not_retried_automatically() {
        let ctx = setup(true).await;
        let meal = enqueue(&ctx.queue, 12, "bad").await;
        ctx.remote.fail_upserts(
            meal.id,
            1,
            RemoteError::Rejected {
                status: 422,
                reason: "unknown meal type".into(),
            },
        );
        let mut events = ctx.engine.subscribe();

        ctx.engine.refresh();
        let failed = next_event(&mut events, |e| matches!(e, SyncEvent::RecordFailed { .. })).await;
        assert!(matches!(
            failed,
            SyncEvent::RecordFailed {
                retryable: false,
                ..
            }
        ));
        ctx.engine.wait_idle().await;

        let row = status_of(&ctx.queue, &meal).await;
        assert!(row.is_rejected());
        assert_eq!(ctx.engine.retries_scheduled(), 0);
        assert!(!ctx.engine.has_pending_retry());

        // A later refresh leaves it alone too
        ctx.engine.sync_now().await.unwrap();
        assert_eq!(ctx.remote.upsert_calls_for(meal.id), 1);
    }

    #[tokio::test]
    async fn test_repeated_online_values_do_not_trigger() {
        let ctx = setup(true).await;
        ctx.engine.start().await.unwrap();
        ctx.engine.wait_idle().await;
        let mut events = ctx.engine.subscribe();

        ctx.online.send(true).unwrap();
        ctx.online.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(events.try_recv().is_err());
        ctx.engine.shutdown();
    }

    #[tokio::test]
    async fn test_connectivity_regain_resets_backoff() {
        let ctx = setup(true).await;
        let meal = enqueue(&ctx.queue, 12, "H").await;
        ctx.remote
            .fail_upserts(meal.id, 6, RemoteError::Unavailable("offline".into()));
        let mut events = ctx.engine.subscribe();
        ctx.engine.start().await.unwrap();

        next_event(&mut events, |e| matches!(e, SyncEvent::RetriesExhausted { .. })).await;
        ctx.engine.wait_idle().await;
        assert_eq!(ctx.engine.retries_scheduled(), 5);

        ctx.online.send(false).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.online.send(true).unwrap();
        next_event(&mut events, |e| matches!(e, SyncEvent::RecordSynced { .. })).await;
        ctx.engine.wait_idle().await;

        assert_eq!(ctx.engine.retries_scheduled(), 0);
        assert_eq!(
            status_of(&ctx.queue, &meal).await.sync_status,
            SyncStatus::Synced
        );
        ctx.engine.shutdown();
    }

    #[tokio::test]
    async fn test_queue_failure_aborts_run() {
        let ctx = setup(true).await;
        enqueue(&ctx.queue, 12, "I").await;
        let mut events = ctx.engine.subscribe();
        ctx.queue.close().await;

        assert!(ctx.engine.sync_now().await.is_err());
        let aborted = next_event(&mut events, |e| matches!(e, SyncEvent::PassAborted { .. })).await;
        assert!(matches!(aborted, SyncEvent::PassAborted { .. }));
        assert!(!ctx.engine.is_running());
    }

    #[tokio::test]
    async fn test_aborted_run_releases_claimed_meal() {
        let ctx = setup(true).await;
        let meal = enqueue(&ctx.queue, 12, "J").await;
        // Refuse the write that would record the result
        sqlx::query(
            r#"
            CREATE TRIGGER refuse_synced BEFORE UPDATE ON queued_meals
            WHEN NEW.sync_status = 'synced'
            BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END
            "#,
        )
        .execute(ctx.queue.pool())
        .await
        .unwrap();

        assert!(ctx.engine.sync_now().await.is_err());
        assert!(!ctx.engine.is_running());
        assert_eq!(ctx.remote.upsert_calls_for(meal.id), 1);
        assert_eq!(
            status_of(&ctx.queue, &meal).await.sync_status,
            SyncStatus::Pending
        );

        // The same process can send it again once the queue works
        sqlx::query("DROP TRIGGER refuse_synced")
            .execute(ctx.queue.pool())
            .await
            .unwrap();
        let report = ctx.engine.sync_now().await.unwrap().unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(ctx.remote.record_count(), 1);
    }

    #[tokio::test]
    async fn test_remote_delete_of_missing_meal_counts_as_sent() {
        let ctx = setup(true).await;
        let meal = enqueue(&ctx.queue, 12, "K").await;
        ctx.engine.sync_now().await.unwrap();
        ctx.queue.remove(meal.id).await.unwrap();
        ctx.remote.fail_deletes(
            1,
            RemoteError::Rejected {
                status: 410,
                reason: "Gone".into(),
            },
        );

        let report = ctx.engine.sync_now().await.unwrap().unwrap();

        assert_eq!(report.deletions_sent, 1);
        assert_eq!(report.deletions_rejected, 0);
        assert!(ctx.queue.list_all_deletions().await.unwrap().is_empty());
    }
}
