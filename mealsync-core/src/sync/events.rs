use std::time::Duration;
use uuid::Uuid;

/// What caused a sync pass to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    ConnectivityRegained,
    ManualRefresh,
    NewRecord,
    ScheduledRetry,
    Startup,
}

impl Trigger {
    /// Triggers that open a fresh retry window and reset the backoff counter.
    pub fn resets_backoff(&self) -> bool {
        matches!(
            self,
            Trigger::ConnectivityRegained | Trigger::ManualRefresh | Trigger::Startup
        )
    }
}

/// Result of asking the engine to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    /// A pass is already running and will pick up new work itself.
    Coalesced,
    Offline,
}

/// Tally of one engine run (one or more passes back to back).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    pub rejected: usize,
    pub deletions_sent: usize,
    pub deletions_failed: usize,
    /// Deletes the remote refused. Their tombstones stay queued.
    pub deletions_rejected: usize,
    pub passes: usize,
}

impl PassReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
            && self.rejected == 0
            && self.deletions_failed == 0
            && self.deletions_rejected == 0
    }
}

/// Notifications for presentation code. Nothing flows back into the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    PassStarted {
        trigger: Trigger,
    },
    PassFinished(PassReport),
    RecordSynced {
        id: Uuid,
    },
    RecordFailed {
        id: Uuid,
        error: String,
        retryable: bool,
    },
    RetryScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// Automatic retries are used up; failed rows wait for a refresh.
    RetriesExhausted {
        remaining: u64,
    },
    /// The local queue failed mid-pass.
    PassAborted {
        error: String,
    },
}
