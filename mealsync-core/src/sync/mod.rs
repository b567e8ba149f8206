//! Offline-first synchronization of queued meals to the remote store.
//!
//! The [`SyncEngine`] drains the local queue through a [`RemoteWritePort`]
//! whenever connectivity allows, retrying transient failures with exponential
//! backoff.

mod engine;
mod error;
mod events;
mod remote;
mod retry;

pub use engine::SyncEngine;
pub use error::RemoteError;
pub use events::{PassReport, SyncEvent, Trigger, TriggerOutcome};
pub use remote::RemoteWritePort;
pub use retry::{Backoff, RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES};
