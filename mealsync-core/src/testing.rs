//! In-memory remote and helpers shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify, Semaphore};
use uuid::Uuid;

use crate::models::MealPayload;
use crate::sync::{RemoteError, RemoteWritePort, SyncEvent};

#[derive(Default)]
struct State {
    records: HashMap<Uuid, MealPayload>,
    upserts: Vec<Uuid>,
    deletes: Vec<Uuid>,
    upsert_failures: HashMap<Uuid, VecDeque<RemoteError>>,
    delete_failures: VecDeque<RemoteError>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Remote store keyed by meal id, with scripted failures and an optional gate
/// that holds every upsert until released.
pub(crate) struct FakeRemote {
    state: Mutex<State>,
    gate: Option<Semaphore>,
    entered: Notify,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            gate: None,
            entered: Notify::new(),
        }
    }

    /// Every upsert blocks until [`release`](Self::release) lets it through.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub fn release(&self, calls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(calls);
        }
    }

    /// Waits until an upsert has started.
    pub async fn wait_entered(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.entered.notified())
            .await
            .expect("no upsert started");
    }

    pub fn fail_upserts(&self, id: Uuid, times: usize, error: RemoteError) {
        let mut state = self.state.lock().unwrap();
        let queue = state.upsert_failures.entry(id).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    pub fn fail_deletes(&self, times: usize, error: RemoteError) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..times {
            state.delete_failures.push_back(error.clone());
        }
    }

    pub fn record(&self, id: Uuid) -> Option<MealPayload> {
        self.state.lock().unwrap().records.get(&id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    pub fn upsert_calls_for(&self, id: Uuid) -> usize {
        let state = self.state.lock().unwrap();
        state.upserts.iter().filter(|u| **u == id).count()
    }

    /// Distinct ids in the order they were first upserted.
    pub fn upsert_order(&self) -> Vec<Uuid> {
        let state = self.state.lock().unwrap();
        let mut order: Vec<Uuid> = Vec::new();
        for id in &state.upserts {
            if !order.contains(id) {
                order.push(*id);
            }
        }
        order
    }

    pub fn deletes(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().deletes.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }
}

#[async_trait]
impl RemoteWritePort for FakeRemote {
    async fn upsert_meal(&self, id: Uuid, payload: &MealPayload) -> Result<(), RemoteError> {
        {
            let mut state = self.state.lock().unwrap();
            state.upserts.push(id);
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        self.entered.notify_one();

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        if let Some(error) = state
            .upsert_failures
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        state.records.insert(id, payload.clone());
        Ok(())
    }

    async fn delete_meal(&self, id: Uuid) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.deletes.push(id);
        if let Some(error) = state.delete_failures.pop_front() {
            return Err(error);
        }
        state.records.remove(&id);
        Ok(())
    }
}

/// Receives events until one matches, failing the test after five seconds.
pub(crate) async fn next_event<F>(events: &mut broadcast::Receiver<SyncEvent>, matches: F) -> SyncEvent
where
    F: Fn(&SyncEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for sync event")
}
