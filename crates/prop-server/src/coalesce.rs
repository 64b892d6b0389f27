//! Single-flight table: at most one in-flight computation per cache key.

use prop_types::{CacheKey, TaskOutcome};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

type Table = Arc<Mutex<HashMap<CacheKey, watch::Receiver<Option<TaskOutcome>>>>>;

#[derive(Default)]
pub(crate) struct SingleFlight {
    flights: Table,
}

/// Result of joining a flight.
pub(crate) enum Flight {
    /// The caller must compute and then `complete` the flight.
    Leader(FlightLeader),
    /// Another caller is computing; wait for its outcome.
    Follower(watch::Receiver<Option<TaskOutcome>>),
}

pub(crate) struct FlightLeader {
    key: CacheKey,
    tx: Option<watch::Sender<Option<TaskOutcome>>>,
    flights: Table,
}

fn lock(table: &Table) -> MutexGuard<'_, HashMap<CacheKey, watch::Receiver<Option<TaskOutcome>>>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SingleFlight {
    pub fn join(&self, key: &CacheKey) -> Flight {
        let mut flights = lock(&self.flights);
        if let Some(rx) = flights.get(key) {
            return Flight::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        flights.insert(key.clone(), rx);
        Flight::Leader(FlightLeader {
            key: key.clone(),
            tx: Some(tx),
            flights: Arc::clone(&self.flights),
        })
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        lock(&self.flights).len()
    }
}

impl FlightLeader {
    /// Publish the outcome to every follower and close the flight.
    pub fn complete(mut self, outcome: TaskOutcome) {
        lock(&self.flights).remove(&self.key);
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(outcome));
        }
    }
}

impl Drop for FlightLeader {
    fn drop(&mut self) {
        // abandoned without an outcome: followers see a closed channel and retry
        if self.tx.is_some() {
            lock(&self.flights).remove(&self.key);
        }
    }
}

/// Wait for the leader's outcome; `None` when the leader gave up.
pub(crate) async fn follow(mut rx: watch::Receiver<Option<TaskOutcome>>) -> Option<TaskOutcome> {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return Some(outcome);
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}
