//! Single-flight coalescing on request fingerprints: at most one upstream
//! call per fingerprint is in flight at any instant. Later submissions with
//! the same fingerprint become waiters on the leader's completion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::types::{ErrorKind, TokenUsage};

#[derive(Clone, Debug)]
pub enum FlightOutcome {
    Success {
        text: String,
        thinking: Option<String>,
        tokens: TokenUsage,
        provider_used: String,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Debug)]
struct Slots {
    map: Mutex<HashMap<String, watch::Sender<Option<FlightOutcome>>>>,
}

#[derive(Clone, Debug)]
pub struct SingleFlight {
    slots: Arc<Slots>,
}

pub enum Flight {
    /// This caller owns the upstream call and must resolve the guard.
    Leader(FlightGuard),
    /// Another call with the same fingerprint is in flight; await its result.
    Waiter(watch::Receiver<Option<FlightOutcome>>),
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self {
            slots: Arc::new(Slots {
                map: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl SingleFlight {
    pub fn begin(&self, fingerprint: &str) -> Flight {
        let mut map = self.slots.map.lock().expect("single-flight lock");
        if let Some(sender) = map.get(fingerprint) {
            return Flight::Waiter(sender.subscribe());
        }
        let (tx, _rx) = watch::channel(None);
        map.insert(fingerprint.to_string(), tx);
        Flight::Leader(FlightGuard {
            fingerprint: fingerprint.to_string(),
            slots: Arc::clone(&self.slots),
            resolved: false,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.slots.map.lock().expect("single-flight lock").len()
    }
}

/// Await a waiter's copy of the leader's outcome.
pub async fn await_outcome(
    mut rx: watch::Receiver<Option<FlightOutcome>>,
) -> FlightOutcome {
    loop {
        if let Some(outcome) = rx.borrow().clone() {
            return outcome;
        }
        if rx.changed().await.is_err() {
            // Leader dropped without resolving; treat like an aborted call.
            return FlightOutcome::Failure {
                kind: ErrorKind::TransientBackend,
                message: "coalesced request was abandoned".to_string(),
            };
        }
    }
}

#[derive(Debug)]
pub struct FlightGuard {
    fingerprint: String,
    slots: Arc<Slots>,
    resolved: bool,
}

impl FlightGuard {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Publish the outcome to all waiters and release the slot. The cache
    /// write for a success must happen before this is called so waiters
    /// never observe a missing entry.
    pub fn resolve(mut self, outcome: FlightOutcome) {
        self.resolved = true;
        let sender = {
            let mut map = self.slots.map.lock().expect("single-flight lock");
            map.remove(&self.fingerprint)
        };
        if let Some(sender) = sender {
            let _ = sender.send(Some(outcome));
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let sender = {
            let mut map = self.slots.map.lock().expect("single-flight lock");
            map.remove(&self.fingerprint)
        };
        if let Some(sender) = sender {
            let _ = sender.send(Some(FlightOutcome::Failure {
                kind: ErrorKind::TransientBackend,
                message: "in-flight request aborted".to_string(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_caller_becomes_waiter() {
        let flights = SingleFlight::default();
        let leader = match flights.begin("fp") {
            Flight::Leader(guard) => guard,
            Flight::Waiter(_) => panic!("first caller must lead"),
        };
        let waiter = match flights.begin("fp") {
            Flight::Waiter(rx) => rx,
            Flight::Leader(_) => panic!("second caller must wait"),
        };
        assert_eq!(flights.in_flight(), 1);

        leader.resolve(FlightOutcome::Success {
            text: "hi".to_string(),
            thinking: None,
            tokens: TokenUsage::new(1, 1),
            provider_used: "stub".to_string(),
        });

        match await_outcome(waiter).await {
            FlightOutcome::Success { text, .. } => assert_eq!(text, "hi"),
            FlightOutcome::Failure { .. } => panic!("expected success"),
        }
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn failures_propagate_to_waiters() {
        let flights = SingleFlight::default();
        let Flight::Leader(leader) = flights.begin("fp") else {
            panic!("leader expected");
        };
        let Flight::Waiter(waiter) = flights.begin("fp") else {
            panic!("waiter expected");
        };

        leader.resolve(FlightOutcome::Failure {
            kind: ErrorKind::PermanentBackend,
            message: "upstream rejected".to_string(),
        });

        match await_outcome(waiter).await {
            FlightOutcome::Failure { kind, .. } => {
                assert_eq!(kind, ErrorKind::PermanentBackend)
            }
            FlightOutcome::Success { .. } => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn dropped_leader_fails_waiters() {
        let flights = SingleFlight::default();
        let Flight::Leader(leader) = flights.begin("fp") else {
            panic!("leader expected");
        };
        let Flight::Waiter(waiter) = flights.begin("fp") else {
            panic!("waiter expected");
        };
        drop(leader);

        match await_outcome(waiter).await {
            FlightOutcome::Failure { kind, .. } => {
                assert_eq!(kind, ErrorKind::TransientBackend)
            }
            FlightOutcome::Success { .. } => panic!("expected failure"),
        }
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn slot_is_reusable_after_resolution() {
        let flights = SingleFlight::default();
        let Flight::Leader(first) = flights.begin("fp") else {
            panic!("leader expected");
        };
        first.resolve(FlightOutcome::Failure {
            kind: ErrorKind::TransientBackend,
            message: "x".to_string(),
        });
        assert!(matches!(flights.begin("fp"), Flight::Leader(_)));
    }
}
