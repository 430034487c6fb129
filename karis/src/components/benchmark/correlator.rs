use crate::{
    devices::software::broker::StatusHandler,
    messages::{
        control::relay::{RelayControlMessage, RelayId},
        status::relay::{RelayReport, RelayStatusMessage},
    },
    utils::time::{local_timestamp, TimePeriod, Timestamp},
};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Sequence number of a dispatched batch, starting from 1.
pub type Generation = u64;

/// Outcome for one relay in one batch. Field order is the column
/// order of the latency csv.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct LatencyRecord {
    /// When the relay was resolved, either acknowledged or timed out.
    #[serde(serialize_with = "local_timestamp")]
    pub timestamp: DateTime<Local>,
    /// Time of day label for `timestamp`.
    pub period: TimePeriod,
    /// Relay the record is for.
    pub relay_id: RelayId,
    /// State that was commanded, and observed if acknowledged.
    pub state: bool,
    /// Round trip in milliseconds, `None` if no acknowledgment arrived in time.
    pub latency_ms: Option<f64>,
    /// Batch the record belongs to.
    #[serde(skip_serializing)]
    pub generation: Generation,
}

impl LatencyRecord {
    /// True if the relay never acknowledged the command.
    pub fn is_timed_out(&self) -> bool {
        self.latency_ms.is_none()
    }
}

/// Everything the correlator tracks, guarded by a single lock.
#[derive(Default)]
struct CorrelationState {
    /// Latest dispatched batch.
    generation: Generation,
    /// Target state for every relay in the latest batch.
    expected: HashMap<RelayId, bool>,
    /// Relays of the latest batch still waiting for an acknowledgment.
    pending: BTreeSet<RelayId>,
    /// When the command for each relay was handed to the broker.
    start_times: HashMap<RelayId, Timestamp>,
    /// Every record produced so far, in resolution order.
    records: Vec<LatencyRecord>,
}

/// Matches relay status reports against the most recent command. Only
/// the latest expectation per relay is tracked: dispatching a new batch
/// replaces whatever was still pending from the previous one.
///
/// Status reports arrive on the broker event loop while the benchmark
/// waits on its own task, so all state sits behind one mutex which is
/// only held for short read-modify-write sections.
#[derive(Default)]
pub struct Correlator {
    state: Mutex<CorrelationState>,
    /// Signalled whenever the pending set becomes empty.
    resolved: Notify,
}

impl Correlator {
    /// Create an empty correlator with no batch in flight.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CorrelationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a new batch. Every relay in `command` becomes pending
    /// with its start time set to `at`, which should be taken right before
    /// the command is published.
    ///
    /// * `command`: the control message about to be published.
    /// * `at`: dispatch time.
    pub fn record_dispatch(&self, command: &RelayControlMessage, at: Timestamp) -> Generation {
        let mut state = self.state();
        if !state.pending.is_empty() {
            warn!(
                superseded = state.generation,
                relays = ?state.pending,
                "Dispatching over a batch that is still pending"
            );
        }
        state.generation += 1;
        state.expected = command.target_states().into_iter().collect();
        state.pending = state.expected.keys().copied().collect();
        state.start_times = state.expected.keys().map(|id| (*id, at)).collect();

        let generation = state.generation;
        let is_empty = state.pending.is_empty();
        drop(state);

        if is_empty {
            self.resolved.notify_waiters();
        }
        generation
    }

    /// Resolve a relay if it is pending and the reported state matches the
    /// expected one. Anything else is ignored, the status topic also carries
    /// periodic reports and traffic from other clients.
    ///
    /// * `report`: observed state of one relay.
    /// * `at`: when the report was received.
    pub fn try_resolve(&self, report: &RelayReport, at: Timestamp) -> Option<LatencyRecord> {
        let mut state = self.state();
        if !state.pending.contains(&report.id) {
            return None;
        }
        if state.expected.get(&report.id) != Some(&report.state) {
            return None;
        }
        let start = state.start_times.get(&report.id).copied()?;

        let record = LatencyRecord {
            timestamp: at.wall,
            period: TimePeriod::of(&at.wall),
            relay_id: report.id,
            state: report.state,
            latency_ms: Some(at.millis_since(&start)),
            generation: state.generation,
        };
        state.pending.remove(&report.id);
        state.records.push(record.clone());
        let is_empty = state.pending.is_empty();
        drop(state);

        if is_empty {
            self.resolved.notify_waiters();
        }
        Some(record)
    }

    /// Give up on every relay that is still pending. Each one gets a record
    /// without a latency, stamped with `at`.
    ///
    /// * `at`: when the acknowledgment window closed.
    pub fn sweep_timeouts(&self, at: Timestamp) -> Vec<LatencyRecord> {
        let mut state = self.state();
        let pending = std::mem::take(&mut state.pending);
        let generation = state.generation;

        let mut timed_out = Vec::with_capacity(pending.len());
        for relay_id in pending {
            let expected = state.expected.get(&relay_id).copied().unwrap_or_default();
            timed_out.push(LatencyRecord {
                timestamp: at.wall,
                period: TimePeriod::of(&at.wall),
                relay_id,
                state: expected,
                latency_ms: None,
                generation,
            });
        }
        state.records.extend(timed_out.iter().cloned());
        drop(state);

        self.resolved.notify_waiters();
        timed_out
    }

    /// Wait until every relay of the current batch has been resolved or
    /// `timeout` elapses. Returns true if nothing is pending.
    ///
    /// * `timeout`: maximum time to wait.
    pub async fn wait_resolved(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.resolved.notified();
            tokio::pin!(notified);
            // Register before checking so a notification between the
            // check and the await is not lost.
            notified.as_mut().enable();
            if self.is_resolved() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_resolved();
            }
        }
    }

    /// True if no relay is waiting for an acknowledgment.
    pub fn is_resolved(&self) -> bool {
        self.state().pending.is_empty()
    }

    /// Relays still waiting for an acknowledgment, ascending.
    pub fn pending(&self) -> Vec<RelayId> {
        self.state().pending.iter().copied().collect()
    }

    /// Latest dispatched batch, 0 before the first dispatch.
    pub fn generation(&self) -> Generation {
        self.state().generation
    }

    /// Remove and return every record collected so far.
    pub fn take_records(&self) -> Vec<LatencyRecord> {
        std::mem::take(&mut self.state().records)
    }
}

impl StatusHandler for Correlator {
    fn handle_status(&self, topic: &str, payload: &[u8]) {
        let received = Timestamp::now();
        let message = match RelayStatusMessage::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(topic, error = %e, "Skipping malformed status message");
                return;
            }
        };
        for report in &message.relays {
            if let Some(record) = self.try_resolve(report, received) {
                debug!(
                    generation = record.generation,
                    relay_id = record.relay_id,
                    latency_ms = record.latency_ms,
                    "Relay acknowledged"
                );
            }
        }
    }
}
