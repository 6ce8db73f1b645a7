#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::debug;
use txlab_domain::{now_utc, Anomaly, EventDraft, RunId, RunRecord, ScenarioResult, TraceEvent};

/// Append-only, per-run ordered record of actor operations.
///
/// Every append takes the same lock, so `sequence_order` for a run is exactly
/// `1..=N` in the order events were recorded, whichever thread recorded them.
#[derive(Debug, Default)]
pub struct TraceLog {
    state: Mutex<LogState>,
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<TraceEvent>,
    last_sequence: BTreeMap<RunId, u64>,
}

impl TraceLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp the draft with the next sequence number of its run and record it.
    pub fn append(&self, draft: EventDraft) -> u64 {
        let mut state = self.state.lock();
        let counter = state.last_sequence.entry(draft.run_id).or_insert(0);
        *counter += 1;
        let sequence_order = *counter;

        let event = draft.into_event(sequence_order, now_utc());
        debug!(
            run_id = %event.run_id,
            tx_name = %event.tx_name,
            event_type = event.event_type.as_str(),
            record_key = event.record_key.as_deref().unwrap_or(""),
            sequence_order,
            "trace event recorded"
        );
        state.events.push(event);
        sequence_order
    }

    /// Events of one run in `sequence_order`.
    #[must_use]
    pub fn fetch_ordered(&self, run_id: RunId) -> Vec<TraceEvent> {
        let state = self.state.lock();
        let mut events: Vec<TraceEvent> = state
            .events
            .iter()
            .filter(|event| event.run_id == run_id)
            .cloned()
            .collect();
        events.sort_by_key(|event| event.sequence_order);
        events
    }

    #[must_use]
    pub fn runs(&self) -> Vec<RunId> {
        self.state.lock().last_sequence.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A persisted trace event together with its hash-chain links.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EventRow {
    pub event: TraceEvent,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChainReport {
    pub run_id: RunId,
    pub events: usize,
    pub chain_valid: bool,
    pub first_broken_sequence: Option<u64>,
}

/// Persistence for finished runs, their traces and detected anomalies.
pub trait TraceStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_run(&self, run: &RunRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn finish_run(&self, run_id: RunId, result: &ScenarioResult) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self) -> Result<Vec<RunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>>;

    /// Persist one event, linking it to the previous event of the same run.
    #[allow(clippy::missing_errors_doc)]
    fn append_event(&self, event: &TraceEvent) -> Result<EventRow>;

    #[allow(clippy::missing_errors_doc)]
    fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_anomaly(&self, run_id: RunId, anomaly: &Anomaly) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_anomalies_for_run(&self, run_id: RunId) -> Result<Vec<Anomaly>>;
}

/// Walk a run's persisted events and check every `prev_event_hash` link.
#[must_use]
pub fn verify_chain(run_id: RunId, rows: &[EventRow]) -> ChainReport {
    let mut prev: Option<&str> = None;
    for row in rows {
        let recomputed = txlab_domain::compute_event_hash(&row.event, prev);
        let link_ok = row.prev_event_hash.as_deref() == prev;
        let hash_ok = matches!(recomputed, Ok(ref hash) if *hash == row.event_hash);
        if !(link_ok && hash_ok) {
            return ChainReport {
                run_id,
                events: rows.len(),
                chain_valid: false,
                first_broken_sequence: Some(row.event.sequence_order),
            };
        }
        prev = Some(row.event_hash.as_str());
    }

    ChainReport {
        run_id,
        events: rows.len(),
        chain_valid: true,
        first_broken_sequence: None,
    }
}
