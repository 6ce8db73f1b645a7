#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

mod config;
mod isolation;
mod scenario;

pub use config::{
    DetectorSettings, LabConfig, NormalizedLabConfig, Pacing, SeedConfig, WriteSkewPolicy,
    CONFIG_VERSION,
};
pub use isolation::{IsolationLevel, Recommendation};
pub use scenario::{
    ActorOutcome, ActorStatus, ObservedValues, RunRecord, ScenarioKind, ScenarioResult,
};

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("unknown scenario kind: {0}")]
    UnknownScenario(String),
    #[error("unknown isolation level: {0}")]
    UnknownIsolationLevel(String),
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    #[error("unknown anomaly type: {0}")]
    UnknownAnomalyType(String),
    #[error("unknown failure reason: {0}")]
    UnknownFailureReason(String),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
        Ok(Self(ulid))
    }
}

/// Identity of one actor's transaction within a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TxId(pub Ulid);

impl TxId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TxId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid tx_id ULID: {err}"))?;
        Ok(Self(ulid))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Begin,
    Read,
    Write,
    Commit,
    Rollback,
}

impl EventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Begin => "BEGIN",
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
        }
    }

    /// Parse the canonical upper-case event name.
    ///
    /// # Errors
    /// Returns [`DomainError::UnknownEventType`] for any other input.
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "BEGIN" => Ok(Self::Begin),
            "READ" => Ok(Self::Read),
            "WRITE" => Ok(Self::Write),
            "COMMIT" => Ok(Self::Commit),
            "ROLLBACK" => Ok(Self::Rollback),
            _ => Err(DomainError::UnknownEventType(value.to_string())),
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Commit | Self::Rollback)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    Count,
    Sum,
}

impl AggregateKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
        }
    }
}

/// Marks a READ as an aggregate over a key scope. An empty scope covers the whole table.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct AggregateRead {
    pub kind: AggregateKind,
    #[serde(default)]
    pub scope: Vec<String>,
}

impl AggregateRead {
    #[must_use]
    pub fn count_all() -> Self {
        Self {
            kind: AggregateKind::Count,
            scope: Vec::new(),
        }
    }

    #[must_use]
    pub fn sum_of(keys: &[&str]) -> Self {
        Self {
            kind: AggregateKind::Sum,
            scope: keys.iter().map(ToString::to_string).collect(),
        }
    }

    /// Synthetic record key used when the aggregate is logged, e.g. `COUNT(*)` or `SUM(A,B)`.
    #[must_use]
    pub fn record_key(&self) -> String {
        let scope = if self.scope.is_empty() {
            "*".to_string()
        } else {
            self.scope.join(",")
        };
        format!("{}({scope})", self.kind.as_str().to_ascii_uppercase())
    }

    #[must_use]
    pub fn covers(&self, key: &str) -> bool {
        self.scope.is_empty() || self.scope.iter().any(|item| item == key)
    }
}

/// Why an actor's transaction ended in ROLLBACK.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Deadlock,
    SerializationFailure,
    StatementError,
    Scripted,
}

impl FailureReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deadlock => "deadlock",
            Self::SerializationFailure => "serialization_failure",
            Self::StatementError => "statement_error",
            Self::Scripted => "scripted",
        }
    }

    /// # Errors
    /// Returns [`DomainError::UnknownFailureReason`] for unrecognized names.
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "deadlock" => Ok(Self::Deadlock),
            "serialization_failure" => Ok(Self::SerializationFailure),
            "statement_error" => Ok(Self::StatementError),
            "scripted" => Ok(Self::Scripted),
            _ => Err(DomainError::UnknownFailureReason(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceEvent {
    pub run_id: RunId,
    pub tx_id: TxId,
    pub tx_name: String,
    pub event_type: EventType,
    pub table_name: Option<String>,
    pub record_key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub sequence_order: u64,
    #[serde(default)]
    pub aggregate: Option<AggregateRead>,
    #[serde(default)]
    pub observed_uncommitted: bool,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    pub notes: Option<String>,
    pub timestamp: DateTimeUtc,
}

impl TraceEvent {
    #[must_use]
    pub fn is_aggregate_read(&self) -> bool {
        self.event_type == EventType::Read && self.aggregate.is_some()
    }

    /// The value a READ observed; READs carry it in `old_value`.
    #[must_use]
    pub fn read_value(&self) -> Option<&str> {
        self.old_value.as_deref()
    }
}

/// An event before the trace log stamps `sequence_order` and `timestamp`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EventDraft {
    pub run_id: RunId,
    pub tx_id: TxId,
    pub tx_name: String,
    pub event_type: EventType,
    pub table_name: Option<String>,
    pub record_key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub aggregate: Option<AggregateRead>,
    pub observed_uncommitted: bool,
    pub failure: Option<FailureReason>,
    pub notes: Option<String>,
}

impl EventDraft {
    #[must_use]
    pub fn new(run_id: RunId, tx_id: TxId, tx_name: &str, event_type: EventType) -> Self {
        Self {
            run_id,
            tx_id,
            tx_name: tx_name.to_string(),
            event_type,
            table_name: None,
            record_key: None,
            old_value: None,
            new_value: None,
            aggregate: None,
            observed_uncommitted: false,
            failure: None,
            notes: None,
        }
    }

    #[must_use]
    pub fn record(mut self, table_name: &str, record_key: &str) -> Self {
        self.table_name = Some(table_name.to_string());
        self.record_key = Some(record_key.to_string());
        self
    }

    #[must_use]
    pub fn values(mut self, old_value: Option<i64>, new_value: Option<i64>) -> Self {
        self.old_value = old_value.map(|value| value.to_string());
        self.new_value = new_value.map(|value| value.to_string());
        self
    }

    #[must_use]
    pub fn aggregate(mut self, table_name: &str, aggregate: AggregateRead) -> Self {
        self.table_name = Some(table_name.to_string());
        self.record_key = Some(aggregate.record_key());
        self.aggregate = Some(aggregate);
        self
    }

    #[must_use]
    pub fn observed_uncommitted(mut self, flag: bool) -> Self {
        self.observed_uncommitted = flag;
        self
    }

    #[must_use]
    pub fn failure(mut self, reason: FailureReason) -> Self {
        self.failure = Some(reason);
        self
    }

    #[must_use]
    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    #[must_use]
    pub fn into_event(self, sequence_order: u64, timestamp: DateTimeUtc) -> TraceEvent {
        TraceEvent {
            run_id: self.run_id,
            tx_id: self.tx_id,
            tx_name: self.tx_name,
            event_type: self.event_type,
            table_name: self.table_name,
            record_key: self.record_key,
            old_value: self.old_value,
            new_value: self.new_value,
            sequence_order,
            aggregate: self.aggregate,
            observed_uncommitted: self.observed_uncommitted,
            failure: self.failure,
            notes: self.notes,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    LostUpdate,
    DirtyRead,
    NonRepeatableRead,
    PhantomRead,
    WriteSkew,
    Deadlock,
}

impl AnomalyType {
    pub const ALL: [Self; 6] = [
        Self::LostUpdate,
        Self::DirtyRead,
        Self::NonRepeatableRead,
        Self::PhantomRead,
        Self::WriteSkew,
        Self::Deadlock,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LostUpdate => "lost_update",
            Self::DirtyRead => "dirty_read",
            Self::NonRepeatableRead => "non_repeatable_read",
            Self::PhantomRead => "phantom_read",
            Self::WriteSkew => "write_skew",
            Self::Deadlock => "deadlock",
        }
    }

    /// # Errors
    /// Returns [`DomainError::UnknownAnomalyType`] for unrecognized names.
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| DomainError::UnknownAnomalyType(value.to_string()))
    }

    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::NonRepeatableRead | Self::PhantomRead => Severity::Medium,
            Self::LostUpdate | Self::DirtyRead | Self::WriteSkew | Self::Deadlock => {
                Severity::High
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub description: String,
    pub affected_transactions: BTreeSet<String>,
    pub event_sequence: BTreeSet<u64>,
}

impl Anomaly {
    #[must_use]
    pub fn new(
        anomaly_type: AnomalyType,
        description: String,
        affected_transactions: BTreeSet<String>,
        event_sequence: BTreeSet<u64>,
    ) -> Self {
        Self {
            anomaly_type,
            severity: anomaly_type.severity(),
            description,
            affected_transactions,
            event_sequence,
        }
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Link a trace event into a per-run hash chain.
///
/// # Errors
/// Returns an error if the event cannot be serialized.
pub fn compute_event_hash(event: &TraceEvent, prev_event_hash: Option<&str>) -> Result<String> {
    let material = serde_json::json!({
        "prev_event_hash": prev_event_hash,
        "event": serde_json::to_value(event)?,
    });
    hash_json(&material)
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}
