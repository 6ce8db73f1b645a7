use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{
    AnomalyType, DateTimeUtc, DomainError, FailureReason, IsolationLevel, Pacing, RunId, TxId,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    LostUpdate,
    DirtyRead,
    NonRepeatableRead,
    PhantomRead,
    WriteSkew,
    Deadlock,
}

impl ScenarioKind {
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
    /// Returns [`DomainError::UnknownScenario`] for anything but the six scenario names.
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| DomainError::UnknownScenario(value.to_string()))
    }

    #[must_use]
    pub const fn default_isolation(self) -> IsolationLevel {
        match self {
            Self::DirtyRead => IsolationLevel::ReadUncommitted,
            Self::WriteSkew => IsolationLevel::RepeatableRead,
            Self::LostUpdate | Self::NonRepeatableRead | Self::PhantomRead | Self::Deadlock => {
                IsolationLevel::ReadCommitted
            }
        }
    }

    /// The anomaly this scenario is built to provoke.
    #[must_use]
    pub const fn target_anomaly(self) -> AnomalyType {
        match self {
            Self::LostUpdate => AnomalyType::LostUpdate,
            Self::DirtyRead => AnomalyType::DirtyRead,
            Self::NonRepeatableRead => AnomalyType::NonRepeatableRead,
            Self::PhantomRead => AnomalyType::PhantomRead,
            Self::WriteSkew => AnomalyType::WriteSkew,
            Self::Deadlock => AnomalyType::Deadlock,
        }
    }
}

impl FromStr for ScenarioKind {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl std::fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ActorStatus {
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActorOutcome {
    pub tx_id: TxId,
    pub tx_name: String,
    pub isolation: IsolationLevel,
    pub status: ActorStatus,
    pub failure: Option<FailureReason>,
    pub error: Option<String>,
}

impl ActorOutcome {
    #[must_use]
    pub fn committed(&self) -> bool {
        self.status == ActorStatus::Committed
    }
}

/// Values the caller cares about after a scenario, one shape per scenario kind.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "scenario", rename_all = "snake_case")]
pub enum ObservedValues {
    LostUpdate {
        t1_written: Option<i64>,
        t2_written: Option<i64>,
        final_balance: Option<i64>,
    },
    DirtyRead {
        t2_read_value: Option<i64>,
        final_balance: Option<i64>,
    },
    NonRepeatableRead {
        first_read: Option<i64>,
        second_read: Option<i64>,
    },
    PhantomRead {
        first_count: Option<i64>,
        second_count: Option<i64>,
    },
    WriteSkew {
        initial_total: i64,
        final_total: i64,
    },
    Deadlock {
        deadlock_occurred: bool,
        victim: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScenarioResult {
    pub run_id: RunId,
    pub kind: ScenarioKind,
    pub isolation: IsolationLevel,
    pub actors: Vec<ActorOutcome>,
    pub observed: ObservedValues,
}

impl ScenarioResult {
    #[must_use]
    pub fn actor(&self, tx_name: &str) -> Option<&ActorOutcome> {
        self.actors.iter().find(|actor| actor.tx_name == tx_name)
    }
}

/// Persisted bookkeeping for one scenario execution.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub scenario: ScenarioKind,
    pub isolation: IsolationLevel,
    pub operand_a: i64,
    pub operand_b: i64,
    pub pacing: Pacing,
    pub started_at: DateTimeUtc,
    pub ended_at: Option<DateTimeUtc>,
    pub result_json: Option<serde_json::Value>,
}
