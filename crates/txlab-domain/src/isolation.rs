use serde::{Deserialize, Serialize};

use crate::{AnomalyType, DomainError};

/// Isolation levels, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum IsolationLevel {
    #[serde(rename = "READ UNCOMMITTED")]
    ReadUncommitted,
    #[serde(rename = "READ COMMITTED")]
    ReadCommitted,
    #[serde(rename = "REPEATABLE READ")]
    RepeatableRead,
    #[serde(rename = "SERIALIZABLE")]
    Serializable,
}

/// How to keep an anomaly from happening.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Recommendation {
    Level(IsolationLevel),
    /// No isolation level helps; acquire locks in a consistent order instead.
    LockOrdering,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Level(level) => f.write_str(level.as_str()),
            Self::LockOrdering => f.write_str("lock ordering"),
        }
    }
}

impl IsolationLevel {
    pub const ALL: [Self; 4] = [
        Self::ReadUncommitted,
        Self::ReadCommitted,
        Self::RepeatableRead,
        Self::Serializable,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }

    /// Accepts `READ COMMITTED`, `read_committed` and similar spellings.
    ///
    /// # Errors
    /// Returns [`DomainError::UnknownIsolationLevel`] when nothing matches.
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let normalized = value.trim().replace(['_', '-'], " ").to_ascii_uppercase();
        let collapsed = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == collapsed)
            .ok_or_else(|| DomainError::UnknownIsolationLevel(value.to_string()))
    }

    #[must_use]
    pub const fn prevents(self, anomaly: AnomalyType) -> bool {
        match anomaly {
            AnomalyType::DirtyRead => !matches!(self, Self::ReadUncommitted),
            AnomalyType::LostUpdate | AnomalyType::NonRepeatableRead | AnomalyType::PhantomRead => {
                matches!(self, Self::RepeatableRead | Self::Serializable)
            }
            AnomalyType::WriteSkew => matches!(self, Self::Serializable),
            AnomalyType::Deadlock => false,
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::ReadUncommitted => {
                "Reads may observe rows written by transactions that have not committed."
            }
            Self::ReadCommitted => {
                "Every statement sees the latest committed data; repeated reads can differ."
            }
            Self::RepeatableRead => {
                "Snapshot taken at the first statement; concurrent updates to a row this \
                 transaction writes fail with a serialization error."
            }
            Self::Serializable => {
                "Snapshot reads plus commit-time validation; the outcome matches some serial order."
            }
        }
    }

    /// Concurrency, consistency and locking profile.
    #[must_use]
    pub const fn profile(self) -> (&'static str, &'static str, &'static str) {
        match self {
            Self::ReadUncommitted => ("highest", "lowest", "write locks only"),
            Self::ReadCommitted => ("high", "medium", "statement-level visibility"),
            Self::RepeatableRead => ("medium", "high", "transaction-level snapshot"),
            Self::Serializable => ("lowest", "highest", "snapshot with read validation"),
        }
    }

    /// Weakest level that prevents `anomaly`.
    #[must_use]
    pub fn recommended_for(anomaly: AnomalyType) -> Recommendation {
        Self::ALL
            .into_iter()
            .find(|level| level.prevents(anomaly))
            .map_or(Recommendation::LockOrdering, Recommendation::Level)
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
