use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{DomainError, IsolationLevel, ScenarioKind};

pub const CONFIG_VERSION: u32 = 1;

/// How the orchestrator biases the interleaving of the two actors.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Pacing {
    /// Actors signal scripted checkpoints and the peer waits for them.
    #[default]
    Rendezvous,
    /// Actors sleep fixed delays; the race may not materialize.
    Timed,
}

impl Pacing {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rendezvous => "rendezvous",
            Self::Timed => "timed",
        }
    }

    /// # Errors
    /// Returns [`DomainError::Validation`] for anything but `rendezvous` or `timed`.
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "rendezvous" => Ok(Self::Rendezvous),
            "timed" => Ok(Self::Timed),
            _ => Err(DomainError::Validation(format!(
                "invalid pacing '{value}'; use 'rendezvous' or 'timed'"
            ))),
        }
    }
}

/// When the write-skew rule reports.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WriteSkewPolicy {
    /// Overlapping aggregate reads followed by disjoint committed writes.
    #[default]
    Pattern,
    /// The pattern, and the projected total of the scope drops below `min_total`.
    ConstraintBreach { min_total: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SeedConfig {
    #[serde(default = "default_accounts")]
    pub accounts: BTreeMap<String, i64>,
    #[serde(default = "default_phantom_extra")]
    pub phantom_extra: BTreeMap<String, i64>,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            accounts: default_accounts(),
            phantom_extra: default_phantom_extra(),
        }
    }
}

impl SeedConfig {
    #[must_use]
    pub fn balance_of(&self, account: &str) -> Option<i64> {
        self.accounts.get(account).copied()
    }
}

fn default_accounts() -> BTreeMap<String, i64> {
    [("A".to_string(), 100), ("B".to_string(), 200)]
        .into_iter()
        .collect()
}

fn default_phantom_extra() -> BTreeMap<String, i64> {
    [("C".to_string(), 150)].into_iter().collect()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DetectorSettings {
    #[serde(default)]
    pub write_skew: WriteSkewPolicy,
}

/// Lab configuration as written in `txlab.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LabConfig {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub pacing: Pacing,
    #[serde(default)]
    pub isolation_overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub seed: SeedConfig,
    #[serde(default)]
    pub detector: DetectorSettings,
    #[serde(default)]
    pub trace_db: Option<PathBuf>,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            pacing: Pacing::default(),
            isolation_overrides: BTreeMap::new(),
            seed: SeedConfig::default(),
            detector: DetectorSettings::default(),
            trace_db: None,
        }
    }
}

fn default_config_version() -> u32 {
    CONFIG_VERSION
}

/// Validated configuration with typed overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NormalizedLabConfig {
    pub normalized_hash: String,
    pub pacing: Pacing,
    pub isolation_overrides: BTreeMap<ScenarioKind, IsolationLevel>,
    pub seed: SeedConfig,
    pub detector: DetectorSettings,
    pub trace_db: Option<PathBuf>,
}
