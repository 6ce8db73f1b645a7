#![forbid(unsafe_code)]

//! Runs the two-actor anomaly scenarios against a [`Store`], recording every
//! operation in a shared [`TraceLog`].

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};
use txlab_domain::{
    FailureReason, IsolationLevel, NormalizedLabConfig, ObservedValues, Pacing, RunId,
    ScenarioKind, ScenarioResult, SeedConfig,
};
use txlab_store::Store;
use txlab_trace_core::TraceLog;

mod actor;
mod pacing;
mod scripts;

use actor::{Actor, ActorReport};
use pacing::{Checkpoints, Pacer};

/// Name of the first actor in every scenario.
pub const T1: &str = "T1";
/// Name of the second actor in every scenario.
pub const T2: &str = "T2";

pub const DEFAULT_OPERAND_A: i64 = 50;
pub const DEFAULT_OPERAND_B: i64 = -20;

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct OrchestratorConfig {
    pub pacing: Pacing,
    pub isolation_overrides: BTreeMap<ScenarioKind, IsolationLevel>,
    pub seed: SeedConfig,
}

impl From<&NormalizedLabConfig> for OrchestratorConfig {
    fn from(config: &NormalizedLabConfig) -> Self {
        Self {
            pacing: config.pacing,
            isolation_overrides: config.isolation_overrides.clone(),
            seed: config.seed.clone(),
        }
    }
}

/// One scenario execution as asked for by the caller.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ScenarioRequest {
    pub run_id: RunId,
    pub kind: ScenarioKind,
    /// Value T1 writes.
    pub operand_a: i64,
    /// Value T2 writes or inserts.
    pub operand_b: i64,
    /// Overrides both the configured and the scenario's default level.
    pub isolation: Option<IsolationLevel>,
}

impl ScenarioRequest {
    #[must_use]
    pub fn new(run_id: RunId, kind: ScenarioKind) -> Self {
        Self {
            run_id,
            kind,
            operand_a: DEFAULT_OPERAND_A,
            operand_b: DEFAULT_OPERAND_B,
            isolation: None,
        }
    }

    #[must_use]
    pub fn with_operands(mut self, operand_a: i64, operand_b: i64) -> Self {
        self.operand_a = operand_a;
        self.operand_b = operand_b;
        self
    }

    #[must_use]
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }
}

pub struct Orchestrator<'a> {
    store: &'a dyn Store,
    trace: &'a TraceLog,
    config: OrchestratorConfig,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(store: &'a dyn Store, trace: &'a TraceLog, config: OrchestratorConfig) -> Self {
        Self {
            store,
            trace,
            config,
        }
    }

    /// Isolation level a run of `kind` uses: the request's, then the configured
    /// override, then the scenario default.
    #[must_use]
    pub fn isolation_for(
        &self,
        kind: ScenarioKind,
        requested: Option<IsolationLevel>,
    ) -> IsolationLevel {
        requested
            .or_else(|| self.config.isolation_overrides.get(&kind).copied())
            .unwrap_or_else(|| kind.default_isolation())
    }

    /// Parse `name` and run that scenario with default isolation.
    ///
    /// # Errors
    /// Returns an error for an unknown scenario name, before anything is reset
    /// or recorded, or when the run itself fails.
    pub fn run_scenario_named(
        &self,
        name: &str,
        run_id: RunId,
        operand_a: i64,
        operand_b: i64,
    ) -> Result<ScenarioResult> {
        let kind = ScenarioKind::parse(name).map_err(|err| anyhow!("invalid scenario: {err}"))?;
        self.run_scenario(&ScenarioRequest::new(run_id, kind).with_operands(operand_a, operand_b))
    }

    /// Reset the accounts, run both actors concurrently to completion and
    /// collect the values the scenario observed.
    ///
    /// Transaction failures (deadlock victims, serialization failures) are
    /// outcomes, not errors; they show up in [`ScenarioResult::actors`].
    ///
    /// # Errors
    /// Returns an error when the store cannot be reset or connected to, or an
    /// actor thread panics.
    pub fn run_scenario(&self, request: &ScenarioRequest) -> Result<ScenarioResult> {
        let isolation = self.isolation_for(request.kind, request.isolation);
        let seed = self.seed_rows(request.kind);
        self.store
            .reset(&seed)
            .context("failed to recreate accounts table")?;

        info!(
            run_id = %request.run_id,
            scenario = request.kind.as_str(),
            isolation = isolation.as_str(),
            pacing = self.config.pacing.as_str(),
            operand_a = request.operand_a,
            operand_b = request.operand_b,
            "scenario started"
        );

        let checkpoints = Checkpoints::default();
        let [first_script, second_script] = scripts::scripts_for(request.kind);
        let first = self.open_actor(request.run_id, T1, isolation, &checkpoints)?;
        let second = self.open_actor(request.run_id, T2, isolation, &checkpoints)?;

        let (first, second) = std::thread::scope(|scope| {
            let first = scope.spawn(move || first.run(first_script, request));
            let second = scope.spawn(move || second.run(second_script, request));
            (first.join(), second.join())
        });
        let first = first.map_err(|_| anyhow!("actor {T1} panicked"))?;
        let second = second.map_err(|_| anyhow!("actor {T2} panicked"))?;

        let balances = self.store.committed_balances();
        let observed = observe(request, &seed, &balances, &first, &second);
        for report in [&first, &second] {
            if let Some(failure) = report.outcome.failure {
                if failure != FailureReason::Scripted {
                    warn!(
                        run_id = %request.run_id,
                        tx_name = %report.outcome.tx_name,
                        failure = failure.as_str(),
                        "actor did not commit"
                    );
                }
            }
        }
        info!(
            run_id = %request.run_id,
            scenario = request.kind.as_str(),
            events = self.trace.fetch_ordered(request.run_id).len(),
            "scenario finished"
        );

        Ok(ScenarioResult {
            run_id: request.run_id,
            kind: request.kind,
            isolation,
            actors: vec![first.outcome, second.outcome],
            observed,
        })
    }

    /// Rows the accounts table starts from; phantom runs get the extra rows too.
    fn seed_rows(&self, kind: ScenarioKind) -> BTreeMap<String, i64> {
        let mut rows = self.config.seed.accounts.clone();
        if kind == ScenarioKind::PhantomRead {
            rows.extend(
                self.config
                    .seed
                    .phantom_extra
                    .iter()
                    .map(|(account, balance)| (account.clone(), *balance)),
            );
        }
        rows
    }

    fn open_actor<'c>(
        &'c self,
        run_id: RunId,
        name: &'static str,
        isolation: IsolationLevel,
        checkpoints: &'c Checkpoints,
    ) -> Result<Actor<'c>> {
        let mut conn = self
            .store
            .connect()
            .with_context(|| format!("failed to open connection for {name}"))?;
        conn.set_isolation_level(isolation)
            .with_context(|| format!("failed to set isolation level for {name}"))?;
        Ok(Actor::new(
            run_id,
            name,
            isolation,
            conn,
            self.trace,
            Pacer::new(self.config.pacing, checkpoints, name),
        ))
    }
}

fn observe(
    request: &ScenarioRequest,
    seed: &BTreeMap<String, i64>,
    balances: &BTreeMap<String, i64>,
    first: &ActorReport,
    second: &ActorReport,
) -> ObservedValues {
    let total = |rows: &BTreeMap<String, i64>| -> i64 {
        scripts::WRITE_SKEW_SCOPE
            .iter()
            .filter_map(|account| rows.get(*account))
            .fold(0_i64, |sum, balance| sum.saturating_add(*balance))
    };
    match request.kind {
        ScenarioKind::LostUpdate => ObservedValues::LostUpdate {
            t1_written: first.committed_value("written"),
            t2_written: second.committed_value("written"),
            final_balance: balances.get("A").copied(),
        },
        ScenarioKind::DirtyRead => ObservedValues::DirtyRead {
            t2_read_value: second.value("read"),
            final_balance: balances.get("A").copied(),
        },
        ScenarioKind::NonRepeatableRead => ObservedValues::NonRepeatableRead {
            first_read: first.value("first_read"),
            second_read: first.value("second_read"),
        },
        ScenarioKind::PhantomRead => ObservedValues::PhantomRead {
            first_count: first.value("first_count"),
            second_count: first.value("second_count"),
        },
        ScenarioKind::WriteSkew => ObservedValues::WriteSkew {
            initial_total: total(seed),
            final_total: total(balances),
        },
        ScenarioKind::Deadlock => {
            let victim = [first, second]
                .into_iter()
                .find(|report| report.outcome.failure == Some(FailureReason::Deadlock));
            ObservedValues::Deadlock {
                deadlock_occurred: victim.is_some(),
                victim: victim.map(|report| report.outcome.tx_name.clone()),
            }
        }
    }
}
