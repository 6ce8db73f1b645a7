use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, error, warn};
use txlab_domain::{
    ActorOutcome, ActorStatus, AggregateKind, AggregateRead, EventDraft, EventType, FailureReason,
    IsolationLevel, RunId, TxId,
};
use txlab_store::{Connection, Statement, StoreError, ACCOUNTS_TABLE};
use txlab_trace_core::TraceLog;

use crate::pacing::Pacer;
use crate::ScenarioRequest;

pub(crate) type StepResult<T> = Result<T, StoreError>;

/// A scripted actor body. Returns after COMMIT or a scripted ROLLBACK; an
/// error means the store refused a statement and the actor must abort.
pub(crate) type Script = fn(&mut Actor<'_>, &ScenarioRequest) -> StepResult<()>;

/// One transaction actor: a private connection plus the shared trace log.
pub(crate) struct Actor<'a> {
    run_id: RunId,
    tx_id: TxId,
    name: &'static str,
    isolation: IsolationLevel,
    conn: Box<dyn Connection>,
    trace: &'a TraceLog,
    pacer: Pacer<'a>,
    observed: BTreeMap<&'static str, i64>,
    status: Option<ActorStatus>,
    failure: Option<FailureReason>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct ActorReport {
    pub(crate) outcome: ActorOutcome,
    observed: BTreeMap<&'static str, i64>,
}

impl ActorReport {
    pub(crate) fn value(&self, key: &str) -> Option<i64> {
        self.observed.get(key).copied()
    }

    /// A noted value, but only if the actor's transaction committed.
    pub(crate) fn committed_value(&self, key: &str) -> Option<i64> {
        if self.outcome.committed() {
            self.value(key)
        } else {
            None
        }
    }
}

impl<'a> Actor<'a> {
    pub(crate) fn new(
        run_id: RunId,
        name: &'static str,
        isolation: IsolationLevel,
        conn: Box<dyn Connection>,
        trace: &'a TraceLog,
        pacer: Pacer<'a>,
    ) -> Self {
        Self {
            run_id,
            tx_id: TxId::new(),
            name,
            isolation,
            conn,
            trace,
            pacer,
            observed: BTreeMap::new(),
            status: None,
            failure: None,
            error: None,
        }
    }

    /// Run `script` to completion and report how the transaction ended.
    pub(crate) fn run(mut self, script: Script, request: &ScenarioRequest) -> ActorReport {
        let _finished = self.pacer.finish_guard();
        if let Err(err) = script(&mut self, request) {
            self.abort(&err);
        }
        if self.status.is_none() {
            // Scripts always end in COMMIT or ROLLBACK; anything else is left open.
            self.abort(&StoreError::Statement(
                "script ended without COMMIT or ROLLBACK".to_string(),
            ));
        }
        self.into_report()
    }

    fn record(&self, event_type: EventType, shape: impl FnOnce(EventDraft) -> EventDraft) -> u64 {
        let draft = EventDraft::new(self.run_id, self.tx_id, self.name, event_type);
        self.trace.append(shape(draft))
    }

    pub(crate) fn reach(&self, step: &'static str) {
        self.pacer.reach(step);
    }

    pub(crate) fn gate(&self, peer: &'static str, step: &'static str, delay: Duration) {
        self.pacer.gate(peer, step, delay);
    }

    pub(crate) fn pause(&self, delay: Duration) {
        self.pacer.pause(delay);
    }

    pub(crate) fn note(&mut self, key: &'static str, value: Option<i64>) {
        if let Some(value) = value {
            self.observed.insert(key, value);
        }
    }

    pub(crate) fn begin(&mut self) {
        let isolation = self.isolation;
        self.record(EventType::Begin, |draft| {
            draft.notes(format!("isolation level {isolation}"))
        });
    }

    pub(crate) fn read(&mut self, account: &str) -> StepResult<Option<i64>> {
        self.select(&Statement::select(account), account)
    }

    pub(crate) fn read_for_update(&mut self, account: &str) -> StepResult<Option<i64>> {
        self.select(&Statement::select_for_update(account), account)
    }

    /// Select without recording a READ event.
    pub(crate) fn peek(&mut self, account: &str) -> StepResult<Option<i64>> {
        Ok(self.conn.execute(&Statement::select(account))?.value)
    }

    fn select(&mut self, statement: &Statement, account: &str) -> StepResult<Option<i64>> {
        let outcome = self.conn.execute(statement)?;
        self.record(EventType::Read, |draft| {
            draft
                .record(ACCOUNTS_TABLE, account)
                .values(outcome.value, None)
                .observed_uncommitted(outcome.uncommitted)
                .notes(statement.describe())
        });
        Ok(outcome.value)
    }

    pub(crate) fn aggregate(&mut self, aggregate: AggregateRead) -> StepResult<Option<i64>> {
        let statement = match aggregate.kind {
            AggregateKind::Count => Statement::CountAccounts,
            AggregateKind::Sum => Statement::SumBalances {
                accounts: aggregate.scope.clone(),
            },
        };
        let outcome = self.conn.execute(&statement)?;
        self.record(EventType::Read, |draft| {
            draft
                .aggregate(ACCOUNTS_TABLE, aggregate)
                .values(outcome.value, None)
                .observed_uncommitted(outcome.uncommitted)
                .notes(statement.describe())
        });
        Ok(outcome.value)
    }

    /// Update `account`, recording `old` as the value this actor believes it replaces.
    pub(crate) fn write(&mut self, account: &str, old: Option<i64>, new: i64) -> StepResult<()> {
        let statement = Statement::update(account, new);
        let outcome = self.conn.execute(&statement)?;
        if outcome.rows_affected == 0 {
            return Err(StoreError::Statement(format!(
                "account {account} does not exist"
            )));
        }
        self.record(EventType::Write, |draft| {
            draft
                .record(ACCOUNTS_TABLE, account)
                .values(old, Some(new))
                .notes(statement.describe())
        });
        Ok(())
    }

    pub(crate) fn insert(&mut self, account: &str, balance: i64) -> StepResult<()> {
        let statement = Statement::insert(account, balance);
        self.conn.execute(&statement)?;
        self.record(EventType::Write, |draft| {
            draft
                .record(ACCOUNTS_TABLE, account)
                .values(None, Some(balance))
                .notes(statement.describe())
        });
        Ok(())
    }

    pub(crate) fn commit(&mut self) -> StepResult<()> {
        self.conn.commit()?;
        self.record(EventType::Commit, |draft| draft);
        self.status = Some(ActorStatus::Committed);
        debug!(run_id = %self.run_id, tx_name = self.name, "actor committed");
        Ok(())
    }

    pub(crate) fn rollback_scripted(&mut self, note: &str) -> StepResult<()> {
        self.conn.rollback()?;
        self.record(EventType::Rollback, |draft| {
            draft.failure(FailureReason::Scripted).notes(note)
        });
        self.status = Some(ActorStatus::RolledBack);
        self.failure = Some(FailureReason::Scripted);
        Ok(())
    }

    /// Roll back after the store refused a statement, recording why.
    fn abort(&mut self, err: &StoreError) {
        let reason = err.failure_reason();
        let note = match reason {
            FailureReason::Deadlock => format!("deadlock victim: {err}"),
            FailureReason::SerializationFailure => format!("serialization failure: {err}"),
            FailureReason::StatementError | FailureReason::Scripted => err.to_string(),
        };
        if let Err(rollback_err) = self.conn.rollback() {
            warn!(
                run_id = %self.run_id,
                tx_name = self.name,
                error = %rollback_err,
                "rollback failed"
            );
        }
        self.record(EventType::Rollback, |draft| draft.failure(reason).notes(note));
        if err.is_rollback_class() {
            warn!(
                run_id = %self.run_id,
                tx_name = self.name,
                failure = reason.as_str(),
                error = %err,
                "actor rolled back"
            );
        } else {
            error!(
                run_id = %self.run_id,
                tx_name = self.name,
                error = %err,
                "statement failed, actor abandoned its script"
            );
        }
        self.status = Some(ActorStatus::RolledBack);
        self.failure = Some(reason);
        self.error = Some(err.to_string());
    }

    fn into_report(self) -> ActorReport {
        ActorReport {
            outcome: ActorOutcome {
                tx_id: self.tx_id,
                tx_name: self.name.to_string(),
                isolation: self.isolation,
                status: self.status.unwrap_or(ActorStatus::RolledBack),
                failure: self.failure,
                error: self.error,
            },
            observed: self.observed,
        }
    }
}
