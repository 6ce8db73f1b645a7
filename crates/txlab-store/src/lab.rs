use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};
use txlab_domain::IsolationLevel;

use crate::{Connection, Statement, StatementOutcome, Store, StoreError};

type TxnId = u64;

/// In-process multi-version store with row locks.
///
/// Committed versions carry a commit timestamp; each row has at most one
/// pending (uncommitted) version, owned by the transaction holding the row
/// lock. Visibility follows the connection's isolation level, and a lock
/// request that would close a cycle in the wait-for graph fails with
/// [`StoreError::Deadlock`] for the requester.
#[derive(Clone, Default)]
pub struct LabStore {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LabStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("LabStore")
            .field("rows", &state.rows.len())
            .field("clock", &state.clock)
            .field("active", &state.active.len())
            .finish()
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<LabState>,
    released: Condvar,
}

#[derive(Default)]
struct LabState {
    rows: BTreeMap<String, Row>,
    /// Timestamp of the latest commit.
    clock: u64,
    next_txn: TxnId,
    /// Open transactions and their snapshot timestamps.
    active: BTreeMap<TxnId, u64>,
    locks: BTreeMap<String, TxnId>,
    waits_for: BTreeMap<TxnId, TxnId>,
    commit_log: Vec<CommitRecord>,
}

#[derive(Debug, Default)]
struct Row {
    versions: Vec<Version>,
    pending: Option<Pending>,
}

#[derive(Debug, Clone, Copy)]
struct Version {
    commit_ts: u64,
    balance: i64,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    txn: TxnId,
    balance: i64,
}

#[derive(Debug)]
struct CommitRecord {
    txn: TxnId,
    commit_ts: u64,
    written: BTreeSet<String>,
    inserted: bool,
}

#[derive(Debug)]
struct ActiveTxn {
    id: TxnId,
    snapshot_ts: u64,
    writes: BTreeMap<String, i64>,
    inserted: BTreeSet<String>,
    read_keys: BTreeSet<String>,
    scanned: bool,
    locks: BTreeSet<String>,
}

impl Row {
    fn committed_at(&self, ts: u64) -> Option<i64> {
        self.versions
            .iter()
            .rev()
            .find(|version| version.commit_ts <= ts)
            .map(|version| version.balance)
    }

    fn latest_commit_ts(&self) -> Option<u64> {
        self.versions.last().map(|version| version.commit_ts)
    }
}

impl LabState {
    fn begin(&mut self) -> ActiveTxn {
        self.next_txn += 1;
        let id = self.next_txn;
        self.active.insert(id, self.clock);
        ActiveTxn {
            id,
            snapshot_ts: self.clock,
            writes: BTreeMap::new(),
            inserted: BTreeSet::new(),
            read_keys: BTreeSet::new(),
            scanned: false,
            locks: BTreeSet::new(),
        }
    }

    fn visibility_bound(&self, txn: &ActiveTxn, isolation: IsolationLevel) -> u64 {
        match isolation {
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => txn.snapshot_ts,
            IsolationLevel::ReadUncommitted | IsolationLevel::ReadCommitted => self.clock,
        }
    }

    /// Value of `account` as seen by `txn`, and whether it is someone else's uncommitted write.
    fn read_row(
        &self,
        txn: &ActiveTxn,
        isolation: IsolationLevel,
        account: &str,
    ) -> (Option<i64>, bool) {
        let Some(row) = self.rows.get(account) else {
            return (None, false);
        };
        if let Some(pending) = row.pending {
            if pending.txn == txn.id {
                return (Some(pending.balance), false);
            }
            if isolation == IsolationLevel::ReadUncommitted {
                return (Some(pending.balance), true);
            }
        }
        (row.committed_at(self.visibility_bound(txn, isolation)), false)
    }

    fn would_deadlock(&self, requester: TxnId, holder: TxnId) -> bool {
        let mut current = holder;
        for _ in 0..=self.waits_for.len() {
            if current == requester {
                return true;
            }
            match self.waits_for.get(&current) {
                Some(next) => current = *next,
                None => return false,
            }
        }
        false
    }

    fn first_read_conflict(&self, txn: &ActiveTxn) -> Option<String> {
        self.commit_log
            .iter()
            .filter(|record| record.txn != txn.id && record.commit_ts > txn.snapshot_ts)
            .find_map(|record| {
                if let Some(key) = record.written.intersection(&txn.read_keys).next() {
                    return Some(format!(
                        "read of {key} was invalidated by transaction {}",
                        record.txn
                    ));
                }
                if txn.scanned && record.inserted {
                    return Some(format!(
                        "table scan was invalidated by an insert from transaction {}",
                        record.txn
                    ));
                }
                None
            })
    }

    fn finish(&mut self, txn: &ActiveTxn) {
        for key in &txn.locks {
            if self.locks.get(key) == Some(&txn.id) {
                self.locks.remove(key);
            }
        }
        self.waits_for.remove(&txn.id);
        self.active.remove(&txn.id);

        let horizon = self.active.values().copied().min().unwrap_or(self.clock);
        self.commit_log.retain(|record| record.commit_ts > horizon);
    }

    fn discard(&mut self, txn: &ActiveTxn) {
        for key in txn.writes.keys() {
            let remove_row = match self.rows.get_mut(key) {
                Some(row) => {
                    if row.pending.is_some_and(|pending| pending.txn == txn.id) {
                        row.pending = None;
                    }
                    row.versions.is_empty() && row.pending.is_none()
                }
                None => false,
            };
            if remove_row {
                self.rows.remove(key);
            }
        }
        self.finish(txn);
    }
}

impl LabStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for LabStore {
    fn reset(&self, accounts: &BTreeMap<String, i64>) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock();
        if !state.active.is_empty() {
            return Err(StoreError::Statement(format!(
                "cannot recreate accounts while {} transaction(s) are open",
                state.active.len()
            )));
        }
        state.clock += 1;
        let commit_ts = state.clock;
        state.rows = accounts
            .iter()
            .map(|(account, balance)| {
                (
                    account.clone(),
                    Row {
                        versions: vec![Version {
                            commit_ts,
                            balance: *balance,
                        }],
                        pending: None,
                    },
                )
            })
            .collect();
        state.locks.clear();
        state.waits_for.clear();
        state.commit_log.clear();
        debug!(accounts = accounts.len(), "accounts table recreated");
        Ok(())
    }

    fn connect(&self) -> Result<Box<dyn Connection>, StoreError> {
        Ok(Box::new(LabConnection {
            shared: Arc::clone(&self.shared),
            isolation: IsolationLevel::ReadCommitted,
            txn: None,
            aborted: None,
        }))
    }

    fn committed_balances(&self) -> BTreeMap<String, i64> {
        let state = self.shared.state.lock();
        state
            .rows
            .iter()
            .filter_map(|(account, row)| {
                row.committed_at(state.clock)
                    .map(|balance| (account.clone(), balance))
            })
            .collect()
    }
}

struct LabConnection {
    shared: Arc<Shared>,
    isolation: IsolationLevel,
    txn: Option<ActiveTxn>,
    aborted: Option<String>,
}

impl Connection for LabConnection {
    fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<(), StoreError> {
        if self.txn.is_some() {
            return Err(StoreError::Statement(
                "SET TRANSACTION ISOLATION LEVEL must be called before any query".to_string(),
            ));
        }
        self.isolation = level;
        Ok(())
    }

    fn execute(&mut self, statement: &Statement) -> Result<StatementOutcome, StoreError> {
        if let Some(reason) = &self.aborted {
            return Err(StoreError::TransactionAborted(reason.clone()));
        }

        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        let txn = self.txn.get_or_insert_with(|| state.begin());
        let result = run_statement(&shared, &mut state, txn, self.isolation, statement);
        if let Err(err) = &result {
            debug!(
                txn = txn.id,
                statement = %statement.describe(),
                error = %err,
                "statement failed"
            );
            self.aborted = Some(err.to_string());
        }
        result
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let Some(txn) = self.txn.take() else {
            return Ok(());
        };
        let mut state = self.shared.state.lock();

        if let Some(reason) = self.aborted.take() {
            state.discard(&txn);
            self.shared.released.notify_all();
            return Err(StoreError::TransactionAborted(reason));
        }

        if self.isolation == IsolationLevel::Serializable && !txn.writes.is_empty() {
            if let Some(conflict) = state.first_read_conflict(&txn) {
                state.discard(&txn);
                self.shared.released.notify_all();
                warn!(txn = txn.id, %conflict, "serializable validation failed at commit");
                return Err(StoreError::SerializationFailure(conflict));
            }
        }

        state.clock += 1;
        let commit_ts = state.clock;
        for (account, balance) in &txn.writes {
            let row = state.rows.entry(account.clone()).or_default();
            row.pending = None;
            row.versions.push(Version {
                commit_ts,
                balance: *balance,
            });
        }
        if !txn.writes.is_empty() {
            state.commit_log.push(CommitRecord {
                txn: txn.id,
                commit_ts,
                written: txn.writes.keys().cloned().collect(),
                inserted: !txn.inserted.is_empty(),
            });
        }
        state.finish(&txn);
        self.shared.released.notify_all();
        debug!(txn = txn.id, commit_ts, writes = txn.writes.len(), "transaction committed");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.aborted = None;
        let Some(txn) = self.txn.take() else {
            return Ok(());
        };
        let mut state = self.shared.state.lock();
        state.discard(&txn);
        self.shared.released.notify_all();
        debug!(txn = txn.id, "transaction rolled back");
        Ok(())
    }
}

impl Drop for LabConnection {
    fn drop(&mut self) {
        if self.txn.is_some() {
            let _ = self.rollback();
        }
    }
}

fn run_statement(
    shared: &Shared,
    state: &mut MutexGuard<'_, LabState>,
    txn: &mut ActiveTxn,
    isolation: IsolationLevel,
    statement: &Statement,
) -> Result<StatementOutcome, StoreError> {
    match statement {
        Statement::SelectBalance {
            account,
            for_update,
        } => {
            if *for_update && state.rows.contains_key(account) {
                acquire_row_lock(shared, state, txn, account)?;
                ensure_not_updated_since_snapshot(state, txn, isolation, account)?;
            }
            txn.read_keys.insert(account.clone());
            let (value, uncommitted) = state.read_row(txn, isolation, account);
            Ok(StatementOutcome {
                value,
                rows_affected: usize::from(value.is_some()),
                uncommitted,
            })
        }
        Statement::UpdateBalance { account, balance } => {
            if !state.rows.contains_key(account) {
                return Ok(StatementOutcome::default());
            }
            acquire_row_lock(shared, state, txn, account)?;
            ensure_not_updated_since_snapshot(state, txn, isolation, account)?;
            let row = state.rows.entry(account.clone()).or_default();
            row.pending = Some(Pending {
                txn: txn.id,
                balance: *balance,
            });
            txn.writes.insert(account.clone(), *balance);
            Ok(StatementOutcome {
                value: Some(*balance),
                rows_affected: 1,
                uncommitted: false,
            })
        }
        Statement::InsertAccount { account, balance } => {
            acquire_row_lock(shared, state, txn, account)?;
            if state
                .rows
                .get(account)
                .is_some_and(|row| !row.versions.is_empty())
            {
                return Err(StoreError::Statement(format!(
                    "duplicate key value violates unique constraint \"accounts_pkey\": {account}"
                )));
            }
            let row = state.rows.entry(account.clone()).or_default();
            row.pending = Some(Pending {
                txn: txn.id,
                balance: *balance,
            });
            txn.writes.insert(account.clone(), *balance);
            txn.inserted.insert(account.clone());
            Ok(StatementOutcome {
                value: Some(*balance),
                rows_affected: 1,
                uncommitted: false,
            })
        }
        Statement::CountAccounts => {
            txn.scanned = true;
            let mut count = 0_i64;
            let mut uncommitted = false;
            for account in state.rows.keys() {
                let (value, dirty) = state.read_row(txn, isolation, account);
                if value.is_some() {
                    count += 1;
                    uncommitted |= dirty;
                }
            }
            Ok(StatementOutcome {
                value: Some(count),
                rows_affected: 1,
                uncommitted,
            })
        }
        Statement::SumBalances { accounts } => {
            let mut total = 0_i64;
            let mut uncommitted = false;
            for account in accounts {
                txn.read_keys.insert(account.clone());
                let (value, dirty) = state.read_row(txn, isolation, account);
                total = total.checked_add(value.unwrap_or(0)).ok_or_else(|| {
                    StoreError::Statement("numeric value out of range".to_string())
                })?;
                uncommitted |= dirty;
            }
            Ok(StatementOutcome {
                value: Some(total),
                rows_affected: 1,
                uncommitted,
            })
        }
    }
}

/// Under snapshot isolation a row may only be written if nobody committed it after our snapshot.
fn ensure_not_updated_since_snapshot(
    state: &LabState,
    txn: &ActiveTxn,
    isolation: IsolationLevel,
    account: &str,
) -> Result<(), StoreError> {
    if !matches!(
        isolation,
        IsolationLevel::RepeatableRead | IsolationLevel::Serializable
    ) {
        return Ok(());
    }
    let latest = state.rows.get(account).and_then(Row::latest_commit_ts);
    if latest.is_some_and(|ts| ts > txn.snapshot_ts) {
        return Err(StoreError::SerializationFailure(format!(
            "concurrent update of {account} after transaction snapshot"
        )));
    }
    Ok(())
}

fn acquire_row_lock(
    shared: &Shared,
    state: &mut MutexGuard<'_, LabState>,
    txn: &mut ActiveTxn,
    account: &str,
) -> Result<(), StoreError> {
    loop {
        match state.locks.get(account).copied() {
            None => {
                state.locks.insert(account.to_string(), txn.id);
                state.waits_for.remove(&txn.id);
                txn.locks.insert(account.to_string());
                return Ok(());
            }
            Some(holder) if holder == txn.id => return Ok(()),
            Some(holder) => {
                if state.would_deadlock(txn.id, holder) {
                    state.waits_for.remove(&txn.id);
                    warn!(txn = txn.id, holder, account, "lock cycle detected");
                    return Err(StoreError::Deadlock(format!(
                        "transaction {} waiting for lock on {account} held by transaction {holder} \
                         would close a lock cycle",
                        txn.id
                    )));
                }
                state.waits_for.insert(txn.id, holder);
                debug!(txn = txn.id, holder, account, "waiting for row lock");
                shared.released.wait(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use txlab_domain::IsolationLevel;

    use super::LabStore;
    use crate::{Connection, Statement, Store, StoreError};

    fn must<T>(result: Result<T, StoreError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected store error: {err}"),
        }
    }

    fn seeded() -> LabStore {
        let store = LabStore::new();
        let accounts: BTreeMap<String, i64> = [("A".to_string(), 100), ("B".to_string(), 200)]
            .into_iter()
            .collect();
        must(store.reset(&accounts));
        store
    }

    fn open(store: &LabStore, level: IsolationLevel) -> Box<dyn Connection> {
        let mut conn = must(store.connect());
        must(conn.set_isolation_level(level));
        conn
    }

    fn read(conn: &mut Box<dyn Connection>, account: &str) -> Option<i64> {
        must(conn.execute(&Statement::select(account))).value
    }

    #[test]
    fn read_committed_sees_only_committed_versions() {
        let store = seeded();
        let mut writer = open(&store, IsolationLevel::ReadCommitted);
        let mut reader = open(&store, IsolationLevel::ReadCommitted);

        must(writer.execute(&Statement::update("A", 50)));
        let outcome = must(reader.execute(&Statement::select("A")));
        assert_eq!(outcome.value, Some(100));
        assert!(!outcome.uncommitted);

        must(writer.commit());
        assert_eq!(read(&mut reader, "A"), Some(50));
        must(reader.commit());
    }

    #[test]
    fn read_uncommitted_observes_pending_write() {
        let store = seeded();
        let mut writer = open(&store, IsolationLevel::ReadUncommitted);
        let mut reader = open(&store, IsolationLevel::ReadUncommitted);

        must(writer.execute(&Statement::update("A", 50)));
        let outcome = must(reader.execute(&Statement::select("A")));
        assert_eq!(outcome.value, Some(50));
        assert!(outcome.uncommitted);

        must(writer.rollback());
        assert_eq!(read(&mut reader, "A"), Some(100));
        must(reader.commit());
        assert_eq!(store.committed_balances().get("A"), Some(&100));
    }

    #[test]
    fn repeatable_read_keeps_its_snapshot() {
        let store = seeded();
        let mut reader = open(&store, IsolationLevel::RepeatableRead);
        let mut writer = open(&store, IsolationLevel::ReadCommitted);

        assert_eq!(read(&mut reader, "A"), Some(100));
        must(writer.execute(&Statement::update("A", -20)));
        must(writer.commit());
        assert_eq!(read(&mut reader, "A"), Some(100));
        must(reader.commit());
        assert_eq!(read(&mut reader, "A"), Some(-20));
    }

    #[test]
    fn repeatable_read_rejects_second_writer() {
        let store = seeded();
        let mut first = open(&store, IsolationLevel::RepeatableRead);
        let mut second = open(&store, IsolationLevel::RepeatableRead);

        assert_eq!(read(&mut first, "A"), Some(100));
        assert_eq!(read(&mut second, "A"), Some(100));
        must(first.execute(&Statement::update("A", 50)));
        must(first.commit());

        let err = second.execute(&Statement::update("A", -20));
        assert!(matches!(err, Err(StoreError::SerializationFailure(_))));
        assert!(matches!(
            second.execute(&Statement::select("A")),
            Err(StoreError::TransactionAborted(_))
        ));
        must(second.rollback());
        assert_eq!(store.committed_balances().get("A"), Some(&50));
    }

    #[test]
    fn read_committed_lets_last_writer_win() {
        let store = seeded();
        let mut first = open(&store, IsolationLevel::ReadCommitted);
        let mut second = open(&store, IsolationLevel::ReadCommitted);

        assert_eq!(read(&mut first, "A"), Some(100));
        assert_eq!(read(&mut second, "A"), Some(100));
        must(first.execute(&Statement::update("A", 50)));
        must(first.commit());
        must(second.execute(&Statement::update("A", -20)));
        must(second.commit());
        assert_eq!(store.committed_balances().get("A"), Some(&-20));
    }

    #[test]
    fn crossing_lock_requests_pick_exactly_one_victim() {
        let store = seeded();
        let mut first = open(&store, IsolationLevel::ReadCommitted);
        let mut second = open(&store, IsolationLevel::ReadCommitted);
        must(first.execute(&Statement::select_for_update("A")));
        must(second.execute(&Statement::select_for_update("B")));

        let outcomes: Vec<Result<(), StoreError>> = std::thread::scope(|scope| {
            let handles = [
                scope.spawn(move || {
                    let result = first.execute(&Statement::select_for_update("B")).map(|_| ());
                    finish(&mut first, &result);
                    result
                }),
                scope.spawn(move || {
                    let result = second.execute(&Statement::select_for_update("A")).map(|_| ());
                    finish(&mut second, &result);
                    result
                }),
            ];
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(_) => panic!("lock thread panicked"),
                })
                .collect()
        });

        let victims = outcomes
            .iter()
            .filter(|result| matches!(result, Err(StoreError::Deadlock(_))))
            .count();
        let winners = outcomes.iter().filter(|result| result.is_ok()).count();
        assert_eq!(victims, 1);
        assert_eq!(winners, 1);
    }

    fn finish(conn: &mut Box<dyn Connection>, result: &Result<(), StoreError>) {
        if result.is_ok() {
            must(conn.commit());
        } else {
            must(conn.rollback());
        }
    }

    #[test]
    fn serializable_rejects_write_skew() {
        let store = seeded();
        let mut first = open(&store, IsolationLevel::Serializable);
        let mut second = open(&store, IsolationLevel::Serializable);

        let sum = Statement::sum(&["A", "B"]);
        assert_eq!(must(first.execute(&sum)).value, Some(300));
        assert_eq!(must(second.execute(&sum)).value, Some(300));
        must(first.execute(&Statement::update("A", 50)));
        must(second.execute(&Statement::update("B", -20)));
        must(first.commit());
        assert!(matches!(
            second.commit(),
            Err(StoreError::SerializationFailure(_))
        ));
        let balances = store.committed_balances();
        assert_eq!(balances.get("A"), Some(&50));
        assert_eq!(balances.get("B"), Some(&200));
    }

    #[test]
    fn repeatable_read_allows_write_skew() {
        let store = seeded();
        let mut first = open(&store, IsolationLevel::RepeatableRead);
        let mut second = open(&store, IsolationLevel::RepeatableRead);

        let sum = Statement::sum(&["A", "B"]);
        must(first.execute(&sum));
        must(second.execute(&sum));
        must(first.execute(&Statement::update("A", 50)));
        must(second.execute(&Statement::update("B", -20)));
        must(first.commit());
        must(second.commit());
        assert_eq!(
            must(first.execute(&sum)).value,
            Some(30),
            "both disjoint writes survive"
        );
    }

    #[test]
    fn counts_reflect_isolation() {
        let store = seeded();
        let mut committed_reader = open(&store, IsolationLevel::ReadCommitted);
        let mut snapshot_reader = open(&store, IsolationLevel::RepeatableRead);
        let mut inserter = open(&store, IsolationLevel::ReadCommitted);

        let count = Statement::CountAccounts;
        assert_eq!(must(committed_reader.execute(&count)).value, Some(2));
        assert_eq!(must(snapshot_reader.execute(&count)).value, Some(2));
        must(inserter.execute(&Statement::insert("D", -20)));
        assert_eq!(must(committed_reader.execute(&count)).value, Some(2));
        must(inserter.commit());

        assert_eq!(must(committed_reader.execute(&count)).value, Some(3));
        assert_eq!(must(snapshot_reader.execute(&count)).value, Some(2));
    }

    #[test]
    fn duplicate_insert_is_a_statement_error() {
        let store = seeded();
        let mut conn = open(&store, IsolationLevel::ReadCommitted);
        assert!(matches!(
            conn.execute(&Statement::insert("A", 1)),
            Err(StoreError::Statement(_))
        ));
        must(conn.rollback());
    }

    #[test]
    fn overflowing_sum_is_a_statement_error() {
        let store = LabStore::new();
        let accounts: BTreeMap<String, i64> = [("A".to_string(), i64::MAX), ("B".to_string(), 1)]
            .into_iter()
            .collect();
        must(store.reset(&accounts));
        let mut conn = open(&store, IsolationLevel::Serializable);
        assert!(matches!(
            conn.execute(&Statement::sum(&["A", "B"])),
            Err(StoreError::Statement(message)) if message.contains("out of range")
        ));
        assert!(matches!(
            conn.execute(&Statement::select("A")),
            Err(StoreError::TransactionAborted(_))
        ));
        must(conn.rollback());
    }

    #[test]
    fn dropped_connection_releases_locks() {
        let store = seeded();
        {
            let mut doomed = open(&store, IsolationLevel::ReadCommitted);
            must(doomed.execute(&Statement::update("A", 1)));
        }
        let mut conn = open(&store, IsolationLevel::ReadCommitted);
        assert_eq!(must(conn.execute(&Statement::update("A", 2))).rows_affected, 1);
        must(conn.commit());
        assert_eq!(store.committed_balances().get("A"), Some(&2));
    }

    #[test]
    fn reset_refuses_open_transactions() {
        let store = seeded();
        let mut conn = open(&store, IsolationLevel::ReadCommitted);
        must(conn.execute(&Statement::select("A")));
        assert!(store.reset(&BTreeMap::new()).is_err());
        must(conn.commit());
        assert!(store.reset(&BTreeMap::new()).is_ok());
        assert!(store.committed_balances().is_empty());
    }

    #[test]
    fn isolation_cannot_change_mid_transaction() {
        let store = seeded();
        let mut conn = open(&store, IsolationLevel::ReadCommitted);
        must(conn.execute(&Statement::select("A")));
        assert!(conn
            .set_isolation_level(IsolationLevel::Serializable)
            .is_err());
    }
}
