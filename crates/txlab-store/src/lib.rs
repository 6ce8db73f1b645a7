#![forbid(unsafe_code)]

//! Transactional store adapter used by the scenario orchestrator.
//!
//! The orchestrator only sees [`Store`] and [`Connection`]. A connection runs
//! one transaction at a time; the first statement after `commit`/`rollback`
//! implicitly begins the next one.

use std::collections::BTreeMap;

use txlab_domain::{FailureReason, IsolationLevel};

mod lab;

pub use lab::LabStore;

pub const ACCOUNTS_TABLE: &str = "accounts";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("deadlock detected: {0}")]
    Deadlock(String),
    #[error("could not serialize access: {0}")]
    SerializationFailure(String),
    #[error("statement failed: {0}")]
    Statement(String),
    #[error("current transaction is aborted, commands ignored until end of transaction block: {0}")]
    TransactionAborted(String),
}

impl StoreError {
    /// Failures the store raises to break a conflict; the transaction must roll back
    /// but a retry could succeed.
    #[must_use]
    pub const fn is_rollback_class(&self) -> bool {
        matches!(self, Self::Deadlock(_) | Self::SerializationFailure(_))
    }

    #[must_use]
    pub const fn failure_reason(&self) -> FailureReason {
        match self {
            Self::Deadlock(_) => FailureReason::Deadlock,
            Self::SerializationFailure(_) => FailureReason::SerializationFailure,
            Self::Statement(_) | Self::TransactionAborted(_) => FailureReason::StatementError,
        }
    }
}

/// Statements over the `accounts(account_id, balance)` table.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Statement {
    SelectBalance { account: String, for_update: bool },
    UpdateBalance { account: String, balance: i64 },
    InsertAccount { account: String, balance: i64 },
    CountAccounts,
    SumBalances { accounts: Vec<String> },
}

impl Statement {
    #[must_use]
    pub fn select(account: &str) -> Self {
        Self::SelectBalance {
            account: account.to_string(),
            for_update: false,
        }
    }

    #[must_use]
    pub fn select_for_update(account: &str) -> Self {
        Self::SelectBalance {
            account: account.to_string(),
            for_update: true,
        }
    }

    #[must_use]
    pub fn update(account: &str, balance: i64) -> Self {
        Self::UpdateBalance {
            account: account.to_string(),
            balance,
        }
    }

    #[must_use]
    pub fn insert(account: &str, balance: i64) -> Self {
        Self::InsertAccount {
            account: account.to_string(),
            balance,
        }
    }

    #[must_use]
    pub fn sum(accounts: &[&str]) -> Self {
        Self::SumBalances {
            accounts: accounts.iter().map(ToString::to_string).collect(),
        }
    }

    /// SQL rendering for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::SelectBalance {
                account,
                for_update,
            } => {
                let suffix = if *for_update { " FOR UPDATE" } else { "" };
                format!(
                    "SELECT balance FROM {ACCOUNTS_TABLE} WHERE account_id = '{account}'{suffix}"
                )
            }
            Self::UpdateBalance { account, balance } => format!(
                "UPDATE {ACCOUNTS_TABLE} SET balance = {balance} WHERE account_id = '{account}'"
            ),
            Self::InsertAccount { account, balance } => format!(
                "INSERT INTO {ACCOUNTS_TABLE} (account_id, balance) VALUES ('{account}', {balance})"
            ),
            Self::CountAccounts => format!("SELECT COUNT(*) FROM {ACCOUNTS_TABLE}"),
            Self::SumBalances { accounts } => {
                let keys: Vec<String> = accounts.iter().map(|key| format!("'{key}'")).collect();
                format!(
                    "SELECT SUM(balance) FROM {ACCOUNTS_TABLE} WHERE account_id IN ({})",
                    keys.join(", ")
                )
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct StatementOutcome {
    /// Balance, count or sum; `None` when a single-row select matched nothing.
    pub value: Option<i64>,
    pub rows_affected: usize,
    /// The value includes a version written by a transaction that has not committed.
    pub uncommitted: bool,
}

pub trait Store: Send + Sync {
    /// Drop and recreate the accounts table with the given rows.
    ///
    /// # Errors
    /// Fails while any transaction is still open.
    fn reset(&self, accounts: &BTreeMap<String, i64>) -> Result<(), StoreError>;

    /// Open a new connection at READ COMMITTED.
    ///
    /// # Errors
    /// Adapter specific.
    fn connect(&self) -> Result<Box<dyn Connection>, StoreError>;

    /// Latest committed balance of every account.
    fn committed_balances(&self) -> BTreeMap<String, i64>;
}

pub trait Connection: Send {
    /// # Errors
    /// Fails when a transaction is already in progress on this connection.
    fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<(), StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn execute(&mut self, statement: &Statement) -> Result<StatementOutcome, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn commit(&mut self) -> Result<(), StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn rollback(&mut self) -> Result<(), StoreError>;
}
