// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Ledger Storage
//!
//! Durable, transactional record of accounts, postings and operations.
//!
//! The [`LedgerStore`] contract is synchronous: implementations wrap an ACID
//! engine whose write transactions either commit completely or not at all.
//! Async callers go through [`StoreHandle`], which moves every call onto the
//! blocking pool and bounds it with a timeout.
//!
//! ## Logical Layout
//!
//! ```text
//! accounts(id, owner, currency, balance, version, overdraft, status)
//! postings(account_id, version, operation_id, delta, resulting_balance, created_at)
//! operation_postings(operation_id, account_id) -> posting key
//! operations(key, operation_id, kind, status, outcome, claim_token, created_at)
//! archived_operations(key, ...)
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::ledger::{
    Account, AccountId, AccountRef, OperationKey, OperationRecord, Outcome, Posting, Version,
};

pub mod redb_store;

pub use redb_store::RedbLedgerStore;

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("cannot prepare {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("version conflict on account {account_id}: expected {expected}, found {actual}")]
    VersionConflict {
        account_id: AccountId,
        expected: Version,
        actual: Version,
    },

    #[error("insufficient funds in account {0}")]
    InsufficientFunds(AccountId),

    #[error("unknown account {0}")]
    UnknownAccount(AccountId),

    #[error("account {0} is inactive")]
    AccountInactive(AccountId),

    #[error("balance overflow on account {0}")]
    BalanceOverflow(AccountId),

    #[error("claim on operation {0} is no longer held")]
    ClaimLost(String),

    #[error("operation {0} is already completed")]
    AlreadyCompleted(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage call timed out")]
    Timeout,

    #[error("storage worker failed: {0}")]
    Worker(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// Contract Types
// =============================================================================

/// One account leg of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingEntry {
    pub account: AccountRef,
    /// Version the account must still have at commit time. `0` together with
    /// `create_if_missing` also accepts an account that does not exist yet.
    pub expected_version: Version,
    pub delta: i64,
    pub create_if_missing: bool,
}

/// Everything [`LedgerStore::append_postings`] writes in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingCommit {
    pub key: OperationKey,
    /// The claim under which the operation row was admitted.
    pub claim_token: Uuid,
    pub operation_id: Uuid,
    pub entries: Vec<PostingEntry>,
    pub committed_at: DateTime<Utc>,
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub postings: Vec<Posting>,
    /// Account rows as written by the commit.
    pub accounts: Vec<Account>,
    /// The operation row, now terminal with an applied outcome.
    pub operation: OperationRecord,
}

/// Result of trying to admit an operation row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the row and may execute the operation.
    Claimed {
        record: OperationRecord,
        /// A stale pending row was taken over.
        reclaimed: bool,
    },
    /// A row already exists (pending elsewhere, or terminal).
    Existing(OperationRecord),
}

/// Balance vs. posting log comparison for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub account: Account,
    pub postings_sum: i64,
    pub posting_count: u64,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.account.balance == self.postings_sum && self.account.version == self.posting_count
    }
}

// =============================================================================
// LedgerStore
// =============================================================================

/// Transactional storage of the ledger.
///
/// Every mutating method runs in its own storage transaction and leaves no
/// partial state behind on error.
pub trait LedgerStore: Send + Sync + 'static {
    /// Read a single account.
    fn read_account(&self, id: &AccountId) -> StoreResult<Option<Account>>;

    /// Read several accounts from one consistent snapshot.
    fn read_accounts(&self, ids: &[AccountId]) -> StoreResult<Vec<Option<Account>>>;

    /// Create an account, or return the existing one unchanged.
    fn open_account(&self, account_ref: &AccountRef, overdraft: bool) -> StoreResult<Account>;

    fn set_overdraft(&self, id: &AccountId, overdraft: bool) -> StoreResult<Account>;

    fn deactivate_account(&self, id: &AccountId) -> StoreResult<Account>;

    /// Write postings for an operation and mark it applied.
    ///
    /// Fails with [`StoreError::VersionConflict`] when any expected version
    /// is stale, [`StoreError::InsufficientFunds`] when a non-overdraft
    /// balance would go negative, [`StoreError::ClaimLost`] when the claim
    /// token no longer matches the operation row. On success each affected
    /// account's version is incremented exactly once.
    fn append_postings(&self, commit: &PostingCommit) -> StoreResult<CommitResult>;

    /// Postings of an account, newest first. With `before`, only postings
    /// whose version is lower than it.
    fn postings_for_account(
        &self,
        id: &AccountId,
        before: Option<Version>,
        limit: usize,
    ) -> StoreResult<Vec<Posting>>;

    fn postings_for_operation(&self, operation_id: &Uuid) -> StoreResult<Vec<Posting>>;

    fn reconcile_account(&self, id: &AccountId) -> StoreResult<Reconciliation>;

    /// Insert `candidate` as a pending row unless the key exists. A pending
    /// row claimed before `stale_before` with the same fingerprint is taken
    /// over with the candidate's claim token.
    fn claim_operation(
        &self,
        candidate: &OperationRecord,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome>;

    /// Look up an operation, including archived ones.
    fn get_operation(&self, key: &OperationKey) -> StoreResult<Option<OperationRecord>>;

    /// Transition `pending -> terminal`. Completing a terminal row fails with
    /// [`StoreError::AlreadyCompleted`].
    fn complete_operation(
        &self,
        key: &OperationKey,
        claim_token: Uuid,
        outcome: &Outcome,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<OperationRecord>;

    /// Move up to `limit` terminal operations completed before `cutoff` to
    /// the archive. Returns how many rows moved.
    fn archive_operations(&self, cutoff: DateTime<Utc>, limit: usize) -> StoreResult<usize>;
}

// =============================================================================
// StoreHandle
// =============================================================================

/// Async access to a [`LedgerStore`] with a bounded wait per call.
///
/// A call that exceeds the timeout reports [`StoreError::Timeout`]; the
/// underlying transaction may still finish, which is safe because every
/// write is guarded by an operation claim or is idempotent.
pub struct StoreHandle<S> {
    store: Arc<S>,
    timeout: Duration,
}

impl<S> Clone for StoreHandle<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            timeout: self.timeout,
        }
    }
}

impl<S: LedgerStore> StoreHandle<S> {
    pub fn new(store: Arc<S>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run `f` against the store on the blocking pool.
    pub async fn call<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> StoreResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || f(&store));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StoreError::Worker(join_err.to_string())),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::AccountRef;

    fn temp_handle(timeout: Duration) -> (StoreHandle<RedbLedgerStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbLedgerStore::open(&dir.path().join("ledger.redb")).unwrap();
        (StoreHandle::new(Arc::new(store), timeout), dir)
    }

    #[tokio::test]
    async fn handle_runs_calls_on_blocking_pool() {
        let (handle, _dir) = temp_handle(Duration::from_secs(5));
        let account_ref = AccountRef::new("alice", "FXY");
        let opened = handle
            .call(move |s| s.open_account(&account_ref, false))
            .await
            .unwrap();
        assert_eq!(opened.balance, 0);

        let id = opened.id;
        let read = handle.call(move |s| s.read_account(&id)).await.unwrap();
        assert_eq!(read, Some(opened));
    }

    #[tokio::test]
    async fn handle_times_out_slow_calls() {
        let (handle, _dir) = temp_handle(Duration::from_millis(10));
        let result: StoreResult<()> = handle
            .call(|_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Timeout)));
    }

    #[test]
    fn reconciliation_consistency() {
        let mut account = Account::open(&AccountRef::new("alice", "FXY"), false, Utc::now());
        account.balance = 30;
        account.version = 2;
        let ok = Reconciliation {
            account: account.clone(),
            postings_sum: 30,
            posting_count: 2,
        };
        assert!(ok.is_consistent());
        let drifted = Reconciliation {
            account,
            postings_sum: 25,
            posting_count: 2,
        };
        assert!(!drifted.is_consistent());
    }
}
