// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ledger store backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `accounts`: account_id (16 bytes) → serialized Account
//! - `postings`: composite key (account_id|version_be) → serialized Posting
//! - `operation_postings`: composite key (operation_id|account_id) → posting key
//! - `operations`: scoped idempotency key → serialized OperationRecord
//! - `archived_operations`: same shape as `operations`, terminal rows only
//!
//! redb admits one write transaction at a time, but reads used to compute a
//! commit happen in earlier snapshots, so every commit re-checks the account
//! versions it was computed against.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use uuid::Uuid;

use super::{
    ClaimOutcome, CommitResult, LedgerStore, PostingCommit, Reconciliation, StoreError,
    StoreResult,
};
use crate::ledger::{
    Account, AccountId, AccountRef, AccountStatus, OperationKey, OperationRecord,
    OperationStatus, Outcome, Posting, Version,
};

// =============================================================================
// Table Definitions
// =============================================================================

/// Primary table: account_id → serialized Account (JSON bytes).
const ACCOUNTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("accounts");

/// Append-only posting log. Key format: `account_id | version_be` so a range
/// scan over one account yields its postings in version order.
const POSTINGS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("postings");

/// Index: `operation_id | account_id` → posting key.
const OPERATION_POSTINGS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("operation_postings");

/// Idempotency rows: scoped key → serialized OperationRecord.
const OPERATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("operations");

/// Terminal idempotency rows moved out of the hot table by the reaper.
const ARCHIVED_OPERATIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("archived_operations");

// =============================================================================
// Key Helpers
// =============================================================================

fn posting_key(account_id: &AccountId, version: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(account_id.as_bytes());
    key[16..].copy_from_slice(&version.to_be_bytes());
    key
}

fn operation_posting_key(operation_id: &Uuid, account_id: &AccountId) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(operation_id.as_bytes());
    key[16..].copy_from_slice(account_id.as_bytes());
    key
}

fn load_account(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    id: &AccountId,
) -> StoreResult<Option<Account>> {
    match table.get(id.as_bytes().as_slice())? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

fn load_operation(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &OperationKey,
) -> StoreResult<Option<OperationRecord>> {
    match table.get(key.as_str())? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

// =============================================================================
// RedbLedgerStore
// =============================================================================

/// Embedded ACID ledger store.
pub struct RedbLedgerStore {
    db: Database,
}

impl RedbLedgerStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        let db = Database::create(path)?;

        // Read transactions fail on tables that were never created.
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ACCOUNTS)?;
            let _ = write_txn.open_table(POSTINGS)?;
            let _ = write_txn.open_table(OPERATION_POSTINGS)?;
            let _ = write_txn.open_table(OPERATIONS)?;
            let _ = write_txn.open_table(ARCHIVED_OPERATIONS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Apply `mutate` to an existing account in its own write transaction.
    fn update_account(
        &self,
        id: &AccountId,
        mutate: impl FnOnce(&mut Account),
    ) -> StoreResult<Account> {
        let write_txn = self.db.begin_write()?;
        let account = {
            let mut table = write_txn.open_table(ACCOUNTS)?;
            let mut account = load_account(&table, id)?
                .ok_or_else(|| StoreError::NotFound(format!("account {id}")))?;
            mutate(&mut account);
            account.updated_at = Utc::now();
            let json = serde_json::to_vec(&account)?;
            table.insert(id.as_bytes().as_slice(), json.as_slice())?;
            account
        };
        write_txn.commit()?;
        Ok(account)
    }
}

impl LedgerStore for RedbLedgerStore {
    // =========================================================================
    // Accounts
    // =========================================================================

    fn read_account(&self, id: &AccountId) -> StoreResult<Option<Account>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS)?;
        load_account(&table, id)
    }

    fn read_accounts(&self, ids: &[AccountId]) -> StoreResult<Vec<Option<Account>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS)?;
        ids.iter().map(|id| load_account(&table, id)).collect()
    }

    fn open_account(&self, account_ref: &AccountRef, overdraft: bool) -> StoreResult<Account> {
        let id = account_ref.id();
        let write_txn = self.db.begin_write()?;
        let account = {
            let mut table = write_txn.open_table(ACCOUNTS)?;
            if let Some(existing) = load_account(&table, &id)? {
                return Ok(existing);
            }
            let account = Account::open(account_ref, overdraft, Utc::now());
            let json = serde_json::to_vec(&account)?;
            table.insert(id.as_bytes().as_slice(), json.as_slice())?;
            account
        };
        write_txn.commit()?;
        Ok(account)
    }

    fn set_overdraft(&self, id: &AccountId, overdraft: bool) -> StoreResult<Account> {
        self.update_account(id, |account| account.overdraft = overdraft)
    }

    fn deactivate_account(&self, id: &AccountId) -> StoreResult<Account> {
        self.update_account(id, |account| account.status = AccountStatus::Inactive)
    }

    // =========================================================================
    // Postings
    // =========================================================================

    fn append_postings(&self, commit: &PostingCommit) -> StoreResult<CommitResult> {
        let key = commit.key.as_str().to_string();

        // Any early return drops `write_txn` uncommitted, which aborts it.
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut operations = write_txn.open_table(OPERATIONS)?;
            let mut operation = load_operation(&operations, &commit.key)?
                .ok_or_else(|| StoreError::NotFound(format!("operation {key}")))?;
            if operation.is_terminal() {
                return Err(StoreError::AlreadyCompleted(key));
            }
            if operation.claim_token != commit.claim_token {
                return Err(StoreError::ClaimLost(key));
            }

            let mut accounts_table = write_txn.open_table(ACCOUNTS)?;
            let mut postings_table = write_txn.open_table(POSTINGS)?;
            let mut index_table = write_txn.open_table(OPERATION_POSTINGS)?;

            let mut postings = Vec::with_capacity(commit.entries.len());
            let mut accounts = Vec::with_capacity(commit.entries.len());

            for entry in &commit.entries {
                let id = entry.account.id();
                let mut account = match load_account(&accounts_table, &id)? {
                    Some(existing) => {
                        if existing.version != entry.expected_version {
                            return Err(StoreError::VersionConflict {
                                account_id: id,
                                expected: entry.expected_version,
                                actual: existing.version,
                            });
                        }
                        existing
                    }
                    None if entry.create_if_missing && entry.expected_version == 0 => {
                        Account::open(&entry.account, false, commit.committed_at)
                    }
                    None => return Err(StoreError::UnknownAccount(id)),
                };

                if !account.is_active() {
                    return Err(StoreError::AccountInactive(id));
                }

                let balance = account
                    .balance
                    .checked_add(entry.delta)
                    .ok_or(StoreError::BalanceOverflow(id))?;
                if !account.permits(balance) {
                    return Err(StoreError::InsufficientFunds(id));
                }

                account.balance = balance;
                account.version += 1;
                account.updated_at = commit.committed_at;

                let posting = Posting {
                    operation_id: commit.operation_id,
                    account_id: id,
                    delta: entry.delta,
                    resulting_balance: balance,
                    version: account.version,
                    created_at: commit.committed_at,
                };

                let pkey = posting_key(&id, account.version);
                let posting_json = serde_json::to_vec(&posting)?;
                postings_table.insert(pkey.as_slice(), posting_json.as_slice())?;

                let ikey = operation_posting_key(&commit.operation_id, &id);
                index_table.insert(ikey.as_slice(), pkey.as_slice())?;

                let account_json = serde_json::to_vec(&account)?;
                accounts_table.insert(id.as_bytes().as_slice(), account_json.as_slice())?;

                postings.push(posting);
                accounts.push(account);
            }

            operation.status = OperationStatus::Completed;
            operation.outcome = Some(Outcome::Applied {
                postings: postings.clone(),
                committed_at: commit.committed_at,
            });
            operation.completed_at = Some(commit.committed_at);
            let operation_json = serde_json::to_vec(&operation)?;
            operations.insert(key.as_str(), operation_json.as_slice())?;

            CommitResult {
                postings,
                accounts,
                operation,
            }
        };
        write_txn.commit()?;
        Ok(result)
    }

    fn postings_for_account(
        &self,
        id: &AccountId,
        before: Option<Version>,
        limit: usize,
    ) -> StoreResult<Vec<Posting>> {
        let last = match before {
            Some(0) => return Ok(Vec::new()),
            Some(version) => version - 1,
            None => u64::MAX,
        };
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(POSTINGS)?;

        let start = posting_key(id, 0);
        let end = posting_key(id, last);

        let mut postings = Vec::with_capacity(limit.min(256));
        for entry in table.range(start.as_slice()..=end.as_slice())?.rev() {
            if postings.len() >= limit {
                break;
            }
            let (_, value) = entry?;
            postings.push(serde_json::from_slice(value.value())?);
        }
        Ok(postings)
    }

    fn postings_for_operation(&self, operation_id: &Uuid) -> StoreResult<Vec<Posting>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(OPERATION_POSTINGS)?;
        let postings_table = read_txn.open_table(POSTINGS)?;

        let mut start = [0u8; 32];
        start[..16].copy_from_slice(operation_id.as_bytes());
        let mut end = [0xFFu8; 32];
        end[..16].copy_from_slice(operation_id.as_bytes());

        let mut postings = Vec::new();
        for entry in index.range(start.as_slice()..=end.as_slice())? {
            let (_, pkey) = entry?;
            if let Some(value) = postings_table.get(pkey.value())? {
                postings.push(serde_json::from_slice(value.value())?);
            }
        }
        Ok(postings)
    }

    fn reconcile_account(&self, id: &AccountId) -> StoreResult<Reconciliation> {
        let read_txn = self.db.begin_read()?;
        let accounts = read_txn.open_table(ACCOUNTS)?;
        let postings = read_txn.open_table(POSTINGS)?;

        let account = load_account(&accounts, id)?
            .ok_or_else(|| StoreError::NotFound(format!("account {id}")))?;

        let start = posting_key(id, 0);
        let end = posting_key(id, u64::MAX);
        let mut postings_sum: i64 = 0;
        let mut posting_count: u64 = 0;
        for entry in postings.range(start.as_slice()..=end.as_slice())? {
            let (_, value) = entry?;
            let posting: Posting = serde_json::from_slice(value.value())?;
            postings_sum = postings_sum
                .checked_add(posting.delta)
                .ok_or(StoreError::BalanceOverflow(*id))?;
            posting_count += 1;
        }

        Ok(Reconciliation {
            account,
            postings_sum,
            posting_count,
        })
    }

    // =========================================================================
    // Operations
    // =========================================================================

    fn claim_operation(
        &self,
        candidate: &OperationRecord,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut operations = write_txn.open_table(OPERATIONS)?;
            match load_operation(&operations, &candidate.key)? {
                Some(mut existing) => {
                    let stale = existing.status == OperationStatus::Pending
                        && existing.claimed_at < stale_before
                        && existing.fingerprint == candidate.fingerprint;
                    if !stale {
                        return Ok(ClaimOutcome::Existing(existing));
                    }
                    existing.claim_token = candidate.claim_token;
                    existing.claimed_at = candidate.claimed_at;
                    let json = serde_json::to_vec(&existing)?;
                    operations.insert(candidate.key.as_str(), json.as_slice())?;
                    ClaimOutcome::Claimed {
                        record: existing,
                        reclaimed: true,
                    }
                }
                None => {
                    let archived = write_txn.open_table(ARCHIVED_OPERATIONS)?;
                    if let Some(existing) = load_operation(&archived, &candidate.key)? {
                        return Ok(ClaimOutcome::Existing(existing));
                    }
                    let json = serde_json::to_vec(candidate)?;
                    operations.insert(candidate.key.as_str(), json.as_slice())?;
                    ClaimOutcome::Claimed {
                        record: candidate.clone(),
                        reclaimed: false,
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    fn get_operation(&self, key: &OperationKey) -> StoreResult<Option<OperationRecord>> {
        let read_txn = self.db.begin_read()?;
        let operations = read_txn.open_table(OPERATIONS)?;
        if let Some(record) = load_operation(&operations, key)? {
            return Ok(Some(record));
        }
        let archived = read_txn.open_table(ARCHIVED_OPERATIONS)?;
        load_operation(&archived, key)
    }

    fn complete_operation(
        &self,
        key: &OperationKey,
        claim_token: Uuid,
        outcome: &Outcome,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<OperationRecord> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut operations = write_txn.open_table(OPERATIONS)?;
            let mut record = match load_operation(&operations, key)? {
                Some(record) => record,
                None => {
                    let archived = write_txn.open_table(ARCHIVED_OPERATIONS)?;
                    return match load_operation(&archived, key)? {
                        Some(_) => Err(StoreError::AlreadyCompleted(key.to_string())),
                        None => Err(StoreError::NotFound(format!("operation {key}"))),
                    };
                }
            };
            if record.is_terminal() {
                return Err(StoreError::AlreadyCompleted(key.to_string()));
            }
            if record.claim_token != claim_token {
                return Err(StoreError::ClaimLost(key.to_string()));
            }

            record.status = OperationStatus::Completed;
            record.outcome = Some(outcome.clone());
            record.completed_at = Some(completed_at);
            let json = serde_json::to_vec(&record)?;
            operations.insert(key.as_str(), json.as_slice())?;
            record
        };
        write_txn.commit()?;
        Ok(record)
    }

    fn archive_operations(&self, cutoff: DateTime<Utc>, limit: usize) -> StoreResult<usize> {
        let write_txn = self.db.begin_write()?;
        let moved = {
            let mut operations = write_txn.open_table(OPERATIONS)?;
            let mut archived = write_txn.open_table(ARCHIVED_OPERATIONS)?;

            // Collect first; the table cannot be mutated while iterating.
            let mut candidates: Vec<(String, Vec<u8>)> = Vec::new();
            for entry in operations.iter()? {
                if candidates.len() >= limit {
                    break;
                }
                let (key, value) = entry?;
                let record: OperationRecord = serde_json::from_slice(value.value())?;
                let expired = record
                    .completed_at
                    .map(|at| record.is_terminal() && at < cutoff)
                    .unwrap_or(false);
                if expired {
                    candidates.push((key.value().to_string(), value.value().to_vec()));
                }
            }

            for (key, value) in &candidates {
                archived.insert(key.as_str(), value.as_slice())?;
                operations.remove(key.as_str())?;
            }
            candidates.len()
        };
        write_txn.commit()?;
        Ok(moved)
    }
}

// =============================================================================
// Tests
// =============================================================================
