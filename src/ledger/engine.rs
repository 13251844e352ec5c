// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Ledger Engine
//!
//! Orchestrates every balance-affecting operation:
//!
//! ```text
//! submitted -> validating -> posting -> committed
//!                         \-> rejected
//! ```
//!
//! 1. The idempotency guard admits the request or replays a stored outcome.
//! 2. Structural validation; failures are recorded as rejections.
//! 3. Account versions are read from one snapshot and the postings are
//!    committed with those versions as the optimistic-lock precondition.
//!    A version conflict re-reads and retries up to `max_retries` times.
//! 4. After commit, cache entries of every affected account are invalidated
//!    and `operation.applied` is published, before the caller sees success.
//!
//! The posting phase runs in its own task: once admitted, an operation
//! finishes its commit and side effects even if the caller goes away.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cache::{BalanceCache, CachedBalance};
use super::error::{LedgerError, LedgerResult};
use super::events::{EventPublisher, LedgerEvent};
use super::guard::{Admission, GuardConfig, IdempotencyGuard, Ticket};
use super::types::{
    Account, AccountRef, OperationKey, OperationKind, OperationPlan, OperationRecord,
    OperationRequest, Outcome, Posting, RejectReason, Version,
};
use crate::auth::ownership::{require_admin, Access, OwnershipEnforcer};
use crate::auth::AuthenticatedUser;
use crate::storage::{
    CommitResult, LedgerStore, PostingCommit, PostingEntry, Reconciliation, StoreError,
    StoreHandle,
};

/// Default number of postings returned by a history query.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Maximum number of postings returned by a history query.
pub const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Commit attempts per operation before `rejected:contention`.
    pub max_retries: u32,
    /// Base delay between attempts; grows linearly with the attempt number.
    pub retry_backoff: Duration,
    /// Upper bound on a single storage call.
    pub storage_timeout: Duration,
    pub guard: GuardConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_backoff: Duration::from_millis(5),
            storage_timeout: Duration::from_secs(2),
            guard: GuardConfig::default(),
        }
    }
}

/// Result of `submit_operation`: the terminal outcome for the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub key: OperationKey,
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub outcome: Outcome,
    /// The outcome was recorded by an earlier submission.
    pub replayed: bool,
}

impl Submission {
    fn from_record(record: OperationRecord, replayed: bool) -> LedgerResult<Self> {
        let outcome = record.outcome.ok_or_else(|| {
            LedgerError::Internal(format!("operation {} is terminal without outcome", record.key))
        })?;
        Ok(Self {
            key: record.key,
            operation_id: record.operation_id,
            kind: record.kind,
            outcome,
            replayed,
        })
    }
}

/// Current balance of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub account: AccountRef,
    pub balance: i64,
    pub version: Version,
    /// Served from the balance cache.
    pub cached: bool,
}

pub struct LedgerEngine<S, C, P> {
    store: StoreHandle<S>,
    guard: IdempotencyGuard<S>,
    cache: Arc<C>,
    events: Arc<P>,
    config: EngineConfig,
}

impl<S, C, P> Clone for LedgerEngine<S, C, P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            guard: self.guard.clone(),
            cache: Arc::clone(&self.cache),
            events: Arc::clone(&self.events),
            config: self.config.clone(),
        }
    }
}

impl<S, C, P> LedgerEngine<S, C, P>
where
    S: LedgerStore,
    C: BalanceCache,
    P: EventPublisher,
{
    pub fn new(store: Arc<S>, cache: Arc<C>, events: Arc<P>, config: EngineConfig) -> Self {
        let store = StoreHandle::new(store, config.storage_timeout);
        let guard = IdempotencyGuard::new(store.clone(), config.guard.clone());
        Self {
            store,
            guard,
            cache,
            events,
            config,
        }
    }

    pub fn store(&self) -> &StoreHandle<S> {
        &self.store
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Apply a credit, debit or transfer exactly once per idempotency key.
    ///
    /// Business rejections come back as `Ok` with a rejected outcome; errors
    /// are reserved for requests that could not be decided.
    pub async fn submit_operation(
        &self,
        caller: &AuthenticatedUser,
        request: OperationRequest,
    ) -> LedgerResult<Submission> {
        authorize_submission(caller, &request)?;

        let key = OperationKey::scoped(&caller.user_id, &request.idempotency_key)?;
        let candidate = OperationRecord::pending(
            key,
            request.kind,
            request.fingerprint(),
            request.memo.clone(),
            Utc::now(),
        );

        let ticket = match self.guard.begin(candidate).await? {
            Admission::Replay(record) => {
                debug!(key = %record.key, operation_id = %record.operation_id, "Replaying stored outcome");
                // The first attempt may have timed out after its commit landed,
                // in which case its invalidation never ran.
                if let Some(outcome) = &record.outcome {
                    self.invalidate_postings(outcome.postings());
                }
                return Submission::from_record(record, true);
            }
            Admission::Proceed(ticket) => ticket,
        };

        let plan = match request.plan() {
            Ok(plan) => plan,
            Err(reason) => return self.reject(&ticket, reason).await,
        };

        // Detach the posting phase so a dropped caller cannot interrupt it
        // between commit and cache invalidation.
        let engine = self.clone();
        let posting = tokio::spawn(async move { engine.post(ticket, plan).await });
        posting
            .await
            .map_err(|e| LedgerError::Internal(format!("posting task failed: {e}")))?
    }

    async fn post(&self, ticket: Ticket, plan: OperationPlan) -> LedgerResult<Submission> {
        let record = &ticket.record;
        let refs: Vec<AccountRef> = plan.accounts().cloned().collect();
        let attempts = self.config.max_retries.max(1);

        for attempt in 1..=attempts {
            let ids = refs.iter().map(AccountRef::id).collect::<Vec<_>>();
            let snapshot = self.store.call(move |s| s.read_accounts(&ids)).await?;

            let entries = match build_entries(&plan, &snapshot) {
                Ok(entries) => entries,
                Err(reason) => return self.reject(&ticket, reason).await,
            };

            let commit = PostingCommit {
                key: record.key.clone(),
                claim_token: record.claim_token,
                operation_id: record.operation_id,
                entries,
                committed_at: Utc::now(),
            };

            match self.store.call(move |s| s.append_postings(&commit)).await {
                Ok(result) => return Ok(self.after_commit(&ticket, result)),
                Err(StoreError::VersionConflict {
                    account_id,
                    expected,
                    actual,
                }) => {
                    debug!(
                        key = %record.key,
                        operation_id = %record.operation_id,
                        attempt,
                        account_id = %account_id,
                        expected,
                        actual,
                        "Version conflict, retrying"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    }
                }
                Err(StoreError::InsufficientFunds(_)) => {
                    return self.reject(&ticket, RejectReason::InsufficientFunds).await
                }
                Err(StoreError::UnknownAccount(_)) => {
                    return self.reject(&ticket, RejectReason::UnknownAccount).await
                }
                Err(StoreError::AccountInactive(_)) => {
                    return self.reject(&ticket, RejectReason::AccountInactive).await
                }
                Err(StoreError::BalanceOverflow(_)) => {
                    return self.reject(&ticket, RejectReason::BalanceOverflow).await
                }
                Err(e @ StoreError::ClaimLost(_)) => {
                    warn!(key = %record.key, "Claim lost before commit");
                    return Err(e.into());
                }
                Err(StoreError::AlreadyCompleted(key)) => {
                    error!(key = %key, "Operation completed twice");
                    return Err(LedgerError::Internal(format!(
                        "operation {key} completed twice"
                    )));
                }
                Err(e) => {
                    // The operation row stays pending and is reclaimed by a retry.
                    error!(
                        key = %record.key,
                        operation_id = %record.operation_id,
                        error = %e,
                        "Storage failure while posting"
                    );
                    return Err(LedgerError::StorageUnavailable(e.to_string()));
                }
            }
        }

        self.reject(&ticket, RejectReason::Contention).await
    }

    /// Post-commit side effects. Never fails: the commit is durable.
    fn after_commit(&self, ticket: &Ticket, result: CommitResult) -> Submission {
        let record = &ticket.record;

        self.invalidate_postings(&result.postings);

        let event = LedgerEvent::operation_applied(
            record.operation_id,
            record.kind,
            record.key.to_string(),
            record.memo.clone(),
            result.postings.clone(),
        );
        if let Err(e) = self.events.publish(event) {
            warn!(operation_id = %record.operation_id, error = %e, "Event publish failed");
        }

        info!(
            key = %record.key,
            operation_id = %record.operation_id,
            kind = %record.kind,
            postings = result.postings.len(),
            "Operation applied"
        );

        let committed_at = result
            .operation
            .completed_at
            .unwrap_or_else(Utc::now);
        Submission {
            key: record.key.clone(),
            operation_id: record.operation_id,
            kind: record.kind,
            outcome: Outcome::Applied {
                postings: result.postings,
                committed_at,
            },
            replayed: false,
        }
    }

    /// Tombstone each posted account at the version its posting produced.
    fn invalidate_postings(&self, postings: &[Posting]) {
        for posting in postings {
            if let Err(e) = self.cache.invalidate(&posting.account_id, posting.version) {
                warn!(
                    account_id = %posting.account_id,
                    error = %e,
                    "Balance cache invalidation failed; entry expires by TTL"
                );
            }
        }
    }

    async fn reject(&self, ticket: &Ticket, reason: RejectReason) -> LedgerResult<Submission> {
        let record = self
            .guard
            .complete(ticket, Outcome::Rejected { reason })
            .await?;
        info!(
            key = %record.key,
            operation_id = %record.operation_id,
            kind = %record.kind,
            reason = %reason,
            "Operation rejected"
        );
        Submission::from_record(record, false)
    }

    /// Look up the caller's operation by its unscoped key.
    pub async fn get_operation(
        &self,
        caller: &AuthenticatedUser,
        idempotency_key: &str,
    ) -> LedgerResult<OperationRecord> {
        let key = OperationKey::scoped(&caller.user_id, idempotency_key)?;
        let lookup = key.clone();
        self.store
            .call(move |s| s.get_operation(&lookup))
            .await?
            .ok_or_else(|| LedgerError::OperationNotFound(key.to_string()))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current balance: cache first, store on miss (and refill the cache).
    pub async fn get_balance(
        &self,
        caller: &AuthenticatedUser,
        account_ref: &AccountRef,
    ) -> LedgerResult<Balance> {
        validate_ref(account_ref)?;
        account_ref.verify_access(caller, Access::Read)?;
        let id = account_ref.id();

        match self.cache.get(&id) {
            Ok(Some(hit)) => {
                return Ok(Balance {
                    account: account_ref.clone(),
                    balance: hit.balance,
                    version: hit.version,
                    cached: true,
                })
            }
            Ok(None) => {}
            Err(e) => warn!(account_id = %id, error = %e, "Balance cache read failed"),
        }

        let account = self
            .store
            .call(move |s| s.read_account(&id))
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_ref.to_string()))?;

        let value = CachedBalance {
            balance: account.balance,
            version: account.version,
        };
        if let Err(e) = self.cache.set(&id, value) {
            warn!(account_id = %id, error = %e, "Balance cache fill failed");
        }

        Ok(Balance {
            account: account.account_ref(),
            balance: account.balance,
            version: account.version,
            cached: false,
        })
    }

    /// Postings of an account, newest first. Pass the lowest version of the
    /// previous page as `before` to read the next one.
    pub async fn account_history(
        &self,
        caller: &AuthenticatedUser,
        account_ref: &AccountRef,
        before: Option<Version>,
        limit: usize,
    ) -> LedgerResult<Vec<Posting>> {
        validate_ref(account_ref)?;
        account_ref.verify_access(caller, Access::Read)?;
        let id = account_ref.id();
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);

        self.store
            .call(move |s| match s.read_account(&id)? {
                Some(_) => s.postings_for_account(&id, before, limit).map(Some),
                None => Ok(None),
            })
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_ref.to_string()))
    }

    // =========================================================================
    // Administration
    // =========================================================================

    pub async fn open_account(
        &self,
        caller: &AuthenticatedUser,
        account_ref: &AccountRef,
        overdraft: bool,
    ) -> LedgerResult<Account> {
        require_admin(caller, "opening accounts")?;
        validate_ref(account_ref)?;
        let target = account_ref.clone();
        let account = self
            .store
            .call(move |s| s.open_account(&target, overdraft))
            .await?;
        info!(account_id = %account.id, account = %account_ref, "Account opened");
        Ok(account)
    }

    pub async fn set_overdraft(
        &self,
        caller: &AuthenticatedUser,
        account_ref: &AccountRef,
        overdraft: bool,
    ) -> LedgerResult<Account> {
        require_admin(caller, "changing overdraft")?;
        validate_ref(account_ref)?;
        let id = account_ref.id();
        let account = self
            .store
            .call(move |s| s.set_overdraft(&id, overdraft))
            .await
            .map_err(|e| not_found_as(e, account_ref))?;
        info!(account_id = %id, overdraft, "Overdraft updated");
        Ok(account)
    }

    pub async fn deactivate_account(
        &self,
        caller: &AuthenticatedUser,
        account_ref: &AccountRef,
    ) -> LedgerResult<Account> {
        require_admin(caller, "deactivating accounts")?;
        validate_ref(account_ref)?;
        let id = account_ref.id();
        let account = self
            .store
            .call(move |s| s.deactivate_account(&id))
            .await
            .map_err(|e| not_found_as(e, account_ref))?;
        info!(account_id = %id, "Account deactivated");
        Ok(account)
    }

    /// Compare an account's balance with the sum of its postings.
    pub async fn reconcile(
        &self,
        caller: &AuthenticatedUser,
        account_ref: &AccountRef,
    ) -> LedgerResult<Reconciliation> {
        require_admin(caller, "reconciliation")?;
        validate_ref(account_ref)?;
        let id = account_ref.id();
        let report = self
            .store
            .call(move |s| s.reconcile_account(&id))
            .await
            .map_err(|e| not_found_as(e, account_ref))?;
        if !report.is_consistent() {
            error!(
                account_id = %id,
                balance = report.account.balance,
                postings_sum = report.postings_sum,
                version = report.account.version,
                posting_count = report.posting_count,
                "Account does not reconcile with its postings"
            );
        }
        Ok(report)
    }
}

fn authorize_submission(caller: &AuthenticatedUser, request: &OperationRequest) -> LedgerResult<()> {
    match request.kind {
        OperationKind::Credit => require_admin(caller, "credit"),
        OperationKind::Debit | OperationKind::Transfer => match request.source_ref() {
            Some(source) => source.verify_access(caller, Access::Spend),
            // Rejected during validation.
            None => Ok(()),
        },
    }
}

fn validate_ref(account_ref: &AccountRef) -> LedgerResult<()> {
    if account_ref.is_well_formed() {
        Ok(())
    } else {
        Err(LedgerError::Validation(format!(
            "malformed account reference {account_ref}"
        )))
    }
}

fn not_found_as(err: StoreError, account_ref: &AccountRef) -> LedgerError {
    match err {
        StoreError::NotFound(_) => LedgerError::AccountNotFound(account_ref.to_string()),
        other => other.into(),
    }
}

/// Turn a plan and an account snapshot (in `plan.accounts()` order) into
/// commit entries carrying the expected versions.
fn build_entries(
    plan: &OperationPlan,
    snapshot: &[Option<Account>],
) -> Result<Vec<PostingEntry>, RejectReason> {
    let legs = plan
        .debit
        .iter()
        .map(|r| (r, -plan.amount, false))
        .chain(
            plan.credit
                .iter()
                .map(|r| (r, plan.amount, plan.creates_destination())),
        );

    legs.zip(snapshot)
        .map(|((account_ref, delta, create), current)| match current {
            Some(account) => Ok(PostingEntry {
                account: account_ref.clone(),
                expected_version: account.version,
                delta,
                create_if_missing: false,
            }),
            None if create => Ok(PostingEntry {
                account: account_ref.clone(),
                expected_version: 0,
                delta,
                create_if_missing: true,
            }),
            None => Err(RejectReason::UnknownAccount),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    use chrono::DateTime;

    use super::*;
    use crate::auth::Role;
    use crate::ledger::cache::{CacheError, LruBalanceCache};
    use crate::ledger::events::{BroadcastPublisher, PublishError};
    use crate::ledger::{AccountId, OperationStatus};
    use crate::storage::{ClaimOutcome, RedbLedgerStore, StoreResult};

    type TestEngine<S = RedbLedgerStore, C = LruBalanceCache, P = BroadcastPublisher> =
        LedgerEngine<S, C, P>;

    fn config() -> EngineConfig {
        EngineConfig {
            max_retries: 50,
            retry_backoff: Duration::from_millis(1),
            storage_timeout: Duration::from_secs(10),
            guard: GuardConfig {
                wait_timeout: Duration::from_secs(10),
                poll_interval: Duration::from_millis(5),
                stale_after: Duration::from_secs(60),
            },
        }
    }

    fn open_store() -> (Arc<RedbLedgerStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbLedgerStore::open(&dir.path().join("ledger.redb")).unwrap();
        (Arc::new(store), dir)
    }

    fn engine() -> (TestEngine, BroadcastPublisher, tempfile::TempDir) {
        let (store, dir) = open_store();
        let publisher = BroadcastPublisher::new(64);
        let engine = LedgerEngine::new(
            store,
            Arc::new(LruBalanceCache::new(100, Duration::from_secs(300))),
            Arc::new(publisher.clone()),
            config(),
        );
        (engine, publisher, dir)
    }

    fn user(id: &str, role: Role) -> AuthenticatedUser {
        AuthenticatedUser {
            user_id: id.to_string(),
            role,
            session_id: None,
            issuer: "test".to_string(),
            expires_at: 0,
        }
    }

    fn admin() -> AuthenticatedUser {
        user("treasury", Role::Admin)
    }

    fn client(id: &str) -> AuthenticatedUser {
        user(id, Role::Client)
    }

    fn fxy(owner: &str) -> AccountRef {
        AccountRef::new(owner, "FXY")
    }

    async fn fund<S: LedgerStore, C: BalanceCache, P: EventPublisher>(
        engine: &TestEngine<S, C, P>,
        owner: &str,
        amount: u64,
    ) {
        let key = format!("fund-{owner}-{amount}-{}", Uuid::new_v4());
        let submission = engine
            .submit_operation(&admin(), OperationRequest::credit(&key, owner, "FXY", amount))
            .await
            .unwrap();
        assert!(submission.outcome.is_applied());
    }

    async fn balance_of<S: LedgerStore, C: BalanceCache, P: EventPublisher>(
        engine: &TestEngine<S, C, P>,
        owner: &str,
    ) -> i64 {
        engine.get_balance(&admin(), &fxy(owner)).await.unwrap().balance
    }

    #[tokio::test]
    async fn credit_opens_destination_account() {
        let (engine, _events, _dir) = engine();
        fund(&engine, "alice", 100).await;

        let balance = engine.get_balance(&client("alice"), &fxy("alice")).await.unwrap();
        assert_eq!(balance.balance, 100);
        assert_eq!(balance.version, 1);
        assert!(!balance.cached);

        let again = engine.get_balance(&client("alice"), &fxy("alice")).await.unwrap();
        assert!(again.cached);
        assert_eq!(again.balance, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicate_transfer_applies_once() {
        let (engine, _events, _dir) = engine();
        fund(&engine, "a", 100).await;
        engine.open_account(&admin(), &fxy("b"), false).await.unwrap();

        let request = OperationRequest::transfer("k1", "a", "b", "FXY", 40);
        let first = {
            let (engine, request) = (engine.clone(), request.clone());
            tokio::spawn(async move { engine.submit_operation(&client("a"), request).await })
        };
        let second = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.submit_operation(&client("a"), request).await })
        };
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(first.outcome, second.outcome);
        assert_eq!(first.operation_id, second.operation_id);
        assert!(first.outcome.is_applied());
        assert!(first.replayed ^ second.replayed);

        assert_eq!(balance_of(&engine, "a").await, 60);
        assert_eq!(balance_of(&engine, "b").await, 40);

        let postings = engine
            .store()
            .call(move |s| s.postings_for_operation(&first.operation_id))
            .await
            .unwrap();
        assert_eq!(postings.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_overspend_never_double_spends() {
        let (engine, _events, _dir) = engine();
        fund(&engine, "a", 100).await;
        engine.open_account(&admin(), &fxy("b"), false).await.unwrap();

        let tasks: Vec<_> = ["x", "y"]
            .into_iter()
            .map(|key| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .submit_operation(
                            &client("a"),
                            OperationRequest::transfer(key, "a", "b", "FXY", 70),
                        )
                        .await
                })
            })
            .collect();

        let mut applied = 0;
        let mut rejected = Vec::new();
        for task in tasks {
            let submission = task.await.unwrap().unwrap();
            match submission.outcome.reason() {
                None => applied += 1,
                Some(reason) => rejected.push(reason),
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(rejected, vec![RejectReason::InsufficientFunds]);
        assert_eq!(balance_of(&engine, "a").await, 30);
        assert_eq!(balance_of(&engine, "b").await, 70);
    }

    #[tokio::test]
    async fn cached_balance_is_invalidated_before_success() {
        let (engine, _events, _dir) = engine();
        fund(&engine, "a", 100).await;

        let cached = engine.get_balance(&client("a"), &fxy("a")).await.unwrap();
        assert_eq!(cached.balance, 100);
        assert!(engine.get_balance(&client("a"), &fxy("a")).await.unwrap().cached);

        let debit = engine
            .submit_operation(&client("a"), OperationRequest::debit("d1", "a", "FXY", 30))
            .await
            .unwrap();
        assert!(debit.outcome.is_applied());

        let after = engine.get_balance(&client("a"), &fxy("a")).await.unwrap();
        assert_eq!(after.balance, 70);
        assert!(!after.cached);
    }

    #[tokio::test]
    async fn replay_returns_stored_outcome_without_new_postings() {
        let (engine, _events, _dir) = engine();
        fund(&engine, "a", 100).await;

        let request = OperationRequest::debit("k1", "a", "FXY", 10);
        let first = engine.submit_operation(&client("a"), request.clone()).await.unwrap();
        for _ in 0..3 {
            let replay = engine.submit_operation(&client("a"), request.clone()).await.unwrap();
            assert!(replay.replayed);
            assert_eq!(replay.outcome, first.outcome);
            assert_eq!(replay.operation_id, first.operation_id);
        }

        assert_eq!(balance_of(&engine, "a").await, 90);
        let history = engine
            .account_history(&client("a"), &fxy("a"), None, 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);

        let changed = OperationRequest::debit("k1", "a", "FXY", 11);
        let err = engine.submit_operation(&client("a"), changed).await.unwrap_err();
        assert!(matches!(err, LedgerError::IdempotencyKeyReused(_)));
    }

    #[tokio::test]
    async fn rejections_are_recorded_and_replayed() {
        let (engine, _events, _dir) = engine();
        fund(&engine, "a", 10).await;

        let request = OperationRequest::transfer("k1", "a", "ghost", "FXY", 5);
        let first = engine.submit_operation(&client("a"), request.clone()).await.unwrap();
        assert_eq!(first.outcome.reason(), Some(RejectReason::UnknownAccount));

        let replay = engine.submit_operation(&client("a"), request).await.unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.outcome, first.outcome);

        let zero = OperationRequest::debit("k2", "a", "FXY", 0);
        let rejected = engine.submit_operation(&client("a"), zero).await.unwrap();
        assert_eq!(rejected.outcome.to_string(), "rejected:invalid_amount");

        let stored = engine.get_operation(&client("a"), "k2").await.unwrap();
        assert_eq!(stored.outcome, Some(rejected.outcome));
        assert_eq!(balance_of(&engine, "a").await, 10);
    }

    #[tokio::test]
    async fn transfer_postings_conserve_value() {
        let (engine, _events, _dir) = engine();
        fund(&engine, "a", 50).await;
        fund(&engine, "b", 1).await;

        let submission = engine
            .submit_operation(
                &client("a"),
                OperationRequest::transfer("t1", "a", "b", "FXY", 20),
            )
            .await
            .unwrap();
        let postings = submission.outcome.postings();
        assert_eq!(postings.len(), 2);
        assert_eq!(postings.iter().map(|p| p.delta).sum::<i64>(), 0);
        assert!(postings
            .iter()
            .all(|p| p.operation_id == submission.operation_id));
        assert_eq!(postings[0].delta, -20);
        assert_eq!(postings[0].account_id, fxy("a").id());
    }

    #[tokio::test]
    async fn overdraft_flag_controls_negative_balances() {
        let (engine, _events, _dir) = engine();
        fund(&engine, "a", 10).await;

        let over = engine
            .submit_operation(&client("a"), OperationRequest::debit("d1", "a", "FXY", 25))
            .await
            .unwrap();
        assert_eq!(over.outcome.reason(), Some(RejectReason::InsufficientFunds));
        assert_eq!(balance_of(&engine, "a").await, 10);

        engine.set_overdraft(&admin(), &fxy("a"), true).await.unwrap();
        let allowed = engine
            .submit_operation(&client("a"), OperationRequest::debit("d2", "a", "FXY", 25))
            .await
            .unwrap();
        assert!(allowed.outcome.is_applied());
        assert_eq!(balance_of(&engine, "a").await, -15);
    }

    #[tokio::test]
    async fn inactive_accounts_reject_operations() {
        let (engine, _events, _dir) = engine();
        fund(&engine, "a", 10).await;
        engine.deactivate_account(&admin(), &fxy("a")).await.unwrap();

        let debit = engine
            .submit_operation(&client("a"), OperationRequest::debit("d1", "a", "FXY", 1))
            .await
            .unwrap();
        assert_eq!(debit.outcome.reason(), Some(RejectReason::AccountInactive));
        // Still readable.
        assert_eq!(balance_of(&engine, "a").await, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_credits_sum_exactly() {
        let (engine, _events, _dir) = engine();
        let tasks: Vec<_> = (1..=20u64)
            .map(|amount| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .submit_operation(
                            &admin(),
                            OperationRequest::credit(&format!("c{amount}"), "a", "FXY", amount),
                        )
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().unwrap().outcome.is_applied());
        }

        assert_eq!(balance_of(&engine, "a").await, 210);
        let report = engine.reconcile(&admin(), &fxy("a")).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.posting_count, 20);
    }

    #[tokio::test]
    async fn authorization_is_enforced() {
        let (engine, _events, _dir) = engine();
        fund(&engine, "a", 10).await;

        let err = engine
            .submit_operation(&client("a"), OperationRequest::credit("c", "a", "FXY", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Forbidden(_)));

        let err = engine
            .submit_operation(
                &client("mallory"),
                OperationRequest::transfer("t", "a", "mallory", "FXY", 5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Forbidden(_)));

        assert!(engine.get_balance(&client("mallory"), &fxy("a")).await.is_err());
        let auditor = user("carol", Role::Auditor);
        assert_eq!(
            engine.get_balance(&auditor, &fxy("a")).await.unwrap().balance,
            10
        );
        assert!(engine.open_account(&auditor, &fxy("x"), false).await.is_err());
        assert_eq!(balance_of(&engine, "a").await, 10);
    }

    #[tokio::test]
    async fn missing_account_reads_fail() {
        let (engine, _events, _dir) = engine();
        let err = engine.get_balance(&admin(), &fxy("nobody")).await.unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(_)));
        let err = engine
            .account_history(&admin(), &fxy("nobody"), None, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(_)));
        let err = engine
            .set_overdraft(&admin(), &fxy("nobody"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(_)));
        let err = engine.get_operation(&admin(), "missing").await.unwrap_err();
        assert!(matches!(err, LedgerError::OperationNotFound(_)));
    }

    #[tokio::test]
    async fn applied_operations_publish_events() {
        let (engine, events, _dir) = engine();
        let mut rx = events.subscribe();

        let submission = engine
            .submit_operation(
                &admin(),
                OperationRequest::credit("c1", "a", "FXY", 5).with_memo("signup bonus"),
            )
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation_id, submission.operation_id);
        assert_eq!(event.key, "8:treasury:c1");
        assert_eq!(event.memo.as_deref(), Some("signup bonus"));
        assert_eq!(event.postings.len(), 1);
    }

    // -------------------------------------------------------------------------
    // Degraded collaborators
    // -------------------------------------------------------------------------

    struct FailingCache;

    impl BalanceCache for FailingCache {
        fn get(&self, _: &AccountId) -> Result<Option<CachedBalance>, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        fn set(&self, _: &AccountId, _: CachedBalance) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        fn invalidate(&self, _: &AccountId, _: Version) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
    }

    struct ClosedPublisher;

    impl EventPublisher for ClosedPublisher {
        fn publish(&self, _: LedgerEvent) -> Result<(), PublishError> {
            Err(PublishError::Closed)
        }
    }

    #[tokio::test]
    async fn cache_and_event_failures_do_not_fail_operations() {
        let (store, _dir) = open_store();
        let engine = LedgerEngine::new(store, Arc::new(FailingCache), Arc::new(ClosedPublisher), config());

        fund(&engine, "a", 100).await;
        let debit = engine
            .submit_operation(&client("a"), OperationRequest::debit("d1", "a", "FXY", 30))
            .await
            .unwrap();
        assert!(debit.outcome.is_applied());

        let balance = engine.get_balance(&client("a"), &fxy("a")).await.unwrap();
        assert_eq!(balance.balance, 70);
        assert!(!balance.cached);
    }

    /// Delegates to redb. `append_postings` can be made to conflict every
    /// time or to stall before committing; `claim_operation` can stall too.
    struct ScriptedStore {
        inner: RedbLedgerStore,
        conflict: AtomicBool,
        append_delay_ms: AtomicU64,
        claim_delay_ms: AtomicU64,
        appending: AtomicBool,
        claiming: AtomicBool,
        commits: AtomicUsize,
    }

    impl ScriptedStore {
        fn open() -> (Arc<Self>, tempfile::TempDir) {
            let dir = tempfile::tempdir().unwrap();
            let store = Self {
                inner: RedbLedgerStore::open(&dir.path().join("ledger.redb")).unwrap(),
                conflict: AtomicBool::new(false),
                append_delay_ms: AtomicU64::new(0),
                claim_delay_ms: AtomicU64::new(0),
                appending: AtomicBool::new(false),
                claiming: AtomicBool::new(false),
                commits: AtomicUsize::new(0),
            };
            (Arc::new(store), dir)
        }

        fn stall(delay_ms: &AtomicU64) {
            let ms = delay_ms.load(Ordering::SeqCst);
            if ms > 0 {
                std::thread::sleep(Duration::from_millis(ms));
            }
        }
    }

    impl LedgerStore for ScriptedStore {
        fn read_account(&self, id: &AccountId) -> StoreResult<Option<Account>> {
            self.inner.read_account(id)
        }
        fn read_accounts(&self, ids: &[AccountId]) -> StoreResult<Vec<Option<Account>>> {
            self.inner.read_accounts(ids)
        }
        fn open_account(&self, r: &AccountRef, overdraft: bool) -> StoreResult<Account> {
            self.inner.open_account(r, overdraft)
        }
        fn set_overdraft(&self, id: &AccountId, overdraft: bool) -> StoreResult<Account> {
            self.inner.set_overdraft(id, overdraft)
        }
        fn deactivate_account(&self, id: &AccountId) -> StoreResult<Account> {
            self.inner.deactivate_account(id)
        }
        fn append_postings(&self, commit: &PostingCommit) -> StoreResult<CommitResult> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            if self.conflict.load(Ordering::SeqCst) {
                let entry = &commit.entries[0];
                return Err(StoreError::VersionConflict {
                    account_id: entry.account.id(),
                    expected: entry.expected_version,
                    actual: entry.expected_version + 1,
                });
            }
            self.appending.store(true, Ordering::SeqCst);
            Self::stall(&self.append_delay_ms);
            self.inner.append_postings(commit)
        }
        fn postings_for_account(
            &self,
            id: &AccountId,
            before: Option<Version>,
            limit: usize,
        ) -> StoreResult<Vec<Posting>> {
            self.inner.postings_for_account(id, before, limit)
        }
        fn postings_for_operation(&self, id: &Uuid) -> StoreResult<Vec<Posting>> {
            self.inner.postings_for_operation(id)
        }
        fn reconcile_account(&self, id: &AccountId) -> StoreResult<Reconciliation> {
            self.inner.reconcile_account(id)
        }
        fn claim_operation(
            &self,
            candidate: &OperationRecord,
            stale_before: DateTime<Utc>,
        ) -> StoreResult<ClaimOutcome> {
            self.claiming.store(true, Ordering::SeqCst);
            Self::stall(&self.claim_delay_ms);
            self.inner.claim_operation(candidate, stale_before)
        }
        fn get_operation(&self, key: &OperationKey) -> StoreResult<Option<OperationRecord>> {
            self.inner.get_operation(key)
        }
        fn complete_operation(
            &self,
            key: &OperationKey,
            token: Uuid,
            outcome: &Outcome,
            at: DateTime<Utc>,
        ) -> StoreResult<OperationRecord> {
            self.inner.complete_operation(key, token, outcome, at)
        }
        fn archive_operations(&self, cutoff: DateTime<Utc>, limit: usize) -> StoreResult<usize> {
            self.inner.archive_operations(cutoff, limit)
        }
    }

    type ScriptedEngine = TestEngine<ScriptedStore>;

    fn scripted_engine(
        store: &Arc<ScriptedStore>,
        config: EngineConfig,
    ) -> (ScriptedEngine, Arc<LruBalanceCache>, BroadcastPublisher) {
        let cache = Arc::new(LruBalanceCache::new(100, Duration::from_secs(300)));
        let publisher = BroadcastPublisher::new(16);
        let engine = LedgerEngine::new(
            Arc::clone(store),
            Arc::clone(&cache),
            Arc::new(publisher.clone()),
            config,
        );
        (engine, cache, publisher)
    }

    async fn wait_for(flag: &AtomicBool) {
        while !flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn exhausted_retries_reject_with_contention() {
        let (store, _dir) = ScriptedStore::open();
        store.conflict.store(true, Ordering::SeqCst);
        let (engine, _cache, _events) = scripted_engine(
            &store,
            EngineConfig {
                max_retries: 3,
                ..config()
            },
        );

        let submission = engine
            .submit_operation(&admin(), OperationRequest::credit("c1", "a", "FXY", 5))
            .await
            .unwrap();
        assert_eq!(submission.outcome.to_string(), "rejected:contention");
        assert_eq!(store.commits.load(Ordering::SeqCst), 3);

        let replay = engine
            .submit_operation(&admin(), OperationRequest::credit("c1", "a", "FXY", 5))
            .await
            .unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.outcome.reason(), Some(RejectReason::Contention));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replay_after_timed_out_commit_drops_stale_balance() {
        let (store, _dir) = ScriptedStore::open();
        let (engine, _cache, _events) = scripted_engine(
            &store,
            EngineConfig {
                storage_timeout: Duration::from_millis(150),
                ..config()
            },
        );
        fund(&engine, "a", 100).await;
        assert_eq!(balance_of(&engine, "a").await, 100);
        assert!(engine.get_balance(&client("a"), &fxy("a")).await.unwrap().cached);

        store.append_delay_ms.store(400, Ordering::SeqCst);
        let debit = OperationRequest::debit("d1", "a", "FXY", 30);
        let err = engine
            .submit_operation(&client("a"), debit.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::StorageUnavailable(_)));

        // Let the stalled commit land.
        tokio::time::sleep(Duration::from_millis(700)).await;
        store.append_delay_ms.store(0, Ordering::SeqCst);

        let replay = engine.submit_operation(&client("a"), debit).await.unwrap();
        assert!(replay.replayed);
        assert!(replay.outcome.is_applied());

        let balance = engine.get_balance(&client("a"), &fxy("a")).await.unwrap();
        assert_eq!(balance.balance, 70);
        assert!(!balance.cached);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn caller_dropped_after_commit_still_gets_side_effects() {
        let (store, _dir) = ScriptedStore::open();
        let (engine, cache, events) = scripted_engine(&store, config());
        fund(&engine, "a", 100).await;
        assert_eq!(balance_of(&engine, "a").await, 100);
        let mut rx = events.subscribe();

        store.appending.store(false, Ordering::SeqCst);
        store.append_delay_ms.store(200, Ordering::SeqCst);
        let submitter = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .submit_operation(&client("a"), OperationRequest::debit("d1", "a", "FXY", 30))
                    .await
            })
        };

        wait_for(&store.appending).await;
        submitter.abort();
        assert!(submitter.await.unwrap_err().is_cancelled());

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event after commit")
            .unwrap();
        assert_eq!(event.postings.len(), 1);
        assert_eq!(event.postings[0].delta, -30);

        let id = fxy("a").id();
        assert_eq!(cache.get(&id).unwrap(), None);
        // A reader racing the commit cannot reinstate the pre-commit balance.
        cache
            .set(&id, CachedBalance { balance: 100, version: 1 })
            .unwrap();
        assert_eq!(cache.get(&id).unwrap(), None);
        assert_eq!(balance_of(&engine, "a").await, 70);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn caller_dropped_before_posting_writes_nothing() {
        let (store, _dir) = ScriptedStore::open();
        let (engine, _cache, _events) = scripted_engine(&store, config());
        fund(&engine, "a", 100).await;
        let commits_before = store.commits.load(Ordering::SeqCst);

        store.claiming.store(false, Ordering::SeqCst);
        store.claim_delay_ms.store(200, Ordering::SeqCst);
        let submitter = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .submit_operation(&client("a"), OperationRequest::debit("d1", "a", "FXY", 30))
                    .await
            })
        };

        wait_for(&store.claiming).await;
        submitter.abort();
        assert!(submitter.await.unwrap_err().is_cancelled());

        // Give the stalled claim time to finish on the blocking pool.
        tokio::time::sleep(Duration::from_millis(400)).await;
        store.claim_delay_ms.store(0, Ordering::SeqCst);

        assert_eq!(store.commits.load(Ordering::SeqCst), commits_before);
        let history = engine
            .account_history(&client("a"), &fxy("a"), None, 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(balance_of(&engine, "a").await, 100);

        let stored = engine.get_operation(&client("a"), "d1").await.unwrap();
        assert_eq!(stored.status, OperationStatus::Pending);
        assert!(stored.outcome.is_none());
    }

    #[tokio::test]
    async fn history_pages_reach_the_oldest_postings() {
        let (engine, _events, _dir) = engine();
        for amount in 1..=5 {
            fund(&engine, "a", amount).await;
        }

        let first = engine
            .account_history(&client("a"), &fxy("a"), None, 2)
            .await
            .unwrap();
        let versions: Vec<u64> = first.iter().map(|p| p.version).collect();
        assert_eq!(versions, vec![5, 4]);

        let cursor = first.last().map(|p| p.version);
        let second = engine
            .account_history(&client("a"), &fxy("a"), cursor, 2)
            .await
            .unwrap();
        let versions: Vec<u64> = second.iter().map(|p| p.version).collect();
        assert_eq!(versions, vec![3, 2]);

        let last = engine
            .account_history(&client("a"), &fxy("a"), Some(2), 2)
            .await
            .unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].delta, 1);
    }

    #[tokio::test]
    async fn callers_with_colons_keep_separate_operations() {
        let (engine, _events, _dir) = engine();
        fund(&engine, "a:b", 100).await;
        fund(&engine, "a", 100).await;

        let theirs = engine
            .submit_operation(
                &client("a:b"),
                OperationRequest::debit("c", "a:b", "FXY", 42).with_memo("secret"),
            )
            .await
            .unwrap();
        assert!(theirs.outcome.is_applied());

        let err = engine.get_operation(&client("a"), "b:c").await.unwrap_err();
        assert!(matches!(err, LedgerError::OperationNotFound(_)));

        let mine = engine
            .submit_operation(&client("a"), OperationRequest::debit("b:c", "a", "FXY", 7))
            .await
            .unwrap();
        assert!(mine.outcome.is_applied());
        assert!(!mine.replayed);
        assert_ne!(mine.operation_id, theirs.operation_id);
        assert_eq!(balance_of(&engine, "a").await, 93);
        assert_eq!(balance_of(&engine, "a:b").await, 58);
    }
}
