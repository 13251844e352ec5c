// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Idempotency guard over the persisted operations table.
//!
//! `begin` admits exactly one attempt per key. Duplicates of a finished
//! operation replay its stored outcome; duplicates of an in-flight one wait
//! a bounded time for it to finish and then give up with
//! [`LedgerError::OperationInProgress`].

use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::error::{LedgerError, LedgerResult};
use super::types::{OperationRecord, Outcome};
use crate::storage::{ClaimOutcome, LedgerStore, StoreError, StoreHandle};

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Upper bound on waiting for an in-flight duplicate.
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    /// Pending rows claimed longer ago than this are taken over.
    pub stale_after: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(25),
            stale_after: Duration::from_secs(60),
        }
    }
}

/// Permission to execute an operation. Holds the claim token that must
/// accompany the commit or the rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub record: OperationRecord,
    /// The row was taken over from an abandoned attempt.
    pub reclaimed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Proceed(Ticket),
    /// Terminal row for the same request; nothing may be re-executed.
    Replay(OperationRecord),
}

pub struct IdempotencyGuard<S> {
    store: StoreHandle<S>,
    config: GuardConfig,
}

impl<S> Clone for IdempotencyGuard<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: LedgerStore> IdempotencyGuard<S> {
    pub fn new(store: StoreHandle<S>, config: GuardConfig) -> Self {
        Self { store, config }
    }

    /// Admit `candidate` (a fresh pending record) or resolve its duplicate.
    pub async fn begin(&self, candidate: OperationRecord) -> LedgerResult<Admission> {
        let deadline = Instant::now() + self.config.wait_timeout;
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));

        loop {
            let stale_before = Utc::now() - stale_after;
            let attempt = candidate.clone();
            let claimed = self
                .store
                .call(move |s| s.claim_operation(&attempt, stale_before))
                .await?;

            let existing = match claimed {
                ClaimOutcome::Claimed { record, reclaimed } => {
                    if reclaimed {
                        warn!(
                            key = %record.key,
                            operation_id = %record.operation_id,
                            "Reclaimed stale pending operation"
                        );
                    }
                    return Ok(Admission::Proceed(Ticket { record, reclaimed }));
                }
                ClaimOutcome::Existing(record) => record,
            };

            if existing.fingerprint != candidate.fingerprint {
                return Err(LedgerError::IdempotencyKeyReused(candidate.key.to_string()));
            }
            if existing.is_terminal() {
                return Ok(Admission::Replay(existing));
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(key = %candidate.key, "Gave up waiting for in-flight duplicate");
                return Err(LedgerError::OperationInProgress(candidate.key.to_string()));
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Record the terminal outcome for a ticket. A second completion of the
    /// same key is refused and reported as an internal error.
    pub async fn complete(&self, ticket: &Ticket, outcome: Outcome) -> LedgerResult<OperationRecord> {
        let key = ticket.record.key.clone();
        let token = ticket.record.claim_token;
        let result = self
            .store
            .call(move |s| s.complete_operation(&key, token, &outcome, Utc::now()))
            .await;

        match result {
            Ok(record) => Ok(record),
            Err(StoreError::AlreadyCompleted(key)) => {
                error!(key = %key, "Operation completed twice");
                Err(LedgerError::Internal(format!("operation {key} completed twice")))
            }
            Err(e) => Err(e.into()),
        }
    }
}
