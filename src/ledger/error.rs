// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Errors surfaced by the ledger core.
//!
//! Business rejections (insufficient funds, contention, ...) are not errors:
//! they are terminal [`Outcome`](super::Outcome)s recorded against the
//! idempotency key. The variants here are failures the caller must handle.

use thiserror::Error;

use crate::storage::StoreError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed request that could not be recorded (no usable key).
    #[error("invalid request: {0}")]
    Validation(String),

    /// Caller is not allowed to act on the referenced account.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("operation not found: {0}")]
    OperationNotFound(String),

    /// The key was already used for a request with a different payload.
    #[error("idempotency key {0} was already used for a different request")]
    IdempotencyKeyReused(String),

    /// A duplicate of this operation is still in flight; retry later.
    #[error("operation {0} is already in progress")]
    OperationInProgress(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("internal ledger error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Whether retrying the same submission later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::OperationInProgress(_) | LedgerError::StorageUnavailable(_)
        )
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyCompleted(key) => {
                LedgerError::Internal(format!("operation {key} completed twice"))
            }
            StoreError::ClaimLost(key) => LedgerError::OperationInProgress(key),
            StoreError::NotFound(what) => LedgerError::AccountNotFound(what),
            other => LedgerError::StorageUnavailable(other.to_string()),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
