// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Ledger Core
//!
//! Balance ledger with exactly-once operations.
//!
//! - `types` - Accounts, postings, operations and outcomes
//! - `guard` - Idempotency guard over the persisted operations table
//! - `cache` - Read-through balance cache
//! - `events` - Post-commit domain events
//! - `engine` - Orchestration of validation, posting and side effects
//! - `reaper` - Archival of old terminal operations

pub mod cache;
pub mod engine;
pub mod error;
pub mod events;
pub mod guard;
pub mod reaper;
pub mod types;

pub use cache::{BalanceCache, CacheError, CachedBalance, LruBalanceCache};
pub use engine::{Balance, EngineConfig, LedgerEngine, Submission};
pub use error::{LedgerError, LedgerResult};
pub use events::{BroadcastPublisher, EventPublisher, LedgerEvent, PublishError};
pub use guard::{Admission, GuardConfig, IdempotencyGuard, Ticket};
pub use reaper::OperationReaper;
pub use types::{
    Account, AccountId, AccountRef, AccountStatus, OperationKey, OperationKind, OperationPlan,
    OperationRecord, OperationRequest, OperationStatus, Outcome, Posting, RejectReason, Version,
};
