// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # API Data Models
//!
//! Request and response structures shared by several endpoints. All types
//! derive `ToSchema` for OpenAPI documentation; ledger domain types stay
//! free of HTTP concerns and are converted here.
//!
//! ## Amounts
//!
//! Amounts and balances are integers in minor units of the currency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::ledger::{Account, AccountStatus, OperationKind, Posting};

// =============================================================================
// Operation Kind
// =============================================================================

/// Kind of balance-affecting operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OperationKindDto {
    /// Mint into `destination` (admin only)
    Credit,
    /// Burn from `source`
    Debit,
    /// Move from `source` to `destination`
    Transfer,
}

impl From<OperationKindDto> for OperationKind {
    fn from(kind: OperationKindDto) -> Self {
        match kind {
            OperationKindDto::Credit => OperationKind::Credit,
            OperationKindDto::Debit => OperationKind::Debit,
            OperationKindDto::Transfer => OperationKind::Transfer,
        }
    }
}

impl From<OperationKind> for OperationKindDto {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Credit => OperationKindDto::Credit,
            OperationKind::Debit => OperationKindDto::Debit,
            OperationKind::Transfer => OperationKindDto::Transfer,
        }
    }
}

// =============================================================================
// Postings
// =============================================================================

/// One account's balance delta for one operation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostingView {
    pub operation_id: Uuid,
    pub account_id: Uuid,
    pub delta: i64,
    pub resulting_balance: i64,
    /// Account version produced by this posting
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl From<&Posting> for PostingView {
    fn from(posting: &Posting) -> Self {
        Self {
            operation_id: posting.operation_id,
            account_id: posting.account_id.0,
            delta: posting.delta,
            resulting_balance: posting.resulting_balance,
            version: posting.version,
            created_at: posting.created_at,
        }
    }
}

// =============================================================================
// Accounts
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AccountView {
    pub account_id: Uuid,
    pub owner: String,
    pub currency: String,
    pub balance: i64,
    pub version: u64,
    pub overdraft: bool,
    /// `active` or `inactive`
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Account> for AccountView {
    fn from(account: Account) -> Self {
        let status = match account.status {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
        };
        Self {
            account_id: account.id.0,
            owner: account.owner,
            currency: account.currency,
            balance: account.balance,
            version: account.version,
            overdraft: account.overdraft,
            status: status.to_string(),
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}
