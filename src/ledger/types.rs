// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ledger domain types: accounts, postings, operations and their outcomes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::{LedgerError, LedgerResult};

/// Optimistic-lock token of an account. Starts at 0 for an account that has
/// never been written and increases by one with every posting.
pub type Version = u64;

/// Maximum length of owner ids and caller-supplied idempotency keys.
pub const MAX_KEY_LEN: usize = 128;

/// Maximum length of a currency / unit code.
pub const MAX_CURRENCY_LEN: usize = 16;

/// Namespace for deterministic account ids (UUIDv5 of `owner`/`currency`).
const ACCOUNT_NAMESPACE: Uuid = Uuid::from_u128(0x5f0c_7a1e_9b3d_4e62_a8f1_0d2c_6b47_e913);

// =============================================================================
// Accounts
// =============================================================================

/// Stable account identifier, derived from the owning user and currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub Uuid);

impl AccountId {
    /// Derive the id for an account reference.
    pub fn for_ref(account_ref: &AccountRef) -> Self {
        let name = format!("{}\u{1f}{}", account_ref.owner, account_ref.currency);
        Self(Uuid::new_v5(&ACCOUNT_NAMESPACE, name.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(Self)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Human-facing account address: the owning user id and a currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountRef {
    pub owner: String,
    pub currency: String,
}

impl AccountRef {
    /// Build a normalized reference (trimmed owner, upper-case currency).
    pub fn new(owner: impl AsRef<str>, currency: impl AsRef<str>) -> Self {
        Self {
            owner: owner.as_ref().trim().to_string(),
            currency: currency.as_ref().trim().to_ascii_uppercase(),
        }
    }

    pub fn id(&self) -> AccountId {
        AccountId::for_ref(self)
    }

    /// Structural check of the reference.
    pub fn is_well_formed(&self) -> bool {
        !self.owner.is_empty()
            && self.owner.len() <= MAX_KEY_LEN
            && !self.currency.is_empty()
            && self.currency.len() <= MAX_CURRENCY_LEN
            && self.currency.chars().all(|c| c.is_ascii_alphanumeric())
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.currency)
    }
}

/// Account lifecycle status. Accounts are never deleted, only deactivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
}

/// Stored account row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    pub currency: String,
    /// Balance in integer minor units.
    pub balance: i64,
    pub version: Version,
    /// Whether the balance may go below zero.
    pub overdraft: bool,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// A fresh, empty, active account.
    pub fn open(account_ref: &AccountRef, overdraft: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: account_ref.id(),
            owner: account_ref.owner.clone(),
            currency: account_ref.currency.clone(),
            balance: 0,
            version: 0,
            overdraft,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn account_ref(&self) -> AccountRef {
        AccountRef {
            owner: self.owner.clone(),
            currency: self.currency.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Whether `balance` is an allowed resulting balance for this account.
    pub fn permits(&self, balance: i64) -> bool {
        balance >= 0 || self.overdraft
    }
}

// =============================================================================
// Postings
// =============================================================================

/// Immutable record of one account's balance delta for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub operation_id: Uuid,
    pub account_id: AccountId,
    pub delta: i64,
    pub resulting_balance: i64,
    /// Account version produced by this posting.
    pub version: Version,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Operations
// =============================================================================

/// Kind of balance-affecting operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Credit,
    Debit,
    Transfer,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Credit => "credit",
            OperationKind::Debit => "debit",
            OperationKind::Transfer => "transfer",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submitted operation, as received from the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub idempotency_key: String,
    /// Amount in integer minor units.
    pub amount: u64,
    pub currency: String,
    /// Owner of the debited account (debit, transfer).
    pub source: Option<String>,
    /// Owner of the credited account (credit, transfer).
    pub destination: Option<String>,
    pub memo: Option<String>,
}

impl OperationRequest {
    pub fn credit(key: &str, owner: &str, currency: &str, amount: u64) -> Self {
        Self::build(OperationKind::Credit, key, None, Some(owner), currency, amount)
    }

    pub fn debit(key: &str, owner: &str, currency: &str, amount: u64) -> Self {
        Self::build(OperationKind::Debit, key, Some(owner), None, currency, amount)
    }

    pub fn transfer(key: &str, from: &str, to: &str, currency: &str, amount: u64) -> Self {
        Self::build(OperationKind::Transfer, key, Some(from), Some(to), currency, amount)
    }

    fn build(
        kind: OperationKind,
        key: &str,
        source: Option<&str>,
        destination: Option<&str>,
        currency: &str,
        amount: u64,
    ) -> Self {
        Self {
            kind,
            idempotency_key: key.to_string(),
            amount,
            currency: currency.to_string(),
            source: source.map(str::to_string),
            destination: destination.map(str::to_string),
            memo: None,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn source_ref(&self) -> Option<AccountRef> {
        self.source
            .as_deref()
            .map(|owner| AccountRef::new(owner, &self.currency))
    }

    pub fn destination_ref(&self) -> Option<AccountRef> {
        self.destination
            .as_deref()
            .map(|owner| AccountRef::new(owner, &self.currency))
    }

    /// SHA-256 over the effect-bearing fields, hex encoded.
    ///
    /// Every field is length-prefixed, so no choice of owner names can make
    /// two different requests hash the same input. The memo is not part of
    /// the fingerprint.
    pub fn fingerprint(&self) -> String {
        fn field(hasher: &mut Sha256, value: Option<&str>) {
            match value {
                Some(value) => {
                    hasher.update([1u8]);
                    hasher.update((value.len() as u64).to_be_bytes());
                    hasher.update(value.as_bytes());
                }
                None => hasher.update([0u8]),
            }
        }

        let mut hasher = Sha256::new();
        field(&mut hasher, Some(self.kind.as_str()));
        hasher.update(self.amount.to_be_bytes());
        field(&mut hasher, Some(self.currency.trim().to_ascii_uppercase().as_str()));
        field(&mut hasher, self.source.as_deref().map(str::trim));
        field(&mut hasher, self.destination.as_deref().map(str::trim));

        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Structural validation. Produces the legs to post or a rejection.
    pub fn plan(&self) -> Result<OperationPlan, RejectReason> {
        let amount = i64::try_from(self.amount)
            .ok()
            .filter(|a| *a > 0)
            .ok_or(RejectReason::InvalidAmount)?;

        let source = self.source_ref();
        let destination = self.destination_ref();

        let (debit, credit) = match self.kind {
            OperationKind::Credit => match (source, destination) {
                (None, Some(dest)) => (None, Some(dest)),
                _ => return Err(RejectReason::InvalidAccountRef),
            },
            OperationKind::Debit => match (source, destination) {
                (Some(src), None) => (Some(src), None),
                _ => return Err(RejectReason::InvalidAccountRef),
            },
            OperationKind::Transfer => match (source, destination) {
                (Some(src), Some(dest)) => {
                    if src == dest {
                        return Err(RejectReason::SameAccount);
                    }
                    (Some(src), Some(dest))
                }
                _ => return Err(RejectReason::InvalidAccountRef),
            },
        };

        if debit.iter().chain(credit.iter()).any(|r| !r.is_well_formed()) {
            return Err(RejectReason::InvalidAccountRef);
        }

        Ok(OperationPlan {
            kind: self.kind,
            amount,
            debit,
            credit,
        })
    }
}

/// Validated legs of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationPlan {
    pub kind: OperationKind,
    pub amount: i64,
    pub debit: Option<AccountRef>,
    pub credit: Option<AccountRef>,
}

impl OperationPlan {
    /// Only plain credits may open the destination account.
    pub fn creates_destination(&self) -> bool {
        self.kind == OperationKind::Credit
    }

    pub fn accounts(&self) -> impl Iterator<Item = &AccountRef> {
        self.debit.iter().chain(self.credit.iter())
    }
}

/// Business reason for a terminal rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidAmount,
    InvalidAccountRef,
    SameAccount,
    UnknownAccount,
    AccountInactive,
    InsufficientFunds,
    BalanceOverflow,
    Contention,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidAmount => "invalid_amount",
            RejectReason::InvalidAccountRef => "invalid_account_ref",
            RejectReason::SameAccount => "same_account",
            RejectReason::UnknownAccount => "unknown_account",
            RejectReason::AccountInactive => "account_inactive",
            RejectReason::InsufficientFunds => "insufficient_funds",
            RejectReason::BalanceOverflow => "balance_overflow",
            RejectReason::Contention => "contention",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Applied {
        postings: Vec<Posting>,
        committed_at: DateTime<Utc>,
    },
    Rejected {
        reason: RejectReason,
    },
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied { .. })
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Outcome::Applied { .. } => None,
            Outcome::Rejected { reason } => Some(*reason),
        }
    }

    pub fn postings(&self) -> &[Posting] {
        match self {
            Outcome::Applied { postings, .. } => postings,
            Outcome::Rejected { .. } => &[],
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Applied { .. } => f.write_str("applied"),
            Outcome::Rejected { reason } => write!(f, "rejected:{reason}"),
        }
    }
}

/// Idempotency key scoped to the submitting caller.
///
/// Stored as `<len(user_id)>:<user_id>:<key>`. The length prefix keeps the
/// mapping injective when user ids or keys contain `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationKey(String);

impl OperationKey {
    pub fn scoped(user_id: &str, key: &str) -> LedgerResult<Self> {
        let key = key.trim();
        if key.is_empty() {
            return Err(LedgerError::Validation(
                "idempotency key is required".to_string(),
            ));
        }
        if key.chars().count() > MAX_KEY_LEN {
            return Err(LedgerError::Validation(format!(
                "idempotency key exceeds {MAX_KEY_LEN} characters"
            )));
        }
        Ok(Self(format!("{}:{user_id}:{key}", user_id.len())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of an operation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Completed,
}

/// Persisted operation row backing the idempotency guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub key: OperationKey,
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub fingerprint: String,
    pub status: OperationStatus,
    pub outcome: Option<Outcome>,
    /// Identifies the attempt currently allowed to complete this row.
    pub claim_token: Uuid,
    #[serde(default)]
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl OperationRecord {
    pub fn pending(
        key: OperationKey,
        kind: OperationKind,
        fingerprint: String,
        memo: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            operation_id: Uuid::new_v4(),
            kind,
            fingerprint,
            status: OperationStatus::Pending,
            outcome: None,
            claim_token: Uuid::new_v4(),
            memo,
            created_at: now,
            claimed_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status == OperationStatus::Completed
    }
}
