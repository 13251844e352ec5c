// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Balance and posting history endpoints.
//!
//! Owners read their own accounts; admins and auditors read any account.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    auth::Auth,
    error::ApiError,
    ledger::{engine::DEFAULT_HISTORY_LIMIT, AccountRef},
    models::PostingView,
    state::AppState,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct BalanceResponse {
    pub owner: String,
    pub currency: String,
    /// Balance in minor units
    pub balance: i64,
    /// Number of postings applied to the account
    pub version: u64,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct HistoryQuery {
    /// Maximum number of postings (default 50, max 500)
    pub limit: Option<usize>,
    /// Only postings with a lower version; use `next_before` of the previous page
    pub before: Option<u64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HistoryResponse {
    pub owner: String,
    pub currency: String,
    /// Newest first
    pub postings: Vec<PostingView>,
    /// Cursor for the next (older) page, absent on the last page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_before: Option<u64>,
}

/// Current balance of an account.
#[utoipa::path(
    get,
    path = "/v1/balances/{owner}/{currency}",
    tag = "Balances",
    params(
        ("owner" = String, Path, description = "Account owner id"),
        ("currency" = String, Path, description = "Currency code")
    ),
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Current balance", body = BalanceResponse),
        (status = 401, description = "Not authenticated"),
        (status = 403, description = "Not allowed to read this account"),
        (status = 404, description = "Account not found")
    )
)]
pub async fn get_balance(
    Auth(user): Auth,
    State(state): State<AppState>,
    Path((owner, currency)): Path<(String, String)>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account_ref = AccountRef::new(owner, currency);
    let balance = state.ledger.get_balance(&user, &account_ref).await?;
    Ok(Json(BalanceResponse {
        owner: balance.account.owner,
        currency: balance.account.currency,
        balance: balance.balance,
        version: balance.version,
    }))
}

/// Posting history of an account, newest first.
#[utoipa::path(
    get,
    path = "/v1/accounts/{owner}/{currency}/postings",
    tag = "Balances",
    params(
        ("owner" = String, Path, description = "Account owner id"),
        ("currency" = String, Path, description = "Currency code"),
        HistoryQuery
    ),
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Postings", body = HistoryResponse),
        (status = 401, description = "Not authenticated"),
        (status = 403, description = "Not allowed to read this account"),
        (status = 404, description = "Account not found")
    )
)]
pub async fn account_history(
    Auth(user): Auth,
    State(state): State<AppState>,
    Path((owner, currency)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let account_ref = AccountRef::new(owner, currency);
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let postings = state
        .ledger
        .account_history(&user, &account_ref, query.before, limit)
        .await?;

    // Version 1 is the first posting, nothing is older.
    let next_before = postings
        .last()
        .map(|p| p.version)
        .filter(|version| *version > 1);

    Ok(Json(HistoryResponse {
        owner: account_ref.owner,
        currency: account_ref.currency,
        postings: postings.iter().map(PostingView::from).collect(),
        next_before,
    }))
}
