// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Admin-only account management endpoints.
//!
//! These endpoints require the Admin role and provide:
//! - Explicit account opening (with overdraft policy)
//! - Overdraft changes and deactivation
//! - Reconciliation of a balance against its posting log

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    auth::AdminOnly,
    error::ApiError,
    ledger::AccountRef,
    models::AccountView,
    state::AppState,
};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct OpenAccountRequest {
    pub owner: String,
    pub currency: String,
    /// Allow the balance to go below zero.
    #[serde(default)]
    pub overdraft: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetOverdraftRequest {
    pub overdraft: bool,
}

/// Result of comparing a balance with the sum of its postings.
#[derive(Debug, Serialize, ToSchema)]
pub struct ReconciliationResponse {
    pub account: AccountView,
    /// Sum of all posting deltas.
    pub postings_sum: i64,
    pub posting_count: u64,
    /// Balance equals `postings_sum` and version equals `posting_count`.
    pub consistent: bool,
}

// ============================================================================
// Handlers
// ============================================================================

/// Open an account explicitly.
#[utoipa::path(
    post,
    path = "/v1/admin/accounts",
    tag = "Admin",
    request_body = OpenAccountRequest,
    security(("bearer_auth" = [])),
    responses(
        (status = 201, description = "Account opened", body = AccountView),
        (status = 400, description = "Invalid owner or currency"),
        (status = 403, description = "Admin role required")
    )
)]
pub async fn open_account(
    AdminOnly(user): AdminOnly,
    State(state): State<AppState>,
    Json(request): Json<OpenAccountRequest>,
) -> Result<(StatusCode, Json<AccountView>), ApiError> {
    let account_ref = AccountRef::new(&request.owner, &request.currency);
    let account = state
        .ledger
        .open_account(&user, &account_ref, request.overdraft)
        .await?;
    Ok((StatusCode::CREATED, Json(account.into())))
}

/// Allow or forbid negative balances on an account.
#[utoipa::path(
    put,
    path = "/v1/admin/accounts/{owner}/{currency}/overdraft",
    tag = "Admin",
    params(
        ("owner" = String, Path, description = "Account owner id"),
        ("currency" = String, Path, description = "Currency code")
    ),
    request_body = SetOverdraftRequest,
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Account updated", body = AccountView),
        (status = 403, description = "Admin role required"),
        (status = 404, description = "Account not found")
    )
)]
pub async fn set_overdraft(
    AdminOnly(user): AdminOnly,
    State(state): State<AppState>,
    Path((owner, currency)): Path<(String, String)>,
    Json(request): Json<SetOverdraftRequest>,
) -> Result<Json<AccountView>, ApiError> {
    let account_ref = AccountRef::new(owner, currency);
    let account = state
        .ledger
        .set_overdraft(&user, &account_ref, request.overdraft)
        .await?;
    Ok(Json(account.into()))
}

/// Deactivate an account. Its postings are kept; further operations touching
/// it are rejected with `account_inactive`.
#[utoipa::path(
    post,
    path = "/v1/admin/accounts/{owner}/{currency}/deactivate",
    tag = "Admin",
    params(
        ("owner" = String, Path, description = "Account owner id"),
        ("currency" = String, Path, description = "Currency code")
    ),
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Account deactivated", body = AccountView),
        (status = 403, description = "Admin role required"),
        (status = 404, description = "Account not found")
    )
)]
pub async fn deactivate_account(
    AdminOnly(user): AdminOnly,
    State(state): State<AppState>,
    Path((owner, currency)): Path<(String, String)>,
) -> Result<Json<AccountView>, ApiError> {
    let account_ref = AccountRef::new(owner, currency);
    let account = state.ledger.deactivate_account(&user, &account_ref).await?;
    Ok(Json(account.into()))
}

#[utoipa::path(
    get,
    path = "/v1/admin/accounts/{owner}/{currency}/reconcile",
    tag = "Admin",
    params(
        ("owner" = String, Path, description = "Account owner id"),
        ("currency" = String, Path, description = "Currency code")
    ),
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Reconciliation report", body = ReconciliationResponse),
        (status = 403, description = "Admin role required"),
        (status = 404, description = "Account not found")
    )
)]
pub async fn reconcile(
    AdminOnly(user): AdminOnly,
    State(state): State<AppState>,
    Path((owner, currency)): Path<(String, String)>,
) -> Result<Json<ReconciliationResponse>, ApiError> {
    let account_ref = AccountRef::new(owner, currency);
    let report = state.ledger.reconcile(&user, &account_ref).await?;
    let consistent = report.is_consistent();
    Ok(Json(ReconciliationResponse {
        account: report.account.into(),
        postings_sum: report.postings_sum,
        posting_count: report.posting_count,
        consistent,
    }))
}
