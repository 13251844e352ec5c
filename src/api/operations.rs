// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Operation submission and lookup endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::Auth,
    error::ApiError,
    ledger::{OperationRecord, OperationRequest, OperationStatus, Outcome, Submission},
    models::{OperationKindDto, PostingView},
    state::AppState,
};

/// Maximum memo length in characters.
const MAX_MEMO_LEN: usize = 256;

/// Request to apply a credit, debit or transfer.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SubmitOperationRequest {
    pub kind: OperationKindDto,
    /// Caller-chosen key; resubmitting it returns the stored outcome
    pub idempotency_key: String,
    /// Amount in minor units, must be positive
    pub amount: u64,
    pub currency: String,
    /// Owner of the debited account (debit, transfer)
    #[serde(default)]
    pub source: Option<String>,
    /// Owner of the credited account (credit, transfer)
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub memo: Option<String>,
}

impl SubmitOperationRequest {
    fn into_domain(self) -> Result<OperationRequest, ApiError> {
        if let Some(memo) = &self.memo {
            if memo.chars().count() > MAX_MEMO_LEN {
                return Err(ApiError::bad_request(format!(
                    "memo exceeds {MAX_MEMO_LEN} characters"
                )));
            }
        }
        Ok(OperationRequest {
            kind: self.kind.into(),
            idempotency_key: self.idempotency_key,
            amount: self.amount,
            currency: self.currency,
            source: self.source,
            destination: self.destination,
            memo: self.memo,
        })
    }
}

/// Terminal outcome of a submission.
#[derive(Debug, Serialize, ToSchema)]
pub struct OperationResponse {
    /// Scoped idempotency key (`<len(user_id)>:<user_id>:<key>`)
    pub key: String,
    pub operation_id: Uuid,
    pub kind: OperationKindDto,
    /// `applied` or `rejected`
    pub status: String,
    /// Rejection reason, e.g. `insufficient_funds`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// `applied` or `rejected:<reason>`
    pub outcome: String,
    /// The outcome was recorded by an earlier submission
    pub replayed: bool,
    pub postings: Vec<PostingView>,
}

impl From<Submission> for OperationResponse {
    fn from(submission: Submission) -> Self {
        let (status, reason, postings) = describe(&submission.outcome);
        Self {
            key: submission.key.to_string(),
            operation_id: submission.operation_id,
            kind: submission.kind.into(),
            status,
            reason,
            outcome: submission.outcome.to_string(),
            replayed: submission.replayed,
            postings,
        }
    }
}

/// Stored operation, possibly still in flight.
#[derive(Debug, Serialize, ToSchema)]
pub struct OperationRecordResponse {
    pub key: String,
    pub operation_id: Uuid,
    pub kind: OperationKindDto,
    /// `pending`, `applied` or `rejected`
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub postings: Vec<PostingView>,
}

impl From<OperationRecord> for OperationRecordResponse {
    fn from(record: OperationRecord) -> Self {
        let (status, reason, postings) = match (&record.status, &record.outcome) {
            (OperationStatus::Completed, Some(outcome)) => describe(outcome),
            _ => ("pending".to_string(), None, Vec::new()),
        };
        Self {
            key: record.key.to_string(),
            operation_id: record.operation_id,
            kind: record.kind.into(),
            status,
            reason,
            outcome: record.outcome.as_ref().map(ToString::to_string),
            memo: record.memo,
            created_at: record.created_at,
            completed_at: record.completed_at,
            postings,
        }
    }
}

fn describe(outcome: &Outcome) -> (String, Option<String>, Vec<PostingView>) {
    match outcome {
        Outcome::Applied { postings, .. } => (
            "applied".to_string(),
            None,
            postings.iter().map(PostingView::from).collect(),
        ),
        Outcome::Rejected { reason } => (
            "rejected".to_string(),
            Some(reason.as_str().to_string()),
            Vec::new(),
        ),
    }
}

/// Submit a credit, debit or transfer.
///
/// Applied operations return 200, business rejections 422; both carry the
/// outcome and are replayed for the same idempotency key.
#[utoipa::path(
    post,
    path = "/v1/operations",
    tag = "Operations",
    request_body = SubmitOperationRequest,
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Operation applied", body = OperationResponse),
        (status = 400, description = "Malformed request"),
        (status = 401, description = "Not authenticated"),
        (status = 403, description = "Not allowed to move funds from this account"),
        (status = 409, description = "Duplicate still in flight, retry later"),
        (status = 422, description = "Operation rejected, or key reused with a different payload", body = OperationResponse),
        (status = 503, description = "Storage unavailable, retry later")
    )
)]
pub async fn submit_operation(
    Auth(user): Auth,
    State(state): State<AppState>,
    Json(request): Json<SubmitOperationRequest>,
) -> Result<(StatusCode, Json<OperationResponse>), ApiError> {
    let request = request.into_domain()?;
    let submission = state.ledger.submit_operation(&user, request).await?;

    let status = if submission.outcome.is_applied() {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    Ok((status, Json(submission.into())))
}

/// Look up one of the caller's operations by idempotency key.
#[utoipa::path(
    get,
    path = "/v1/operations/{key}",
    tag = "Operations",
    params(("key" = String, Path, description = "Idempotency key as submitted")),
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Stored operation", body = OperationRecordResponse),
        (status = 401, description = "Not authenticated"),
        (status = 404, description = "Unknown key")
    )
)]
pub async fn get_operation(
    Auth(user): Auth,
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<OperationRecordResponse>, ApiError> {
    let record = state.ledger.get_operation(&user, &key).await?;
    Ok(Json(record.into()))
}
