// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::HeaderName,
    routing::{get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    models::{AccountView, OperationKindDto, PostingView},
    state::AppState,
};

pub mod admin;
pub mod balances;
pub mod health;
pub mod operations;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/operations", post(operations::submit_operation))
        .route("/operations/{key}", get(operations::get_operation))
        .route("/balances/{owner}/{currency}", get(balances::get_balance))
        .route(
            "/accounts/{owner}/{currency}/postings",
            get(balances::account_history),
        )
        .route("/admin/accounts", post(admin::open_account))
        .route(
            "/admin/accounts/{owner}/{currency}/overdraft",
            put(admin::set_overdraft),
        )
        .route(
            "/admin/accounts/{owner}/{currency}/deactivate",
            post(admin::deactivate_account),
        )
        .route(
            "/admin/accounts/{owner}/{currency}/reconcile",
            get(admin::reconcile),
        );

    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .nest("/v1", v1_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id)),
        )
        .layer(CorsLayer::permissive())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        health::liveness,
        health::readiness,
        operations::submit_operation,
        operations::get_operation,
        balances::get_balance,
        balances::account_history,
        admin::open_account,
        admin::set_overdraft,
        admin::deactivate_account,
        admin::reconcile
    ),
    components(
        schemas(
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse,
            OperationKindDto,
            PostingView,
            AccountView,
            operations::SubmitOperationRequest,
            operations::OperationResponse,
            operations::OperationRecordResponse,
            balances::BalanceResponse,
            balances::HistoryResponse,
            admin::OpenAccountRequest,
            admin::SetOverdraftRequest,
            admin::ReconciliationResponse
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Liveness and readiness probes"),
        (name = "Operations", description = "Idempotent credits, debits and transfers"),
        (name = "Balances", description = "Balances and posting history"),
        (name = "Admin", description = "Account administration and reconciliation")
    )
)]
struct ApiDoc;
