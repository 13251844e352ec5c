// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use foxya_ledger::{
    api::router,
    config::{LedgerConfig, LogFormat, DEFAULT_LOG_FILTER},
    ledger::{events::run_audit_log, OperationReaper},
    state::AppState,
};

#[tokio::main]
async fn main() {
    let config = LedgerConfig::from_env().expect("Invalid configuration");
    init_tracing(config.log_format);

    std::fs::create_dir_all(&config.data_dir).expect("Failed to create data directory");
    let state = AppState::from_config(&config).expect("Failed to open ledger database");

    if state.auth_config.is_production() {
        info!("JWT verification enabled (HS256)");
    } else {
        warn!("JWT_SECRET not set - running in development mode, token signatures are NOT verified");
    }

    let shutdown = CancellationToken::new();

    let reaper = OperationReaper::new(
        state.ledger.store().clone(),
        config.retention,
        config.reaper_interval,
    );
    let reaper_task = tokio::spawn(reaper.run(shutdown.clone()));
    let audit_task = tokio::spawn(run_audit_log(state.events.subscribe(), shutdown.clone()));

    let events = state.events.clone();
    let app = router(state);

    let addr = config.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .expect("Failed to bind listen address");
    info!(%addr, data_dir = %config.data_dir.display(), "Foxya ledger listening");
    info!("Swagger UI: http://{addr}/docs");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
    }

    info!("Shutting down background tasks");
    shutdown.cancel();
    events.close();
    let _ = tokio::join!(reaper_task, audit_task);
    info!("Foxya ledger stopped");
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
