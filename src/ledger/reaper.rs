// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Operation Reaper
//!
//! Low-priority background task that moves terminal operations older than
//! the retention window from the hot `operations` table into the archive.
//! Archived keys still replay, so archival never re-enables execution.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken` for graceful shutdown.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::{LedgerStore, StoreHandle, StoreResult};

/// Rows archived per write transaction.
const ARCHIVE_BATCH: usize = 500;

pub struct OperationReaper<S> {
    store: StoreHandle<S>,
    retention: Duration,
    interval: Duration,
}

impl<S: LedgerStore> OperationReaper<S> {
    pub fn new(store: StoreHandle<S>, retention: Duration, interval: Duration) -> Self {
        Self {
            store,
            retention,
            interval,
        }
    }

    /// Run the reaper loop until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(reaper.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            retention_secs = self.retention.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Operation reaper starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Operation reaper shutting down");
                return;
            }

            match self.sweep().await {
                Ok(0) => debug!("Operation reaper: nothing to archive"),
                Ok(moved) => info!(moved, "Operation reaper: archived operations"),
                Err(e) => warn!(error = %e, "Operation reaper sweep failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Operation reaper shutting down");
                    return;
                }
            }
        }
    }

    /// Archive everything past retention, one batch per transaction.
    pub async fn sweep(&self) -> StoreResult<usize> {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = Utc::now() - retention;

        let mut total = 0;
        loop {
            let moved = self
                .store
                .call(move |s| s.archive_operations(cutoff, ARCHIVE_BATCH))
                .await?;
            total += moved;
            if moved < ARCHIVE_BATCH {
                return Ok(total);
            }
        }
    }
}
