// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Domain events emitted after a commit.
//!
//! Publishing is fire-and-forget: a failed publish is logged by the engine
//! and never undoes or fails the committed operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::types::{OperationKind, Posting};

pub const OPERATION_APPLIED: &str = "operation.applied";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("event channel closed")]
    Closed,
}

/// Notification that an operation's postings were committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub operation_id: Uuid,
    pub kind: OperationKind,
    /// Scoped idempotency key of the operation.
    pub key: String,
    pub memo: Option<String>,
    pub postings: Vec<Posting>,
}

impl LedgerEvent {
    pub fn operation_applied(
        operation_id: Uuid,
        kind: OperationKind,
        key: String,
        memo: Option<String>,
        postings: Vec<Posting>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: OPERATION_APPLIED.to_string(),
            occurred_at: Utc::now(),
            operation_id,
            kind,
            key,
            memo,
            postings,
        }
    }
}

/// Outbound event sink for notification and audit collaborators.
pub trait EventPublisher: Send + Sync + 'static {
    fn publish(&self, event: LedgerEvent) -> Result<(), PublishError>;
}

/// In-process fan-out over a broadcast channel.
#[derive(Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<LedgerEvent>,
    closed: Arc<AtomicBool>,
}

impl BroadcastPublisher {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            sender,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    /// Refuse further events (shutdown).
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: LedgerEvent) -> Result<(), PublishError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Closed);
        }
        // No receivers is not an error for fire-and-forget delivery.
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Log every event as an audit record until `shutdown` fires.
pub async fn run_audit_log(
    mut events: broadcast::Receiver<LedgerEvent>,
    shutdown: CancellationToken,
) {
    info!("Ledger audit log starting");
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    let deltas: Vec<i64> = event.postings.iter().map(|p| p.delta).collect();
                    info!(
                        target: "ledger_audit",
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        operation_id = %event.operation_id,
                        kind = %event.kind,
                        key = %event.key,
                        memo = ?event.memo,
                        deltas = ?deltas,
                        "Ledger event"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Ledger audit log lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Ledger event channel closed");
                    return;
                }
            },
            _ = shutdown.cancelled() => {
                info!("Ledger audit log shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LedgerEvent {
        LedgerEvent::operation_applied(
            Uuid::new_v4(),
            OperationKind::Credit,
            "admin:k1".to_string(),
            Some("welcome bonus".to_string()),
            vec![],
        )
    }

    #[test]
    fn publish_without_subscribers_succeeds() {
        let publisher = BroadcastPublisher::new(8);
        assert_eq!(publisher.publish(sample()), Ok(()));
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();
        let event = sample();
        publisher.publish(event.clone()).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
        assert_eq!(received.event_type, OPERATION_APPLIED);
    }

    #[test]
    fn closed_publisher_refuses_events() {
        let publisher = BroadcastPublisher::new(8);
        publisher.close();
        assert_eq!(publisher.publish(sample()), Err(PublishError::Closed));
    }

    #[tokio::test]
    async fn audit_log_stops_on_shutdown() {
        let publisher = BroadcastPublisher::new(8);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_audit_log(publisher.subscribe(), shutdown.clone()));
        publisher.publish(sample()).unwrap();
        shutdown.cancel();
        task.await.unwrap();
    }
}
