//! Post-commit domain events.
//!
//! Components publish an event only after their database transaction has
//! committed. Delivery is fire-and-forget: a sink never fails the operation
//! that produced the event.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
#[cfg(test)]
use tokio::sync::mpsc;
use tracing::info;

use crate::telemetry::Metrics;
use crate::types::{now_millis, string_enum};

string_enum! {
    /// All event kinds emitted by the money-movement components.
    pub enum EventKind {
        /// Funds were earmarked against a balance.
        HoldCreated => "hold_created",
        /// A hold returned its funds to the available balance.
        HoldReleased => "hold_released",
        /// A hold was settled with a ledger debit.
        HoldCaptured => "hold_captured",
        /// A transaction completed and its ledger posting was booked.
        TransactionCompleted => "transaction_completed",
        TransactionFailed => "transaction_failed",
        TransactionCancelled => "transaction_cancelled",
        /// A completed transaction was refunded with a compensating entry.
        TransactionRefunded => "transaction_refunded",
        /// A provider snapshot disagreed with the ledger.
        DriftDetected => "drift_detected",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub user_id: i64,
    /// ID of the hold / transaction / wallet the event is about.
    pub entity_id: i64,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub occurred_at: i64,
}

impl DomainEvent {
    pub fn new(kind: EventKind, user_id: i64, entity_id: i64) -> Self {
        Self {
            kind,
            user_id,
            entity_id,
            amount: None,
            currency: None,
            occurred_at: now_millis(),
        }
    }

    pub fn with_amount(mut self, amount: Decimal, currency: &str) -> Self {
        self.amount = Some(amount);
        self.currency = Some(currency.to_string());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: DomainEvent);
}

/// Production sink: structured log line plus the per-kind event counter.
pub struct LogSink {
    metrics: Arc<Metrics>,
}

impl LogSink {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl EventSink for LogSink {
    fn publish(&self, event: DomainEvent) {
        self.metrics
            .events
            .with_label_values(&[event.kind.as_str()])
            .inc();
        info!(
            kind = %event.kind,
            user_id = event.user_id,
            entity_id = event.entity_id,
            amount = ?event.amount,
            currency = ?event.currency,
            "domain event"
        );
    }
}

/// Forwards events to an in-process consumer.
#[cfg(test)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DomainEvent>,
}

#[cfg(test)]
impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DomainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[cfg(test)]
impl EventSink for ChannelSink {
    fn publish(&self, event: DomainEvent) {
        // A gone consumer is not the producer's problem.
        let _ = self.tx.send(event);
    }
}
