//! Prometheus metrics, built once in `main` and shared through application
//! state. The registry is owned, not global, so tests get a fresh one.
//!
//! Naming convention: `escrow_<area>_<metric>_total`.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    /// HTTP responses by status class (`2xx`, `4xx`, ...).
    pub http_responses: IntCounterVec,
    /// Domain events published, by kind.
    pub events: IntCounterVec,
    /// Sweeper runs by outcome (`ok`, `error`).
    pub sweeps: IntCounterVec,
    pub balances_pulled: IntCounter,
    pub drifts_flagged: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let http_responses = IntCounterVec::new(
            Opts::new("escrow_http_responses_total", "HTTP responses by status class"),
            &["class"],
        )?;
        let events = IntCounterVec::new(
            Opts::new("escrow_events_total", "Domain events published"),
            &["kind"],
        )?;
        let sweeps = IntCounterVec::new(
            Opts::new("escrow_sweeper_runs_total", "Reconciliation sweeps"),
            &["outcome"],
        )?;
        let balances_pulled = IntCounter::new(
            "escrow_sweeper_balances_pulled_total",
            "Provider balances recorded as snapshots",
        )?;
        let drifts_flagged = IntCounter::new(
            "escrow_sweeper_drifts_total",
            "Wallets found outside tolerance by the sweeper",
        )?;

        registry.register(Box::new(http_responses.clone()))?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(sweeps.clone()))?;
        registry.register(Box::new(balances_pulled.clone()))?;
        registry.register(Box::new(drifts_flagged.clone()))?;

        Ok(Self {
            registry,
            http_responses,
            events,
            sweeps,
            balances_pulled,
            drifts_flagged,
        })
    }

    /// Encode every registered metric in the Prometheus text format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

/// Axum middleware counting responses by status class.
pub async fn track_requests(
    State(metrics): State<Arc<Metrics>>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    metrics
        .http_responses
        .with_label_values(&[status_class(response.status().as_u16())])
        .inc();
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert_eq!(status_class(201), "2xx");
        assert_eq!(status_class(404), "4xx");
        assert_eq!(status_class(502), "5xx");
    }

    #[test]
    fn encodes_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.events.with_label_values(&["hold_created"]).inc_by(2);
        metrics.drifts_flagged.inc();

        let text = metrics.encode().unwrap();
        assert!(text.contains("escrow_events_total{kind=\"hold_created\"} 2"));
        assert!(text.contains("escrow_sweeper_drifts_total 1"));
    }

    #[test]
    fn registries_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.balances_pulled.inc();
        assert_eq!(a.balances_pulled.get(), 1);
        assert_eq!(b.balances_pulled.get(), 0);
    }
}
