//! Payment-provider balance client. Pulls reported balances for the
//! reconciler.
//!
//! The provider exposes `GET <base>/accounts/<account id>/balance`, answering
//! `{"balance": "...", "currency": "USD", "balance_id": "...", "as_of": "<rfc3339>"}`.
//!
//! ## Resilience
//!
//! * Exponential back-off is applied on transport errors, rate limiting
//!   (429) and server errors (5xx), up to [`MAX_BACKOFF`].
//! * Other non-success statuses are hard failures and are not retried.
//! * After `max_attempts` the request is abandoned for this sweep.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::{AppError, Result};
use crate::types::normalize_currency;
use crate::wallets::{NewSnapshot, Wallet};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderBalance {
    pub balance: Decimal,
    pub currency: String,
    #[serde(alias = "balanceId")]
    pub balance_id: String,
    #[serde(default, alias = "asOf")]
    pub as_of: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderClient {
    client: Client,
    base_url: String,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl ProviderClient {
    pub fn new(client: Client, base_url: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            max_attempts: max_attempts.max(1),
            initial_backoff: INITIAL_BACKOFF,
        }
    }

    #[cfg(test)]
    fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Fetch the provider's current balance for one account.
    pub async fn fetch_balance(&self, account_id: &str) -> Result<ProviderBalance> {
        let url = format!("{}/accounts/{account_id}/balance", self.base_url);
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;

        loop {
            let failure = match self.client.get(&url).send().await {
                Err(e) => format!("request failed: {e}"),
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        format!("provider answered {status}")
                    } else if !status.is_success() {
                        return Err(AppError::Provider(format!(
                            "balance request for {account_id} rejected with {status}"
                        )));
                    } else {
                        let body: ProviderBalance = resp.json().await?;
                        debug!(
                            "Provider balance for {account_id}: {} {} ({})",
                            body.balance, body.currency, body.balance_id
                        );
                        return Ok(body);
                    }
                }
            };

            if attempt >= self.max_attempts {
                return Err(AppError::Provider(format!(
                    "giving up on {account_id} after {attempt} attempts: {failure}"
                )));
            }
            warn!("Provider balance request for {account_id} failed (will retry in {backoff:?}): {failure}");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
            attempt += 1;
        }
    }
}

/// Turn a provider report into a snapshot request for `wallet`. The
/// idempotency key is derived from the account and the provider's balance
/// ID, so re-reading an unchanged balance records nothing new.
pub fn to_snapshot(wallet: &Wallet, reported: &ProviderBalance) -> Result<NewSnapshot> {
    let currency = normalize_currency(&reported.currency)?;
    if currency != wallet.currency {
        return Err(AppError::Provider(format!(
            "provider reported {currency} for wallet {} held in {}",
            wallet.id, wallet.currency
        )));
    }

    // Balance IDs are only unique per provider account.
    let external_balance_id = format!("{}:{}", wallet.provider_account_id, reported.balance_id);
    Ok(NewSnapshot {
        provider: wallet.provider.clone(),
        balance: reported.balance,
        idempotency_key: format!("{}:{external_balance_id}", wallet.provider),
        external_balance_id,
        reported_at: reported.as_of.as_deref().and_then(parse_iso_to_millis),
    })
}

/// Parse an RFC 3339 timestamp into Unix epoch milliseconds.
fn parse_iso_to_millis(s: &str) -> Option<i64> {
    use chrono::DateTime;
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::{
        extract::{Path, State},
        http::StatusCode as HttpStatus,
        response::{IntoResponse, Response},
        routing::get,
        Json, Router,
    };

    use super::*;

    /// Serve `router` on an ephemeral local port, returning its base URL.
    pub(crate) async fn spawn_stub(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Provider stub answering `balance` for every account; the first
    /// `failures` calls get a 503.
    pub(crate) fn stub_provider(balance: &'static str, failures: usize) -> (Router, Arc<AtomicUsize>) {
        stub_provider_with_id(balance, failures, None)
    }

    /// Like [`stub_provider`], but every account reports `balance_id` when
    /// one is given.
    pub(crate) fn stub_provider_with_id(
        balance: &'static str,
        failures: usize,
        balance_id: Option<&'static str>,
    ) -> (Router, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/accounts/:id/balance",
                get(
                    move |State(calls): State<Arc<AtomicUsize>>, Path(id): Path<String>| async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n < failures {
                            return HttpStatus::SERVICE_UNAVAILABLE.into_response();
                        }
                        let balance_id = balance_id
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("bal-{id}"));
                        Json(serde_json::json!({
                            "balance": balance,
                            "currency": "usd",
                            "balance_id": balance_id,
                        }))
                        .into_response()
                    },
                ),
            )
            .with_state(calls.clone());
        (router, calls)
    }

    fn client(base_url: String, attempts: u32) -> ProviderClient {
        ProviderClient::new(Client::new(), base_url, attempts)
            .with_initial_backoff(Duration::from_millis(1))
    }

    fn wallet() -> Wallet {
        Wallet {
            id: 3,
            user_id: 1,
            provider: "stripe".into(),
            provider_account_id: "acct_1".into(),
            currency: "USD".into(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn retries_through_transient_failures() {
        let (router, calls) = stub_provider("42.50", 2);
        let base = spawn_stub(router).await;

        let balance = client(base, 5).fetch_balance("acct_1").await.unwrap();
        assert_eq!(balance.balance, Decimal::new(4250, 2));
        assert_eq!(balance.balance_id, "bal-acct_1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_budget() {
        let (router, calls) = stub_provider("1", usize::MAX);
        let base = spawn_stub(router).await;

        let err = client(base, 3).fetch_balance("acct_1").await.unwrap_err();
        assert!(matches!(err, AppError::Provider(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/accounts/:id/balance",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Response::builder()
                        .status(HttpStatus::NOT_FOUND)
                        .body(axum::body::Body::empty())
                        .unwrap()
                }
            }),
        );
        let base = spawn_stub(router).await;

        let err = client(base, 5).fetch_balance("acct_9").await.unwrap_err();
        assert!(matches!(err, AppError::Provider(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshot_key_is_scoped_to_provider_account() {
        let reported = ProviderBalance {
            balance: Decimal::new(10, 0),
            currency: "usd".into(),
            balance_id: "bal-9".into(),
            as_of: Some("2024-01-01T00:00:00Z".into()),
        };
        let snapshot = to_snapshot(&wallet(), &reported).unwrap();
        assert_eq!(snapshot.idempotency_key, "stripe:acct_1:bal-9");
        assert_eq!(snapshot.external_balance_id, "acct_1:bal-9");
        assert_eq!(snapshot.reported_at, Some(1_704_067_200_000));
    }

    #[test]
    fn currency_mismatch_is_rejected() {
        let reported = ProviderBalance {
            balance: Decimal::ONE,
            currency: "EUR".into(),
            balance_id: "bal-1".into(),
            as_of: None,
        };
        assert!(matches!(
            to_snapshot(&wallet(), &reported),
            Err(AppError::Provider(_))
        ));
    }

    #[test]
    fn parses_numeric_or_string_balances() {
        let numeric: ProviderBalance =
            serde_json::from_str(r#"{"balance": 12.5, "currency": "USD", "balanceId": "b"}"#)
                .unwrap();
        assert_eq!(numeric.balance, Decimal::new(125, 1));
        assert!(numeric.as_of.is_none());
    }

    #[test]
    fn parse_iso_timestamp() {
        assert_eq!(
            parse_iso_to_millis("2024-01-01T00:00:00Z"),
            Some(1_704_067_200_000)
        );
        assert_eq!(parse_iso_to_millis("yesterday"), None);
    }
}
