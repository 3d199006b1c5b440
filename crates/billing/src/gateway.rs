//! Payment gateway contract
//!
//! The engine never speaks a provider protocol itself. It hands a
//! [`ChargeRequest`] (with an explicit deadline and cancellation signal) to a
//! [`PaymentGateway`] and gets back a tagged [`ChargeOutcome`].
//!
//! [`HttpGateway`] is a thin JSON adapter for a charge service sitting in
//! front of the real provider.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// Why a charge did not go through
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum GatewayError {
    #[error("gateway call timed out")]
    Timeout,
    #[error("gateway unreachable: {0}")]
    Unreachable(String),
    #[error("gateway server error (HTTP {status})")]
    ServerError { status: u16 },
    #[error("gateway rate limited")]
    RateLimited { retry_after: Option<u64> },
    /// The engine withdrew the request (e.g. lease lost)
    #[error("charge cancelled")]
    Cancelled,
    #[error("card declined: {0}")]
    CardDeclined(String),
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("flagged as fraud: {0}")]
    FraudSuspected(String),
}

/// Tagged charge result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Approved { reference: String },
    /// The provider answered and refused
    Failed(GatewayError),
    /// No usable answer: timeout, connection failure, cancellation
    Error(GatewayError),
}

/// Sender half of a cancellation signal
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Receiver half, carried inside a [`ChargeRequest`]
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_, signal) = cancellation();
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested; never resolves otherwise
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                // Handle dropped without cancelling
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

/// Everything a gateway needs to charge one renewal
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub subscription_id: Uuid,
    pub business_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub payment_method: Option<String>,
    /// Stable per billing period, so a replayed charge is not billed twice
    pub idempotency_key: String,
    pub deadline: Duration,
    pub cancel: CancelSignal,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: ChargeRequest) -> ChargeOutcome;
}

#[derive(Serialize)]
struct ChargePayload<'a> {
    subscription_id: Uuid,
    business_id: Uuid,
    amount_cents: i64,
    currency: &'a str,
    payment_method: Option<&'a str>,
}

#[derive(Deserialize)]
struct ChargeResponse {
    reference: String,
}

#[derive(Deserialize, Default)]
struct ChargeErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ChargeErrorBody {
    fn reason(&self, status: u16) -> String {
        self.message
            .clone()
            .or_else(|| self.code.clone())
            .unwrap_or_else(|| format!("HTTP {}", status))
    }

    fn is_fraud(&self) -> bool {
        self.code
            .as_deref()
            .is_some_and(|c| c.to_ascii_lowercase().contains("fraud"))
    }
}

/// JSON-over-HTTP gateway adapter
///
/// `POST {base_url}/charges` with an `Idempotency-Key` header. Status codes map
/// to outcomes: 2xx approved, 401/403 invalid credentials, 402 declined
/// (or fraud when the body code says so), 451 fraud, 429 rate limited,
/// 5xx server error. Transport failures are `ChargeOutcome::Error`.
#[derive(Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    async fn send(&self, request: &ChargeRequest) -> ChargeOutcome {
        let payload = ChargePayload {
            subscription_id: request.subscription_id,
            business_id: request.business_id,
            amount_cents: request.amount_cents,
            currency: &request.currency,
            payment_method: request.payment_method.as_deref(),
        };

        let response = match self
            .client
            .post(format!("{}/charges", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", &request.idempotency_key)
            .timeout(request.deadline)
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return ChargeOutcome::Error(GatewayError::Timeout),
            Err(e) => return ChargeOutcome::Error(GatewayError::Unreachable(e.to_string())),
        };

        let status = response.status().as_u16();
        if response.status().is_success() {
            return match response.json::<ChargeResponse>().await {
                Ok(body) => ChargeOutcome::Approved {
                    reference: body.reference,
                },
                Err(e) if e.is_timeout() => ChargeOutcome::Error(GatewayError::Timeout),
                // Approved but unreadable; report as error so it is retried
                // under the same idempotency key
                Err(e) => ChargeOutcome::Error(GatewayError::Unreachable(format!(
                    "malformed approval body: {}",
                    e
                ))),
            };
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body: ChargeErrorBody = response.json().await.unwrap_or_default();

        let error = match status {
            401 | 403 => GatewayError::InvalidCredentials(body.reason(status)),
            402 if body.is_fraud() => GatewayError::FraudSuspected(body.reason(status)),
            451 => GatewayError::FraudSuspected(body.reason(status)),
            429 => GatewayError::RateLimited { retry_after },
            500..=599 => GatewayError::ServerError { status },
            _ => GatewayError::CardDeclined(body.reason(status)),
        };
        ChargeOutcome::Failed(error)
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn charge(&self, request: ChargeRequest) -> ChargeOutcome {
        let mut cancel = request.cancel.clone();
        tokio::select! {
            outcome = self.send(&request) => outcome,
            _ = cancel.cancelled() => ChargeOutcome::Error(GatewayError::Cancelled),
        }
    }
}
