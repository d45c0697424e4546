//! Seams to the external payment gateway and video token authority, plus the
//! in-process sandbox implementations the server runs with by default.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway rejected request: {0}")]
    Rejected(String),
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
}

/// Held-charge request routed to a host's payout destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentRequest {
    pub amount_minor: i64,
    pub currency: String,
    pub customer_ref: String,
    pub destination: String,
    pub description: String,
    pub fee_minor: i64,
    /// Same key, same intent: retries never create a second charge.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedIntent {
    pub intent_ref: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentStatus {
    RequiresPayment,
    Succeeded,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentSnapshot {
    pub intent_ref: String,
    pub status: IntentStatus,
    pub charge_ref: Option<String>,
}

/// A verified gateway callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    PaymentSucceeded { intent_ref: String },
    PaymentFailed { intent_ref: String },
    Other { kind: String },
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_customer(&self, email: &str, name: &str) -> Result<String, GatewayError>;

    async fn create_connect_account(&self, email: &str, country: &str) -> Result<String, GatewayError>;

    async fn create_payment_intent(&self, request: IntentRequest) -> Result<CreatedIntent, GatewayError>;

    async fn refund(&self, intent_ref: &str, idempotency_key: &str) -> Result<(), GatewayError>;

    async fn retrieve_intent(&self, intent_ref: &str) -> Result<IntentSnapshot, GatewayError>;

    fn verify_webhook(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent, GatewayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Publisher,
    Subscriber,
}

impl fmt::Display for CallRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallRole::Publisher => f.write_str("publisher"),
            CallRole::Subscriber => f.write_str("subscriber"),
        }
    }
}

pub trait TokenAuthority: Send + Sync {
    fn mint_token(
        &self,
        channel: &str,
        uid: u32,
        role: CallRole,
        expires_at: Ms,
    ) -> Result<String, GatewayError>;
}

// ── Sandbox payment gateway ──────────────────────────────────────

#[derive(Debug, Clone)]
struct SandboxIntent {
    request: IntentRequest,
    status: IntentStatus,
    charge_ref: Option<String>,
    client_secret: String,
}

/// In-memory gateway. Intents stay `RequiresPayment` until `succeed` or
/// `fail` is called, mirroring a customer completing checkout.
pub struct SandboxGateway {
    webhook_secret: String,
    intents: DashMap<String, SandboxIntent>,
    by_idempotency_key: DashMap<String, String>,
    refunds: Mutex<Vec<String>>,
    unavailable: AtomicBool,
}

impl SandboxGateway {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            intents: DashMap::new(),
            by_idempotency_key: DashMap::new(),
            refunds: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Capture the held charge. Returns the charge reference.
    pub fn succeed(&self, intent_ref: &str) -> Option<String> {
        let mut intent = self.intents.get_mut(intent_ref)?;
        let charge = format!("ch_{}", Ulid::new());
        intent.status = IntentStatus::Succeeded;
        intent.charge_ref = Some(charge.clone());
        Some(charge)
    }

    pub fn fail(&self, intent_ref: &str) -> bool {
        match self.intents.get_mut(intent_ref) {
            Some(mut intent) => {
                intent.status = IntentStatus::Failed;
                true
            }
            None => false,
        }
    }

    /// Intent refs refunded so far, in order.
    pub fn refunds(&self) -> Vec<String> {
        self.refunds.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn intent_request(&self, intent_ref: &str) -> Option<IntentRequest> {
        self.intents.get(intent_ref).map(|i| i.request.clone())
    }

    pub fn intent_count(&self) -> usize {
        self.intents.len()
    }

    /// Build a signed webhook body the way the real gateway would post it.
    pub fn signed_webhook(&self, kind: &str, intent_ref: &str) -> (Vec<u8>, String) {
        let body = serde_json::json!({
            "type": kind,
            "data": { "object": { "id": intent_ref } },
        });
        (body.to_string().into_bytes(), self.webhook_secret.clone())
    }

    fn check_available(&self) -> Result<(), GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("sandbox switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_customer(&self, email: &str, _name: &str) -> Result<String, GatewayError> {
        self.check_available()?;
        if email.is_empty() {
            return Err(GatewayError::Rejected("customer email required".into()));
        }
        Ok(format!("cus_{}", Ulid::new()))
    }

    async fn create_connect_account(&self, email: &str, country: &str) -> Result<String, GatewayError> {
        self.check_available()?;
        if email.is_empty() || country.len() != 2 {
            return Err(GatewayError::Rejected(format!(
                "cannot open payout account for {email:?} in {country:?}"
            )));
        }
        Ok(format!("acct_{}", Ulid::new()))
    }

    async fn create_payment_intent(&self, request: IntentRequest) -> Result<CreatedIntent, GatewayError> {
        self.check_available()?;
        if request.amount_minor <= 0 || request.fee_minor < 0 || request.fee_minor > request.amount_minor {
            return Err(GatewayError::Rejected(format!(
                "invalid amounts: {} / fee {}",
                request.amount_minor, request.fee_minor
            )));
        }
        let existing = self
            .by_idempotency_key
            .get(&request.idempotency_key)
            .map(|r| r.value().clone());
        if let Some(intent_ref) = existing {
            if let Some(intent) = self.intents.get(&intent_ref) {
                return Ok(CreatedIntent {
                    client_secret: intent.client_secret.clone(),
                    intent_ref,
                });
            }
        }

        let intent_ref = format!("pi_{}", Ulid::new());
        let client_secret = format!("{intent_ref}_secret_{}", Ulid::new());
        self.by_idempotency_key
            .insert(request.idempotency_key.clone(), intent_ref.clone());
        self.intents.insert(
            intent_ref.clone(),
            SandboxIntent {
                request,
                status: IntentStatus::RequiresPayment,
                charge_ref: None,
                client_secret: client_secret.clone(),
            },
        );
        Ok(CreatedIntent {
            intent_ref,
            client_secret,
        })
    }

    async fn refund(&self, intent_ref: &str, _idempotency_key: &str) -> Result<(), GatewayError> {
        self.check_available()?;
        let mut intent = self
            .intents
            .get_mut(intent_ref)
            .ok_or_else(|| GatewayError::Rejected(format!("no such intent: {intent_ref}")))?;
        match intent.status {
            IntentStatus::Succeeded => {
                intent.status = IntentStatus::Refunded;
                if let Ok(mut refunds) = self.refunds.lock() {
                    refunds.push(intent_ref.to_string());
                }
                Ok(())
            }
            // Already refunded under the same key: succeed again.
            IntentStatus::Refunded => Ok(()),
            IntentStatus::RequiresPayment | IntentStatus::Failed => Err(GatewayError::Rejected(
                format!("intent {intent_ref} has no captured charge"),
            )),
        }
    }

    async fn retrieve_intent(&self, intent_ref: &str) -> Result<IntentSnapshot, GatewayError> {
        self.check_available()?;
        let intent = self
            .intents
            .get(intent_ref)
            .ok_or_else(|| GatewayError::Rejected(format!("no such intent: {intent_ref}")))?;
        Ok(IntentSnapshot {
            intent_ref: intent_ref.to_string(),
            status: intent.status,
            charge_ref: intent.charge_ref.clone(),
        })
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent, GatewayError> {
        if signature != self.webhook_secret {
            return Err(GatewayError::InvalidSignature);
        }
        parse_webhook(payload)
    }
}

/// Parse `{"type": ..., "data": {"object": {"id": ...}}}`.
fn parse_webhook(payload: &[u8]) -> Result<WebhookEvent, GatewayError> {
    let body: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
    let kind = body
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| GatewayError::MalformedPayload("missing type".into()))?;
    let object_id = body
        .pointer("/data/object/id")
        .and_then(|id| id.as_str())
        .map(str::to_string);

    match (kind, object_id) {
        ("payment_intent.succeeded", Some(intent_ref)) => Ok(WebhookEvent::PaymentSucceeded { intent_ref }),
        ("payment_intent.payment_failed", Some(intent_ref)) => Ok(WebhookEvent::PaymentFailed { intent_ref }),
        ("payment_intent.succeeded" | "payment_intent.payment_failed", None) => {
            Err(GatewayError::MalformedPayload("missing data.object.id".into()))
        }
        (other, _) => Ok(WebhookEvent::Other { kind: other.to_string() }),
    }
}

// ── Sandbox token authority ──────────────────────────────────────

/// Issues unsigned, self-describing tokens. Stands in for the real call
/// provider during development and tests.
pub struct SandboxTokenAuthority {
    app_id: String,
}

impl SandboxTokenAuthority {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self { app_id: app_id.into() }
    }
}

impl TokenAuthority for SandboxTokenAuthority {
    fn mint_token(
        &self,
        channel: &str,
        uid: u32,
        role: CallRole,
        expires_at: Ms,
    ) -> Result<String, GatewayError> {
        if channel.is_empty() {
            return Err(GatewayError::Rejected("empty channel".into()));
        }
        let payload = format!("{}.{channel}.{uid}.{role}.{expires_at}", self.app_id);
        Ok(format!("{payload}.{:08x}", crc32fast::hash(payload.as_bytes())))
    }
}
