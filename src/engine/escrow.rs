use rust_decimal::Decimal;
use tracing::{info, warn};
use ulid::Ulid;

use crate::gateway::{IntentRequest, IntentStatus, WebhookEvent};
use crate::limits::MAX_DESCRIPTION_LEN;
use crate::model::*;
use crate::money::{round_currency, to_minor_units};
use crate::notify::{Notification, NotificationKind};

use super::saga::{CaptureOutcome, Compensation, WebhookOutcome};
use super::{Engine, EngineError};

const DEFAULT_DESCRIPTION: &str = "Session booking";

/// The reservation can take a new payment from `customer_id`: it is open and
/// not already paid by a live entry. Declined entries are unlinked.
fn check_payable(hs: &HostState, reservation_id: Ulid, customer_id: Ulid) -> Result<(), EngineError> {
    let r = hs.reservation(reservation_id).ok_or(EngineError::NotFound(reservation_id))?;
    if r.customer_id != customer_id {
        return Err(EngineError::Forbidden("reservation belongs to another customer"));
    }
    if r.status.is_terminal() {
        return Err(EngineError::Validation(format!("reservation {reservation_id} is {}", r.status)));
    }
    if r.transaction_id.is_some() {
        return Err(EngineError::Validation(format!("reservation {reservation_id} already has a payment")));
    }
    Ok(())
}

pub(super) fn ledger_metric(status: TransactionStatus) {
    metrics::counter!(crate::observability::ESCROW_TRANSITIONS_TOTAL, "to" => status.label()).increment(1);
}

impl Engine {
    /// Ask the gateway for a held charge and record a PENDING ledger entry.
    ///
    /// The host must have a payout account. The intent is routed to it net of
    /// the platform's commission and VAT. Retrying with the same `id` reuses
    /// the gateway intent. A reservation whose earlier payment was declined
    /// can be paid again; one with a live payment cannot.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_payment_intent(
        &self,
        id: Ulid,
        customer_id: Ulid,
        host_id: Ulid,
        gross: Decimal,
        reservation_id: Option<Ulid>,
        description: Option<String>,
        now: Ms,
    ) -> Result<PaymentIntentReceipt, EngineError> {
        let gross = round_currency(gross);
        if gross <= Decimal::ZERO {
            return Err(EngineError::Validation("amount must be positive".into()));
        }
        let description = description.unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string());
        if description.len() > MAX_DESCRIPTION_LEN {
            return Err(EngineError::LimitExceeded("description too long"));
        }

        let _gate = self.begin_write().await;
        if self.ledger.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let destination = {
            let hs = self.require_host(&host_id)?;
            let guard = hs.read().await;
            if let Some(rid) = reservation_id {
                check_payable(&guard, rid, customer_id)?;
            }
            guard
                .payout_account
                .clone()
                .ok_or_else(|| EngineError::Validation("host has not set up a payout account".into()))?
        };
        let customer_ref = self.ensure_gateway_customer(customer_id).await?;

        let split = self.settings.fees.split(gross);
        let amount_minor =
            to_minor_units(split.gross).ok_or(EngineError::LimitExceeded("amount too large"))?;
        let fee_minor =
            to_minor_units(split.application_fee).ok_or(EngineError::LimitExceeded("amount too large"))?;
        let created = self
            .call_gateway(
                "create_payment_intent",
                self.services.payments.create_payment_intent(IntentRequest {
                    amount_minor,
                    currency: self.settings.currency.clone(),
                    customer_ref,
                    destination,
                    description: description.clone(),
                    fee_minor,
                    idempotency_key: format!("intent-{id}"),
                }),
            )
            .await?;

        let entry = EscrowEntry {
            id,
            kind: TransactionKind::Payment,
            customer_id,
            host_id,
            reservation_id,
            amount: split.gross,
            commission: split.commission,
            vat: split.vat,
            net: split.net,
            currency: self.settings.currency.clone(),
            status: TransactionStatus::Pending,
            intent_ref: Some(created.intent_ref.clone()),
            charge_ref: None,
            transfer_ref: None,
            is_released: false,
            released_at: None,
            notes: Some(description),
            created_at: now,
        };
        // The gateway call ran without the host lock; another payment for the
        // same reservation may have landed meanwhile.
        let hs = self.require_host(&host_id)?;
        let mut guard = hs.write().await;
        if self.ledger.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(rid) = reservation_id
            && let Err(e) = check_payable(&guard, rid, customer_id)
        {
            warn!("intent {} for reservation {rid} abandoned: {e}", created.intent_ref);
            return Err(e);
        }
        self.persist_entry(&mut guard, entry).await?;
        drop(guard);

        ledger_metric(TransactionStatus::Pending);
        info!(
            "transaction {id}: intent {} for {} {} (net {})",
            created.intent_ref, split.gross, self.settings.currency, split.net
        );
        Ok(PaymentIntentReceipt {
            transaction_id: id,
            client_secret: created.client_secret,
        })
    }

    /// The gateway reports the held charge as captured. Idempotent: a
    /// completed or refunded entry is returned unchanged.
    pub async fn capture_payment(&self, intent_ref: &str, now: Ms) -> Result<CaptureOutcome, EngineError> {
        let _gate = self.begin_write().await;
        self.capture_inner(intent_ref, now).await
    }

    async fn capture_inner(&self, intent_ref: &str, now: Ms) -> Result<CaptureOutcome, EngineError> {
        let entry_id = self.entry_for_intent(intent_ref)?;
        let shared = self.require_entry(&entry_id)?;
        let mut entry = shared.write().await;
        match entry.status {
            TransactionStatus::Completed | TransactionStatus::Refunded => {
                return Ok(CaptureOutcome {
                    entry: entry.clone(),
                    reservation: None,
                    compensation: Compensation::None,
                    duplicate: true,
                });
            }
            TransactionStatus::Pending | TransactionStatus::Failed => {}
        }

        let snapshot = self
            .call_gateway("retrieve_intent", self.services.payments.retrieve_intent(intent_ref))
            .await?;
        if snapshot.status != IntentStatus::Succeeded {
            return Err(EngineError::Validation(format!(
                "intent {intent_ref} has not been captured"
            )));
        }
        let event = Event::EscrowCaptured {
            id: entry_id,
            charge_ref: snapshot.charge_ref,
        };
        self.persist_and_apply_entry(&mut entry, &event).await?;
        let captured = entry.clone();
        drop(entry);

        ledger_metric(TransactionStatus::Completed);
        info!("transaction {entry_id} captured ({} {})", captured.amount, captured.currency);
        self.notify(
            Notification::app(captured.host_id, NotificationKind::PaymentReceived, "Payment received", "")
                .related(entry_id)
                .with_metadata(serde_json::json!({
                    "amount": captured.amount.to_string(),
                    "net": captured.net.to_string(),
                    "currency": captured.currency,
                })),
        );

        let (reservation, compensation) = self.reconcile_capture(&captured, now).await;
        let entry = match &compensation {
            Compensation::Refunded(refunded) => refunded.clone(),
            Compensation::None | Compensation::RefundFailed { .. } => captured,
        };
        Ok(CaptureOutcome {
            entry,
            reservation,
            compensation,
            duplicate: false,
        })
    }

    /// PENDING → FAILED after the gateway declines the charge.
    pub async fn fail_payment(&self, intent_ref: &str) -> Result<EscrowEntry, EngineError> {
        let _gate = self.begin_write().await;
        let entry_id = self.entry_for_intent(intent_ref)?;
        let shared = self.require_entry(&entry_id)?;
        let mut entry = shared.write().await;
        match entry.status {
            TransactionStatus::Failed => return Ok(entry.clone()),
            TransactionStatus::Pending => {}
            status @ (TransactionStatus::Completed | TransactionStatus::Refunded) => {
                return Err(EngineError::EntryState { id: entry_id, status });
            }
        }
        self.persist_and_apply_entry(&mut entry, &Event::EscrowFailed { id: entry_id })
            .await?;
        let failed = entry.clone();
        drop(entry);
        self.unlink_failed(&failed).await;

        ledger_metric(TransactionStatus::Failed);
        info!("transaction {entry_id} failed at the gateway");
        self.notify(
            Notification::app(failed.customer_id, NotificationKind::PaymentFailed, "Payment failed", "")
                .related(entry_id),
        );
        Ok(failed)
    }

    /// Verify and dispatch a gateway callback.
    pub async fn handle_webhook(&self, payload: &[u8], signature: &str, now: Ms) -> Result<WebhookOutcome, EngineError> {
        let event = self.services.payments.verify_webhook(payload, signature)?;
        match event {
            WebhookEvent::PaymentSucceeded { intent_ref } => {
                Ok(WebhookOutcome::Captured(self.capture_payment(&intent_ref, now).await?))
            }
            WebhookEvent::PaymentFailed { intent_ref } => {
                Ok(WebhookOutcome::Failed(self.fail_payment(&intent_ref).await?))
            }
            WebhookEvent::Other { kind } => {
                tracing::debug!("ignoring webhook {kind}");
                Ok(WebhookOutcome::Ignored(kind))
            }
        }
    }

    /// Refund a captured payment. Only COMPLETED entries with an intent can
    /// be refunded; the reason is kept in the entry's notes.
    pub async fn refund_transaction(&self, id: Ulid, reason: Option<String>) -> Result<EscrowEntry, EngineError> {
        if reason.as_ref().is_some_and(|r| r.len() > crate::limits::MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let _gate = self.begin_write().await;
        self.refund_inner(id, reason).await
    }

    pub(super) async fn refund_inner(&self, id: Ulid, reason: Option<String>) -> Result<EscrowEntry, EngineError> {
        let shared = self.require_entry(&id)?;
        let mut entry = shared.write().await;
        if entry.status != TransactionStatus::Completed {
            return Err(EngineError::EntryState { id, status: entry.status });
        }
        let intent = entry
            .intent_ref
            .clone()
            .ok_or_else(|| EngineError::Validation(format!("transaction {id} has no payment intent")))?;
        self.call_gateway(
            "refund",
            self.services.payments.refund(&intent, &format!("refund-{id}")),
        )
        .await?;
        self.persist_and_apply_entry(&mut entry, &Event::EscrowRefunded { id, reason })
            .await?;
        let refunded = entry.clone();
        drop(entry);

        ledger_metric(TransactionStatus::Refunded);
        info!("transaction {id} refunded: {}", refunded.notes.as_deref().unwrap_or("-"));
        for user in [refunded.customer_id, refunded.host_id] {
            self.notify(
                Notification::app(user, NotificationKind::PaymentRefunded, "Payment refunded", "").related(id),
            );
        }
        Ok(refunded)
    }

    fn entry_for_intent(&self, intent_ref: &str) -> Result<Ulid, EngineError> {
        self.intent_index
            .get(intent_ref)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::IntentNotFound(intent_ref.to_string()))
    }
}
