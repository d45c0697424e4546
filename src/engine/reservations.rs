use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::money::round_currency;
use crate::notify::{Notification, NotificationKind};

use super::conflict::{check_slot, validate_booking_span};
use super::lifecycle::{self, Actor};
use super::saga::Compensation;
use super::{Engine, EngineError};

fn check_reason(text: &Option<String>) -> Result<(), EngineError> {
    match text {
        Some(t) if t.len() > MAX_REASON_LEN => Err(EngineError::LimitExceeded("reason too long")),
        _ => Ok(()),
    }
}

fn transition_metric(status: ReservationStatus) {
    metrics::counter!(crate::observability::RESERVATION_TRANSITIONS_TOTAL, "to" => status.label())
        .increment(1);
}

impl Engine {
    /// Book `span` with a host. The slot check and the insert run under the
    /// host write lock, so two overlapping requests cannot both succeed.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        customer_id: Ulid,
        host_id: Ulid,
        span: Span,
        amount: Decimal,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        validate_booking_span(&span, now)?;
        if amount < Decimal::ZERO {
            return Err(EngineError::Validation("amount must not be negative".into()));
        }
        if !self.customers.contains_key(&customer_id) {
            return Err(EngineError::NotFound(customer_id));
        }

        let _gate = self.begin_write().await;
        let hs = self.require_host(&host_id)?;
        let mut guard = hs.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_HOST {
            return Err(EngineError::LimitExceeded("too many reservations for host"));
        }
        check_slot(&guard, &span, self.settings.slot_policy, None)?;

        let reservation = Reservation {
            id,
            customer_id,
            host_id,
            span,
            status: ReservationStatus::Pending,
            amount: round_currency(amount),
            transaction_id: None,
            cancellation_reason: None,
            notes: None,
            is_rescheduled: false,
            original_reservation_id: None,
            created_at: now,
        };
        self.persist_new_entity(&mut guard, id, &Event::ReservationCreated(reservation.clone()))
            .await?;
        drop(guard);

        transition_metric(ReservationStatus::Pending);
        info!("reservation {id} requested with host {host_id}");
        self.notify(
            Notification::app(host_id, NotificationKind::ReservationCreated, "New booking request", "")
                .related(id),
        );
        self.notify(
            Notification::app(
                customer_id,
                NotificationKind::ReservationCreated,
                "Booking requested",
                "Your booking is waiting for payment",
            )
            .related(id),
        );
        Ok(reservation)
    }

    /// PENDING → CONFIRMED. The slot is re-checked, ignoring the reservation
    /// itself.
    pub async fn confirm_reservation(&self, id: Ulid, now: Ms) -> Result<Reservation, EngineError> {
        let _gate = self.begin_write().await;
        self.transition(id, ReservationStatus::Confirmed, Actor::Admin, None, None, now)
            .await
    }

    /// Cancel as a participant. Refunds a captured, unreleased payment.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        actor_id: Ulid,
        reason: Option<String>,
        now: Ms,
    ) -> Result<(Reservation, Compensation), EngineError> {
        check_reason(&reason)?;
        let _gate = self.begin_write().await;
        let cancelled = self
            .transition(id, ReservationStatus::Cancelled, Actor::Participant(actor_id), reason, None, now)
            .await?;
        let compensation = self.refund_after_cancellation(&cancelled).await;
        Ok((cancelled, compensation))
    }

    /// Move a CONFIRMED reservation to `new_span`. The original is cancelled
    /// and the CONFIRMED replacement inserted by one WAL record.
    pub async fn reschedule_reservation(
        &self,
        id: Ulid,
        actor_id: Ulid,
        new_id: Ulid,
        new_span: Span,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        validate_booking_span(&new_span, now)?;
        let _gate = self.begin_write().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let original = guard.reservation(id).cloned().ok_or(EngineError::NotFound(id))?;
        lifecycle::check_reschedule(&original, Actor::Participant(actor_id))?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_HOST {
            return Err(EngineError::LimitExceeded("too many reservations for host"));
        }
        check_slot(&guard, &new_span, self.settings.slot_policy, Some(id))?;

        let replacement = lifecycle::replacement(&original, new_id, new_span, now);
        let event = Event::ReservationRescheduled {
            original_id: id,
            host_id: original.host_id,
            replacement: replacement.clone(),
        };
        self.persist_new_entity(&mut guard, new_id, &event).await?;
        drop(guard);

        transition_metric(ReservationStatus::Cancelled);
        transition_metric(ReservationStatus::Confirmed);
        info!("reservation {id} rescheduled as {new_id}");
        let other = if actor_id == original.host_id {
            original.customer_id
        } else {
            original.host_id
        };
        self.notify(
            Notification::app(other, NotificationKind::ReservationRescheduled, "Booking moved", "")
                .related(new_id)
                .with_metadata(serde_json::json!({
                    "original_reservation_id": id.to_string(),
                    "start": new_span.start,
                    "end": new_span.end,
                })),
        );
        Ok(replacement)
    }

    /// CONFIRMED → COMPLETED once the session has ended.
    pub async fn complete_reservation(&self, id: Ulid, now: Ms) -> Result<Reservation, EngineError> {
        let _gate = self.begin_write().await;
        self.transition(id, ReservationStatus::Completed, Actor::Admin, None, None, now)
            .await
    }

    /// CONFIRMED → NO_SHOW once the session has started.
    pub async fn mark_no_show(&self, id: Ulid, now: Ms) -> Result<Reservation, EngineError> {
        let _gate = self.begin_write().await;
        self.transition(id, ReservationStatus::NoShow, Actor::Admin, None, None, now)
            .await
    }

    /// Operator status change, routed through the same guards as every other
    /// transition. For CANCELLED the note becomes the cancellation reason.
    pub async fn override_status(
        &self,
        id: Ulid,
        target: ReservationStatus,
        note: Option<String>,
        now: Ms,
    ) -> Result<(Reservation, Compensation), EngineError> {
        check_reason(&note)?;
        let _gate = self.begin_write().await;
        let (reason, note) = match target {
            ReservationStatus::Cancelled => (note, None),
            ReservationStatus::Pending
            | ReservationStatus::Confirmed
            | ReservationStatus::Completed
            | ReservationStatus::NoShow => (None, note),
        };
        let updated = self.transition(id, target, Actor::Admin, reason, note, now).await?;
        let compensation = match target {
            ReservationStatus::Cancelled => self.refund_after_cancellation(&updated).await,
            _ => Compensation::None,
        };
        Ok((updated, compensation))
    }

    /// Guarded single-row status change. Caller holds the write gate and no
    /// other lock.
    pub(super) async fn transition(
        &self,
        id: Ulid,
        to: ReservationStatus,
        actor: Actor,
        reason: Option<String>,
        note: Option<String>,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard.reservation(id).cloned().ok_or(EngineError::NotFound(id))?;
        match to {
            ReservationStatus::Pending => {
                return Err(EngineError::InvalidTransition {
                    from: current.status,
                    to,
                });
            }
            ReservationStatus::Confirmed => {
                lifecycle::check_confirm(&current)?;
                check_slot(&guard, &current.span, self.settings.slot_policy, Some(id))?;
            }
            ReservationStatus::Cancelled => lifecycle::check_cancel(&current, actor, now)?,
            ReservationStatus::Completed => lifecycle::check_complete(&current, now)?,
            ReservationStatus::NoShow => lifecycle::check_no_show(&current, now)?,
        }

        let event = Event::ReservationStatusChanged {
            id,
            host_id: current.host_id,
            status: to,
            reason,
            note,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard.reservation(id).cloned().ok_or(EngineError::NotFound(id))?;
        drop(guard);

        transition_metric(to);
        info!("reservation {id}: {} -> {to}", current.status);
        self.notify_transition(&updated, actor);
        Ok(updated)
    }

    fn notify_transition(&self, r: &Reservation, actor: Actor) {
        match r.status {
            ReservationStatus::Confirmed => self.notify(
                Notification::app(r.customer_id, NotificationKind::ReservationConfirmed, "Booking confirmed", "")
                    .related(r.id),
            ),
            ReservationStatus::Cancelled => {
                let body = r.cancellation_reason.clone().unwrap_or_default();
                let recipients = match actor {
                    Actor::Participant(user) if user == r.host_id => vec![r.customer_id],
                    Actor::Participant(_) => vec![r.host_id],
                    Actor::Admin => vec![r.customer_id, r.host_id],
                };
                for user in recipients {
                    self.notify(
                        Notification::app(user, NotificationKind::ReservationCancelled, "Booking cancelled", body.clone())
                            .related(r.id),
                    );
                }
            }
            ReservationStatus::Completed => self.notify(
                Notification::app(r.host_id, NotificationKind::ReservationCompleted, "Session completed", "")
                    .related(r.id),
            ),
            ReservationStatus::NoShow => self.notify(
                Notification::app(r.host_id, NotificationKind::ReservationNoShow, "Customer did not attend", "")
                    .related(r.id),
            ),
            ReservationStatus::Pending => {}
        }
    }
}
