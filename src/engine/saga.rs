//! Keeps a reservation and its ledger entry in an allowed joint state.
//!
//! | trigger                                    | reservation | entry     |
//! |--------------------------------------------|-------------|-----------|
//! | capture, reservation PENDING, slot free    | CONFIRMED   | COMPLETED |
//! | capture, reservation already CONFIRMED     | CONFIRMED   | COMPLETED |
//! | capture, reservation CANCELLED or slot lost| CANCELLED   | REFUNDED  |
//! | cancel, entry COMPLETED and unreleased     | CANCELLED   | REFUNDED  |
//! | cancel, entry PENDING                      | CANCELLED   | PENDING   |
//! | capture, reservation paid by another entry | unchanged   | REFUNDED  |
//! | capture with no linked reservation         | -           | COMPLETED |

use tracing::warn;

use crate::model::*;

use super::lifecycle::Actor;
use super::{Engine, EngineError};

pub const SLOT_LOST_REASON: &str = "Slot no longer available";
pub const CANCELLED_BEFORE_CAPTURE_REASON: &str = "Reservation cancelled before payment completed";
pub const CANCELLED_AFTER_CAPTURE_REASON: &str = "Reservation cancelled";
pub const SUPERSEDED_REASON: &str = "Reservation is paid by another payment";

/// Compensating action taken on the ledger after a reservation change.
#[derive(Debug, Clone, PartialEq)]
pub enum Compensation {
    None,
    Refunded(EscrowEntry),
    /// The refund could not be issued. The entry stays COMPLETED.
    RefundFailed { transaction_id: ulid::Ulid, error: String },
}

impl Compensation {
    pub fn label(&self) -> &'static str {
        match self {
            Compensation::None => "none",
            Compensation::Refunded(_) => "refunded",
            Compensation::RefundFailed { .. } => "refund_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    pub entry: EscrowEntry,
    pub reservation: Option<Reservation>,
    pub compensation: Compensation,
    /// The entry had already been captured; nothing changed.
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Captured(CaptureOutcome),
    Failed(EscrowEntry),
    Ignored(String),
}

impl Engine {
    /// Bring the linked reservation in line with a freshly captured entry.
    /// Caller holds the write gate and no other lock.
    pub(super) async fn reconcile_capture(
        &self,
        entry: &EscrowEntry,
        now: Ms,
    ) -> (Option<Reservation>, Compensation) {
        let Some((reservation, linked)) = self.linked_reservation(entry).await else {
            return (None, Compensation::None);
        };
        if !linked {
            // A declined entry captured late, after the reservation moved on.
            warn!(
                "transaction {} captured but reservation {} no longer points at it; refunding",
                entry.id, reservation.id
            );
            let compensation = self.compensate(entry.id, SUPERSEDED_REASON).await;
            return (Some(reservation), compensation);
        }

        match reservation.status {
            ReservationStatus::Pending => {
                match self
                    .transition(reservation.id, ReservationStatus::Confirmed, Actor::Admin, None, None, now)
                    .await
                {
                    Ok(confirmed) => (Some(confirmed), Compensation::None),
                    Err(EngineError::Conflict(_) | EngineError::NotCovered { .. }) => {
                        warn!("reservation {} lost its slot before payment; cancelling", reservation.id);
                        let cancelled = self
                            .transition(
                                reservation.id,
                                ReservationStatus::Cancelled,
                                Actor::Admin,
                                Some(SLOT_LOST_REASON.to_string()),
                                None,
                                now,
                            )
                            .await
                            .unwrap_or(reservation);
                        let compensation = self.compensate(entry.id, SLOT_LOST_REASON).await;
                        (Some(cancelled), compensation)
                    }
                    Err(e) => {
                        warn!("reservation {} not confirmed after capture: {e}", reservation.id);
                        (Some(reservation), Compensation::None)
                    }
                }
            }
            ReservationStatus::Cancelled => {
                let compensation = self.compensate(entry.id, CANCELLED_BEFORE_CAPTURE_REASON).await;
                (Some(reservation), compensation)
            }
            ReservationStatus::Confirmed | ReservationStatus::Completed | ReservationStatus::NoShow => {
                (Some(reservation), Compensation::None)
            }
        }
    }

    /// Refund the payment behind a just-cancelled reservation if it was
    /// captured and not yet released. Caller holds the write gate only.
    pub(super) async fn refund_after_cancellation(&self, reservation: &Reservation) -> Compensation {
        let Some(tx_id) = reservation.transaction_id else {
            return Compensation::None;
        };
        let Some(shared) = self.entry(&tx_id) else {
            return Compensation::None;
        };
        let refundable = {
            let entry = shared.read().await;
            entry.status == TransactionStatus::Completed && !entry.is_released
        };
        if !refundable {
            return Compensation::None;
        }
        self.compensate(tx_id, CANCELLED_AFTER_CAPTURE_REASON).await
    }

    async fn compensate(&self, tx_id: ulid::Ulid, reason: &str) -> Compensation {
        match self.refund_inner(tx_id, Some(reason.to_string())).await {
            Ok(entry) => Compensation::Refunded(entry),
            Err(e) => {
                warn!("compensating refund of {tx_id} failed: {e}");
                metrics::counter!(crate::observability::COMPENSATION_FAILURES_TOTAL).increment(1);
                Compensation::RefundFailed {
                    transaction_id: tx_id,
                    error: e.to_string(),
                }
            }
        }
    }

    /// The live reservation paid by `entry`, following reschedule lineage,
    /// else the reservation named on the entry. The flag is false when that
    /// reservation no longer carries `entry` as its payment.
    async fn linked_reservation(&self, entry: &EscrowEntry) -> Option<(Reservation, bool)> {
        let hs = self.host(&entry.host_id)?;
        let guard = hs.read().await;
        if let Some(live) = guard.live_reservation_for_transaction(entry.id) {
            return Some((live.clone(), true));
        }
        let named = guard.reservation(entry.reservation_id?)?;
        Some((named.clone(), named.transaction_id == Some(entry.id)))
    }
}
