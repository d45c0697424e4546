//! Reservation state machine guards. Pure functions over a reservation and
//! the current time; the engine runs them under the host write lock.

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Participants may cancel only while the session is at least this far away.
pub const CANCELLATION_NOTICE_MS: Ms = 24 * HOUR_MS;

/// Cancellation reason stamped on the original of a reschedule.
pub const RESCHEDULE_REASON: &str = "Rescheduled";

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// Customer or host of the reservation.
    Participant(Ulid),
    /// Operator or internal compensation. Skips participant and notice checks.
    Admin,
}

/// The transition table. Terminal states have no way out; nothing leads
/// back to PENDING.
pub fn check_transition(from: ReservationStatus, to: ReservationStatus) -> Result<(), EngineError> {
    use ReservationStatus::*;
    let allowed = match (from, to) {
        (Pending, Confirmed) | (Pending, Cancelled) => true,
        (Confirmed, Cancelled) | (Confirmed, Completed) | (Confirmed, NoShow) => true,
        (Pending, Pending) | (Pending, Completed) | (Pending, NoShow) => false,
        (Confirmed, Pending) | (Confirmed, Confirmed) => false,
        (Cancelled, _) | (Completed, _) | (NoShow, _) => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { from, to })
    }
}

fn check_participant(r: &Reservation, actor: Actor) -> Result<(), EngineError> {
    match actor {
        Actor::Participant(user) if !r.is_participant(user) => {
            Err(EngineError::Forbidden("not a participant of this reservation"))
        }
        Actor::Participant(_) | Actor::Admin => Ok(()),
    }
}

pub fn check_cancel(r: &Reservation, actor: Actor, now: Ms) -> Result<(), EngineError> {
    check_participant(r, actor)?;
    check_transition(r.status, ReservationStatus::Cancelled)?;
    if matches!(actor, Actor::Participant(_)) && now > r.span.start - CANCELLATION_NOTICE_MS {
        return Err(EngineError::OutsideWindow(
            "reservations can only be cancelled at least 24 hours in advance",
        ));
    }
    Ok(())
}

pub fn check_confirm(r: &Reservation) -> Result<(), EngineError> {
    check_transition(r.status, ReservationStatus::Confirmed)
}

pub fn check_complete(r: &Reservation, now: Ms) -> Result<(), EngineError> {
    check_transition(r.status, ReservationStatus::Completed)?;
    if now < r.span.end {
        return Err(EngineError::OutsideWindow("session has not ended yet"));
    }
    Ok(())
}

pub fn check_no_show(r: &Reservation, now: Ms) -> Result<(), EngineError> {
    check_transition(r.status, ReservationStatus::NoShow)?;
    if now < r.span.start {
        return Err(EngineError::OutsideWindow("session has not started yet"));
    }
    Ok(())
}

/// Only CONFIRMED (paid) reservations can be moved.
pub fn check_reschedule(r: &Reservation, actor: Actor) -> Result<(), EngineError> {
    check_participant(r, actor)?;
    if r.status != ReservationStatus::Confirmed {
        return Err(EngineError::InvalidTransition {
            from: r.status,
            to: ReservationStatus::Cancelled,
        });
    }
    Ok(())
}

/// Replacement row for a reschedule. Carries the payment over, so it starts
/// CONFIRMED.
pub fn replacement(original: &Reservation, new_id: Ulid, span: Span, now: Ms) -> Reservation {
    Reservation {
        id: new_id,
        customer_id: original.customer_id,
        host_id: original.host_id,
        span,
        status: ReservationStatus::Confirmed,
        amount: original.amount,
        transaction_id: original.transaction_id,
        cancellation_reason: None,
        notes: None,
        is_rescheduled: true,
        original_reservation_id: Some(original.id),
        created_at: now,
    }
}
