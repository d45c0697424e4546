use chrono::Utc;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::covering;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.end <= span.start {
        return Err(EngineError::Validation("end must be after start".into()));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// A bookable interval must end after it starts and must not start in the past.
pub(crate) fn validate_booking_span(span: &Span, now: Ms) -> Result<(), EngineError> {
    validate_span(span)?;
    if span.start < now {
        return Err(EngineError::Validation("start is in the past".into()));
    }
    Ok(())
}

/// Coverage then overlap. `exclude` names a reservation that must not
/// conflict with itself (confirming it, or rescheduling away from it).
pub(crate) fn check_slot(
    hs: &HostState,
    span: &Span,
    policy: SlotPolicy,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if covering(hs.active_availabilities(), span).is_none() {
        return Err(EngineError::NotCovered {
            host_id: hs.id,
            span: *span,
        });
    }
    let blocking = hs
        .touching(span)
        .filter(|r| Some(r.id) != exclude)
        .find(|r| policy.blocks(r.status));
    match blocking {
        Some(r) => Err(EngineError::Conflict(r.id)),
        None => Ok(()),
    }
}
