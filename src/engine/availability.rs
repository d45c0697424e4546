use chrono::{DateTime, Datelike};

use crate::limits::MAX_EXPANSION_WINDOW_MS;
use crate::model::*;

use super::EngineError;

/// Midnight UTC of the day containing `t`.
pub fn floor_day(t: Ms) -> Ms {
    t - t.rem_euclid(DAY_MS)
}

fn time_of_day(t: Ms) -> Ms {
    t.rem_euclid(DAY_MS)
}

fn weekday_of(day: Ms) -> Option<chrono::Weekday> {
    DateTime::from_timestamp_millis(day).map(|dt| dt.weekday())
}

/// Project a recurring template's clock times onto the day starting at `day`.
/// A template whose end clock time is not after its start wraps past midnight.
pub fn project(template: &Span, day: Ms) -> Span {
    let start = day + time_of_day(template.start);
    let mut end = day + time_of_day(template.end);
    if end <= start {
        end += DAY_MS;
    }
    Span::new(start, end)
}

/// Concrete occurrences of one availability inside `range`.
///
/// ONCE records appear verbatim iff they lie within `range`, boundaries
/// inclusive. Recurring records are projected onto every calendar day whose
/// midnight falls in `[floor_day(range.start), range.end)`; WEEKLY skips days
/// outside its set. Inactive records yield nothing. The iterator is `Clone`,
/// so callers may walk the same expansion more than once.
pub fn occurrences(
    avail: &Availability,
    range: Span,
) -> impl Iterator<Item = Occurrence> + Clone + '_ {
    let once = match avail.recurrence {
        Recurrence::Once if avail.active && range.contains_span(&avail.span) => Some(Occurrence {
            availability_id: avail.id,
            span: avail.span,
        }),
        _ => None,
    };

    let first_day = floor_day(range.start);
    let day_count = match avail.recurrence {
        Recurrence::Daily | Recurrence::Weekly { .. } if avail.active => {
            (range.end - first_day + DAY_MS - 1).div_euclid(DAY_MS).max(0)
        }
        _ => 0,
    };

    let recurring = (0..day_count)
        .map(move |i| first_day + i * DAY_MS)
        .filter(move |day| match avail.recurrence {
            Recurrence::Daily => true,
            Recurrence::Weekly { days } => weekday_of(*day).is_some_and(|wd| days.contains(wd)),
            Recurrence::Once => false,
        })
        .map(move |day| Occurrence {
            availability_id: avail.id,
            span: project(&avail.span, day),
        });

    once.into_iter().chain(recurring)
}

/// Expand every availability over `range`, ordered by start then end.
pub fn expand<'a>(
    avails: impl IntoIterator<Item = &'a Availability>,
    range: Span,
) -> Vec<Occurrence> {
    let mut out: Vec<Occurrence> = avails
        .into_iter()
        .flat_map(|a| occurrences(a, range))
        .collect();
    out.sort_by_key(|o| (o.span.start, o.span.end));
    out
}

/// The calendar-day window expanded when testing coverage of `span`: from
/// the day before `span` starts (windows may wrap past midnight) through the
/// end of the day `span` ends. ONCE records count only when they lie inside
/// it, like any other expansion.
pub fn coverage_window(span: &Span) -> Span {
    Span::new(floor_day(span.start) - DAY_MS, floor_day(span.end) + DAY_MS)
}

/// First single occurrence that fully contains `span`, boundaries inclusive.
/// A union of adjacent occurrences never counts.
pub fn covering<'a>(
    avails: impl IntoIterator<Item = &'a Availability>,
    span: &Span,
) -> Option<Occurrence> {
    let window = coverage_window(span);
    avails
        .into_iter()
        .flat_map(move |a| occurrences(a, window))
        .find(|o| o.span.contains_span(span))
}

pub(crate) fn validate_range(range: &Span) -> Result<(), EngineError> {
    if range.end <= range.start {
        return Err(EngineError::Validation("range end must be after start".into()));
    }
    if range.duration_ms() > MAX_EXPANSION_WINDOW_MS {
        return Err(EngineError::LimitExceeded("expansion range too wide"));
    }
    Ok(())
}
