use std::fmt;
use std::str::FromStr;

use chrono::Weekday;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Closed interval `[start, end]`. Both endpoints belong to the span, so two
/// spans sharing only an endpoint still touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// True if the spans share at least one instant, endpoints included.
    pub fn touches(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Weekdays ─────────────────────────────────────────────────────

const SUNDAY_FIRST: [Weekday; 7] = [
    Weekday::Sun,
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
];

/// Set of weekdays stored as a bitmask, bit 0 = Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub const EMPTY: WeekdaySet = WeekdaySet(0);

    fn bit(day: Weekday) -> u8 {
        1 << day.num_days_from_sunday()
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= Self::bit(day);
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & Self::bit(day) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        SUNDAY_FIRST.iter().copied().filter(|d| self.contains(*d))
    }
}

impl FromIterator<Weekday> for WeekdaySet {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut set = WeekdaySet::EMPTY;
        for day in iter {
            set.insert(day);
        }
        set
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("bad weekday: {0}")]
pub struct ParseWeekdayError(pub String);

/// Accepts a comma-separated list of digits `0`–`6` (0 = Sunday) or English
/// day names (`mon`, `Monday`, ...).
impl FromStr for WeekdaySet {
    type Err = ParseWeekdayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = WeekdaySet::EMPTY;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let day = match part.parse::<usize>() {
                Ok(n) => *SUNDAY_FIRST
                    .get(n)
                    .ok_or_else(|| ParseWeekdayError(part.to_string()))?,
                Err(_) => part
                    .parse::<Weekday>()
                    .map_err(|_| ParseWeekdayError(part.to_string()))?,
            };
            set.insert(day);
        }
        Ok(set)
    }
}

impl fmt::Display for WeekdaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits: Vec<String> = self
            .iter()
            .map(|d| d.num_days_from_sunday().to_string())
            .collect();
        f.write_str(&digits.join(","))
    }
}

// ── Availability ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recurrence {
    Once,
    Daily,
    Weekly { days: WeekdaySet },
}

impl Recurrence {
    pub fn label(&self) -> &'static str {
        match self {
            Recurrence::Once => "once",
            Recurrence::Daily => "daily",
            Recurrence::Weekly { .. } => "weekly",
        }
    }

    pub fn days(&self) -> Option<WeekdaySet> {
        match self {
            Recurrence::Weekly { days } => Some(*days),
            Recurrence::Once | Recurrence::Daily => None,
        }
    }
}

/// A host-declared open window. For recurring kinds the span's time of day is
/// the template projected onto each matching calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub id: Ulid,
    pub host_id: Ulid,
    pub span: Span,
    pub recurrence: Recurrence,
    pub active: bool,
    pub created_at: Ms,
}

/// One concrete, date-bound interval produced by expanding an availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub availability_id: Ulid,
    pub span: Span,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        match self {
            ReservationStatus::Pending | ReservationStatus::Confirmed => false,
            ReservationStatus::Cancelled
            | ReservationStatus::Completed
            | ReservationStatus::NoShow => true,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
            ReservationStatus::NoShow => "no_show",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(ReservationStatus::Pending),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "cancelled" | "canceled" => Ok(ReservationStatus::Cancelled),
            "completed" => Ok(ReservationStatus::Completed),
            "no_show" | "noshow" => Ok(ReservationStatus::NoShow),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub host_id: Ulid,
    pub span: Span,
    pub status: ReservationStatus,
    pub amount: Decimal,
    pub transaction_id: Option<Ulid>,
    pub cancellation_reason: Option<String>,
    pub notes: Option<String>,
    pub is_rescheduled: bool,
    pub original_reservation_id: Option<Ulid>,
    pub created_at: Ms,
}

impl Reservation {
    pub fn is_participant(&self, user_id: Ulid) -> bool {
        self.customer_id == user_id || self.host_id == user_id
    }
}

// ── Escrow ledger ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Payment,
    Payout,
    Refund,
}

impl TransactionKind {
    pub fn label(&self) -> &'static str {
        match self {
            TransactionKind::Payment => "payment",
            TransactionKind::Payout => "payout",
            TransactionKind::Refund => "refund",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl TransactionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Booking-linked ledger row. Amounts are 2-decimal currency units and obey
/// `net = amount - commission - vat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowEntry {
    pub id: Ulid,
    pub kind: TransactionKind,
    pub customer_id: Ulid,
    pub host_id: Ulid,
    pub reservation_id: Option<Ulid>,
    pub amount: Decimal,
    pub commission: Decimal,
    pub vat: Decimal,
    pub net: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub intent_ref: Option<String>,
    pub charge_ref: Option<String>,
    pub transfer_ref: Option<String>,
    pub is_released: bool,
    pub released_at: Option<Ms>,
    pub notes: Option<String>,
    pub created_at: Ms,
}

impl EscrowEntry {
    pub fn is_party(&self, user_id: Ulid) -> bool {
        self.customer_id == user_id || self.host_id == user_id
    }
}

// ── Parties ──────────────────────────────────────────────────────

/// Local mirror of an external customer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub gateway_customer: Option<String>,
}

/// Which reservations occupy a slot for conflict purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotPolicy {
    /// Only CONFIRMED reservations block a slot.
    #[default]
    ConfirmedOnly,
    /// PENDING reservations block as well.
    PendingAndConfirmed,
}

impl SlotPolicy {
    pub fn blocks(&self, status: ReservationStatus) -> bool {
        match (self, status) {
            (_, ReservationStatus::Confirmed) => true,
            (SlotPolicy::PendingAndConfirmed, ReservationStatus::Pending) => true,
            (_, ReservationStatus::Pending)
            | (_, ReservationStatus::Cancelled)
            | (_, ReservationStatus::Completed)
            | (_, ReservationStatus::NoShow) => false,
        }
    }
}

impl FromStr for SlotPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "confirmed" => Ok(SlotPolicy::ConfirmedOnly),
            "pending" => Ok(SlotPolicy::PendingAndConfirmed),
            other => Err(format!("unknown slot policy: {other}")),
        }
    }
}

/// Everything the engine knows about one host, guarded by a single lock.
#[derive(Debug, Clone)]
pub struct HostState {
    pub id: Ulid,
    pub email: Option<String>,
    /// Gateway payout destination. Payments require it.
    pub payout_account: Option<String>,
    pub availabilities: Vec<Availability>,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl HostState {
    pub fn new(id: Ulid, email: Option<String>, payout_account: Option<String>) -> Self {
        Self {
            id,
            email,
            payout_account,
            availabilities: Vec::new(),
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    pub fn availability_mut(&mut self, id: Ulid) -> Option<&mut Availability> {
        self.availabilities.iter_mut().find(|a| a.id == id)
    }

    pub fn active_availabilities(&self) -> impl Iterator<Item = &Availability> {
        self.availabilities.iter().filter(|a| a.active)
    }

    /// Reservations whose span touches `query` (closed on both ends).
    /// Binary search skips reservations starting after `query.end`.
    pub fn touching(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start <= query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end >= query.start)
    }

    /// The live (non-cancelled) reservation carrying `transaction_id`, which
    /// follows reschedule lineage to the replacement.
    pub fn live_reservation_for_transaction(&self, transaction_id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| {
            r.transaction_id == Some(transaction_id) && r.status != ReservationStatus::Cancelled
        })
    }
}

/// The event types. This is the WAL record format; records carry full rows
/// so compaction can re-emit current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    HostUpserted {
        id: Ulid,
        email: Option<String>,
        payout_account: Option<String>,
    },
    CustomerUpserted(CustomerInfo),
    AvailabilityAdded(Availability),
    AvailabilityRetired {
        id: Ulid,
        host_id: Ulid,
    },
    ReservationCreated(Reservation),
    ReservationStatusChanged {
        id: Ulid,
        host_id: Ulid,
        status: ReservationStatus,
        reason: Option<String>,
        note: Option<String>,
    },
    /// Cancel-and-replace as one record.
    ReservationRescheduled {
        original_id: Ulid,
        host_id: Ulid,
        replacement: Reservation,
    },
    EscrowCreated(EscrowEntry),
    EscrowCaptured {
        id: Ulid,
        charge_ref: Option<String>,
    },
    EscrowFailed {
        id: Ulid,
    },
    EscrowRefunded {
        id: Ulid,
        reason: Option<String>,
    },
    EscrowReleased {
        id: Ulid,
        released_at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentReceipt {
    pub transaction_id: Ulid,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LedgerStats {
    pub completed_count: u64,
    pub total_amount: Decimal,
    pub total_commission: Decimal,
    pub total_vat: Decimal,
    pub total_revenue: Decimal,
}
