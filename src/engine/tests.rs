use super::*;
use super::saga::{SLOT_LOST_REASON, SUPERSEDED_REASON};
use crate::gateway::{GatewayError, SandboxGateway, SandboxTokenAuthority};
use crate::notify::NotificationKind;
use chrono::{NaiveDate, Weekday};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Unix ms for a UTC date and clock time.
fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> Ms {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, min, 0)
        .unwrap()
        .and_utc()
        .timestamp_millis()
}

// 2024-06-01 is a Saturday; 2024-06-03 the Monday after.
fn now() -> Ms {
    at(2024, 6, 1, 0, 0)
}

fn monday(h: u32, min: u32) -> Ms {
    at(2024, 6, 3, h, min)
}

fn mon_wed() -> Recurrence {
    Recurrence::Weekly {
        days: [Weekday::Mon, Weekday::Wed].into_iter().collect(),
    }
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("hostbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Fixture {
    engine: Engine,
    gateway: Arc<SandboxGateway>,
    hub: Arc<NotifyHub>,
    host: Ulid,
    customer: Ulid,
    path: PathBuf,
}

fn services(gateway: &Arc<SandboxGateway>, hub: &Arc<NotifyHub>) -> Services {
    Services {
        payments: gateway.clone(),
        tokens: Arc::new(SandboxTokenAuthority::new("test")),
        notifier: hub.clone(),
    }
}

/// Engine with one host open Mon/Wed 09:00-17:00 and one customer.
async fn fixture_with(name: &str, settings: EngineSettings) -> Fixture {
    let path = test_wal_path(name);
    let gateway = Arc::new(SandboxGateway::new("whsec_test"));
    let hub = Arc::new(NotifyHub::new());
    let engine = Engine::new(path.clone(), settings, services(&gateway, &hub)).unwrap();

    let host = Ulid::new();
    let customer = Ulid::new();
    engine
        .upsert_host(host, Some("host@example.com".into()), Some("acct_host".into()))
        .await
        .unwrap();
    engine
        .upsert_customer(customer, "customer@example.com".into(), "Customer".into())
        .await
        .unwrap();
    engine
        .create_availability(Ulid::new(), host, Span::new(monday(9, 0), monday(17, 0)), mon_wed(), now())
        .await
        .unwrap();

    Fixture {
        engine,
        gateway,
        hub,
        host,
        customer,
        path,
    }
}

async fn fixture(name: &str) -> Fixture {
    fixture_with(name, EngineSettings::default()).await
}

impl Fixture {
    async fn book(&self, span: Span) -> Reservation {
        self.engine
            .create_reservation(Ulid::new(), self.customer, self.host, span, dec!(100.00), now())
            .await
            .unwrap()
    }

    /// Create an intent for the reservation and return (transaction id, intent ref).
    async fn pay(&self, reservation: &Reservation) -> (Ulid, String) {
        let tx = Ulid::new();
        self.engine
            .create_payment_intent(tx, self.customer, self.host, reservation.amount, Some(reservation.id), None, now())
            .await
            .unwrap();
        let intent = self.engine.get_transaction(tx).await.unwrap().intent_ref.unwrap();
        (tx, intent)
    }

    /// Book, pay and capture. Returns the confirmed reservation and its entry id.
    async fn book_paid(&self, span: Span) -> (Reservation, Ulid) {
        let r = self.book(span).await;
        let (tx, intent) = self.pay(&r).await;
        self.gateway.succeed(&intent).unwrap();
        let outcome = self.engine.capture_payment(&intent, now()).await.unwrap();
        (outcome.reservation.unwrap(), tx)
    }
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn weekly_availability_expands_on_listed_days() {
    let f = fixture("weekly_expand.wal").await;
    let slots = f
        .engine
        .expand_availability(f.host, Span::new(monday(0, 0), at(2024, 6, 17, 0, 0)))
        .await
        .unwrap();
    assert_eq!(slots.len(), 4);
    assert_eq!(slots[0].span, Span::new(monday(9, 0), monday(17, 0)));
    assert_eq!(slots[1].span, Span::new(at(2024, 6, 5, 9, 0), at(2024, 6, 5, 17, 0)));
}

#[tokio::test]
async fn booking_must_fit_one_occurrence() {
    let f = fixture("fit_occurrence.wal").await;

    // Tuesday is not in the set.
    let tuesday = Span::new(at(2024, 6, 4, 10, 0), at(2024, 6, 4, 11, 0));
    let err = f
        .engine
        .create_reservation(Ulid::new(), f.customer, f.host, tuesday, dec!(50), now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotCovered { .. }));

    // Exactly the occurrence is fine.
    f.book(Span::new(monday(9, 0), monday(17, 0))).await;
}

#[tokio::test]
async fn adjacent_availabilities_do_not_union() {
    let f = fixture("no_union.wal").await;
    f.engine
        .create_availability(
            Ulid::new(),
            f.host,
            Span::new(monday(17, 0), monday(19, 0)),
            Recurrence::Once,
            now(),
        )
        .await
        .unwrap();

    assert!(!f.engine.is_host_free(f.host, Span::new(monday(16, 0), monday(18, 0))).await.unwrap());
    assert!(f.engine.is_host_free(f.host, Span::new(monday(17, 0), monday(18, 0))).await.unwrap());
}

#[tokio::test]
async fn long_one_off_window_only_covers_days_near_its_start() {
    let f = fixture("long_once.wal").await;
    // Saturday 09:00 through Wednesday 18:00.
    f.engine
        .create_availability(
            Ulid::new(),
            f.host,
            Span::new(at(2024, 6, 1, 9, 0), at(2024, 6, 5, 18, 0)),
            Recurrence::Once,
            now(),
        )
        .await
        .unwrap();

    let tuesday = Span::new(at(2024, 6, 4, 10, 0), at(2024, 6, 4, 11, 0));
    let tuesday_range = Span::new(at(2024, 6, 4, 0, 0), at(2024, 6, 5, 0, 0));
    assert!(f.engine.expand_availability(f.host, tuesday_range).await.unwrap().is_empty());
    assert!(!f.engine.is_host_free(f.host, tuesday).await.unwrap());
    let err = f
        .engine
        .create_reservation(Ulid::new(), f.customer, f.host, tuesday, dec!(10), now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotCovered { .. }));
}

#[tokio::test]
async fn retired_availability_stops_bookings() {
    let f = fixture("retire.wal").await;
    let avail_id = Ulid::new();
    f.engine
        .create_availability(avail_id, f.host, Span::new(at(2024, 6, 4, 9, 0), at(2024, 6, 4, 12, 0)), Recurrence::Once, now())
        .await
        .unwrap();
    let tuesday = Span::new(at(2024, 6, 4, 10, 0), at(2024, 6, 4, 11, 0));
    assert!(f.engine.is_host_free(f.host, tuesday).await.unwrap());

    f.engine.retire_availability(avail_id).await.unwrap();
    // Retiring twice is a no-op.
    f.engine.retire_availability(avail_id).await.unwrap();
    assert!(!f.engine.is_host_free(f.host, tuesday).await.unwrap());
    assert!(matches!(
        f.engine.retire_availability(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn weekly_without_days_rejected() {
    let f = fixture("weekly_empty.wal").await;
    let err = f
        .engine
        .create_availability(
            Ulid::new(),
            f.host,
            Span::new(monday(9, 0), monday(10, 0)),
            Recurrence::Weekly { days: WeekdaySet::EMPTY },
            now(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

// ── Reservations ─────────────────────────────────────────

#[tokio::test]
async fn create_validates_input() {
    let f = fixture("create_validation.wal").await;
    let ok = Span::new(monday(10, 0), monday(11, 0));

    let past = f
        .engine
        .create_reservation(Ulid::new(), f.customer, f.host, ok, dec!(10), monday(10, 30))
        .await;
    assert!(matches!(past, Err(EngineError::Validation(_))));

    let inverted = Span { start: monday(11, 0), end: monday(10, 0) };
    let err = f
        .engine
        .create_reservation(Ulid::new(), f.customer, f.host, inverted, dec!(10), now())
        .await;
    assert!(matches!(err, Err(EngineError::Validation(_))));

    let unknown_customer = f
        .engine
        .create_reservation(Ulid::new(), Ulid::new(), f.host, ok, dec!(10), now())
        .await;
    assert!(matches!(unknown_customer, Err(EngineError::NotFound(_))));

    let unknown_host = f
        .engine
        .create_reservation(Ulid::new(), f.customer, Ulid::new(), ok, dec!(10), now())
        .await;
    assert!(matches!(unknown_host, Err(EngineError::NotFound(_))));

    let r = f.book(ok).await;
    assert_eq!(r.status, ReservationStatus::Pending);
    let dup = f
        .engine
        .create_reservation(r.id, f.customer, f.host, Span::new(monday(12, 0), monday(13, 0)), dec!(10), now())
        .await;
    assert!(matches!(dup, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn shared_boundary_conflicts_with_confirmed() {
    let f = fixture("boundary.wal").await;
    let (taken, _) = f.book_paid(Span::new(monday(10, 0), monday(11, 0))).await;
    assert_eq!(taken.status, ReservationStatus::Confirmed);

    let err = f
        .engine
        .create_reservation(Ulid::new(), f.customer, f.host, Span::new(monday(11, 0), monday(12, 0)), dec!(10), now())
        .await
        .unwrap_err();
    match err {
        EngineError::Conflict(id) => assert_eq!(id, taken.id),
        other => panic!("expected conflict, got {other:?}"),
    }
    assert!(f.engine.is_host_free(f.host, Span::new(monday(11, 1), monday(12, 0))).await.unwrap());
}

#[tokio::test]
async fn pending_does_not_block_by_default() {
    let f = fixture("pending_default.wal").await;
    let span = Span::new(monday(10, 0), monday(11, 0));
    let first = f.book(span).await;
    let second = f.book(span).await;

    f.engine.confirm_reservation(first.id, now()).await.unwrap();
    // Confirmation re-checks the slot against the now-confirmed first.
    let err = f.engine.confirm_reservation(second.id, now()).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == first.id));
}

#[tokio::test]
async fn pending_blocks_under_strict_policy() {
    let settings = EngineSettings {
        slot_policy: SlotPolicy::PendingAndConfirmed,
        ..EngineSettings::default()
    };
    let f = fixture_with("pending_strict.wal", settings).await;
    let span = Span::new(monday(10, 0), monday(11, 0));
    f.book(span).await;
    let err = f
        .engine
        .create_reservation(Ulid::new(), f.customer, f.host, span, dec!(10), now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn cancel_needs_24_hours_notice() {
    let f = fixture("cancel_notice.wal").await;
    let early = f.book(Span::new(monday(10, 0), monday(11, 0))).await;
    let late = f.book(Span::new(monday(12, 0), monday(13, 0))).await;

    let stranger = f.engine.cancel_reservation(early.id, Ulid::new(), None, now()).await;
    assert!(matches!(stranger, Err(EngineError::Forbidden(_))));

    let (cancelled, compensation) = f
        .engine
        .cancel_reservation(early.id, f.customer, Some("ill".into()), monday(10, 0) - CANCELLATION_NOTICE_MS)
        .await
        .unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("ill"));
    assert_eq!(compensation, Compensation::None);

    let too_late = f
        .engine
        .cancel_reservation(late.id, f.host, None, monday(12, 0) - CANCELLATION_NOTICE_MS + 1)
        .await;
    assert!(matches!(too_late, Err(EngineError::OutsideWindow(_))));

    let again = f.engine.cancel_reservation(early.id, f.customer, None, now()).await;
    assert!(matches!(again, Err(EngineError::InvalidTransition { .. })));
}

#[tokio::test]
async fn complete_and_no_show_follow_the_clock() {
    let f = fixture("complete_no_show.wal").await;
    let (a, _) = f.book_paid(Span::new(monday(10, 0), monday(11, 0))).await;
    let (b, _) = f.book_paid(Span::new(monday(12, 0), monday(13, 0))).await;

    assert!(matches!(
        f.engine.complete_reservation(a.id, monday(10, 59)).await,
        Err(EngineError::OutsideWindow(_))
    ));
    let done = f.engine.complete_reservation(a.id, monday(11, 0)).await.unwrap();
    assert_eq!(done.status, ReservationStatus::Completed);

    assert!(matches!(
        f.engine.mark_no_show(b.id, monday(11, 59)).await,
        Err(EngineError::OutsideWindow(_))
    ));
    let missed = f.engine.mark_no_show(b.id, monday(12, 0)).await.unwrap();
    assert_eq!(missed.status, ReservationStatus::NoShow);

    assert!(f.engine.complete_reservation(b.id, monday(14, 0)).await.is_err());
}

#[tokio::test]
async fn override_status_uses_the_same_guards() {
    let f = fixture("override.wal").await;
    let (r, tx) = f.book_paid(Span::new(monday(10, 0), monday(11, 0))).await;

    let back = f
        .engine
        .override_status(r.id, ReservationStatus::Pending, None, now())
        .await;
    assert!(matches!(back, Err(EngineError::InvalidTransition { .. })));

    // Admin cancels inside the notice window; the payment is refunded.
    let (cancelled, compensation) = f
        .engine
        .override_status(r.id, ReservationStatus::Cancelled, Some("host emergency".into()), monday(10, 0))
        .await
        .unwrap();
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("host emergency"));
    assert!(matches!(compensation, Compensation::Refunded(_)));
    assert_eq!(f.engine.get_transaction(tx).await.unwrap().status, TransactionStatus::Refunded);
}

#[tokio::test]
async fn reschedule_moves_payment_atomically() {
    let f = fixture("reschedule.wal").await;
    let (original, tx) = f.book_paid(Span::new(monday(10, 0), monday(11, 0))).await;

    // Overlapping its own old slot is allowed.
    let new_id = Ulid::new();
    let moved = f
        .engine
        .reschedule_reservation(original.id, f.customer, new_id, Span::new(monday(10, 30), monday(11, 30)), now())
        .await
        .unwrap();
    assert_eq!(moved.status, ReservationStatus::Confirmed);
    assert!(moved.is_rescheduled);
    assert_eq!(moved.original_reservation_id, Some(original.id));
    assert_eq!(moved.transaction_id, Some(tx));

    let old = f.engine.get_reservation(original.id).await.unwrap();
    assert_eq!(old.status, ReservationStatus::Cancelled);
    assert_eq!(old.cancellation_reason.as_deref(), Some(RESCHEDULE_REASON));

    // Cancelling the replacement refunds the payment that followed it.
    let (_, compensation) = f.engine.cancel_reservation(new_id, f.host, None, now()).await.unwrap();
    assert!(matches!(compensation, Compensation::Refunded(ref e) if e.id == tx));
}

#[tokio::test]
async fn failed_reschedule_leaves_original_untouched() {
    let f = fixture("reschedule_conflict.wal").await;
    let (original, _) = f.book_paid(Span::new(monday(10, 0), monday(11, 0))).await;
    let (blocker, _) = f.book_paid(Span::new(monday(14, 0), monday(15, 0))).await;

    let err = f
        .engine
        .reschedule_reservation(original.id, f.customer, Ulid::new(), blocker.span, now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == blocker.id));
    assert_eq!(
        f.engine.get_reservation(original.id).await.unwrap().status,
        ReservationStatus::Confirmed
    );

    let pending = f.book(Span::new(monday(12, 0), monday(13, 0))).await;
    let err = f
        .engine
        .reschedule_reservation(pending.id, f.customer, Ulid::new(), Span::new(monday(16, 0), monday(17, 0)), now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

// ── Escrow ───────────────────────────────────────────────

#[tokio::test]
async fn payment_intent_splits_fees() {
    let f = fixture("split.wal").await;
    let r = f.book(Span::new(monday(10, 0), monday(11, 0))).await;
    let (tx, intent) = f.pay(&r).await;

    let entry = f.engine.get_transaction(tx).await.unwrap();
    assert_eq!(entry.status, TransactionStatus::Pending);
    assert_eq!(entry.amount, dec!(100.00));
    assert_eq!(entry.commission, dec!(10.00));
    assert_eq!(entry.vat, dec!(2.10));
    assert_eq!(entry.net, dec!(87.90));
    assert_eq!(entry.currency, "EUR");
    assert_eq!(entry.reservation_id, Some(r.id));

    let request = f.gateway.intent_request(&intent).unwrap();
    assert_eq!(request.amount_minor, 10_000);
    assert_eq!(request.fee_minor, 1_210);
    assert_eq!(request.destination, "acct_host");

    assert_eq!(f.engine.get_reservation(r.id).await.unwrap().transaction_id, Some(tx));
    let second = f
        .engine
        .create_payment_intent(Ulid::new(), f.customer, f.host, dec!(100), Some(r.id), None, now())
        .await;
    assert!(matches!(second, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn payment_intent_needs_payout_account() {
    let f = fixture("no_payout.wal").await;
    let bare_host = Ulid::new();
    f.engine
        .upsert_host(bare_host, Some("bare@example.com".into()), None)
        .await
        .unwrap();
    let err = f
        .engine
        .create_payment_intent(Ulid::new(), f.customer, bare_host, dec!(20), None, None, now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let account = f.engine.create_payout_account(bare_host, "es").await.unwrap();
    assert!(account.starts_with("acct_"));
    assert_eq!(f.engine.create_payout_account(bare_host, "ES").await.unwrap(), account);
    f.engine
        .create_payment_intent(Ulid::new(), f.customer, bare_host, dec!(20), None, None, now())
        .await
        .unwrap();
}

#[tokio::test]
async fn payment_intent_rejects_bad_amounts_and_foreign_reservations() {
    let f = fixture("intent_validation.wal").await;
    let zero = f
        .engine
        .create_payment_intent(Ulid::new(), f.customer, f.host, Decimal::ZERO, None, None, now())
        .await;
    assert!(matches!(zero, Err(EngineError::Validation(_))));

    let r = f.book(Span::new(monday(10, 0), monday(11, 0))).await;
    let other = Ulid::new();
    f.engine
        .upsert_customer(other, "other@example.com".into(), "Other".into())
        .await
        .unwrap();
    let foreign = f
        .engine
        .create_payment_intent(Ulid::new(), other, f.host, dec!(10), Some(r.id), None, now())
        .await;
    assert!(matches!(foreign, Err(EngineError::Forbidden(_))));
}

#[tokio::test]
async fn gateway_outage_records_nothing() {
    let f = fixture("outage.wal").await;
    f.gateway.set_unavailable(true);
    let tx = Ulid::new();
    let err = f
        .engine
        .create_payment_intent(tx, f.customer, f.host, dec!(30), None, None, now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Gateway(GatewayError::Unavailable(_))));
    assert!(matches!(f.engine.get_transaction(tx).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn capture_confirms_and_is_idempotent() {
    let f = fixture("capture.wal").await;
    let mut rx = f.hub.subscribe(f.customer);
    let r = f.book(Span::new(monday(10, 0), monday(11, 0))).await;
    let (tx, intent) = f.pay(&r).await;

    // Nothing captured at the gateway yet.
    let early = f.engine.capture_payment(&intent, now()).await;
    assert!(matches!(early, Err(EngineError::Validation(_))));
    assert_eq!(f.engine.get_transaction(tx).await.unwrap().status, TransactionStatus::Pending);

    let charge = f.gateway.succeed(&intent).unwrap();
    let outcome = f.engine.capture_payment(&intent, now()).await.unwrap();
    assert!(!outcome.duplicate);
    assert_eq!(outcome.entry.status, TransactionStatus::Completed);
    assert_eq!(outcome.entry.charge_ref.as_deref(), Some(charge.as_str()));
    assert_eq!(outcome.reservation.unwrap().status, ReservationStatus::Confirmed);
    assert_eq!(outcome.compensation, Compensation::None);

    let again = f.engine.capture_payment(&intent, now()).await.unwrap();
    assert!(again.duplicate);
    assert_eq!(again.entry.status, TransactionStatus::Completed);

    let mut kinds = Vec::new();
    while let Ok(n) = rx.try_recv() {
        kinds.push(n.kind);
    }
    assert!(kinds.contains(&NotificationKind::ReservationConfirmed));

    assert!(matches!(
        f.engine.capture_payment("pi_unknown", now()).await,
        Err(EngineError::IntentNotFound(_))
    ));
}

#[tokio::test]
async fn capture_after_cancel_refunds() {
    let f = fixture("capture_after_cancel.wal").await;
    let r = f.book(Span::new(monday(10, 0), monday(11, 0))).await;
    let (tx, intent) = f.pay(&r).await;

    let (_, compensation) = f.engine.cancel_reservation(r.id, f.customer, None, now()).await.unwrap();
    // Still PENDING at the gateway, nothing to refund yet.
    assert_eq!(compensation, Compensation::None);

    f.gateway.succeed(&intent).unwrap();
    let outcome = f.engine.capture_payment(&intent, now()).await.unwrap();
    assert_eq!(outcome.reservation.unwrap().status, ReservationStatus::Cancelled);
    assert!(matches!(outcome.compensation, Compensation::Refunded(_)));
    assert_eq!(outcome.entry.status, TransactionStatus::Refunded);

    let entry = f.engine.get_transaction(tx).await.unwrap();
    assert_eq!(entry.status, TransactionStatus::Refunded);
    assert_eq!(f.gateway.refunds(), vec![intent]);
}

#[tokio::test]
async fn cancel_after_capture_refunds() {
    let f = fixture("cancel_after_capture.wal").await;
    let (r, tx) = f.book_paid(Span::new(monday(10, 0), monday(11, 0))).await;

    let (cancelled, compensation) = f.engine.cancel_reservation(r.id, f.customer, None, now()).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    match compensation {
        Compensation::Refunded(entry) => {
            assert_eq!(entry.id, tx);
            assert_eq!(entry.status, TransactionStatus::Refunded);
            assert!(entry.notes.is_some());
        }
        other => panic!("expected refund, got {other:?}"),
    }
}

#[tokio::test]
async fn refund_failure_is_reported_not_raised() {
    let f = fixture("refund_failure.wal").await;
    let (r, tx) = f.book_paid(Span::new(monday(10, 0), monday(11, 0))).await;

    f.gateway.set_unavailable(true);
    let (cancelled, compensation) = f.engine.cancel_reservation(r.id, f.customer, None, now()).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert!(matches!(compensation, Compensation::RefundFailed { transaction_id, .. } if transaction_id == tx));
    assert_eq!(f.engine.get_transaction(tx).await.unwrap().status, TransactionStatus::Completed);
}

#[tokio::test]
async fn capture_after_slot_lost_cancels_and_refunds() {
    let f = fixture("slot_lost.wal").await;
    let span = Span::new(monday(10, 0), monday(11, 0));
    let winner = f.book(span).await;
    let loser = f.book(span).await;
    let (_, winner_intent) = f.pay(&winner).await;
    let (loser_tx, loser_intent) = f.pay(&loser).await;

    f.gateway.succeed(&winner_intent).unwrap();
    f.gateway.succeed(&loser_intent).unwrap();
    f.engine.capture_payment(&winner_intent, now()).await.unwrap();

    let outcome = f.engine.capture_payment(&loser_intent, now()).await.unwrap();
    let lost = outcome.reservation.unwrap();
    assert_eq!(lost.status, ReservationStatus::Cancelled);
    assert_eq!(lost.cancellation_reason.as_deref(), Some(SLOT_LOST_REASON));
    assert!(matches!(outcome.compensation, Compensation::Refunded(_)));
    assert_eq!(f.engine.get_transaction(loser_tx).await.unwrap().status, TransactionStatus::Refunded);
    assert_eq!(
        f.engine.get_reservation(winner.id).await.unwrap().status,
        ReservationStatus::Confirmed
    );
}

#[tokio::test]
async fn refund_only_from_completed() {
    let f = fixture("refund_states.wal").await;
    let r = f.book(Span::new(monday(10, 0), monday(11, 0))).await;
    let (tx, intent) = f.pay(&r).await;

    assert!(matches!(
        f.engine.refund_transaction(tx, None).await,
        Err(EngineError::EntryState { status: TransactionStatus::Pending, .. })
    ));

    f.gateway.succeed(&intent).unwrap();
    f.engine.capture_payment(&intent, now()).await.unwrap();
    let refunded = f.engine.refund_transaction(tx, Some("goodwill".into())).await.unwrap();
    assert_eq!(refunded.status, TransactionStatus::Refunded);
    assert_eq!(refunded.notes.as_deref(), Some("goodwill"));

    assert!(matches!(
        f.engine.refund_transaction(tx, None).await,
        Err(EngineError::EntryState { status: TransactionStatus::Refunded, .. })
    ));
}

#[tokio::test]
async fn webhooks_drive_capture_and_failure() {
    let f = fixture("webhooks.wal").await;
    let r = f.book(Span::new(monday(10, 0), monday(11, 0))).await;
    let (_, intent) = f.pay(&r).await;

    let (body, sig) = f.gateway.signed_webhook("payment_intent.succeeded", &intent);
    assert!(matches!(
        f.engine.handle_webhook(&body, "forged", now()).await,
        Err(EngineError::Gateway(GatewayError::InvalidSignature))
    ));

    f.gateway.succeed(&intent).unwrap();
    match f.engine.handle_webhook(&body, &sig, now()).await.unwrap() {
        WebhookOutcome::Captured(outcome) => {
            assert_eq!(outcome.reservation.unwrap().status, ReservationStatus::Confirmed);
        }
        other => panic!("expected capture, got {other:?}"),
    }
    // Redelivery is harmless.
    match f.engine.handle_webhook(&body, &sig, now()).await.unwrap() {
        WebhookOutcome::Captured(outcome) => assert!(outcome.duplicate),
        other => panic!("expected duplicate capture, got {other:?}"),
    }

    let other = f.book(Span::new(monday(12, 0), monday(13, 0))).await;
    let (other_tx, other_intent) = f.pay(&other).await;
    f.gateway.fail(&other_intent);
    let (body, sig) = f.gateway.signed_webhook("payment_intent.payment_failed", &other_intent);
    let outcome = f.engine.handle_webhook(&body, &sig, now()).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Failed(ref e) if e.id == other_tx));

    let (body, sig) = f.gateway.signed_webhook("charge.updated", &other_intent);
    assert_eq!(
        f.engine.handle_webhook(&body, &sig, now()).await.unwrap(),
        WebhookOutcome::Ignored("charge.updated".into())
    );
}

#[tokio::test]
async fn declined_payment_can_be_retried() {
    let f = fixture("retry_payment.wal").await;
    let r = f.book(Span::new(monday(10, 0), monday(11, 0))).await;
    let (declined, declined_intent) = f.pay(&r).await;
    assert_eq!(f.engine.get_reservation(r.id).await.unwrap().transaction_id, Some(declined));

    f.gateway.fail(&declined_intent);
    let failed = f.engine.fail_payment(&declined_intent).await.unwrap();
    assert_eq!(failed.status, TransactionStatus::Failed);
    assert_eq!(f.engine.get_reservation(r.id).await.unwrap().transaction_id, None);

    let (retry, retry_intent) = f.pay(&r).await;
    assert_eq!(f.engine.get_reservation(r.id).await.unwrap().transaction_id, Some(retry));
    // A live payment still blocks a third one.
    let third = f
        .engine
        .create_payment_intent(Ulid::new(), f.customer, f.host, r.amount, Some(r.id), None, now())
        .await;
    assert!(matches!(third, Err(EngineError::Validation(_))));

    f.gateway.succeed(&retry_intent).unwrap();
    let outcome = f.engine.capture_payment(&retry_intent, now()).await.unwrap();
    assert_eq!(outcome.reservation.unwrap().status, ReservationStatus::Confirmed);

    // The link survives a restart and a compaction.
    f.engine.compact_wal().await.unwrap();
    let path = f.path.clone();
    let gateway = f.gateway.clone();
    drop(f);
    let hub = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, EngineSettings::default(), services(&gateway, &hub)).unwrap();
    assert_eq!(engine.get_reservation(r.id).await.unwrap().transaction_id, Some(retry));
    assert_eq!(engine.get_transaction(declined).await.unwrap().status, TransactionStatus::Failed);
}

#[tokio::test]
async fn declined_payment_unlink_survives_restart() {
    let f = fixture("unlink_restart.wal").await;
    let r = f.book(Span::new(monday(10, 0), monday(11, 0))).await;
    let (_, intent) = f.pay(&r).await;
    f.gateway.fail(&intent);
    f.engine.fail_payment(&intent).await.unwrap();
    let path = f.path.clone();
    let gateway = f.gateway.clone();
    drop(f);

    let hub = Arc::new(NotifyHub::new());
    let engine = Engine::new(path.clone(), EngineSettings::default(), services(&gateway, &hub)).unwrap();
    assert_eq!(engine.get_reservation(r.id).await.unwrap().transaction_id, None);

    // Compaction re-emits the declined entry; it must not re-link.
    engine.compact_wal().await.unwrap();
    drop(engine);
    let engine = Engine::new(path, EngineSettings::default(), services(&gateway, &hub)).unwrap();
    assert_eq!(engine.get_reservation(r.id).await.unwrap().transaction_id, None);
}

#[tokio::test]
async fn concurrent_intents_for_one_reservation_single_winner() {
    let f = Arc::new(fixture("concurrent_intents.wal").await);
    let r = f.book(Span::new(monday(10, 0), monday(11, 0))).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let f = f.clone();
        let rid = r.id;
        handles.push(tokio::spawn(async move {
            let tx = Ulid::new();
            f.engine
                .create_payment_intent(tx, f.customer, f.host, dec!(100.00), Some(rid), None, now())
                .await
                .ok()
                .map(|_| tx)
        }));
    }
    let mut winners = Vec::new();
    for h in handles {
        if let Some(tx) = h.await.unwrap() {
            winners.push(tx);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(f.engine.get_reservation(r.id).await.unwrap().transaction_id, Some(winners[0]));
    let for_customer = f
        .engine
        .list_transactions(TransactionFilter::All)
        .await
        .into_iter()
        .filter(|e| e.reservation_id == Some(r.id))
        .count();
    assert_eq!(for_customer, 1);
}

#[tokio::test]
async fn late_capture_of_declined_payment_is_refunded() {
    let f = fixture("late_capture.wal").await;
    let r = f.book(Span::new(monday(10, 0), monday(11, 0))).await;
    let (declined, declined_intent) = f.pay(&r).await;
    f.gateway.fail(&declined_intent);
    f.engine.fail_payment(&declined_intent).await.unwrap();

    let (retry, retry_intent) = f.pay(&r).await;
    f.gateway.succeed(&retry_intent).unwrap();
    f.engine.capture_payment(&retry_intent, now()).await.unwrap();

    // The customer completes the first intent after all.
    f.gateway.succeed(&declined_intent).unwrap();
    let outcome = f.engine.capture_payment(&declined_intent, now()).await.unwrap();
    match &outcome.compensation {
        Compensation::Refunded(entry) => {
            assert_eq!(entry.id, declined);
            assert_eq!(entry.notes.as_deref(), Some(SUPERSEDED_REASON));
        }
        other => panic!("expected refund, got {other:?}"),
    }
    let kept = f.engine.get_reservation(r.id).await.unwrap();
    assert_eq!(kept.status, ReservationStatus::Confirmed);
    assert_eq!(kept.transaction_id, Some(retry));
    assert_eq!(f.engine.get_transaction(retry).await.unwrap().status, TransactionStatus::Completed);
    assert_eq!(f.gateway.refunds(), vec![declined_intent]);
}

// ── Settlement ───────────────────────────────────────────

#[tokio::test]
async fn release_after_retention_period() {
    let f = fixture("release.wal").await;
    let mut host_rx = f.hub.subscribe(f.host);
    let (_, tx) = f.book_paid(Span::new(monday(10, 0), monday(11, 0))).await;
    // A pending entry never matures.
    let pending = f.book(Span::new(monday(12, 0), monday(13, 0))).await;
    let (pending_tx, _) = f.pay(&pending).await;

    let six_days = f.engine.process_releases(now() + 6 * DAY_MS).await.unwrap();
    assert!(six_days.is_empty());

    let released = f.engine.process_releases(now() + 7 * DAY_MS).await.unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].id, tx);
    assert!(released[0].is_released);
    assert_eq!(released[0].released_at, Some(now() + 7 * DAY_MS));
    assert!(!f.engine.get_transaction(pending_tx).await.unwrap().is_released);

    let again = f.engine.process_releases(now() + 8 * DAY_MS).await.unwrap();
    assert!(again.is_empty());

    let mut funds = 0;
    while let Ok(n) = host_rx.try_recv() {
        if n.kind == NotificationKind::FundsReleased {
            funds += 1;
        }
    }
    assert_eq!(funds, 1);
}

#[tokio::test]
async fn released_payment_is_not_refunded_on_cancel() {
    let f = fixture("released_no_refund.wal").await;
    let (r, tx) = f.book_paid(Span::new(monday(10, 0), monday(11, 0))).await;
    f.engine.process_releases(now() + 7 * DAY_MS).await.unwrap();

    let (_, compensation) = f.engine.override_status(r.id, ReservationStatus::Cancelled, None, now()).await.unwrap();
    assert_eq!(compensation, Compensation::None);
    assert_eq!(f.engine.get_transaction(tx).await.unwrap().status, TransactionStatus::Completed);
}

#[tokio::test]
async fn releases_before_a_wal_failure_are_still_announced() {
    let mut f = fixture("release_partial.wal").await;
    let mut host_rx = f.hub.subscribe(f.host);
    let (_, first) = f.book_paid(Span::new(monday(10, 0), monday(11, 0))).await;
    let (_, second) = f.book_paid(Span::new(monday(12, 0), monday(13, 0))).await;
    while host_rx.try_recv().is_ok() {}

    // A writer that commits one record and then goes away.
    let (wal_tx, mut wal_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        if let Some(WalCommand::Append { response, .. }) = wal_rx.recv().await {
            let _ = response.send(Ok(()));
        }
    });
    f.engine.wal_tx = wal_tx;

    let result = f.engine.process_releases(now() + 7 * DAY_MS).await;
    assert!(matches!(result, Err(EngineError::WalError(_))));

    let mut flagged = Vec::new();
    for id in [first, second] {
        if f.engine.get_transaction(id).await.unwrap().is_released {
            flagged.push(id);
        }
    }
    assert_eq!(flagged.len(), 1);

    let mut announced = Vec::new();
    while let Ok(n) = host_rx.try_recv() {
        if n.kind == NotificationKind::FundsReleased {
            announced.push(n.related_id);
        }
    }
    assert_eq!(announced, vec![Some(flagged[0])]);
}

// ── Calls ────────────────────────────────────────────────

#[tokio::test]
async fn join_call_windows() {
    let f = fixture("join_call.wal").await;
    let (r, _) = f.book_paid(Span::new(monday(10, 0), monday(11, 0))).await;

    let host_grant = f.engine.join_call(r.id, f.host, monday(7, 0)).await.unwrap();
    assert_eq!(host_grant.role, crate::gateway::CallRole::Publisher);
    assert_eq!(host_grant.channel, channel_for(r.id));
    assert_eq!(host_grant.expires_at, monday(7, 0) + CALL_TOKEN_TTL_MS);

    assert!(matches!(
        f.engine.join_call(r.id, f.customer, monday(10, 0) - EARLY_JOIN_MS - 1).await,
        Err(EngineError::OutsideWindow(_))
    ));
    let grant = f
        .engine
        .join_call(r.id, f.customer, monday(10, 0) - EARLY_JOIN_MS)
        .await
        .unwrap();
    assert_eq!(grant.role, crate::gateway::CallRole::Subscriber);
    assert_eq!(grant.uid, call_uid(f.customer));

    assert!(matches!(
        f.engine.join_call(r.id, f.host, monday(11, 1)).await,
        Err(EngineError::OutsideWindow(_))
    ));
    assert!(matches!(
        f.engine.join_call(r.id, Ulid::new(), monday(10, 0)).await,
        Err(EngineError::Forbidden(_))
    ));

    f.engine.cancel_reservation(r.id, f.customer, None, now()).await.unwrap();
    assert!(matches!(
        f.engine.join_call(r.id, f.host, monday(10, 0)).await,
        Err(EngineError::Forbidden(_))
    ));
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn reservation_listing_order() {
    let f = fixture("listing.wal").await;
    let (early, _) = f.book_paid(Span::new(monday(10, 0), monday(11, 0))).await;
    let (late, _) = f.book_paid(Span::new(at(2024, 6, 5, 10, 0), at(2024, 6, 5, 11, 0))).await;
    let pending = f.book(Span::new(monday(14, 0), monday(15, 0))).await;

    let by_host: Vec<Ulid> = f
        .engine
        .list_reservations(ReservationFilter::Host(f.host), now())
        .await
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(by_host, vec![late.id, pending.id, early.id]);

    let upcoming: Vec<Ulid> = f
        .engine
        .list_reservations(ReservationFilter::Upcoming(f.customer), now())
        .await
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(upcoming, vec![early.id, late.id]);

    // Once Monday's session has started it is no longer upcoming.
    let later = f
        .engine
        .list_reservations(ReservationFilter::Upcoming(f.host), monday(10, 1))
        .await;
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].id, late.id);

    assert!(f.engine.list_reservations(ReservationFilter::Customer(Ulid::new()), now()).await.is_empty());
    assert_eq!(f.engine.list_reservations(ReservationFilter::Id(pending.id), now()).await.len(), 1);
}

#[tokio::test]
async fn transaction_listing_and_stats() {
    let f = fixture("stats.wal").await;
    let (_, first) = f.book_paid(Span::new(monday(10, 0), monday(11, 0))).await;
    let r = f
        .engine
        .create_reservation(Ulid::new(), f.customer, f.host, Span::new(monday(12, 0), monday(13, 0)), dec!(50.00), now())
        .await
        .unwrap();
    let (second, intent) = f.pay(&r).await;
    f.gateway.succeed(&intent).unwrap();
    f.engine.capture_payment(&intent, now()).await.unwrap();
    // Pending entries are not counted.
    let pending = f.book(Span::new(monday(14, 0), monday(15, 0))).await;
    f.pay(&pending).await;

    let stats = f.engine.transaction_stats().await;
    assert_eq!(stats.completed_count, 2);
    assert_eq!(stats.total_amount, dec!(150.00));
    assert_eq!(stats.total_commission, dec!(15.00));
    assert_eq!(stats.total_vat, dec!(3.15));
    assert_eq!(stats.total_revenue, dec!(18.15));

    let mine = f.engine.list_transactions(TransactionFilter::User(f.host)).await;
    assert_eq!(mine.len(), 3);
    assert!(f.engine.list_transactions(TransactionFilter::User(Ulid::new())).await.is_empty());
    let one = f.engine.list_transactions(TransactionFilter::Id(first)).await;
    assert_eq!(one[0].id, first);
    assert!(mine.iter().any(|e| e.id == second));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let f = fixture("restart.wal").await;
    let (r, tx) = f.book_paid(Span::new(monday(10, 0), monday(11, 0))).await;
    let cancelled = f.book(Span::new(monday(12, 0), monday(13, 0))).await;
    f.engine.cancel_reservation(cancelled.id, f.customer, Some("busy".into()), now()).await.unwrap();
    f.engine.process_releases(now() + 7 * DAY_MS).await.unwrap();
    let intent = f.engine.get_transaction(tx).await.unwrap().intent_ref.unwrap();
    let path = f.path.clone();
    let gateway = f.gateway.clone();
    drop(f);

    let hub = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, EngineSettings::default(), services(&gateway, &hub)).unwrap();

    let restored = engine.get_reservation(r.id).await.unwrap();
    assert_eq!(restored.status, ReservationStatus::Confirmed);
    assert_eq!(restored.transaction_id, Some(tx));
    let gone = engine.get_reservation(cancelled.id).await.unwrap();
    assert_eq!(gone.cancellation_reason.as_deref(), Some("busy"));

    let entry = engine.get_transaction(tx).await.unwrap();
    assert_eq!(entry.status, TransactionStatus::Completed);
    assert!(entry.is_released);
    // The intent index is rebuilt, so a late webhook is a duplicate.
    assert!(engine.capture_payment(&intent, now()).await.unwrap().duplicate);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let f = fixture("compact.wal").await;
    let (r, tx) = f.book_paid(Span::new(monday(10, 0), monday(11, 0))).await;
    let new_id = Ulid::new();
    f.engine
        .reschedule_reservation(r.id, f.customer, new_id, Span::new(at(2024, 6, 5, 10, 0), at(2024, 6, 5, 11, 0)), now())
        .await
        .unwrap();
    let before_res = f.engine.list_reservations(ReservationFilter::All, now()).await;
    let before_tx = f.engine.list_transactions(TransactionFilter::All).await;
    let gateway_customer = f.engine.customer(&f.customer).unwrap().gateway_customer;
    assert!(gateway_customer.is_some());

    assert!(f.engine.wal_appends_since_compact().await > 0);
    f.engine.compact_wal().await.unwrap();
    assert_eq!(f.engine.wal_appends_since_compact().await, 0);

    let path = f.path.clone();
    let gateway = f.gateway.clone();
    drop(f);
    let hub = Arc::new(NotifyHub::new());
    let engine = Engine::new(path, EngineSettings::default(), services(&gateway, &hub)).unwrap();

    assert_eq!(engine.list_reservations(ReservationFilter::All, now()).await, before_res);
    assert_eq!(engine.list_transactions(TransactionFilter::All).await, before_tx);
    assert_eq!(engine.customer(&before_tx[0].customer_id).unwrap().gateway_customer, gateway_customer);
    assert_eq!(engine.get_reservation(new_id).await.unwrap().transaction_id, Some(tx));
}

#[tokio::test]
async fn concurrent_bookings_single_winner() {
    let settings = EngineSettings {
        slot_policy: SlotPolicy::PendingAndConfirmed,
        ..EngineSettings::default()
    };
    let f = Arc::new(fixture_with("concurrent.wal", settings).await);
    let span = Span::new(monday(10, 0), monday(11, 0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let f = f.clone();
        handles.push(tokio::spawn(async move {
            f.engine
                .create_reservation(Ulid::new(), f.customer, f.host, span, dec!(10), now())
                .await
                .is_ok()
        }));
    }
    let mut wins = 0;
    for h in handles {
        if h.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
}

#[tokio::test]
async fn same_id_on_two_hosts_only_one_wins() {
    let f = Arc::new(fixture("shared_id.wal").await);
    let other_host = Ulid::new();
    f.engine
        .upsert_host(other_host, None, Some("acct_other".into()))
        .await
        .unwrap();
    f.engine
        .create_availability(Ulid::new(), other_host, Span::new(monday(9, 0), monday(17, 0)), mon_wed(), now())
        .await
        .unwrap();

    let span = Span::new(monday(10, 0), monday(11, 0));
    for _ in 0..8 {
        let id = Ulid::new();
        let mut handles = Vec::new();
        for host in [f.host, other_host] {
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                f.engine.create_reservation(id, f.customer, host, span, dec!(10), now()).await
            }));
        }
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert!(matches!(e, EngineError::AlreadyExists(dup) if dup == id), "{e}"),
            }
        }
        assert_eq!(ok, 1);
        let owner = f.engine.host_for_entity(&id).unwrap();
        assert_eq!(f.engine.get_reservation(id).await.unwrap().host_id, owner);
    }
}
