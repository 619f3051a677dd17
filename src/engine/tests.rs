use super::*;
use crate::clock::ManualClock;
use crate::mirror::{EventDraft, FINALIZED_MARKER, InMemoryCalendar, MirrorError};
use async_trait::async_trait;
use chrono_tz::America::Argentina::Buenos_Aires;
use rust_decimal::Decimal;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

/// 2025-03-10 10:00 in Buenos Aires.
const NOW: Ms = 1_741_611_600_000;
/// 2025-03-11 00:00 in Buenos Aires.
const TOMORROW: Ms = 1_741_662_000_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("salas_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn options() -> EngineOptions {
    EngineOptions {
        policy: BookingPolicy {
            timezone: Buenos_Aires,
            min_lead_ms: H,
            payment_timeout_ms: 30 * M,
        },
        store_timeout: Duration::from_secs(5),
        mirror_timeout: Duration::from_millis(200),
    }
}

struct Harness {
    engine: Engine,
    clock: Arc<ManualClock>,
    calendar: Arc<InMemoryCalendar>,
    path: PathBuf,
    client: Ulid,
    room: Ulid,
}

impl Harness {
    fn actor(&self) -> Actor {
        Actor::client(self.client)
    }

    fn booking(&self, start: Ms, end: Ms) -> NewReservation {
        NewReservation {
            client_id: self.client,
            room_id: self.room,
            start,
            end,
            payment_method: PaymentMethod::Cash,
            amount: Some(Decimal::new(15_000, 2)),
        }
    }

    async fn book(&self, start: Ms, end: Ms) -> Reservation {
        self.engine
            .create_reservation(&self.actor(), self.booking(start, end))
            .await
            .unwrap()
    }

    fn changes(&self, start: Ms, end: Ms) -> ReservationChanges {
        ReservationChanges {
            room_id: self.room,
            start,
            end,
            payment_method: PaymentMethod::Cash,
            amount: None,
        }
    }

    async fn add_client(&self, name: &str) -> Ulid {
        let id = Ulid::new();
        self.engine
            .register_client(id, name.into(), format!("{name}@example.com"))
            .await
            .unwrap();
        id
    }

    async fn add_room(&self, number: u32) -> Ulid {
        let id = Ulid::new();
        self.engine
            .create_room(
                id,
                RoomSpec {
                    number,
                    size: RoomSize::Medium,
                    description: None,
                },
            )
            .await
            .unwrap();
        id
    }
}

async fn harness(name: &str) -> Harness {
    harness_with_mirror(name, None).await
}

async fn harness_with_mirror(name: &str, mirror: Option<Arc<dyn CalendarMirror>>) -> Harness {
    let path = test_wal_path(name);
    let clock = Arc::new(ManualClock::new(NOW));
    let calendar = Arc::new(InMemoryCalendar::new(Buenos_Aires, "2"));
    let mirror = mirror.unwrap_or_else(|| calendar.clone() as Arc<dyn CalendarMirror>);
    let engine = Engine::new(path.clone(), options(), mirror, clock.clone()).unwrap();

    let client = Ulid::new();
    engine
        .register_client(client, "Ana".into(), "ana@example.com".into())
        .await
        .unwrap();
    let room = Ulid::new();
    engine
        .create_room(
            room,
            RoomSpec {
                number: 3,
                size: RoomSize::Small,
                description: Some("Planta baja".into()),
            },
        )
        .await
        .unwrap();

    Harness {
        engine,
        clock,
        calendar,
        path,
        client,
        room,
    }
}

/// Calendar that is always down.
struct DownCalendar;

#[async_trait]
impl CalendarMirror for DownCalendar {
    async fn create_event(&self, _: &EventDraft) -> Result<String, MirrorError> {
        Err(MirrorError::Unavailable("503".into()))
    }
    async fn update_event(&self, _: &str, _: &EventDraft) -> Result<(), MirrorError> {
        Err(MirrorError::Unavailable("503".into()))
    }
    async fn delete_event(&self, _: &str) -> Result<(), MirrorError> {
        Err(MirrorError::Unavailable("503".into()))
    }
    async fn annotate_finalized(&self, _: &str, _: Ulid, _: Ms) -> Result<(), MirrorError> {
        Err(MirrorError::Unavailable("503".into()))
    }
}

// ── Creation ─────────────────────────────────────────────

#[tokio::test]
async fn create_cash_reservation_is_active_and_mirrored() {
    let h = harness("create_active.wal").await;
    let r = h.book(TOMORROW + 10 * H, TOMORROW + 12 * H).await;

    assert_eq!(r.status, ReservationStatus::Active);
    assert_eq!(r.created_at, NOW);
    assert_eq!(r.payment_deadline, None);
    assert_eq!(r.amount, Some(Decimal::new(15_000, 2)));

    let key = r.mirror_key.clone().unwrap();
    let event = h.calendar.event(&key).unwrap();
    assert_eq!(event.summary, "Reserva de Ana");
    assert_eq!(event.description, "Sala: 3\nEmailCliente: ana@example.com");
    assert_eq!((event.start, event.end), (r.span.start, r.span.end));

    assert_eq!(h.engine.get_reservation(&r.id).unwrap(), r);
    assert_eq!(h.engine.find_by_mirror_key(&key).map(|r| r.id), Some(r.id));
}

#[tokio::test]
async fn online_payment_starts_pending_with_deadline() {
    let h = harness("create_pending.wal").await;
    let mut req = h.booking(TOMORROW + 10 * H, TOMORROW + 11 * H);
    req.payment_method = PaymentMethod::MercadoPago;
    let r = h.engine.create_reservation(&h.actor(), req).await.unwrap();

    assert_eq!(r.status, ReservationStatus::PendingPaymentConfirmation);
    assert_eq!(r.payment_deadline, Some(NOW + 30 * M));
    assert!(h.engine.has_occupying_reservation(&h.room).await);
}

#[tokio::test]
async fn inverted_or_empty_window_rejected() {
    let h = harness("invalid_window.wal").await;
    let start = TOMORROW + 10 * H;
    for end in [start, start - H] {
        let err = h
            .engine
            .create_reservation(&h.actor(), h.booking(start, end))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::InvalidWindow);
    }
}

#[tokio::test]
async fn same_day_booking_violates_lead_time() {
    let h = harness("lead_today.wal").await;
    // 15:00 today is well past the one-hour lead but still today.
    let err = h
        .engine
        .create_reservation(&h.actor(), h.booking(NOW + 5 * H, NOW + 6 * H))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::LeadTimeViolation { earliest: TOMORROW });

    h.book(TOMORROW, TOMORROW + H).await;
}

#[tokio::test]
async fn late_evening_lead_time_floor_dominates() {
    let h = harness("lead_late.wal").await;
    h.clock.set(TOMORROW - 30 * M); // 23:30

    let err = h
        .engine
        .create_reservation(&h.actor(), h.booking(TOMORROW, TOMORROW + H))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::LeadTimeViolation {
            earliest: TOMORROW + 30 * M
        }
    );

    h.book(TOMORROW + 30 * M, TOMORROW + 2 * H).await;
}

#[tokio::test]
async fn overlapping_window_conflicts_touching_does_not() {
    let h = harness("conflict.wal").await;
    let first = h.book(TOMORROW + 10 * H, TOMORROW + 12 * H).await;

    let err = h
        .engine
        .create_reservation(&h.actor(), h.booking(TOMORROW + 11 * H, TOMORROW + 13 * H))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::WindowConflict(first.id));

    h.book(TOMORROW + 12 * H, TOMORROW + 13 * H).await;
    h.book(TOMORROW + 9 * H, TOMORROW + 10 * H).await;
}

#[tokio::test]
async fn pending_reservation_blocks_the_slot() {
    let h = harness("pending_blocks.wal").await;
    let mut req = h.booking(TOMORROW + 10 * H, TOMORROW + 11 * H);
    req.payment_method = PaymentMethod::MercadoPago;
    let pending = h.engine.create_reservation(&h.actor(), req).await.unwrap();

    let err = h
        .engine
        .create_reservation(&h.actor(), h.booking(TOMORROW + 10 * H, TOMORROW + 11 * H))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::WindowConflict(pending.id));
}

#[tokio::test]
async fn unknown_client_and_room_rejected() {
    let h = harness("unknown_refs.wal").await;
    let staff = Actor::staff(Ulid::new());

    let mut req = h.booking(TOMORROW + H, TOMORROW + 2 * H);
    req.client_id = Ulid::new();
    let err = h.engine.create_reservation(&staff, req.clone()).await.unwrap_err();
    assert_eq!(err, EngineError::ClientNotFound(req.client_id));

    let mut req = h.booking(TOMORROW + H, TOMORROW + 2 * H);
    req.room_id = Ulid::new();
    let err = h.engine.create_reservation(&staff, req.clone()).await.unwrap_err();
    assert_eq!(err, EngineError::RoomNotFound(req.room_id));
}

#[tokio::test]
async fn removed_room_cannot_be_booked() {
    let h = harness("removed_room_booking.wal").await;
    h.engine.soft_delete_room(h.room).await.unwrap();
    let err = h
        .engine
        .create_reservation(&h.actor(), h.booking(TOMORROW + H, TOMORROW + 2 * H))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::RoomNotFound(h.room));
}

#[tokio::test]
async fn client_cannot_book_for_someone_else() {
    let h = harness("book_for_other.wal").await;
    let other = h.add_client("Beto").await;
    let err = h
        .engine
        .create_reservation(&Actor::client(other), h.booking(TOMORROW + H, TOMORROW + 2 * H))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let staff = Actor::staff(Ulid::new());
    let r = h
        .engine
        .create_reservation(&staff, h.booking(TOMORROW + H, TOMORROW + 2 * H))
        .await
        .unwrap();
    assert_eq!(r.client_id, h.client);
}

#[tokio::test]
async fn negative_amount_rejected() {
    let h = harness("negative_amount.wal").await;
    let mut req = h.booking(TOMORROW + H, TOMORROW + 2 * H);
    req.amount = Some(Decimal::new(-1, 0));
    let err = h.engine.create_reservation(&h.actor(), req).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn mirror_failure_does_not_fail_creation() {
    let h = harness_with_mirror("mirror_down.wal", Some(Arc::new(DownCalendar))).await;
    let r = h.book(TOMORROW + H, TOMORROW + 2 * H).await;

    assert_eq!(r.status, ReservationStatus::Active);
    assert_eq!(r.mirror_key, None);
    assert_eq!(h.engine.get_reservation(&r.id).unwrap(), r);

    // Cancellation still succeeds with no mirror key and a dead calendar.
    let cancelled = h.engine.cancel_reservation(&h.actor(), r.id).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
}

#[tokio::test]
async fn concurrent_creations_on_same_window_have_one_winner() {
    let h = harness("concurrent_create.wal").await;
    let engine = Arc::new(h.engine);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        let req = NewReservation {
            client_id: h.client,
            room_id: h.room,
            start: TOMORROW + 10 * H,
            end: TOMORROW + 11 * H,
            payment_method: PaymentMethod::Card,
            amount: None,
        };
        let actor = Actor::client(h.client);
        handles.push(tokio::spawn(async move {
            engine.create_reservation(&actor, req).await
        }));
    }

    let mut won = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(EngineError::WindowConflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(engine.list_by_room(&h.room).await.len(), 1);
}

// ── Modification ─────────────────────────────────────────

#[tokio::test]
async fn modify_moves_window_and_updates_mirror() {
    let h = harness("modify_window.wal").await;
    let r = h.book(TOMORROW + 10 * H, TOMORROW + 12 * H).await;

    // Overlaps its own old slot, which must not count as a conflict.
    let moved = h
        .engine
        .modify_reservation(&h.actor(), r.id, h.changes(TOMORROW + 11 * H, TOMORROW + 13 * H))
        .await
        .unwrap();
    assert_eq!(moved.span, Span::new(TOMORROW + 11 * H, TOMORROW + 13 * H));
    assert_eq!(moved.status, ReservationStatus::Active);
    assert_eq!(moved.mirror_key, r.mirror_key);

    let event = h.calendar.event(r.mirror_key.as_deref().unwrap()).unwrap();
    assert_eq!((event.start, event.end), (TOMORROW + 11 * H, TOMORROW + 13 * H));

    // The old slot's first hour is free again.
    h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;
}

#[tokio::test]
async fn modify_rechecks_conflicts_and_lead_time() {
    let h = harness("modify_rules.wal").await;
    let a = h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;
    let b = h.book(TOMORROW + 12 * H, TOMORROW + 13 * H).await;

    let err = h
        .engine
        .modify_reservation(&h.actor(), b.id, h.changes(TOMORROW + 10 * H + 30 * M, TOMORROW + 12 * H))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::WindowConflict(a.id));

    let err = h
        .engine
        .modify_reservation(&h.actor(), b.id, h.changes(NOW + 2 * H, NOW + 3 * H))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::LeadTimeViolation { earliest: TOMORROW });

    let err = h
        .engine
        .modify_reservation(&h.actor(), b.id, h.changes(TOMORROW + 14 * H, TOMORROW + 13 * H))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::InvalidWindow);

    assert_eq!(h.engine.get_reservation(&b.id).unwrap().span, b.span);
}

#[tokio::test]
async fn modify_to_another_room_frees_the_old_one() {
    let h = harness("modify_room.wal").await;
    let other_room = h.add_room(8).await;
    let r = h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;

    let mut changes = h.changes(TOMORROW + 10 * H, TOMORROW + 11 * H);
    changes.room_id = other_room;
    changes.payment_method = PaymentMethod::Transfer;
    let moved = h.engine.modify_reservation(&h.actor(), r.id, changes).await.unwrap();

    assert_eq!(moved.room_id, other_room);
    assert_eq!(moved.payment_method, PaymentMethod::Transfer);
    assert!(!h.engine.has_occupying_reservation(&h.room).await);
    assert!(h.engine.has_occupying_reservation(&other_room).await);
    let event = h.calendar.event(moved.mirror_key.as_deref().unwrap()).unwrap();
    assert_eq!(event.description, "Sala: 8\nEmailCliente: ana@example.com");
}

#[tokio::test]
async fn modify_guards_ownership_state_and_existence() {
    let h = harness("modify_guards.wal").await;
    let r = h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;
    let stranger = h.add_client("Carla").await;

    let err = h
        .engine
        .modify_reservation(&Actor::client(stranger), r.id, h.changes(TOMORROW + 14 * H, TOMORROW + 15 * H))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let missing = Ulid::new();
    let err = h
        .engine
        .modify_reservation(&h.actor(), missing, h.changes(TOMORROW + 14 * H, TOMORROW + 15 * H))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::ReservationNotFound(missing));

    h.engine.cancel_reservation(&h.actor(), r.id).await.unwrap();
    let err = h
        .engine
        .modify_reservation(&h.actor(), r.id, h.changes(TOMORROW + 14 * H, TOMORROW + 15 * H))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::NotModifiable(r.id));
}

#[tokio::test]
async fn modify_without_mirror_key_creates_the_event() {
    let h = harness("modify_creates_event.wal").await;
    let r = h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;
    // Simulate a creation whose calendar call failed.
    h.calendar.delete_event(r.mirror_key.as_deref().unwrap()).await.unwrap();
    h.engine.store.save(Reservation {
        mirror_key: None,
        ..r.clone()
    });

    let moved = h
        .engine
        .modify_reservation(&h.actor(), r.id, h.changes(TOMORROW + 12 * H, TOMORROW + 13 * H))
        .await
        .unwrap();
    let key = moved.mirror_key.unwrap();
    assert_eq!(h.calendar.event(&key).unwrap().start, TOMORROW + 12 * H);
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn owner_cancels_and_slot_is_released() {
    let h = harness("cancel_owner.wal").await;
    let r = h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;
    let key = r.mirror_key.clone().unwrap();

    let cancelled = h.engine.cancel_reservation(&h.actor(), r.id).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(cancelled.closed_at, Some(NOW));
    assert!(h.calendar.event(&key).is_none());

    h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;
}

#[tokio::test]
async fn cancellation_authorization() {
    let h = harness("cancel_auth.wal").await;
    let r = h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;
    let stranger = Actor::client(h.add_client("Dario").await);

    let err = h.engine.cancel_by_client(&stranger, r.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    let err = h.engine.cancel_by_staff(&h.actor(), r.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    assert_eq!(
        h.engine.get_reservation(&r.id).unwrap().status,
        ReservationStatus::Active
    );

    let staff = Actor::staff(Ulid::new());
    let cancelled = h.engine.cancel_by_staff(&staff, r.id).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
}

#[tokio::test]
async fn staff_bypasses_ownership_on_client_entry_point() {
    let h = harness("cancel_staff_client_path.wal").await;
    let r = h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;
    let staff = Actor::staff(Ulid::new());
    let cancelled = h.engine.cancel_by_client(&staff, r.id).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
}

#[tokio::test]
async fn cannot_cancel_started_or_closed_reservation() {
    let h = harness("cancel_not_cancelable.wal").await;
    let r = h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;

    h.clock.set(TOMORROW + 10 * H);
    let err = h.engine.cancel_reservation(&h.actor(), r.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotCancelable(_)));

    h.clock.set(NOW);
    h.engine.cancel_reservation(&h.actor(), r.id).await.unwrap();
    let err = h.engine.cancel_reservation(&h.actor(), r.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotCancelable(_)));

    let missing = Ulid::new();
    let err = h.engine.cancel_reservation(&h.actor(), missing).await.unwrap_err();
    assert_eq!(err, EngineError::ReservationNotFound(missing));
}

#[tokio::test]
async fn pending_reservation_is_not_cancelable() {
    let h = harness("cancel_pending.wal").await;
    let mut req = h.booking(TOMORROW + 10 * H, TOMORROW + 11 * H);
    req.payment_method = PaymentMethod::MercadoPago;
    let r = h.engine.create_reservation(&h.actor(), req).await.unwrap();
    let err = h.engine.cancel_reservation(&h.actor(), r.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotCancelable(_)));
}

// ── Payment confirmation ─────────────────────────────────

#[tokio::test]
async fn confirm_and_reject_payment() {
    let h = harness("payments.wal").await;
    let mut req = h.booking(TOMORROW + 10 * H, TOMORROW + 11 * H);
    req.payment_method = PaymentMethod::MercadoPago;
    let a = h.engine.create_reservation(&h.actor(), req.clone()).await.unwrap();

    let confirmed = h.engine.confirm_payment(a.id).await.unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Active);
    assert_eq!(confirmed.payment_deadline, None);

    let err = h.engine.confirm_payment(a.id).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::InvalidTransition {
            id: a.id,
            from: ReservationStatus::Active,
            to: ReservationStatus::Active,
        }
    );

    req.start = TOMORROW + 12 * H;
    req.end = TOMORROW + 13 * H;
    let b = h.engine.create_reservation(&h.actor(), req).await.unwrap();
    let rejected = h.engine.reject_payment(b.id).await.unwrap();
    assert_eq!(rejected.status, ReservationStatus::Cancelled);
    assert!(h.calendar.event(b.mirror_key.as_deref().unwrap()).is_none());
    assert!(matches!(
        h.engine.reject_payment(b.id).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn unconfirmed_payment_expires_on_sweep() {
    let h = harness("payment_expiry.wal").await;
    let mut req = h.booking(TOMORROW + 10 * H, TOMORROW + 11 * H);
    req.payment_method = PaymentMethod::MercadoPago;
    let r = h.engine.create_reservation(&h.actor(), req).await.unwrap();

    h.clock.advance(29 * M);
    assert_eq!(h.engine.expire_unconfirmed_payments().await.unwrap(), 0);

    h.clock.advance(M);
    let report = h.engine.run_sweep().await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            finalized: 0,
            payments_expired: 1
        }
    );
    let expired = h.engine.get_reservation(&r.id).unwrap();
    assert_eq!(expired.status, ReservationStatus::Cancelled);
    assert!(h.calendar.event(r.mirror_key.as_deref().unwrap()).is_none());
    assert!(!h.engine.has_occupying_reservation(&h.room).await);
}

#[tokio::test]
async fn late_confirmation_before_sweep_wins() {
    let h = harness("late_confirmation.wal").await;
    let mut req = h.booking(TOMORROW + 10 * H, TOMORROW + 11 * H);
    req.payment_method = PaymentMethod::MercadoPago;
    let r = h.engine.create_reservation(&h.actor(), req).await.unwrap();

    h.clock.advance(H);
    h.engine.confirm_payment(r.id).await.unwrap();
    assert_eq!(h.engine.expire_unconfirmed_payments().await.unwrap(), 0);
    assert_eq!(
        h.engine.get_reservation(&r.id).unwrap().status,
        ReservationStatus::Active
    );
}

// ── Expiration sweep ─────────────────────────────────────

#[tokio::test]
async fn sweep_finalizes_and_annotates_once() {
    let h = harness("sweep_finalize.wal").await;
    let done = h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;
    let later = h.book(TOMORROW + 12 * H, TOMORROW + 13 * H).await;

    h.clock.set(TOMORROW + 11 * H);
    assert_eq!(h.engine.finalize_expired().await.unwrap(), 1);
    assert_eq!(h.engine.finalize_expired().await.unwrap(), 0);

    let finalized = h.engine.get_reservation(&done.id).unwrap();
    assert_eq!(finalized.status, ReservationStatus::Finalized);
    assert_eq!(finalized.closed_at, Some(TOMORROW + 11 * H));
    assert_eq!(
        h.engine.get_reservation(&later.id).unwrap().status,
        ReservationStatus::Active
    );

    let event = h.calendar.event(done.mirror_key.as_deref().unwrap()).unwrap();
    assert_eq!(event.summary, "✅ FINALIZADO - Reserva de Ana");
    assert_eq!(event.color_id.as_deref(), Some("2"));
    assert_eq!(event.description.matches(FINALIZED_MARKER).count(), 1);
    assert!(event.description.contains("Finalizado: 2025-03-11 11:00"));
    assert_eq!(event.private.get("reservaId"), Some(&done.id.to_string()));
}

#[tokio::test]
async fn concurrent_sweeps_do_not_double_process() {
    let h = harness("sweep_concurrent.wal").await;
    for i in 0..5 {
        h.book(TOMORROW + i * 2 * H, TOMORROW + i * 2 * H + H).await;
    }
    h.clock.set(TOMORROW + 24 * H);

    let (a, b) = tokio::join!(h.engine.finalize_expired(), h.engine.finalize_expired());
    assert_eq!(a.unwrap() + b.unwrap(), 5);
    assert_eq!(
        h.engine.list_by_status(ReservationStatus::Finalized).await.len(),
        5
    );
}

#[tokio::test]
async fn list_active_sweeps_first() {
    let h = harness("list_active_sweeps.wal").await;
    let r = h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;
    assert_eq!(h.engine.list_active().await.unwrap(), vec![r.clone()]);

    h.clock.set(TOMORROW + 11 * H);
    assert!(h.engine.list_active().await.unwrap().is_empty());

    let calendar = h.engine.list_calendar().await.unwrap();
    assert_eq!(calendar.len(), 1);
    assert_eq!(calendar[0].status, ReservationStatus::Finalized);
    assert!(h.engine.list_active_for_client(&h.client).await.unwrap().is_empty());
}

#[tokio::test]
async fn history_is_closed_only_most_recent_first() {
    let h = harness("history.wal").await;
    let a = h.book(TOMORROW + 8 * H, TOMORROW + 9 * H).await;
    let b = h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;
    let c = h.book(TOMORROW + 30 * H, TOMORROW + 31 * H).await;
    let d = h.book(TOMORROW + 40 * H, TOMORROW + 41 * H).await;

    h.engine.cancel_reservation(&h.actor(), d.id).await.unwrap();
    h.clock.set(TOMORROW + 12 * H);
    h.engine.finalize_expired().await.unwrap();

    let history: Vec<Ulid> = h.engine.list_history().await.iter().map(|r| r.id).collect();
    assert_eq!(history, vec![d.id, b.id, a.id]);
    let mine: Vec<Ulid> = h
        .engine
        .list_history_for_client(&h.client)
        .await
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(mine, history);

    let active: Vec<Ulid> = h
        .engine
        .list_active_for_client(&h.client)
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(active, vec![c.id]);
    assert_eq!(h.engine.list_all().await.len(), 4);
    assert_eq!(h.engine.list_for_client(&h.client).await.len(), 4);
}

// ── Rooms ────────────────────────────────────────────────

#[tokio::test]
async fn soft_delete_blocked_by_occupying_reservation() {
    let h = harness("soft_delete.wal").await;
    let r = h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;

    assert!(!h.engine.can_delete_room(&h.room).await);
    let err = h.engine.soft_delete_room(h.room).await.unwrap_err();
    assert_eq!(err, EngineError::RoomHasActiveReservations(h.room));

    h.engine.cancel_reservation(&h.actor(), r.id).await.unwrap();
    assert!(h.engine.can_delete_room(&h.room).await);
    h.engine.soft_delete_room(h.room).await.unwrap();

    assert_eq!(
        h.engine.get_room(&h.room).await.unwrap_err(),
        EngineError::RoomNotFound(h.room)
    );
    assert!(h.engine.list_rooms().await.is_empty());
    assert!(!h.engine.can_delete_room(&h.room).await);
    assert!(!h.engine.can_delete_room(&Ulid::new()).await);
    assert_eq!(
        h.engine.soft_delete_room(h.room).await.unwrap_err(),
        EngineError::RoomNotFound(h.room)
    );

    // History still resolves the reservation.
    assert_eq!(h.engine.list_by_room(&h.room).await.len(), 1);
}

#[tokio::test]
async fn finalized_reservations_do_not_block_soft_delete() {
    let h = harness("soft_delete_finalized.wal").await;
    h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;
    h.clock.set(TOMORROW + 12 * H);
    h.engine.finalize_expired().await.unwrap();
    h.engine.soft_delete_room(h.room).await.unwrap();
}

#[tokio::test]
async fn room_attributes_and_update() {
    let h = harness("room_update.wal").await;
    let room = h.engine.get_room(&h.room).await.unwrap();
    assert_eq!(room.capacity, 10);
    assert_eq!(room.description.as_deref(), Some("Planta baja"));

    let updated = h
        .engine
        .update_room(
            h.room,
            RoomSpec {
                number: 5,
                size: RoomSize::Large,
                description: None,
            },
        )
        .await
        .unwrap();
    assert_eq!((updated.number, updated.capacity), (5, 40));
    assert_eq!(h.engine.get_room(&h.room).await.unwrap(), updated);

    h.engine.soft_delete_room(h.room).await.unwrap();
    let err = h
        .engine
        .update_room(
            h.room,
            RoomSpec {
                number: 5,
                size: RoomSize::Large,
                description: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::RoomNotFound(h.room));
}

#[tokio::test]
async fn room_validation() {
    let h = harness("room_validation.wal").await;
    let err = h
        .engine
        .create_room(
            Ulid::new(),
            RoomSpec {
                number: 0,
                size: RoomSize::Small,
                description: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = h
        .engine
        .create_room(
            Ulid::new(),
            RoomSpec {
                number: 9,
                size: RoomSize::Small,
                description: Some("x".repeat(256)),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    let err = h
        .engine
        .create_room(
            h.room,
            RoomSpec {
                number: 9,
                size: RoomSize::Small,
                description: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::AlreadyExists(h.room));
}

#[tokio::test]
async fn client_registration_validation() {
    let h = harness("client_validation.wal").await;
    let err = h
        .engine
        .register_client(Ulid::new(), "  ".into(), "x@example.com".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = h
        .engine
        .register_client(h.client, "Ana".into(), "ana@example.com".into())
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::AlreadyExists(h.client));
    assert_eq!(h.engine.get_client(&h.client).unwrap().name, "Ana");
}

#[tokio::test]
async fn available_rooms_and_free_windows() {
    let h = harness("availability.wal").await;
    let second = h.add_room(4).await;
    let removed = h.add_room(5).await;
    h.engine.soft_delete_room(removed).await.unwrap();
    let r = h.book(TOMORROW + 10 * H, TOMORROW + 12 * H).await;

    let free = h
        .engine
        .find_available_rooms(TOMORROW + 11 * H, TOMORROW + 13 * H)
        .await
        .unwrap();
    assert_eq!(free.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second]);

    let free = h
        .engine
        .find_available_rooms(TOMORROW + 12 * H, TOMORROW + 13 * H)
        .await
        .unwrap();
    assert_eq!(free.len(), 2);

    let windows = h
        .engine
        .room_free_windows(h.room, TOMORROW + 8 * H, TOMORROW + 18 * H)
        .await
        .unwrap();
    assert_eq!(
        windows,
        vec![
            Span::new(TOMORROW + 8 * H, TOMORROW + 10 * H),
            Span::new(TOMORROW + 12 * H, TOMORROW + 18 * H),
        ]
    );

    let overlapping = h
        .engine
        .find_overlapping(h.room, TOMORROW + 11 * H, TOMORROW + 11 * H + M, None)
        .await
        .unwrap();
    assert_eq!(overlapping, vec![r.clone()]);
    assert!(h
        .engine
        .find_overlapping(h.room, TOMORROW + 11 * H, TOMORROW + 11 * H + M, Some(r.id))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn subscribers_see_committed_events() {
    let h = harness("subscribe.wal").await;
    let mut rx = h.engine.subscribe(h.room).unwrap();
    let r = h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;

    match rx.recv().await.unwrap() {
        Event::ReservationPlaced { reservation } => assert_eq!(reservation.id, r.id),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(
        rx.recv().await.unwrap(),
        Event::MirrorKeyAssigned { id, .. } if id == r.id
    ));
    assert!(h.engine.subscribe(Ulid::new()).is_err());
}

// ── Durability ───────────────────────────────────────────

async fn reopen(h: &Harness) -> Engine {
    Engine::new(h.path.clone(), options(), h.calendar.clone(), h.clock.clone()).unwrap()
}

#[tokio::test]
async fn wal_replay_restores_state() {
    let h = harness("replay.wal").await;
    let second = h.add_room(7).await;
    let a = h.book(TOMORROW + 10 * H, TOMORROW + 11 * H).await;
    let b = h.book(TOMORROW + 12 * H, TOMORROW + 13 * H).await;
    let c = h.book(TOMORROW + 14 * H, TOMORROW + 15 * H).await;
    let mut moved = h.changes(TOMORROW + 14 * H, TOMORROW + 16 * H);
    moved.room_id = second;
    h.engine.modify_reservation(&h.actor(), c.id, moved).await.unwrap();
    h.engine.cancel_reservation(&h.actor(), b.id).await.unwrap();
    h.clock.set(TOMORROW + 11 * H);
    h.engine.finalize_expired().await.unwrap();

    let before = h.engine.list_all().await;
    let reopened = reopen(&h).await;

    assert_eq!(reopened.list_all().await, before);
    assert_eq!(reopened.list_rooms().await, h.engine.list_rooms().await);
    assert_eq!(reopened.get_client(&h.client).unwrap().email, "ana@example.com");
    assert_eq!(
        reopened.get_reservation(&a.id).unwrap().status,
        ReservationStatus::Finalized
    );
    assert!(!reopened.has_occupying_reservation(&h.room).await);
    assert!(reopened.has_occupying_reservation(&second).await);

    // The conflict index was rebuilt too.
    let err = reopened
        .create_reservation(&h.actor(), NewReservation {
            room_id: second,
            ..h.booking(TOMORROW + 15 * H, TOMORROW + 17 * H)
        })
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::WindowConflict(c.id));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let h = harness("compaction.wal").await;
    let removed = h.add_room(9).await;
    h.engine.soft_delete_room(removed).await.unwrap();
    for i in 0..10 {
        let r = h.book(TOMORROW + i * 2 * H, TOMORROW + i * 2 * H + H).await;
        if i % 3 == 0 {
            h.engine.cancel_reservation(&h.actor(), r.id).await.unwrap();
        }
    }
    assert!(h.engine.wal_appends_since_compact().await > 20);

    let size_before = std::fs::metadata(&h.path).unwrap().len();
    h.engine.compact_wal().await.unwrap();
    assert_eq!(h.engine.wal_appends_since_compact().await, 0);
    assert!(std::fs::metadata(&h.path).unwrap().len() < size_before);

    let reopened = reopen(&h).await;
    assert_eq!(reopened.list_all().await, h.engine.list_all().await);
    assert_eq!(reopened.list_rooms().await, h.engine.list_rooms().await);
    assert_eq!(
        reopened.get_room(&removed).await.unwrap_err(),
        EngineError::RoomNotFound(removed)
    );
}

#[tokio::test]
async fn torn_tail_is_cut_so_writes_after_restart_survive() {
    use std::io::Write;

    let h = harness("torn_restart.wal").await;
    let before = h.book(TOMORROW + 9 * H, TOMORROW + 10 * H).await;
    {
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&h.path)
            .unwrap();
        f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
    }

    let restarted = reopen(&h).await;
    assert_eq!(restarted.get_reservation(&before.id).unwrap(), before);
    let room = Ulid::new();
    restarted
        .create_room(
            room,
            RoomSpec {
                number: 12,
                size: RoomSize::Small,
                description: None,
            },
        )
        .await
        .unwrap();
    let after = restarted
        .create_reservation(&h.actor(), NewReservation {
            room_id: room,
            ..h.booking(TOMORROW + 9 * H, TOMORROW + 10 * H)
        })
        .await
        .unwrap();
    drop(restarted);

    let again = reopen(&h).await;
    assert_eq!(again.get_room(&room).await.unwrap().number, 12);
    assert_eq!(again.get_reservation(&after.id).unwrap(), after);
    assert_eq!(again.get_reservation(&before.id).unwrap(), before);
    // The slot is still taken after the second restart.
    let err = again
        .create_reservation(&h.actor(), NewReservation {
            room_id: room,
            ..h.booking(TOMORROW + 9 * H + 30 * M, TOMORROW + 11 * H)
        })
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::WindowConflict(after.id));
}

#[tokio::test]
async fn queued_append_waits_for_fsync_regardless_of_store_timeout() {
    let path = test_wal_path("ack_wait.wal");
    let clock = Arc::new(ManualClock::new(NOW));
    let calendar = Arc::new(InMemoryCalendar::new(Buenos_Aires, "2"));
    let tight = EngineOptions {
        store_timeout: Duration::ZERO,
        ..options()
    };
    let engine = Engine::new(path.clone(), tight, calendar.clone(), clock.clone()).unwrap();

    let client = Ulid::new();
    engine
        .register_client(client, "Ana".into(), "ana@example.com".into())
        .await
        .unwrap();
    let room = Ulid::new();
    engine
        .create_room(
            room,
            RoomSpec {
                number: 1,
                size: RoomSize::Small,
                description: None,
            },
        )
        .await
        .unwrap();
    let booked = engine
        .create_reservation(&Actor::client(client), NewReservation {
            client_id: client,
            room_id: room,
            start: TOMORROW + 9 * H,
            end: TOMORROW + 10 * H,
            payment_method: PaymentMethod::Cash,
            amount: None,
        })
        .await
        .unwrap();
    assert!(engine.has_occupying_reservation(&room).await);
    drop(engine);

    let reopened = Engine::new(path, options(), calendar, clock).unwrap();
    assert_eq!(reopened.get_reservation(&booked.id).unwrap(), booked);
    assert!(reopened.has_occupying_reservation(&room).await);
}
