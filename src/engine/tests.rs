use super::*;
use chrono::{NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;

const M: Ms = 60_000; // 1 minute in ms
const H: Ms = 60 * M;

/// 2025-01-06T00:00:00Z, a Monday.
const MONDAY: Ms = 1_736_121_600_000;
/// 2025-01-01T00:00:00Z, well before the Monday under test.
const EARLIER: Ms = 1_735_689_600_000;

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 6).unwrap()
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("chairbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(path.with_extension("wal.tmp"));
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(Ulid::new(), test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
}

/// A 30-minute service plus one staff member working Mondays 09:00–17:00.
async fn barbershop(engine: &Engine) -> (Ulid, Ulid) {
    let service = Service {
        id: Ulid::new(),
        name: "Haircut".into(),
        duration_minutes: 30,
        price_cents: 2500,
    };
    engine.upsert_service(service.clone()).await.unwrap();
    let staff_id = Ulid::new();
    engine
        .create_staff(staff_id, "Sam".into(), "Barber".into(), None)
        .await
        .unwrap();
    engine
        .set_availability(
            staff_id,
            AvailabilityRule {
                day: Weekday::Mon,
                is_working: true,
                start_time: hm(9, 0),
                end_time: hm(17, 0),
            },
        )
        .await
        .unwrap();
    (service.id, staff_id)
}

fn request(staff_id: Ulid, service_id: Ulid, start: Ms) -> NewBooking {
    NewBooking {
        id: Ulid::new(),
        staff_id,
        service_id,
        start,
        customer_name: "Alex".into(),
        customer_email: "alex@example.com".into(),
    }
}

async fn monday_slots(engine: &Engine, staff_id: Ulid, service_id: Ulid) -> Vec<Span> {
    engine
        .compute_slots(staff_id, service_id, monday(), Tz::UTC, None, EARLIER)
        .await
        .unwrap()
}

// ── Catalog ──────────────────────────────────────────────

#[tokio::test]
async fn catalog_validation() {
    let engine = new_engine("catalog_validation.wal");
    let bad_duration = Service {
        id: Ulid::new(),
        name: "Nothing".into(),
        duration_minutes: 0,
        price_cents: 0,
    };
    assert!(matches!(
        engine.upsert_service(bad_duration).await,
        Err(EngineError::Invalid(_))
    ));
    let bad_price = Service {
        id: Ulid::new(),
        name: "Refund".into(),
        duration_minutes: 30,
        price_cents: -1,
    };
    assert!(matches!(
        engine.upsert_service(bad_price).await,
        Err(EngineError::Invalid(_))
    ));

    let staff_id = Ulid::new();
    engine
        .create_staff(staff_id, "Sam".into(), "Barber".into(), None)
        .await
        .unwrap();
    assert!(matches!(
        engine
            .create_staff(staff_id, "Sam".into(), "Barber".into(), None)
            .await,
        Err(EngineError::AlreadyExists(id)) if id == staff_id
    ));

    let inverted = AvailabilityRule {
        day: Weekday::Tue,
        is_working: true,
        start_time: hm(17, 0),
        end_time: hm(9, 0),
    };
    assert!(matches!(
        engine.set_availability(staff_id, inverted).await,
        Err(EngineError::Invalid(_))
    ));
    // A day off may carry any times.
    let off = AvailabilityRule { is_working: false, ..inverted };
    engine.set_availability(staff_id, off).await.unwrap();

    let backwards = TimeOff {
        id: Ulid::new(),
        staff_id,
        start_date: monday(),
        end_date: monday().pred_opt().unwrap(),
        start_time: None,
        end_time: None,
        reason: None,
    };
    assert!(matches!(
        engine.add_time_off(backwards).await,
        Err(EngineError::Invalid(_))
    ));
}

#[tokio::test]
async fn availability_rule_replaced_per_weekday() {
    let engine = new_engine("rule_replace.wal");
    let (service_id, staff_id) = barbershop(&engine).await;
    engine
        .set_availability(
            staff_id,
            AvailabilityRule {
                day: Weekday::Mon,
                is_working: true,
                start_time: hm(13, 0),
                end_time: hm(15, 0),
            },
        )
        .await
        .unwrap();

    let rules = engine.get_availability(staff_id).await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].start_time, hm(13, 0));
    assert_eq!(monday_slots(&engine, staff_id, service_id).await.len(), 4);
}

#[tokio::test]
async fn update_and_list_staff() {
    let engine = new_engine("update_staff.wal");
    let (_, staff_id) = barbershop(&engine).await;
    let updated = engine
        .update_staff(
            staff_id,
            "Samantha".into(),
            "Senior Barber".into(),
            Some("https://img.example.com/s.png".into()),
        )
        .await
        .unwrap();
    assert_eq!(updated.name, "Samantha");
    // Rules survive a profile update.
    assert_eq!(updated.availability.len(), 1);

    let all = engine.list_staff().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].title, "Senior Barber");
}

#[tokio::test]
async fn remove_service_keeps_bookings() {
    let engine = new_engine("remove_service.wal");
    let (service_id, staff_id) = barbershop(&engine).await;
    let b = engine
        .reserve(request(staff_id, service_id, MONDAY + 10 * H), EARLIER)
        .await
        .unwrap();
    engine.remove_service(service_id).await.unwrap();
    assert!(engine.get_service(&service_id).is_none());
    assert_eq!(engine.get_booking(b.id).await.unwrap().service_id, service_id);
    assert!(matches!(
        engine.remove_service(service_id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn remove_staff_refused_with_upcoming_bookings() {
    let engine = new_engine("remove_staff.wal");
    let (service_id, staff_id) = barbershop(&engine).await;
    let b = engine
        .reserve(request(staff_id, service_id, MONDAY + 10 * H), EARLIER)
        .await
        .unwrap();

    assert!(matches!(
        engine.remove_staff(staff_id, EARLIER).await,
        Err(EngineError::HasBookings(id)) if id == staff_id
    ));
    // Cancelled bookings do not block removal.
    engine.cancel_booking(b.id, EARLIER).await.unwrap();
    engine.remove_staff(staff_id, EARLIER).await.unwrap();
    assert!(engine.get_staff(&staff_id).await.is_none());
    assert!(matches!(
        engine.get_booking(b.id).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Calculator through the engine ────────────────────────

#[tokio::test]
async fn monday_grid_of_sixteen_slots() {
    let engine = new_engine("monday_grid.wal");
    let (service_id, staff_id) = barbershop(&engine).await;

    let slots = monday_slots(&engine, staff_id, service_id).await;
    assert_eq!(slots.len(), 16);
    assert_eq!(slots[0], Span::new(MONDAY + 9 * H, MONDAY + 9 * H + 30 * M));
    assert_eq!(slots[15].start, MONDAY + 16 * H + 30 * M);
}

#[tokio::test]
async fn tenant_step_overrides_duration() {
    let engine = new_engine("tenant_step.wal");
    let (service_id, staff_id) = barbershop(&engine).await;
    let slots = engine
        .compute_slots(staff_id, service_id, monday(), Tz::UTC, Some(15), EARLIER)
        .await
        .unwrap();
    // 09:00 .. 16:30 every 15 minutes
    assert_eq!(slots.len(), 31);
    assert_eq!(slots[1].start, MONDAY + 9 * H + 15 * M);
}

#[tokio::test]
async fn unknown_references_in_slot_query() {
    let engine = new_engine("slot_refs.wal");
    let (service_id, staff_id) = barbershop(&engine).await;
    assert!(matches!(
        engine
            .compute_slots(Ulid::new(), service_id, monday(), Tz::UTC, None, EARLIER)
            .await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine
            .compute_slots(staff_id, Ulid::new(), monday(), Tz::UTC, None, EARLIER)
            .await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn time_off_blocks_and_unblocks() {
    let engine = new_engine("time_off_roundtrip.wal");
    let (service_id, staff_id) = barbershop(&engine).await;
    let lunch = TimeOff {
        id: Ulid::new(),
        staff_id,
        start_date: monday(),
        end_date: monday(),
        start_time: Some(hm(12, 0)),
        end_time: Some(hm(13, 0)),
        reason: Some("lunch".into()),
    };
    engine.add_time_off(lunch.clone()).await.unwrap();
    let slots = monday_slots(&engine, staff_id, service_id).await;
    assert_eq!(slots.len(), 14);
    assert!(slots.iter().all(|s| !s.overlaps(&Span::new(MONDAY + 12 * H, MONDAY + 13 * H))));

    assert_eq!(engine.get_time_off(staff_id).await.unwrap(), vec![lunch.clone()]);
    engine.remove_time_off(lunch.id).await.unwrap();
    assert_eq!(monday_slots(&engine, staff_id, service_id).await.len(), 16);
    assert!(matches!(
        engine.remove_time_off(lunch.id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn whole_day_time_off_empties_day() {
    let engine = new_engine("whole_day_off.wal");
    let (service_id, staff_id) = barbershop(&engine).await;
    engine
        .add_time_off(TimeOff {
            id: Ulid::new(),
            staff_id,
            start_date: monday(),
            end_date: monday(),
            start_time: None,
            end_time: None,
            reason: None,
        })
        .await
        .unwrap();
    assert!(monday_slots(&engine, staff_id, service_id).await.is_empty());
}

// ── Ledger ───────────────────────────────────────────────

#[tokio::test]
async fn reserve_removes_slot() {
    let engine = new_engine("reserve_removes.wal");
    let (service_id, staff_id) = barbershop(&engine).await;

    let start = MONDAY + 10 * H;
    let booking = engine
        .reserve(request(staff_id, service_id, start), EARLIER)
        .await
        .unwrap();
    assert_eq!(booking.span, Span::new(start, start + 30 * M));
    assert_eq!(booking.tenant_id, engine.tenant_id);
    assert!(booking.is_confirmed());

    let slots = monday_slots(&engine, staff_id, service_id).await;
    assert_eq!(slots.len(), 15);
    assert!(!slots.iter().any(|s| s.start == start));
}

#[tokio::test]
async fn overlapping_reserve_conflicts() {
    let engine = new_engine("overlap_conflict.wal");
    let (service_id, staff_id) = barbershop(&engine).await;

    let first = engine
        .reserve(request(staff_id, service_id, MONDAY + 10 * H), EARLIER)
        .await
        .unwrap();
    match engine
        .reserve(request(staff_id, service_id, MONDAY + 10 * H + 15 * M), EARLIER)
        .await
    {
        Err(EngineError::Conflict(id)) => assert_eq!(id, first.id),
        other => panic!("expected conflict, got {other:?}"),
    }
    // Back-to-back is fine.
    engine
        .reserve(request(staff_id, service_id, MONDAY + 10 * H + 30 * M), EARLIER)
        .await
        .unwrap();
}

#[tokio::test]
async fn duplicate_booking_id_rejected() {
    let engine = new_engine("dup_booking.wal");
    let (service_id, staff_id) = barbershop(&engine).await;
    let req = request(staff_id, service_id, MONDAY + 10 * H);
    engine.reserve(req.clone(), EARLIER).await.unwrap();
    let mut again = req;
    again.start = MONDAY + 14 * H;
    assert!(matches!(
        engine.reserve(again, EARLIER).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn reserve_validates_customer() {
    let engine = new_engine("reserve_customer.wal");
    let (service_id, staff_id) = barbershop(&engine).await;
    let mut req = request(staff_id, service_id, MONDAY + 10 * H);
    req.customer_email = "not-an-email".into();
    assert!(matches!(
        engine.reserve(req, EARLIER).await,
        Err(EngineError::Invalid(_))
    ));
    let mut req = request(staff_id, service_id, MONDAY + 10 * H);
    req.customer_name = "   ".into();
    assert!(matches!(
        engine.reserve(req, EARLIER).await,
        Err(EngineError::Invalid(_))
    ));
}

#[tokio::test]
async fn cancel_frees_slot_and_keeps_history() {
    let engine = new_engine("cancel_frees.wal");
    let (service_id, staff_id) = barbershop(&engine).await;
    let start = MONDAY + 10 * H;
    let booking = engine
        .reserve(request(staff_id, service_id, start), EARLIER)
        .await
        .unwrap();

    let cancelled = engine.cancel_booking(booking.id, EARLIER + 1).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled { at: EARLIER + 1 });
    assert_eq!(monday_slots(&engine, staff_id, service_id).await.len(), 16);

    // Idempotent: the first cancellation time sticks.
    let again = engine.cancel_booking(booking.id, EARLIER + 99).await.unwrap();
    assert_eq!(again.status, BookingStatus::Cancelled { at: EARLIER + 1 });

    let all = engine.get_bookings(Some(staff_id)).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(!all[0].is_confirmed());

    // The freed interval can be booked again.
    engine
        .reserve(request(staff_id, service_id, start), EARLIER)
        .await
        .unwrap();
}

#[tokio::test]
async fn cancel_unknown_booking() {
    let engine = new_engine("cancel_unknown.wal");
    assert!(matches!(
        engine.cancel_booking(Ulid::new(), EARLIER).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_one_winner() {
    let engine = Arc::new(new_engine("race_one_winner.wal"));
    let (service_id, staff_id) = barbershop(&engine).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .reserve(request(staff_id, service_id, MONDAY + 10 * H), EARLIER)
                .await
        }));
    }

    let mut won = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(engine.get_bookings(Some(staff_id)).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_staff_do_not_contend() {
    let engine = Arc::new(new_engine("race_two_staff.wal"));
    let (service_id, a) = barbershop(&engine).await;
    let b = Ulid::new();
    engine
        .create_staff(b, "Jo".into(), "Stylist".into(), None)
        .await
        .unwrap();

    let (ra, rb) = tokio::join!(
        engine.reserve(request(a, service_id, MONDAY + 10 * H), EARLIER),
        engine.reserve(request(b, service_id, MONDAY + 10 * H), EARLIER),
    );
    assert!(ra.is_ok());
    assert!(rb.is_ok());
}

#[tokio::test]
async fn booking_events_reach_subscribers() {
    let engine = new_engine("notify_booking.wal");
    let (service_id, staff_id) = barbershop(&engine).await;
    let mut rx = engine.notify.subscribe(staff_id);

    let booking = engine
        .reserve(request(staff_id, service_id, MONDAY + 10 * H), EARLIER)
        .await
        .unwrap();
    assert_eq!(
        rx.recv().await.unwrap(),
        Event::BookingConfirmed { booking: booking.clone() }
    );
    engine.cancel_booking(booking.id, EARLIER).await.unwrap();
    assert!(matches!(
        rx.recv().await.unwrap(),
        Event::BookingCancelled { id, .. } if id == booking.id
    ));
}

#[tokio::test]
async fn density_counts_confirmed_per_day() {
    let engine = new_engine("density.wal");
    let (service_id, staff_id) = barbershop(&engine).await;
    let day = 24 * H;
    engine
        .reserve(request(staff_id, service_id, MONDAY + 9 * H), EARLIER)
        .await
        .unwrap();
    engine
        .reserve(request(staff_id, service_id, MONDAY + 11 * H), EARLIER)
        .await
        .unwrap();
    let cancelled = engine
        .reserve(request(staff_id, service_id, MONDAY + 12 * H), EARLIER)
        .await
        .unwrap();
    engine.cancel_booking(cancelled.id, EARLIER).await.unwrap();
    engine
        .reserve(request(staff_id, service_id, MONDAY + 2 * day + 10 * H), EARLIER)
        .await
        .unwrap();
    // Outside the window.
    engine
        .reserve(request(staff_id, service_id, MONDAY + 9 * day + 10 * H), EARLIER)
        .await
        .unwrap();

    let rows = engine
        .booking_density(Tz::UTC, monday(), monday() + chrono::Days::new(6), None)
        .await
        .unwrap();
    assert_eq!(
        rows,
        vec![
            DensityRow { date: monday(), count: 2 },
            DensityRow { date: monday() + chrono::Days::new(2), count: 1 },
        ]
    );

    assert!(matches!(
        engine
            .booking_density(Tz::UTC, monday(), monday().pred_opt().unwrap(), None)
            .await,
        Err(EngineError::Invalid(_))
    ));
}

#[tokio::test]
async fn density_uses_tenant_zone() {
    let engine = new_engine("density_zone.wal");
    let (service_id, staff_id) = barbershop(&engine).await;
    // 2025-01-06 23:30 UTC is already Tuesday in Tokyo.
    engine
        .reserve(request(staff_id, service_id, MONDAY + 23 * H + 30 * M), EARLIER)
        .await
        .unwrap();
    let tokyo: Tz = "Asia/Tokyo".parse().unwrap();
    let rows = engine
        .booking_density(tokyo, monday(), monday() + chrono::Days::new(1), None)
        .await
        .unwrap();
    assert_eq!(rows, vec![DensityRow { date: monday() + chrono::Days::new(1), count: 1 }]);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay_restores.wal");
    let tenant_id = Ulid::new();
    let (service_id, staff_id, kept, cancelled, off_id) = {
        let engine = Engine::new(tenant_id, path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let (service_id, staff_id) = barbershop(&engine).await;
        let kept = engine
            .reserve(request(staff_id, service_id, MONDAY + 10 * H), EARLIER)
            .await
            .unwrap();
        let cancelled = engine
            .reserve(request(staff_id, service_id, MONDAY + 11 * H), EARLIER)
            .await
            .unwrap();
        engine.cancel_booking(cancelled.id, EARLIER).await.unwrap();
        let off_id = Ulid::new();
        engine
            .add_time_off(TimeOff {
                id: off_id,
                staff_id,
                start_date: monday(),
                end_date: monday(),
                start_time: Some(hm(12, 0)),
                end_time: Some(hm(13, 0)),
                reason: None,
            })
            .await
            .unwrap();
        (service_id, staff_id, kept, cancelled, off_id)
    };

    let engine = Engine::new(tenant_id, path, Arc::new(NotifyHub::new())).unwrap();
    assert!(engine.get_service(&service_id).is_some());
    assert_eq!(engine.get_availability(staff_id).await.unwrap().len(), 1);
    assert_eq!(engine.get_time_off(staff_id).await.unwrap()[0].id, off_id);
    assert!(engine.get_booking(kept.id).await.unwrap().is_confirmed());
    assert!(!engine.get_booking(cancelled.id).await.unwrap().is_confirmed());

    // 16 - 1 booked - 2 lunch
    assert_eq!(monday_slots(&engine, staff_id, service_id).await.len(), 13);
    assert!(matches!(
        engine
            .reserve(request(staff_id, service_id, MONDAY + 10 * H), EARLIER)
            .await,
        Err(EngineError::Conflict(id)) if id == kept.id
    ));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction_preserves.wal");
    let tenant_id = Ulid::new();
    let (service_id, staff_id, cancelled_id) = {
        let engine = Engine::new(tenant_id, path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let (service_id, staff_id) = barbershop(&engine).await;
        for hour in [9, 10, 11] {
            engine
                .reserve(request(staff_id, service_id, MONDAY + hour * H), EARLIER)
                .await
                .unwrap();
        }
        let c = engine
            .reserve(request(staff_id, service_id, MONDAY + 14 * H), EARLIER)
            .await
            .unwrap();
        engine.cancel_booking(c.id, EARLIER).await.unwrap();

        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (service_id, staff_id, c.id)
    };

    let engine = Engine::new(tenant_id, path, Arc::new(NotifyHub::new())).unwrap();
    let all = engine.get_bookings(Some(staff_id)).await.unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all.iter().filter(|b| b.is_confirmed()).count(), 3);
    assert!(!engine.get_booking(cancelled_id).await.unwrap().is_confirmed());
    assert_eq!(monday_slots(&engine, staff_id, service_id).await.len(), 13);
}

#[tokio::test]
async fn replay_forgets_removed_staff() {
    let path = test_wal_path("replay_removed_staff.wal");
    let tenant_id = Ulid::new();
    let staff_id = {
        let engine = Engine::new(tenant_id, path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let (_, staff_id) = barbershop(&engine).await;
        engine.remove_staff(staff_id, EARLIER).await.unwrap();
        staff_id
    };
    let engine = Engine::new(tenant_id, path, Arc::new(NotifyHub::new())).unwrap();
    assert!(engine.get_staff(&staff_id).await.is_none());
    assert_eq!(engine.list_services().len(), 1);
}

#[tokio::test]
async fn replay_skips_overlapping_confirmed_booking() {
    let path = test_wal_path("replay_overlap.wal");
    let tenant_id = Ulid::new();
    let member = StaffMember {
        id: Ulid::new(),
        name: "Sam".into(),
        title: "Barber".into(),
        photo_url: None,
        availability: Vec::new(),
    };
    let staff_id = member.id;
    let booking = |start: Ms| Booking {
        id: Ulid::new(),
        tenant_id,
        staff_id,
        service_id: Ulid::new(),
        customer_name: "Alex".into(),
        customer_email: "alex@example.com".into(),
        span: Span::new(start, start + 30 * M),
        status: BookingStatus::Confirmed,
        created_at: EARLIER,
    };
    let first = booking(MONDAY + 10 * H);
    let second = booking(MONDAY + 10 * H);
    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&Event::StaffCreated { member }).unwrap();
        wal.append(&Event::BookingConfirmed { booking: first.clone() }).unwrap();
        wal.append(&Event::BookingConfirmed { booking: second.clone() }).unwrap();
    }

    let engine = Engine::new(tenant_id, path, Arc::new(NotifyHub::new())).unwrap();
    let confirmed: Vec<_> = engine
        .get_bookings(Some(staff_id))
        .await
        .unwrap()
        .into_iter()
        .filter(|b| b.is_confirmed())
        .collect();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].id, first.id);
    assert!(matches!(
        engine.get_booking(second.id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn out_of_range_dates_are_rejected() {
    let engine = new_engine("out_of_range_dates.wal");
    let (service_id, staff_id) = barbershop(&engine).await;
    let new_york: Tz = "America/New_York".parse().unwrap();

    for date in [NaiveDate::MAX, NaiveDate::MIN, NaiveDate::from_ymd_opt(2100, 1, 4).unwrap()] {
        assert!(matches!(
            engine
                .compute_slots(staff_id, service_id, date, new_york, None, EARLIER)
                .await,
            Err(EngineError::Invalid(_))
        ));
    }
    assert!(matches!(
        engine
            .booking_density(new_york, NaiveDate::MAX, NaiveDate::MAX, None)
            .await,
        Err(EngineError::Invalid(_))
    ));
    let far = TimeOff {
        id: Ulid::new(),
        staff_id,
        start_date: NaiveDate::MAX,
        end_date: NaiveDate::MAX,
        start_time: None,
        end_time: None,
        reason: None,
    };
    assert!(matches!(engine.add_time_off(far).await, Err(EngineError::Invalid(_))));

    // The calculator itself degrades instead of overflowing.
    let guard = engine.get_staff_state(&staff_id).unwrap();
    let st = guard.read().await;
    let _ = slots_for_day(&st, NaiveDate::MAX, new_york, 30 * M, 30 * M, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_staff_races_reserve() {
    let engine = Arc::new(new_engine("race_remove_staff.wal"));
    let (service_id, _) = barbershop(&engine).await;

    for _ in 0..50 {
        let staff_id = Ulid::new();
        engine
            .create_staff(staff_id, "Kim".into(), "Barber".into(), None)
            .await
            .unwrap();

        let booker = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .reserve(request(staff_id, service_id, MONDAY + 10 * H), EARLIER)
                    .await
            })
        };
        let remover = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.remove_staff(staff_id, EARLIER).await })
        };
        let booked = booker.await.unwrap();
        let removed = remover.await.unwrap();

        match (&booked, &removed) {
            (Ok(b), Err(EngineError::HasBookings(_))) => {
                assert!(engine.get_booking(b.id).await.unwrap().is_confirmed());
            }
            (Err(EngineError::NotFound(_)), Ok(())) => {
                assert!(engine.get_staff(&staff_id).await.is_none());
            }
            other => panic!("inconsistent outcome: {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn booking_id_is_unique_across_staff() {
    let engine = Arc::new(new_engine("race_booking_id.wal"));
    let (service_id, a) = barbershop(&engine).await;
    let b = Ulid::new();
    engine
        .create_staff(b, "Kim".into(), "Barber".into(), None)
        .await
        .unwrap();

    for _ in 0..50 {
        let id = Ulid::new();
        let mut handles = Vec::new();
        for staff_id in [a, b] {
            let engine = engine.clone();
            let mut req = request(staff_id, service_id, MONDAY + 10 * H);
            req.id = id;
            handles.push(tokio::spawn(async move { engine.reserve(req, EARLIER).await }));
        }
        let mut winners = Vec::new();
        for h in handles {
            match h.await.unwrap() {
                Ok(booking) => winners.push(booking),
                Err(EngineError::AlreadyExists(dup)) => assert_eq!(dup, id),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners.len(), 1);
        let cancelled = engine.cancel_booking(id, EARLIER).await.unwrap();
        assert_eq!(cancelled.staff_id, winners[0].staff_id);
        assert!(!cancelled.is_confirmed());
    }
}
