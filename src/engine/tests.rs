use super::*;
use super::admission::HOLDER_CANCEL_REASON;
use super::mutations::ELAPSED_REASON;
use super::notices::OPERATIONS_RECIPIENT;
use crate::calendar::{Catalog, DayStatus, ExcludedStart, SlotStatus};
use crate::clock::FixedClock;
use crate::notify::{DispatchError, Dispatcher, Notification, NotifyHub, Template};
use crate::policy::BookingPolicy;
use crate::wal::Wal;
use chrono::{Days, NaiveDate, NaiveTime, Weekday};
use std::time::Duration;

// March 2026: the 2nd is a Monday, the 7th and 8th a weekend.
fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn w(sh: u32, sm: u32, eh: u32, em: u32) -> Window {
    Window::new(t(sh, sm), t(eh, em))
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("larder_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn rejection(e: EngineError) -> Rejection {
    match e {
        EngineError::Rejected(r) => r,
        other => panic!("expected a rejection, got {other:?}"),
    }
}

fn request(unit_id: Ulid, date: NaiveDate, holder: &str) -> AdmissionRequest {
    AdmissionRequest {
        unit_id,
        date,
        holder: holder.into(),
        note: None,
        force: false,
        actor: Actor::Holder(holder.into()),
    }
}

fn forced(unit_id: Ulid, date: NaiveDate, holder: &str) -> AdmissionRequest {
    AdmissionRequest {
        force: true,
        actor: Actor::Staff,
        ..request(unit_id, date, holder)
    }
}

struct FailingDispatcher;

#[async_trait::async_trait]
impl Dispatcher for FailingDispatcher {
    async fn dispatch(&self, _notification: &Notification) -> Result<(), DispatchError> {
        Err(DispatchError::Failed("mail relay unreachable".into()))
    }
}

struct Fixture {
    engine: Arc<Engine>,
    clock: Arc<FixedClock>,
    hub: Arc<NotifyHub>,
    path: PathBuf,
    catalog: Catalog,
}

fn open(name: &str, policy: BookingPolicy) -> Fixture {
    open_with(name, policy, Catalog::default(), None)
}

fn open_with(
    name: &str,
    policy: BookingPolicy,
    catalog: Catalog,
    dispatcher: Option<Arc<dyn Dispatcher>>,
) -> Fixture {
    let path = test_wal_path(name);
    let clock = Arc::new(FixedClock::new(d(2).and_time(t(7, 0))));
    let hub = Arc::new(NotifyHub::new());
    let engine = Engine::new(
        path.clone(),
        EngineOptions {
            policy,
            catalog: catalog.clone(),
            public_url: "http://localhost".into(),
            clock: clock.clone(),
            dispatcher: dispatcher.unwrap_or_else(|| hub.clone() as Arc<dyn Dispatcher>),
        },
    )
    .unwrap();
    Fixture {
        engine: Arc::new(engine),
        clock,
        hub,
        path,
        catalog,
    }
}

impl Fixture {
    async fn unit(&self, name: &str, category: Option<&str>, window: Window, capacity: u32) -> Ulid {
        let id = Ulid::new();
        self.engine
            .create_unit(id, name.into(), category.map(String::from), window, capacity)
            .await
            .unwrap();
        id
    }

    async fn book(&self, unit_id: Ulid, date: NaiveDate, holder: &str) -> Result<Admitted, EngineError> {
        self.engine.admit(request(unit_id, date, holder)).await
    }

    /// A second engine replayed from the same WAL file.
    fn reopen(&self) -> Engine {
        Engine::new(
            self.path.clone(),
            EngineOptions {
                policy: self.engine.policy().clone(),
                catalog: self.catalog.clone(),
                public_url: "http://localhost".into(),
                clock: self.clock.clone(),
                dispatcher: Arc::new(NotifyHub::new()),
            },
        )
        .unwrap()
    }

    async fn capacity(&self, unit_id: Ulid) -> u32 {
        self.engine
            .list_units()
            .await
            .into_iter()
            .find(|u| u.id == unit_id)
            .unwrap()
            .capacity
    }
}

// ── Admission ────────────────────────────────────────────

#[tokio::test]
async fn pantry_admission_waits_for_approval() {
    let f = open("pantry_admit.wal", BookingPolicy::pantry());
    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;

    let admitted = f.book(unit, d(3), "h1").await.unwrap();
    assert_eq!(admitted.booking.status, BookingStatus::Submitted);
    assert!(!admitted.reused);
    assert!(admitted.raised_to.is_none());
    let token = admitted.booking.token.clone().unwrap();
    assert!(!token.is_empty());

    assert_eq!(f.engine.remaining(unit, d(3)).await.unwrap(), 2);
    assert_eq!(f.engine.remaining(unit, d(4)).await.unwrap(), 3);
    assert_eq!(f.engine.booking_by_token(&token).await.unwrap(), admitted.booking);
}

#[tokio::test]
async fn volunteer_shift_needs_trained_role() {
    let f = open("volunteer_role.wal", BookingPolicy::volunteer());
    let unit = f.unit("Pantry driver", Some("driving"), w(9, 0, 12, 0), 2).await;

    let err = rejection(f.book(unit, d(3), "v1").await.unwrap_err());
    assert_eq!(
        err,
        Rejection::Ineligible {
            holder: "v1".into(),
            role: "driving".into(),
        }
    );

    f.engine.grant_role("v1".into(), "driving".into()).await.unwrap();
    let admitted = f.book(unit, d(3), "v1").await.unwrap();
    assert_eq!(admitted.booking.status, BookingStatus::Approved);
    assert_eq!(f.engine.roles_for("v1"), vec!["driving".to_string()]);

    f.engine.revoke_role("v1".into(), "driving".into()).await.unwrap();
    let err = rejection(f.book(unit, d(4), "v1").await.unwrap_err());
    assert_eq!(err.code(), "ineligible");
}

#[tokio::test]
async fn unknown_or_inactive_unit_is_not_found() {
    let f = open("not_found.wal", BookingPolicy::pantry());
    let missing = Ulid::new();
    let err = rejection(f.book(missing, d(3), "h1").await.unwrap_err());
    assert_eq!(err, Rejection::NotFound(Entity::Unit(missing)));

    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;
    f.engine.update_unit(unit, None, Some(false)).await.unwrap();
    let err = rejection(f.book(unit, d(3), "h1").await.unwrap_err());
    assert_eq!(err.code(), "not_found");
    assert!(f.engine.availability(d(3), false).await.is_empty());
}

#[tokio::test]
async fn temporal_checks_use_organization_clock() {
    let f = open("temporal.wal", BookingPolicy::pantry());
    let early = f.unit("Early", None, w(6, 0, 7, 0), 3).await;
    let later = f.unit("Later", None, w(9, 0, 10, 0), 3).await;

    // Yesterday.
    let err = rejection(f.book(later, d(1), "h1").await.unwrap_err());
    assert!(matches!(err, Rejection::InvalidTemporal(_)));

    // Today, but the 06:00 unit has started at 07:00.
    let err = rejection(f.book(early, d(2), "h1").await.unwrap_err());
    assert!(matches!(err, Rejection::InvalidTemporal(_)));
    f.book(later, d(2), "h1").await.unwrap();

    let far = d(2).checked_add_days(Days::new(800)).unwrap();
    let err = rejection(f.book(later, far, "h2").await.unwrap_err());
    assert!(matches!(err, Rejection::InvalidTemporal(_)));

    let today: Vec<Ulid> = f.engine.availability(d(2), false).await.iter().map(|s| s.unit_id).collect();
    assert_eq!(today, vec![later]);
    let all = f.engine.availability(d(2), true).await;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].unit_id, early);
}

#[tokio::test]
async fn holder_may_not_book_for_someone_else() {
    let f = open("impersonate.wal", BookingPolicy::pantry());
    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;
    let req = AdmissionRequest {
        actor: Actor::Holder("h2".into()),
        ..request(unit, d(3), "h1")
    };
    let err = rejection(f.engine.admit(req).await.unwrap_err());
    assert_eq!(err.code(), "forbidden");

    // Staff may book on a holder's behalf.
    let req = AdmissionRequest {
        actor: Actor::Staff,
        ..request(unit, d(3), "h1")
    };
    f.engine.admit(req).await.unwrap();
}

#[tokio::test]
async fn duplicate_active_booking_is_rejected() {
    let f = open("duplicate.wal", BookingPolicy::pantry());
    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;
    f.book(unit, d(3), "h1").await.unwrap();
    let err = rejection(f.book(unit, d(3), "h1").await.unwrap_err());
    assert_eq!(err, Rejection::AlreadyBooked);
    assert_eq!(f.engine.remaining(unit, d(3)).await.unwrap(), 2);
}

#[tokio::test]
async fn rebooking_reuses_cancelled_row() {
    let f = open("reuse.wal", BookingPolicy::pantry());
    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;
    let first = f.book(unit, d(3), "h1").await.unwrap().booking;
    let token = first.token.clone().unwrap();
    f.engine.cancel_by_token(&token, None).await.unwrap();

    let again = f.book(unit, d(3), "h1").await.unwrap();
    assert!(again.reused);
    assert_eq!(again.booking.id, first.id);
    assert_eq!(again.booking.status, BookingStatus::Submitted);
    assert_ne!(again.booking.token.as_deref(), Some(token.as_str()));
    assert!(again.booking.reason.is_none());

    let rows = f.engine.bookings_for_unit(unit, Some(d(3))).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_seat_goes_to_exactly_one_holder() {
    let f = open("last_seat.wal", BookingPolicy::volunteer());
    let unit = f.unit("Sorting", None, w(9, 0, 12, 0), 1).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = f.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.admit(request(unit, d(3), &format!("v{i}"))).await
        }));
    }

    let mut won = 0;
    let mut full = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(e) => {
                assert_eq!(rejection(e), Rejection::Full { capacity: 1 });
                full += 1;
            }
        }
    }
    assert_eq!((won, full), (1, 15));
    assert_eq!(f.engine.remaining(unit, d(3)).await.unwrap(), 0);
    let held = f
        .engine
        .bookings_for_unit(unit, Some(d(3)))
        .await
        .unwrap()
        .iter()
        .filter(|b| b.status.holds_capacity())
        .count();
    assert_eq!(held, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_leave_one_active_row() {
    let f = open("concurrent_dup.wal", BookingPolicy::volunteer());
    let unit = f.unit("Sorting", None, w(9, 0, 12, 0), 10).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = f.engine.clone();
        handles.push(tokio::spawn(async move { engine.admit(request(unit, d(3), "v1")).await }));
    }
    let mut won = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(e) => assert_eq!(rejection(e), Rejection::AlreadyBooked),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(f.engine.bookings_for_holder("v1").await.len(), 1);
}

// ── Forced admission ─────────────────────────────────────

#[tokio::test]
async fn forced_admission_raises_ceiling_by_one() {
    let f = open("forced.wal", BookingPolicy::pantry());
    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 2).await;
    f.book(unit, d(3), "h1").await.unwrap();
    f.book(unit, d(3), "h2").await.unwrap();

    // A holder asking for force gets nothing extra.
    let req = AdmissionRequest {
        force: true,
        ..request(unit, d(3), "h3")
    };
    let err = rejection(f.engine.admit(req).await.unwrap_err());
    assert_eq!(err, Rejection::Full { capacity: 2 });

    // Staff without force is refused too.
    let req = AdmissionRequest {
        actor: Actor::Staff,
        ..request(unit, d(3), "h3")
    };
    assert_eq!(rejection(f.engine.admit(req).await.unwrap_err()).code(), "full");
    assert_eq!(f.capacity(unit).await, 2);

    let admitted = f.engine.admit(forced(unit, d(3), "h3")).await.unwrap();
    assert_eq!(admitted.raised_to, Some(3));
    assert_eq!(f.capacity(unit).await, 3);
    assert_eq!(f.engine.remaining(unit, d(3)).await.unwrap(), 0);

    // The raise is permanent and applies to every date.
    assert_eq!(f.engine.remaining(unit, d(4)).await.unwrap(), 3);
}

#[tokio::test]
async fn force_with_room_does_not_raise() {
    let f = open("forced_room.wal", BookingPolicy::pantry());
    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 2).await;
    let admitted = f.engine.admit(forced(unit, d(3), "h1")).await.unwrap();
    assert!(admitted.raised_to.is_none());
    assert_eq!(f.capacity(unit).await, 2);
}

// ── Closures ─────────────────────────────────────────────

#[tokio::test]
async fn weekends_and_holidays_close_the_day() {
    let f = open("holidays.wal", BookingPolicy::pantry());
    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;

    let err = rejection(f.book(unit, d(7), "h1").await.unwrap_err());
    assert_eq!(err, Rejection::ClosedPeriod("closed on weekends".into()));

    let holiday = Ulid::new();
    f.engine
        .add_override(
            holiday,
            Override::Holiday {
                date: d(4),
                reason: "Staff training".into(),
            },
        )
        .await
        .unwrap();
    let err = rejection(f.book(unit, d(4), "h1").await.unwrap_err());
    assert_eq!(err, Rejection::ClosedPeriod("Staff training".into()));
    assert_eq!(f.engine.day_status(d(4)).await, DayStatus::Holiday("Staff training".into()));
    assert!(f.engine.availability(d(4), false).await.is_empty());

    f.engine.remove_override(holiday).await.unwrap();
    assert!(f.engine.day_status(d(4)).await.is_open());
    f.book(unit, d(4), "h1").await.unwrap();

    let err = rejection(f.engine.remove_override(holiday).await.unwrap_err());
    assert_eq!(err, Rejection::NotFound(Entity::Override(holiday)));
}

#[tokio::test]
async fn holiday_beats_unit_level_break() {
    let f = open("precedence.wal", BookingPolicy::pantry());
    let morning = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;
    let afternoon = f.unit("Afternoon", None, w(13, 0, 14, 0), 4).await;
    f.engine
        .add_override(
            Ulid::new(),
            Override::Break {
                unit_id: morning,
                weekday: Weekday::Wed,
                reason: "Lunch rota".into(),
            },
        )
        .await
        .unwrap();
    f.engine
        .add_override(
            Ulid::new(),
            Override::Holiday {
                date: d(4),
                reason: "Closed".into(),
            },
        )
        .await
        .unwrap();

    // Wednesday 4th: holiday wins for the whole date.
    assert!(f.engine.availability(d(4), false).await.is_empty());
    assert!(!f.engine.day_status(d(4)).await.is_open());

    // Wednesday 11th: only the morning unit is on break.
    let slots = f.engine.availability(d(11), false).await;
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0].unit_id, morning);
    assert_eq!(slots[0].status, Some(SlotStatus::Break));
    assert_eq!(slots[0].available, 0);
    assert_eq!(slots[0].reason.as_deref(), Some("Lunch rota"));
    assert_eq!(slots[1].unit_id, afternoon);
    assert_eq!(slots[1].status, None);
    assert_eq!(slots[1].available, 4);

    let err = rejection(f.book(morning, d(11), "h1").await.unwrap_err());
    assert_eq!(err, Rejection::ClosedPeriod("Lunch rota".into()));
    f.book(afternoon, d(11), "h1").await.unwrap();
}

#[tokio::test]
async fn one_off_block_beats_break() {
    let f = open("block_vs_break.wal", BookingPolicy::pantry());
    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;
    f.engine
        .add_override(
            Ulid::new(),
            Override::Break {
                unit_id: unit,
                weekday: Weekday::Wed,
                reason: "Lunch rota".into(),
            },
        )
        .await
        .unwrap();
    f.engine
        .add_override(
            Ulid::new(),
            Override::Block {
                unit_id: unit,
                date: d(11),
                reason: "Delivery".into(),
            },
        )
        .await
        .unwrap();

    let slots = f.engine.availability(d(11), false).await;
    assert_eq!(slots[0].status, Some(SlotStatus::Blocked));
    assert_eq!(slots[0].reason.as_deref(), Some("Delivery"));
}

#[tokio::test]
async fn recurring_block_matches_week_of_month() {
    let f = open("recurring_block.wal", BookingPolicy::pantry());
    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;
    // First Tuesday of the month.
    f.engine
        .add_override(
            Ulid::new(),
            Override::RecurringBlock {
                unit_id: unit,
                weekday: Weekday::Tue,
                week: 1,
                reason: "Inventory".into(),
            },
        )
        .await
        .unwrap();

    let err = rejection(f.book(unit, d(3), "h1").await.unwrap_err());
    assert_eq!(err, Rejection::ClosedPeriod("Inventory".into()));
    f.book(unit, d(10), "h1").await.unwrap();

    let err = f
        .engine
        .add_override(
            Ulid::new(),
            Override::RecurringBlock {
                unit_id: unit,
                weekday: Weekday::Tue,
                week: 6,
                reason: "never".into(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(rejection(err).code(), "invalid_temporal");
}

#[tokio::test]
async fn catalog_excluded_starts_are_never_offered() {
    let catalog = Catalog {
        open_from: t(8, 0),
        open_until: t(17, 0),
        excluded_starts: vec![ExcludedStart {
            weekday: Weekday::Tue,
            start: t(9, 0),
        }],
        ..Catalog::default()
    };
    let f = open_with("catalog.wal", BookingPolicy::pantry(), catalog, None);
    let nine = f.unit("Nine", None, w(9, 0, 10, 0), 3).await;
    let evening = f.unit("Evening", None, w(18, 0, 19, 0), 3).await;

    let err = rejection(f.book(nine, d(3), "h1").await.unwrap_err());
    assert_eq!(err.code(), "closed_period");
    f.book(nine, d(4), "h1").await.unwrap();

    // Outside the published hours on any day.
    let err = rejection(f.book(evening, d(4), "h2").await.unwrap_err());
    assert_eq!(err.code(), "closed_period");

    assert!(f.engine.availability(d(3), false).await.is_empty());
    let wednesday: Vec<Ulid> = f.engine.availability(d(4), false).await.iter().map(|s| s.unit_id).collect();
    assert_eq!(wednesday, vec![nine]);
}

// ── Same-day conflicts ───────────────────────────────────

#[tokio::test]
async fn pantry_same_day_rule_is_per_category() {
    let f = open("pantry_same_day.wal", BookingPolicy::pantry());
    let food_am = f.unit("Food AM", Some("food"), w(9, 0, 10, 0), 3).await;
    let food_pm = f.unit("Food PM", Some("food"), w(13, 0, 14, 0), 3).await;
    let clothing = f.unit("Clothing", Some("clothing"), w(13, 0, 14, 0), 3).await;

    let first = f.book(food_am, d(3), "h1").await.unwrap().booking;
    let err = rejection(f.book(food_pm, d(3), "h1").await.unwrap_err());
    let detail = err.conflict().unwrap();
    assert_eq!(detail.attempted.unit_id, food_pm);
    assert_eq!(detail.attempted.booking_id, None);
    assert_eq!(detail.existing.booking_id, Some(first.id));
    assert_eq!(detail.existing.unit_id, food_am);
    assert_eq!(detail.existing.unit_name, "Food AM");
    assert_eq!(detail.existing.window, w(9, 0, 10, 0));

    // A different visit type on the same day is fine.
    f.book(clothing, d(3), "h1").await.unwrap();
    // So is the same visit type on another day.
    f.book(food_pm, d(4), "h1").await.unwrap();
}

#[tokio::test]
async fn volunteer_same_day_rule_is_global() {
    let f = open("volunteer_same_day.wal", BookingPolicy::volunteer());
    let a = f.unit("Sorting", None, w(9, 0, 12, 0), 3).await;
    let b = f.unit("Front desk", None, w(13, 0, 16, 0), 3).await;
    f.book(a, d(3), "v1").await.unwrap();
    let err = rejection(f.book(b, d(3), "v1").await.unwrap_err());
    assert_eq!(err.code(), "same_day_conflict");
}

#[tokio::test]
async fn keep_new_swaps_bookings_atomically() {
    let f = open("keep_new.wal", BookingPolicy::volunteer());
    let a = f.unit("Sorting", None, w(9, 0, 12, 0), 3).await;
    let b = f.unit("Front desk", None, w(13, 0, 16, 0), 3).await;
    let original = f.book(a, d(3), "v1").await.unwrap().booking;
    let old_token = original.token.clone().unwrap();
    assert_eq!(rejection(f.book(b, d(3), "v1").await.unwrap_err()).code(), "same_day_conflict");

    let resolution = f
        .engine
        .resolve_conflict(ResolveRequest {
            existing_id: original.id,
            keep: Keep::New {
                unit_id: b,
                date: d(3),
                note: Some("swapped".into()),
                force: false,
            },
            actor: Actor::Holder("v1".into()),
        })
        .await
        .unwrap();
    assert_eq!(resolution.kept(), "new");
    let Resolution::KeptNew { booking, cancelled, raised_to } = resolution else {
        panic!("expected the new booking to be kept");
    };
    assert_eq!(booking.unit_id, b);
    assert_eq!(booking.status, BookingStatus::Approved);
    assert_eq!(booking.note.as_deref(), Some("swapped"));
    assert_eq!(cancelled.id, original.id);
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.reason.as_deref(), Some(CONFLICT_REASON));
    assert!(cancelled.token.is_none());
    assert!(raised_to.is_none());

    let active: Vec<Booking> = f
        .engine
        .bookings_for_holder("v1")
        .await
        .into_iter()
        .filter(|b| b.status.is_active())
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].unit_id, b);
    assert_eq!(f.engine.remaining(a, d(3)).await.unwrap(), 3);

    let err = rejection(f.engine.booking_by_token(&old_token).await.unwrap_err());
    assert_eq!(err, Rejection::NotFound(Entity::Token));
}

#[tokio::test]
async fn keep_new_must_stay_on_the_same_day() {
    let f = open("keep_new_other_day.wal", BookingPolicy::volunteer());
    let a = f.unit("Sorting", None, w(9, 0, 12, 0), 3).await;
    let b = f.unit("Front desk", None, w(13, 0, 16, 0), 3).await;
    let original = f.book(a, d(3), "v1").await.unwrap().booking;

    let err = f
        .engine
        .resolve_conflict(ResolveRequest {
            existing_id: original.id,
            keep: Keep::New {
                unit_id: b,
                date: d(4),
                note: None,
                force: false,
            },
            actor: Actor::Holder("v1".into()),
        })
        .await
        .unwrap_err();
    assert!(matches!(rejection(err), Rejection::InvalidTemporal(_)));
    assert_eq!(f.engine.get_booking(original.id).await.unwrap(), original);
    assert!(f.engine.bookings_for_unit(b, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn keep_existing_changes_nothing() {
    let f = open("keep_existing.wal", BookingPolicy::volunteer());
    let a = f.unit("Sorting", None, w(9, 0, 12, 0), 3).await;
    let original = f.book(a, d(3), "v1").await.unwrap().booking;

    let resolution = f
        .engine
        .resolve_conflict(ResolveRequest {
            existing_id: original.id,
            keep: Keep::Existing,
            actor: Actor::Holder("v1".into()),
        })
        .await
        .unwrap();
    assert_eq!(resolution, Resolution::KeptExisting(original.clone()));
    assert_eq!(f.engine.get_booking(original.id).await.unwrap(), original);
}

#[tokio::test]
async fn failed_keep_new_leaves_original_active() {
    let f = open("keep_new_full.wal", BookingPolicy::volunteer());
    let a = f.unit("Sorting", None, w(9, 0, 12, 0), 3).await;
    let b = f.unit("Front desk", None, w(13, 0, 16, 0), 1).await;
    let original = f.book(a, d(3), "v1").await.unwrap().booking;
    f.book(b, d(3), "v2").await.unwrap();

    let keep_b = Keep::New {
        unit_id: b,
        date: d(3),
        note: None,
        force: false,
    };
    let err = f
        .engine
        .resolve_conflict(ResolveRequest {
            existing_id: original.id,
            keep: keep_b.clone(),
            actor: Actor::Holder("v1".into()),
        })
        .await
        .unwrap_err();
    assert_eq!(rejection(err), Rejection::Full { capacity: 1 });
    assert_eq!(f.engine.get_booking(original.id).await.unwrap(), original);

    // Another holder may not resolve v1's booking.
    let err = f
        .engine
        .resolve_conflict(ResolveRequest {
            existing_id: original.id,
            keep: keep_b,
            actor: Actor::Holder("v2".into()),
        })
        .await
        .unwrap_err();
    assert_eq!(rejection(err).code(), "forbidden");
}

// ── Rescheduling ─────────────────────────────────────────

#[tokio::test]
async fn reschedule_frees_seat_and_rotates_token() {
    let f = open("reschedule.wal", BookingPolicy::volunteer());
    let unit = f.unit("Sorting", None, w(9, 0, 12, 0), 1).await;

    let first = f.book(unit, d(3), "v1").await.unwrap().booking;
    let old_token = first.token.clone().unwrap();
    assert_eq!(rejection(f.book(unit, d(3), "v2").await.unwrap_err()).code(), "full");

    let moved = f.engine.reschedule(&old_token, unit, d(4)).await.unwrap();
    assert_eq!(moved.booking.id, first.id);
    assert_eq!(moved.booking.date, d(4));
    assert_eq!(moved.booking.status, BookingStatus::Approved);
    assert_eq!(moved.previous.date, d(3));
    assert_eq!(moved.previous.unit_id, unit);
    let new_token = moved.booking.token.clone().unwrap();
    assert_ne!(new_token, old_token);

    let err = rejection(f.engine.reschedule(&old_token, unit, d(5)).await.unwrap_err());
    assert_eq!(err, Rejection::NotFound(Entity::Token));
    assert_eq!(f.engine.booking_by_token(&new_token).await.unwrap().date, d(4));

    assert_eq!(f.engine.remaining(unit, d(3)).await.unwrap(), 1);
    let retry = f.book(unit, d(3), "v2").await.unwrap();
    assert_eq!(retry.booking.status, BookingStatus::Approved);
}

#[tokio::test]
async fn reschedule_to_other_unit() {
    let f = open("reschedule_unit.wal", BookingPolicy::pantry());
    let morning = f.unit("Morning", None, w(9, 0, 10, 0), 2).await;
    let afternoon = f.unit("Afternoon", None, w(13, 0, 14, 0), 2).await;
    let first = f.book(morning, d(3), "h1").await.unwrap().booking;

    let moved = f
        .engine
        .reschedule(first.token.as_deref().unwrap(), afternoon, d(3))
        .await
        .unwrap();
    assert_eq!(moved.booking.unit_id, afternoon);
    assert_eq!(moved.previous.unit_id, morning);
    assert!(f.engine.bookings_for_unit(morning, None).await.unwrap().is_empty());
    assert_eq!(f.engine.bookings_for_unit(afternoon, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_reschedule_leaves_booking_untouched() {
    let f = open("reschedule_full.wal", BookingPolicy::volunteer());
    let a = f.unit("Sorting", None, w(9, 0, 12, 0), 2).await;
    let b = f.unit("Front desk", None, w(13, 0, 16, 0), 1).await;
    let original = f.book(a, d(3), "v1").await.unwrap().booking;
    f.book(b, d(4), "v2").await.unwrap();

    let token = original.token.clone().unwrap();
    let err = rejection(f.engine.reschedule(&token, b, d(4)).await.unwrap_err());
    assert_eq!(err, Rejection::Full { capacity: 1 });

    let after = f.engine.get_booking(original.id).await.unwrap();
    assert_eq!(after, original);
    assert_eq!(f.engine.booking_by_token(&token).await.unwrap().id, original.id);
}

#[tokio::test]
async fn reschedule_checks_time_overlap() {
    let f = open("reschedule_overlap.wal", BookingPolicy::pantry());
    let food = f.unit("Food", Some("food"), w(9, 0, 10, 0), 3).await;
    let clothing = f.unit("Clothing", Some("clothing"), w(9, 30, 10, 30), 3).await;
    let held = f.book(food, d(4), "h1").await.unwrap().booking;
    let moving = f.book(clothing, d(3), "h1").await.unwrap().booking;

    let err = rejection(
        f.engine
            .reschedule(moving.token.as_deref().unwrap(), clothing, d(4))
            .await
            .unwrap_err(),
    );
    let Rejection::Overlapping(detail) = err else {
        panic!("expected an overlap");
    };
    assert_eq!(detail.existing.booking_id, Some(held.id));
    assert_eq!(f.engine.get_booking(moving.id).await.unwrap(), moving);
}

// ── Status changes ───────────────────────────────────────

#[tokio::test]
async fn staff_status_transitions() {
    let f = open("transitions.wal", BookingPolicy::pantry());
    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;
    let booking = f.book(unit, d(3), "h1").await.unwrap().booking;
    let holder = Actor::Holder("h1".into());

    let err = f
        .engine
        .update_status(booking.id, BookingStatus::Approved, None, &holder)
        .await
        .unwrap_err();
    assert_eq!(rejection(err).code(), "forbidden");

    let approved = f
        .engine
        .update_status(booking.id, BookingStatus::Approved, None, &Actor::Staff)
        .await
        .unwrap();
    assert_eq!(approved.status, BookingStatus::Approved);
    assert_eq!(approved.token, booking.token);

    let err = f
        .engine
        .update_status(booking.id, BookingStatus::Submitted, None, &Actor::Staff)
        .await
        .unwrap_err();
    assert_eq!(
        rejection(err),
        Rejection::InvalidTransition {
            from: BookingStatus::Approved,
            to: BookingStatus::Submitted,
        }
    );

    let err = f
        .engine
        .update_status(booking.id, BookingStatus::Cancelled, Some("  ".into()), &Actor::Staff)
        .await
        .unwrap_err();
    assert_eq!(rejection(err), Rejection::ReasonRequired);

    let cancelled = f
        .engine
        .update_status(booking.id, BookingStatus::Cancelled, Some("moved away".into()), &Actor::Staff)
        .await
        .unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.reason.as_deref(), Some("moved away"));
    assert!(cancelled.token.is_none());
    assert_eq!(f.engine.remaining(unit, d(3)).await.unwrap(), 3);

    let err = f
        .engine
        .update_status(booking.id, BookingStatus::Cancelled, Some("again".into()), &Actor::Staff)
        .await
        .unwrap_err();
    assert_eq!(rejection(err), Rejection::AlreadyTerminal(BookingStatus::Cancelled));
    // Terminal status wins over the missing reason.
    let err = f
        .engine
        .update_status(booking.id, BookingStatus::Cancelled, None, &Actor::Staff)
        .await
        .unwrap_err();
    assert_eq!(rejection(err), Rejection::AlreadyTerminal(BookingStatus::Cancelled));
}

#[tokio::test]
async fn staff_rejects_submitted_booking() {
    let f = open("reject_submitted.wal", BookingPolicy::pantry());
    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 1).await;
    let booking = f.book(unit, d(3), "h1").await.unwrap().booking;
    let rejected = f
        .engine
        .update_status(booking.id, BookingStatus::Rejected, Some("over limit".into()), &Actor::Staff)
        .await
        .unwrap();
    assert_eq!(rejected.status, BookingStatus::Rejected);
    // The seat is free again and the row can be reused.
    f.book(unit, d(3), "h2").await.unwrap();
    let again = f.book(unit, d(4), "h1").await.unwrap();
    assert!(!again.reused);
}

#[tokio::test]
async fn elapsed_booking_cannot_be_cancelled() {
    let f = open("elapsed_cancel.wal", BookingPolicy::pantry());
    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;
    let booking = f.book(unit, d(3), "h1").await.unwrap().booking;
    f.clock.advance_days(2);

    let err = f
        .engine
        .update_status(booking.id, BookingStatus::Cancelled, Some("late".into()), &Actor::Staff)
        .await
        .unwrap_err();
    assert_eq!(rejection(err), Rejection::AlreadyTerminal(BookingStatus::NoShow));
    let err = f
        .engine
        .cancel_by_token(booking.token.as_deref().unwrap(), None)
        .await
        .unwrap_err();
    assert_eq!(rejection(err).code(), "already_terminal");
}

#[tokio::test]
async fn guest_cancellation_consumes_token() {
    let f = open("cancel_token.wal", BookingPolicy::pantry());
    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;
    let booking = f.book(unit, d(3), "h1").await.unwrap().booking;
    let token = booking.token.unwrap();

    let cancelled = f.engine.cancel_by_token(&token, None).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.reason.as_deref(), Some(HOLDER_CANCEL_REASON));

    let err = rejection(f.engine.cancel_by_token(&token, None).await.unwrap_err());
    assert_eq!(err, Rejection::NotFound(Entity::Token));
}

#[tokio::test]
async fn sweep_completes_volunteer_shifts() {
    let f = open("sweep_volunteer.wal", BookingPolicy::volunteer());
    let unit = f.unit("Sorting", None, w(9, 0, 12, 0), 3).await;
    let past = f.book(unit, d(3), "v1").await.unwrap().booking;
    let future = f.book(unit, d(5), "v1").await.unwrap().booking;

    f.clock.set(d(4).and_time(t(7, 0)));
    assert_eq!(f.engine.sweep_elapsed().await.unwrap(), 1);
    let swept = f.engine.get_booking(past.id).await.unwrap();
    assert_eq!(swept.status, BookingStatus::Completed);
    assert_eq!(swept.reason.as_deref(), Some(ELAPSED_REASON));
    assert!(swept.token.is_none());
    assert_eq!(f.engine.get_booking(future.id).await.unwrap().status, BookingStatus::Approved);

    // Nothing left to sweep.
    assert_eq!(f.engine.sweep_elapsed().await.unwrap(), 0);
}

// ── Series ───────────────────────────────────────────────

fn series(unit_id: Ulid, holder: &str, start: NaiveDate, end: NaiveDate, pattern: Pattern) -> SeriesRequest {
    SeriesRequest {
        holder: holder.into(),
        unit_id,
        start,
        end,
        pattern,
        force: false,
        actor: Actor::Holder(holder.into()),
    }
}

#[tokio::test]
async fn series_reports_partial_success() {
    let f = open("series_partial.wal", BookingPolicy::volunteer());
    let unit = f.unit("Sorting", None, w(9, 0, 12, 0), 1).await;
    f.engine
        .add_override(
            Ulid::new(),
            Override::Holiday {
                date: d(12),
                reason: "Closed".into(),
            },
        )
        .await
        .unwrap();
    f.book(unit, d(17), "v2").await.unwrap();

    // Tue/Thu: 3, 5, 10, 12, 17, 19.
    let report = f
        .engine
        .admit_series(series(unit, "v1", d(3), d(19), Pattern::weekly([Weekday::Tue, Weekday::Thu])))
        .await
        .unwrap();
    assert_eq!(report.successes, vec![d(3), d(5), d(10), d(19)]);
    let skipped: Vec<(NaiveDate, &str)> = report.skipped.iter().map(|s| (s.date, s.reason.code())).collect();
    assert_eq!(skipped, vec![(d(12), "closed_period"), (d(17), "full")]);
    assert_eq!(report.bookings.len(), report.successes.len());
    assert!(report.raised_to.is_none());
    assert!(report
        .bookings
        .iter()
        .all(|b| b.series_id == Some(report.series_id) && b.token.is_some()));

    let stored = f.engine.get_series(report.series_id).unwrap();
    assert!(stored.active);
    assert_eq!(stored.holder, "v1");
    assert_eq!(f.engine.series_for_holder("v1"), vec![stored]);
    assert_eq!(f.engine.bookings_for_holder("v1").await.len(), 4);
}

#[tokio::test]
async fn series_skips_dates_already_held() {
    let f = open("series_held.wal", BookingPolicy::volunteer());
    let a = f.unit("Sorting", None, w(9, 0, 12, 0), 3).await;
    let b = f.unit("Front desk", None, w(13, 0, 16, 0), 3).await;
    f.book(a, d(4), "v1").await.unwrap();
    f.book(b, d(5), "v1").await.unwrap();

    let report = f
        .engine
        .admit_series(series(a, "v1", d(3), d(6), Pattern::Daily))
        .await
        .unwrap();
    assert_eq!(report.successes, vec![d(3), d(6)]);
    let skipped: Vec<(NaiveDate, &str)> = report.skipped.iter().map(|s| (s.date, s.reason.code())).collect();
    assert_eq!(skipped, vec![(d(4), "already_booked"), (d(5), "same_day_conflict")]);
}

#[tokio::test]
async fn forced_series_raises_ceiling_once() {
    let f = open("series_forced.wal", BookingPolicy::volunteer());
    let unit = f.unit("Sorting", None, w(9, 0, 12, 0), 1).await;
    f.book(unit, d(3), "v2").await.unwrap();
    f.book(unit, d(4), "v3").await.unwrap();

    let report = f
        .engine
        .admit_series(SeriesRequest {
            force: true,
            actor: Actor::Staff,
            ..series(unit, "v1", d(3), d(5), Pattern::Daily)
        })
        .await
        .unwrap();
    assert_eq!(report.successes, vec![d(3), d(4), d(5)]);
    assert_eq!(report.raised_to, Some(2));
    assert_eq!(f.capacity(unit).await, 2);
}

#[tokio::test]
async fn holder_cannot_force_a_series() {
    let f = open("series_unforced.wal", BookingPolicy::volunteer());
    let unit = f.unit("Sorting", None, w(9, 0, 12, 0), 1).await;
    f.book(unit, d(3), "v2").await.unwrap();

    let report = f
        .engine
        .admit_series(SeriesRequest {
            force: true,
            ..series(unit, "v1", d(3), d(4), Pattern::Daily)
        })
        .await
        .unwrap();
    assert_eq!(report.successes, vec![d(4)]);
    assert_eq!(report.skipped[0].reason, Rejection::Full { capacity: 1 });
    assert_eq!(f.capacity(unit).await, 1);
}

#[tokio::test]
async fn series_structural_problems_fail_whole_call() {
    let f = open("series_structural.wal", BookingPolicy::volunteer());
    let unit = f.unit("Driving", Some("driving"), w(9, 0, 12, 0), 1).await;

    let err = f
        .engine
        .admit_series(series(unit, "v1", d(3), d(5), Pattern::Daily))
        .await
        .unwrap_err();
    assert_eq!(rejection(err).code(), "ineligible");

    f.engine.grant_role("v1".into(), "driving".into()).await.unwrap();
    let err = f
        .engine
        .admit_series(series(unit, "v1", d(5), d(3), Pattern::Daily))
        .await
        .unwrap_err();
    assert_eq!(rejection(err).code(), "invalid_temporal");

    let missing = Ulid::new();
    let err = f
        .engine
        .admit_series(series(missing, "v1", d(3), d(5), Pattern::Daily))
        .await
        .unwrap_err();
    assert_eq!(rejection(err), Rejection::NotFound(Entity::Unit(missing)));
    assert!(f.engine.series_for_holder("v1").is_empty());
}

#[tokio::test]
async fn cancel_series_from_date_forward() {
    let f = open("series_cancel.wal", BookingPolicy::volunteer());
    let unit = f.unit("Sorting", None, w(9, 0, 12, 0), 3).await;
    let report = f
        .engine
        .admit_series(series(unit, "v1", d(3), d(13), Pattern::weekly([Weekday::Tue, Weekday::Thu])))
        .await
        .unwrap();
    assert_eq!(report.successes, vec![d(3), d(5), d(10), d(12)]);
    let holder = Actor::Holder("v1".into());

    let err = f
        .engine
        .cancel_series(report.series_id, d(10), None, &holder)
        .await
        .unwrap_err();
    assert_eq!(rejection(err), Rejection::ReasonRequired);
    let err = f
        .engine
        .cancel_series(report.series_id, d(10), Some("moving".into()), &Actor::Holder("v2".into()))
        .await
        .unwrap_err();
    assert_eq!(rejection(err).code(), "forbidden");

    let cancelled = f
        .engine
        .cancel_series(report.series_id, d(10), Some("moving".into()), &holder)
        .await
        .unwrap();
    let dates: Vec<NaiveDate> = cancelled.iter().map(|b| b.date).collect();
    assert_eq!(dates, vec![d(10), d(12)]);
    assert!(cancelled.iter().all(|b| b.status == BookingStatus::Cancelled));

    let kept: Vec<NaiveDate> = f
        .engine
        .bookings_for_holder("v1")
        .await
        .into_iter()
        .filter(|b| b.status.is_active())
        .map(|b| b.date)
        .collect();
    assert_eq!(kept, vec![d(5), d(3)]);

    let stored = f.engine.get_series(report.series_id).unwrap();
    assert!(!stored.active);
    assert_eq!(stored.end, d(10));

    let err = f
        .engine
        .cancel_series(report.series_id, d(10), Some("again".into()), &holder)
        .await
        .unwrap_err();
    assert_eq!(rejection(err).code(), "already_terminal");
}

#[tokio::test]
async fn cancel_series_follows_rescheduled_occurrences() {
    let f = open("series_cancel_moved.wal", BookingPolicy::volunteer());
    let sorting = f.unit("Sorting", None, w(9, 0, 12, 0), 3).await;
    let desk = f.unit("Front desk", None, w(13, 0, 16, 0), 3).await;
    let report = f
        .engine
        .admit_series(series(sorting, "v1", d(3), d(5), Pattern::Daily))
        .await
        .unwrap();
    let moving = report.bookings.iter().find(|b| b.date == d(4)).unwrap();
    let moved = f
        .engine
        .reschedule(moving.token.as_deref().unwrap(), desk, d(4))
        .await
        .unwrap();
    assert_eq!(moved.booking.series_id, Some(report.series_id));

    let cancelled = f
        .engine
        .cancel_series(report.series_id, d(3), Some("moving".into()), &Actor::Holder("v1".into()))
        .await
        .unwrap();
    let dates: Vec<NaiveDate> = cancelled.iter().map(|b| b.date).collect();
    assert_eq!(dates, vec![d(3), d(4), d(5)]);

    let after = f.engine.get_booking(moving.id).await.unwrap();
    assert_eq!(after.unit_id, desk);
    assert_eq!(after.status, BookingStatus::Cancelled);
    assert!(after.token.is_none());
    assert_eq!(f.engine.remaining(desk, d(4)).await.unwrap(), 3);

    let replayed = f.reopen();
    let restored = replayed.get_booking(moving.id).await.unwrap();
    assert_eq!(restored.status, BookingStatus::Cancelled);
    assert_eq!(restored.unit_id, desk);
}

// ── Notifications ────────────────────────────────────────

async fn next(rx: &mut tokio::sync::broadcast::Receiver<Notification>) -> Notification {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn admission_sends_confirmation_and_activity_notice() {
    let f = open("notify_admit.wal", BookingPolicy::pantry());
    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;
    let mut rx = f.hub.subscribe();

    let booking = f.book(unit, d(3), "h1").await.unwrap().booking;
    let token = booking.token.clone().unwrap();

    let confirmation = next(&mut rx).await;
    assert_eq!(confirmation.recipient, "h1");
    assert_eq!(confirmation.template, Template::BookingConfirmation);
    assert_eq!(
        confirmation.params["cancel_link"],
        format!("http://localhost/pantry/cancel?token={token}")
    );
    assert_eq!(confirmation.params["start"], "09:00");
    assert_eq!(confirmation.attachments.len(), 1);
    assert_eq!(confirmation.attachments[0].date, d(3));
    assert!(!confirmation.attachments[0].cancelled);

    let activity = next(&mut rx).await;
    assert_eq!(activity.recipient, OPERATIONS_RECIPIENT);
    assert_eq!(activity.template, Template::ActivityNotice);
    assert_eq!(activity.params["action"], "admitted");

    f.engine.cancel_by_token(&token, None).await.unwrap();
    let cancelled = next(&mut rx).await;
    assert_eq!(cancelled.template, Template::BookingCancelled);
    assert!(cancelled.attachments[0].cancelled);
    assert!(cancelled.params.get("cancel_link").is_none());
}

#[tokio::test]
async fn reschedule_notice_names_previous_timing() {
    let f = open("notify_reschedule.wal", BookingPolicy::pantry());
    let morning = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;
    let afternoon = f.unit("Afternoon", None, w(13, 0, 14, 0), 3).await;
    let mut rx = f.hub.subscribe();
    let booking = f.book(morning, d(3), "h1").await.unwrap().booking;

    f.engine
        .reschedule(booking.token.as_deref().unwrap(), afternoon, d(4))
        .await
        .unwrap();
    let note = loop {
        let note = next(&mut rx).await;
        if note.template == Template::BookingRescheduled {
            break note;
        }
    };
    assert_eq!(note.template, Template::BookingRescheduled);
    assert_eq!(note.params["previous_unit"], "Morning");
    assert_eq!(note.params["previous_date"], "2026-03-03");
    assert_eq!(note.params["unit"], "Afternoon");
    assert_eq!(note.params["date"], "2026-03-04");
}

#[tokio::test]
async fn dispatch_failure_never_fails_admission() {
    let f = open_with(
        "notify_failing.wal",
        BookingPolicy::volunteer(),
        Catalog::default(),
        Some(Arc::new(FailingDispatcher)),
    );
    let unit = f.unit("Sorting", None, w(9, 0, 12, 0), 1).await;
    let admitted = f.book(unit, d(3), "v1").await.unwrap();
    tokio::task::yield_now().await;
    assert_eq!(f.engine.get_booking(admitted.booking.id).await.unwrap(), admitted.booking);
}

// ── Units and limits ─────────────────────────────────────

#[tokio::test]
async fn unit_validation() {
    let f = open("unit_validation.wal", BookingPolicy::pantry());
    let id = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;

    let err = f
        .engine
        .create_unit(id, "Again".into(), None, w(9, 0, 10, 0), 3)
        .await
        .unwrap_err();
    assert_eq!(rejection(err), Rejection::AlreadyExists(Entity::Unit(id)));

    let err = f
        .engine
        .create_unit(
            Ulid::new(),
            "Backwards".into(),
            None,
            Window {
                start: t(10, 0),
                end: t(9, 0),
            },
            3,
        )
        .await
        .unwrap_err();
    assert_eq!(rejection(err).code(), "invalid_temporal");

    let err = f
        .engine
        .create_unit(Ulid::new(), "x".repeat(crate::limits::MAX_NAME_LEN + 1), None, w(9, 0, 10, 0), 3)
        .await
        .unwrap_err();
    assert_eq!(rejection(err).code(), "limit_exceeded");

    f.engine.update_unit(id, Some("Early morning".into()), None).await.unwrap();
    let units = f.engine.list_units().await;
    assert_eq!(units[0].name, "Early morning");
    assert!(units[0].active);
}

#[tokio::test]
async fn oversized_note_is_rejected() {
    let f = open("note_limit.wal", BookingPolicy::pantry());
    let unit = f.unit("Morning", None, w(9, 0, 10, 0), 3).await;
    let req = AdmissionRequest {
        note: Some("n".repeat(crate::limits::MAX_NOTE_LEN + 1)),
        ..request(unit, d(3), "h1")
    };
    let err = rejection(f.engine.admit(req).await.unwrap_err());
    assert_eq!(err, Rejection::LimitExceeded("note too long"));
}

// ── Durability ───────────────────────────────────────────

#[derive(Debug, PartialEq)]
struct Snapshot {
    units: Vec<UnitInfo>,
    bookings: Vec<Vec<Booking>>,
    series: Vec<Series>,
    overrides: Vec<(Ulid, Override)>,
    roles: Vec<String>,
}

async fn snapshot(engine: &Engine, holders: &[&str]) -> Snapshot {
    let mut bookings = Vec::new();
    for h in holders {
        bookings.push(engine.bookings_for_holder(h).await);
    }
    Snapshot {
        units: engine.list_units().await,
        bookings,
        series: holders.iter().flat_map(|h| engine.series_for_holder(h)).collect(),
        overrides: engine.list_overrides().await,
        roles: engine.roles_for("v1"),
    }
}

/// Drive every kind of event through the engine.
async fn busy_day(f: &Fixture) -> (Ulid, String) {
    f.engine.grant_role("v1".into(), "driving".into()).await.unwrap();
    f.engine.grant_role("v4".into(), "driving".into()).await.unwrap();
    f.engine.grant_role("v9".into(), "driving".into()).await.unwrap();
    f.engine.revoke_role("v9".into(), "driving".into()).await.unwrap();
    let sorting = f.unit("Sorting", None, w(9, 0, 12, 0), 2).await;
    let driving = f.unit("Driving", Some("driving"), w(13, 0, 16, 0), 1).await;
    let retired = f.unit("Retired", None, w(17, 0, 18, 0), 1).await;
    f.engine.update_unit(retired, Some("Old shift".into()), Some(false)).await.unwrap();
    f.engine
        .add_override(
            Ulid::new(),
            Override::Holiday {
                date: d(20),
                reason: "Spring break".into(),
            },
        )
        .await
        .unwrap();
    let removed = Ulid::new();
    f.engine
        .add_override(
            removed,
            Override::Break {
                unit_id: sorting,
                weekday: Weekday::Fri,
                reason: "Cleaning".into(),
            },
        )
        .await
        .unwrap();
    f.engine.remove_override(removed).await.unwrap();

    let first = f.book(sorting, d(3), "v1").await.unwrap().booking;
    let moved = f
        .engine
        .reschedule(first.token.as_deref().unwrap(), sorting, d(4))
        .await
        .unwrap()
        .booking;
    f.book(sorting, d(3), "v2").await.unwrap();
    let resolution = f
        .engine
        .resolve_conflict(ResolveRequest {
            existing_id: moved.id,
            keep: Keep::New {
                unit_id: driving,
                date: d(4),
                note: None,
                force: false,
            },
            actor: Actor::Holder("v1".into()),
        })
        .await
        .unwrap();
    f.engine.admit(forced(driving, d(4), "v4")).await.unwrap();
    let report = f
        .engine
        .admit_series(series(sorting, "v3", d(9), d(13), Pattern::Daily))
        .await
        .unwrap();
    f.engine
        .cancel_series(report.series_id, d(12), Some("exams".into()), &Actor::Holder("v3".into()))
        .await
        .unwrap();
    let v2 = f.engine.bookings_for_holder("v2").await;
    f.engine
        .cancel_by_token(v2[0].token.as_deref().unwrap(), Some("sick".into()))
        .await
        .unwrap();
    (driving, resolution.booking().token.clone().unwrap())
}

#[tokio::test]
async fn wal_replay_restores_every_book_change() {
    let f = open("replay.wal", BookingPolicy::volunteer());
    let (driving, token) = busy_day(&f).await;
    let holders = ["v1", "v2", "v3", "v4"];
    let before = snapshot(&f.engine, &holders).await;
    assert_eq!(f.capacity(driving).await, 2);

    let replayed = f.reopen();
    assert_eq!(snapshot(&replayed, &holders).await, before);
    assert_eq!(replayed.booking_by_token(&token).await.unwrap().unit_id, driving);
    assert!(replayed.has_role("v1", "driving"));
    assert!(!replayed.has_role("v9", "driving"));
    assert_eq!(replayed.remaining(driving, d(4)).await.unwrap(), 0);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let f = open("compact.wal", BookingPolicy::volunteer());
    let (_, token) = busy_day(&f).await;
    assert!(f.engine.wal_appends_since_compact().await > 0);

    f.engine.compact_wal().await.unwrap();
    assert_eq!(f.engine.wal_appends_since_compact().await, 0);

    let sorting = f.engine.list_units().await[0].id;
    f.book(sorting, d(5), "v5").await.unwrap();

    let holders = ["v1", "v2", "v3", "v4", "v5"];
    let before = snapshot(&f.engine, &holders).await;
    let replayed = f.reopen();
    assert_eq!(snapshot(&replayed, &holders).await, before);
    assert!(replayed.booking_by_token(&token).await.is_ok());

    let events = Wal::replay(&f.path).unwrap();
    // Compacted snapshot plus the one admission made afterwards.
    assert!(matches!(events.last(), Some(Event::BookingAdmitted { .. })));
}
