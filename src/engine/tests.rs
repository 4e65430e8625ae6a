use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate};
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use super::*;
use crate::availability::AvailabilityStore;
use crate::hours::{format_date, format_duration};
use crate::lifecycle::Transition;
use crate::notify::NotifyHub;
use crate::store::{DocumentStore, Order, StoreError, WalStore};

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

fn ms(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Ms {
    NaiveDate::from_ymd_opt(y, mo, d)
        .unwrap()
        .and_hms_opt(h, mi, 0)
        .unwrap()
        .and_utc()
        .timestamp_millis()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("tutorhours_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn settings() -> EngineSettings {
    EngineSettings {
        workers: 8,
        retry: RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        },
        utc_offset: FixedOffset::east_opt(0).unwrap(),
    }
}

fn profile(name: &str, kind: UserKind, location: &Location) -> UserProfile {
    UserProfile {
        id: Ulid::new(),
        name: name.into(),
        grade: Some("11".into()),
        kind,
        location: Some(location.id),
        payments: PaymentKind::Free,
    }
}

struct World {
    engine: Engine,
    store: Arc<WalStore>,
    loc: Location,
    tutor: UserProfile,
    pupil: UserProfile,
    supervisor: UserProfile,
}

/// A location with a supervisor, one tutor and one pupil, over `store`.
async fn world_over(wal: Arc<WalStore>, store: Arc<dyn DocumentStore>) -> World {
    let engine = Engine::new(store, wal.clone(), Arc::new(NotifyHub::new()), settings());
    let mut loc = Location::new(Ulid::new(), "Gunn Academic Center");
    loc.periods = vec!["A Period".into(), "B Period".into()];
    let supervisor = profile("Sam Supervisor", UserKind::Supervisor, &loc);
    loc.supervisors.push(supervisor.id);
    engine.put_location(loc.clone()).await.unwrap();

    let tutor = profile("Tess Tutor", UserKind::Tutor, &loc);
    let pupil = profile("Pat Pupil", UserKind::Pupil, &loc);
    for p in [&tutor, &pupil, &supervisor] {
        engine.put_profile(p.clone()).await.unwrap();
    }
    World { engine, store: wal, loc, tutor, pupil, supervisor }
}

async fn world(name: &str) -> World {
    let wal = Arc::new(WalStore::open(&test_wal_path(name)).unwrap());
    world_over(wal.clone(), wal).await
}

fn monday(loc: &Location) -> Slot {
    loc.slot(Day::Monday, "2:45 PM", "3:45 PM").unwrap()
}

/// Declare the tutor's Monday window and book it for the pupil.
async fn booked(w: &World) -> Appointment {
    let slot = monday(&w.loc);
    w.engine.declare_window(w.tutor.id, slot.clone()).await.unwrap();
    w.engine
        .request_appointment(Ulid::new(), w.pupil.id, w.tutor.id, slot, "Biology".into(), 0)
        .await
        .unwrap()
}

fn past_appointment(w: &World, slot: &Slot, clock_in: Ms, clock_out: Ms) -> Appointment {
    let mut appt = Appointment::requested(
        Ulid::new(),
        Attendees {
            from: w.pupil.to_ref(),
            to: w.tutor.to_ref(),
        },
        slot.clone(),
        "Algebra".into(),
        clock_in,
    );
    appt.clock_in = Some(ClockEvent::sent(&w.tutor.to_ref(), clock_in));
    appt.clock_out = Some(ClockEvent::sent(&w.tutor.to_ref(), clock_out));
    appt.state = AppointmentState::Past;
    appt
}

// ── Booking and availability ─────────────────────────────

#[tokio::test]
async fn monday_booking_reconcile_and_cancel() {
    let w = world("monday_booking.wal").await;
    let slot = monday(&w.loc);
    let mut tutor_inbox = w.engine.notify.subscribe(w.tutor.id);

    w.engine.declare_window(w.tutor.id, slot.clone()).await.unwrap();
    assert!(!w.engine.availability(w.tutor.id).await.unwrap().get(&slot).unwrap().booked);

    let appt = w
        .engine
        .request_appointment(Ulid::new(), w.pupil.id, w.tutor.id, slot.clone(), "Biology".into(), 0)
        .await
        .unwrap();
    assert_eq!(appt.state, AppointmentState::Requested);
    assert_eq!(tutor_inbox.try_recv().unwrap().title, "New Appointment Request");

    for user in [w.tutor.id, w.pupil.id] {
        let availability = w.engine.availability(user).await.unwrap();
        assert!(availability.get(&slot).unwrap().booked, "booked for {user}");
        assert_eq!(
            w.store.appointment(user, Partition::Active, appt.id).await.unwrap(),
            Some(appt.clone())
        );
    }

    // Reconcile agrees with the booking and is byte-identical on re-run
    let before = bincode::serialize(&w.engine.availability(w.tutor.id).await.unwrap()).unwrap();
    assert!(!w.engine.reconcile_user(w.tutor.id).await.unwrap());
    assert!(!w.engine.reconcile_user(w.pupil.id).await.unwrap());
    let after = bincode::serialize(&w.engine.availability(w.tutor.id).await.unwrap()).unwrap();
    assert_eq!(before, after);

    w.engine.cancel(appt.id, w.pupil.id).await.unwrap();
    for user in [w.tutor.id, w.pupil.id] {
        let window = w.engine.availability(user).await.unwrap().get(&slot).cloned();
        assert_eq!(window.map(|win| win.booked), Some(false), "window kept, unbooked");
    }
    assert!(matches!(
        w.engine.appointment(appt.id).await,
        Err(EngineError::NotFound(id)) if id == appt.id
    ));
}

#[tokio::test]
async fn request_requires_open_tutor_window() {
    let w = world("request_open_window.wal").await;
    let slot = monday(&w.loc);

    let undeclared = w
        .engine
        .request_appointment(Ulid::new(), w.pupil.id, w.tutor.id, slot.clone(), "Math".into(), 0)
        .await;
    assert!(matches!(undeclared, Err(EngineError::SlotUnavailable(_))));

    booked(&w).await;
    let second_pupil = profile("Quinn Pupil", UserKind::Pupil, &w.loc);
    w.engine.put_profile(second_pupil.clone()).await.unwrap();
    let taken = w
        .engine
        .request_appointment(Ulid::new(), second_pupil.id, w.tutor.id, slot, "Math".into(), 0)
        .await;
    assert!(matches!(taken, Err(EngineError::WindowBooked(_))));
    assert!(w.engine.availability(second_pupil.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn request_rejects_self_booking_and_unknown_users() {
    let w = world("request_guards.wal").await;
    let slot = monday(&w.loc);
    w.engine.declare_window(w.tutor.id, slot.clone()).await.unwrap();

    let own = w
        .engine
        .request_appointment(Ulid::new(), w.tutor.id, w.tutor.id, slot.clone(), "Math".into(), 0)
        .await;
    assert!(matches!(own, Err(EngineError::UnauthorizedActor(_))));

    let ghost = Ulid::new();
    let unknown = w
        .engine
        .request_appointment(Ulid::new(), ghost, w.tutor.id, slot, "Math".into(), 0)
        .await;
    assert!(matches!(unknown, Err(EngineError::NotFound(id)) if id == ghost));
}

#[tokio::test]
async fn window_declaration_guards() {
    let w = world("window_guards.wal").await;
    let inverted = w.loc.slot(Day::Tuesday, "3:45 PM", "2:45 PM").unwrap();
    assert!(matches!(
        w.engine.declare_window(w.tutor.id, inverted).await,
        Err(EngineError::InvalidWindow(_))
    ));

    let period = w.loc.slot(Day::Tuesday, "A Period", "B Period").unwrap();
    assert_ok!(w.engine.declare_window(w.tutor.id, period.clone()).await);
    // Redeclaring is a no-op
    assert_ok!(w.engine.declare_window(w.tutor.id, period.clone()).await);
    assert_eq!(w.engine.availability(w.tutor.id).await.unwrap().len(), 1);
    assert_ok!(w.engine.remove_window(w.tutor.id, &period).await);

    let appt = booked(&w).await;
    assert!(matches!(
        w.engine.remove_window(w.tutor.id, &appt.time).await,
        Err(EngineError::WindowBooked(_))
    ));
    let open = w.engine.open_windows(w.tutor.id, Some(w.loc.id)).await.unwrap();
    assert!(open.is_empty());
}

#[tokio::test]
async fn period_edits_keep_declared_windows_bookable() {
    let w = world("period_edits.wal").await;
    let stale = w.loc.slot(Day::Thursday, "B Period", "B Period").unwrap();
    w.engine.declare_window(w.tutor.id, stale.clone()).await.unwrap();

    let mut loc = w.loc.clone();
    loc.periods.insert(0, "Zero Period".into());
    w.engine.put_location(loc.clone()).await.unwrap();

    // Redeclaring against the new schedule replaces rather than duplicates
    let fresh = loc.slot(Day::Thursday, "B Period", "B Period").unwrap();
    assert_ok!(w.engine.declare_window(w.tutor.id, fresh).await);
    assert_eq!(w.engine.availability(w.tutor.id).await.unwrap().len(), 1);

    // A request still carrying the old rank books the same window
    let appt = w
        .engine
        .request_appointment(Ulid::new(), w.pupil.id, w.tutor.id, stale, "Chemistry".into(), 0)
        .await
        .unwrap();
    assert_eq!(appt.time.open, TimeOfDay::Period { rank: 2, label: "B Period".into() });
    let tutor = w.engine.availability(w.tutor.id).await.unwrap();
    assert_eq!(tutor.len(), 1);
    assert!(tutor.windows()[0].booked);

    loc.periods.retain(|p| p != "B Period");
    w.engine.put_location(loc.clone()).await.unwrap();
    let gone = w.loc.slot(Day::Friday, "B Period", "B Period").unwrap();
    assert!(matches!(
        w.engine.declare_window(w.tutor.id, gone).await,
        Err(EngineError::InvalidWindow(_))
    ));
}

#[tokio::test]
async fn cancel_keeps_slot_held_by_another_appointment() {
    let w = world("cancel_shared_slot.wal").await;
    let slot = monday(&w.loc);
    let other_tutor = profile("Toby Tutor", UserKind::Tutor, &w.loc);
    w.engine.put_profile(other_tutor.clone()).await.unwrap();
    w.engine.declare_window(other_tutor.id, slot.clone()).await.unwrap();

    let first = booked(&w).await;
    let _second = w
        .engine
        .request_appointment(Ulid::new(), w.pupil.id, other_tutor.id, slot.clone(), "Chem".into(), 0)
        .await
        .unwrap();

    w.engine.cancel(first.id, w.tutor.id).await.unwrap();
    let tutor_window = w.engine.availability(w.tutor.id).await.unwrap();
    assert!(!tutor_window.get(&slot).unwrap().booked);
    let pupil_window = w.engine.availability(w.pupil.id).await.unwrap();
    assert!(pupil_window.get(&slot).unwrap().booked);
}

#[tokio::test]
async fn cancel_after_clock_in_is_rejected() {
    let w = world("cancel_after_clock_in.wal").await;
    let appt = booked(&w).await;
    w.engine.clock_in(appt.id, w.tutor.id, H).await.unwrap();
    assert!(matches!(
        w.engine.cancel(appt.id, w.pupil.id).await,
        Err(EngineError::InvalidTransition { state: AppointmentState::Active, transition: Transition::Cancel })
    ));
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn full_lifecycle_archives_both_copies() {
    let w = world("full_lifecycle.wal").await;
    let appt = booked(&w).await;
    let mut pupil_inbox = w.engine.notify.subscribe(w.pupil.id);
    let start = ms(2020, 3, 2, 9, 0);

    w.engine.clock_in(appt.id, w.tutor.id, start).await.unwrap();
    assert_eq!(pupil_inbox.try_recv().unwrap().title, "Clock In");
    w.engine.approve_clock_in(appt.id, w.pupil.id, start + M).await.unwrap();
    w.engine.clock_out(appt.id, w.tutor.id, start + H + 15 * M).await.unwrap();
    let done = w
        .engine
        .approve_clock_out(appt.id, w.pupil.id, start + H + 16 * M)
        .await
        .unwrap();

    assert_eq!(done.state, AppointmentState::Past);
    assert_eq!(done.duration_secs(), Some(4500));
    assert_eq!(format_duration(done.duration_secs().unwrap()), "01:15:00");
    for user in [w.tutor.id, w.pupil.id] {
        assert!(w.store.appointment(user, Partition::Active, appt.id).await.unwrap().is_none());
        assert_eq!(
            w.store.appointment(user, Partition::Past, appt.id).await.unwrap(),
            Some(done.clone())
        );
    }

    // Approval refreshed both totals, by role
    let tutor_hours = w.engine.hours(w.tutor.id).await.unwrap();
    assert_eq!(tutor_hours.seconds_tutored, 4500);
    assert_eq!(tutor_hours.sessions, 1);
    assert_eq!(w.engine.hours(w.pupil.id).await.unwrap().seconds_pupiled, 4500);

    // History keeps the slot booked
    assert!(!w.engine.reconcile_user(w.tutor.id).await.unwrap());
    assert!(w.engine.availability(w.tutor.id).await.unwrap().get(&appt.time).unwrap().booked);

    // Past appointments accept nothing further
    assert!(matches!(
        w.engine.clock_out(appt.id, w.tutor.id, start + 2 * H).await,
        Err(EngineError::InvalidTransition { state: AppointmentState::Past, .. })
    ));
}

#[tokio::test]
async fn clock_out_before_clock_in_rejected() {
    let w = world("clock_out_first.wal").await;
    let appt = booked(&w).await;
    let err = w.engine.clock_out(appt.id, w.tutor.id, H).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            state: AppointmentState::Requested,
            transition: Transition::ClockOut
        }
    ));
    let stored = w.engine.appointment(appt.id).await.unwrap();
    assert_eq!(stored, appt);
}

#[tokio::test]
async fn self_approval_rejected() {
    let w = world("self_approval.wal").await;
    let appt = booked(&w).await;
    w.engine.clock_in(appt.id, w.pupil.id, 0).await.unwrap();
    assert!(matches!(
        w.engine.approve_clock_in(appt.id, w.pupil.id, M).await,
        Err(EngineError::SelfApproval(id)) if id == w.pupil.id
    ));

    w.engine.clock_out(appt.id, w.pupil.id, H).await.unwrap();
    assert!(matches!(
        w.engine.approve_clock_out(appt.id, w.pupil.id, H).await,
        Err(EngineError::SelfApproval(_))
    ));
    let stranger = Ulid::new();
    assert!(matches!(
        w.engine.approve_clock_out(appt.id, stranger, H).await,
        Err(EngineError::UnauthorizedActor(id)) if id == stranger
    ));

    let stored = w.engine.appointment(appt.id).await.unwrap();
    assert_eq!(stored.state, AppointmentState::Active);
    assert!(stored.clock_out.is_some());
}

#[tokio::test]
async fn reject_clock_out_reopens_session() {
    let w = world("reject_clock_out.wal").await;
    let appt = booked(&w).await;
    let mut tutor_inbox = w.engine.notify.subscribe(w.tutor.id);
    w.engine.clock_in(appt.id, w.tutor.id, 0).await.unwrap();
    w.engine.clock_out(appt.id, w.tutor.id, H).await.unwrap();

    assert_err!(w.engine.reject_clock_out(appt.id, w.tutor.id).await);
    let reopened = w.engine.reject_clock_out(appt.id, w.pupil.id).await.unwrap();
    assert_eq!(reopened.state, AppointmentState::Active);
    assert!(reopened.clock_out.is_none());

    let titles: Vec<String> = std::iter::from_fn(|| tutor_inbox.try_recv().ok())
        .map(|n| n.title)
        .collect();
    assert!(titles.iter().any(|t| t == "Clock Out Rejected"));

    w.engine.clock_out(appt.id, w.tutor.id, 2 * H).await.unwrap();
    let done = w.engine.approve_clock_out(appt.id, w.pupil.id, 2 * H).await.unwrap();
    assert_eq!(done.duration_ms(), Some(2 * H));
}

#[tokio::test]
async fn force_archive_requires_location_supervisor() {
    let w = world("force_archive.wal").await;
    let appt = booked(&w).await;

    // No clock-in yet
    assert!(matches!(
        w.engine.force_archive(appt.id, w.supervisor.id, H).await,
        Err(EngineError::InvalidTransition { .. })
    ));
    w.engine.clock_in(appt.id, w.tutor.id, 0).await.unwrap();
    assert!(matches!(
        w.engine.force_archive(appt.id, w.tutor.id, H).await,
        Err(EngineError::UnauthorizedActor(_))
    ));

    let archived = w.engine.force_archive(appt.id, w.supervisor.id, 50 * M).await.unwrap();
    assert_eq!(archived.state, AppointmentState::Past);
    assert_eq!(archived.override_by, Some(w.supervisor.to_ref()));
    assert_eq!(w.engine.hours(w.tutor.id).await.unwrap().seconds_tutored, 3000);
    let past = w.engine.appointments(w.pupil.id, Partition::Past).await.unwrap();
    assert_eq!(past, vec![archived]);
}

#[tokio::test]
async fn round_past_appointment_snaps_clock_times() {
    let mut w = world("round_past.wal").await;
    w.loc.rounding = RoundingPolicy {
        threshold: Threshold::FifteenMinutes,
        rounding: Rounding::Up,
        time_threshold: Threshold::FiveMinutes,
    };
    w.engine.put_location(w.loc.clone()).await.unwrap();

    let appt = booked(&w).await;
    let start = ms(2020, 3, 2, 9, 2);
    w.engine.clock_in(appt.id, w.tutor.id, start).await.unwrap();
    assert!(matches!(
        w.engine.round_past_appointment(appt.id, w.supervisor.id).await,
        Err(EngineError::InvalidTransition { state: AppointmentState::Active, .. })
    ));
    w.engine.clock_out(appt.id, w.tutor.id, start + 50 * M).await.unwrap();
    w.engine.approve_clock_out(appt.id, w.pupil.id, start + 51 * M).await.unwrap();
    // 50 minutes rounds up to the hour under the location policy
    assert_eq!(w.engine.hours(w.tutor.id).await.unwrap().seconds_tutored, 3600);

    assert!(matches!(
        w.engine.round_past_appointment(appt.id, w.tutor.id).await,
        Err(EngineError::UnauthorizedActor(_))
    ));
    let rounded = w.engine.round_past_appointment(appt.id, w.supervisor.id).await.unwrap();
    let cin = rounded.clock_in.as_ref().unwrap().sent_timestamp;
    let cout = rounded.clock_out.as_ref().unwrap().sent_timestamp;
    assert_eq!(cin, ms(2020, 3, 2, 9, 0));
    assert_eq!(cout, ms(2020, 3, 2, 10, 0));
    for user in [w.tutor.id, w.pupil.id] {
        assert_eq!(
            w.store.appointment(user, Partition::Past, appt.id).await.unwrap(),
            Some(rounded.clone())
        );
    }
}

#[tokio::test]
async fn state_survives_reopen() {
    let path = test_wal_path("reopen.wal");
    let (appt, tutor) = {
        let wal = Arc::new(WalStore::open(&path).unwrap());
        let w = world_over(wal.clone(), wal).await;
        (booked(&w).await, w.tutor.id)
    };

    let wal = Arc::new(WalStore::open(&path).unwrap());
    let engine = Engine::new(wal.clone(), wal, Arc::new(NotifyHub::new()), settings());
    assert_eq!(engine.appointment(appt.id).await.unwrap(), appt);
    assert!(engine.availability(tutor).await.unwrap().get(&appt.time).unwrap().booked);
    engine.clock_in(appt.id, tutor, H).await.unwrap();
}

// ── Reconciliation ───────────────────────────────────────

#[tokio::test]
async fn reconcile_unbooks_unmatched_and_adds_history() {
    let w = world("reconcile_history.wal").await;
    let monday = monday(&w.loc);
    let friday = w.loc.slot(Day::Friday, "3:00 PM", "4:00 PM").unwrap();

    // Friday marked booked with nothing behind it; Monday only in history
    let mut stale = AvailabilityStore::new();
    stale.set_booked(&friday, true);
    let appt = past_appointment(&w, &monday, 0, H);
    let mut writes = vec![Write::PutAvailability { user: w.tutor.id, availability: stale }];
    writes.extend(put_copies(&appt, Partition::Past));
    w.store.commit(writes).await.unwrap();

    assert!(w.engine.reconcile_user(w.tutor.id).await.unwrap());
    let availability = w.engine.availability(w.tutor.id).await.unwrap();
    assert_eq!(availability.len(), 2);
    assert!(!availability.get(&friday).unwrap().booked);
    assert!(availability.get(&monday).unwrap().booked);

    let bytes = bincode::serialize(&availability).unwrap();
    assert!(!w.engine.reconcile_user(w.tutor.id).await.unwrap());
    let again = bincode::serialize(&w.engine.availability(w.tutor.id).await.unwrap()).unwrap();
    assert_eq!(bytes, again);
}

#[tokio::test]
async fn user_without_appointments_reconciles_to_unbooked() {
    let w = world("reconcile_empty.wal").await;
    let mut stale = AvailabilityStore::new();
    stale.set_booked(&monday(&w.loc), true);
    w.store
        .commit(vec![Write::PutAvailability { user: w.pupil.id, availability: stale }])
        .await
        .unwrap();
    assert!(w.engine.reconcile_user(w.pupil.id).await.unwrap());
    assert_eq!(w.engine.availability(w.pupil.id).await.unwrap().booked_count(), 0);
}

/// Fails `appointments` reads for flagged users while they have failures left.
struct FlakyStore {
    inner: Arc<WalStore>,
    failures_left: Mutex<HashMap<UserId, u32>>,
}

impl FlakyStore {
    fn new(inner: Arc<WalStore>, flaky: &[UserId], failures: u32) -> Self {
        Self {
            inner,
            failures_left: Mutex::new(flaky.iter().map(|u| (*u, failures)).collect()),
        }
    }

    fn heal(&self) {
        self.failures_left.lock().unwrap().clear();
    }

    fn trip(&self, user: UserId) -> Result<(), StoreError> {
        let mut left = self.failures_left.lock().unwrap();
        match left.get_mut(&user) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(StoreError::Unavailable(format!("injected outage for {user}")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn location(&self, id: Ulid) -> Result<Option<Location>, StoreError> {
        self.inner.location(id).await
    }

    async fn user_ids(&self) -> Result<Vec<UserId>, StoreError> {
        self.inner.user_ids().await
    }

    async fn availability(&self, user: UserId) -> Result<AvailabilityStore, StoreError> {
        self.inner.availability(user).await
    }

    async fn appointment(
        &self,
        user: UserId,
        partition: Partition,
        id: Ulid,
    ) -> Result<Option<Appointment>, StoreError> {
        self.inner.appointment(user, partition, id).await
    }

    async fn appointments(
        &self,
        user: UserId,
        partition: Partition,
    ) -> Result<Vec<Appointment>, StoreError> {
        self.trip(user)?;
        self.inner.appointments(user, partition).await
    }

    async fn find_appointment(&self, id: Ulid) -> Result<Option<Appointment>, StoreError> {
        self.inner.find_appointment(id).await
    }

    async fn past_by_clock_out(
        &self,
        user: UserId,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<Appointment>, StoreError> {
        self.inner.past_by_clock_out(user, order, limit).await
    }

    async fn hours(&self, user: UserId) -> Result<ServiceHours, StoreError> {
        self.inner.hours(user).await
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        self.inner.commit(writes).await
    }
}

/// 100 users, each with a stale booked window. Three of them sit behind a store outage.
async fn hundred_users(name: &str, failures: u32) -> (Engine, Arc<FlakyStore>, Vec<UserId>, Vec<UserId>) {
    let wal = Arc::new(WalStore::open(&test_wal_path(name)).unwrap());
    let loc = Location::new(Ulid::new(), "Paly Peer Tutoring Center");
    wal.commit(vec![Write::PutLocation(loc.clone())]).await.unwrap();
    let slot = loc.slot(Day::Thursday, "3:30 PM", "4:30 PM").unwrap();

    let mut users: Vec<UserId> = (0..100).map(|_| Ulid::new()).collect();
    users.sort();
    for user in &users {
        let mut stale = AvailabilityStore::new();
        stale.set_booked(&slot, true);
        wal.commit(vec![Write::PutAvailability { user: *user, availability: stale }])
            .await
            .unwrap();
    }
    let mut flaky = vec![users[7], users[42], users[93]];
    flaky.sort();

    let store = Arc::new(FlakyStore::new(wal.clone(), &flaky, failures));
    let engine = Engine::new(store.clone(), wal, Arc::new(NotifyHub::new()), settings());
    (engine, store, users, flaky)
}

#[tokio::test]
async fn batch_reports_transient_failures_and_rerun_succeeds() {
    let (engine, store, users, flaky) = hundred_users("batch_hundred.wal", u32::MAX).await;

    let (control, progress) = BatchControl::new();
    let report = engine.reconcile_all(&users, &control).await;
    assert_eq!(report.total, 100);
    assert_eq!(report.succeeded, 97);
    assert_eq!(report.failed_users(), flaky);
    assert!(report
        .failed
        .iter()
        .all(|f| matches!(f.error, EngineError::ExternalStoreUnavailable(_))));
    assert_eq!(*progress.borrow(), Progress { completed: 100, total: 100 });

    // Failed units were skipped whole
    for user in &flaky {
        assert_eq!(engine.availability(*user).await.unwrap().booked_count(), 1);
    }

    store.heal();
    let (control, _progress) = BatchControl::new();
    let rerun = engine.reconcile_all(&users, &control).await;
    assert_eq!(rerun.succeeded, 100);
    assert!(rerun.is_clean());
    assert_eq!(rerun.changed, 3);
    for user in &users {
        assert_eq!(engine.availability(*user).await.unwrap().booked_count(), 0);
    }
}

#[tokio::test]
async fn batch_retries_short_outages() {
    let (engine, _store, users, _flaky) = hundred_users("batch_retry.wal", 1).await;
    let (control, _progress) = BatchControl::new();
    let report = engine.reconcile_all(&users, &control).await;
    assert!(report.is_clean());
    assert_eq!(report.succeeded, 100);
    assert_eq!(report.changed, 100);
}

#[tokio::test]
async fn cancelled_batch_starts_nothing() {
    let (engine, _store, users, _flaky) = hundred_users("batch_cancel.wal", 0).await;
    let (control, progress) = BatchControl::new();
    control.cancel.cancel();
    let report = engine.reconcile_all(&users, &control).await;
    assert_eq!(report.skipped, 100);
    assert_eq!(report.succeeded, 0);
    assert!(progress.borrow().is_done());
    for user in &users {
        assert_eq!(engine.availability(*user).await.unwrap().booked_count(), 1);
    }
}

// ── Service hours ────────────────────────────────────────

#[tokio::test]
async fn two_sessions_aggregate_to_ninety_minutes() {
    let w = world("aggregate_two.wal").await;
    let slot = monday(&w.loc);
    let mut writes = put_copies(
        &past_appointment(&w, &slot, ms(2020, 1, 1, 15, 0), ms(2020, 1, 1, 16, 0)),
        Partition::Past,
    );
    writes.extend(put_copies(
        &past_appointment(&w, &slot, ms(2020, 2, 1, 15, 0), ms(2020, 2, 1, 15, 30)),
        Partition::Past,
    ));
    w.store.commit(writes).await.unwrap();

    let hours = w.engine.refresh_hours(w.tutor.id).await.unwrap();
    assert_eq!(hours.seconds_tutored, 5400);
    assert_eq!(hours.sessions, 2);
    assert_eq!(format_date(hours.start_date), "1/1/2020");
    assert_eq!(format_date(hours.end_date), "2/1/2020");
    assert_eq!(w.engine.hours(w.tutor.id).await.unwrap(), hours);

    let pupil_hours = w.engine.refresh_hours(w.pupil.id).await.unwrap();
    assert_eq!(pupil_hours.seconds_pupiled, 5400);
    assert_eq!(pupil_hours.seconds_tutored, 0);

    let rows = w.engine.service_hour_report(Some(w.loc.id)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, "Tess Tutor");
    assert_eq!(rows[0].service_hours, "01:30:00");
    assert_eq!(rows[0].start_date, "1/1/2020");
    assert_eq!(rows[0].end_date, "2/1/2020");
}

#[tokio::test]
async fn supervisors_are_left_out_of_hour_refreshes() {
    let w = world("aggregate_supervisor.wal").await;
    let slot = monday(&w.loc);
    let mut appt = past_appointment(&w, &slot, ms(2020, 1, 1, 15, 0), ms(2020, 1, 1, 16, 0));
    appt.attendees.to = w.supervisor.to_ref();
    w.store.commit(put_copies(&appt, Partition::Past)).await.unwrap();

    let hours = w.engine.refresh_hours(w.supervisor.id).await.unwrap();
    assert_eq!(hours, ServiceHours::default());
    assert_eq!(w.engine.hours(w.supervisor.id).await.unwrap(), ServiceHours::default());

    let (control, _progress) = BatchControl::new();
    let report = w.engine.refresh_hours_everyone(&control).await.unwrap();
    assert_eq!(report.total, 2);
    assert!(report.is_clean());
    assert_eq!(w.engine.hours(w.pupil.id).await.unwrap().seconds_pupiled, 3600);
}

#[tokio::test]
async fn no_history_reports_sentinel_dates() {
    let w = world("aggregate_empty.wal").await;
    let hours = w.engine.refresh_hours(w.tutor.id).await.unwrap();
    assert_eq!(hours, ServiceHours::default());
    let rows = w.engine.service_hour_report(None).await.unwrap();
    assert_eq!(rows[0].service_hours, "00:00:00");
    assert_eq!(rows[0].start_date, "1/1/2019");
    assert_eq!(rows[0].end_date, "1/1/2019");
}

#[tokio::test]
async fn report_orders_tutors_by_name() {
    let w = world("report_order.wal").await;
    for name in ["Zed Tutor", "Abe Tutor"] {
        w.engine.put_profile(profile(name, UserKind::Tutor, &w.loc)).await.unwrap();
    }
    let names: Vec<String> = w
        .engine
        .service_hour_report(None)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["Abe Tutor", "Tess Tutor", "Zed Tutor"]);
}

#[tokio::test]
async fn refresh_hours_for_unknown_user_is_not_found() {
    let w = world("aggregate_unknown.wal").await;
    let ghost = Ulid::new();
    assert!(matches!(
        w.engine.refresh_hours(ghost).await,
        Err(EngineError::NotFound(id)) if id == ghost
    ));
}

// ── Partial archival ─────────────────────────────────────

/// Silently drops one user's writes from any commit that archives an appointment.
struct TornStore {
    inner: Arc<WalStore>,
    victim: UserId,
}

#[async_trait]
impl DocumentStore for TornStore {
    async fn location(&self, id: Ulid) -> Result<Option<Location>, StoreError> {
        self.inner.location(id).await
    }

    async fn user_ids(&self) -> Result<Vec<UserId>, StoreError> {
        self.inner.user_ids().await
    }

    async fn availability(&self, user: UserId) -> Result<AvailabilityStore, StoreError> {
        self.inner.availability(user).await
    }

    async fn appointment(
        &self,
        user: UserId,
        partition: Partition,
        id: Ulid,
    ) -> Result<Option<Appointment>, StoreError> {
        self.inner.appointment(user, partition, id).await
    }

    async fn appointments(
        &self,
        user: UserId,
        partition: Partition,
    ) -> Result<Vec<Appointment>, StoreError> {
        self.inner.appointments(user, partition).await
    }

    async fn find_appointment(&self, id: Ulid) -> Result<Option<Appointment>, StoreError> {
        self.inner.find_appointment(id).await
    }

    async fn past_by_clock_out(
        &self,
        user: UserId,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<Appointment>, StoreError> {
        self.inner.past_by_clock_out(user, order, limit).await
    }

    async fn hours(&self, user: UserId) -> Result<ServiceHours, StoreError> {
        self.inner.hours(user).await
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let archives = writes.iter().any(|w| {
            matches!(w, Write::PutAppointment { partition: Partition::Past, .. })
        });
        if !archives {
            return self.inner.commit(writes).await;
        }
        let kept = writes
            .into_iter()
            .filter(|w| w.user() != Some(self.victim))
            .collect();
        self.inner.commit(kept).await
    }
}

#[tokio::test]
async fn torn_archival_reports_partial_archival() {
    let wal = Arc::new(WalStore::open(&test_wal_path("torn_archival.wal")).unwrap());
    let plain = world_over(wal.clone(), wal.clone()).await;
    let appt = booked(&plain).await;
    plain.engine.clock_in(appt.id, plain.tutor.id, 0).await.unwrap();
    plain.engine.clock_out(appt.id, plain.tutor.id, H).await.unwrap();

    let torn = Engine::new(
        Arc::new(TornStore { inner: wal.clone(), victim: plain.tutor.id }),
        wal.clone(),
        Arc::new(NotifyHub::new()),
        settings(),
    );
    let err = torn.approve_clock_out(appt.id, plain.pupil.id, H).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::PartialArchival { appointment, ref users }
            if appointment == appt.id && *users == vec![plain.tutor.id]
    ));
    // The tutor's copy never left the active partition
    assert!(wal.appointment(plain.tutor.id, Partition::Active, appt.id).await.unwrap().is_some());
    assert!(wal.appointment(plain.pupil.id, Partition::Past, appt.id).await.unwrap().is_some());
}
