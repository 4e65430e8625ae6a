use std::cmp::Ordering;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::availability::AvailabilityStore;

/// Unix milliseconds. The only timestamp type.
pub type Ms = i64;

pub type UserId = Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Day {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Day {
    pub const ALL: [Day; 7] = [
        Day::Monday,
        Day::Tuesday,
        Day::Wednesday,
        Day::Thursday,
        Day::Friday,
        Day::Saturday,
        Day::Sunday,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Day::Monday => "Monday",
            Day::Tuesday => "Tuesday",
            Day::Wednesday => "Wednesday",
            Day::Thursday => "Thursday",
            Day::Friday => "Friday",
            Day::Saturday => "Saturday",
            Day::Sunday => "Sunday",
        }
    }

    pub fn parse(text: &str) -> Option<Day> {
        let text = text.trim();
        Day::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(text))
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bound of a weekly window: either a wall-clock time or a named school period.
///
/// The two kinds never compare with each other. Periods are ordered by their
/// position in the owning location's period list as of when the bound was
/// resolved. A period's identity is its label, not its rank.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimeOfDay {
    /// Minutes past midnight.
    Clock(u16),
    Period { rank: u16, label: String },
}

impl TimeOfDay {
    pub fn clock(hour: u16, minute: u16) -> Self {
        TimeOfDay::Clock(hour * 60 + minute)
    }

    /// Parse `"2:45 PM"`, `"12:00 AM"` or 24-hour `"14:45"`.
    pub fn parse_clock(text: &str) -> Option<Self> {
        let text = text.trim();
        let (clock, meridiem) = match text.rsplit_once(' ') {
            Some((c, m)) => (c.trim(), Some(m.to_ascii_uppercase())),
            None => (text, None),
        };
        let (h, m) = clock.split_once(':')?;
        let h: u16 = h.parse().ok()?;
        let m: u16 = m.parse().ok()?;
        if m >= 60 {
            return None;
        }
        let h = match meridiem.as_deref() {
            None if h < 24 => h,
            Some("AM") if (1..=12).contains(&h) => h % 12,
            Some("PM") if (1..=12).contains(&h) => h % 12 + 12,
            _ => return None,
        };
        Some(TimeOfDay::Clock(h * 60 + m))
    }

    pub fn is_period(&self) -> bool {
        matches!(self, TimeOfDay::Period { .. })
    }

    /// Total order used for slot identity: clock times by minute, periods by
    /// label, clock times before periods. Ignores period rank.
    pub fn cmp_identity(&self, other: &TimeOfDay) -> Ordering {
        match (self, other) {
            (TimeOfDay::Clock(a), TimeOfDay::Clock(b)) => a.cmp(b),
            (TimeOfDay::Period { label: a, .. }, TimeOfDay::Period { label: b, .. }) => a.cmp(b),
            (TimeOfDay::Clock(_), TimeOfDay::Period { .. }) => Ordering::Less,
            (TimeOfDay::Period { .. }, TimeOfDay::Clock(_)) => Ordering::Greater,
        }
    }

    /// Order-preserving comparison; `None` when mixing clock times and periods.
    pub fn compare(&self, other: &TimeOfDay) -> Option<Ordering> {
        match (self, other) {
            (TimeOfDay::Clock(a), TimeOfDay::Clock(b)) => Some(a.cmp(b)),
            (TimeOfDay::Period { rank: a, .. }, TimeOfDay::Period { rank: b, .. }) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeOfDay::Clock(minutes) => {
                let (h, m) = (minutes / 60, minutes % 60);
                let meridiem = if h < 12 { "AM" } else { "PM" };
                let h12 = match h % 12 {
                    0 => 12,
                    h => h,
                };
                write!(f, "{h12}:{m:02} {meridiem}")
            }
            TimeOfDay::Period { label, .. } => f.write_str(label),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRef {
    pub id: Ulid,
    pub name: String,
}

/// A recurring weekly slot at a location. Identity is `(location.id, day, open, close)`;
/// the location name is carried for display only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub location: LocationRef,
    pub day: Day,
    pub open: TimeOfDay,
    pub close: TimeOfDay,
}

impl Slot {
    pub fn new(location: LocationRef, day: Day, open: TimeOfDay, close: TimeOfDay) -> Self {
        Self { location, day, open, close }
    }

    pub fn cmp_identity(&self, other: &Slot) -> Ordering {
        (self.location.id, self.day)
            .cmp(&(other.location.id, other.day))
            .then_with(|| self.open.cmp_identity(&other.open))
            .then_with(|| self.close.cmp_identity(&other.close))
    }

    pub fn equals(&self, other: &Slot) -> bool {
        self.cmp_identity(other) == Ordering::Equal
    }

    /// Half-open `[open, close)` bounds. A period occupies its whole rank, so a
    /// period window covers `[rank(open), rank(close) + 1)`.
    fn bounds(&self) -> Option<(bool, u32, u32)> {
        match (&self.open, &self.close) {
            (TimeOfDay::Clock(o), TimeOfDay::Clock(c)) => Some((false, *o as u32, *c as u32)),
            (TimeOfDay::Period { rank: o, .. }, TimeOfDay::Period { rank: c, .. }) => {
                Some((true, *o as u32, *c as u32 + 1))
            }
            _ => None,
        }
    }

    pub fn overlaps(&self, other: &Slot) -> bool {
        if self.location.id != other.location.id || self.day != other.day {
            return false;
        }
        match (self.bounds(), other.bounds()) {
            (Some((pa, sa, ea)), Some((pb, sb, eb))) if pa == pb => sa < eb && sb < ea,
            _ => false,
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        match self.bounds() {
            None => Err("window mixes a clock time with a named period"),
            Some((false, open, close)) if open >= close => Err("open must be before close"),
            Some((true, open, close)) if open >= close => Err("period window closes before it opens"),
            Some(_) => Ok(()),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}s at {} to {}",
            self.location.name, self.day, self.open, self.close
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub slot: Slot,
    pub booked: bool,
}

impl TimeWindow {
    pub fn unbooked(slot: Slot) -> Self {
        Self { slot, booked: false }
    }
}

// ── Locations ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Threshold {
    Minute,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    Hour,
}

impl Threshold {
    pub fn secs(&self) -> i64 {
        match self {
            Threshold::Minute => 60,
            Threshold::FiveMinutes => 5 * 60,
            Threshold::FifteenMinutes => 15 * 60,
            Threshold::ThirtyMinutes => 30 * 60,
            Threshold::Hour => 60 * 60,
        }
    }

    /// Parse the supervisor-facing label. Unknown labels fall back to `Minute`.
    pub fn from_label(label: &str) -> Self {
        match label {
            "5 Minutes" => Threshold::FiveMinutes,
            "15 Minutes" => Threshold::FifteenMinutes,
            "30 Minutes" => Threshold::ThirtyMinutes,
            "Hour" => Threshold::Hour,
            _ => Threshold::Minute,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rounding {
    Up,
    Down,
    Normally,
}

impl Rounding {
    /// Unknown labels fall back to `Up`.
    pub fn from_label(label: &str) -> Self {
        match label {
            "Down" => Rounding::Down,
            "Normally" => Rounding::Normally,
            _ => Rounding::Up,
        }
    }
}

/// How a location rounds service hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundingPolicy {
    /// Increment session durations are rounded to.
    pub threshold: Threshold,
    pub rounding: Rounding,
    /// Increment clock-in timestamps snap to during corrective rounding.
    pub time_threshold: Threshold,
}

impl Default for RoundingPolicy {
    fn default() -> Self {
        Self {
            threshold: Threshold::Minute,
            rounding: Rounding::Normally,
            time_threshold: Threshold::Minute,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Ulid,
    pub name: String,
    /// Named school periods in bell-schedule order.
    pub periods: Vec<String>,
    /// Weekly operating hours.
    pub hours: Vec<Slot>,
    pub supervisors: Vec<UserId>,
    pub rounding: RoundingPolicy,
}

impl Location {
    pub fn new(id: Ulid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            periods: Vec::new(),
            hours: Vec::new(),
            supervisors: Vec::new(),
            rounding: RoundingPolicy::default(),
        }
    }

    pub fn to_ref(&self) -> LocationRef {
        LocationRef { id: self.id, name: self.name.clone() }
    }

    pub fn is_supervisor(&self, user: UserId) -> bool {
        self.supervisors.contains(&user)
    }

    /// Resolve `"2:45 PM"` or a period label of this location.
    pub fn time_of_day(&self, text: &str) -> Option<TimeOfDay> {
        if let Some(t) = TimeOfDay::parse_clock(text) {
            return Some(t);
        }
        self.period(text.trim())
    }

    fn period(&self, label: &str) -> Option<TimeOfDay> {
        self.periods
            .iter()
            .position(|p| p == label)
            .map(|rank| TimeOfDay::Period { rank: rank as u16, label: label.to_string() })
    }

    /// Re-anchor `slot` to this location: refresh the embedded name and re-rank
    /// its periods against the current period list. `None` if a period label is
    /// no longer defined here.
    pub fn resolve(&self, slot: &Slot) -> Option<Slot> {
        let bound = |t: &TimeOfDay| match t {
            TimeOfDay::Clock(_) => Some(t.clone()),
            TimeOfDay::Period { label, .. } => self.period(label),
        };
        Some(Slot::new(self.to_ref(), slot.day, bound(&slot.open)?, bound(&slot.close)?))
    }

    pub fn slot(&self, day: Day, open: &str, close: &str) -> Option<Slot> {
        Some(Slot::new(
            self.to_ref(),
            day,
            self.time_of_day(open)?,
            self.time_of_day(close)?,
        ))
    }
}

// ── Users ────────────────────────────────────────────────────────

/// Concise user reference embedded in appointments and clock events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    pub name: String,
}

impl UserRef {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserKind {
    Tutor,
    Pupil,
    Supervisor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentKind {
    Free,
    Paid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub grade: Option<String>,
    pub kind: UserKind,
    pub location: Option<Ulid>,
    pub payments: PaymentKind,
}

impl UserProfile {
    pub fn to_ref(&self) -> UserRef {
        UserRef::new(self.id, self.name.clone())
    }
}

/// Rollup fields written by the service-hour aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHours {
    pub seconds_tutored: i64,
    pub seconds_pupiled: i64,
    pub sessions: u32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Date reported when a user has no past appointments.
pub fn sentinel_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2019, 1, 1).unwrap_or_default()
}

impl Default for ServiceHours {
    fn default() -> Self {
        Self {
            seconds_tutored: 0,
            seconds_pupiled: 0,
            sessions: 0,
            start_date: sentinel_date(),
            end_date: sentinel_date(),
        }
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendees {
    pub from: UserRef,
    pub to: UserRef,
}

impl Attendees {
    pub fn contains(&self, user: UserId) -> bool {
        self.from.id == user || self.to.id == user
    }

    pub fn other(&self, user: UserId) -> Option<&UserRef> {
        if self.from.id == user {
            Some(&self.to)
        } else if self.to.id == user {
            Some(&self.from)
        } else {
            None
        }
    }

    pub fn ids(&self) -> [UserId; 2] {
        [self.from.id, self.to.id]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockEvent {
    pub sent_timestamp: Ms,
    pub sent_by: UserRef,
    pub approved_timestamp: Option<Ms>,
    pub approved_by: Option<UserRef>,
}

impl ClockEvent {
    pub fn sent(by: &UserRef, at: Ms) -> Self {
        Self {
            sent_timestamp: at,
            sent_by: by.clone(),
            approved_timestamp: None,
            approved_by: None,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.approved_by.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentState {
    Requested,
    Active,
    Past,
}

impl fmt::Display for AppointmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppointmentState::Requested => "requested",
            AppointmentState::Active => "active",
            AppointmentState::Past => "past",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub attendees: Attendees,
    pub time: Slot,
    pub subject: String,
    pub state: AppointmentState,
    pub clock_in: Option<ClockEvent>,
    pub clock_out: Option<ClockEvent>,
    pub created_at: Ms,
    /// Supervisor who archived or corrected this record outside the normal flow.
    pub override_by: Option<UserRef>,
}

impl Appointment {
    pub fn requested(id: Ulid, attendees: Attendees, time: Slot, subject: String, now: Ms) -> Self {
        Self {
            id,
            attendees,
            time,
            subject,
            state: AppointmentState::Requested,
            clock_in: None,
            clock_out: None,
            created_at: now,
            override_by: None,
        }
    }

    /// `clockOut.sentTimestamp - clockIn.sentTimestamp`, when both exist.
    pub fn duration_ms(&self) -> Option<Ms> {
        match (&self.clock_in, &self.clock_out) {
            (Some(cin), Some(cout)) => Some(cout.sent_timestamp - cin.sent_timestamp),
            _ => None,
        }
    }

    pub fn duration_secs(&self) -> Option<i64> {
        self.duration_ms().map(|ms| ms / 1000)
    }

    pub fn partition(&self) -> Partition {
        match self.state {
            AppointmentState::Past => Partition::Past,
            AppointmentState::Requested | AppointmentState::Active => Partition::Active,
        }
    }
}

/// Per-user appointment collections. Requested and active appointments share the
/// active partition; archived ones live in the past partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partition {
    Active,
    Past,
}

// ── Store records ────────────────────────────────────────────────

/// One document write. A [`Commit`] groups writes that must land together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Write {
    PutLocation(Location),
    PutProfile(UserProfile),
    PutAvailability {
        user: UserId,
        availability: AvailabilityStore,
    },
    PutAppointment {
        user: UserId,
        partition: Partition,
        appointment: Appointment,
    },
    DeleteAppointment {
        user: UserId,
        partition: Partition,
        id: Ulid,
    },
    PutHours {
        user: UserId,
        hours: ServiceHours,
    },
}

impl Write {
    pub fn user(&self) -> Option<UserId> {
        match self {
            Write::PutLocation(_) => None,
            Write::PutProfile(p) => Some(p.id),
            Write::PutAvailability { user, .. }
            | Write::PutAppointment { user, .. }
            | Write::DeleteAppointment { user, .. }
            | Write::PutHours { user, .. } => Some(*user),
        }
    }
}

/// The WAL record format: an all-or-nothing group of writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub writes: Vec<Write>,
}
