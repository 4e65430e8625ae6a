use std::collections::HashMap;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate};
use ulid::Ulid;

use crate::model::*;

/// Round a duration to the policy's increment.
pub fn round_duration(secs: i64, threshold: Threshold, rounding: Rounding) -> i64 {
    let step = threshold.secs();
    let rounded = match rounding {
        Rounding::Up => secs.div_euclid(step) + i64::from(secs.rem_euclid(step) != 0),
        Rounding::Down => secs.div_euclid(step),
        Rounding::Normally => (secs + step / 2).div_euclid(step),
    };
    rounded * step
}

/// Snap a timestamp to the nearest multiple of `threshold`.
pub fn round_timestamp(at: Ms, threshold: Threshold) -> Ms {
    let step = threshold.secs() * 1000;
    (at + step / 2).div_euclid(step) * step
}

/// Rewrite a past appointment's clock times under `policy`: clock-in snaps to the
/// time threshold, clock-out becomes clock-in plus the rounded duration.
/// Returns false if the appointment lacks clock events.
pub fn round_clock_times(appt: &mut Appointment, policy: &RoundingPolicy) -> bool {
    let Some(secs) = appt.duration_secs() else {
        return false;
    };
    let rounded_secs = round_duration(secs, policy.threshold, policy.rounding);
    let (Some(cin), Some(cout)) = (appt.clock_in.as_mut(), appt.clock_out.as_mut()) else {
        return false;
    };
    cin.sent_timestamp = round_timestamp(cin.sent_timestamp, policy.time_threshold);
    cout.sent_timestamp = cin.sent_timestamp + rounded_secs * 1000;
    true
}

/// Running totals over a user's past appointments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub seconds: i64,
    pub sessions: u32,
    pub first_clock_out: Option<Ms>,
    pub last_clock_out: Option<Ms>,
}

impl Tally {
    /// Sum rounded durations. `policies` maps location id to its rounding policy;
    /// unknown locations use the default policy. Appointments without both clock
    /// events are skipped.
    pub fn from_past<'a, I>(appointments: I, policies: &HashMap<Ulid, RoundingPolicy>) -> Self
    where
        I: IntoIterator<Item = &'a Appointment>,
    {
        let mut tally = Tally::default();
        for appt in appointments {
            let (Some(secs), Some(cout)) = (appt.duration_secs(), &appt.clock_out) else {
                continue;
            };
            let policy = policies
                .get(&appt.time.location.id)
                .copied()
                .unwrap_or_default();
            tally.seconds += round_duration(secs, policy.threshold, policy.rounding);
            tally.sessions += 1;
            let at = cout.sent_timestamp;
            tally.first_clock_out = Some(tally.first_clock_out.map_or(at, |f| f.min(at)));
            tally.last_clock_out = Some(tally.last_clock_out.map_or(at, |l| l.max(at)));
        }
        tally
    }

    /// Totals for a user of `kind`. Supervisors attend no sessions of their own
    /// and accrue nothing.
    pub fn into_hours(self, kind: UserKind, offset: FixedOffset) -> ServiceHours {
        if kind == UserKind::Supervisor {
            return ServiceHours::default();
        }
        let mut hours = ServiceHours {
            sessions: self.sessions,
            start_date: self
                .first_clock_out
                .map_or_else(sentinel_date, |ms| local_date(ms, offset)),
            end_date: self
                .last_clock_out
                .map_or_else(sentinel_date, |ms| local_date(ms, offset)),
            ..ServiceHours::default()
        };
        match kind {
            UserKind::Pupil => hours.seconds_pupiled = self.seconds,
            UserKind::Tutor => hours.seconds_tutored = self.seconds,
            UserKind::Supervisor => {}
        }
        hours
    }
}

pub fn local_date(at: Ms, offset: FixedOffset) -> NaiveDate {
    DateTime::from_timestamp_millis(at)
        .map(|utc| utc.with_timezone(&offset).date_naive())
        .unwrap_or_else(sentinel_date)
}

/// `H:MM:SS` with hours padded to two digits; hours keep counting past 24.
pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// `M/D/YYYY`.
pub fn format_date(date: NaiveDate) -> String {
    format!("{}/{}/{}", date.month(), date.day(), date.year())
}
