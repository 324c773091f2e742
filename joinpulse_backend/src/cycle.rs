//! Cycle clock: maps wall-clock instants onto the 24h accounting cycle that
//! starts every day at a fixed local boundary time.
//!
//! Nothing else in the crate compares raw times of day; loops ask the clock
//! which cycle is active and when the next one begins.

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Calendar day naming the active cycle. Stored as `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CycleId(NaiveDate);

impl CycleId {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn as_db_string(&self) -> String {
        self.0.format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// Longest DST gap searched when the boundary falls inside one.
const MAX_GAP_MINUTES: i64 = 3 * 60;

#[derive(Debug, Clone, Copy)]
pub struct CycleClock {
    boundary: NaiveTime,
    tz: Tz,
}

impl CycleClock {
    pub fn new(boundary: NaiveTime, tz: Tz) -> Self {
        Self { boundary, tz }
    }

    pub fn boundary(&self) -> NaiveTime {
        self.boundary
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Yesterday's local date while the local time is before the boundary,
    /// today's from the boundary onwards (the boundary itself is inclusive).
    pub fn cycle_id(&self, now: DateTime<Utc>) -> CycleId {
        let local = now.with_timezone(&self.tz);
        let today = local.date_naive();
        if local.time() < self.boundary {
            CycleId(today.pred_opt().unwrap_or(today))
        } else {
            CycleId(today)
        }
    }

    pub fn current(&self) -> CycleId {
        self.cycle_id(Utc::now())
    }

    /// First instant strictly after `now` at which the local clock reads the
    /// boundary time.
    pub fn next_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.with_timezone(&self.tz).date_naive();
        let mut day = today;
        // Two candidates always suffice; the extra one covers a boundary
        // swallowed by a DST transition on the first day.
        for _ in 0..3 {
            let candidate = self.boundary_on(day);
            if candidate > now {
                return candidate;
            }
            day = day.succ_opt().unwrap_or(day);
        }
        now + ChronoDuration::days(1)
    }

    /// Time left until `next_boundary(now)`.
    pub fn until_next_boundary(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.next_boundary(now) - now)
            .to_std()
            .unwrap_or_default()
    }

    fn boundary_on(&self, day: NaiveDate) -> DateTime<Utc> {
        let local = day.and_time(self.boundary);
        match self.tz.from_local_datetime(&local) {
            LocalResult::Single(dt) => dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
            // Spring-forward gap: the cycle already changed at the first
            // valid local time past the boundary, which is the gap's end.
            LocalResult::None => (1..=MAX_GAP_MINUTES)
                .map(|minutes| local + ChronoDuration::minutes(minutes))
                .find_map(|shifted| self.tz.from_local_datetime(&shifted).earliest())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&local)),
        }
    }
}
