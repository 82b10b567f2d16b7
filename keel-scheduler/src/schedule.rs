//! Schedule evaluation: when does this expression fire next?
//!
//! [`SpecSchedule`] holds one bitset per cron field plus the star flags that
//! drive the classic DOM/DOW disjunction rule. [`SpecSchedule::next`]
//! advances field by field on the wall clock of the schedule's timezone and
//! only then resolves the matched wall time onto the zone's absolute
//! timeline, which is what makes daylight-saving transitions behave: times
//! swallowed by a spring-forward gap roll to the first instant after the
//! jump, and a fall-back repetition fires only on its first occurrence.

use std::time::Duration;

use chrono::offset::LocalResult;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// How far `next` searches before declaring an expression unsatisfiable
/// (`0 0 30 2 *` never fires).
const SEARCH_HORIZON_DAYS: i64 = 365 * 5 + 2;

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecSchedule {
    pub(crate) minute: u64,
    pub(crate) hour: u64,
    pub(crate) dom: u64,
    pub(crate) month: u64,
    pub(crate) dow: u64,
    /// Whether the DOM field was a bare `*`.
    pub(crate) star_dom: bool,
    /// Whether the DOW field was a bare `*`.
    pub(crate) star_dow: bool,
    /// Schedule-specific timezone from a `CRON_TZ=` prefix; `None` falls
    /// back to the scheduler default.
    pub(crate) tz: Option<Tz>,
}

fn bit(bits: u64, n: u32) -> bool {
    bits & (1 << n) != 0
}

impl SpecSchedule {
    /// Pin this schedule to a timezone (used for the scheduler default when
    /// the expression carried no `CRON_TZ=` prefix).
    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.tz = Some(tz);
        self
    }

    pub fn timezone(&self) -> Tz {
        self.tz.unwrap_or(chrono_tz::UTC)
    }

    /// The day rule: with a star on either side, both fields must match
    /// (a star matches everything); with both restricted, either may match.
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom_ok = bit(self.dom, date.day());
        let dow_ok = bit(self.dow, date.weekday().num_days_from_sunday());
        if self.star_dom || self.star_dow {
            dom_ok && dow_ok
        } else {
            dom_ok || dow_ok
        }
    }

    /// The least instant strictly after `after` matching this schedule, or
    /// `None` when no match exists within the search horizon.
    pub fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let tz = self.timezone();

        // Work on the wall clock: truncate to the second, step forward, and
        // round up to the next whole minute (5-field schedules fire at :00).
        let mut t = after
            .with_timezone(&tz)
            .naive_local()
            .with_nanosecond(0)?
            + chrono::Duration::seconds(1);
        if t.second() != 0 {
            t += chrono::Duration::seconds(60 - t.second() as i64);
        }
        let limit = t + chrono::Duration::days(SEARCH_HORIZON_DAYS);

        'search: loop {
            if t > limit {
                return None;
            }

            while !bit(self.month, t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                if t > limit {
                    return None;
                }
            }

            while !self.day_matches(t.date()) {
                let month_before = t.month();
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                if t.month() != month_before {
                    continue 'search;
                }
            }

            while !bit(self.hour, t.hour()) {
                let day_before = t.day();
                t = t.with_minute(0)?.with_second(0)? + chrono::Duration::hours(1);
                if t.day() != day_before {
                    continue 'search;
                }
            }

            while !bit(self.minute, t.minute()) {
                let hour_before = t.hour();
                t += chrono::Duration::minutes(1);
                if t.hour() != hour_before {
                    continue 'search;
                }
            }

            // Resolve the matched wall time to an instant.
            match tz.from_local_datetime(&t) {
                LocalResult::Single(local) => {
                    let instant = local.with_timezone(&Utc);
                    if instant > after {
                        return Some(instant);
                    }
                }
                LocalResult::Ambiguous(first, second) => {
                    // Fall-back overlap: take the first occurrence; never
                    // fire again on the repeated wall time.
                    let first = first.with_timezone(&Utc);
                    let second = second.with_timezone(&Utc);
                    if first > after {
                        return Some(first);
                    }
                    if second > after {
                        return Some(second);
                    }
                }
                LocalResult::None => {
                    // Spring-forward gap: the matched wall time does not
                    // exist. Fire at the first instant on the zone's
                    // timeline after the jump.
                    let mut probe = t;
                    for _ in 0..240 {
                        probe += chrono::Duration::minutes(1);
                        let resolved = match tz.from_local_datetime(&probe) {
                            LocalResult::Single(local) => Some(local),
                            LocalResult::Ambiguous(first, _) => Some(first),
                            LocalResult::None => None,
                        };
                        if let Some(local) = resolved {
                            let instant = local.with_timezone(&Utc);
                            if instant > after {
                                return Some(instant);
                            }
                            break;
                        }
                    }
                }
            }

            t += chrono::Duration::minutes(1);
        }
    }
}

/// Fires on a fixed interval, advancing by absolute duration (a DST
/// transition does not stretch or shrink the gap between fires).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantDelaySchedule {
    delay: Duration,
}

impl ConstantDelaySchedule {
    /// `delay` must be positive; the parser rejects `@every 0s`.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        after.checked_add_signed(chrono::Duration::from_std(self.delay).ok()?)
    }
}

/// Either variant of a parsed schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    Spec(SpecSchedule),
    Every(ConstantDelaySchedule),
}

impl Schedule {
    /// The least instant strictly after `after` matching the schedule.
    pub fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Spec(spec) => spec.next(after),
            Schedule::Every(delay) => delay.next(after),
        }
    }

    /// Apply the scheduler's default timezone when the expression did not
    /// pin one itself.
    pub(crate) fn apply_default_timezone(&mut self, tz: Tz) {
        if let Schedule::Spec(spec) = self {
            if spec.tz.is_none() {
                spec.tz = Some(tz);
            }
        }
    }
}
