//! Recurrence rule evaluation and local-time conversion
//!
//! Everything here is pure. Local wall-clock times are converted with the
//! zone's offset on that specific date, so a 09:00 slot stays at 09:00 local
//! across DST changes while its UTC instant moves.
//!
//! DST edge cases:
//! - a local time that does not exist (spring-forward gap) produces no instant
//!   for that date
//! - a local time that occurs twice (fall-back overlap) maps to the earlier
//!   instant

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::ScheduleError;
use crate::types::{RecurrenceRule, SlotTime};

/// Minimum number of days scanned for candidates
pub const MIN_LOOKAHEAD_DAYS: i64 = 14;

/// Hard stop for candidate scanning, even when `count` is not reached
pub const MAX_LOOKAHEAD_DAYS: i64 = 366;

/// Convert a local date and slot time to UTC, or `None` if it falls in a gap
pub fn local_to_utc(tz: &Tz, date: NaiveDate, time: &SlotTime) -> Option<DateTime<Utc>> {
    let clock = NaiveTime::from_hms_opt(time.hour as u32, time.minute as u32, 0)?;
    tz.from_local_datetime(&date.and_time(clock))
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Local calendar date of an instant
pub fn local_date(tz: &Tz, instant: DateTime<Utc>) -> NaiveDate {
    instant.with_timezone(tz).date_naive()
}

/// UTC bounds `[start, end)` of a local calendar day.
///
/// Handles zones whose DST transition skips local midnight by taking the
/// first valid local instant of the day.
pub fn local_day_bounds(tz: &Tz, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = start_of_day(tz, date);
    let end = date
        .succ_opt()
        .map(|next| start_of_day(tz, next))
        .unwrap_or_else(|| start + Duration::days(1));
    (start, end)
}

fn start_of_day(tz: &Tz, date: NaiveDate) -> DateTime<Utc> {
    // Gaps are at most a few hours; walk forward in 15 minute steps
    for quarter in 0..(24 * 4) {
        let candidate = date.and_time(NaiveTime::MIN) + Duration::minutes(15 * quarter);
        if let Some(local) = tz.from_local_datetime(&candidate).earliest() {
            return local.with_timezone(&Utc);
        }
    }
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// Upcoming UTC instants of `rule` at or after `from`.
///
/// The result is strictly increasing and deduplicated, holds at most `count`
/// entries, and is empty for a rule without local times. Pause and skip flags
/// are not consulted; they are allocation policy.
pub fn next_instants(
    rule: &RecurrenceRule,
    from: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
    rule.validate()?;
    if rule.times.is_empty() || count == 0 {
        return Ok(Vec::new());
    }

    let tz = rule.tz()?;
    let mut times = rule.times.clone();
    times.sort_by_key(|t| (t.hour, t.minute));

    let first_day = local_date(&tz, from);
    let mut instants = Vec::new();

    for offset in 0..MAX_LOOKAHEAD_DAYS {
        if offset >= MIN_LOOKAHEAD_DAYS && instants.len() >= count {
            break;
        }
        let Some(date) = first_day.checked_add_signed(Duration::days(offset)) else {
            break;
        };
        let weekday = date.weekday();
        if !rule.is_active_weekday(weekday) {
            continue;
        }

        for time in times.iter().filter(|t| t.applies_on(weekday)) {
            if let Some(instant) = local_to_utc(&tz, date, time) {
                if instant >= from {
                    instants.push(instant);
                }
            }
        }
    }

    instants.sort();
    instants.dedup();
    instants.truncate(count);
    Ok(instants)
}

/// The first upcoming instant, if any
pub fn next_instant(
    rule: &RecurrenceRule,
    from: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    Ok(next_instants(rule, from, 1)?.into_iter().next())
}
