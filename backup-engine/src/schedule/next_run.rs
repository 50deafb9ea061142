//! Next-run computation in local wall time.

use super::{BackupSchedule, Frequency};
use chrono::{DateTime, Datelike, Duration, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};

/// Next run strictly after `after`, in the host's local time zone
pub fn compute_next_run(schedule: &BackupSchedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    compute_next_run_in(schedule, after, &Local)
}

/// Next run strictly after `after` in `tz`. `None` when the schedule will not run again.
pub fn compute_next_run_in<Tz: TimeZone>(
    schedule: &BackupSchedule,
    after: DateTime<Utc>,
    tz: &Tz,
) -> Option<DateTime<Utc>> {
    let time = schedule.time_of_day;
    let today = after.with_timezone(tz).date_naive();
    let later = |date: NaiveDate| resolve(tz, date.and_time(time)).filter(|t| *t > after);

    match schedule.frequency {
        Frequency::Once => {
            if schedule.last_run.is_some() {
                return None;
            }
            match schedule.start_date {
                // A start in the past is due immediately
                Some(date) => resolve(tz, date.and_time(time)),
                None => (0..=1).find_map(|d| later(today + Duration::days(d))),
            }
        }
        Frequency::Daily => (0..=2).find_map(|d| later(today + Duration::days(d))),
        Frequency::Weekly => {
            let weekday = schedule.day_of_week.unwrap_or(Weekday::Mon);
            (0..=7)
                .map(|d| today + Duration::days(d))
                .filter(|date| date.weekday() == weekday)
                .find_map(later)
        }
        Frequency::Monthly => {
            let day = schedule.day_of_month.unwrap_or(1).clamp(1, 31);
            (0..=12)
                .filter_map(|offset| month_day(today.year(), today.month(), offset, day))
                .find_map(later)
        }
        Frequency::Custom => {
            let interval = Duration::minutes(i64::from(schedule.interval_minutes.unwrap_or(60).max(1)));
            let anchor = resolve(tz, today.and_time(time))?;
            if anchor > after {
                return Some(anchor);
            }
            let steps = (after - anchor).num_seconds() / interval.num_seconds() + 1;
            Some(anchor + interval * steps as i32)
        }
    }
}

/// Local wall time to UTC. Times in a DST gap move one hour later; ambiguous
/// times take the earlier instant.
fn resolve<Tz: TimeZone>(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => tz
            .from_local_datetime(&(local + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc)),
    }
}

/// `day` of the month `offset` months after `year`/`month`, clamped to the month's end
fn month_day(year: i32, month: u32, offset: u32, day: u32) -> Option<NaiveDate> {
    let index = (month - 1) + offset;
    let year = year + (index / 12) as i32;
    let month = index % 12 + 1;
    (1..=day).rev().find_map(|d| NaiveDate::from_ymd_opt(year, month, d))
}

/// Parse `HH:MM` or `HH:MM:SS`
pub fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}
