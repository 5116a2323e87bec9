use crate::domain::models::{Frequency, RecurrenceRule, Task};
use chrono::{DateTime, Datelike, Days, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

pub fn occurs_on(rule: &RecurrenceRule, date: NaiveDate) -> bool {
    if rule.validate().is_err() {
        return false;
    }
    if rule.end_date.is_some_and(|end| date > end) {
        return false;
    }
    match rule.frequency {
        Frequency::None => false,
        Frequency::Daily => true,
        Frequency::Weekly => rule
            .days_of_week
            .contains(&(date.weekday().num_days_from_sunday() as u8)),
        Frequency::Monthly => rule.day_of_month == Some(date.day() as u8),
    }
}

/// One-off tasks are always listed; recurring ones only on their dates.
pub fn is_scheduled_on(task: &Task, date: NaiveDate) -> bool {
    match task.recurrence.as_ref() {
        Some(rule) if rule.frequency != Frequency::None => occurs_on(rule, date),
        _ => true,
    }
}

pub fn occurrences(rule: &RecurrenceRule, start: NaiveDate) -> Occurrences {
    Occurrences {
        rule: rule.clone(),
        cursor: Some(start),
        valid: rule.validate().is_ok() && rule.frequency != Frequency::None,
    }
}

/// Lazy sequence of occurrence dates on or after a start date.
///
/// Cloning yields an independent cursor, so a sequence can be restarted from
/// any point. Without an end date the sequence is unbounded.
#[derive(Debug, Clone)]
pub struct Occurrences {
    rule: RecurrenceRule,
    cursor: Option<NaiveDate>,
    valid: bool,
}

impl Iterator for Occurrences {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.valid {
            return None;
        }
        let from = self.cursor?;
        let found = next_on_or_after(&self.rule, from)
            .filter(|date| self.rule.end_date.is_none_or(|end| *date <= end));
        self.cursor = found.and_then(|date| date.checked_add_days(Days::new(1)));
        found
    }
}

fn next_on_or_after(rule: &RecurrenceRule, from: NaiveDate) -> Option<NaiveDate> {
    match rule.frequency {
        Frequency::None => None,
        Frequency::Daily => Some(from),
        Frequency::Weekly => (0..7u64)
            .filter_map(|offset| from.checked_add_days(Days::new(offset)))
            .find(|date| occurs_on_ignoring_end(rule, *date)),
        Frequency::Monthly => {
            let day = u32::from(rule.day_of_month?);
            let (mut year, mut month) = (from.year(), from.month());
            // Any day 1..=31 lands within at most two consecutive months.
            for _ in 0..13 {
                if let Some(candidate) = NaiveDate::from_ymd_opt(year, month, day) {
                    if candidate >= from {
                        return Some(candidate);
                    }
                }
                if month == 12 {
                    year += 1;
                    month = 1;
                } else {
                    month += 1;
                }
            }
            None
        }
    }
}

fn occurs_on_ignoring_end(rule: &RecurrenceRule, date: NaiveDate) -> bool {
    let mut unbounded = rule.clone();
    unbounded.end_date = None;
    occurs_on(&unbounded, date)
}

/// Resolves an occurrence to an instant in the family time zone. Local times
/// skipped by a DST transition move forward to the first valid minute.
pub fn occurrence_instant(date: NaiveDate, minute_of_day: u16, tz: Tz) -> Option<DateTime<Utc>> {
    let minute_of_day = u32::from(minute_of_day);
    let time = NaiveTime::from_hms_opt(minute_of_day / 60, minute_of_day % 60, 0)?;
    let mut local = date.and_time(time);
    for _ in 0..180 {
        match tz.from_local_datetime(&local) {
            LocalResult::Single(value) => return Some(value.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => return Some(earliest.with_timezone(&Utc)),
            LocalResult::None => local += chrono::Duration::minutes(1),
        }
    }
    None
}
