//! Five-field cron expressions.
//!
//! Grammar: `minute hour day-of-month month day-of-week`, space
//! separated. Each field accepts `*`, comma lists, `a-b` ranges, and
//! `*/n` steps; months accept JAN..DEC and days of week accept SUN..SAT
//! (with 7 treated as 0 = Sunday). When both day-of-month and
//! day-of-week are restricted, a date matches when either does.

use chrono::{DateTime, Datelike, NaiveDateTime, NaiveTime, Timelike, Utc};

use crate::domain::errors::{CoreError, CoreResult};

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DOW_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Upper bound on the next-firing search, in days (covers leap years
/// and sparse schedules like Feb 29).
const MAX_SEARCH_DAYS: u32 = 4 * 366 + 1;

/// One parsed cron field as a bitmask over its value range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CronField {
    /// True when the field was `*` (unrestricted).
    any: bool,
    mask: u64,
}

impl CronField {
    fn contains(&self, value: u32) -> bool {
        self.any || (self.mask >> value) & 1 == 1
    }
}

/// A parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    /// Parse an expression, normalizing whitespace.
    pub fn parse(expression: &str) -> CoreResult<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CoreError::BadInput(format!(
                "cron expression must have 5 fields, got {}: {expression:?}",
                fields.len()
            )));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59, None)?,
            hour: parse_field(fields[1], 0, 23, None)?,
            day_of_month: parse_field(fields[2], 1, 31, None)?,
            month: parse_field(fields[3], 1, 12, Some((&MONTH_NAMES, 1)))?,
            day_of_week: parse_field(fields[4], 0, 7, Some((&DOW_NAMES, 0))).map(fold_sunday)?,
        })
    }

    /// The smallest firing time strictly after `after`, or `None` when
    /// no date within the search horizon matches.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = (after + chrono::Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        let mut date = start.date_naive();
        let mut floor = Some(start.time());

        for _ in 0..MAX_SEARCH_DAYS {
            if self.month.contains(date.month()) && self.day_matches(date) {
                if let Some(time) = self.first_time_at_or_after(floor) {
                    return Some(NaiveDateTime::new(date, time).and_utc());
                }
            }
            date = date.succ_opt()?;
            floor = None;
        }
        None
    }

    fn day_matches(&self, date: chrono::NaiveDate) -> bool {
        let dom_ok = self.day_of_month.contains(date.day());
        let dow_ok = self
            .day_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (!self.day_of_month.any, !self.day_of_week.any) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    fn first_time_at_or_after(&self, floor: Option<NaiveTime>) -> Option<NaiveTime> {
        let (floor_hour, floor_minute) = match floor {
            Some(t) => (t.hour(), t.minute()),
            None => (0, 0),
        };
        for hour in floor_hour..24 {
            if !self.hour.contains(hour) {
                continue;
            }
            let minute_start = if hour == floor_hour { floor_minute } else { 0 };
            for minute in minute_start..60 {
                if self.minute.contains(minute) {
                    return NaiveTime::from_hms_opt(hour, minute, 0);
                }
            }
        }
        None
    }
}

/// Map 7 to 0 so both encodings of Sunday hit the same bit.
fn fold_sunday(mut field: CronField) -> CronField {
    if (field.mask >> 7) & 1 == 1 {
        field.mask |= 1;
        field.mask &= !(1 << 7);
    }
    field
}

fn parse_field(
    text: &str,
    min: u32,
    max: u32,
    names: Option<(&[&str], u32)>,
) -> CoreResult<CronField> {
    if text == "*" {
        return Ok(CronField { any: true, mask: 0 });
    }

    let mut mask: u64 = 0;
    for item in text.split(',') {
        if item.is_empty() {
            return Err(CoreError::BadInput(format!("empty cron list item in {text:?}")));
        }
        let (range_part, step) = match item.split_once('/') {
            Some((range, step_str)) => {
                let step: u32 = step_str
                    .parse()
                    .map_err(|_| CoreError::BadInput(format!("bad cron step in {item:?}")))?;
                if step == 0 {
                    return Err(CoreError::BadInput(format!("zero cron step in {item:?}")));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            (
                parse_value(a, min, max, names)?,
                parse_value(b, min, max, names)?,
            )
        } else {
            let value = parse_value(range_part, min, max, names)?;
            // A bare value with a step means "from value to max".
            if item.contains('/') {
                (value, max)
            } else {
                (value, value)
            }
        };

        if lo > hi {
            return Err(CoreError::BadInput(format!(
                "inverted cron range {lo}-{hi} in {item:?}"
            )));
        }
        let mut value = lo;
        while value <= hi {
            mask |= 1 << value;
            value += step;
        }
    }

    Ok(CronField { any: false, mask })
}

fn parse_value(
    text: &str,
    min: u32,
    max: u32,
    names: Option<(&[&str], u32)>,
) -> CoreResult<u32> {
    if let Some((names, base)) = names {
        let upper = text.to_uppercase();
        if let Some(index) = names.iter().position(|n| *n == upper) {
            return Ok(base + index as u32);
        }
    }
    let value: u32 = text
        .parse()
        .map_err(|_| CoreError::BadInput(format!("bad cron value {text:?}")))?;
    if value < min || value > max {
        return Err(CoreError::BadInput(format!(
            "cron value {value} out of range {min}-{max}"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn weekday_morning_skips_weekend() {
        let expr = CronExpr::parse("0 9 * * MON-FRI").unwrap();
        // Saturday 2025-01-04 10:00 → Monday 2025-01-06 09:00.
        let next = expr.next_after(at(2025, 1, 4, 10, 0)).unwrap();
        assert_eq!(next, at(2025, 1, 6, 9, 0));
    }

    #[test]
    fn next_is_strictly_after_now() {
        let expr = CronExpr::parse("30 12 * * *").unwrap();
        let next = expr.next_after(at(2025, 3, 1, 12, 30)).unwrap();
        assert_eq!(next, at(2025, 3, 2, 12, 30));
    }

    #[test]
    fn step_and_list_fields() {
        let expr = CronExpr::parse("*/15 * * * *").unwrap();
        assert_eq!(expr.next_after(at(2025, 1, 1, 8, 3)).unwrap(), at(2025, 1, 1, 8, 15));
        assert_eq!(expr.next_after(at(2025, 1, 1, 8, 45)).unwrap(), at(2025, 1, 1, 9, 0));

        let expr = CronExpr::parse("0 6,18 * * *").unwrap();
        assert_eq!(expr.next_after(at(2025, 1, 1, 7, 0)).unwrap(), at(2025, 1, 1, 18, 0));
    }

    #[test]
    fn month_names_and_yearly() {
        let expr = CronExpr::parse("0 0 1 JAN *").unwrap();
        let next = expr.next_after(at(2025, 3, 10, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 1, 1, 0, 0));
    }

    #[test]
    fn sunday_seven_equals_zero() {
        let a = CronExpr::parse("0 8 * * 0").unwrap();
        let b = CronExpr::parse("0 8 * * 7").unwrap();
        assert_eq!(a, b);
        // 2025-01-05 is a Sunday.
        assert_eq!(a.next_after(at(2025, 1, 1, 0, 0)).unwrap(), at(2025, 1, 5, 8, 0));
    }

    #[test]
    fn restricted_dom_and_dow_match_either() {
        // Vixie rule: the 15th OR any Monday.
        let expr = CronExpr::parse("0 0 15 * MON").unwrap();
        // From Jan 10 2025 (Friday): Monday Jan 13 comes before the 15th.
        assert_eq!(expr.next_after(at(2025, 1, 10, 0, 0)).unwrap(), at(2025, 1, 13, 0, 0));
        // From Jan 13 00:00, the 15th (Wednesday) is next.
        assert_eq!(expr.next_after(at(2025, 1, 13, 0, 0)).unwrap(), at(2025, 1, 15, 0, 0));
    }

    #[test]
    fn range_with_step() {
        let expr = CronExpr::parse("0 8-16/4 * * *").unwrap();
        assert_eq!(expr.next_after(at(2025, 1, 1, 9, 0)).unwrap(), at(2025, 1, 1, 12, 0));
        assert_eq!(expr.next_after(at(2025, 1, 1, 16, 0)).unwrap(), at(2025, 1, 2, 8, 0));
    }

    #[test]
    fn whitespace_is_normalized() {
        assert!(CronExpr::parse("  0   9  *  *  1 ").is_ok());
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* 24 * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("x * * * *").is_err());
        assert!(CronExpr::parse("5-2 * * * *").is_err());
        assert!(CronExpr::parse("* * * * MONDAY").is_err());
    }

    #[test]
    fn impossible_schedule_yields_none() {
        // February 31st never exists.
        let expr = CronExpr::parse("0 0 31 FEB *").unwrap();
        assert!(expr.next_after(at(2025, 1, 1, 0, 0)).is_none());
    }
}
