//! Deadline parsing and calendar arithmetic
//!
//! Deadlines reach the engine as strings in whatever shape the template
//! repository stored them. Everything is reduced to a [`CalendarDate`]: a plain
//! year/month/day with no time zone. When a point in time is needed the date is
//! anchored at noon, so serializing through a zone-aware format can never shift
//! it to a neighbouring day.

use std::fmt;

use chrono::{Duration, Months, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Hour of day every calendar date is anchored at
pub const ANCHOR_HOUR: i64 = 12;

const ISO_FORMAT: &str = "%Y-%m-%d";
const MONTH_NAME_FORMATS: [&str; 2] = ["%B %d, %Y", "%b %d, %Y"];

/// A calendar day without time-of-day or zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalendarDate(NaiveDate);

impl CalendarDate {
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    /// Last day of `year`
    pub fn end_of_year(year: i32) -> Option<Self> {
        Self::from_ymd(year, 12, 31)
    }

    /// The date at the fixed mid-day anchor
    pub fn anchored(&self) -> NaiveDateTime {
        self.0.and_time(NaiveTime::MIN + Duration::hours(ANCHOR_HOUR))
    }

    /// Canonical `yyyy-MM-dd` form
    pub fn to_iso(&self) -> String {
        self.0.format(ISO_FORMAT).to_string()
    }

    /// Calendar month arithmetic with end-of-month clamping.
    ///
    /// The day of month is kept when the target month has it, otherwise the
    /// target month's last day is used: Jan 31 + 1 month is Feb 29 in a leap
    /// year and Feb 28 otherwise, never a day in March.
    pub fn add_months(&self, months: u32) -> Option<Self> {
        self.0.checked_add_months(Months::new(months)).map(Self)
    }

    pub fn add_years(&self, years: u32) -> Option<Self> {
        self.add_months(years.checked_mul(12)?)
    }
}

impl fmt::Display for CalendarDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso())
    }
}

/// Parse a deadline string.
///
/// Accepts ISO `yyyy-MM-dd` (a trailing time such as `T09:30:00Z` is
/// discarded) and falls back to `MM/dd/yyyy`, `M/d/yy`, `yyyy/MM/dd`,
/// `dd.MM.yyyy` and `March 5, 2024`. Returns `None` for empty or unparseable
/// input; callers treat that as "no deadline".
pub fn parse(input: &str) -> Option<CalendarDate> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    parse_iso(trimmed)
        .or_else(|| parse_slashed(trimmed))
        .or_else(|| parse_dotted(trimmed))
        .or_else(|| parse_month_name(trimmed))
}

/// [`parse`] over an optional field
pub fn parse_opt(input: Option<&str>) -> Option<CalendarDate> {
    input.and_then(parse)
}

fn parse_iso(input: &str) -> Option<CalendarDate> {
    let head = input.split(['T', ' ']).next()?;
    if head.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(head, ISO_FORMAT)
        .ok()
        .map(CalendarDate)
}

fn parse_slashed(input: &str) -> Option<CalendarDate> {
    let parts = numeric_parts(input, '/')?;
    let [first, second, third] = parts;
    if first.len() == 4 {
        return CalendarDate::from_ymd(as_year(first)?, as_number(second)?, as_number(third)?);
    }
    CalendarDate::from_ymd(as_year(third)?, as_number(first)?, as_number(second)?)
}

fn parse_dotted(input: &str) -> Option<CalendarDate> {
    let [day, month, year] = numeric_parts(input, '.')?;
    CalendarDate::from_ymd(as_year(year)?, as_number(month)?, as_number(day)?)
}

fn parse_month_name(input: &str) -> Option<CalendarDate> {
    MONTH_NAME_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(input, format).ok())
        .map(CalendarDate)
}

fn numeric_parts(input: &str, separator: char) -> Option<[&str; 3]> {
    let mut parts = input.split(separator);
    let parsed = [parts.next()?, parts.next()?, parts.next()?];
    if parts.next().is_some() {
        return None;
    }
    let all_digits = parsed
        .iter()
        .all(|part| !part.is_empty() && part.len() <= 4 && part.chars().all(|ch| ch.is_ascii_digit()));
    all_digits.then_some(parsed)
}

fn as_number(part: &str) -> Option<u32> {
    part.parse().ok()
}

fn as_year(part: &str) -> Option<i32> {
    let value: i32 = part.parse().ok()?;
    match part.len() {
        2 => Some(2000 + value),
        4 => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> CalendarDate {
        CalendarDate::from_ymd(y, m, d).expect("valid date")
    }

    #[test]
    fn parses_iso_and_drops_time_suffix() {
        assert_eq!(parse("2024-01-15"), Some(date(2024, 1, 15)));
        assert_eq!(parse("2024-01-15T23:59:00Z"), Some(date(2024, 1, 15)));
        assert_eq!(parse("2024-01-15 08:00"), Some(date(2024, 1, 15)));
        assert_eq!(parse("  2024-07-01  "), Some(date(2024, 7, 1)));
    }

    #[test]
    fn parses_locale_fallbacks() {
        assert_eq!(parse("01/15/2024"), Some(date(2024, 1, 15)));
        assert_eq!(parse("1/5/24"), Some(date(2024, 1, 5)));
        assert_eq!(parse("2024/03/09"), Some(date(2024, 3, 9)));
        assert_eq!(parse("09.03.2024"), Some(date(2024, 3, 9)));
        assert_eq!(parse("March 5, 2024"), Some(date(2024, 3, 5)));
        assert_eq!(parse("Mar 5, 2024"), Some(date(2024, 3, 5)));
    }

    #[test]
    fn rejects_garbage_and_empty() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("   "), None);
        assert_eq!(parse("soon"), None);
        assert_eq!(parse("2024-13-01"), None);
        assert_eq!(parse("02/30/2024"), None);
        assert_eq!(parse("1/2/3/4"), None);
        assert_eq!(parse("1/2/123"), None);
        assert_eq!(parse_opt(None), None);
    }

    #[test]
    fn anchors_at_noon() {
        let anchored = date(2024, 3, 31).anchored();
        assert_eq!(anchored.format("%Y-%m-%d %H:%M").to_string(), "2024-03-31 12:00");
    }

    #[test]
    fn add_months_clamps_to_month_end() {
        let jan31 = date(2023, 1, 31);
        assert_eq!(jan31.add_months(1), Some(date(2023, 2, 28)));
        assert_eq!(date(2024, 1, 31).add_months(1), Some(date(2024, 2, 29)));
        assert_eq!(jan31.add_months(3), Some(date(2023, 4, 30)));
        assert_eq!(jan31.add_months(2), Some(date(2023, 3, 31)));
        assert_eq!(date(2024, 2, 29).add_months(12), Some(date(2025, 2, 28)));
        assert_eq!(date(2024, 11, 30).add_months(3), Some(date(2025, 2, 28)));
        assert_eq!(date(2024, 12, 15).add_months(1), Some(date(2025, 1, 15)));
    }

    #[test]
    fn fourteen_months_from_the_thirty_first() {
        let start = date(2024, 1, 31);
        let expected = [
            date(2024, 1, 31),
            date(2024, 2, 29),
            date(2024, 3, 31),
            date(2024, 4, 30),
            date(2024, 5, 31),
            date(2024, 6, 30),
            date(2024, 7, 31),
            date(2024, 8, 31),
            date(2024, 9, 30),
            date(2024, 10, 31),
            date(2024, 11, 30),
            date(2024, 12, 31),
            date(2025, 1, 31),
            date(2025, 2, 28),
        ];
        for (step, want) in (0u32..).zip(expected) {
            assert_eq!(start.add_months(step), Some(want), "step {step}");
        }
        assert_eq!(date(1900, 1, 31).add_months(1), Some(date(1900, 2, 28)));
        assert_eq!(date(2000, 1, 31).add_months(1), Some(date(2000, 2, 29)));
    }

    #[test]
    fn serializes_as_iso_string() {
        let json = serde_json::to_string(&date(2024, 5, 15)).expect("serialize");
        assert_eq!(json, "\"2024-05-15\"");
        let back: CalendarDate = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, date(2024, 5, 15));
    }
}
