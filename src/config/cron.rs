use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Datelike, LocalResult, NaiveDate, TimeDelta, TimeZone, Timelike};
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::{all_consuming, map, opt, value};
use nom::multi::separated_list1;
use nom::sequence::{pair, preceded};
use nom::IResult;
use std::fmt;

use super::names::{DayOfWeek, Month};
use super::number;

// "*/5 * * * *", "0 30 9 * * mon-fri", "0 0 1,15 * ?"

/// A parsed 5 or 6 field cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    has_seconds: bool,
    second: CronField,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

/// Set of allowed values for one field, stored as a bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronField {
    mask: u64,
    // Field started with '*' or '?', relevant for the day-of-month/day-of-week rule
    star: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Second,
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    Any,
    Value(u32),
    Range(u32, u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Part {
    element: Element,
    step: Option<u32>,
}

impl FieldKind {
    fn name(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::DayOfMonth => "day of month",
            Self::Month => "month",
            Self::DayOfWeek => "day of week",
        }
    }

    fn bounds(self) -> (u32, u32) {
        match self {
            Self::Second | Self::Minute => (0, 59),
            Self::Hour => (0, 23),
            Self::DayOfMonth => (1, 31),
            Self::Month => (1, 12),
            // 7 is an alias for Sunday
            Self::DayOfWeek => (0, 7),
        }
    }
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let expanded = match expression.trim() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let (has_seconds, second, rest) = match fields.len() {
            5 => (false, "0", &fields[..]),
            6 => (true, fields[0], &fields[1..]),
            n => bail!(
                "Cron expression '{}' has {} fields, expected 5 or 6",
                expression,
                n
            ),
        };

        Ok(Self {
            expression: expression.trim().to_string(),
            has_seconds,
            second: CronField::parse(second, FieldKind::Second)?,
            minute: CronField::parse(rest[0], FieldKind::Minute)?,
            hour: CronField::parse(rest[1], FieldKind::Hour)?,
            day_of_month: CronField::parse(rest[2], FieldKind::DayOfMonth)?,
            month: CronField::parse(rest[3], FieldKind::Month)?,
            day_of_week: CronField::parse(rest[4], FieldKind::DayOfWeek)?,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next occurrence strictly after `after`, evaluated in the timezone of `after`.
    /// Local times skipped by a DST transition never match.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let start = after.naive_local().with_nanosecond(0)?;
        let mut t = if self.has_seconds {
            start + TimeDelta::seconds(1)
        } else {
            start.with_second(0)? + TimeDelta::minutes(1)
        };
        // Feb 29 patterns may need to skip several years
        let year_limit = start.year() + 8;

        while t.year() <= year_limit {
            if !self.month.contains(t.month()) {
                t = first_of_next_month(t.date())?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = match self.hour.next_from(t.hour() + 1, 23) {
                    Some(hour) => t.date().and_hms_opt(hour, 0, 0)?,
                    None => t.date().succ_opt()?.and_hms_opt(0, 0, 0)?,
                };
                continue;
            }
            if !self.minute.contains(t.minute()) {
                t = match self.minute.next_from(t.minute() + 1, 59) {
                    Some(minute) => t.date().and_hms_opt(t.hour(), minute, 0)?,
                    None => t.date().and_hms_opt(t.hour(), 0, 0)? + TimeDelta::hours(1),
                };
                continue;
            }
            if !self.second.contains(t.second()) {
                t = match self.second.next_from(t.second() + 1, 59) {
                    Some(second) => t.with_second(second)?,
                    None => t.with_second(0)? + TimeDelta::minutes(1),
                };
                continue;
            }

            match tz.from_local_datetime(&t) {
                LocalResult::Single(found) | LocalResult::Ambiguous(found, _) if found > *after => {
                    return Some(found);
                }
                _ => {
                    t += if self.has_seconds {
                        TimeDelta::seconds(1)
                    } else {
                        TimeDelta::minutes(1)
                    };
                }
            }
        }

        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.contains(date.day());
        let dow = self.day_of_week.contains(date.weekday().num_days_from_sunday());

        // Classic cron rule: when both day fields are restricted, either may match
        if self.day_of_month.star || self.day_of_week.star {
            dom && dow
        } else {
            dom || dow
        }
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl CronField {
    fn parse(input: &str, kind: FieldKind) -> Result<Self> {
        let (_, parts) = all_consuming(separated_list1(tag(","), part(kind)))(input)
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("Malformed {} field '{}'", kind.name(), input))?;

        let (min, max) = kind.bounds();
        let mut mask = 0u64;

        for part in &parts {
            let (start, end) = match part.element {
                Element::Any => (min, max),
                Element::Value(v) if part.step.is_some() => (v, max),
                Element::Value(v) => (v, v),
                Element::Range(a, b) => (a, b),
            };
            if start < min || end > max {
                bail!("Value out of range in {} field '{}' (allowed {}-{})", kind.name(), input, min, max);
            }
            if start > end {
                bail!("Inverted range in {} field '{}'", kind.name(), input);
            }
            let step = part.step.unwrap_or(1);
            if step == 0 {
                bail!("Step of zero in {} field '{}'", kind.name(), input);
            }
            for value in (start..=end).step_by(step as usize) {
                mask |= 1 << value;
            }
        }

        if kind == FieldKind::DayOfWeek && mask & (1 << 7) != 0 {
            mask = (mask & !(1 << 7)) | 1;
        }

        Ok(Self {
            mask,
            star: parts[0].element == Element::Any,
        })
    }

    fn contains(&self, value: u32) -> bool {
        value < 64 && self.mask & (1 << value) != 0
    }

    fn next_from(&self, from: u32, max: u32) -> Option<u32> {
        (from..=max).find(|v| self.contains(*v))
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn atom<'a>(kind: FieldKind) -> impl FnMut(&'a str) -> IResult<&'a str, u32> {
    move |i| match kind {
        FieldKind::Month => alt((map(Month::parse, Month::to_u32), number))(i),
        FieldKind::DayOfWeek => alt((map(DayOfWeek::parse, DayOfWeek::to_u32), number))(i),
        _ => number(i),
    }
}

fn wildcard<'a>(kind: FieldKind) -> impl FnMut(&'a str) -> IResult<&'a str, Element> {
    move |i| match kind {
        FieldKind::DayOfMonth | FieldKind::DayOfWeek => {
            value(Element::Any, alt((tag("*"), tag("?"))))(i)
        }
        _ => value(Element::Any, tag("*"))(i),
    }
}

fn element<'a>(kind: FieldKind) -> impl FnMut(&'a str) -> IResult<&'a str, Element> {
    alt((
        wildcard(kind),
        map(
            pair(atom(kind), opt(preceded(tag("-"), atom(kind)))),
            |(a, b)| match b {
                Some(b) => Element::Range(a, b),
                None => Element::Value(a),
            },
        ),
    ))
}

fn part<'a>(kind: FieldKind) -> impl FnMut(&'a str) -> IResult<&'a str, Part> {
    map(
        pair(element(kind), opt(preceded(tag("/"), number))),
        |(element, step)| Part { element, step },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use chrono_tz::Europe::Berlin;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn next(expr: &str, after: &str) -> DateTime<Utc> {
        CronSchedule::parse(expr).unwrap().next_after(&utc(after)).unwrap()
    }

    #[test]
    fn test_every_five_minutes() {
        assert_eq!(next("*/5 * * * *", "2026-01-01T10:02:30Z"), utc("2026-01-01T10:05:00Z"));
        // Strictly after a boundary
        assert_eq!(next("*/5 * * * *", "2026-01-01T10:05:00Z"), utc("2026-01-01T10:10:00Z"));
        assert_eq!(next("*/5 * * * *", "2026-01-01T23:59:00Z"), utc("2026-01-02T00:00:00Z"));
    }

    #[test]
    fn test_seconds_field() {
        assert_eq!(next("*/10 * * * * *", "2026-01-01T10:00:05Z"), utc("2026-01-01T10:00:10Z"));
        assert_eq!(next("30 0 12 * * *", "2026-01-01T12:00:30Z"), utc("2026-01-02T12:00:30Z"));
    }

    #[test]
    fn test_names_ranges_and_lists() {
        // 2026-01-03 is a Saturday
        assert_eq!(next("0 9 * * mon-fri", "2026-01-03T08:00:00Z"), utc("2026-01-05T09:00:00Z"));
        assert_eq!(next("0 0 1 jan *", "2026-03-01T00:00:00Z"), utc("2027-01-01T00:00:00Z"));
        assert_eq!(next("15,45 8-9 * * *", "2026-01-01T08:20:00Z"), utc("2026-01-01T08:45:00Z"));
        assert_eq!(next("0 0 * * 7", "2026-01-01T00:00:00Z"), utc("2026-01-04T00:00:00Z"));
        assert_eq!(next("@daily", "2026-01-01T00:00:00Z"), utc("2026-01-02T00:00:00Z"));
    }

    #[test]
    fn test_day_of_month_or_day_of_week() {
        // Either the 13th or a Friday; 2026-01-02 is a Friday
        assert_eq!(next("0 0 13 * fri", "2026-01-01T00:00:00Z"), utc("2026-01-02T00:00:00Z"));
        assert_eq!(next("0 0 13 * fri", "2026-01-09T00:00:00Z"), utc("2026-01-13T00:00:00Z"));
    }

    #[test]
    fn test_leap_day() {
        assert_eq!(next("0 0 29 2 *", "2026-01-01T00:00:00Z"), utc("2028-02-29T00:00:00Z"));
    }

    #[test]
    fn test_dst_gap_is_skipped() {
        // Clocks jump from 02:00 to 03:00 on 2026-03-29 in Berlin
        let schedule = CronSchedule::parse("30 2 * * *").unwrap();
        let after = Berlin.with_ymd_and_hms(2026, 3, 29, 0, 0, 0).unwrap();
        let found = schedule.next_after(&after).unwrap();
        assert_eq!(found, Berlin.with_ymd_and_hms(2026, 3, 30, 2, 30, 0).unwrap());
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("* * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("5-1 * * * *").is_err());
        assert!(CronSchedule::parse("* * * * * * *").is_err());
        assert!(CronSchedule::parse("? * * * *").is_err());
        assert!(CronSchedule::parse("* * * foo *").is_err());
    }

    #[test]
    fn test_impossible_date_has_no_occurrence() {
        let schedule = CronSchedule::parse("0 0 31 2 *").unwrap();
        assert!(schedule.next_after(&utc("2026-01-01T00:00:00Z")).is_none());
    }
}
