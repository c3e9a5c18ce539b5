use anyhow::{anyhow, Result};
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::space0;
use nom::combinator::{all_consuming, value};
use nom::sequence::{delimited, separated_pair};
use std::time::Duration;

use super::number;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    pub fn parse(input: &str) -> nom::IResult<&str, Self> {
        // Longer tags first, "ms" must win over "m"
        alt((
            value(Self::Millisecond, tag("ms")),
            value(Self::Second, tag("seconds")),
            value(Self::Second, tag("second")),
            value(Self::Second, tag("s")),
            value(Self::Minute, tag("minutes")),
            value(Self::Minute, tag("minute")),
            value(Self::Minute, tag("m")),
            value(Self::Hour, tag("hours")),
            value(Self::Hour, tag("hour")),
            value(Self::Hour, tag("h")),
            value(Self::Day, tag("days")),
            value(Self::Day, tag("day")),
            value(Self::Day, tag("d")),
        ))(input)
    }

    pub fn to_duration(self, amount: u32) -> Duration {
        let amount = amount as u64;
        match self {
            Self::Millisecond => Duration::from_millis(amount),
            Self::Second => Duration::from_secs(amount),
            Self::Minute => Duration::from_secs(amount * 60),
            Self::Hour => Duration::from_secs(amount * 60 * 60),
            Self::Day => Duration::from_secs(amount * 60 * 60 * 24),
        }
    }
}

/// Parses durations written as `<amount><unit>`, e.g. "30s", "500 ms", "2 minutes"
pub fn parse_duration(input: &str) -> Result<Duration> {
    let amount_unit = separated_pair(number, space0, TimeUnit::parse);
    let result = all_consuming(delimited(space0, amount_unit, space0))(input);

    let (amount, unit) = result
        .map_err(|e| anyhow!("Invalid duration '{}': {}", input, e))?
        .1;

    Ok(unit.to_duration(amount))
}
