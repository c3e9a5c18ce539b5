use nom::{branch::alt, bytes::complete::tag_no_case, combinator::value, IResult};

/// Weekday names accepted in the day-of-week cron field
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DayOfWeek {
    Sun,
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl DayOfWeek {
    pub fn parse(input: &str) -> IResult<&str, Self> {
        alt((
            value(Self::Mon, tag_no_case("mon")),
            value(Self::Tue, tag_no_case("tue")),
            value(Self::Wed, tag_no_case("wed")),
            value(Self::Thu, tag_no_case("thu")),
            value(Self::Fri, tag_no_case("fri")),
            value(Self::Sat, tag_no_case("sat")),
            value(Self::Sun, tag_no_case("sun")),
        ))(input)
    }

    /// Cron numbering, Sunday is 0
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// Month names accepted in the month cron field
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Month {
    Jan = 1,
    Feb,
    Mar,
    Apr,
    May,
    Jun,
    Jul,
    Aug,
    Sep,
    Oct,
    Nov,
    Dec,
}

impl Month {
    pub fn parse(input: &str) -> IResult<&str, Self> {
        alt((
            value(Self::Jan, tag_no_case("jan")),
            value(Self::Feb, tag_no_case("feb")),
            value(Self::Mar, tag_no_case("mar")),
            value(Self::Apr, tag_no_case("apr")),
            value(Self::May, tag_no_case("may")),
            value(Self::Jun, tag_no_case("jun")),
            value(Self::Jul, tag_no_case("jul")),
            value(Self::Aug, tag_no_case("aug")),
            value(Self::Sep, tag_no_case("sep")),
            value(Self::Oct, tag_no_case("oct")),
            value(Self::Nov, tag_no_case("nov")),
            value(Self::Dec, tag_no_case("dec")),
        ))(input)
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(DayOfWeek::parse("SUN").unwrap().1.to_u32(), 0);
        assert_eq!(DayOfWeek::parse("fri").unwrap().1.to_u32(), 5);
        assert_eq!(Month::parse("Jan").unwrap().1.to_u32(), 1);
        assert_eq!(Month::parse("dec-").unwrap(), ("-", Month::Dec));
        assert!(Month::parse("foo").is_err());
    }
}
