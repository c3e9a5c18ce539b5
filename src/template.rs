use chrono::{DateTime, Datelike, FixedOffset, TimeDelta, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use log::debug;
use nom::bytes::complete::take_while_m_n;
use nom::character::complete::{char, one_of};
use nom::combinator::{all_consuming, map_res};
use nom::sequence::{preceded, tuple};
use nom::IResult;

const DEFAULT_FORMAT: &str = "yyyy-MM-dd HH:mm:ss";

/// Inputs for one resolution pass over a query text
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub job: String,
    pub timezone: Tz,
    pub now: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
}

impl TemplateContext {
    pub fn new(job: impl Into<String>, timezone: Tz, last_run: Option<DateTime<Utc>>) -> Self {
        Self {
            job: job.into(),
            timezone,
            now: Utc::now(),
            last_run,
        }
    }

    fn local(&self, time: DateTime<Utc>) -> DateTime<FixedOffset> {
        time.with_timezone(&self.timezone).fixed_offset()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Literal(&'a str),
    Variable(Token<'a>),
}

/// `{Base}`, `{Base|Format}` or `{Base|±HH:MM:SS|Format}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub base: &'a str,
    pub offset: Option<TimeDelta>,
    pub format: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
enum Resolved {
    Timestamp(DateTime<FixedOffset>),
    Text(String),
    Missing,
}

/// Splits `input` into literal runs and `{...}` tokens.
/// A token ends at the first `}`; `{}` and an unclosed `{` stay literal.
pub fn tokenize(input: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = input;

    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open + 1..].find('}').map(|i| open + 1 + i) else {
            break;
        };

        let content = &rest[open + 1..close];
        if content.is_empty() {
            segments.push(Segment::Literal(&rest[..=close]));
        } else {
            if open > 0 {
                segments.push(Segment::Literal(&rest[..open]));
            }
            segments.push(Segment::Variable(parse_token(content)));
        }
        rest = &rest[close + 1..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    segments
}

pub fn parse_token(content: &str) -> Token<'_> {
    let Some((base, tail)) = content.split_once('|') else {
        return Token {
            base: content,
            offset: None,
            format: None,
        };
    };

    if let Some((offset, format)) = tail.split_once('|') {
        if let Ok((_, offset)) = all_consuming(signed_offset)(offset) {
            if !format.is_empty() {
                return Token {
                    base,
                    offset: Some(offset),
                    format: Some(format),
                };
            }
        }
    }

    Token {
        base,
        offset: None,
        format: Some(tail),
    }
}

fn two_digits(input: &str) -> IResult<&str, i64> {
    map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_digit()), str::parse::<i64>)(input)
}

fn signed_offset(input: &str) -> IResult<&str, TimeDelta> {
    map_res(
        tuple((
            one_of("+-"),
            two_digits,
            preceded(char(':'), two_digits),
            preceded(char(':'), two_digits),
        )),
        |(sign, hours, minutes, seconds)| {
            if minutes >= 60 || seconds >= 60 {
                return Err("offset out of range");
            }
            let delta = TimeDelta::seconds(hours * 3600 + minutes * 60 + seconds);
            Ok(if sign == '-' { -delta } else { delta })
        },
    )(input)
}

/// Replaces every token of `input` with its resolved value
pub fn resolve(input: &str, context: &TemplateContext) -> String {
    let mut output = String::with_capacity(input.len());
    let mut replaced = 0;

    for segment in tokenize(input) {
        match segment {
            Segment::Literal(text) => output.push_str(text),
            Segment::Variable(token) => {
                let value = render(&token, context);
                debug!(
                    "Replaced variable '{}' with '{}' for query '{}'",
                    token.base, value, context.job
                );
                output.push_str(&value);
                replaced += 1;
            }
        }
    }

    if replaced > 0 {
        debug!(
            "Variable replacement completed for query '{}' ({} variables)",
            context.job, replaced
        );
    }
    output
}

fn render(token: &Token, context: &TemplateContext) -> String {
    match lookup(token.base, context) {
        Resolved::Timestamp(time) => {
            let time = match token.offset {
                Some(offset) => time + offset,
                None => time,
            };
            format_timestamp(&time, token.format.unwrap_or(DEFAULT_FORMAT))
        }
        Resolved::Text(text) => text,
        Resolved::Missing => String::new(),
    }
}

fn lookup(base: &str, context: &TemplateContext) -> Resolved {
    match base {
        "DateTimeNow" => Resolved::Timestamp(context.local(context.now)),
        "UtcNow" => Resolved::Timestamp(context.now.fixed_offset()),
        "DateNow" => {
            let now = context.local(context.now);
            let date = now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .and_then(|midnight| {
                    context
                        .timezone
                        .from_local_datetime(&midnight)
                        .earliest()
                        .map(|d| d.fixed_offset())
                })
                .unwrap_or(now);
            Resolved::Timestamp(date)
        }
        "LastRun" => match context.last_run {
            Some(time) => Resolved::Timestamp(context.local(time)),
            None => Resolved::Missing,
        },
        "Guid" => Resolved::Text(uuid::Uuid::new_v4().to_string()),
        "MachineName" => sysinfo::System::host_name().map_or(Resolved::Missing, Resolved::Text),
        _ => match base.strip_prefix("Env:") {
            Some(name) => std::env::var(name).map_or(Resolved::Missing, Resolved::Text),
            None => Resolved::Missing,
        },
    }
}

/// Renders `time` with .NET style custom format specifiers
/// (`yyyy`, `MM`, `dd`, `HH`, `hh`, `mm`, `ss`, `fff`, `tt`, `zzz`, ...).
/// Quoted text and backslash escapes are copied literally.
pub fn format_timestamp(time: &DateTime<FixedOffset>, format: &str) -> String {
    let chars: Vec<char> = format.chars().collect();
    let mut out = String::with_capacity(format.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }

        match c {
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&q| q == c)
                    .map_or(chars.len(), |p| i + 1 + p);
                out.extend(&chars[i + 1..end]);
                i = end + 1;
                continue;
            }
            '\\' | '%' => {
                if c == '\\' {
                    if let Some(&next) = chars.get(i + 1) {
                        out.push(next);
                    }
                    i += 2;
                } else {
                    i += 1;
                }
                continue;
            }
            _ => {}
        }

        match c {
            'y' => match run {
                1 => out.push_str(&(time.year() % 100).to_string()),
                2 => out.push_str(&format!("{:02}", time.year() % 100)),
                n => out.push_str(&format!("{:0width$}", time.year(), width = n)),
            },
            'M' => match run {
                1 => out.push_str(&time.month().to_string()),
                2 => out.push_str(&format!("{:02}", time.month())),
                3 => out.push_str(&time.format("%b").to_string()),
                _ => out.push_str(&time.format("%B").to_string()),
            },
            'd' => match run {
                1 => out.push_str(&time.day().to_string()),
                2 => out.push_str(&format!("{:02}", time.day())),
                3 => out.push_str(&time.format("%a").to_string()),
                _ => out.push_str(&time.format("%A").to_string()),
            },
            'H' => out.push_str(&pad(time.hour(), run)),
            'h' => out.push_str(&pad(time.hour12().1, run)),
            'm' => out.push_str(&pad(time.minute(), run)),
            's' => out.push_str(&pad(time.second(), run)),
            'f' | 'F' => {
                let digits = format!("{:09}", time.nanosecond() % 1_000_000_000);
                let fraction = &digits[..run.min(7)];
                if c == 'F' {
                    out.push_str(fraction.trim_end_matches('0'));
                } else {
                    out.push_str(fraction);
                }
            }
            't' => {
                let pm = time.hour12().0;
                match (run, pm) {
                    (1, true) => out.push('P'),
                    (1, false) => out.push('A'),
                    (_, true) => out.push_str("PM"),
                    (_, false) => out.push_str("AM"),
                }
            }
            'z' => {
                let seconds = time.offset().local_minus_utc();
                let sign = if seconds < 0 { '-' } else { '+' };
                let (hours, minutes) = (seconds.abs() / 3600, seconds.abs() % 3600 / 60);
                match run {
                    1 => out.push_str(&format!("{}{}", sign, hours)),
                    2 => out.push_str(&format!("{}{:02}", sign, hours)),
                    _ => out.push_str(&format!("{}{:02}:{:02}", sign, hours, minutes)),
                }
            }
            _ => {
                for _ in 0..run {
                    out.push(c);
                }
            }
        }
        i += run;
    }

    out
}

fn pad(value: u32, run: usize) -> String {
    if run == 1 {
        value.to_string()
    } else {
        format!("{:02}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TemplateContext {
        TemplateContext {
            job: "orders".to_string(),
            timezone: chrono_tz::Europe::Madrid,
            now: Utc.with_ymd_and_hms(2026, 7, 4, 21, 5, 9).unwrap(),
            last_run: Some(Utc.with_ymd_and_hms(2026, 7, 4, 8, 30, 0).unwrap()),
        }
    }

    #[test]
    fn test_token_shapes() {
        assert_eq!(
            parse_token("LastRun"),
            Token { base: "LastRun", offset: None, format: None }
        );
        assert_eq!(
            parse_token("LastRun|HH:mm"),
            Token { base: "LastRun", offset: None, format: Some("HH:mm") }
        );
        assert_eq!(
            parse_token("LastRun|-01:30:00|HH:mm"),
            Token {
                base: "LastRun",
                offset: Some(-TimeDelta::minutes(90)),
                format: Some("HH:mm")
            }
        );
        // Offset form needs a format after it
        assert_eq!(
            parse_token("LastRun|+01:00:00"),
            Token { base: "LastRun", offset: None, format: Some("+01:00:00") }
        );
        assert_eq!(
            parse_token("UtcNow|+1:00:00|HH"),
            Token { base: "UtcNow", offset: None, format: Some("+1:00:00|HH") }
        );
    }

    #[test]
    fn test_tokenize_keeps_literals() {
        assert_eq!(
            tokenize("a {} b {x"),
            vec![Segment::Literal("a {}"), Segment::Literal(" b {x")]
        );
        let segments = tokenize("WHERE id = '{Guid}';");
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], Segment::Literal("WHERE id = '"));
        assert_eq!(segments[2], Segment::Literal("';"));
    }

    #[test]
    fn test_local_date_format() {
        let ctx = context();
        // 21:05 UTC is 23:05 in Madrid (CEST)
        assert_eq!(resolve("{DateTimeNow|yyyy-MM-dd}", &ctx), "2026-07-04");
        assert_eq!(resolve("{DateTimeNow}", &ctx), "2026-07-04 23:05:09");
        assert_eq!(resolve("{UtcNow|HH:mm:ss zzz}", &ctx), "21:05:09 +00:00");
        assert_eq!(resolve("{DateNow|yyyy-MM-dd HH:mm}", &ctx), "2026-07-04 00:00");
    }

    #[test]
    fn test_last_run_offset() {
        let ctx = context();
        // Stored 08:30 UTC is 10:30 local, plus one hour
        assert_eq!(resolve("{LastRun|+01:00:00|HH:mm}", &ctx), "11:30");
        assert_eq!(resolve("{LastRun|-00:30:00|HH:mm}", &ctx), "10:00");

        let never = TemplateContext { last_run: None, ..context() };
        assert_eq!(resolve("x > '{LastRun|yyyy-MM-dd}'", &never), "x > ''");
    }

    #[test]
    fn test_unknown_and_text_variables() {
        let ctx = context();
        assert_eq!(resolve("[{Nope}]", &ctx), "[]");
        assert_eq!(resolve("[{Env:QUERYPUSH_SURELY_UNSET_VAR}]", &ctx), "[]");
        assert_eq!(resolve("{Guid}", &ctx).len(), 36);
        assert_ne!(resolve("{Guid}", &ctx), resolve("{Guid}", &ctx));

        std::env::set_var("QUERYPUSH_TEMPLATE_TEST", "eu-west");
        // Format is ignored for non timestamp values
        assert_eq!(resolve("{Env:QUERYPUSH_TEMPLATE_TEST|yyyy}", &ctx), "eu-west");
    }

    #[test]
    fn test_format_specifiers() {
        let time = FixedOffset::east_opt(-5 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, 9, 15, 4, 5)
            .unwrap()
            + TimeDelta::milliseconds(120);

        assert_eq!(format_timestamp(&time, "yyyyMMdd"), "20260109");
        assert_eq!(format_timestamp(&time, "d/M/yy"), "9/1/26");
        assert_eq!(format_timestamp(&time, "ddd, dd MMM yyyy"), "Fri, 09 Jan 2026");
        assert_eq!(format_timestamp(&time, "dddd MMMM"), "Friday January");
        assert_eq!(format_timestamp(&time, "h:mm tt"), "3:04 PM");
        assert_eq!(format_timestamp(&time, "HH:mm:ss.fff"), "15:04:05.120");
        assert_eq!(format_timestamp(&time, "ss.FFF"), "05.12");
        assert_eq!(format_timestamp(&time, "zz|zzz"), "-05|-05:00");
        assert_eq!(format_timestamp(&time, "yyyy-MM-ddTHH:mm:ss"), "2026-01-09T15:04:05");
        assert_eq!(format_timestamp(&time, "'day' d \\d"), "day 9 d");
    }
}
