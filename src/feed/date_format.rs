//! Publish-date parsing driven by Unicode LDML date patterns.
//!
//! Feed publishers disagree on how they spell `pubDate`, so each parser
//! variant carries its own pattern (for example `EEE, dd MMM yyyy HH:mm:ss ZZZ`).
//! The pattern is compiled once into a chrono format string plus an optional
//! trailing zone field, which chrono cannot parse by name on its own.
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

/// Errors raised while compiling an LDML pattern.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DateFormatError {
    /// The pattern uses a field letter we do not translate.
    #[error("unsupported date field '{0}' in pattern")]
    UnsupportedField(char),
    /// The time zone field must be the final field of the pattern.
    #[error("time zone field must be the last field of the pattern")]
    ZoneNotLast,
    /// A quoted literal was never closed.
    #[error("unterminated quoted literal in pattern")]
    UnterminatedQuote,
    /// The pattern contains no date fields at all.
    #[error("empty date pattern")]
    Empty,
}

/// How the trailing zone field of a pattern is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZoneStyle {
    /// `Z`, `ZZ`, `ZZZ`: numeric offsets such as `+0000` (plus `GMT`/`UTC`).
    Numeric,
    /// `z`, `zz`, `zzz`: short zone names such as `PDT`, or numeric offsets.
    Named,
}

/// A compiled LDML date pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFormat {
    pattern: String,
    chrono_format: String,
    zone: Option<ZoneStyle>,
}

impl DateFormat {
    /// Compiles `pattern` into a parser.
    pub fn new(pattern: &str) -> Result<Self, DateFormatError> {
        let mut chrono_format = String::new();
        let mut zone = None;
        let mut saw_field = false;
        let chars: Vec<char> = pattern.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];

            if zone.is_some() && !c.is_whitespace() {
                return Err(DateFormatError::ZoneNotLast);
            }

            if c == '\'' {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&q| q == '\'')
                    .ok_or(DateFormatError::UnterminatedQuote)?;
                if end == 0 {
                    // '' is an escaped single quote
                    chrono_format.push('\'');
                } else {
                    for &lit in &chars[i + 1..i + 1 + end] {
                        push_literal(&mut chrono_format, lit);
                    }
                }
                i += end + 2;
                continue;
            }

            if !c.is_ascii_alphabetic() {
                if zone.is_none() {
                    push_literal(&mut chrono_format, c);
                }
                i += 1;
                continue;
            }

            let run = chars[i..].iter().take_while(|&&n| n == c).count();
            i += run;
            saw_field = true;

            let spec = match (c, run) {
                ('E', 1..=3) => "%a",
                ('E', _) => "%A",
                ('d', 1 | 2) => "%d",
                ('M', 1 | 2) => "%m",
                ('M', 3) => "%b",
                ('M', _) => "%B",
                ('y', 2) => "%y",
                ('y', _) => "%Y",
                ('H', 1 | 2) => "%H",
                ('h', 1 | 2) => "%I",
                ('m', 1 | 2) => "%M",
                ('s', 1 | 2) => "%S",
                ('a', _) => "%p",
                ('Z', _) => {
                    zone = Some(ZoneStyle::Numeric);
                    continue;
                }
                ('z', _) => {
                    zone = Some(ZoneStyle::Named);
                    continue;
                }
                (other, _) => return Err(DateFormatError::UnsupportedField(other)),
            };
            chrono_format.push_str(spec);
        }

        if !saw_field {
            return Err(DateFormatError::Empty);
        }

        let chrono_format = if zone.is_some() {
            chrono_format.trim_end().to_string()
        } else {
            chrono_format
        };

        Ok(Self {
            pattern: pattern.to_string(),
            chrono_format,
            zone,
        })
    }

    /// The LDML pattern this format was compiled from.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Parses `input` against the pattern, returning `None` on any mismatch.
    pub fn parse(&self, input: &str) -> Option<DateTime<Utc>> {
        let input = input.trim();

        let Some(style) = self.zone else {
            let naive = NaiveDateTime::parse_from_str(input, &self.chrono_format).ok()?;
            return Some(Utc.from_utc_datetime(&naive));
        };

        let (rest, zone) = input.rsplit_once(char::is_whitespace)?;
        let offset = parse_zone(zone, style)?;
        let naive = NaiveDateTime::parse_from_str(rest.trim_end(), &self.chrono_format).ok()?;
        let local = offset.from_local_datetime(&naive).single()?;
        Some(local.with_timezone(&Utc))
    }
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}

/// Parses an RFC 3339 timestamp, as used by Atom `updated`/`published`.
pub fn parse_rfc3339(input: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(input.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_zone(zone: &str, style: ZoneStyle) -> Option<FixedOffset> {
    let upper = zone.to_ascii_uppercase();

    if let Some(offset) = parse_numeric_offset(&upper) {
        return Some(offset);
    }

    match upper.as_str() {
        "GMT" | "UTC" | "UT" | "Z" => return FixedOffset::east_opt(0),
        _ => {}
    }

    if let Some(rest) = upper
        .strip_prefix("GMT")
        .or_else(|| upper.strip_prefix("UTC"))
    {
        return parse_numeric_offset(rest);
    }

    if style == ZoneStyle::Numeric {
        return None;
    }

    let hours = match upper.as_str() {
        "EST" => -5,
        "EDT" => -4,
        "CST" => -6,
        "CDT" => -5,
        "MST" => -7,
        "MDT" => -6,
        "PST" => -8,
        "PDT" => -7,
        _ => return None,
    };
    FixedOffset::east_opt(hours * 3600)
}

/// Accepts `+hhmm`, `-hh:mm` and `+hh`.
fn parse_numeric_offset(s: &str) -> Option<FixedOffset> {
    let (sign, digits) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const RFC822: &str = "EEE, dd MMM yyyy HH:mm:ss ZZZ";
    const NAMED_ZONE: &str = "EEE, dd MMM yyyy HH:mm:ss zzz";

    #[test]
    fn test_numeric_zone_pattern() {
        let format = DateFormat::new(RFC822).unwrap();
        let dt = format.parse("Tue, 10 Nov 2015 18:10:09 +0000").unwrap();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2015, 11, 10));
        assert_eq!((dt.hour(), dt.minute(), dt.second()), (18, 10, 9));
    }

    #[test]
    fn test_numeric_zone_applies_offset() {
        let format = DateFormat::new(RFC822).unwrap();
        let dt = format.parse("Tue, 10 Nov 2015 18:10:09 -0500").unwrap();
        assert_eq!(dt.hour(), 23);
    }

    #[test]
    fn test_numeric_zone_accepts_gmt() {
        let format = DateFormat::new(RFC822).unwrap();
        assert!(format.parse("Tue, 10 Nov 2015 18:10:09 GMT").is_some());
    }

    #[test]
    fn test_numeric_zone_rejects_named_abbreviation() {
        let format = DateFormat::new(RFC822).unwrap();
        assert!(format.parse("Thu, 05 May 2016 10:00:00 PDT").is_none());
    }

    #[test]
    fn test_named_zone_abbreviation() {
        let format = DateFormat::new(NAMED_ZONE).unwrap();
        let dt = format.parse("Thu, 05 May 2016 10:00:00 PDT").unwrap();
        assert_eq!(dt.hour(), 17);
    }

    #[test]
    fn test_named_zone_gmt_offset() {
        let format = DateFormat::new(NAMED_ZONE).unwrap();
        let dt = format.parse("Thu, 05 May 2016 10:00:00 GMT+02:00").unwrap();
        assert_eq!(dt.hour(), 8);
    }

    #[test]
    fn test_single_digit_day() {
        let format = DateFormat::new(RFC822).unwrap();
        assert!(format.parse("Thu, 5 May 2016 10:00:00 +0000").is_some());
    }

    #[test]
    fn test_garbage_returns_none() {
        let format = DateFormat::new(RFC822).unwrap();
        assert!(format.parse("yesterday").is_none());
        assert!(format.parse("").is_none());
    }

    #[test]
    fn test_pattern_without_zone() {
        let format = DateFormat::new("yyyy-MM-dd HH:mm").unwrap();
        let dt = format.parse("2016-05-05 10:30").unwrap();
        assert_eq!((dt.hour(), dt.minute()), (10, 30));
    }

    #[test]
    fn test_quoted_literal() {
        let format = DateFormat::new("yyyy-MM-dd'T'HH:mm:ss Z").unwrap();
        assert!(format.parse("2016-05-05T10:30:00 +0100").is_some());
    }

    #[test]
    fn test_zone_must_be_last() {
        assert_eq!(
            DateFormat::new("ZZZ yyyy").unwrap_err(),
            DateFormatError::ZoneNotLast
        );
    }

    #[test]
    fn test_unsupported_field() {
        assert_eq!(
            DateFormat::new("yyyy QQQ").unwrap_err(),
            DateFormatError::UnsupportedField('Q')
        );
    }

    #[test]
    fn test_unterminated_quote() {
        assert_eq!(
            DateFormat::new("yyyy 'at").unwrap_err(),
            DateFormatError::UnterminatedQuote
        );
    }

    #[test]
    fn test_pattern_is_preserved() {
        let format = DateFormat::new(NAMED_ZONE).unwrap();
        assert_eq!(format.pattern(), NAMED_ZONE);
    }

    #[test]
    fn test_rfc3339() {
        let dt = parse_rfc3339("2016-05-05T10:00:00+02:00").unwrap();
        assert_eq!(dt.hour(), 8);
        assert!(parse_rfc3339("Thu, 05 May 2016").is_none());
    }
}
