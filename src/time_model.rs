//! Date parsing, leap-year policy, star signs, and birthday-due checks.

use crate::error::Result;
use crate::MonthDay;
use chrono::{Datelike, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::sync::OnceLock;

/// Result of parsing a user-supplied date string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedDate {
    Exact { month: u8, day: u8, year: Option<i32> },
    Ambiguous { options: Vec<(u8, u8)> },
    Invalid { reason: String },
}

fn ddmm_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,2})[/\-](\d{1,2})(?:[/\-](\d{4}))?$").unwrap())
}

/// Parse a date string with ordered strategies: strict `DD/MM(/YYYY)`,
/// then best-effort `DD-MM(-YYYY)`. The optional
/// third (LLM) strategy lives in [`crate::messages`] since it needs a
/// `Completer`; callers fall through to it themselves on `Invalid`.
pub fn parse_date_str(input: &str) -> ParsedDate {
    let trimmed = input.trim();
    let Some(caps) = ddmm_re().captures(trimmed) else {
        return ParsedDate::Invalid {
            reason: format!("could not parse '{trimmed}' as DD/MM or DD/MM/YYYY"),
        };
    };

    let day: u32 = match caps[1].parse() {
        Ok(d) => d,
        Err(_) => {
            return ParsedDate::Invalid {
                reason: "day is not a number".into(),
            }
        }
    };
    let month: u32 = match caps[2].parse() {
        Ok(m) => m,
        Err(_) => {
            return ParsedDate::Invalid {
                reason: "month is not a number".into(),
            }
        }
    };
    let year: Option<i32> = match caps.get(3) {
        Some(m) => match m.as_str().parse() {
            Ok(y) => Some(y),
            Err(_) => {
                return ParsedDate::Invalid {
                    reason: "year is not a number".into(),
                }
            }
        },
        None => None,
    };

    validate_date(day, month, year)
}

fn validate_date(day: u32, month: u32, year: Option<i32>) -> ParsedDate {
    if !(1..=12).contains(&month) {
        return ParsedDate::Invalid {
            reason: format!("month {month} out of range 1..12"),
        };
    }
    if MonthDay::new(month as u8, day as u8).is_none() {
        return ParsedDate::Invalid {
            reason: "invalid date values".into(),
        };
    }
    if let Some(y) = year {
        let current_year = Utc::now().year();
        if y < 1900 || y > current_year {
            return ParsedDate::Invalid {
                reason: format!("year {y} out of range 1900..{current_year}"),
            };
        }
    }
    ParsedDate::Exact {
        month: month as u8,
        day: day as u8,
        year,
    }
}

/// Render a month/day/year back to the canonical `DD/MM` or `DD/MM/YYYY` form.
pub fn format_date(month: u8, day: u8, year: Option<i32>) -> String {
    match year {
        Some(y) => format!("{day:02}/{month:02}/{y}"),
        None => format!("{day:02}/{month:02}"),
    }
}

/// Zodiac sign for a month/day, using the conventional boundary dates.
pub fn star_sign(md: MonthDay) -> &'static str {
    match (md.month, md.day) {
        (1, 20..=31) | (2, 1..=18) => "Aquarius",
        (2, 19..=29) | (3, 1..=20) => "Pisces",
        (3, 21..=31) | (4, 1..=19) => "Aries",
        (4, 20..=30) | (5, 1..=20) => "Taurus",
        (5, 21..=31) | (6, 1..=20) => "Gemini",
        (6, 21..=30) | (7, 1..=22) => "Cancer",
        (7, 23..=31) | (8, 1..=22) => "Leo",
        (8, 23..=31) | (9, 1..=22) => "Virgo",
        (9, 23..=30) | (10, 1..=22) => "Libra",
        (10, 23..=31) | (11, 1..=21) => "Scorpio",
        (11, 22..=30) | (12, 1..=21) => "Sagittarius",
        (12, 22..=31) | (1, 1..=19) => "Capricorn",
        _ => "Capricorn",
    }
}

/// "March 15th" style rendering for message prompts.
pub fn date_in_words(md: MonthDay) -> String {
    let month_name = [
        "January", "February", "March", "April", "May", "June", "July", "August", "September",
        "October", "November", "December",
    ][(md.month - 1) as usize];
    let suffix = match md.day {
        1 | 21 | 31 => "st",
        2 | 22 => "nd",
        3 | 23 => "rd",
        _ => "th",
    };
    format!("{month_name} {}{suffix}", md.day)
}

/// The effective birthday month/day under the Feb-29 non-leap-year policy
///: in a non-leap year, a Feb-29 birthday celebrates on
/// Feb-28.
pub fn effective_celebration_date(record_md: MonthDay, year: i32) -> MonthDay {
    if record_md.is_leap_day() && !is_leap_year(year) {
        MonthDay::new(2, 28).expect("2/28 is always valid")
    } else {
        record_md
    }
}

pub fn is_leap_year(year: i32) -> bool {
    NaiveDate::from_ymd_opt(year, 2, 29).is_some()
}

/// Fleet-wide mode: does `record_md` match the server-local date `today`?
pub fn is_birthday_today_fleet_wide(record_md: MonthDay, today: NaiveDate) -> bool {
    effective_celebration_date(record_md, today.year()) == MonthDay::new(today.month() as u8, today.day() as u8).unwrap()
}

/// Timezone-aware mode: true exactly on the first check after
/// the user's local time has crossed `celebration_hour` on a date whose
/// month/day matches the record.
pub fn has_crossed_celebration_hour(
    tz: Tz,
    record_md: MonthDay,
    celebration_hour: u8,
    now_utc: chrono::DateTime<Utc>,
) -> Option<NaiveDate> {
    let local = tz.from_utc_datetime(&now_utc.naive_utc());
    let local_date = local.date_naive();
    let expected = effective_celebration_date(record_md, local_date.year());
    let matches_date =
        MonthDay::new(local_date.month() as u8, local_date.day() as u8) == Some(expected);
    if matches_date && local.hour() >= celebration_hour as u32 {
        Some(local_date)
    } else {
        None
    }
}

/// Approximate an age in years, given a birth year and a reference date.
pub fn age_in_years(birth_year: i32, reference: NaiveDate) -> i32 {
    reference.year() - birth_year
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| anyhow::anyhow!("invalid IANA timezone: {name}").into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_date_ddmm() {
        match parse_date_str("25/12") {
            ParsedDate::Exact { day, month, year } => {
                assert_eq!((day, month, year), (25, 12, None));
            }
            other => panic!("expected Exact, got {other:?}"),
        }
        assert_eq!(format_date(12, 25, None), "25/12");
    }

    #[test]
    fn extract_date_ddmmyyyy() {
        match parse_date_str("14/7/1990") {
            ParsedDate::Exact { day, month, year } => {
                assert_eq!((day, month, year), (14, 7, Some(1990)));
            }
            other => panic!("expected Exact, got {other:?}"),
        }
        assert_eq!(format_date(7, 14, Some(1990)), "14/07/1990");
    }

    #[test]
    fn rejects_year_out_of_range() {
        let future_year = Utc::now().year() + 1;
        assert!(matches!(
            parse_date_str(&format!("01/01/{future_year}")),
            ParsedDate::Invalid { .. }
        ));
        assert!(matches!(
            parse_date_str("01/01/1899"),
            ParsedDate::Invalid { .. }
        ));
    }

    #[test]
    fn rejects_invalid_day_month_combo() {
        assert!(matches!(parse_date_str("32/01"), ParsedDate::Invalid { .. }));
        assert!(matches!(parse_date_str("01/13"), ParsedDate::Invalid { .. }));
    }

    #[test]
    fn feb_29_fires_on_feb_28_in_non_leap_year() {
        let record = MonthDay::new(2, 29).unwrap();
        assert_eq!(effective_celebration_date(record, 2023), MonthDay::new(2, 28).unwrap());
        assert_eq!(effective_celebration_date(record, 2024), MonthDay::new(2, 29).unwrap());
    }

    #[test]
    fn celebration_hour_crossing_respects_the_user_timezone() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let record = MonthDay::new(7, 4).unwrap();
        // 12:59 UTC on Jul 4 is 08:59 in New York (EDT): not yet.
        let before = "2026-07-04T12:59:00Z".parse::<chrono::DateTime<Utc>>().unwrap();
        assert!(has_crossed_celebration_hour(tz, record, 9, before).is_none());
        // 13:00 UTC is 09:00 EDT: fires, keyed to the user's local date.
        let at = "2026-07-04T13:00:00Z".parse::<chrono::DateTime<Utc>>().unwrap();
        assert_eq!(
            has_crossed_celebration_hour(tz, record, 9, at),
            Some(NaiveDate::from_ymd_opt(2026, 7, 4).unwrap())
        );
        // The wrong date never fires regardless of hour.
        let wrong_day = "2026-07-05T13:00:00Z".parse::<chrono::DateTime<Utc>>().unwrap();
        assert!(has_crossed_celebration_hour(tz, record, 9, wrong_day).is_none());
    }

    #[test]
    fn fleet_wide_matches_effective_date() {
        let record = MonthDay::new(2, 29).unwrap();
        let today = NaiveDate::from_ymd_opt(2023, 2, 28).unwrap();
        assert!(is_birthday_today_fleet_wide(record, today));
        let march1 = NaiveDate::from_ymd_opt(2023, 3, 1).unwrap();
        assert!(!is_birthday_today_fleet_wide(record, march1));
    }
}
