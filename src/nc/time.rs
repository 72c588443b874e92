//! Encoding and decoding of CF time coordinates ("days since ...") under
//! the calendars climate models actually run on.
//!
//! Model output uses real (proleptic Gregorian) calendars as well as
//! fixed-length 365-day and 360-day calendars; date arithmetic in the fixed
//! calendars cannot go through ordinary datetime math, so the conversions
//! are done per calendar here.

use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeDelta, Timelike};

use super::NcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Calendar {
    Standard,
    NoLeap,
    Day360,
}

impl FromStr for Calendar {
    type Err = NcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" | "gregorian" | "proleptic_gregorian" => Ok(Self::Standard),
            "noleap" | "365_day" => Ok(Self::NoLeap),
            "360_day" => Ok(Self::Day360),
            _ => Err(NcError::UnsupportedCalendar(s.to_string())),
        }
    }
}

/// Cumulative days at the start of each month in a 365-day year.
const NOLEAP_MONTH_STARTS: [i64; 13] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334, 365];

/// How a file's time variable maps numbers to dates: a reference datetime,
/// a unit, and a calendar.
#[derive(Debug, Clone)]
pub struct TimeEncoding {
    pub reference: NaiveDateTime,
    pub calendar: Calendar,
    units_per_day: f64,
}

impl TimeEncoding {
    /// Parse a CF `units` string such as `days since 1950-01-01 00:00:00`,
    /// with the calendar taken from the time variable's `calendar` attribute
    /// (`standard` when absent).
    pub fn parse(units: &str, calendar: Option<&str>) -> Result<Self, NcError> {
        let calendar = match calendar {
            Some(name) => name.parse()?,
            None => Calendar::Standard,
        };

        let mut parts = units.splitn(3, ' ');
        let unit_name = parts.next().unwrap_or_default();
        let since = parts.next().unwrap_or_default();
        let reference_str = parts.next().unwrap_or_default().trim();
        if since != "since" || reference_str.is_empty() {
            return Err(NcError::BadTimeUnits(units.to_string()));
        }

        let units_per_day = match unit_name {
            "day" | "days" | "d" => 1.0,
            "hour" | "hours" | "h" | "hr" | "hrs" => 24.0,
            "minute" | "minutes" | "min" | "mins" => 1440.0,
            "second" | "seconds" | "s" | "sec" | "secs" => 86400.0,
            _ => return Err(NcError::BadTimeUnits(units.to_string())),
        };

        let reference = parse_reference_datetime(reference_str)
            .ok_or_else(|| NcError::BadTimeUnits(units.to_string()))?;

        Ok(Self {
            reference,
            calendar,
            units_per_day,
        })
    }

    /// The date a time-coordinate value refers to.
    pub fn decode(&self, value: f64) -> NaiveDateTime {
        let days = value / self.units_per_day;
        match self.calendar {
            Calendar::Standard => {
                self.reference + TimeDelta::seconds((days * 86400.0).round() as i64)
            }
            Calendar::NoLeap => fixed_calendar_add(self.reference, days.round() as i64, 365),
            Calendar::Day360 => fixed_calendar_add(self.reference, days.round() as i64, 360),
        }
    }

    /// Length, in days, of an interval between two raw coordinate values.
    pub fn value_delta_days(&self, delta: f64) -> f64 {
        delta / self.units_per_day
    }

    /// The time-coordinate value encoding a date.
    pub fn encode(&self, t: NaiveDateTime) -> f64 {
        let days = match self.calendar {
            Calendar::Standard => (t - self.reference).num_seconds() as f64 / 86400.0,
            Calendar::NoLeap => (fixed_day_number(t, 365) - fixed_day_number(self.reference, 365))
                as f64,
            Calendar::Day360 => (fixed_day_number(t, 360) - fixed_day_number(self.reference, 360))
                as f64,
        };
        days * self.units_per_day
    }
}

fn parse_reference_datetime(s: &str) -> Option<NaiveDateTime> {
    // Strip a trailing UTC marker; model files rarely carry real offsets.
    let s = s
        .trim_end_matches("UTC")
        .trim_end_matches('Z')
        .trim_end_matches("+00:00")
        .trim();
    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, format) {
            return Some(t);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Days from year 0 to the given date in a fixed-length calendar.
fn fixed_day_number(t: NaiveDateTime, days_per_year: i64) -> i64 {
    let day_of_year = match days_per_year {
        360 => (t.month0() as i64) * 30 + (t.day0() as i64).min(29),
        _ => {
            let mut day0 = t.day0() as i64;
            if t.month0() == 1 {
                // Feb 29 has no 365-day-calendar equivalent
                day0 = day0.min(27);
            }
            NOLEAP_MONTH_STARTS[t.month0() as usize] + day0
        }
    };
    t.year() as i64 * days_per_year + day_of_year
}

/// Add whole days to a date in a fixed-length calendar.
fn fixed_calendar_add(start: NaiveDateTime, days: i64, days_per_year: i64) -> NaiveDateTime {
    let total = fixed_day_number(start, days_per_year) + days;
    let year = total.div_euclid(days_per_year);
    let day_of_year = total.rem_euclid(days_per_year);

    let (month0, day0) = match days_per_year {
        360 => (day_of_year / 30, day_of_year % 30),
        _ => {
            let month0 = NOLEAP_MONTH_STARTS
                .iter()
                .rposition(|start| *start <= day_of_year)
                .unwrap_or(0)
                .min(11);
            (month0 as i64, day_of_year - NOLEAP_MONTH_STARTS[month0.min(11)])
        }
    };

    // Days 29 and 30 of a 360-day February have no Gregorian equivalent;
    // clamp onto the last real day.
    let date = NaiveDate::from_ymd_opt(year as i32, month0 as u32 + 1, day0 as u32 + 1)
        .or_else(|| NaiveDate::from_ymd_opt(year as i32, month0 as u32 + 1, 28))
        .expect("every month has at least 28 days");
    date.and_hms_opt(start.hour(), start.minute(), start.second())
        .expect("time of day carried over from a valid datetime")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(year: i32, month: u32, day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(year, month, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_units() {
        let enc = TimeEncoding::parse("days since 1950-01-01 00:00:00", Some("standard")).unwrap();
        assert_eq!(enc.reference, dt(1950, 1, 1));
        assert_eq!(enc.calendar, Calendar::Standard);

        let enc = TimeEncoding::parse("hours since 2000-01-01", None).unwrap();
        assert_eq!(enc.decode(48.0), dt(2000, 1, 3));

        assert!(TimeEncoding::parse("fortnights since 1950-01-01", None).is_err());
        assert!(TimeEncoding::parse("days after 1950-01-01", None).is_err());
    }

    #[test]
    fn test_standard_round_trip() {
        let enc = TimeEncoding::parse("days since 1950-01-01", Some("gregorian")).unwrap();
        let t = dt(1976, 7, 2);
        assert_eq!(enc.decode(enc.encode(t)), t);
        // 1950 is not a leap year; 1952 is.
        assert_eq!(enc.encode(dt(1950, 3, 1)), 59.0);
        assert_eq!(enc.encode(dt(1951, 1, 1)), 365.0);
        assert_eq!(enc.encode(dt(1953, 1, 1)), 365.0 * 3.0 + 1.0);
    }

    #[test]
    fn test_noleap_round_trip() {
        let enc = TimeEncoding::parse("days since 1950-01-01", Some("365_day")).unwrap();
        assert_eq!(enc.encode(dt(1951, 1, 1)), 365.0);
        assert_eq!(enc.encode(dt(1953, 1, 1)), 365.0 * 3.0);
        assert_eq!(enc.decode(365.0 * 3.0), dt(1953, 1, 1));
        let t = dt(1976, 7, 2);
        assert_eq!(enc.decode(enc.encode(t)), t);
    }

    #[test]
    fn test_360_day_round_trip() {
        let enc = TimeEncoding::parse("days since 1950-01-01", Some("360_day")).unwrap();
        assert_eq!(enc.encode(dt(1951, 1, 1)), 360.0);
        assert_eq!(enc.encode(dt(1950, 2, 1)), 30.0);
        assert_eq!(enc.decode(360.0), dt(1951, 1, 1));
        let t = dt(1990, 12, 30);
        assert_eq!(enc.decode(enc.encode(t)), t);
    }

    #[test]
    fn test_hours_scaling() {
        let enc = TimeEncoding::parse("hours since 1950-01-01 00:00:00", None).unwrap();
        assert_eq!(enc.encode(dt(1950, 1, 2)), 24.0);
        assert_eq!(enc.decode(36.0), dt(1950, 1, 2).with_hour(12).unwrap());
    }

    #[test]
    fn test_seconds_scaling() {
        use approx::assert_relative_eq;

        let enc = TimeEncoding::parse("seconds since 1950-01-01", None).unwrap();
        assert_relative_eq!(enc.encode(dt(1950, 1, 2)), 86400.0);
        assert_relative_eq!(enc.value_delta_days(43200.0), 0.5);
    }
}
