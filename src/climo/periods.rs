//! Standard climatological averaging periods.

use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;

/// The standard 30-year (and 6-year GCM spinoff) periods climatologies are
/// computed over, keyed by their conventional short code.
///
/// Periods end on 30 December rather than 31 December so that the same date
/// range is selectable from 360-day-calendar model output.
pub fn standard_climo_periods() -> IndexMap<&'static str, (NaiveDateTime, NaiveDateTime)> {
    IndexMap::from([
        ("6190", period(1961, 1990)),
        ("7100", period(1971, 2000)),
        ("8110", period(1981, 2010)),
        ("2020", period(2010, 2039)),
        ("2050", period(2040, 2069)),
        ("2080", period(2070, 2099)),
    ])
}

fn period(start_year: i32, end_year: i32) -> (NaiveDateTime, NaiveDateTime) {
    (
        NaiveDate::from_ymd_opt(start_year, 1, 1)
            .expect("Jan 1 exists in every year")
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time"),
        NaiveDate::from_ymd_opt(end_year, 12, 30)
            .expect("Dec 30 exists in every year")
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_period_codes_and_spans() {
        let periods = standard_climo_periods();
        assert_eq!(periods.len(), 6);
        let (start, end) = periods["6190"];
        assert_eq!((start.year(), start.month(), start.day()), (1961, 1, 1));
        assert_eq!((end.year(), end.month(), end.day()), (1990, 12, 30));
        // 30-year spans throughout
        for (_, (start, end)) in periods.iter() {
            assert_eq!(end.year() - start.year(), 29);
        }
    }
}
