//! Frequency codes and CF climatological time values for climatology files.
//!
//! A climatology file advertises which averaging intervals it contains, and
//! which statistic was formed, through its `frequency` attribute: one or
//! more of `m`/`s`/`a` (monthly, seasonal, annual), then `Clim`, then `Mean`
//! or `SD` (bare `Clim` codes occur in older files). A file holding all
//! three interval sets of multi-year means is `msaClimMean`.

use chrono::{Datelike, NaiveDate, NaiveDateTime};

use super::plan::ClimoStat;
use super::resolution::TimeResolution;

/// Frequency attribute value for a file containing the given intervals.
///
/// `intervals` must be a subset of the output resolutions; they are encoded
/// in canonical monthly/seasonal/annual order regardless of input order.
pub fn frequency_code(intervals: &[TimeResolution], stat: Option<ClimoStat>) -> String {
    let prefix: String = TimeResolution::OUTPUTS
        .iter()
        .filter(|res| intervals.contains(res))
        .filter_map(|res| res.frequency_char())
        .collect();
    let suffix = stat.map(|s| s.frequency_suffix()).unwrap_or_default();
    format!("{prefix}Clim{suffix}")
}

/// Decode a `frequency` attribute value back into its interval set and
/// statistic. Returns `None` for strings that are not climatology codes.
pub fn parse_frequency(code: &str) -> Option<(Vec<TimeResolution>, Option<ClimoStat>)> {
    let (prefix, suffix) = code.split_once("Clim")?;

    let stat = match suffix {
        "" => None,
        "Mean" => Some(ClimoStat::Mean),
        "SD" => Some(ClimoStat::StdDev),
        _ => return None,
    };

    let mut intervals = Vec::new();
    let mut expected = TimeResolution::OUTPUTS.iter();
    for c in prefix.chars() {
        // Interval characters must appear in m, s, a order, each at most once.
        let res = expected.find(|res| res.frequency_char() == Some(c))?;
        intervals.push(*res);
    }
    if intervals.is_empty() {
        return None;
    }
    Some((intervals, stat))
}

/// Number of time steps a file with the given interval set contains.
pub fn num_time_steps(intervals: &[TimeResolution]) -> usize {
    intervals
        .iter()
        .filter_map(|res| res.climo_steps())
        .sum()
}

/// Climatological time coordinates and bounds for a multi-year statistic
/// over `t_start..t_end`, per the CF conventions' climatological-statistics
/// rules: mid-month (day 15) values for monthly statistics, day 16 of the
/// season's center month for seasonal, July 2 for annual, with bounds
/// spanning the full multi-year period of each interval.
///
/// The returned values are ordered with all monthly values first, then
/// seasonal (DJF, MAM, JJA, SON), then annual, matching the time-step order
/// of merged climatology files.
pub fn climo_time_values(
    t_start: NaiveDateTime,
    t_end: NaiveDateTime,
    intervals: &[TimeResolution],
) -> (Vec<NaiveDateTime>, Vec<[NaiveDateTime; 2]>) {
    // All time values sit in the middle year of the period.
    let mid_year = (t_start + (t_end - t_start) / 2).year() + 1;

    let mut times = Vec::new();
    let mut bounds = Vec::new();

    if intervals.contains(&TimeResolution::Monthly) {
        for month in 1..=12 {
            times.push(datetime(mid_year, month, 15));
            bounds.push([
                datetime(t_start.year(), month, 1),
                add_months(datetime(t_end.year(), month, 1), 1),
            ]);
        }
    }

    if intervals.contains(&TimeResolution::Seasonal) {
        // Center months of DJF, MAM, JJA, SON.
        for month in [1, 4, 7, 10] {
            times.push(datetime(mid_year, month, 16));
            bounds.push([
                add_months(datetime(t_start.year(), month, 1), -1),
                add_months(datetime(t_end.year(), month, 1), 2),
            ]);
        }
    }

    if intervals.contains(&TimeResolution::Yearly) {
        times.push(datetime(mid_year, 7, 2));
        bounds.push([
            datetime(t_start.year(), 1, 1),
            datetime(t_end.year() + 1, 1, 1),
        ]);
    }

    (times, bounds)
}

fn datetime(year: i32, month: u32, day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .expect("climatological time values use fixed, always-valid days of month")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
}

/// Shift a date by whole months, keeping the day of month (always 1 here).
fn add_months(t: NaiveDateTime, months: i32) -> NaiveDateTime {
    let zero_based = t.year() * 12 + t.month() as i32 - 1 + months;
    let year = zero_based.div_euclid(12);
    let month = zero_based.rem_euclid(12) as u32 + 1;
    datetime(year, month, t.day())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use TimeResolution::*;

    #[rstest]
    #[case(&[Monthly], Some(ClimoStat::Mean), "mClimMean")]
    #[case(&[Seasonal], Some(ClimoStat::StdDev), "sClimSD")]
    #[case(&[Yearly], None, "aClim")]
    #[case(&[Seasonal, Yearly], Some(ClimoStat::Mean), "saClimMean")]
    #[case(&[Monthly, Seasonal, Yearly], Some(ClimoStat::StdDev), "msaClimSD")]
    // Canonical ordering is imposed on unordered input
    #[case(&[Yearly, Monthly, Seasonal], None, "msaClim")]
    fn test_frequency_code(
        #[case] intervals: &[TimeResolution],
        #[case] stat: Option<ClimoStat>,
        #[case] expected: &str,
    ) {
        assert_eq!(frequency_code(intervals, stat), expected);
    }

    #[rstest]
    #[case("mClimMean", &[Monthly], Some(ClimoStat::Mean))]
    #[case("saClimSD", &[Seasonal, Yearly], Some(ClimoStat::StdDev))]
    #[case("msaClim", &[Monthly, Seasonal, Yearly], None)]
    fn test_parse_frequency(
        #[case] code: &str,
        #[case] intervals: &[TimeResolution],
        #[case] stat: Option<ClimoStat>,
    ) {
        assert_eq!(parse_frequency(code), Some((intervals.to_vec(), stat)));
    }

    #[rstest]
    #[case("day")]
    #[case("Clim")]
    #[case("xClimMean")]
    #[case("amClim")] // out of canonical order
    #[case("mClimAvg")]
    fn test_parse_frequency_rejects(#[case] code: &str) {
        assert_eq!(parse_frequency(code), None);
    }

    #[test]
    fn test_num_time_steps() {
        assert_eq!(num_time_steps(&[Monthly]), 12);
        assert_eq!(num_time_steps(&[Seasonal, Yearly]), 5);
        assert_eq!(num_time_steps(&[Monthly, Seasonal, Yearly]), 17);
    }

    #[test]
    fn test_climo_time_values_merged() {
        let t_start = datetime(1961, 1, 1);
        let t_end = datetime(1990, 12, 30);
        let (times, bounds) = climo_time_values(t_start, t_end, &[Monthly, Seasonal, Yearly]);

        assert_eq!(times.len(), 17);
        assert_eq!(bounds.len(), 17);

        // Monthly values: day 15 of the middle year.
        assert_eq!(times[0], datetime(1976, 1, 15));
        assert_eq!(times[11], datetime(1976, 12, 15));
        assert_eq!(bounds[0], [datetime(1961, 1, 1), datetime(1991, 1, 1)]);
        assert_eq!(bounds[11], [datetime(1961, 12, 1), datetime(1991, 1, 1)]);

        // Seasonal values: day 16 of the center months, DJF bounds reach
        // back into the preceding December.
        assert_eq!(times[12], datetime(1976, 1, 16));
        assert_eq!(bounds[12], [datetime(1960, 12, 1), datetime(1990, 3, 1)]);

        // Annual value: July 2, bounds covering the whole period.
        assert_eq!(times[16], datetime(1976, 7, 2));
        assert_eq!(bounds[16], [datetime(1961, 1, 1), datetime(1991, 1, 1)]);
    }

    #[test]
    fn test_climo_time_values_single_interval() {
        let (times, bounds) =
            climo_time_values(datetime(2010, 1, 1), datetime(2039, 12, 30), &[Yearly]);
        assert_eq!(times, vec![datetime(2025, 7, 2)]);
        assert_eq!(bounds, vec![[datetime(2010, 1, 1), datetime(2040, 1, 1)]]);
    }
}
