//! Classification of supported variables by how their values combine across
//! time.
//!
//! The category decides which statistic may be used to merge finer-resolution
//! values into a coarser intermediate: averaging a count of frost days over a
//! year does not give the yearly count, and a "consecutive dry days" value
//! cannot be rebuilt from monthly values at all. The table below is the
//! single source of truth; [`classify`] and [`file_category`] only look
//! things up in it.

use itertools::Itertools;

use super::plan::CombineOp;
use super::ClimoError;

/// How a variable's values combine across a longer time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum VarCategory {
    /// Instantaneous or averaged quantity; combines by arithmetic mean.
    Point,
    /// Tally of event occurrences in a period; combines by summation.
    Count,
    /// Extremum recorded in a period; combines by taking the maximum.
    Maximum,
    /// Extremum recorded in a period; combines by taking the minimum.
    Minimum,
    /// Length of a qualifying run of days; cannot be combined across time.
    Duration,
}

impl VarCategory {
    /// The statistic used to build an intermediate aggregate from the next
    /// finer resolution. `None` for categories that need no separate
    /// combining step (`Point`) or that admit none (`Duration`).
    pub fn combine_op(self) -> Option<CombineOp> {
        match self {
            Self::Point => None,
            Self::Count => Some(CombineOp::Sum),
            Self::Maximum => Some(CombineOp::Max),
            Self::Minimum => Some(CombineOp::Min),
            Self::Duration => None,
        }
    }
}

/// Every variable this toolchain knows how to process, with its category.
pub const VARIABLE_CATEGORIES: &[(&str, VarCategory)] = &[
    // Standard climate variables
    ("tasmin", VarCategory::Point),
    ("tasmax", VarCategory::Point),
    ("pr", VarCategory::Point),
    ("prsn", VarCategory::Point),
    // Hydrological modelling variables
    ("BASEFLOW", VarCategory::Point),
    ("EVAP", VarCategory::Point),
    ("GLAC_AREA_BAND", VarCategory::Point),
    ("GLAC_MBAL_BAND", VarCategory::Point),
    ("GLAC_OUTFLOW", VarCategory::Point),
    ("PET_NATVEG", VarCategory::Point),
    ("PREC", VarCategory::Point),
    ("RAINF", VarCategory::Point),
    ("RUNOFF", VarCategory::Point),
    ("SNOW_MELT", VarCategory::Point),
    ("SOIL_MOIST_TOT", VarCategory::Point),
    ("SWE", VarCategory::Point),
    ("SWE_BAND", VarCategory::Point),
    ("TRANSP_VEG", VarCategory::Point),
    // Climdex indices
    ("cddETCCDI", VarCategory::Duration),
    ("csdiETCCDI", VarCategory::Duration),
    ("cwdETCCDI", VarCategory::Duration),
    ("dtrETCCDI", VarCategory::Point),
    ("fdETCCDI", VarCategory::Count),
    ("gslETCCDI", VarCategory::Duration),
    ("idETCCDI", VarCategory::Count),
    ("prcptotETCCDI", VarCategory::Count),
    ("r10mmETCCDI", VarCategory::Count),
    ("r1mmETCCDI", VarCategory::Count),
    ("r20mmETCCDI", VarCategory::Count),
    ("r95pETCCDI", VarCategory::Count),
    ("r99pETCCDI", VarCategory::Count),
    ("rx1dayETCCDI", VarCategory::Maximum),
    ("rx5dayETCCDI", VarCategory::Maximum),
    ("sdiiETCCDI", VarCategory::Point),
    ("suETCCDI", VarCategory::Count),
    ("thresholds", VarCategory::Point),
    ("tn10pETCCDI", VarCategory::Point),
    ("tn90pETCCDI", VarCategory::Point),
    ("tnnETCCDI", VarCategory::Minimum),
    ("tnxETCCDI", VarCategory::Maximum),
    ("trETCCDI", VarCategory::Count),
    ("tx10pETCCDI", VarCategory::Point),
    ("tx90pETCCDI", VarCategory::Point),
    ("txnETCCDI", VarCategory::Minimum),
    ("txxETCCDI", VarCategory::Maximum),
    ("wsdiETCCDI", VarCategory::Duration),
];

/// Look up the category of a single variable by name.
pub fn classify(variable: &str) -> Result<VarCategory, ClimoError> {
    VARIABLE_CATEGORIES
        .iter()
        .find(|(name, _)| *name == variable)
        .map(|(_, category)| *category)
        .ok_or_else(|| ClimoError::UnsupportedVariable(variable.to_string()))
}

/// Classify every dependent variable of a file and require all of them to
/// share one category.
///
/// A lookup failure for any variable rejects the whole file; mixing
/// categories in one file (or a file with no dependent variables at all) is
/// likewise rejected, because the file-level aggregation below would apply
/// the wrong statistic to some of its variables.
pub fn file_category<S: AsRef<str>>(variables: &[S]) -> Result<VarCategory, ClimoError> {
    let categories: Vec<VarCategory> = variables
        .iter()
        .map(|v| classify(v.as_ref()))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .sorted()
        .dedup()
        .collect();

    match categories.as_slice() {
        [single] => Ok(*single),
        _ => Err(ClimoError::MixedCategories(categories)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known() {
        assert_eq!(classify("tasmax").unwrap(), VarCategory::Point);
        assert_eq!(classify("fdETCCDI").unwrap(), VarCategory::Count);
        assert_eq!(classify("txxETCCDI").unwrap(), VarCategory::Maximum);
        assert_eq!(classify("tnnETCCDI").unwrap(), VarCategory::Minimum);
        assert_eq!(classify("cddETCCDI").unwrap(), VarCategory::Duration);
    }

    #[test]
    fn test_classify_total_over_table() {
        for (name, category) in VARIABLE_CATEGORIES {
            assert_eq!(classify(name).unwrap(), *category);
        }
    }

    #[test]
    fn test_classify_unknown() {
        let err = classify("snowman_density").unwrap_err();
        assert_eq!(
            err,
            ClimoError::UnsupportedVariable("snowman_density".to_string())
        );
        assert!(err.to_string().contains("snowman_density"));
    }

    #[test]
    fn test_file_category_single() {
        assert_eq!(
            file_category(&["tasmax", "pr"]).unwrap(),
            VarCategory::Point
        );
        assert_eq!(
            file_category(&["fdETCCDI", "suETCCDI", "trETCCDI"]).unwrap(),
            VarCategory::Count
        );
    }

    #[test]
    fn test_file_category_mixed() {
        let err = file_category(&["prcptotETCCDI", "tasmax"]).unwrap_err();
        assert_eq!(
            err,
            ClimoError::MixedCategories(vec![VarCategory::Point, VarCategory::Count])
        );
    }

    #[test]
    fn test_file_category_empty() {
        let names: [&str; 0] = [];
        assert_eq!(
            file_category(&names).unwrap_err(),
            ClimoError::MixedCategories(vec![])
        );
    }

    #[test]
    fn test_file_category_unknown_rejects_whole_file() {
        let err = file_category(&["tasmax", "mystery"]).unwrap_err();
        assert_eq!(err, ClimoError::UnsupportedVariable("mystery".to_string()));
    }
}
