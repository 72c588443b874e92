/// Sampling interval of a dataset's time axis, ordered from finest to
/// coarsest.
///
/// The variant order defines the comparison: a resolution can only be
/// produced from data at an equal or finer resolution.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TimeResolution {
    Daily,
    Monthly,
    Seasonal,
    Yearly,
}

impl TimeResolution {
    /// The resolutions climatological output can be produced at, finest first.
    pub const OUTPUTS: [TimeResolution; 3] = [
        TimeResolution::Monthly,
        TimeResolution::Seasonal,
        TimeResolution::Yearly,
    ];

    pub fn next_coarser(self) -> Option<Self> {
        match self {
            Self::Daily => Some(Self::Monthly),
            Self::Monthly => Some(Self::Seasonal),
            Self::Seasonal => Some(Self::Yearly),
            Self::Yearly => None,
        }
    }

    /// CDO operator family that forms multi-year statistics grouped at this
    /// resolution (`ymon*`, `yseas*`, `tim*`). Daily data cannot be a
    /// climatological output resolution.
    pub(crate) fn climo_prefix(self) -> Option<&'static str> {
        match self {
            Self::Daily => None,
            Self::Monthly => Some("ymon"),
            Self::Seasonal => Some("yseas"),
            Self::Yearly => Some("tim"),
        }
    }

    /// CDO operator family that combines finer values into one value per
    /// calendar month/season/year of each individual year (`mon*`, `seas*`,
    /// `year*`).
    pub(crate) fn combine_prefix(self) -> Option<&'static str> {
        match self {
            Self::Daily => None,
            Self::Monthly => Some("mon"),
            Self::Seasonal => Some("seas"),
            Self::Yearly => Some("year"),
        }
    }

    /// Single-letter code used in the `frequency` attribute of climatology
    /// files (`mClim`, `sClim`, `aClim`).
    pub fn frequency_char(self) -> Option<char> {
        match self {
            Self::Daily => None,
            Self::Monthly => Some('m'),
            Self::Seasonal => Some('s'),
            Self::Yearly => Some('a'),
        }
    }

    /// Number of time steps a climatology at this resolution contains.
    pub fn climo_steps(self) -> Option<usize> {
        match self {
            Self::Daily => None,
            Self::Monthly => Some(12),
            Self::Seasonal => Some(4),
            Self::Yearly => Some(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TimeResolution;
    use std::str::FromStr;

    #[test]
    fn test_ordering() {
        assert!(TimeResolution::Daily < TimeResolution::Monthly);
        assert!(TimeResolution::Monthly < TimeResolution::Seasonal);
        assert!(TimeResolution::Seasonal < TimeResolution::Yearly);
    }

    #[test]
    fn test_round_trip_strings() {
        for res in [
            TimeResolution::Daily,
            TimeResolution::Monthly,
            TimeResolution::Seasonal,
            TimeResolution::Yearly,
        ] {
            let s = res.to_string();
            assert_eq!(TimeResolution::from_str(&s).unwrap(), res);
        }
        assert!(TimeResolution::from_str("fortnightly").is_err());
    }
}
