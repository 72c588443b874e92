//! Decides which aggregation operations must run, and in which order, before
//! multi-year statistics can be formed at each requested output resolution.
//!
//! Forming a climatological mean of point data is a single resolution-aware
//! CDO call, but count/extremum variables must first be combined to each
//! coarser resolution with their own statistic (sum/max/min). Applying the
//! climatological operator across a resolution jump instead would silently
//! compute the wrong value, e.g. the multi-year mean of monthly totals where
//! the yearly total was wanted. [`build_plan`] encodes those rules once so
//! the pipeline that drives CDO does not have to.

use itertools::Itertools;
use log::{debug, warn};

use super::category::VarCategory;
use super::resolution::TimeResolution;
use super::ClimoError;

/// The multi-year statistic applied as the final climatological reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum ClimoStat {
    #[strum(serialize = "mean")]
    Mean,
    #[strum(serialize = "std")]
    StdDev,
}

impl ClimoStat {
    /// Suffix appended to the `ymon`/`yseas`/`tim` operator families.
    pub fn cdo_suffix(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::StdDev => "std",
        }
    }

    /// Suffix appended to frequency codes (`mClimMean`, `aClimSD`, ...).
    pub fn frequency_suffix(self) -> &'static str {
        match self {
            Self::Mean => "Mean",
            Self::StdDev => "SD",
        }
    }

    /// Name used when extending a variable's `cell_methods` attribute.
    pub fn cell_method(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::StdDev => "standard_deviation",
        }
    }
}

/// The statistic used to merge finer-resolution values into a coarser
/// intermediate, as distinct from the final climatological reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum CombineOp {
    Sum,
    Max,
    Min,
}

impl CombineOp {
    pub fn cdo_suffix(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Max => "max",
            Self::Min => "min",
        }
    }
}

/// Which dataset a plan step reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSource {
    /// The temporally subset input file, at its native resolution.
    Native,
    /// An intermediate aggregate previously materialized at this resolution.
    Intermediate(TimeResolution),
}

/// One intermediate dataset to materialize before any output that reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntermediateStep {
    /// Resolution of the dataset this step produces.
    pub resolution: TimeResolution,
    /// The next-finer dataset this step reads.
    pub source: PlanSource,
    pub op: CombineOp,
}

impl IntermediateStep {
    /// Name of the CDO operator performing this step, e.g. `monsum`,
    /// `yearmax`.
    pub fn cdo_operator(&self) -> String {
        let prefix = self
            .resolution
            .combine_prefix()
            .expect("intermediate aggregates are always coarser than daily");
        format!("{prefix}{}", self.op.cdo_suffix())
    }
}

/// One climatological output to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputStep {
    pub target: TimeResolution,
    pub source: PlanSource,
    /// The combining statistic used to materialize `source`, if the path to
    /// this output needed one.
    pub combine: Option<CombineOp>,
    pub stat: ClimoStat,
}

impl OutputStep {
    /// Name of the CDO operator performing the final reduction, e.g.
    /// `ymonmean`, `timstd`.
    pub fn cdo_operator(&self) -> String {
        let prefix = self
            .target
            .climo_prefix()
            .expect("climatological outputs are always monthly, seasonal, or yearly");
        format!("{prefix}{}", self.stat.cdo_suffix())
    }
}

/// The ordered work required to produce climatological statistics from one
/// file: intermediates first (each readable only after the previous one is
/// written), then one output step per resolution actually produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationPlan {
    intermediates: Vec<IntermediateStep>,
    outputs: Vec<OutputStep>,
}

impl AggregationPlan {
    /// Intermediate materializations, finest to coarsest. Each reads either
    /// the native data or the intermediate immediately before it.
    pub fn intermediates(&self) -> &[IntermediateStep] {
        &self.intermediates
    }

    /// Output steps, finest target resolution first.
    pub fn outputs(&self) -> &[OutputStep] {
        &self.outputs
    }

    /// True when nothing can be produced; the caller is expected to emit no
    /// output files rather than fail.
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Resolutions this plan will produce output at, finest first.
    pub fn target_resolutions(&self) -> Vec<TimeResolution> {
        self.outputs.iter().map(|step| step.target).collect()
    }
}

/// Decide the aggregation work needed to produce `stat` climatologies at
/// each of `requested` from data of category `category` sampled at `native`
/// resolution.
///
/// Requested resolutions finer than `native` do not exist in the data and
/// are dropped without error. If nothing survives, the returned plan is
/// empty and a warning is logged; the only fatal condition here is asking a
/// duration-category file for output coarser than its native resolution.
pub fn build_plan(
    category: VarCategory,
    native: TimeResolution,
    requested: &[TimeResolution],
    stat: ClimoStat,
) -> Result<AggregationPlan, ClimoError> {
    // Normalize to the supported output resolutions, finest first.
    let (producible, dropped): (Vec<_>, Vec<_>) = TimeResolution::OUTPUTS
        .iter()
        .copied()
        .filter(|res| requested.contains(res))
        .partition(|res| *res >= native);

    if !dropped.is_empty() {
        debug!(
            "Dropping requested resolutions finer than the {} input data: {}",
            native,
            dropped.iter().join(", ")
        );
    }

    if producible.is_empty() {
        warn!(
            "None of the selected output resolutions [{}] can be produced from {} resolution \
             input; no output will be generated",
            requested.iter().join(", "),
            native
        );
        return Ok(AggregationPlan::default());
    }

    let outputs = match category {
        VarCategory::Duration => {
            let coarser: Vec<TimeResolution> = producible
                .iter()
                .copied()
                .filter(|res| *res > native)
                .collect();
            if !coarser.is_empty() {
                return Err(ClimoError::NonAggregatableCategory {
                    category,
                    native,
                    requested: coarser,
                });
            }
            // Only the native resolution itself remains; the values pass
            // straight to the climatological reduction.
            producible
                .into_iter()
                .map(|target| OutputStep {
                    target,
                    source: PlanSource::Native,
                    combine: None,
                    stat,
                })
                .collect()
        }
        VarCategory::Point => {
            // The resolution-aware climatological operators handle the
            // within-year grouping themselves, so every target reads the
            // native data directly.
            producible
                .into_iter()
                .map(|target| OutputStep {
                    target,
                    source: PlanSource::Native,
                    combine: None,
                    stat,
                })
                .collect()
        }
        VarCategory::Count | VarCategory::Maximum | VarCategory::Minimum => {
            let op = category
                .combine_op()
                .expect("count/max/min categories define a combining statistic");
            let coarsest = *producible.last().expect("producible is non-empty");

            // Chain intermediates up to the coarsest target, each built from
            // the level below with the category's own statistic.
            let mut intermediates = Vec::new();
            let mut source = PlanSource::Native;
            let mut level = native;
            while level < coarsest {
                let next = level
                    .next_coarser()
                    .expect("levels below the coarsest target always have a coarser neighbour");
                intermediates.push(IntermediateStep {
                    resolution: next,
                    source,
                    op,
                });
                source = PlanSource::Intermediate(next);
                level = next;
            }

            let outputs = producible
                .into_iter()
                .map(|target| {
                    if target == native {
                        OutputStep {
                            target,
                            source: PlanSource::Native,
                            combine: None,
                            stat,
                        }
                    } else {
                        OutputStep {
                            target,
                            source: PlanSource::Intermediate(target),
                            combine: Some(op),
                            stat,
                        }
                    }
                })
                .collect();

            return Ok(AggregationPlan {
                intermediates,
                outputs,
            });
        }
    };

    Ok(AggregationPlan {
        intermediates: Vec::new(),
        outputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use TimeResolution::*;

    #[test]
    fn test_point_daily_all_resolutions() {
        let plan = build_plan(
            VarCategory::Point,
            Daily,
            &[Monthly, Seasonal, Yearly],
            ClimoStat::Mean,
        )
        .unwrap();

        assert!(plan.intermediates().is_empty());
        assert_eq!(plan.outputs().len(), 3);
        assert_eq!(plan.target_resolutions(), vec![Monthly, Seasonal, Yearly]);
        for step in plan.outputs() {
            assert_eq!(step.source, PlanSource::Native);
            assert_eq!(step.combine, None);
            assert_eq!(step.stat, ClimoStat::Mean);
        }
        assert_eq!(
            plan.outputs()
                .iter()
                .map(|s| s.cdo_operator())
                .collect::<Vec<_>>(),
            vec!["ymonmean", "yseasmean", "timmean"]
        );
    }

    #[test]
    fn test_count_daily_yearly_only() {
        let plan = build_plan(VarCategory::Count, Daily, &[Yearly], ClimoStat::Mean).unwrap();

        // The whole chain up to yearly is materialized with sums.
        assert_eq!(
            plan.intermediates(),
            &[
                IntermediateStep {
                    resolution: Monthly,
                    source: PlanSource::Native,
                    op: CombineOp::Sum,
                },
                IntermediateStep {
                    resolution: Seasonal,
                    source: PlanSource::Intermediate(Monthly),
                    op: CombineOp::Sum,
                },
                IntermediateStep {
                    resolution: Yearly,
                    source: PlanSource::Intermediate(Seasonal),
                    op: CombineOp::Sum,
                },
            ]
        );
        assert_eq!(
            plan.outputs(),
            &[OutputStep {
                target: Yearly,
                source: PlanSource::Intermediate(Yearly),
                combine: Some(CombineOp::Sum),
                stat: ClimoStat::Mean,
            }]
        );
        assert_eq!(plan.outputs()[0].cdo_operator(), "timmean");
        assert_eq!(
            plan.intermediates()
                .iter()
                .map(|s| s.cdo_operator())
                .collect::<Vec<_>>(),
            vec!["monsum", "seassum", "yearsum"]
        );
    }

    #[test]
    fn test_count_native_resolution_needs_no_combining() {
        let plan = build_plan(
            VarCategory::Count,
            Monthly,
            &[Monthly, Yearly],
            ClimoStat::StdDev,
        )
        .unwrap();

        assert_eq!(
            plan.intermediates()
                .iter()
                .map(|s| (s.resolution, s.source))
                .collect::<Vec<_>>(),
            vec![
                (Seasonal, PlanSource::Native),
                (Yearly, PlanSource::Intermediate(Seasonal)),
            ]
        );
        assert_eq!(
            plan.outputs(),
            &[
                OutputStep {
                    target: Monthly,
                    source: PlanSource::Native,
                    combine: None,
                    stat: ClimoStat::StdDev,
                },
                OutputStep {
                    target: Yearly,
                    source: PlanSource::Intermediate(Yearly),
                    combine: Some(CombineOp::Sum),
                    stat: ClimoStat::StdDev,
                },
            ]
        );
    }

    #[rstest]
    #[case(VarCategory::Maximum, CombineOp::Max, "seasmax")]
    #[case(VarCategory::Minimum, CombineOp::Min, "seasmin")]
    fn test_extrema_combine_with_their_own_statistic(
        #[case] category: VarCategory,
        #[case] op: CombineOp,
        #[case] first_operator: &str,
    ) {
        let plan = build_plan(category, Monthly, &[Seasonal], ClimoStat::Mean).unwrap();
        assert_eq!(plan.intermediates().len(), 1);
        assert_eq!(plan.intermediates()[0].op, op);
        assert_eq!(plan.intermediates()[0].cdo_operator(), first_operator);
        assert_eq!(plan.outputs()[0].combine, Some(op));
    }

    #[test]
    fn test_duration_coarser_than_native_fails() {
        let err = build_plan(VarCategory::Duration, Seasonal, &[Yearly], ClimoStat::Mean)
            .unwrap_err();
        assert_eq!(
            err,
            ClimoError::NonAggregatableCategory {
                category: VarCategory::Duration,
                native: Seasonal,
                requested: vec![Yearly],
            }
        );
    }

    #[test]
    fn test_duration_at_native_resolution() {
        let plan =
            build_plan(VarCategory::Duration, Seasonal, &[Seasonal], ClimoStat::Mean).unwrap();
        assert!(plan.intermediates().is_empty());
        assert_eq!(
            plan.outputs(),
            &[OutputStep {
                target: Seasonal,
                source: PlanSource::Native,
                combine: None,
                stat: ClimoStat::Mean,
            }]
        );
    }

    #[test]
    fn test_duration_mixed_request_still_fails() {
        // Having the native resolution in the request does not excuse the
        // coarser ones.
        let err = build_plan(
            VarCategory::Duration,
            Seasonal,
            &[Seasonal, Yearly],
            ClimoStat::Mean,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ClimoError::NonAggregatableCategory { requested, .. } if requested == vec![Yearly]
        ));
    }

    #[test]
    fn test_finer_than_native_dropped_to_empty_plan() {
        let plan = build_plan(VarCategory::Maximum, Yearly, &[Monthly], ClimoStat::Mean).unwrap();
        assert!(plan.is_empty());
        assert!(plan.intermediates().is_empty());
    }

    #[test]
    fn test_daily_request_is_dropped_not_an_error() {
        let plan = build_plan(VarCategory::Maximum, Monthly, &[Daily], ClimoStat::Mean).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_empty_request_yields_empty_plan() {
        let plan = build_plan(VarCategory::Point, Daily, &[], ClimoStat::Mean).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_point_coarse_native_keeps_reachable_resolutions() {
        let plan = build_plan(
            VarCategory::Point,
            Seasonal,
            &[Monthly, Seasonal, Yearly],
            ClimoStat::StdDev,
        )
        .unwrap();
        assert_eq!(plan.target_resolutions(), vec![Seasonal, Yearly]);
        assert_eq!(
            plan.outputs()
                .iter()
                .map(|s| s.cdo_operator())
                .collect::<Vec<_>>(),
            vec!["yseasstd", "timstd"]
        );
    }

    #[test]
    fn test_plan_is_deterministic() {
        let args = (
            VarCategory::Count,
            Daily,
            [Monthly, Yearly],
            ClimoStat::Mean,
        );
        let a = build_plan(args.0, args.1, &args.2, args.3).unwrap();
        let b = build_plan(args.0, args.1, &args.2, args.3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_intermediates_precede_consumers() {
        let plan = build_plan(
            VarCategory::Count,
            Daily,
            &[Monthly, Seasonal, Yearly],
            ClimoStat::Mean,
        )
        .unwrap();
        for step in plan.outputs() {
            if let PlanSource::Intermediate(res) = step.source {
                assert!(
                    plan.intermediates().iter().any(|i| i.resolution == res),
                    "output at {res} reads an intermediate that is never materialized"
                );
            }
        }
    }
}
