//! Climatology planning and CF climatology metadata conventions.
//!
//! The central piece is [`plan::build_plan`], which decides how a variable
//! must be aggregated within a year before multi-year statistics can be
//! formed at each requested output resolution. The surrounding modules hold
//! the variable classification table, the ordered time-resolution type, the
//! standard climatological periods, and the frequency-code/time-bounds
//! conventions for climatology output files.

use itertools::Itertools;

pub mod category;
pub mod frequency;
pub mod periods;
pub mod plan;
pub mod resolution;

pub use category::{classify, file_category, VarCategory};
pub use plan::{
    build_plan, AggregationPlan, ClimoStat, CombineOp, IntermediateStep, OutputStep, PlanSource,
};
pub use resolution::TimeResolution;

/// Conditions that make a file unprocessable for climatology generation.
///
/// All three variants are fatal for the file they were raised for: no output
/// may be produced from that file. They do not poison other files in the same
/// invocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClimoError {
    /// A dependent variable is not in the classification table.
    #[error("Unsupported variable: cannot yet process '{0}'")]
    UnsupportedVariable(String),

    /// A file's dependent variables span zero or several aggregation
    /// categories.
    #[error(
        "File must contain variables of exactly one aggregation category, found [{}]",
        .0.iter().join(", ")
    )]
    MixedCategories(Vec<VarCategory>),

    /// A duration-category file was asked for output coarser than its native
    /// resolution.
    #[error(
        "{category} variables cannot be aggregated from {native} resolution to [{}]",
        .requested.iter().join(", ")
    )]
    NonAggregatableCategory {
        category: VarCategory,
        native: TimeResolution,
        requested: Vec<TimeResolution>,
    },
}
