use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use log::{error, info};

use climate_dp::climo::{ClimoStat, TimeResolution};
use climate_dp::logging::init_logging;

mod pipeline;

use pipeline::{dry_run_report, process_file, ClimoOptions};

fn main() -> ExitCode {
    let clargs = Cli::parse();
    init_logging(clargs.verbosity.log_level_filter());
    if let Err(e) = main_inner(clargs) {
        eprintln!("ERROR: {e:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn main_inner(clargs: Cli) -> error_stack::Result<(), pipeline::CliError> {
    let opts = ClimoOptions {
        operation: clargs.operation,
        convert_longitudes: clargs.convert_longitudes,
        split_vars: clargs.split_vars,
        split_intervals: clargs.split_intervals,
        resolutions: if clargs.resolutions.is_empty() {
            TimeResolution::OUTPUTS.to_vec()
        } else {
            clargs.resolutions.clone()
        },
        periods: clargs.climo.clone(),
        outdir: clargs.outdir.clone(),
    };

    if clargs.dry_run {
        info!("DRY RUN");
        for filepath in &clargs.filepaths {
            dry_run_report(filepath, &opts);
        }
        return Ok(());
    }

    let mut n_failed = 0usize;
    for filepath in &clargs.filepaths {
        info!("");
        info!("Processing: {}", filepath.display());
        match process_file(filepath, &opts) {
            Ok(outputs) => {
                info!(
                    "Created {} output file(s) for {}",
                    outputs.len(),
                    filepath.display()
                );
            }
            Err(e) => {
                // One bad file must not poison the rest of the batch.
                error!("Failed to process {}: {e:?}", filepath.display());
                n_failed += 1;
            }
        }
    }

    if n_failed > 0 {
        return Err(pipeline::CliError::UserError(format!(
            "{n_failed} of {} input file(s) could not be processed",
            clargs.filepaths.len()
        ))
        .into());
    }
    Ok(())
}

/// Create climatological means or standard deviations from climate model
/// output.
///
/// For each input file and each selected climatological period, this forms
/// multi-year statistics of every dependent variable at the requested output
/// resolutions. Variables that accumulate within a year (event counts,
/// extrema) are first aggregated to each coarser resolution with their own
/// statistic before the multi-year reduction is applied; files of
/// duration-type variables can only produce output at their native
/// resolution.
#[derive(Debug, Parser)]
struct Cli {
    /// Files to process.
    filepaths: Vec<PathBuf>,

    /// Climatological periods to generate, by short code (e.g. -c 6190
    /// -c 7100). Defaults to all standard periods available in the input
    /// file.
    #[clap(short = 'c', long = "climo")]
    climo: Vec<String>,

    /// Temporal resolutions of the multi-year statistics to generate
    /// (monthly, seasonal, yearly; repeatable). Defaults to all three.
    #[clap(short = 'r', long = "resolutions", value_parser = parse_resolution)]
    resolutions: Vec<TimeResolution>,

    /// Statistic to compute over the years of the climatological period.
    #[clap(short = 'p', long, value_parser = parse_operation)]
    operation: ClimoStat,

    /// Transform the longitude range from [0, 360) to [-180, 180).
    #[clap(short = 'g', long, default_value_t = true, action = clap::ArgAction::Set)]
    convert_longitudes: bool,

    /// Generate a separate output file for each dependent variable.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    split_vars: bool,

    /// Generate a separate output file for each averaging interval.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    split_intervals: bool,

    /// Report what would be done for each input file without running CDO.
    #[clap(short = 'n', long)]
    dry_run: bool,

    /// Output folder.
    #[clap(short = 'o', long)]
    outdir: PathBuf,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}

fn parse_resolution(s: &str) -> Result<TimeResolution, String> {
    let res = TimeResolution::from_str(s)
        .map_err(|_| format!("'{s}' is not a valid time resolution"))?;
    if !TimeResolution::OUTPUTS.contains(&res) {
        return Err(format!("'{s}' is not a supported output resolution"));
    }
    Ok(res)
}

fn parse_operation(s: &str) -> Result<ClimoStat, String> {
    ClimoStat::from_str(s).map_err(|_| format!("'{s}' is not a supported operation (mean, std)"))
}
