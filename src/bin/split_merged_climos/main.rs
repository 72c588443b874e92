use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::NaiveDateTime;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use error_stack::{Report, ResultExt};
use log::{error, info};

use climate_dp::cdo::{install_output, Cdo};
use climate_dp::climo::{frequency, TimeResolution};
use climate_dp::logging::init_logging;
use climate_dp::nc;

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

fn main_inner(clargs: Cli) -> error_stack::Result<(), CliError> {
    let inputs = collect_inputs(&clargs.filepaths)?;
    if inputs.is_empty() {
        return Err(CliError::UserError("no input files given".to_string()).into());
    }

    let cdo = Cdo::new().change_context(CliError::CdoError)?;
    let mut n_failed = 0usize;
    for filepath in &inputs {
        info!("");
        info!("Processing: {}", filepath.display());
        if let Err(e) = split_file(&cdo, filepath, &clargs.outdir) {
            error!("Failed to split {}: {e:?}", filepath.display());
            n_failed += 1;
        }
    }

    if n_failed > 0 {
        return Err(CliError::UserError(format!(
            "{n_failed} of {} input file(s) could not be split",
            inputs.len()
        ))
        .into());
    }
    Ok(())
}

/// Expand any directories among the inputs into the netCDF files they
/// contain.
fn collect_inputs(filepaths: &[PathBuf]) -> error_stack::Result<Vec<PathBuf>, CliError> {
    let mut inputs = Vec::new();
    for path in filepaths {
        if path.is_dir() {
            let pattern = format!("{}/*.nc", path.display());
            let matches = glob::glob(&pattern)
                .map_err(|e| Report::new(CliError::UserError(e.to_string())))?;
            for entry in matches {
                let entry = entry.map_err(|e| Report::new(CliError::IoError(e.to_string())))?;
                inputs.push(entry);
            }
        } else {
            inputs.push(path.clone());
        }
    }
    Ok(inputs)
}

/// Split one merged climatology file into one output per averaging
/// interval it contains.
fn split_file(
    cdo: &Cdo,
    path: &Path,
    outdir: &Path,
) -> error_stack::Result<Vec<PathBuf>, CliError> {
    let file = netcdf::open(path).change_context(CliError::NcError)?;

    let code = nc::global_str_attr(&file, "frequency")
        .change_context(CliError::NcError)?
        .ok_or_else(|| CliError::NotClimatology("file has no frequency attribute".to_string()))?;
    let (intervals, stat) = frequency::parse_frequency(&code).ok_or_else(|| {
        CliError::NotClimatology(format!("frequency '{code}' is not a climatology code"))
    })?;

    if intervals.len() == 1 {
        info!("File contains a single averaging interval; nothing to split");
        return Ok(vec![]);
    }

    // Splitting selects time steps by position, so the axis must hold
    // exactly the steps the frequency code implies.
    let (time_values, _) = nc::read_time_axis(&file).change_context(CliError::NcError)?;
    let expected = frequency::num_time_steps(&intervals);
    if time_values.len() != expected {
        return Err(CliError::NotClimatology(format!(
            "frequency '{code}' implies {expected} time steps, file has {}",
            time_values.len()
        ))
        .into());
    }

    let metadata = nc::file_metadata(&file).change_context(CliError::NcError)?;
    let varnames = nc::dependent_varnames(&file).change_context(CliError::NcError)?;
    let (t_start, t_end) = climo_span(&file)?;
    drop(file);

    let mut outputs = Vec::new();
    let mut start_step = 1usize;
    for interval in TimeResolution::OUTPUTS {
        if !intervals.contains(&interval) {
            continue;
        }
        let n_steps = interval
            .climo_steps()
            .expect("output resolutions always have a climatology step count");
        let steps: Vec<usize> = (start_step..start_step + n_steps).collect();
        start_step += n_steps;

        let new_code = frequency::frequency_code(&[interval], stat);
        info!("Splitting averaging interval '{new_code}'");
        let split = cdo
            .seltimesteps(&steps, path)
            .change_context(CliError::CdoError)?;

        {
            let mut out = netcdf::append(&split).change_context(CliError::NcError)?;
            out.add_attribute("frequency", new_code.as_str())
                .change_context(CliError::NcError)?;
        }

        let filename =
            nc::climo_output_filename(&varnames.join("+"), &new_code, &metadata, t_start, t_end);
        let dest = outdir.join(filename);
        info!("Output file: {}", dest.display());
        install_output(&split, &dest)
            .map_err(|e| Report::new(CliError::IoError(e.to_string())))?;
        outputs.push(dest);
    }
    Ok(outputs)
}

/// The climatological period of the file, from its bookkeeping attributes,
/// falling back to the time axis.
fn climo_span(file: &netcdf::File) -> error_stack::Result<(NaiveDateTime, NaiveDateTime), CliError> {
    let parse = |value: Option<String>| {
        value.and_then(|s| {
            NaiveDateTime::parse_from_str(s.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S").ok()
        })
    };
    let start = parse(nc::global_str_attr(file, "climo_start_time").change_context(CliError::NcError)?);
    let end = parse(nc::global_str_attr(file, "climo_end_time").change_context(CliError::NcError)?);
    match (start, end) {
        (Some(start), Some(end)) => Ok((start, end)),
        _ => nc::time_range(file).change_context(CliError::NcError),
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("File is not a merged climatology: {0}")]
    NotClimatology(String),
    #[error("Unexpected netCDF error")]
    NcError,
    #[error("CDO invocation failed")]
    CdoError,
    #[error("Unexpected I/O error: {0}")]
    IoError(String),
    #[error("{0}")]
    UserError(String),
}

/// Split merged climatology files (one file holding monthly, seasonal, and
/// annual statistics) into one file per averaging interval.
#[derive(Debug, Parser)]
struct Cli {
    /// Files to process; directories are expanded to the .nc files inside.
    filepaths: Vec<PathBuf>,

    /// Output folder.
    #[clap(short = 'o', long)]
    outdir: PathBuf,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}
