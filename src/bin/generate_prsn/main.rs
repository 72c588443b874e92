use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use error_stack::{Report, ResultExt};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use ndarray::Zip;
use netcdf::types::{FloatType, NcVariableType};

use climate_dp::logging::init_logging;
use climate_dp::nc;
use climate_dp::units::Unit;

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
    for path in [&clargs.prec, &clargs.tasmin, &clargs.tasmax] {
        info!("Retrieving file: {}", path.display());
    }
    let pr_file = open(&clargs.prec)?;
    let tasmin_file = open(&clargs.tasmin)?;
    let tasmax_file = open(&clargs.tasmax)?;

    info!("Conducting pre-process checks");
    preprocess_checks(&pr_file, &tasmin_file, &tasmax_file)?;

    if clargs.dry_run {
        info!("DRY RUN: checks passed, no output written");
        return Ok(());
    }

    let output_path = output_filepath(&clargs)?;
    let result = generate(&clargs, &pr_file, &tasmin_file, &tasmax_file, &output_path);
    if result.is_err() {
        // Do not leave a half-written file behind.
        let _ = std::fs::remove_file(&output_path);
        return result;
    }

    info!("Output at: {}", output_path.display());
    info!("Complete");
    Ok(())
}

fn generate(
    clargs: &Cli,
    pr_file: &netcdf::File,
    tasmin_file: &netcdf::File,
    tasmax_file: &netcdf::File,
    output_path: &Path,
) -> error_stack::Result<(), CliError> {
    info!("Creating outfile {}", output_path.display());
    create_prsn_file_from_source(pr_file, output_path)?;

    info!("Processing files in chunks");
    let freezing = {
        let units = var_units(tasmin_file, "tasmin")?;
        freezing_point(&units)
    };
    write_prsn_data(
        pr_file,
        tasmin_file,
        tasmax_file,
        output_path,
        clargs.chunk_size,
        freezing,
    )?;

    let mut out = netcdf::append(output_path).change_context(CliError::NcError)?;
    nc::prepend_history(
        &mut out,
        &format!(
            "generate_prsn -p {} -n {} -x {}",
            clargs.prec.display(),
            clargs.tasmin.display(),
            clargs.tasmax.display()
        ),
    )
    .change_context(CliError::NcError)?;
    Ok(())
}

fn open(path: &Path) -> error_stack::Result<netcdf::File, CliError> {
    netcdf::open(path)
        .change_context(CliError::NcError)
        .attach_printable_lazy(|| format!("could not open {}", path.display()))
}

/// All compatibility checks the three inputs must pass before any output is
/// written.
fn preprocess_checks(
    pr: &netcdf::File,
    tasmin: &netcdf::File,
    tasmax: &netcdf::File,
) -> error_stack::Result<(), CliError> {
    // The three files must come from the same model run.
    let pr_meta = nc::file_metadata(pr).change_context(CliError::NcError)?;
    for (name, file) in [("tasmin", tasmin), ("tasmax", tasmax)] {
        let meta = nc::file_metadata(file).change_context(CliError::NcError)?;
        if meta != pr_meta {
            return Err(CliError::ChecksFailed(format!(
                "metadata of the {name} file does not match the precipitation file \
                 ({meta:?} vs {pr_meta:?})"
            ))
            .into());
        }
    }

    for (file, varname) in [(pr, "pr"), (tasmin, "tasmin"), (tasmax, "tasmax")] {
        if file.variable(varname).is_none() {
            return Err(CliError::ChecksFailed(format!(
                "input files do not contain the required variable '{varname}'"
            ))
            .into());
        }
    }

    let min_units = var_units(tasmin, "tasmin")?;
    let max_units = var_units(tasmax, "tasmax")?;
    if min_units != max_units {
        return Err(CliError::ChecksFailed(format!(
            "temperature units do not match: tasmin '{min_units}' tasmax '{max_units}'"
        ))
        .into());
    }

    check_pr_units(pr)?;

    // All three data cubes must be the same shape.
    let shape = |file: &netcdf::File, varname: &str| -> Vec<usize> {
        file.variable(varname)
            .map(|v| v.dimensions().iter().map(|d| d.len()).collect())
            .unwrap_or_default()
    };
    let shapes = [
        shape(pr, "pr"),
        shape(tasmin, "tasmin"),
        shape(tasmax, "tasmax"),
    ];
    if shapes[0] != shapes[1] || shapes[0] != shapes[2] {
        return Err(CliError::ChecksFailed(format!(
            "input variables are not the same shape: {shapes:?}"
        ))
        .into());
    }

    Ok(())
}

fn var_units(
    file: &netcdf::File,
    varname: &str,
) -> error_stack::Result<String, CliError> {
    let var = file
        .variable(varname)
        .ok_or_else(|| CliError::ChecksFailed(format!("no '{varname}' variable")))?;
    nc::var_str_attr(&var, "units")
        .change_context(CliError::NcError)?
        .ok_or_else(|| CliError::ChecksFailed(format!("'{varname}' has no units attribute")).into())
}

fn check_pr_units(pr: &netcdf::File) -> error_stack::Result<(), CliError> {
    let units_str = var_units(pr, "pr")?;
    let units = Unit::parse(&units_str).map_err(|e| {
        Report::new(CliError::ChecksFailed(format!(
            "precipitation units '{units_str}' are not parsable: {e}"
        )))
    })?;
    let valid = [
        Unit::parse("kg m-2 s-1").expect("literal unit strings parse"),
        Unit::parse("mm s-1").expect("literal unit strings parse"),
        Unit::parse("kg m-2 day-1").expect("literal unit strings parse"),
        Unit::parse("mm day-1").expect("literal unit strings parse"),
    ];
    if !valid.contains(&units) {
        return Err(CliError::ChecksFailed(format!(
            "unexpected precipitation units '{units_str}'"
        ))
        .into());
    }
    Ok(())
}

/// The temperature at which precipitation is treated as snow, in the input
/// files' temperature unit.
fn freezing_point(units: &str) -> f64 {
    match units.to_ascii_lowercase().as_str() {
        "k" | "kelvin" => 273.15,
        _ => 0.0,
    }
}

fn output_filepath(clargs: &Cli) -> error_stack::Result<PathBuf, CliError> {
    let filename = match &clargs.output_file {
        Some(name) => name.clone(),
        None => {
            // Reuse the precipitation file's name with the variable part
            // replaced, e.g. pr_day_CanESM2_... -> prsn_day_CanESM2_...
            let pr_name = clargs
                .prec
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    CliError::UserError("precipitation file has no usable file name".to_string())
                })?;
            match pr_name.split_once('_') {
                Some((_, rest)) => format!("prsn_{rest}"),
                None => format!("prsn_{pr_name}"),
            }
        }
    };
    std::fs::create_dir_all(&clargs.outdir)
        .map_err(|e| Report::new(CliError::IoError(e.to_string())))?;
    Ok(clargs.outdir.join(filename))
}

/// Create the output file with the precipitation file's structure: same
/// dimensions, global attributes, and variables, with `pr` renamed to
/// `prsn` and its identity attributes rewritten. Data for every variable
/// except `prsn` is copied here; `prsn` data is written chunk-wise later.
fn create_prsn_file_from_source(
    pr_file: &netcdf::File,
    output_path: &Path,
) -> error_stack::Result<(), CliError> {
    let mut out = netcdf::create(output_path).change_context(CliError::NcError)?;

    nc::copy_dimensions(pr_file, &mut out, &[]).change_context(CliError::NcError)?;
    nc::copy_global_attrs(pr_file, &mut out, None).change_context(CliError::NcError)?;

    for var in pr_file.variables() {
        let name = var.name();
        let dims: Vec<String> = var.dimensions().iter().map(|d| d.name()).collect();
        let dims: Vec<&str> = dims.iter().map(|d| d.as_str()).collect();

        if name == "pr" {
            let mut prsn = add_float_variable_like(&mut out, &var, "prsn", &dims)?;
            // Attributes describing the original variable do not apply.
            nc::copy_variable_attrs(
                &var,
                &mut prsn,
                &["standard_name", "long_name", "original_name", "comment"],
            )
            .change_context(CliError::NcError)?;
            prsn.add_attribute("standard_name", "snowfall_flux")
                .change_context(CliError::NcError)?;
            prsn.add_attribute("long_name", "Precipitation as Snow")
                .change_context(CliError::NcError)?;
        } else {
            log::debug!("Copying {name}");
            let data = nc::NcArray::get_from(&var).change_context(CliError::NcError)?;
            let mut copied = data
                .put_to(&mut out, &name, &dims)
                .change_context(CliError::NcError)?;
            nc::copy_variable_attrs(&var, &mut copied, &[]).change_context(CliError::NcError)?;
        }
    }
    Ok(())
}

/// Create an empty variable matching the source's float type.
fn add_float_variable_like<'f>(
    out: &'f mut netcdf::FileMut,
    source: &netcdf::Variable,
    name: &str,
    dims: &[&str],
) -> error_stack::Result<netcdf::VariableMut<'f>, CliError> {
    match source.vartype() {
        NcVariableType::Float(FloatType::F32) => out
            .add_variable::<f32>(name, dims)
            .change_context(CliError::NcError),
        NcVariableType::Float(FloatType::F64) => out
            .add_variable::<f64>(name, dims)
            .change_context(CliError::NcError),
        other => Err(Report::new(CliError::ChecksFailed(format!(
            "precipitation variable has non-float type {other:?}"
        )))),
    }
}

/// Mask precipitation to freezing conditions and write it as `prsn`,
/// processing the time axis in chunks to bound memory use.
fn write_prsn_data(
    pr_file: &netcdf::File,
    tasmin_file: &netcdf::File,
    tasmax_file: &netcdf::File,
    output_path: &Path,
    chunk_size: usize,
    freezing: f64,
) -> error_stack::Result<(), CliError> {
    let pr_var = pr_file
        .variable("pr")
        .ok_or_else(|| CliError::ChecksFailed("no 'pr' variable".to_string()))?;
    let tasmin_var = tasmin_file
        .variable("tasmin")
        .ok_or_else(|| CliError::ChecksFailed("no 'tasmin' variable".to_string()))?;
    let tasmax_var = tasmax_file
        .variable("tasmax")
        .ok_or_else(|| CliError::ChecksFailed("no 'tasmax' variable".to_string()))?;

    let dim_lens: Vec<usize> = pr_var.dimensions().iter().map(|d| d.len()).collect();
    let total_len = dim_lens.first().copied().unwrap_or(0);
    let chunk_size = chunk_size.max(1);

    let mut out = netcdf::append(output_path).change_context(CliError::NcError)?;
    let mut prsn_var = out
        .variable_mut("prsn")
        .ok_or_else(|| CliError::ChecksFailed("output file has no 'prsn' variable".to_string()))?;

    let pb = ProgressBar::new(total_len as u64);
    pb.set_style(
        ProgressStyle::with_template("{prefix} {wide_bar} [{human_pos}/{human_len}]")
            .expect("progress bar template is valid"),
    );
    pb.set_prefix("Writing prsn time steps");

    let mut start = 0usize;
    while start < total_len {
        let end = (start + chunk_size).min(total_len);
        let extents: Vec<std::ops::Range<usize>> = std::iter::once(start..end)
            .chain(dim_lens.iter().skip(1).map(|len| 0..*len))
            .collect();

        let pr_data = pr_var
            .get::<f64, _>(extents.as_slice())
            .change_context(CliError::NcError)?;
        let tasmin_data = tasmin_var
            .get::<f64, _>(extents.as_slice())
            .change_context(CliError::NcError)?;
        let tasmax_data = tasmax_var
            .get::<f64, _>(extents.as_slice())
            .change_context(CliError::NcError)?;

        let mut prsn_data = pr_data;
        Zip::from(&mut prsn_data)
            .and(&tasmin_data)
            .and(&tasmax_data)
            .for_each(|prsn, &tn, &tx| {
                if (tn + tx) / 2.0 >= freezing {
                    *prsn = f64::NAN;
                }
            });

        prsn_var
            .put(prsn_data.view(), extents.as_slice())
            .change_context(CliError::NcError)?;

        pb.set_position(end as u64);
        start = end;
    }
    pb.finish();

    if total_len == 0 {
        warn!("Precipitation variable has no time steps; output contains no data");
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("Pre-process checks have failed: {0}")]
    ChecksFailed(String),
    #[error("Unexpected netCDF error")]
    NcError,
    #[error("Unexpected I/O error: {0}")]
    IoError(String),
    #[error("{0}")]
    UserError(String),
}

/// Create precipitation-as-snow data from precipitation, tasmin, and tasmax
/// files.
///
/// Wherever the daily mean of tasmin and tasmax is below freezing, the
/// precipitation value is kept as snowfall; everywhere else the output is
/// masked.
#[derive(Debug, Parser)]
struct Cli {
    /// Report whether the inputs are usable without writing any output.
    #[clap(short = 'd', long)]
    dry_run: bool,

    /// Number of time slices read and written at a time.
    #[clap(short = 'c', long, default_value_t = 100)]
    chunk_size: usize,

    /// Precipitation file to process.
    #[clap(short = 'p', long)]
    prec: PathBuf,

    /// Daily-minimum temperature file to process.
    #[clap(short = 'n', long)]
    tasmin: PathBuf,

    /// Daily-maximum temperature file to process.
    #[clap(short = 'x', long)]
    tasmax: PathBuf,

    /// Output directory.
    #[clap(short = 'o', long)]
    outdir: PathBuf,

    /// Optional custom name for the output file.
    #[clap(short = 'f', long)]
    output_file: Option<String>,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}
