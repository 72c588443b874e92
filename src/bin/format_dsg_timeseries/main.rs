use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use error_stack::{Report, ResultExt};
use log::info;

use climate_dp::logging::init_logging;
use climate_dp::nc;

mod discovery;

use discovery::{
    guess_id_variable, guess_instance_dimension, is_instance_variable, text_dimension, DimType,
    VarInfo,
};

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
    let input = netcdf::open(&clargs.input_file)
        .change_context(CliError::NcError)
        .attach_printable_lazy(|| format!("could not open {}", clargs.input_file.display()))?;

    let dim_names: Vec<String> = input.dimensions().map(|d| d.name()).collect();
    let var_infos = collect_var_infos(&input)?;

    // The dimension counting the sampling locations, and the variable that
    // uniquely identifies each of them. Either can be given explicitly.
    let instance_dim = match &clargs.instance_dim {
        Some(dim) => {
            if !dim_names.contains(dim) {
                return Err(CliError::UserError(format!(
                    "file has no '{dim}' dimension"
                ))
                .into());
            }
            dim.clone()
        }
        None => guess_instance_dimension(&dim_names)
            .map_err(|e| Report::new(CliError::Discovery(e)))?
            .to_string(),
    };
    info!("Instance dimension: {instance_dim}");

    let id_var = match &clargs.id_var {
        Some(var) => {
            if !var_infos.iter().any(|v| v.name == *var) {
                return Err(CliError::UserError(format!("file has no '{var}' variable")).into());
            }
            var.clone()
        }
        None => guess_id_variable(&var_infos, &instance_dim)
            .map_err(|e| Report::new(CliError::Discovery(e)))?
            .to_string(),
    };
    info!("Location ID variable: {id_var}");

    if clargs.dry_run {
        info!("DRY RUN: no output written");
        return Ok(());
    }

    let output_path = output_filepath(&clargs)?;
    let result = write_dsg_file(
        &input,
        &var_infos,
        &instance_dim,
        &id_var,
        &clargs,
        &output_path,
    );
    if result.is_err() {
        info!("Cleaning up output file after error");
        let _ = std::fs::remove_file(&output_path);
        return result;
    }

    info!(
        "Discrete sampling geometry written to {}",
        output_path.display()
    );
    Ok(())
}

fn collect_var_infos(input: &netcdf::File) -> error_stack::Result<Vec<VarInfo>, CliError> {
    let mut infos = Vec::new();
    for var in input.variables() {
        let cf_role = nc::var_str_attr(&var, "cf_role").change_context(CliError::NcError)?;
        infos.push(VarInfo {
            name: var.name(),
            dims: var.dimensions().iter().map(|d| d.name()).collect(),
            cf_role,
            is_char: matches!(var.vartype(), netcdf::types::NcVariableType::Char),
        });
    }
    Ok(infos)
}

fn output_filepath(clargs: &Cli) -> error_stack::Result<PathBuf, CliError> {
    let filename = match &clargs.output_file {
        Some(name) => name.clone(),
        None => {
            let stem = clargs
                .input_file
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| {
                    CliError::UserError("input file has no usable file name".to_string())
                })?;
            format!("{stem}_dsg.nc")
        }
    };
    std::fs::create_dir_all(&clargs.outdir)
        .map_err(|e| Report::new(CliError::IoError(e.to_string())))?;
    Ok(clargs.outdir.join(filename))
}

/// Write the reshaped file: string-length dimensions collapsed, the id
/// variable marked with its CF role, instance variables advertised to the
/// data variables, and the global metadata brought along.
fn write_dsg_file(
    input: &netcdf::File,
    var_infos: &[VarInfo],
    instance_dim: &str,
    id_var: &str,
    clargs: &Cli,
    output_path: &Path,
) -> error_stack::Result<(), CliError> {
    let mut out = netcdf::create(output_path)
        .change_context(CliError::NcError)
        .attach_printable_lazy(|| format!("could not create {}", output_path.display()))?;

    // String-length dimensions disappear; character variables become
    // proper string variables.
    info!("Copying dimensions");
    let text_dims: Vec<String> = input
        .dimensions()
        .map(|d| d.name())
        .filter(|name| discovery::guess_dim_type(name) == Some(DimType::Text))
        .collect();
    let skip: Vec<&str> = text_dims.iter().map(|s| s.as_str()).collect();
    nc::copy_dimensions(input, &mut out, &skip).change_context(CliError::NcError)?;

    let instance_vars: Vec<&str> = var_infos
        .iter()
        .filter(|v| is_instance_variable(v, instance_dim))
        .map(|v| v.name.as_str())
        .collect();

    for info in var_infos {
        write_variable(input, &mut out, info, id_var, &instance_vars)?;
    }

    // Global metadata, plus anything imported from auxiliary files.
    info!("Copying global metadata");
    nc::copy_global_attrs(input, &mut out, None).change_context(CliError::NcError)?;
    out.add_attribute("featureType", "timeSeries")
        .change_context(CliError::NcError)?;

    for spec in &clargs.metadata {
        let (prefix, path) = match spec.split_once(':') {
            Some((prefix, path)) => (Some(prefix), PathBuf::from(path)),
            None => (None, PathBuf::from(spec)),
        };
        info!("Adding additional metadata from {}", path.display());
        let md_file = netcdf::open(&path)
            .change_context(CliError::NcError)
            .attach_printable_lazy(|| format!("could not open {}", path.display()))?;
        let copied = nc::copy_global_attrs(&md_file, &mut out, prefix)
            .change_context(CliError::NcError)?;
        info!("Copied {copied} attributes");
    }

    info!("Updating history attribute");
    nc::prepend_history(
        &mut out,
        &format!(
            "format_dsg_timeseries -o {} -i {instance_dim} -c {id_var} {}",
            clargs.outdir.display(),
            clargs.input_file.display()
        ),
    )
    .change_context(CliError::NcError)?;
    Ok(())
}

fn write_variable(
    input: &netcdf::File,
    out: &mut netcdf::FileMut,
    info: &VarInfo,
    id_var: &str,
    instance_vars: &[&str],
) -> error_stack::Result<(), CliError> {
    let var = input
        .variable(&info.name)
        .ok_or_else(|| CliError::UserError(format!("file has no '{}' variable", info.name)))?;

    let text_dim = text_dimension(info).map_err(|e| Report::new(CliError::Discovery(e)))?;

    let mut out_var = if let Some(text_dim) = text_dim {
        // Collapse the character matrix into one string per instance.
        let chars = var
            .get::<u8, _>(netcdf::Extents::All)
            .change_context(CliError::NcError)?;
        let strings = nc::char_array_to_strings(&chars);
        let dims: Vec<&str> = info
            .dims
            .iter()
            .filter(|d| d.as_str() != text_dim)
            .map(|d| d.as_str())
            .collect();
        let mut out_var = out
            .add_string_variable(&info.name, &dims)
            .change_context(CliError::NcError)?;
        for (i, s) in strings.iter().enumerate() {
            let ext: netcdf::Extents = i.into();
            out_var
                .put_string(s, ext)
                .change_context(CliError::NcError)?;
        }
        out_var
    } else {
        let dims: Vec<&str> = info.dims.iter().map(|d| d.as_str()).collect();
        let data = nc::NcArray::get_from(&var).change_context(CliError::NcError)?;
        data.put_to(out, &info.name, &dims)
            .change_context(CliError::NcError)?
    };

    nc::copy_variable_attrs(&var, &mut out_var, &["cf_role"]).change_context(CliError::NcError)?;

    if info.name == id_var {
        out_var
            .add_attribute("cf_role", "timeseries_id")
            .change_context(CliError::NcError)?;
    } else if !info.dims.is_empty() && !instance_vars.contains(&info.name.as_str()) {
        // Data variables advertise the instance variables that describe
        // their locations.
        out_var
            .add_attribute("coordinates", instance_vars.join(" "))
            .change_context(CliError::NcError)?;
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Discovery(#[from] discovery::DiscoveryError),
    #[error("Unexpected netCDF error")]
    NcError,
    #[error("Unexpected I/O error: {0}")]
    IoError(String),
    #[error("{0}")]
    UserError(String),
}

/// Reshape a station-timeseries netCDF file to the CF discrete-sampling-
/// geometry standard.
///
/// The output designates an instance dimension and a timeseries-id
/// variable, converts character variables with a string-length dimension to
/// string variables, and stamps the file as featureType "timeSeries". The
/// original file is unchanged.
#[derive(Debug, Parser)]
struct Cli {
    /// Source netCDF file.
    input_file: PathBuf,

    /// Output folder.
    #[clap(short = 'o', long)]
    outdir: PathBuf,

    /// Optional custom name for the output file.
    #[clap(short = 'f', long)]
    output_file: Option<String>,

    /// Dimension that counts the sampling locations. Guessed from the data
    /// when not given.
    #[clap(short = 'i', long)]
    instance_dim: Option<String>,

    /// Variable uniquely identifying each location. Guessed from the data
    /// when not given.
    #[clap(short = 'c', long)]
    id_var: Option<String>,

    /// Additional files to import global metadata from, as PATH or
    /// PREFIX:PATH (attributes are then namespaced as PREFIX__name).
    #[clap(short = 'm', long = "metadata")]
    metadata: Vec<String>,

    /// Analyze the file and report the chosen dimension and id variable
    /// without writing output.
    #[clap(short = 'n', long)]
    dry_run: bool,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}
