use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use error_stack::ResultExt;
use log::info;
use netcdf::Extents;

use climate_dp::logging::init_logging;
use climate_dp::nc;

/// Unit vectors for each VIC routing code: 0 filler, 1-8 the compass
/// directions N, NE, E, SE, S, SW, W, NW, 9 outlet. Stored as
/// (northward, eastward).
const TWO_GRID_VECTORS: [[f64; 2]; 10] = [
    [0.0, 0.0],
    [1.0, 0.0],
    [0.7071, 0.7071],
    [0.0, 1.0],
    [-0.7071, 0.7071],
    [-1.0, 0.0],
    [-0.7071, -0.7071],
    [0.0, -1.0],
    [0.7071, -0.7071],
    [0.0, 0.0],
];

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
    let source = netcdf::open(&clargs.source_file)
        .change_context(CliError::NcError)
        .attach_printable_lazy(|| format!("could not open {}", clargs.source_file.display()))?;

    source_check(&source, &clargs.source_file)?;
    variable_check(&source, &clargs.variable)?;

    let result =
        decompose_flow_vectors(&source, &clargs.source_file, &clargs.dest_file, &clargs.variable);
    if result.is_err() {
        // Do not leave a half-written file behind.
        let _ = std::fs::remove_file(&clargs.dest_file);
    }
    result
}

/// The source file must carry a lat/lon grid and at least one variable that
/// looks like a flow-direction field.
fn source_check(source: &netcdf::File, path: &Path) -> error_stack::Result<(), CliError> {
    if !has_latlon_dims(source) {
        return Err(CliError::InvalidSource(format!(
            "{} does not have latitude and longitude dimensions",
            path.display()
        ))
        .into());
    }

    for var in source.variables() {
        if var_on_grid(&var) && values_are_directions(&var)? {
            return Ok(());
        }
    }
    Err(CliError::InvalidSource(format!(
        "{} does not have a valid flow variable",
        path.display()
    ))
    .into())
}

/// The selected variable must exist, sit on the lat/lon grid, and contain
/// only routing codes.
fn variable_check(source: &netcdf::File, variable: &str) -> error_stack::Result<(), CliError> {
    let var = source
        .variable(variable)
        .ok_or_else(|| CliError::InvalidVariable(format!("Variable {variable} not found")))?;

    if !var_on_grid(&var) {
        return Err(
            CliError::InvalidVariable(format!("Variable {variable} is not associated with a grid"))
                .into(),
        );
    }
    if !values_are_directions(&var)? {
        return Err(CliError::InvalidVariable(format!(
            "Variable {variable} is not a valid flow routing"
        ))
        .into());
    }
    Ok(())
}

fn has_latlon_dims(source: &netcdf::File) -> bool {
    let mut has_lat = false;
    let mut has_lon = false;
    for dim in source.dimensions() {
        match dim.name().as_str() {
            "lat" => has_lat = true,
            "lon" => has_lon = true,
            _ => (),
        }
    }
    has_lat && has_lon
}

fn var_on_grid(var: &netcdf::Variable) -> bool {
    let dims: Vec<String> = var.dimensions().iter().map(|d| d.name()).collect();
    dims.iter().any(|d| d == "lat") && dims.iter().any(|d| d == "lon")
}

/// True when every unmasked value is a routing code in 1..=9.
fn values_are_directions(var: &netcdf::Variable) -> error_stack::Result<bool, CliError> {
    let fill = nc::var_numeric_attr(var, "_FillValue")
        .or_else(|| nc::var_numeric_attr(var, "missing_value"));
    let values = var
        .get::<f64, _>(Extents::All)
        .change_context(CliError::NcError)?;
    let mut any = false;
    for &v in values.iter() {
        if v.is_nan() || fill.is_some_and(|f| v == f) {
            continue;
        }
        if !(1.0..=9.0).contains(&v) {
            return Ok(false);
        }
        any = true;
    }
    Ok(any)
}

/// Write a new file with the flow grid decomposed into normalized eastward
/// and northward component variables.
fn decompose_flow_vectors(
    source: &netcdf::File,
    source_path: &Path,
    dest_path: &Path,
    variable: &str,
) -> error_stack::Result<(), CliError> {
    let mut dest = netcdf::create(dest_path)
        .change_context(CliError::NcError)
        .attach_printable_lazy(|| format!("could not create {}", dest_path.display()))?;

    for axis in ["lat", "lon"] {
        copy_graticule_variable(source, &mut dest, axis)?;
    }

    for (direction, component) in [("east", 1usize), ("north", 0usize)] {
        write_vector_component(source, &mut dest, variable, direction, component)?;
    }

    nc::copy_global_attrs(source, &mut dest, None).change_context(CliError::NcError)?;
    nc::prepend_history(
        &mut dest,
        &format!(
            "decompose_flow_vectors {} {} {variable}",
            source_path.display(),
            dest_path.display()
        ),
    )
    .change_context(CliError::NcError)?;

    info!("Wrote vector components to {}", dest_path.display());
    Ok(())
}

/// Copy one axis (dimension plus coordinate variable) to the output file.
fn copy_graticule_variable(
    source: &netcdf::File,
    dest: &mut netcdf::FileMut,
    axis: &str,
) -> error_stack::Result<(), CliError> {
    let len = source
        .dimensions()
        .find(|d| d.name() == axis)
        .map(|d| d.len())
        .ok_or_else(|| CliError::InvalidSource(format!("source has no '{axis}' dimension")))?;
    dest.add_dimension(axis, len)
        .change_context(CliError::NcError)?;

    let src_var = source
        .variable(axis)
        .ok_or_else(|| CliError::InvalidSource(format!("source has no '{axis}' variable")))?;
    let values = src_var
        .get::<f64, _>(Extents::All)
        .change_context(CliError::NcError)?;
    let mut dst_var = dest
        .add_variable::<f64>(axis, &[axis])
        .change_context(CliError::NcError)?;
    dst_var
        .put(values.view(), Extents::All)
        .change_context(CliError::NcError)?;
    nc::copy_variable_attrs(&src_var, &mut dst_var, &[]).change_context(CliError::NcError)?;
    Ok(())
}

/// Map routing codes onto one unit-vector component and write it as
/// `<direction>ward_<variable>`.
fn write_vector_component(
    source: &netcdf::File,
    dest: &mut netcdf::FileMut,
    variable: &str,
    direction: &str,
    component: usize,
) -> error_stack::Result<(), CliError> {
    info!("Generating {direction}ward component");

    let src_var = source
        .variable(variable)
        .ok_or_else(|| CliError::InvalidVariable(format!("Variable {variable} not found")))?;
    let values = src_var
        .get::<f64, _>(Extents::All)
        .change_context(CliError::NcError)?;
    let components = values.mapv(|v| {
        if (0.0..=9.0).contains(&v) {
            TWO_GRID_VECTORS[v as usize][component]
        } else {
            v
        }
    });

    let name = format!("{direction}ward_{variable}");
    let mut var = dest
        .add_variable::<f64>(&name, &["lat", "lon"])
        .change_context(CliError::NcError)?;
    var.put(components.view(), Extents::All)
        .change_context(CliError::NcError)?;
    var.add_attribute("units", "1")
        .change_context(CliError::NcError)?;
    // ncWMS matches vector pairs on standard names.
    var.add_attribute("standard_name", name.as_str())
        .change_context(CliError::NcError)?;
    var.add_attribute(
        "long_name",
        format!("Normalized {direction}ward vector component of {variable}"),
    )
    .change_context(CliError::NcError)?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    InvalidSource(String),
    #[error("{0}")]
    InvalidVariable(String),
    #[error("Unexpected netCDF error")]
    NcError,
}

/// Decompose an indexed flow-direction grid into eastward and northward
/// unit-vector components suitable for ncWMS vector display.
#[derive(Debug, Parser)]
struct Cli {
    /// Source netCDF file.
    #[clap(value_name = "infile")]
    source_file: PathBuf,

    /// Destination netCDF file.
    #[clap(value_name = "outfile")]
    dest_file: PathBuf,

    /// netCDF variable describing flow direction.
    #[clap(value_name = "variable")]
    variable: String,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}
