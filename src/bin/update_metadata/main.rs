use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use error_stack::{Report, ResultExt};
use indexmap::IndexMap;
use log::{info, warn};
use netcdf::AttributeValue;

use climate_dp::logging::init_logging;
use climate_dp::nc;

mod updates;

use updates::{apply_updates, load_spec, AttrContent, Target, UpdateSpec};

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
    let spec = load_spec(&clargs.updates).map_err(|e| Report::new(CliError::Spec(e)))?;

    info!("Processing: {}", clargs.ncfile.display());
    patch_file(&spec, &clargs.ncfile, &clargs.output, &clargs.updates)?;
    info!("Output file: {}", clargs.output.display());
    Ok(())
}

/// Write a copy of the input file with the specified attribute updates
/// applied. The input is never modified, and no output file is left behind
/// on failure.
fn patch_file(
    spec: &UpdateSpec,
    input_path: &Path,
    output_path: &Path,
    updates_path: &Path,
) -> error_stack::Result<(), CliError> {
    let input = netcdf::open(input_path)
        .change_context(CliError::NcError)
        .attach_printable_lazy(|| format!("could not open {}", input_path.display()))?;

    for (target, _) in &spec.targets {
        if let Target::Variable(varname) = target {
            if input.variable(varname).is_none() {
                warn!("Updates section '{varname}' does not match any variable in the file");
            }
        }
    }

    let result = write_patched(spec, &input, output_path);
    if result.is_err() {
        // Do not leave a half-written file behind.
        let _ = std::fs::remove_file(output_path);
        return result;
    }

    let mut out = netcdf::append(output_path).change_context(CliError::NcError)?;
    nc::prepend_history(
        &mut out,
        &format!(
            "update_metadata -u {} -o {} {}",
            updates_path.display(),
            output_path.display(),
            input_path.display()
        ),
    )
    .change_context(CliError::NcError)?;
    Ok(())
}

fn write_patched(
    spec: &UpdateSpec,
    input: &netcdf::File,
    output_path: &Path,
) -> error_stack::Result<(), CliError> {
    let mut out = netcdf::create(output_path)
        .change_context(CliError::NcError)
        .attach_printable_lazy(|| format!("could not create {}", output_path.display()))?;

    nc::copy_dimensions(input, &mut out, &[]).change_context(CliError::NcError)?;

    // Global attributes.
    info!("global:");
    let mut global_attrs = read_attrs(input.attributes())?;
    for (target, ops) in &spec.targets {
        if *target == Target::Global {
            apply_updates(&mut global_attrs, ops);
        }
    }
    for (name, content) in global_attrs {
        out.add_attribute(&name, to_attribute_value(content))
            .change_context(CliError::NcError)?;
    }

    // Variables, with their data and (possibly updated) attributes.
    for var in input.variables() {
        let name = var.name();
        let dims: Vec<String> = var.dimensions().iter().map(|d| d.name()).collect();
        let dims: Vec<&str> = dims.iter().map(|d| d.as_str()).collect();

        let data = nc::NcArray::get_from(&var).change_context(CliError::NcError)?;
        let mut out_var = data
            .put_to(&mut out, &name, &dims)
            .change_context(CliError::NcError)?;

        let mut attrs = read_attrs(var.attributes())?;
        for (target, ops) in &spec.targets {
            if *target == Target::Variable(name.clone()) {
                info!("{name}:");
                apply_updates(&mut attrs, ops);
            }
        }
        for (attr_name, content) in attrs {
            out_var
                .add_attribute(&attr_name, to_attribute_value(content))
                .change_context(CliError::NcError)?;
        }
    }
    Ok(())
}

/// Snapshot attributes into the update machinery's representation. Strings
/// are converted so transforms can read them; everything else passes
/// through untouched.
fn read_attrs<'a>(
    attrs: impl Iterator<Item = netcdf::Attribute<'a>>,
) -> error_stack::Result<IndexMap<String, AttrContent<AttributeValue>>, CliError> {
    let mut map = IndexMap::new();
    for attr in attrs {
        let value = attr.value().change_context(CliError::NcError)?;
        let content = match value {
            AttributeValue::Str(s) => AttrContent::Str(s),
            other => AttrContent::Other(other),
        };
        map.insert(attr.name().to_string(), content);
    }
    Ok(map)
}

fn to_attribute_value(content: AttrContent<AttributeValue>) -> AttributeValue {
    match content {
        AttrContent::Str(s) => AttributeValue::Str(s),
        AttrContent::Int(i) => {
            if let Ok(small) = i32::try_from(i) {
                AttributeValue::Int(small)
            } else {
                AttributeValue::Longlong(i)
            }
        }
        AttrContent::Float(f) => AttributeValue::Double(f),
        AttrContent::Other(value) => value,
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Spec(#[from] updates::SpecError),
    #[error("Unexpected netCDF error")]
    NcError,
}

/// Update netCDF file attributes from an updates specification file (TOML
/// or JSON), writing the result to a new file.
///
/// Each section of the specification targets the global attributes
/// (`[global]`) or one variable's attributes (`[<varname>]`). Values are
/// set verbatim, with two special string forms: "<-old_name" renames an
/// existing attribute, and "=normalize_experiment_id(attr)" or
/// "=parse_ensemble_code(attr)" computes values from another attribute. A
/// "delete" key lists attributes to remove.
#[derive(Debug, Parser)]
struct Cli {
    /// File containing the updates specification.
    #[clap(short = 'u', long)]
    updates: PathBuf,

    /// Path to write the updated copy to.
    #[clap(short = 'o', long)]
    output: PathBuf,

    /// netCDF file to update.
    ncfile: PathBuf,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}
