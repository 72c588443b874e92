//! The climatology-generation pipeline: temporal subsetting, planned
//! aggregation, metadata/time-axis rewriting, and final file placement.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use error_stack::{Report, ResultExt};
use log::{debug, info, warn};
use netcdf::Extents;
use tabled::{Table, Tabled};

use climate_dp::cdo::{install_output, Cdo};
use climate_dp::climo::{
    build_plan, classify, file_category, frequency, periods::standard_climo_periods,
    AggregationPlan, ClimoError, ClimoStat, PlanSource, TimeResolution, VarCategory,
};
use climate_dp::nc;
use climate_dp::units::{Unit, SECONDS_PER_DAY};

#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    #[error("{0}")]
    Climo(#[from] ClimoError),
    #[error("File already contains climatological statistics")]
    AlreadyClimatology,
    #[error("Unknown climatological period code '{0}'")]
    UnknownPeriod(String),
    #[error("Unexpected netCDF error")]
    NcError,
    #[error("CDO invocation failed")]
    CdoError,
    #[error("{0}")]
    UserError(String),
}

#[derive(Debug, Clone)]
pub(crate) struct ClimoOptions {
    pub operation: ClimoStat,
    pub convert_longitudes: bool,
    pub split_vars: bool,
    pub split_intervals: bool,
    pub resolutions: Vec<TimeResolution>,
    /// Period codes selected on the command line; empty means every standard
    /// period the file covers.
    pub periods: Vec<String>,
    pub outdir: PathBuf,
}

/// Everything we need to know about an input file before aggregating it.
struct InputSummary {
    varnames: Vec<String>,
    category: VarCategory,
    native: TimeResolution,
    metadata: nc::FileMetadata,
    tracking_id: Option<String>,
    pr_units: HashMap<String, String>,
    periods: Vec<(String, NaiveDateTime, NaiveDateTime)>,
}

fn summarize_input(
    file: &netcdf::File,
    opts: &ClimoOptions,
) -> error_stack::Result<InputSummary, CliError> {
    if nc::is_multi_year(file).change_context(CliError::NcError)? {
        return Err(CliError::AlreadyClimatology.into());
    }

    let varnames = nc::dependent_varnames(file).change_context(CliError::NcError)?;
    let category = file_category(&varnames).map_err(|e| Report::new(CliError::Climo(e)))?;
    let native = nc::time_resolution(file).change_context(CliError::NcError)?;
    let metadata = nc::file_metadata(file).change_context(CliError::NcError)?;
    let tracking_id = nc::global_str_attr(file, "tracking_id").change_context(CliError::NcError)?;

    // Units of rate variables that may need per-second to per-day rescaling.
    let mut pr_units = HashMap::new();
    for name in ["pr", "prsn"] {
        if let Some(var) = file.variable(name) {
            if let Some(units) = nc::var_str_attr(&var, "units").change_context(CliError::NcError)? {
                pr_units.insert(name.to_string(), units);
            }
        }
    }

    let periods = select_periods(file, opts)?;

    Ok(InputSummary {
        varnames,
        category,
        native,
        metadata,
        tracking_id,
        pr_units,
        periods,
    })
}

/// The standard periods to process: those selected (or all), restricted to
/// the time range the file actually covers.
fn select_periods(
    file: &netcdf::File,
    opts: &ClimoOptions,
) -> error_stack::Result<Vec<(String, NaiveDateTime, NaiveDateTime)>, CliError> {
    let all = standard_climo_periods();
    let mut selected = Vec::new();
    if opts.periods.is_empty() {
        selected.extend(all.iter().map(|(code, span)| (code.to_string(), *span)));
    } else {
        for code in &opts.periods {
            let span = all
                .get(code.as_str())
                .ok_or_else(|| CliError::UnknownPeriod(code.clone()))?;
            selected.push((code.clone(), *span));
        }
    }

    let (file_start, file_end) = nc::time_range(file).change_context(CliError::NcError)?;
    Ok(selected
        .into_iter()
        .filter(|(code, (start, end))| {
            let covered = file_start <= *start && *end <= file_end;
            if !covered {
                debug!("Period {code} is not covered by the file's time range; skipping");
            }
            covered
        })
        .map(|(code, (start, end))| (code, start, end))
        .collect())
}

/// Process one input file: generate climatologies for every applicable
/// period. Returns the final output paths.
pub(crate) fn process_file(
    input_path: &Path,
    opts: &ClimoOptions,
) -> error_stack::Result<Vec<PathBuf>, CliError> {
    let file = netcdf::open(input_path).change_context(CliError::NcError)?;
    let summary = summarize_input(&file, opts)?;
    drop(file);

    if summary.periods.is_empty() {
        warn!(
            "No climatological periods are available within {}; nothing to do",
            input_path.display()
        );
        return Ok(vec![]);
    }

    let cdo = Cdo::new().change_context(CliError::CdoError)?;
    let mut outputs = Vec::new();
    for (code, t_start, t_end) in &summary.periods {
        info!("Generating climo period {code} ({t_start} to {t_end})");
        outputs.extend(create_climo_files(
            &cdo, input_path, &summary, *t_start, *t_end, opts,
        )?);
    }
    Ok(outputs)
}

/// Generate the climatology files for one period of one input file.
fn create_climo_files(
    cdo: &Cdo,
    input_path: &Path,
    summary: &InputSummary,
    t_start: NaiveDateTime,
    t_end: NaiveDateTime,
    opts: &ClimoOptions,
) -> error_stack::Result<Vec<PathBuf>, CliError> {
    let plan = build_plan(
        summary.category,
        summary.native,
        &opts.resolutions,
        opts.operation,
    )
    .map_err(|e| Report::new(CliError::Climo(e)))?;

    if plan.is_empty() {
        // The planner has already logged which resolutions were unreachable.
        return Ok(vec![]);
    }

    info!("Selecting temporal subset");
    let subset = cdo
        .seldate(t_start, t_end, input_path)
        .change_context(CliError::CdoError)?;

    // Materialize intermediate aggregates, finest first; each reads either
    // the subset or the intermediate written just before it.
    let mut intermediates: HashMap<TimeResolution, PathBuf> = HashMap::new();
    for step in plan.intermediates() {
        let source = match step.source {
            PlanSource::Native => &subset,
            PlanSource::Intermediate(res) => &intermediates[&res],
        };
        debug!("Materializing {} intermediate ({})", step.resolution, step.cdo_operator());
        let out = cdo
            .apply(&step.cdo_operator(), &[source.as_path()])
            .change_context(CliError::CdoError)?;
        intermediates.insert(step.resolution, out);
    }

    info!("Forming climatological {}s", opts.operation.cdo_suffix());
    let mut interval_files: Vec<(Vec<TimeResolution>, PathBuf)> = Vec::new();
    for step in plan.outputs() {
        let source = match step.source {
            PlanSource::Native => &subset,
            PlanSource::Intermediate(res) => &intermediates[&res],
        };
        let out = cdo
            .apply(&step.cdo_operator(), &[source.as_path()])
            .change_context(CliError::CdoError)?;
        interval_files.push((vec![step.target], out));
    }

    // Optionally concatenate the per-interval files into one.
    if !opts.split_intervals && interval_files.len() > 1 {
        info!("Concatenating {} interval files", interval_files.len());
        let paths: Vec<&Path> = interval_files.iter().map(|(_, p)| p.as_path()).collect();
        let merged = cdo.copy(&paths).change_context(CliError::CdoError)?;
        let intervals = interval_files.into_iter().flat_map(|(i, _)| i).collect();
        interval_files = vec![(intervals, merged)];
    }

    for (intervals, path) in &interval_files {
        postprocess(path, input_path, intervals, summary, t_start, t_end, opts)?;
    }

    // Optionally split into one file per dependent variable.
    let mut final_files: Vec<(String, Vec<TimeResolution>, PathBuf)> = Vec::new();
    if opts.split_vars && summary.varnames.len() > 1 {
        info!("Splitting into single-variable files");
        for (intervals, path) in &interval_files {
            for varname in &summary.varnames {
                let split = cdo
                    .select_variable(varname, path)
                    .change_context(CliError::CdoError)?;
                final_files.push((varname.clone(), intervals.clone(), split));
            }
        }
    } else {
        for (intervals, path) in interval_files {
            final_files.push((summary.varnames.join("+"), intervals, path));
        }
    }

    // Move the finished files into the output directory. A failure to place
    // one file is logged and does not abandon its siblings.
    let mut outputs = Vec::new();
    for (var_part, intervals, path) in final_files {
        let filename = nc::climo_output_filename(
            &var_part,
            &frequency::frequency_code(&intervals, Some(opts.operation)),
            &summary.metadata,
            t_start,
            t_end,
        );
        let dest = opts.outdir.join(filename);
        info!("Output file: {}", dest.display());
        match install_output(&path, &dest) {
            Ok(()) => outputs.push(dest),
            Err(e) => warn!("Failed to create climatology file {}: {e}", dest.display()),
        }
    }
    Ok(outputs)
}

/// Rewrite one aggregated file in place: longitudes, rate-variable units,
/// climatology metadata, and the CF climatological time axis.
fn postprocess(
    path: &Path,
    input_path: &Path,
    intervals: &[TimeResolution],
    summary: &InputSummary,
    t_start: NaiveDateTime,
    t_end: NaiveDateTime,
    opts: &ClimoOptions,
) -> error_stack::Result<(), CliError> {
    let mut out = netcdf::append(path).change_context(CliError::NcError)?;

    if opts.convert_longitudes {
        debug!("Converting longitudes");
        nc::convert_longitude_range(&mut out).change_context(CliError::NcError)?;
    }

    for (varname, units) in &summary.pr_units {
        convert_rate_units(&mut out, varname, units)?;
    }

    debug!("Updating climo metadata");
    let code = frequency::frequency_code(intervals, Some(opts.operation));
    out.add_attribute("frequency", code.as_str())
        .change_context(CliError::NcError)?;
    out.add_attribute(
        "climo_start_time",
        format!("{}Z", t_start.format("%Y-%m-%dT%H:%M:%S")),
    )
    .change_context(CliError::NcError)?;
    out.add_attribute(
        "climo_end_time",
        format!("{}Z", t_end.format("%Y-%m-%dT%H:%M:%S")),
    )
    .change_context(CliError::NcError)?;
    if let Some(tracking_id) = &summary.tracking_id {
        out.add_attribute("climo_tracking_id", tracking_id.as_str())
            .change_context(CliError::NcError)?;
    }

    nc::append_cell_method(&mut out, &summary.varnames, opts.operation.cell_method())
        .change_context(CliError::NcError)?;
    nc::prepend_history(
        &mut out,
        &format!(
            "generate_climos -p {} -o {} {}",
            opts.operation.cdo_suffix(),
            opts.outdir.display(),
            input_path.display()
        ),
    )
    .change_context(CliError::NcError)?;

    rewrite_time_axis(&mut out, intervals, t_start, t_end)?;
    Ok(())
}

/// Replace the time values with CF climatological times and attach a
/// climatology bounds variable.
fn rewrite_time_axis(
    out: &mut netcdf::FileMut,
    intervals: &[TimeResolution],
    t_start: NaiveDateTime,
    t_end: NaiveDateTime,
) -> error_stack::Result<(), CliError> {
    let (times, bounds) = frequency::climo_time_values(t_start, t_end, intervals);
    let (_, encoding) = nc::read_time_axis(out).change_context(CliError::NcError)?;

    let (time_units, time_calendar) = {
        let time_var = out
            .variable("time")
            .ok_or_else(|| Report::new(CliError::NcError))
            .attach_printable("aggregated file has no time variable")?;
        (
            nc::var_str_attr(&time_var, "units").change_context(CliError::NcError)?,
            nc::var_str_attr(&time_var, "calendar").change_context(CliError::NcError)?,
        )
    };

    let encoded_times: Vec<f64> = times.iter().map(|t| encoding.encode(*t)).collect();
    {
        let mut time_var = out
            .variable_mut("time")
            .ok_or_else(|| Report::new(CliError::NcError))
            .attach_printable("aggregated file has no time variable")?;
        time_var
            .put_values(&encoded_times, Extents::All)
            .change_context(CliError::NcError)
            .attach_printable(
                "the aggregated file holds a different number of time steps than expected",
            )?;
        time_var
            .add_attribute("climatology", "climatology_bnds")
            .change_context(CliError::NcError)?;
    }

    if !out.dimensions().any(|d| d.name() == "bnds") {
        out.add_dimension("bnds", 2).change_context(CliError::NcError)?;
    }

    let encoded_bounds: Vec<f32> = bounds
        .iter()
        .flat_map(|[start, end]| [encoding.encode(*start) as f32, encoding.encode(*end) as f32])
        .collect();
    let mut bnds_var = out
        .add_variable::<f32>("climatology_bnds", &["time", "bnds"])
        .change_context(CliError::NcError)?;
    if let Some(units) = time_units {
        bnds_var
            .add_attribute("units", units)
            .change_context(CliError::NcError)?;
    }
    if let Some(calendar) = time_calendar {
        bnds_var
            .add_attribute("calendar", calendar)
            .change_context(CliError::NcError)?;
    }
    bnds_var
        .put_values(&encoded_bounds, Extents::All)
        .change_context(CliError::NcError)?;
    Ok(())
}

/// Rescale a per-second rate variable to per-day, handling both packed and
/// unpacked storage. Packed data only needs its packing parameters scaled.
fn convert_rate_units(
    out: &mut netcdf::FileMut,
    varname: &str,
    units_str: &str,
) -> error_stack::Result<(), CliError> {
    let units = match Unit::parse(units_str) {
        Ok(units) => units,
        Err(e) => {
            debug!("Leaving '{varname}' units alone; could not parse '{units_str}': {e}");
            return Ok(());
        }
    };
    let Some(per_day) = units.per_second_to_per_day() else {
        return Ok(());
    };

    info!("Converting '{varname}' to units {}", per_day.to_udunits_string());
    let (scale_factor, add_offset, packed) = {
        let var = match out.variable(varname) {
            Some(var) => var,
            None => return Ok(()),
        };
        let scale_factor = nc::var_numeric_attr(&var, "scale_factor");
        let add_offset = nc::var_numeric_attr(&var, "add_offset");
        let packed = scale_factor.is_some() || add_offset.is_some();
        (scale_factor, add_offset, packed)
    };

    if packed {
        let mut var = out
            .variable_mut(varname)
            .ok_or_else(|| Report::new(CliError::NcError))?;
        var.add_attribute("scale_factor", SECONDS_PER_DAY * scale_factor.unwrap_or(1.0))
            .change_context(CliError::NcError)?;
        var.add_attribute("add_offset", SECONDS_PER_DAY * add_offset.unwrap_or(0.0))
            .change_context(CliError::NcError)?;
    } else {
        let values = out
            .variable(varname)
            .ok_or_else(|| Report::new(CliError::NcError))?
            .get::<f64, _>(Extents::All)
            .change_context(CliError::NcError)?;
        let scaled = values.mapv(|v| v * SECONDS_PER_DAY);
        let mut var = out
            .variable_mut(varname)
            .ok_or_else(|| Report::new(CliError::NcError))?;
        var.put(scaled.view(), Extents::All)
            .change_context(CliError::NcError)?;
    }

    let mut var = out
        .variable_mut(varname)
        .ok_or_else(|| Report::new(CliError::NcError))?;
    var.add_attribute("units", per_day.to_udunits_string())
        .change_context(CliError::NcError)?;
    Ok(())
}

#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "Resolution")]
    resolution: String,
    #[tabled(rename = "Reads")]
    source: String,
    #[tabled(rename = "Combining")]
    combining: String,
    #[tabled(rename = "Operator")]
    operator: String,
}

fn plan_table(plan: &AggregationPlan) -> String {
    let mut rows = Vec::new();
    for step in plan.intermediates() {
        rows.push(PlanRow {
            resolution: format!("{} (intermediate)", step.resolution),
            source: source_label(step.source),
            combining: step.op.to_string(),
            operator: step.cdo_operator(),
        });
    }
    for step in plan.outputs() {
        rows.push(PlanRow {
            resolution: step.target.to_string(),
            source: source_label(step.source),
            combining: step
                .combine
                .map(|op| op.to_string())
                .unwrap_or_else(|| "-".to_string()),
            operator: step.cdo_operator(),
        });
    }
    Table::new(rows).to_string()
}

fn source_label(source: PlanSource) -> String {
    match source {
        PlanSource::Native => "native data".to_string(),
        PlanSource::Intermediate(res) => format!("{res} intermediate"),
    }
}

/// Report what would be done for one input file, without invoking CDO or
/// writing anything.
pub(crate) fn dry_run_report(input_path: &Path, opts: &ClimoOptions) {
    info!("");
    info!("File: {}", input_path.display());
    let file = match netcdf::open(input_path) {
        Ok(file) => file,
        Err(e) => {
            info!("Could not open file: {e}");
            return;
        }
    };

    let summary = match summarize_input(&file, opts) {
        Ok(summary) => summary,
        Err(e) => {
            info!("Cannot process: {e:?}");
            return;
        }
    };

    info!(
        "dependent variables: {} (category: {})",
        summary.varnames.join(", "),
        summary.category
    );
    for name in &summary.varnames {
        // classify cannot fail here; file_category above already vetted it
        if let Ok(category) = classify(name) {
            debug!("  {name}: {category}");
        }
    }
    info!("time resolution: {}", summary.native);
    info!(
        "climo periods available: {}",
        summary
            .periods
            .iter()
            .map(|(code, _, _)| code.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    match build_plan(
        summary.category,
        summary.native,
        &opts.resolutions,
        opts.operation,
    ) {
        Ok(plan) if plan.is_empty() => {
            info!("Nothing to produce for this file");
        }
        Ok(plan) => {
            for line in plan_table(&plan).lines() {
                info!("{line}");
            }
            if let Some((_, t_start, t_end)) = summary.periods.first() {
                for target in plan.target_resolutions() {
                    let filename = nc::climo_output_filename(
                        &summary.varnames.join("+"),
                        &frequency::frequency_code(&[target], Some(opts.operation)),
                        &summary.metadata,
                        *t_start,
                        *t_end,
                    );
                    info!("would write: {}", opts.outdir.join(filename).display());
                }
            }
        }
        Err(e) => info!("Cannot plan aggregation: {e}"),
    }
}
