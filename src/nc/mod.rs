//! CF-flavoured helpers over the `netcdf` crate: dependent-variable
//! discovery, time-axis interpretation, attribute plumbing, and a generic
//! array type for structure-preserving copies.

use std::collections::HashSet;

use chrono::NaiveDateTime;
use itertools::Itertools;
use log::warn;
use ndarray::{ArrayD, Axis};
use netcdf::types::{FloatType, IntType, NcVariableType};
use netcdf::Extents;

use crate::climo::{frequency, TimeResolution};

pub mod time;

use time::TimeEncoding;

#[derive(Debug, thiserror::Error)]
pub enum NcError {
    #[error(transparent)]
    Nc(#[from] netcdf::Error),
    #[error("File has no '{0}' variable")]
    MissingVariable(String),
    #[error("Missing required attribute '{0}'")]
    MissingAttribute(String),
    #[error("Attribute '{0}' does not have a string value")]
    NotAString(String),
    #[error("Time units '{0}' are not understood")]
    BadTimeUnits(String),
    #[error("Calendar '{0}' is not supported")]
    UnsupportedCalendar(String),
    #[error("Could not determine time resolution: {0}")]
    TimeResolutionUnknown(String),
    #[error("Variable '{varname}' has unexpected shape: {reason}")]
    WrongShape { varname: String, reason: String },
    #[error("Variables of type {0} are not supported")]
    UnsupportedVarType(String),
}

/// Value of a global string attribute, or `None` when the file does not
/// carry it.
pub fn global_str_attr(file: &netcdf::File, name: &str) -> Result<Option<String>, NcError> {
    for attr in file.attributes() {
        if attr.name() == name {
            let value = attr.value()?;
            return String::try_from(value)
                .map(Some)
                .map_err(|_| NcError::NotAString(name.to_string()));
        }
    }
    Ok(None)
}

/// Value of a variable's string attribute, or `None` when absent.
pub fn var_str_attr(var: &netcdf::Variable, name: &str) -> Result<Option<String>, NcError> {
    match var.attribute_value(name) {
        None => Ok(None),
        Some(value) => {
            let value = value?;
            String::try_from(value)
                .map(Some)
                .map_err(|_| NcError::NotAString(format!("{}:{name}", var.name())))
        }
    }
}

/// Value of a variable's scalar numeric attribute, converted to f64.
/// `None` when absent or not a scalar number.
pub fn var_numeric_attr(var: &netcdf::Variable, name: &str) -> Option<f64> {
    use netcdf::AttributeValue::*;
    match var.attribute_value(name)?.ok()? {
        Uchar(v) => Some(v as f64),
        Schar(v) => Some(v as f64),
        Ushort(v) => Some(v as f64),
        Short(v) => Some(v as f64),
        Uint(v) => Some(v as f64),
        Int(v) => Some(v as f64),
        Ulonglong(v) => Some(v as f64),
        Longlong(v) => Some(v as f64),
        Float(v) => Some(v as f64),
        Double(v) => Some(v),
        _ => None,
    }
}

/// Names of a file's dependent variables: everything that is not a
/// coordinate variable, a bounds/climatology variable, a grid mapping, or an
/// auxiliary coordinate referenced from another variable's `coordinates`
/// attribute. Sorted for deterministic processing order.
pub fn dependent_varnames(file: &netcdf::File) -> Result<Vec<String>, NcError> {
    let dim_names: HashSet<String> = file.dimensions().map(|d| d.name()).collect();

    let mut auxiliary: HashSet<String> = HashSet::new();
    for var in file.variables() {
        for attr in ["bounds", "climatology", "grid_mapping"] {
            if let Some(target) = var_str_attr(&var, attr)? {
                auxiliary.insert(target);
            }
        }
        if let Some(coords) = var_str_attr(&var, "coordinates")? {
            auxiliary.extend(coords.split_whitespace().map(|s| s.to_string()));
        }
    }

    Ok(file
        .variables()
        .map(|var| var.name())
        .filter(|name| {
            !dim_names.contains(name)
                && !auxiliary.contains(name)
                && !name.ends_with("_bnds")
                && !name.ends_with("_bounds")
        })
        .sorted()
        .collect())
}

/// The time coordinate values and their encoding.
pub fn read_time_axis(file: &netcdf::File) -> Result<(Vec<f64>, TimeEncoding), NcError> {
    let var = file
        .variable("time")
        .ok_or_else(|| NcError::MissingVariable("time".to_string()))?;
    let units =
        var_str_attr(&var, "units")?.ok_or_else(|| NcError::MissingAttribute("time:units".to_string()))?;
    let calendar = var_str_attr(&var, "calendar")?;
    let encoding = TimeEncoding::parse(&units, calendar.as_deref())?;

    let values = var
        .get::<f64, _>(Extents::All)?
        .into_dimensionality::<ndarray::Ix1>()
        .map_err(|e| NcError::WrongShape {
            varname: "time".to_string(),
            reason: e.to_string(),
        })?
        .to_vec();
    Ok((values, encoding))
}

/// The native sampling interval of the file's time axis, judged from the
/// spacing of its first two time steps.
pub fn time_resolution(file: &netcdf::File) -> Result<TimeResolution, NcError> {
    let (values, encoding) = read_time_axis(file)?;
    if values.len() < 2 {
        return Err(NcError::TimeResolutionUnknown(
            "file has fewer than two time steps".to_string(),
        ));
    }

    let step = encoding.value_delta_days(values[1] - values[0]);
    let resolution = if (0.5..1.5).contains(&step) {
        TimeResolution::Daily
    } else if (27.0..32.0).contains(&step) {
        TimeResolution::Monthly
    } else if (85.0..95.0).contains(&step) {
        TimeResolution::Seasonal
    } else if (359.0..367.0).contains(&step) {
        TimeResolution::Yearly
    } else {
        return Err(NcError::TimeResolutionUnknown(format!(
            "time steps are {step:.2} days apart"
        )));
    };
    Ok(resolution)
}

/// First and last dates on the file's time axis.
pub fn time_range(file: &netcdf::File) -> Result<(NaiveDateTime, NaiveDateTime), NcError> {
    let (values, encoding) = read_time_axis(file)?;
    match (values.first(), values.last()) {
        (Some(first), Some(last)) => Ok((encoding.decode(*first), encoding.decode(*last))),
        _ => Err(NcError::TimeResolutionUnknown(
            "file has an empty time axis".to_string(),
        )),
    }
}

/// True when the file already contains multi-year statistics, judged from
/// its frequency code or climatology bookkeeping attributes.
pub fn is_multi_year(file: &netcdf::File) -> Result<bool, NcError> {
    if let Some(freq) = global_str_attr(file, "frequency")? {
        if frequency::parse_frequency(&freq).is_some() {
            return Ok(true);
        }
    }
    Ok(global_str_attr(file, "climo_start_time")?.is_some())
}

/// The identifying metadata used for output filenames and cross-file
/// compatibility checks, read from the first matching attribute alias.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileMetadata {
    pub model: Option<String>,
    pub experiment: Option<String>,
    pub ensemble: Option<String>,
    pub institution: Option<String>,
    pub project: Option<String>,
}

pub fn file_metadata(file: &netcdf::File) -> Result<FileMetadata, NcError> {
    let first_of = |names: &[&str]| -> Result<Option<String>, NcError> {
        for name in names {
            if let Some(value) = global_str_attr(file, name)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    };

    Ok(FileMetadata {
        model: first_of(&["model_id", "model", "driving_model_id"])?,
        experiment: first_of(&["experiment_id", "experiment", "emissions", "driving_experiment_name"])?,
        ensemble: first_of(&[
            "ensemble_member",
            "parent_experiment_rip",
            "driving_model_ensemble_member",
            "run",
        ])?,
        institution: first_of(&["institute_id", "institution", "institute"])?,
        project: first_of(&["project_id", "project"])?,
    })
}

/// CMOR-style output filename for a climatology file:
/// `<vars>_<frequency>_<model>_<experiment>_<ensemble>_<start>-<end>.nc`.
pub fn climo_output_filename(
    variable_part: &str,
    frequency_code: &str,
    meta: &FileMetadata,
    t_start: NaiveDateTime,
    t_end: NaiveDateTime,
) -> String {
    let sanitize = |s: &Option<String>| {
        s.as_deref()
            .map(|v| v.replace([' ', '_'], "+"))
            .unwrap_or_else(|| "unknown".to_string())
    };
    format!(
        "{variable_part}_{frequency_code}_{}_{}_{}_{}-{}.nc",
        sanitize(&meta.model),
        sanitize(&meta.experiment),
        sanitize(&meta.ensemble),
        t_start.format("%Y%m%d"),
        t_end.format("%Y%m%d"),
    )
}

/// Prepend a timestamped entry to the file's `history` attribute.
pub fn prepend_history(file: &mut netcdf::FileMut, entry: &str) -> Result<(), NcError> {
    let old = global_str_attr(file, "history")?.unwrap_or_default();
    let stamp = chrono::Local::now().format("%a %b %e %H:%M:%S %Y");
    let new = if old.is_empty() {
        format!("{stamp}: {entry}")
    } else {
        format!("{stamp}: {entry}\n{old}")
    };
    file.add_attribute("history", new)?;
    Ok(())
}

/// Copy every global attribute of `src` into `dest`, optionally under a
/// `<prefix>__` namespace. Attributes `dest` already has are left alone and
/// logged. Returns the number of attributes copied.
pub fn copy_global_attrs(
    src: &netcdf::File,
    dest: &mut netcdf::FileMut,
    prefix: Option<&str>,
) -> Result<usize, NcError> {
    let existing: HashSet<String> = dest.attributes().map(|a| a.name().to_string()).collect();

    let mut copied = 0;
    for attr in src.attributes() {
        let name = match prefix {
            Some(p) => format!("{p}__{}", attr.name()),
            None => attr.name().to_string(),
        };
        if existing.contains(&name) {
            warn!("Output file already has a '{name}' attribute; not overwriting it");
            continue;
        }
        let value = attr.value()?;
        dest.add_attribute(&name, value)?;
        copied += 1;
    }
    Ok(copied)
}

/// Copy the dimensions of `src` into `dest`, preserving unlimited
/// dimensions, skipping those named in `skip`.
pub fn copy_dimensions(
    src: &netcdf::File,
    dest: &mut netcdf::FileMut,
    skip: &[&str],
) -> Result<(), NcError> {
    for dim in src.dimensions() {
        let name = dim.name();
        if skip.contains(&name.as_str()) {
            continue;
        }
        if dim.is_unlimited() {
            dest.add_unlimited_dimension(&name)?;
        } else {
            dest.add_dimension(&name, dim.len())?;
        }
    }
    Ok(())
}

/// Copy a variable's attributes onto another variable, skipping those named
/// in `skip`.
pub fn copy_variable_attrs(
    src: &netcdf::Variable,
    dest: &mut netcdf::VariableMut,
    skip: &[&str],
) -> Result<(), NcError> {
    for attr in src.attributes() {
        if skip.contains(&attr.name()) {
            continue;
        }
        let value = attr.value()?;
        dest.add_attribute(attr.name(), value)?;
    }
    Ok(())
}

/// Append `time: <method> over days` to the `cell_methods` attribute of
/// every listed variable that already has one.
pub fn append_cell_method(
    file: &mut netcdf::FileMut,
    varnames: &[String],
    method: &str,
) -> Result<(), NcError> {
    for name in varnames {
        let current = match file.variable(name) {
            Some(var) => var_str_attr(&var, "cell_methods")?,
            None => None,
        };
        if let Some(current) = current {
            let mut var = file
                .variable_mut(name)
                .ok_or_else(|| NcError::MissingVariable(name.clone()))?;
            var.add_attribute("cell_methods", format!("{current} time: {method} over days"))?;
        }
    }
    Ok(())
}

/// Transform the longitude range of the file from [0, 360) to [-180, 180),
/// in place, covering the longitude variable and its bounds. Returns whether
/// anything changed.
pub fn convert_longitude_range(file: &mut netcdf::FileMut) -> Result<bool, NcError> {
    let lon_name = {
        let mut found = None;
        for var in file.variables() {
            let name = var.name();
            let is_lon = name == "lon"
                || name == "longitude"
                || var_str_attr(&var, "standard_name")?.as_deref() == Some("longitude");
            if is_lon {
                found = Some(name);
                break;
            }
        }
        match found {
            Some(name) => name,
            None => return Ok(false),
        }
    };

    let bounds_name = {
        let var = file
            .variable(&lon_name)
            .ok_or_else(|| NcError::MissingVariable(lon_name.clone()))?;
        var_str_attr(&var, "bounds")?
    };

    let mut changed = false;
    for name in std::iter::once(lon_name).chain(bounds_name) {
        let values = match file.variable(&name) {
            Some(var) => var.get::<f64, _>(Extents::All)?,
            None => continue,
        };
        let converted = values.mapv(|lon| if lon >= 180.0 { lon - 360.0 } else { lon });
        if converted != values {
            let mut var = file
                .variable_mut(&name)
                .ok_or_else(|| NcError::MissingVariable(name.clone()))?;
            var.put(converted.view(), Extents::All)?;
            changed = true;
        }
    }
    Ok(changed)
}

/// Decode a character array whose trailing axis is a string-length
/// dimension into one string per leading index, trimming NULs and padding.
pub fn char_array_to_strings(arr: &ArrayD<u8>) -> Vec<String> {
    let last_axis = Axis(arr.ndim().saturating_sub(1));
    arr.lanes(last_axis)
        .into_iter()
        .map(|lane| {
            let bytes: Vec<u8> = lane
                .iter()
                .copied()
                .take_while(|b| *b != 0)
                .collect();
            String::from_utf8_lossy(&bytes).trim_end().to_string()
        })
        .collect()
}

/// A type that can hold any of the array payloads stored in a netCDF file.
/// Best created by reading a variable with [`NcArray::get_from`].
pub enum NcArray {
    I8(ArrayD<i8>),
    I16(ArrayD<i16>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
    U64(ArrayD<u64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    Char(ArrayD<u8>),
}

impl NcArray {
    /// Retrieve a variable's data, preserving its stored type. Compound,
    /// opaque, enum, variable-length, and string types are rejected.
    pub fn get_from(var: &netcdf::Variable) -> Result<Self, NcError> {
        match var.vartype() {
            NcVariableType::Int(IntType::I8) => Ok(Self::I8(var.get(Extents::All)?)),
            NcVariableType::Int(IntType::I16) => Ok(Self::I16(var.get(Extents::All)?)),
            NcVariableType::Int(IntType::I32) => Ok(Self::I32(var.get(Extents::All)?)),
            NcVariableType::Int(IntType::I64) => Ok(Self::I64(var.get(Extents::All)?)),
            NcVariableType::Int(IntType::U8) => Ok(Self::U8(var.get(Extents::All)?)),
            NcVariableType::Int(IntType::U16) => Ok(Self::U16(var.get(Extents::All)?)),
            NcVariableType::Int(IntType::U32) => Ok(Self::U32(var.get(Extents::All)?)),
            NcVariableType::Int(IntType::U64) => Ok(Self::U64(var.get(Extents::All)?)),
            NcVariableType::Float(FloatType::F32) => Ok(Self::F32(var.get(Extents::All)?)),
            NcVariableType::Float(FloatType::F64) => Ok(Self::F64(var.get(Extents::All)?)),
            NcVariableType::Char => Ok(Self::Char(var.get(Extents::All)?)),
            other => Err(NcError::UnsupportedVarType(format!("{other:?}"))),
        }
    }

    /// Create a variable in `file` and write this data to it. Options that
    /// must be set pre-write (compression, fill values) require creating the
    /// variable by hand instead.
    pub fn put_to<'f>(
        &self,
        file: &'f mut netcdf::FileMut,
        name: &str,
        dims: &[&str],
    ) -> Result<netcdf::VariableMut<'f>, NcError> {
        match self {
            NcArray::I8(arr) => {
                let mut var = file.add_variable::<i8>(name, dims)?;
                var.put(arr.view(), Extents::All)?;
                Ok(var)
            }
            NcArray::I16(arr) => {
                let mut var = file.add_variable::<i16>(name, dims)?;
                var.put(arr.view(), Extents::All)?;
                Ok(var)
            }
            NcArray::I32(arr) => {
                let mut var = file.add_variable::<i32>(name, dims)?;
                var.put(arr.view(), Extents::All)?;
                Ok(var)
            }
            NcArray::I64(arr) => {
                let mut var = file.add_variable::<i64>(name, dims)?;
                var.put(arr.view(), Extents::All)?;
                Ok(var)
            }
            NcArray::U8(arr) | NcArray::Char(arr) => {
                let mut var = file.add_variable::<u8>(name, dims)?;
                var.put(arr.view(), Extents::All)?;
                Ok(var)
            }
            NcArray::U16(arr) => {
                let mut var = file.add_variable::<u16>(name, dims)?;
                var.put(arr.view(), Extents::All)?;
                Ok(var)
            }
            NcArray::U32(arr) => {
                let mut var = file.add_variable::<u32>(name, dims)?;
                var.put(arr.view(), Extents::All)?;
                Ok(var)
            }
            NcArray::U64(arr) => {
                let mut var = file.add_variable::<u64>(name, dims)?;
                var.put(arr.view(), Extents::All)?;
                Ok(var)
            }
            NcArray::F32(arr) => {
                let mut var = file.add_variable::<f32>(name, dims)?;
                var.put(arr.view(), Extents::All)?;
                Ok(var)
            }
            NcArray::F64(arr) => {
                let mut var = file.add_variable::<f64>(name, dims)?;
                var.put(arr.view(), Extents::All)?;
                Ok(var)
            }
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            NcArray::I8(arr) => arr.shape(),
            NcArray::I16(arr) => arr.shape(),
            NcArray::I32(arr) => arr.shape(),
            NcArray::I64(arr) => arr.shape(),
            NcArray::U8(arr) | NcArray::Char(arr) => arr.shape(),
            NcArray::U16(arr) => arr.shape(),
            NcArray::U32(arr) => arr.shape(),
            NcArray::U64(arr) => arr.shape(),
            NcArray::F32(arr) => arr.shape(),
            NcArray::F64(arr) => arr.shape(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_climo_output_filename() {
        let meta = FileMetadata {
            model: Some("CanESM2".to_string()),
            experiment: Some("historical, rcp85".to_string()),
            ensemble: Some("r1i1p1".to_string()),
            ..Default::default()
        };
        let t_start = NaiveDate::from_ymd_opt(1961, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let t_end = NaiveDate::from_ymd_opt(1990, 12, 30)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(
            climo_output_filename("tasmax", "aClimMean", &meta, t_start, t_end),
            "tasmax_aClimMean_CanESM2_historical,+rcp85_r1i1p1_19610101-19901230.nc"
        );
    }

    #[test]
    fn test_climo_output_filename_missing_metadata() {
        let meta = FileMetadata::default();
        let t = NaiveDate::from_ymd_opt(2010, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let name = climo_output_filename("pr", "mClimSD", &meta, t, t);
        assert_eq!(name, "pr_mClimSD_unknown_unknown_unknown_20100101-20100101.nc");
    }

    #[test]
    fn test_char_array_to_strings() {
        let data = b"p-0\0\0p-1\0\0outlt\0\0\0\0\0".to_vec();
        let arr = ArrayD::from_shape_vec(ndarray::IxDyn(&[4, 5]), data).unwrap();
        assert_eq!(char_array_to_strings(&arr), vec!["p-0", "p-1", "outlt", ""]);
    }
}
