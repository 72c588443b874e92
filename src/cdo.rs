//! Driver for the CDO ("climate data operators") command-line tool.
//!
//! All statistical aggregation is delegated to CDO; this module only builds
//! the command lines, runs them, and manages the temporary files the
//! operator chain produces. Every call writes a fresh file in a private
//! working directory that is removed when the [`Cdo`] handle is dropped, so
//! callers must move any file they want to keep into place first.

use std::cell::Cell;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::NaiveDateTime;
use itertools::Itertools;
use log::debug;
use tempfile::TempDir;

#[derive(Debug, thiserror::Error)]
pub enum CdoError {
    #[error("Could not create a working directory for intermediate files")]
    WorkDir(#[source] std::io::Error),
    #[error("Could not run '{program}'; is CDO installed and on PATH?")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cdo {operator} exited with {status}: {stderr}")]
    Failed {
        operator: String,
        status: String,
        stderr: String,
    },
}

/// Handle to the external CDO program and a working directory for its
/// outputs.
pub struct Cdo {
    program: OsString,
    workdir: TempDir,
    counter: Cell<u32>,
}

impl Cdo {
    /// Locate CDO (the `CDO` environment variable, falling back to `cdo` on
    /// PATH) and create the working directory.
    pub fn new() -> Result<Self, CdoError> {
        let program = std::env::var_os("CDO").unwrap_or_else(|| OsString::from("cdo"));
        let workdir = TempDir::new().map_err(CdoError::WorkDir)?;
        Ok(Self {
            program,
            workdir,
            counter: Cell::new(0),
        })
    }

    /// Apply an operator (parameters already embedded, e.g. `seldate,...`)
    /// to the given inputs, returning the path of the newly written output.
    pub fn apply(&self, operator: &str, inputs: &[&Path]) -> Result<PathBuf, CdoError> {
        let output = self.next_output(operator);
        let args = command_args(operator, inputs, &output);
        debug!(
            "Running: {} {}",
            self.program.to_string_lossy(),
            args.iter().map(|a| a.to_string_lossy()).join(" ")
        );

        let result = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|source| CdoError::Launch {
                program: self.program.to_string_lossy().into_owned(),
                source,
            })?;

        if !result.status.success() {
            return Err(CdoError::Failed {
                operator: operator.to_string(),
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Select the time steps between two dates (inclusive).
    pub fn seldate(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        input: &Path,
    ) -> Result<PathBuf, CdoError> {
        let operator = format!(
            "seldate,{},{}",
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        );
        self.apply(&operator, &[input])
    }

    /// Select specific (1-based) time steps.
    pub fn seltimesteps(&self, steps: &[usize], input: &Path) -> Result<PathBuf, CdoError> {
        let operator = format!("seltimestep,{}", steps.iter().join(","));
        self.apply(&operator, &[input])
    }

    /// Select a single named variable.
    pub fn select_variable(&self, name: &str, input: &Path) -> Result<PathBuf, CdoError> {
        self.apply(&format!("select,name={name}"), &[input])
    }

    /// Copy one file, or concatenate several, into a single output.
    pub fn copy(&self, inputs: &[&Path]) -> Result<PathBuf, CdoError> {
        self.apply("copy", inputs)
    }

    fn next_output(&self, operator: &str) -> PathBuf {
        let n = self.counter.get();
        self.counter.set(n + 1);
        // Tag the file with the bare operator name for debuggability.
        let tag = operator.split(',').next().unwrap_or("out");
        self.workdir.path().join(format!("{n:04}_{tag}.nc"))
    }
}

/// The argument vector for one CDO invocation, separated from process
/// execution so it can be checked without the tool installed.
fn command_args(operator: &str, inputs: &[&Path], output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![OsString::from("-s"), OsString::from(operator)];
    args.extend(inputs.iter().map(|p| p.as_os_str().to_os_string()));
    args.push(output.as_os_str().to_os_string());
    args
}

/// Move a finished file to its destination, creating parent directories and
/// falling back to copy-and-delete when the rename crosses filesystems (the
/// working directory usually lives on a different mount than the output
/// tree).
pub fn install_output(src: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    match std::fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(src, dest)?;
            std::fs::remove_file(src)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn args_as_strings(args: &[OsString]) -> Vec<String> {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_command_args_single_input() {
        let args = command_args(
            "ymonmean",
            &[Path::new("in.nc")],
            Path::new("/tmp/work/0001_ymonmean.nc"),
        );
        assert_eq!(
            args_as_strings(&args),
            vec!["-s", "ymonmean", "in.nc", "/tmp/work/0001_ymonmean.nc"]
        );
    }

    #[test]
    fn test_command_args_concatenation() {
        let args = command_args(
            "copy",
            &[Path::new("a.nc"), Path::new("b.nc"), Path::new("c.nc")],
            Path::new("out.nc"),
        );
        assert_eq!(
            args_as_strings(&args),
            vec!["-s", "copy", "a.nc", "b.nc", "c.nc", "out.nc"]
        );
    }

    #[test]
    fn test_seldate_operator_format() {
        let start = NaiveDate::from_ymd_opt(1961, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let end = NaiveDate::from_ymd_opt(1990, 12, 30)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let operator = format!(
            "seldate,{},{}",
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        );
        assert_eq!(operator, "seldate,1961-01-01,1990-12-30");
    }
}
