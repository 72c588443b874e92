//! Discovery of the structural roles dimensions and variables play in a
//! station-timeseries file: which dimension counts the sampling locations,
//! and which variable uniquely identifies them.

use itertools::Itertools;
use log::debug;

/// What a dimension most likely represents, judged by its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DimType {
    X,
    Y,
    Z,
    T,
    Text,
    Bounds,
    Instance,
}

pub(crate) fn guess_dim_type(name: &str) -> Option<DimType> {
    match name {
        "lat" | "latitude" | "y" | "yc" => Some(DimType::Y),
        "lon" | "longitude" | "x" | "xc" => Some(DimType::X),
        "level" | "depth" | "altitude" | "plev" | "lev" => Some(DimType::Z),
        "time" | "timeofyear" | "days" => Some(DimType::T),
        "nc_chars" => Some(DimType::Text),
        "nv" | "bnds" => Some(DimType::Bounds),
        "outlets" => Some(DimType::Instance),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub(crate) enum DiscoveryError {
    #[error("No possible {0} candidates found")]
    NoCandidates(String),
    #[error("Multiple possible {description} candidates found: {}", .candidates.iter().join(", "))]
    MultipleCandidates {
        description: String,
        candidates: Vec<String>,
    },
    #[error("Variable '{0}' has a cf_role other than timeseries_id; only timeseries datasets are supported")]
    NotTimeseries(String),
    #[error("Multiple variables have a cf_role attribute: {}", .0.iter().join(", "))]
    MultipleCfRoles(Vec<String>),
    #[error("Cannot handle multiple text dimensions on variable '{0}'")]
    MultipleTextDims(String),
    #[error("Variable '{0}' has a string-length dimension but is not a character variable")]
    NonCharWithTextDim(String),
    #[error("Cannot reduce one-dimensional character variable '{0}'")]
    CharWithoutInstanceDim(String),
}

/// The structural facts about one variable that discovery needs.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VarInfo {
    pub name: String,
    pub dims: Vec<String>,
    pub cf_role: Option<String>,
    pub is_char: bool,
}

/// When the user has not named a netCDF object, there must be exactly one
/// candidate satisfying the criteria for us to default to it.
fn find_singular<'a>(
    candidates: Vec<&'a str>,
    description: &str,
) -> Result<&'a str, DiscoveryError> {
    debug!("No {description} specified; determining from data");
    match candidates.as_slice() {
        [single] => Ok(*single),
        [] => Err(DiscoveryError::NoCandidates(description.to_string())),
        many => Err(DiscoveryError::MultipleCandidates {
            description: description.to_string(),
            candidates: many.iter().map(|c| c.to_string()).collect(),
        }),
    }
}

/// The instance dimension: the one dimension that is neither a spatial,
/// temporal, bounds, nor string-length dimension.
pub(crate) fn guess_instance_dimension(dims: &[String]) -> Result<&str, DiscoveryError> {
    let candidates = dims
        .iter()
        .map(|d| d.as_str())
        .filter(|d| matches!(guess_dim_type(d), None | Some(DimType::Instance)))
        .collect();
    find_singular(candidates, "instance dimension")
}

/// True if the variable is an instance variable: it has only the instance
/// dimension, plus possibly a string-length dimension.
pub(crate) fn is_instance_variable(var: &VarInfo, instance_dim: &str) -> bool {
    !var.dims.is_empty()
        && var
            .dims
            .iter()
            .all(|d| d == instance_dim || guess_dim_type(d) == Some(DimType::Text))
}

/// The variable giving each location its unique id. A `cf_role` attribute
/// designates it explicitly; otherwise there must be exactly one instance
/// variable to default to.
pub(crate) fn guess_id_variable<'a>(
    vars: &'a [VarInfo],
    instance_dim: &str,
) -> Result<&'a str, DiscoveryError> {
    let role_vars: Vec<&VarInfo> = vars
        .iter()
        .filter(|v| v.cf_role.is_some() && is_instance_variable(v, instance_dim))
        .collect();

    match role_vars.as_slice() {
        [var] => {
            if var.cf_role.as_deref() == Some("timeseries_id") {
                Ok(&var.name)
            } else {
                Err(DiscoveryError::NotTimeseries(var.name.clone()))
            }
        }
        [] => {
            let candidates = vars
                .iter()
                .filter(|v| is_instance_variable(v, instance_dim))
                .map(|v| v.name.as_str())
                .collect();
            find_singular(candidates, "id variable")
        }
        many => Err(DiscoveryError::MultipleCfRoles(
            many.iter().map(|v| v.name.clone()).collect(),
        )),
    }
}

/// The variable's string-length dimension, if it has one. Character
/// variables must have exactly one, and it cannot be their only dimension.
pub(crate) fn text_dimension(var: &VarInfo) -> Result<Option<&str>, DiscoveryError> {
    let text_dims: Vec<&str> = var
        .dims
        .iter()
        .map(|d| d.as_str())
        .filter(|d| guess_dim_type(d) == Some(DimType::Text))
        .collect();

    match text_dims.as_slice() {
        [] => Ok(None),
        [single] => {
            if !var.is_char {
                Err(DiscoveryError::NonCharWithTextDim(var.name.clone()))
            } else if var.dims.len() == 1 {
                Err(DiscoveryError::CharWithoutInstanceDim(var.name.clone()))
            } else {
                Ok(Some(*single))
            }
        }
        _ => Err(DiscoveryError::MultipleTextDims(var.name.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str, dims: &[&str], cf_role: Option<&str>, is_char: bool) -> VarInfo {
        VarInfo {
            name: name.to_string(),
            dims: dims.iter().map(|d| d.to_string()).collect(),
            cf_role: cf_role.map(|r| r.to_string()),
            is_char,
        }
    }

    fn dims(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_guess_instance_dimension() {
        assert_eq!(
            guess_instance_dimension(&dims(&["time", "outlets", "nc_chars"])).unwrap(),
            "outlets"
        );
        assert_eq!(
            guess_instance_dimension(&dims(&["time", "station", "nv"])).unwrap(),
            "station"
        );
    }

    #[test]
    fn test_guess_instance_dimension_ambiguous() {
        let err = guess_instance_dimension(&dims(&["time", "station", "platform"])).unwrap_err();
        assert_eq!(
            err,
            DiscoveryError::MultipleCandidates {
                description: "instance dimension".to_string(),
                candidates: vec!["station".to_string(), "platform".to_string()],
            }
        );

        assert_eq!(
            guess_instance_dimension(&dims(&["time", "lat", "lon"])).unwrap_err(),
            DiscoveryError::NoCandidates("instance dimension".to_string())
        );
    }

    #[test]
    fn test_is_instance_variable() {
        assert!(is_instance_variable(
            &var("outlet_name", &["outlets", "nc_chars"], None, true),
            "outlets"
        ));
        assert!(!is_instance_variable(
            &var("streamflow", &["time", "outlets"], None, false),
            "outlets"
        ));
        assert!(!is_instance_variable(&var("scalar", &[], None, false), "outlets"));
    }

    #[test]
    fn test_guess_id_variable_from_cf_role() {
        let vars = [
            var("outlet_name", &["outlets", "nc_chars"], Some("timeseries_id"), true),
            var("outlet_height", &["outlets"], None, false),
            var("streamflow", &["time", "outlets"], None, false),
        ];
        assert_eq!(guess_id_variable(&vars, "outlets").unwrap(), "outlet_name");
    }

    #[test]
    fn test_guess_id_variable_wrong_role() {
        let vars = [var("trajectory", &["outlets"], Some("trajectory_id"), false)];
        assert_eq!(
            guess_id_variable(&vars, "outlets").unwrap_err(),
            DiscoveryError::NotTimeseries("trajectory".to_string())
        );
    }

    #[test]
    fn test_guess_id_variable_defaults_to_single_candidate() {
        let vars = [
            var("outlet_name", &["outlets", "nc_chars"], None, true),
            var("streamflow", &["time", "outlets"], None, false),
        ];
        assert_eq!(guess_id_variable(&vars, "outlets").unwrap(), "outlet_name");
    }

    #[test]
    fn test_text_dimension() {
        assert_eq!(
            text_dimension(&var("outlet_name", &["outlets", "nc_chars"], None, true)).unwrap(),
            Some("nc_chars")
        );
        assert_eq!(
            text_dimension(&var("streamflow", &["time", "outlets"], None, false)).unwrap(),
            None
        );
        assert_eq!(
            text_dimension(&var("weird", &["outlets", "nc_chars"], None, false)).unwrap_err(),
            DiscoveryError::NonCharWithTextDim("weird".to_string())
        );
        assert_eq!(
            text_dimension(&var("only_text", &["nc_chars"], None, true)).unwrap_err(),
            DiscoveryError::CharWithoutInstanceDim("only_text".to_string())
        );
    }
}
