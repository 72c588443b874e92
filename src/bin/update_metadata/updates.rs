//! Parsing and interpretation of the attribute-updates specification file.
//!
//! The specification is a two-level map: each top-level section names a
//! target (`global` or a variable name), and each entry under it names an
//! attribute and the value to give it. Two string prefixes select special
//! operations: `<-old_name` renames an existing attribute, and
//! `=function(attr)` computes the value from another attribute with one of
//! a fixed set of named transforms. The reserved key `delete` takes a list
//! of attribute names to remove.

use std::path::Path;

use indexmap::IndexMap;
use log::{info, warn};
use regex::Regex;
use serde::Deserialize;

const RENAME_PREFIX: &str = "<-";
const EXPRESSION_PREFIX: &str = "=";

#[derive(Debug, thiserror::Error)]
pub(crate) enum SpecError {
    #[error("Could not read updates file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Updates file must have a .toml or .json extension, got '{0}'")]
    UnknownFormat(String),
    #[error("Updates file is not valid {format}: {reason}")]
    Parse { format: &'static str, reason: String },
    #[error("In section '{section}', attribute '{attr}': {reason}")]
    BadEntry {
        section: String,
        attr: String,
        reason: String,
    },
}

/// What a section's updates apply to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    Global,
    Variable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TransformFn {
    NormalizeExperimentId,
    ParseEnsembleCode,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum UpdateOp {
    Delete {
        name: String,
    },
    Rename {
        name: String,
        old: String,
    },
    Transform {
        name: String,
        function: TransformFn,
        source_attr: String,
    },
    SetStr {
        name: String,
        value: String,
    },
    SetInt {
        name: String,
        value: i64,
    },
    SetFloat {
        name: String,
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UpdateSpec {
    pub targets: Vec<(Target, Vec<UpdateOp>)>,
}

/// An attribute value as far as the update machinery cares: strings and
/// numbers can be created and transformed, anything else passes through
/// opaquely.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AttrContent<X> {
    Str(String),
    Int(i64),
    Float(f64),
    Other(X),
}

/// Intermediate value type both the TOML and JSON readers deserialize into.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawValue {
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<RawValue>),
}

type RawSpec = IndexMap<String, IndexMap<String, RawValue>>;

pub(crate) fn load_spec(path: &Path) -> Result<UpdateSpec, SpecError> {
    let text = std::fs::read_to_string(path)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let raw: RawSpec = match extension {
        "toml" => toml::from_str(&text).map_err(|e| SpecError::Parse {
            format: "TOML",
            reason: e.to_string(),
        })?,
        "json" => serde_json::from_str(&text).map_err(|e| SpecError::Parse {
            format: "JSON",
            reason: e.to_string(),
        })?,
        other => return Err(SpecError::UnknownFormat(other.to_string())),
    };
    interpret_spec(raw)
}

fn interpret_spec(raw: RawSpec) -> Result<UpdateSpec, SpecError> {
    let mut targets = Vec::new();
    for (section, entries) in raw {
        let target = if section == "global" {
            Target::Global
        } else {
            Target::Variable(section.clone())
        };

        let mut ops = Vec::new();
        for (attr, value) in entries {
            interpret_entry(&section, &attr, value, &mut ops)?;
        }
        targets.push((target, ops));
    }
    Ok(UpdateSpec { targets })
}

fn interpret_entry(
    section: &str,
    attr: &str,
    value: RawValue,
    ops: &mut Vec<UpdateOp>,
) -> Result<(), SpecError> {
    let bad = |reason: String| SpecError::BadEntry {
        section: section.to_string(),
        attr: attr.to_string(),
        reason,
    };

    // The reserved `delete` key lists attributes to remove.
    if attr == "delete" {
        let RawValue::List(items) = value else {
            return Err(bad("'delete' must be a list of attribute names".to_string()));
        };
        for item in items {
            let RawValue::Str(name) = item else {
                return Err(bad("'delete' entries must be strings".to_string()));
            };
            ops.push(UpdateOp::Delete { name });
        }
        return Ok(());
    }

    let op = match value {
        RawValue::Int(value) => UpdateOp::SetInt {
            name: attr.to_string(),
            value,
        },
        RawValue::Float(value) => UpdateOp::SetFloat {
            name: attr.to_string(),
            value,
        },
        RawValue::List(_) => {
            return Err(bad("list values are only allowed under 'delete'".to_string()))
        }
        RawValue::Str(s) => {
            if let Some(old) = s.strip_prefix(RENAME_PREFIX) {
                UpdateOp::Rename {
                    name: attr.to_string(),
                    old: old.to_string(),
                }
            } else if let Some(expression) = s.strip_prefix(EXPRESSION_PREFIX) {
                parse_expression(attr, expression).map_err(bad)?
            } else {
                UpdateOp::SetStr {
                    name: attr.to_string(),
                    value: s,
                }
            }
        }
    };
    ops.push(op);
    Ok(())
}

fn parse_expression(attr: &str, expression: &str) -> Result<UpdateOp, String> {
    let re = Regex::new(r"^(\w+)\(([\w.-]+)\)$").expect("expression pattern is valid");
    let captures = re
        .captures(expression.trim())
        .ok_or_else(|| format!("expression '{expression}' is not of the form function(attr)"))?;
    let function = match &captures[1] {
        "normalize_experiment_id" => TransformFn::NormalizeExperimentId,
        "parse_ensemble_code" => TransformFn::ParseEnsembleCode,
        other => return Err(format!("'{other}' is not a known transform")),
    };
    Ok(UpdateOp::Transform {
        name: attr.to_string(),
        function,
        source_attr: captures[2].to_string(),
    })
}

/// Apply one section's operations to a map of attributes.
pub(crate) fn apply_updates<X>(
    attrs: &mut IndexMap<String, AttrContent<X>>,
    ops: &[UpdateOp],
) {
    for op in ops {
        match op {
            UpdateOp::Delete { name } => {
                if attrs.shift_remove(name).is_some() {
                    info!("\t'{name}': Deleted");
                }
            }
            UpdateOp::Rename { name, old } => {
                if let Some(value) = attrs.shift_remove(old) {
                    attrs.insert(name.clone(), value);
                    info!("\t'{name}': Renamed from '{old}'");
                }
            }
            UpdateOp::Transform {
                name,
                function,
                source_attr,
            } => {
                let source = match attrs.get(source_attr) {
                    Some(AttrContent::Str(s)) => s.clone(),
                    Some(_) => {
                        warn!("\t'{name}': source attribute '{source_attr}' is not a string");
                        continue;
                    }
                    None => {
                        warn!("\t'{name}': source attribute '{source_attr}' is missing");
                        continue;
                    }
                };
                apply_transform(attrs, name, function, &source);
            }
            UpdateOp::SetStr { name, value } => {
                attrs.insert(name.clone(), AttrContent::Str(value.clone()));
                info!("\t'{name}': Set to '{value}'");
            }
            UpdateOp::SetInt { name, value } => {
                attrs.insert(name.clone(), AttrContent::Int(*value));
                info!("\t'{name}': Set to {value}");
            }
            UpdateOp::SetFloat { name, value } => {
                attrs.insert(name.clone(), AttrContent::Float(*value));
                info!("\t'{name}': Set to {value}");
            }
        }
    }
}

fn apply_transform<X>(
    attrs: &mut IndexMap<String, AttrContent<X>>,
    name: &str,
    function: &TransformFn,
    source: &str,
) {
    match function {
        TransformFn::NormalizeExperimentId => {
            let value = normalize_experiment_id(source);
            info!("\t'{name}': Set to '{value}'");
            attrs.insert(name.to_string(), AttrContent::Str(value));
        }
        TransformFn::ParseEnsembleCode => match parse_ensemble_code(source) {
            Some((realization, initialization, physics)) => {
                attrs.insert("realization".to_string(), AttrContent::Int(realization));
                attrs.insert(
                    "initialization_method".to_string(),
                    AttrContent::Int(initialization),
                );
                attrs.insert("physics_version".to_string(), AttrContent::Int(physics));
                info!(
                    "\t'{name}': Parsed '{source}' into realization/initialization_method/physics_version"
                );
            }
            None => warn!("\t'{name}': Could not parse '{source}' as an ensemble code"),
        },
    }
}

/// Canonicalize an experiment id: lower-case `historical` and collapse RCP
/// codes like `rcp8.5` to `rcp85`.
pub(crate) fn normalize_experiment_id(experiment_id: &str) -> String {
    let historical = Regex::new(r"(?i)historical").expect("pattern is valid");
    let rcp = Regex::new(r"(?i)rcp(\d)\.?(\d)").expect("pattern is valid");
    let result = historical.replace_all(experiment_id, "historical");
    rcp.replace_all(&result, "rcp$1$2").into_owned()
}

/// Split an ensemble code like `r1i1p1` into its three integers.
pub(crate) fn parse_ensemble_code(code: &str) -> Option<(i64, i64, i64)> {
    let re = Regex::new(r"^r(\d+)i(\d+)p(\d+)$").expect("pattern is valid");
    let captures = re.captures(code)?;
    Some((
        captures[1].parse().ok()?,
        captures[2].parse().ok()?,
        captures[3].parse().ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_toml(text: &str) -> UpdateSpec {
        let raw: RawSpec = toml::from_str(text).unwrap();
        interpret_spec(raw).unwrap()
    }

    #[test]
    fn test_parse_sections_and_ops() {
        let spec = parse_toml(
            r#"
            [global]
            institution = "PCIC"
            frequency = "<-freq"
            experiment_id = "=normalize_experiment_id(driving_experiment_name)"
            delete = ["comment", "table_id"]
            realization = 1

            [tasmax]
            cell_methods = "time: maximum"
            "#,
        );

        assert_eq!(spec.targets.len(), 2);
        let (target, ops) = &spec.targets[0];
        assert_eq!(*target, Target::Global);
        assert_eq!(
            ops,
            &vec![
                UpdateOp::SetStr {
                    name: "institution".to_string(),
                    value: "PCIC".to_string()
                },
                UpdateOp::Rename {
                    name: "frequency".to_string(),
                    old: "freq".to_string()
                },
                UpdateOp::Transform {
                    name: "experiment_id".to_string(),
                    function: TransformFn::NormalizeExperimentId,
                    source_attr: "driving_experiment_name".to_string()
                },
                UpdateOp::Delete {
                    name: "comment".to_string()
                },
                UpdateOp::Delete {
                    name: "table_id".to_string()
                },
                UpdateOp::SetInt {
                    name: "realization".to_string(),
                    value: 1
                },
            ]
        );

        let (target, ops) = &spec.targets[1];
        assert_eq!(*target, Target::Variable("tasmax".to_string()));
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn test_json_and_toml_agree() {
        let toml_spec = parse_toml("[global]\ncontact = \"someone\"\n");
        let raw: RawSpec = serde_json::from_str(r#"{"global": {"contact": "someone"}}"#).unwrap();
        let json_spec = interpret_spec(raw).unwrap();
        assert_eq!(toml_spec, json_spec);
    }

    #[test]
    fn test_unknown_transform_rejected() {
        let raw: RawSpec =
            toml::from_str("[global]\nx = \"=launch_missiles(target)\"\n").unwrap();
        let err = interpret_spec(raw).unwrap_err();
        assert!(err.to_string().contains("launch_missiles"));
    }

    #[test]
    fn test_apply_set_rename_delete() {
        let mut attrs: IndexMap<String, AttrContent<()>> = IndexMap::from([
            ("freq".to_string(), AttrContent::Str("day".to_string())),
            ("comment".to_string(), AttrContent::Str("old".to_string())),
        ]);
        apply_updates(
            &mut attrs,
            &[
                UpdateOp::Rename {
                    name: "frequency".to_string(),
                    old: "freq".to_string(),
                },
                UpdateOp::Delete {
                    name: "comment".to_string(),
                },
                UpdateOp::SetFloat {
                    name: "version".to_string(),
                    value: 1.5,
                },
            ],
        );
        assert_eq!(
            attrs,
            IndexMap::from([
                (
                    "frequency".to_string(),
                    AttrContent::Str("day".to_string())
                ),
                ("version".to_string(), AttrContent::Float(1.5)),
            ])
        );
    }

    #[test]
    fn test_apply_transforms() {
        let mut attrs: IndexMap<String, AttrContent<()>> = IndexMap::from([(
            "driving_experiment_name".to_string(),
            AttrContent::Str("Historical, RCP8.5".to_string()),
        )]);
        apply_updates(
            &mut attrs,
            &[UpdateOp::Transform {
                name: "experiment_id".to_string(),
                function: TransformFn::NormalizeExperimentId,
                source_attr: "driving_experiment_name".to_string(),
            }],
        );
        assert_eq!(
            attrs.get("experiment_id"),
            Some(&AttrContent::Str("historical, rcp85".to_string()))
        );
    }

    #[test]
    fn test_parse_ensemble_code() {
        assert_eq!(parse_ensemble_code("r1i1p1"), Some((1, 1, 1)));
        assert_eq!(parse_ensemble_code("r10i2p3"), Some((10, 2, 3)));
        assert_eq!(parse_ensemble_code("x1y2"), None);
    }

    #[test]
    fn test_normalize_experiment_id() {
        assert_eq!(normalize_experiment_id("HISTORICAL"), "historical");
        assert_eq!(normalize_experiment_id("rcp4.5"), "rcp45");
        assert_eq!(
            normalize_experiment_id("historical,rcp85"),
            "historical,rcp85"
        );
    }
}
