//! Parsing, comparing, and formatting units expressed in `udunits` syntax.
//!
//! Model output files write the same physical unit many ways: `kg m-2 s-1`,
//! `kg / m**2 / s`, and `mm/s` all describe a precipitation rate. [`Unit`]
//! reduces any of these to a canonical product of named base units with
//! signed integer powers, so units can be compared for equality and
//! reformatted in the default udunits style.

use indexmap::IndexMap;
use pest::Parser;
use pest_derive::Parser;

pub const SECONDS_PER_DAY: f64 = 86400.0;

#[derive(Parser)]
#[grammar = "units.pest"]
struct UdunitsParser;

#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error("'{unit}' is not a parsable udunits string: {reason}")]
    Unparsable { unit: String, reason: String },
}

/// A unit as a product of base units raised to signed integer powers.
///
/// Equality ignores both the formatting of the source string and the order
/// of factors; `kg m-2 s-1` and `kg / m**2 / s` compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    terms: IndexMap<String, i32>,
}

impl Unit {
    pub fn parse(unit_str: &str) -> Result<Self, UnitError> {
        let parsed = UdunitsParser::parse(Rule::units, unit_str)
            .map_err(|e| UnitError::Unparsable {
                unit: unit_str.to_string(),
                reason: e.to_string(),
            })?
            .next()
            .expect("a successful parse always yields the top-level rule");

        let mut terms: IndexMap<String, i32> = IndexMap::new();
        for part in parsed.into_inner() {
            match part.as_rule() {
                Rule::factor => accumulate_factor(&mut terms, part, 1),
                Rule::tail => {
                    let mut sign = 1;
                    for piece in part.into_inner() {
                        match piece.as_rule() {
                            Rule::divide => sign = -1,
                            Rule::times => (),
                            Rule::factor => accumulate_factor(&mut terms, piece, sign),
                            _ => unreachable!("tail contains only separators and factors"),
                        }
                    }
                }
                Rule::EOI => (),
                _ => unreachable!("units contains only factors and tails"),
            }
        }
        terms.retain(|_, power| *power != 0);

        Ok(Self { terms })
    }

    /// Format in default udunits style: space-separated factors with signed
    /// powers, e.g. `kg m-2 s-1`. A dimensionless unit formats as `1`.
    pub fn to_udunits_string(&self) -> String {
        if self.terms.is_empty() {
            return "1".to_string();
        }
        self.terms
            .iter()
            .map(|(name, power)| {
                if *power == 1 {
                    name.clone()
                } else {
                    format!("{name}{power}")
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// True if this is a per-second rate (carries `s-1`).
    pub fn is_per_second(&self) -> bool {
        self.terms.get("s") == Some(&-1)
    }

    /// The same unit expressed per day instead of per second. Data in the
    /// original unit must be multiplied by [`SECONDS_PER_DAY`] to match.
    /// Returns `None` when the unit is not a per-second rate.
    pub fn per_second_to_per_day(&self) -> Option<Self> {
        if !self.is_per_second() {
            return None;
        }
        let terms = self
            .terms
            .iter()
            .map(|(name, power)| {
                if name == "s" && *power == -1 {
                    ("day".to_string(), -1)
                } else {
                    (name.clone(), *power)
                }
            })
            .collect();
        Some(Self { terms })
    }
}

fn accumulate_factor(terms: &mut IndexMap<String, i32>, factor: pest::iterators::Pair<Rule>, sign: i32) {
    let mut name = None;
    let mut power = 1;
    for piece in factor.into_inner() {
        match piece.as_rule() {
            Rule::name => name = Some(canonical_name(piece.as_str())),
            Rule::power => {
                let digits = piece
                    .as_str()
                    .trim_start_matches("**")
                    .trim_start_matches('^');
                power = digits
                    .parse::<i32>()
                    .expect("the grammar only matches integer powers");
            }
            _ => unreachable!("factor contains only a name and an optional power"),
        }
    }
    let name = name.expect("the grammar requires a name in every factor");
    // "1" is the dimensionless placeholder and contributes nothing.
    if name != "1" {
        *terms.entry(name.to_string()).or_insert(0) += sign * power;
    }
}

/// Collapse the spelling variants udunits allows for time units.
fn canonical_name(name: &str) -> &str {
    match name {
        "d" | "day" | "days" => "day",
        "s" | "sec" | "secs" | "second" | "seconds" => "s",
        "h" | "hr" | "hour" | "hours" => "hour",
        "min" | "minute" | "minutes" => "minute",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("kg m-2 s-1", "kg / m**2 / s")]
    #[case("kg m-2 s-1", "kg.m-2.s-1")]
    #[case("mm/s", "mm s-1")]
    #[case("mm/s", "mm sec-1")]
    #[case("kg m-2 d-1", "kg / m**2 / day")]
    #[case("W m-2", "W/m^2")]
    fn test_equivalent_spellings(#[case] a: &str, #[case] b: &str) {
        assert_eq!(Unit::parse(a).unwrap(), Unit::parse(b).unwrap());
    }

    #[test]
    fn test_distinct_units_differ() {
        assert_ne!(
            Unit::parse("kg m-2 s-1").unwrap(),
            Unit::parse("kg m-2 d-1").unwrap()
        );
        assert_ne!(Unit::parse("mm/s").unwrap(), Unit::parse("mm").unwrap());
    }

    #[test]
    fn test_dimensionless() {
        let unit = Unit::parse("1").unwrap();
        assert_eq!(unit.to_udunits_string(), "1");
        assert!(!unit.is_per_second());
    }

    #[test]
    fn test_default_formatting() {
        assert_eq!(
            Unit::parse("kg / m**2 / s").unwrap().to_udunits_string(),
            "kg m-2 s-1"
        );
        assert_eq!(Unit::parse("mm/s").unwrap().to_udunits_string(), "mm s-1");
    }

    #[test]
    fn test_per_second_to_per_day() {
        let converted = Unit::parse("kg m-2 s-1")
            .unwrap()
            .per_second_to_per_day()
            .unwrap();
        assert_eq!(converted, Unit::parse("kg m-2 day-1").unwrap());
        assert_eq!(converted.to_udunits_string(), "kg m-2 day-1");

        assert!(Unit::parse("K").unwrap().per_second_to_per_day().is_none());
    }

    #[test]
    fn test_unparsable() {
        let err = Unit::parse("").unwrap_err();
        assert!(matches!(err, UnitError::Unparsable { .. }));
    }
}
