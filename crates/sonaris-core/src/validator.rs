//! Response validators for query commands.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, JobError};

/// Check applied to the (terminator-stripped) response of a query.
///
/// Numeric checks accept SCPI number formats (`+1.000000E+03`, `-4.2`, `1`).
/// A response that does not parse as a number is a [`ErrorKind::Parse`]
/// failure; a number outside the range is a [`ErrorKind::ValidationFailure`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseValidator {
    /// Accept any response.
    #[default]
    Any,
    /// Response must equal `value`.
    Exact {
        /// Expected response text.
        value: String,
    },
    /// Response must contain `value`.
    Contains {
        /// Required substring.
        value: String,
    },
    /// Response must match the regular expression `pattern`.
    Matches {
        /// Regular expression, compiled when the job is validated.
        pattern: String,
    },
    /// Response must be a number within the inclusive bounds.
    NumberInRange {
        /// Lower bound, unbounded when absent.
        #[serde(default)]
        min: Option<f64>,
        /// Upper bound, unbounded when absent.
        #[serde(default)]
        max: Option<f64>,
    },
    /// Response must be one of `values`.
    OneOf {
        /// Accepted responses.
        values: Vec<String>,
    },
}

impl ResponseValidator {
    /// Validator that accepts exactly `value`.
    pub fn exact(value: impl Into<String>) -> Self {
        Self::Exact {
            value: value.into(),
        }
    }

    /// Validator that requires `value` as a substring.
    pub fn contains(value: impl Into<String>) -> Self {
        Self::Contains {
            value: value.into(),
        }
    }

    /// Validator that requires a regular expression match.
    pub fn matches(pattern: impl Into<String>) -> Self {
        Self::Matches {
            pattern: pattern.into(),
        }
    }

    /// Validator that requires a number in `[min, max]`.
    pub fn number_in_range(min: f64, max: f64) -> Self {
        Self::NumberInRange {
            min: Some(min),
            max: Some(max),
        }
    }

    /// Returns true for [`ResponseValidator::Any`].
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Check that the validator itself is well formed.
    pub fn check_definition(&self) -> Result<(), String> {
        match self {
            Self::Matches { pattern } => Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| format!("bad pattern '{pattern}': {e}")),
            Self::NumberInRange {
                min: Some(min),
                max: Some(max),
            } if min > max => Err(format!("min {min} is greater than max {max}")),
            Self::OneOf { values } if values.is_empty() => {
                Err("one_of needs at least one value".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Check a response.
    pub fn check(&self, response: &str) -> Result<(), JobError> {
        match self {
            Self::Any => Ok(()),
            Self::Exact { value } => {
                if response == value {
                    Ok(())
                } else {
                    Err(rejected(format!("expected '{value}', got '{response}'")))
                }
            }
            Self::Contains { value } => {
                if response.contains(value.as_str()) {
                    Ok(())
                } else {
                    Err(rejected(format!(
                        "expected response containing '{value}', got '{response}'"
                    )))
                }
            }
            Self::Matches { pattern } => {
                let re = Regex::new(pattern).map_err(|e| {
                    JobError::new(
                        ErrorKind::ValidationFailure,
                        format!("bad pattern '{pattern}': {e}"),
                    )
                })?;
                if re.is_match(response) {
                    Ok(())
                } else {
                    Err(rejected(format!(
                        "response '{response}' does not match /{pattern}/"
                    )))
                }
            }
            Self::NumberInRange { min, max } => {
                let value = parse_number(response)?;
                let below = min.map_or(false, |m| value < m);
                let above = max.map_or(false, |m| value > m);
                if below || above {
                    return Err(rejected(format!(
                        "{value} outside [{}, {}]",
                        min.map_or("-inf".to_string(), |m| m.to_string()),
                        max.map_or("+inf".to_string(), |m| m.to_string()),
                    )));
                }
                Ok(())
            }
            Self::OneOf { values } => {
                if values.iter().any(|v| v == response) {
                    Ok(())
                } else {
                    Err(rejected(format!(
                        "'{response}' is not one of [{}]",
                        values.join(", ")
                    )))
                }
            }
        }
    }
}

/// Parse a SCPI numeric response.
///
/// Accepts an optional sign, decimal point and exponent. `NaN` and infinities
/// are rejected since SCPI signals those with the 9.9E37 sentinels instead.
pub fn parse_number(response: &str) -> Result<f64, JobError> {
    let text = response.trim();
    match text.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(JobError::new(
            ErrorKind::Parse,
            format!("'{text}' is not a number"),
        )),
    }
}

fn rejected(message: String) -> JobError {
    JobError::new(ErrorKind::ValidationFailure, message)
}
