//! Limit evaluator (spec §4.E): coerces a raw measured-value string into the
//! item's declared `value_type`, then applies the `limit_type` rule to
//! decide PASS/FAIL.
//!
//! Grounded on the original PDTool4-derived `OPjudge`/limit-comparison
//! helpers referenced throughout `examples/original_source/backend/app/services/measurement_service.py`
//! and the teacher's preference for precise decimal handling
//! (`bigdecimal` is already in the teacher's dependency set for exactly this
//! kind of numeric comparison).

use bigdecimal::BigDecimal;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};
use crate::model::{LimitType, ParameterValue, ValueType};

/// A measured value coerced into its declared type (spec §4.E "Pre-coercion").
#[derive(Debug, Clone, PartialEq)]
pub enum CoercedValue {
    Integer(i64),
    Float(BigDecimal),
    Text(String),
}

impl CoercedValue {
    /// Canonical string representation stored as `TestResult.measured_value`.
    pub fn canonical(&self) -> String {
        match self {
            CoercedValue::Integer(v) => v.to_string(),
            CoercedValue::Float(v) => v.to_string(),
            CoercedValue::Text(v) => v.clone(),
        }
    }
}

/// Coerce `raw` per spec §4.E:
/// - `integer`: base-10, comma-free, reject non-integral text.
/// - `float`: decimal, scientific notation accepted, full precision kept.
/// - `string`: raw, trimmed of trailing CR/LF only.
pub fn coerce(raw: &str, value_type: ValueType) -> EngineResult<CoercedValue> {
    match value_type {
        ValueType::Integer => {
            let trimmed = raw.trim();
            if trimmed.contains(',') {
                return Err(EngineError::ParseError {
                    raw: raw.to_string(),
                    value_type: "integer".to_string(),
                });
            }
            trimmed
                .parse::<i64>()
                .map(CoercedValue::Integer)
                .map_err(|_| EngineError::ParseError {
                    raw: raw.to_string(),
                    value_type: "integer".to_string(),
                })
        }
        ValueType::Float => BigDecimal::from_str(raw.trim())
            .map(CoercedValue::Float)
            .map_err(|_| EngineError::ParseError {
                raw: raw.to_string(),
                value_type: "float".to_string(),
            }),
        ValueType::String => {
            let trimmed = raw.trim_end_matches(['\r', '\n']);
            Ok(CoercedValue::Text(trimmed.to_string()))
        }
    }
}

fn eq_limit_as_decimal(eq_limit: &ParameterValue) -> Option<BigDecimal> {
    match eq_limit {
        ParameterValue::Int(i) => BigDecimal::from_str(&i.to_string()).ok(),
        ParameterValue::Float(f) => BigDecimal::from_str(&f.to_string()).ok(),
        ParameterValue::Str(s) => BigDecimal::from_str(s.trim()).ok(),
        ParameterValue::List(_) => None,
    }
}

fn eq_limit_as_text(eq_limit: &ParameterValue) -> String {
    match eq_limit {
        ParameterValue::Str(s) => s.clone(),
        ParameterValue::Int(i) => i.to_string(),
        ParameterValue::Float(f) => f.to_string(),
        ParameterValue::List(items) => items
            .iter()
            .map(eq_limit_as_text)
            .collect::<Vec<_>>()
            .join(","),
    }
}

/// Apply the spec §4.E rule table to a coerced value. Returns `true` for
/// PASS, `false` for FAIL. A rule that cannot be evaluated against the
/// supplied limits (e.g. `partial` against a non-string value) is a
/// `BadParameter` error, which the dispatcher should treat like any other
/// pre-flight failure — it never occurs for a well-formed test plan since
/// `TestPlanItem::validate` already enforces limit-field presence.
pub fn evaluate(
    value: &CoercedValue,
    limit_type: LimitType,
    lower_limit: Option<f64>,
    upper_limit: Option<f64>,
    eq_limit: Option<&ParameterValue>,
) -> EngineResult<bool> {
    match limit_type {
        LimitType::None => Ok(true),
        LimitType::Lower => {
            let lower = lower_limit.ok_or_else(|| {
                EngineError::BadParameter("limit_type=lower requires lower_limit".into())
            })?;
            Ok(as_f64(value)? >= lower)
        }
        LimitType::Upper => {
            let upper = upper_limit.ok_or_else(|| {
                EngineError::BadParameter("limit_type=upper requires upper_limit".into())
            })?;
            Ok(as_f64(value)? <= upper)
        }
        LimitType::Both => {
            let lower = lower_limit.ok_or_else(|| {
                EngineError::BadParameter("limit_type=both requires lower_limit".into())
            })?;
            let upper = upper_limit.ok_or_else(|| {
                EngineError::BadParameter("limit_type=both requires upper_limit".into())
            })?;
            let v = as_f64(value)?;
            Ok(v >= lower && v <= upper)
        }
        LimitType::Equality => {
            let eq = eq_limit.ok_or_else(|| {
                EngineError::BadParameter("limit_type=equality requires eq_limit".into())
            })?;
            Ok(typed_eq(value, eq))
        }
        LimitType::Inequality => {
            let eq = eq_limit.ok_or_else(|| {
                EngineError::BadParameter("limit_type=inequality requires eq_limit".into())
            })?;
            Ok(!typed_eq(value, eq))
        }
        LimitType::Partial => {
            let eq = eq_limit.ok_or_else(|| {
                EngineError::BadParameter("limit_type=partial requires eq_limit".into())
            })?;
            match value {
                CoercedValue::Text(text) => Ok(text.contains(&eq_limit_as_text(eq))),
                _ => Err(EngineError::BadParameter(
                    "limit_type=partial only applies to string-valued items".into(),
                )),
            }
        }
    }
}

fn as_f64(value: &CoercedValue) -> EngineResult<f64> {
    match value {
        CoercedValue::Integer(i) => Ok(*i as f64),
        CoercedValue::Float(f) => f
            .to_string()
            .parse::<f64>()
            .map_err(|_| EngineError::ParseError {
                raw: f.to_string(),
                value_type: "float".to_string(),
            }),
        CoercedValue::Text(_) => Err(EngineError::BadParameter(
            "numeric limit_type applied to a string-valued item".into(),
        )),
    }
}

fn typed_eq(value: &CoercedValue, eq_limit: &ParameterValue) -> bool {
    match value {
        CoercedValue::Integer(i) => eq_limit.as_i64() == Some(*i),
        CoercedValue::Float(f) => eq_limit_as_decimal(eq_limit).as_ref() == Some(f),
        CoercedValue::Text(t) => t == &eq_limit_as_text(eq_limit),
    }
}
