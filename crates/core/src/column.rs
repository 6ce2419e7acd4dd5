//! Column definitions for dynamically-schemed spreadsheets.
//!
//! Each spreadsheet defines its own set of typed columns. Row payloads are
//! JSON objects keyed by column name; every key must correspond to a defined
//! column and every value must satisfy that column's type.
//!
//! ## Case Sensitivity
//!
//! Select option matching is case-sensitive: "Won" != "won". Owners who want
//! case-insensitive behavior should normalize their option lists.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The type of a column — one variant per validator.
///
/// The tagged-enum shape keeps validation exhaustive: adding a variant forces
/// every match site to handle it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnType {
    /// Any string, optionally length-capped.
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
    },
    /// A finite number, optionally bounded.
    Number {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// A monetary amount. Validates like Number; rendering differs client-side.
    Currency {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// A calendar date, `YYYY-MM-DD`.
    Date,
    /// A JSON boolean.
    Boolean,
    /// One of an enumerated set of options.
    Select { options: Vec<String> },
}

impl ColumnType {
    /// Short label for error messages and CLI display.
    pub fn label(&self) -> &'static str {
        match self {
            ColumnType::Text { .. } => "text",
            ColumnType::Number { .. } => "number",
            ColumnType::Currency { .. } => "currency",
            ColumnType::Date => "date",
            ColumnType::Boolean => "boolean",
            ColumnType::Select { .. } => "select",
        }
    }

    /// Validate a candidate value against this type.
    ///
    /// Returns the *normalized* value on success: numeric strings become JSON
    /// numbers, dates are re-emitted in canonical `YYYY-MM-DD` form. Returns
    /// a human-readable message on failure.
    pub fn validate_value(&self, raw: &Value) -> Result<Value, String> {
        match self {
            ColumnType::Text { max_length } => {
                let s = raw
                    .as_str()
                    .ok_or_else(|| "must be a string".to_string())?;
                if let Some(max) = max_length {
                    let len = s.chars().count();
                    if len > *max {
                        return Err(format!("exceeds maximum length of {} characters", max));
                    }
                }
                Ok(Value::String(s.to_string()))
            }
            ColumnType::Number { min, max } | ColumnType::Currency { min, max } => {
                let x = coerce_numeric(raw)?;
                check_bounds(x, *min, *max)?;
                // Finite by construction, so from_f64 cannot fail
                serde_json::Number::from_f64(x)
                    .map(Value::Number)
                    .ok_or_else(|| "must be a finite number".to_string())
            }
            ColumnType::Date => {
                let s = raw
                    .as_str()
                    .ok_or_else(|| "must be a date string (YYYY-MM-DD)".to_string())?;
                let date = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .map_err(|_| "must be a calendar date (YYYY-MM-DD)".to_string())?;
                Ok(Value::String(date.format("%Y-%m-%d").to_string()))
            }
            ColumnType::Boolean => {
                let b = raw
                    .as_bool()
                    .ok_or_else(|| "must be a boolean".to_string())?;
                Ok(Value::Bool(b))
            }
            ColumnType::Select { options } => {
                let s = raw
                    .as_str()
                    .ok_or_else(|| "must be a string".to_string())?;
                if options.iter().any(|opt| opt == s) {
                    Ok(Value::String(s.to_string()))
                } else {
                    Err(format!("must be one of: {}", options.join(", ")))
                }
            }
        }
    }
}

/// Coerce a JSON value to a finite f64.
///
/// Accepts JSON numbers and numeric strings (trimmed, leading `+` allowed).
fn coerce_numeric(raw: &Value) -> Result<f64, String> {
    let x = match raw {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| "must be a finite number".to_string())?,
        Value::String(s) => parse_numeric(s)?,
        _ => return Err("must be a number".to_string()),
    };
    if !x.is_finite() {
        return Err("must be a finite number".to_string());
    }
    Ok(x)
}

/// Parse a numeric string for Number/Currency columns.
///
/// Whitespace is trimmed and a leading `+` is allowed. Currency symbols and
/// thousands separators are not: clients submit plain numerals.
pub fn parse_numeric(raw: &str) -> Result<f64, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("must not be empty".to_string());
    }

    let normalized = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if normalized.is_empty() {
        return Err("is not a valid number".to_string());
    }

    // f64::from_str accepts "inf"/"NaN"; those are not spreadsheet values
    let parsed: f64 = normalized
        .parse()
        .map_err(|_| "is not a valid number".to_string())?;
    if !parsed.is_finite() {
        return Err("is not a valid number".to_string());
    }
    Ok(parsed)
}

fn check_bounds(x: f64, min: Option<f64>, max: Option<f64>) -> Result<(), String> {
    if let Some(min) = min {
        if x < min {
            return Err(format!("must be at least {}", min));
        }
    }
    if let Some(max) = max {
        if x > max {
            return Err(format!("must be at most {}", max));
        }
    }
    Ok(())
}

/// A column definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub id: Uuid,
    pub spreadsheet_id: Uuid,
    /// Display name; the key used in row payloads. Unique per spreadsheet.
    pub name: String,
    pub kind: ColumnType,
    /// Display order. Unique per spreadsheet.
    pub position: u32,
    pub required: bool,
}

impl Column {
    /// Create a new optional column with a fresh id.
    pub fn new(
        spreadsheet_id: Uuid,
        name: impl Into<String>,
        kind: ColumnType,
        position: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            spreadsheet_id,
            name: name.into(),
            kind,
            position,
            required: false,
        }
    }

    /// Mark the column required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}
