//! Schema validation for row payloads.
//!
//! Pure and side-effect-free: the validator sees a column set and a candidate
//! payload, nothing else. It never touches storage or broadcasts.
//!
//! Rules:
//! - Every key must name a defined column (unknown keys are rejected).
//! - Every value must satisfy its column's type; values are normalized
//!   (numeric strings → numbers, dates → canonical `YYYY-MM-DD`).
//! - Every required column must be present with a non-null value.

use crate::column::Column;
use crate::row::RowData;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    /// Column name (or candidate key, for unknown-key errors).
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Merge a delta onto the current payload.
///
/// A `null` value clears the field; anything else replaces it. The result is
/// a candidate payload for [`validate_row`] — clears of required columns
/// surface there as missing-required errors.
pub fn apply_delta(current: &RowData, delta: &RowData) -> RowData {
    let mut merged = current.clone();
    for (key, value) in delta {
        if value.is_null() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Validate a full candidate payload against a column set.
///
/// Returns the normalized payload, or every field error found (the client
/// gets all of them in one round trip, not just the first).
pub fn validate_row(columns: &[Column], row_data: &RowData) -> Result<RowData, Vec<FieldError>> {
    let mut errors = Vec::new();
    let mut normalized = RowData::new();

    for (key, value) in row_data {
        let Some(column) = columns.iter().find(|c| &c.name == key) else {
            errors.push(FieldError::new(key, "unknown column"));
            continue;
        };
        if value.is_null() {
            // Null means "cleared"; required-ness is checked below.
            continue;
        }
        match column.kind.validate_value(value) {
            Ok(v) => {
                normalized.insert(key.clone(), v);
            }
            Err(message) => errors.push(FieldError::new(key, message)),
        }
    }

    for column in columns {
        if column.required && !normalized.contains_key(&column.name) {
            // Don't double-report a field that already failed its type check
            if !errors.iter().any(|e| e.field == column.name) {
                errors.push(FieldError::new(&column.name, "required column is missing"));
            }
        }
    }

    if errors.is_empty() {
        Ok(normalized)
    } else {
        Err(errors)
    }
}

/// Convenience check used by tests and the read path: does a stored payload
/// still conform to the column set?
pub fn conforms(columns: &[Column], row_data: &RowData) -> bool {
    validate_row(columns, row_data).is_ok()
}
