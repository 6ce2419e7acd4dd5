//! Rows: versioned JSON payloads keyed by column name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A row payload: column name → typed value. Insertion order is irrelevant.
pub type RowData = serde_json::Map<String, Value>;

/// A stored row.
///
/// `version` starts at 1 on insert and increases by exactly 1 per committed
/// mutation; a version number is never reused. Every key in `row_data`
/// corresponds to a currently defined column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    pub id: Uuid,
    pub spreadsheet_id: Uuid,
    /// Display order within the spreadsheet.
    pub position: u32,
    pub row_data: RowData,
    pub version: u64,
    pub updated_by: Uuid,
    pub updated_at: DateTime<Utc>,
}

/// The kind of a committed row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    Insert,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationAction::Insert => "insert",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(MutationAction::Insert),
            "update" => Some(MutationAction::Update),
            "delete" => Some(MutationAction::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for MutationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
