//! Audit log entries.
//!
//! Every committed mutation appends exactly one entry, written in the same
//! transaction as the row change. Entries are never updated or deleted; the
//! log exists for compliance review, not rollback.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use dealgrid_core::MutationAction;

/// An immutable before/after record of a committed mutation.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// Monotonic log id (SQLite rowid).
    pub id: i64,
    /// Table the mutation touched (currently always `"rows"`).
    pub table_name: String,
    /// Id of the mutated record.
    pub record_id: String,
    pub action: MutationAction,
    pub actor: Uuid,
    /// Record state before the mutation. `None` for inserts.
    pub old_values: Option<Value>,
    /// Record state after the mutation. `None` for deletes.
    pub new_values: Option<Value>,
    pub created_at: DateTime<Utc>,
}
