//! Durable storage for DealGrid.
//!
//! One SQLite database file holds users, spreadsheets, columns, rows,
//! collaborator grants, and the append-only audit log. Mutation commits write
//! the row and its audit entry in a single transaction — a committed mutation
//! is never visible without its audit entry, and vice versa.
//!
//! A `Store` wraps one SQLite connection. Components that need parallel
//! access (per-spreadsheet coordinators, per-connection read paths) each open
//! their own `Store` against the same file; WAL mode keeps readers and the
//! single writer per spreadsheet out of each other's way.

mod audit;
mod error;
mod store;

pub use audit::AuditEntry;
pub use error::StoreError;
pub use store::{Store, User};
