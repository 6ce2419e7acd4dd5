// Domain model and pure validation

pub mod column;
pub mod permission;
pub mod row;
pub mod spreadsheet;
pub mod validate;

pub use column::{Column, ColumnType};
pub use permission::{effective_permission, PermissionLevel, Visibility};
pub use row::{MutationAction, Row, RowData};
pub use spreadsheet::{Grant, Spreadsheet};
pub use validate::{apply_delta, validate_row, FieldError};
