// SQLite-backed store for DealGrid

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use dealgrid_core::{
    Column, Grant, MutationAction, PermissionLevel, Row, RowData, Spreadsheet, Visibility,
};

use crate::audit::AuditEntry;
use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    api_token TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS spreadsheets (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL REFERENCES users(id),
    name TEXT NOT NULL,
    visibility TEXT NOT NULL DEFAULT 'private',  -- private | public
    settings TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS columns (
    id TEXT PRIMARY KEY,
    spreadsheet_id TEXT NOT NULL REFERENCES spreadsheets(id),
    name TEXT NOT NULL,
    kind TEXT NOT NULL,                          -- JSON, tagged by "kind"
    position INTEGER NOT NULL,
    required INTEGER NOT NULL DEFAULT 0,
    UNIQUE (spreadsheet_id, name),
    UNIQUE (spreadsheet_id, position)
);

CREATE TABLE IF NOT EXISTS rows (
    id TEXT NOT NULL,
    spreadsheet_id TEXT NOT NULL REFERENCES spreadsheets(id),
    position INTEGER NOT NULL,
    row_data TEXT NOT NULL,                      -- JSON object, column name -> value
    version INTEGER NOT NULL,
    updated_by TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (spreadsheet_id, id)
);

CREATE TABLE IF NOT EXISTS grants (
    spreadsheet_id TEXT NOT NULL REFERENCES spreadsheets(id),
    user_id TEXT NOT NULL REFERENCES users(id),
    permission_level TEXT NOT NULL,              -- view | edit | admin
    PRIMARY KEY (spreadsheet_id, user_id)
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    action TEXT NOT NULL,                        -- insert | update | delete
    actor TEXT NOT NULL,
    old_values TEXT,
    new_values TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rows_sheet_position ON rows (spreadsheet_id, position);
CREATE INDEX IF NOT EXISTS idx_audit_record ON audit_log (table_name, record_id);
"#;

/// A registered user. Account lifecycle lives elsewhere; the store keeps the
/// minimum the server consumes: identity and API token.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub api_token: String,
}

/// Handle on the DealGrid database.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    ///
    /// WAL mode so coordinators and read paths on separate connections don't
    /// block each other; a busy timeout covers the brief writer overlap
    /// between different spreadsheets' coordinators.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Register a user with an API token. Returns the new user id.
    pub fn create_user(&self, name: &str, api_token: &str) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO users (id, name, api_token, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), name, api_token, Utc::now().to_rfc3339()],
        )?;
        Ok(id)
    }

    pub fn user_by_name(&self, name: &str) -> Result<Option<User>, StoreError> {
        let found = self
            .conn
            .query_row(
                "SELECT id, name, api_token FROM users WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        found
            .map(|(id, name, api_token)| {
                Ok(User {
                    id: parse_uuid(&id)?,
                    name,
                    api_token,
                })
            })
            .transpose()
    }

    /// All (token, user id) pairs, for the authenticator's constant-time scan.
    pub fn api_tokens(&self) -> Result<Vec<(String, Uuid)>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT api_token, id FROM users")?;
        let raw = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(token, id)| Ok((token, parse_uuid(&id)?)))
            .collect()
    }

    // ========================================================================
    // Spreadsheets
    // ========================================================================

    pub fn create_spreadsheet(
        &self,
        owner: Uuid,
        name: &str,
        visibility: Visibility,
    ) -> Result<Spreadsheet, StoreError> {
        let sheet = Spreadsheet {
            id: Uuid::new_v4(),
            owner,
            name: name.to_string(),
            visibility,
            settings: serde_json::json!({}),
            created_at: Utc::now(),
        };
        self.conn.execute(
            "INSERT INTO spreadsheets (id, owner, name, visibility, settings, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sheet.id.to_string(),
                sheet.owner.to_string(),
                sheet.name,
                sheet.visibility.as_str(),
                serde_json::to_string(&sheet.settings)?,
                sheet.created_at.to_rfc3339(),
            ],
        )?;
        Ok(sheet)
    }

    pub fn get_spreadsheet(&self, id: Uuid) -> Result<Option<Spreadsheet>, StoreError> {
        let found = self
            .conn
            .query_row(
                "SELECT id, owner, name, visibility, settings, created_at
                 FROM spreadsheets WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;
        found
            .map(|(id, owner, name, visibility, settings, created_at)| {
                Ok(Spreadsheet {
                    id: parse_uuid(&id)?,
                    owner: parse_uuid(&owner)?,
                    name,
                    visibility: Visibility::parse(&visibility)
                        .ok_or_else(|| StoreError::Corrupt(format!("visibility {}", visibility)))?,
                    settings: serde_json::from_str(&settings)?,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .transpose()
    }

    // ========================================================================
    // Columns
    // ========================================================================

    pub fn add_column(&self, column: &Column) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO columns (id, spreadsheet_id, name, kind, position, required)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                column.id.to_string(),
                column.spreadsheet_id.to_string(),
                column.name,
                serde_json::to_string(&column.kind)?,
                column.position,
                column.required as i32,
            ],
        )?;
        Ok(())
    }

    /// Column definitions for a spreadsheet, in display order.
    pub fn list_columns(&self, spreadsheet_id: Uuid) -> Result<Vec<Column>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, kind, position, required
             FROM columns WHERE spreadsheet_id = ?1 ORDER BY position",
        )?;
        let raw = stmt
            .query_map(params![spreadsheet_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, i32>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(id, name, kind, position, required)| {
                Ok(Column {
                    id: parse_uuid(&id)?,
                    spreadsheet_id,
                    name,
                    kind: serde_json::from_str(&kind)?,
                    position,
                    required: required != 0,
                })
            })
            .collect()
    }

    // ========================================================================
    // Grants
    // ========================================================================

    /// Create or replace a collaborator grant.
    pub fn set_grant(&self, grant: &Grant) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO grants (spreadsheet_id, user_id, permission_level)
             VALUES (?1, ?2, ?3)",
            params![
                grant.spreadsheet_id.to_string(),
                grant.user_id.to_string(),
                grant.level.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn get_grant(
        &self,
        spreadsheet_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<PermissionLevel>, StoreError> {
        let found = self
            .conn
            .query_row(
                "SELECT permission_level FROM grants
                 WHERE spreadsheet_id = ?1 AND user_id = ?2",
                params![spreadsheet_id.to_string(), user_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        found
            .map(|level| {
                PermissionLevel::parse(&level)
                    .ok_or_else(|| StoreError::Corrupt(format!("permission_level {}", level)))
            })
            .transpose()
    }

    pub fn remove_grant(&self, spreadsheet_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM grants WHERE spreadsheet_id = ?1 AND user_id = ?2",
            params![spreadsheet_id.to_string(), user_id.to_string()],
        )?;
        Ok(())
    }

    // ========================================================================
    // Rows
    // ========================================================================

    pub fn get_row(&self, spreadsheet_id: Uuid, row_id: Uuid) -> Result<Option<Row>, StoreError> {
        let found = self
            .conn
            .query_row(
                "SELECT position, row_data, version, updated_by, updated_at
                 FROM rows WHERE spreadsheet_id = ?1 AND id = ?2",
                params![spreadsheet_id.to_string(), row_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        found
            .map(|(position, row_data, version, updated_by, updated_at)| {
                Ok(Row {
                    id: row_id,
                    spreadsheet_id,
                    position,
                    row_data: parse_row_data(&row_data)?,
                    version: version as u64,
                    updated_by: parse_uuid(&updated_by)?,
                    updated_at: parse_timestamp(&updated_at)?,
                })
            })
            .transpose()
    }

    /// All rows of a spreadsheet in display order (the ordinary read path).
    pub fn list_rows(&self, spreadsheet_id: Uuid) -> Result<Vec<Row>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, position, row_data, version, updated_by, updated_at
             FROM rows WHERE spreadsheet_id = ?1 ORDER BY position",
        )?;
        let raw = stmt
            .query_map(params![spreadsheet_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(id, position, row_data, version, updated_by, updated_at)| {
                Ok(Row {
                    id: parse_uuid(&id)?,
                    spreadsheet_id,
                    position,
                    row_data: parse_row_data(&row_data)?,
                    version: version as u64,
                    updated_by: parse_uuid(&updated_by)?,
                    updated_at: parse_timestamp(&updated_at)?,
                })
            })
            .collect()
    }

    /// Next append position for a new row.
    pub fn next_row_position(&self, spreadsheet_id: Uuid) -> Result<u32, StoreError> {
        let max: Option<u32> = self.conn.query_row(
            "SELECT MAX(position) FROM rows WHERE spreadsheet_id = ?1",
            params![spreadsheet_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(max.map_or(0, |p| p + 1))
    }

    // ========================================================================
    // Atomic commit
    // ========================================================================

    /// Persist one accepted mutation: the row change and its audit entry in a
    /// single transaction.
    ///
    /// `new_row` is `None` for deletes, `old_row` is `None` for inserts. The
    /// caller (the spreadsheet's coordinator) has already version-checked and
    /// validated; this is the durability step. If the audit append fails the
    /// transaction rolls back and the error is reported as
    /// [`StoreError::AuditWrite`] so it can be surfaced to alerting.
    pub fn commit_row_mutation(
        &mut self,
        action: MutationAction,
        new_row: Option<&Row>,
        old_row: Option<&Row>,
        actor: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (spreadsheet_id, row_id) = match (new_row, old_row) {
            (Some(row), _) | (None, Some(row)) => (row.spreadsheet_id, row.id),
            (None, None) => return Err(StoreError::RowMissing),
        };

        let tx = self.conn.transaction()?;

        match action {
            MutationAction::Insert => {
                let row = new_row.ok_or(StoreError::RowMissing)?;
                tx.execute(
                    "INSERT INTO rows (id, spreadsheet_id, position, row_data, version, updated_by, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        row.id.to_string(),
                        row.spreadsheet_id.to_string(),
                        row.position,
                        serde_json::to_string(&row.row_data)?,
                        row.version as i64,
                        row.updated_by.to_string(),
                        row.updated_at.to_rfc3339(),
                    ],
                )?;
            }
            MutationAction::Update => {
                let row = new_row.ok_or(StoreError::RowMissing)?;
                let changed = tx.execute(
                    "UPDATE rows SET row_data = ?3, version = ?4, updated_by = ?5, updated_at = ?6
                     WHERE spreadsheet_id = ?1 AND id = ?2",
                    params![
                        row.spreadsheet_id.to_string(),
                        row.id.to_string(),
                        serde_json::to_string(&row.row_data)?,
                        row.version as i64,
                        row.updated_by.to_string(),
                        row.updated_at.to_rfc3339(),
                    ],
                )?;
                if changed != 1 {
                    return Err(StoreError::RowMissing);
                }
            }
            MutationAction::Delete => {
                let changed = tx.execute(
                    "DELETE FROM rows WHERE spreadsheet_id = ?1 AND id = ?2",
                    params![spreadsheet_id.to_string(), row_id.to_string()],
                )?;
                if changed != 1 {
                    return Err(StoreError::RowMissing);
                }
            }
        }

        let old_values = old_row
            .map(|row| serde_json::to_string(&row.row_data))
            .transpose()?;
        let new_values = new_row
            .map(|row| serde_json::to_string(&row.row_data))
            .transpose()?;

        tx.execute(
            "INSERT INTO audit_log (table_name, record_id, action, actor, old_values, new_values, created_at)
             VALUES ('rows', ?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row_id.to_string(),
                action.as_str(),
                actor.to_string(),
                old_values,
                new_values,
                at.to_rfc3339(),
            ],
        )
        .map_err(StoreError::AuditWrite)?;

        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // Audit reads
    // ========================================================================

    /// Audit entries for one record, oldest first.
    pub fn audit_for_record(
        &self,
        table_name: &str,
        record_id: &str,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, table_name, record_id, action, actor, old_values, new_values, created_at
             FROM audit_log WHERE table_name = ?1 AND record_id = ?2 ORDER BY id",
        )?;
        let raw = stmt
            .query_map(params![table_name, record_id], map_audit_columns)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(parse_audit_entry).collect()
    }

    /// Most recent audit entries across all records, newest first.
    pub fn audit_recent(&self, limit: u32) -> Result<Vec<AuditEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, table_name, record_id, action, actor, old_values, new_values, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let raw = stmt
            .query_map(params![limit], map_audit_columns)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(parse_audit_entry).collect()
    }
}

type RawAuditColumns = (
    i64,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
);

fn map_audit_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAuditColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn parse_audit_entry(raw: RawAuditColumns) -> Result<AuditEntry, StoreError> {
    let (id, table_name, record_id, action, actor, old_values, new_values, created_at) = raw;
    Ok(AuditEntry {
        id,
        table_name,
        record_id,
        action: MutationAction::parse(&action)
            .ok_or_else(|| StoreError::Corrupt(format!("audit action {}", action)))?,
        actor: parse_uuid(&actor)?,
        old_values: old_values.map(|s| serde_json::from_str(&s)).transpose()?,
        new_values: new_values.map(|s| serde_json::from_str(&s)).transpose()?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|_| StoreError::Corrupt(format!("uuid {}", raw)))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt(format!("timestamp {}", raw)))
}

fn parse_row_data(raw: &str) -> Result<RowData, StoreError> {
    serde_json::from_str(raw).map_err(StoreError::Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealgrid_core::ColumnType;
    use serde_json::json;

    fn open_temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn make_row(sheet: Uuid, actor: Uuid, version: u64, value: f64) -> Row {
        let mut data = RowData::new();
        data.insert("Company".into(), json!("Acme"));
        data.insert("DealValue".into(), json!(value));
        Row {
            id: Uuid::new_v4(),
            spreadsheet_id: sheet,
            position: 0,
            row_data: data,
            version,
            updated_by: actor,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_open_creates_schema() {
        let (_dir, store) = open_temp_store();
        assert_eq!(store.api_tokens().unwrap().len(), 0);
    }

    #[test]
    fn test_user_lifecycle() {
        let (_dir, store) = open_temp_store();
        let id = store.create_user("alice", "token-a").unwrap();
        let user = store.user_by_name("alice").unwrap().unwrap();
        assert_eq!(user.id, id);
        assert_eq!(user.api_token, "token-a");
        assert!(store.user_by_name("bob").unwrap().is_none());

        let tokens = store.api_tokens().unwrap();
        assert_eq!(tokens, vec![("token-a".to_string(), id)]);
    }

    #[test]
    fn test_spreadsheet_roundtrip() {
        let (_dir, store) = open_temp_store();
        let owner = store.create_user("alice", "t").unwrap();
        let sheet = store
            .create_spreadsheet(owner, "Q3 Pipeline", Visibility::Private)
            .unwrap();

        let loaded = store.get_spreadsheet(sheet.id).unwrap().unwrap();
        assert_eq!(loaded.name, "Q3 Pipeline");
        assert_eq!(loaded.owner, owner);
        assert_eq!(loaded.visibility, Visibility::Private);
        assert!(store.get_spreadsheet(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_columns_ordered_by_position() {
        let (_dir, store) = open_temp_store();
        let owner = store.create_user("alice", "t").unwrap();
        let sheet = store
            .create_spreadsheet(owner, "Deals", Visibility::Private)
            .unwrap();

        let second = Column::new(
            sheet.id,
            "DealValue",
            ColumnType::Currency { min: None, max: None },
            1,
        );
        let first =
            Column::new(sheet.id, "Company", ColumnType::Text { max_length: None }, 0).required();
        store.add_column(&second).unwrap();
        store.add_column(&first).unwrap();

        let columns = store.list_columns(sheet.id).unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].name, "Company");
        assert!(columns[0].required);
        assert_eq!(columns[1].name, "DealValue");
        assert_eq!(
            columns[1].kind,
            ColumnType::Currency { min: None, max: None }
        );
    }

    #[test]
    fn test_duplicate_column_position_rejected() {
        let (_dir, store) = open_temp_store();
        let owner = store.create_user("alice", "t").unwrap();
        let sheet = store
            .create_spreadsheet(owner, "Deals", Visibility::Private)
            .unwrap();

        let a = Column::new(sheet.id, "A", ColumnType::Date, 0);
        let b = Column::new(sheet.id, "B", ColumnType::Date, 0);
        store.add_column(&a).unwrap();
        assert!(store.add_column(&b).is_err());
    }

    #[test]
    fn test_grant_roundtrip() {
        let (_dir, store) = open_temp_store();
        let owner = store.create_user("alice", "t1").unwrap();
        let collaborator = store.create_user("bob", "t2").unwrap();
        let sheet = store
            .create_spreadsheet(owner, "Deals", Visibility::Private)
            .unwrap();

        assert!(store.get_grant(sheet.id, collaborator).unwrap().is_none());

        store
            .set_grant(&Grant {
                spreadsheet_id: sheet.id,
                user_id: collaborator,
                level: PermissionLevel::Edit,
            })
            .unwrap();
        assert_eq!(
            store.get_grant(sheet.id, collaborator).unwrap(),
            Some(PermissionLevel::Edit)
        );

        // Re-granting replaces the level
        store
            .set_grant(&Grant {
                spreadsheet_id: sheet.id,
                user_id: collaborator,
                level: PermissionLevel::View,
            })
            .unwrap();
        assert_eq!(
            store.get_grant(sheet.id, collaborator).unwrap(),
            Some(PermissionLevel::View)
        );

        store.remove_grant(sheet.id, collaborator).unwrap();
        assert!(store.get_grant(sheet.id, collaborator).unwrap().is_none());
    }

    #[test]
    fn test_insert_commit_writes_row_and_audit() {
        let (_dir, mut store) = open_temp_store();
        let actor = store.create_user("alice", "t").unwrap();
        let sheet = store
            .create_spreadsheet(actor, "Deals", Visibility::Private)
            .unwrap();

        let row = make_row(sheet.id, actor, 1, 5000.0);
        store
            .commit_row_mutation(MutationAction::Insert, Some(&row), None, actor, Utc::now())
            .unwrap();

        let loaded = store.get_row(sheet.id, row.id).unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.row_data["DealValue"], json!(5000.0));

        let audit = store.audit_for_record("rows", &row.id.to_string()).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, MutationAction::Insert);
        assert_eq!(audit[0].actor, actor);
        assert!(audit[0].old_values.is_none());
        assert_eq!(
            audit[0].new_values.as_ref().unwrap()["DealValue"],
            json!(5000.0)
        );
    }

    #[test]
    fn test_update_commit_audits_before_and_after() {
        let (_dir, mut store) = open_temp_store();
        let actor = store.create_user("alice", "t").unwrap();
        let sheet = store
            .create_spreadsheet(actor, "Deals", Visibility::Private)
            .unwrap();

        let row = make_row(sheet.id, actor, 1, 5000.0);
        store
            .commit_row_mutation(MutationAction::Insert, Some(&row), None, actor, Utc::now())
            .unwrap();

        let mut updated = row.clone();
        updated.version = 2;
        updated.row_data.insert("DealValue".into(), json!(6000.0));
        store
            .commit_row_mutation(
                MutationAction::Update,
                Some(&updated),
                Some(&row),
                actor,
                Utc::now(),
            )
            .unwrap();

        let loaded = store.get_row(sheet.id, row.id).unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.row_data["DealValue"], json!(6000.0));

        let audit = store.audit_for_record("rows", &row.id.to_string()).unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(
            audit[1].old_values.as_ref().unwrap()["DealValue"],
            json!(5000.0)
        );
        assert_eq!(
            audit[1].new_values.as_ref().unwrap()["DealValue"],
            json!(6000.0)
        );
    }

    #[test]
    fn test_delete_commit_removes_row_keeps_audit() {
        let (_dir, mut store) = open_temp_store();
        let actor = store.create_user("alice", "t").unwrap();
        let sheet = store
            .create_spreadsheet(actor, "Deals", Visibility::Private)
            .unwrap();

        let row = make_row(sheet.id, actor, 1, 5000.0);
        store
            .commit_row_mutation(MutationAction::Insert, Some(&row), None, actor, Utc::now())
            .unwrap();
        store
            .commit_row_mutation(MutationAction::Delete, None, Some(&row), actor, Utc::now())
            .unwrap();

        assert!(store.get_row(sheet.id, row.id).unwrap().is_none());

        let audit = store.audit_for_record("rows", &row.id.to_string()).unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].action, MutationAction::Delete);
        assert!(audit[1].new_values.is_none());
        assert_eq!(
            audit[1].old_values.as_ref().unwrap()["Company"],
            json!("Acme")
        );
    }

    #[test]
    fn test_update_missing_row_rolls_back() {
        let (_dir, mut store) = open_temp_store();
        let actor = store.create_user("alice", "t").unwrap();
        let sheet = store
            .create_spreadsheet(actor, "Deals", Visibility::Private)
            .unwrap();

        let ghost = make_row(sheet.id, actor, 2, 1.0);
        let result = store.commit_row_mutation(
            MutationAction::Update,
            Some(&ghost),
            Some(&ghost),
            actor,
            Utc::now(),
        );
        assert!(matches!(result, Err(StoreError::RowMissing)));

        // Nothing persisted, nothing audited
        assert!(store.get_row(sheet.id, ghost.id).unwrap().is_none());
        assert!(store
            .audit_for_record("rows", &ghost.id.to_string())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_list_rows_and_positions() {
        let (_dir, mut store) = open_temp_store();
        let actor = store.create_user("alice", "t").unwrap();
        let sheet = store
            .create_spreadsheet(actor, "Deals", Visibility::Private)
            .unwrap();

        assert_eq!(store.next_row_position(sheet.id).unwrap(), 0);

        let mut first = make_row(sheet.id, actor, 1, 1.0);
        first.position = 0;
        let mut second = make_row(sheet.id, actor, 1, 2.0);
        second.position = 1;
        store
            .commit_row_mutation(MutationAction::Insert, Some(&first), None, actor, Utc::now())
            .unwrap();
        store
            .commit_row_mutation(MutationAction::Insert, Some(&second), None, actor, Utc::now())
            .unwrap();

        assert_eq!(store.next_row_position(sheet.id).unwrap(), 2);
        let rows = store.list_rows(sheet.id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row_data["DealValue"], json!(1.0));
        assert_eq!(rows[1].row_data["DealValue"], json!(2.0));
    }

    #[test]
    fn test_audit_recent_newest_first() {
        let (_dir, mut store) = open_temp_store();
        let actor = store.create_user("alice", "t").unwrap();
        let sheet = store
            .create_spreadsheet(actor, "Deals", Visibility::Private)
            .unwrap();

        let a = make_row(sheet.id, actor, 1, 1.0);
        let b = make_row(sheet.id, actor, 1, 2.0);
        store
            .commit_row_mutation(MutationAction::Insert, Some(&a), None, actor, Utc::now())
            .unwrap();
        store
            .commit_row_mutation(MutationAction::Insert, Some(&b), None, actor, Utc::now())
            .unwrap();

        let recent = store.audit_recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].record_id, b.id.to_string());
        assert_eq!(recent[1].record_id, a.id.to_string());
    }

    #[test]
    fn test_two_stores_share_one_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let mut writer = Store::open(&path).unwrap();
        let reader = Store::open(&path).unwrap();

        let actor = writer.create_user("alice", "t").unwrap();
        let sheet = writer
            .create_spreadsheet(actor, "Deals", Visibility::Private)
            .unwrap();
        let row = make_row(sheet.id, actor, 1, 5000.0);
        writer
            .commit_row_mutation(MutationAction::Insert, Some(&row), None, actor, Utc::now())
            .unwrap();

        let loaded = reader.get_row(sheet.id, row.id).unwrap().unwrap();
        assert_eq!(loaded.version, 1);
    }
}
