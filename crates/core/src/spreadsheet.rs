//! Spreadsheets and collaborator grants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::permission::{PermissionLevel, Visibility};

/// A spreadsheet: owned by its creator, shared through grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spreadsheet {
    pub id: Uuid,
    pub owner: Uuid,
    pub name: String,
    pub visibility: Visibility,
    /// Free-form per-spreadsheet settings (display preferences etc.).
    pub settings: Value,
    pub created_at: DateTime<Utc>,
}

/// A collaborator grant binding a user to a spreadsheet at an access level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub spreadsheet_id: Uuid,
    pub user_id: Uuid,
    pub level: PermissionLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spreadsheet_serialization() {
        let sheet = Spreadsheet {
            id: Uuid::new_v4(),
            owner: Uuid::new_v4(),
            name: "Q3 Pipeline".into(),
            visibility: Visibility::Private,
            settings: serde_json::json!({}),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&sheet).unwrap();
        assert!(json.contains(r#""visibility":"private""#));
        let parsed: Spreadsheet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "Q3 Pipeline");
    }
}
