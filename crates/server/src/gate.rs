//! Permission gate.
//!
//! Runs before validation and before the coordinator is invoked: a denied
//! request must cost nothing downstream and must not leak row contents — or
//! the spreadsheet's existence — to unauthorized actors.

use uuid::Uuid;

use dealgrid_core::{effective_permission, PermissionLevel};
use dealgrid_store::{Store, StoreError};

/// Gate failure.
#[derive(Debug)]
pub enum GateError {
    /// Actor lacks the required level, or the spreadsheet does not exist.
    /// The two cases are deliberately indistinguishable.
    Denied,
    /// Storage failed while resolving; not a permission verdict.
    Store(StoreError),
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateError::Denied => write!(f, "access denied"),
            GateError::Store(e) => write!(f, "permission lookup failed: {}", e),
        }
    }
}

impl std::error::Error for GateError {}

/// Resolve the actor's effective level and require at least `required`.
///
/// Returns the effective level on success so callers can log or surface it.
pub fn check_access(
    store: &Store,
    spreadsheet_id: Uuid,
    actor: Uuid,
    required: PermissionLevel,
) -> Result<PermissionLevel, GateError> {
    let sheet = store
        .get_spreadsheet(spreadsheet_id)
        .map_err(GateError::Store)?
        .ok_or(GateError::Denied)?;
    let grant = store
        .get_grant(spreadsheet_id, actor)
        .map_err(GateError::Store)?;

    let effective = effective_permission(sheet.owner, sheet.visibility, actor, grant)
        .ok_or(GateError::Denied)?;
    if !effective.allows(required) {
        log::warn!(
            "Permission denied: actor {} has {} on spreadsheet {}, needs {}",
            actor,
            effective,
            spreadsheet_id,
            required
        );
        return Err(GateError::Denied);
    }
    Ok(effective)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealgrid_core::{Grant, Visibility};

    fn setup() -> (tempfile::TempDir, Store, Uuid, Uuid, Uuid) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("gate.db")).unwrap();
        let owner = store.create_user("owner", "t1").unwrap();
        let viewer = store.create_user("viewer", "t2").unwrap();
        let sheet = store
            .create_spreadsheet(owner, "Deals", Visibility::Private)
            .unwrap();
        store
            .set_grant(&Grant {
                spreadsheet_id: sheet.id,
                user_id: viewer,
                level: PermissionLevel::View,
            })
            .unwrap();
        (dir, store, sheet.id, owner, viewer)
    }

    #[test]
    fn test_owner_passes_all_levels() {
        let (_dir, store, sheet, owner, _) = setup();
        for required in [
            PermissionLevel::View,
            PermissionLevel::Edit,
            PermissionLevel::Admin,
        ] {
            assert!(check_access(&store, sheet, owner, required).is_ok());
        }
    }

    #[test]
    fn test_view_grant_cannot_edit() {
        let (_dir, store, sheet, _, viewer) = setup();
        assert!(check_access(&store, sheet, viewer, PermissionLevel::View).is_ok());
        assert!(matches!(
            check_access(&store, sheet, viewer, PermissionLevel::Edit),
            Err(GateError::Denied)
        ));
    }

    #[test]
    fn test_stranger_denied_on_private() {
        let (_dir, store, sheet, _, _) = setup();
        let stranger = store.create_user("stranger", "t3").unwrap();
        assert!(matches!(
            check_access(&store, sheet, stranger, PermissionLevel::View),
            Err(GateError::Denied)
        ));
    }

    #[test]
    fn test_unknown_spreadsheet_indistinguishable_from_denied() {
        let (_dir, store, _, owner, _) = setup();
        assert!(matches!(
            check_access(&store, Uuid::new_v4(), owner, PermissionLevel::View),
            Err(GateError::Denied)
        ));
    }

    #[test]
    fn test_public_sheet_viewable_by_anyone() {
        let (_dir, store, _, owner, _) = setup();
        let sheet = store
            .create_spreadsheet(owner, "Open Pipeline", Visibility::Public)
            .unwrap();
        let stranger = store.create_user("stranger", "t3").unwrap();
        assert_eq!(
            check_access(&store, sheet.id, stranger, PermissionLevel::View).unwrap(),
            PermissionLevel::View
        );
        assert!(check_access(&store, sheet.id, stranger, PermissionLevel::Edit).is_err());
    }
}
