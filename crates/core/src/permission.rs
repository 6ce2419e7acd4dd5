//! Access levels and effective-permission resolution.
//!
//! A spreadsheet is owned by its creator (always admin) and shared through
//! collaborator grants. Visibility widens the floor: public spreadsheets are
//! viewable by any authenticated actor. Resolution is pure; the server-side
//! gate supplies the inputs from storage.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Access level for a spreadsheet. Ordered: View < Edit < Admin.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    /// Read rows and receive broadcasts.
    View,
    /// View plus row mutations.
    Edit,
    /// Edit plus column and grant management.
    Admin,
}

impl PermissionLevel {
    /// True if this level satisfies `required`.
    pub fn allows(self, required: PermissionLevel) -> bool {
        self >= required
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PermissionLevel::View => "view",
            PermissionLevel::Edit => "edit",
            PermissionLevel::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "view" => Some(PermissionLevel::View),
            "edit" => Some(PermissionLevel::Edit),
            "admin" => Some(PermissionLevel::Admin),
            _ => None,
        }
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spreadsheet visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Only the owner and granted collaborators have access.
    Private,
    /// Any authenticated actor may view.
    Public,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Visibility::Private),
            "public" => Some(Visibility::Public),
            _ => None,
        }
    }
}

/// Resolve an actor's effective permission level.
///
/// The owner is always admin. Otherwise the effective level is the stronger
/// of the explicit grant (if any) and the visibility floor (View on public
/// spreadsheets). `None` means denied outright: the actor must not learn
/// anything about the spreadsheet, including whether it exists.
pub fn effective_permission(
    owner: Uuid,
    visibility: Visibility,
    actor: Uuid,
    grant: Option<PermissionLevel>,
) -> Option<PermissionLevel> {
    if actor == owner {
        return Some(PermissionLevel::Admin);
    }
    let floor = match visibility {
        Visibility::Public => Some(PermissionLevel::View),
        Visibility::Private => None,
    };
    match (grant, floor) {
        (Some(g), Some(f)) => Some(g.max(f)),
        (Some(g), None) => Some(g),
        (None, floor) => floor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(PermissionLevel::Admin.allows(PermissionLevel::Edit));
        assert!(PermissionLevel::Edit.allows(PermissionLevel::View));
        assert!(!PermissionLevel::View.allows(PermissionLevel::Edit));
        assert!(PermissionLevel::Edit.allows(PermissionLevel::Edit));
    }

    #[test]
    fn test_owner_is_admin() {
        let owner = Uuid::new_v4();
        assert_eq!(
            effective_permission(owner, Visibility::Private, owner, None),
            Some(PermissionLevel::Admin)
        );
    }

    #[test]
    fn test_private_without_grant_is_denied() {
        let owner = Uuid::new_v4();
        let actor = Uuid::new_v4();
        assert_eq!(
            effective_permission(owner, Visibility::Private, actor, None),
            None
        );
    }

    #[test]
    fn test_grant_applies_on_private() {
        let owner = Uuid::new_v4();
        let actor = Uuid::new_v4();
        assert_eq!(
            effective_permission(owner, Visibility::Private, actor, Some(PermissionLevel::Edit)),
            Some(PermissionLevel::Edit)
        );
    }

    #[test]
    fn test_public_floor_is_view() {
        let owner = Uuid::new_v4();
        let actor = Uuid::new_v4();
        assert_eq!(
            effective_permission(owner, Visibility::Public, actor, None),
            Some(PermissionLevel::View)
        );
        // A grant on a public spreadsheet wins over the floor
        assert_eq!(
            effective_permission(owner, Visibility::Public, actor, Some(PermissionLevel::Admin)),
            Some(PermissionLevel::Admin)
        );
    }

    #[test]
    fn test_parse_roundtrip() {
        for level in [
            PermissionLevel::View,
            PermissionLevel::Edit,
            PermissionLevel::Admin,
        ] {
            assert_eq!(PermissionLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(PermissionLevel::parse("owner"), None);
        assert_eq!(Visibility::parse("public"), Some(Visibility::Public));
        assert_eq!(Visibility::parse("hidden"), None);
    }
}
