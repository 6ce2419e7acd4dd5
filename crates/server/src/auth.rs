//! Token authentication.
//!
//! The core consumes authentication as "token in, verified actor id out";
//! issuing tokens is someone else's job. The production implementation checks
//! the store's user table with constant-time comparison; tests inject a
//! static map.

use std::path::PathBuf;

use base64::Engine;
use rand::RngCore;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use dealgrid_store::Store;

/// Resolves a presented token to a verified actor id.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<Uuid>;
}

/// Checks tokens against the `users` table.
pub struct StoreAuthenticator {
    db_path: PathBuf,
}

impl StoreAuthenticator {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }
}

impl Authenticator for StoreAuthenticator {
    fn authenticate(&self, token: &str) -> Option<Uuid> {
        let store = match Store::open(&self.db_path) {
            Ok(store) => store,
            Err(e) => {
                log::error!("Authenticator could not open store: {}", e);
                return None;
            }
        };
        let tokens = match store.api_tokens() {
            Ok(tokens) => tokens,
            Err(e) => {
                log::error!("Authenticator could not read tokens: {}", e);
                return None;
            }
        };
        // Scan every registered token so timing doesn't depend on where (or
        // whether) a match occurs.
        let mut matched = None;
        for (candidate, user_id) in &tokens {
            if bool::from(candidate.as_bytes().ct_eq(token.as_bytes())) {
                matched = Some(*user_id);
            }
        }
        matched
    }
}

/// Fixed token → actor map, for tests and single-tenant setups.
pub struct StaticAuthenticator {
    tokens: Vec<(String, Uuid)>,
}

impl StaticAuthenticator {
    pub fn new(tokens: Vec<(String, Uuid)>) -> Self {
        Self { tokens }
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, token: &str) -> Option<Uuid> {
        let mut matched = None;
        for (candidate, user_id) in &self.tokens {
            if bool::from(candidate.as_bytes().ct_eq(token.as_bytes())) {
                matched = Some(*user_id);
            }
        }
        matched
    }
}

/// Generate a fresh API token: 32 cryptographically random bytes,
/// URL-safe base64.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_authenticator() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let auth = StaticAuthenticator::new(vec![
            ("token-a".to_string(), alice),
            ("token-b".to_string(), bob),
        ]);
        assert_eq!(auth.authenticate("token-a"), Some(alice));
        assert_eq!(auth.authenticate("token-b"), Some(bob));
        assert_eq!(auth.authenticate("token-c"), None);
        assert_eq!(auth.authenticate(""), None);
    }

    #[test]
    fn test_store_authenticator() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("auth.db");
        let store = Store::open(&db_path).unwrap();
        let alice = store.create_user("alice", "secret-token").unwrap();
        drop(store);

        let auth = StoreAuthenticator::new(db_path);
        assert_eq!(auth.authenticate("secret-token"), Some(alice));
        assert_eq!(auth.authenticate("wrong"), None);
    }

    #[test]
    fn test_generated_tokens_are_unique_and_long() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        // 32 bytes → 43 base64 chars without padding
        assert_eq!(a.len(), 43);
    }
}
