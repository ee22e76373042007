//! Credentials and ACL.
//!
//! Sessions only see the [`Permissions`] trait. [`AuthManager`] chains named
//! [`AuthProvider`]s picked from a map the embedding application builds at
//! startup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// Kind of topic access being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Subscribe/unsubscribe.
    Read,
    /// Publish.
    Write,
}

/// Outcome of a credential or ACL check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Allow,
    Deny,
}

impl AuthStatus {
    pub fn allowed(self) -> bool {
        self == AuthStatus::Allow
    }
}

/// A known user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    /// Hex encoded SHA-256 of the password.
    pub password_hash: String,
    pub project_id: String,
}

/// ACL collaborator consumed by the registry and sessions.
pub trait Permissions: Send + Sync {
    fn password(&self, client_id: &str, user: &str, password: &[u8]) -> AuthStatus;
    fn acl(&self, client_id: &str, user: &str, topic: &str, access: Access) -> AuthStatus;
    fn fetch_user(&self, user: &str) -> Option<User>;
}

/// Allow-all permissions (default).
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Permissions for AllowAll {
    fn password(&self, _: &str, _: &str, _: &[u8]) -> AuthStatus {
        AuthStatus::Allow
    }

    fn acl(&self, _: &str, _: &str, _: &str, _: Access) -> AuthStatus {
        AuthStatus::Allow
    }

    fn fetch_user(&self, _: &str) -> Option<User> {
        None
    }
}

/// A credential backend.
pub trait AuthProvider: Send + Sync {
    fn password(&self, client_id: &str, user: &str, password: &[u8]) -> AuthStatus;
    fn acl(&self, client_id: &str, user: &str, topic: &str, access: Access) -> AuthStatus;
    fn get_user(&self, user: &str) -> Option<User>;
}

/// Providers available to [`AuthManager::new`], by name.
pub type ProviderMap = HashMap<String, Arc<dyn AuthProvider>>;

/// Chains providers; the first one that allows wins.
pub struct AuthManager {
    providers: Vec<Arc<dyn AuthProvider>>,
    anonymous: bool,
}

impl AuthManager {
    /// Build a manager from the providers named in `names`, in order.
    pub fn new(names: &[&str], available: &ProviderMap, anonymous: bool) -> Result<Self> {
        let providers = names
            .iter()
            .map(|name| {
                available
                    .get(*name)
                    .cloned()
                    .ok_or_else(|| Error::UnknownProvider(name.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            providers,
            anonymous,
        })
    }

    pub fn allow_anonymous(&self) -> bool {
        self.anonymous
    }
}

impl Permissions for AuthManager {
    fn password(&self, client_id: &str, user: &str, password: &[u8]) -> AuthStatus {
        if user.is_empty() && self.anonymous {
            return AuthStatus::Allow;
        }
        let allowed = self
            .providers
            .iter()
            .any(|p| p.password(client_id, user, password).allowed());
        if allowed { AuthStatus::Allow } else { AuthStatus::Deny }
    }

    fn acl(&self, client_id: &str, user: &str, topic: &str, access: Access) -> AuthStatus {
        let allowed = self
            .providers
            .iter()
            .any(|p| p.acl(client_id, user, topic, access).allowed());
        if allowed { AuthStatus::Allow } else { AuthStatus::Deny }
    }

    fn fetch_user(&self, user: &str) -> Option<User> {
        self.providers.iter().find_map(|p| p.get_user(user))
    }
}

/// In-memory user table with SHA-256 password digests. Allows every topic.
#[derive(Default)]
pub struct SimpleAuth {
    creds: RwLock<HashMap<String, User>>,
}

impl SimpleAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user.
    pub fn add_user(&self, name: &str, password: &str, project_id: &str) -> Result<()> {
        if name.is_empty() || password.is_empty() || project_id.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "user {:?}: name, password and project id are required",
                name
            )));
        }
        let user = User {
            name: name.to_string(),
            password_hash: hash_password(password.as_bytes()),
            project_id: project_id.to_string(),
        };
        self.creds.write().insert(name.to_string(), user);
        Ok(())
    }

    pub fn del_user(&self, name: &str) {
        self.creds.write().remove(name);
    }
}

impl AuthProvider for SimpleAuth {
    fn password(&self, client_id: &str, user: &str, password: &[u8]) -> AuthStatus {
        let creds = self.creds.read();
        match creds.get(user) {
            Some(u) if u.password_hash == hash_password(password) => AuthStatus::Allow,
            _ => {
                debug!("Password rejected for {} (client {})", user, client_id);
                AuthStatus::Deny
            }
        }
    }

    fn acl(&self, _: &str, _: &str, _: &str, _: Access) -> AuthStatus {
        AuthStatus::Allow
    }

    fn get_user(&self, user: &str) -> Option<User> {
        self.creds.read().get(user).cloned()
    }
}

fn hash_password(password: &[u8]) -> String {
    hex::encode(Sha256::digest(password))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers() -> (Arc<SimpleAuth>, ProviderMap) {
        let simple = Arc::new(SimpleAuth::new());
        simple.add_user("alice", "secret", "p1").unwrap();
        let mut map = ProviderMap::new();
        map.insert("simple".to_string(), simple.clone() as Arc<dyn AuthProvider>);
        (simple, map)
    }

    #[test]
    fn test_simple_auth_password() {
        let (simple, _) = providers();
        assert_eq!(simple.password("c", "alice", b"secret"), AuthStatus::Allow);
        assert_eq!(simple.password("c", "alice", b"wrong"), AuthStatus::Deny);
        assert_eq!(simple.password("c", "bob", b"secret"), AuthStatus::Deny);
        assert_eq!(
            simple.get_user("alice").unwrap().password_hash,
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
    }

    #[test]
    fn test_simple_auth_rejects_incomplete_user() {
        let simple = SimpleAuth::new();
        assert!(simple.add_user("bob", "", "p").is_err());
    }

    #[test]
    fn test_manager_unknown_provider() {
        let (_, map) = providers();
        assert!(matches!(
            AuthManager::new(&["ldap"], &map, false),
            Err(Error::UnknownProvider(name)) if name == "ldap"
        ));
    }

    #[test]
    fn test_manager_anonymous_and_fetch_user() {
        let (simple, map) = providers();
        let strict = AuthManager::new(&["simple"], &map, false).unwrap();
        assert_eq!(strict.password("c", "", b""), AuthStatus::Deny);
        assert_eq!(strict.password("c", "alice", b"secret"), AuthStatus::Allow);
        assert_eq!(strict.fetch_user("alice").unwrap().project_id, "p1");

        let open = AuthManager::new(&["simple"], &map, true).unwrap();
        assert_eq!(open.password("c", "", b""), AuthStatus::Allow);

        simple.del_user("alice");
        assert!(strict.fetch_user("alice").is_none());
    }

    #[test]
    fn test_manager_without_providers_denies_acl() {
        let manager = AuthManager::new(&[], &ProviderMap::new(), true).unwrap();
        assert_eq!(manager.acl("c", "u", "t", Access::Read), AuthStatus::Deny);
    }
}
