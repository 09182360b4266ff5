//! Per-directory access policies.
//!
//! A directory either carries its own [`Policy`] override or inherits from the
//! nearest ancestor that does. Without any override the global policy applies.
//! Overrides replace the inherited policy entirely; nothing is merged.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::path::NormalizedPath;
use crate::store::{ConfigStore, ConfigStoreExt, StoreError};
use crate::vault::{CredentialVault, EncryptedSecret, VaultError};

/// Store key for the global policy.
pub const GLOBAL_POLICY_KEY: &str = "policy.global";

/// Store key for the per-directory override map.
pub const DIRECTORY_POLICIES_KEY: &str = "policy.directories";

/// Role granted access by the built-in global policy.
pub const ADMINISTRATOR_ROLE: &str = "administrator";

/// Errors raised while changing policies.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Shared-secret authentication was requested without a secret.
    #[error("shared secret authentication requires a secret")]
    MissingSecret,

    /// The secret could not be encrypted or decrypted.
    #[error("secret error: {0}")]
    Vault(#[from] VaultError),

    /// The backing store failed.
    #[error("policy storage error: {0}")]
    Store(#[from] StoreError),
}

/// How a caller may prove access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// The caller's session principal holds an allowed role.
    Session,
    /// The caller submits the directory's shared secret.
    SharedSecret,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => f.write_str("session"),
            Self::SharedSecret => f.write_str("shared_secret"),
        }
    }
}

impl std::str::FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "session" => Ok(Self::Session),
            "shared_secret" | "secret" => Ok(Self::SharedSecret),
            other => Err(format!("unknown auth method: {other}")),
        }
    }
}

/// Opaque role identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(String);

impl RoleId {
    /// Create a role identifier.
    pub fn new(role: impl Into<String>) -> Self {
        Self(role.into())
    }

    /// The administrator role.
    pub fn administrator() -> Self {
        Self::new(ADMINISTRATOR_ROLE)
    }

    /// Borrow the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoleId {
    fn from(role: &str) -> Self {
        Self::new(role)
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored access policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Accepted authentication methods; any one suffices.
    pub auth_methods: BTreeSet<AuthMethod>,
    /// Roles accepted by session authentication.
    pub allowed_roles: BTreeSet<RoleId>,
    /// Encrypted shared secret, when configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<EncryptedSecret>,
}

impl Policy {
    /// Built-in global policy: administrators by session only.
    pub fn default_global() -> Self {
        Self {
            auth_methods: BTreeSet::from([AuthMethod::Session]),
            allowed_roles: BTreeSet::from([RoleId::administrator()]),
            secret: None,
        }
    }

    /// Policy that no caller can satisfy.
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Whether `method` is accepted.
    pub fn allows(&self, method: AuthMethod) -> bool {
        self.auth_methods.contains(&method)
    }
}

/// A policy as submitted by an administrator, with a plaintext secret.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PolicyDraft {
    pub auth_methods: BTreeSet<AuthMethod>,
    pub allowed_roles: BTreeSet<RoleId>,
    pub secret: Option<String>,
}

impl PolicyDraft {
    /// Draft accepting the given methods.
    pub fn new(auth_methods: impl IntoIterator<Item = AuthMethod>) -> Self {
        Self {
            auth_methods: auth_methods.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Add allowed roles.
    pub fn with_roles<R: Into<RoleId>>(mut self, roles: impl IntoIterator<Item = R>) -> Self {
        self.allowed_roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Set the plaintext shared secret.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

impl fmt::Debug for PolicyDraft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyDraft")
            .field("auth_methods", &self.auth_methods)
            .field("allowed_roles", &self.allowed_roles)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

type DirectoryPolicies = BTreeMap<NormalizedPath, Policy>;

/// Policy persistence over a [`ConfigStore`].
pub struct AccessPolicyStore {
    store: Arc<dyn ConfigStore>,
    vault: Arc<CredentialVault>,
    /// Serializes read-modify-write cycles on the override map.
    write_lock: Mutex<()>,
}

impl AccessPolicyStore {
    /// Create a policy store.
    pub fn new(store: Arc<dyn ConfigStore>, vault: Arc<CredentialVault>) -> Self {
        Self {
            store,
            vault,
            write_lock: Mutex::new(()),
        }
    }

    /// The policy governing `dir`.
    ///
    /// Overrides are inherited: the nearest override among `dir` and its
    /// ancestors wins, and the global policy applies only when none of them
    /// has one. A locked parent therefore stays locked for every
    /// subdirectory without its own entry.
    ///
    /// Never fails: storage problems yield a deny-all policy.
    pub fn effective_policy(&self, dir: &NormalizedPath) -> Policy {
        match self.lookup_effective(dir) {
            Ok(policy) => policy,
            Err(e) => {
                tracing::warn!("Policy lookup failed, denying access: {}", e);
                Policy::deny_all()
            }
        }
    }

    fn lookup_effective(&self, dir: &NormalizedPath) -> Result<Policy, StoreError> {
        let overrides = self.load_directories()?;
        for candidate in dir.ancestors() {
            if let Some(policy) = overrides.get(&candidate) {
                tracing::debug!(dir = %dir, source = %candidate, "Using directory policy");
                return Ok(policy.clone());
            }
        }
        self.global_policy()
    }

    /// Store an override for `dir`, encrypting any secret.
    pub fn set_policy(&self, dir: &NormalizedPath, draft: PolicyDraft) -> Result<Policy, PolicyError> {
        let policy = self.seal(draft)?;

        let _guard = self.lock()?;
        let mut overrides = self.load_directories()?;
        overrides.insert(dir.clone(), policy.clone());
        self.store.set_as(DIRECTORY_POLICIES_KEY, &overrides)?;

        tracing::info!(
            methods = ?policy.auth_methods,
            roles = policy.allowed_roles.len(),
            has_secret = policy.secret.is_some(),
            "Directory policy set"
        );
        Ok(policy)
    }

    /// Delete the override for `dir`. Returns whether one existed.
    pub fn remove_policy(&self, dir: &NormalizedPath) -> Result<bool, PolicyError> {
        let _guard = self.lock()?;
        let mut overrides = self.load_directories()?;
        let existed = overrides.remove(dir).is_some();
        if existed {
            self.store.set_as(DIRECTORY_POLICIES_KEY, &overrides)?;
            tracing::info!("Directory policy removed");
        }
        Ok(existed)
    }

    /// The stored global policy, or the built-in default.
    pub fn global_policy(&self) -> Result<Policy, StoreError> {
        Ok(self
            .store
            .get_as::<Policy>(GLOBAL_POLICY_KEY)?
            .unwrap_or_else(Policy::default_global))
    }

    /// Replace the global policy.
    pub fn set_global_policy(&self, draft: PolicyDraft) -> Result<Policy, PolicyError> {
        let policy = self.seal(draft)?;
        let _guard = self.lock()?;
        self.store.set_as(GLOBAL_POLICY_KEY, &policy)?;
        tracing::info!(methods = ?policy.auth_methods, "Global policy set");
        Ok(policy)
    }

    /// The override stored for exactly `dir`, if any.
    pub fn directory_policy(&self, dir: &NormalizedPath) -> Result<Option<Policy>, StoreError> {
        Ok(self.load_directories()?.remove(dir))
    }

    /// All overrides, ordered by directory.
    pub fn list_policies(&self) -> Result<Vec<(NormalizedPath, Policy)>, StoreError> {
        Ok(self.load_directories()?.into_iter().collect())
    }

    /// Decrypt the shared secret of the override for `dir`.
    ///
    /// Returns `None` when no override or no secret exists.
    pub fn reveal_secret(&self, dir: &NormalizedPath) -> Result<Option<String>, PolicyError> {
        let secret = match self.directory_policy(dir)?.and_then(|p| p.secret) {
            Some(secret) => secret,
            None => return Ok(None),
        };
        Ok(Some(self.vault.decrypt(&secret)?))
    }

    fn seal(&self, draft: PolicyDraft) -> Result<Policy, PolicyError> {
        let secret = draft.secret.filter(|s| !s.is_empty());
        if draft.auth_methods.contains(&AuthMethod::SharedSecret) && secret.is_none() {
            return Err(PolicyError::MissingSecret);
        }

        let secret = secret.map(|s| self.vault.encrypt(&s)).transpose()?;
        Ok(Policy {
            auth_methods: draft.auth_methods,
            allowed_roles: draft.allowed_roles,
            secret,
        })
    }

    fn load_directories(&self) -> Result<DirectoryPolicies, StoreError> {
        Ok(self
            .store
            .get_as::<DirectoryPolicies>(DIRECTORY_POLICIES_KEY)?
            .unwrap_or_default())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock.lock().map_err(|_| StoreError::LockPoisoned {
            context: "policy write".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::vault::KeyMaterial;
    use serde_json::json;

    fn policy_store() -> (Arc<MemoryStore>, AccessPolicyStore) {
        let store = Arc::new(MemoryStore::new());
        let vault = Arc::new(CredentialVault::new(&KeyMaterial::generate()));
        let policies = AccessPolicyStore::new(store.clone(), vault);
        (store, policies)
    }

    fn dir(raw: &str) -> NormalizedPath {
        NormalizedPath::new(raw)
    }

    #[test]
    fn test_default_global_policy() {
        let (_, policies) = policy_store();
        let policy = policies.effective_policy(&dir("anything/at/all"));
        assert_eq!(policy, Policy::default_global());
        assert!(policy.allows(AuthMethod::Session));
        assert!(policy.allowed_roles.contains(&RoleId::administrator()));
    }

    #[test]
    fn test_nearest_ancestor_wins() {
        let (_, policies) = policy_store();
        policies
            .set_policy(
                &dir("reports"),
                PolicyDraft::new([AuthMethod::Session]).with_roles(["editor"]),
            )
            .unwrap();
        policies
            .set_policy(
                &dir("reports/q1"),
                PolicyDraft::new([AuthMethod::Session]).with_roles(["auditor"]),
            )
            .unwrap();

        let deep = policies.effective_policy(&dir("reports/q1/march"));
        assert!(deep.allowed_roles.contains(&RoleId::new("auditor")));
        assert!(!deep.allowed_roles.contains(&RoleId::new("editor")));

        let sibling = policies.effective_policy(&dir("reports/q2"));
        assert!(sibling.allowed_roles.contains(&RoleId::new("editor")));

        let unrelated = policies.effective_policy(&dir("reportsx"));
        assert_eq!(unrelated, Policy::default_global());
    }

    #[test]
    fn test_override_replaces_global_without_merging() {
        let (_, policies) = policy_store();
        policies
            .set_policy(&dir("a"), PolicyDraft::new([AuthMethod::SharedSecret]).with_secret("x"))
            .unwrap();

        let policy = policies.effective_policy(&dir("a"));
        assert!(!policy.allows(AuthMethod::Session));
        assert!(policy.allowed_roles.is_empty());
    }

    #[test]
    fn test_shared_secret_requires_secret() {
        let (_, policies) = policy_store();
        let result = policies.set_policy(&dir("a"), PolicyDraft::new([AuthMethod::SharedSecret]));
        assert!(matches!(result, Err(PolicyError::MissingSecret)));

        let result = policies.set_policy(
            &dir("a"),
            PolicyDraft::new([AuthMethod::SharedSecret]).with_secret(""),
        );
        assert!(matches!(result, Err(PolicyError::MissingSecret)));
        assert!(policies.directory_policy(&dir("a")).unwrap().is_none());
    }

    #[test]
    fn test_secret_never_stored_in_plaintext() {
        let (store, policies) = policy_store();
        policies
            .set_policy(
                &dir("vault"),
                PolicyDraft::new([AuthMethod::SharedSecret]).with_secret("hunter2"),
            )
            .unwrap();

        let raw = store.get(DIRECTORY_POLICIES_KEY).unwrap().unwrap().to_string();
        assert!(!raw.contains("hunter2"));

        assert_eq!(
            policies.reveal_secret(&dir("vault")).unwrap(),
            Some("hunter2".to_string())
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_, policies) = policy_store();
        policies
            .set_policy(&dir("a"), PolicyDraft::new([AuthMethod::Session]))
            .unwrap();

        assert!(policies.remove_policy(&dir("a")).unwrap());
        assert!(!policies.remove_policy(&dir("a")).unwrap());
        assert_eq!(policies.effective_policy(&dir("a")), Policy::default_global());
    }

    #[test]
    fn test_global_policy_replaced() {
        let (_, policies) = policy_store();
        policies
            .set_global_policy(PolicyDraft::new([AuthMethod::Session]).with_roles(["editor"]))
            .unwrap();

        let policy = policies.effective_policy(&dir("x"));
        assert_eq!(
            policy.allowed_roles,
            BTreeSet::from([RoleId::new("editor")])
        );
    }

    #[test]
    fn test_corrupt_store_fails_closed() {
        let (store, policies) = policy_store();
        store.set(DIRECTORY_POLICIES_KEY, json!(["not", "a", "map"])).unwrap();

        assert_eq!(policies.effective_policy(&dir("a")), Policy::deny_all());
    }

    #[test]
    fn test_list_policies_ordered() {
        let (_, policies) = policy_store();
        for name in ["b", "a/c", "a"] {
            policies
                .set_policy(&dir(name), PolicyDraft::new([AuthMethod::Session]))
                .unwrap();
        }

        let keys: Vec<String> = policies
            .list_policies()
            .unwrap()
            .into_iter()
            .map(|(path, _)| path.as_str().to_string())
            .collect();
        assert_eq!(keys, vec!["a", "a/c", "b"]);
    }

    #[test]
    fn test_root_override_applies_everywhere() {
        let (_, policies) = policy_store();
        policies
            .set_policy(
                &NormalizedPath::root(),
                PolicyDraft::new([AuthMethod::Session]).with_roles(["member"]),
            )
            .unwrap();

        let policy = policies.effective_policy(&dir("deep/down"));
        assert!(policy.allowed_roles.contains(&RoleId::new("member")));
    }

    #[test]
    fn test_auth_method_parsing() {
        assert_eq!("session".parse::<AuthMethod>().unwrap(), AuthMethod::Session);
        assert_eq!(
            "shared-secret".parse::<AuthMethod>().unwrap(),
            AuthMethod::SharedSecret
        );
        assert!("password".parse::<AuthMethod>().is_err());
    }

    #[test]
    fn test_draft_debug_redacts_secret() {
        let draft = PolicyDraft::new([AuthMethod::SharedSecret]).with_secret("hunter2");
        assert!(!format!("{draft:?}").contains("hunter2"));
    }
}
