//! Evaluation of a caller against an effective policy.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::path::NormalizedPath;
use crate::policy::{AuthMethod, Policy, RoleId};
use crate::vault::CredentialVault;

/// Identifier of an authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(String);

impl PrincipalId {
    /// Create a principal identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An authenticated caller and the roles it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub roles: BTreeSet<RoleId>,
}

impl Principal {
    /// Create a principal holding `roles`.
    pub fn new<R: Into<RoleId>>(id: impl Into<String>, roles: impl IntoIterator<Item = R>) -> Self {
        Self {
            id: PrincipalId::new(id),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the principal holds at least one of `allowed`.
    pub fn has_any_role(&self, allowed: &BTreeSet<RoleId>) -> bool {
        !self.roles.is_disjoint(allowed)
    }
}

/// Per-caller state carried between requests.
///
/// Remembers directories the caller already unlocked with a shared secret.
/// Each entry is bound to the fingerprint of the stored ciphertext, so
/// changing a directory's secret invalidates earlier verifications.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    principal: Option<Principal>,
    verified: HashSet<(NormalizedPath, String)>,
}

impl SessionContext {
    /// A session without a principal.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A session for `principal`.
    pub fn for_principal(principal: Principal) -> Self {
        Self {
            principal: Some(principal),
            verified: HashSet::new(),
        }
    }

    /// The session principal, if logged in.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Whether `dir` was unlocked with the secret identified by `fingerprint`.
    pub fn is_verified(&self, dir: &NormalizedPath, fingerprint: &str) -> bool {
        self.verified
            .contains(&(dir.clone(), fingerprint.to_string()))
    }

    fn mark_verified(&mut self, dir: &NormalizedPath, fingerprint: String) {
        self.verified.insert((dir.clone(), fingerprint));
    }

    /// Forget every secret verification.
    pub fn clear_verified(&mut self) {
        self.verified.clear();
    }
}

/// Evaluation state of a single authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Unchecked,
    SessionCheck,
    SecretCheck,
    Granted(AuthMethod),
    Denied,
}

/// Decides whether a caller satisfies a policy.
pub struct PrincipalAuthenticator {
    vault: Arc<CredentialVault>,
}

impl PrincipalAuthenticator {
    /// Create an authenticator decrypting secrets with `vault`.
    pub fn new(vault: Arc<CredentialVault>) -> Self {
        Self { vault }
    }

    /// Whether the caller satisfies `policy` by any accepted method.
    pub fn authenticate(
        &self,
        policy: &Policy,
        principal: Option<&Principal>,
        submitted_secret: Option<&str>,
    ) -> bool {
        self.evaluate(policy, principal, submitted_secret).is_some()
    }

    /// Like [`authenticate`](Self::authenticate), consulting and updating
    /// the caller's session for directory `dir`.
    pub fn authenticate_session(
        &self,
        dir: &NormalizedPath,
        policy: &Policy,
        session: &mut SessionContext,
        submitted_secret: Option<&str>,
    ) -> bool {
        let fingerprint = policy
            .secret
            .as_ref()
            .filter(|_| policy.allows(AuthMethod::SharedSecret))
            .map(|secret| secret.fingerprint());

        if let Some(fingerprint) = &fingerprint {
            if session.is_verified(dir, fingerprint) {
                tracing::debug!(dir = %dir, "Directory already unlocked in session");
                return true;
            }
        }

        match self.evaluate(policy, session.principal(), submitted_secret) {
            Some(AuthMethod::SharedSecret) => {
                if let Some(fingerprint) = fingerprint {
                    session.mark_verified(dir, fingerprint);
                }
                true
            }
            Some(AuthMethod::Session) => true,
            None => false,
        }
    }

    fn evaluate(
        &self,
        policy: &Policy,
        principal: Option<&Principal>,
        submitted_secret: Option<&str>,
    ) -> Option<AuthMethod> {
        let mut state = AuthState::Unchecked;
        loop {
            state = match state {
                AuthState::Unchecked if policy.auth_methods.is_empty() => AuthState::Denied,
                AuthState::Unchecked if policy.allows(AuthMethod::Session) => {
                    AuthState::SessionCheck
                }
                AuthState::Unchecked => AuthState::SecretCheck,
                AuthState::SessionCheck => {
                    if session_satisfies(policy, principal) {
                        AuthState::Granted(AuthMethod::Session)
                    } else {
                        AuthState::SecretCheck
                    }
                }
                AuthState::SecretCheck => {
                    if policy.allows(AuthMethod::SharedSecret)
                        && self.secret_satisfies(policy, submitted_secret)
                    {
                        AuthState::Granted(AuthMethod::SharedSecret)
                    } else {
                        AuthState::Denied
                    }
                }
                AuthState::Granted(method) => return Some(method),
                AuthState::Denied => return None,
            };
        }
    }

    fn secret_satisfies(&self, policy: &Policy, submitted: Option<&str>) -> bool {
        let (Some(stored), Some(submitted)) = (&policy.secret, submitted) else {
            return false;
        };

        let expected = match self.vault.decrypt(stored) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!("Stored secret unusable, treating as absent: {}", e);
                return false;
            }
        };

        let expected = Sha256::digest(expected.as_bytes());
        let submitted = Sha256::digest(submitted.as_bytes());
        expected.as_slice().ct_eq(submitted.as_slice()).into()
    }
}

fn session_satisfies(policy: &Policy, principal: Option<&Principal>) -> bool {
    match principal {
        Some(principal) => principal.has_any_role(&policy.allowed_roles),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::KeyMaterial;

    fn authenticator() -> (Arc<CredentialVault>, PrincipalAuthenticator) {
        let vault = Arc::new(CredentialVault::new(&KeyMaterial::generate()));
        (vault.clone(), PrincipalAuthenticator::new(vault))
    }

    fn policy(methods: &[AuthMethod], roles: &[&str]) -> Policy {
        Policy {
            auth_methods: methods.iter().copied().collect(),
            allowed_roles: roles.iter().map(|r| RoleId::new(*r)).collect(),
            secret: None,
        }
    }

    #[test]
    fn test_session_role_match() {
        let (_, auth) = authenticator();
        let policy = policy(&[AuthMethod::Session], &["editor"]);

        let editor = Principal::new("u1", ["editor"]);
        let viewer = Principal::new("u2", ["viewer"]);
        assert!(auth.authenticate(&policy, Some(&editor), None));
        assert!(!auth.authenticate(&policy, Some(&viewer), None));
        assert!(!auth.authenticate(&policy, None, None));
    }

    #[test]
    fn test_empty_allowed_roles_never_match() {
        let (_, auth) = authenticator();
        let policy = policy(&[AuthMethod::Session], &[]);
        let admin = Principal::new("u1", ["administrator"]);
        assert!(!auth.authenticate(&policy, Some(&admin), None));
    }

    #[test]
    fn test_empty_methods_deny() {
        let (vault, auth) = authenticator();
        let mut policy = policy(&[], &["editor"]);
        policy.secret = Some(vault.encrypt("s3cret").unwrap());

        let editor = Principal::new("u1", ["editor"]);
        assert!(!auth.authenticate(&policy, Some(&editor), Some("s3cret")));
    }

    #[test]
    fn test_secret_match() {
        let (vault, auth) = authenticator();
        let mut policy = policy(&[AuthMethod::SharedSecret], &[]);
        policy.secret = Some(vault.encrypt("hunter2").unwrap());

        assert!(auth.authenticate(&policy, None, Some("hunter2")));
        assert!(!auth.authenticate(&policy, None, Some("hunter3")));
        assert!(!auth.authenticate(&policy, None, Some("")));
        assert!(!auth.authenticate(&policy, None, None));
    }

    #[test]
    fn test_secret_ignored_when_method_not_allowed() {
        let (vault, auth) = authenticator();
        let mut policy = policy(&[AuthMethod::Session], &["editor"]);
        policy.secret = Some(vault.encrypt("hunter2").unwrap());

        assert!(!auth.authenticate(&policy, None, Some("hunter2")));
    }

    #[test]
    fn test_either_method_suffices() {
        let (vault, auth) = authenticator();
        let mut policy = policy(&[AuthMethod::Session, AuthMethod::SharedSecret], &["editor"]);
        policy.secret = Some(vault.encrypt("hunter2").unwrap());

        let viewer = Principal::new("u2", ["viewer"]);
        assert!(auth.authenticate(&policy, Some(&viewer), Some("hunter2")));
        assert!(!auth.authenticate(&policy, Some(&viewer), Some("nope")));
        let editor = Principal::new("u1", ["editor"]);
        assert!(auth.authenticate(&policy, Some(&editor), None));
    }

    #[test]
    fn test_undecryptable_secret_is_no_secret() {
        let (_, auth) = authenticator();
        let foreign = CredentialVault::new(&KeyMaterial::generate());
        let mut policy = policy(&[AuthMethod::SharedSecret], &[]);
        policy.secret = Some(foreign.encrypt("hunter2").unwrap());

        assert!(!auth.authenticate(&policy, None, Some("hunter2")));
    }

    #[test]
    fn test_session_remembers_unlocked_directory() {
        let (vault, auth) = authenticator();
        let dir = NormalizedPath::new("private");
        let mut policy = policy(&[AuthMethod::SharedSecret], &[]);
        policy.secret = Some(vault.encrypt("hunter2").unwrap());

        let mut session = SessionContext::anonymous();
        assert!(!auth.authenticate_session(&dir, &policy, &mut session, None));
        assert!(auth.authenticate_session(&dir, &policy, &mut session, Some("hunter2")));
        assert!(auth.authenticate_session(&dir, &policy, &mut session, None));

        // Re-setting the secret invalidates the earlier unlock.
        policy.secret = Some(vault.encrypt("hunter2").unwrap());
        assert!(!auth.authenticate_session(&dir, &policy, &mut session, None));
    }

    #[test]
    fn test_session_unlock_scoped_to_directory() {
        let (vault, auth) = authenticator();
        let mut policy = policy(&[AuthMethod::SharedSecret], &[]);
        policy.secret = Some(vault.encrypt("hunter2").unwrap());

        let mut session = SessionContext::anonymous();
        let first = NormalizedPath::new("a");
        let second = NormalizedPath::new("b");
        assert!(auth.authenticate_session(&first, &policy, &mut session, Some("hunter2")));
        assert!(!auth.authenticate_session(&second, &policy, &mut session, None));

        session.clear_verified();
        assert!(!auth.authenticate_session(&first, &policy, &mut session, None));
    }
}
