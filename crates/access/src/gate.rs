//! Request-level access decisions.
//!
//! [`AccessGate`] runs the full check for a request: path containment, the
//! danger flag, the effective policy of the containing directory and the
//! caller's credentials. Every failure reaches the caller as the same opaque
//! [`Denied`] value; the specific [`DenialReason`] is only logged.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{PrincipalAuthenticator, SessionContext};
use crate::danger::{DangerDetector, DangerGate};
use crate::error::Result;
use crate::path::{self, CanonicalPath, NormalizedPath};
use crate::policy::AccessPolicyStore;
use crate::root::{SecureRoot, SecureRootManager};
use crate::store::ConfigStore;
use crate::tokens::{DownloadTokenBroker, TokenId};
use crate::vault::CredentialVault;

/// Internal classification of a refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    /// The path is invalid, escapes the root or does not exist.
    NotFound,
    /// Downloads are blocked by the danger flag.
    DangerDetected,
    /// The caller does not satisfy the effective policy.
    Unauthorized,
    /// The download token is unknown, used or expired.
    TokenInvalid,
}

/// An access refusal. Displays identically whatever the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denied {
    reason: DenialReason,
}

impl Denied {
    fn new(reason: DenialReason) -> Self {
        tracing::warn!(reason = ?reason, "Access denied");
        Self { reason }
    }

    /// Why access was refused. For logging and tests only.
    pub fn reason(&self) -> DenialReason {
        self.reason
    }
}

impl fmt::Display for Denied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("access not permitted")
    }
}

impl std::error::Error for Denied {}

/// A resolved path the caller may read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileGrant {
    /// Root-relative form.
    pub relative_path: NormalizedPath,
    /// Canonical absolute path, contained in the root.
    pub path: CanonicalPath,
}

/// Components needed to assemble an [`AccessGate`].
pub struct GateParts {
    pub root: CanonicalPath,
    pub danger: Arc<DangerGate>,
    pub policies: Arc<AccessPolicyStore>,
    pub vault: Arc<CredentialVault>,
    pub tokens: Arc<DownloadTokenBroker>,
}

/// Access decisions for one secure root.
pub struct AccessGate {
    root: CanonicalPath,
    danger: Arc<DangerGate>,
    policies: Arc<AccessPolicyStore>,
    authenticator: PrincipalAuthenticator,
    tokens: Arc<DownloadTokenBroker>,
}

impl AccessGate {
    /// Assemble a gate from existing components.
    pub fn new(parts: GateParts) -> Self {
        Self {
            root: parts.root,
            danger: parts.danger,
            policies: parts.policies,
            authenticator: PrincipalAuthenticator::new(parts.vault),
            tokens: parts.tokens,
        }
    }

    /// Build every component from `store`, creating the secure root under
    /// `base_dir` if needed and assessing it for danger.
    pub fn bootstrap(
        store: Arc<dyn ConfigStore>,
        base_dir: &std::path::Path,
        detector: DangerDetector,
        token_ttl: Duration,
    ) -> Result<(Self, SecureRoot)> {
        let vault = Arc::new(CredentialVault::from_store(store.as_ref())?);
        let root = SecureRootManager::new(base_dir, Arc::clone(&store)).current()?;

        let danger = Arc::new(DangerGate::new(detector, Arc::clone(&store)));
        danger.evaluate(root.path.as_path())?;

        let gate = Self::new(GateParts {
            root: root.path.clone(),
            danger,
            policies: Arc::new(AccessPolicyStore::new(store, Arc::clone(&vault))),
            vault,
            tokens: Arc::new(DownloadTokenBroker::new(token_ttl)),
        });
        Ok((gate, root))
    }

    /// The secure root this gate guards.
    pub fn root(&self) -> &CanonicalPath {
        &self.root
    }

    pub fn policies(&self) -> &Arc<AccessPolicyStore> {
        &self.policies
    }

    pub fn danger(&self) -> &Arc<DangerGate> {
        &self.danger
    }

    pub fn tokens(&self) -> &Arc<DownloadTokenBroker> {
        &self.tokens
    }

    /// Decide whether the caller may read `relative`.
    ///
    /// For a file the policy of its directory applies; for a directory, its
    /// own policy.
    pub fn authorize(
        &self,
        relative: &str,
        session: &mut SessionContext,
        submitted_secret: Option<&str>,
    ) -> std::result::Result<FileGrant, Denied> {
        let grant = self.resolve(relative)?;
        self.check_danger()?;

        let dir = if grant.path.as_path().is_dir() {
            grant.relative_path.clone()
        } else {
            grant
                .relative_path
                .parent()
                .unwrap_or_else(NormalizedPath::root)
        };

        let policy = self.policies.effective_policy(&dir);
        if !self
            .authenticator
            .authenticate_session(&dir, &policy, session, submitted_secret)
        {
            return Err(Denied::new(DenialReason::Unauthorized));
        }

        tracing::debug!(path = %grant.relative_path, "Access granted");
        Ok(grant)
    }

    /// Authorize a file and mint a one-time download token for it.
    pub fn issue_link(
        &self,
        relative: &str,
        session: &mut SessionContext,
        submitted_secret: Option<&str>,
        ttl: Option<Duration>,
    ) -> std::result::Result<TokenId, Denied> {
        let grant = self.authorize(relative, session, submitted_secret)?;
        if !grant.path.as_path().is_file() {
            return Err(Denied::new(DenialReason::NotFound));
        }

        let principal = session.principal().map(|p| p.id.clone());
        Ok(self.tokens.issue(grant.relative_path, principal, ttl))
    }

    /// Consume `token` and return the file it grants.
    ///
    /// The path is resolved again, so a file swapped for a symlink after
    /// issue is refused.
    pub fn redeem_link(&self, token: &TokenId) -> std::result::Result<FileGrant, Denied> {
        let grant = self
            .tokens
            .redeem(token)
            .ok_or_else(|| Denied::new(DenialReason::TokenInvalid))?;
        self.check_danger()?;

        let resolved = self.resolve(grant.relative_path.as_str())?;
        if !resolved.path.as_path().is_file() {
            return Err(Denied::new(DenialReason::NotFound));
        }
        Ok(resolved)
    }

    fn resolve(&self, relative: &str) -> std::result::Result<FileGrant, Denied> {
        let resolved = path::resolve(&self.root, relative).map_err(|e| {
            tracing::debug!(error = %e, "Path rejected");
            Denied::new(DenialReason::NotFound)
        })?;
        let relative_path = path::relative_to(&self.root, &resolved)
            .map_err(|_| Denied::new(DenialReason::NotFound))?;
        Ok(FileGrant {
            relative_path,
            path: resolved,
        })
    }

    fn check_danger(&self) -> std::result::Result<(), Denied> {
        if self.danger.is_dangerous() {
            return Err(Denied::new(DenialReason::DangerDetected));
        }
        Ok(())
    }
}
