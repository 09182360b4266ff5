//! Single-use, short-lived download tokens.
//!
//! Tokens are held in memory only. Redemption removes the record before
//! checking it, so two concurrent redemptions of the same token can never
//! both succeed.

use std::fmt;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::auth::PrincipalId;
use crate::path::NormalizedPath;

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(300);

/// Size of a token identifier in bytes.
const TOKEN_BYTES: usize = 32;

/// Opaque token identifier (64 hex characters).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Borrow the hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TokenId {
    fn from(raw: &str) -> Self {
        Self(raw.trim().to_ascii_lowercase())
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "TokenId({prefix}…)")
    }
}

/// What a redeemed token grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// Root-relative path of the file.
    pub relative_path: NormalizedPath,
    /// Principal the token was issued to, if any.
    pub principal_id: Option<PrincipalId>,
    pub issued_at: SystemTime,
    pub expires_at: SystemTime,
}

/// Issues and redeems download tokens.
pub struct DownloadTokenBroker {
    tokens: DashMap<TokenId, TokenGrant>,
    default_ttl: Duration,
}

impl Default for DownloadTokenBroker {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL)
    }
}

impl DownloadTokenBroker {
    /// Create a broker whose tokens live for `default_ttl` unless overridden.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            tokens: DashMap::new(),
            default_ttl,
        }
    }

    /// The default token lifetime.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Mint a token for `path`, valid for `ttl` (or the default).
    pub fn issue(
        &self,
        path: NormalizedPath,
        principal_id: Option<PrincipalId>,
        ttl: Option<Duration>,
    ) -> TokenId {
        self.issue_at(path, principal_id, ttl.unwrap_or(self.default_ttl), SystemTime::now())
    }

    fn issue_at(
        &self,
        path: NormalizedPath,
        principal_id: Option<PrincipalId>,
        ttl: Duration,
        now: SystemTime,
    ) -> TokenId {
        self.prune_expired(now);

        let token = TokenId::generate();
        let grant = TokenGrant {
            relative_path: path,
            principal_id,
            issued_at: now,
            expires_at: now + ttl,
        };
        self.tokens.insert(token.clone(), grant);

        tracing::debug!(token = ?token, ttl_secs = ttl.as_secs(), "Issued download token");
        token
    }

    /// Consume `token`. Unknown, expired and already-used tokens all yield `None`.
    pub fn redeem(&self, token: &TokenId) -> Option<TokenGrant> {
        self.redeem_at(token, SystemTime::now())
    }

    fn redeem_at(&self, token: &TokenId, now: SystemTime) -> Option<TokenGrant> {
        let (_, grant) = self.tokens.remove(token)?;
        if now >= grant.expires_at {
            tracing::debug!(token = ?token, "Download token expired");
            return None;
        }
        Some(grant)
    }

    /// Number of live records, expired ones included until pruned.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no records are held.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn prune_expired(&self, now: SystemTime) {
        let before = self.tokens.len();
        self.tokens.retain(|_, grant| now < grant.expires_at);
        let pruned = before.saturating_sub(self.tokens.len());
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned expired download tokens");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn path(raw: &str) -> NormalizedPath {
        NormalizedPath::new(raw)
    }

    #[test]
    fn test_token_format() {
        let broker = DownloadTokenBroker::default();
        let token = broker.issue(path("a.txt"), None, None);
        assert_eq!(token.as_str().len(), 64);
        assert!(token.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_redeem_returns_issued_grant_once() {
        let broker = DownloadTokenBroker::default();
        let principal = PrincipalId::new("u1");
        let token = broker.issue(path("docs/a.txt"), Some(principal.clone()), None);

        let grant = broker.redeem(&token).unwrap();
        assert_eq!(grant.relative_path, path("docs/a.txt"));
        assert_eq!(grant.principal_id, Some(principal));
        assert_eq!(grant.expires_at, grant.issued_at + DEFAULT_TOKEN_TTL);

        assert!(broker.redeem(&token).is_none());
    }

    #[test]
    fn test_unknown_token() {
        let broker = DownloadTokenBroker::default();
        assert!(broker.redeem(&TokenId::from("deadbeef")).is_none());
    }

    #[test]
    fn test_expired_equals_unknown() {
        let broker = DownloadTokenBroker::default();
        let issued = SystemTime::now();
        let token = broker.issue_at(path("a"), None, Duration::from_secs(10), issued);

        let later = issued + Duration::from_secs(10);
        assert!(broker.redeem_at(&token, later).is_none());
        // Removed even though it had expired.
        assert!(broker.is_empty());
    }

    #[test]
    fn test_redeem_before_expiry() {
        let broker = DownloadTokenBroker::default();
        let issued = SystemTime::now();
        let token = broker.issue_at(path("a"), None, Duration::from_secs(10), issued);
        assert!(broker
            .redeem_at(&token, issued + Duration::from_secs(9))
            .is_some());
    }

    #[test]
    fn test_issue_prunes_expired() {
        let broker = DownloadTokenBroker::default();
        let start = SystemTime::now();
        broker.issue_at(path("a"), None, Duration::from_secs(1), start);
        broker.issue_at(path("b"), None, Duration::from_secs(1), start);
        assert_eq!(broker.len(), 2);

        broker.issue_at(path("c"), None, Duration::from_secs(1), start + Duration::from_secs(5));
        assert_eq!(broker.len(), 1);
    }

    #[test]
    fn test_tokens_unique() {
        let broker = DownloadTokenBroker::default();
        let tokens: HashSet<String> = (0..100)
            .map(|_| broker.issue(path("a"), None, None).to_string())
            .collect();
        assert_eq!(tokens.len(), 100);
    }

    #[test]
    fn test_concurrent_redeem_single_winner() {
        let broker = Arc::new(DownloadTokenBroker::default());
        let token = broker.issue(path("a"), None, None);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let broker = Arc::clone(&broker);
                let token = token.clone();
                thread::spawn(move || broker.redeem(&token).is_some())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_debug_hides_token() {
        let broker = DownloadTokenBroker::default();
        let token = broker.issue(path("a"), None, None);
        assert!(!format!("{token:?}").contains(token.as_str()));
    }
}
