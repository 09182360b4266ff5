//! # Hideaway Access Core
//!
//! This crate decides who may read which file below a single *secure root*
//! directory that lives outside a web application's public tree.
//!
//! ## Overview
//!
//! - **Path Resolution**: canonicalize requests and prove containment, rejecting
//!   `..`, null bytes and symlinked segments
//! - **Danger Detection**: refuse to serve from a root that overlaps system or
//!   host-application directories
//! - **Credential Vault**: ChaCha20-Poly1305 encryption of shared secrets
//! - **Policies**: per-directory overrides inheriting from a global policy
//! - **Authentication**: session roles or a shared secret
//! - **Download Tokens**: single-use, short-lived links
//!
//! ## Request Flow
//!
//! ```text
//! relative path
//!      │
//!      ▼
//! ┌──────────────┐   escape / symlink / missing   ┌──────────┐
//! │ PathResolver │ ─────────────────────────────▶ │          │
//! └──────────────┘                                │          │
//!      ▼                                          │          │
//! ┌──────────────┐   flag set                     │          │
//! │  DangerGate  │ ─────────────────────────────▶ │  Denied  │
//! └──────────────┘                                │          │
//!      ▼                                          │          │
//! ┌──────────────┐   no method satisfied          │          │
//! │ Policy+Auth  │ ─────────────────────────────▶ │          │
//! └──────────────┘                                └──────────┘
//!      ▼
//! FileGrant  or  DownloadToken ──▶ redeem once
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use access::{AccessGate, DangerDetector, HostLayout, MemoryStore, Principal, SessionContext};
//!
//! let base = tempfile::TempDir::new().unwrap();
//! let detector = DangerDetector::with_denylist(Vec::new(), HostLayout::default());
//! let (gate, root) = AccessGate::bootstrap(
//!     Arc::new(MemoryStore::new()),
//!     base.path(),
//!     detector,
//!     Duration::from_secs(300),
//! )
//! .unwrap();
//!
//! std::fs::write(root.path.as_path().join("report.pdf"), b"%PDF").unwrap();
//!
//! let mut session = SessionContext::for_principal(Principal::new("alice", ["administrator"]));
//! let token = gate.issue_link("report.pdf", &mut session, None, None).unwrap();
//! assert!(gate.redeem_link(&token).is_ok());
//! assert!(gate.redeem_link(&token).is_err());
//! ```
//!
//! ## Modules
//!
//! - [`path`]: canonical path resolution and containment
//! - [`danger`]: unsafe root detection and the danger flag
//! - [`vault`]: shared secret encryption
//! - [`policy`]: policy storage and inheritance
//! - [`auth`]: principal and secret authentication
//! - [`tokens`]: download token broker
//! - [`root`]: secure root lifecycle
//! - [`gate`]: request-level decisions
//! - [`store`]: injected configuration storage
//! - [`error`]: error types

pub mod auth;
pub mod danger;
pub mod error;
pub mod gate;
pub mod path;
pub mod policy;
pub mod root;
pub mod store;
pub mod tokens;
pub mod vault;

pub use auth::{Principal, PrincipalAuthenticator, PrincipalId, SessionContext};
pub use danger::{DangerDetector, DangerGate, DangerState, HostLayout, HostSignature, Verdict};
pub use error::{AccessError, Result};
pub use gate::{AccessGate, DenialReason, Denied, FileGrant, GateParts};
pub use path::{resolve, CanonicalPath, NormalizedPath, PathError};
pub use policy::{AccessPolicyStore, AuthMethod, Policy, PolicyDraft, PolicyError, RoleId};
pub use root::{RootError, SecureRoot, SecureRootManager};
pub use store::{ConfigStore, ConfigStoreExt, JsonFileStore, MemoryStore, StoreError};
pub use tokens::{DownloadTokenBroker, TokenGrant, TokenId, DEFAULT_TOKEN_TTL};
pub use vault::{CredentialVault, EncryptedSecret, KeyMaterial, VaultError};
