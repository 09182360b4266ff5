//! Wiring of configuration, persisted state and the access core.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use access::{
    AccessGate, AccessPolicyStore, ConfigStore, DangerState, JsonFileStore,
    SecureRoot, SecureRootManager, SessionContext, Verdict,
};
use anyhow::{Context, Result};

use crate::config::Config;
use crate::files::{
    remove_tree, DirectoryBrowser, FileInfo, FileStreamer, RemoveLimits, RemoveSummary,
};

/// A configured gateway over the active secure root.
pub struct Gateway {
    config: Config,
    store: Arc<dyn ConfigStore>,
    gate: AccessGate,
    root: SecureRoot,
}

impl Gateway {
    /// Open persisted state and the secure root described by `config`.
    pub fn open(config: Config) -> Result<Self> {
        let state_path = config.state_path();
        let store = JsonFileStore::open(&state_path)
            .with_context(|| format!("Failed to open state at {}", state_path.display()))?;
        let store: Arc<dyn ConfigStore> = Arc::new(store);
        Self::with_store(config, store)
    }

    /// Build a gateway over an existing store.
    pub fn with_store(config: Config, store: Arc<dyn ConfigStore>) -> Result<Self> {
        let (gate, root) = AccessGate::bootstrap(
            Arc::clone(&store),
            &config.root.base_dir,
            config.host.detector(),
            config.downloads.token_ttl(),
        )
        .context("Failed to initialize access control")?;

        if gate.danger().is_dangerous() {
            tracing::warn!(
                base_dir = %config.root.base_dir.display(),
                verdict = ?gate.danger().state().verdict,
                "Secure root is flagged as dangerous; downloads are blocked until revalidated. \
                 Move root.base_dir out of protected locations or adjust host.protected_dirs"
            );
        }

        Ok(Self {
            config,
            store,
            gate,
            root,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The active secure root.
    pub fn root(&self) -> &SecureRoot {
        &self.root
    }

    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    pub fn policies(&self) -> &AccessPolicyStore {
        self.gate.policies()
    }

    /// Identifiers of retired roots.
    pub fn retired_roots(&self) -> Result<Vec<String>> {
        Ok(self.root_manager().retired()?)
    }

    /// Rotate the secure root and re-assess the new one.
    pub fn rotate_root(&mut self) -> Result<&SecureRoot> {
        let previous = self.root.id.clone();
        self.root_manager().rotate().context("Failed to rotate secure root")?;

        let rebuilt = Self::with_store(self.config.clone(), Arc::clone(&self.store))?;
        self.gate = rebuilt.gate;
        self.root = rebuilt.root;

        tracing::info!(previous = %previous, current = %self.root.id, "Secure root rotated");
        Ok(&self.root)
    }

    /// Assess an arbitrary directory without touching the danger flag.
    pub fn assess(&self, path: &Path) -> Verdict {
        self.gate.danger().detector().assess(path)
    }

    /// The persisted danger state.
    pub fn danger_state(&self) -> DangerState {
        self.gate.danger().state()
    }

    /// Re-assess the active root and clear the danger flag if it is safe.
    pub fn revalidate(&self) -> Result<Verdict> {
        let verdict = self
            .gate
            .danger()
            .revalidate(self.root.path.as_path())
            .context("Failed to record danger state")?;
        Ok(verdict)
    }

    pub fn browser(&self) -> DirectoryBrowser {
        DirectoryBrowser::new(self.root.path.clone())
    }

    pub fn streamer(&self) -> FileStreamer {
        FileStreamer::new(
            self.config.downloads.chunk_size,
            self.config.downloads.max_file_size,
        )
    }

    /// Remove a file or bounded directory tree.
    pub fn remove(&self, relative: &str) -> Result<RemoveSummary> {
        let limits = RemoveLimits {
            max_depth: self.config.delete.max_depth,
            max_entries: self.config.delete.max_entries,
        };
        Ok(remove_tree(&self.root.path, relative, limits)?)
    }

    /// Authorize, mint a one-time link, redeem it and stream the file.
    pub fn download<W: Write>(
        &self,
        relative: &str,
        session: &mut SessionContext,
        secret: Option<&str>,
        writer: &mut W,
    ) -> Result<(FileInfo, u64)> {
        let token = self.gate.issue_link(relative, session, secret, None)?;
        let grant = self.gate.redeem_link(&token)?;

        let (info, written) = self.streamer().copy_to(&grant, writer)?;
        tracing::info!(bytes = written, mime = %info.mime, "Download completed");
        Ok((info, written))
    }

    fn root_manager(&self) -> SecureRootManager {
        SecureRootManager::new(&self.config.root.base_dir, Arc::clone(&self.store))
    }
}
