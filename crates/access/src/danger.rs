//! Detection of secure roots that overlap sensitive locations.
//!
//! [`DangerDetector::assess`] is an expensive, filesystem-touching check. Its
//! outcome is cached by [`DangerGate`] as the process-wide danger flag, which
//! is recomputed only when the root changes or an administrator explicitly
//! revalidates. Downloads consult the cached flag only.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::store::{ConfigStore, ConfigStoreExt, StoreError};

/// System directories that must never serve as, or contain, the secure root.
pub const SYSTEM_DENYLIST: &[&str] = &[
    "/etc", "/usr", "/var/log", "/root", "/proc", "/sys", "/dev", "/tmp", "/bin", "/sbin",
    "/boot", "/lib",
];

/// Store key for the persisted danger state.
pub const DANGER_STATE_KEY: &str = "danger.state";

/// Minimum number of host signature entries that must be present before a
/// directory is considered to contain the host application.
const MIN_HOST_SIGNALS: usize = 2;

/// Outcome of assessing a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No overlap detected.
    #[default]
    Safe,
    /// The directory is, or encloses, the host application's root.
    HostRoot,
    /// The directory is inside (or encloses) a protected system or host directory.
    DangerousSystemDir,
    /// The directory holds several of the host application's own files.
    ContainsHostFiles,
}

impl Verdict {
    /// Whether downloads may proceed under this verdict.
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Safe)
    }
}

/// Filesystem layout of the host web application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLayout {
    /// The application's installation root.
    pub root: Option<PathBuf>,
    /// Its administration directory.
    pub admin_dir: Option<PathBuf>,
    /// Its core library directory.
    pub core_dir: Option<PathBuf>,
}

impl HostLayout {
    /// Layout for a WordPress install rooted at `root`.
    pub fn wordpress<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            root: Some(root.to_path_buf()),
            admin_dir: Some(root.join("wp-admin")),
            core_dir: Some(root.join("wp-includes")),
        }
    }
}

/// Names whose joint presence identifies a host application install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSignature {
    /// Core subsystem directory names.
    pub directories: Vec<String>,
    /// Primary configuration and bootstrap file names.
    pub files: Vec<String>,
}

impl Default for HostSignature {
    fn default() -> Self {
        Self {
            directories: ["wp-admin", "wp-includes", "wp-content"]
                .map(String::from)
                .to_vec(),
            files: ["wp-config.php", "wp-settings.php", "wp-load.php"]
                .map(String::from)
                .to_vec(),
        }
    }
}

/// Heuristic detector for unsafe root directories.
#[derive(Debug, Clone)]
pub struct DangerDetector {
    denylist: Vec<PathBuf>,
    host: HostLayout,
    signature: HostSignature,
}

impl Default for DangerDetector {
    fn default() -> Self {
        Self::new(HostLayout::default())
    }
}

impl DangerDetector {
    /// Detector using the system denylist plus the host's own directories.
    pub fn new(host: HostLayout) -> Self {
        Self::with_denylist(SYSTEM_DENYLIST.iter().map(PathBuf::from).collect(), host)
    }

    /// Detector with an explicit system denylist.
    pub fn with_denylist(denylist: Vec<PathBuf>, host: HostLayout) -> Self {
        Self {
            denylist,
            host,
            signature: HostSignature::default(),
        }
    }

    /// Replace the host signature used by the child-scan heuristic.
    pub fn with_signature(mut self, signature: HostSignature) -> Self {
        self.signature = signature;
        self
    }

    /// Assess `path` (literal and symlink-resolved forms).
    pub fn assess(&self, path: &Path) -> Verdict {
        let mut candidates = vec![path.to_path_buf()];
        if let Ok(resolved) = fs::canonicalize(path) {
            if resolved != path {
                candidates.push(resolved);
            }
        }

        for candidate in &candidates {
            let verdict = self.assess_location(candidate);
            if !verdict.is_safe() {
                return verdict;
            }
        }

        if self.count_host_signals(path) >= MIN_HOST_SIGNALS {
            return Verdict::ContainsHostFiles;
        }

        Verdict::Safe
    }

    fn assess_location(&self, candidate: &Path) -> Verdict {
        if candidate.parent().is_none() {
            // Filesystem root overlaps everything.
            return Verdict::DangerousSystemDir;
        }

        if let Some(host_root) = &self.host.root {
            for host_form in forms(host_root) {
                if host_form.starts_with(candidate) {
                    return Verdict::HostRoot;
                }
            }
        }

        let host_dirs = [&self.host.admin_dir, &self.host.core_dir];
        let protected = self
            .denylist
            .iter()
            .chain(host_dirs.into_iter().flatten());
        for entry in protected {
            for form in forms(entry) {
                if candidate.starts_with(&form) || form.starts_with(candidate) {
                    return Verdict::DangerousSystemDir;
                }
            }
        }

        Verdict::Safe
    }

    fn count_host_signals(&self, dir: &Path) -> usize {
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };

        let mut signals = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let is_signature = if file_type.is_dir() {
                self.signature.directories.contains(&name)
            } else {
                self.signature.files.contains(&name)
            };
            if is_signature {
                signals += 1;
            }
        }
        signals
    }
}

/// A path and, when different, its canonical form.
fn forms(path: &Path) -> Vec<PathBuf> {
    let mut forms = vec![path.to_path_buf()];
    if let Ok(resolved) = fs::canonicalize(path) {
        if resolved != path {
            forms.push(resolved);
        }
    }
    forms
}

/// Persisted danger flag together with the verdict that set it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DangerState {
    /// When set, every download is refused.
    pub flag: bool,
    /// The verdict of the last assessment.
    pub verdict: Verdict,
    /// The directory that was assessed.
    pub assessed_path: Option<PathBuf>,
    /// When the assessment happened.
    pub assessed_at: Option<SystemTime>,
}

/// Process-wide danger flag backed by the configuration store.
///
/// The flag is sticky: [`DangerGate::evaluate`] can set it but never clears
/// it. Only [`DangerGate::revalidate`], an explicit administrator action,
/// may clear it again.
pub struct DangerGate {
    detector: DangerDetector,
    store: Arc<dyn ConfigStore>,
    state: RwLock<DangerState>,
}

impl DangerGate {
    /// Create a gate, loading any persisted state.
    ///
    /// An unreadable persisted state is treated as dangerous.
    pub fn new(detector: DangerDetector, store: Arc<dyn ConfigStore>) -> Self {
        let state = match store.get_as::<DangerState>(DANGER_STATE_KEY) {
            Ok(Some(state)) => state,
            Ok(None) => DangerState::default(),
            Err(e) => {
                tracing::warn!("Failed to load danger state, failing closed: {}", e);
                DangerState {
                    flag: true,
                    ..DangerState::default()
                }
            }
        };
        Self {
            detector,
            store,
            state: RwLock::new(state),
        }
    }

    /// The detector used by this gate.
    pub fn detector(&self) -> &DangerDetector {
        &self.detector
    }

    /// Whether downloads are currently blocked.
    pub fn is_dangerous(&self) -> bool {
        self.state.read().map(|s| s.flag).unwrap_or(true)
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> DangerState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|_| DangerState {
                flag: true,
                ..DangerState::default()
            })
    }

    /// Assess `path` after a root or target change. May only raise the flag.
    pub fn evaluate(&self, path: &Path) -> Result<Verdict, StoreError> {
        let verdict = self.detector.assess(path);
        self.record(path, verdict, false)?;
        Ok(verdict)
    }

    /// Administrator re-validation: re-assess and clear the flag if safe.
    pub fn revalidate(&self, path: &Path) -> Result<Verdict, StoreError> {
        let verdict = self.detector.assess(path);
        self.record(path, verdict, true)?;
        Ok(verdict)
    }

    fn record(&self, path: &Path, verdict: Verdict, may_clear: bool) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::LockPoisoned {
            context: "danger state write".to_string(),
        })?;

        let flag = if may_clear {
            !verdict.is_safe()
        } else {
            state.flag || !verdict.is_safe()
        };

        if flag && !state.flag {
            tracing::warn!(verdict = ?verdict, "Danger flag raised, downloads are blocked");
        } else if !flag && state.flag {
            tracing::info!("Danger flag cleared by revalidation");
        }

        let next = DangerState {
            flag,
            verdict,
            assessed_path: Some(path.to_path_buf()),
            assessed_at: Some(SystemTime::now()),
        };
        self.store.set_as(DANGER_STATE_KEY, &next)?;
        *state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_system_directories_flagged() {
        let detector = DangerDetector::default();
        for path in ["/etc", "/etc/ssl", "/usr/share", "/var/log/nginx", "/proc/self"] {
            assert_eq!(
                detector.assess(Path::new(path)),
                Verdict::DangerousSystemDir,
                "{path}"
            );
        }
    }

    #[test]
    fn test_filesystem_root_and_ancestors_flagged() {
        let detector = DangerDetector::default();
        assert_eq!(detector.assess(Path::new("/")), Verdict::DangerousSystemDir);
        // /var encloses /var/log.
        assert_eq!(detector.assess(Path::new("/var")), Verdict::DangerousSystemDir);
    }

    #[test]
    fn test_segment_prefix_not_substring() {
        let detector = DangerDetector::default();
        assert_eq!(detector.assess(Path::new("/etcetera/files")), Verdict::Safe);
        assert_eq!(detector.assess(Path::new("/srv/secure/ab12")), Verdict::Safe);
    }

    #[test]
    fn test_host_root_and_internals() {
        let detector = DangerDetector::new(HostLayout::wordpress("/var/www/site"));
        assert_eq!(
            detector.assess(Path::new("/var/www/site")),
            Verdict::HostRoot
        );
        assert_eq!(detector.assess(Path::new("/var/www")), Verdict::HostRoot);
        assert_eq!(
            detector.assess(Path::new("/var/www/site/wp-admin/files")),
            Verdict::DangerousSystemDir
        );
        assert_eq!(
            detector.assess(Path::new("/var/www/site/wp-content/uploads/private")),
            Verdict::Safe
        );
    }

    #[test]
    fn test_symlink_into_denylisted_directory() {
        let temp_dir = TempDir::new().unwrap();
        let protected = temp_dir.path().join("protected");
        fs::create_dir_all(&protected).unwrap();
        let link = temp_dir.path().join("innocent");
        symlink(&protected, &link).unwrap();

        let detector = DangerDetector::with_denylist(vec![protected], HostLayout::default());
        assert_eq!(detector.assess(&link), Verdict::DangerousSystemDir);
    }

    #[test]
    fn test_contains_host_files_requires_multiple_signals() {
        let temp_dir = TempDir::new().unwrap();
        let detector = DangerDetector::with_denylist(Vec::new(), HostLayout::default());

        fs::create_dir_all(temp_dir.path().join("wp-content")).unwrap();
        assert_eq!(detector.assess(temp_dir.path()), Verdict::Safe);

        fs::write(temp_dir.path().join("wp-config.php"), "<?php").unwrap();
        assert_eq!(
            detector.assess(temp_dir.path()),
            Verdict::ContainsHostFiles
        );
    }

    #[test]
    fn test_signature_kind_must_match() {
        let temp_dir = TempDir::new().unwrap();
        let detector = DangerDetector::with_denylist(Vec::new(), HostLayout::default());

        // Files named like signature directories are not signals.
        fs::write(temp_dir.path().join("wp-admin"), "").unwrap();
        fs::write(temp_dir.path().join("wp-includes"), "").unwrap();
        assert_eq!(detector.assess(temp_dir.path()), Verdict::Safe);
    }

    #[test]
    fn test_gate_flag_is_sticky_until_revalidated() {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
        let detector = DangerDetector::with_denylist(
            vec![PathBuf::from("/etc")],
            HostLayout::default(),
        );
        let gate = DangerGate::new(detector, Arc::clone(&store));
        assert!(!gate.is_dangerous());

        assert_eq!(
            gate.evaluate(Path::new("/etc")).unwrap(),
            Verdict::DangerousSystemDir
        );
        assert!(gate.is_dangerous());

        // A later safe evaluation does not clear the flag.
        assert_eq!(gate.evaluate(temp_dir.path()).unwrap(), Verdict::Safe);
        assert!(gate.is_dangerous());

        assert_eq!(gate.revalidate(temp_dir.path()).unwrap(), Verdict::Safe);
        assert!(!gate.is_dangerous());
    }

    #[test]
    fn test_gate_state_persisted() {
        let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
        let gate = DangerGate::new(DangerDetector::default(), Arc::clone(&store));
        gate.evaluate(Path::new("/etc")).unwrap();

        let reloaded = DangerGate::new(DangerDetector::default(), store);
        assert!(reloaded.is_dangerous());
        assert_eq!(reloaded.state().verdict, Verdict::DangerousSystemDir);
    }

    #[test]
    fn test_gate_fails_closed_on_corrupt_state() {
        let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
        store
            .set(DANGER_STATE_KEY, serde_json::json!("garbage"))
            .unwrap();

        let gate = DangerGate::new(DangerDetector::default(), store);
        assert!(gate.is_dangerous());
    }
}
