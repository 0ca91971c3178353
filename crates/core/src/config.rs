//! Runtime configuration, loaded from `.codeplane.toml` at the repository
//! root or defaulted. Mirrors the teacher's `ScanConfig::new` convention of
//! sensible all-defaults construction: absence of the file is never an
//! error.

use serde::Deserialize;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};

/// Directory names pruned from every walk regardless of user configuration.
pub const DEFAULT_PRUNABLE_DIRS: &[&str] =
    &[".git", "node_modules", "__pycache__", "target", "dist", "build", ".next", "vendor", "venv"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawConfig {
    ignore: Vec<String>,
    anchor_group_cap: usize,
    fuzzy_line_drift: usize,
    worker_threads: Option<usize>,
    multi_context_divergence_primary: Option<String>,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            ignore: Vec::new(),
            anchor_group_cap: 10,
            fuzzy_line_drift: 5,
            worker_threads: None,
            multi_context_divergence_primary: None,
        }
    }
}

/// Resolved configuration for one repository root.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub prunable_dirs: HashSet<String>,
    /// §9 open question 3: default 10, never uncapped.
    pub anchor_group_cap: usize,
    /// §9 open question 4: default 5 lines either direction.
    pub fuzzy_line_drift: usize,
    pub worker_threads: usize,
    /// §9 open question 5: unset means divergence always fails.
    pub multi_context_divergence_primary: Option<String>,
}

impl Config {
    /// Load `.codeplane.toml` from `root`, falling back to defaults if absent
    /// or malformed fields are missing.
    pub fn load(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let raw = std::fs::read_to_string(root.join(".codeplane.toml"))
            .ok()
            .and_then(|text| toml::from_str::<RawConfig>(&text).ok())
            .unwrap_or_default();

        let mut prunable_dirs: HashSet<String> =
            DEFAULT_PRUNABLE_DIRS.iter().map(|s| s.to_string()).collect();
        prunable_dirs.extend(raw.ignore);

        Config {
            root,
            prunable_dirs,
            anchor_group_cap: raw.anchor_group_cap.max(1),
            fuzzy_line_drift: raw.fuzzy_line_drift,
            worker_threads: raw
                .worker_threads
                .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)),
            multi_context_divergence_primary: raw.multi_context_divergence_primary,
        }
    }

    /// The opaque on-disk state directory for this repository (§6 "On-disk
    /// layout").
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(".codeplane")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir().join("LOCK")
    }

    /// Acquire the process-wide exclusion lock for this repository's state
    /// directory. Uses `create_new` for an atomic create-if-absent check, so
    /// no separate existence check is needed. No PID-liveness check is done
    /// on an existing lock file — a process that crashes without releasing
    /// it leaves a stale lock that must be removed by hand.
    pub fn acquire_lock(&self) -> CoreResult<ProcessLock> {
        let path = self.lock_file();
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(ProcessLock { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(CoreError::Internal(format!("another codeplane process holds the lock at {}", path.display())))
            }
            Err(e) => Err(CoreError::from(e)),
        }
    }

    pub fn structural_db_path(&self) -> PathBuf {
        self.state_dir().join("structural.db")
    }

    pub fn lexical_dir(&self) -> PathBuf {
        self.state_dir().join("lexical")
    }

    pub fn lexical_staging_dir(&self) -> PathBuf {
        self.state_dir().join("staging")
    }

    pub fn port_file(&self) -> PathBuf {
        self.state_dir().join("port")
    }

    /// Ensure the state directory and its `.gitignore` exist.
    pub fn ensure_state_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.state_dir())?;
        std::fs::create_dir_all(self.lexical_staging_dir())?;
        let gitignore = self.state_dir().join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(gitignore, "*\n")?;
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::load(".")
    }
}

/// A held process-exclusion lock, released by deleting the lock file when
/// dropped. Holding one is `Engine::open`'s responsibility for the lifetime
/// of the process.
pub struct ProcessLock {
    path: PathBuf,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Walk ancestors of `start` looking for a `.git` directory, mirroring the
/// teacher's ancestor-walk discovery of the repository root.
pub fn discover_repo_root(start: &Path) -> Option<PathBuf> {
    let mut cur = Some(start);
    while let Some(dir) = cur {
        if dir.join(".git").exists() {
            return Some(dir.to_path_buf());
        }
        cur = dir.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::load(tmp.path());
        assert_eq!(cfg.anchor_group_cap, 10);
        assert_eq!(cfg.fuzzy_line_drift, 5);
        assert!(cfg.prunable_dirs.contains(".git"));
        assert!(cfg.multi_context_divergence_primary.is_none());
    }

    #[test]
    fn loads_overrides_from_toml() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(".codeplane.toml"),
            "anchor_group_cap = 25\nfuzzy_line_drift = 2\nignore = [\"coverage\"]\n",
        )
        .unwrap();
        let cfg = Config::load(tmp.path());
        assert_eq!(cfg.anchor_group_cap, 25);
        assert_eq!(cfg.fuzzy_line_drift, 2);
        assert!(cfg.prunable_dirs.contains("coverage"));
    }

    #[test]
    fn second_lock_acquisition_fails_while_first_is_held() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::load(tmp.path());
        cfg.ensure_state_dir().unwrap();

        let held = cfg.acquire_lock().unwrap();
        assert!(cfg.acquire_lock().is_err());
        drop(held);
        assert!(cfg.acquire_lock().is_ok());
    }
}
