//! Reconciler: computes `RepoVersion`, walks indexable files, and drives the
//! stat→hash cascade that detects what changed on disk without OS watchers.
//!
//! Grounded in the teacher's `scan::walk_files_parallel` (parallel,
//! gitignore-aware directory walk) generalized from "build a manifest" to
//! "detect dirt since the last known state," and in `git.rs`'s
//! `Repository::open` boundary for `RepoVersion`. The teacher has no
//! stat-cache/hash-cascade logic at all — it always does a full rescan — so
//! this module's core algorithm (§4.1 steps 1–4) is new engineering grounded
//! only in the spec's own description, using `rayon` for the per-file hash
//! pass the way the teacher uses `rayon` for its directory walk.

use dashmap::DashMap;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use crate::config::Config;
use crate::error::CoreResult;
use crate::git_truth::{self, RepoVersion};
use crate::ids::{content_hash, FileId};
use crate::path_ignore::walk_indexable_files;

#[derive(Debug, Clone, PartialEq, Eq)]
struct StatTriple {
    mtime_secs: i64,
    mtime_nanos: i64,
    size: u64,
}

#[derive(Debug, Clone)]
struct FileRecord {
    file_id: FileId,
    stat: StatTriple,
    hash: String,
}

/// What kind of change a file underwent in one reconciliation pass.
#[derive(Debug, Clone)]
pub enum FileChange {
    Created { file_id: FileId, path: String },
    Modified { file_id: FileId, path: String },
    Deleted { file_id: FileId, path: String },
    Renamed { file_id: FileId, from: String, to: String },
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileResult {
    pub changed_files: Vec<FileChange>,
    pub renamed: usize,
    pub repo_version: Option<RepoVersion>,
}

impl ReconcileResult {
    pub fn change_count(&self) -> usize {
        self.changed_files.len()
    }
}

/// Owns the path↔file_id mapping and the last-observed stat/hash cache.
/// Stateless in the sense required by §4.1: two reconciliations back to back
/// with no filesystem change between them report `changed_files = []`.
pub struct Reconciler {
    config: Config,
    records: DashMap<String, FileRecord>,
    next_file_id: AtomicI64,
}

impl Reconciler {
    pub fn new(config: Config) -> Self {
        Self { config, records: DashMap::new(), next_file_id: AtomicI64::new(1) }
    }

    pub fn file_id_for(&self, path: &str) -> Option<FileId> {
        self.records.get(path).map(|r| r.file_id)
    }

    pub fn path_for(&self, file_id: FileId) -> Option<String> {
        self.records.iter().find(|e| e.value().file_id == file_id).map(|e| e.key().clone())
    }

    /// Every path currently tracked, for callers (the Context Router's
    /// initial probe) that need a real sample rather than synthetic input.
    pub fn known_paths(&self) -> Vec<String> {
        self.records.iter().map(|e| e.key().clone()).collect()
    }

    fn allocate_file_id(&self) -> FileId {
        FileId(self.next_file_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Run one reconciliation pass: enumerate, stat→hash cascade, rename
    /// inference, emit changes. Never mutates the working tree, `.git/`, or
    /// HEAD.
    pub fn reconcile(&self) -> CoreResult<ReconcileResult> {
        let repo_version = git_truth::read_repo_version(&self.config.root).ok();

        let current_paths: Vec<String> = walk_indexable_files(&self.config);
        let root = self.config.root.clone();

        // Stat every current path in parallel; only hash when the stat
        // differs from the cached one (step 2 of §4.1).
        let observations: Vec<(String, Option<(StatTriple, String)>)> = current_paths
            .par_iter()
            .map(|rel_path| {
                let abs = root.join(rel_path);
                let observed = stat_file(&abs).and_then(|stat| {
                    let needs_hash = self
                        .records
                        .get(rel_path)
                        .map(|r| r.value().stat != stat)
                        .unwrap_or(true);
                    if !needs_hash {
                        // Stat unchanged: reuse the cached hash without reading content.
                        let cached = self.records.get(rel_path).map(|r| r.value().hash.clone())?;
                        Some((stat, cached))
                    } else {
                        let bytes = fs::read(&abs).ok()?;
                        Some((stat, content_hash(&bytes)))
                    }
                });
                (rel_path.clone(), observed)
            })
            .collect();

        let mut present: HashMap<String, (StatTriple, String)> = HashMap::new();
        for (path, observed) in observations {
            if let Some(v) = observed {
                present.insert(path, v);
            }
        }

        let previous_paths: Vec<String> = self.records.iter().map(|e| e.key().clone()).collect();
        let mut missing: Vec<String> =
            previous_paths.iter().filter(|p| !present.contains_key(*p)).cloned().collect();
        missing.sort();

        let mut new_paths: Vec<String> =
            present.keys().filter(|p| !self.records.contains_key(*p)).cloned().collect();
        new_paths.sort();

        let mut changes = Vec::new();
        let mut renamed = 0usize;

        // Rename inference (step 3): missing path A whose cached hash equals
        // a new path B's hash is a rename, not unlink+create.
        let mut missing_by_hash: HashMap<String, Vec<String>> = HashMap::new();
        for path in &missing {
            if let Some(record) = self.records.get(path) {
                missing_by_hash.entry(record.hash.clone()).or_default().push(path.clone());
            }
        }

        let mut consumed_new: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut consumed_missing: std::collections::HashSet<String> = std::collections::HashSet::new();

        for new_path in &new_paths {
            let (_, new_hash) = &present[new_path];
            if let Some(candidates) = missing_by_hash.get(new_hash) {
                if let Some(old_path) = candidates.iter().find(|p| !consumed_missing.contains(*p)) {
                    let (stat, hash) = present[new_path].clone();
                    let (_, record) = self.records.remove(old_path).unwrap();
                    self.records.insert(
                        new_path.clone(),
                        FileRecord { file_id: record.file_id, stat, hash },
                    );
                    changes.push(FileChange::Renamed {
                        file_id: record.file_id,
                        from: old_path.clone(),
                        to: new_path.clone(),
                    });
                    renamed += 1;
                    consumed_new.insert(new_path.clone());
                    consumed_missing.insert(old_path.clone());
                }
            }
        }

        for path in &missing {
            if consumed_missing.contains(path) {
                continue;
            }
            if let Some((_, record)) = self.records.remove(path) {
                changes.push(FileChange::Deleted { file_id: record.file_id, path: path.clone() });
            }
        }

        for path in &new_paths {
            if consumed_new.contains(path) {
                continue;
            }
            let (stat, hash) = present[path].clone();
            let file_id = self.allocate_file_id();
            self.records.insert(path.clone(), FileRecord { file_id, stat, hash });
            changes.push(FileChange::Created { file_id, path: path.clone() });
        }

        // Remaining present paths that existed before: check for a hash
        // change at an unchanged path (plain modification).
        for (path, (stat, hash)) in &present {
            if consumed_new.contains(path) || new_paths.contains(path) {
                continue;
            }
            let mut record = match self.records.get_mut(path) {
                Some(r) => r,
                None => continue,
            };
            if record.hash != *hash {
                let file_id = record.file_id;
                record.hash = hash.clone();
                record.stat = stat.clone();
                changes.push(FileChange::Modified { file_id, path: path.clone() });
            } else if record.stat != *stat {
                record.stat = stat.clone();
            }
        }

        Ok(ReconcileResult { changed_files: changes, renamed, repo_version })
    }
}

fn stat_file(abs: &PathBuf) -> Option<StatTriple> {
    let meta = fs::symlink_metadata(abs).ok()?;
    if !meta.is_file() && !meta.is_symlink() {
        return None;
    }
    let mtime = meta.modified().ok()?.duration_since(UNIX_EPOCH).unwrap_or_default();
    Some(StatTriple { mtime_secs: mtime.as_secs() as i64, mtime_nanos: mtime.subsec_nanos() as i64, size: meta.len() })
}

pub type SharedReconciler = Arc<Reconciler>;

#[cfg(test)]
mod tests {
    use super::*;

    fn scaffold() -> (tempfile::TempDir, Reconciler) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.py"), "x = 1\n").unwrap();
        let cfg = Config::load(tmp.path());
        (tmp, Reconciler::new(cfg))
    }

    #[test]
    fn first_reconcile_reports_creates() {
        let (_tmp, rec) = scaffold();
        let result = rec.reconcile().unwrap();
        assert_eq!(result.change_count(), 1);
        assert!(matches!(result.changed_files[0], FileChange::Created { .. }));
    }

    #[test]
    fn idempotent_without_filesystem_changes() {
        let (_tmp, rec) = scaffold();
        rec.reconcile().unwrap();
        let second = rec.reconcile().unwrap();
        assert_eq!(second.change_count(), 0);
        assert_eq!(second.renamed, 0);
    }

    #[test]
    fn touch_without_content_change_is_not_dirty() {
        let (tmp, rec) = scaffold();
        rec.reconcile().unwrap();

        // Bump mtime without changing bytes.
        let path = tmp.path().join("a.py");
        let now = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        filetime_touch(&path, now);

        let second = rec.reconcile().unwrap();
        assert_eq!(second.change_count(), 0, "touch-only change must not mark the file dirty");
    }

    #[test]
    fn rename_is_detected_via_content_hash() {
        let (tmp, rec) = scaffold();
        let first = rec.reconcile().unwrap();
        let original_id = match &first.changed_files[0] {
            FileChange::Created { file_id, .. } => *file_id,
            _ => panic!("expected create"),
        };

        std::fs::rename(tmp.path().join("a.py"), tmp.path().join("b.py")).unwrap();
        let second = rec.reconcile().unwrap();
        assert_eq!(second.renamed, 1);
        match &second.changed_files[0] {
            FileChange::Renamed { file_id, from, to } => {
                assert_eq!(*file_id, original_id);
                assert_eq!(from, "a.py");
                assert_eq!(to, "b.py");
            }
            other => panic!("expected rename, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_indexed_as_regular_entries() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("target.py"), "x = 1\n").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("target.py"), tmp.path().join("link.py")).unwrap();
        let cfg = Config::load(tmp.path());
        let rec = Reconciler::new(cfg);
        let result = rec.reconcile().unwrap();
        assert!(result.changed_files.iter().any(|c| matches!(c, FileChange::Created { path, .. } if path == "link.py")));
    }

    #[test]
    fn content_change_is_modification() {
        let (tmp, rec) = scaffold();
        rec.reconcile().unwrap();
        std::fs::write(tmp.path().join("a.py"), "x = 2\n").unwrap();
        let second = rec.reconcile().unwrap();
        assert_eq!(second.change_count(), 1);
        assert!(matches!(second.changed_files[0], FileChange::Modified { .. }));
    }

    /// Sets mtime without touching content, portably enough for the test
    /// above (std has no stable mtime setter, so we rewrite with identical
    /// bytes and rely on the OS bumping mtime — exercised via a short sleep
    /// to guarantee a distinguishable timestamp on coarse filesystems).
    fn filetime_touch(path: &std::path::Path, _new_time: std::time::SystemTime) {
        std::thread::sleep(std::time::Duration::from_millis(10));
        let bytes = std::fs::read(path).unwrap();
        std::fs::write(path, &bytes).unwrap();
    }
}
