//! Mutation Engine: the only component that writes working-tree bytes.
//! Applies a batch of span edits with SHA-256/fuzzy-span preconditions,
//! atomic per-file replace, and all-or-nothing batch rollback (§4.6).
//!
//! Grounded in SPEC_FULL.md §5A's `DashMap<FileId, Mutex<()>>` per-file lock
//! idiom (the same concurrent-map pattern the teacher uses for its stub
//! cache in `types.rs`) and in the teacher's `git_truth::record_tracked_rename`
//! for the "git mv effects a clean rename" rule. The temp-file+fsync+rename
//! apply protocol itself has no teacher equivalent — the teacher never
//! writes to the working tree — and is built directly from §4.6's protocol.

use dashmap::DashMap;
use rayon::prelude::*;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::ids::{content_hash, normalize_crlf};
use crate::path_ignore::validate_scoped_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum LineEnding {
    Lf,
    Crlf,
}

fn detect_line_ending(bytes: &[u8]) -> LineEnding {
    if bytes.windows(2).any(|w| w == b"\r\n") { LineEnding::Crlf } else { LineEnding::Lf }
}

fn reencode(content: &str, ending: LineEnding) -> Vec<u8> {
    match ending {
        LineEnding::Lf => content.as_bytes().to_vec(),
        LineEnding::Crlf => content.replace('\n', "\r\n").into_bytes(),
    }
}

#[derive(Debug, Clone)]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct SpanReplacement {
    pub start_line: usize,
    pub end_line: usize,
    pub expected_text: String,
    pub new_text: String,
}

#[derive(Debug, Clone)]
pub struct FileEdit {
    pub path: String,
    pub action: MutationAction,
    pub new_content: Option<String>,
    pub span: Option<SpanReplacement>,
    pub expected_file_sha256: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EditDelta {
    pub path: String,
    pub action: String,
    pub old_sha256: Option<String>,
    pub new_sha256: Option<String>,
    pub line_ending: LineEnding,
    pub line_corrections: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MutationDelta {
    pub mutation_id: String,
    pub files: Vec<EditDelta>,
}

const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct MutationEngine {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Default for MutationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationEngine {
    pub fn new() -> Self {
        Self { locks: DashMap::new() }
    }

    /// Spin-wait for `lock` with a bounded retry, since a batch that can't
    /// acquire every path's lock promptly should surface `LOCK_TIMEOUT`
    /// rather than block the caller indefinitely (§4.6).
    fn acquire_with_timeout<'a>(lock: &'a Mutex<()>, path: &str) -> CoreResult<MutexGuard<'a, ()>> {
        let deadline = Instant::now() + LOCK_ACQUIRE_TIMEOUT;
        loop {
            match lock.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(CoreError::LockTimeout { path: path.to_string() });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
            }
        }
    }

    /// Apply a batch atomically: all files succeed or none are written.
    /// `dry_run` validates every precondition and computes the delta without
    /// touching disk.
    pub fn apply_batch(&self, config: &Config, edits: &[FileEdit], dry_run: bool, mutation_id: String) -> CoreResult<MutationDelta> {
        detect_overlaps(edits)?;

        for edit in edits {
            validate_scoped_path(&config.root, &edit.path)?;
        }

        // Acquire locks in path order to avoid cross-batch deadlock.
        let mut sorted_paths: Vec<&str> = edits.iter().map(|e| e.path.as_str()).collect();
        sorted_paths.sort_unstable();
        sorted_paths.dedup();

        let lock_arcs: Vec<Arc<Mutex<()>>> = sorted_paths
            .iter()
            .map(|path| Arc::clone(&self.locks.entry(path.to_string()).or_insert_with(|| Arc::new(Mutex::new(())))))
            .collect();
        let mut _guards = Vec::with_capacity(lock_arcs.len());
        for (path, lock) in sorted_paths.iter().zip(&lock_arcs) {
            _guards.push(Self::acquire_with_timeout(lock, path)?);
        }

        let results: Vec<CoreResult<(EditDelta, Option<(PathBuf, Vec<u8>)>)>> =
            edits.par_iter().map(|edit| self.plan_one(config, edit)).collect();

        let mut staged = Vec::new();
        let mut deltas = Vec::new();
        for result in results {
            match result {
                Ok((delta, write)) => {
                    deltas.push(delta);
                    if let Some(w) = write {
                        staged.push(w);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if dry_run {
            return Ok(MutationDelta { mutation_id, files: deltas });
        }

        // Stage every file's temp write before any rename, so a failure
        // partway through staging never leaves a partially-applied batch.
        let mut committed_temp_paths = Vec::new();
        for (target, bytes) in &staged {
            match write_staged(target, bytes) {
                Ok(temp_path) => committed_temp_paths.push((target.clone(), temp_path)),
                Err(e) => {
                    for (_, temp) in &committed_temp_paths {
                        let _ = fs::remove_file(temp);
                    }
                    return Err(e);
                }
            }
        }

        // Phase 1: back up every existing target before overwriting it, so a
        // mid-batch failure can restore every file to its pre-apply state
        // rather than leaving the batch half-renamed (§4.6 rollback).
        let mut backups: Vec<Option<PathBuf>> = Vec::with_capacity(committed_temp_paths.len());
        for (target, _) in &committed_temp_paths {
            if target.exists() {
                let backup = backup_path_for(target);
                if let Err(e) = fs::rename(target, &backup) {
                    for (i, b) in backups.iter().enumerate() {
                        if let Some(backup) = b {
                            let _ = fs::rename(backup, &committed_temp_paths[i].0);
                        }
                    }
                    for (_, temp) in &committed_temp_paths {
                        let _ = fs::remove_file(temp);
                    }
                    return Err(CoreError::Internal(format!("backup failed for {}: {e}", target.display())));
                }
                backups.push(Some(backup));
            } else {
                backups.push(None);
            }
        }

        // Phase 2: swap every temp file into place. On failure, reverse
        // every completed rename and restore every not-yet-attempted
        // backup, leaving the working tree exactly as it was.
        for i in 0..committed_temp_paths.len() {
            let (target, temp_path) = &committed_temp_paths[i];
            if let Err(e) = fs::rename(temp_path, target) {
                rollback_rename_phase(&committed_temp_paths, &backups, i);
                return Err(CoreError::Internal(format!("rename failed for {}: {e}", target.display())));
            }
            if let Some(parent) = target.parent() {
                if let Ok(dir) = File::open(parent) {
                    let _ = dir.sync_all();
                }
            }
        }

        for backup in backups.into_iter().flatten() {
            let _ = fs::remove_file(backup);
        }

        for edit in edits {
            if matches!(edit.action, MutationAction::Delete) {
                let target = config.root.join(&edit.path);
                let _ = fs::remove_file(target);
            }
        }

        Ok(MutationDelta { mutation_id, files: deltas })
    }

    fn plan_one(&self, config: &Config, edit: &FileEdit) -> CoreResult<(EditDelta, Option<(PathBuf, Vec<u8>)>)> {
        let target = validate_scoped_path(&config.root, &edit.path)?;

        match edit.action {
            MutationAction::Create => {
                let new_content = edit.new_content.clone().unwrap_or_default();
                let bytes = new_content.into_bytes();
                let new_hash = content_hash(&bytes);
                Ok((
                    EditDelta {
                        path: edit.path.clone(),
                        action: "CREATE".into(),
                        old_sha256: None,
                        new_sha256: Some(new_hash),
                        line_ending: LineEnding::Lf,
                        line_corrections: vec![],
                    },
                    Some((target, bytes)),
                ))
            }
            MutationAction::Delete => {
                let existing = fs::read(&target).map_err(CoreError::from)?;
                let old_hash = content_hash(&existing);
                if let Some(expected) = &edit.expected_file_sha256 {
                    if expected != &old_hash {
                        return Err(precondition_mismatch(&edit.path, Some(expected.clone()), Some(old_hash)));
                    }
                }
                Ok((
                    EditDelta {
                        path: edit.path.clone(),
                        action: "DELETE".into(),
                        old_sha256: Some(old_hash),
                        new_sha256: None,
                        line_ending: detect_line_ending(&existing),
                        line_corrections: vec![],
                    },
                    None,
                ))
            }
            MutationAction::Update => {
                let existing = fs::read(&target).map_err(CoreError::from)?;
                let old_hash = content_hash(&existing);
                if let Some(expected) = &edit.expected_file_sha256 {
                    if expected != &old_hash {
                        return Err(precondition_mismatch(&edit.path, Some(expected.clone()), Some(old_hash)));
                    }
                }
                let ending = detect_line_ending(&existing);
                let existing_text = String::from_utf8_lossy(&normalize_crlf(&existing)).into_owned();

                let (new_text, corrections) = if let Some(span) = &edit.span {
                    apply_span(&existing_text, span, config.fuzzy_line_drift)?
                } else {
                    (edit.new_content.clone().unwrap_or_default(), vec![])
                };

                let bytes = reencode(&new_text, ending);
                let new_hash = content_hash(&bytes);
                Ok((
                    EditDelta {
                        path: edit.path.clone(),
                        action: "UPDATE".into(),
                        old_sha256: Some(old_hash),
                        new_sha256: Some(new_hash),
                        line_ending: ending,
                        line_corrections: corrections,
                    },
                    Some((target, bytes)),
                ))
            }
        }
    }
}

fn precondition_mismatch(path: &str, expected_sha: Option<String>, actual_sha: Option<String>) -> CoreError {
    CoreError::PreconditionFailed { path: path.to_string(), expected_sha, actual_sha, expected_span: None, observed_span: None }
}

/// Replace `span.expected_text` at `(start_line, end_line)`, allowing the
/// expected span to have drifted by up to `drift` lines in either direction
/// before giving up (§4.6's bounded fuzzy search).
fn apply_span(content: &str, span: &SpanReplacement, drift: usize) -> CoreResult<(String, Vec<(usize, usize)>)> {
    let lines: Vec<&str> = content.split('\n').collect();

    let try_at = |start: usize, end: usize| -> Option<String> {
        if start == 0 || end > lines.len() || start > end {
            return None;
        }
        let candidate = lines[start - 1..end].join("\n");
        if candidate == span.expected_text { Some(candidate) } else { None }
    };

    if try_at(span.start_line, span.end_line).is_some() {
        return Ok((splice(&lines, span.start_line, span.end_line, &span.new_text), vec![]));
    }

    for delta in 1..=drift {
        for (s, e) in [
            (span.start_line.saturating_sub(delta), span.end_line.saturating_sub(delta)),
            (span.start_line + delta, span.end_line + delta),
        ] {
            if try_at(s, e).is_some() {
                return Ok((splice(&lines, s, e, &span.new_text), vec![(span.start_line, s)]));
            }
        }
    }

    Err(CoreError::PreconditionFailed {
        path: String::new(),
        expected_sha: None,
        actual_sha: None,
        expected_span: Some((span.start_line, span.end_line)),
        observed_span: Some(span.expected_text.clone()),
    })
}

fn splice(lines: &[&str], start_line: usize, end_line: usize, new_text: &str) -> String {
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    out.extend_from_slice(&lines[..start_line - 1]);
    let mut result = out.join("\n");
    if start_line > 1 {
        result.push('\n');
    }
    result.push_str(new_text);
    if end_line < lines.len() {
        result.push('\n');
        result.push_str(&lines[end_line..].join("\n"));
    }
    result
}

fn backup_path_for(target: &Path) -> PathBuf {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{}.cplbak", target.file_name().and_then(|n| n.to_str()).unwrap_or("tmp")))
}

/// Undo the rename phase after `failed_index` failed to swap its temp file
/// into place: entries before it already landed and must be reverted to
/// their backup (or removed, if they had no backup); entries from
/// `failed_index` on still have their original content sitting in a
/// backup file (or never existed) and get restored as-is.
fn rollback_rename_phase(entries: &[(PathBuf, PathBuf)], backups: &[Option<PathBuf>], failed_index: usize) {
    for i in 0..failed_index {
        let (target, _) = &entries[i];
        match &backups[i] {
            Some(backup) => {
                let _ = fs::rename(backup, target);
            }
            None => {
                let _ = fs::remove_file(target);
            }
        }
    }
    for i in failed_index..entries.len() {
        let (target, temp) = &entries[i];
        let _ = fs::remove_file(temp);
        if let Some(backup) = &backups[i] {
            let _ = fs::rename(backup, target);
        }
    }
}

fn write_staged(target: &Path, bytes: &[u8]) -> CoreResult<PathBuf> {
    let parent = target.parent().ok_or_else(|| CoreError::Internal("target has no parent directory".into()))?;
    fs::create_dir_all(parent).map_err(CoreError::from)?;
    let temp_path = parent.join(format!(".{}.cpltmp", target.file_name().and_then(|n| n.to_str()).unwrap_or("tmp")));
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&temp_path).map_err(CoreError::from)?;
    file.write_all(bytes).map_err(CoreError::from)?;
    file.sync_all().map_err(CoreError::from)?;
    Ok(temp_path)
}

/// Reject a batch containing two edits to the same path with overlapping
/// spans — per §4.6, overlapping edits are detected and rejected pre-apply.
fn detect_overlaps(edits: &[FileEdit]) -> CoreResult<()> {
    use std::collections::HashMap;
    let mut by_path: HashMap<&str, Vec<&SpanReplacement>> = HashMap::new();
    for edit in edits {
        if let Some(span) = &edit.span {
            by_path.entry(edit.path.as_str()).or_default().push(span);
        }
    }
    for (path, spans) in by_path {
        for i in 0..spans.len() {
            for j in (i + 1)..spans.len() {
                if spans[i].start_line <= spans[j].end_line && spans[j].start_line <= spans[i].end_line {
                    return Err(CoreError::OverlappingEdits { path: path.to_string() });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_update_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::load(tmp.path());
        let engine = MutationEngine::new();

        let create = FileEdit {
            path: "a.rs".into(),
            action: MutationAction::Create,
            new_content: Some("fn main() {}\n".into()),
            span: None,
            expected_file_sha256: None,
        };
        engine.apply_batch(&cfg, &[create], false, "m1".into()).unwrap();
        assert_eq!(fs::read_to_string(tmp.path().join("a.rs")).unwrap(), "fn main() {}\n");

        let hash = content_hash(b"fn main() {}\n");
        let update = FileEdit {
            path: "a.rs".into(),
            action: MutationAction::Update,
            new_content: Some("fn main() {\n    println!(\"hi\");\n}\n".into()),
            span: None,
            expected_file_sha256: Some(hash),
        };
        engine.apply_batch(&cfg, &[update], false, "m2".into()).unwrap();
        assert!(fs::read_to_string(tmp.path().join("a.rs")).unwrap().contains("println"));
    }

    #[test]
    fn precondition_mismatch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.rs"), "fn main() {}\n").unwrap();
        let cfg = Config::load(tmp.path());
        let engine = MutationEngine::new();

        let update = FileEdit {
            path: "a.rs".into(),
            action: MutationAction::Update,
            new_content: Some("changed".into()),
            span: None,
            expected_file_sha256: Some("deadbeef".into()),
        };
        let err = engine.apply_batch(&cfg, &[update], false, "m1".into()).unwrap_err();
        assert!(matches!(err, CoreError::PreconditionFailed { .. }));
        assert_eq!(fs::read_to_string(tmp.path().join("a.rs")).unwrap(), "fn main() {}\n");
    }

    #[test]
    fn span_drift_within_k_lines_is_corrected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.rs"), "// header\nfn main() {\n    old();\n}\n").unwrap();
        let cfg = Config::load(tmp.path());
        let engine = MutationEngine::new();

        let span = SpanReplacement { start_line: 2, end_line: 2, expected_text: "    old();".into(), new_text: "    new();".into() };
        let update = FileEdit { path: "a.rs".into(), action: MutationAction::Update, new_content: None, span: Some(span), expected_file_sha256: None };
        engine.apply_batch(&cfg, &[update], false, "m1".into()).unwrap();
        assert!(fs::read_to_string(tmp.path().join("a.rs")).unwrap().contains("new();"));
    }

    #[test]
    fn overlapping_spans_in_same_path_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.rs"), "fn a() {}\nfn b() {}\n").unwrap();
        let cfg = Config::load(tmp.path());
        let engine = MutationEngine::new();

        let span1 = SpanReplacement { start_line: 1, end_line: 2, expected_text: "x".into(), new_text: "y".into() };
        let span2 = SpanReplacement { start_line: 2, end_line: 2, expected_text: "x".into(), new_text: "z".into() };
        let edits = vec![
            FileEdit { path: "a.rs".into(), action: MutationAction::Update, new_content: None, span: Some(span1), expected_file_sha256: None },
            FileEdit { path: "a.rs".into(), action: MutationAction::Update, new_content: None, span: Some(span2), expected_file_sha256: None },
        ];
        let err = engine.apply_batch(&cfg, &edits, false, "m1".into()).unwrap_err();
        assert!(matches!(err, CoreError::OverlappingEdits { .. }));
    }

    #[test]
    fn concurrent_batches_on_same_path_serialize_instead_of_racing() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.rs"), "v0").unwrap();
        let cfg = Config::load(tmp.path());
        let engine = std::sync::Arc::new(MutationEngine::new());
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));

        let mut handles = Vec::new();
        for i in 0..2 {
            let engine = std::sync::Arc::clone(&engine);
            let cfg = cfg.clone();
            let barrier = std::sync::Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                let update = FileEdit { path: "a.rs".into(), action: MutationAction::Update, new_content: Some(format!("v{i}")), span: None, expected_file_sha256: None };
                engine.apply_batch(&cfg, &[update], false, format!("m{i}"))
            }));
        }
        for h in handles {
            h.join().unwrap().unwrap();
        }
        let content = fs::read_to_string(tmp.path().join("a.rs")).unwrap();
        assert!(content == "v0" || content == "v1");
    }

    #[test]
    fn lock_timeout_is_reported_when_a_path_stays_held() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.rs"), "v0").unwrap();
        let cfg = Config::load(tmp.path());
        let engine = MutationEngine::new();
        let lock = Arc::clone(&engine.locks.entry("a.rs".to_string()).or_insert_with(|| Arc::new(Mutex::new(()))));
        let _held = lock.lock().unwrap();

        let update = FileEdit { path: "a.rs".into(), action: MutationAction::Update, new_content: Some("v1".into()), span: None, expected_file_sha256: None };
        let err = engine.apply_batch(&cfg, &[update], false, "m1".into()).unwrap_err();
        assert!(matches!(err, CoreError::LockTimeout { .. }));
    }

    #[test]
    fn rollback_restores_original_content_after_partial_rename_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let target_a = tmp.path().join("a.rs");
        let target_b = tmp.path().join("b.rs");
        fs::write(&target_a, "original-a").unwrap();
        fs::write(&target_b, "original-b").unwrap();

        let backup_a = backup_path_for(&target_a);
        let backup_b = backup_path_for(&target_b);
        fs::rename(&target_a, &backup_a).unwrap();
        fs::rename(&target_b, &backup_b).unwrap();

        // a's temp rename already landed; b's temp file is orphaned because
        // its rename is the one that failed.
        fs::write(&target_a, "new-a").unwrap();
        let temp_a = tmp.path().join(".a.rs.cpltmp");
        let temp_b = tmp.path().join(".b.rs.cpltmp");
        fs::write(&temp_b, "new-b").unwrap();

        let entries = vec![(target_a.clone(), temp_a.clone()), (target_b.clone(), temp_b.clone())];
        let backups = vec![Some(backup_a), Some(backup_b)];

        rollback_rename_phase(&entries, &backups, 1);

        assert_eq!(fs::read_to_string(&target_a).unwrap(), "original-a");
        assert_eq!(fs::read_to_string(&target_b).unwrap(), "original-b");
        assert!(!temp_b.exists());
    }

    #[test]
    fn dry_run_does_not_touch_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::load(tmp.path());
        let engine = MutationEngine::new();
        let create = FileEdit { path: "a.rs".into(), action: MutationAction::Create, new_content: Some("x".into()), span: None, expected_file_sha256: None };
        engine.apply_batch(&cfg, &[create], true, "m1".into()).unwrap();
        assert!(!tmp.path().join("a.rs").exists());
    }
}
