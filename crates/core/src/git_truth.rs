//! Read-only Git truth source: HEAD SHA, submodule HEADs, and tracked-file
//! rename support for the Reconciler and Mutation Engine.
//!
//! Grounded in the teacher's `git.rs` (same `git2::Repository` open pattern,
//! same practice of mapping `git2::Error` to a domain error at this
//! boundary). Unlike the teacher, this module never reads blame/history —
//! those are explicitly out of scope (§1, "Git operation wrappers"); it only
//! exposes the read-only facts the Reconciler's `RepoVersion` needs.

use git2::Repository;
use std::path::Path;

use crate::error::{CoreError, CoreResult};

/// `RepoVersion` is `(HEAD SHA, index-stat, submodule HEADs)` per §4.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoVersion {
    pub head_sha: Option<String>,
    /// `(mtime_secs, size)` of the `.git` admin directory's `index` file, so
    /// a staged-but-uncommitted change (no new HEAD) still moves this
    /// struct. `None` when the repo has no index file yet.
    pub index_stat: Option<(i64, u64)>,
    pub submodule_heads: Vec<(String, String)>,
}

/// Open the repository at `root` and read its current HEAD/submodule state.
/// A missing or unborn HEAD (fresh repo, no commits yet) is not an error —
/// `head_sha` is simply `None`.
pub fn read_repo_version(root: &Path) -> CoreResult<RepoVersion> {
    let repo = Repository::open(root).map_err(CoreError::from)?;

    let head_sha = match repo.head() {
        Ok(head) => head.target().map(|oid| oid.to_string()),
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch || e.code() == git2::ErrorCode::NotFound => None,
        Err(e) => return Err(CoreError::from(e)),
    };

    // `repo.path()` is the actual `.git` admin directory, which correctly
    // resolves to the shared gitdir for a worktree rather than assuming a
    // naive `root.join(".git")`.
    let index_stat = std::fs::metadata(repo.path().join("index")).ok().map(|meta| {
        let mtime = meta.modified().ok().and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok()).unwrap_or_default();
        (mtime.as_secs() as i64, meta.len())
    });

    let mut submodule_heads = Vec::new();
    if let Ok(submodules) = repo.submodules() {
        for sm in submodules {
            if let Some(head) = sm.head_id() {
                submodule_heads.push((sm.name().unwrap_or("").to_string(), head.to_string()));
            }
        }
    }
    submodule_heads.sort();

    Ok(RepoVersion { head_sha, index_stat, submodule_heads })
}

/// Rename a tracked, clean file with `git mv` semantics so rename history is
/// preserved (§4.6, "Git moves"). Falls back silently to doing nothing if
/// the path is not tracked — callers are expected to have already performed
/// the filesystem rename themselves; this only updates the index.
pub fn record_tracked_rename(root: &Path, from_rel: &str, to_rel: &str) -> CoreResult<()> {
    let repo = Repository::open(root).map_err(CoreError::from)?;
    let mut index = repo.index().map_err(CoreError::from)?;
    if index.get_path(Path::new(from_rel), 0).is_none() {
        return Ok(());
    }
    index.remove_path(Path::new(from_rel)).map_err(CoreError::from)?;
    index.add_path(Path::new(to_rel)).map_err(CoreError::from)?;
    index.write().map_err(CoreError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        {
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "test").unwrap();
            config.set_str("user.email", "test@example.com").unwrap();
        }
        repo
    }

    #[test]
    fn unborn_head_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());
        let version = read_repo_version(tmp.path()).unwrap();
        assert!(version.head_sha.is_none());
    }

    #[test]
    fn reads_head_sha_after_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        std::fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("a.txt")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = repo.signature().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();

        let version = read_repo_version(tmp.path()).unwrap();
        assert!(version.head_sha.is_some());
    }

    #[test]
    fn index_stat_is_present_once_index_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        std::fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("a.txt")).unwrap();
        index.write().unwrap();

        let version = read_repo_version(tmp.path()).unwrap();
        assert!(version.index_stat.is_some());
    }
}
