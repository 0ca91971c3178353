//! Path & Ignore Engine: POSIX-canonical relative paths, glob matching for
//! include/exclude specs, and prunable-directory fast-reject during walks.
//!
//! Grounded in the teacher's `scan::walk_files_parallel` (gitignore-aware
//! `ignore::WalkBuilder` with a `skip_dirs` filter_entry fast-reject) and
//! `types::validate_path` (canonicalize + `starts_with` containment check
//! against path traversal).

use ignore::WalkBuilder;
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{CoreError, CoreResult};

/// Convert a path to a POSIX-canonical, repo-relative string: forward
/// slashes, no leading slash, `""` denotes the repo root.
pub fn to_posix_relative(root: &Path, abs: &Path) -> String {
    let rel = abs.strip_prefix(root).unwrap_or(abs);
    let mut s = rel.to_string_lossy().replace('\\', "/");
    if s == "." {
        s.clear();
    }
    s
}

/// Validate that `rel_path` (as supplied by a caller) resolves inside
/// `root`, rejecting traversal and absolute paths before any filesystem
/// access is attempted.
pub fn validate_scoped_path(root: &Path, rel_path: &str) -> CoreResult<PathBuf> {
    if rel_path.contains("..") || rel_path.starts_with('/') || rel_path.starts_with('\\') {
        return Err(CoreError::PathOutsideScope { path: rel_path.to_string() });
    }
    let full = root.join(rel_path);
    // A new path under an allowed parent is permitted (§4.6) even if it does
    // not exist yet, so only the existing ancestor must resolve inside root.
    let mut probe = full.as_path();
    loop {
        if let Ok(canonical) = probe.canonicalize() {
            let root_canonical =
                root.canonicalize().map_err(|_| CoreError::PathOutsideScope { path: rel_path.to_string() })?;
            if !canonical.starts_with(&root_canonical) {
                return Err(CoreError::PathOutsideScope { path: rel_path.to_string() });
            }
            break;
        }
        match probe.parent() {
            Some(parent) if parent != probe => probe = parent,
            _ => break,
        }
    }
    Ok(full)
}

/// Compile a glob (`**`, `*`, `?` supported) into an anchored regex, used to
/// build `include_spec`/`exclude_spec` matchers for the Context Router.
pub fn glob_to_regex(glob: &str) -> Regex {
    let mut pattern = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // consume an optional following slash so `**/` matches zero dirs too
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        pattern.push_str("(.*/)?");
                    } else {
                        pattern.push_str(".*");
                    }
                } else {
                    pattern.push_str("[^/]*");
                }
            }
            '?' => pattern.push_str("[^/]"),
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '\\' => {
                pattern.push('\\');
                pattern.push(c);
            }
            other => pattern.push(other),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).unwrap_or_else(|_| Regex::new("$^").unwrap())
}

/// Walk every indexable path under `config.root`, excluding prunable
/// directories and anything matched by `.cplignore`, returning POSIX
/// relative paths of regular files only.
pub fn walk_indexable_files(config: &Config) -> Vec<String> {
    let root = config.root.clone();
    let prunable = config.prunable_dirs.clone();

    let mut builder = WalkBuilder::new(&root);
    builder.hidden(false).follow_links(false).add_custom_ignore_filename(".cplignore");

    builder.filter_entry(move |entry| {
        if entry.depth() == 0 {
            return true;
        }
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            return true;
        }
        match entry.file_name().to_str() {
            Some(name) => !prunable.contains(name),
            None => true,
        }
    });

    let mut out = Vec::new();
    for entry in builder.build().flatten() {
        let indexable = entry.file_type().map(|t| t.is_file() || t.is_symlink()).unwrap_or(false);
        if !indexable {
            continue;
        }
        out.push(to_posix_relative(&root, entry.path()));
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let result = validate_scoped_path(tmp.path(), "../etc/passwd");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_absolute() {
        let tmp = tempfile::tempdir().unwrap();
        let result = validate_scoped_path(tmp.path(), "/etc/passwd");
        assert!(result.is_err());
    }

    #[test]
    fn accepts_new_path_under_existing_parent() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("src")).unwrap();
        let result = validate_scoped_path(tmp.path(), "src/new_file.rs");
        assert!(result.is_ok());
    }

    #[test]
    fn glob_star_star_matches_nested() {
        let re = glob_to_regex("**/*.py");
        assert!(re.is_match("a/b/c.py"));
        assert!(re.is_match("c.py"));
        assert!(!re.is_match("c.rs"));
    }

    #[test]
    fn walk_excludes_prunable_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("node_modules")).unwrap();
        std::fs::write(tmp.path().join("node_modules/x.js"), "x").unwrap();
        std::fs::write(tmp.path().join("keep.rs"), "fn main() {}").unwrap();
        let cfg = Config::load(tmp.path());
        let files = walk_indexable_files(&cfg);
        assert!(files.iter().any(|f| f == "keep.rs"));
        assert!(!files.iter().any(|f| f.contains("node_modules")));
    }

    #[cfg(unix)]
    #[test]
    fn walk_includes_symlinks_as_regular_entries() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("target.rs"), "fn main() {}").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("target.rs"), tmp.path().join("link.rs")).unwrap();
        let cfg = Config::load(tmp.path());
        let files = walk_indexable_files(&cfg);
        assert!(files.iter().any(|f| f == "link.rs"));
    }
}
