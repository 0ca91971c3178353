//! Semantic-Diff Engine: joins `DefSnapshotRecord` rows across two epochs by
//! `(kind, lexical_path)` and classifies what changed (§4.9). Grounded in
//! the Structural Tier's `def_snapshot_at` query and `find_importers_of` for
//! enrichment; the join/classify logic itself has no teacher equivalent
//! (the teacher never diffs two scans against each other) and is new
//! engineering against the spec's description.

use std::collections::HashMap;

use crate::error::CoreResult;
use crate::ids::DefUid;
use crate::structural::facts::DefSnapshotRecord;
use crate::structural::StructuralStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    SignatureChanged,
    BodyChanged,
    Renamed,
}

#[derive(Debug, Clone)]
pub struct DefChange {
    pub kind: ChangeKind,
    pub before: Option<DefSnapshotRecord>,
    pub after: Option<DefSnapshotRecord>,
    pub delta_tags: Vec<&'static str>,
    pub references_by_tier: Option<HashMap<&'static str, usize>>,
    pub importing_files: Option<Vec<String>>,
}

fn snapshot_key(r: &DefSnapshotRecord) -> (String, String) {
    (r.kind.clone(), r.lexical_path.clone())
}

/// Compare two epoch snapshots def-by-def. `enrich` is fail-open: a
/// failure to enrich one change (e.g. an importer lookup error) never
/// aborts the diff, it just leaves that annotation `None`.
pub fn diff_epochs(store: &StructuralStore, before_epoch: i64, after_epoch: i64, limit: usize) -> CoreResult<Vec<DefChange>> {
    let before = store.def_snapshot_at(before_epoch, limit)?;
    let after = store.def_snapshot_at(after_epoch, limit)?;
    Ok(diff_snapshots(&before, &after, store))
}

fn diff_snapshots(before: &[DefSnapshotRecord], after: &[DefSnapshotRecord], store: &StructuralStore) -> Vec<DefChange> {
    let mut before_by_key: HashMap<(String, String), &DefSnapshotRecord> = HashMap::new();
    for r in before {
        before_by_key.insert(snapshot_key(r), r);
    }
    let mut after_by_key: HashMap<(String, String), &DefSnapshotRecord> = HashMap::new();
    for r in after {
        after_by_key.insert(snapshot_key(r), r);
    }

    let mut changes = Vec::new();
    let mut matched_before: std::collections::HashSet<DefUid> = std::collections::HashSet::new();
    let mut matched_after: std::collections::HashSet<DefUid> = std::collections::HashSet::new();

    for (key, after_rec) in &after_by_key {
        if let Some(before_rec) = before_by_key.get(key) {
            matched_before.insert(before_rec.def_uid.clone());
            matched_after.insert(after_rec.def_uid.clone());
            if before_rec.signature_hash != after_rec.signature_hash {
                changes.push(classify_changed(before_rec, after_rec, ChangeKind::SignatureChanged, store));
            } else if before_rec.start_line != after_rec.start_line || before_rec.end_line != after_rec.end_line {
                changes.push(classify_changed(before_rec, after_rec, ChangeKind::BodyChanged, store));
            }
        }
    }

    let added: Vec<&DefSnapshotRecord> = after.iter().filter(|r| !matched_after.contains(&r.def_uid)).collect();
    let removed: Vec<&DefSnapshotRecord> = before.iter().filter(|r| !matched_before.contains(&r.def_uid)).collect();

    // Rename detection: same kind + signature_hash, disjoint add/remove sets.
    let mut removed_by_sig: HashMap<(String, String), &DefSnapshotRecord> = HashMap::new();
    for r in &removed {
        removed_by_sig.insert((r.kind.clone(), r.signature_hash.clone()), r);
    }
    let mut renamed_removed: std::collections::HashSet<DefUid> = std::collections::HashSet::new();
    let mut renamed_added: std::collections::HashSet<DefUid> = std::collections::HashSet::new();

    for a in &added {
        if let Some(b) = removed_by_sig.get(&(a.kind.clone(), a.signature_hash.clone())) {
            changes.push(DefChange {
                kind: ChangeKind::Renamed,
                before: Some((*b).clone()),
                after: Some((*a).clone()),
                delta_tags: vec!["renamed"],
                references_by_tier: enrich_refs(store, &a.def_uid),
                importing_files: enrich_importers(store, &a.lexical_path),
            });
            renamed_removed.insert(b.def_uid.clone());
            renamed_added.insert(a.def_uid.clone());
        }
    }

    for a in &added {
        if renamed_added.contains(&a.def_uid) {
            continue;
        }
        changes.push(DefChange {
            kind: ChangeKind::Added,
            before: None,
            after: Some((*a).clone()),
            delta_tags: vec!["major_change"],
            references_by_tier: enrich_refs(store, &a.def_uid),
            importing_files: enrich_importers(store, &a.lexical_path),
        });
    }

    for b in &removed {
        if renamed_removed.contains(&b.def_uid) {
            continue;
        }
        changes.push(DefChange {
            kind: ChangeKind::Removed,
            before: Some((*b).clone()),
            after: None,
            delta_tags: vec!["major_change"],
            references_by_tier: enrich_refs(store, &b.def_uid),
            importing_files: enrich_importers(store, &b.lexical_path),
        });
    }

    changes
}

fn classify_changed(before: &DefSnapshotRecord, after: &DefSnapshotRecord, kind: ChangeKind, store: &StructuralStore) -> DefChange {
    let mut tags = Vec::new();
    if kind == ChangeKind::SignatureChanged {
        tags.push("parameters_changed");
    } else {
        tags.push("minor_change");
    }
    DefChange {
        kind,
        before: Some(before.clone()),
        after: Some(after.clone()),
        delta_tags: tags,
        references_by_tier: enrich_refs(store, &after.def_uid),
        importing_files: enrich_importers(store, &after.lexical_path),
    }
}

/// Fail-open: a query error silently yields `None` rather than failing the
/// whole diff (§4.9 "per-change enrichment is fail-open").
fn enrich_refs(store: &StructuralStore, def_uid: &DefUid) -> Option<HashMap<&'static str, usize>> {
    let refs = store.list_refs(def_uid, None, 100).ok()?;
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    for r in refs {
        *counts.entry(r.tier.as_str()).or_insert(0) += 1;
    }
    Some(counts)
}

fn enrich_importers(store: &StructuralStore, lexical_path: &str) -> Option<Vec<String>> {
    let importers = store.find_importers_of(lexical_path, 100).ok()?;
    Some(importers.into_iter().filter_map(|i| i.source_literal).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UnitId;

    fn snap(epoch: i64, uid: &str, kind: &str, path: &str, sig: &str, start: u32, end: u32) -> DefSnapshotRecord {
        DefSnapshotRecord {
            epoch_id: epoch,
            def_uid: DefUid(uid.into()),
            kind: kind.into(),
            file_path: "a.rs".into(),
            lexical_path: path.into(),
            signature_hash: sig.into(),
            display_name: path.into(),
            start_line: start,
            end_line: end,
        }
    }

    #[test]
    fn unchanged_def_produces_no_change() {
        let store = StructuralStore::open_in_memory().unwrap();
        let before = vec![snap(1, "u1", "function", "foo", "sig1", 1, 5)];
        let after = vec![snap(2, "u1", "function", "foo", "sig1", 1, 5)];
        let changes = diff_snapshots(&before, &after, &store);
        assert!(changes.is_empty());
    }

    #[test]
    fn signature_change_is_detected() {
        let store = StructuralStore::open_in_memory().unwrap();
        let before = vec![snap(1, "u1", "function", "foo", "sig1", 1, 5)];
        let after = vec![snap(2, "u1", "function", "foo", "sig2", 1, 5)];
        let changes = diff_snapshots(&before, &after, &store);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::SignatureChanged);
        assert!(changes[0].delta_tags.contains(&"parameters_changed"));
    }

    #[test]
    fn rename_detected_via_matching_signature_across_add_remove() {
        let store = StructuralStore::open_in_memory().unwrap();
        let before = vec![snap(1, "u1", "function", "old_name", "sigA", 1, 5)];
        let after = vec![snap(2, "u2", "function", "new_name", "sigA", 1, 5)];
        let changes = diff_snapshots(&before, &after, &store);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Renamed);
    }

    #[test]
    fn pure_add_and_remove_without_signature_match() {
        let store = StructuralStore::open_in_memory().unwrap();
        let before = vec![snap(1, "u1", "function", "gone", "sigA", 1, 5)];
        let after = vec![snap(2, "u2", "function", "fresh", "sigB", 1, 5)];
        let changes = diff_snapshots(&before, &after, &store);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().any(|c| c.kind == ChangeKind::Added));
        assert!(changes.iter().any(|c| c.kind == ChangeKind::Removed));
    }

    #[test]
    fn diff_epochs_reads_from_store() {
        let store = StructuralStore::open_in_memory().unwrap();
        store.upsert_file(crate::ids::FileId(1), "a.rs", "h1", "rust", 1).unwrap();
        let unit_id = store.insert_unit(crate::ids::FileId(1), "rust").unwrap();
        let _ = unit_id;
        store.write_def_snapshot(1, &snap(1, "u1", "function", "foo", "sig1", 1, 5)).unwrap();
        store.write_def_snapshot(2, &snap(2, "u1", "function", "foo", "sig1", 1, 5)).unwrap();
        let changes = diff_epochs(&store, 1, 2, 100).unwrap();
        assert!(changes.is_empty());
    }
}
