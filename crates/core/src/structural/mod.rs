//! Structural Tier (T1): the ACID, WAL-style single-writer/multi-reader
//! fact store. Every public query here is bounded and none of them compute
//! a caller/callee graph, transitive closure, impact analysis, or type
//! hierarchy — those are explicitly excluded (§4.3) and deliberately absent
//! from this module's API surface, not merely unimplemented.
//!
//! Grounded in DecapodLabs-decapod's `core/store.rs` for the "one bundled
//! SQLite file per repository, opened once, held behind a mutex for writes"
//! shape; the fact schema itself is new, derived directly from the data
//! model rather than from any teacher table.

pub mod facts;
mod schema;

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::ids::{DefUid, FileId, GroupId, ScopeId, UnitId};
use facts::*;

const MAX_QUERY_LIMIT: usize = 100;

fn bounded(limit: usize) -> CoreResult<usize> {
    if limit == 0 {
        return Err(CoreError::UnboundedQuery);
    }
    Ok(limit.min(MAX_QUERY_LIMIT))
}

/// A single connection guarded by a mutex for writes; SQLite's own WAL mode
/// gives readers (separate connections, not modeled here since the core is
/// in-process) lock-free access to the last committed snapshot.
pub struct StructuralStore {
    conn: Mutex<Connection>,
}

impl StructuralStore {
    pub fn open(path: &std::path::Path) -> CoreResult<Self> {
        Ok(Self { conn: Mutex::new(schema::open(path)?) })
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        Ok(Self { conn: Mutex::new(schema::open_in_memory()?) })
    }

    /// Remove every T1 row owned by `file_id`'s units (full re-indexing
    /// writes a fresh set immediately after). The Mutation Engine never
    /// calls this directly — only the Parser Facade, on a Reconciler signal.
    pub fn clear_file(&self, file_id: FileId) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM unit WHERE file_id = ?1",
            params![file_id.0],
        )?;
        conn.execute("DELETE FROM file WHERE file_id = ?1", params![file_id.0])?;
        Ok(())
    }

    pub fn upsert_file(&self, file_id: FileId, path: &str, content_hash: &str, language_family: &str, epoch: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO file (file_id, path, content_hash, language_family, epoch_indexed)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(file_id) DO UPDATE SET path=excluded.path, content_hash=excluded.content_hash,
                 language_family=excluded.language_family, epoch_indexed=excluded.epoch_indexed",
            params![file_id.0, path, content_hash, language_family, epoch],
        )?;
        Ok(())
    }

    pub fn insert_unit(&self, file_id: FileId, language_family: &str) -> CoreResult<UnitId> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO unit (file_id, language_family) VALUES (?1, ?2)",
            params![file_id.0, language_family],
        )?;
        Ok(UnitId(conn.last_insert_rowid()))
    }

    /// Resolve a unit back to the file that owns it, so callers holding only
    /// a `DefFact` (which carries `unit_id`, not `file_id`) can reach the
    /// Reconciler's path table.
    pub fn file_id_for_unit(&self, unit_id: UnitId) -> CoreResult<Option<FileId>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT file_id FROM unit WHERE unit_id = ?1", params![unit_id.0], |row| row.get::<_, i64>(0))
            .optional()
            .map(|opt| opt.map(FileId))
            .map_err(CoreError::from)
    }

    pub fn insert_scope(&self, unit_id: UnitId, parent: Option<ScopeId>, kind: &str) -> CoreResult<ScopeId> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scope (unit_id, parent_scope_id, kind) VALUES (?1, ?2, ?3)",
            params![unit_id.0, parent.map(|s| s.0), kind],
        )?;
        Ok(ScopeId(conn.last_insert_rowid()))
    }

    pub fn insert_def(&self, def: &DefFact, epoch: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO def_fact
             (def_uid, unit_id, kind, simple_name, qualified_name, lexical_path, signature_hash,
              start_line, start_col, end_line, end_col, display_name, disambiguator, epoch_indexed)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                def.def_uid.0, def.unit_id.0, def.kind, def.simple_name, def.qualified_name,
                def.lexical_path, def.signature_hash, def.start_line, def.start_col,
                def.end_line, def.end_col, def.display_name, def.disambiguator, epoch,
            ],
        )?;
        Ok(())
    }

    pub fn insert_ref(&self, r: &RefFact, epoch: i64) -> CoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ref_fact
             (unit_id, file_id, token_text, line, col, enclosing_scope_id, role, tier, target_def_uid, epoch_indexed)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                r.unit_id.0, r.file_id.0, r.token_text, r.line, r.col,
                r.enclosing_scope_id.map(|s| s.0), r.role.as_str(), r.tier.as_str(),
                r.target_def_uid.as_ref().map(|u| u.0.clone()), epoch,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_local_bind(&self, b: &LocalBindFact) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO local_bind_fact (scope_id, name, target_kind, target_uid, certainty, reason_code)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![b.scope_id.0, b.name, b.target_kind.as_str(), b.target_uid, b.certainty.as_str(), b.reason_code.as_str()],
        )?;
        Ok(())
    }

    pub fn insert_import(&self, i: &ImportFact, epoch: i64) -> CoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO import_fact (unit_id, imported_name, alias, source_literal, import_kind, line, epoch_indexed)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![i.unit_id.0, i.imported_name, i.alias, i.source_literal, i.import_kind, i.line, epoch],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_export_surface(&self, unit_id: UnitId, surface_hash: &str, epoch: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO export_surface (unit_id, surface_hash, epoch_indexed) VALUES (?1,?2,?3)
             ON CONFLICT(unit_id) DO UPDATE SET surface_hash=excluded.surface_hash, epoch_indexed=excluded.epoch_indexed",
            params![unit_id.0, surface_hash, epoch],
        )?;
        Ok(())
    }

    pub fn insert_export_entry(&self, unit_id: UnitId, entry: &ExportEntry) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO export_entry (unit_id, exported_name, def_uid, certainty, evidence_kind)
             VALUES (?1,?2,?3,?4,?5)",
            params![unit_id.0, entry.exported_name, entry.def_uid.as_ref().map(|u| u.0.clone()), entry.certainty.as_str(), entry.evidence_kind],
        )?;
        Ok(())
    }

    /// Capped exemplar insertion: refuses new exemplars once `cap` is
    /// reached but always bumps `total_count`, per §3's "unbounded lists
    /// never leave the store."
    pub fn record_anchor_member(&self, unit_id: UnitId, member_token: &str, receiver_shape: &str, file_path: &str, line: u32, col: u32, cap: usize) -> CoreResult<GroupId> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO anchor_group (unit_id, member_token, receiver_shape, total_count) VALUES (?1,?2,?3,0)
             ON CONFLICT(unit_id, member_token, receiver_shape) DO NOTHING",
            params![unit_id.0, member_token, receiver_shape],
        )?;
        let group_id: i64 = conn.query_row(
            "SELECT group_id FROM anchor_group WHERE unit_id=?1 AND member_token=?2 AND receiver_shape=?3",
            params![unit_id.0, member_token, receiver_shape],
            |row| row.get(0),
        )?;
        conn.execute("UPDATE anchor_group SET total_count = total_count + 1 WHERE group_id=?1", params![group_id])?;

        let current: usize = conn.query_row(
            "SELECT COUNT(*) FROM anchor_exemplar WHERE group_id=?1",
            params![group_id],
            |row| row.get(0),
        )?;
        if current < cap {
            conn.execute(
                "INSERT INTO anchor_exemplar (group_id, file_path, start_line, start_col, ordinal) VALUES (?1,?2,?3,?4,?5)",
                params![group_id, file_path, line, col, current as i64],
            )?;
        }
        Ok(GroupId(group_id))
    }

    pub fn insert_dynamic_access_site(&self, site: &DynamicAccessSite) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO dynamic_access_site (unit_id, pattern, literal, line) VALUES (?1,?2,?3,?4)",
            params![site.unit_id.0, site.pattern, site.literal, site.line],
        )?;
        Ok(())
    }

    pub fn write_def_snapshot(&self, epoch_id: i64, record: &DefSnapshotRecord) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO def_snapshot
             (epoch_id, def_uid, kind, file_path, lexical_path, signature_hash, display_name, start_line, end_line)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![epoch_id, record.def_uid.0, record.kind, record.file_path, record.lexical_path,
                record.signature_hash, record.display_name, record.start_line, record.end_line],
        )?;
        Ok(())
    }

    // -- bounded queries (§6 canonical operations) --------------------------

    pub fn get_def(&self, def_uid: &DefUid) -> CoreResult<Option<DefFact>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT def_uid, unit_id, kind, simple_name, qualified_name, lexical_path, signature_hash,
                    start_line, start_col, end_line, end_col, display_name, disambiguator
             FROM def_fact WHERE def_uid = ?1",
            params![def_uid.0],
            |row| {
                Ok(DefFact {
                    def_uid: DefUid(row.get(0)?),
                    unit_id: UnitId(row.get(1)?),
                    kind: row.get(2)?,
                    simple_name: row.get(3)?,
                    qualified_name: row.get(4)?,
                    lexical_path: row.get(5)?,
                    signature_hash: row.get(6)?,
                    start_line: row.get(7)?,
                    start_col: row.get(8)?,
                    end_line: row.get(9)?,
                    end_col: row.get(10)?,
                    display_name: row.get(11)?,
                    disambiguator: row.get(12)?,
                })
            },
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn list_refs(&self, def_uid: &DefUid, tier: Option<RefTier>, limit: usize) -> CoreResult<Vec<RefFact>> {
        let limit = bounded(limit)?;
        let conn = self.conn.lock().unwrap();
        let tier_str = tier.map(|t| t.as_str());
        let mut stmt = conn.prepare(
            "SELECT ref_id, unit_id, file_id, token_text, line, col, enclosing_scope_id, role, tier, target_def_uid
             FROM ref_fact WHERE target_def_uid = ?1 AND (?2 IS NULL OR tier = ?2)
             ORDER BY file_id, line, col LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![def_uid.0, tier_str, limit as i64], |row| {
            Ok(RefFact {
                ref_id: row.get(0)?,
                unit_id: UnitId(row.get(1)?),
                file_id: FileId(row.get(2)?),
                token_text: row.get(3)?,
                line: row.get(4)?,
                col: row.get(5)?,
                enclosing_scope_id: row.get::<_, Option<i64>>(6)?.map(ScopeId),
                role: RefRole::parse(&row.get::<_, String>(7)?),
                tier: RefTier::parse(&row.get::<_, String>(8)?),
                target_def_uid: row.get::<_, Option<String>>(9)?.map(DefUid),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    pub fn list_imports(&self, unit_id: UnitId, limit: usize) -> CoreResult<Vec<ImportFact>> {
        let limit = bounded(limit)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT import_id, unit_id, imported_name, alias, source_literal, import_kind, line
             FROM import_fact WHERE unit_id = ?1 ORDER BY line LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![unit_id.0, limit as i64], |row| {
            Ok(ImportFact {
                import_id: row.get(0)?,
                unit_id: UnitId(row.get(1)?),
                imported_name: row.get(2)?,
                alias: row.get(3)?,
                source_literal: row.get(4)?,
                import_kind: row.get(5)?,
                line: row.get(6)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    /// Reverse module -> importer query used by Impact/Test Selection.
    /// Matches `source_literal` exactly, as a child-submodule path, or as an
    /// ancestor package of the queried module (the importer names a parent
    /// package that the module lives under). Never broadens beyond these
    /// three match kinds.
    pub fn find_importers_of(&self, source_literal: &str, limit: usize) -> CoreResult<Vec<ImportFact>> {
        let limit = bounded(limit)?;
        let conn = self.conn.lock().unwrap();
        let child_prefix = format!("{}/%", source_literal);
        let mut stmt = conn.prepare(
            "SELECT import_id, unit_id, imported_name, alias, source_literal, import_kind, line
             FROM import_fact
             WHERE source_literal = ?1 OR source_literal LIKE ?2 OR ?1 LIKE source_literal || '/%'
             ORDER BY unit_id LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![source_literal, child_prefix, limit as i64], |row| {
            Ok(ImportFact {
                import_id: row.get(0)?,
                unit_id: UnitId(row.get(1)?),
                imported_name: row.get(2)?,
                alias: row.get(3)?,
                source_literal: row.get(4)?,
                import_kind: row.get(5)?,
                line: row.get(6)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    pub fn export_entries(&self, unit_id: UnitId, limit: usize) -> CoreResult<Vec<ExportEntry>> {
        let limit = bounded(limit)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT exported_name, def_uid, certainty, evidence_kind FROM export_entry
             WHERE unit_id = ?1 ORDER BY exported_name LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![unit_id.0, limit as i64], |row| {
            Ok(ExportEntry {
                exported_name: row.get(0)?,
                def_uid: row.get::<_, Option<String>>(1)?.map(DefUid),
                certainty: Certainty::parse(&row.get::<_, String>(2)?),
                evidence_kind: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    pub fn anchor_group(&self, unit_id: UnitId, member_token: &str, receiver_shape: &str) -> CoreResult<Option<AnchorGroup>> {
        let conn = self.conn.lock().unwrap();
        let found = conn
            .query_row(
                "SELECT group_id, total_count FROM anchor_group WHERE unit_id=?1 AND member_token=?2 AND receiver_shape=?3",
                params![unit_id.0, member_token, receiver_shape],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, u32>(1)?)),
            )
            .optional()?;
        let Some((group_id, total_count)) = found else { return Ok(None) };

        let mut stmt = conn.prepare(
            "SELECT file_path, start_line, start_col FROM anchor_exemplar WHERE group_id=?1 ORDER BY ordinal",
        )?;
        let exemplars = stmt
            .query_map(params![group_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(AnchorGroup {
            group_id: GroupId(group_id),
            unit_id,
            member_token: member_token.to_string(),
            receiver_shape: receiver_shape.to_string(),
            total_count,
            exemplars,
        }))
    }

    pub fn dynamic_access_sites(&self, unit_id: UnitId, limit: usize) -> CoreResult<Vec<DynamicAccessSite>> {
        let limit = bounded(limit)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT unit_id, pattern, literal, line FROM dynamic_access_site WHERE unit_id = ?1 ORDER BY line LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![unit_id.0, limit as i64], |row| {
            Ok(DynamicAccessSite { unit_id: UnitId(row.get(0)?), pattern: row.get(1)?, literal: row.get(2)?, line: row.get(3)? })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    pub fn def_snapshot_at(&self, epoch_id: i64, limit: usize) -> CoreResult<Vec<DefSnapshotRecord>> {
        let limit = bounded(limit)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT epoch_id, def_uid, kind, file_path, lexical_path, signature_hash, display_name, start_line, end_line
             FROM def_snapshot WHERE epoch_id = ?1 ORDER BY def_uid LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![epoch_id, limit as i64], |row| {
            Ok(DefSnapshotRecord {
                epoch_id: row.get(0)?,
                def_uid: DefUid(row.get(1)?),
                kind: row.get(2)?,
                file_path: row.get(3)?,
                lexical_path: row.get(4)?,
                signature_hash: row.get(5)?,
                display_name: row.get(6)?,
                start_line: row.get(7)?,
                end_line: row.get(8)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(uid: &str, unit: i64, name: &str) -> DefFact {
        DefFact {
            def_uid: DefUid(uid.to_string()),
            unit_id: UnitId(unit),
            kind: "function".into(),
            simple_name: name.into(),
            qualified_name: name.into(),
            lexical_path: name.into(),
            signature_hash: "abc".into(),
            start_line: 1,
            start_col: 0,
            end_line: 3,
            end_col: 1,
            display_name: name.into(),
            disambiguator: 0,
        }
    }

    #[test]
    fn get_def_roundtrips() {
        let store = StructuralStore::open_in_memory().unwrap();
        store.upsert_file(FileId(1), "a.rs", "h1", "rust", 1).unwrap();
        let unit_id = store.insert_unit(FileId(1), "rust").unwrap();
        store.insert_def(&def("uid1", unit_id.0, "reconcile"), 1).unwrap();

        let found = store.get_def(&DefUid("uid1".into())).unwrap().unwrap();
        assert_eq!(found.simple_name, "reconcile");
    }

    #[test]
    fn list_refs_requires_bounded_limit() {
        let store = StructuralStore::open_in_memory().unwrap();
        let err = store.list_refs(&DefUid("x".into()), None, 0).unwrap_err();
        assert!(matches!(err, CoreError::UnboundedQuery));
    }

    #[test]
    fn anchor_group_caps_exemplars_but_tracks_total() {
        let store = StructuralStore::open_in_memory().unwrap();
        store.upsert_file(FileId(1), "a.rs", "h1", "rust", 1).unwrap();
        let unit_id = store.insert_unit(FileId(1), "rust").unwrap();
        for i in 0..15 {
            store.record_anchor_member(unit_id, "len", "Vec<T>", "a.rs", i, 0, 10).unwrap();
        }
        let group = store.anchor_group(unit_id, "len", "Vec<T>").unwrap().unwrap();
        assert_eq!(group.total_count, 15);
        assert_eq!(group.exemplars.len(), 10);
    }

    #[test]
    fn find_importers_matches_prefix_and_exact() {
        let store = StructuralStore::open_in_memory().unwrap();
        store.upsert_file(FileId(1), "a.rs", "h1", "rust", 1).unwrap();
        let unit_id = store.insert_unit(FileId(1), "rust").unwrap();
        store.insert_import(&ImportFact {
            import_id: 0, unit_id, imported_name: "helper".into(), alias: None,
            source_literal: Some("crate::util::helper".into()), import_kind: "use".into(), line: 1,
        }, 1).unwrap();

        let exact = store.find_importers_of("crate::util::helper", 10).unwrap();
        assert_eq!(exact.len(), 1);

        let child = store.find_importers_of("crate::util", 10).unwrap();
        assert_eq!(child.len(), 1);
    }

    #[test]
    fn find_importers_matches_ancestor_package() {
        let store = StructuralStore::open_in_memory().unwrap();
        store.upsert_file(FileId(1), "a.rs", "h1", "rust", 1).unwrap();
        let unit_id = store.insert_unit(FileId(1), "rust").unwrap();
        store.insert_import(&ImportFact {
            import_id: 0, unit_id, imported_name: "util".into(), alias: None,
            source_literal: Some("crate::util".into()), import_kind: "use".into(), line: 1,
        }, 1).unwrap();

        let ancestor = store.find_importers_of("crate::util::helper", 10).unwrap();
        assert_eq!(ancestor.len(), 1);
    }

    #[test]
    fn file_id_for_unit_resolves_owning_file() {
        let store = StructuralStore::open_in_memory().unwrap();
        store.upsert_file(FileId(7), "a.rs", "h1", "rust", 1).unwrap();
        let unit_id = store.insert_unit(FileId(7), "rust").unwrap();
        assert_eq!(store.file_id_for_unit(unit_id).unwrap(), Some(FileId(7)));
    }
}
