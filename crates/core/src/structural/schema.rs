//! Structural Tier schema and forward-only migrations.
//!
//! Grounded in the ambient-stack decision to use `rusqlite` the way
//! DecapodLabs' `core/store.rs` does (one bundled SQLite file per
//! repository, WAL mode for single-writer/multi-reader concurrency), with
//! migrations gated on `PRAGMA user_version` so a schema change is an
//! explicit, ordered step rather than an ad hoc `ALTER TABLE` scattered
//! through the codebase.

use rusqlite::Connection;

use crate::error::{CoreError, CoreResult};

/// Bump whenever a migration is appended. `open()` runs every migration with
/// `user_version < SCHEMA_VERSION`, in order.
pub const SCHEMA_VERSION: i64 = 1;

pub fn open(path: &std::path::Path) -> CoreResult<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    migrate(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> CoreResult<Connection> {
    let conn = Connection::open_in_memory()?;
    migrate(&conn)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> CoreResult<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current > SCHEMA_VERSION {
        return Err(CoreError::IndexSchemaMismatch { found: current, expected: SCHEMA_VERSION });
    }
    if current < 1 {
        apply_v1(conn)?;
    }
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

fn apply_v1(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS file (
            file_id     INTEGER PRIMARY KEY,
            path        TEXT NOT NULL UNIQUE,
            content_hash TEXT NOT NULL,
            language_family TEXT NOT NULL,
            epoch_indexed INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS unit (
            unit_id     INTEGER PRIMARY KEY,
            file_id     INTEGER NOT NULL REFERENCES file(file_id) ON DELETE CASCADE,
            language_family TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_unit_file ON unit(file_id);

        CREATE TABLE IF NOT EXISTS scope (
            scope_id    INTEGER PRIMARY KEY,
            unit_id     INTEGER NOT NULL REFERENCES unit(unit_id) ON DELETE CASCADE,
            parent_scope_id INTEGER,
            kind        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_scope_unit ON scope(unit_id);

        CREATE TABLE IF NOT EXISTS def_fact (
            def_uid     TEXT PRIMARY KEY,
            unit_id     INTEGER NOT NULL REFERENCES unit(unit_id) ON DELETE CASCADE,
            kind        TEXT NOT NULL,
            simple_name TEXT NOT NULL,
            qualified_name TEXT NOT NULL,
            lexical_path TEXT NOT NULL,
            signature_hash TEXT NOT NULL,
            start_line  INTEGER NOT NULL,
            start_col   INTEGER NOT NULL,
            end_line    INTEGER NOT NULL,
            end_col     INTEGER NOT NULL,
            display_name TEXT NOT NULL,
            disambiguator INTEGER NOT NULL,
            epoch_indexed INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_def_unit ON def_fact(unit_id);
        CREATE INDEX IF NOT EXISTS idx_def_simple_name ON def_fact(simple_name);

        CREATE TABLE IF NOT EXISTS ref_fact (
            ref_id      INTEGER PRIMARY KEY,
            unit_id     INTEGER NOT NULL REFERENCES unit(unit_id) ON DELETE CASCADE,
            file_id     INTEGER NOT NULL REFERENCES file(file_id) ON DELETE CASCADE,
            token_text  TEXT NOT NULL,
            line        INTEGER NOT NULL,
            col         INTEGER NOT NULL,
            enclosing_scope_id INTEGER,
            role        TEXT NOT NULL,
            tier        TEXT NOT NULL,
            target_def_uid TEXT,
            epoch_indexed INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ref_file ON ref_fact(file_id);
        CREATE INDEX IF NOT EXISTS idx_ref_target ON ref_fact(target_def_uid);

        CREATE TABLE IF NOT EXISTS local_bind_fact (
            scope_id    INTEGER NOT NULL REFERENCES scope(scope_id) ON DELETE CASCADE,
            name        TEXT NOT NULL,
            target_kind TEXT NOT NULL,
            target_uid  TEXT,
            certainty   TEXT NOT NULL,
            reason_code TEXT NOT NULL,
            PRIMARY KEY (scope_id, name)
        );

        CREATE TABLE IF NOT EXISTS import_fact (
            import_id   INTEGER PRIMARY KEY,
            unit_id     INTEGER NOT NULL REFERENCES unit(unit_id) ON DELETE CASCADE,
            imported_name TEXT NOT NULL,
            alias       TEXT,
            source_literal TEXT,
            import_kind TEXT NOT NULL,
            line        INTEGER NOT NULL,
            epoch_indexed INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_import_source ON import_fact(source_literal);
        CREATE INDEX IF NOT EXISTS idx_import_unit ON import_fact(unit_id);

        CREATE TABLE IF NOT EXISTS export_surface (
            unit_id     INTEGER PRIMARY KEY REFERENCES unit(unit_id) ON DELETE CASCADE,
            surface_hash TEXT NOT NULL,
            epoch_indexed INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS export_entry (
            entry_id    INTEGER PRIMARY KEY,
            unit_id     INTEGER NOT NULL REFERENCES unit(unit_id) ON DELETE CASCADE,
            exported_name TEXT NOT NULL,
            def_uid     TEXT,
            certainty   TEXT NOT NULL,
            evidence_kind TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_export_entry_unit ON export_entry(unit_id);
        CREATE INDEX IF NOT EXISTS idx_export_entry_name ON export_entry(exported_name);

        CREATE TABLE IF NOT EXISTS export_thunk (
            thunk_id    INTEGER PRIMARY KEY,
            unit_id     INTEGER NOT NULL REFERENCES unit(unit_id) ON DELETE CASCADE,
            mode        TEXT NOT NULL,
            payload     TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS anchor_group (
            group_id    INTEGER PRIMARY KEY,
            unit_id     INTEGER NOT NULL REFERENCES unit(unit_id) ON DELETE CASCADE,
            member_token TEXT NOT NULL,
            receiver_shape TEXT NOT NULL,
            total_count INTEGER NOT NULL,
            UNIQUE(unit_id, member_token, receiver_shape)
        );

        CREATE TABLE IF NOT EXISTS anchor_exemplar (
            group_id    INTEGER NOT NULL REFERENCES anchor_group(group_id) ON DELETE CASCADE,
            file_path   TEXT NOT NULL,
            start_line  INTEGER NOT NULL,
            start_col   INTEGER NOT NULL,
            ordinal     INTEGER NOT NULL,
            PRIMARY KEY (group_id, ordinal)
        );

        CREATE TABLE IF NOT EXISTS dynamic_access_site (
            site_id     INTEGER PRIMARY KEY,
            unit_id     INTEGER NOT NULL REFERENCES unit(unit_id) ON DELETE CASCADE,
            pattern     TEXT NOT NULL,
            literal     TEXT,
            line        INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS def_snapshot (
            epoch_id    INTEGER NOT NULL,
            def_uid     TEXT NOT NULL,
            kind        TEXT NOT NULL,
            file_path   TEXT NOT NULL,
            lexical_path TEXT NOT NULL,
            signature_hash TEXT NOT NULL,
            display_name TEXT NOT NULL,
            start_line  INTEGER NOT NULL,
            end_line    INTEGER NOT NULL,
            PRIMARY KEY (epoch_id, def_uid)
        );
        CREATE INDEX IF NOT EXISTS idx_snapshot_def ON def_snapshot(def_uid);
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_lands_on_current_version() {
        let conn = open_in_memory().unwrap();
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0)).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn future_schema_version_is_rejected() {
        let conn = open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        let err = migrate(&conn).unwrap_err();
        assert!(matches!(err, CoreError::IndexSchemaMismatch { .. }));
    }
}
