//! Parser Facade: parses one file with the grammar for its language family
//! and emits T1 fact rows (`DefFact`, `ScopeFact`, `ImportFact`, a coarse
//! `RefFact` pass). On grammar or parse failure, skips the file and reports
//! a warning rather than aborting the reindex pass (§4.4).
//!
//! Grounded directly in the teacher's `ast.rs`: same `tree_sitter::Parser`
//! setup, the same `classify_node`/`extract_name`/`extract_signature` shape
//! of helpers, and the same "descend into children even for nodes that
//! aren't symbols" walk. The target type changed from `Symbol`/`FileAst`
//! (a UI-facing symbol outline) to `DefFact`/`ScopeFact` rows destined for
//! the structural store, and import/export extraction (absent in the
//! teacher entirely) was added per-family as declarative regex rules, kept
//! deliberately simple and version-pinned rather than full tree-sitter
//! queries — a scoping decision recorded in the project's grounding ledger.

#[cfg(feature = "treesitter")]
mod families;

use serde::{Deserialize, Serialize};

use crate::ids::{signature_hash, DefUid, FileId, ScopeId, UnitId};
use crate::structural::facts::{
    Certainty, DefFact, DynamicAccessSite, ExportEntry, ImportFact, LocalBindFact, ReasonCode, RefFact, RefRole, RefTier, TargetKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LanguageFamily {
    Rust,
    TypeScript,
    Python,
    JavaScript,
}

impl LanguageFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            LanguageFamily::Rust => "rust",
            LanguageFamily::TypeScript => "typescript",
            LanguageFamily::Python => "python",
            LanguageFamily::JavaScript => "javascript",
        }
    }

    /// Only four families get full structural extraction in this version;
    /// everything else is indexed lexically only.
    pub fn for_extension(ext: &str) -> Option<Self> {
        match ext {
            "rs" => Some(LanguageFamily::Rust),
            "ts" | "tsx" => Some(LanguageFamily::TypeScript),
            "py" | "pyi" => Some(LanguageFamily::Python),
            "js" | "jsx" | "mjs" | "cjs" => Some(LanguageFamily::JavaScript),
            _ => None,
        }
    }
}

/// A definition extracted from source, not yet assigned a stable `def_uid`
/// (that's computed once the caller knows this unit's `unit_id` and the
/// sibling disambiguator).
#[derive(Debug, Clone)]
pub struct DraftDef {
    pub kind: String,
    pub simple_name: String,
    pub lexical_path: String,
    pub signature_text: String,
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
    pub parent: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct DraftImport {
    pub imported_name: String,
    pub alias: Option<String>,
    pub source_literal: Option<String>,
    pub import_kind: String,
    pub line: u32,
}

/// A lexical scope, one per def with a body (§4.3 "every def with a body
/// introduces exactly one scope"). Indexed by position in `ParseOutcome::scopes`;
/// `parent` is the index of the enclosing scope, mirroring `DraftDef::parent`.
#[derive(Debug, Clone)]
pub struct DraftScope {
    pub kind: String,
    pub parent: Option<usize>,
}

/// A candidate reference to a name, not yet resolved to a `RefTier`. Tier
/// assignment happens at reindex time, once the caller can cross-check
/// against the unit's own defs and local binds.
#[derive(Debug, Clone)]
pub struct DraftRef {
    pub token_text: String,
    pub line: u32,
    pub col: u32,
    pub scope: Option<usize>,
    pub role: RefRole,
    /// Set for member-access name positions (`field_identifier` and
    /// friends), which still need grouping into an anchor group when they
    /// fail to resolve to a def or local bind.
    pub is_member_access: bool,
}

#[derive(Debug, Clone)]
pub struct DraftLocalBind {
    pub scope: usize,
    pub name: String,
    pub reason_code: ReasonCode,
}

#[derive(Debug, Clone)]
pub struct DraftExportEntry {
    pub exported_name: String,
    pub certainty: Certainty,
    pub evidence_kind: String,
}

#[derive(Debug, Clone)]
pub struct DraftDynamicAccessSite {
    pub pattern: String,
    pub literal: Option<String>,
    pub line: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub defs: Vec<DraftDef>,
    pub imports: Vec<DraftImport>,
    pub scopes: Vec<DraftScope>,
    pub refs: Vec<DraftRef>,
    pub local_binds: Vec<DraftLocalBind>,
    pub exports: Vec<DraftExportEntry>,
    pub dynamic_access: Vec<DraftDynamicAccessSite>,
}

/// Parse `content` for `family`. Returns `None` on a grammar/parse failure
/// (missing grammar feature, tree-sitter returning no tree) — callers must
/// treat that as "skip this file," never as a reason to abort the pass.
pub fn parse_file(content: &str, family: LanguageFamily) -> Option<ParseOutcome> {
    #[cfg(feature = "treesitter")]
    {
        families::parse_with_treesitter(content, family)
    }
    #[cfg(not(feature = "treesitter"))]
    {
        let _ = (content, family);
        None
    }
}

/// Finalize a single draft def into a `DefFact`, computing its `def_uid`
/// with the sibling-index disambiguator described in §4.3's identity
/// invariant ("reordering sibling definitions of identical signature is
/// disambiguated by stable sibling index").
pub fn finalize_def(draft: &DraftDef, unit_id: UnitId, disambiguator: u32) -> DefFact {
    let sig_hash = signature_hash(&draft.signature_text);
    let def_uid = crate::ids::compute_def_uid(unit_id, &draft.kind, &draft.lexical_path, &sig_hash, disambiguator);
    DefFact {
        def_uid,
        unit_id,
        kind: draft.kind.clone(),
        simple_name: draft.simple_name.clone(),
        qualified_name: draft.lexical_path.clone(),
        lexical_path: draft.lexical_path.clone(),
        signature_hash: sig_hash,
        start_line: draft.start_line,
        start_col: draft.start_col,
        end_line: draft.end_line,
        end_col: draft.end_col,
        display_name: draft.signature_text.clone(),
        disambiguator,
    }
}

pub fn finalize_import(draft: &DraftImport, unit_id: UnitId) -> ImportFact {
    ImportFact {
        import_id: 0,
        unit_id,
        imported_name: draft.imported_name.clone(),
        alias: draft.alias.clone(),
        source_literal: draft.source_literal.clone(),
        import_kind: draft.import_kind.clone(),
        line: draft.line,
    }
}

/// Decide a reference's tier from what's already known about its enclosing
/// unit: a name bound locally in its own scope resolves `PROVEN` (no def_uid,
/// since locals aren't defs); a name matching some def in the same unit
/// resolves `STRONG`; anything else is `UNKNOWN` (§4.3's tier ladder, the
/// cross-file/cross-context tiers are out of scope for a single-unit parse).
pub fn resolve_ref_tier(token: &str, local_names_in_scope: &[&str], defs_by_name: &std::collections::HashMap<&str, &DefFact>) -> (RefTier, Option<DefUid>) {
    if local_names_in_scope.contains(&token) {
        (RefTier::Proven, None)
    } else if let Some(def) = defs_by_name.get(token) {
        (RefTier::Strong, Some(def.def_uid.clone()))
    } else {
        (RefTier::Unknown, None)
    }
}

pub fn finalize_ref(draft: &DraftRef, unit_id: UnitId, file_id: FileId, scope_id: Option<ScopeId>, tier: RefTier, target_def_uid: Option<DefUid>) -> RefFact {
    RefFact { ref_id: 0, unit_id, file_id, token_text: draft.token_text.clone(), line: draft.line, col: draft.col, enclosing_scope_id: scope_id, role: draft.role, tier, target_def_uid }
}

pub fn finalize_local_bind(draft: &DraftLocalBind, scope_id: ScopeId) -> LocalBindFact {
    LocalBindFact { scope_id, name: draft.name.clone(), target_kind: TargetKind::Unknown, target_uid: None, certainty: Certainty::Certain, reason_code: draft.reason_code }
}

pub fn finalize_export(draft: &DraftExportEntry, defs_by_name: &std::collections::HashMap<&str, &DefFact>) -> ExportEntry {
    ExportEntry {
        exported_name: draft.exported_name.clone(),
        def_uid: defs_by_name.get(draft.exported_name.as_str()).map(|d| d.def_uid.clone()),
        certainty: draft.certainty,
        evidence_kind: draft.evidence_kind.clone(),
    }
}

pub fn finalize_dynamic_access(draft: &DraftDynamicAccessSite, unit_id: UnitId) -> DynamicAccessSite {
    DynamicAccessSite { unit_id, pattern: draft.pattern.clone(), literal: draft.literal.clone(), line: draft.line }
}

/// Deterministic surface hash over the sorted set of exported names, so
/// export-surface equality can be compared without re-walking every entry.
pub fn export_surface_hash(exports: &[DraftExportEntry]) -> String {
    let mut names: Vec<&str> = exports.iter().map(|e| e.exported_name.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    crate::ids::content_hash(names.join("\u{1}").as_bytes())
}

/// Assign disambiguators within one parse pass: defs sharing the same
/// `(kind, lexical_path, signature_hash)` triple get 0, 1, 2... in the
/// stable order they were extracted (source order).
pub fn assign_disambiguators(defs: &[DraftDef]) -> Vec<u32> {
    use std::collections::HashMap;
    let mut seen: HashMap<(String, String, String), u32> = HashMap::new();
    defs.iter()
        .map(|d| {
            let sig = signature_hash(&d.signature_text);
            let key = (d.kind.clone(), d.lexical_path.clone(), sig);
            let counter = seen.entry(key).or_insert(0);
            let value = *counter;
            *counter += 1;
            value
        })
        .collect()
}

#[cfg(not(feature = "treesitter"))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_extension_recognizes_kept_families() {
        assert_eq!(LanguageFamily::for_extension("rs"), Some(LanguageFamily::Rust));
        assert_eq!(LanguageFamily::for_extension("go"), None);
    }

    #[test]
    fn disambiguators_increment_within_identical_siblings() {
        let d = DraftDef {
            kind: "function".into(), simple_name: "f".into(), lexical_path: "f".into(),
            signature_text: "fn f()".into(), start_line: 1, start_col: 0, end_line: 1, end_col: 0, parent: None,
        };
        let defs = vec![d.clone(), d];
        assert_eq!(assign_disambiguators(&defs), vec![0, 1]);
    }
}
