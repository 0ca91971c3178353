//! Impact/Test Selection: derives module identifiers from changed files and
//! finds which known test files import them (§4.10). Grounded directly in
//! `StructuralStore::find_importers_of`'s exact/prefix/child match; this
//! module only adds the module-identifier derivation and the
//! complete/partial tier-confidence rollup around that query. The engine
//! never auto-broadens selection — callers decide what to do with a
//! `partial` result.

use std::collections::BTreeSet;

use crate::error::CoreResult;
use crate::structural::StructuralStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchConfidence {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierConfidence {
    Complete,
    Partial,
}

#[derive(Debug, Clone)]
pub struct AffectedTest {
    pub test_unit_id: crate::ids::UnitId,
    pub module: String,
    pub confidence: MatchConfidence,
}

#[derive(Debug, Clone)]
pub struct ImpactResult {
    pub affected_tests: Vec<AffectedTest>,
    pub tier_confidence: TierConfidence,
    pub unresolved_modules: Vec<String>,
}

/// Turn a repo-relative source path into the module identifier form used in
/// `import_fact.source_literal` (dotted/slashed lexical path, extension
/// stripped). Non-goal: no build-system-aware module resolution (workspace
/// aliases, path remapping) — purely textual.
pub fn module_identifier(path: &str) -> String {
    let without_ext = path.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(path);
    without_ext.trim_start_matches("src/").to_string()
}

/// Find affected tests for a set of changed files. Scoping to "known test
/// files" is the caller's responsibility (it passes a test-file filter);
/// this function itself only classifies confidence and resolves modules.
pub fn affected_tests(
    store: &StructuralStore,
    changed_files: &[String],
    is_test_unit: impl Fn(crate::ids::UnitId) -> bool,
    limit: usize,
) -> CoreResult<ImpactResult> {
    let mut affected = Vec::new();
    let mut unresolved = Vec::new();
    let mut any_null_source_literal = false;

    for path in changed_files {
        let module = module_identifier(path);
        let importers = store.find_importers_of(&module, limit)?;
        if importers.is_empty() {
            unresolved.push(module.clone());
            continue;
        }
        for imp in &importers {
            if !is_test_unit(imp.unit_id) {
                continue;
            }
            let Some(source_literal) = &imp.source_literal else {
                any_null_source_literal = true;
                continue;
            };
            let confidence = if source_literal == &module { MatchConfidence::High } else { MatchConfidence::Low };
            affected.push(AffectedTest { test_unit_id: imp.unit_id, module: module.clone(), confidence });
        }
    }

    let mut seen = BTreeSet::new();
    affected.retain(|a| seen.insert((a.test_unit_id.0, a.module.clone())));

    let tier_confidence = if unresolved.is_empty() && !any_null_source_literal { TierConfidence::Complete } else { TierConfidence::Partial };

    Ok(ImpactResult { affected_tests: affected, tier_confidence, unresolved_modules: unresolved })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{FileId, UnitId};
    use crate::structural::facts::ImportFact;

    #[test]
    fn module_identifier_strips_src_prefix_and_extension() {
        assert_eq!(module_identifier("src/util/helper.rs"), "util/helper");
        assert_eq!(module_identifier("lib.py"), "lib");
    }

    #[test]
    fn exact_importer_is_high_confidence() {
        let store = StructuralStore::open_in_memory().unwrap();
        store.upsert_file(FileId(1), "tests/a_test.rs", "h1", "rust", 1).unwrap();
        let test_unit = store.insert_unit(FileId(1), "rust").unwrap();
        store.insert_import(&ImportFact { import_id: 0, unit_id: test_unit, imported_name: "helper".into(), alias: None, source_literal: Some("util/helper".into()), import_kind: "use".into(), line: 1 }, 1).unwrap();

        let result = affected_tests(&store, &["src/util/helper.rs".to_string()], |u| u == test_unit, 10).unwrap();
        assert_eq!(result.affected_tests.len(), 1);
        assert_eq!(result.affected_tests[0].confidence, MatchConfidence::High);
        assert_eq!(result.tier_confidence, TierConfidence::Complete);
    }

    #[test]
    fn unresolved_module_yields_partial_confidence() {
        let store = StructuralStore::open_in_memory().unwrap();
        let result = affected_tests(&store, &["src/nowhere.rs".to_string()], |_| false, 10).unwrap();
        assert!(result.affected_tests.is_empty());
        assert_eq!(result.tier_confidence, TierConfidence::Partial);
        assert_eq!(result.unresolved_modules, vec!["nowhere".to_string()]);
    }

    #[test]
    fn never_broadens_beyond_returned_importers() {
        let store = StructuralStore::open_in_memory().unwrap();
        store.upsert_file(FileId(1), "tests/a_test.rs", "h1", "rust", 1).unwrap();
        let test_unit = store.insert_unit(FileId(1), "rust").unwrap();
        store.insert_import(&ImportFact { import_id: 0, unit_id: test_unit, imported_name: "helper".into(), alias: None, source_literal: Some("util/helper/sub".into()), import_kind: "use".into(), line: 1 }, 1).unwrap();

        let result = affected_tests(&store, &["src/util/helper.rs".to_string()], |u| u == test_unit, 10).unwrap();
        assert_eq!(result.affected_tests.len(), 1);
        assert_eq!(result.affected_tests[0].confidence, MatchConfidence::Low);
    }
}
