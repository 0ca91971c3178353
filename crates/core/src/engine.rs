//! `Engine`: composes every component behind the canonical operation table
//! of §6. One instance per repository; the CLI (and, eventually, a real
//! dispatcher) holds one `Arc<Engine>` and routes `{op, params}` envelopes
//! into `Engine::dispatch`.
//!
//! Grounded in the teacher's `main.rs` composition root (one `scan_repo`
//! call building every index the CLI subcommands then query) generalized
//! from "build once at startup" to "reconcile, reindex, and republish an
//! epoch on demand," since this crate's freshness model requires it.

use std::sync::{Arc, Mutex, RwLock};

use serde_json::{json, Value};

use crate::config::{Config, ProcessLock};
use crate::context_router::{ContextRouter, ProbeStatus};
use crate::epoch::EpochPublisher;
use crate::error::{CoreError, CoreResult};
use crate::ids::{DefUid, FileId, UnitId};
use crate::impact;
use crate::lexical::LexicalIndex;
use crate::mutation::{FileEdit, MutationAction, MutationEngine, SpanReplacement};
use crate::parser::{self, LanguageFamily};
use crate::reconciler::{FileChange, Reconciler};
use crate::refactor::{Anchor, Candidate, Plan, PlanStatus, RefactorPlanner};
use crate::semantic_diff;
use crate::structural::facts::RefTier;
use crate::structural::StructuralStore;

pub struct Engine {
    config: Config,
    reconciler: Reconciler,
    lexical: Mutex<LexicalIndex>,
    structural: Arc<StructuralStore>,
    epochs: Arc<EpochPublisher>,
    context_router: RwLock<ContextRouter>,
    mutation_engine: MutationEngine,
    planner: RefactorPlanner,
    /// Held for the engine's lifetime; never read again, only dropped.
    _lock: ProcessLock,
}

impl Engine {
    pub fn open(config: Config) -> CoreResult<Self> {
        config.ensure_state_dir()?;
        let lock = config.acquire_lock()?;
        let structural = Arc::new(StructuralStore::open(&config.structural_db_path())?);
        let epochs = Arc::new(EpochPublisher::new());
        let context_router = ContextRouter::discover(&config)?;
        let planner = RefactorPlanner::new(Arc::clone(&structural), Arc::clone(&epochs));

        Ok(Self {
            reconciler: Reconciler::new(config.clone()),
            lexical: Mutex::new(LexicalIndex::new()),
            structural,
            epochs,
            context_router: RwLock::new(context_router),
            mutation_engine: MutationEngine::new(),
            planner,
            config,
            _lock: lock,
        })
    }

    /// Run one full reconcile → reindex → publish pass (`reconcile` op).
    pub fn reconcile(&self) -> CoreResult<Value> {
        let result = self.reconciler.reconcile()?;
        let mut touched = Vec::new();

        for change in &result.changed_files {
            match change {
                FileChange::Created { file_id, path } | FileChange::Modified { file_id, path } => {
                    self.epochs.mark_dirty(*file_id);
                    self.reindex_file(*file_id, path)?;
                    touched.push(*file_id);
                }
                FileChange::Renamed { file_id, to, .. } => {
                    self.epochs.mark_dirty(*file_id);
                    self.reindex_file(*file_id, to)?;
                    touched.push(*file_id);
                }
                FileChange::Deleted { file_id, .. } => {
                    self.lexical.lock().unwrap().remove_file(*file_id);
                    self.structural.clear_file(*file_id)?;
                    touched.push(*file_id);
                }
            }
        }

        let epoch_after = self.epochs.publish(&touched);

        {
            let mut router = self.context_router.write().unwrap();
            let known_paths = self.reconciler.known_paths();
            router.run_initial_probe(|ctx| {
                known_paths
                    .iter()
                    .filter(|p| ctx.matches(p))
                    .map(|p| {
                        let parses_cleanly = std::fs::read_to_string(self.config.root.join(p))
                            .ok()
                            .map(|content| parser::parse_file(&content, ctx.language_family).is_some())
                            .unwrap_or(false);
                        (p.clone(), parses_cleanly)
                    })
                    .collect()
            });
        }

        Ok(json!({
            "changed_files": result.change_count(),
            "renamed": result.renamed,
            "epoch_after": epoch_after,
        }))
    }

    fn reindex_file(&self, file_id: FileId, path: &str) -> CoreResult<()> {
        let abs = self.config.root.join(path);
        let Ok(bytes) = std::fs::read(&abs) else { return Ok(()) };
        let Ok(content) = String::from_utf8(bytes) else { return Ok(()) };

        self.lexical.lock().unwrap().index_file(file_id, path, &content);

        self.structural.clear_file(file_id)?;
        let epoch = self.epochs.current_epoch();
        let family = path.rsplit_once('.').and_then(|(_, ext)| LanguageFamily::for_extension(ext));
        let Some(family) = family else { return Ok(()) };

        self.structural.upsert_file(file_id, path, &crate::ids::content_hash(content.as_bytes()), family.as_str(), epoch)?;
        let unit_id = self.structural.insert_unit(file_id, family.as_str())?;

        let Some(outcome) = parser::parse_file(&content, family) else { return Ok(()) };

        let disambiguators = parser::assign_disambiguators(&outcome.defs);
        let mut defs = Vec::with_capacity(outcome.defs.len());
        for (draft, disambiguator) in outcome.defs.iter().zip(disambiguators) {
            let def = parser::finalize_def(draft, unit_id, disambiguator);
            self.structural.insert_def(&def, epoch)?;
            defs.push(def);
        }
        let defs_by_name: std::collections::HashMap<&str, &crate::structural::facts::DefFact> =
            defs.iter().map(|d| (d.simple_name.as_str(), d)).collect();

        for draft in &outcome.imports {
            let import = parser::finalize_import(draft, unit_id);
            self.structural.insert_import(&import, epoch)?;
        }

        // Scopes are inserted in `outcome.scopes` order, which is the same
        // parent-before-child order `outcome.defs` was discovered in, so a
        // draft's parent scope is always already resolved by the time its
        // own row is inserted.
        let mut scope_ids: Vec<Option<crate::ids::ScopeId>> = Vec::with_capacity(outcome.scopes.len());
        for scope in &outcome.scopes {
            let parent = scope.parent.and_then(|p| scope_ids.get(p).copied().flatten());
            scope_ids.push(Some(self.structural.insert_scope(unit_id, parent, &scope.kind)?));
        }

        for bind in &outcome.local_binds {
            let Some(scope_id) = scope_ids.get(bind.scope).copied().flatten() else { continue };
            let fact = parser::finalize_local_bind(bind, scope_id);
            self.structural.insert_local_bind(&fact)?;
        }

        for r in &outcome.refs {
            let scope_id = r.scope.and_then(|idx| scope_ids.get(idx).copied().flatten());
            let local_names: Vec<&str> = r
                .scope
                .map(|idx| outcome.local_binds.iter().filter(|b| b.scope == idx).map(|b| b.name.as_str()).collect())
                .unwrap_or_default();
            let (tier, target_def_uid) = parser::resolve_ref_tier(&r.token_text, &local_names, &defs_by_name);
            let fact = parser::finalize_ref(r, unit_id, file_id, scope_id, tier, target_def_uid);
            self.structural.insert_ref(&fact, epoch)?;

            // A member-access name that never resolved to a def or local
            // bind is a candidate ANCHORED reference: group it by member
            // name so a rename can later be offered as a bulk decision
            // rather than silently dropped (§4.8 "ANCHORED tier").
            if r.is_member_access && tier == RefTier::Unknown {
                self.structural.record_anchor_member(unit_id, &r.token_text, "unknown", path, r.line, r.col, self.config.anchor_group_cap)?;
            }
        }

        if !outcome.exports.is_empty() {
            let surface_hash = parser::export_surface_hash(&outcome.exports);
            self.structural.set_export_surface(unit_id, &surface_hash, epoch)?;
            for draft in &outcome.exports {
                let entry = parser::finalize_export(draft, &defs_by_name);
                self.structural.insert_export_entry(unit_id, &entry)?;
            }
        }

        for site in &outcome.dynamic_access {
            let fact = parser::finalize_dynamic_access(site, unit_id);
            self.structural.insert_dynamic_access_site(&fact)?;
        }

        Ok(())
    }

    pub fn lexical_search(&self, query: &str, limit: usize) -> CoreResult<Value> {
        let hits = self.lexical.lock().unwrap().search(query, limit)?;
        Ok(json!(hits))
    }

    pub fn get_def(&self, def_uid: &DefUid) -> CoreResult<Value> {
        Ok(json!(self.structural.get_def(def_uid)?))
    }

    pub fn list_refs(&self, def_uid: &DefUid, tier: Option<RefTier>, limit: usize) -> CoreResult<Value> {
        Ok(json!(self.structural.list_refs(def_uid, tier, limit)?))
    }

    pub fn list_imports(&self, unit_id: UnitId, limit: usize) -> CoreResult<Value> {
        Ok(json!(self.structural.list_imports(unit_id, limit)?))
    }

    pub fn export_entries(&self, unit_id: UnitId, limit: usize) -> CoreResult<Value> {
        Ok(json!(self.structural.export_entries(unit_id, limit)?))
    }

    pub fn anchor_group(&self, unit_id: UnitId, member_token: &str, receiver_shape: &str) -> CoreResult<Value> {
        Ok(json!(self.structural.anchor_group(unit_id, member_token, receiver_shape)?))
    }

    pub fn dynamic_access_sites(&self, unit_id: UnitId, limit: usize) -> CoreResult<Value> {
        Ok(json!(self.structural.dynamic_access_sites(unit_id, limit)?))
    }

    /// Which context (if any) a given path currently resolves to, for
    /// callers that want to know before planning anything against it.
    pub fn resolve_context(&self, path: &str) -> CoreResult<Value> {
        let Some(family) = path.rsplit_once('.').and_then(|(_, ext)| LanguageFamily::for_extension(ext)) else {
            return Ok(json!(null));
        };
        let router = self.context_router.read().unwrap();
        let context = router.get_context(path, family)?;
        Ok(match context {
            Some(ctx) => json!({"context_id": ctx.id, "root_path": ctx.root_path, "language_family": format!("{family:?}")}),
            None => json!(null),
        })
    }

    /// Look up the `FileId` the reconciler tracks for a given relative path,
    /// so callers planning a move/delete don't need reconciler internals.
    pub fn file_id_for_path(&self, path: &str) -> Option<FileId> {
        self.reconciler.file_id_for(path)
    }

    /// Resolve the file a def lives in via the Structural Tier, so the
    /// divergence check and the documentation sweep below both have a real
    /// path and language family to work from instead of trusting the caller.
    fn locate_def_file(&self, def_uid: &DefUid) -> CoreResult<Option<(String, LanguageFamily)>> {
        let Some(def) = self.structural.get_def(def_uid)? else { return Ok(None) };
        let Some(file_id) = self.structural.file_id_for_unit(def.unit_id)? else { return Ok(None) };
        let Some(path) = self.reconciler.path_for(file_id) else { return Ok(None) };
        let family = path.rsplit_once('.').and_then(|(_, ext)| LanguageFamily::for_extension(ext));
        Ok(family.map(|f| (path, f)))
    }

    /// A file claimed by more than one `Valid` context of the same language
    /// family is ambiguous: which context's view of "every reference" is
    /// authoritative? Per §9 open question 5, an unconfigured primary means
    /// this always fails closed rather than guessing.
    fn check_multi_context_divergence(&self, path: &str, family: LanguageFamily) -> CoreResult<()> {
        let router = self.context_router.read().unwrap();
        let matches: Vec<&str> = router
            .contexts()
            .iter()
            .filter(|c| c.language_family == family && c.probe_status == ProbeStatus::Valid && c.matches(path))
            .map(|c| c.root_path.as_str())
            .collect();
        if matches.len() <= 1 {
            return Ok(());
        }
        if let Some(primary) = &self.config.multi_context_divergence_primary {
            if matches.iter().any(|root| root == primary) {
                return Ok(());
            }
        }
        Err(CoreError::Divergence { path: path.to_string(), contexts: matches.into_iter().map(str::to_string).collect() })
    }

    /// Best-effort scan for mentions of `symbol` outside code that a
    /// structural rename's edits won't reach — comment lines and prose
    /// files. Declarative line-oriented matching, same posture as the
    /// parser's own import/export extraction.
    fn scan_for_doc_references(&self, symbol: &str) -> bool {
        let Ok(word_re) = regex::Regex::new(&format!(r"\b{}\b", regex::escape(symbol))) else { return false };
        for path in self.reconciler.known_paths() {
            let Ok(content) = std::fs::read_to_string(self.config.root.join(&path)) else { continue };
            let is_prose = path.ends_with(".md") || path.ends_with(".rst") || path.ends_with(".txt");
            if is_prose {
                if word_re.is_match(&content) {
                    return true;
                }
                continue;
            }
            for line in content.lines() {
                let trimmed = line.trim_start();
                let is_comment = trimmed.starts_with("//") || trimmed.starts_with('#') || trimmed.starts_with("/*") || trimmed.starts_with('*');
                if is_comment && word_re.is_match(line) {
                    return true;
                }
            }
        }
        false
    }

    pub fn plan_rename_symbol(&self, def_uid: &DefUid, new_name: &str) -> CoreResult<Plan> {
        if let Some((path, family)) = self.locate_def_file(def_uid)? {
            self.check_multi_context_divergence(&path, family)?;
        }

        let mut plan = self.planner.plan_rename_symbol(def_uid, new_name)?;

        if !plan.candidates.is_empty() {
            if let Some(def) = self.structural.get_def(def_uid)? {
                if self.scan_for_doc_references(&def.simple_name) {
                    for candidate in &mut plan.candidates {
                        candidate.review_recommended = true;
                    }
                }
            }
        }
        Ok(plan)
    }

    pub fn plan_move_file(&self, file_id: FileId, old_path: &str, new_path: &str) -> CoreResult<Plan> {
        self.planner.plan_move_file(file_id, old_path, new_path)
    }

    pub fn plan_delete_symbol(&self, def_uid: &DefUid) -> CoreResult<Plan> {
        self.planner.plan_delete_symbol(def_uid)
    }

    pub fn commit_decision(&self, plan_id: &str, selected_candidate_id: &str, proofs: &[Anchor]) -> CoreResult<Value> {
        let outcome = self.planner.commit_decision(plan_id, selected_candidate_id, proofs)?;
        match outcome {
            crate::refactor::CommitOutcome::Applied(_) => self.apply_committed_candidate(plan_id, selected_candidate_id),
            crate::refactor::CommitOutcome::NeedsDecision(plan) => Ok(json!({"status": "needs_decision", "plan_id": plan.plan_id})),
            crate::refactor::CommitOutcome::Blocked(plan) => {
                Ok(json!({"status": "blocked", "suggested_refresh_scope": plan.suggested_refresh_scope}))
            }
        }
    }

    /// Resolve the selected candidate's occurrences to real paths via the
    /// Reconciler and run them through the Mutation Engine, so the rename's
    /// bytes actually land on disk under the same atomicity guarantees as
    /// any other mutation batch.
    fn apply_committed_candidate(&self, plan_id: &str, candidate_id: &str) -> CoreResult<Value> {
        let plan = self.planner.get_plan(plan_id).ok_or_else(|| crate::error::CoreError::PlanExpired { plan_id: plan_id.to_string() })?;
        let Some(candidate) = plan.candidates.iter().find(|c| c.candidate_id == candidate_id) else {
            return Err(crate::error::CoreError::PlanExpired { plan_id: plan_id.to_string() });
        };

        let edits = candidate_to_edits(&self.reconciler, candidate);
        let delta = self.apply_mutation(edits, false, format!("commit-{plan_id}"))?;
        Ok(json!({"status": "applied", "plan_id": plan_id, "delta": delta}))
    }

    pub fn apply_mutation(&self, edits: Vec<FileEdit>, dry_run: bool, mutation_id: String) -> CoreResult<Value> {
        let delta = self.mutation_engine.apply_batch(&self.config, &edits, dry_run, mutation_id)?;
        if !dry_run {
            let touched: Vec<FileId> = edits
                .iter()
                .filter_map(|e| self.reconciler.file_id_for(&e.path))
                .collect();
            for (file_id, edit) in touched.iter().zip(&edits) {
                if !matches!(edit.action, MutationAction::Delete) {
                    let _ = self.reindex_file(*file_id, &edit.path);
                }
            }
            self.epochs.publish(&touched);
        }
        Ok(json!(delta))
    }

    pub fn semantic_diff(&self, before_epoch: i64, after_epoch: i64, limit: usize) -> CoreResult<Value> {
        let changes = semantic_diff::diff_epochs(&self.structural, before_epoch, after_epoch, limit)?;
        Ok(json!(changes.iter().map(describe_change).collect::<Vec<_>>()))
    }

    pub fn affected_tests(&self, changed_files: &[String], test_units: &[UnitId], limit: usize) -> CoreResult<Value> {
        let result = impact::affected_tests(&self.structural, changed_files, |u| test_units.contains(&u), limit)?;
        Ok(json!({
            "matches": result.affected_tests.iter().map(|a| json!({
                "test_unit_id": a.test_unit_id.0,
                "module": a.module,
                "confidence": format!("{:?}", a.confidence),
            })).collect::<Vec<_>>(),
            "confidence": format!("{:?}", result.tier_confidence),
            "unresolved_files": result.unresolved_modules,
        }))
    }
}

fn describe_change(change: &semantic_diff::DefChange) -> Value {
    json!({
        "kind": format!("{:?}", change.kind),
        "before": change.before,
        "after": change.after,
        "delta_tags": change.delta_tags,
        "references_by_tier": change.references_by_tier,
        "importing_files": change.importing_files,
    })
}

/// Build a single-hunk rename candidate into an applyable `FileEdit` batch,
/// resolving each occurrence's file path via the Reconciler — used by
/// callers that already hold a `Plan` from `plan_rename_symbol`.
pub fn candidate_to_edits(reconciler: &Reconciler, candidate: &Candidate) -> Vec<FileEdit> {
    if candidate.occurrences.is_empty() {
        // File-path candidates (rename/move) already carry a concrete path
        // per edit; there's no file_id to resolve through the Reconciler.
        return candidate.edits.clone();
    }
    candidate
        .edits
        .iter()
        .zip(&candidate.occurrences)
        .filter_map(|(edit, (file_id, _line))| {
            let path = reconciler.path_for(*file_id)?;
            let span = edit.span.clone().map(|s: SpanReplacement| s);
            Some(FileEdit { path, action: MutationAction::Update, new_content: None, span, expected_file_sha256: None })
        })
        .collect()
}

pub fn plan_is_ready(plan: &Plan) -> bool {
    plan.status == PlanStatus::Ready
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_indexes_new_files_for_search() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.rs"), "fn needle() {}\n").unwrap();
        let cfg = Config::load(tmp.path());
        let engine = Engine::open(cfg).unwrap();

        let result = engine.reconcile().unwrap();
        assert_eq!(result["changed_files"], 1);

        let hits = engine.lexical_search("needle", 10).unwrap();
        assert_eq!(hits.as_array().unwrap().len(), 1);
    }

    #[test]
    fn reconcile_is_idempotent_across_calls() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.py"), "x = 1\n").unwrap();
        let cfg = Config::load(tmp.path());
        let engine = Engine::open(cfg).unwrap();

        engine.reconcile().unwrap();
        let second = engine.reconcile().unwrap();
        assert_eq!(second["changed_files"], 0);
    }

    #[test]
    fn reconcile_populates_structural_facts_beyond_defs_and_imports() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("lib.rs"), "pub fn add(x: i32, y: i32) -> i32 {\n    x + y\n}\n").unwrap();
        let cfg = Config::load(tmp.path());
        let engine = Engine::open(cfg).unwrap();
        engine.reconcile().unwrap();

        let unit_id = UnitId(1);
        let exports = engine.export_entries(unit_id, 10).unwrap();
        assert_eq!(exports.as_array().unwrap().len(), 1);
        assert_eq!(exports[0]["exported_name"], "add");
    }

    #[test]
    fn apply_mutation_creates_and_reindexes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::load(tmp.path());
        let engine = Engine::open(cfg).unwrap();
        engine.reconcile().unwrap();

        let edit = FileEdit { path: "b.rs".into(), action: MutationAction::Create, new_content: Some("fn alpha() {}\n".into()), span: None, expected_file_sha256: None };
        engine.apply_mutation(vec![edit], false, "m1".into()).unwrap();

        engine.reconcile().unwrap();
        let hits = engine.lexical_search("alpha", 10).unwrap();
        assert_eq!(hits.as_array().unwrap().len(), 1);
    }
}
