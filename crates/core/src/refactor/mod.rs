//! Refactor Planner: `rename_symbol`, `rename_file`, `move_file`,
//! `delete_symbol`, each preview-first via a two-phase plan/commit flow
//! with decision capsules, witness packets, and anchor re-validation
//! (§4.8). Grounded in the Mutation Engine's edit-batch shape (a plan's
//! candidate *is* a would-be `Vec<FileEdit>`) and the Structural Tier's
//! `RefFact` tiers for distinguishing the simple path from `needs_decision`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::epoch::EpochPublisher;
use crate::error::{CoreError, CoreResult};
use crate::ids::{DefUid, FileId};
use crate::mutation::{FileEdit, MutationAction};
use crate::structural::facts::{RefFact, RefTier};
use crate::structural::StructuralStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStatus {
    Ready,
    NeedsDecision,
    Blocked,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub candidate_id: String,
    pub description: String,
    pub confidence: f64,
    pub provenance: &'static str,
    pub edits: Vec<FileEdit>,
    pub occurrences: Vec<(FileId, u32)>,
    /// Set when a documentation sweep found the old name mentioned outside
    /// code (comments, markdown) that this candidate's edits won't touch
    /// (§4.8 "review_recommended"). The planner never sets this itself — it
    /// has no text-search capability — callers that do run the sweep tag it
    /// in after the fact.
    pub review_recommended: bool,
}

#[derive(Debug, Clone)]
pub struct WitnessPacket {
    pub search_bounds: String,
    pub facts_observed: Vec<String>,
    pub failed_invariants: Vec<String>,
    pub disambiguation_checklist: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DecisionCapsule {
    pub kind: &'static str,
    pub question: String,
    pub stop_rule: &'static str,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub plan_id: String,
    pub status: PlanStatus,
    pub candidates: Vec<Candidate>,
    pub witness: Option<WitnessPacket>,
    pub capsules: Vec<DecisionCapsule>,
    pub suggested_refresh_scope: Vec<FileId>,
    pub expires_at_ms: u64,
    pub affected_files: Vec<FileId>,
}

/// An anchor the client must reaffirm at commit time: the line immediately
/// before and after the edit, plus the file's pre-edit content hash.
#[derive(Debug, Clone)]
pub struct Anchor {
    pub file_path: String,
    pub anchor_before: String,
    pub anchor_after: String,
    pub content_hash: String,
}

#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Applied(crate::mutation::MutationDelta),
    NeedsDecision(Plan),
    Blocked(Plan),
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

pub struct RefactorPlanner {
    store: Arc<StructuralStore>,
    epochs: Arc<EpochPublisher>,
    plans: std::sync::Mutex<HashMap<String, Plan>>,
    plan_ttl: Duration,
    next_plan_id: std::sync::atomic::AtomicU64,
}

impl RefactorPlanner {
    pub fn new(store: Arc<StructuralStore>, epochs: Arc<EpochPublisher>) -> Self {
        Self { store, epochs, plans: std::sync::Mutex::new(HashMap::new()), plan_ttl: Duration::from_secs(300), next_plan_id: std::sync::atomic::AtomicU64::new(1) }
    }

    fn allocate_plan_id(&self) -> String {
        let n = self.next_plan_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        format!("plan-{n}")
    }

    /// Look up a previously issued plan, for callers (the engine) that need
    /// to resolve a selected candidate's edits after `commit_decision`
    /// reports `Applied`.
    pub fn get_plan(&self, plan_id: &str) -> Option<Plan> {
        self.plans.lock().unwrap().get(plan_id).cloned()
    }

    /// Rename every reference to `def_uid` to `new_name`. Takes the simple
    /// path (a single `ready` candidate) when every reference resolves
    /// `PROVEN`; otherwise emits `needs_decision` with one candidate per
    /// distinct tier observed, plus a witness packet and capsules.
    pub fn plan_rename_symbol(&self, def_uid: &DefUid, new_name: &str) -> CoreResult<Plan> {
        let def = self.store.get_def(def_uid)?;
        let Some(def) = def else {
            return Err(CoreError::InsufficientContext { symbol: def_uid.0.clone() });
        };

        let refs = self.store.list_refs(def_uid, None, 100)?;
        let affected_files: Vec<FileId> = {
            let mut files: Vec<FileId> = refs.iter().map(|r| r.file_id).collect();
            files.sort_by_key(|f| f.0);
            files.dedup();
            files
        };

        let not_clean = self.epochs.not_clean(&affected_files);
        if !not_clean.is_empty() {
            let plan = Plan {
                plan_id: self.allocate_plan_id(),
                status: PlanStatus::Blocked,
                candidates: vec![],
                witness: None,
                capsules: vec![],
                suggested_refresh_scope: not_clean,
                expires_at_ms: now_ms() + self.plan_ttl.as_millis() as u64,
                affected_files,
            };
            self.store_plan(plan.clone());
            return Ok(plan);
        }

        let all_proven = refs.iter().all(|r| r.tier == RefTier::Proven);

        if all_proven {
            let candidate = build_candidate("c0", "rename every PROVEN reference", 1.0, "semantic", &refs, &def.simple_name, new_name);
            let plan = Plan {
                plan_id: self.allocate_plan_id(),
                status: PlanStatus::Ready,
                candidates: vec![candidate],
                witness: None,
                capsules: vec![],
                suggested_refresh_scope: vec![],
                expires_at_ms: now_ms() + self.plan_ttl.as_millis() as u64,
                affected_files,
            };
            self.store_plan(plan.clone());
            return Ok(plan);
        }

        // Ambiguous path: one candidate per tier present among the references.
        let mut by_tier: HashMap<RefTier, Vec<RefFact>> = HashMap::new();
        for r in &refs {
            by_tier.entry(r.tier).or_default().push(r.clone());
        }
        let mut candidates = Vec::new();
        for (i, (tier, tier_refs)) in by_tier.iter().enumerate() {
            let confidence = match tier {
                RefTier::Proven => 0.95,
                RefTier::Strong => 0.75,
                RefTier::Anchored => 0.4,
                RefTier::Unknown => 0.1,
            };
            let provenance = if matches!(tier, RefTier::Proven | RefTier::Strong) { "semantic" } else { "syntactic" };
            candidates.push(build_candidate(&format!("c{i}"), &format!("rename {:?} tier references", tier), confidence, provenance, tier_refs, &def.simple_name, new_name));
        }

        let witness = WitnessPacket {
            search_bounds: format!("unit {:?}, {} references scanned", def.unit_id, refs.len()),
            facts_observed: refs.iter().map(|r| format!("{:?} ref at file {:?}:{}", r.tier, r.file_id, r.line)).collect(),
            failed_invariants: vec!["not all references resolve PROVEN".to_string()],
            disambiguation_checklist: vec!["confirm receiver type for ANCHORED matches".to_string()],
        };
        let capsules = vec![
            DecisionCapsule { kind: "scope_resolution", question: "Which scope owns the ambiguous reference?".into(), stop_rule: "first CERTAIN local bind".into() },
            DecisionCapsule { kind: "receiver_resolution", question: "What is the receiver's static type, if any?".into(), stop_rule: "first STRONG import chain".into() },
        ];

        let plan = Plan {
            plan_id: self.allocate_plan_id(),
            status: PlanStatus::NeedsDecision,
            candidates,
            witness: Some(witness),
            capsules,
            suggested_refresh_scope: vec![],
            expires_at_ms: now_ms() + self.plan_ttl.as_millis() as u64,
            affected_files,
        };
        self.store_plan(plan.clone());
        Ok(plan)
    }

    pub fn plan_rename_file(&self, file_id: FileId, old_path: &str, new_path: &str) -> CoreResult<Plan> {
        self.plan_path_change(file_id, old_path, new_path, "rename")
    }

    /// Relocate a tracked file to a new path — same mechanics as a rename,
    /// kept as a distinct entry point because callers reason about "rename"
    /// (same directory, new name) and "move" (new directory) differently
    /// even though the edit batch is identical.
    pub fn plan_move_file(&self, file_id: FileId, old_path: &str, new_path: &str) -> CoreResult<Plan> {
        self.plan_path_change(file_id, old_path, new_path, "move")
    }

    fn plan_path_change(&self, file_id: FileId, old_path: &str, new_path: &str, verb: &str) -> CoreResult<Plan> {
        let not_clean = self.epochs.not_clean(&[file_id]);
        if !not_clean.is_empty() {
            let plan = Plan {
                plan_id: self.allocate_plan_id(),
                status: PlanStatus::Blocked,
                candidates: vec![],
                witness: None,
                capsules: vec![],
                suggested_refresh_scope: not_clean,
                expires_at_ms: now_ms() + self.plan_ttl.as_millis() as u64,
                affected_files: vec![file_id],
            };
            self.store_plan(plan.clone());
            return Ok(plan);
        }
        let create = FileEdit { path: new_path.to_string(), action: MutationAction::Create, new_content: None, span: None, expected_file_sha256: None };
        let delete = FileEdit { path: old_path.to_string(), action: MutationAction::Delete, new_content: None, span: None, expected_file_sha256: None };
        let candidate = Candidate {
            candidate_id: "c0".into(),
            description: format!("{verb} {old_path} -> {new_path}"),
            confidence: 1.0,
            provenance: "syntactic",
            edits: vec![create, delete],
            occurrences: vec![],
            review_recommended: false,
        };
        let plan = Plan {
            plan_id: self.allocate_plan_id(),
            status: PlanStatus::Ready,
            candidates: vec![candidate],
            witness: None,
            capsules: vec![],
            suggested_refresh_scope: vec![],
            expires_at_ms: now_ms() + self.plan_ttl.as_millis() as u64,
            affected_files: vec![file_id],
        };
        self.store_plan(plan.clone());
        Ok(plan)
    }

    /// Delete a definition outright. Takes the simple path (single `ready`
    /// candidate deleting its span) only when it has no live references;
    /// any reference at all routes to `needs_decision`, since an automatic
    /// delete cannot also fix up callers (§4.8, same posture as the
    /// ambiguous-rename path).
    pub fn plan_delete_symbol(&self, def_uid: &DefUid) -> CoreResult<Plan> {
        let def = self.store.get_def(def_uid)?;
        let Some(def) = def else {
            return Err(CoreError::InsufficientContext { symbol: def_uid.0.clone() });
        };
        let file_id = self
            .store
            .file_id_for_unit(def.unit_id)?
            .ok_or_else(|| CoreError::InsufficientContext { symbol: def_uid.0.clone() })?;

        let not_clean = self.epochs.not_clean(&[file_id]);
        if !not_clean.is_empty() {
            let plan = Plan {
                plan_id: self.allocate_plan_id(),
                status: PlanStatus::Blocked,
                candidates: vec![],
                witness: None,
                capsules: vec![],
                suggested_refresh_scope: not_clean,
                expires_at_ms: now_ms() + self.plan_ttl.as_millis() as u64,
                affected_files: vec![file_id],
            };
            self.store_plan(plan.clone());
            return Ok(plan);
        }

        let refs = self.store.list_refs(def_uid, None, 100)?;
        let edit = FileEdit {
            path: String::new(),
            action: MutationAction::Update,
            new_content: None,
            span: Some(crate::mutation::SpanReplacement {
                start_line: def.start_line as usize,
                end_line: def.end_line as usize,
                expected_text: def.display_name.clone(),
                new_text: String::new(),
            }),
            expected_file_sha256: None,
        };
        let candidate = Candidate {
            candidate_id: "c0".into(),
            description: format!("delete {}", def.qualified_name),
            confidence: if refs.is_empty() { 1.0 } else { 0.3 },
            provenance: "syntactic",
            edits: vec![edit],
            occurrences: vec![(file_id, def.start_line)],
            review_recommended: false,
        };

        let (status, witness, capsules) = if refs.is_empty() {
            (PlanStatus::Ready, None, vec![])
        } else {
            let witness = WitnessPacket {
                search_bounds: format!("unit {:?}, {} references scanned", def.unit_id, refs.len()),
                facts_observed: refs.iter().map(|r| format!("{:?} ref at file {:?}:{}", r.tier, r.file_id, r.line)).collect(),
                failed_invariants: vec!["symbol still has live references".to_string()],
                disambiguation_checklist: vec!["confirm every caller has an alternative before deleting".to_string()],
            };
            let capsules = vec![DecisionCapsule { kind: "delete_with_live_refs", question: "Delete despite existing references?".into(), stop_rule: "explicit confirmation required".into() }];
            (PlanStatus::NeedsDecision, Some(witness), capsules)
        };

        let plan = Plan {
            plan_id: self.allocate_plan_id(),
            status,
            candidates: vec![candidate],
            witness,
            capsules,
            suggested_refresh_scope: vec![],
            expires_at_ms: now_ms() + self.plan_ttl.as_millis() as u64,
            affected_files: vec![file_id],
        };
        self.store_plan(plan.clone());
        Ok(plan)
    }

    fn store_plan(&self, plan: Plan) {
        self.plans.lock().unwrap().insert(plan.plan_id.clone(), plan);
    }

    /// Commit a previously planned rename. Re-validates the mutation gate in
    /// full (freshness + ambiguity), never trusting the proof alone — per
    /// §4.8, "anchor+hash verification alone is insufficient."
    pub fn commit_decision(&self, plan_id: &str, selected_candidate_id: &str, proofs: &[Anchor]) -> CoreResult<CommitOutcome> {
        let plan = {
            let plans = self.plans.lock().unwrap();
            plans.get(plan_id).cloned().ok_or_else(|| CoreError::PlanExpired { plan_id: plan_id.to_string() })?
        };

        if now_ms() > plan.expires_at_ms {
            return Err(CoreError::PlanExpired { plan_id: plan_id.to_string() });
        }

        let not_clean = self.epochs.not_clean(&plan.affected_files);
        if !not_clean.is_empty() {
            let mut blocked = plan.clone();
            blocked.status = PlanStatus::Blocked;
            blocked.suggested_refresh_scope = not_clean;
            return Ok(CommitOutcome::Blocked(blocked));
        }

        let candidate = plan
            .candidates
            .iter()
            .find(|c| c.candidate_id == selected_candidate_id)
            .ok_or_else(|| CoreError::PlanExpired { plan_id: plan_id.to_string() })?;

        if candidate.confidence < 0.5 && plan.candidates.len() > 1 {
            return Ok(CommitOutcome::NeedsDecision(plan));
        }

        for anchor in proofs {
            let edit = candidate.edits.iter().find(|e| e.path == anchor.file_path);
            if let Some(edit) = edit {
                if let Some(expected) = &edit.expected_file_sha256 {
                    if expected != &anchor.content_hash {
                        let mut needs_decision = plan.clone();
                        needs_decision.status = PlanStatus::NeedsDecision;
                        return Ok(CommitOutcome::NeedsDecision(needs_decision));
                    }
                }
            }
        }

        let delta = crate::mutation::MutationDelta {
            mutation_id: format!("mut-{plan_id}"),
            files: candidate
                .edits
                .iter()
                .map(|e| crate::mutation::EditDelta {
                    path: e.path.clone(),
                    action: match e.action {
                        MutationAction::Create => "CREATE".into(),
                        MutationAction::Update => "UPDATE".into(),
                        MutationAction::Delete => "DELETE".into(),
                    },
                    old_sha256: e.expected_file_sha256.clone(),
                    new_sha256: None,
                    line_ending: crate::mutation::LineEnding::Lf,
                    line_corrections: vec![],
                })
                .collect(),
        };
        Ok(CommitOutcome::Applied(delta))
    }
}

fn build_candidate(id: &str, description: &str, confidence: f64, provenance: &'static str, refs: &[RefFact], old_name: &str, new_name: &str) -> Candidate {
    let edits = refs
        .iter()
        .map(|r| FileEdit {
            path: String::new(),
            action: MutationAction::Update,
            new_content: None,
            span: Some(crate::mutation::SpanReplacement {
                start_line: r.line as usize,
                end_line: r.line as usize,
                expected_text: old_name.to_string(),
                new_text: new_name.to_string(),
            }),
            expected_file_sha256: None,
        })
        .collect();
    let occurrences = refs.iter().map(|r| (r.file_id, r.line)).collect();
    Candidate { candidate_id: id.to_string(), description: description.to_string(), confidence, provenance, edits, occurrences, review_recommended: false }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UnitId;
    use crate::structural::facts::{DefFact, RefRole};

    fn def(uid: &str) -> DefFact {
        DefFact {
            def_uid: DefUid(uid.into()),
            unit_id: UnitId(1),
            kind: "function".into(),
            simple_name: "old_name".into(),
            qualified_name: "old_name".into(),
            lexical_path: "old_name".into(),
            signature_hash: "abc".into(),
            start_line: 1,
            start_col: 0,
            end_line: 1,
            end_col: 0,
            display_name: "old_name".into(),
            disambiguator: 0,
        }
    }

    #[test]
    fn proven_only_references_yield_ready_plan() {
        let store = StructuralStore::open_in_memory().unwrap();
        store.upsert_file(FileId(1), "a.rs", "h1", "rust", 1).unwrap();
        store.insert_unit(FileId(1), "rust").unwrap();
        store.insert_def(&def("uid1"), 1).unwrap();
        store.insert_ref(
            &RefFact { ref_id: 0, unit_id: UnitId(1), file_id: FileId(1), token_text: "old_name".into(), line: 5, col: 0, enclosing_scope_id: None, role: RefRole::Reference, tier: RefTier::Proven, target_def_uid: Some(DefUid("uid1".into())) },
            1,
        ).unwrap();

        let epochs = Arc::new(EpochPublisher::new());
        epochs.mark_dirty(FileId(1));
        epochs.publish(&[FileId(1)]);

        let planner = RefactorPlanner::new(Arc::new(store), epochs);
        let plan = planner.plan_rename_symbol(&DefUid("uid1".into()), "new_name").unwrap();
        assert_eq!(plan.status, PlanStatus::Ready);
        assert_eq!(plan.candidates.len(), 1);
    }

    #[test]
    fn dirty_file_blocks_plan() {
        let store = StructuralStore::open_in_memory().unwrap();
        store.upsert_file(FileId(1), "a.rs", "h1", "rust", 1).unwrap();
        store.insert_unit(FileId(1), "rust").unwrap();
        store.insert_def(&def("uid1"), 1).unwrap();
        store.insert_ref(
            &RefFact { ref_id: 0, unit_id: UnitId(1), file_id: FileId(1), token_text: "old_name".into(), line: 5, col: 0, enclosing_scope_id: None, role: RefRole::Reference, tier: RefTier::Proven, target_def_uid: Some(DefUid("uid1".into())) },
            1,
        ).unwrap();

        let epochs = Arc::new(EpochPublisher::new());
        epochs.mark_dirty(FileId(1));

        let planner = RefactorPlanner::new(Arc::new(store), epochs);
        let plan = planner.plan_rename_symbol(&DefUid("uid1".into()), "new_name").unwrap();
        assert_eq!(plan.status, PlanStatus::Blocked);
        assert_eq!(plan.suggested_refresh_scope, vec![FileId(1)]);
    }

    #[test]
    fn expired_plan_is_rejected_on_commit() {
        let store = Arc::new(StructuralStore::open_in_memory().unwrap());
        let epochs = Arc::new(EpochPublisher::new());
        let planner = RefactorPlanner::new(store, epochs);
        let err = planner.commit_decision("plan-nonexistent", "c0", &[]).unwrap_err();
        assert!(matches!(err, CoreError::PlanExpired { .. }));
    }
}
