//! T1 fact types, mirroring the schema in `structural::schema` field for
//! field. Kept as plain data — the Structural Tier's invariant is that
//! these rows are written once at index time and never mutated by a reader
//! (§3, "Local binding... written only at index time").

use serde::{Deserialize, Serialize};

use crate::ids::{DefUid, FileId, GroupId, ScopeId, UnitId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefTier {
    Proven,
    Strong,
    Anchored,
    Unknown,
}

impl RefTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefTier::Proven => "PROVEN",
            RefTier::Strong => "STRONG",
            RefTier::Anchored => "ANCHORED",
            RefTier::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "PROVEN" => RefTier::Proven,
            "STRONG" => RefTier::Strong,
            "ANCHORED" => RefTier::Anchored,
            _ => RefTier::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefRole {
    Definition,
    Reference,
    Import,
    Export,
}

impl RefRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefRole::Definition => "DEFINITION",
            RefRole::Reference => "REFERENCE",
            RefRole::Import => "IMPORT",
            RefRole::Export => "EXPORT",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "DEFINITION" => RefRole::Definition,
            "IMPORT" => RefRole::Import,
            "EXPORT" => RefRole::Export,
            _ => RefRole::Reference,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Certainty {
    Certain,
    Uncertain,
}

impl Certainty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Certainty::Certain => "CERTAIN",
            Certainty::Uncertain => "UNCERTAIN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "CERTAIN" => Certainty::Certain,
            _ => Certainty::Uncertain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    Def,
    Import,
    Unknown,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Def => "DEF",
            TargetKind::Import => "IMPORT",
            TargetKind::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "DEF" => TargetKind::Def,
            "IMPORT" => TargetKind::Import,
            _ => TargetKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonCode {
    Param,
    LocalAssign,
    DefInScope,
    ImportAlias,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Param => "PARAM",
            ReasonCode::LocalAssign => "LOCAL_ASSIGN",
            ReasonCode::DefInScope => "DEF_IN_SCOPE",
            ReasonCode::ImportAlias => "IMPORT_ALIAS",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "PARAM" => ReasonCode::Param,
            "LOCAL_ASSIGN" => ReasonCode::LocalAssign,
            "IMPORT_ALIAS" => ReasonCode::ImportAlias,
            _ => ReasonCode::DefInScope,
        }
    }
}

/// `REEXPORT_ALL`, `EXPLICIT_NAMES`, `ALIAS_MAP` — strictly enumerated, no
/// arbitrary computed re-exports (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportThunkMode {
    ReexportAll { source_literal: String },
    ExplicitNames { names: Vec<String>, source_literal: String },
    AliasMap { mapping: Vec<(String, String)>, source_literal: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefFact {
    pub def_uid: DefUid,
    pub unit_id: UnitId,
    pub kind: String,
    pub simple_name: String,
    pub qualified_name: String,
    pub lexical_path: String,
    pub signature_hash: String,
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
    pub display_name: String,
    pub disambiguator: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefFact {
    pub ref_id: i64,
    pub unit_id: UnitId,
    pub file_id: FileId,
    pub token_text: String,
    pub line: u32,
    pub col: u32,
    pub enclosing_scope_id: Option<ScopeId>,
    pub role: RefRole,
    pub tier: RefTier,
    pub target_def_uid: Option<DefUid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeFact {
    pub scope_id: ScopeId,
    pub unit_id: UnitId,
    pub parent_scope_id: Option<ScopeId>,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalBindFact {
    pub scope_id: ScopeId,
    pub name: String,
    pub target_kind: TargetKind,
    pub target_uid: Option<String>,
    pub certainty: Certainty,
    pub reason_code: ReasonCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportFact {
    pub import_id: i64,
    pub unit_id: UnitId,
    pub imported_name: String,
    pub alias: Option<String>,
    pub source_literal: Option<String>,
    pub import_kind: String,
    pub line: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportEntry {
    pub exported_name: String,
    pub def_uid: Option<DefUid>,
    pub certainty: Certainty,
    pub evidence_kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorGroup {
    pub group_id: GroupId,
    pub unit_id: UnitId,
    pub member_token: String,
    pub receiver_shape: String,
    pub total_count: u32,
    pub exemplars: Vec<(String, u32, u32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicAccessSite {
    pub unit_id: UnitId,
    pub pattern: String,
    pub literal: Option<String>,
    pub line: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefSnapshotRecord {
    pub epoch_id: i64,
    pub def_uid: DefUid,
    pub kind: String,
    pub file_path: String,
    pub lexical_path: String,
    pub signature_hash: String,
    pub display_name: String,
    pub start_line: u32,
    pub end_line: u32,
}
