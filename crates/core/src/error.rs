//! The canonical error taxonomy for every core operation.
//!
//! One variant per named error kind in the external interface's error
//! taxonomy. Each variant carries the structured `details` an implementer
//! would need to act on, rather than a loose string or JSON blob, and each
//! has a fixed `retryable()` answer — the core never decides retry policy
//! per-call, only per-kind.

use std::path::PathBuf;
use thiserror::Error;

use crate::ids::FileId;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("structural index is corrupt: {0}")]
    IndexCorrupt(String),

    #[error("structural schema version {found} does not match expected {expected}")]
    IndexSchemaMismatch { found: i64, expected: i64 },

    #[error("failed to build index: {0}")]
    IndexBuildFailed(String),

    #[error("query requires an explicit positive limit")]
    UnboundedQuery,

    #[error("git metadata is corrupt: {0}")]
    GitMetadataCorrupt(String),

    #[error("path '{path}' is outside the configured working set")]
    PathOutsideScope { path: String },

    #[error("context router has not finished its initial probe")]
    ContextRouterNotReady,

    #[error("precondition failed for '{path}'")]
    PreconditionFailed {
        path: String,
        expected_sha: Option<String>,
        actual_sha: Option<String>,
        expected_span: Option<(usize, usize)>,
        observed_span: Option<String>,
    },

    #[error("timed out waiting for a lock on '{path}'")]
    LockTimeout { path: String },

    #[error("scope violation for '{path}'")]
    ScopeViolation { path: String },

    #[error("overlapping edits submitted in the same batch for '{path}'")]
    OverlappingEdits { path: String },

    #[error("blocked: one or more affected files are not fresh")]
    BlockedFreshness { suggested_refresh_scope: Vec<FileId> },

    #[error("plan '{plan_id}' has expired")]
    PlanExpired { plan_id: String },

    #[error("divergent edits across contexts for '{path}'")]
    Divergence { path: String, contexts: Vec<String> },

    #[error("insufficient context to resolve '{symbol}'")]
    InsufficientContext { symbol: String },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("internal operation timed out")]
    InternalTimeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// The name used on the wire (`error.error_name` in the response envelope).
    pub fn error_name(&self) -> &'static str {
        match self {
            CoreError::IndexCorrupt(_) => "INDEX_CORRUPT",
            CoreError::IndexSchemaMismatch { .. } => "INDEX_SCHEMA_MISMATCH",
            CoreError::IndexBuildFailed(_) => "INDEX_BUILD_FAILED",
            CoreError::UnboundedQuery => "UNBOUNDED_QUERY",
            CoreError::GitMetadataCorrupt(_) => "GIT_METADATA_CORRUPT",
            CoreError::PathOutsideScope { .. } => "PATH_OUTSIDE_SCOPE",
            CoreError::ContextRouterNotReady => "CONTEXT_ROUTER_NOT_READY",
            CoreError::PreconditionFailed { .. } => "PRECONDITION_FAILED",
            CoreError::LockTimeout { .. } => "LOCK_TIMEOUT",
            CoreError::ScopeViolation { .. } => "SCOPE_VIOLATION",
            CoreError::OverlappingEdits { .. } => "OVERLAPPING_EDITS",
            CoreError::BlockedFreshness { .. } => "BLOCKED_FRESHNESS",
            CoreError::PlanExpired { .. } => "PLAN_EXPIRED",
            CoreError::Divergence { .. } => "DIVERGENCE",
            CoreError::InsufficientContext { .. } => "INSUFFICIENT_CONTEXT",
            CoreError::Cancelled => "CANCELLED",
            CoreError::InternalTimeout => "INTERNAL_TIMEOUT",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the dispatcher may safely retry the call that produced this error.
    pub fn retryable(&self) -> bool {
        matches!(self, CoreError::LockTimeout { .. } | CoreError::Cancelled | CoreError::InternalTimeout)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Internal(e.to_string())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::IndexCorrupt(e.to_string())
    }
}

impl From<git2::Error> for CoreError {
    fn from(e: git2::Error) -> Self {
        CoreError::GitMetadataCorrupt(e.to_string())
    }
}

/// A path, rejected by the Path & Ignore Engine, reported with enough
/// context for `PATH_OUTSIDE_SCOPE`.
pub fn scope_violation(path: impl Into<PathBuf>) -> CoreError {
    CoreError::ScopeViolation { path: path.into().to_string_lossy().into_owned() }
}

pub type CoreResult<T> = Result<T, CoreError>;
