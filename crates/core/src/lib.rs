//! codeplane-core: a repo-scoped control plane that exposes a repository as
//! a deterministic, queryable system instead of a pile of files to grep.
//!
//! The crate is organized around the component table of the architecture it
//! implements: a Path & Ignore Engine, a Reconciler that detects dirt
//! without OS watchers, a Lexical Tier (fast fuzzy full-text), a Structural
//! Tier (facts about definitions/references/scopes, never a call graph), a
//! Parser Facade feeding it, an Epoch Publisher for freshness, a Context
//! Router, a Mutation Engine, a Refactor Planner, a Semantic-Diff Engine,
//! and Impact/Test Selection. `engine` composes all of them behind one
//! operation envelope.

pub mod config;
pub mod context_router;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod git_truth;
pub mod ids;
pub mod impact;
pub mod lexical;
pub mod mutation;
pub mod parser;
pub mod path_ignore;
pub mod reconciler;
pub mod refactor;
pub mod semantic_diff;
pub mod structural;

pub use config::Config;
pub use context_router::ContextRouter;
pub use engine::Engine;
pub use epoch::{EpochPublisher, FreshnessState};
pub use error::{CoreError, CoreResult};
pub use ids::{DefUid, FileId, GroupId, ScopeId, UnitId};
pub use lexical::{LexicalHit, LexicalIndex};
pub use reconciler::{FileChange, Reconciler, ReconcileResult};
pub use refactor::{Plan, PlanStatus, RefactorPlanner};
pub use structural::StructuralStore;
