use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use routelab_core::ExperimentState;
use routelab_runner::config::BackendKind;
use routelab_runner::batch::REPORT_FILE;
use routelab_runner::{
    run_batch, write_default_config, BatchPlan, BatchReport, CheckpointStore, Config,
    EpisodicMemory, ExperimentOutcome, ExperimentRequest, StepEvent, Supervisor, Validator,
    DEFAULT_CONFIG_FILE,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "routelab", version = "0.3.0", about = "Multi-agent routing simulation lab")]
struct Cli {
    /// Configuration file (defaults to ./routelab.yaml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[arg(long)]
        task: String,
        #[arg(long)]
        thread_id: Option<String>,
        #[arg(long)]
        max_iterations: Option<u32>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        offline: bool,
        #[arg(long)]
        json: bool,
    },
    Resume {
        #[arg(long)]
        thread_id: String,
        #[arg(long)]
        offline: bool,
        #[arg(long)]
        json: bool,
    },
    /// Runs every scenario of a YAML plan for its seeded repetitions and
    /// compares the KPIs across scenarios.
    Batch {
        plan: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        offline: bool,
        #[arg(long)]
        json: bool,
    },
    Inspect {
        #[arg(long)]
        thread_id: String,
        #[arg(long)]
        json: bool,
    },
    Threads {
        #[arg(long)]
        json: bool,
    },
    Validate {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    Clean {
        #[arg(long)]
        checkpoints: bool,
        #[arg(long)]
        results: bool,
    },
}

#[derive(Subcommand)]
enum MemoryCommands {
    List {
        #[arg(long)]
        json: bool,
    },
    Search {
        #[arg(long)]
        task: String,
        #[arg(long)]
        error: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command, cli.config.as_deref());
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let message = format!("{:#}", err);
                emit_json(&json_error(error_code(&message), message.clone(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = Config::load(path)?;
    if let Some(base) = path.and_then(Path::parent).filter(|p| !p.as_os_str().is_empty()) {
        config.rebase(base);
    }
    Ok(config)
}

fn run_command(command: Commands, config_path: Option<&Path>) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            task,
            thread_id,
            max_iterations,
            seed,
            offline,
            json,
        } => {
            let supervisor = supervisor(config_path, offline)?;
            let request = ExperimentRequest {
                task,
                thread_id,
                max_iterations,
                seed,
            };
            let outcome = drive(&supervisor, request, json)?;
            if json {
                return Ok(Some(outcome_to_json("run", &outcome)));
            }
            print_outcome(&outcome);
        }
        Commands::Resume {
            thread_id,
            offline,
            json,
        } => {
            let supervisor = supervisor(config_path, offline)?;
            if supervisor.store().latest(&thread_id)?.is_none() {
                return Err(anyhow!("thread_not_found: no checkpoints for thread {}", thread_id));
            }
            let request = ExperimentRequest {
                thread_id: Some(thread_id),
                ..ExperimentRequest::default()
            };
            let outcome = drive(&supervisor, request, json)?;
            if json {
                return Ok(Some(outcome_to_json("resume", &outcome)));
            }
            print_outcome(&outcome);
        }
        Commands::Batch {
            plan,
            out,
            offline,
            json,
        } => {
            let plan = BatchPlan::load(&plan)?;
            let mut config = load_config(config_path)?;
            if offline {
                config.reasoning.backend = BackendKind::Offline;
            }
            let out_dir = out.unwrap_or_else(|| plan.out_dir(&config.paths.results_root));
            let supervisor = Supervisor::from_config(config)?;
            let report = run_batch(&supervisor, &plan, &out_dir)?;
            if json {
                return Ok(Some(batch_to_json(&report)));
            }
            print_batch(&report);
        }
        Commands::Inspect { thread_id, json } => {
            let config = load_config(config_path)?;
            let store = CheckpointStore::new(config.paths.checkpoint_root);
            let checkpoints = store.list(&thread_id)?;
            if checkpoints.is_empty() {
                return Err(anyhow!("thread_not_found: no checkpoints for thread {}", thread_id));
            }
            let rows: Vec<Value> = checkpoints
                .iter()
                .map(|cp| {
                    json!({
                        "step": cp.step,
                        "node": cp.node,
                        "next": cp.next,
                        "committed_at": cp.committed_at.to_rfc3339(),
                        "iteration_count": cp.state.iteration_count,
                        "optimization_count": cp.state.optimization_count,
                        "simulation_status": cp.state.simulation_status.as_str(),
                        "error_type": cp.state.error_type.as_str(),
                        "errors": cp.state.errors.len(),
                        "audit_entries": cp.state.audit_trail.len(),
                    })
                })
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "inspect",
                    "thread_id": thread_id,
                    "task": checkpoints[0].state.task,
                    "steps": rows
                })));
            }
            println!("thread_id: {}", thread_id);
            println!("task: {}", checkpoints[0].state.task);
            for cp in &checkpoints {
                println!(
                    "{:>4}  {:<15} -> {:<15} iter={} opt={} status={} errors={}",
                    cp.step,
                    cp.node,
                    cp.next,
                    cp.state.iteration_count,
                    cp.state.optimization_count,
                    cp.state.simulation_status,
                    cp.state.errors.len()
                );
            }
        }
        Commands::Threads { json } => {
            let config = load_config(config_path)?;
            let threads = CheckpointStore::new(config.paths.checkpoint_root).threads()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "threads",
                    "threads": threads
                })));
            }
            if threads.is_empty() {
                println!("no threads");
            }
            for t in &threads {
                println!(
                    "{}  step={} node={} next={} task={}",
                    t.thread_id, t.last_step, t.last_node, t.next, t.task
                );
            }
        }
        Commands::Validate { file, json } => {
            let config = load_config(config_path)?;
            let code = std::fs::read_to_string(&file)
                .map_err(|e| anyhow!("failed to read {}: {}", file.display(), e))?;
            let report = Validator::new(config.validator).validate(&code);
            if !report.valid {
                return Err(anyhow!("validation_failed: {}", report.message));
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "validate",
                    "file": file.display().to_string(),
                    "report": report
                })));
            }
            println!("{}", report.message);
        }
        Commands::Memory { command } => {
            let config = load_config(config_path)?;
            let memory = EpisodicMemory::open(
                &config.paths.memory_path,
                config.memory.relevance_threshold,
                config.memory.top_k,
            )?;
            match command {
                MemoryCommands::List { json } => {
                    if json {
                        return Ok(Some(json!({
                            "ok": true,
                            "command": "memory-list",
                            "path": memory.path().display().to_string(),
                            "records": memory.records()
                        })));
                    }
                    println!("memory: {} ({} records)", memory.path().display(), memory.len());
                    for r in memory.records() {
                        println!(
                            "{}  {}  {}  |  {}",
                            &r.id[..12.min(r.id.len())],
                            r.timestamp.to_rfc3339(),
                            one_line(&r.task_description, 60),
                            one_line(&r.error_text, 60)
                        );
                    }
                }
                MemoryCommands::Search { task, error, json } => {
                    let hits = memory.retrieve(&task, &error);
                    if json {
                        return Ok(Some(json!({
                            "ok": true,
                            "command": "memory-search",
                            "threshold": memory.threshold(),
                            "hits": hits
                        })));
                    }
                    if hits.is_empty() {
                        println!("no records above relevance {:.2}", memory.threshold());
                    }
                    for h in &hits {
                        println!(
                            "{:.3}  {}  {}",
                            h.relevance,
                            one_line(&h.record.task_description, 60),
                            one_line(&h.record.error_text, 60)
                        );
                    }
                }
            }
        }
        Commands::Config { command } => match command {
            ConfigCommands::Init { path, force } => {
                write_default_config(&path, force)?;
                println!("wrote: {}", path.display());
            }
        },
        Commands::Clean {
            checkpoints,
            results,
        } => {
            let config = load_config(config_path)?;
            if checkpoints {
                let store = CheckpointStore::new(config.paths.checkpoint_root.clone());
                let removed = store.remove_all()?;
                println!("removed: {} threads under {}", removed, store.root().display());
            }
            if results && config.paths.results_root.exists() {
                std::fs::remove_dir_all(&config.paths.results_root)?;
                println!("removed: {}", config.paths.results_root.display());
            }
        }
    }
    Ok(None)
}

fn supervisor(config_path: Option<&Path>, offline: bool) -> Result<Supervisor> {
    let mut config = load_config(config_path)?;
    if offline {
        config.reasoning.backend = BackendKind::Offline;
    }
    Supervisor::from_config(config)
}

/// Streams every step to stdout (one line, or one JSON object per line) and
/// returns the final outcome.
fn drive(supervisor: &Supervisor, request: ExperimentRequest, json: bool) -> Result<ExperimentOutcome> {
    let mut run = supervisor.stream(request)?;
    info!(thread_id = %run.thread_id(), resumed = run.resumed(), "streaming experiment");
    if !json {
        println!("thread_id: {}", run.thread_id());
    }
    for event in run.by_ref() {
        let event = event?;
        if json {
            emit_json(&step_to_json(&event));
        } else {
            println!("{}", step_line(&event));
        }
    }
    run.finish()
}

fn step_line(event: &StepEvent) -> String {
    let action = event
        .update
        .audit_trail
        .last()
        .map(|a| a.action.as_str())
        .unwrap_or("");
    format!(
        "[{:>3}] {:<15} {:<24} -> {}",
        event.step, event.node, action, event.next
    )
}

fn step_to_json(event: &StepEvent) -> Value {
    json!({
        "event": "step",
        "thread_id": event.thread_id,
        "step": event.step,
        "node": event.node,
        "next": event.next,
        "fields": event.update.fields().iter().map(|f| f.name()).collect::<Vec<_>>(),
        "audit": event.update.audit_trail,
    })
}

fn state_summary(state: &ExperimentState) -> Value {
    json!({
        "task": state.task,
        "simulation_status": state.simulation_status.as_str(),
        "iteration_count": state.iteration_count,
        "max_iterations": state.max_iterations,
        "optimization_count": state.optimization_count,
        "simulation_seed": state.simulation_seed,
        "error_type": state.error_type.as_str(),
        "errors": state.errors,
        "metrics": state.metrics,
        "simulation_logs": state.simulation_logs,
        "plots": state.plots_generated,
        "grade": state.analysis_results.as_ref().map(|a| a.grade.clone()),
    })
}

fn outcome_to_json(command: &str, outcome: &ExperimentOutcome) -> Value {
    json!({
        "ok": true,
        "command": command,
        "thread_id": outcome.thread_id,
        "steps": outcome.steps,
        "resumed": outcome.resumed,
        "state": state_summary(&outcome.state)
    })
}

fn print_outcome(outcome: &ExperimentOutcome) {
    let state = &outcome.state;
    println!("status: {}", state.simulation_status);
    println!(
        "iterations: {}/{}  optimization_cycles: {}",
        state.iteration_count, state.max_iterations, state.optimization_count
    );
    if let Some(analysis) = &state.analysis_results {
        println!("grade: {}", analysis.grade);
        println!("summary: {}", analysis.summary);
    }
    if let Some(log) = &state.simulation_logs {
        println!("simulation_logs: {}", log);
    }
    if let Some(err) = state.last_error() {
        println!("last_error: {}", one_line(err, 160));
    }
}

fn batch_to_json(report: &BatchReport) -> Value {
    json!({
        "ok": true,
        "command": "batch",
        "name": report.name,
        "out_dir": report.out_dir.display().to_string(),
        "completed": report.completed(),
        "runs": report.runs,
        "comparison": report.comparison
    })
}

fn print_batch(report: &BatchReport) {
    for run in &report.runs {
        let pdr = run
            .metrics
            .get("avg_pdr")
            .map_or_else(|| "-".to_string(), |v| format!("{:.2}", v));
        println!(
            "{:<16} r{:<3} seed={:<8} {:<10} avg_pdr={} thread={}",
            run.scenario,
            run.repetition,
            run.seed,
            run.status.as_str(),
            pdr,
            run.thread_id
        );
    }
    for test in report.comparison.tests.iter().filter(|t| t.test.significant) {
        println!(
            "significant: {} {} vs {} (p={:.4}, d={:.2})",
            test.kpi, test.a, test.b, test.test.p_value, test.test.cohens_d
        );
    }
    println!("completed: {}/{}", report.completed(), report.runs.len());
    println!("report: {}", report.out_dir.join(REPORT_FILE).display());
}

fn one_line(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut out: String = flat.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

/// Errors raised as `"<code>: message"` keep their code; anything else is
/// reported as `command_failed`.
fn error_code(message: &str) -> &str {
    match message.split_once(": ") {
        Some((code, _))
            if !code.is_empty() && code.chars().all(|c| c.is_ascii_lowercase() || c == '_') =>
        {
            code
        }
        _ => "command_failed",
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Resume { json, .. }
        | Commands::Batch { json, .. }
        | Commands::Inspect { json, .. }
        | Commands::Threads { json }
        | Commands::Validate { json, .. } => *json,
        Commands::Memory { command } => match command {
            MemoryCommands::List { json } | MemoryCommands::Search { json, .. } => *json,
        },
        Commands::Config { .. } | Commands::Clean { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_come_from_prefixes() {
        assert_eq!(error_code("operation_in_progress: busy"), "operation_in_progress");
        assert_eq!(error_code("thread_not_found: no checkpoints"), "thread_not_found");
        assert_eq!(error_code("failed to read config x: oops"), "command_failed");
        assert_eq!(error_code("plain"), "command_failed");
    }

    #[test]
    fn json_mode_follows_flags() {
        let cli = Cli::try_parse_from(["routelab", "memory", "search", "--task", "t", "--error", "e", "--json"])
            .expect("parse");
        assert!(command_json_mode(&cli.command));
        let cli = Cli::try_parse_from(["routelab", "--config", "x.yaml", "clean", "--checkpoints"])
            .expect("parse");
        assert!(!command_json_mode(&cli.command));
        assert_eq!(cli.config, Some(PathBuf::from("x.yaml")));
        let cli = Cli::try_parse_from(["routelab", "batch", "plan.yaml", "--offline", "--json"])
            .expect("parse");
        assert!(command_json_mode(&cli.command));
        assert!(matches!(cli.command, Commands::Batch { offline: true, .. }));
    }

    #[test]
    fn one_line_flattens_and_truncates() {
        assert_eq!(one_line("a\n  b", 10), "a b");
        assert_eq!(one_line("abcdef", 3), "abc...");
    }
}
