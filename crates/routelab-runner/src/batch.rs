//! Sequential batch studies: every scenario of a plan is run for a number of
//! seeded repetitions, each as its own checkpointed thread, and the resulting
//! KPIs are compared across scenarios.

use crate::checkpoint::validate_thread_id;
use crate::supervisor::{ExperimentRequest, Supervisor};
use anyhow::{anyhow, Context, Result};
use routelab_analysis::{compare_scenarios, Comparison, ScenarioSamples, DEFAULT_ALPHA, DEFAULT_KPIS};
use routelab_core::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

pub const RUNS_FILE: &str = "runs.json";
pub const COMPARISON_JSON: &str = "comparison.json";
pub const COMPARISON_CSV: &str = "comparison.csv";
pub const REPORT_FILE: &str = "REPORT.md";

fn default_repetitions() -> u32 {
    3
}

fn default_base_seed() -> u64 {
    12345
}

fn default_kpis() -> Vec<String> {
    DEFAULT_KPIS.iter().map(|k| k.to_string()).collect()
}

fn default_alpha() -> f64 {
    DEFAULT_ALPHA
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPlan {
    pub name: String,
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,
    /// Repetition `r` (1-based) runs with seed `base_seed + r`.
    #[serde(default = "default_base_seed")]
    pub base_seed: u64,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default = "default_kpis")]
    pub kpis: Vec<String>,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    pub scenarios: Vec<Scenario>,
}

/// Either a literal `task` or the parameters a task is phrased from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub name: String,
    pub task: Option<String>,
    pub protocol: Option<String>,
    pub nodes: Option<u32>,
    pub area: Option<u32>,
    pub duration: Option<u32>,
    pub mobility: Option<String>,
}

impl Scenario {
    pub fn task_text(&self) -> Option<String> {
        if let Some(task) = self.task.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            return Some(task.to_string());
        }
        let protocol = self.protocol.as_deref()?.trim();
        if protocol.is_empty() {
            return None;
        }
        let mut task = format!("Simulate {}", protocol.to_uppercase());
        if let Some(nodes) = self.nodes {
            let kind = if self.mobility.is_some() { "mobile nodes" } else { "nodes" };
            task.push_str(&format!(" with {} {}", nodes, kind));
        }
        if let Some(area) = self.area {
            task.push_str(&format!(" in a {}x{} area", area, area));
        }
        if let Some(duration) = self.duration {
            task.push_str(&format!(" for {} seconds", duration));
        }
        if let Some(mobility) = &self.mobility {
            task.push_str(&format!(" using {} mobility", mobility));
        }
        Some(task)
    }
}

impl BatchPlan {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let plan: BatchPlan = serde_yaml::from_str(raw).context("invalid_batch_plan: unreadable YAML")?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read batch plan {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if slug(&self.name).is_empty() {
            return Err(anyhow!("invalid_batch_plan: name must contain a letter or digit"));
        }
        if self.scenarios.is_empty() {
            return Err(anyhow!("invalid_batch_plan: at least one scenario is required"));
        }
        if self.repetitions == 0 {
            return Err(anyhow!("invalid_batch_plan: repetitions must be at least 1"));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(anyhow!("invalid_batch_plan: alpha must be within (0, 1)"));
        }
        if self.kpis.is_empty() {
            return Err(anyhow!("invalid_batch_plan: kpis must not be empty"));
        }
        let mut seen = BTreeSet::new();
        for scenario in &self.scenarios {
            let key = slug(&scenario.name);
            if key.is_empty() {
                return Err(anyhow!("invalid_batch_plan: every scenario needs a name"));
            }
            if !seen.insert(key) {
                return Err(anyhow!("invalid_batch_plan: duplicate scenario {:?}", scenario.name));
            }
            if scenario.task_text().is_none() {
                return Err(anyhow!(
                    "invalid_batch_plan: scenario {:?} needs a task or a protocol",
                    scenario.name
                ));
            }
        }
        Ok(())
    }

    /// Default output directory under the results root.
    pub fn out_dir(&self, results_root: &Path) -> PathBuf {
        results_root.join("batch").join(slug(&self.name))
    }

    pub fn seed_for(&self, repetition: u32) -> u64 {
        self.base_seed.saturating_add(u64::from(repetition))
    }

    /// Stable per-run thread id, so rerunning a plan resumes unfinished runs
    /// and returns finished ones as they are.
    pub fn thread_id(&self, scenario: &Scenario, repetition: u32) -> String {
        format!("batch-{}-{}-r{}", slug(&self.name), slug(&scenario.name), repetition)
    }
}

/// Lowercase ASCII alphanumerics; every other run of characters becomes one `-`.
fn slug(text: &str) -> String {
    let mut out = String::new();
    for c in text.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchRunStatus {
    Completed,
    NoMetrics,
    Failed,
}

impl BatchRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchRunStatus::Completed => "completed",
            BatchRunStatus::NoMetrics => "no_metrics",
            BatchRunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRun {
    pub scenario: String,
    pub repetition: u32,
    pub seed: u64,
    pub thread_id: String,
    pub task: String,
    pub status: BatchRunStatus,
    pub resumed: bool,
    pub steps: u64,
    pub elapsed_secs: f64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub name: String,
    pub out_dir: PathBuf,
    pub runs: Vec<BatchRun>,
    pub comparison: Comparison,
}

impl BatchReport {
    pub fn completed(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| r.status == BatchRunStatus::Completed)
            .count()
    }
}

/// Runs every (scenario, repetition) pair one after another. A failing run is
/// recorded and the batch moves on; `runs.json` is rewritten after each run.
pub fn run_batch(supervisor: &Supervisor, plan: &BatchPlan, out_dir: &Path) -> Result<BatchReport> {
    plan.validate()?;
    ensure_dir(out_dir)?;
    let total = plan.scenarios.len() as u32 * plan.repetitions;
    info!(batch = %plan.name, scenarios = plan.scenarios.len(), repetitions = plan.repetitions, total, "batch started");

    let mut runs: Vec<BatchRun> = Vec::with_capacity(total as usize);
    for scenario in &plan.scenarios {
        let task = scenario
            .task_text()
            .ok_or_else(|| anyhow!("scenario {:?} has no task", scenario.name))?;
        for repetition in 1..=plan.repetitions {
            let run = run_one(supervisor, plan, scenario, &task, repetition)?;
            info!(
                batch = %plan.name,
                scenario = %run.scenario,
                repetition,
                status = run.status.as_str(),
                resumed = run.resumed,
                "batch run finished"
            );
            runs.push(run);
            atomic_write_json_pretty(&out_dir.join(RUNS_FILE), &runs)?;
        }
    }

    let groups: Vec<ScenarioSamples> = plan
        .scenarios
        .iter()
        .map(|scenario| {
            let mut group = ScenarioSamples::new(scenario.name.clone());
            for run in runs
                .iter()
                .filter(|r| r.scenario == scenario.name && r.status == BatchRunStatus::Completed)
            {
                group.push_metrics(&run.metrics);
            }
            group
        })
        .collect();
    let comparison = compare_scenarios(&groups, &plan.kpis, plan.alpha);

    atomic_write_json_pretty(&out_dir.join(COMPARISON_JSON), &comparison)?;
    atomic_write_bytes(&out_dir.join(COMPARISON_CSV), comparison.to_csv()?.as_bytes())?;
    atomic_write_bytes(
        &out_dir.join(REPORT_FILE),
        render_report(plan, &runs, &comparison).as_bytes(),
    )?;

    let report = BatchReport {
        name: plan.name.clone(),
        out_dir: out_dir.to_path_buf(),
        runs,
        comparison,
    };
    info!(
        batch = %plan.name,
        completed = report.completed(),
        total,
        dir = %out_dir.display(),
        "batch finished"
    );
    Ok(report)
}

fn run_one(
    supervisor: &Supervisor,
    plan: &BatchPlan,
    scenario: &Scenario,
    task: &str,
    repetition: u32,
) -> Result<BatchRun> {
    let thread_id = plan.thread_id(scenario, repetition);
    validate_thread_id(&thread_id)?;
    let seed = plan.seed_for(repetition);
    let started = Instant::now();
    let result = supervisor
        .stream(ExperimentRequest {
            task: task.to_string(),
            thread_id: Some(thread_id.clone()),
            max_iterations: plan.max_iterations,
            seed: Some(seed),
        })
        .and_then(|run| run.finish());

    let mut run = BatchRun {
        scenario: scenario.name.clone(),
        repetition,
        seed,
        thread_id,
        task: task.to_string(),
        status: BatchRunStatus::Failed,
        resumed: false,
        steps: 0,
        elapsed_secs: 0.0,
        metrics: BTreeMap::new(),
        error: None,
    };
    match result {
        Ok(outcome) => {
            run.resumed = outcome.resumed;
            run.steps = outcome.steps;
            run.status = if outcome.state.metrics.is_empty() {
                BatchRunStatus::NoMetrics
            } else {
                BatchRunStatus::Completed
            };
            run.metrics = outcome.state.metrics;
        }
        Err(e) => {
            let message = format!("{:#}", e);
            warn!(thread_id = %run.thread_id, error = %message, "batch run failed");
            run.error = Some(message);
        }
    }
    run.elapsed_secs = started.elapsed().as_secs_f64();
    Ok(run)
}

fn render_report(plan: &BatchPlan, runs: &[BatchRun], comparison: &Comparison) -> String {
    let mut out = comparison.to_markdown(&format!("Batch study: {}", plan.name));
    out.push_str("\n## Runs\n\n");
    out.push_str(&format!(
        "{} scenarios x {} repetitions, base seed {}.\n\n",
        plan.scenarios.len(),
        plan.repetitions,
        plan.base_seed
    ));
    out.push_str("| Scenario | Rep | Seed | Thread | Status | Steps |\n");
    out.push_str("|---|---|---|---|---|---|\n");
    for run in runs {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            run.scenario,
            run.repetition,
            run.seed,
            run.thread_id,
            run.status.as_str(),
            run.steps
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
name: AODV vs OLSR
repetitions: 2
base_seed: 100
scenarios:
  - name: aodv
    task: simulate AODV with 10 nodes for 100 seconds
  - name: olsr
    protocol: olsr
    nodes: 20
    area: 800
    duration: 60
    mobility: RandomWaypoint
"#;

    #[test]
    fn plan_defaults_and_task_phrasing() {
        let plan = BatchPlan::from_yaml_str(PLAN).expect("plan");
        assert_eq!(plan.alpha, DEFAULT_ALPHA);
        assert_eq!(plan.kpis.len(), DEFAULT_KPIS.len());
        assert_eq!(plan.seed_for(2), 102);
        assert_eq!(
            plan.scenarios[1].task_text().as_deref(),
            Some("Simulate OLSR with 20 mobile nodes in a 800x800 area for 60 seconds using RandomWaypoint mobility")
        );
        let id = plan.thread_id(&plan.scenarios[0], 1);
        assert_eq!(id, "batch-aodv-vs-olsr-aodv-r1");
        assert!(validate_thread_id(&id).is_ok());
        assert_eq!(
            plan.out_dir(Path::new("results")),
            Path::new("results/batch/aodv-vs-olsr")
        );
    }

    #[test]
    fn invalid_plans_are_rejected_with_a_code() {
        let duplicate = PLAN.replace("name: olsr", "name: AODV");
        let err = BatchPlan::from_yaml_str(&duplicate).expect_err("duplicate");
        assert!(err.to_string().starts_with("invalid_batch_plan:"), "{}", err);

        let no_task = "name: x\nscenarios:\n  - name: empty\n";
        let err = BatchPlan::from_yaml_str(no_task).expect_err("no task");
        assert!(err.to_string().contains("needs a task or a protocol"));

        let zero = PLAN.replace("repetitions: 2", "repetitions: 0");
        assert!(BatchPlan::from_yaml_str(&zero).is_err());
    }

    #[test]
    fn slug_collapses_separators() {
        assert_eq!(slug("  AODV vs. OLSR!! "), "aodv-vs-olsr");
        assert_eq!(slug("---"), "");
    }
}
