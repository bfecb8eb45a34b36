use super::{run_dir_of, Node, ARCHIVIST};
use anyhow::Result;
use chrono::Utc;
use routelab_core::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, sha256_bytes, ExperimentState,
    StateUpdate,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

/// Housekeeping tail: persists run metadata and a markdown report.
pub struct Archivist {
    results_root: PathBuf,
}

impl Archivist {
    pub fn new(results_root: PathBuf) -> Self {
        Self { results_root }
    }
}

fn metadata(state: &ExperimentState, generated_at: &str) -> Value {
    let mut actions: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in &state.audit_trail {
        *actions.entry(entry.agent.as_str()).or_insert(0) += 1;
    }
    json!({
        "generated_at": generated_at,
        "task": state.task,
        "simulation_seed": state.simulation_seed,
        "simulation_status": state.simulation_status.as_str(),
        "iteration_count": state.iteration_count,
        "max_iterations": state.max_iterations,
        "optimization_count": state.optimization_count,
        "error_type": state.error_type.as_str(),
        "errors": state.errors.len(),
        "script_digest": sha256_bytes(state.code_snippet.as_bytes()),
        "simulation_logs": state.simulation_logs,
        "pcap_files": state.pcap_files,
        "plots": state.plots_generated,
        "metrics": state.metrics,
        "metrics_digest": canonical_json_digest(&json!(state.metrics)),
        "grade": state.analysis_results.as_ref().map(|a| a.grade.as_str()),
        "papers": state.papers_found.len(),
        "audit_entries_by_agent": actions,
    })
}

pub(crate) fn render_report(state: &ExperimentState) -> String {
    let mut out = format!("# Experiment report\n\n**Task:** {}\n\n", state.task);
    out.push_str(&format!(
        "- status: {}\n- iterations: {}/{}\n- optimization cycles: {}\n- seed: {}\n\n",
        state.simulation_status,
        state.iteration_count,
        state.max_iterations,
        state.optimization_count,
        state.simulation_seed
    ));
    if let Some(analysis) = &state.analysis_results {
        out.push_str(&format!("## Results ({})\n\n{}\n\n", analysis.grade, analysis.summary));
        if !analysis.confidence_intervals.is_empty() {
            out.push_str("| series | mean | 95% CI |\n|---|---|---|\n");
            for (name, ci) in &analysis.confidence_intervals {
                out.push_str(&format!(
                    "| {} | {:.3} | [{:.3}, {:.3}] |\n",
                    name, ci.mean, ci.lower, ci.upper
                ));
            }
            out.push('\n');
        }
        out.push_str(&format!("## Proposal\n\n{}\n\n", analysis.proposal));
    }
    if !state.metrics.is_empty() {
        out.push_str("## Metrics\n\n");
        for (name, value) in &state.metrics {
            out.push_str(&format!("- {}: {:.3}\n", name, value));
        }
        out.push('\n');
    }
    if !state.plots_generated.is_empty() {
        out.push_str("## Plots\n\n");
        for p in &state.plots_generated {
            out.push_str(&format!("- {}\n", p));
        }
        out.push('\n');
    }
    if !state.errors.is_empty() {
        out.push_str("## Errors\n\n");
        for e in &state.errors {
            let first = e.lines().next().unwrap_or("");
            out.push_str(&format!("- {}\n", first));
        }
        out.push('\n');
    }
    out
}

impl Node for Archivist {
    fn name(&self) -> &'static str {
        ARCHIVIST
    }

    fn run(&mut self, state: &ExperimentState) -> Result<StateUpdate> {
        let now = Utc::now();
        let stamp = now.format("%Y%m%d_%H%M%S").to_string();
        let dir = run_dir_of(state).unwrap_or_else(|| self.results_root.join(format!("archive_{}", stamp)));
        let metadata_path = dir.join(format!("metadata_{}.json", stamp));
        let report_path = dir.join(format!("report_{}.md", stamp));
        atomic_write_json_pretty(&metadata_path, &metadata(state, &now.to_rfc3339()))?;
        atomic_write_bytes(&report_path, render_report(state).as_bytes())?;
        info!(agent = ARCHIVIST, dir = %dir.display(), "experiment archived");
        Ok(StateUpdate::audited(
            ARCHIVIST,
            "archived",
            json!({
                "metadata": metadata_path.to_string_lossy(),
                "report": report_path.to_string_lossy(),
            }),
        ))
    }
}
