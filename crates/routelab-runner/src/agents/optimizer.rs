use super::hints::TaskHints;
use super::{run_dir_of, AgentContext, Node, OPTIMIZER};
use anyhow::Result;
use routelab_analysis::{classify_bottlenecks, BottleneckReport};
use routelab_core::{atomic_write_bytes, ExperimentState, StateUpdate};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub const OPTIMIZATION_NOTE_PREFIX: &str = "OPTIMIZATION REQUIRED:";

pub struct Optimizer {
    ctx: Arc<AgentContext>,
}

impl Optimizer {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

fn fallback_directive(report: &BottleneckReport, task: &str) -> String {
    let hints = TaskHints::parse(task);
    let mut out = String::new();
    for b in report.critical.iter().chain(report.moderate.iter()) {
        let change = match b.metric.as_str() {
            "PDR" | "Success rate" => format!(
                "increase node density: keep {} nodes but shrink the area by a quarter, and halve the application data rate",
                hints.node_count()
            ),
            "Delay" => "cap the application rate, shorten routes by tightening the area, and avoid per-packet logging".to_string(),
            "Throughput" => "raise the on/off data rate and packet size while watching PDR".to_string(),
            _ => "lower the random-walk speed bound to stabilize routes".to_string(),
        };
        out.push_str(&format!("- {} ({:?}): {}\n", b.metric, b.severity, change));
    }
    if out.is_empty() {
        out.push_str("- rerun with identical parameters and a longer warm-up before traffic starts\n");
    }
    out.push_str(&format!(
        "- keep protocol {} and the reproducibility seed unchanged\n",
        hints.primary_protocol()
    ));
    out
}

impl Node for Optimizer {
    fn name(&self) -> &'static str {
        OPTIMIZER
    }

    fn run(&mut self, state: &ExperimentState) -> Result<StateUpdate> {
        let cycle = state.optimization_count + 1;
        let report = classify_bottlenecks(&state.metrics);
        let analyst_proposal = state
            .analysis_results
            .as_ref()
            .map(|a| a.proposal.as_str())
            .unwrap_or("");
        let prompt = self.ctx.prompts.render(
            "optimizer.directive",
            &[
                ("task", &state.task),
                ("bottlenecks", &report.to_markdown()),
                ("proposal", analyst_proposal),
            ],
        )?;
        let reasoning = &self.ctx.reasoning;
        let (directive, source) = match self.ctx.ask(
            OPTIMIZER,
            "directive",
            &reasoning.model_reasoning,
            reasoning.temperature_analysis,
            prompt,
        ) {
            Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), "reasoning"),
            Ok(_) => (fallback_directive(&report, &state.task), "fallback"),
            Err(e) => {
                warn!(agent = OPTIMIZER, error = %e, "directive unavailable, using rule-based directive");
                (fallback_directive(&report, &state.task), "fallback")
            }
        };

        let report_path = run_dir_of(state).map(|dir| dir.join(format!("optimization_{}.md", cycle)));
        if let Some(path) = &report_path {
            let doc = format!(
                "# Optimization cycle {}\n\n## Bottlenecks\n\n{}\n## Directive\n\n{}\n",
                cycle,
                report.to_markdown(),
                directive
            );
            atomic_write_bytes(path, doc.as_bytes())?;
        }
        info!(
            agent = OPTIMIZER,
            cycle,
            critical = report.critical.len(),
            moderate = report.moderate.len(),
            "optimization directive issued"
        );

        let mut update = StateUpdate::audited(
            OPTIMIZER,
            "optimization_completed",
            json!({
                "cycle": cycle,
                "critical": report.critical.len(),
                "moderate": report.moderate.len(),
                "minor": report.minor.len(),
                "source": source,
                "report": report_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
            }),
        );
        update
            .research_notes
            .push(format!("{}\n{}", OPTIMIZATION_NOTE_PREFIX, directive));
        update.code_snippet = Some(String::new());
        update.code_validated = Some(false);
        update.critic_approved = Some(false);
        update.critique = Some(String::new());
        update.optimization_count = Some(cycle);
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routelab_core::metric;
    use std::collections::BTreeMap;

    #[test]
    fn fallback_directive_covers_each_serious_bottleneck() {
        let mut metrics = BTreeMap::new();
        metrics.insert(metric::AVG_PDR.to_string(), 70.0);
        metrics.insert(metric::AVG_DELAY.to_string(), 150.0);
        metrics.insert(metric::SUCCESS_RATE.to_string(), 72.0);
        let report = classify_bottlenecks(&metrics);
        let text = fallback_directive(&report, "simulate AODV with 10 nodes for 100 seconds");
        assert!(text.contains("- PDR (Moderate)"));
        assert!(text.contains("- Delay (Moderate)"));
        assert!(text.contains("- Success rate (Critical)"));
        assert!(text.contains("keep protocol AODV"));
    }
}
