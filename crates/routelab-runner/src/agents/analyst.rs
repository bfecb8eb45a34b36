use super::hints::{Protocol, TaskHints};
use super::{AgentContext, Node, ANALYST};
use anyhow::Result;
use routelab_analysis::{
    classify_bottlenecks, compute_kpis, estimated_routing_overhead, flow_confidence_intervals,
    measured_routing_overhead, parse_flow_monitor_file, BottleneckReport, FlowMonitorError, Kpis,
};
use routelab_core::{metric, AnalysisResults, ExperimentState, StateUpdate};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Analyst {
    ctx: Arc<AgentContext>,
}

impl Analyst {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

pub(crate) fn kpi_table(metrics: &BTreeMap<String, f64>) -> String {
    let mut out = String::from("| metric | value |\n|---|---|\n");
    for (name, value) in metrics {
        out.push_str(&format!("| {} | {:.3} |\n", name, value));
    }
    out
}

fn protocol_advice(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Aodv => "shorten HELLO_INTERVAL and ACTIVE_ROUTE_TIMEOUT so broken routes are repaired sooner",
        Protocol::Olsr => "lower the HELLO and TC intervals to track topology changes faster",
        Protocol::Dsdv => "shorten the periodic update interval and settling time",
        Protocol::Dsr => "enable route cache timeouts so stale source routes are dropped",
        Protocol::Hwmp => "reduce the path refresh interval and enable proactive root announcements",
    }
}

/// Proposal derived from the bottleneck report alone.
pub(crate) fn rule_based_proposal(
    report: &BottleneckReport,
    protocol: Protocol,
    grade: &str,
) -> String {
    if report.critical.is_empty() && report.moderate.is_empty() {
        return format!(
            "Performance graded {}. No critical or moderate bottlenecks; keep the current \
             configuration and confirm the result with additional seeds.",
            grade
        );
    }
    let mut out = format!("Performance graded {}. Proposed changes:\n", grade);
    for b in report.critical.iter().chain(report.moderate.iter()) {
        let action = match b.metric.as_str() {
            "PDR" | "Success rate" => "reduce node spacing or transmit power gaps so every pair has a route, and lower the offered load",
            "Delay" => "reduce traffic rate and queue lengths, and avoid long multi-hop paths",
            "Throughput" => "raise the data rate of the on/off applications and check channel contention",
            _ => "stabilize routes by reducing mobility speed",
        };
        out.push_str(&format!("- {} ({:.2} vs {:.2}): {}\n", b.metric, b.value, b.threshold, action));
    }
    out.push_str(&format!("- {}: {}\n", protocol, protocol_advice(protocol)));
    out
}

fn summary_text(kpis: &Kpis, grade: &str, overhead: f64, measured: bool) -> String {
    format!(
        "{} flows ({} delivering). Average PDR {:.2}% (min {:.2}%, max {:.2}%), average delay {:.2} ms \
         (p95 {:.2} ms), total throughput {:.3} Mbps, success rate {:.1}%. Routing overhead {:.3} ({}). \
         Grade: {}.",
        kpis.flow_count,
        kpis.successful_flows,
        kpis.avg_pdr,
        kpis.min_pdr,
        kpis.max_pdr,
        kpis.avg_delay,
        kpis.p95_delay,
        kpis.total_throughput,
        kpis.success_rate,
        overhead,
        if measured { "measured" } else { "estimated" },
        grade
    )
}

impl Node for Analyst {
    fn name(&self) -> &'static str {
        ANALYST
    }

    fn run(&mut self, state: &ExperimentState) -> Result<StateUpdate> {
        let log = state.simulation_logs.as_deref().unwrap_or("");
        let run_dir = Path::new(log)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty());
        let flows = match parse_flow_monitor_file(Path::new(log)) {
            Ok(flows) => flows,
            Err(FlowMonitorError::NoFlows) => {
                warn!(agent = ANALYST, log, "log holds no flow statistics");
                Vec::new()
            }
            Err(e) => {
                warn!(agent = ANALYST, log, error = %e, "flow metrics unreadable");
                Vec::new()
            }
        };

        let Some(kpis) = compute_kpis(&flows) else {
            let mut update = StateUpdate::audited(
                ANALYST,
                "analysis_completed",
                json!({ "flows": 0, "log": log, "metrics": false }),
            );
            update.metrics = Some(BTreeMap::new());
            update.analysis_results = Some(AnalysisResults {
                summary: format!(
                    "No flow statistics were found in {}; the run produced a stdout-only log.",
                    log
                ),
                proposal: "Make sure the script installs FlowMonitor and serializes it before Simulator.Destroy().".to_string(),
                grade: "Unknown".to_string(),
                run_dir,
                ..AnalysisResults::default()
            });
            return Ok(update);
        };

        let hints = TaskHints::parse(&state.task);
        let protocol = hints.primary_protocol();
        let mut metrics = kpis.to_metrics();
        let measured = state.trace_analysis.as_ref().and_then(measured_routing_overhead);
        let overhead = measured.unwrap_or_else(|| estimated_routing_overhead(Some(protocol.as_str())));
        metrics.insert(metric::ROUTING_OVERHEAD.to_string(), overhead);

        let grade = kpis.grade().as_str().to_string();
        let report = classify_bottlenecks(&metrics);
        let prompt = self.ctx.prompts.render(
            "analyst.proposal",
            &[
                ("task", &state.task),
                ("grade", &grade),
                ("kpi_table", &kpi_table(&metrics)),
                ("bottlenecks", &report.to_markdown()),
            ],
        )?;
        let reasoning = &self.ctx.reasoning;
        let (proposal, source) = match self.ctx.ask(
            ANALYST,
            "proposal",
            &reasoning.model_reasoning,
            reasoning.temperature_analysis,
            prompt,
        ) {
            Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), "reasoning"),
            Ok(_) => (rule_based_proposal(&report, protocol, &grade), "fallback"),
            Err(e) => {
                warn!(agent = ANALYST, error = %e, "proposal unavailable, using rule-based proposal");
                (rule_based_proposal(&report, protocol, &grade), "fallback")
            }
        };

        info!(
            agent = ANALYST,
            flows = kpis.flow_count,
            avg_pdr = kpis.avg_pdr,
            avg_delay = kpis.avg_delay,
            success_rate = kpis.success_rate,
            grade = %grade,
            "analysis complete"
        );
        let details = json!({
            "flows": kpis.flow_count,
            "grade": grade,
            "avg_pdr": kpis.avg_pdr,
            "avg_delay": kpis.avg_delay,
            "success_rate": kpis.success_rate,
            "overhead_measured": measured.is_some(),
            "proposal_source": source,
            "bottlenecks": report.critical.len() + report.moderate.len() + report.minor.len(),
        });
        let mut update = StateUpdate::audited(ANALYST, "analysis_completed", details);
        update.analysis_results = Some(AnalysisResults {
            summary: summary_text(&kpis, &grade, overhead, measured.is_some()),
            proposal,
            grade,
            flow_count: kpis.flow_count,
            confidence_intervals: flow_confidence_intervals(&flows),
            run_dir,
        });
        update.metrics = Some(metrics);
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_based_proposal_lists_serious_bottlenecks() {
        let mut metrics = BTreeMap::new();
        metrics.insert(metric::AVG_PDR.to_string(), 60.0);
        metrics.insert(metric::AVG_DELAY.to_string(), 150.0);
        let report = classify_bottlenecks(&metrics);
        let text = rule_based_proposal(&report, Protocol::Olsr, "Poor");
        assert!(text.contains("PDR (60.00 vs 70.00)"));
        assert!(text.contains("Delay"));
        assert!(text.contains("OLSR: lower the HELLO"));

        let clean = rule_based_proposal(&BottleneckReport::default(), Protocol::Aodv, "Excellent");
        assert!(clean.contains("No critical or moderate bottlenecks"));
    }

    #[test]
    fn kpi_table_lists_every_metric() {
        let mut metrics = BTreeMap::new();
        metrics.insert("avg_pdr".to_string(), 92.5);
        metrics.insert("avg_delay".to_string(), 40.0);
        let table = kpi_table(&metrics);
        assert!(table.contains("| avg_delay | 40.000 |"));
        assert!(table.contains("| avg_pdr | 92.500 |"));
    }
}
