use super::{run_dir_of, Node, VISUALIZER};
use anyhow::{anyhow, Result};
use routelab_analysis::{bar_chart_svg, flows_csv, parse_flow_monitor_file};
use routelab_core::{atomic_write_bytes, ensure_dir, metric, ExperimentState, StateUpdate};
use serde_json::json;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct Visualizer;

impl Visualizer {
    pub fn new() -> Self {
        Self
    }
}

const KPI_BARS: [(&str, &str); 4] = [
    (metric::AVG_PDR, "PDR %"),
    (metric::SUCCESS_RATE, "Success %"),
    (metric::AVG_DELAY, "Delay ms"),
    (metric::P95_DELAY, "p95 delay ms"),
];

impl Node for Visualizer {
    fn name(&self) -> &'static str {
        VISUALIZER
    }

    fn run(&mut self, state: &ExperimentState) -> Result<StateUpdate> {
        if state.metrics.is_empty() {
            info!(agent = VISUALIZER, "no metrics to plot");
            return Ok(StateUpdate::audited(
                VISUALIZER,
                "visualization_skipped",
                json!({ "reason": "no metrics" }),
            ));
        }
        let run_dir = run_dir_of(state).ok_or_else(|| anyhow!("no run directory to write plots into"))?;
        let plots_dir = run_dir.join("plots");
        ensure_dir(&plots_dir)?;

        let mut written = Vec::new();
        let kpi_bars: Vec<(String, f64)> = KPI_BARS
            .iter()
            .filter_map(|(key, label)| state.metric(key).map(|v| (label.to_string(), v)))
            .collect();
        let path = plots_dir.join("kpi_summary.svg");
        atomic_write_bytes(&path, bar_chart_svg("KPI summary", "", &kpi_bars)?.as_bytes())?;
        written.push(path);

        let log = state.simulation_logs.as_deref().unwrap_or("");
        match parse_flow_monitor_file(Path::new(log)) {
            Ok(flows) => {
                let pdr: Vec<(String, f64)> = flows.iter().map(|f| (f.flow_id.clone(), f.pdr())).collect();
                let delay: Vec<(String, f64)> = flows
                    .iter()
                    .map(|f| (f.flow_id.clone(), f.avg_delay_ms()))
                    .collect();
                let throughput: Vec<(String, f64)> = flows
                    .iter()
                    .map(|f| (f.flow_id.clone(), f.throughput_mbps()))
                    .collect();
                for (name, title, unit, bars) in [
                    ("flow_pdr.svg", "Packet delivery ratio per flow", "%", &pdr),
                    ("flow_delay.svg", "Average delay per flow", "ms", &delay),
                    ("flow_throughput.svg", "Throughput per flow", "Mbps", &throughput),
                ] {
                    let path = plots_dir.join(name);
                    atomic_write_bytes(&path, bar_chart_svg(title, unit, bars)?.as_bytes())?;
                    written.push(path);
                }
                let path = plots_dir.join("flows.csv");
                atomic_write_bytes(&path, flows_csv(&flows)?.as_bytes())?;
                written.push(path);
            }
            Err(e) => warn!(agent = VISUALIZER, error = %e, "per-flow plots skipped"),
        }

        info!(agent = VISUALIZER, plots = written.len(), dir = %plots_dir.display(), "plots written");
        let paths: Vec<String> = written
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let mut update = StateUpdate::audited(
            VISUALIZER,
            "plots_generated",
            json!({ "count": paths.len(), "dir": plots_dir.to_string_lossy() }),
        );
        update.plots_generated = paths;
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_without_metrics() {
        let state = ExperimentState::new("t", 3, 1);
        let update = Visualizer::new().run(&state).expect("run");
        assert!(update.plots_generated.is_empty());
        assert_eq!(update.audit_trail[0].action, "visualization_skipped");
    }
}
