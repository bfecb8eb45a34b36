use super::{Node, TRACE_ANALYZER};
use anyhow::Result;
use routelab_analysis::analyze_captures;
use routelab_core::{ExperimentState, StateUpdate, TraceAnalysis};
use serde_json::json;
use std::path::Path;
use tracing::{debug, info, warn};

/// Summarizes the packet captures of the latest run.
#[derive(Debug, Default)]
pub struct TraceAnalyzer;

impl TraceAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl Node for TraceAnalyzer {
    fn name(&self) -> &'static str {
        TRACE_ANALYZER
    }

    fn run(&mut self, state: &ExperimentState) -> Result<StateUpdate> {
        let current = current_captures(state);
        let present: Vec<&str> = current
            .iter()
            .copied()
            .filter(|p| Path::new(p).is_file())
            .collect();
        let missing = current.len() - present.len();

        let analysis = if present.is_empty() {
            warn!(agent = TRACE_ANALYZER, listed = current.len(), "no capture files available");
            TraceAnalysis {
                warnings: vec!["no capture files available".to_string()],
                ..TraceAnalysis::default()
            }
        } else {
            let mut analysis = analyze_captures(&present);
            if missing > 0 {
                analysis
                    .warnings
                    .push(format!("{} listed capture files no longer exist", missing));
            }
            analysis
        };
        info!(
            agent = TRACE_ANALYZER,
            captures = analysis.captures.len(),
            packets = analysis.total_packets,
            routing_packets = analysis.routing_packets,
            "trace analysis complete"
        );

        let mut update = StateUpdate::audited(
            TRACE_ANALYZER,
            "trace_analyzed",
            json!({
                "captures": analysis.captures.len(),
                "total_packets": analysis.total_packets,
                "routing_packets": analysis.routing_packets,
                "routing_overhead_pct": analysis.routing_overhead_pct,
                "warnings": analysis.warnings.len(),
            }),
        );
        update.trace_analysis = Some(analysis);
        Ok(update)
    }
}

/// Captures written by the latest run. `pcap_files` accumulates across
/// optimization cycles, so only paths under the directory holding the current
/// simulation log are kept.
fn current_captures(state: &ExperimentState) -> Vec<&str> {
    let Some(run_dir) = state
        .simulation_logs
        .as_deref()
        .and_then(|log| Path::new(log).parent())
    else {
        return state.pcap_files.iter().map(String::as_str).collect();
    };
    let (current, stale): (Vec<&str>, Vec<&str>) = state
        .pcap_files
        .iter()
        .map(String::as_str)
        .partition(|p| Path::new(p).starts_with(run_dir));
    if !stale.is_empty() {
        debug!(
            agent = TRACE_ANALYZER,
            run_dir = %run_dir.display(),
            skipped = ?stale,
            "ignoring captures from earlier runs"
        );
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;

    /// Classic raw-IP pcap holding `packets` zero-filled 60-byte frames.
    fn write_capture(path: &Path, packets: u32) {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&4u16.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&65535u32.to_le_bytes());
        bytes.extend_from_slice(&101u32.to_le_bytes());
        for i in 0..packets {
            let frame = [0u8; 60];
            bytes.extend_from_slice(&i.to_le_bytes());
            bytes.extend_from_slice(&0u32.to_le_bytes());
            bytes.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&frame);
        }
        fs::write(path, bytes).expect("write capture");
    }

    #[test]
    fn missing_captures_yield_empty_analysis() {
        let mut state = ExperimentState::new("t", 3, 1);
        state.pcap_files = vec!["/nonexistent/capture-0-0.pcap".to_string()];
        let update = TraceAnalyzer::new().run(&state).expect("run");
        let analysis = update.trace_analysis.expect("analysis");
        assert!(analysis.captures.is_empty());
        assert_eq!(analysis.warnings, vec!["no capture files available"]);
        assert_eq!(update.audit_trail[0].action, "trace_analyzed");
    }

    #[test]
    fn only_captures_of_the_latest_run_are_analyzed() {
        let root = std::env::temp_dir().join(format!(
            "routelab_trace_runs_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let (run1, run2) = (root.join("run_1"), root.join("run_2"));
        fs::create_dir_all(&run1).expect("run1");
        fs::create_dir_all(&run2).expect("run2");
        write_capture(&run1.join("capture-0-0.pcap"), 100);
        write_capture(&run2.join("capture-0-0.pcap"), 3);

        let mut state = ExperimentState::new("t", 3, 1);
        state.pcap_files = vec![
            run1.join("capture-0-0.pcap").to_string_lossy().into_owned(),
            run2.join("capture-0-0.pcap").to_string_lossy().into_owned(),
        ];
        state.simulation_logs = Some(run2.join("sim_2.xml").to_string_lossy().into_owned());

        let update = TraceAnalyzer::new().run(&state).expect("run");
        let analysis = update.trace_analysis.expect("analysis");
        assert_eq!(analysis.captures.len(), 1);
        assert_eq!(analysis.total_packets, 3);
        assert!(analysis.warnings.is_empty());
        let _ = fs::remove_dir_all(&root);
    }
}
