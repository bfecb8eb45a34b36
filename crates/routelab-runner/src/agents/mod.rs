//! Agent nodes. Each node reads the blackboard and returns a partial update;
//! none of them touch the state directly.

mod analyst;
mod archivist;
mod coder;
mod critic;
pub mod hints;
mod optimizer;
mod researcher;
mod simulator;
mod trace_analyzer;
mod visualizer;

pub use analyst::Analyst;
pub use archivist::Archivist;
pub use coder::{baseline_script, ensure_imports, extract_code, Coder, CoderSettings};
pub use critic::{parse_verdict, Critic, Verdict, VerdictSource};
pub use optimizer::{Optimizer, OPTIMIZATION_NOTE_PREFIX};
pub use researcher::Researcher;
pub use simulator::SimulatorNode;
pub use trace_analyzer::TraceAnalyzer;
pub use visualizer::Visualizer;

use crate::config::ReasoningConfig;
use crate::llm::{BackendError, CompletionRequest, ReasoningClient};
use crate::prompts::PromptBook;
use anyhow::Result;
use routelab_core::{ErrorType, ExperimentState, StateUpdate};
use serde_json::json;
use std::path::PathBuf;
use tracing::debug;

pub const RESEARCHER: &str = "researcher";
pub const CODER: &str = "coder";
pub const CRITIC: &str = "critic";
pub const SIMULATOR: &str = "simulator";
pub const TRACE_ANALYZER: &str = "trace_analyzer";
pub const ANALYST: &str = "analyst";
pub const OPTIMIZER: &str = "optimizer";
pub const VISUALIZER: &str = "visualizer";
pub const ARCHIVIST: &str = "archivist";

pub trait Node: Send {
    fn name(&self) -> &'static str;

    fn run(&mut self, state: &ExperimentState) -> Result<StateUpdate>;

    /// Update recorded when `run` returns an error.
    fn system_error(&self, _state: &ExperimentState, error: &anyhow::Error) -> StateUpdate {
        system_error_update(self.name(), error)
    }
}

/// `error_type` is reset so the last recorded error keeps matching it.
pub fn system_error_update(agent: &str, error: &anyhow::Error) -> StateUpdate {
    let message = format!("SystemError: {:#}", error);
    let mut update = StateUpdate::audited(agent, "system_error", json!({ "error": message }))
        .with_error(message);
    update.error_type = Some(ErrorType::NoError);
    update
}

/// Shared handles for nodes that talk to the reasoning backend.
pub struct AgentContext {
    pub client: ReasoningClient,
    pub prompts: PromptBook,
    pub reasoning: ReasoningConfig,
    pub results_root: PathBuf,
}

impl AgentContext {
    pub fn ask(
        &self,
        agent: &str,
        stage: &str,
        model: &str,
        temperature: f32,
        prompt: String,
    ) -> std::result::Result<String, BackendError> {
        debug!(agent, stage, model, chars = prompt.len(), "reasoning request");
        let request = CompletionRequest::new(agent, stage, model, temperature, prompt);
        self.client.complete(&request)
    }
}

/// Run directory of the latest completed simulation, if any.
pub(crate) fn run_dir_of(state: &ExperimentState) -> Option<PathBuf> {
    if let Some(dir) = state
        .analysis_results
        .as_ref()
        .and_then(|a| a.run_dir.as_deref())
    {
        return Some(PathBuf::from(dir));
    }
    state
        .simulation_logs
        .as_deref()
        .and_then(|p| std::path::Path::new(p).parent())
        .map(PathBuf::from)
}

pub(crate) fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("\n...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use routelab_core::{AnalysisResults, ExperimentState};

    #[test]
    fn system_error_update_keeps_last_error_invariant() {
        let mut state = ExperimentState::new("t", 3, 1);
        state
            .apply(
                StateUpdate::audited("simulator", "timeout", json!({}))
                    .with_error(ErrorType::TimeoutError.message("too slow")),
            )
            .expect("seed error");
        let mut seeded = StateUpdate::new();
        seeded.error_type = Some(ErrorType::TimeoutError);
        state.apply(seeded).expect("error type");

        let update = system_error_update("analyst", &anyhow!("disk full"));
        state.apply(update).expect("system error merges");
        assert_eq!(state.error_type, ErrorType::NoError);
        assert_eq!(state.last_error(), Some("SystemError: disk full"));
        assert_eq!(
            state.audit_trail.last().map(|a| a.action.as_str()),
            Some("system_error")
        );
    }

    #[test]
    fn run_dir_prefers_analysis_then_log_parent() {
        let mut state = ExperimentState::new("t", 3, 1);
        assert!(run_dir_of(&state).is_none());
        state.simulation_logs = Some("/r/20240101_000000/sim.xml".to_string());
        assert_eq!(run_dir_of(&state), Some(PathBuf::from("/r/20240101_000000")));
        state.analysis_results = Some(AnalysisResults {
            run_dir: Some("/other".to_string()),
            ..AnalysisResults::default()
        });
        assert_eq!(run_dir_of(&state), Some(PathBuf::from("/other")));
    }

    #[test]
    fn excerpt_truncates_on_char_boundaries() {
        assert_eq!(excerpt("abc", 5), "abc");
        assert_eq!(excerpt("ñandú", 2), "ña\n...");
    }
}
