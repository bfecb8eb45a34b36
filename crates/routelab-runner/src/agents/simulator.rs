use super::{Node, SIMULATOR};
use crate::simulator::{RunArtifacts, SimulationOutcome, SimulationRunner};
use anyhow::Result;
use routelab_core::{ErrorType, ExperimentState, SimulationStatus, StateUpdate};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Graph node wrapping [`SimulationRunner`].
pub struct SimulatorNode {
    runner: SimulationRunner,
}

impl SimulatorNode {
    pub fn new(runner: SimulationRunner) -> Self {
        Self { runner }
    }
}

fn path_string(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

fn artifact_details(artifacts: &RunArtifacts) -> Value {
    json!({
        "run_id": artifacts.run_id,
        "run_dir": path_string(&artifacts.run_dir),
        "script": path_string(&artifacts.script_backup),
        "exit_code": artifacts.exit_code,
        "elapsed_secs": artifacts.elapsed_secs,
    })
}

fn failed(kind: ErrorType, message: &str, action: &str, details: Value) -> StateUpdate {
    let mut update = StateUpdate::audited(SIMULATOR, action, details).with_error(kind.message(message));
    update.simulation_status = Some(SimulationStatus::Failed);
    update.error_type = Some(kind);
    update
}

impl Node for SimulatorNode {
    fn name(&self) -> &'static str {
        SIMULATOR
    }

    fn run(&mut self, state: &ExperimentState) -> Result<StateUpdate> {
        let outcome = self.runner.run(&state.code_snippet)?;
        let update = match outcome {
            SimulationOutcome::Completed { artifacts, warning } => {
                if let Some(w) = &warning {
                    warn!(agent = SIMULATOR, run_id = %artifacts.run_id, warning = %w, "simulation finished with a warning");
                }
                info!(
                    agent = SIMULATOR,
                    run_id = %artifacts.run_id,
                    captures = artifacts.captures.len(),
                    elapsed_secs = artifacts.elapsed_secs,
                    "simulation completed"
                );
                let mut details = artifact_details(&artifacts);
                details["metrics"] = json!(artifacts.metrics_path.as_deref().map(path_string));
                details["captures"] = json!(artifacts.captures.len());
                details["warning"] = json!(warning);
                let mut update = StateUpdate::audited(SIMULATOR, "simulation_completed", details);
                update.simulation_status = Some(SimulationStatus::Completed);
                update.simulation_logs = Some(path_string(artifacts.log_path()));
                update.pcap_files = artifacts.captures.iter().map(|p| path_string(p)).collect();
                update.error_type = Some(ErrorType::NoError);
                update
            }
            SimulationOutcome::CompilationError { message, artifacts } => {
                warn!(agent = SIMULATOR, message = %message, "script failed to load");
                let mut details = artifacts.as_ref().map_or_else(|| json!({}), artifact_details);
                details["message"] = json!(message);
                details["launched"] = json!(artifacts.is_some());
                let mut update = failed(ErrorType::CompilationError, &message, "compilation_error", details);
                if artifacts.is_none() {
                    update.code_validated = Some(false);
                    update.critic_approved = Some(false);
                }
                update
            }
            SimulationOutcome::SimulationError { message, artifacts } => {
                warn!(agent = SIMULATOR, run_id = %artifacts.run_id, message = %message, "simulation failed");
                let mut details = artifact_details(&artifacts);
                details["message"] = json!(message);
                failed(ErrorType::SimulationError, &message, "simulation_error", details)
            }
            SimulationOutcome::Timeout { message, artifacts } => {
                warn!(agent = SIMULATOR, run_id = %artifacts.run_id, "simulation timed out");
                let mut details = artifact_details(&artifacts);
                details["message"] = json!(message);
                failed(ErrorType::TimeoutError, &message, "timeout", details)
            }
        };
        Ok(update)
    }

    fn system_error(&self, _state: &ExperimentState, error: &anyhow::Error) -> StateUpdate {
        let mut update = super::system_error_update(SIMULATOR, error);
        update.simulation_status = Some(SimulationStatus::Failed);
        update
    }
}
