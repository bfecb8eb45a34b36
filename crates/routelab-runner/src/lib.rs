//! Orchestration runtime for routelab: configuration, reasoning backends,
//! episodic memory, script validation and execution, the agent nodes, and
//! the checkpointed graph that ties them together, plus sequential batch
//! studies over it.

pub mod agents;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod graph;
pub mod llm;
pub mod memory;
pub mod process;
pub mod prompts;
pub mod routing;
pub mod simulator;
pub mod supervisor;
pub mod validator;

pub use batch::{run_batch, BatchPlan, BatchReport, BatchRun, BatchRunStatus, Scenario};
pub use checkpoint::{Checkpoint, CheckpointStore, CheckpointWriter, ThreadSummary, CHECKPOINT_SCHEMA};
pub use config::{write_default_config, Config, DEFAULT_CONFIG_FILE};
pub use graph::{CompiledGraph, GraphError, StateGraph, END, START};
pub use llm::{
    backend_from_config, BackendError, CompletionRequest, OfflineBackend, OllamaBackend,
    ReasoningBackend, ReasoningClient, RetryPolicy,
};
pub use memory::{EpisodicMemory, MemoryHit, MemoryRecord};
pub use prompts::PromptBook;
pub use simulator::{RunArtifacts, SimulationOutcome, SimulationRunner};
pub use supervisor::{
    seed_for_thread, ExperimentOutcome, ExperimentRequest, ExperimentRun, StepEvent, Supervisor,
};
pub use validator::{ValidationReport, Validator, VALID_MESSAGE};
