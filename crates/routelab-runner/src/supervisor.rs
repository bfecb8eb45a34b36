//! Wires the agent nodes into the experiment graph and drives it one
//! checkpointed step at a time.

use crate::agents::{
    Analyst, Archivist, Coder, CoderSettings, Critic, Optimizer, Researcher, SimulatorNode,
    TraceAnalyzer, Visualizer, AgentContext, ANALYST, ARCHIVIST, CODER, CRITIC, OPTIMIZER,
    RESEARCHER, SIMULATOR, TRACE_ANALYZER, VISUALIZER,
};
use crate::checkpoint::{CheckpointStore, CheckpointWriter};
use crate::config::Config;
use crate::graph::{CompiledGraph, StateGraph, END, START};
use crate::llm::{backend_from_config, ReasoningBackend, ReasoningClient, RetryPolicy};
use crate::memory::EpisodicMemory;
use crate::prompts::PromptBook;
use crate::routing::{
    after_analyst, after_coder, after_critic, after_simulator, ROUTE_CODER, ROUTE_CRITIC,
    ROUTE_END, ROUTE_OPTIMIZER, ROUTE_RETRY, ROUTE_SIMULATOR, ROUTE_TRACE_ANALYZER,
    ROUTE_VISUALIZER,
};
use crate::simulator::SimulationRunner;
use crate::validator::Validator;
use anyhow::{anyhow, Result};
use routelab_core::{sha256_hex, ExperimentState, StateUpdate};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub const SUPERVISOR: &str = "supervisor";

#[derive(Debug, Clone, Default)]
pub struct ExperimentRequest {
    pub task: String,
    pub thread_id: Option<String>,
    pub max_iterations: Option<u32>,
    pub seed: Option<u64>,
}

impl ExperimentRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }
}

/// One completed node, as streamed to observers.
#[derive(Debug, Clone, Serialize)]
pub struct StepEvent {
    pub thread_id: String,
    pub step: u64,
    pub node: String,
    pub update: StateUpdate,
    pub next: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentOutcome {
    pub thread_id: String,
    pub steps: u64,
    pub resumed: bool,
    pub state: ExperimentState,
}

/// Deterministic seed in `1..=u32::MAX` derived from the thread id.
pub fn seed_for_thread(thread_id: &str) -> u64 {
    let digest = sha256_hex(thread_id.as_bytes());
    let head = u64::from_str_radix(&digest[..16], 16).unwrap_or(0);
    head % u64::from(u32::MAX) + 1
}

pub struct Supervisor {
    config: Config,
    backend: Arc<dyn ReasoningBackend>,
    prompts: PromptBook,
    store: CheckpointStore,
}

impl Supervisor {
    pub fn new(config: Config, backend: Arc<dyn ReasoningBackend>) -> Result<Self> {
        let prompts = PromptBook::load(config.prompts.override_dir.as_deref())?;
        let store = CheckpointStore::new(config.paths.checkpoint_root.clone());
        Ok(Self {
            config,
            backend,
            prompts,
            store,
        })
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let backend = backend_from_config(&config.reasoning)?;
        Self::new(config, backend)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Builds a fresh graph. Nodes own their per-run resources (memory
    /// handle, simulator runner).
    pub fn build_graph(&self) -> Result<CompiledGraph> {
        let cfg = &self.config;
        let ctx = Arc::new(AgentContext {
            client: ReasoningClient::new(self.backend.clone(), RetryPolicy::from_config(&cfg.reasoning)),
            prompts: self.prompts.clone(),
            reasoning: cfg.reasoning.clone(),
            results_root: cfg.paths.results_root.clone(),
        });
        let memory = if cfg.memory.enabled {
            Some(EpisodicMemory::open(
                &cfg.paths.memory_path,
                cfg.memory.relevance_threshold,
                cfg.memory.top_k,
            )?)
        } else {
            None
        };
        let validator = Validator::new(cfg.validator.clone());
        let coder = Coder::new(
            ctx.clone(),
            validator.clone(),
            memory,
            CoderSettings {
                metrics_file: cfg.simulator.metrics_file.clone(),
                capture_prefix: cfg.simulator.capture_prefix.clone(),
                memory_excerpt_chars: cfg.memory.excerpt_chars,
            },
        );
        let runner = SimulationRunner::new(cfg.simulator.clone(), cfg.paths.results_root.clone(), validator);
        let thresholds = cfg.optimization;

        let mut graph = StateGraph::new();
        graph
            .add_node(Box::new(Researcher::new(ctx.clone(), cfg.research.clone())))
            .add_node(Box::new(coder))
            .add_node(Box::new(Critic::new(ctx.clone())))
            .add_node(Box::new(SimulatorNode::new(runner)))
            .add_node(Box::new(TraceAnalyzer::new()))
            .add_node(Box::new(Analyst::new(ctx.clone())))
            .add_node(Box::new(Optimizer::new(ctx)))
            .add_node(Box::new(Visualizer::new()))
            .add_node(Box::new(Archivist::new(cfg.paths.results_root.clone())))
            .set_entry_point(RESEARCHER)
            .add_edge(RESEARCHER, CODER)
            .add_conditional_edges(
                CODER,
                Box::new(|s: &ExperimentState| after_coder(s).to_string()),
                &[(ROUTE_CRITIC, CRITIC), (ROUTE_RETRY, CODER), (ROUTE_END, END)],
            )
            .add_conditional_edges(
                CRITIC,
                Box::new(|s: &ExperimentState| after_critic(s).to_string()),
                &[(ROUTE_SIMULATOR, SIMULATOR), (ROUTE_CODER, CODER), (ROUTE_END, END)],
            )
            .add_conditional_edges(
                SIMULATOR,
                Box::new(|s: &ExperimentState| after_simulator(s).to_string()),
                &[
                    (ROUTE_TRACE_ANALYZER, TRACE_ANALYZER),
                    (ROUTE_CODER, CODER),
                    (ROUTE_END, END),
                ],
            )
            .add_edge(TRACE_ANALYZER, ANALYST)
            .add_conditional_edges(
                ANALYST,
                Box::new(move |s: &ExperimentState| after_analyst(s, &thresholds).to_string()),
                &[(ROUTE_OPTIMIZER, OPTIMIZER), (ROUTE_VISUALIZER, VISUALIZER)],
            )
            .add_edge(OPTIMIZER, CODER)
            .add_edge(VISUALIZER, ARCHIVIST)
            .add_edge(ARCHIVIST, END);
        Ok(graph.compile()?)
    }

    /// Opens (or creates) a thread and returns an iterator over its remaining
    /// steps. The thread's writer lock is held until the run is dropped.
    pub fn stream(&self, request: ExperimentRequest) -> Result<ExperimentRun> {
        let thread_id = request
            .thread_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if request.task.trim().is_empty() && self.store.steps(&thread_id)?.is_empty() {
            return Err(anyhow!("task must not be empty"));
        }
        let writer = self.store.writer(&thread_id)?;
        let graph = self.build_graph()?;

        if let Some(cp) = self.store.latest(&thread_id)? {
            if !request.task.is_empty() && request.task != cp.state.task {
                warn!(thread_id = %thread_id, "task differs from the stored thread; continuing the stored task");
            }
            if request
                .max_iterations
                .map_or(false, |m| m != cp.state.max_iterations)
            {
                warn!(thread_id = %thread_id, "max_iterations is fixed for an existing thread");
            }
            info!(thread_id = %thread_id, step = cp.step, next = %cp.next, "resuming thread");
            return Ok(ExperimentRun {
                thread_id,
                graph,
                writer,
                state: cp.state,
                step: cp.step,
                next: cp.next,
                resumed: true,
                failed: false,
            });
        }

        let max_iterations = request
            .max_iterations
            .unwrap_or(self.config.experiment.max_iterations)
            .max(1);
        let seed = request
            .seed
            .or(self.config.experiment.seed)
            .unwrap_or_else(|| seed_for_thread(&thread_id));
        let mut state = ExperimentState::new(request.task.trim(), max_iterations, seed);
        state.apply(StateUpdate::audited(
            SUPERVISOR,
            "workflow_started",
            json!({
                "thread_id": thread_id,
                "max_iterations": max_iterations,
                "simulation_seed": seed,
                "backend": self.backend.name(),
            }),
        ))?;
        let entry = graph.entry().to_string();
        writer.commit(0, START, &entry, &state)?;
        info!(thread_id = %thread_id, seed, max_iterations, "experiment started");
        Ok(ExperimentRun {
            thread_id,
            graph,
            writer,
            state,
            step: 0,
            next: entry,
            resumed: false,
            failed: false,
        })
    }

    pub fn run_experiment(
        &self,
        task: &str,
        thread_id: Option<&str>,
        max_iterations: Option<u32>,
    ) -> Result<ExperimentOutcome> {
        self.stream(ExperimentRequest {
            task: task.to_string(),
            thread_id: thread_id.map(str::to_string),
            max_iterations,
            seed: None,
        })?
        .finish()
    }

    /// Continues an existing thread with its stored task.
    pub fn resume(&self, thread_id: &str) -> Result<ExperimentOutcome> {
        if self.store.latest(thread_id)?.is_none() {
            return Err(anyhow!("thread_not_found: no checkpoints for thread {}", thread_id));
        }
        self.stream(ExperimentRequest {
            thread_id: Some(thread_id.to_string()),
            ..ExperimentRequest::default()
        })?
        .finish()
    }
}

/// A thread in progress. Iterating runs one node per item and commits a
/// checkpoint after each.
pub struct ExperimentRun {
    thread_id: String,
    graph: CompiledGraph,
    writer: CheckpointWriter,
    state: ExperimentState,
    step: u64,
    next: String,
    resumed: bool,
    failed: bool,
}

impl ExperimentRun {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn state(&self) -> &ExperimentState {
        &self.state
    }

    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn is_finished(&self) -> bool {
        self.next == END || self.failed
    }

    /// Drains the remaining steps and returns the final state.
    pub fn finish(mut self) -> Result<ExperimentOutcome> {
        for event in self.by_ref() {
            event?;
        }
        info!(
            thread_id = %self.thread_id,
            steps = self.step,
            status = %self.state.simulation_status,
            iterations = self.state.iteration_count,
            "experiment finished"
        );
        Ok(ExperimentOutcome {
            thread_id: self.thread_id,
            steps: self.step,
            resumed: self.resumed,
            state: self.state,
        })
    }

    fn advance(&mut self) -> Result<StepEvent> {
        let node = self.next.clone();
        let result = self.graph.step(&node, &mut self.state)?;
        let step = self.step + 1;
        self.writer.commit(step, &node, &result.next, &self.state)?;
        self.step = step;
        info!(
            thread_id = %self.thread_id,
            step,
            node = %node,
            next = %result.next,
            iteration = self.state.iteration_count,
            "step committed"
        );
        self.next = result.next.clone();
        Ok(StepEvent {
            thread_id: self.thread_id.clone(),
            step,
            node,
            update: result.update,
            next: result.next,
        })
    }
}

impl Iterator for ExperimentRun {
    type Item = Result<StepEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_finished() {
            return None;
        }
        let event = self.advance();
        if event.is_err() {
            self.failed = true;
        }
        Some(event)
    }
}
