#![cfg(unix)]

use chrono::Utc;
use routelab_core::{ErrorType, ExperimentState, SimulationStatus};
use routelab_runner::agents::OPTIMIZATION_NOTE_PREFIX;
use routelab_runner::config::ValidatorConfig;
use routelab_runner::{
    BackendError, CompletionRequest, Config, EpisodicMemory, ExperimentOutcome, ExperimentRequest,
    OfflineBackend, ReasoningBackend, StepEvent, Supervisor, Validator,
};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const TASK: &str = "simulate AODV with 10 nodes for 100 seconds";

const VALID_AODV: &str = "```python\nimport ns.core\nimport ns.network\nimport ns.aodv\n\ndef main():\n    ns.core.RngSeedManager.SetSeed(12345)\n    aodv = ns.aodv.AodvHelper()\n    ns.core.Simulator.Stop(ns.core.Seconds(100.0))\n    ns.core.Simulator.Run()\n    ns.core.Simulator.Destroy()\n\nif __name__ == \"__main__\":\n    main()\n```";

const VALID_DSDV: &str = "```python\nimport ns.core\nimport ns.network\nimport ns.dsdv\n\ndef main():\n    ns.core.RngSeedManager.SetSeed(12345)\n    dsdv = ns.dsdv.DsdvHelper()\n    ns.core.Simulator.Stop(ns.core.Seconds(100.0))\n    ns.core.Simulator.Run()\n    ns.core.Simulator.Destroy()\n\nif __name__ == \"__main__\":\n    main()\n```";

const NO_ENTRY_POINT: &str = "```python\nimport ns.core\nimport ns.network\n\nns.core.Simulator.Stop(ns.core.Seconds(100.0))\nns.core.Simulator.Run()\nns.core.Simulator.Destroy()\n```";

const APPROVE: &str = r#"{"approved": true, "critique": "ok"}"#;
const REJECT: &str = r#"{"approved": false, "critique": "protocol mismatch"}"#;

/// Replies per (agent, stage). Each queue pops until one reply is left, which
/// then repeats. Unscripted stages report the backend as unavailable.
#[derive(Default)]
struct ScriptedBackend {
    replies: Mutex<HashMap<(String, String), VecDeque<String>>>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    fn new() -> Self {
        Self::default()
    }

    fn script(self, agent: &str, stage: &str, replies: &[&str]) -> Self {
        self.replies.lock().expect("replies lock").insert(
            (agent.to_string(), stage.to_string()),
            replies.iter().map(|r| r.to_string()).collect(),
        );
        self
    }

    fn prompts(&self, agent: &str, stage: &str) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|c| c.agent == agent && c.stage == stage)
            .map(|c| c.prompt.clone())
            .collect()
    }
}

impl ReasoningBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        self.calls.lock().expect("calls lock").push(request.clone());
        let mut replies = self.replies.lock().expect("replies lock");
        let key = (request.agent.clone(), request.stage.clone());
        match replies.get_mut(&key) {
            Some(queue) if queue.len() > 1 => Ok(queue.pop_front().unwrap_or_default()),
            Some(queue) => queue
                .front()
                .cloned()
                .ok_or_else(|| BackendError::Unavailable("empty script".to_string())),
            None => Err(BackendError::Unavailable(format!(
                "no scripted reply for {}/{}",
                request.agent, request.stage
            ))),
        }
    }
}

fn happy_backend() -> ScriptedBackend {
    ScriptedBackend::new()
        .script("coder", "generation", &[VALID_AODV])
        .script("critic", "review", &[APPROVE])
}

struct Lab {
    root: PathBuf,
}

impl Lab {
    fn new(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!(
            "routelab_scenario_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(root.join("work")).expect("workdir");
        Self { root }
    }

    fn fixture(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root.join(name);
        fs::write(&path, content).expect("write fixture");
        path
    }

    fn config(&self, simulator_body: &str) -> Config {
        let mut config = Config::default();
        config.paths.results_root = self.root.join("results");
        config.paths.checkpoint_root = self.root.join("checkpoints");
        config.paths.memory_path = self.root.join("memory").join("records.jsonl");
        config.experiment.max_iterations = 3;
        config.experiment.seed = Some(12345);
        config.simulator.command = vec![
            "sh".to_string(),
            "-c".to_string(),
            simulator_body.to_string(),
            "sim".to_string(),
        ];
        config.simulator.workdir = self.root.join("work");
        config.simulator.timeout_secs = 20;
        config
    }

    /// Simulator stand-in that always writes `xml` as the flow-metrics file.
    fn steady_simulator(&self, xml: &str) -> String {
        let fixture = self.fixture("flows.xml", xml);
        format!("cp '{}' results.xml; echo simulated", fixture.display())
    }
}

impl Drop for Lab {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

/// FlowMonitor document with one flow per `(tx, rx, mean delay ms)`.
fn flow_xml(flows: &[(u64, u64, f64)]) -> String {
    let mut out = String::from("<?xml version=\"1.0\" ?>\n<FlowMonitor>\n  <FlowStats>\n");
    for (i, (tx, rx, delay_ms)) in flows.iter().enumerate() {
        let delay_sum_ns = *rx as f64 * delay_ms * 1e6;
        out.push_str(&format!(
            "    <Flow flowId=\"{}\" timeFirstTxPacket=\"+1e+09ns\" timeLastRxPacket=\"+9e+09ns\" delaySum=\"+{}ns\" jitterSum=\"+0.0ns\" txBytes=\"{}\" rxBytes=\"{}\" txPackets=\"{}\" rxPackets=\"{}\" lostPackets=\"{}\">\n    </Flow>\n",
            i + 1,
            delay_sum_ns,
            tx * 512,
            rx * 512,
            tx,
            rx,
            tx - rx
        ));
    }
    out.push_str("  </FlowStats>\n</FlowMonitor>\n");
    out
}

fn good_flows() -> String {
    flow_xml(&[(100, 92, 40.0), (100, 92, 40.0)])
}

fn poor_flows() -> String {
    flow_xml(&[(100, 100, 150.0), (100, 90, 150.0), (100, 90, 150.0), (100, 0, 0.0)])
}

fn supervisor(config: Config, backend: &Arc<ScriptedBackend>) -> Supervisor {
    let backend: Arc<dyn ReasoningBackend> = backend.clone();
    Supervisor::new(config, backend).expect("supervisor")
}

fn drive(supervisor: &Supervisor, request: ExperimentRequest) -> (Vec<StepEvent>, ExperimentOutcome) {
    let mut run = supervisor.stream(request).expect("stream");
    let events = run
        .by_ref()
        .collect::<anyhow::Result<Vec<_>>>()
        .expect("every step commits");
    let outcome = run.finish().expect("finish");
    (events, outcome)
}

fn run_task(supervisor: &Supervisor, thread_id: &str) -> (Vec<StepEvent>, ExperimentOutcome) {
    drive(
        supervisor,
        ExperimentRequest {
            thread_id: Some(thread_id.to_string()),
            ..ExperimentRequest::new(TASK)
        },
    )
}

fn visited(events: &[StepEvent]) -> Vec<&str> {
    events.iter().map(|e| e.node.as_str()).collect()
}

fn actions(state: &ExperimentState) -> Vec<(String, String)> {
    state
        .audit_trail
        .iter()
        .map(|a| (a.agent.clone(), a.action.clone()))
        .collect()
}

fn assert_well_formed(events: &[StepEvent], state: &ExperimentState) {
    assert!(events.iter().all(|e| !e.update.audit_trail.is_empty()));
    assert!(state.iteration_count <= state.max_iterations);
    assert!(state.optimization_count <= 2);
    state.check_invariants().expect("final state invariants");
    if state.simulation_status == SimulationStatus::Completed {
        let log = state.simulation_logs.as_deref().expect("simulation log");
        assert!(Path::new(log).is_file(), "missing {}", log);
    }
}

#[test]
fn happy_path_reaches_visualizer_without_errors() {
    let lab = Lab::new("happy");
    let backend = Arc::new(happy_backend());
    let sup = supervisor(lab.config(&lab.steady_simulator(&good_flows())), &backend);
    let (events, outcome) = run_task(&sup, "happy");
    let state = &outcome.state;

    assert_eq!(
        visited(&events),
        vec![
            "researcher",
            "coder",
            "critic",
            "simulator",
            "trace_analyzer",
            "analyst",
            "visualizer",
            "archivist"
        ]
    );
    assert_eq!(events.last().map(|e| e.next.as_str()), Some("__end__"));
    assert_eq!(state.simulation_status, SimulationStatus::Completed);
    assert_eq!(state.optimization_count, 0);
    assert_eq!(state.iteration_count, 1);
    assert!(state.errors.is_empty(), "{:?}", state.errors);
    assert_eq!(state.simulation_seed, 12345);
    assert!((state.metric("avg_pdr").expect("pdr") - 92.0).abs() < 1e-9);
    assert!((state.metric("avg_delay").expect("delay") - 40.0).abs() < 1e-6);
    assert!((state.metric("success_rate").expect("success") - 100.0).abs() < 1e-9);
    assert!(!state.plots_generated.is_empty());
    assert!(state.plots_generated.iter().all(|p| Path::new(p).is_file()));
    assert_eq!(
        state.audit_trail.last().map(|a| a.action.as_str()),
        Some("archived")
    );
    assert_well_formed(&events, state);

    let checkpoints = sup.store().list("happy").expect("checkpoints");
    assert_eq!(checkpoints.len() as u64, outcome.steps + 1);
    assert_eq!(checkpoints[0].node, "__start__");
    assert_eq!(backend.prompts("critic", "review").len(), 1);
}

#[test]
fn compilation_failure_is_retried_then_simulated() {
    let lab = Lab::new("compile");
    let backend = Arc::new(
        ScriptedBackend::new()
            .script("coder", "generation", &[NO_ENTRY_POINT, VALID_AODV])
            .script("critic", "review", &[APPROVE]),
    );
    let sup = supervisor(lab.config(&lab.steady_simulator(&good_flows())), &backend);
    let (events, outcome) = run_task(&sup, "compile");
    let state = &outcome.state;

    assert_eq!(&visited(&events)[..5], &["researcher", "coder", "coder", "critic", "simulator"]);
    assert_eq!(events[1].update.error_type, Some(ErrorType::CompilationError));
    assert_eq!(events[1].next, "coder");
    assert!(state.iteration_count >= 2);
    assert_eq!(state.simulation_status, SimulationStatus::Completed);
    assert_eq!(state.errors.len(), 1);
    assert!(state.errors[0].starts_with("CompilationError: Missing entry point"));

    let generations = backend.prompts("coder", "generation");
    assert_eq!(generations.len(), 2);
    assert!(!generations[0].contains("Previous attempt failed"));
    assert!(generations[1].contains("Error class: CompilationError"));
    assert!(generations[1].contains("Missing entry point"));

    // The fix is remembered for later experiments.
    assert!(actions(state).contains(&("coder".to_string(), "memory_stored".to_string())));
    let memory = EpisodicMemory::open(&lab.root.join("memory").join("records.jsonl"), 0.35, 3)
        .expect("memory");
    assert_eq!(memory.len(), 1);
    assert!(memory.records()[0].solution_code.contains("AodvHelper"));
    assert_well_formed(&events, state);
}

#[test]
fn critic_rejection_loops_back_to_coder() {
    let lab = Lab::new("critic");
    let backend = Arc::new(
        ScriptedBackend::new()
            .script("coder", "generation", &[VALID_DSDV, VALID_AODV])
            .script("critic", "review", &[REJECT, APPROVE]),
    );
    let sup = supervisor(lab.config(&lab.steady_simulator(&good_flows())), &backend);
    let (events, outcome) = run_task(&sup, "critic");
    let state = &outcome.state;

    let nodes = visited(&events);
    let first_sim = nodes
        .iter()
        .position(|n| *n == "simulator")
        .expect("simulator visited");
    assert_eq!(nodes[..first_sim].iter().filter(|n| **n == "coder").count(), 2);
    assert_eq!(&nodes[..first_sim], &["researcher", "coder", "critic", "coder", "critic"]);
    assert_eq!(state.critique, "ok");
    assert!(state.critic_approved);
    assert!(state.code_snippet.contains("AodvHelper"));
    assert_eq!(state.simulation_status, SimulationStatus::Completed);

    let generations = backend.prompts("coder", "generation");
    assert!(generations[1].contains("protocol mismatch"));
    assert!(generations[1].contains("Error class: LogicError"));
    assert_well_formed(&events, state);
}

#[test]
fn poor_metrics_trigger_one_optimization_cycle() {
    let lab = Lab::new("optimize");
    let good = lab.fixture("good.xml", &good_flows());
    let poor = lab.fixture("poor.xml", &poor_flows());
    let body = format!(
        "if [ -f ran_once ]; then cp '{}' results.xml; else touch ran_once; cp '{}' results.xml; fi",
        good.display(),
        poor.display()
    );
    let backend = Arc::new(happy_backend());
    let sup = supervisor(lab.config(&body), &backend);
    let (events, outcome) = run_task(&sup, "optimize");
    let state = &outcome.state;

    let nodes = visited(&events);
    assert_eq!(nodes.iter().filter(|n| **n == "optimizer").count(), 1);
    assert_eq!(nodes.iter().filter(|n| **n == "simulator").count(), 2);
    assert_eq!(&nodes[nodes.len() - 2..], &["visualizer", "archivist"]);

    let first_analysis = events
        .iter()
        .find(|e| e.node == "analyst")
        .expect("analyst step");
    let first_metrics = first_analysis.update.metrics.as_ref().expect("metrics");
    assert!((first_metrics["avg_pdr"] - 70.0).abs() < 1e-9);
    assert!((first_metrics["success_rate"] - 75.0).abs() < 1e-9);
    assert_eq!(first_analysis.next, "optimizer");

    let optimizer = events
        .iter()
        .find(|e| e.node == "optimizer")
        .expect("optimizer step");
    assert_eq!(optimizer.update.code_snippet.as_deref(), Some(""));
    assert_eq!(optimizer.update.optimization_count, Some(1));

    assert_eq!(state.optimization_count, 1);
    assert_eq!(state.iteration_count, 2);
    assert!(state
        .research_notes
        .iter()
        .any(|n| n.starts_with(OPTIMIZATION_NOTE_PREFIX)));
    assert!((state.metric("avg_pdr").expect("pdr") - 92.0).abs() < 1e-9);
    assert_eq!(state.simulation_status, SimulationStatus::Completed);
    assert_well_formed(&events, state);
}

#[test]
fn repeated_timeouts_end_cleanly() {
    let lab = Lab::new("timeout");
    let backend = Arc::new(happy_backend());
    let mut config = lab.config("echo x > capture-0-0.pcap; sleep 30");
    config.simulator.timeout_secs = 1;
    let sup = supervisor(config, &backend);
    let (events, outcome) = drive(
        &sup,
        ExperimentRequest {
            thread_id: Some("timeout".to_string()),
            max_iterations: Some(2),
            ..ExperimentRequest::new(TASK)
        },
    );
    let state = &outcome.state;

    assert_eq!(state.simulation_status, SimulationStatus::Failed);
    assert_eq!(state.error_type, ErrorType::TimeoutError);
    assert_eq!(state.iteration_count, 2);
    let timeouts = state
        .errors
        .iter()
        .filter(|e| e.starts_with("TimeoutError"))
        .count();
    assert!(timeouts >= 2, "{:?}", state.errors);
    assert_eq!(visited(&events).last(), Some(&"simulator"));
    assert_eq!(events.last().map(|e| e.next.as_str()), Some("__end__"));
    assert!(!lab.root.join("work").join("capture-0-0.pcap").exists());

    let generations = backend.prompts("coder", "generation");
    assert_eq!(generations.len(), 2);
    assert!(generations[1].contains("Error class: TimeoutError"));
    assert!(generations[1].contains("Reduce the simulation duration"));
    assert_well_formed(&events, state);
}

#[test]
fn remembered_fix_primes_the_retry() {
    let lab = Lab::new("memory");
    let config = lab.config(&lab.steady_simulator(&good_flows()));
    let failure = Validator::new(ValidatorConfig::default())
        .validate(NO_ENTRY_POINT)
        .message;
    let mut memory = EpisodicMemory::open(&config.paths.memory_path, 0.35, 3).expect("memory");
    memory
        .store(
            TASK,
            NO_ENTRY_POINT,
            &ErrorType::CompilationError.message(&failure),
            "REMEMBERED_FIX = True",
        )
        .expect("seed memory");

    let backend = Arc::new(
        ScriptedBackend::new()
            .script("coder", "generation", &[NO_ENTRY_POINT, VALID_AODV])
            .script("critic", "review", &[APPROVE]),
    );
    let sup = supervisor(config, &backend);
    let (events, outcome) = run_task(&sup, "memory");

    let generations = backend.prompts("coder", "generation");
    assert!(!generations[0].contains("REMEMBERED_FIX"));
    assert!(generations[1].contains("REMEMBERED_FIX = True"));
    assert!(generations[1].contains("relevance 1.00"));

    let second_coder = events
        .iter()
        .filter(|e| e.node == "coder")
        .nth(1)
        .expect("second coder step");
    assert!(second_coder
        .update
        .audit_trail
        .iter()
        .any(|a| a.action == "memory_hit"));
    assert_eq!(outcome.state.simulation_status, SimulationStatus::Completed);
}

#[test]
fn invalid_code_on_every_attempt_never_simulates() {
    let lab = Lab::new("invalid");
    let backend = Arc::new(ScriptedBackend::new().script("coder", "generation", &[NO_ENTRY_POINT]));
    let sup = supervisor(lab.config("touch launched"), &backend);
    let (events, outcome) = run_task(&sup, "invalid");

    assert_eq!(visited(&events), vec!["researcher", "coder", "coder", "coder"]);
    assert_eq!(outcome.steps, 4);
    assert!(!outcome.state.code_validated);
    assert_eq!(outcome.state.iteration_count, 3);
    assert_eq!(outcome.state.error_type, ErrorType::CompilationError);
    assert_eq!(outcome.state.errors.len(), 3);
    assert!(!lab.root.join("work").join("launched").exists());
    // The last attempt gets one in-node correction pass.
    assert_eq!(backend.prompts("coder", "generation").len(), 4);
}

#[test]
fn unparseable_verdict_bypasses_the_critic() {
    let lab = Lab::new("bypass");
    let backend = Arc::new(
        ScriptedBackend::new()
            .script("coder", "generation", &[VALID_AODV])
            .script("critic", "review", &["hmm"]),
    );
    let sup = supervisor(lab.config(&lab.steady_simulator(&good_flows())), &backend);
    let (events, outcome) = run_task(&sup, "bypass");

    let critic = events
        .iter()
        .find(|e| e.node == "critic")
        .expect("critic step");
    assert_eq!(critic.update.audit_trail[0].action, "error_bypass");
    assert_eq!(critic.next, "simulator");
    assert_eq!(outcome.state.simulation_status, SimulationStatus::Completed);
}

#[test]
fn offline_backend_still_completes_with_baseline_script() {
    let lab = Lab::new("offline");
    let config = lab.config(&lab.steady_simulator(&good_flows()));
    let sup = Supervisor::new(config, Arc::new(OfflineBackend)).expect("supervisor");
    let outcome = sup
        .run_experiment(TASK, Some("offline"), None)
        .expect("offline run");

    let coder_steps: Vec<_> = sup
        .store()
        .list("offline")
        .expect("checkpoints")
        .into_iter()
        .filter(|cp| cp.node == "coder")
        .collect();
    assert!(!coder_steps.is_empty());
    assert!(coder_steps.iter().all(|cp| cp.state.code_validated));
    assert_eq!(outcome.state.simulation_status, SimulationStatus::Completed);
    assert!(outcome.state.code_snippet.contains("AodvHelper"));
    assert!(outcome.state.code_snippet.contains("SetSeed(12345)"));
    assert!(outcome.state.analysis_results.is_some());
}

#[test]
fn resumed_thread_matches_uninterrupted_run() {
    let lab = Lab::new("resume");
    let config = lab.config(&lab.steady_simulator(&good_flows()));

    let straight_backend = Arc::new(happy_backend());
    let (_, straight) = run_task(&supervisor(config.clone(), &straight_backend), "straight");

    let first_backend = Arc::new(happy_backend());
    let first = supervisor(config.clone(), &first_backend);
    {
        let mut run = first
            .stream(ExperimentRequest {
                thread_id: Some("interrupted".to_string()),
                ..ExperimentRequest::new(TASK)
            })
            .expect("stream");
        for _ in 0..3 {
            run.next().expect("step").expect("step commits");
        }
    }
    let stored = first
        .store()
        .latest("interrupted")
        .expect("load")
        .expect("checkpoint");
    assert_eq!(stored.step, 3);
    assert_eq!(stored.next, "simulator");

    let second_backend = Arc::new(happy_backend());
    let resumed = supervisor(config, &second_backend)
        .resume("interrupted")
        .expect("resume");

    assert!(resumed.resumed);
    assert_eq!(resumed.steps, straight.steps);
    let (a, b) = (&resumed.state, &straight.state);
    assert_eq!(actions(a), actions(b));
    assert_eq!(a.metrics, b.metrics);
    assert_eq!(a.simulation_status, b.simulation_status);
    assert_eq!(a.iteration_count, b.iteration_count);
    assert_eq!(a.code_snippet, b.code_snippet);
    assert_eq!(a.critique, b.critique);
    assert_eq!(a.research_notes, b.research_notes);
    assert_eq!(a.errors, b.errors);
    assert_eq!(a.simulation_seed, b.simulation_seed);
    // The resumed half never re-ran the nodes before the interruption.
    assert!(second_backend.prompts("coder", "generation").is_empty());
    assert_eq!(second_backend.prompts("critic", "review").len(), 0);
}

#[test]
fn second_writer_on_a_live_thread_is_refused() {
    let lab = Lab::new("lock");
    let backend = Arc::new(happy_backend());
    let sup = supervisor(lab.config(&lab.steady_simulator(&good_flows())), &backend);
    let request = ExperimentRequest {
        thread_id: Some("busy".to_string()),
        ..ExperimentRequest::new(TASK)
    };
    let _live = sup.stream(request.clone()).expect("first writer");
    let err = sup.stream(request).err().expect("second writer refused");
    assert!(format!("{:#}", err).contains("operation_in_progress"));
}

#[test]
fn unknown_thread_cannot_be_resumed() {
    let lab = Lab::new("missing");
    let backend = Arc::new(happy_backend());
    let sup = supervisor(lab.config("true"), &backend);
    let err = sup.resume("nobody").expect_err("no checkpoints");
    assert!(err.to_string().starts_with("thread_not_found"));
}
