//! The experiment blackboard.
//!
//! Every node reads an [`ExperimentState`] and returns a [`StateUpdate`]; the
//! graph engine folds updates in with [`ExperimentState::apply`]. How a field
//! composes with its prior value is decided by the [`Field`] registry, never by
//! the node that wrote it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Hard cap on Analyst -> Optimizer round trips per experiment.
pub const MAX_OPTIMIZATION_CYCLES: u32 = 2;

pub mod metric {
    pub const AVG_PDR: &str = "avg_pdr";
    pub const STD_PDR: &str = "std_pdr";
    pub const MIN_PDR: &str = "min_pdr";
    pub const MAX_PDR: &str = "max_pdr";
    pub const AVG_THROUGHPUT: &str = "avg_throughput";
    pub const TOTAL_THROUGHPUT: &str = "total_throughput";
    pub const AVG_DELAY: &str = "avg_delay";
    pub const MEDIAN_DELAY: &str = "median_delay";
    pub const P95_DELAY: &str = "p95_delay";
    pub const AVG_JITTER: &str = "avg_jitter";
    pub const SUCCESS_RATE: &str = "success_rate";
    pub const TOTAL_PACKETS: &str = "total_packets";
    pub const LOST_PACKETS: &str = "lost_packets";
    pub const NETWORK_EFFICIENCY: &str = "network_efficiency";
    pub const ROUTING_OVERHEAD: &str = "routing_overhead";
    pub const FLOW_COUNT: &str = "flow_count";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl SimulationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SimulationStatus::Pending => "pending",
            SimulationStatus::Running => "running",
            SimulationStatus::Completed => "completed",
            SimulationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classification of the most recent attempt.
///
/// Serialized with the class names used in error messages, so that
/// `"CompilationError: ..."` entries in `errors` line up with the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorType {
    CompilationError,
    SimulationError,
    TimeoutError,
    #[default]
    #[serde(rename = "None")]
    NoError,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::CompilationError => "CompilationError",
            ErrorType::SimulationError => "SimulationError",
            ErrorType::TimeoutError => "TimeoutError",
            ErrorType::NoError => "None",
        }
    }

    pub fn is_failure(self) -> bool {
        !matches!(self, ErrorType::NoError)
    }

    /// Formats an `errors` entry tagged with this classification.
    pub fn message(self, detail: &str) -> String {
        format!("{}: {}", self.as_str(), detail)
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub action: String,
    #[serde(default)]
    pub details: Value,
}

impl AuditEntry {
    pub fn new(agent: &str, action: &str, details: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            agent: agent.to_string(),
            action: action.to_string(),
            details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Paper {
    pub title: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub citations: u64,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(rename = "abstract", default)]
    pub abstract_text: String,
    #[serde(default)]
    pub relevance: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub path: String,
    pub packets: u64,
    pub bytes: u64,
    pub duration_s: f64,
    pub link_type: Option<u32>,
    pub routing_packets: u64,
    pub routing_bytes: u64,
    #[serde(default)]
    pub routing_by_protocol: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TraceAnalysis {
    pub captures: Vec<CaptureRecord>,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub routing_packets: u64,
    /// Routing-control share of all captured packets, in percent.
    pub routing_overhead_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnalysisResults {
    pub summary: String,
    pub proposal: String,
    pub grade: String,
    pub flow_count: usize,
    #[serde(default)]
    pub confidence_intervals: BTreeMap<String, ConfidenceInterval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentState {
    pub task: String,
    #[serde(default)]
    pub research_notes: Vec<String>,
    #[serde(default)]
    pub papers_found: Vec<Paper>,
    #[serde(default)]
    pub code_snippet: String,
    #[serde(default)]
    pub code_validated: bool,
    #[serde(default)]
    pub critic_approved: bool,
    #[serde(default)]
    pub critique: String,
    #[serde(default)]
    pub simulation_status: SimulationStatus,
    #[serde(default)]
    pub simulation_logs: Option<String>,
    #[serde(default)]
    pub pcap_files: Vec<String>,
    #[serde(default)]
    pub trace_analysis: Option<TraceAnalysis>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub analysis_results: Option<AnalysisResults>,
    #[serde(default)]
    pub plots_generated: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub error_type: ErrorType,
    #[serde(default)]
    pub iteration_count: u32,
    pub max_iterations: u32,
    #[serde(default)]
    pub optimization_count: u32,
    pub simulation_seed: u64,
    #[serde(default)]
    pub audit_trail: Vec<AuditEntry>,
}

/// Partial update returned by a node. `None` and empty vectors mean "not
/// touched"; the registry decides what a present value does.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub research_notes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub papers_found: Vec<Paper>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_validated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critic_approved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critique: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation_status: Option<SimulationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation_logs: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pcap_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_analysis: Option<TraceAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_results: Option<AnalysisResults>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plots_generated: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimization_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation_seed: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub audit_trail: Vec<AuditEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    Append,
    LastWriter,
    WriteOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Task,
    ResearchNotes,
    PapersFound,
    CodeSnippet,
    CodeValidated,
    CriticApproved,
    Critique,
    SimulationStatus,
    SimulationLogs,
    PcapFiles,
    TraceAnalysis,
    Metrics,
    AnalysisResults,
    PlotsGenerated,
    Errors,
    ErrorType,
    IterationCount,
    MaxIterations,
    OptimizationCount,
    SimulationSeed,
    AuditTrail,
}

impl Field {
    pub const ALL: [Field; 21] = [
        Field::Task,
        Field::ResearchNotes,
        Field::PapersFound,
        Field::CodeSnippet,
        Field::CodeValidated,
        Field::CriticApproved,
        Field::Critique,
        Field::SimulationStatus,
        Field::SimulationLogs,
        Field::PcapFiles,
        Field::TraceAnalysis,
        Field::Metrics,
        Field::AnalysisResults,
        Field::PlotsGenerated,
        Field::Errors,
        Field::ErrorType,
        Field::IterationCount,
        Field::MaxIterations,
        Field::OptimizationCount,
        Field::SimulationSeed,
        Field::AuditTrail,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::Task => "task",
            Field::ResearchNotes => "research_notes",
            Field::PapersFound => "papers_found",
            Field::CodeSnippet => "code_snippet",
            Field::CodeValidated => "code_validated",
            Field::CriticApproved => "critic_approved",
            Field::Critique => "critique",
            Field::SimulationStatus => "simulation_status",
            Field::SimulationLogs => "simulation_logs",
            Field::PcapFiles => "pcap_files",
            Field::TraceAnalysis => "trace_analysis",
            Field::Metrics => "metrics",
            Field::AnalysisResults => "analysis_results",
            Field::PlotsGenerated => "plots_generated",
            Field::Errors => "errors",
            Field::ErrorType => "error_type",
            Field::IterationCount => "iteration_count",
            Field::MaxIterations => "max_iterations",
            Field::OptimizationCount => "optimization_count",
            Field::SimulationSeed => "simulation_seed",
            Field::AuditTrail => "audit_trail",
        }
    }

    pub fn merge_kind(self) -> MergeKind {
        match self {
            Field::ResearchNotes
            | Field::PapersFound
            | Field::PcapFiles
            | Field::PlotsGenerated
            | Field::Errors
            | Field::AuditTrail => MergeKind::Append,
            Field::Task | Field::MaxIterations | Field::SimulationSeed => MergeKind::WriteOnce,
            _ => MergeKind::LastWriter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MergeError {
    #[error("field `{field}` is write-once and already holds a different value")]
    WriteOnce { field: &'static str },
    #[error("field `{field}` is registered as {kind:?} and cannot take this update")]
    KindMismatch { field: &'static str, kind: MergeKind },
    #[error("invariant violated: {0}")]
    Invariant(String),
}

fn merge_value<T: PartialEq>(
    field: Field,
    slot: &mut T,
    incoming: Option<T>,
) -> Result<(), MergeError> {
    let Some(value) = incoming else {
        return Ok(());
    };
    match field.merge_kind() {
        MergeKind::LastWriter => {
            *slot = value;
            Ok(())
        }
        MergeKind::WriteOnce if *slot == value => Ok(()),
        MergeKind::WriteOnce => Err(MergeError::WriteOnce {
            field: field.name(),
        }),
        kind @ MergeKind::Append => Err(MergeError::KindMismatch {
            field: field.name(),
            kind,
        }),
    }
}

fn merge_seq<T>(field: Field, slot: &mut Vec<T>, incoming: Vec<T>) -> Result<(), MergeError> {
    if incoming.is_empty() {
        return Ok(());
    }
    match field.merge_kind() {
        MergeKind::Append => slot.extend(incoming),
        MergeKind::LastWriter => *slot = incoming,
        MergeKind::WriteOnce if slot.is_empty() => *slot = incoming,
        MergeKind::WriteOnce => {
            return Err(MergeError::WriteOnce {
                field: field.name(),
            })
        }
    }
    Ok(())
}

impl ExperimentState {
    pub fn new(task: impl Into<String>, max_iterations: u32, simulation_seed: u64) -> Self {
        Self {
            task: task.into(),
            research_notes: Vec::new(),
            papers_found: Vec::new(),
            code_snippet: String::new(),
            code_validated: false,
            critic_approved: false,
            critique: String::new(),
            simulation_status: SimulationStatus::Pending,
            simulation_logs: None,
            pcap_files: Vec::new(),
            trace_analysis: None,
            metrics: BTreeMap::new(),
            analysis_results: None,
            plots_generated: Vec::new(),
            errors: Vec::new(),
            error_type: ErrorType::NoError,
            iteration_count: 0,
            max_iterations: max_iterations.max(1),
            optimization_count: 0,
            simulation_seed,
            audit_trail: Vec::new(),
        }
    }

    /// Folds `update` into the state. The update is applied to a copy and only
    /// committed when every invariant still holds afterwards.
    pub fn apply(&mut self, update: StateUpdate) -> Result<(), MergeError> {
        let mut next = self.clone();
        merge_value(Field::Task, &mut next.task, update.task)?;
        merge_seq(
            Field::ResearchNotes,
            &mut next.research_notes,
            update.research_notes,
        )?;
        merge_seq(
            Field::PapersFound,
            &mut next.papers_found,
            update.papers_found,
        )?;
        merge_value(
            Field::CodeSnippet,
            &mut next.code_snippet,
            update.code_snippet,
        )?;
        merge_value(
            Field::CodeValidated,
            &mut next.code_validated,
            update.code_validated,
        )?;
        merge_value(
            Field::CriticApproved,
            &mut next.critic_approved,
            update.critic_approved,
        )?;
        merge_value(Field::Critique, &mut next.critique, update.critique)?;
        merge_value(
            Field::SimulationStatus,
            &mut next.simulation_status,
            update.simulation_status,
        )?;
        merge_value(
            Field::SimulationLogs,
            &mut next.simulation_logs,
            update.simulation_logs.map(Some),
        )?;
        merge_seq(Field::PcapFiles, &mut next.pcap_files, update.pcap_files)?;
        merge_value(
            Field::TraceAnalysis,
            &mut next.trace_analysis,
            update.trace_analysis.map(Some),
        )?;
        merge_value(Field::Metrics, &mut next.metrics, update.metrics)?;
        merge_value(
            Field::AnalysisResults,
            &mut next.analysis_results,
            update.analysis_results.map(Some),
        )?;
        merge_seq(
            Field::PlotsGenerated,
            &mut next.plots_generated,
            update.plots_generated,
        )?;
        merge_seq(Field::Errors, &mut next.errors, update.errors)?;
        merge_value(Field::ErrorType, &mut next.error_type, update.error_type)?;
        merge_value(
            Field::IterationCount,
            &mut next.iteration_count,
            update.iteration_count,
        )?;
        merge_value(
            Field::MaxIterations,
            &mut next.max_iterations,
            update.max_iterations,
        )?;
        merge_value(
            Field::OptimizationCount,
            &mut next.optimization_count,
            update.optimization_count,
        )?;
        merge_value(
            Field::SimulationSeed,
            &mut next.simulation_seed,
            update.simulation_seed,
        )?;
        merge_seq(Field::AuditTrail, &mut next.audit_trail, update.audit_trail)?;
        next.check_invariants()?;
        *self = next;
        Ok(())
    }

    pub fn check_invariants(&self) -> Result<(), MergeError> {
        if self.iteration_count > self.max_iterations {
            return Err(MergeError::Invariant(format!(
                "iteration_count {} exceeds max_iterations {}",
                self.iteration_count, self.max_iterations
            )));
        }
        if self.optimization_count > MAX_OPTIMIZATION_CYCLES {
            return Err(MergeError::Invariant(format!(
                "optimization_count {} exceeds cap {}",
                self.optimization_count, MAX_OPTIMIZATION_CYCLES
            )));
        }
        if self.critic_approved && !self.code_validated {
            return Err(MergeError::Invariant(
                "critic_approved set on unvalidated code".to_string(),
            ));
        }
        if self.simulation_status == SimulationStatus::Completed
            && self
                .simulation_logs
                .as_deref()
                .map_or(true, |p| p.trim().is_empty())
        {
            return Err(MergeError::Invariant(
                "completed simulation without a log path".to_string(),
            ));
        }
        if self.error_type.is_failure() {
            let tagged = self
                .errors
                .last()
                .map_or(false, |e| e.starts_with(self.error_type.as_str()));
            if !tagged {
                return Err(MergeError::Invariant(format!(
                    "error_type {} does not match the last recorded error",
                    self.error_type
                )));
            }
        }
        Ok(())
    }

    pub fn last_error(&self) -> Option<&str> {
        self.errors.last().map(String::as_str)
    }

    pub fn has_iteration_budget(&self) -> bool {
        self.iteration_count < self.max_iterations
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audited(agent: &str, action: &str, details: Value) -> Self {
        Self::default().with_audit(agent, action, details)
    }

    pub fn with_audit(mut self, agent: &str, action: &str, details: Value) -> Self {
        self.audit_trail.push(AuditEntry::new(agent, action, details));
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.errors.push(message.into());
        self
    }

    /// Fields this update carries a value for, in registry order.
    pub fn fields(&self) -> Vec<Field> {
        let touched = [
            self.task.is_some(),
            !self.research_notes.is_empty(),
            !self.papers_found.is_empty(),
            self.code_snippet.is_some(),
            self.code_validated.is_some(),
            self.critic_approved.is_some(),
            self.critique.is_some(),
            self.simulation_status.is_some(),
            self.simulation_logs.is_some(),
            !self.pcap_files.is_empty(),
            self.trace_analysis.is_some(),
            self.metrics.is_some(),
            self.analysis_results.is_some(),
            !self.plots_generated.is_empty(),
            !self.errors.is_empty(),
            self.error_type.is_some(),
            self.iteration_count.is_some(),
            self.max_iterations.is_some(),
            self.optimization_count.is_some(),
            self.simulation_seed.is_some(),
            !self.audit_trail.is_empty(),
        ];
        Field::ALL
            .iter()
            .zip(touched)
            .filter(|(_, hit)| *hit)
            .map(|(field, _)| *field)
            .collect()
    }
}
