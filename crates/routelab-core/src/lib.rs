//! Shared building blocks for routelab: the experiment blackboard with its
//! field merge registry, and the durable-write helpers every persisted
//! artifact goes through.

pub mod fsutil;
pub mod state;

pub use fsutil::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir, move_file,
    sha256_bytes, sha256_hex,
};
pub use state::{
    metric, AnalysisResults, AuditEntry, CaptureRecord, ConfidenceInterval, ErrorType,
    ExperimentState, Field, MergeError, MergeKind, Paper, SimulationStatus, StateUpdate,
    TraceAnalysis, MAX_OPTIMIZATION_CYCLES,
};
