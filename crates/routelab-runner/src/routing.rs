//! Routing predicates. Each is a total function of the blackboard returning
//! a route key; the graph maps keys to node names.

use crate::config::OptimizationConfig;
use routelab_core::{metric, ExperimentState, SimulationStatus, MAX_OPTIMIZATION_CYCLES};
use std::collections::BTreeMap;

pub const ROUTE_CRITIC: &str = "critic";
pub const ROUTE_RETRY: &str = "retry";
pub const ROUTE_CODER: &str = "coder";
pub const ROUTE_SIMULATOR: &str = "simulator";
pub const ROUTE_TRACE_ANALYZER: &str = "trace_analyzer";
pub const ROUTE_OPTIMIZER: &str = "optimizer";
pub const ROUTE_VISUALIZER: &str = "visualizer";
pub const ROUTE_END: &str = "end";

pub fn after_coder(state: &ExperimentState) -> &'static str {
    if state.code_validated {
        ROUTE_CRITIC
    } else if state.has_iteration_budget() {
        ROUTE_RETRY
    } else {
        ROUTE_END
    }
}

pub fn after_critic(state: &ExperimentState) -> &'static str {
    if state.critic_approved {
        ROUTE_SIMULATOR
    } else if state.has_iteration_budget() {
        ROUTE_CODER
    } else {
        ROUTE_END
    }
}

pub fn after_simulator(state: &ExperimentState) -> &'static str {
    match state.simulation_status {
        SimulationStatus::Completed => ROUTE_TRACE_ANALYZER,
        _ if state.has_iteration_budget() => ROUTE_CODER,
        _ => ROUTE_END,
    }
}

/// True when any present KPI misses its threshold. Absent metrics never
/// trigger optimization.
pub fn needs_optimization(metrics: &BTreeMap<String, f64>, thresholds: &OptimizationConfig) -> bool {
    let below = |key: &str, floor: f64| metrics.get(key).map_or(false, |v| *v < floor);
    let above = |key: &str, ceiling: f64| metrics.get(key).map_or(false, |v| *v > ceiling);
    below(metric::AVG_PDR, thresholds.min_pdr)
        || above(metric::AVG_DELAY, thresholds.max_delay_ms)
        || below(metric::SUCCESS_RATE, thresholds.min_success_rate)
}

pub fn after_analyst(state: &ExperimentState, thresholds: &OptimizationConfig) -> &'static str {
    if needs_optimization(&state.metrics, thresholds)
        && state.optimization_count < MAX_OPTIMIZATION_CYCLES
        && state.has_iteration_budget()
    {
        ROUTE_OPTIMIZER
    } else {
        ROUTE_VISUALIZER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(metrics: &[(&str, f64)]) -> ExperimentState {
        let mut state = ExperimentState::new("t", 5, 1);
        state.iteration_count = 1;
        for (k, v) in metrics {
            state.metrics.insert(k.to_string(), *v);
        }
        state
    }

    #[test]
    fn coder_routes_on_validation_and_budget() {
        let mut state = ExperimentState::new("t", 2, 1);
        state.iteration_count = 1;
        assert_eq!(after_coder(&state), ROUTE_RETRY);
        state.iteration_count = 2;
        assert_eq!(after_coder(&state), ROUTE_END);
        state.code_validated = true;
        assert_eq!(after_coder(&state), ROUTE_CRITIC);
    }

    #[test]
    fn critic_rejection_without_budget_ends() {
        let mut state = ExperimentState::new("t", 2, 1);
        state.code_validated = true;
        state.iteration_count = 2;
        assert_eq!(after_critic(&state), ROUTE_END);
        state.critic_approved = true;
        assert_eq!(after_critic(&state), ROUTE_SIMULATOR);
    }

    #[test]
    fn simulator_routes_by_status() {
        let mut state = ExperimentState::new("t", 2, 1);
        state.iteration_count = 1;
        state.simulation_status = SimulationStatus::Failed;
        assert_eq!(after_simulator(&state), ROUTE_CODER);
        state.iteration_count = 2;
        assert_eq!(after_simulator(&state), ROUTE_END);
        state.simulation_status = SimulationStatus::Completed;
        assert_eq!(after_simulator(&state), ROUTE_TRACE_ANALYZER);
    }

    #[test]
    fn analyst_routes_on_thresholds() {
        let t = OptimizationConfig::default();
        let good = state_with(&[("avg_pdr", 92.0), ("avg_delay", 40.0), ("success_rate", 95.0)]);
        assert_eq!(after_analyst(&good, &t), ROUTE_VISUALIZER);
        let slow = state_with(&[("avg_pdr", 92.0), ("avg_delay", 101.0), ("success_rate", 95.0)]);
        assert_eq!(after_analyst(&slow, &t), ROUTE_OPTIMIZER);
        let flaky = state_with(&[("avg_pdr", 92.0), ("avg_delay", 40.0), ("success_rate", 79.0)]);
        assert_eq!(after_analyst(&flaky, &t), ROUTE_OPTIMIZER);
    }

    #[test]
    fn optimization_cap_forces_visualizer() {
        let t = OptimizationConfig::default();
        let mut state = state_with(&[("avg_pdr", 60.0)]);
        state.optimization_count = MAX_OPTIMIZATION_CYCLES;
        assert_eq!(after_analyst(&state, &t), ROUTE_VISUALIZER);
    }

    #[test]
    fn missing_metrics_do_not_trigger_optimization() {
        let t = OptimizationConfig::default();
        assert_eq!(after_analyst(&state_with(&[]), &t), ROUTE_VISUALIZER);
    }

    #[test]
    fn exhausted_budget_skips_optimizer() {
        let t = OptimizationConfig::default();
        let mut state = state_with(&[("avg_pdr", 60.0)]);
        state.iteration_count = state.max_iterations;
        assert_eq!(after_analyst(&state, &t), ROUTE_VISUALIZER);
    }
}
