pub mod bottleneck;
pub mod compare;
pub mod flowmon;
pub mod kpi;
pub mod pcap;
pub mod render;

pub use bottleneck::{classify_bottlenecks, Bottleneck, BottleneckReport, Severity};
pub use compare::{
    compare_scenarios, higher_is_better, welch_t_test, Comparison, EffectSize, KpiSummary,
    PairwiseTest, SampleSummary, ScenarioSamples, WelchTest, DEFAULT_ALPHA, DEFAULT_KPIS,
};
pub use flowmon::{parse_flow_monitor, parse_flow_monitor_file, FlowMonitorError, FlowRecord};
pub use kpi::{
    classify_performance, compute_kpis, confidence_interval, estimated_routing_overhead,
    flow_confidence_intervals, measured_routing_overhead, Grade, Kpis,
};
pub use pcap::{analyze_captures, summarize_capture, CaptureError, ROUTING_PORTS};
pub use render::{bar_chart_svg, flows_csv, RenderError};
