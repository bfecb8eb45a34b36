use crate::flowmon::FlowRecord;
use routelab_core::{metric, ConfidenceInterval, TraceAnalysis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Two-sided 95% Student t critical values for 1..=30 degrees of freedom.
const T_95: [f64; 30] = [
    12.706, 4.303, 3.182, 2.776, 2.571, 2.447, 2.365, 2.306, 2.262, 2.228, 2.201, 2.179, 2.160,
    2.145, 2.131, 2.120, 2.110, 2.101, 2.093, 2.086, 2.080, 2.074, 2.069, 2.064, 2.060, 2.056,
    2.052, 2.048, 2.045, 2.042,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl Grade {
    pub fn as_str(self) -> &'static str {
        match self {
            Grade::Excellent => "Excellent",
            Grade::Good => "Good",
            Grade::Fair => "Fair",
            Grade::Poor => "Poor",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Kpis {
    pub flow_count: usize,
    pub successful_flows: usize,
    pub avg_pdr: f64,
    pub std_pdr: f64,
    pub min_pdr: f64,
    pub max_pdr: f64,
    pub avg_throughput: f64,
    pub total_throughput: f64,
    pub avg_delay: f64,
    pub median_delay: f64,
    pub p95_delay: f64,
    pub avg_jitter: f64,
    pub success_rate: f64,
    pub total_tx_packets: u64,
    pub total_rx_packets: u64,
    pub lost_packets: u64,
    pub network_efficiency: f64,
}

impl Kpis {
    pub fn grade(&self) -> Grade {
        classify_performance(self.avg_pdr, self.avg_delay, self.success_rate)
    }

    /// Flattens the record into the metric map the supervisor routes on.
    pub fn to_metrics(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        out.insert(metric::FLOW_COUNT.to_string(), self.flow_count as f64);
        out.insert(metric::AVG_PDR.to_string(), self.avg_pdr);
        out.insert(metric::STD_PDR.to_string(), self.std_pdr);
        out.insert(metric::MIN_PDR.to_string(), self.min_pdr);
        out.insert(metric::MAX_PDR.to_string(), self.max_pdr);
        out.insert(metric::AVG_THROUGHPUT.to_string(), self.avg_throughput);
        out.insert(metric::TOTAL_THROUGHPUT.to_string(), self.total_throughput);
        out.insert(metric::AVG_DELAY.to_string(), self.avg_delay);
        out.insert(metric::MEDIAN_DELAY.to_string(), self.median_delay);
        out.insert(metric::P95_DELAY.to_string(), self.p95_delay);
        out.insert(metric::AVG_JITTER.to_string(), self.avg_jitter);
        out.insert(metric::SUCCESS_RATE.to_string(), self.success_rate);
        out.insert(metric::TOTAL_PACKETS.to_string(), self.total_tx_packets as f64);
        out.insert(metric::LOST_PACKETS.to_string(), self.lost_packets as f64);
        out.insert(metric::NETWORK_EFFICIENCY.to_string(), self.network_efficiency);
        out
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator); zero for fewer than two values.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Linear-interpolated quantile, `q` in [0, 1].
pub fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

pub fn t_critical_95(degrees_of_freedom: usize) -> f64 {
    match degrees_of_freedom {
        0 => f64::INFINITY,
        n if n <= T_95.len() => T_95[n - 1],
        _ => 1.96,
    }
}

pub fn confidence_interval(values: &[f64]) -> Option<ConfidenceInterval> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let half = t_critical_95(values.len() - 1) * sample_std(values) / (values.len() as f64).sqrt();
    Some(ConfidenceInterval {
        mean: m,
        lower: m - half,
        upper: m + half,
    })
}

/// 95% intervals over the per-flow PDR, delay and throughput samples.
pub fn flow_confidence_intervals(flows: &[FlowRecord]) -> BTreeMap<String, ConfidenceInterval> {
    let series: [(&str, Vec<f64>); 3] = [
        ("pdr", flows.iter().map(FlowRecord::pdr).collect()),
        ("delay_ms", flows.iter().map(FlowRecord::avg_delay_ms).collect()),
        (
            "throughput_mbps",
            flows.iter().map(FlowRecord::throughput_mbps).collect(),
        ),
    ];
    series
        .into_iter()
        .filter_map(|(name, values)| confidence_interval(&values).map(|ci| (name.to_string(), ci)))
        .collect()
}

pub fn compute_kpis(flows: &[FlowRecord]) -> Option<Kpis> {
    if flows.is_empty() {
        return None;
    }
    let pdrs: Vec<f64> = flows.iter().map(FlowRecord::pdr).collect();
    let delays: Vec<f64> = flows.iter().map(FlowRecord::avg_delay_ms).collect();
    let throughputs: Vec<f64> = flows.iter().map(FlowRecord::throughput_mbps).collect();
    let jitters: Vec<f64> = flows.iter().filter_map(FlowRecord::avg_jitter_ms).collect();

    let successful_flows = flows.iter().filter(|f| f.delivered()).count();
    let total_tx_packets: u64 = flows.iter().map(|f| f.tx_packets).sum();
    let total_rx_packets: u64 = flows.iter().map(|f| f.rx_packets).sum();

    let avg_pdr = mean(&pdrs);
    let avg_delay = mean(&delays);
    let avg_throughput = mean(&throughputs);
    Some(Kpis {
        flow_count: flows.len(),
        successful_flows,
        avg_pdr,
        std_pdr: sample_std(&pdrs),
        min_pdr: pdrs.iter().copied().fold(f64::INFINITY, f64::min),
        max_pdr: pdrs.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        avg_throughput,
        total_throughput: throughputs.iter().sum(),
        avg_delay,
        median_delay: quantile(&delays, 0.5),
        p95_delay: quantile(&delays, 0.95),
        avg_jitter: mean(&jitters),
        success_rate: successful_flows as f64 / flows.len() as f64 * 100.0,
        total_tx_packets,
        total_rx_packets,
        lost_packets: total_tx_packets.saturating_sub(total_rx_packets),
        network_efficiency: avg_pdr * avg_throughput / (avg_delay + 1.0),
    })
}

/// Scores PDR (40), delay (30) and flow success (30) and buckets the total.
pub fn classify_performance(avg_pdr: f64, avg_delay_ms: f64, success_rate: f64) -> Grade {
    let mut score = 0;
    score += if avg_pdr >= 95.0 {
        40
    } else if avg_pdr >= 85.0 {
        30
    } else if avg_pdr >= 70.0 {
        20
    } else {
        10
    };
    score += if avg_delay_ms <= 50.0 {
        30
    } else if avg_delay_ms <= 100.0 {
        20
    } else if avg_delay_ms <= 200.0 {
        10
    } else {
        0
    };
    score += if success_rate >= 95.0 {
        30
    } else if success_rate >= 80.0 {
        20
    } else if success_rate >= 60.0 {
        10
    } else {
        0
    };
    match score {
        s if s >= 85 => Grade::Excellent,
        s if s >= 65 => Grade::Good,
        s if s >= 45 => Grade::Fair,
        _ => Grade::Poor,
    }
}

/// Typical control-to-data ratio by routing protocol, used when no capture
/// analysis is available.
pub fn estimated_routing_overhead(protocol: Option<&str>) -> f64 {
    match protocol.map(|p| p.to_ascii_lowercase()).as_deref() {
        Some("aodv") => 0.15,
        Some("olsr") => 0.35,
        Some("dsdv") => 0.45,
        Some("dsr") => 0.20,
        _ => 0.20,
    }
}

/// Control bytes over data bytes measured from captures.
pub fn measured_routing_overhead(trace: &TraceAnalysis) -> Option<f64> {
    let routing: u64 = trace.captures.iter().map(|c| c.routing_bytes).sum();
    let data = trace.total_bytes.saturating_sub(routing);
    if routing == 0 || data == 0 {
        return None;
    }
    Some(routing as f64 / data as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use routelab_core::CaptureRecord;

    fn flow(id: &str, tx: u64, rx: u64, delay_ms: f64) -> FlowRecord {
        FlowRecord {
            flow_id: id.to_string(),
            tx_packets: tx,
            rx_packets: rx,
            tx_bytes: tx * 512,
            rx_bytes: rx * 512,
            lost_packets: tx - rx,
            delay_sum_ns: delay_ms * 1e6 * rx as f64,
            jitter_sum_ns: 0.0,
            time_first_tx_ns: Some(1e9),
            time_last_rx_ns: Some(11e9),
            source: None,
            destination: None,
        }
    }

    #[test]
    fn kpis_aggregate_flows() {
        let flows = vec![
            flow("1", 100, 90, 40.0),
            flow("2", 100, 94, 40.0),
            flow("3", 100, 0, 0.0),
            flow("4", 100, 96, 40.0),
        ];
        let kpis = compute_kpis(&flows).expect("kpis");
        assert_eq!(kpis.flow_count, 4);
        assert_eq!(kpis.successful_flows, 3);
        assert!((kpis.avg_pdr - 70.0).abs() < 1e-9);
        assert!((kpis.success_rate - 75.0).abs() < 1e-9);
        assert!((kpis.avg_delay - 30.0).abs() < 1e-9);
        assert_eq!(kpis.min_pdr, 0.0);
        assert_eq!(kpis.max_pdr, 96.0);
        assert_eq!(kpis.lost_packets, 120);
        let metrics = kpis.to_metrics();
        assert_eq!(metrics.get("avg_pdr").copied(), Some(kpis.avg_pdr));
        assert!(metrics.contains_key("success_rate"));
        assert!(metrics.contains_key("avg_delay"));
    }

    #[test]
    fn empty_flow_list_has_no_kpis() {
        assert!(compute_kpis(&[]).is_none());
    }

    #[test]
    fn grading_follows_score_buckets() {
        assert_eq!(classify_performance(96.0, 30.0, 100.0), Grade::Excellent);
        assert_eq!(classify_performance(90.0, 80.0, 90.0), Grade::Good);
        assert_eq!(classify_performance(75.0, 150.0, 70.0), Grade::Poor);
        assert_eq!(classify_performance(80.0, 90.0, 65.0), Grade::Fair);
    }

    #[test]
    fn quantile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert!((quantile(&values, 0.5) - 2.5).abs() < 1e-12);
        assert!((quantile(&values, 0.95) - 3.85).abs() < 1e-12);
        assert_eq!(quantile(&[], 0.5), 0.0);
    }

    #[test]
    fn confidence_interval_uses_t_table() {
        let ci = confidence_interval(&[10.0, 12.0]).expect("ci");
        assert!((ci.mean - 11.0).abs() < 1e-12);
        let half = 12.706 * 2f64.sqrt() / 2f64.sqrt();
        assert!((ci.upper - (11.0 + half)).abs() < 1e-9);
        assert!(confidence_interval(&[1.0]).is_none());
        assert_eq!(t_critical_95(100), 1.96);
    }

    #[test]
    fn routing_overhead_prefers_measurement() {
        assert_eq!(estimated_routing_overhead(Some("OLSR")), 0.35);
        assert_eq!(estimated_routing_overhead(None), 0.20);
        let trace = TraceAnalysis {
            captures: vec![CaptureRecord {
                routing_bytes: 200,
                ..CaptureRecord::default()
            }],
            total_bytes: 1200,
            ..TraceAnalysis::default()
        };
        assert_eq!(measured_routing_overhead(&trace), Some(0.2));
        assert_eq!(measured_routing_overhead(&TraceAnalysis::default()), None);
    }
}
