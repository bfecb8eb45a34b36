use routelab_core::metric;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Moderate,
    Minor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub metric: String,
    pub severity: Severity,
    pub value: f64,
    pub threshold: f64,
    pub issue: String,
    pub causes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BottleneckReport {
    pub critical: Vec<Bottleneck>,
    pub moderate: Vec<Bottleneck>,
    pub minor: Vec<Bottleneck>,
}

impl BottleneckReport {
    pub fn is_empty(&self) -> bool {
        self.critical.is_empty() && self.moderate.is_empty() && self.minor.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bottleneck> {
        self.critical
            .iter()
            .chain(self.moderate.iter())
            .chain(self.minor.iter())
    }

    fn push(&mut self, item: Bottleneck) {
        match item.severity {
            Severity::Critical => self.critical.push(item),
            Severity::Moderate => self.moderate.push(item),
            Severity::Minor => self.minor.push(item),
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        for (title, items) in [
            ("Critical", &self.critical),
            ("Moderate", &self.moderate),
            ("Minor", &self.minor),
        ] {
            if items.is_empty() {
                continue;
            }
            out.push_str(&format!("### {}\n\n", title));
            for b in items {
                out.push_str(&format!(
                    "- **{}**: {} (value {:.2}, threshold {:.2})\n",
                    b.metric, b.issue, b.value, b.threshold
                ));
                if !b.causes.is_empty() {
                    out.push_str(&format!("  - likely causes: {}\n", b.causes.join(", ")));
                }
            }
            out.push('\n');
        }
        if out.is_empty() {
            out.push_str("No bottlenecks detected.\n");
        }
        out
    }
}

fn item(metric: &str, severity: Severity, value: f64, threshold: f64, issue: &str, causes: &[&str]) -> Bottleneck {
    Bottleneck {
        metric: metric.to_string(),
        severity,
        value,
        threshold,
        issue: issue.to_string(),
        causes: causes.iter().map(|c| c.to_string()).collect(),
    }
}

/// Buckets KPI violations by fixed thresholds. Metrics absent from the map
/// are not judged.
pub fn classify_bottlenecks(metrics: &BTreeMap<String, f64>) -> BottleneckReport {
    let mut report = BottleneckReport::default();

    if let Some(pdr) = metrics.get(metric::AVG_PDR).copied() {
        if pdr < 70.0 {
            report.push(item(
                "PDR",
                Severity::Critical,
                pdr,
                70.0,
                "packet delivery ratio very low, excessive loss",
                &["congestion", "frequent collisions", "unstable routes", "protocol overhead"],
            ));
        } else if pdr < 85.0 {
            report.push(item(
                "PDR",
                Severity::Moderate,
                pdr,
                85.0,
                "packet delivery ratio below target",
                &["suboptimal routes", "high mobility"],
            ));
        } else if pdr < 95.0 {
            report.push(item(
                "PDR",
                Severity::Minor,
                pdr,
                95.0,
                "packet delivery ratio has headroom",
                &["route repair latency"],
            ));
        }
    }

    if let Some(delay) = metrics.get(metric::AVG_DELAY).copied() {
        if delay > 200.0 {
            report.push(item(
                "Delay",
                Severity::Critical,
                delay,
                200.0,
                "excessive end-to-end latency",
                &["long routes", "congestion", "retransmissions"],
            ));
        } else if delay > 100.0 {
            report.push(item(
                "Delay",
                Severity::Moderate,
                delay,
                100.0,
                "high end-to-end latency",
                &["suboptimal routes", "long queues"],
            ));
        } else if delay > 50.0 {
            report.push(item(
                "Delay",
                Severity::Minor,
                delay,
                50.0,
                "latency above the excellent band",
                &["route discovery latency"],
            ));
        }
    }

    if let Some(throughput) = metrics.get(metric::AVG_THROUGHPUT).copied() {
        if throughput < 0.5 {
            report.push(item(
                "Throughput",
                Severity::Critical,
                throughput,
                0.5,
                "throughput very low",
                &["limited bandwidth", "packet loss", "severe congestion"],
            ));
        } else if throughput < 1.0 {
            report.push(item(
                "Throughput",
                Severity::Moderate,
                throughput,
                1.0,
                "throughput below target",
                &["inefficient channel use", "overhead"],
            ));
        }
    }

    if let Some(std_pdr) = metrics.get(metric::STD_PDR).copied() {
        if std_pdr > 20.0 {
            report.push(item(
                "PDR variability",
                Severity::Moderate,
                std_pdr,
                20.0,
                "high variability in delivery ratio across flows",
                &["route instability", "mobility"],
            ));
        }
    }

    if let Some(success) = metrics.get(metric::SUCCESS_RATE).copied() {
        if success < 80.0 {
            report.push(item(
                "Success rate",
                Severity::Critical,
                success,
                80.0,
                "many flows delivered nothing",
                &["disconnections", "routes not found"],
            ));
        }
    }

    if let Some(overhead) = metrics.get(metric::ROUTING_OVERHEAD).copied() {
        if overhead > 0.30 {
            report.push(item(
                "Routing overhead",
                Severity::Minor,
                overhead,
                0.30,
                "control traffic is a large share of data traffic",
                &["aggressive topology updates"],
            ));
        }
    }

    report
}
