use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

static FLOW_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<Flow\b([^>]*)>").expect("invalid flow tag regex"));
static ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_][\w.-]*)\s*=\s*"([^"]*)""#).expect("invalid attribute regex")
});

#[derive(Debug, Error)]
pub enum FlowMonitorError {
    #[error("failed to read flow monitor file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("flow monitor document has no <FlowStats> flows")]
    NoFlows,
    #[error("flow {flow_id}: attribute {name}={value:?} is not a valid number")]
    InvalidAttribute {
        flow_id: String,
        name: String,
        value: String,
    },
}

/// One `<FlowStats><Flow .../>` entry, joined with its classifier five-tuple
/// when the document carries one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowRecord {
    pub flow_id: String,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub lost_packets: u64,
    pub delay_sum_ns: f64,
    pub jitter_sum_ns: f64,
    pub time_first_tx_ns: Option<f64>,
    pub time_last_rx_ns: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl FlowRecord {
    /// Packet delivery ratio in percent.
    pub fn pdr(&self) -> f64 {
        if self.tx_packets == 0 {
            return 0.0;
        }
        self.rx_packets as f64 / self.tx_packets as f64 * 100.0
    }

    pub fn avg_delay_ms(&self) -> f64 {
        if self.rx_packets == 0 {
            return 0.0;
        }
        self.delay_sum_ns / self.rx_packets as f64 / 1e6
    }

    pub fn avg_jitter_ms(&self) -> Option<f64> {
        if self.rx_packets < 2 {
            return None;
        }
        Some(self.jitter_sum_ns / (self.rx_packets - 1) as f64 / 1e6)
    }

    /// Received goodput in Mbit/s over the flow's active span. Flows without
    /// timing attributes report received megabits.
    pub fn throughput_mbps(&self) -> f64 {
        let bits = self.rx_bytes as f64 * 8.0;
        match (self.time_first_tx_ns, self.time_last_rx_ns) {
            (Some(first), Some(last)) if last > first => bits / ((last - first) / 1e9) / 1e6,
            _ => bits / 1e6,
        }
    }

    pub fn delivered(&self) -> bool {
        self.rx_packets > 0
    }
}

/// Parses an ns-3 style time attribute such as `+1.5e+09ns` into nanoseconds.
pub fn parse_time_ns(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().trim_start_matches('+');
    let (number, scale) = if let Some(v) = trimmed.strip_suffix("ns") {
        (v, 1.0)
    } else if let Some(v) = trimmed.strip_suffix("us") {
        (v, 1e3)
    } else if let Some(v) = trimmed.strip_suffix("ms") {
        (v, 1e6)
    } else if let Some(v) = trimmed.strip_suffix('s') {
        (v, 1e9)
    } else {
        (trimmed, 1.0)
    };
    number.trim().parse::<f64>().ok().map(|v| v * scale)
}

fn attributes(raw: &str) -> BTreeMap<String, String> {
    ATTRIBUTE
        .captures_iter(raw)
        .map(|cap| (cap[1].to_string(), cap[2].to_string()))
        .collect()
}

fn count(attrs: &BTreeMap<String, String>, flow_id: &str, name: &str) -> Result<u64, FlowMonitorError> {
    match attrs.get(name) {
        None => Ok(0),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map_err(|_| FlowMonitorError::InvalidAttribute {
                flow_id: flow_id.to_string(),
                name: name.to_string(),
                value: value.clone(),
            }),
    }
}

fn time(attrs: &BTreeMap<String, String>, flow_id: &str, name: &str) -> Result<Option<f64>, FlowMonitorError> {
    match attrs.get(name) {
        None => Ok(None),
        Some(value) => parse_time_ns(value)
            .map(Some)
            .ok_or_else(|| FlowMonitorError::InvalidAttribute {
                flow_id: flow_id.to_string(),
                name: name.to_string(),
                value: value.clone(),
            }),
    }
}

pub fn parse_flow_monitor(xml: &str) -> Result<Vec<FlowRecord>, FlowMonitorError> {
    let mut flows = Vec::new();
    let mut classifier: BTreeMap<String, (String, String)> = BTreeMap::new();
    for cap in FLOW_TAG.captures_iter(xml) {
        let attrs = attributes(&cap[1]);
        let flow_id = attrs.get("flowId").cloned().unwrap_or_default();
        if attrs.contains_key("txPackets") {
            flows.push(FlowRecord {
                tx_packets: count(&attrs, &flow_id, "txPackets")?,
                rx_packets: count(&attrs, &flow_id, "rxPackets")?,
                tx_bytes: count(&attrs, &flow_id, "txBytes")?,
                rx_bytes: count(&attrs, &flow_id, "rxBytes")?,
                lost_packets: count(&attrs, &flow_id, "lostPackets")?,
                delay_sum_ns: time(&attrs, &flow_id, "delaySum")?.unwrap_or(0.0),
                jitter_sum_ns: time(&attrs, &flow_id, "jitterSum")?.unwrap_or(0.0),
                time_first_tx_ns: time(&attrs, &flow_id, "timeFirstTxPacket")?,
                time_last_rx_ns: time(&attrs, &flow_id, "timeLastRxPacket")?,
                flow_id,
                source: None,
                destination: None,
            });
        } else if let (Some(src), Some(dst)) =
            (attrs.get("sourceAddress"), attrs.get("destinationAddress"))
        {
            let src = match attrs.get("sourcePort") {
                Some(port) => format!("{}:{}", src, port),
                None => src.clone(),
            };
            let dst = match attrs.get("destinationPort") {
                Some(port) => format!("{}:{}", dst, port),
                None => dst.clone(),
            };
            classifier.insert(flow_id, (src, dst));
        }
    }
    if flows.is_empty() {
        return Err(FlowMonitorError::NoFlows);
    }
    for flow in &mut flows {
        if let Some((src, dst)) = classifier.get(&flow.flow_id) {
            flow.source = Some(src.clone());
            flow.destination = Some(dst.clone());
        }
    }
    Ok(flows)
}

pub fn parse_flow_monitor_file(path: &Path) -> Result<Vec<FlowRecord>, FlowMonitorError> {
    let text = fs::read_to_string(path).map_err(|source| FlowMonitorError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_flow_monitor(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" ?>
<FlowMonitor>
  <FlowStats>
    <Flow flowId="1" timeFirstTxPacket="+1e+09ns" timeFirstRxPacket="+1.002e+09ns" timeLastTxPacket="+9e+09ns" timeLastRxPacket="+9.0e+09ns" delaySum="+9.5e+08ns" jitterSum="+1.98e+08ns" lastDelay="+1e+07ns" txBytes="51200" rxBytes="48640" txPackets="100" rxPackets="95" lostPackets="5" timesForwarded="3">
      <delayHistogram nBins="1"><bin index="0" start="0" width="0.001" count="95" /></delayHistogram>
    </Flow>
    <Flow flowId="2" timeFirstTxPacket="+1e+09ns" txBytes="5120" rxBytes="0" txPackets="10" rxPackets="0" lostPackets="10" delaySum="+0.0ns" jitterSum="+0.0ns">
    </Flow>
  </FlowStats>
  <Ipv4FlowClassifier>
    <Flow flowId="1" sourceAddress="10.1.1.1" destinationAddress="10.1.1.9" protocol="17" sourcePort="49153" destinationPort="9" />
  </Ipv4FlowClassifier>
</FlowMonitor>
"#;

    #[test]
    fn parses_stats_and_joins_classifier() {
        let flows = parse_flow_monitor(SAMPLE).expect("parse");
        assert_eq!(flows.len(), 2);
        let first = &flows[0];
        assert_eq!(first.flow_id, "1");
        assert_eq!(first.tx_packets, 100);
        assert_eq!(first.rx_packets, 95);
        assert!((first.pdr() - 95.0).abs() < 1e-9);
        assert!((first.avg_delay_ms() - 10.0).abs() < 1e-9);
        assert!((first.avg_jitter_ms().expect("jitter") - 2.106_382_978_7).abs() < 1e-6);
        assert_eq!(first.source.as_deref(), Some("10.1.1.1:49153"));
        assert_eq!(first.destination.as_deref(), Some("10.1.1.9:9"));
        let span_s = 8.0;
        assert!((first.throughput_mbps() - 48640.0 * 8.0 / span_s / 1e6).abs() < 1e-9);

        assert!(!flows[1].delivered());
        assert_eq!(flows[1].pdr(), 0.0);
        assert_eq!(flows[1].avg_delay_ms(), 0.0);
    }

    #[test]
    fn time_units_are_normalized_to_nanoseconds() {
        assert_eq!(parse_time_ns("+1.5e+09ns"), Some(1.5e9));
        assert_eq!(parse_time_ns("2ms"), Some(2e6));
        assert_eq!(parse_time_ns("3s"), Some(3e9));
        assert_eq!(parse_time_ns("garbage"), None);
    }

    #[test]
    fn empty_document_is_an_error() {
        let err = parse_flow_monitor("<FlowMonitor><FlowStats/></FlowMonitor>").expect_err("no flows");
        assert!(matches!(err, FlowMonitorError::NoFlows));
    }

    #[test]
    fn bad_counter_is_reported_with_flow_id() {
        let err = parse_flow_monitor(r#"<Flow flowId="7" txPackets="ten" rxPackets="1">"#)
            .expect_err("invalid");
        match err {
            FlowMonitorError::InvalidAttribute { flow_id, name, .. } => {
                assert_eq!(flow_id, "7");
                assert_eq!(name, "txPackets");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
