use crate::flowmon::FlowRecord;
use plotters::prelude::*;
use serde::Serialize;
use thiserror::Error;

const CHART_SIZE: (u32, u32) = (640, 360);
const BAR_COLOR: RGBColor = RGBColor(74, 122, 183);

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("chart rendering failed: {0}")]
    Chart(String),
    #[error("csv export failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("csv buffer: {0}")]
    Buffer(String),
}

/// Renders a standalone SVG bar chart. Non-finite and negative values are
/// drawn as zero-height bars.
pub fn bar_chart_svg(title: &str, unit: &str, bars: &[(String, f64)]) -> Result<String, RenderError> {
    let mut svg = String::new();
    draw_bars(&mut svg, title, unit, bars).map_err(|e| RenderError::Chart(e.to_string()))?;
    Ok(svg)
}

fn draw_bars(svg: &mut String, title: &str, unit: &str, bars: &[(String, f64)]) -> Result<(), Box<dyn std::error::Error>> {
    let values: Vec<f64> = bars
        .iter()
        .map(|(_, v)| if v.is_finite() { v.max(0.0) } else { 0.0 })
        .collect();
    let max = values.iter().copied().fold(0.0_f64, f64::max);
    let scale_max = if max > 0.0 { max * 1.1 } else { 1.0 };
    let slots = bars.len().max(1) as u32;
    let labels: Vec<&str> = bars.iter().map(|(label, _)| label.as_str()).collect();

    let root = SVGBackend::with_string(svg, CHART_SIZE).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 18))
        .margin(12)
        .x_label_area_size(36)
        .y_label_area_size(52)
        .build_cartesian_2d((0..slots).into_segmented(), 0.0..scale_max)?;

    let label_of = |seg: &SegmentValue<u32>| match seg {
        SegmentValue::CenterOf(i) => labels.get(*i as usize).map(|l| l.to_string()).unwrap_or_default(),
        _ => String::new(),
    };
    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(slots as usize)
        .x_label_formatter(&label_of)
        .y_desc(unit)
        .draw()?;

    chart.draw_series(
        Histogram::vertical(&chart)
            .style(BAR_COLOR.filled())
            .margin(8)
            .data(values.iter().enumerate().map(|(i, v)| (i as u32, *v))),
    )?;

    root.present()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct FlowRow<'a> {
    flow_id: &'a str,
    source: &'a str,
    destination: &'a str,
    tx_packets: u64,
    rx_packets: u64,
    lost_packets: u64,
    pdr: f64,
    avg_delay_ms: f64,
    throughput_mbps: f64,
}

impl<'a> From<&'a FlowRecord> for FlowRow<'a> {
    fn from(f: &'a FlowRecord) -> Self {
        Self {
            flow_id: &f.flow_id,
            source: f.source.as_deref().unwrap_or(""),
            destination: f.destination.as_deref().unwrap_or(""),
            tx_packets: f.tx_packets,
            rx_packets: f.rx_packets,
            lost_packets: f.lost_packets,
            pdr: f.pdr(),
            avg_delay_ms: f.avg_delay_ms(),
            throughput_mbps: f.throughput_mbps(),
        }
    }
}

/// Per-flow table with a header row, one record per flow.
pub fn flows_csv(flows: &[FlowRecord]) -> Result<String, RenderError> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    for flow in flows {
        wtr.serialize(FlowRow::from(flow))?;
    }
    if flows.is_empty() {
        wtr.write_record([
            "flow_id",
            "source",
            "destination",
            "tx_packets",
            "rx_packets",
            "lost_packets",
            "pdr",
            "avg_delay_ms",
            "throughput_mbps",
        ])?;
    }
    let bytes = wtr.into_inner().map_err(|e| RenderError::Buffer(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| RenderError::Buffer(e.to_string()))
}
