//! Summaries of classic libpcap capture files.
//!
//! Only the fixed-layout classic format is read (not pcapng). Routing control
//! traffic is recognized by well-known UDP ports inside IPv4 payloads.

use routelab_core::{CaptureRecord, TraceAnalysis};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const LINKTYPE_ETHERNET: u32 = 1;
pub const LINKTYPE_RAW: u32 = 101;
pub const LINKTYPE_IEEE802_11: u32 = 105;
pub const LINKTYPE_LINUX_SLL: u32 = 113;
pub const LINKTYPE_PRISM: u32 = 119;
pub const LINKTYPE_RADIOTAP: u32 = 127;
pub const LINKTYPE_IPV4: u32 = 228;

/// UDP ports of the routing protocols the simulator scripts use.
pub const ROUTING_PORTS: [(u16, &str); 3] = [(654, "aodv"), (698, "olsr"), (269, "dsdv")];

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to read capture {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("capture is {0} bytes, shorter than a pcap global header")]
    TooShort(usize),
    #[error("unrecognized pcap magic 0x{0:08x}")]
    BadMagic(u32),
}

#[derive(Clone, Copy)]
struct Format {
    big_endian: bool,
    nanos: bool,
}

impl Format {
    fn u32_at(self, bytes: &[u8], at: usize) -> Option<u32> {
        let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
        Some(if self.big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        })
    }
}

fn detect_format(bytes: &[u8]) -> Result<Format, CaptureError> {
    if bytes.len() < 24 {
        return Err(CaptureError::TooShort(bytes.len()));
    }
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    match magic {
        0xa1b2_c3d4 => Ok(Format { big_endian: false, nanos: false }),
        0xd4c3_b2a1 => Ok(Format { big_endian: true, nanos: false }),
        0xa1b2_3c4d => Ok(Format { big_endian: false, nanos: true }),
        0x4d3c_b2a1 => Ok(Format { big_endian: true, nanos: true }),
        other => Err(CaptureError::BadMagic(other)),
    }
}

fn ieee80211_payload_offset(frame: &[u8]) -> Option<usize> {
    let fc = *frame.first()?;
    let flags = *frame.get(1)?;
    // type bits 2..3 must say "data"
    if (fc >> 2) & 0x03 != 2 {
        return None;
    }
    let mut hdr = 24;
    if flags & 0x03 == 0x03 {
        hdr += 6;
    }
    if fc & 0x80 != 0 {
        hdr += 2;
    }
    let llc = frame.get(hdr..hdr + 8)?;
    if llc[0] == 0xaa && llc[1] == 0xaa && llc[6] == 0x08 && llc[7] == 0x00 {
        Some(hdr + 8)
    } else {
        None
    }
}

fn ipv4_offset(link_type: u32, frame: &[u8]) -> Option<usize> {
    match link_type {
        LINKTYPE_RAW | LINKTYPE_IPV4 => Some(0),
        LINKTYPE_ETHERNET => {
            let ethertype = u16::from_be_bytes([*frame.get(12)?, *frame.get(13)?]);
            match ethertype {
                0x0800 => Some(14),
                0x8100 => {
                    let inner = u16::from_be_bytes([*frame.get(16)?, *frame.get(17)?]);
                    (inner == 0x0800).then_some(18)
                }
                _ => None,
            }
        }
        LINKTYPE_LINUX_SLL => {
            let proto = u16::from_be_bytes([*frame.get(14)?, *frame.get(15)?]);
            (proto == 0x0800).then_some(16)
        }
        LINKTYPE_IEEE802_11 => ieee80211_payload_offset(frame),
        LINKTYPE_PRISM => ieee80211_payload_offset(frame.get(144..)?).map(|o| o + 144),
        LINKTYPE_RADIOTAP => {
            let len = u16::from_le_bytes([*frame.get(2)?, *frame.get(3)?]) as usize;
            ieee80211_payload_offset(frame.get(len..)?).map(|o| o + len)
        }
        _ => None,
    }
}

/// Returns the routing protocol name when the frame carries a UDP datagram
/// to or from one of [`ROUTING_PORTS`].
fn routing_protocol(link_type: u32, frame: &[u8]) -> Option<&'static str> {
    let ip = frame.get(ipv4_offset(link_type, frame)?..)?;
    let first = *ip.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let ihl = ((first & 0x0f) as usize) * 4;
    if *ip.get(9)? != 17 {
        return None;
    }
    let udp = ip.get(ihl..ihl + 4)?;
    let src = u16::from_be_bytes([udp[0], udp[1]]);
    let dst = u16::from_be_bytes([udp[2], udp[3]]);
    ROUTING_PORTS
        .iter()
        .find(|(port, _)| *port == src || *port == dst)
        .map(|(_, name)| *name)
}

pub fn summarize_capture_bytes(path: &str, bytes: &[u8]) -> Result<CaptureRecord, CaptureError> {
    let format = detect_format(bytes)?;
    let link_type = format.u32_at(bytes, 20);
    let mut record = CaptureRecord {
        path: path.to_string(),
        link_type,
        ..CaptureRecord::default()
    };
    let mut first_ts: Option<f64> = None;
    let mut last_ts = 0.0;
    let mut at = 24;
    let frac_scale = if format.nanos { 1e9 } else { 1e6 };
    while at + 16 <= bytes.len() {
        let (Some(sec), Some(frac), Some(incl)) = (
            format.u32_at(bytes, at),
            format.u32_at(bytes, at + 4),
            format.u32_at(bytes, at + 8),
        ) else {
            break;
        };
        let start = at + 16;
        let end = start + incl as usize;
        let Some(frame) = bytes.get(start..end) else {
            record.error = Some(format!("truncated record at offset {}", at));
            break;
        };
        let ts = sec as f64 + frac as f64 / frac_scale;
        first_ts.get_or_insert(ts);
        last_ts = ts;
        record.packets += 1;
        record.bytes += incl as u64;
        if let Some(proto) = link_type.and_then(|lt| routing_protocol(lt, frame)) {
            record.routing_packets += 1;
            record.routing_bytes += incl as u64;
            *record
                .routing_by_protocol
                .entry(proto.to_string())
                .or_insert(0) += 1;
        }
        at = end;
    }
    record.duration_s = first_ts.map_or(0.0, |first| (last_ts - first).max(0.0));
    Ok(record)
}

pub fn summarize_capture(path: &Path) -> Result<CaptureRecord, CaptureError> {
    let bytes = fs::read(path).map_err(|source| CaptureError::Io {
        path: path.display().to_string(),
        source,
    })?;
    summarize_capture_bytes(&path.display().to_string(), &bytes)
}

/// Summarizes every capture; unreadable files become records with `error`
/// set plus a warning instead of failing the batch.
pub fn analyze_captures<P: AsRef<Path>>(paths: &[P]) -> TraceAnalysis {
    let mut analysis = TraceAnalysis::default();
    let mut by_protocol: BTreeMap<String, u64> = BTreeMap::new();
    for path in paths {
        let path = path.as_ref();
        match summarize_capture(path) {
            Ok(record) => {
                analysis.total_packets += record.packets;
                analysis.total_bytes += record.bytes;
                analysis.routing_packets += record.routing_packets;
                for (proto, n) in &record.routing_by_protocol {
                    *by_protocol.entry(proto.clone()).or_insert(0) += n;
                }
                if let Some(err) = &record.error {
                    analysis
                        .warnings
                        .push(format!("{}: {}", path.display(), err));
                }
                analysis.captures.push(record);
            }
            Err(err) => {
                analysis.warnings.push(err.to_string());
                analysis.captures.push(CaptureRecord {
                    path: path.display().to_string(),
                    error: Some(err.to_string()),
                    ..CaptureRecord::default()
                });
            }
        }
    }
    if analysis.total_packets > 0 {
        analysis.routing_overhead_pct =
            Some(analysis.routing_packets as f64 / analysis.total_packets as f64 * 100.0);
    }
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(link_type: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&65535u32.to_le_bytes());
        out.extend_from_slice(&link_type.to_le_bytes());
        out
    }

    fn udp_ipv4(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut ip = vec![0x45, 0, 0, 28, 0, 0, 0, 0, 64, 17, 0, 0, 10, 0, 0, 1, 10, 0, 0, 2];
        ip.extend_from_slice(&src_port.to_be_bytes());
        ip.extend_from_slice(&dst_port.to_be_bytes());
        ip.extend_from_slice(&[0, 8, 0, 0]);
        ip
    }

    fn record(out: &mut Vec<u8>, sec: u32, usec: u32, frame: &[u8]) {
        out.extend_from_slice(&sec.to_le_bytes());
        out.extend_from_slice(&usec.to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(frame);
    }

    #[test]
    fn counts_routing_packets_on_raw_ip() {
        let mut bytes = header(LINKTYPE_RAW);
        record(&mut bytes, 1, 0, &udp_ipv4(654, 654));
        record(&mut bytes, 2, 500_000, &udp_ipv4(49153, 9));
        record(&mut bytes, 3, 0, &udp_ipv4(698, 698));
        let rec = summarize_capture_bytes("mem.pcap", &bytes).expect("parse");
        assert_eq!(rec.packets, 3);
        assert_eq!(rec.routing_packets, 2);
        assert_eq!(rec.routing_by_protocol.get("aodv"), Some(&1));
        assert_eq!(rec.routing_by_protocol.get("olsr"), Some(&1));
        assert!((rec.duration_s - 2.0).abs() < 1e-9);
        assert_eq!(rec.link_type, Some(LINKTYPE_RAW));
        assert!(rec.error.is_none());
    }

    #[test]
    fn reads_80211_data_frames_with_llc_snap() {
        let mut frame = vec![0x08, 0x00];
        frame.extend_from_slice(&[0u8; 22]);
        frame.extend_from_slice(&[0xaa, 0xaa, 0x03, 0, 0, 0, 0x08, 0x00]);
        frame.extend_from_slice(&udp_ipv4(269, 269));
        let mut bytes = header(LINKTYPE_IEEE802_11);
        record(&mut bytes, 5, 0, &frame);
        let rec = summarize_capture_bytes("wifi.pcap", &bytes).expect("parse");
        assert_eq!(rec.routing_by_protocol.get("dsdv"), Some(&1));
    }

    #[test]
    fn truncated_record_is_flagged_not_fatal() {
        let mut bytes = header(LINKTYPE_RAW);
        record(&mut bytes, 1, 0, &udp_ipv4(654, 654));
        bytes.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 0, 200, 0, 0, 0, 200, 0, 0, 0, 1, 2]);
        let rec = summarize_capture_bytes("cut.pcap", &bytes).expect("parse");
        assert_eq!(rec.packets, 1);
        assert!(rec.error.is_some());
    }

    #[test]
    fn rejects_non_pcap_input() {
        let err = summarize_capture_bytes("x", &[0u8; 32]).expect_err("bad magic");
        assert!(matches!(err, CaptureError::BadMagic(0)));
        let err = summarize_capture_bytes("x", &[0u8; 4]).expect_err("short");
        assert!(matches!(err, CaptureError::TooShort(4)));
    }

    #[test]
    fn missing_files_become_warnings() {
        let analysis = analyze_captures(&["/nonexistent/routelab/capture-0-0.pcap"]);
        assert_eq!(analysis.captures.len(), 1);
        assert!(analysis.captures[0].error.is_some());
        assert_eq!(analysis.warnings.len(), 1);
        assert!(analysis.routing_overhead_pct.is_none());
    }
}
