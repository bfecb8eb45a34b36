use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static NODES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,5})\s*(?:[a-z-]+\s+)?(?:nodes|nodos|vehicles|stations|hosts)\b")
        .expect("invalid node count regex")
});
static SECONDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,6})\s*(?:s|sec|secs|seconds|segundos)\b").expect("invalid duration regex")
});
static MINUTES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,4})\s*(?:min|mins|minutes|minutos)\b").expect("invalid minutes regex")
});
static AREA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{2,6})\s*m?\s*(?:x|×|by)\s*(\d{2,6})\s*m?\b").expect("invalid area regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Aodv,
    Olsr,
    Dsdv,
    Dsr,
    Hwmp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Aodv => "AODV",
            Protocol::Olsr => "OLSR",
            Protocol::Dsdv => "DSDV",
            Protocol::Dsr => "DSR",
            Protocol::Hwmp => "HWMP",
        }
    }

    /// ns-3 python module carrying the protocol helper.
    pub fn module(self) -> &'static str {
        match self {
            Protocol::Aodv => "ns.aodv",
            Protocol::Olsr => "ns.olsr",
            Protocol::Dsdv => "ns.dsdv",
            Protocol::Dsr => "ns.dsr",
            Protocol::Hwmp => "ns.mesh",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Protocol::Aodv => "reactive distance-vector; routes discovered on demand with RREQ/RREP floods",
            Protocol::Olsr => "proactive link-state; multipoint relays limit topology-control flooding",
            Protocol::Dsdv => "proactive distance-vector; periodic full table dumps with sequence numbers",
            Protocol::Dsr => "reactive source routing; full routes carried in packet headers",
            Protocol::Hwmp => "hybrid mesh path selection combining on-demand and tree-based modes",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scenario parameters recognizable in a free-form task description.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskHints {
    pub protocols: Vec<Protocol>,
    pub nodes: Option<u32>,
    pub duration_s: Option<u32>,
    pub area_m: Option<(u32, u32)>,
    pub mobile: bool,
    pub mesh: bool,
}

pub const DEFAULT_NODES: u32 = 10;
pub const DEFAULT_DURATION_S: u32 = 100;
pub const DEFAULT_AREA_M: u32 = 500;

impl TaskHints {
    pub fn parse(task: &str) -> Self {
        let lower = task.to_lowercase();
        let mut protocols = Vec::new();
        for (word, proto) in [
            ("aodv", Protocol::Aodv),
            ("olsr", Protocol::Olsr),
            ("dsdv", Protocol::Dsdv),
            ("dsr", Protocol::Dsr),
            ("hwmp", Protocol::Hwmp),
        ] {
            let hit = lower
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|tok| tok == word);
            if hit {
                protocols.push(proto);
            }
        }
        let number = |re: &Regex| {
            re.captures(task)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
        };
        let duration_s = number(&SECONDS).or_else(|| number(&MINUTES).map(|m| m.saturating_mul(60)));
        let area_m = AREA.captures(task).and_then(|c| {
            let w = c.get(1)?.as_str().parse().ok()?;
            let h = c.get(2)?.as_str().parse().ok()?;
            Some((w, h))
        });
        Self {
            nodes: number(&NODES).filter(|n| *n > 0),
            duration_s: duration_s.filter(|d| *d > 0),
            area_m,
            mobile: ["mobile", "mobility", "vehicular", "vanet", "manet", "random waypoint"]
                .iter()
                .any(|w| lower.contains(w)),
            mesh: protocols.contains(&Protocol::Hwmp)
                || lower.contains("mesh"),
            protocols,
        }
    }

    pub fn primary_protocol(&self) -> Protocol {
        self.protocols.first().copied().unwrap_or(Protocol::Aodv)
    }

    pub fn node_count(&self) -> u32 {
        self.nodes.unwrap_or(DEFAULT_NODES)
    }

    pub fn duration(&self) -> u32 {
        self.duration_s.unwrap_or(DEFAULT_DURATION_S)
    }

    pub fn area(&self) -> (u32, u32) {
        self.area_m.unwrap_or((DEFAULT_AREA_M, DEFAULT_AREA_M))
    }
}
