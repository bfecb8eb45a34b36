use super::hints::{Protocol, TaskHints};
use super::{excerpt, AgentContext, Node, CODER};
use crate::memory::EpisodicMemory;
use crate::validator::{has_import, ValidationReport, Validator};
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use routelab_core::{ErrorType, ExperimentState, StateUpdate};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

static PYTHON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```python[ \t]*\r?\n(.*?)```").expect("invalid python fence regex"));
static ANY_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)```").expect("invalid code fence regex")
});

const BASE_IMPORTS: [&str; 4] = ["ns.core", "ns.network", "ns.internet", "ns.flow_monitor"];
const RESEARCH_NOTES_CHARS: usize = 2000;

/// Settings the Coder needs beyond the shared agent context.
#[derive(Debug, Clone)]
pub struct CoderSettings {
    pub metrics_file: String,
    pub capture_prefix: String,
    pub memory_excerpt_chars: usize,
}

pub struct Coder {
    ctx: Arc<AgentContext>,
    validator: Validator,
    memory: Option<EpisodicMemory>,
    settings: CoderSettings,
}

/// Script text from a reply: the first ```python block, else the first
/// fenced block, else the whole reply.
pub fn extract_code(reply: &str) -> String {
    for re in [&*PYTHON_FENCE, &*ANY_FENCE] {
        if let Some(m) = re.captures(reply).and_then(|c| c.get(1)) {
            return m.as_str().trim().to_string();
        }
    }
    reply.trim().to_string()
}

/// Prepends `import` lines for any of `modules` the script lacks, after a
/// leading shebang or encoding line.
pub fn ensure_imports(code: &str, modules: &[&str]) -> String {
    let missing: Vec<&str> = modules
        .iter()
        .copied()
        .filter(|m| !has_import(code, m))
        .collect();
    if missing.is_empty() {
        return code.to_string();
    }
    let mut header_end = 0;
    for line in code.lines() {
        let t = line.trim_start();
        if t.starts_with("#!") || (t.starts_with('#') && t.contains("coding")) {
            header_end += line.len() + 1;
        } else {
            break;
        }
    }
    let header_end = header_end.min(code.len());
    let mut out = String::with_capacity(code.len() + missing.len() * 20);
    out.push_str(&code[..header_end]);
    if header_end > 0 && !out.ends_with('\n') {
        out.push('\n');
    }
    for m in missing {
        out.push_str("import ");
        out.push_str(m);
        out.push('\n');
    }
    out.push_str(&code[header_end..]);
    out
}

fn mentions_mesh(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("hwmp") || lower.contains("mesh")
}

const BASELINE_TEMPLATE: &str = r#"#!/usr/bin/env python3
"""Baseline @PROTO@ scenario: @NODES@ nodes, @DURATION@ s, @AREA_X@x@AREA_Y@ m."""
import ns.core
import ns.network
import ns.internet
import ns.mobility
import ns.wifi
import ns.applications
import ns.flow_monitor
@PROTO_IMPORT@
NODES = @NODES@
DURATION = @DURATION@.0
AREA_X = @AREA_X@.0
AREA_Y = @AREA_Y@.0


def main():
    ns.core.RngSeedManager.SetSeed(@SEED@)
    ns.core.RngSeedManager.SetRun(1)

    nodes = ns.network.NodeContainer()
    nodes.Create(NODES)

@DEVICES@
    mobility = ns.mobility.MobilityHelper()
    mobility.SetPositionAllocator(
        "ns3::RandomRectanglePositionAllocator",
        "X", ns.core.StringValue("ns3::UniformRandomVariable[Min=0.0|Max=%s]" % AREA_X),
        "Y", ns.core.StringValue("ns3::UniformRandomVariable[Min=0.0|Max=%s]" % AREA_Y),
    )
@MOBILITY@
    mobility.Install(nodes)

    stack = ns.internet.InternetStackHelper()
@ROUTING@
    address = ns.internet.Ipv4AddressHelper()
    address.SetBase(ns.network.Ipv4Address("10.1.1.0"), ns.network.Ipv4Mask("255.255.255.0"))
    interfaces = address.Assign(devices)

    start = min(10.0, DURATION * 0.1)
    for i in range(max(1, NODES // 2)):
        dst = NODES - 1 - i
        port = 9 + i
        sink = ns.applications.PacketSinkHelper(
            "ns3::UdpSocketFactory",
            ns.network.InetSocketAddress(ns.network.Ipv4Address.GetAny(), port),
        )
        sink_apps = sink.Install(nodes.Get(dst))
        sink_apps.Start(ns.core.Seconds(0.0))
        sink_apps.Stop(ns.core.Seconds(DURATION))
        onoff = ns.applications.OnOffHelper(
            "ns3::UdpSocketFactory",
            ns.network.InetSocketAddress(interfaces.GetAddress(dst), port),
        )
        onoff.SetConstantRate(ns.network.DataRate("64kbps"), 512)
        apps = onoff.Install(nodes.Get(i))
        apps.Start(ns.core.Seconds(start + i * 0.1))
        apps.Stop(ns.core.Seconds(DURATION - 1.0))

    phy.EnablePcapAll("@CAPTURE_PREFIX@")
    flowmon_helper = ns.flow_monitor.FlowMonitorHelper()
    monitor = flowmon_helper.InstallAll()

    ns.core.Simulator.Stop(ns.core.Seconds(DURATION))
    ns.core.Simulator.Run()
    monitor.CheckForLostPackets()
    monitor.SerializeToXmlFile("@METRICS_FILE@", True, True)
    ns.core.Simulator.Destroy()


if __name__ == "__main__":
    main()
"#;

const ADHOC_DEVICES: &str = r#"    wifi = ns.wifi.WifiHelper()
    wifi.SetStandard(ns.wifi.WIFI_STANDARD_80211b)
    wifi.SetRemoteStationManager(
        "ns3::ConstantRateWifiManager",
        "DataMode", ns.core.StringValue("DsssRate11Mbps"),
        "ControlMode", ns.core.StringValue("DsssRate1Mbps"),
    )
    channel = ns.wifi.YansWifiChannelHelper.Default()
    phy = ns.wifi.YansWifiPhyHelper()
    phy.SetChannel(channel.Create())
    mac = ns.wifi.WifiMacHelper()
    mac.SetType("ns3::AdhocWifiMac")
    devices = wifi.Install(phy, mac, nodes)
"#;

const MESH_DEVICES: &str = r#"    channel = ns.wifi.YansWifiChannelHelper.Default()
    phy = ns.wifi.YansWifiPhyHelper()
    phy.SetChannel(channel.Create())
    mesh = ns.mesh.MeshHelper.Default()
    mesh.SetStackInstaller("ns3::Dot11sStack")
    mesh.SetSpreadInterfaceChannels(ns.mesh.MeshHelper.SPREAD_CHANNELS)
    mesh.SetMacType("RandomStart", ns.core.TimeValue(ns.core.Seconds(0.1)))
    mesh.SetNumberOfInterfaces(1)
    devices = mesh.Install(phy, nodes)
"#;

const MOBILE_MODEL: &str = r#"    mobility.SetMobilityModel(
        "ns3::RandomWalk2dMobilityModel",
        "Bounds", ns.mobility.RectangleValue(ns.mobility.Rectangle(0.0, AREA_X, 0.0, AREA_Y)),
        "Speed", ns.core.StringValue("ns3::UniformRandomVariable[Min=1.0|Max=10.0]"),
    )"#;

const STATIC_MODEL: &str = r#"    mobility.SetMobilityModel("ns3::ConstantPositionMobilityModel")"#;

fn routing_block(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Aodv => "    stack.SetRoutingHelper(ns.aodv.AodvHelper())\n    stack.Install(nodes)\n",
        Protocol::Olsr => "    stack.SetRoutingHelper(ns.olsr.OlsrHelper())\n    stack.Install(nodes)\n",
        Protocol::Dsdv => "    stack.SetRoutingHelper(ns.dsdv.DsdvHelper())\n    stack.Install(nodes)\n",
        Protocol::Dsr => {
            "    stack.Install(nodes)\n    dsr = ns.dsr.DsrHelper()\n    ns.dsr.DsrMainHelper().Install(dsr, nodes)\n"
        }
        Protocol::Hwmp => "    stack.Install(nodes)\n",
    }
}

/// Minimal runnable script for the task. `shrink` halves node count and
/// duration, used after a timeout.
pub fn baseline_script(
    hints: &TaskHints,
    seed: u64,
    metrics_file: &str,
    capture_prefix: &str,
    shrink: bool,
) -> String {
    let protocol = hints.primary_protocol();
    let (mut nodes, mut duration) = (hints.node_count(), hints.duration());
    if shrink {
        nodes = (nodes / 2).max(2);
        duration = (duration / 2).max(10);
    }
    let (area_x, area_y) = hints.area();
    let devices = if protocol == Protocol::Hwmp {
        MESH_DEVICES
    } else {
        ADHOC_DEVICES
    };
    BASELINE_TEMPLATE
        .replace("@PROTO_IMPORT@", &format!("import {}\n", protocol.module()))
        .replace("@PROTO@", protocol.as_str())
        .replace("@NODES@", &nodes.max(2).to_string())
        .replace("@DURATION@", &duration.to_string())
        .replace("@AREA_X@", &area_x.to_string())
        .replace("@AREA_Y@", &area_y.to_string())
        .replace("@SEED@", &seed.max(1).to_string())
        .replace("@DEVICES@", devices)
        .replace("@MOBILITY@", if hints.mobile { MOBILE_MODEL } else { STATIC_MODEL })
        .replace("@ROUTING@", routing_block(protocol))
        .replace("@CAPTURE_PREFIX@", capture_prefix.trim_end_matches('-'))
        .replace("@METRICS_FILE@", metrics_file)
}

fn fallback_plan(hints: &TaskHints, shrink: bool) -> String {
    let (w, h) = hints.area();
    let (nodes, duration) = if shrink {
        ((hints.node_count() / 2).max(2), (hints.duration() / 2).max(10))
    } else {
        (hints.node_count(), hints.duration())
    };
    format!(
        "Protocol: {}\nNodes: {} in a {}x{} m area\nMobility: {}\nDuration: {} s with UDP on/off flows between node pairs\nMetrics: FlowMonitor XML and pcap traces",
        hints.primary_protocol(),
        nodes,
        w,
        h,
        if hints.mobile { "random walk, 1-10 m/s" } else { "static" },
        duration
    )
}

fn strategy_key(error_type: ErrorType) -> &'static str {
    match error_type {
        ErrorType::CompilationError => "compilation",
        ErrorType::SimulationError => "simulation",
        ErrorType::TimeoutError => "timeout",
        ErrorType::NoError => "general",
    }
}

impl Coder {
    pub fn new(
        ctx: Arc<AgentContext>,
        validator: Validator,
        memory: Option<EpisodicMemory>,
        settings: CoderSettings,
    ) -> Self {
        Self {
            ctx,
            validator,
            memory,
            settings,
        }
    }

    fn render_error_context(
        &self,
        attempt: u32,
        kind: &str,
        detail: &str,
        strategy: &str,
    ) -> Result<String> {
        let strategy = self.ctx.prompts.get(&format!("coder.error_strategy.{}", strategy))?;
        self.ctx.prompts.render(
            "coder.error_context",
            &[
                ("attempt", &attempt.to_string()),
                ("error_type", kind),
                ("error", detail),
                ("strategy", strategy.trim_end()),
            ],
        )
    }

    /// Failure context from the previous attempt: a classified error, or a
    /// Critic rejection.
    fn previous_failure(&self, state: &ExperimentState) -> Result<String> {
        if state.error_type.is_failure() {
            return self.render_error_context(
                state.iteration_count,
                state.error_type.as_str(),
                state.last_error().unwrap_or(""),
                strategy_key(state.error_type),
            );
        }
        if !state.critic_approved && !state.critique.trim().is_empty() {
            return self.render_error_context(
                state.iteration_count,
                "LogicError",
                &state.critique,
                "logic",
            );
        }
        Ok(String::new())
    }

    fn recall(&self, state: &ExperimentState) -> Result<Option<(String, serde_json::Value)>> {
        let (Some(memory), Some(last_error)) = (self.memory.as_ref(), state.last_error()) else {
            return Ok(None);
        };
        let Some(hit) = memory.retrieve(&state.task, last_error).into_iter().next() else {
            return Ok(None);
        };
        info!(
            agent = CODER,
            relevance = hit.relevance,
            record = %hit.record.id,
            "memory hit"
        );
        let relevance = format!("{:.2}", hit.relevance);
        let solution = excerpt(&hit.record.solution_code, self.settings.memory_excerpt_chars);
        let context = self.ctx.prompts.render(
            "coder.memory_context",
            &[
                ("past_task", &hit.record.task_description),
                ("past_error", &hit.record.error_text),
                ("relevance", &relevance),
                ("solution", &solution),
            ],
        )?;
        let details = json!({
            "record_id": hit.record.id,
            "relevance": hit.relevance,
            "past_task": hit.record.task_description,
        });
        Ok(Some((context, details)))
    }

    fn plan(&self, state: &ExperimentState, memory_context: &str, shrink: bool) -> Result<String> {
        let hints = TaskHints::parse(&state.task);
        let notes = state.research_notes.join("\n\n");
        let seed = state.simulation_seed.to_string();
        let prompt = self.ctx.prompts.render(
            "coder.plan",
            &[
                ("task", &state.task),
                ("research_notes", &excerpt(&notes, RESEARCH_NOTES_CHARS)),
                ("memory_context", memory_context),
                ("metrics_file", &self.settings.metrics_file),
                ("capture_prefix", &self.settings.capture_prefix),
                ("seed", &seed),
            ],
        )?;
        let reasoning = &self.ctx.reasoning;
        match self.ctx.ask(
            CODER,
            "plan",
            &reasoning.model_coding,
            reasoning.temperature_coding,
            prompt,
        ) {
            Ok(plan) => Ok(plan),
            Err(e) => {
                warn!(agent = CODER, error = %e, "plan unavailable, using task-derived plan");
                Ok(fallback_plan(&hints, shrink))
            }
        }
    }

    /// One generation pass. Returns the script and whether it came from the
    /// reasoning backend or the baseline.
    fn generate(
        &self,
        state: &ExperimentState,
        plan: &str,
        memory_context: &str,
        error_context: &str,
        shrink: bool,
    ) -> Result<(String, &'static str)> {
        let hints = TaskHints::parse(&state.task);
        let seed = state.simulation_seed.to_string();
        let prompt = self.ctx.prompts.render(
            "coder.generation",
            &[
                ("task", &state.task),
                ("plan", plan),
                ("memory_context", memory_context),
                ("error_context", error_context),
                ("seed", &seed),
                ("metrics_file", &self.settings.metrics_file),
                ("capture_prefix", &self.settings.capture_prefix),
            ],
        )?;
        let reasoning = &self.ctx.reasoning;
        let reply = self.ctx.ask(
            CODER,
            "generation",
            &reasoning.model_coding,
            reasoning.temperature_coding,
            prompt,
        );
        let code = match reply {
            Ok(text) => {
                let mut modules: Vec<&str> = BASE_IMPORTS.to_vec();
                modules.extend(
                    self.validator
                        .config()
                        .required_imports
                        .iter()
                        .map(String::as_str),
                );
                let code = extract_code(&text);
                if mentions_mesh(&code) || mentions_mesh(&state.task) {
                    modules.push("ns.mesh");
                }
                return Ok((ensure_imports(&code, &modules), "reasoning"));
            }
            Err(e) => {
                warn!(agent = CODER, error = %e, "generation failed, using baseline script");
                baseline_script(
                    &hints,
                    state.simulation_seed,
                    &self.settings.metrics_file,
                    &self.settings.capture_prefix,
                    shrink,
                )
            }
        };
        Ok((code, "fallback"))
    }

    fn remember(&mut self, state: &ExperimentState, solution: &str) -> Option<serde_json::Value> {
        if !state.error_type.is_failure() {
            return None;
        }
        let error = state.last_error()?;
        let memory = self.memory.as_mut()?;
        match memory.store(&state.task, &state.code_snippet, error, solution) {
            Ok(Some(record)) => Some(json!({ "record_id": record.id, "error": error })),
            Ok(None) => None,
            Err(e) => {
                warn!(agent = CODER, error = %e, "failed to persist memory record");
                None
            }
        }
    }
}

impl Node for Coder {
    fn name(&self) -> &'static str {
        CODER
    }

    fn run(&mut self, state: &ExperimentState) -> Result<StateUpdate> {
        let attempt = (state.iteration_count + 1).min(state.max_iterations);
        let shrink = state.error_type == ErrorType::TimeoutError;
        let mut update = StateUpdate::new();

        let error_context = self.previous_failure(state)?;
        let (memory_context, memory_hit) = match self.recall(state)? {
            Some((context, details)) => {
                update = update.with_audit(CODER, "memory_hit", details);
                (context, true)
            }
            None => (String::new(), false),
        };

        let plan = self.plan(state, &memory_context, shrink)?;
        let (mut code, mut source) =
            self.generate(state, &plan, &memory_context, &error_context, shrink)?;
        let mut report: ValidationReport = self.validator.validate(&code);
        let mut self_corrected = false;
        if !report.valid && attempt >= state.max_iterations {
            info!(agent = CODER, attempt, message = %report.message, "self-correcting invalid script");
            let correction = self.render_error_context(
                attempt,
                ErrorType::CompilationError.as_str(),
                &report.message,
                "compilation",
            )?;
            let (fixed, fixed_source) =
                self.generate(state, &plan, &memory_context, &correction, shrink)?;
            code = fixed;
            source = fixed_source;
            report = self.validator.validate(&code);
            self_corrected = true;
        }

        update.iteration_count = Some(attempt);
        update.critic_approved = Some(false);
        update.critique = Some(String::new());
        update.code_validated = Some(report.valid);
        let lines = code.lines().count();

        if report.valid {
            if let Some(details) = self.remember(state, &code) {
                update = update.with_audit(CODER, "memory_stored", details);
            }
            info!(agent = CODER, attempt, source, lines, "script generated");
            update.code_snippet = Some(code);
            update.error_type = Some(ErrorType::NoError);
            return Ok(update.with_audit(
                CODER,
                "code_generated",
                json!({
                    "attempt": attempt,
                    "source": source,
                    "lines": lines,
                    "self_corrected": self_corrected,
                    "memory_hit": memory_hit,
                }),
            ));
        }

        warn!(agent = CODER, attempt, message = %report.message, "generated script failed validation");
        update.code_snippet = Some(code);
        update.error_type = Some(ErrorType::CompilationError);
        Ok(update
            .with_error(ErrorType::CompilationError.message(&report.message))
            .with_audit(
                CODER,
                "code_validation_failed",
                json!({
                    "attempt": attempt,
                    "source": source,
                    "message": report.message,
                    "self_corrected": self_corrected,
                }),
            ))
    }

    fn system_error(&self, state: &ExperimentState, error: &anyhow::Error) -> StateUpdate {
        let mut update = super::system_error_update(CODER, error);
        update.iteration_count = Some((state.iteration_count + 1).min(state.max_iterations));
        update.code_validated = Some(false);
        update.critic_approved = Some(false);
        update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidatorConfig;

    #[test]
    fn extracts_python_fence_then_any_fence_then_raw() {
        let reply = "Plan first\n```text\nnot this\n```\n```python\nprint('x')\n```\n";
        assert_eq!(extract_code(reply), "print('x')");
        assert_eq!(extract_code("```\na = 1\n```"), "a = 1");
        assert_eq!(extract_code("  b = 2  \n"), "b = 2");
    }

    #[test]
    fn missing_imports_are_prepended_after_shebang() {
        let code = "#!/usr/bin/env python3\nimport ns.core\nprint(1)\n";
        let fixed = ensure_imports(code, &["ns.core", "ns.network", "ns.mesh"]);
        let lines: Vec<&str> = fixed.lines().collect();
        assert_eq!(lines[0], "#!/usr/bin/env python3");
        assert_eq!(lines[1], "import ns.network");
        assert_eq!(lines[2], "import ns.mesh");
        assert_eq!(lines[3], "import ns.core");
        assert_eq!(ensure_imports(&fixed, &["ns.core", "ns.network"]), fixed);
    }

    #[test]
    fn baseline_scripts_validate_for_every_protocol() {
        let validator = Validator::new(ValidatorConfig::default());
        for task in [
            "simulate AODV with 10 nodes for 100 seconds",
            "OLSR on 30 mobile nodes",
            "DSDV static grid",
            "DSR in a 300x300 area",
            "HWMP mesh backbone with 16 stations",
            "something vague",
        ] {
            let hints = TaskHints::parse(task);
            let script = baseline_script(&hints, 12345, "results.xml", "capture-", false);
            let report = validator.validate(&script);
            assert!(report.valid, "{}: {}", task, report.message);
            assert!(script.contains(hints.primary_protocol().module()));
            assert!(script.contains("SetSeed(12345)"));
            assert!(script.contains("SerializeToXmlFile(\"results.xml\""));
            assert!(script.contains("EnablePcapAll(\"capture\")"));
        }
    }

    #[test]
    fn shrunk_baseline_halves_scenario() {
        let hints = TaskHints::parse("simulate AODV with 10 nodes for 100 seconds");
        let script = baseline_script(&hints, 1, "results.xml", "capture-", true);
        assert!(script.contains("NODES = 5\n"));
        assert!(script.contains("DURATION = 50.0\n"));
    }
}
