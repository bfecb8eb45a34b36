use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "routelab.yaml";

pub const DEFAULT_CONFIG_YAML: &str = r#"# routelab configuration. Every key is optional.

paths:
  results_root: .routelab/results
  checkpoint_root: .routelab/checkpoints
  memory_path: .routelab/memory/episodes.jsonl

experiment:
  max_iterations: 5
  # seed: 12345

reasoning:
  backend: ollama            # ollama | offline
  base_url: http://localhost:11434
  model_reasoning: llama3.1:8b
  model_coding: llama3.1:8b
  temperature_reasoning: 0.1
  temperature_coding: 0.05
  temperature_analysis: 0.3
  request_timeout_secs: 120
  max_attempts: 3
  backoff_base_ms: 1000

research:
  semantic_scholar: false
  api_url: https://api.semanticscholar.org/graph/v1/paper/search
  max_results: 10
  year_from: 2020
  timeout_secs: 20

simulator:
  command: [python3]
  workdir: .
  scratch_dir: scratch
  script_ext: py
  metrics_file: results.xml
  capture_prefix: capture-
  capture_ext: pcap
  timeout_secs: 900

validator:
  required_imports: [ns.core, ns.network]
  entry_points: ["def main(", "if __name__"]
  lifecycle_calls: ["Simulator.Run()", "Simulator.Destroy()"]
  compile_command: [python3, -m, py_compile]
  compile_timeout_secs: 30

memory:
  enabled: true
  relevance_threshold: 0.35
  top_k: 3
  excerpt_chars: 1500

optimization:
  min_pdr: 85.0
  max_delay_ms: 100.0
  min_success_rate: 80.0

# prompts:
#   override_dir: prompts
"#;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub experiment: ExperimentConfig,
    pub reasoning: ReasoningConfig,
    pub research: ResearchConfig,
    pub simulator: SimulatorConfig,
    pub validator: ValidatorConfig,
    pub memory: MemoryConfig,
    pub optimization: OptimizationConfig,
    pub prompts: PromptsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub results_root: PathBuf,
    pub checkpoint_root: PathBuf,
    pub memory_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            results_root: PathBuf::from(".routelab/results"),
            checkpoint_root: PathBuf::from(".routelab/checkpoints"),
            memory_path: PathBuf::from(".routelab/memory/episodes.jsonl"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub max_iterations: u32,
    pub seed: Option<u64>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Ollama,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub backend: BackendKind,
    pub base_url: String,
    pub model_reasoning: String,
    pub model_coding: String,
    pub temperature_reasoning: f32,
    pub temperature_coding: f32,
    pub temperature_analysis: f32,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Ollama,
            base_url: "http://localhost:11434".to_string(),
            model_reasoning: "llama3.1:8b".to_string(),
            model_coding: "llama3.1:8b".to_string(),
            temperature_reasoning: 0.1,
            temperature_coding: 0.05,
            temperature_analysis: 0.3,
            request_timeout_secs: 120,
            max_attempts: 3,
            backoff_base_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub semantic_scholar: bool,
    pub api_url: String,
    pub max_results: usize,
    pub year_from: i32,
    pub timeout_secs: u64,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            semantic_scholar: false,
            api_url: "https://api.semanticscholar.org/graph/v1/paper/search".to_string(),
            max_results: 10,
            year_from: 2020,
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Program and leading arguments; the script path is appended.
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub scratch_dir: String,
    pub script_ext: String,
    pub metrics_file: String,
    pub capture_prefix: String,
    pub capture_ext: String,
    pub timeout_secs: u64,
    pub env: BTreeMap<String, String>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string()],
            workdir: PathBuf::from("."),
            scratch_dir: "scratch".to_string(),
            script_ext: "py".to_string(),
            metrics_file: "results.xml".to_string(),
            capture_prefix: "capture-".to_string(),
            capture_ext: "pcap".to_string(),
            timeout_secs: 900,
            env: BTreeMap::new(),
        }
    }
}

impl SimulatorConfig {
    /// Extension of the metrics artifact, taken from `metrics_file`.
    pub fn metrics_ext(&self) -> &str {
        Path::new(&self.metrics_file)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("xml")
    }

    pub fn is_capture_name(&self, name: &str) -> bool {
        name.starts_with(&self.capture_prefix)
            && name
                .rsplit_once('.')
                .map_or(false, |(_, ext)| ext == self.capture_ext)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub required_imports: Vec<String>,
    pub entry_points: Vec<String>,
    pub lifecycle_calls: Vec<String>,
    pub compile_command: Option<Vec<String>>,
    pub compile_timeout_secs: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            required_imports: vec!["ns.core".to_string(), "ns.network".to_string()],
            entry_points: vec!["def main(".to_string(), "if __name__".to_string()],
            lifecycle_calls: vec![
                "Simulator.Run()".to_string(),
                "Simulator.Destroy()".to_string(),
            ],
            compile_command: Some(vec![
                "python3".to_string(),
                "-m".to_string(),
                "py_compile".to_string(),
            ]),
            compile_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub relevance_threshold: f64,
    pub top_k: usize,
    pub excerpt_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            relevance_threshold: 0.35,
            top_k: 3,
            excerpt_chars: 1500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub min_pdr: f64,
    pub max_delay_ms: f64,
    pub min_success_rate: f64,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            min_pdr: 85.0,
            max_delay_ms: 100.0,
            min_success_rate: 80.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    pub override_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: serde_yaml::Value = serde_yaml::from_str(raw)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_value(value)?)
    }

    /// Loads `path`, or `./routelab.yaml` when present, or the defaults; then
    /// applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = fs::read_to_string(p)
                    .with_context(|| format!("failed to read config {}", p.display()))?;
                Self::from_yaml_str(&raw)
                    .with_context(|| format!("invalid config {}", p.display()))?
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    let raw = fs::read_to_string(default_path)?;
                    Self::from_yaml_str(&raw)
                        .with_context(|| format!("invalid config {}", DEFAULT_CONFIG_FILE))?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| keys.iter().find_map(|k| lookup(*k).filter(|v| !v.is_empty()));
        if let Some(url) = first(&["ROUTELAB_REASONING_URL", "OLLAMA_BASE_URL"]) {
            self.reasoning.base_url = url;
        }
        if let Some(model) = first(&["ROUTELAB_MODEL_REASONING", "MODEL_REASONING"]) {
            self.reasoning.model_reasoning = model;
        }
        if let Some(model) = first(&["ROUTELAB_MODEL_CODING", "MODEL_CODING"]) {
            self.reasoning.model_coding = model;
        }
        if let Some(raw) = first(&["ROUTELAB_SIM_TIMEOUT_SECS"]) {
            self.simulator.timeout_secs = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROUTELAB_SIM_TIMEOUT_SECS must be an integer, got {:?}", raw))?;
        }
        if let Some(root) = first(&["ROUTELAB_RESULTS_ROOT"]) {
            self.paths.results_root = PathBuf::from(root);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.simulator.command.is_empty() {
            return Err(anyhow!("simulator.command must name a program"));
        }
        if self.simulator.timeout_secs == 0 {
            return Err(anyhow!("simulator.timeout_secs must be positive"));
        }
        if self.simulator.metrics_file.contains('/') {
            return Err(anyhow!(
                "simulator.metrics_file must be a bare file name, got {}",
                self.simulator.metrics_file
            ));
        }
        if self.experiment.max_iterations == 0 {
            return Err(anyhow!("experiment.max_iterations must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.memory.relevance_threshold) {
            return Err(anyhow!("memory.relevance_threshold must be within [0, 1]"));
        }
        if self.reasoning.max_attempts == 0 {
            return Err(anyhow!("reasoning.max_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Resolves relative paths in `paths` and `simulator.workdir` against `base`.
    pub fn rebase(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        fix(&mut self.paths.results_root);
        fix(&mut self.paths.checkpoint_root);
        fix(&mut self.paths.memory_path);
        fix(&mut self.simulator.workdir);
        if let Some(dir) = self.prompts.override_dir.as_mut() {
            fix(dir);
        }
    }
}

pub fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "config_exists: {} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    routelab_core::atomic_write_bytes(path, DEFAULT_CONFIG_YAML.as_bytes())
}
