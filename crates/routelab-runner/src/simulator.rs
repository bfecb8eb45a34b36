use crate::config::SimulatorConfig;
use crate::process::run_with_timeout;
use crate::validator::Validator;
use anyhow::{anyhow, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use routelab_core::{atomic_write_bytes, ensure_dir, move_file};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{info, warn};

static LOAD_TIME_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(ImportError|ModuleNotFoundError|SyntaxError)\b")
        .expect("invalid load-time error regex")
});

const DIAGNOSTIC_TAIL_LINES: usize = 20;
const DIAGNOSTIC_MAX_CHARS: usize = 2000;

/// Files produced by one execution, all under `run_dir`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunArtifacts {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub script_backup: PathBuf,
    pub stdout_path: PathBuf,
    pub metrics_path: Option<PathBuf>,
    pub captures: Vec<PathBuf>,
    pub exit_code: Option<i32>,
    pub elapsed_secs: f64,
}

impl RunArtifacts {
    /// The flow-metrics document when one was produced, otherwise the stdout log.
    pub fn log_path(&self) -> &Path {
        self.metrics_path.as_deref().unwrap_or(&self.stdout_path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SimulationOutcome {
    Completed {
        artifacts: RunArtifacts,
        warning: Option<String>,
    },
    /// Rejected before launch, or failed while loading modules.
    CompilationError {
        message: String,
        artifacts: Option<RunArtifacts>,
    },
    SimulationError {
        message: String,
        artifacts: RunArtifacts,
    },
    Timeout {
        message: String,
        artifacts: RunArtifacts,
    },
}

pub struct SimulationRunner {
    config: SimulatorConfig,
    results_root: PathBuf,
    validator: Validator,
}

impl SimulationRunner {
    pub fn new(config: SimulatorConfig, results_root: PathBuf, validator: Validator) -> Self {
        Self {
            config,
            results_root,
            validator,
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn run(&self, code: &str) -> Result<SimulationOutcome> {
        let report = self.validator.validate(code);
        if !report.valid {
            return Ok(SimulationOutcome::CompilationError {
                message: report.message,
                artifacts: None,
            });
        }

        let (run_id, run_dir) = self.allocate_run_dir()?;
        let script_name = format!("sim_{}.{}", run_id, self.config.script_ext);
        let script_backup = run_dir.join(&script_name);
        atomic_write_bytes(&script_backup, code.as_bytes())?;

        let workdir = &self.config.workdir;
        ensure_dir(workdir)?;
        self.clear_stale_artifacts()?;
        let scratch_dir = workdir.join(&self.config.scratch_dir);
        ensure_dir(&scratch_dir)?;
        let scratch_script = scratch_dir.join(&script_name);
        fs::write(&scratch_script, code)?;

        let (program, leading) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("simulator.command must name a program"))?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg(&scratch_script)
            .current_dir(workdir)
            .envs(&self.config.env);
        info!(run_id = %run_id, program = %program, timeout_secs = self.config.timeout_secs, "launching simulation");
        let result = run_with_timeout(cmd, Duration::from_secs(self.config.timeout_secs));
        discard_scratch(&scratch_script);
        let output = result?;

        let stdout_path = run_dir.join(format!("sim_{}_stdout.txt", run_id));
        atomic_write_bytes(&stdout_path, output.stdout.as_bytes())?;
        if !output.stderr.trim().is_empty() {
            atomic_write_bytes(
                &run_dir.join(format!("sim_{}_stderr.txt", run_id)),
                output.stderr.as_bytes(),
            )?;
        }
        let mut artifacts = RunArtifacts {
            run_id: run_id.clone(),
            run_dir: run_dir.clone(),
            script_backup,
            stdout_path,
            metrics_path: None,
            captures: Vec::new(),
            exit_code: output.status,
            elapsed_secs: output.elapsed.as_secs_f64(),
        };

        if output.timed_out {
            self.clear_stale_artifacts()?;
            return Ok(SimulationOutcome::Timeout {
                message: format!(
                    "Simulation exceeded the {}s wall-clock limit",
                    self.config.timeout_secs
                ),
                artifacts,
            });
        }

        if !output.success() {
            self.clear_stale_artifacts()?;
            let text = output.diagnostic_text();
            let status = output
                .status
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            let message = format!("exit status {}: {}", status, diagnostic_tail(text));
            if LOAD_TIME_ERROR.is_match(text) {
                return Ok(SimulationOutcome::CompilationError {
                    message,
                    artifacts: Some(artifacts),
                });
            }
            return Ok(SimulationOutcome::SimulationError { message, artifacts });
        }

        let produced = workdir.join(&self.config.metrics_file);
        if produced.is_file() {
            let dst = run_dir.join(format!("sim_{}.{}", run_id, self.config.metrics_ext()));
            move_file(&produced, &dst)?;
            artifacts.metrics_path = Some(dst);
        }
        for capture in self.capture_files()? {
            let Some(name) = capture.file_name() else {
                continue;
            };
            let dst = run_dir.join(name);
            move_file(&capture, &dst)?;
            artifacts.captures.push(dst);
        }
        let warning = if artifacts.metrics_path.is_none() {
            let msg = format!(
                "simulation exited 0 without producing {}; continuing with stdout log",
                self.config.metrics_file
            );
            warn!(run_id = %run_id, "{}", msg);
            Some(msg)
        } else {
            None
        };
        Ok(SimulationOutcome::Completed { artifacts, warning })
    }

    fn allocate_run_dir(&self) -> Result<(String, PathBuf)> {
        let base = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut run_id = base.clone();
        let mut suffix = 1;
        while self.results_root.join(&run_id).exists() {
            run_id = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        let dir = self.results_root.join(&run_id);
        ensure_dir(&dir)?;
        Ok((run_id, dir))
    }

    fn capture_files(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&self.config.workdir)
            .min_depth(1)
            .max_depth(1)
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let matches = entry
                .file_name()
                .to_str()
                .map_or(false, |n| self.config.is_capture_name(n));
            if matches {
                out.push(entry.into_path());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Removes metrics and capture files left in the working directory so
    /// they cannot be attributed to the next run.
    fn clear_stale_artifacts(&self) -> Result<()> {
        let metrics = self.config.workdir.join(&self.config.metrics_file);
        if metrics.is_file() {
            fs::remove_file(&metrics)?;
        }
        for capture in self.capture_files()? {
            fs::remove_file(&capture)?;
        }
        Ok(())
    }
}

fn diagnostic_tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
    let mut tail = lines[start..].join("\n");
    if tail.len() > DIAGNOSTIC_MAX_CHARS {
        let mut cut = tail.len() - DIAGNOSTIC_MAX_CHARS;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail = tail[cut..].to_string();
    }
    if tail.is_empty() {
        "no diagnostic output".to_string()
    } else {
        tail
    }
}

/// Best-effort removal of the launched copy. A script the simulator already
/// removed is not an error.
fn discard_scratch(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove scratch script");
        }
    }
}
