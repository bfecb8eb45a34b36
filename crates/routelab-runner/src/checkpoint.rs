//! Durable per-thread checkpoints.
//!
//! Layout: `<root>/<thread_id>/step_<NNNNNN>.json`, one document per committed
//! step, each written atomically. Readers may list and load while a writer
//! is active; only the holder of `writer.lock` commits.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use routelab_core::{atomic_write_json_pretty, ensure_dir, ExperimentState};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CHECKPOINT_SCHEMA: &str = "checkpoint_v1";
const LOCK_FILE: &str = "writer.lock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: String,
    pub thread_id: String,
    pub step: u64,
    /// Node whose update this checkpoint includes.
    pub node: String,
    /// Node that runs next on resume.
    pub next: String,
    pub committed_at: DateTime<Utc>,
    pub state: ExperimentState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub steps: usize,
    pub last_step: u64,
    pub last_node: String,
    pub next: String,
    pub committed_at: DateTime<Utc>,
    pub task: String,
}

pub fn validate_thread_id(thread_id: &str) -> Result<()> {
    let ok = !thread_id.is_empty()
        && thread_id.len() <= 128
        && !thread_id.contains("..")
        && thread_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(anyhow!("invalid thread id {:?}", thread_id))
    }
}

fn step_file_name(step: u64) -> String {
    format!("step_{:06}.json", step)
}

fn parse_step_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("step_")?.strip_suffix(".json")?.parse().ok()
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn thread_dir(&self, thread_id: &str) -> Result<PathBuf> {
        validate_thread_id(thread_id)?;
        Ok(self.root.join(thread_id))
    }

    /// Committed step indices for a thread, ascending.
    pub fn steps(&self, thread_id: &str) -> Result<Vec<u64>> {
        let dir = self.thread_dir(thread_id)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut steps: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_step_file_name(&entry.file_name().to_string_lossy()))
            .collect();
        steps.sort_unstable();
        Ok(steps)
    }

    pub fn load(&self, thread_id: &str, step: u64) -> Result<Checkpoint> {
        let path = self.thread_dir(thread_id)?.join(step_file_name(step));
        let bytes = fs::read(&path)
            .map_err(|e| anyhow!("failed to read checkpoint {}: {}", path.display(), e))?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| anyhow!("invalid checkpoint {}: {}", path.display(), e))?;
        if checkpoint.schema_version != CHECKPOINT_SCHEMA {
            return Err(anyhow!(
                "checkpoint {} has schema {}, expected {}",
                path.display(),
                checkpoint.schema_version,
                CHECKPOINT_SCHEMA
            ));
        }
        Ok(checkpoint)
    }

    pub fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        match self.steps(thread_id)?.last() {
            Some(step) => self.load(thread_id, *step).map(Some),
            None => Ok(None),
        }
    }

    pub fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        self.steps(thread_id)?
            .into_iter()
            .map(|step| self.load(thread_id, step))
            .collect()
    }

    /// Threads with at least one committed step, sorted by id.
    pub fn threads(&self) -> Result<Vec<ThreadSummary>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|id| validate_thread_id(id).is_ok())
            .collect();
        ids.sort();
        let mut out = Vec::new();
        for id in ids {
            let steps = self.steps(&id)?;
            let Some(last) = steps.last() else { continue };
            match self.load(&id, *last) {
                Ok(cp) => out.push(ThreadSummary {
                    thread_id: id,
                    steps: steps.len(),
                    last_step: cp.step,
                    last_node: cp.node,
                    next: cp.next,
                    committed_at: cp.committed_at,
                    task: cp.state.task,
                }),
                Err(e) => warn!(thread_id = %id, error = %e, "skipping unreadable checkpoint"),
            }
        }
        Ok(out)
    }

    /// Takes the single-writer lock for a thread.
    pub fn writer(&self, thread_id: &str) -> Result<CheckpointWriter> {
        let dir = self.thread_dir(thread_id)?;
        ensure_dir(&dir)?;
        let lock = acquire_writer_lock(&dir)?;
        Ok(CheckpointWriter {
            thread_id: thread_id.to_string(),
            dir,
            _lock: lock,
        })
    }

    pub fn remove_thread(&self, thread_id: &str) -> Result<()> {
        let dir = self.thread_dir(thread_id)?;
        if dir.join(LOCK_FILE).exists() && !lock_is_stale(&dir.join(LOCK_FILE)) {
            return Err(anyhow!("operation_in_progress: thread {} has an active writer", thread_id));
        }
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn remove_all(&self) -> Result<usize> {
        let threads = self.threads()?;
        for t in &threads {
            self.remove_thread(&t.thread_id)?;
        }
        Ok(threads.len())
    }
}

struct WriterLock {
    path: PathBuf,
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[derive(Debug, Deserialize)]
struct LockPayload {
    pid: u32,
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// A lock is stale when its payload names another process that is gone.
fn lock_is_stale(path: &Path) -> bool {
    let Ok(raw) = fs::read_to_string(path) else {
        return false;
    };
    match serde_json::from_str::<LockPayload>(&raw) {
        Ok(payload) => payload.pid != std::process::id() && !pid_alive(payload.pid),
        Err(_) => false,
    }
}

fn acquire_writer_lock(dir: &Path) -> Result<WriterLock> {
    let lock_path = dir.join(LOCK_FILE);
    for _ in 0..2 {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                let payload = format!(
                    "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                    std::process::id(),
                    Utc::now().to_rfc3339()
                );
                let _ = file.write_all(payload.as_bytes());
                let _ = file.sync_all();
                return Ok(WriterLock { path: lock_path });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if lock_is_stale(&lock_path) {
                    warn!(lock = %lock_path.display(), "reclaiming stale writer lock");
                    let _ = fs::remove_file(&lock_path);
                    continue;
                }
                return Err(anyhow!(
                    "operation_in_progress: thread is already being written by another run"
                ));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(anyhow!("operation_in_progress: could not reclaim writer lock"))
}

/// Commits checkpoints for one thread while holding its writer lock.
pub struct CheckpointWriter {
    thread_id: String,
    dir: PathBuf,
    _lock: WriterLock,
}

impl CheckpointWriter {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn commit(&self, step: u64, node: &str, next: &str, state: &ExperimentState) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            schema_version: CHECKPOINT_SCHEMA.to_string(),
            thread_id: self.thread_id.clone(),
            step,
            node: node.to_string(),
            next: next.to_string(),
            committed_at: Utc::now(),
            state: state.clone(),
        };
        let path = self.dir.join(step_file_name(step));
        atomic_write_json_pretty(&path, &checkpoint)?;
        debug!(thread_id = %self.thread_id, step, node, next, "checkpoint committed");
        Ok(checkpoint)
    }
}
