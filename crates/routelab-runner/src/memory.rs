use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use routelab_core::{ensure_dir, sha256_hex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-z0-9_]+").expect("invalid memory token regex"));

/// A past (task, failure, fix) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub task_description: String,
    pub failing_code: String,
    pub error_text: String,
    pub solution_code: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryHit {
    pub record: MemoryRecord,
    /// Cosine similarity of the query and record documents, in `[0, 1]`.
    pub relevance: f64,
}

/// Append-only JSON-lines store of past fixes, searched by term-frequency
/// cosine similarity over `"Task: ..\nError: .."` documents.
#[derive(Debug)]
pub struct EpisodicMemory {
    path: PathBuf,
    records: Vec<MemoryRecord>,
    threshold: f64,
    top_k: usize,
}

pub fn record_id(task: &str, error: &str) -> String {
    sha256_hex(format!("{}\n{}", task, error).as_bytes())
}

fn document(task: &str, error: &str) -> String {
    format!("Task: {}\nError: {}", task, error)
}

fn term_frequencies(text: &str) -> BTreeMap<String, f64> {
    let lower = text.to_lowercase();
    let mut tf = BTreeMap::new();
    for token in TOKEN.find_iter(&lower) {
        *tf.entry(token.as_str().to_string()).or_insert(0.0) += 1.0;
    }
    tf
}

fn cosine(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> f64 {
    let dot: f64 = a
        .iter()
        .filter_map(|(term, x)| b.get(term).map(|y| x * y))
        .sum();
    let norm = |v: &BTreeMap<String, f64>| v.values().map(|x| x * x).sum::<f64>().sqrt();
    let denom = norm(a) * norm(b);
    if denom == 0.0 {
        0.0
    } else {
        (dot / denom).clamp(0.0, 1.0)
    }
}

impl EpisodicMemory {
    /// Opens (or prepares) the store at `path`. Lines that fail to parse are
    /// skipped with a warning.
    pub fn open(path: &Path, threshold: f64, top_k: usize) -> Result<Self> {
        let mut records = Vec::new();
        if path.exists() {
            let raw = fs::read_to_string(path)
                .map_err(|e| anyhow!("failed to read memory store {}: {}", path.display(), e))?;
            for (idx, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<MemoryRecord>(line) {
                    Ok(rec) => records.push(rec),
                    Err(e) => warn!(
                        path = %path.display(),
                        line = idx + 1,
                        error = %e,
                        "skipping corrupt memory record"
                    ),
                }
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            records,
            threshold,
            top_k: top_k.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn records(&self) -> &[MemoryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Appends a record and returns it, or `None` when the same
    /// (task, error, solution) triple is already stored.
    pub fn store(
        &mut self,
        task: &str,
        failing_code: &str,
        error: &str,
        solution: &str,
    ) -> Result<Option<MemoryRecord>> {
        let id = record_id(task, error);
        if self
            .records
            .iter()
            .any(|r| r.id == id && r.solution_code == solution)
        {
            debug!(id = %id, "memory record already present");
            return Ok(None);
        }
        let record = MemoryRecord {
            id,
            task_description: task.to_string(),
            failing_code: failing_code.to_string(),
            error_text: error.to_string(),
            solution_code: solution.to_string(),
            timestamp: Utc::now(),
        };
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| anyhow!("failed to open memory store {}: {}", self.path.display(), e))?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        self.records.push(record.clone());
        Ok(Some(record))
    }

    /// Records at or above the configured threshold, best first, at most `top_k`.
    pub fn retrieve(&self, task: &str, error: &str) -> Vec<MemoryHit> {
        self.search(task, error, self.threshold, self.top_k)
    }

    pub fn search(&self, task: &str, error: &str, threshold: f64, limit: usize) -> Vec<MemoryHit> {
        let query = term_frequencies(&document(task, error));
        let mut hits: Vec<MemoryHit> = self
            .records
            .iter()
            .map(|r| MemoryHit {
                relevance: cosine(
                    &query,
                    &term_frequencies(&document(&r.task_description, &r.error_text)),
                ),
                record: r.clone(),
            })
            .filter(|h| h.relevance >= threshold)
            .collect();
        hits.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.record.timestamp.cmp(&a.record.timestamp))
        });
        hits.truncate(limit);
        hits
    }
}
