use anyhow::{anyhow, Context, Result};
use include_dir::{include_dir, Dir};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

static EMBEDDED: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/prompts");

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("invalid placeholder regex"));

/// Prompt templates keyed `"<agent>.<key>[.<subkey>...]"`.
#[derive(Debug, Clone, Default)]
pub struct PromptBook {
    templates: BTreeMap<String, String>,
}

fn flatten(prefix: &str, value: &serde_yaml::Value, out: &mut BTreeMap<String, String>) -> Result<()> {
    match value {
        serde_yaml::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        serde_yaml::Value::Mapping(map) => {
            for (k, v) in map {
                let key = k
                    .as_str()
                    .ok_or_else(|| anyhow!("prompt key under {} is not a string", prefix))?;
                flatten(&format!("{}.{}", prefix, key), v, out)?;
            }
        }
        serde_yaml::Value::Null => {}
        _ => return Err(anyhow!("prompt {} must be a string or a mapping", prefix)),
    }
    Ok(())
}

impl PromptBook {
    pub fn embedded() -> Result<Self> {
        let mut book = Self::default();
        for file in EMBEDDED.files() {
            let Some(agent) = agent_name(file.path()) else {
                continue;
            };
            let raw = file
                .contents_utf8()
                .ok_or_else(|| anyhow!("embedded prompt {} is not utf-8", file.path().display()))?;
            book.merge_yaml(&agent, raw)?;
        }
        Ok(book)
    }

    /// Embedded templates with any `<agent>.yaml` under `override_dir` layered on
    /// top, key by key.
    pub fn load(override_dir: Option<&Path>) -> Result<Self> {
        let mut book = Self::embedded()?;
        let Some(dir) = override_dir else {
            return Ok(book);
        };
        if !dir.exists() {
            return Ok(book);
        }
        for entry in walkdir::WalkDir::new(dir).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(agent) = agent_name(entry.path()) else {
                continue;
            };
            let raw = fs::read_to_string(entry.path())?;
            book.merge_yaml(&agent, &raw)
                .with_context(|| format!("invalid prompt file {}", entry.path().display()))?;
        }
        Ok(book)
    }

    pub fn merge_yaml(&mut self, agent: &str, raw: &str) -> Result<()> {
        let value: serde_yaml::Value = serde_yaml::from_str(raw)?;
        flatten(agent, &value, &mut self.templates)
    }

    pub fn get(&self, key: &str) -> Result<&str> {
        self.templates
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("unknown prompt: {}", key))
    }

    /// Substitutes `{{name}}` placeholders in a single pass; substituted values
    /// are not rescanned. A placeholder without a binding is an error.
    pub fn render(&self, key: &str, vars: &[(&str, &str)]) -> Result<String> {
        let template = self.get(key)?;
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        let mut missing = Vec::new();
        for cap in PLACEHOLDER.captures_iter(template) {
            let (Some(whole), Some(name)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            out.push_str(&template[last..whole.start()]);
            match vars.iter().find(|(k, _)| *k == name.as_str()) {
                Some((_, v)) => out.push_str(v),
                None => missing.push(name.as_str().to_string()),
            }
            last = whole.end();
        }
        out.push_str(&template[last..]);
        if !missing.is_empty() {
            return Err(anyhow!(
                "prompt {} has unbound placeholders: {}",
                key,
                missing.join(", ")
            ));
        }
        Ok(out)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }
}

fn agent_name(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?;
    if ext != "yaml" && ext != "yml" {
        return None;
    }
    path.file_stem()?.to_str().map(str::to_string)
}
