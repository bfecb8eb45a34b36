use crate::config::ValidatorConfig;
use crate::process::run_with_timeout;
use anyhow::Result;
use chrono::Utc;
use routelab_core::ensure_dir;
use serde::Serialize;
use std::fs;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

pub const VALID_MESSAGE: &str = "Code validation passed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub message: String,
}

impl ValidationReport {
    fn ok() -> Self {
        Self {
            valid: true,
            message: VALID_MESSAGE.to_string(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
        }
    }
}

/// Structural gate for generated simulation scripts.
#[derive(Debug, Clone)]
pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn validate(&self, code: &str) -> ValidationReport {
        if code.trim().is_empty() {
            return ValidationReport::fail("Empty script");
        }
        if let Err(message) = check_lexical_structure(code) {
            return ValidationReport::fail(format!("Syntax error: {}", message));
        }
        if let Some(message) = self.byte_compile(code) {
            return ValidationReport::fail(format!("Syntax error: {}", message));
        }
        let missing: Vec<&str> = self
            .config
            .required_imports
            .iter()
            .map(String::as_str)
            .filter(|module| !has_import(code, module))
            .collect();
        if !missing.is_empty() {
            return ValidationReport::fail(format!("Missing required imports: {}", missing.join(", ")));
        }
        if !self.config.entry_points.is_empty()
            && !self.config.entry_points.iter().any(|e| code.contains(e.as_str()))
        {
            return ValidationReport::fail(format!(
                "Missing entry point (expected one of: {})",
                self.config.entry_points.join(", ")
            ));
        }
        let missing_calls: Vec<&str> = self
            .config
            .lifecycle_calls
            .iter()
            .map(String::as_str)
            .filter(|call| !code.contains(call))
            .collect();
        if !missing_calls.is_empty() {
            return ValidationReport::fail(format!(
                "Missing simulator lifecycle calls: {}",
                missing_calls.join(", ")
            ));
        }
        ValidationReport::ok()
    }

    /// Runs the configured compile command against a scratch copy. Returns the
    /// diagnostic on failure. Problems running the compiler itself are logged
    /// and do not reject the script.
    fn byte_compile(&self, code: &str) -> Option<String> {
        let command = self.config.compile_command.as_ref()?;
        let (program, args) = command.split_first()?;
        match self.run_compiler(program, args, code) {
            Ok(diagnostic) => diagnostic,
            Err(e) => {
                warn!(error = %e, "compile check could not run");
                None
            }
        }
    }

    fn run_compiler(&self, program: &str, args: &[String], code: &str) -> Result<Option<String>> {
        let dir = std::env::temp_dir().join(format!(
            "routelab_validate_{}_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros(),
            SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        ensure_dir(&dir)?;
        let script = dir.join("candidate.py");
        fs::write(&script, code)?;
        let mut cmd = Command::new(program);
        cmd.args(args).arg(&script).current_dir(&dir);
        let result = run_with_timeout(cmd, Duration::from_secs(self.config.compile_timeout_secs.max(1)));
        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "failed to remove compile scratch dir");
        }
        let output = result?;
        if output.timed_out {
            return Ok(Some("compile check timed out".to_string()));
        }
        if output.success() {
            return Ok(None);
        }
        let text = output.diagnostic_text().trim();
        let last = text
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("compiler reported an error");
        Ok(Some(last.trim().to_string()))
    }
}

/// Accepts `import m`, `import m as x`, `from m import ...`, and
/// `from parent import leaf` for a dotted module `parent.leaf`.
pub(crate) fn has_import(code: &str, module: &str) -> bool {
    let (parent, leaf) = module.rsplit_once('.').unwrap_or(("", module));
    code.lines().map(str::trim).any(|line| {
        if let Some(rest) = line.strip_prefix("import ") {
            return rest
                .split(',')
                .map(|part| part.split_whitespace().next().unwrap_or(""))
                .any(|name| name == module);
        }
        if let Some(rest) = line.strip_prefix("from ") {
            let mut parts = rest.splitn(2, " import ");
            let source = parts.next().unwrap_or("").trim();
            let names = parts.next().unwrap_or("");
            if source == module {
                return true;
            }
            return !parent.is_empty()
                && source == parent
                && names
                    .split(',')
                    .map(|n| n.trim().trim_matches(|c| c == '(' || c == ')'))
                    .any(|n| n.split_whitespace().next() == Some(leaf));
        }
        false
    })
}

/// Checks bracket balance and string termination, skipping comments and
/// string contents.
fn check_lexical_structure(code: &str) -> std::result::Result<(), String> {
    let chars: Vec<char> = code.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => line += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '\'' | '"' => {
                let start_line = line;
                let triple = i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c;
                if triple {
                    i += 3;
                    loop {
                        if i + 2 >= chars.len() {
                            return Err(format!(
                                "unterminated triple-quoted string starting on line {}",
                                start_line
                            ));
                        }
                        if chars[i] == '\\' {
                            i += 2;
                            continue;
                        }
                        if chars[i] == '\n' {
                            line += 1;
                        }
                        if chars[i] == c && chars[i + 1] == c && chars[i + 2] == c {
                            i += 3;
                            break;
                        }
                        i += 1;
                    }
                    continue;
                }
                i += 1;
                loop {
                    if i >= chars.len() || chars[i] == '\n' {
                        return Err(format!("unterminated string literal on line {}", start_line));
                    }
                    if chars[i] == '\\' {
                        i += 2;
                        continue;
                    }
                    if chars[i] == c {
                        break;
                    }
                    i += 1;
                }
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Err(format!(
                            "'{}' on line {} does not match '{}' opened on line {}",
                            c, line, open, open_line
                        ))
                    }
                    None => return Err(format!("unmatched '{}' on line {}", c, line)),
                }
            }
            _ => {}
        }
        i += 1;
    }
    match stack.pop() {
        Some((open, open_line)) => Err(format!("'{}' opened on line {} is never closed", open, open_line)),
        None => Ok(()),
    }
}
