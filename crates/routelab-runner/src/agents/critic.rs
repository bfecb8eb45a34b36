use super::{AgentContext, Node, CRITIC};
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use routelab_core::{ExperimentState, StateUpdate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

static FLAT_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[^{}]*\}").expect("invalid verdict object regex"));

const APPROVAL_WORDS: [&str; 6] = ["approve", "approved", "looks good", "lgtm", "correct", "acceptable"];
const REJECTION_WORDS: [&str; 7] = [
    "reject",
    "rejected",
    "incorrect",
    "mismatch",
    "missing",
    "wrong",
    "not approved",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Strict,
    Loose,
    Heuristic,
}

impl VerdictSource {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictSource::Strict => "strict",
            VerdictSource::Loose => "loose",
            VerdictSource::Heuristic => "heuristic",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub approved: bool,
    pub critique: String,
    pub source: VerdictSource,
}

fn verdict_from_value(value: &Value, source: VerdictSource) -> Option<Verdict> {
    let approved = value.get("approved")?.as_bool()?;
    let critique = value
        .get("critique")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    Some(Verdict {
        approved,
        critique,
        source,
    })
}

fn contains_word(text: &str, word: &str) -> bool {
    text.match_indices(word).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + word.len()..].chars().next();
        !before.map_or(false, char::is_alphanumeric) && !after.map_or(false, char::is_alphanumeric)
    })
}

/// Reads a review reply: a bare JSON object first, then the first flat
/// `{...}` span, then approval and rejection keywords. Rejection wins when
/// both kinds of keyword appear. `None` when nothing can be read.
pub fn parse_verdict(reply: &str) -> Option<Verdict> {
    let trimmed = reply.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(v) = verdict_from_value(&value, VerdictSource::Strict) {
            return Some(v);
        }
    }
    for m in FLAT_OBJECT.find_iter(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(m.as_str()) {
            if let Some(v) = verdict_from_value(&value, VerdictSource::Loose) {
                return Some(v);
            }
        }
    }
    let lower = trimmed.to_lowercase();
    let rejected = REJECTION_WORDS.iter().any(|w| contains_word(&lower, w));
    let approved = APPROVAL_WORDS.iter().any(|w| contains_word(&lower, w));
    if !rejected && !approved {
        return None;
    }
    Some(Verdict {
        approved: approved && !rejected,
        critique: trimmed.to_string(),
        source: VerdictSource::Heuristic,
    })
}

pub struct Critic {
    ctx: Arc<AgentContext>,
}

impl Critic {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

impl Node for Critic {
    fn name(&self) -> &'static str {
        CRITIC
    }

    fn run(&mut self, state: &ExperimentState) -> Result<StateUpdate> {
        let prompt = self.ctx.prompts.render(
            "critic.review",
            &[("task", &state.task), ("code", &state.code_snippet)],
        )?;
        let reasoning = &self.ctx.reasoning;
        let reply = self.ctx.ask(
            CRITIC,
            "review",
            &reasoning.model_reasoning,
            reasoning.temperature_reasoning,
            prompt,
        );

        let mut update = StateUpdate::new();
        let verdict = match reply {
            Ok(text) => match parse_verdict(&text) {
                Some(v) => v,
                None => {
                    warn!(agent = CRITIC, "review reply unreadable, approving by default");
                    update.critic_approved = Some(state.code_validated);
                    update.critique = Some(String::new());
                    return Ok(update.with_audit(
                        CRITIC,
                        "error_bypass",
                        json!({ "reason": "unparseable reply", "reply_chars": text.len() }),
                    ));
                }
            },
            Err(e) => {
                warn!(agent = CRITIC, error = %e, "review unavailable, approving by default");
                update.critic_approved = Some(state.code_validated);
                update.critique = Some(String::new());
                return Ok(update.with_audit(
                    CRITIC,
                    "error_bypass",
                    json!({ "reason": e.to_string() }),
                ));
            }
        };

        let approved = verdict.approved && state.code_validated;
        info!(agent = CRITIC, approved, source = verdict.source.as_str(), "review complete");
        update.critic_approved = Some(approved);
        update.critique = Some(verdict.critique.clone());
        let action = if approved { "approved" } else { "rejected" };
        Ok(update.with_audit(
            CRITIC,
            action,
            json!({ "source": verdict.source.as_str(), "critique": verdict.critique }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_verdict() {
        let v = parse_verdict(r#"{"approved": false, "critique": "uses OLSR, task asks AODV"}"#)
            .expect("verdict");
        assert!(!v.approved);
        assert_eq!(v.source, VerdictSource::Strict);
        assert_eq!(v.critique, "uses OLSR, task asks AODV");
    }

    #[test]
    fn loose_json_inside_prose() {
        let reply = "Here is my review:\n```json\n{\"approved\": true, \"critique\": \"ok\"}\n```\nThanks";
        let v = parse_verdict(reply).expect("verdict");
        assert!(v.approved);
        assert_eq!(v.source, VerdictSource::Loose);
    }

    #[test]
    fn heuristic_keywords_with_rejection_winning() {
        let v = parse_verdict("LGTM, the script looks good").expect("approve");
        assert!(v.approved);
        assert_eq!(v.source, VerdictSource::Heuristic);

        let v = parse_verdict("Looks good overall but the FlowMonitor is missing").expect("reject");
        assert!(!v.approved);

        assert!(parse_verdict("The weather is nice today").is_none());
        assert!(parse_verdict("{\"verdict\": \"fine\"}").is_none());
    }

    #[test]
    fn keywords_match_whole_words_only() {
        assert!(!contains_word("incorrectly", "correct"));
        assert!(contains_word("this is correct.", "correct"));
        assert!(parse_verdict("approvedness").is_none());
    }
}
