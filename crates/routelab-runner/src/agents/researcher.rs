use super::hints::TaskHints;
use super::{AgentContext, Node, RESEARCHER};
use crate::config::ResearchConfig;
use anyhow::{anyhow, Result};
use chrono::{Datelike, Utc};
use routelab_core::{ExperimentState, Paper, StateUpdate};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const QUALITY_VENUES: [&str; 6] = ["ieee", "acm", "springer", "elsevier", "nature", "science"];
const PAPERS_IN_PROMPT: usize = 7;

pub struct Researcher {
    ctx: Arc<AgentContext>,
    config: ResearchConfig,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<SearchPaper>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPaper {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    citation_count: Option<u64>,
    #[serde(default)]
    venue: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, rename = "abstract")]
    abstract_text: Option<String>,
}

impl Researcher {
    pub fn new(ctx: Arc<AgentContext>, config: ResearchConfig) -> Self {
        Self { ctx, config }
    }

    fn search(&self, task: &str) -> Result<Vec<Paper>> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()?;
        let limit = self.config.max_results.to_string();
        let year = format!("{}-", self.config.year_from);
        let query = format!("routing protocols {} ns-3", task);
        let resp = client
            .get(&self.config.api_url)
            .query(&[
                ("query", query.as_str()),
                ("limit", limit.as_str()),
                ("fields", "title,abstract,year,citationCount,venue,url"),
                ("year", year.as_str()),
            ])
            .send()?;
        if !resp.status().is_success() {
            return Err(anyhow!("literature search returned HTTP {}", resp.status()));
        }
        let body: SearchResponse = resp.json()?;
        let keywords = keywords(task);
        let mut papers: Vec<Paper> = body
            .data
            .into_iter()
            .filter_map(|p| {
                let abstract_text = p.abstract_text.filter(|a| !a.trim().is_empty())?;
                let mut paper = Paper {
                    title: p.title.unwrap_or_default(),
                    year: p.year,
                    citations: p.citation_count.unwrap_or(0),
                    venue: p.venue.filter(|v| !v.is_empty()),
                    url: p.url,
                    abstract_text,
                    relevance: 0.0,
                };
                paper.relevance = relevance_score(&paper, &keywords, Utc::now().year());
                Some(paper)
            })
            .collect();
        rank_papers(&mut papers);
        Ok(papers)
    }
}

fn keywords(task: &str) -> Vec<String> {
    task.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(str::to_string)
        .collect()
}

/// Score in `[0, 100]`: citations up to 40, recency up to 20, venue 10,
/// keyword hits in title or abstract up to 30.
pub(crate) fn relevance_score(paper: &Paper, keywords: &[String], current_year: i32) -> f64 {
    let mut score = (paper.citations as f64 / 10.0).min(40.0);
    if let Some(year) = paper.year {
        let age = current_year - year;
        score += if age <= 2 {
            20.0
        } else if age <= 5 {
            15.0
        } else if age <= 8 {
            10.0
        } else {
            0.0
        };
    }
    let venue = paper.venue.as_deref().unwrap_or("").to_lowercase();
    if QUALITY_VENUES.iter().any(|v| venue.contains(v)) {
        score += 10.0;
    }
    let text = format!("{} {}", paper.title, paper.abstract_text).to_lowercase();
    let hits = keywords.iter().filter(|k| text.contains(k.as_str())).count();
    score += (hits as f64 * 10.0).min(30.0);
    score
}

pub(crate) fn rank_papers(papers: &mut [Paper]) {
    papers.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn papers_summary(papers: &[Paper]) -> String {
    if papers.is_empty() {
        return "(none retrieved)".to_string();
    }
    papers
        .iter()
        .take(PAPERS_IN_PROMPT)
        .enumerate()
        .map(|(i, p)| {
            let abstract_text: String = p.abstract_text.chars().take(400).collect();
            format!(
                "[{}] {} ({}), {} citations, relevance {:.0}/100\n{}",
                i + 1,
                p.title,
                p.year.map_or_else(|| "n.d.".to_string(), |y| y.to_string()),
                p.citations,
                p.relevance,
                abstract_text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn references(papers: &[Paper]) -> String {
    let mut out = String::from("\n\nReferences:\n");
    for (i, p) in papers.iter().take(PAPERS_IN_PROMPT).enumerate() {
        out.push_str(&format!(
            "{}. {} ({}) {}\n",
            i + 1,
            p.title,
            p.year.map_or_else(|| "n.d.".to_string(), |y| y.to_string()),
            p.url.as_deref().unwrap_or("")
        ));
    }
    out
}

/// Conservative briefing built from the task text alone.
pub(crate) fn fallback_briefing(task: &str) -> String {
    let hints = TaskHints::parse(task);
    let mut out = format!("Baseline briefing for: {}\n\n", task.trim());
    if hints.protocols.is_empty() {
        out.push_str("Protocols: no protocol named; AODV, OLSR and DSDV are the usual MANET baselines.\n");
    } else {
        for p in &hints.protocols {
            out.push_str(&format!("Protocol {}: {}.\n", p, p.describe()));
        }
    }
    let (w, h) = hints.area();
    out.push_str(&format!(
        "Scenario: {} nodes over {} s in a {}x{} m area{}.\n",
        hints.node_count(),
        hints.duration(),
        w,
        h,
        if hints.mobile { " with random-waypoint mobility" } else { ", static placement" }
    ));
    out.push_str(
        "Metrics: packet delivery ratio, end-to-end delay, throughput and routing overhead, \
         collected per flow with FlowMonitor.\n",
    );
    out.push_str(
        "Pitfalls: start traffic after routing warm-up, keep nodes within radio range, \
         and fix the RNG seed and run number for reproducibility.\n",
    );
    out
}

impl Node for Researcher {
    fn name(&self) -> &'static str {
        RESEARCHER
    }

    fn run(&mut self, state: &ExperimentState) -> Result<StateUpdate> {
        let task = state.task.as_str();
        let papers = if self.config.semantic_scholar {
            match self.search(task) {
                Ok(p) => p,
                Err(e) => {
                    warn!(agent = RESEARCHER, error = %e, "literature search failed");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let prompt = self.ctx.prompts.render(
            "researcher.briefing",
            &[("task", task), ("papers", &papers_summary(&papers))],
        )?;
        let reasoning = &self.ctx.reasoning;
        let (briefing, source) = match self.ctx.ask(
            RESEARCHER,
            "briefing",
            &reasoning.model_reasoning,
            reasoning.temperature_reasoning,
            prompt,
        ) {
            Ok(text) => {
                let mut text = text.trim().to_string();
                if !papers.is_empty() {
                    text.push_str(&references(&papers));
                }
                (text, "reasoning")
            }
            Err(e) => {
                warn!(agent = RESEARCHER, error = %e, "briefing unavailable, using fallback");
                (fallback_briefing(task), "fallback")
            }
        };
        info!(agent = RESEARCHER, papers = papers.len(), source, "research briefing ready");

        let action = if papers.is_empty() && self.config.semantic_scholar {
            "no_papers_found"
        } else {
            "literature_review"
        };
        let mut update = StateUpdate::audited(
            RESEARCHER,
            action,
            json!({
                "papers_count": papers.len(),
                "briefing_source": source,
                "briefing_chars": briefing.len(),
            }),
        );
        update.research_notes.push(briefing);
        update.papers_found = papers;
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paper(title: &str, year: i32, citations: u64, venue: &str) -> Paper {
        Paper {
            title: title.to_string(),
            year: Some(year),
            citations,
            venue: Some(venue.to_string()),
            url: None,
            abstract_text: "Routing in mobile ad hoc networks".to_string(),
            relevance: 0.0,
        }
    }

    #[test]
    fn relevance_rewards_citations_recency_venue_and_keywords() {
        let kw = keywords("compare AODV routing in mobile networks");
        let strong = relevance_score(&paper("AODV routing study", 2024, 500, "IEEE TMC"), &kw, 2024);
        let weak = relevance_score(&paper("Unrelated", 2005, 2, "workshop"), &kw, 2024);
        assert!(strong > weak);
        assert!(strong <= 100.0);
        let mut papers = vec![
            Paper { relevance: weak, ..paper("b", 2005, 2, "") },
            Paper { relevance: strong, ..paper("a", 2024, 500, "") },
        ];
        rank_papers(&mut papers);
        assert_eq!(papers[0].title, "a");
    }

    #[test]
    fn fallback_briefing_reflects_task_parameters() {
        let text = fallback_briefing("compare AODV and OLSR on 30 mobile nodes for 200 seconds");
        assert!(text.contains("Protocol AODV"));
        assert!(text.contains("Protocol OLSR"));
        assert!(text.contains("30 nodes over 200 s"));
        assert!(text.contains("random-waypoint"));
    }
}
