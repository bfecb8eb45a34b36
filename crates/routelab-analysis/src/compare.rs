//! Cross-scenario comparison for batch studies: per-KPI sample summaries,
//! pairwise Welch t-tests, and markdown/CSV renderings of both.

use crate::kpi::{confidence_interval, mean, sample_std};
use crate::render::RenderError;
use routelab_core::metric;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;
use std::fmt::Write as _;

pub const DEFAULT_ALPHA: f64 = 0.05;

/// KPIs compared when a batch plan does not name its own.
pub const DEFAULT_KPIS: [&str; 5] = [
    metric::AVG_PDR,
    metric::AVG_DELAY,
    metric::AVG_THROUGHPUT,
    metric::SUCCESS_RATE,
    metric::ROUTING_OVERHEAD,
];

pub fn higher_is_better(kpi: &str) -> bool {
    !matches!(
        kpi,
        metric::AVG_DELAY
            | metric::MEDIAN_DELAY
            | metric::P95_DELAY
            | metric::AVG_JITTER
            | metric::LOST_PACKETS
            | metric::ROUTING_OVERHEAD
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSummary {
    pub n: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
}

impl SampleSummary {
    /// `None` when no finite value is present.
    pub fn of(values: &[f64]) -> Option<Self> {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return None;
        }
        let ci = confidence_interval(&finite);
        Some(Self {
            n: finite.len(),
            mean: mean(&finite),
            std: sample_std(&finite),
            min: finite.iter().copied().fold(f64::INFINITY, f64::min),
            max: finite.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            ci_lower: ci.as_ref().map(|c| c.lower),
            ci_upper: ci.as_ref().map(|c| c.upper),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectSize {
    Negligible,
    Small,
    Medium,
    Large,
}

impl EffectSize {
    pub fn from_cohens_d(d: f64) -> Self {
        match d.abs() {
            x if x < 0.2 => EffectSize::Negligible,
            x if x < 0.5 => EffectSize::Small,
            x if x < 0.8 => EffectSize::Medium,
            _ => EffectSize::Large,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EffectSize::Negligible => "negligible",
            EffectSize::Small => "small",
            EffectSize::Medium => "medium",
            EffectSize::Large => "large",
        }
    }
}

impl fmt::Display for EffectSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two-sample t-test without the equal-variance assumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelchTest {
    pub t_statistic: f64,
    pub degrees_of_freedom: f64,
    pub p_value: f64,
    pub alpha: f64,
    pub significant: bool,
    pub cohens_d: f64,
    pub effect_size: EffectSize,
}

/// Needs at least two finite values on each side.
pub fn welch_t_test(a: &[f64], b: &[f64], alpha: f64) -> Option<WelchTest> {
    let a: Vec<f64> = a.iter().copied().filter(|v| v.is_finite()).collect();
    let b: Vec<f64> = b.iter().copied().filter(|v| v.is_finite()).collect();
    if a.len() < 2 || b.len() < 2 {
        return None;
    }
    let (na, nb) = (a.len() as f64, b.len() as f64);
    let (ma, mb) = (mean(&a), mean(&b));
    let (sa, sb) = (sample_std(&a), sample_std(&b));
    let (va, vb) = (sa * sa / na, sb * sb / nb);
    let se = (va + vb).sqrt();
    let diff = ma - mb;

    let (t_statistic, degrees_of_freedom, p_value) = if se > 0.0 {
        let t = diff / se;
        let df = (va + vb).powi(2) / (va * va / (na - 1.0) + vb * vb / (nb - 1.0));
        (t, df, student_t_two_sided_p(t, df))
    } else if diff == 0.0 {
        (0.0, na + nb - 2.0, 1.0)
    } else {
        (diff.signum() * f64::INFINITY, na + nb - 2.0, 0.0)
    };

    let pooled = ((sa * sa + sb * sb) / 2.0).sqrt();
    let cohens_d = if pooled > 0.0 { diff / pooled } else { 0.0 };
    Some(WelchTest {
        t_statistic,
        degrees_of_freedom,
        p_value,
        alpha,
        significant: p_value < alpha,
        cohens_d,
        effect_size: EffectSize::from_cohens_d(cohens_d),
    })
}

/// P(|T| >= |t|) for Student's t with `df` degrees of freedom.
pub fn student_t_two_sided_p(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return 0.0;
    }
    if df <= 0.0 || !df.is_finite() {
        return f64::NAN;
    }
    let x = df / (df + t * t);
    regularized_incomplete_beta(df / 2.0, 0.5, x).clamp(0.0, 1.0)
}

const LANCZOS_G: f64 = 7.0;
const LANCZOS: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
];

fn ln_gamma(x: f64) -> f64 {
    if x < 0.5 {
        return PI.ln() - (PI * x).sin().abs().ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut acc = LANCZOS[0];
    for (i, c) in LANCZOS.iter().enumerate().skip(1) {
        acc += c / (x + i as f64);
    }
    let t = x + LANCZOS_G + 0.5;
    0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let front = (ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln()).exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

/// Modified Lentz evaluation of the incomplete beta continued fraction.
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 3e-14;
    const TINY: f64 = 1e-300;
    let guard = |v: f64| if v.abs() < TINY { TINY } else { v };

    let (qab, qap, qam) = (a + b, a + 1.0, a - 1.0);
    let mut c = 1.0;
    let mut d = 1.0 / guard(1.0 - qab * x / qap);
    let mut h = d;
    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        h *= d * c;
        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        let step = d * c;
        h *= step;
        if (step - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// KPI samples of one scenario, one value per completed run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScenarioSamples {
    pub scenario: String,
    pub samples: BTreeMap<String, Vec<f64>>,
}

impl ScenarioSamples {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            samples: BTreeMap::new(),
        }
    }

    pub fn push_metrics(&mut self, metrics: &BTreeMap<String, f64>) {
        for (name, value) in metrics {
            self.samples.entry(name.clone()).or_default().push(*value);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSummary {
    pub kpi: String,
    pub scenario: String,
    pub summary: SampleSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseTest {
    pub kpi: String,
    pub a: String,
    pub b: String,
    pub mean_difference: f64,
    pub test: WelchTest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub alpha: f64,
    pub kpis: Vec<String>,
    pub summaries: Vec<KpiSummary>,
    pub tests: Vec<PairwiseTest>,
}

fn samples_of<'a>(group: &'a ScenarioSamples, kpi: &str) -> &'a [f64] {
    group.samples.get(kpi).map(Vec::as_slice).unwrap_or(&[])
}

pub fn compare_scenarios(groups: &[ScenarioSamples], kpis: &[String], alpha: f64) -> Comparison {
    let mut summaries = Vec::new();
    let mut tests = Vec::new();
    for kpi in kpis {
        for group in groups {
            if let Some(summary) = SampleSummary::of(samples_of(group, kpi)) {
                summaries.push(KpiSummary {
                    kpi: kpi.clone(),
                    scenario: group.scenario.clone(),
                    summary,
                });
            }
        }
        for (i, a) in groups.iter().enumerate() {
            for b in &groups[i + 1..] {
                if let Some(test) = welch_t_test(samples_of(a, kpi), samples_of(b, kpi), alpha) {
                    tests.push(PairwiseTest {
                        kpi: kpi.clone(),
                        a: a.scenario.clone(),
                        b: b.scenario.clone(),
                        mean_difference: mean(samples_of(a, kpi)) - mean(samples_of(b, kpi)),
                        test,
                    });
                }
            }
        }
    }
    Comparison {
        alpha,
        kpis: kpis.to_vec(),
        summaries,
        tests,
    }
}

impl Comparison {
    pub fn summary(&self, kpi: &str, scenario: &str) -> Option<&KpiSummary> {
        self.summaries
            .iter()
            .find(|s| s.kpi == kpi && s.scenario == scenario)
    }

    pub fn test(&self, kpi: &str, a: &str, b: &str) -> Option<&PairwiseTest> {
        self.tests.iter().find(|t| {
            t.kpi == kpi && ((t.a == a && t.b == b) || (t.a == b && t.b == a))
        })
    }

    /// Scenario with the best mean for `kpi`, honoring its direction.
    pub fn best(&self, kpi: &str) -> Option<&KpiSummary> {
        let better = |x: &KpiSummary, y: &KpiSummary| {
            if higher_is_better(kpi) {
                x.summary.mean.total_cmp(&y.summary.mean)
            } else {
                y.summary.mean.total_cmp(&x.summary.mean)
            }
        };
        self.summaries
            .iter()
            .filter(|s| s.kpi == kpi)
            .max_by(|x, y| better(x, y))
    }

    pub fn to_markdown(&self, title: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {}\n", title);

        out.push_str("## Summary\n\n");
        out.push_str("| KPI | Scenario | n | Mean | Std | 95% CI | Min | Max |\n");
        out.push_str("|---|---|---|---|---|---|---|---|\n");
        for s in &self.summaries {
            let ci = match (s.summary.ci_lower, s.summary.ci_upper) {
                (Some(lo), Some(hi)) => format!("[{:.3}, {:.3}]", lo, hi),
                _ => "n/a".to_string(),
            };
            let _ = writeln!(
                out,
                "| {} | {} | {} | {:.3} | {:.3} | {} | {:.3} | {:.3} |",
                s.kpi, s.scenario, s.summary.n, s.summary.mean, s.summary.std, ci, s.summary.min, s.summary.max
            );
        }

        let _ = writeln!(
            out,
            "\n## Pairwise comparisons (Welch t-test, alpha = {})\n",
            self.alpha
        );
        if self.tests.is_empty() {
            out.push_str("Not enough repetitions for pairwise tests (need two per scenario).\n");
        } else {
            out.push_str("| KPI | A | B | Mean diff | t | df | p | Significant | Effect (d) |\n");
            out.push_str("|---|---|---|---|---|---|---|---|---|\n");
            for t in &self.tests {
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {:.3} | {:.3} | {:.1} | {:.4} | {} | {} ({:.2}) |",
                    t.kpi,
                    t.a,
                    t.b,
                    t.mean_difference,
                    t.test.t_statistic,
                    t.test.degrees_of_freedom,
                    t.test.p_value,
                    if t.test.significant { "yes" } else { "no" },
                    t.test.effect_size,
                    t.test.cohens_d
                );
            }
        }

        out.push_str("\n## Best per KPI\n\n");
        for kpi in &self.kpis {
            if let Some(best) = self.best(kpi) {
                let _ = writeln!(
                    out,
                    "- **{}** ({} is better): {} with {:.3} ± {:.3}",
                    kpi,
                    if higher_is_better(kpi) { "higher" } else { "lower" },
                    best.scenario,
                    best.summary.mean,
                    best.summary.std
                );
            }
        }
        out
    }

    pub fn to_csv(&self) -> Result<String, RenderError> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record([
            "kpi", "scenario", "n", "mean", "std", "ci_lower", "ci_upper", "min", "max",
        ])?;
        for s in &self.summaries {
            wtr.serialize((
                &s.kpi,
                &s.scenario,
                s.summary.n,
                s.summary.mean,
                s.summary.std,
                s.summary.ci_lower,
                s.summary.ci_upper,
                s.summary.min,
                s.summary.max,
            ))?;
        }
        let bytes = wtr.into_inner().map_err(|e| RenderError::Buffer(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| RenderError::Buffer(e.to_string()))
    }
}
