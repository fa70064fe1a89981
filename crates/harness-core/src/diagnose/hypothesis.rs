//! Finding extraction and naive-Bayes ranking of differentials.

use std::collections::HashSet;

use super::knowledge::KnowledgeBase;
use super::{EvidenceRecord, Hypothesis, TestResult, Vitals};
use crate::models::AskStatus;
use crate::text;

/// Probability assigned to a present finding the condition profile does not list.
pub const FINDING_LEAK: f64 = 0.05;

struct VitalRange {
    temp: (f64, f64),
    heart: (f64, f64),
    resp: (f64, f64),
}

fn reference_range(species: &str) -> VitalRange {
    match species {
        "cat" => VitalRange {
            temp: (37.8, 39.2),
            heart: (140.0, 220.0),
            resp: (20.0, 30.0),
        },
        "horse" => VitalRange {
            temp: (37.2, 38.3),
            heart: (28.0, 44.0),
            resp: (8.0, 16.0),
        },
        "cattle" => VitalRange {
            temp: (38.0, 39.5),
            heart: (48.0, 84.0),
            resp: (26.0, 50.0),
        },
        "rabbit" => VitalRange {
            temp: (38.5, 40.0),
            heart: (180.0, 300.0),
            resp: (30.0, 60.0),
        },
        _ => VitalRange {
            temp: (37.5, 39.2),
            heart: (60.0, 140.0),
            resp: (10.0, 35.0),
        },
    }
}

/// Findings implied by vitals outside the species reference range.
pub fn vital_findings(species: &str, vitals: &Vitals) -> Vec<String> {
    let r = reference_range(species);
    let mut out = Vec::new();
    if let Some(t) = vitals.temperature_c {
        if t > r.temp.1 {
            out.push("fever".to_string());
        } else if t < r.temp.0 {
            out.push("hypothermia".to_string());
        }
    }
    if let Some(hr) = vitals.heart_rate_bpm {
        if hr > r.heart.1 {
            out.push("tachycardia".to_string());
        } else if hr < r.heart.0 {
            out.push("bradycardia".to_string());
        }
    }
    if let Some(rr) = vitals.respiratory_rate_bpm {
        if rr > r.resp.1 {
            out.push("tachypnoea".to_string());
        }
    }
    out
}

/// Vitals far enough outside the reference range to need urgent care.
pub fn critical_vitals(species: &str, vitals: &Vitals) -> Vec<String> {
    let r = reference_range(species);
    let mut out = Vec::new();
    if let Some(t) = vitals.temperature_c {
        if t >= r.temp.1 + 1.5 {
            out.push(format!("temperature {t:.1} C critically high"));
        } else if t <= r.temp.0 - 1.5 {
            out.push(format!("temperature {t:.1} C critically low"));
        }
    }
    if let Some(hr) = vitals.heart_rate_bpm {
        if hr >= r.heart.1 * 1.4 || hr <= r.heart.0 * 0.7 {
            out.push(format!("heart rate {hr:.0} bpm critical"));
        }
    }
    if let Some(rr) = vitals.respiratory_rate_bpm {
        if rr >= r.resp.1 * 2.0 {
            out.push(format!("respiratory rate {rr:.0} /min critical"));
        }
    }
    out
}

/// Normalise a clinician-entered finding name.
pub fn normalize_finding(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

/// Complaint keywords, explicit findings and vitals, de-duplicated in that order.
pub fn extract_findings(
    kb: &KnowledgeBase,
    species: &str,
    complaint: &str,
    vitals: &Vitals,
    explicit: &[String],
) -> Vec<String> {
    let mut seen = HashSet::new();
    kb.match_findings(complaint)
        .into_iter()
        .chain(explicit.iter().map(|f| normalize_finding(f)))
        .chain(vital_findings(species, vitals))
        .filter(|f| !f.is_empty() && seen.insert(f.clone()))
        .collect()
}

/// Inputs the posterior depends on.
pub struct RankingInput<'a> {
    pub species: &'a str,
    pub findings: &'a [String],
    pub test_results: &'a [TestResult],
    pub evidence: &'a [EvidenceRecord],
    pub evidence_weight: f64,
    pub max_hypotheses: usize,
}

/// Rank every condition applicable to the species by posterior.
///
/// `posterior ∝ prior · Π P(finding|c) · Π P(test result|c) · Π (1 + w · confidence)`
/// where the last product runs over completed literature lookups for `c`.
pub fn rank_hypotheses(kb: &KnowledgeBase, input: &RankingInput<'_>) -> Vec<Hypothesis> {
    let species = text::canonical_species(input.species).unwrap_or(input.species);

    let scored: Vec<(&super::ConditionProfile, f64)> = kb
        .conditions_for(species)
        .map(|c| {
            let mut log_p = c.prior.ln();
            for f in input.findings {
                let p = c.findings.get(f).copied().unwrap_or(FINDING_LEAK);
                log_p += p.clamp(1e-6, 1.0).ln();
            }
            for r in input.test_results {
                if let Some(test) = kb.test(&r.test) {
                    let p = test.p_positive(&c.name);
                    log_p += if r.positive { p.ln() } else { (1.0 - p).ln() };
                }
            }
            for e in input.evidence {
                if e.condition == c.name && e.status == AskStatus::Completed {
                    log_p += (1.0 + input.evidence_weight * e.confidence.clamp(0.0, 1.0)).ln();
                }
            }
            (c, log_p)
        })
        .collect();

    if scored.is_empty() {
        return Vec::new();
    }

    let max = scored
        .iter()
        .map(|(_, l)| *l)
        .fold(f64::NEG_INFINITY, f64::max);
    let total: f64 = scored.iter().map(|(_, l)| (l - max).exp()).sum();

    let mut hypotheses: Vec<Hypothesis> = scored
        .into_iter()
        .map(|(c, l)| Hypothesis {
            condition: c.name.clone(),
            prior: c.prior,
            posterior: (l - max).exp() / total,
            emergent: c.emergent,
            supporting: input
                .findings
                .iter()
                .filter(|f| c.findings.get(*f).is_some_and(|p| *p >= 0.5))
                .cloned()
                .collect(),
        })
        .collect();

    hypotheses.sort_by(|a, b| {
        b.posterior
            .partial_cmp(&a.posterior)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.condition.cmp(&b.condition))
    });
    hypotheses.truncate(input.max_hypotheses.max(1));
    hypotheses
}
