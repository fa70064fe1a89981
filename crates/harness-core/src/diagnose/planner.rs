//! Test selection by expected information gain per unit cost.

use super::knowledge::{DiagnosticTest, KnowledgeBase};
use super::Hypothesis;

/// Gains below this are treated as uninformative.
pub const MIN_GAIN: f64 = 1e-3;
const COST_FLOOR: f64 = 0.01;

/// Shannon entropy (nats) of a distribution, renormalised first.
pub fn entropy(probs: &[f64]) -> f64 {
    let total: f64 = probs.iter().filter(|p| **p > 0.0).sum();
    if total <= 0.0 {
        return 0.0;
    }
    probs
        .iter()
        .filter(|p| **p > 0.0)
        .map(|p| {
            let q = p / total;
            -q * q.ln()
        })
        .sum()
}

/// Expected reduction in entropy over `hypotheses` from observing `test`.
pub fn expected_information_gain(test: &DiagnosticTest, hypotheses: &[Hypothesis]) -> f64 {
    let total: f64 = hypotheses.iter().map(|h| h.posterior.max(0.0)).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let prior: Vec<f64> = hypotheses.iter().map(|h| h.posterior.max(0.0) / total).collect();
    let sens: Vec<f64> = hypotheses.iter().map(|h| test.p_positive(&h.condition)).collect();

    let p_pos: f64 = prior.iter().zip(&sens).map(|(p, s)| p * s).sum();
    let p_neg = 1.0 - p_pos;

    let post_pos: Vec<f64> = prior.iter().zip(&sens).map(|(p, s)| p * s).collect();
    let post_neg: Vec<f64> = prior.iter().zip(&sens).map(|(p, s)| p * (1.0 - s)).collect();

    let gain = entropy(&prior) - (p_pos * entropy(&post_pos) + p_neg * entropy(&post_neg));
    gain.max(0.0)
}

/// Choice made by [`select_test`].
#[derive(Debug, Clone, PartialEq)]
pub struct TestChoice {
    pub test: DiagnosticTest,
    pub expected_gain: f64,
}

/// Pick the not-yet-ordered test with the best gain per unit cost.
///
/// Ties prefer the cheaper test, then the alphabetically first name.
/// Returns `None` when no remaining test is informative.
pub fn select_test(
    kb: &KnowledgeBase,
    hypotheses: &[Hypothesis],
    already_ordered: &[String],
) -> Option<TestChoice> {
    let mut best: Option<(f64, TestChoice)> = None;
    for test in &kb.tests {
        if already_ordered.iter().any(|t| t == &test.name) {
            continue;
        }
        let gain = expected_information_gain(test, hypotheses);
        if gain < MIN_GAIN {
            continue;
        }
        let value = gain / test.cost.max(COST_FLOOR);
        let better = match &best {
            None => true,
            Some((best_value, choice)) => {
                value > *best_value + 1e-12
                    || ((value - best_value).abs() <= 1e-12
                        && (test.cost < choice.test.cost
                            || (test.cost == choice.test.cost && test.name < choice.test.name)))
            }
        };
        if better {
            best = Some((
                value,
                TestChoice {
                    test: test.clone(),
                    expected_gain: gain,
                },
            ));
        }
    }
    best.map(|(_, choice)| choice)
}
