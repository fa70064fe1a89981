//! Factuality gate.
//!
//! Every claim is scored against the evidence it cites. A claim's support
//! is the best score among its cited chunks; the answer's confidence is the
//! weakest claim's support. The answer is accepted only when that weakest
//! link clears the configured threshold.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::error::{AskError, BackendError};
use crate::models::{Answer, RankedEvidence};
use crate::text;

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("number pattern is valid"));

const NEGATIONS: &[&str] = &["not", "no", "never", "without", "cannot", "none", "neither"];

/// Scores how well one evidence passage supports one claim.
#[async_trait]
pub trait Verifier: Send + Sync {
    fn name(&self) -> &str;
    /// Support score in `[0, 1]`.
    async fn score(&self, claim: &str, evidence: &str) -> Result<f32, BackendError>;
}

/// Offline verifier based on content-term overlap.
///
/// The score is the share of the claim's content terms found in the
/// evidence, halved when the claim states a number the evidence does not
/// contain, and reduced when the claim is negated but the evidence is not.
#[derive(Debug, Clone, Default)]
pub struct LexicalVerifier;

impl LexicalVerifier {
    pub fn score_sync(&self, claim: &str, evidence: &str) -> f32 {
        let claim_terms: HashSet<String> = text::analyze(claim).into_iter().collect();
        if claim_terms.is_empty() {
            return 0.0;
        }
        let evidence_terms: HashSet<String> = text::analyze(evidence).into_iter().collect();
        let supported = claim_terms
            .iter()
            .filter(|t| evidence_terms.contains(*t))
            .count();
        let mut score = supported as f64 / claim_terms.len() as f64;

        let evidence_numbers: HashSet<&str> =
            NUMBER.find_iter(evidence).map(|m| m.as_str()).collect();
        if NUMBER
            .find_iter(claim)
            .any(|m| !evidence_numbers.contains(m.as_str()))
        {
            score *= 0.5;
        }

        if has_negation(claim) && !has_negation(evidence) {
            score *= 0.7;
        }

        score.clamp(0.0, 1.0) as f32
    }
}

fn has_negation(text: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.to_lowercase())
        .any(|w| NEGATIONS.contains(&w.as_str()) || w.ends_with("n't"))
}

#[async_trait]
impl Verifier for LexicalVerifier {
    fn name(&self) -> &str {
        "lexical"
    }

    async fn score(&self, claim: &str, evidence: &str) -> Result<f32, BackendError> {
        Ok(self.score_sync(claim, evidence))
    }
}

/// Outcome of verifying one answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub accepted: bool,
    /// Minimum per-claim support; 0 when there are no claims.
    pub confidence: f64,
    pub claim_scores: Vec<f64>,
    /// Human-readable rejection reasons. Empty when accepted.
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FactualityGate {
    threshold: f64,
}

impl FactualityGate {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub async fn verify(
        &self,
        verifier: &dyn Verifier,
        answer: &Answer,
        evidence: &[RankedEvidence],
    ) -> Result<Verdict, AskError> {
        if answer.claims.is_empty() {
            return Ok(Verdict {
                accepted: false,
                confidence: 0.0,
                claim_scores: Vec::new(),
                reasons: vec!["no grounded claims".to_string()],
            });
        }

        let mut claim_scores = Vec::with_capacity(answer.claims.len());
        for claim in &answer.claims {
            let mut best = 0.0f64;
            for n in &claim.citations {
                let Some(ev) = evidence.iter().find(|ev| ev.rank_position == *n) else {
                    continue;
                };
                let s = verifier
                    .score(&claim.text, &ev.chunk.text)
                    .await
                    .map_err(|e| AskError::VerifierUnavailable(e.to_string()))?;
                let s = if s.is_finite() {
                    (s as f64).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                best = best.max(s);
            }
            claim_scores.push(best);
        }

        // Claims stripped for lack of a resolvable citation count as zero support.
        let confidence = if answer.stripped_claims > 0 {
            0.0
        } else {
            claim_scores.iter().copied().fold(f64::INFINITY, f64::min)
        };
        let accepted = confidence >= self.threshold && answer.stripped_claims == 0;

        let mut reasons = Vec::new();
        if answer.stripped_claims > 0 {
            reasons.push(format!(
                "{} claim(s) without a resolvable citation",
                answer.stripped_claims
            ));
        }
        if !accepted {
            reasons.push(format!(
                "confidence {confidence:.2} below threshold {:.2}",
                self.threshold
            ));
            for (i, score) in claim_scores.iter().enumerate() {
                if *score < self.threshold {
                    reasons.push(format!(
                        "claim {} weakly supported ({score:.2}): {}",
                        i + 1,
                        answer.claims[i].text
                    ));
                }
            }
        }

        tracing::debug!(
            verifier = verifier.name(),
            claims = claim_scores.len(),
            confidence,
            accepted,
            "factuality gate evaluated"
        );

        Ok(Verdict {
            accepted,
            confidence,
            claim_scores,
            reasons,
        })
    }
}
