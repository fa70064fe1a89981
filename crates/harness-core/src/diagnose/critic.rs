//! Consistency and safety review of the current differential.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::knowledge::KnowledgeBase;
use super::DiagnosticSession;
use crate::error::BackendError;

/// Sensitivity at or above which a negative result contradicts a condition.
pub const HIGH_SENSITIVITY: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticReport {
    pub passed: bool,
    pub issues: Vec<String>,
    /// Critical vitals with no emergent condition among the top three.
    pub safety_alert: bool,
}

#[async_trait]
pub trait Critic: Send + Sync {
    async fn review(
        &self,
        session: &DiagnosticSession,
        kb: &KnowledgeBase,
    ) -> Result<CriticReport, BackendError>;
}

/// Deterministic rule-based critic.
///
/// Fails when the leading posterior is below `decision_confidence`, when
/// the leading condition is contradicted by a negative highly sensitive
/// test, or when critical vitals are present but no emergent condition is
/// ranked in the top three.
#[derive(Debug, Clone)]
pub struct RuleCritic {
    pub decision_confidence: f64,
}

impl RuleCritic {
    pub fn new(decision_confidence: f64) -> Self {
        Self {
            decision_confidence,
        }
    }

    pub fn evaluate(&self, session: &DiagnosticSession, kb: &KnowledgeBase) -> CriticReport {
        let mut issues = Vec::new();

        match session.leading() {
            None => issues.push("no differential diagnoses".to_string()),
            Some(lead) => {
                if lead.posterior < self.decision_confidence {
                    issues.push(format!(
                        "leading hypothesis '{}' has posterior {:.2}, below {:.2}",
                        lead.condition, lead.posterior, self.decision_confidence
                    ));
                }
                for result in session.test_results.iter().filter(|r| !r.positive) {
                    let Some(test) = kb.test(&result.test) else {
                        continue;
                    };
                    let sensitivity = test.detects.get(&lead.condition).copied().unwrap_or(0.0);
                    if sensitivity >= HIGH_SENSITIVITY {
                        issues.push(format!(
                            "negative {} (sensitivity {:.2}) contradicts '{}'",
                            test.name, sensitivity, lead.condition
                        ));
                    }
                }
            }
        }

        let safety_alert = !session.critical_vitals.is_empty()
            && !session.hypotheses.iter().take(3).any(|h| h.emergent);
        if safety_alert {
            issues.push(format!(
                "critical vitals ({}) without an emergent differential in the top three",
                session.critical_vitals.join(", ")
            ));
        }

        CriticReport {
            passed: issues.is_empty(),
            issues,
            safety_alert,
        }
    }
}

#[async_trait]
impl Critic for RuleCritic {
    async fn review(
        &self,
        session: &DiagnosticSession,
        kb: &KnowledgeBase,
    ) -> Result<CriticReport, BackendError> {
        Ok(self.evaluate(session, kb))
    }
}
