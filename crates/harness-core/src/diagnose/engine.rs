//! Stage execution for diagnostic sessions.
//!
//! [`DiagnoseEngine::step`] executes exactly one stage of a session and
//! records the resulting events. The engine holds no per-session state;
//! callers own sessions and must not step one session concurrently.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::critic::{Critic, CriticReport, RuleCritic};
use super::hypothesis::{self, RankingInput};
use super::knowledge::KnowledgeBase;
use super::planner;
use super::{
    Decision, DecisionReason, DiagnosticSession, EvidenceRecord, Hypothesis, IntakeInput,
    OrderedTest, RankedDiagnosis, SessionEvent, Stage, TestResult,
};
use crate::error::DiagnoseError;
use crate::models::AskResponse;
use crate::text;

/// Literature lookup used by the Evidence stage (the Ask pipeline).
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    async fn gather(&self, query: &str, trace_id: &str) -> AskResponse;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagnoseSettings {
    /// Planner→Evidence→Critic cycles allowed without the override flag.
    pub loop_cap: u32,
    /// Default cost budget per session.
    pub budget: f64,
    /// Budget consumed by each Evidence-stage Ask call.
    pub ask_call_cost: f64,
    pub max_hypotheses: usize,
    /// Leading posterior the critic requires before a decision.
    pub decision_confidence: f64,
    /// Weight of a completed literature lookup in the posterior.
    pub evidence_weight: f64,
}

impl Default for DiagnoseSettings {
    fn default() -> Self {
        Self {
            loop_cap: 4,
            budget: 10.0,
            ask_call_cost: 1.0,
            max_hypotheses: 5,
            decision_confidence: 0.6,
            evidence_weight: 0.5,
        }
    }
}

/// Caller input for one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepInput {
    /// Required for, and only accepted by, the Intake stage.
    #[serde(default)]
    pub intake: Option<IntakeInput>,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub test_results: Vec<TestResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageOutput {
    Intake {
        findings: Vec<String>,
        critical_vitals: Vec<String>,
    },
    Hypotheses {
        hypotheses: Vec<Hypothesis>,
    },
    TestOrdered {
        test: OrderedTest,
    },
    Stopped {
        reason: DecisionReason,
    },
    Evidence {
        record: EvidenceRecord,
    },
    Critic {
        report: CriticReport,
    },
    Decision {
        decision: Decision,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    /// Stage that was executed.
    pub stage: Stage,
    pub next_stage: Stage,
    pub output: StageOutput,
}

pub struct DiagnoseEngine {
    kb: Arc<KnowledgeBase>,
    settings: DiagnoseSettings,
    critic: Arc<dyn Critic>,
}

impl DiagnoseEngine {
    pub fn new(kb: Arc<KnowledgeBase>, settings: DiagnoseSettings) -> Self {
        let critic = Arc::new(RuleCritic::new(settings.decision_confidence));
        Self {
            kb,
            settings,
            critic,
        }
    }

    pub fn with_critic(mut self, critic: Arc<dyn Critic>) -> Self {
        self.critic = critic;
        self
    }

    pub fn knowledge_base(&self) -> &KnowledgeBase {
        &self.kb
    }

    pub fn settings(&self) -> &DiagnoseSettings {
        &self.settings
    }

    /// Execute the session's current stage.
    pub async fn step(
        &self,
        session: &mut DiagnosticSession,
        source: &dyn EvidenceSource,
        input: StepInput,
    ) -> Result<StepOutcome, DiagnoseError> {
        if session.is_terminal() {
            return Err(DiagnoseError::SessionTerminated(session.id.clone()));
        }

        let stage = session.stage;
        let output = match stage {
            Stage::Intake => {
                let StepInput {
                    intake,
                    findings,
                    test_results,
                } = input;
                let mut intake = intake.ok_or(DiagnoseError::MissingIntake)?;
                self.check_test_results(&test_results)?;
                intake.findings.extend(findings);
                let output = self.intake(session, intake)?;
                self.record_observations(
                    session,
                    StepInput {
                        test_results,
                        ..Default::default()
                    },
                )?;
                output
            }
            _ => {
                if input.intake.is_some() {
                    return Err(DiagnoseError::InvalidInput(
                        "intake has already been recorded for this session".into(),
                    ));
                }
                self.record_observations(session, input)?;
                match stage {
                    Stage::Hypothesis => self.hypothesis(session),
                    Stage::Planner => self.planner(session),
                    Stage::Evidence => self.evidence(session, source).await,
                    Stage::Critic => self.critic(session).await,
                    Stage::Intake | Stage::Decision => self.decision(session),
                }
            }
        };
        Ok(self.outcome(session, stage, output))
    }

    /// Step until the session reaches its decision.
    pub async fn run_to_decision(
        &self,
        session: &mut DiagnosticSession,
        source: &dyn EvidenceSource,
        intake: Option<IntakeInput>,
    ) -> Result<Vec<StepOutcome>, DiagnoseError> {
        let mut outcomes = Vec::new();
        let mut input = StepInput {
            intake,
            ..Default::default()
        };
        while !session.is_terminal() {
            outcomes.push(self.step(session, source, std::mem::take(&mut input)).await?);
        }
        Ok(outcomes)
    }

    fn outcome(&self, session: &DiagnosticSession, stage: Stage, output: StageOutput) -> StepOutcome {
        tracing::info!(
            session_id = %session.id,
            stage = %stage,
            next_stage = %session.stage,
            cycles = session.cycles(),
            budget_remaining = session.budget_remaining,
            "diagnose stage executed"
        );
        StepOutcome {
            stage,
            next_stage: session.stage,
            output,
        }
    }

    fn intake(
        &self,
        session: &mut DiagnosticSession,
        mut intake: IntakeInput,
    ) -> Result<StageOutput, DiagnoseError> {
        let species = text::canonical_species(intake.signalment.species.trim()).ok_or_else(|| {
            DiagnoseError::InvalidInput(format!(
                "unsupported species '{}'",
                intake.signalment.species
            ))
        })?;
        if intake.complaint.trim().is_empty() {
            return Err(DiagnoseError::MissingIntake);
        }
        let budget = intake.budget.unwrap_or(self.settings.budget);
        if !budget.is_finite() || budget < 0.0 {
            return Err(DiagnoseError::InvalidInput("budget must be >= 0".into()));
        }
        intake.signalment.species = species.to_string();

        let findings = hypothesis::extract_findings(
            &self.kb,
            species,
            &intake.complaint,
            &intake.vitals,
            &intake.findings,
        );
        let critical_vitals = hypothesis::critical_vitals(species, &intake.vitals);

        session.record(
            Stage::Hypothesis,
            Utc::now(),
            SessionEvent::IntakeRecorded {
                intake,
                findings: findings.clone(),
                critical_vitals: critical_vitals.clone(),
                budget,
            },
        );
        Ok(StageOutput::Intake {
            findings,
            critical_vitals,
        })
    }

    fn check_test_results(&self, results: &[TestResult]) -> Result<(), DiagnoseError> {
        match results.iter().find(|r| self.kb.test(&r.test).is_none()) {
            Some(unknown) => Err(DiagnoseError::InvalidInput(format!(
                "unknown test '{}'",
                unknown.test
            ))),
            None => Ok(()),
        }
    }

    /// Findings and test results may arrive with any step, intake included.
    fn record_observations(
        &self,
        session: &mut DiagnosticSession,
        input: StepInput,
    ) -> Result<(), DiagnoseError> {
        self.check_test_results(&input.test_results)?;

        let stage = session.stage;
        let findings: Vec<String> = input
            .findings
            .iter()
            .map(|f| hypothesis::normalize_finding(f))
            .filter(|f| !f.is_empty())
            .collect();
        if !findings.is_empty() {
            session.record(stage, Utc::now(), SessionEvent::FindingsAdded { findings });
        }
        for result in input.test_results {
            session.record(stage, Utc::now(), SessionEvent::TestResultRecorded { result });
        }
        Ok(())
    }

    fn hypothesis(&self, session: &mut DiagnosticSession) -> StageOutput {
        let hypotheses = hypothesis::rank_hypotheses(
            &self.kb,
            &RankingInput {
                species: session.species(),
                findings: &session.findings,
                test_results: &session.test_results,
                evidence: &session.evidence,
                evidence_weight: self.settings.evidence_weight,
                max_hypotheses: self.settings.max_hypotheses,
            },
        );
        session.record(
            Stage::Planner,
            Utc::now(),
            SessionEvent::HypothesesRanked {
                hypotheses: hypotheses.clone(),
            },
        );
        StageOutput::Hypotheses { hypotheses }
    }

    fn planner(&self, session: &mut DiagnosticSession) -> StageOutput {
        if !session.override_loop_cap && session.cycles() >= self.settings.loop_cap {
            return self.stop(session, DecisionReason::LoopCapped);
        }
        if session.budget_remaining <= 0.0 || session.budget_remaining < self.settings.ask_call_cost {
            return self.stop(session, DecisionReason::BudgetExhausted);
        }

        let ordered: Vec<String> = session.tests_ordered.iter().map(|t| t.test.clone()).collect();
        let Some(choice) = planner::select_test(&self.kb, &session.hypotheses, &ordered) else {
            return self.stop(session, DecisionReason::NoInformativeTests);
        };

        let test = OrderedTest {
            test: choice.test.name,
            cost: choice.test.cost,
            expected_gain: choice.expected_gain,
            cycle: session.cycles() + 1,
        };
        session.record(
            Stage::Evidence,
            Utc::now(),
            SessionEvent::TestOrdered { test: test.clone() },
        );
        StageOutput::TestOrdered { test }
    }

    fn stop(&self, session: &mut DiagnosticSession, reason: DecisionReason) -> StageOutput {
        tracing::warn!(
            session_id = %session.id,
            reason = ?reason,
            "diagnose loop stopped early"
        );
        session.record(Stage::Decision, Utc::now(), SessionEvent::EarlyStop { reason });
        StageOutput::Stopped { reason }
    }

    async fn evidence(
        &self,
        session: &mut DiagnosticSession,
        source: &dyn EvidenceSource,
    ) -> StageOutput {
        if session.budget_remaining <= 0.0 {
            return self.stop(session, DecisionReason::BudgetExhausted);
        }

        let condition = session
            .leading()
            .map(|h| h.condition.clone())
            .unwrap_or_default();
        let query = evidence_query(session, &condition);
        let trace_id = format!("{}:{}", session.id, session.history.len() + 1);

        let response = source.gather(&query, &trace_id).await;
        let record = EvidenceRecord {
            condition,
            query,
            trace_id,
            status: response.status,
            confidence: response.confidence,
            sources: response
                .citations
                .iter()
                .map(|c| match c.year {
                    Some(year) => format!("{} ({year})", c.title),
                    None => c.title.clone(),
                })
                .collect(),
        };

        session.record(
            Stage::Critic,
            Utc::now(),
            SessionEvent::EvidenceGathered {
                record: record.clone(),
                cost: self.settings.ask_call_cost,
            },
        );
        StageOutput::Evidence { record }
    }

    async fn critic(&self, session: &mut DiagnosticSession) -> StageOutput {
        let report = match self.critic.review(session, &self.kb).await {
            Ok(report) => report,
            Err(e) => CriticReport {
                passed: false,
                issues: vec![format!("critic unavailable: {e}")],
                safety_alert: session.flags.safety_alert,
            },
        };
        let next = if report.passed {
            Stage::Decision
        } else {
            Stage::Hypothesis
        };
        session.record(
            next,
            Utc::now(),
            SessionEvent::CriticReviewed {
                report: report.clone(),
            },
        );
        StageOutput::Critic { report }
    }

    fn decision(&self, session: &mut DiagnosticSession) -> StageOutput {
        let decision = self.build_decision(session);
        session.record(
            Stage::Decision,
            Utc::now(),
            SessionEvent::DecisionIssued {
                decision: decision.clone(),
            },
        );
        StageOutput::Decision { decision }
    }

    fn build_decision(&self, session: &DiagnosticSession) -> Decision {
        let reason = if session.flags.safety_alert {
            DecisionReason::SafetyEscalation
        } else {
            session.stop_reason.unwrap_or(DecisionReason::Confident)
        };

        let diagnoses: Vec<RankedDiagnosis> = session
            .hypotheses
            .iter()
            .map(|h| RankedDiagnosis {
                condition: h.condition.clone(),
                confidence: h.posterior,
            })
            .collect();

        let recommendation = match (session.leading(), reason) {
            (None, _) => "No differential could be ranked from the recorded findings; \
                          re-examine the patient and record additional findings."
                .to_string(),
            (Some(_), DecisionReason::SafetyEscalation) => format!(
                "Critical vitals ({}) with no emergent differential ranked highly: stabilise \
                 the patient and escalate to emergency care before further work-up.",
                session.critical_vitals.join(", ")
            ),
            (Some(lead), DecisionReason::Confident) => format!(
                "Working diagnosis: {} (p = {:.2}). Proceed with condition-specific management \
                 and monitor the response.",
                lead.condition, lead.posterior
            ),
            (Some(lead), reason) => {
                let ordered: Vec<String> =
                    session.tests_ordered.iter().map(|t| t.test.clone()).collect();
                let next = match planner::select_test(&self.kb, &session.hypotheses, &ordered) {
                    Some(choice) => format!("consider {} to discriminate further", choice.test.name),
                    None => "no remaining test is expected to change the ranking".to_string(),
                };
                format!(
                    "Provisional ranking ({}). Leading differential: {} (p = {:.2}); {}.",
                    stop_reason_text(reason),
                    lead.condition,
                    lead.posterior,
                    next
                )
            }
        };

        Decision {
            diagnoses,
            recommendation,
            reason,
            flags: session.flags,
        }
    }
}

fn stop_reason_text(reason: DecisionReason) -> &'static str {
    match reason {
        DecisionReason::Confident => "confident",
        DecisionReason::LoopCapped => "evidence loop cap reached",
        DecisionReason::BudgetExhausted => "cost budget exhausted",
        DecisionReason::NoInformativeTests => "no informative tests remain",
        DecisionReason::SafetyEscalation => "safety escalation",
    }
}

fn evidence_query(session: &DiagnosticSession, condition: &str) -> String {
    let species = session.species();
    let complaint = session.complaint.trim();
    match session.tests_ordered.last() {
        Some(test) if !condition.is_empty() => format!(
            "What evidence supports {condition} in a {species} presenting with {complaint}, \
             and how useful is {}?",
            test.test
        ),
        _ if !condition.is_empty() => {
            format!("What evidence supports {condition} in a {species} presenting with {complaint}?")
        }
        _ => format!("What causes {complaint} in a {species}?"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnose::knowledge::fixture;
    use crate::diagnose::{Signalment, Vitals};
    use crate::models::{AskDiagnostics, AskStatus};
    use crate::error::BackendError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        confidence: f64,
    }

    impl CountingSource {
        fn new(confidence: f64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                confidence,
            }
        }
    }

    #[async_trait]
    impl EvidenceSource for CountingSource {
        async fn gather(&self, _query: &str, trace_id: &str) -> AskResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut resp = AskResponse::rejected(
                trace_id,
                self.confidence,
                vec!["weak".into()],
                AskDiagnostics::default(),
            );
            resp.status = AskStatus::Completed;
            resp
        }
    }

    struct FailingCritic;

    #[async_trait]
    impl Critic for FailingCritic {
        async fn review(
            &self,
            _: &DiagnosticSession,
            _: &KnowledgeBase,
        ) -> Result<CriticReport, BackendError> {
            Ok(CriticReport {
                passed: false,
                issues: vec!["inconsistent".into()],
                safety_alert: false,
            })
        }
    }

    fn intake(override_loop_cap: bool, budget: Option<f64>) -> IntakeInput {
        IntakeInput {
            signalment: Signalment {
                species: "Canine".into(),
                age_years: Some(3.0),
                ..Default::default()
            },
            complaint: "Honking cough for four days after boarding".into(),
            vitals: Vitals {
                temperature_c: Some(39.0),
                heart_rate_bpm: Some(100.0),
                respiratory_rate_bpm: Some(24.0),
            },
            findings: vec![],
            override_loop_cap,
            budget,
        }
    }

    fn engine(critic: Arc<dyn Critic>) -> DiagnoseEngine {
        DiagnoseEngine::new(Arc::new(fixture()), DiagnoseSettings::default()).with_critic(critic)
    }

    fn evidence_calls(session: &DiagnosticSession) -> usize {
        session
            .history
            .iter()
            .filter(|e| matches!(e.event, SessionEvent::EvidenceGathered { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_intake_requires_input() {
        let engine = engine(Arc::new(FailingCritic));
        let mut session = DiagnosticSession::new("s");
        let err = engine
            .step(&mut session, &CountingSource::new(0.8), StepInput::default())
            .await
            .unwrap_err();
        assert_eq!(err, DiagnoseError::MissingIntake);
        assert!(session.history.is_empty());
    }

    #[tokio::test]
    async fn test_each_step_runs_one_stage() {
        let engine = engine(Arc::new(RuleCritic::new(0.6)));
        let source = CountingSource::new(0.8);
        let mut session = DiagnosticSession::new("s");

        let first = engine
            .step(
                &mut session,
                &source,
                StepInput {
                    intake: Some(intake(false, None)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(first.stage, Stage::Intake);
        assert_eq!(first.next_stage, Stage::Hypothesis);
        assert_eq!(session.species(), "dog");
        assert!(session.findings.contains(&"cough".to_string()));

        let second = engine
            .step(&mut session, &source, StepInput::default())
            .await
            .unwrap();
        assert_eq!(second.stage, Stage::Hypothesis);
        assert_eq!(second.next_stage, Stage::Planner);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_loop_cap_forces_decision_after_fourth_evidence_call() {
        let engine = engine(Arc::new(FailingCritic));
        let source = CountingSource::new(0.8);
        let mut session = DiagnosticSession::new("s");

        engine
            .run_to_decision(&mut session, &source, Some(intake(false, None)))
            .await
            .unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
        assert_eq!(evidence_calls(&session), 4);
        let decision = session.decision.as_ref().unwrap();
        assert!(decision.flags.loop_capped);
        assert_eq!(decision.reason, DecisionReason::LoopCapped);
        assert_eq!(session.stage, Stage::Decision);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_forces_early_decision() {
        let engine = engine(Arc::new(FailingCritic));
        let source = CountingSource::new(0.8);
        let mut session = DiagnosticSession::new("s");

        engine
            .run_to_decision(&mut session, &source, Some(intake(false, Some(2.0))))
            .await
            .unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        let decision = session.decision.as_ref().unwrap();
        assert!(decision.flags.budget_exhausted);
        assert!(!decision.flags.loop_capped);
        assert!(session.budget_remaining <= 0.0);
    }

    #[tokio::test]
    async fn test_override_lifts_loop_cap() {
        let engine = engine(Arc::new(FailingCritic));
        let source = CountingSource::new(0.8);
        let mut session = DiagnosticSession::new("s");

        engine
            .run_to_decision(&mut session, &source, Some(intake(true, None)))
            .await
            .unwrap();

        assert!(source.calls.load(Ordering::SeqCst) > 4);
        assert!(!session.flags.loop_capped);
    }

    #[tokio::test]
    async fn test_terminated_session_rejects_steps() {
        let engine = engine(Arc::new(FailingCritic));
        let source = CountingSource::new(0.8);
        let mut session = DiagnosticSession::new("s");
        engine
            .run_to_decision(&mut session, &source, Some(intake(false, None)))
            .await
            .unwrap();

        let err = engine
            .step(&mut session, &source, StepInput::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DiagnoseError::SessionTerminated(_)));
    }

    #[tokio::test]
    async fn test_history_replays_to_identical_session() {
        let engine = engine(Arc::new(FailingCritic));
        let source = CountingSource::new(0.8);
        let mut session = DiagnosticSession::new("s-replay");
        engine
            .run_to_decision(&mut session, &source, Some(intake(false, None)))
            .await
            .unwrap();

        let replayed = DiagnosticSession::replay("s-replay", &session.history);
        assert_eq!(replayed, session);
        assert!(session
            .history
            .windows(2)
            .all(|w| w[1].seq == w[0].seq + 1 && w[1].from == w[0].to));
    }

    #[tokio::test]
    async fn test_evidence_trace_ids_are_scoped_to_session() {
        let engine = engine(Arc::new(FailingCritic));
        let source = CountingSource::new(0.8);
        let mut session = DiagnosticSession::new("abc");
        engine
            .run_to_decision(&mut session, &source, Some(intake(false, None)))
            .await
            .unwrap();
        assert!(session.evidence.iter().all(|e| e.trace_id.starts_with("abc:")));
        assert!(session.evidence[0].query.contains(&session.evidence[0].condition));
    }

    #[tokio::test]
    async fn test_unknown_test_result_is_rejected() {
        let engine = engine(Arc::new(FailingCritic));
        let source = CountingSource::new(0.8);
        let mut session = DiagnosticSession::new("s");
        engine
            .step(
                &mut session,
                &source,
                StepInput {
                    intake: Some(intake(false, None)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let err = engine
            .step(
                &mut session,
                &source,
                StepInput {
                    test_results: vec![TestResult {
                        test: "tarot reading".into(),
                        positive: true,
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DiagnoseError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_intake_records_accompanying_observations() {
        let engine = engine(Arc::new(FailingCritic));
        let source = CountingSource::new(0.8);
        let mut session = DiagnosticSession::new("s");
        engine
            .step(
                &mut session,
                &source,
                StepInput {
                    intake: Some(intake(false, None)),
                    findings: vec!["nasal discharge".into()],
                    test_results: vec![TestResult {
                        test: "respiratory pcr panel".into(),
                        positive: true,
                    }],
                },
            )
            .await
            .unwrap();

        assert!(session
            .findings
            .contains(&hypothesis::normalize_finding("nasal discharge")));
        assert_eq!(session.test_results.len(), 1);
        assert_eq!(session.stage, Stage::Hypothesis);
    }

    #[tokio::test]
    async fn test_intake_with_unknown_test_is_rejected_whole() {
        let engine = engine(Arc::new(FailingCritic));
        let mut session = DiagnosticSession::new("s");
        let err = engine
            .step(
                &mut session,
                &CountingSource::new(0.8),
                StepInput {
                    intake: Some(intake(false, None)),
                    test_results: vec![TestResult {
                        test: "tarot reading".into(),
                        positive: true,
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DiagnoseError::InvalidInput(_)));
        assert!(session.history.is_empty());
        assert_eq!(session.stage, Stage::Intake);
    }

    #[tokio::test]
    async fn test_confident_diagnosis_with_rule_critic() {
        let engine = DiagnoseEngine::new(Arc::new(fixture()), DiagnoseSettings::default());
        let source = CountingSource::new(0.9);
        let mut session = DiagnosticSession::new("s");
        let mut input = intake(false, None);
        input.findings = vec!["nasal discharge".into()];

        engine
            .step(
                &mut session,
                &source,
                StepInput {
                    intake: Some(input),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // Positive PCR before ranking.
        engine
            .step(
                &mut session,
                &source,
                StepInput {
                    test_results: vec![TestResult {
                        test: "respiratory pcr panel".into(),
                        positive: true,
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine.run_to_decision(&mut session, &source, None).await.unwrap();

        let decision = session.decision.unwrap();
        assert_eq!(decision.reason, DecisionReason::Confident);
        assert_eq!(decision.diagnoses[0].condition, "infectious tracheobronchitis");
        assert!(decision.recommendation.starts_with("Working diagnosis"));
    }
}
