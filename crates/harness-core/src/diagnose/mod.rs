//! Sequential diagnostic orchestrator.
//!
//! A [`DiagnosticSession`] moves through six stages:
//!
//! ```text
//! Intake ─▶ Hypothesis ─▶ Planner ─▶ Evidence ─▶ Critic ─▶ Decision
//!               ▲            │                     │
//!               │            └──── loop cap / ─────┼──▶ Decision
//!               │                  budget          │
//!               └──────────── critic fails ────────┘
//! ```
//!
//! Sessions are event sourced. Every mutation is a [`SessionEvent`]
//! appended to `history` inside a [`HistoryEntry`]; [`DiagnosticSession::replay`]
//! rebuilds an identical session from that history alone.

pub mod critic;
pub mod engine;
pub mod hypothesis;
pub mod knowledge;
pub mod planner;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::AskStatus;

pub use critic::{Critic, CriticReport, RuleCritic};
pub use engine::{
    DiagnoseEngine, DiagnoseSettings, EvidenceSource, StageOutput, StepInput, StepOutcome,
};
pub use knowledge::{ConditionProfile, DiagnosticTest, FindingDefinition, KnowledgeBase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    Hypothesis,
    Planner,
    Evidence,
    Critic,
    Decision,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Hypothesis => "hypothesis",
            Stage::Planner => "planner",
            Stage::Evidence => "evidence",
            Stage::Critic => "critic",
            Stage::Decision => "decision",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Patient description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signalment {
    pub species: String,
    #[serde(default)]
    pub breed: Option<String>,
    #[serde(default)]
    pub age_years: Option<f64>,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub weight_kg: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
    #[serde(default)]
    pub temperature_c: Option<f64>,
    #[serde(default)]
    pub heart_rate_bpm: Option<f64>,
    #[serde(default)]
    pub respiratory_rate_bpm: Option<f64>,
}

/// Input to the Intake stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeInput {
    pub signalment: Signalment,
    pub complaint: String,
    #[serde(default)]
    pub vitals: Vitals,
    /// Findings reported explicitly by the clinician.
    #[serde(default)]
    pub findings: Vec<String>,
    /// Lifts the Planner→Evidence→Critic loop cap.
    #[serde(default)]
    pub override_loop_cap: bool,
    /// Overrides the configured cost budget for this session.
    #[serde(default)]
    pub budget: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test: String,
    pub positive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub condition: String,
    pub prior: f64,
    pub posterior: f64,
    pub emergent: bool,
    /// Present findings that the condition explains well.
    pub supporting: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedTest {
    pub test: String,
    pub cost: f64,
    pub expected_gain: f64,
    /// 1-based Planner cycle that ordered the test.
    pub cycle: u32,
}

/// Literature evidence gathered for one hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub condition: String,
    pub query: String,
    pub trace_id: String,
    pub status: AskStatus,
    pub confidence: f64,
    /// "Title (year)" of each cited source.
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Confident,
    LoopCapped,
    BudgetExhausted,
    NoInformativeTests,
    SafetyEscalation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFlags {
    pub budget_exhausted: bool,
    pub loop_capped: bool,
    pub safety_alert: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedDiagnosis {
    pub condition: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub diagnoses: Vec<RankedDiagnosis>,
    pub recommendation: String,
    pub reason: DecisionReason,
    pub flags: SessionFlags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    IntakeRecorded {
        intake: IntakeInput,
        findings: Vec<String>,
        critical_vitals: Vec<String>,
        budget: f64,
    },
    FindingsAdded {
        findings: Vec<String>,
    },
    TestResultRecorded {
        result: TestResult,
    },
    HypothesesRanked {
        hypotheses: Vec<Hypothesis>,
    },
    TestOrdered {
        test: OrderedTest,
    },
    EarlyStop {
        reason: DecisionReason,
    },
    EvidenceGathered {
        record: EvidenceRecord,
        cost: f64,
    },
    CriticReviewed {
        report: CriticReport,
    },
    DecisionIssued {
        decision: Decision,
    },
}

/// One append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: u64,
    pub from: Stage,
    pub to: Stage,
    pub at: DateTime<Utc>,
    pub event: SessionEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticSession {
    pub id: String,
    pub stage: Stage,
    pub signalment: Option<Signalment>,
    pub complaint: String,
    pub vitals: Vitals,
    pub findings: Vec<String>,
    pub critical_vitals: Vec<String>,
    pub test_results: Vec<TestResult>,
    pub hypotheses: Vec<Hypothesis>,
    pub tests_ordered: Vec<OrderedTest>,
    pub evidence: Vec<EvidenceRecord>,
    pub budget_remaining: f64,
    pub override_loop_cap: bool,
    pub flags: SessionFlags,
    pub last_review: Option<CriticReport>,
    pub stop_reason: Option<DecisionReason>,
    pub decision: Option<Decision>,
    pub history: Vec<HistoryEntry>,
}

impl DiagnosticSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stage: Stage::Intake,
            signalment: None,
            complaint: String::new(),
            vitals: Vitals::default(),
            findings: Vec::new(),
            critical_vitals: Vec::new(),
            test_results: Vec::new(),
            hypotheses: Vec::new(),
            tests_ordered: Vec::new(),
            evidence: Vec::new(),
            budget_remaining: 0.0,
            override_loop_cap: false,
            flags: SessionFlags::default(),
            last_review: None,
            stop_reason: None,
            decision: None,
            history: Vec::new(),
        }
    }

    /// Rebuild a session from its history.
    pub fn replay(id: impl Into<String>, history: &[HistoryEntry]) -> Self {
        let mut session = Self::new(id);
        for entry in history {
            session.apply(&entry.event, entry.to);
            session.history.push(entry.clone());
        }
        session
    }

    pub fn is_terminal(&self) -> bool {
        self.decision.is_some()
    }

    /// Number of Planner→Evidence→Critic cycles started so far.
    pub fn cycles(&self) -> u32 {
        self.tests_ordered.len() as u32
    }

    pub fn species(&self) -> &str {
        self.signalment
            .as_ref()
            .map(|s| s.species.as_str())
            .unwrap_or("")
    }

    pub fn leading(&self) -> Option<&Hypothesis> {
        self.hypotheses.first()
    }

    /// Append an event and apply it. This is the only way a session changes.
    pub(crate) fn record(&mut self, to: Stage, at: DateTime<Utc>, event: SessionEvent) {
        let entry = HistoryEntry {
            seq: self.history.len() as u64 + 1,
            from: self.stage,
            to,
            at,
            event,
        };
        self.apply(&entry.event, entry.to);
        self.history.push(entry);
    }

    fn apply(&mut self, event: &SessionEvent, to: Stage) {
        match event {
            SessionEvent::IntakeRecorded {
                intake,
                findings,
                critical_vitals,
                budget,
            } => {
                self.signalment = Some(intake.signalment.clone());
                self.complaint = intake.complaint.clone();
                self.vitals = intake.vitals.clone();
                self.override_loop_cap = intake.override_loop_cap;
                self.findings = findings.clone();
                self.critical_vitals = critical_vitals.clone();
                self.budget_remaining = *budget;
            }
            SessionEvent::FindingsAdded { findings } => {
                for f in findings {
                    if !self.findings.contains(f) {
                        self.findings.push(f.clone());
                    }
                }
            }
            SessionEvent::TestResultRecorded { result } => {
                self.test_results.retain(|r| r.test != result.test);
                self.test_results.push(result.clone());
            }
            SessionEvent::HypothesesRanked { hypotheses } => {
                self.hypotheses = hypotheses.clone();
            }
            SessionEvent::TestOrdered { test } => {
                self.tests_ordered.push(test.clone());
            }
            SessionEvent::EarlyStop { reason } => {
                match reason {
                    DecisionReason::LoopCapped => self.flags.loop_capped = true,
                    DecisionReason::BudgetExhausted => self.flags.budget_exhausted = true,
                    _ => {}
                }
                self.stop_reason = Some(*reason);
            }
            SessionEvent::EvidenceGathered { record, cost } => {
                self.evidence.push(record.clone());
                self.budget_remaining -= cost;
            }
            SessionEvent::CriticReviewed { report } => {
                self.flags.safety_alert = report.safety_alert;
                self.last_review = Some(report.clone());
            }
            SessionEvent::DecisionIssued { decision } => {
                self.decision = Some(decision.clone());
            }
        }
        self.stage = to;
    }
}
