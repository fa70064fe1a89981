//! Diagnose session service.
//!
//! Owns the live [`DiagnosticSession`]s and steps them through the
//! [`DiagnoseEngine`]. Each session sits behind its own mutex and is
//! single-writer: a step that finds the session locked fails immediately
//! with `session_busy` instead of queueing. Idle sessions expire after
//! `diagnose.session_ttl_secs`.

use anyhow::Result;
use async_trait::async_trait;
use harness_core::diagnose::{
    DiagnoseEngine, DiagnosticSession, EvidenceSource, IntakeInput, Signalment, Stage,
    StageOutput, StepInput, Vitals,
};
use harness_core::error::DiagnoseError;
use harness_core::models::AskResponse;
use moka::future::Cache;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::ask::AskService;
use crate::config::Config;
use crate::knowledge::load_knowledge_base;

/// Evidence stage backed by the Ask orchestrator.
pub struct AskEvidence {
    ask: Arc<AskService>,
}

impl AskEvidence {
    pub fn new(ask: Arc<AskService>) -> Self {
        Self { ask }
    }
}

#[async_trait]
impl EvidenceSource for AskEvidence {
    async fn gather(&self, query: &str, trace_id: &str) -> AskResponse {
        self.ask.ask(query, Some(trace_id.to_string())).await
    }
}

/// Result of one `POST /diagnose/step`.
#[derive(Debug, Clone, Serialize)]
pub struct StepResponse {
    pub session_id: String,
    /// Stage that was executed.
    pub stage: Stage,
    pub next_stage: Stage,
    pub output: StageOutput,
    pub session_state: DiagnosticSession,
}

type SessionHandle = Arc<Mutex<DiagnosticSession>>;

pub struct DiagnoseService {
    engine: DiagnoseEngine,
    evidence: Arc<dyn EvidenceSource>,
    sessions: Cache<String, SessionHandle>,
}

impl DiagnoseService {
    pub fn new(engine: DiagnoseEngine, evidence: Arc<dyn EvidenceSource>, session_ttl: Duration) -> Self {
        Self {
            engine,
            evidence,
            sessions: Cache::builder().time_to_idle(session_ttl).build(),
        }
    }

    pub fn from_config(config: &Config, ask: Arc<AskService>) -> Result<Self> {
        let kb = load_knowledge_base(&config.diagnose)?;
        let engine = DiagnoseEngine::new(Arc::new(kb), config.diagnose.settings());
        Ok(Self::new(
            engine,
            Arc::new(AskEvidence::new(ask)),
            Duration::from_secs(config.diagnose.session_ttl_secs),
        ))
    }

    pub fn engine(&self) -> &DiagnoseEngine {
        &self.engine
    }

    /// Run the next stage of `session_id`, or start a new session.
    ///
    /// A step carrying intake claims its session slot before running, so
    /// two intakes racing on one id never both succeed. The slot is
    /// released again if the intake fails. An unknown `session_id`
    /// accompanied by intake starts a session under that id.
    pub async fn step(
        &self,
        session_id: Option<String>,
        input: StepInput,
    ) -> Result<StepResponse, DiagnoseError> {
        let (id, handle) = match session_id {
            Some(id) if input.intake.is_none() => {
                let handle = self
                    .sessions
                    .get(&id)
                    .await
                    .ok_or_else(|| DiagnoseError::SessionNotFound(id.clone()))?;
                (id, handle)
            }
            session_id => {
                let id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let handle = self
                    .sessions
                    .entry(id.clone())
                    .or_insert_with(async {
                        Arc::new(Mutex::new(DiagnosticSession::new(id.clone())))
                    })
                    .await
                    .into_value();
                (id, handle)
            }
        };

        let mut session = handle
            .try_lock()
            .map_err(|_| DiagnoseError::SessionBusy(id.clone()))?;
        let started = session.history.is_empty();
        let result = self.run_step(&mut session, input).await;

        if started {
            match &result {
                Ok(_) => tracing::info!(session_id = %id, "diagnostic session started"),
                // Released under the lock so a racing intake holding the
                // same handle sees it busy rather than reviving it.
                Err(_) if session.history.is_empty() => self.sessions.invalidate(&id).await,
                Err(_) => {}
            }
        }
        result
    }

    async fn run_step(
        &self,
        session: &mut DiagnosticSession,
        input: StepInput,
    ) -> Result<StepResponse, DiagnoseError> {
        let outcome = self
            .engine
            .step(session, self.evidence.as_ref(), input)
            .await
            .inspect_err(|e| {
                tracing::warn!(session_id = %session.id, code = e.code(), error = %e, "diagnose step rejected")
            })?;
        Ok(StepResponse {
            session_id: session.id.clone(),
            stage: outcome.stage,
            next_stage: outcome.next_stage,
            output: outcome.output,
            session_state: session.clone(),
        })
    }

    /// Snapshot of a session, waiting for any in-progress step to finish.
    pub async fn get(&self, session_id: &str) -> Result<DiagnosticSession, DiagnoseError> {
        let handle = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| DiagnoseError::SessionNotFound(session_id.to_string()))?;
        let session = handle.lock().await;
        Ok(session.clone())
    }
}

/// Arguments of `harness diagnose`.
#[derive(Debug, Clone, Default)]
pub struct DiagnoseArgs {
    pub species: String,
    pub complaint: String,
    pub temperature_c: Option<f64>,
    pub heart_rate_bpm: Option<f64>,
    pub respiratory_rate_bpm: Option<f64>,
    pub findings: Vec<String>,
    pub override_loop_cap: bool,
    pub budget: Option<f64>,
    pub json: bool,
}

/// `harness diagnose`: run a session from intake to decision.
pub async fn run_diagnose(config: &Config, args: DiagnoseArgs) -> Result<()> {
    let (ask, _corpus) = AskService::from_config(config).await?;
    let service = DiagnoseService::from_config(config, Arc::new(ask))?;

    let intake = IntakeInput {
        signalment: Signalment {
            species: args.species,
            ..Default::default()
        },
        complaint: args.complaint,
        vitals: Vitals {
            temperature_c: args.temperature_c,
            heart_rate_bpm: args.heart_rate_bpm,
            respiratory_rate_bpm: args.respiratory_rate_bpm,
        },
        findings: args.findings,
        override_loop_cap: args.override_loop_cap,
        budget: args.budget,
    };

    let mut session = DiagnosticSession::new(uuid::Uuid::new_v4().to_string());
    let outcomes = service
        .engine()
        .run_to_decision(&mut session, service.evidence.as_ref(), Some(intake))
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&session)?);
        return Ok(());
    }

    println!("session: {}", session.id);
    for outcome in &outcomes {
        println!("  {} -> {}", outcome.stage, outcome.next_stage);
    }
    if let Some(decision) = &session.decision {
        println!();
        println!("reason: {:?}", decision.reason);
        for (i, d) in decision.diagnoses.iter().enumerate() {
            println!("{}. {} ({:.2})", i + 1, d.condition, d.confidence);
        }
        println!();
        println!("{}", decision.recommendation);
        if decision.flags.budget_exhausted {
            println!("flag: budget_exhausted");
        }
        if decision.flags.loop_capped {
            println!("flag: loop_capped");
        }
        if decision.flags.safety_alert {
            println!("flag: safety_alert");
        }
    }
    Ok(())
}
