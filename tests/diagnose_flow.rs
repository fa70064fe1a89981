//! Diagnose session service tests against the bundled knowledge base.

use async_trait::async_trait;
use harness_core::corpus::InMemoryCorpus;
use harness_core::diagnose::{
    Critic, CriticReport, DecisionReason, DiagnoseEngine, DiagnosticSession, EvidenceSource,
    IntakeInput, KnowledgeBase, RuleCritic, Signalment, Stage, StepInput, Vitals,
};
use harness_core::error::{BackendError, DiagnoseError};
use harness_core::factuality::LexicalVerifier;
use harness_core::models::{AskDiagnostics, AskResponse, AskStatus, Chunk, SourceMetadata};
use harness_core::rerank::LexicalCrossEncoder;
use harness_core::synthesize::{Generator, NumberedEvidencePromptBuilder, Prompt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vet_harness::ask::{AskCollaborators, AskService, AskSettings};
use vet_harness::config::{Config, DiagnoseConfig};
use vet_harness::diagnose::{AskEvidence, DiagnoseService};
use vet_harness::embedding::DisabledEmbedder;
use vet_harness::knowledge::load_knowledge_base;

// ============ Fakes ============

/// Evidence source answering every query with a fixed confidence.
struct CountingSource {
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingSource {
    fn new() -> Self {
        Self::slow(Duration::ZERO)
    }

    fn slow(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }
}

#[async_trait]
impl EvidenceSource for CountingSource {
    async fn gather(&self, _query: &str, trace_id: &str) -> AskResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        AskResponse::rejected(
            trace_id,
            0.4,
            vec!["weak support".into()],
            AskDiagnostics::default(),
        )
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
            issues: vec!["differential unresolved".into()],
            safety_alert: false,
        })
    }
}

struct ScriptedGenerator(&'static str);

#[async_trait]
impl Generator for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _: &Prompt, _: u32, _: f32) -> Result<String, BackendError> {
        Ok(self.0.to_string())
    }
}

// ============ Helpers ============

fn engine(critic: Arc<dyn Critic>) -> DiagnoseEngine {
    let config = DiagnoseConfig::default();
    let kb = load_knowledge_base(&config).unwrap();
    DiagnoseEngine::new(Arc::new(kb), config.settings()).with_critic(critic)
}

fn service(critic: Arc<dyn Critic>, source: Arc<dyn EvidenceSource>) -> DiagnoseService {
    DiagnoseService::new(engine(critic), source, Duration::from_secs(60))
}

fn kennel_cough_intake() -> StepInput {
    StepInput {
        intake: Some(IntakeInput {
            signalment: Signalment {
                species: "dog".into(),
                age_years: Some(2.0),
                ..Default::default()
            },
            complaint: "Honking cough for five days after boarding".into(),
            vitals: Vitals {
                temperature_c: Some(39.1),
                heart_rate_bpm: Some(110.0),
                respiratory_rate_bpm: Some(28.0),
            },
            findings: vec![],
            override_loop_cap: false,
            budget: None,
        }),
        ..Default::default()
    }
}

async fn step_to_decision(service: &DiagnoseService, session_id: &str) -> DiagnosticSession {
    for _ in 0..64 {
        let response = service
            .step(Some(session_id.to_string()), StepInput::default())
            .await
            .unwrap();
        if response.session_state.decision.is_some() {
            return response.session_state;
        }
    }
    panic!("session {session_id} never reached a decision");
}

// ============ Tests ============

#[tokio::test]
async fn test_loop_cap_forces_decision_through_the_service() {
    let source = Arc::new(CountingSource::new());
    let service = service(Arc::new(FailingCritic), source.clone());

    let first = service.step(None, kennel_cough_intake()).await.unwrap();
    assert_eq!(first.stage, Stage::Intake);
    assert_eq!(first.next_stage, Stage::Hypothesis);
    assert!(first.session_state.findings.contains(&"cough".to_string()));

    let session = step_to_decision(&service, &first.session_id).await;

    assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    assert_eq!(session.evidence.len(), 4);
    let decision = session.decision.as_ref().unwrap();
    assert!(decision.flags.loop_capped);
    assert_eq!(decision.reason, DecisionReason::LoopCapped);
    assert!(!decision.diagnoses.is_empty());
    for record in &session.evidence {
        assert!(record.trace_id.starts_with(&format!("{}:", session.id)));
    }

    let err = service
        .step(Some(first.session_id.clone()), StepInput::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DiagnoseError::SessionTerminated(_)));

    let stored = service.get(&first.session_id).await.unwrap();
    assert_eq!(stored, session);
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let service = service(Arc::new(FailingCritic), Arc::new(CountingSource::new()));

    let err = service
        .step(Some("missing".into()), StepInput::default())
        .await
        .unwrap_err();
    assert_eq!(err, DiagnoseError::SessionNotFound("missing".into()));
    assert_eq!(err.code(), "not_found");

    let err = service.get("missing").await.unwrap_err();
    assert!(matches!(err, DiagnoseError::SessionNotFound(_)));
}

#[tokio::test]
async fn test_failed_intake_does_not_create_a_session() {
    let service = service(Arc::new(FailingCritic), Arc::new(CountingSource::new()));

    let err = service.step(None, StepInput::default()).await.unwrap_err();
    assert_eq!(err, DiagnoseError::MissingIntake);

    let mut input = kennel_cough_intake();
    if let Some(intake) = input.intake.as_mut() {
        intake.signalment.species = "axolotl".into();
    }
    let err = service
        .step(Some("exotic".into()), input)
        .await
        .unwrap_err();
    assert!(matches!(err, DiagnoseError::InvalidInput(_)));
    assert!(matches!(
        service.get("exotic").await,
        Err(DiagnoseError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_client_chosen_session_id_is_kept() {
    let service = service(Arc::new(FailingCritic), Arc::new(CountingSource::new()));
    let response = service
        .step(Some("exam-room-3".into()), kennel_cough_intake())
        .await
        .unwrap();
    assert_eq!(response.session_id, "exam-room-3");
    assert_eq!(service.get("exam-room-3").await.unwrap().stage, Stage::Hypothesis);
}

#[tokio::test]
async fn test_second_intake_never_replaces_a_session() {
    let service = service(Arc::new(FailingCritic), Arc::new(CountingSource::new()));

    let (a, b) = tokio::join!(
        service.step(Some("exam-room-5".into()), kennel_cough_intake()),
        service.step(Some("exam-room-5".into()), kennel_cough_intake()),
    );
    let (winner, loser) = match (a, b) {
        (Ok(winner), Err(loser)) | (Err(loser), Ok(winner)) => (winner, loser),
        other => panic!("expected exactly one intake to succeed, got {other:?}"),
    };
    assert!(matches!(
        loser,
        DiagnoseError::InvalidInput(_) | DiagnoseError::SessionBusy(_)
    ));

    let mut late = kennel_cough_intake();
    if let Some(intake) = late.intake.as_mut() {
        intake.signalment.species = "cat".into();
    }
    let err = service
        .step(Some("exam-room-5".into()), late)
        .await
        .unwrap_err();
    assert!(matches!(err, DiagnoseError::InvalidInput(_)));

    let stored = service.get("exam-room-5").await.unwrap();
    assert_eq!(stored, winner.session_state);
    assert_eq!(stored.stage, Stage::Hypothesis);
}

#[tokio::test]
async fn test_concurrent_step_on_same_session_is_busy() {
    let source = Arc::new(CountingSource::slow(Duration::from_millis(300)));
    let service = Arc::new(service(Arc::new(FailingCritic), source));

    let id = service
        .step(None, kennel_cough_intake())
        .await
        .unwrap()
        .session_id;
    // Hypothesis, then Planner.
    for _ in 0..2 {
        service.step(Some(id.clone()), StepInput::default()).await.unwrap();
    }

    let background = {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.step(Some(id), StepInput::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = service
        .step(Some(id.clone()), StepInput::default())
        .await
        .unwrap_err();
    assert_eq!(err, DiagnoseError::SessionBusy(id.clone()));

    let evidence = background.await.unwrap().unwrap();
    assert_eq!(evidence.stage, Stage::Evidence);
    assert_eq!(service.get(&id).await.unwrap().evidence.len(), 1);
}

#[tokio::test]
async fn test_evidence_stage_consults_ask() {
    let mut chunk = Chunk::new(
        "bordetella-2023",
        "doc-bordetella",
        "Kennel cough in dogs is caused mainly by Bordetella bronchiseptica, often together \
         with canine parainfluenza virus.",
        SourceMetadata {
            title: "Canine infectious respiratory disease complex update".into(),
            year: Some(2023),
            ..Default::default()
        },
    );
    chunk.species_tags = vec!["dog".into()];

    let ask = AskService::new(
        AskSettings::from_config(&Config::minimal("unused.sqlite")),
        AskCollaborators {
            corpus: Arc::new(InMemoryCorpus::from_chunks(vec![chunk])),
            embedder: Arc::new(DisabledEmbedder),
            cross_encoder: Arc::new(LexicalCrossEncoder),
            prompt_builder: Arc::new(NumberedEvidencePromptBuilder::default()),
            generator: Arc::new(ScriptedGenerator(
                "Kennel cough in dogs is caused mainly by Bordetella bronchiseptica [1].",
            )),
            verifier: Arc::new(LexicalVerifier),
        },
    );
    let service = service(
        Arc::new(RuleCritic::new(0.6)),
        Arc::new(AskEvidence::new(Arc::new(ask))),
    );

    let id = service
        .step(None, kennel_cough_intake())
        .await
        .unwrap()
        .session_id;
    let session = step_to_decision(&service, &id).await;

    assert!(!session.evidence.is_empty());
    let supported = session
        .evidence
        .iter()
        .find(|r| r.status == AskStatus::Completed)
        .expect("at least one evidence query is answered");
    assert_eq!(
        supported.sources,
        vec!["Canine infectious respiratory disease complex update (2023)".to_string()]
    );
    assert!(session.decision.is_some());
}
