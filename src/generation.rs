//! Generation sessions: the in-memory registry and the scripted five-stage
//! runner that drives one session from `pending` to `completed` or `failed`.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::ai::{self, AiError, PromptInput};
use crate::balance::NewHistoryRecord;
use crate::models::{
    validate_questions, GeneratedQuestion, GenerationStatus, StartGenerationRequest, ValidationIssue,
};
use crate::state::AppState;
use crate::ws_protocol::ServerMessage;

const CHANNEL_CAPACITY: usize = 32;

pub const STAGES: [(&str, &str); 5] = [
    ("analyze", "Analyzing source content"),
    ("guidelines", "Constructing AI prompt"),
    ("creating", "Generating questions with AI"),
    ("formatting", "Parsing AI response"),
    ("validating", "Validating output"),
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Completed,
    Current,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationStage {
    pub id: String,
    pub name: String,
    pub status: StageStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSession {
    pub id: String,
    pub user_id: String,
    pub status: GenerationStatus,
    pub progress: u8,
    pub eta: u32,
    pub stages: Vec<GenerationStage>,
    pub request_data: StartGenerationRequest,
    #[serde(skip)]
    pub cost: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<GeneratedQuestion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: i64,
    #[serde(skip)]
    finished_at: Option<Instant>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("session is already {0:?}")]
    Terminal(GenerationStatus),
    #[error("expected status {expected:?}, found {found:?}")]
    WrongStatus {
        expected: GenerationStatus,
        found: GenerationStatus,
    },
    #[error("progress cannot move backwards ({from} -> {to})")]
    Regression { from: u8, to: u8 },
    #[error("unknown stage index {0}")]
    UnknownStage(usize),
}

impl GenerationSession {
    pub fn new(id: String, user_id: String, request_data: StartGenerationRequest, cost: i64) -> Self {
        let stages = STAGES
            .iter()
            .map(|(id, name)| GenerationStage {
                id: (*id).to_string(),
                name: (*name).to_string(),
                status: StageStatus::Pending,
            })
            .collect();
        Self {
            id,
            user_id,
            status: GenerationStatus::Pending,
            progress: 0,
            eta: 60,
            stages,
            request_data,
            cost,
            result: None,
            error: None,
            created_at: Utc::now().timestamp_millis(),
            finished_at: None,
        }
    }

    fn ensure_live(&self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            Err(TransitionError::Terminal(self.status))
        } else {
            Ok(())
        }
    }

    pub fn begin(&mut self) -> Result<(), TransitionError> {
        self.ensure_live()?;
        if self.status != GenerationStatus::Pending {
            return Err(TransitionError::WrongStatus {
                expected: GenerationStatus::Pending,
                found: self.status,
            });
        }
        self.status = GenerationStatus::Processing;
        self.eta = 30;
        self.set_current_stage(0);
        self.progress = 10;
        Ok(())
    }

    /// Completes every stage before `stage` and makes `stage` current.
    pub fn advance(&mut self, stage: usize, progress: u8, eta: Option<u32>) -> Result<(), TransitionError> {
        self.ensure_live()?;
        if self.status != GenerationStatus::Processing {
            return Err(TransitionError::WrongStatus {
                expected: GenerationStatus::Processing,
                found: self.status,
            });
        }
        if stage >= self.stages.len() {
            return Err(TransitionError::UnknownStage(stage));
        }
        if progress < self.progress {
            return Err(TransitionError::Regression { from: self.progress, to: progress });
        }
        self.set_current_stage(stage);
        self.progress = progress;
        if let Some(eta) = eta {
            self.eta = eta;
        }
        Ok(())
    }

    pub fn complete(&mut self, questions: Vec<GeneratedQuestion>) -> Result<(), TransitionError> {
        self.ensure_live()?;
        if self.status != GenerationStatus::Processing {
            return Err(TransitionError::WrongStatus {
                expected: GenerationStatus::Processing,
                found: self.status,
            });
        }
        self.status = GenerationStatus::Completed;
        self.progress = 100;
        self.eta = 0;
        for stage in &mut self.stages {
            stage.status = StageStatus::Completed;
        }
        self.result = Some(questions);
        self.finished_at = Some(Instant::now());
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.ensure_live()?;
        self.status = GenerationStatus::Failed;
        self.error = Some(message.into());
        self.finished_at = Some(Instant::now());
        Ok(())
    }

    pub fn current_stage(&self) -> Option<&GenerationStage> {
        self.stages.iter().find(|s| s.status == StageStatus::Current)
    }

    fn set_current_stage(&mut self, current: usize) {
        for (idx, stage) in self.stages.iter_mut().enumerate() {
            stage.status = if idx < current {
                StageStatus::Completed
            } else if idx == current {
                StageStatus::Current
            } else {
                StageStatus::Pending
            };
        }
    }

    fn expired(&self, retention: Duration) -> bool {
        self.finished_at
            .map(|at| at.elapsed() >= retention)
            .unwrap_or(false)
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error("The AI's response was not in the expected format: {0}")]
    MalformedOutput(String),
    #[error("Generated questions failed validation: {}", summarize(.0))]
    InvalidQuestions(Vec<ValidationIssue>),
    #[error("Session {0} no longer exists.")]
    SessionMissing(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

fn summarize(issues: &[ValidationIssue]) -> String {
    let mut parts: Vec<String> = issues
        .iter()
        .take(3)
        .map(|i| format!("{} {}", i.field, i.issue))
        .collect();
    if issues.len() > 3 {
        parts.push(format!("and {} more", issues.len() - 3));
    }
    parts.join("; ")
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, GenerationSession>,
    channels: DashMap<String, broadcast::Sender<ServerMessage>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: GenerationSession) {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        self.channels.insert(session.id.clone(), tx);
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<GenerationSession> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Applies a transition in place and returns the resulting snapshot.
    /// Transitions validate before mutating, so a rejected one leaves the
    /// session untouched.
    pub fn update<F>(&self, id: &str, transition: F) -> Result<GenerationSession, GenerationError>
    where
        F: FnOnce(&mut GenerationSession) -> Result<(), TransitionError>,
    {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| GenerationError::SessionMissing(id.to_string()))?;
        transition(entry.value_mut())?;
        Ok(entry.value().clone())
    }

    pub fn subscribe(&self, id: &str) -> Option<broadcast::Receiver<ServerMessage>> {
        self.channels.get(id).map(|tx| tx.subscribe())
    }

    pub fn publish(&self, id: &str, message: ServerMessage) {
        if let Some(tx) = self.channels.get(id) {
            // No subscribers is the common case; the snapshot stays queryable.
            let _ = tx.send(message);
        }
    }

    /// Drops finished sessions older than `retention`. Returns how many were removed.
    pub fn purge_finished(&self, retention: Duration) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().expired(retention))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
            self.channels.remove(id);
        }
        expired.len()
    }
}

fn publish_update(state: &AppState, snapshot: GenerationSession) {
    let id = snapshot.id.clone();
    state.sessions.publish(&id, ServerMessage::status_update(snapshot));
}

fn step(state: &AppState, id: &str, stage: usize, progress: u8, eta: Option<u32>) -> Result<GenerationSession, GenerationError> {
    let snapshot = state.sessions.update(id, |s| s.advance(stage, progress, eta))?;
    publish_update(state, snapshot.clone());
    Ok(snapshot)
}

async fn drive(state: &AppState, id: &str) -> Result<Vec<GeneratedQuestion>, GenerationError> {
    let delay = state.config.stage_delay;

    let snapshot = state.sessions.update(id, |s| s.begin())?;
    publish_update(state, snapshot.clone());
    let source_excerpt = state.source_excerpt(&snapshot.user_id, &snapshot.request_data);
    tokio::time::sleep(delay).await;

    step(state, id, 1, 25, None)?;
    let input = PromptInput {
        request: snapshot.request_data.clone(),
        source_excerpt,
    };
    tokio::time::sleep(delay).await;

    step(state, id, 2, 50, None)?;
    let started = Instant::now();
    let raw = state.ai_client.generate_questions_json(&input).await?;
    info!(session_id = %id, elapsed_ms = started.elapsed().as_millis() as u64, response_len = raw.len(), "ai response received");

    step(state, id, 3, 80, Some(5))?;
    let questions = ai::parse_generated_questions(&raw, &state.output_validator)?;
    tokio::time::sleep(delay).await;

    step(state, id, 4, 95, None)?;
    validate_questions(&questions).map_err(GenerationError::InvalidQuestions)?;
    let requested = input.request.requested_count() as usize;
    if questions.len() != requested {
        warn!(session_id = %id, requested, generated = questions.len(), "ai returned a different question count than requested");
    }
    tokio::time::sleep(delay / 2).await;

    Ok(questions)
}

/// Runs one session to completion. Spawned once per session by the start
/// handler; settles the balance and history exactly once.
pub async fn run_generation(state: AppState, session_id: String) {
    let outcome = drive(&state, &session_id).await;
    match outcome {
        Ok(questions) => settle_success(&state, &session_id, questions).await,
        Err(err) => settle_failure(&state, &session_id, err).await,
    }
}

/// Snapshot of a session the runner is about to settle. Only the runner
/// mutates a live session, so nothing can change it between this read and
/// the terminal transition.
fn live_snapshot(state: &AppState, id: &str) -> Option<GenerationSession> {
    match state.sessions.get(id) {
        Some(s) if !s.status.is_terminal() => Some(s),
        Some(s) => {
            error!(session_id = %id, status = ?s.status, "session already settled");
            None
        }
        None => {
            error!(session_id = %id, "session vanished before settlement");
            None
        }
    }
}

// History and refunds are written before the terminal status becomes
// visible, so a client that observes it also observes the ledger.
async fn settle_success(state: &AppState, id: &str, questions: Vec<GeneratedQuestion>) {
    let Some(current) = live_snapshot(state, id) else {
        return;
    };
    let count = questions.len();
    state
        .db
        .record_history(NewHistoryRecord {
            external_user_id: current.user_id.clone(),
            session_id: current.id.clone(),
            status: GenerationStatus::Completed,
            source_type: current.request_data.source_type,
            question_count: count as u32,
            cost: current.cost,
            outcome: format!("{} questions generated successfully.", count),
        })
        .await;

    match state.sessions.update(id, |s| s.complete(questions)) {
        Ok(snapshot) => {
            info!(session_id = %id, questions = count, cost = snapshot.cost, "generation completed");
            publish_update(state, snapshot);
        }
        Err(err) => error!(session_id = %id, error = %err, "cannot mark session as completed"),
    }
}

async fn settle_failure(state: &AppState, id: &str, err: GenerationError) {
    error!(session_id = %id, error = %err, "generation failed");
    let Some(current) = live_snapshot(state, id) else {
        return;
    };
    let message = err.to_string();

    state
        .db
        .record_history(NewHistoryRecord {
            external_user_id: current.user_id.clone(),
            session_id: current.id.clone(),
            status: GenerationStatus::Failed,
            source_type: current.request_data.source_type,
            question_count: 0,
            cost: current.cost,
            outcome: message.clone(),
        })
        .await;

    if let Err(refund_err) = state.db.credit(&current.user_id, current.cost).await {
        warn!(session_id = %id, error = %refund_err, "refund skipped");
    }

    match state.sessions.update(id, |s| s.fail(message)) {
        Ok(snapshot) => state.sessions.publish(id, ServerMessage::failure(snapshot)),
        Err(update_err) => error!(session_id = %id, error = %update_err, "cannot mark session as failed"),
    }
}

/// One housekeeping pass: expired sessions, stale uploads and idle
/// rate-limit counters.
pub fn sweep(state: &AppState) {
    let removed = state.sessions.purge_finished(state.config.session_retention);
    if removed > 0 {
        info!(removed, remaining = state.sessions.len(), "purged finished generation sessions");
    }
    let evicted = state.db.evict_uploads(state.config.upload_retention);
    if evicted > 0 {
        info!(evicted, remaining = state.db.uploads.len(), "evicted expired uploads");
    }
    let pruned = state.api_limiter.prune() + state.generation_limiter.prune();
    if pruned > 0 {
        debug!(
            pruned,
            tracked = state.api_limiter.tracked_keys() + state.generation_limiter.tracked_keys(),
            "pruned idle rate-limit counters"
        );
    }
}

pub fn spawn_sweeper(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            sweep(&state);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Guidelines, QuestionType, QuestionTypeRequest, SourceType, TargetAudience, Tone};

    fn request() -> StartGenerationRequest {
        StartGenerationRequest {
            question_types: vec![QuestionTypeRequest { id: QuestionType::SingleChoice, quantity: 2 }],
            source_type: SourceType::Text,
            source_text: Some("Photosynthesis converts light into chemical energy.".into()),
            source_file_id: None,
            guidelines: Guidelines {
                target_audience: TargetAudience::Beginner,
                language: "English".into(),
                tone: Tone::Neutral,
            },
        }
    }

    fn session() -> GenerationSession {
        GenerationSession::new("s1".into(), "user_1".into(), request(), 6)
    }

    #[test]
    fn new_session_is_pending_with_five_pending_stages() {
        let s = session();
        assert_eq!(s.status, GenerationStatus::Pending);
        assert_eq!(s.progress, 0);
        assert_eq!(s.eta, 60);
        assert_eq!(s.stages.len(), 5);
        assert!(s.stages.iter().all(|st| st.status == StageStatus::Pending));
        assert!(s.current_stage().is_none());
    }

    #[test]
    fn scripted_sequence_reaches_completed() {
        let mut s = session();
        s.begin().unwrap();
        assert_eq!(s.status, GenerationStatus::Processing);
        assert_eq!(s.current_stage().unwrap().id, "analyze");
        assert_eq!((s.progress, s.eta), (10, 30));

        s.advance(1, 25, None).unwrap();
        s.advance(2, 50, None).unwrap();
        s.advance(3, 80, Some(5)).unwrap();
        assert_eq!(s.current_stage().unwrap().id, "formatting");
        assert_eq!(s.stages.iter().filter(|st| st.status == StageStatus::Completed).count(), 3);
        assert_eq!(s.eta, 5);
        s.advance(4, 95, None).unwrap();

        s.complete(Vec::new()).unwrap();
        assert_eq!(s.status, GenerationStatus::Completed);
        assert_eq!((s.progress, s.eta), (100, 0));
        assert!(s.stages.iter().all(|st| st.status == StageStatus::Completed));
        assert!(s.result.is_some());
    }

    #[test]
    fn terminal_sessions_reject_further_transitions() {
        let mut s = session();
        s.begin().unwrap();
        s.fail("boom").unwrap();
        assert_eq!(s.fail("again"), Err(TransitionError::Terminal(GenerationStatus::Failed)));
        assert_eq!(
            s.advance(2, 50, None),
            Err(TransitionError::Terminal(GenerationStatus::Failed))
        );
        assert_eq!(s.error.as_deref(), Some("boom"));
    }

    #[test]
    fn progress_cannot_regress_and_pending_cannot_complete() {
        let mut s = session();
        assert!(matches!(s.complete(Vec::new()), Err(TransitionError::WrongStatus { .. })));
        s.begin().unwrap();
        s.advance(2, 50, None).unwrap();
        assert_eq!(s.advance(3, 40, None), Err(TransitionError::Regression { from: 50, to: 40 }));
        assert_eq!(s.advance(9, 90, None), Err(TransitionError::UnknownStage(9)));
        assert_eq!(s.progress, 50);
    }

    #[test]
    fn registry_publishes_to_subscribers_and_purges_finished() {
        let registry = SessionRegistry::new();
        registry.insert(session());
        let mut rx = registry.subscribe("s1").unwrap();

        let snapshot = registry.update("s1", |s| s.begin()).unwrap();
        registry.publish("s1", ServerMessage::status_update(snapshot));
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.payload.unwrap().progress, 10);

        assert_eq!(registry.purge_finished(Duration::ZERO), 0);
        registry.update("s1", |s| s.fail("x")).unwrap();
        assert_eq!(registry.purge_finished(Duration::ZERO), 1);
        assert!(registry.get("s1").is_none());
        assert!(registry.subscribe("s1").is_none());
    }

    #[tokio::test]
    async fn runner_settles_once_with_history() {
        let config = crate::config::AppConfig {
            stage_delay: Duration::ZERO,
            ..Default::default()
        };
        let state = crate::build_state_with_client(config, std::sync::Arc::new(crate::ai::MockAiClient)).unwrap();
        state.db.create_user("user_1", None, 100).await;
        state.sessions.insert(session());

        run_generation(state.clone(), "s1".into()).await;

        let done = state.sessions.get("s1").unwrap();
        assert_eq!(done.status, GenerationStatus::Completed);
        assert_eq!(done.result.as_ref().map(Vec::len), Some(2));
        let page = state.db.history_page("user_1", 1, 10).await;
        assert_eq!(page.pagination.total_items, 1);
        assert_eq!(page.history[0].outcome, "2 questions generated successfully.");

        // A second settlement attempt is refused and records nothing.
        settle_failure(&state, "s1", GenerationError::MalformedOutput("late".into())).await;
        assert_eq!(state.db.history_page("user_1", 1, 10).await.pagination.total_items, 1);
        assert_eq!(state.db.find_user("user_1").await.unwrap().balance, 100);
    }

    #[tokio::test]
    async fn sweep_clears_expired_sessions_uploads_and_counters() {
        let config = crate::config::AppConfig {
            session_retention: Duration::ZERO,
            upload_retention: Duration::ZERO,
            api_rate_limit: crate::config::RateLimitConfig {
                max_requests: 10,
                window: Duration::ZERO,
            },
            ..Default::default()
        };
        let state = crate::build_state_with_client(config, std::sync::Arc::new(crate::ai::MockAiClient)).unwrap();
        state.sessions.insert(session());
        state.sessions.update("s1", |s| s.fail("x")).unwrap();
        state.db.register_upload(crate::sources::UploadedSource {
            file_id: "img-1".into(),
            owner: "user_1".into(),
            kind: SourceType::Image,
            file_name: "a.png".into(),
            size: 3,
            mimetype: "image/png".into(),
            extracted_text: None,
            uploaded_at: Utc::now() - chrono::Duration::seconds(1),
        });
        assert!(state.api_limiter.check("api:10.1.1.1"));
        std::thread::sleep(Duration::from_millis(2));

        sweep(&state);

        assert!(state.sessions.get("s1").is_none());
        assert!(state.db.uploads.is_empty());
        assert_eq!(state.api_limiter.tracked_keys(), 0);
    }

    #[test]
    fn update_on_missing_session_errors() {
        let registry = SessionRegistry::new();
        let err = registry.update("nope", |s| s.begin()).unwrap_err();
        assert!(matches!(err, GenerationError::SessionMissing(_)));
    }
}
