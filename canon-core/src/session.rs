//! StorySession - the turn orchestrator and primary public API.
//!
//! A session sequences one turn: load (or initialize) the story state,
//! run the extractor under the turn budget, put the candidate events
//! through the consistency gate, and handle the disposition. Only PASS
//! and AUTO_FIX reach the state manager; REWRITE and ASK_USER return to
//! the caller with no state change.

use crate::api::{ProcessDraftRequest, ProcessDraftResponse};
use crate::config::EngineConfig;
use crate::event::Event;
use crate::extractor::{DraftExtractor, EventExtractor, ExtractError};
use crate::gate::{ConsistencyGate, GateAction};
use crate::manager::{ApplyError, StateManager};
use crate::state::{CanonicalState, StatePatch};
use crate::store::{StateStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::timeout;

/// How many recent events a successful turn reports back.
const RECENT_EVENT_LIMIT: u32 = 10;

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("apply failed: {0}")]
    Apply(#[from] ApplyError),

    #[error("turn aborted: {0}")]
    Aborted(String),
}

/// A narrative consistency session over one store.
///
/// One session serves many stories concurrently; per-story writes are
/// serialized by the state manager's mutation lock.
pub struct StorySession {
    store: Arc<StateStore>,
    extractor: Arc<dyn DraftExtractor>,
    gate: ConsistencyGate,
    manager: Arc<StateManager>,
    config: EngineConfig,
}

impl StorySession {
    /// Create a session with the production extractor.
    pub async fn new(config: EngineConfig) -> Result<Self, SessionError> {
        let store = Arc::new(StateStore::open(&config.db_path).await?);

        let mut client = llm::Client::new(&config.llm_api_key);
        if let Some(base_url) = &config.llm_base_url {
            client = client.with_base_url(base_url);
        }
        if let Some(model) = &config.llm_model {
            client = client.with_model(model);
        }
        let extractor = Arc::new(EventExtractor::new(client, config.extractor_retry_count));

        Ok(Self::with_extractor(store, extractor, config))
    }

    /// Assemble a session from parts. Tests wire an in-memory store and
    /// a scripted extractor through here.
    pub fn with_extractor(
        store: Arc<StateStore>,
        extractor: Arc<dyn DraftExtractor>,
        config: EngineConfig,
    ) -> Self {
        let manager = Arc::new(StateManager::new(Arc::clone(&store)));
        Self {
            store,
            extractor,
            gate: ConsistencyGate::new(),
            manager,
            config,
        }
    }

    /// The underlying store, for direct reads.
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Current state of a story, auto-initializing unknown ids to the
    /// scaffold (the `GET /state/{story_id}` contract).
    pub async fn state(&self, story_id: &str) -> Result<CanonicalState, SessionError> {
        Ok(self.store.initialize_state(story_id).await?)
    }

    /// Process one turn: extract, gate, and (on PASS / AUTO_FIX) apply.
    pub async fn process_draft(
        &self,
        request: &ProcessDraftRequest,
    ) -> Result<ProcessDraftResponse, SessionError> {
        let story_id = &request.story_id;
        let state = self.store.initialize_state(story_id).await?;
        let turn = state.meta.turn + 1;

        let extraction = match timeout(
            self.config.turn_timeout,
            self.extractor
                .extract(&state, &request.user_message, &request.assistant_draft, turn),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(SessionError::Extraction(ExtractError::Timeout)),
        };

        if extraction.requires_user_input {
            return Ok(ProcessDraftResponse::ask_user(extraction.open_questions));
        }

        let verdict = self
            .gate
            .review(&state, Some(&request.assistant_draft), &extraction.events);
        tracing::debug!(
            story_id = %story_id,
            turn,
            action = ?verdict.action,
            events = extraction.events.len(),
            violations = verdict.violations.len(),
            "Gate verdict"
        );

        match verdict.action {
            GateAction::Pass => {
                let new_state = self.commit(story_id, extraction.events, None).await?;
                let recent = self
                    .store
                    .list_recent_events(story_id, RECENT_EVENT_LIMIT, 0)
                    .await?;
                Ok(ProcessDraftResponse::pass(new_state, recent))
            }
            GateAction::AutoFix => {
                let new_state = self
                    .commit(story_id, extraction.events, verdict.fixes.clone())
                    .await?;
                let recent = self
                    .store
                    .list_recent_events(story_id, RECENT_EVENT_LIMIT, 0)
                    .await?;
                Ok(ProcessDraftResponse::auto_fix(
                    new_state,
                    recent,
                    verdict.violations,
                ))
            }
            GateAction::Rewrite => Ok(ProcessDraftResponse::rewrite(
                verdict.rewrite_instructions(),
                verdict.violations,
            )),
            GateAction::AskUser => Ok(ProcessDraftResponse::ask_user(verdict.questions)),
        }
    }

    /// Apply on a spawned task: once the apply has begun, cancelling the
    /// caller cannot leave a half-committed turn behind.
    async fn commit(
        &self,
        story_id: &str,
        events: Vec<Event>,
        fixes: Option<StatePatch>,
    ) -> Result<CanonicalState, SessionError> {
        let manager = Arc::clone(&self.manager);
        let story_id = story_id.to_string();
        let handle = tokio::spawn(async move {
            manager
                .apply_events(&story_id, &events, fixes.as_ref())
                .await
        });

        match handle.await {
            Ok(result) => Ok(result?),
            Err(e) => Err(SessionError::Aborted(e.to_string())),
        }
    }
}
