//! Testing utilities for the consistency engine.
//!
//! This module provides tools for integration testing:
//! - `MockExtractor` for deterministic turns without API calls
//! - `TestHarness` wiring an in-memory store through a real session
//! - A sample world and event builder shared by the test suites

use crate::api::{ProcessDraftRequest, ProcessDraftResponse};
use crate::config::EngineConfig;
use crate::event::{
    new_event_id, Event, EventEvidence, EventKind, EventLocation, EventParticipants,
};
use crate::extractor::{synthetic_other_event, DraftExtractor, ExtractError, Extraction};
use crate::gate::GateAction;
use crate::session::StorySession;
use crate::state::{
    CanonicalState, Character, EntityKind, Item, Location, StatePatch, TimeAnchor,
};
use crate::store::StateStore;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// An extractor that returns scripted outcomes in order.
///
/// When the script runs out it falls back to a synthetic `OTHER` event,
/// so a harness never stalls mid-scenario.
#[derive(Default)]
pub struct MockExtractor {
    outcomes: Mutex<VecDeque<Extraction>>,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next extraction outcome.
    pub fn queue(&self, extraction: Extraction) {
        self.outcomes
            .lock()
            .expect("mock outcome queue poisoned")
            .push_back(extraction);
    }
}

#[async_trait]
impl DraftExtractor for MockExtractor {
    async fn extract(
        &self,
        state: &CanonicalState,
        _user_message: &str,
        draft: &str,
        turn: u64,
    ) -> Result<Extraction, ExtractError> {
        let next = self
            .outcomes
            .lock()
            .expect("mock outcome queue poisoned")
            .pop_front();
        Ok(next.unwrap_or_else(|| {
            Extraction::from_events(vec![synthetic_other_event(state, turn, draft)])
        }))
    }
}

/// Test harness: a real session over an in-memory store and a mock
/// extractor.
pub struct TestHarness {
    pub session: StorySession,
    pub store: Arc<StateStore>,
    pub extractor: Arc<MockExtractor>,
}

impl TestHarness {
    pub async fn new() -> Self {
        let store = Arc::new(StateStore::in_memory().await.expect("in-memory store"));
        let extractor = Arc::new(MockExtractor::new());
        let session = StorySession::with_extractor(
            Arc::clone(&store),
            Arc::clone(&extractor) as Arc<dyn DraftExtractor>,
            EngineConfig::new("test-key"),
        );
        Self {
            session,
            store,
            extractor,
        }
    }

    /// Write a state directly, bypassing the pipeline.
    pub async fn seed(&self, story_id: &str, state: &CanonicalState) {
        self.store
            .save_state(story_id, state)
            .await
            .expect("seed state");
    }

    /// Queue the next extraction outcome.
    pub fn expect(&self, extraction: Extraction) {
        self.extractor.queue(extraction);
    }

    /// Run one turn through the full pipeline.
    pub async fn process(
        &self,
        story_id: &str,
        user_message: &str,
        draft: &str,
    ) -> ProcessDraftResponse {
        self.session
            .process_draft(&ProcessDraftRequest {
                story_id: story_id.to_string(),
                user_message: user_message.to_string(),
                assistant_draft: draft.to_string(),
            })
            .await
            .expect("process_draft")
    }
}

// ============================================================================
// Sample world
// ============================================================================

/// A small Three-Kingdoms world: two cities, the player and four named
/// characters (one dead), and two unique items in Cao Cao's hands.
/// Anchor order is 10.
pub fn sample_state(story_id: &str) -> CanonicalState {
    let mut state = CanonicalState::scaffold(story_id);

    for (id, name) in [("luoyang", "Luoyang"), ("xuchang", "Xuchang")] {
        state.entities.locations.insert(
            id.to_string(),
            Location {
                id: id.to_string(),
                name: name.to_string(),
                metadata: Map::new(),
            },
        );
    }

    for (id, name, alive, location) in [
        ("player_001", "The Traveler", true, "luoyang"),
        ("caocao", "Cao Cao", true, "xuchang"),
        ("zhangfei", "Zhang Fei", true, "luoyang"),
        ("yuanshao", "Yuan Shao", true, "luoyang"),
        ("lubu", "Lu Bu", false, "luoyang"),
    ] {
        state.entities.characters.insert(
            id.to_string(),
            Character {
                id: id.to_string(),
                name: name.to_string(),
                alive,
                location_id: Some(location.to_string()),
                faction_id: None,
                metadata: Map::new(),
            },
        );
    }

    for (id, name) in [
        ("sword_001", "Qinggang Sword"),
        ("seal_001", "Imperial Seal"),
    ] {
        state.entities.items.insert(
            id.to_string(),
            Item {
                id: id.to_string(),
                name: name.to_string(),
                unique: true,
                owner_id: Some("caocao".to_string()),
                location_id: Some("xuchang".to_string()),
                metadata: Map::new(),
            },
        );
        state.constraints.unique_item_ids.insert(id.to_string());
    }

    state.player.location_id = "luoyang".to_string();
    state.time.calendar = "Spring".to_string();
    state.time.anchor = TimeAnchor {
        label: "Spring".to_string(),
        order: 10,
    };
    state
}

/// A patch setting one field on one entity.
pub fn field_update(
    entity_type: EntityKind,
    entity_id: &str,
    field: &str,
    value: Value,
) -> StatePatch {
    let mut updates = Map::new();
    updates.insert(field.to_string(), value);
    StatePatch::for_entity(entity_type, entity_id, updates)
}

/// Builder for test events.
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    pub fn new(story_id: &str, turn: u64) -> Self {
        Self {
            event: Event {
                event_id: new_event_id(turn),
                story_id: story_id.to_string(),
                turn,
                time: TimeAnchor {
                    label: "Spring".to_string(),
                    order: 11,
                },
                place: EventLocation {
                    location_id: "luoyang".to_string(),
                },
                who: EventParticipants::default(),
                kind: EventKind::Other {},
                summary: "test event".to_string(),
                state_patch: StatePatch::default(),
                evidence: EventEvidence {
                    source: format!("draft_turn_{turn}"),
                    text_span: None,
                },
                created_at: Utc::now(),
            },
        }
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.event.kind = kind;
        self
    }

    pub fn order(mut self, order: i64) -> Self {
        self.event.time.order = order;
        self
    }

    pub fn at(mut self, location_id: &str) -> Self {
        self.event.place.location_id = location_id.to_string();
        self
    }

    pub fn actor(mut self, character_id: &str) -> Self {
        self.event.who.actors.push(character_id.to_string());
        self
    }

    pub fn summary(mut self, summary: &str) -> Self {
        self.event.summary = summary.to_string();
        self
    }

    pub fn patch(mut self, patch: StatePatch) -> Self {
        self.event.state_patch = patch;
        self
    }

    pub fn build(self) -> Event {
        self.event
    }
}

// ============================================================================
// Assertion helpers
// ============================================================================

/// Assert the response carries the expected disposition.
#[track_caller]
pub fn assert_action(response: &ProcessDraftResponse, action: GateAction) {
    assert_eq!(
        response.final_action, action,
        "expected {action:?}, got {:?} (violations: {:?})",
        response.final_action, response.violations
    );
}

/// Assert a character's alive flag in a state.
#[track_caller]
pub fn assert_alive(state: &CanonicalState, character_id: &str, alive: bool) {
    let character = state
        .entities
        .characters
        .get(character_id)
        .unwrap_or_else(|| panic!("character '{character_id}' not in state"));
    assert_eq!(
        character.alive, alive,
        "expected '{character_id}' alive = {alive}"
    );
}

/// Assert an item's owner in a state.
#[track_caller]
pub fn assert_owner(state: &CanonicalState, item_id: &str, owner_id: Option<&str>) {
    let item = state
        .entities
        .items
        .get(item_id)
        .unwrap_or_else(|| panic!("item '{item_id}' not in state"));
    assert_eq!(
        item.owner_id.as_deref(),
        owner_id,
        "expected '{item_id}' owner = {owner_id:?}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_state_is_consistent() {
        let state = sample_state("s");
        assert!(state.reference_errors().is_empty());
        assert!(!state.entities.characters["lubu"].alive);
        assert!(state.is_unique_item("seal_001"));
    }

    #[tokio::test]
    async fn test_mock_extractor_scripts_in_order() {
        let mock = MockExtractor::new();
        mock.queue(Extraction::from_questions(vec!["first?".to_string()]));

        let state = sample_state("s");
        let first = mock.extract(&state, "msg", "draft", 1).await.unwrap();
        assert!(first.requires_user_input);

        // Exhausted script falls back to a synthetic OTHER event.
        let second = mock.extract(&state, "msg", "draft", 2).await.unwrap();
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].kind.type_name(), "OTHER");
    }
}
