//! State manager: patch application and atomic turn commits.
//!
//! [`apply_patch`] is the single, pure implementation of patch
//! semantics; both the consistency gate (for projection) and the
//! [`StateManager`] (for real commits) fold patches through it, so
//! validation and application can never drift apart.

use crate::event::Event;
use crate::state::{
    CanonicalState, EntityKind, EntityUpdate, PlayerUpdates, Quest, QuestState, QuestStatus,
    QuestUpdate, StatePatch,
};
use crate::store::{StateStore, StoreError};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from applying a validated turn.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("no events to apply")]
    NoEvents,

    #[error("invariant violation after apply: {0}")]
    InvariantViolation(String),
}

// ============================================================================
// Pure patch application
// ============================================================================

/// Apply a patch to a state, returning the updated copy.
///
/// Entity updates are shallow field merges; a `null` value unsets the
/// field, and updates for unknown ids create new entities when the
/// update supplies enough fields (at least a `name`). Updates that do
/// not produce a well-formed entity are skipped with a warning.
pub fn apply_patch(state: &CanonicalState, patch: &StatePatch) -> CanonicalState {
    let mut next = state.clone();

    for (entity_id, update) in &patch.entity_updates {
        apply_entity_update(&mut next, entity_id, update);
    }

    if let Some(player) = &patch.player_updates {
        apply_player_updates(&mut next, player);
    }

    if let Some(time) = &patch.time_update {
        if let Some(calendar) = &time.calendar {
            next.time.calendar = calendar.clone();
        }
        if let Some(anchor) = &time.anchor {
            next.time.anchor = anchor.clone();
        }
    }

    for update in &patch.quest_updates {
        apply_quest_update(&mut next.quest, update);
    }

    for constraint in &patch.constraint_additions {
        if !next.constraints.constraints.contains(constraint) {
            next.constraints.constraints.push(constraint.clone());
        }
        if let crate::state::Constraint::UniqueItem { item_id } = constraint {
            next.constraints.unique_item_ids.insert(item_id.clone());
        }
    }

    next
}

fn apply_entity_update(state: &mut CanonicalState, entity_id: &str, update: &EntityUpdate) {
    match update.entity_type {
        EntityKind::Character => {
            upsert_entity(&mut state.entities.characters, entity_id, &update.updates)
        }
        EntityKind::Item => upsert_entity(&mut state.entities.items, entity_id, &update.updates),
        EntityKind::Location => {
            upsert_entity(&mut state.entities.locations, entity_id, &update.updates)
        }
        EntityKind::Faction => {
            upsert_entity(&mut state.entities.factions, entity_id, &update.updates)
        }
    }
}

fn upsert_entity<T: Serialize + DeserializeOwned>(
    map: &mut BTreeMap<String, T>,
    entity_id: &str,
    updates: &Map<String, Value>,
) {
    let merged = match map.get(entity_id) {
        Some(current) => overlay(current, updates),
        None => {
            let mut object = Map::new();
            object.insert("id".to_string(), json!(entity_id));
            for (key, value) in updates {
                // The id is fixed by the mapping key.
                if key == "id" || value.is_null() {
                    continue;
                }
                object.insert(key.clone(), value.clone());
            }
            serde_json::from_value(Value::Object(object))
        }
    };

    match merged {
        Ok(entity) => {
            map.insert(entity_id.to_string(), entity);
        }
        Err(e) => {
            tracing::warn!(entity_id = %entity_id, error = %e, "Skipping unappliable entity update");
        }
    }
}

/// Shallow-merge `updates` over the serialized form of `current`.
fn overlay<T: Serialize + DeserializeOwned>(
    current: &T,
    updates: &Map<String, Value>,
) -> Result<T, serde_json::Error> {
    let mut value = serde_json::to_value(current)?;
    if let Value::Object(object) = &mut value {
        for (key, new_value) in updates {
            // The id is fixed by the mapping key.
            if key == "id" {
                continue;
            }
            if new_value.is_null() {
                object.remove(key);
            } else {
                object.insert(key.clone(), new_value.clone());
            }
        }
    }
    serde_json::from_value(value)
}

fn apply_player_updates(state: &mut CanonicalState, updates: &PlayerUpdates) {
    let player = &mut state.player;

    if let Some(location_id) = &updates.location_id {
        player.location_id = location_id.clone();
    }
    if let Some(party) = &updates.party {
        player.party = party.clone();
    }
    for id in &updates.party_add {
        if !player.party.contains(id) {
            player.party.push(id.clone());
        }
    }
    player.party.retain(|id| !updates.party_remove.contains(id));

    for id in &updates.inventory_add {
        if !player.inventory.contains(id) {
            player.inventory.push(id.clone());
        }
    }
    player
        .inventory
        .retain(|id| !updates.inventory_remove.contains(id));
}

fn apply_quest_update(quests: &mut QuestState, update: &QuestUpdate) {
    let existing = remove_quest(&mut quests.active, &update.quest_id)
        .or_else(|| remove_quest(&mut quests.completed, &update.quest_id));

    let mut quest = existing.unwrap_or_else(|| Quest {
        id: update.quest_id.clone(),
        title: update
            .metadata
            .as_ref()
            .and_then(|m| m.get("title"))
            .and_then(Value::as_str)
            .unwrap_or(&update.quest_id)
            .to_string(),
        status: update.status,
        metadata: Map::new(),
    });

    quest.status = update.status;
    if let Some(metadata) = &update.metadata {
        for (key, value) in metadata {
            quest.metadata.insert(key.clone(), value.clone());
        }
    }

    match update.status {
        QuestStatus::Active => quests.active.push(quest),
        QuestStatus::Completed | QuestStatus::Failed => quests.completed.push(quest),
    }
}

fn remove_quest(list: &mut Vec<Quest>, quest_id: &str) -> Option<Quest> {
    list.iter()
        .position(|q| q.id == quest_id)
        .map(|i| list.remove(i))
}

// ============================================================================
// State manager
// ============================================================================

/// Applies validated events atomically, one writer per story.
///
/// The per-story mutation lock is held from the state read to the
/// durable commit; readers go straight to the store and see the latest
/// committed snapshot.
pub struct StateManager {
    store: Arc<StateStore>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StateManager {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn story_lock(&self, story_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("story lock registry poisoned");
        Arc::clone(
            locks
                .entry(story_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Fold the events' patches (plus an optional gate-supplied fix
    /// patch) into the story's state and commit state and events as one
    /// atomic unit.
    ///
    /// Advances `meta.turn` to the highest event turn seen, points
    /// `meta.last_event_id` at the final event, reconciles dangling
    /// location references, and aborts without writing if the result
    /// still breaks referential integrity.
    pub async fn apply_events(
        &self,
        story_id: &str,
        events: &[Event],
        fixes: Option<&StatePatch>,
    ) -> Result<CanonicalState, ApplyError> {
        let last_event = events.last().ok_or(ApplyError::NoEvents)?;

        let lock = self.story_lock(story_id);
        let _guard = lock.lock().await;

        let mut state = self.store.initialize_state(story_id).await?;

        for event in events {
            state = apply_patch(&state, &event.state_patch);
        }
        if let Some(fixes) = fixes {
            state = apply_patch(&state, fixes);
        }

        let max_turn = events.iter().map(|e| e.turn).max().unwrap_or(0);
        state.meta.turn = state.meta.turn.max(max_turn);
        state.meta.last_event_id = Some(last_event.event_id.clone());
        state.meta.updated_at = Utc::now();

        let healed = state.heal_missing_locations();
        if !healed.is_empty() {
            tracing::warn!(
                story_id = %story_id,
                locations = ?healed,
                "Synthesized placeholder locations for dangling references"
            );
        }

        let errors = state.reference_errors();
        if !errors.is_empty() {
            return Err(ApplyError::InvariantViolation(errors.join("; ")));
        }

        self.store.commit_turn(story_id, &state, events).await?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Character, Constraint, Item, TimeAnchor, TimeUpdate};

    fn base_state() -> CanonicalState {
        let mut state = CanonicalState::scaffold("s");
        state.entities.characters.insert(
            "caocao".to_string(),
            Character {
                id: "caocao".to_string(),
                name: "Cao Cao".to_string(),
                alive: true,
                location_id: Some("unknown".to_string()),
                faction_id: None,
                metadata: Map::new(),
            },
        );
        state.entities.items.insert(
            "sword_001".to_string(),
            Item {
                id: "sword_001".to_string(),
                name: "Qinggang Sword".to_string(),
                unique: true,
                owner_id: Some("caocao".to_string()),
                location_id: Some("unknown".to_string()),
                metadata: Map::new(),
            },
        );
        state
    }

    #[test]
    fn test_field_overlay() {
        let state = base_state();
        let mut updates = Map::new();
        updates.insert("owner_id".to_string(), json!("player_001"));

        let next = apply_patch(
            &state,
            &StatePatch::for_entity(EntityKind::Item, "sword_001", updates),
        );

        assert_eq!(
            next.entities.items["sword_001"].owner_id.as_deref(),
            Some("player_001")
        );
        // Untouched fields survive.
        assert_eq!(next.entities.items["sword_001"].name, "Qinggang Sword");
        // The input state is unchanged.
        assert_eq!(
            state.entities.items["sword_001"].owner_id.as_deref(),
            Some("caocao")
        );
    }

    #[test]
    fn test_null_unsets_field() {
        let state = base_state();
        let mut updates = Map::new();
        updates.insert("faction_id".to_string(), json!("wei"));
        let next = apply_patch(
            &state,
            &StatePatch::for_entity(EntityKind::Character, "caocao", updates),
        );
        assert_eq!(
            next.entities.characters["caocao"].faction_id.as_deref(),
            Some("wei")
        );

        let mut unset = Map::new();
        unset.insert("faction_id".to_string(), Value::Null);
        let cleared = apply_patch(
            &next,
            &StatePatch::for_entity(EntityKind::Character, "caocao", unset),
        );
        assert_eq!(cleared.entities.characters["caocao"].faction_id, None);
    }

    #[test]
    fn test_new_entity_created_when_named() {
        let state = base_state();
        let mut updates = Map::new();
        updates.insert("name".to_string(), json!("Imperial Seal"));
        updates.insert("unique".to_string(), json!(true));
        updates.insert("owner_id".to_string(), json!("caocao"));

        let next = apply_patch(
            &state,
            &StatePatch::for_entity(EntityKind::Item, "seal_001", updates),
        );
        assert_eq!(next.entities.items["seal_001"].name, "Imperial Seal");
        assert!(next.entities.items["seal_001"].unique);
    }

    #[test]
    fn test_unnamed_new_entity_is_skipped() {
        let state = base_state();
        let mut updates = Map::new();
        updates.insert("owner_id".to_string(), json!("caocao"));

        let next = apply_patch(
            &state,
            &StatePatch::for_entity(EntityKind::Item, "mystery_item", updates),
        );
        assert!(!next.entities.items.contains_key("mystery_item"));
    }

    #[test]
    fn test_player_set_semantics() {
        let state = base_state();
        let patch = StatePatch {
            player_updates: Some(PlayerUpdates {
                inventory_add: vec!["sword_001".to_string(), "sword_001".to_string()],
                party_add: vec!["caocao".to_string()],
                ..PlayerUpdates::default()
            }),
            ..StatePatch::default()
        };

        let next = apply_patch(&state, &patch);
        assert_eq!(next.player.inventory, vec!["sword_001"]);
        assert_eq!(next.player.party, vec!["caocao"]);

        let removal = StatePatch {
            player_updates: Some(PlayerUpdates {
                inventory_remove: vec!["sword_001".to_string()],
                ..PlayerUpdates::default()
            }),
            ..StatePatch::default()
        };
        let after = apply_patch(&next, &removal);
        assert!(after.player.inventory.is_empty());
    }

    #[test]
    fn test_time_update_replaces_anchor() {
        let state = base_state();
        let patch = StatePatch {
            time_update: Some(TimeUpdate {
                calendar: Some("Summer".to_string()),
                anchor: Some(TimeAnchor {
                    label: "Summer".to_string(),
                    order: 5,
                }),
            }),
            ..StatePatch::default()
        };

        let next = apply_patch(&state, &patch);
        assert_eq!(next.time.calendar, "Summer");
        assert_eq!(next.time.anchor.order, 5);
    }

    #[test]
    fn test_quest_moves_to_completed() {
        let state = base_state();
        let start = StatePatch {
            quest_updates: vec![QuestUpdate {
                quest_id: "rescue_emperor".to_string(),
                status: QuestStatus::Active,
                metadata: Some({
                    let mut m = Map::new();
                    m.insert("title".to_string(), json!("Rescue the Emperor"));
                    m
                }),
            }],
            ..StatePatch::default()
        };
        let active = apply_patch(&state, &start);
        assert_eq!(active.quest.active.len(), 1);
        assert_eq!(active.quest.active[0].title, "Rescue the Emperor");

        let finish = StatePatch {
            quest_updates: vec![QuestUpdate {
                quest_id: "rescue_emperor".to_string(),
                status: QuestStatus::Completed,
                metadata: None,
            }],
            ..StatePatch::default()
        };
        let done = apply_patch(&active, &finish);
        assert!(done.quest.active.is_empty());
        assert_eq!(done.quest.completed.len(), 1);
        assert_eq!(done.quest.completed[0].status, QuestStatus::Completed);
    }

    #[test]
    fn test_constraint_additions_dedup() {
        let state = base_state();
        let constraint = Constraint::UniqueItem {
            item_id: "seal_001".to_string(),
        };
        let patch = StatePatch {
            constraint_additions: vec![constraint.clone(), constraint],
            ..StatePatch::default()
        };

        let next = apply_patch(&state, &patch);
        assert_eq!(next.constraints.constraints.len(), 1);
        assert!(next.constraints.unique_item_ids.contains("seal_001"));

        // Applying again adds nothing.
        let again = apply_patch(&next, &patch);
        assert_eq!(again.constraints.constraints.len(), 1);
    }
}
