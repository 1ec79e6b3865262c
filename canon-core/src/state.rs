//! Canonical world state types.
//!
//! Contains the authoritative factual snapshot of a story world: meta
//! information, the time anchor, the player, all tracked entities,
//! quests, and hard constraints — plus the sparse [`StatePatch`] overlay
//! that events carry to describe their state changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Id of the placeholder location every scaffold state starts with.
pub const UNKNOWN_LOCATION_ID: &str = "unknown";

/// Id of the default player character.
pub const DEFAULT_PLAYER_ID: &str = "player_001";

fn default_true() -> bool {
    true
}

// ============================================================================
// Meta and time
// ============================================================================

/// Story-level bookkeeping: id, version, turn counter, provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaInfo {
    /// Story id, e.g. `"sanguo_yanyi"`.
    pub story_id: String,
    /// Canon format version.
    pub canon_version: String,
    /// Current turn, monotone non-decreasing.
    pub turn: u64,
    /// Id of the last committed event, if any.
    #[serde(default)]
    pub last_event_id: Option<String>,
    /// When the state was last written.
    pub updated_at: DateTime<Utc>,
}

/// A point on the story's internal timeline.
///
/// `order` defines chronology independent of wall-clock time and is
/// non-decreasing across accepted events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeAnchor {
    /// Human-readable label, e.g. `"Spring, third year of Jian'an"`.
    pub label: String,
    /// Ordering value used to sort the timeline.
    pub order: i64,
}

/// The story's current time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeState {
    /// Free-text calendar description.
    pub calendar: String,
    /// The current time anchor.
    pub anchor: TimeAnchor,
}

// ============================================================================
// Player and entities
// ============================================================================

/// The player character's canonical situation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub id: String,
    pub name: String,
    /// Must resolve inside `entities.locations`.
    pub location_id: String,
    /// Character ids travelling with the player.
    #[serde(default)]
    pub party: Vec<String>,
    /// Item ids the player carries.
    #[serde(default)]
    pub inventory: Vec<String>,
}

/// A non-player character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub alive: bool,
    /// Current location, or `None` if unplaced.
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub faction_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// An item. Owned items follow their owner; unowned items sit at a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub name: String,
    /// Unique items admit exactly one owner and require one.
    #[serde(default)]
    pub unique: bool,
    /// A character id or a location id.
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A place in the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Location {
    /// A placeholder for a location id that is referenced but unknown.
    pub fn placeholder(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            metadata: Map::new(),
        }
    }
}

/// A faction or organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Faction {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// The four entity mappings. Keys are unique; insertion order is irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    #[serde(default)]
    pub characters: BTreeMap<String, Character>,
    #[serde(default)]
    pub items: BTreeMap<String, Item>,
    #[serde(default)]
    pub locations: BTreeMap<String, Location>,
    #[serde(default)]
    pub factions: BTreeMap<String, Faction>,
}

// ============================================================================
// Quests
// ============================================================================

/// Quest lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestStatus {
    Active,
    Completed,
    Failed,
}

/// A quest or objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quest {
    pub id: String,
    pub title: String,
    pub status: QuestStatus,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Active and concluded quests. Failed quests are filed with `completed`
/// (their status is preserved), so `active` only ever holds active quests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestState {
    #[serde(default)]
    pub active: Vec<Quest>,
    #[serde(default)]
    pub completed: Vec<Quest>,
}

// ============================================================================
// Constraints
// ============================================================================

/// A hard constraint the world must keep satisfying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    /// Named fields of an entity must keep the given values.
    EntityState {
        entity_id: String,
        value: Map<String, Value>,
    },
    /// A relationship between two entities must persist.
    Relationship {
        subject: String,
        object: String,
        kind: String,
    },
    /// The item must remain unique with a single owner.
    UniqueItem { item_id: String },
}

/// The constraint set of a story.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Ids of items that must never have more than one owner.
    #[serde(default)]
    pub unique_item_ids: BTreeSet<String>,
    /// Event ids recording history that must never be contradicted.
    #[serde(default)]
    pub immutable_events: BTreeSet<String>,
    /// Further hard constraints.
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

// ============================================================================
// Canonical state
// ============================================================================

/// The authoritative factual snapshot of one story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalState {
    pub meta: MetaInfo,
    pub time: TimeState,
    pub player: PlayerState,
    pub entities: Entities,
    pub quest: QuestState,
    pub constraints: Constraints,
}

impl CanonicalState {
    /// Create the empty, internally consistent scaffold a story starts from.
    ///
    /// The scaffold holds one placeholder location and a player standing
    /// in it, so reference validation passes from the first touch.
    pub fn scaffold(story_id: impl Into<String>) -> Self {
        let mut locations = BTreeMap::new();
        locations.insert(
            UNKNOWN_LOCATION_ID.to_string(),
            Location {
                id: UNKNOWN_LOCATION_ID.to_string(),
                name: "Unknown".to_string(),
                metadata: Map::new(),
            },
        );

        Self {
            meta: MetaInfo {
                story_id: story_id.into(),
                canon_version: "1.0.0".to_string(),
                turn: 0,
                last_event_id: None,
                updated_at: Utc::now(),
            },
            time: TimeState {
                calendar: "Beginning".to_string(),
                anchor: TimeAnchor {
                    label: "Beginning".to_string(),
                    order: 0,
                },
            },
            player: PlayerState {
                id: DEFAULT_PLAYER_ID.to_string(),
                name: "Player".to_string(),
                location_id: UNKNOWN_LOCATION_ID.to_string(),
                party: Vec::new(),
                inventory: Vec::new(),
            },
            entities: Entities {
                locations,
                ..Entities::default()
            },
            quest: QuestState::default(),
            constraints: Constraints::default(),
        }
    }

    /// Check referential integrity, returning a description per broken
    /// reference. An empty result means the state is internally consistent.
    pub fn reference_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !self.entities.locations.contains_key(&self.player.location_id) {
            errors.push(format!(
                "player location '{}' not found in locations",
                self.player.location_id
            ));
        }
        for char_id in &self.player.party {
            if !self.entities.characters.contains_key(char_id) {
                errors.push(format!("party member '{char_id}' not found in characters"));
            }
        }
        for item_id in &self.player.inventory {
            if !self.entities.items.contains_key(item_id) {
                errors.push(format!("inventory item '{item_id}' not found in items"));
            }
        }

        for (char_id, character) in &self.entities.characters {
            if let Some(location_id) = &character.location_id {
                if !self.entities.locations.contains_key(location_id) {
                    errors.push(format!(
                        "character '{char_id}' location '{location_id}' not found"
                    ));
                }
            }
            if let Some(faction_id) = &character.faction_id {
                if !self.entities.factions.contains_key(faction_id) {
                    errors.push(format!(
                        "character '{char_id}' faction '{faction_id}' not found"
                    ));
                }
            }
        }

        for (item_id, item) in &self.entities.items {
            if item.owner_id.is_none() && item.location_id.is_none() {
                errors.push(format!(
                    "item '{item_id}' has neither owner_id nor location_id"
                ));
            }
            if item.unique && item.owner_id.is_none() {
                errors.push(format!("unique item '{item_id}' has no owner_id"));
            }
            if let Some(owner_id) = &item.owner_id {
                if !self.entities.characters.contains_key(owner_id)
                    && !self.entities.locations.contains_key(owner_id)
                {
                    errors.push(format!("item '{item_id}' owner '{owner_id}' not found"));
                }
            }
            if let Some(location_id) = &item.location_id {
                if !self.entities.locations.contains_key(location_id) {
                    errors.push(format!(
                        "item '{item_id}' location '{location_id}' not found"
                    ));
                }
            }
        }

        errors
    }

    /// Synthesize placeholder locations for every referenced-but-missing
    /// location id, returning the ids that were created.
    ///
    /// Recovery is additive only: nothing is removed or rewritten.
    pub fn heal_missing_locations(&mut self) -> Vec<String> {
        let mut required: BTreeSet<String> = BTreeSet::new();

        required.insert(self.player.location_id.clone());
        for character in self.entities.characters.values() {
            if let Some(location_id) = &character.location_id {
                required.insert(location_id.clone());
            }
        }
        for item in self.entities.items.values() {
            if let Some(location_id) = &item.location_id {
                required.insert(location_id.clone());
            }
            // An owner id that is neither a character nor a known location
            // is treated as a location reference.
            if let Some(owner_id) = &item.owner_id {
                if !self.entities.characters.contains_key(owner_id) {
                    required.insert(owner_id.clone());
                }
            }
        }

        let mut created = Vec::new();
        for location_id in required {
            if !self.entities.locations.contains_key(&location_id) {
                self.entities
                    .locations
                    .insert(location_id.clone(), Location::placeholder(&location_id));
                created.push(location_id);
            }
        }
        created
    }

    /// Look up a character's display name, falling back to the id.
    pub fn character_name<'a>(&'a self, character_id: &'a str) -> &'a str {
        self.entities
            .characters
            .get(character_id)
            .map(|c| c.name.as_str())
            .unwrap_or(character_id)
    }

    /// Look up an item's display name, falling back to the id.
    pub fn item_name<'a>(&'a self, item_id: &'a str) -> &'a str {
        self.entities
            .items
            .get(item_id)
            .map(|i| i.name.as_str())
            .unwrap_or(item_id)
    }

    /// Whether `item_id` is constrained to a single owner, either by the
    /// constraint set or by the item's own `unique` flag.
    pub fn is_unique_item(&self, item_id: &str) -> bool {
        self.constraints.unique_item_ids.contains(item_id)
            || self
                .entities
                .items
                .get(item_id)
                .map(|i| i.unique)
                .unwrap_or(false)
    }
}

// ============================================================================
// State patches
// ============================================================================

/// Which entity mapping an [`EntityUpdate`] targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Character,
    Item,
    Location,
    Faction,
}

/// A sparse update to one entity. `updates` is a shallow field overlay:
/// a `null` value unsets the field, a missing field is untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub updates: Map<String, Value>,
}

/// Replaces the story time. The anchor is replaced as a whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeUpdate {
    #[serde(default)]
    pub calendar: Option<String>,
    #[serde(default)]
    pub anchor: Option<TimeAnchor>,
}

/// A quest status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestUpdate {
    pub quest_id: String,
    pub status: QuestStatus,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

/// Updates to the player record. `location_id` and `party` are
/// replacements; the `*_add` / `*_remove` lists have set semantics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerUpdates {
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub party: Option<Vec<String>>,
    #[serde(default)]
    pub inventory_add: Vec<String>,
    #[serde(default)]
    pub inventory_remove: Vec<String>,
    #[serde(default)]
    pub party_add: Vec<String>,
    #[serde(default)]
    pub party_remove: Vec<String>,
}

impl PlayerUpdates {
    pub fn is_empty(&self) -> bool {
        self.location_id.is_none()
            && self.party.is_none()
            && self.inventory_add.is_empty()
            && self.inventory_remove.is_empty()
            && self.party_add.is_empty()
            && self.party_remove.is_empty()
    }
}

/// A sparse overlay of updates applied to a [`CanonicalState`].
///
/// Patches are additive; unset fields leave the state untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default)]
    pub entity_updates: BTreeMap<String, EntityUpdate>,
    #[serde(default)]
    pub time_update: Option<TimeUpdate>,
    #[serde(default)]
    pub quest_updates: Vec<QuestUpdate>,
    #[serde(default)]
    pub constraint_additions: Vec<Constraint>,
    #[serde(default)]
    pub player_updates: Option<PlayerUpdates>,
}

impl StatePatch {
    /// True when the patch changes nothing at all.
    pub fn is_empty(&self) -> bool {
        self.entity_updates.is_empty()
            && self.time_update.is_none()
            && self.quest_updates.is_empty()
            && self.constraint_additions.is_empty()
            && self
                .player_updates
                .as_ref()
                .map(PlayerUpdates::is_empty)
                .unwrap_or(true)
    }

    /// A patch updating a single entity.
    pub fn for_entity(
        entity_type: EntityKind,
        entity_id: impl Into<String>,
        updates: Map<String, Value>,
    ) -> Self {
        let entity_id = entity_id.into();
        let mut entity_updates = BTreeMap::new();
        entity_updates.insert(
            entity_id.clone(),
            EntityUpdate {
                entity_type,
                entity_id,
                updates,
            },
        );
        Self {
            entity_updates,
            ..Self::default()
        }
    }
}
