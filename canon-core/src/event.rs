//! Events: the immutable records that drive every state change.
//!
//! An event couples a typed payload (what happened) with a
//! [`StatePatch`](crate::state::StatePatch) (how the canonical state
//! changes) and evidence pointing back at the draft text it was
//! extracted from.

use crate::state::{StatePatch, TimeAnchor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Validation failures for a single event.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("event id '{0}' does not match the 'evt_' format")]
    InvalidId(String),

    #[error("event summary must not be empty")]
    EmptySummary,

    #[error("event state_patch must contain at least one update")]
    EmptyPatch,
}

/// What happened, with the payload fields each event type requires.
///
/// The wire form is adjacently tagged, so a serialized event carries
/// `"type"` and `"payload"` exactly as external callers expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    OwnershipChange {
        item_id: String,
        old_owner_id: Option<String>,
        new_owner_id: Option<String>,
    },
    Death {
        character_id: String,
    },
    Revival {
        character_id: String,
    },
    Travel {
        character_id: String,
        from_location_id: String,
        to_location_id: String,
    },
    FactionChange {
        character_id: String,
        old_faction_id: Option<String>,
        new_faction_id: String,
    },
    QuestStart {
        quest_id: String,
    },
    QuestComplete {
        quest_id: String,
    },
    QuestFail {
        quest_id: String,
    },
    ItemCreate {
        item_id: String,
    },
    ItemDestroy {
        item_id: String,
    },
    TimeAdvance {
        time_anchor: TimeAnchor,
    },
    RelationshipChange {
        #[serde(default)]
        subject: Option<String>,
        #[serde(default)]
        object: Option<String>,
        #[serde(default)]
        kind: Option<String>,
    },
    Other {},
}

impl EventKind {
    /// The wire name of this event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::OwnershipChange { .. } => "OWNERSHIP_CHANGE",
            EventKind::Death { .. } => "DEATH",
            EventKind::Revival { .. } => "REVIVAL",
            EventKind::Travel { .. } => "TRAVEL",
            EventKind::FactionChange { .. } => "FACTION_CHANGE",
            EventKind::QuestStart { .. } => "QUEST_START",
            EventKind::QuestComplete { .. } => "QUEST_COMPLETE",
            EventKind::QuestFail { .. } => "QUEST_FAIL",
            EventKind::ItemCreate { .. } => "ITEM_CREATE",
            EventKind::ItemDestroy { .. } => "ITEM_DESTROY",
            EventKind::TimeAdvance { .. } => "TIME_ADVANCE",
            EventKind::RelationshipChange { .. } => "RELATIONSHIP_CHANGE",
            EventKind::Other {} => "OTHER",
        }
    }

    /// The entity id the event is primarily about, if it names one.
    pub fn primary_entity(&self) -> Option<&str> {
        match self {
            EventKind::OwnershipChange { item_id, .. }
            | EventKind::ItemCreate { item_id }
            | EventKind::ItemDestroy { item_id } => Some(item_id),
            EventKind::Death { character_id }
            | EventKind::Revival { character_id }
            | EventKind::Travel { character_id, .. }
            | EventKind::FactionChange { character_id, .. } => Some(character_id),
            EventKind::QuestStart { quest_id }
            | EventKind::QuestComplete { quest_id }
            | EventKind::QuestFail { quest_id } => Some(quest_id),
            EventKind::RelationshipChange { subject, .. } => subject.as_deref(),
            EventKind::TimeAdvance { .. } | EventKind::Other {} => None,
        }
    }
}

/// Where an event took place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLocation {
    pub location_id: String,
}

/// Who took part: actors perform the event, witnesses are merely present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventParticipants {
    #[serde(default)]
    pub actors: Vec<String>,
    #[serde(default)]
    pub witnesses: Vec<String>,
}

/// Provenance: which draft the event came from and the supporting text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEvidence {
    /// e.g. `"draft_turn_5"`.
    pub source: String,
    #[serde(default)]
    pub text_span: Option<String>,
}

/// An immutable, committed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique, `evt_{turn}_{unix_seconds}_{8-hex}`.
    pub event_id: String,
    pub story_id: String,
    pub turn: u64,
    pub time: TimeAnchor,
    #[serde(rename = "where")]
    pub place: EventLocation,
    pub who: EventParticipants,
    #[serde(flatten)]
    pub kind: EventKind,
    pub summary: String,
    pub state_patch: StatePatch,
    pub evidence: EventEvidence,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Check the invariants every committed event must satisfy: id
    /// format, a non-empty summary, and a non-empty patch (traceability).
    pub fn validate(&self) -> Result<(), EventError> {
        if !self.event_id.starts_with("evt_") {
            return Err(EventError::InvalidId(self.event_id.clone()));
        }
        if self.summary.trim().is_empty() {
            return Err(EventError::EmptySummary);
        }
        if self.state_patch.is_empty() {
            return Err(EventError::EmptyPatch);
        }
        Ok(())
    }
}

/// A candidate event as emitted by the text model: the full event shape
/// minus `event_id` and `created_at`, which the extractor assigns.
#[derive(Debug, Clone, Deserialize)]
pub struct CandidateEvent {
    pub turn: u64,
    pub time: TimeAnchor,
    #[serde(rename = "where")]
    pub place: EventLocation,
    #[serde(default)]
    pub who: EventParticipants,
    #[serde(flatten)]
    pub kind: EventKind,
    pub summary: String,
    #[serde(default)]
    pub state_patch: StatePatch,
    #[serde(default)]
    pub evidence: Option<EventEvidence>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

/// Mint a new event id: `evt_{turn}_{unix_seconds}_{8-hex}`.
pub fn new_event_id(turn: u64) -> String {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let digest = Uuid::new_v4().simple().to_string();
    format!("evt_{}_{}_{}", turn, seconds, &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EntityKind, StatePatch};
    use serde_json::{json, Map};

    fn sample_event(kind: EventKind, patch: StatePatch) -> Event {
        Event {
            event_id: new_event_id(3),
            story_id: "s".to_string(),
            turn: 3,
            time: TimeAnchor {
                label: "Spring".to_string(),
                order: 7,
            },
            place: EventLocation {
                location_id: "luoyang".to_string(),
            },
            who: EventParticipants {
                actors: vec!["caocao".to_string()],
                witnesses: Vec::new(),
            },
            kind,
            summary: "Cao Cao hands over the sword".to_string(),
            state_patch: patch,
            evidence: EventEvidence {
                source: "draft_turn_3".to_string(),
                text_span: None,
            },
            created_at: Utc::now(),
        }
    }

    fn minimal_patch() -> StatePatch {
        let mut updates = Map::new();
        updates.insert("owner_id".to_string(), json!("player_001"));
        StatePatch::for_entity(EntityKind::Item, "sword_001", updates)
    }

    #[test]
    fn test_event_id_format() {
        let id = new_event_id(12);
        let parts: Vec<&str> = id.splitn(4, '_').collect();
        assert_eq!(parts[0], "evt");
        assert_eq!(parts[1], "12");
        assert!(parts[2].parse::<u64>().is_ok());
        assert_eq!(parts[3].len(), 8);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = new_event_id(1);
        let b = new_event_id(1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_payload_wire_format() {
        let event = sample_event(
            EventKind::OwnershipChange {
                item_id: "sword_001".to_string(),
                old_owner_id: Some("caocao".to_string()),
                new_owner_id: Some("player_001".to_string()),
            },
            minimal_patch(),
        );

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "OWNERSHIP_CHANGE");
        assert_eq!(value["payload"]["item_id"], "sword_001");
        assert_eq!(value["payload"]["new_owner_id"], "player_001");
        assert_eq!(value["where"]["location_id"], "luoyang");
    }

    #[test]
    fn test_event_round_trip() {
        let event = sample_event(
            EventKind::Travel {
                character_id: "player_001".to_string(),
                from_location_id: "luoyang".to_string(),
                to_location_id: "xuchang".to_string(),
            },
            minimal_patch(),
        );

        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_candidate_rejects_missing_payload_fields() {
        // A TRAVEL candidate without to_location_id must not parse.
        let raw = json!({
            "turn": 1,
            "time": {"label": "Spring", "order": 1},
            "where": {"location_id": "luoyang"},
            "who": {"actors": ["player_001"], "witnesses": []},
            "type": "TRAVEL",
            "payload": {"character_id": "player_001", "from_location_id": "luoyang"},
            "summary": "The player sets out",
            "state_patch": {}
        });
        assert!(serde_json::from_value::<CandidateEvent>(raw).is_err());
    }

    #[test]
    fn test_candidate_tolerates_extra_payload_fields() {
        let raw = json!({
            "turn": 1,
            "time": {"label": "Spring", "order": 1},
            "where": {"location_id": "luoyang"},
            "type": "DEATH",
            "payload": {"character_id": "yuanshao", "cause": "illness"},
            "summary": "Yuan Shao dies",
            "state_patch": {},
            "confidence": 0.8
        });
        let candidate: CandidateEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(candidate.kind.type_name(), "DEATH");
        assert_eq!(candidate.confidence, 0.8);
        assert!(candidate.who.actors.is_empty());
    }

    #[test]
    fn test_validate_rejects_empty_patch() {
        let event = sample_event(EventKind::Other {}, StatePatch::default());
        assert!(matches!(event.validate(), Err(EventError::EmptyPatch)));
    }

    #[test]
    fn test_validate_rejects_bad_id() {
        let mut event = sample_event(EventKind::Other {}, minimal_patch());
        event.event_id = "event-1".to_string();
        assert!(matches!(event.validate(), Err(EventError::InvalidId(_))));
    }

    #[test]
    fn test_primary_entity() {
        assert_eq!(
            EventKind::Death {
                character_id: "lubu".to_string()
            }
            .primary_entity(),
            Some("lubu")
        );
        assert_eq!(EventKind::Other {}.primary_entity(), None);
    }
}
