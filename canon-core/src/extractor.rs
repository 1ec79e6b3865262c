//! Event extraction: narrative draft → structured candidate events.
//!
//! The extractor hands the current state summary, the target schema and
//! two worked examples to an external text model and asks for a forced
//! function call. When that fails it degrades to JSON-object mode and
//! finally to salvaging fenced JSON from free text; the whole call is
//! retried once with the parser error as added context. Individual
//! candidates that fail validation are dropped with a warning.

use crate::event::{new_event_id, CandidateEvent, Event, EventEvidence};
use crate::state::{CanonicalState, EntityKind, StatePatch};
use async_trait::async_trait;
use chrono::Utc;
use llm::{Message, Request, ResponseFormat, ToolChoice};
use serde_json::{json, Map, Value};
use thiserror::Error;

const EXTRACT_FUNCTION: &str = "extract_events";

/// Errors from event extraction.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("text model did not respond within the turn budget")]
    Timeout,

    #[error("text model response unparseable: {0}")]
    Parse(String),

    #[error("text model call failed: {0}")]
    Client(#[from] llm::Error),
}

/// The extractor's result for one draft.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub events: Vec<Event>,
    pub open_questions: Vec<String>,
    /// When set, the orchestrator short-circuits to `ASK_USER`.
    pub requires_user_input: bool,
}

impl Extraction {
    /// An extraction carrying only events.
    pub fn from_events(events: Vec<Event>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    /// An extraction that defers to the user.
    pub fn from_questions(open_questions: Vec<String>) -> Self {
        Self {
            events: Vec::new(),
            requires_user_input: true,
            open_questions,
        }
    }
}

/// The seam between the turn orchestrator and whatever produces events.
///
/// Production uses [`EventExtractor`]; tests script outcomes through
/// [`MockExtractor`](crate::testing::MockExtractor).
#[async_trait]
pub trait DraftExtractor: Send + Sync {
    async fn extract(
        &self,
        state: &CanonicalState,
        user_message: &str,
        draft: &str,
        turn: u64,
    ) -> Result<Extraction, ExtractError>;
}

/// LLM-backed extractor.
pub struct EventExtractor {
    client: llm::Client,
    retry_count: u32,
}

impl EventExtractor {
    pub fn new(client: llm::Client, retry_count: u32) -> Self {
        Self {
            client,
            retry_count,
        }
    }

    /// One structured-output attempt: forced function call, then
    /// JSON-object mode, then fenced-JSON salvage.
    async fn call_structured(
        &self,
        system: &str,
        user: &str,
        retry_context: Option<&str>,
    ) -> Result<Value, ExtractError> {
        let mut messages = vec![Message::system(system), Message::user(user)];
        if let Some(error) = retry_context {
            messages.push(Message::system(format!(
                "The previous attempt could not be parsed ({error}). Call the \
                 {EXTRACT_FUNCTION} function with valid arguments and output nothing else."
            )));
        }

        let forced = Request::new(messages.clone())
            .with_temperature(0.2)
            .with_tools(vec![extract_events_tool()])
            .with_tool_choice(ToolChoice::Function {
                name: EXTRACT_FUNCTION.to_string(),
            });

        match self.client.complete(forced).await {
            Ok(response) => {
                if let Some(arguments) = response.tool_arguments(EXTRACT_FUNCTION) {
                    match serde_json::from_str(arguments) {
                        Ok(value) => return Ok(value),
                        Err(e) => {
                            tracing::warn!(error = %e, "Tool arguments unparseable, trying JSON mode");
                        }
                    }
                } else if let Some(content) = &response.content {
                    if let Ok(value) = parse_json_lenient(content) {
                        return Ok(value);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Function calling failed, falling back to JSON mode");
            }
        }

        let json_mode = Request::new(messages)
            .with_temperature(0.2)
            .with_response_format(ResponseFormat::JsonObject);
        let response = self.client.complete(json_mode).await?;
        let content = response
            .content
            .ok_or_else(|| ExtractError::Parse("empty response from text model".to_string()))?;
        parse_json_lenient(&content).map_err(ExtractError::Parse)
    }
}

#[async_trait]
impl DraftExtractor for EventExtractor {
    async fn extract(
        &self,
        state: &CanonicalState,
        user_message: &str,
        draft: &str,
        turn: u64,
    ) -> Result<Extraction, ExtractError> {
        let system = build_system_prompt(state, turn);
        let user = build_user_prompt(user_message, draft);

        let mut last_error: Option<ExtractError> = None;
        for attempt in 0..=self.retry_count {
            let retry_context = last_error.as_ref().map(|e| e.to_string());
            match self
                .call_structured(&system, &user, retry_context.as_deref())
                .await
            {
                Ok(data) => return Ok(assemble_extraction(state, draft, turn, &data)),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Extraction attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ExtractError::Parse("extraction produced no output".to_string())))
    }
}

// ============================================================================
// Prompt assembly
// ============================================================================

/// A ≤ 20-line summary of the canonical state for the system prompt.
fn state_summary(state: &CanonicalState) -> String {
    let mut lines = Vec::new();

    lines.push(format!(
        "Time: {} (order: {})",
        state.time.calendar, state.time.anchor.order
    ));
    lines.push(format!(
        "Player: {} ({}) @ {}",
        state.player.name, state.player.id, state.player.location_id
    ));
    if !state.player.party.is_empty() {
        lines.push(format!("  Party: {}", state.player.party.join(", ")));
    }
    if !state.player.inventory.is_empty() {
        lines.push(format!("  Inventory: {}", state.player.inventory.join(", ")));
    }

    if !state.entities.characters.is_empty() {
        lines.push("Key characters:".to_string());
        for (char_id, character) in state.entities.characters.iter().take(10) {
            let status = if character.alive { "alive" } else { "dead" };
            let location = character
                .location_id
                .as_ref()
                .map(|id| {
                    state
                        .entities
                        .locations
                        .get(id)
                        .map(|l| l.name.as_str())
                        .unwrap_or(id)
                })
                .unwrap_or("unplaced");
            lines.push(format!(
                "  - {} ({char_id}): {status}, at {location}",
                character.name
            ));
        }
    }

    if !state.entities.items.is_empty() {
        lines.push("Key items:".to_string());
        for (item_id, item) in state.entities.items.iter().take(10) {
            let holder = match (&item.owner_id, &item.location_id) {
                (Some(owner), _) => format!("owner: {owner}"),
                (None, Some(location)) => format!("at: {location}"),
                (None, None) => "unplaced".to_string(),
            };
            lines.push(format!("  - {} ({item_id}): {holder}", item.name));
        }
    }

    if !state.constraints.unique_item_ids.is_empty() {
        let ids: Vec<&str> = state
            .constraints
            .unique_item_ids
            .iter()
            .map(String::as_str)
            .collect();
        lines.push(format!("Unique items: {}", ids.join(", ")));
    }
    if !state.constraints.immutable_events.is_empty() {
        lines.push(format!(
            "Immutable events: {}",
            state.constraints.immutable_events.len()
        ));
    }

    lines.truncate(20);
    lines.join("\n")
}

fn build_system_prompt(state: &CanonicalState, turn: u64) -> String {
    let summary = state_summary(state);
    let player_id = &state.player.id;
    let player_location = &state.player.location_id;
    let example_char = state
        .entities
        .characters
        .keys()
        .next()
        .map(String::as_str)
        .unwrap_or("caocao");
    let example_item = state
        .entities
        .items
        .keys()
        .next()
        .map(String::as_str)
        .unwrap_or("sword_001");
    let calendar = &state.time.calendar;
    let next_order = state.time.anchor.order + 1;

    format!(
        r#"You are an event extractor. Read a narrative draft against the canonical
world state and report every state change as a structured event.

## Current state (turn {turn})

{summary}

## Rules

1. Every state change described in the draft must appear in a state_patch.
2. Nothing appears from thin air: unknown items, dead characters acting, or
position changes with no travel must go into open_questions instead.
3. Event types: OWNERSHIP_CHANGE, DEATH, REVIVAL, TRAVEL, FACTION_CHANGE,
QUEST_START, QUEST_COMPLETE, QUEST_FAIL, ITEM_CREATE, ITEM_DESTROY,
TIME_ADVANCE, RELATIONSHIP_CHANGE, OTHER.
4. state_patch.entity_updates is an object keyed by entity id, each value
{{"entity_type": "character|item|location|faction", "entity_id": "...",
"updates": {{"field": value}}}}. player_updates supports location_id,
inventory_add, inventory_remove, party_add, party_remove.
5. Output at least one event; use OTHER with a minimal patch when nothing
material changes.

## Example 1: ownership change

Draft: "{example_char} hands the blade to the player."

{{"events": [{{"turn": {turn}, "time": {{"label": "{calendar}", "order": {next_order}}},
"where": {{"location_id": "{player_location}"}},
"who": {{"actors": ["{example_char}", "{player_id}"], "witnesses": []}},
"type": "OWNERSHIP_CHANGE", "summary": "{example_char} gives the blade to the player",
"payload": {{"item_id": "{example_item}", "old_owner_id": "{example_char}", "new_owner_id": "{player_id}"}},
"state_patch": {{"entity_updates": {{"{example_item}": {{"entity_type": "item", "entity_id": "{example_item}",
"updates": {{"owner_id": "{player_id}", "location_id": "{player_location}"}}}}}},
"player_updates": {{"inventory_add": ["{example_item}"]}}}},
"confidence": 1.0}}], "open_questions": []}}

## Example 2: travel

Draft: "The player leaves for Xuchang and arrives after a long ride."

{{"events": [{{"turn": {turn}, "time": {{"label": "{calendar}", "order": {next_order}}},
"where": {{"location_id": "xuchang"}},
"who": {{"actors": ["{player_id}"], "witnesses": []}},
"type": "TRAVEL", "summary": "The player travels to Xuchang",
"payload": {{"character_id": "{player_id}", "from_location_id": "{player_location}", "to_location_id": "xuchang"}},
"state_patch": {{"entity_updates": {{"{player_id}": {{"entity_type": "character", "entity_id": "{player_id}",
"updates": {{"location_id": "xuchang"}}}}}},
"player_updates": {{"location_id": "xuchang"}}}},
"confidence": 1.0}}], "open_questions": []}}

Call the {EXTRACT_FUNCTION} function with your result. Output nothing else."#
    )
}

fn build_user_prompt(user_message: &str, draft: &str) -> String {
    format!(
        r#"Extract the events from this exchange by calling {EXTRACT_FUNCTION}.

## User message
{user_message}

## Assistant draft
{draft}

Identify every ownership change, movement, death, revival, faction change,
quest transition and time advance. Record each in a state_patch. List
anything that needs clarification in open_questions. Output at least one
event."#
    )
}

fn extract_events_tool() -> llm::Tool {
    llm::Tool {
        name: EXTRACT_FUNCTION.to_string(),
        description: "Report the structured events extracted from a narrative draft. \
                      Must be called exactly once with the full result."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "events": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "turn": {"type": "integer", "minimum": 0},
                            "time": {
                                "type": "object",
                                "properties": {
                                    "label": {"type": "string"},
                                    "order": {"type": "integer"}
                                },
                                "required": ["label", "order"]
                            },
                            "where": {
                                "type": "object",
                                "properties": {"location_id": {"type": "string"}},
                                "required": ["location_id"]
                            },
                            "who": {
                                "type": "object",
                                "properties": {
                                    "actors": {"type": "array", "items": {"type": "string"}},
                                    "witnesses": {"type": "array", "items": {"type": "string"}}
                                }
                            },
                            "type": {
                                "type": "string",
                                "enum": [
                                    "OWNERSHIP_CHANGE", "DEATH", "REVIVAL", "TRAVEL",
                                    "FACTION_CHANGE", "QUEST_START", "QUEST_COMPLETE",
                                    "QUEST_FAIL", "ITEM_CREATE", "ITEM_DESTROY",
                                    "TIME_ADVANCE", "RELATIONSHIP_CHANGE", "OTHER"
                                ]
                            },
                            "summary": {"type": "string", "minLength": 1},
                            "payload": {
                                "type": "object",
                                "description": "Type-specific fields, e.g. item_id/old_owner_id/new_owner_id for OWNERSHIP_CHANGE, character_id/from_location_id/to_location_id for TRAVEL"
                            },
                            "state_patch": {
                                "type": "object",
                                "description": "Sparse state overlay: entity_updates keyed by id, plus optional time_update, quest_updates, constraint_additions, player_updates"
                            },
                            "confidence": {"type": "number", "minimum": 0, "maximum": 1}
                        },
                        "required": ["turn", "time", "where", "who", "type", "summary", "payload", "state_patch"]
                    }
                },
                "open_questions": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Questions the user must answer before these events can be trusted"
                }
            },
            "required": ["events"]
        }),
    }
}

// ============================================================================
// Response assembly
// ============================================================================

/// Parse structured output leniently: direct JSON, then fenced blocks,
/// then the outermost brace slice.
fn parse_json_lenient(content: &str) -> Result<Value, String> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let mut candidate = trimmed;
    if let Some(start) = candidate.find("```json") {
        candidate = &candidate[start + 7..];
        if let Some(end) = candidate.find("```") {
            candidate = &candidate[..end];
        }
    } else if let Some(start) = candidate.find("```") {
        candidate = &candidate[start + 3..];
        if let Some(end) = candidate.find("```") {
            candidate = &candidate[..end];
        }
    }
    if let Ok(value) = serde_json::from_str(candidate.trim()) {
        return Ok(value);
    }

    if let (Some(first), Some(last)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if first < last {
            if let Ok(value) = serde_json::from_str(&trimmed[first..=last]) {
                return Ok(value);
            }
        }
    }

    let preview: String = trimmed.chars().take(200).collect();
    Err(format!("no JSON object found in response: {preview}"))
}

/// Turn the model's raw structured output into a validated extraction.
fn assemble_extraction(
    state: &CanonicalState,
    draft: &str,
    turn: u64,
    data: &Value,
) -> Extraction {
    let open_questions: Vec<String> = data
        .get("open_questions")
        .and_then(Value::as_array)
        .map(|questions| {
            questions
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let requires_user_input = !open_questions.is_empty();

    let mut events = Vec::new();
    if let Some(candidates) = data.get("events").and_then(Value::as_array) {
        for raw in candidates {
            let candidate: CandidateEvent = match serde_json::from_value(raw.clone()) {
                Ok(candidate) => candidate,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping unparseable candidate event");
                    continue;
                }
            };
            let event = finish_candidate(state, draft, turn, candidate);
            if let Err(e) = event.validate() {
                tracing::warn!(error = %e, "Dropping invalid candidate event");
                continue;
            }
            events.push(event);
        }
    }

    if events.is_empty() && !requires_user_input {
        events.push(synthetic_other_event(state, turn, draft));
    }

    Extraction {
        events,
        open_questions,
        requires_user_input,
    }
}

/// Assign identity and evidence to a parsed candidate.
fn finish_candidate(
    state: &CanonicalState,
    draft: &str,
    turn: u64,
    candidate: CandidateEvent,
) -> Event {
    let text_span = evidence_span(state, draft, &candidate);

    let mut time = candidate.time;
    if time.label.trim().is_empty() {
        time.label = state.time.calendar.clone();
    }

    Event {
        event_id: new_event_id(turn),
        story_id: state.meta.story_id.clone(),
        turn: candidate.turn,
        time,
        place: candidate.place,
        who: candidate.who,
        kind: candidate.kind,
        summary: candidate.summary,
        state_patch: candidate.state_patch,
        evidence: EventEvidence {
            source: format!("draft_turn_{turn}"),
            text_span,
        },
        created_at: Utc::now(),
    }
}

/// The first draft sentence naming an entity the event is about.
fn evidence_span(state: &CanonicalState, draft: &str, candidate: &CandidateEvent) -> Option<String> {
    let mut names: Vec<String> = Vec::new();
    if let Some(entity_id) = candidate.kind.primary_entity() {
        if let Some(character) = state.entities.characters.get(entity_id) {
            names.push(character.name.clone());
        }
        if let Some(item) = state.entities.items.get(entity_id) {
            names.push(item.name.clone());
        }
    }
    for actor in &candidate.who.actors {
        if let Some(character) = state.entities.characters.get(actor) {
            names.push(character.name.clone());
        }
    }
    if names.is_empty() {
        return None;
    }

    draft
        .split(['.', '!', '?', ';', '\n', '。', '！', '？'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .find(|sentence| {
            let lower = sentence.to_lowercase();
            names.iter().any(|name| lower.contains(&name.to_lowercase()))
        })
        .map(str::to_string)
}

/// The fallback event recorded when a draft yields nothing structured:
/// an `OTHER` event whose patch is a metadata touch on the player, so
/// traceability still holds.
pub fn synthetic_other_event(state: &CanonicalState, turn: u64, draft: &str) -> Event {
    let summary = draft
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.chars().take(120).collect::<String>())
        .unwrap_or_else(|| "The scene continues".to_string());

    let mut updates = Map::new();
    updates.insert("metadata".to_string(), json!({ "last_turn": turn }));

    Event {
        event_id: new_event_id(turn),
        story_id: state.meta.story_id.clone(),
        turn,
        time: state.time.anchor.clone(),
        place: crate::event::EventLocation {
            location_id: state.player.location_id.clone(),
        },
        who: crate::event::EventParticipants {
            actors: vec![state.player.id.clone()],
            witnesses: Vec::new(),
        },
        kind: crate::event::EventKind::Other {},
        summary,
        state_patch: StatePatch::for_entity(EntityKind::Character, &state.player.id, updates),
        evidence: EventEvidence {
            source: format!("draft_turn_{turn}"),
            text_span: None,
        },
        created_at: Utc::now(),
    }
}
