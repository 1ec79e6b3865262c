//! Consistency gate: rule-based validation of pending events and drafts.
//!
//! The gate is a pure function over `(state, draft, events)`. It builds
//! a projected state by folding every pending event's patch onto the
//! current state, evaluates ten domain rules, and maps the collected
//! violations to a disposition: `PASS`, `AUTO_FIX`, `REWRITE`, or
//! `ASK_USER`. The gate itself never fails — a rule that panics is
//! demoted to an internal reason that forces `REWRITE`.

use crate::event::{Event, EventKind};
use crate::manager::apply_patch;
use crate::state::{CanonicalState, Constraint, EntityKind, EntityUpdate, StatePatch};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// The ten consistency rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum RuleId {
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleId::R1 => "R1",
            RuleId::R2 => "R2",
            RuleId::R3 => "R3",
            RuleId::R4 => "R4",
            RuleId::R5 => "R5",
            RuleId::R6 => "R6",
            RuleId::R7 => "R7",
            RuleId::R8 => "R8",
            RuleId::R9 => "R9",
            RuleId::R10 => "R10",
        };
        write!(f, "{name}")
    }
}

/// How bad a violation is. Errors block the turn; warnings may be
/// auto-fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One rule violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: RuleId,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub fixable: bool,
    /// Set when two otherwise-valid events contradict each other
    /// symmetrically, so only the user can pick the canonical outcome.
    #[serde(default)]
    pub ambiguous: bool,
    #[serde(default)]
    pub suggested_fix: Option<EntityUpdate>,
}

impl Violation {
    fn error(rule_id: RuleId, message: impl Into<String>) -> Self {
        Self {
            rule_id,
            severity: Severity::Error,
            message: message.into(),
            entity_id: None,
            fixable: false,
            ambiguous: false,
            suggested_fix: None,
        }
    }

    fn warning(rule_id: RuleId, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule_id, message)
        }
    }

    fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    fn ambiguous(mut self) -> Self {
        self.ambiguous = true;
        self
    }

    fn with_fix(mut self, fix: EntityUpdate) -> Self {
        self.fixable = true;
        self.suggested_fix = Some(fix);
        self
    }
}

/// The gate's disposition for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateAction {
    Pass,
    AutoFix,
    Rewrite,
    AskUser,
}

/// The full result of a gate review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub action: GateAction,
    pub violations: Vec<Violation>,
    /// Merged fix patch, present on `AUTO_FIX`.
    #[serde(default)]
    pub fixes: Option<StatePatch>,
    /// Clarification questions, present on `ASK_USER`.
    #[serde(default)]
    pub questions: Vec<String>,
    /// Rule citations, one per violation, plus internal notes.
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl Verdict {
    /// Human-readable instruction string for a `REWRITE` disposition.
    pub fn rewrite_instructions(&self) -> String {
        format!(
            "The draft conflicts with the canonical state. Rule citations: {}. \
             Rewrite the draft so it honors these facts.",
            self.reasons.join("; ")
        )
    }
}

type RuleFn = fn(&CanonicalState, &CanonicalState, &[Event], Option<&str>) -> Vec<Violation>;

const RULES: [(RuleId, RuleFn); 10] = [
    (RuleId::R1, check_unique_ownership),
    (RuleId::R2, check_item_location),
    (RuleId::R3, check_dead_actors),
    (RuleId::R4, check_explicit_state_change),
    (RuleId::R5, check_travel_required),
    (RuleId::R6, check_single_location),
    (RuleId::R7, check_monotonic_time),
    (RuleId::R8, check_immutable_constraints),
    (RuleId::R9, check_traceability),
    (RuleId::R10, check_draft_fidelity),
];

/// The consistency gate. Stateless; one instance serves every story.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsistencyGate;

impl ConsistencyGate {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate the ten rules over `(state, draft, events)` and decide
    /// the disposition. Never fails; never mutates.
    pub fn review(
        &self,
        state: &CanonicalState,
        draft: Option<&str>,
        events: &[Event],
    ) -> Verdict {
        let projected = events
            .iter()
            .fold(state.clone(), |s, e| apply_patch(&s, &e.state_patch));

        let mut violations = Vec::new();
        let mut internal = Vec::new();

        for (rule_id, rule) in RULES {
            match catch_unwind(AssertUnwindSafe(|| rule(state, &projected, events, draft))) {
                Ok(found) => violations.extend(found),
                Err(_) => {
                    tracing::warn!(rule = %rule_id, "Rule evaluation panicked");
                    internal.push(format!("internal: rule {rule_id} failed to evaluate"));
                }
            }
        }

        determine_action(state, violations, internal)
    }
}

// ============================================================================
// Decision function
// ============================================================================

fn determine_action(
    state: &CanonicalState,
    violations: Vec<Violation>,
    internal: Vec<String>,
) -> Verdict {
    let mut reasons: Vec<String> = violations
        .iter()
        .map(|v| format!("{}: {}", v.rule_id, v.message))
        .collect();
    reasons.extend(internal.iter().cloned());

    let has_internal = !internal.is_empty();
    let errors: Vec<&Violation> = violations
        .iter()
        .filter(|v| v.severity == Severity::Error)
        .collect();
    let warnings: Vec<&Violation> = violations
        .iter()
        .filter(|v| v.severity == Severity::Warning)
        .collect();

    if has_internal || !errors.is_empty() {
        let all_ambiguous = !has_internal
            && !errors.is_empty()
            && errors
                .iter()
                .all(|v| v.ambiguous && matches!(v.rule_id, RuleId::R1 | RuleId::R8));

        if all_ambiguous {
            let questions = errors
                .iter()
                .map(|v| clarification_question(state, v))
                .collect();
            return Verdict {
                action: GateAction::AskUser,
                violations,
                fixes: None,
                questions,
                reasons,
            };
        }

        return Verdict {
            action: GateAction::Rewrite,
            violations,
            fixes: None,
            questions: Vec::new(),
            reasons,
        };
    }

    if !warnings.is_empty() && warnings.iter().all(|v| v.fixable) {
        let fixes = merge_fixes(&violations);
        return Verdict {
            action: GateAction::AutoFix,
            violations,
            fixes,
            questions: Vec::new(),
            reasons,
        };
    }

    Verdict {
        action: GateAction::Pass,
        violations,
        fixes: None,
        questions: Vec::new(),
        reasons,
    }
}

/// Compose the suggested fixes of every violation into one patch.
fn merge_fixes(violations: &[Violation]) -> Option<StatePatch> {
    let mut entity_updates: BTreeMap<String, EntityUpdate> = BTreeMap::new();

    for violation in violations {
        let Some(fix) = &violation.suggested_fix else {
            continue;
        };
        entity_updates
            .entry(fix.entity_id.clone())
            .and_modify(|existing| {
                for (key, value) in &fix.updates {
                    existing.updates.insert(key.clone(), value.clone());
                }
            })
            .or_insert_with(|| fix.clone());
    }

    if entity_updates.is_empty() {
        return None;
    }
    Some(StatePatch {
        entity_updates,
        ..StatePatch::default()
    })
}

fn clarification_question(state: &CanonicalState, violation: &Violation) -> String {
    match violation.rule_id {
        RuleId::R1 => {
            let name = violation
                .entity_id
                .as_deref()
                .map(|id| state.item_name(id))
                .unwrap_or("?");
            format!(
                "Rule R1 violated: unique item '{name}' assigned to multiple owners. \
                 Which is canonical?"
            )
        }
        _ => format!(
            "Rule {} violated: {}. Which outcome is canonical?",
            violation.rule_id, violation.message
        ),
    }
}

// ============================================================================
// Rule helpers
// ============================================================================

fn character_updates<'a>(
    event: &'a Event,
) -> impl Iterator<Item = (&'a String, &'a EntityUpdate)> {
    event
        .state_patch
        .entity_updates
        .iter()
        .filter(|(_, u)| u.entity_type == EntityKind::Character)
}

fn item_updates<'a>(event: &'a Event) -> impl Iterator<Item = (&'a String, &'a EntityUpdate)> {
    event
        .state_patch
        .entity_updates
        .iter()
        .filter(|(_, u)| u.entity_type == EntityKind::Item)
}

/// Check if lowercase `text` contains lowercase `word` at word boundaries.
///
/// A boundary is the start/end of the text or a non-alphanumeric byte,
/// so "Thor" matches in "I ask Thor" but not in "Thorin".
fn contains_word(text: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }

    let text_bytes = text.as_bytes();
    let word_bytes = word.as_bytes();
    if word_bytes.len() > text_bytes.len() {
        return false;
    }

    let mut i = 0;
    while i + word_bytes.len() <= text_bytes.len() {
        if &text_bytes[i..i + word_bytes.len()] == word_bytes {
            let left_ok = i == 0 || !text_bytes[i - 1].is_ascii_alphanumeric();
            let right = i + word_bytes.len();
            let right_ok = right == text_bytes.len() || !text_bytes[right].is_ascii_alphanumeric();
            if left_ok && right_ok {
                return true;
            }
        }
        i += 1;
    }
    false
}

fn split_sentences(text: &str) -> Vec<&str> {
    text.split(['.', '!', '?', ';', '\n', '。', '！', '？'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

// ============================================================================
// R1: a unique item has at most one owner across pending events
// ============================================================================

fn check_unique_ownership(
    state: &CanonicalState,
    _projected: &CanonicalState,
    events: &[Event],
    _draft: Option<&str>,
) -> Vec<Violation> {
    let mut new_owners: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

    for event in events {
        if let EventKind::OwnershipChange {
            item_id,
            new_owner_id: Some(new_owner),
            ..
        } = &event.kind
        {
            if state.is_unique_item(item_id) {
                new_owners
                    .entry(item_id.as_str())
                    .or_default()
                    .insert(new_owner.as_str());
            }
        }

        // Patch-level owner assignments count too, so an OWNERSHIP_CHANGE
        // whose patch disagrees with its payload is caught as well.
        for (item_id, update) in item_updates(event) {
            if !state.is_unique_item(item_id) {
                continue;
            }
            if let Some(owner) = update.updates.get("owner_id").and_then(Value::as_str) {
                new_owners.entry(item_id.as_str()).or_default().insert(owner);
            }
        }
    }

    let mut violations = Vec::new();
    for (item_id, owners) in new_owners {
        if owners.len() > 1 {
            let owner_list: Vec<&str> = owners.into_iter().collect();
            violations.push(
                Violation::error(
                    RuleId::R1,
                    format!(
                        "unique item '{}' ({item_id}) assigned to multiple owners in pending \
                         events: {}",
                        state.item_name(item_id),
                        owner_list.join(", ")
                    ),
                )
                .with_entity(item_id)
                .ambiguous(),
            );
        }
    }
    violations
}

// ============================================================================
// R2: item location matches its owner's location (fixable)
// ============================================================================

fn check_item_location(
    _state: &CanonicalState,
    projected: &CanonicalState,
    _events: &[Event],
    _draft: Option<&str>,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    for (item_id, item) in &projected.entities.items {
        let Some(owner_id) = &item.owner_id else {
            continue;
        };

        let expected = if let Some(owner) = projected.entities.characters.get(owner_id) {
            owner.location_id.clone()
        } else if projected.entities.locations.contains_key(owner_id) {
            Some(owner_id.clone())
        } else {
            None
        };
        let Some(expected) = expected else {
            continue;
        };

        if item.location_id.as_deref() != Some(expected.as_str()) {
            let mut updates = Map::new();
            updates.insert("location_id".to_string(), json!(expected));
            violations.push(
                Violation::warning(
                    RuleId::R2,
                    format!(
                        "item '{}' ({item_id}) is at '{}' but its owner '{owner_id}' is at \
                         '{expected}'",
                        item.name,
                        item.location_id.as_deref().unwrap_or("nowhere"),
                    ),
                )
                .with_entity(item_id)
                .with_fix(EntityUpdate {
                    entity_type: EntityKind::Item,
                    entity_id: item_id.clone(),
                    updates,
                }),
            );
        }
    }
    violations
}

// ============================================================================
// R3: dead characters cannot act, nor be revived without REVIVAL
// ============================================================================

fn check_dead_actors(
    state: &CanonicalState,
    _projected: &CanonicalState,
    events: &[Event],
    _draft: Option<&str>,
) -> Vec<Violation> {
    let dead: BTreeSet<&str> = state
        .entities
        .characters
        .iter()
        .filter(|(_, c)| !c.alive)
        .map(|(id, _)| id.as_str())
        .collect();

    let mut violations = Vec::new();
    for event in events {
        if !matches!(event.kind, EventKind::Death { .. } | EventKind::Revival { .. }) {
            for actor in &event.who.actors {
                if dead.contains(actor.as_str()) {
                    violations.push(
                        Violation::error(
                            RuleId::R3,
                            format!(
                                "dead character '{}' ({actor}) acts in event '{}'",
                                state.character_name(actor),
                                event.summary
                            ),
                        )
                        .with_entity(actor),
                    );
                }
            }
        }

        if !matches!(event.kind, EventKind::Revival { .. }) {
            for (char_id, update) in character_updates(event) {
                if dead.contains(char_id.as_str())
                    && update.updates.get("alive").and_then(Value::as_bool) == Some(true)
                {
                    violations.push(
                        Violation::error(
                            RuleId::R3,
                            format!(
                                "dead character '{}' ({char_id}) set alive without a REVIVAL \
                                 event",
                                state.character_name(char_id)
                            ),
                        )
                        .with_entity(char_id),
                    );
                }
            }
        }
    }
    violations
}

// ============================================================================
// R4: alive/faction changes require the matching event type
// ============================================================================

fn check_explicit_state_change(
    state: &CanonicalState,
    _projected: &CanonicalState,
    events: &[Event],
    _draft: Option<&str>,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    for event in events {
        for (char_id, update) in character_updates(event) {
            let Some(current) = state.entities.characters.get(char_id) else {
                continue;
            };

            if let Some(new_alive) = update.updates.get("alive").and_then(Value::as_bool) {
                if new_alive != current.alive {
                    if !new_alive && !matches!(event.kind, EventKind::Death { .. }) {
                        violations.push(
                            Violation::error(
                                RuleId::R4,
                                format!(
                                    "character '{}' ({char_id}) goes from alive to dead but the \
                                     event type is {}, not DEATH",
                                    current.name,
                                    event.kind.type_name()
                                ),
                            )
                            .with_entity(char_id),
                        );
                    } else if new_alive && !matches!(event.kind, EventKind::Revival { .. }) {
                        violations.push(
                            Violation::error(
                                RuleId::R4,
                                format!(
                                    "character '{}' ({char_id}) goes from dead to alive but the \
                                     event type is {}, not REVIVAL",
                                    current.name,
                                    event.kind.type_name()
                                ),
                            )
                            .with_entity(char_id),
                        );
                    }
                }
            }

            if let Some(new_faction) = update.updates.get("faction_id") {
                let new_faction = new_faction.as_str();
                if new_faction != current.faction_id.as_deref()
                    && !matches!(event.kind, EventKind::FactionChange { .. })
                {
                    violations.push(
                        Violation::error(
                            RuleId::R4,
                            format!(
                                "character '{}' ({char_id}) changes faction from '{}' to '{}' \
                                 but the event type is {}, not FACTION_CHANGE",
                                current.name,
                                current.faction_id.as_deref().unwrap_or("none"),
                                new_faction.unwrap_or("none"),
                                event.kind.type_name()
                            ),
                        )
                        .with_entity(char_id),
                    );
                }
            }
        }
    }
    violations
}

// ============================================================================
// R5: character location changes require a TRAVEL event
// ============================================================================

fn check_travel_required(
    state: &CanonicalState,
    _projected: &CanonicalState,
    events: &[Event],
    _draft: Option<&str>,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    for event in events {
        for (char_id, update) in character_updates(event) {
            let Some(current) = state.entities.characters.get(char_id) else {
                continue;
            };
            let Some(new_location) = update.updates.get("location_id").and_then(Value::as_str)
            else {
                continue;
            };
            if current.location_id.as_deref() == Some(new_location) {
                continue;
            }

            match &event.kind {
                EventKind::Travel { character_id, .. } if character_id == char_id => {}
                EventKind::Travel { character_id, .. } => {
                    violations.push(
                        Violation::error(
                            RuleId::R5,
                            format!(
                                "TRAVEL payload names '{character_id}' but the patch moves \
                                 '{char_id}'"
                            ),
                        )
                        .with_entity(char_id),
                    );
                }
                _ => {
                    let covered = events.iter().any(|other| match &other.kind {
                        EventKind::Travel {
                            character_id,
                            to_location_id,
                            ..
                        } => character_id == char_id && to_location_id.as_str() == new_location,
                        _ => false,
                    });
                    if !covered {
                        violations.push(
                            Violation::error(
                                RuleId::R5,
                                format!(
                                    "character '{}' ({char_id}) moves from '{}' to \
                                     '{new_location}' without a TRAVEL event",
                                    current.name,
                                    current.location_id.as_deref().unwrap_or("nowhere"),
                                ),
                            )
                            .with_entity(char_id),
                        );
                    }
                }
            }
        }
    }
    violations
}

// ============================================================================
// R6: no character in two locations at the same time.order
// ============================================================================

fn check_single_location(
    state: &CanonicalState,
    _projected: &CanonicalState,
    events: &[Event],
    _draft: Option<&str>,
) -> Vec<Violation> {
    let mut by_order: BTreeMap<i64, Vec<&Event>> = BTreeMap::new();
    for event in events {
        by_order.entry(event.time.order).or_default().push(event);
    }

    let mut violations = Vec::new();
    for (order, group) in by_order {
        let mut locations: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for event in &group {
            for (char_id, update) in character_updates(event) {
                if let Some(location) = update.updates.get("location_id").and_then(Value::as_str) {
                    locations.entry(char_id.as_str()).or_default().insert(location);
                }
            }
        }

        // Actors of non-TRAVEL events without a patched location are
        // placed at the event's own location.
        for event in &group {
            if matches!(event.kind, EventKind::Travel { .. }) {
                continue;
            }
            for actor in &event.who.actors {
                locations
                    .entry(actor.as_str())
                    .or_default()
                    .insert(event.place.location_id.as_str());
            }
        }

        for (char_id, places) in locations {
            if places.len() > 1 {
                let place_list: Vec<&str> = places.into_iter().collect();
                violations.push(
                    Violation::error(
                        RuleId::R6,
                        format!(
                            "character '{}' ({char_id}) appears in multiple locations at time \
                             order {order}: {}",
                            state.character_name(char_id),
                            place_list.join(", ")
                        ),
                    )
                    .with_entity(char_id),
                );
            }
        }
    }
    violations
}

// ============================================================================
// R7: time.order is non-decreasing
// ============================================================================

fn check_monotonic_time(
    state: &CanonicalState,
    projected: &CanonicalState,
    events: &[Event],
    _draft: Option<&str>,
) -> Vec<Violation> {
    let current_order = state.time.anchor.order;
    let mut violations = Vec::new();

    for event in events {
        if event.time.order < current_order {
            violations.push(Violation::error(
                RuleId::R7,
                format!(
                    "event '{}' ({}) has time order {} before the current anchor {current_order}",
                    event.summary, event.event_id, event.time.order
                ),
            ));
        }
    }

    // Within the same turn, the given event sequence must not rewind.
    for (i, earlier) in events.iter().enumerate() {
        for later in &events[i + 1..] {
            if earlier.turn == later.turn && earlier.time.order > later.time.order {
                violations.push(Violation::error(
                    RuleId::R7,
                    format!(
                        "within turn {}, event '{}' (order {}) precedes event '{}' (order {})",
                        earlier.turn,
                        earlier.summary,
                        earlier.time.order,
                        later.summary,
                        later.time.order
                    ),
                ));
                break;
            }
        }
    }

    if projected.time.anchor.order < current_order {
        violations.push(Violation::error(
            RuleId::R7,
            format!(
                "projected anchor order {} rewinds the current anchor {current_order}",
                projected.time.anchor.order
            ),
        ));
    }

    violations
}

// ============================================================================
// R8: immutable constraints hold in the projected state
// ============================================================================

fn check_immutable_constraints(
    state: &CanonicalState,
    projected: &CanonicalState,
    events: &[Event],
    _draft: Option<&str>,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    for event in events {
        if state.constraints.immutable_events.contains(&event.event_id) {
            violations.push(Violation::error(
                RuleId::R8,
                format!(
                    "event '{}' is recorded as immutable history and cannot be re-issued",
                    event.event_id
                ),
            ));
        }
    }

    let touches = |entity_id: &str| {
        events
            .iter()
            .filter(|e| e.state_patch.entity_updates.contains_key(entity_id))
            .count()
    };

    for constraint in &state.constraints.constraints {
        match constraint {
            Constraint::EntityState { entity_id, value } => {
                let Some(actual) = projected_entity_fields(projected, entity_id) else {
                    continue;
                };
                for (field, expected) in value {
                    let found = actual.get(field).cloned().unwrap_or(Value::Null);
                    if &found != expected {
                        let mut violation = Violation::error(
                            RuleId::R8,
                            format!(
                                "constraint on '{entity_id}' requires {field} = {expected}, \
                                 projected state has {found}"
                            ),
                        )
                        .with_entity(entity_id);
                        if touches(entity_id) >= 2 {
                            violation = violation.ambiguous();
                        }
                        violations.push(violation);
                    }
                }
            }
            Constraint::Relationship {
                subject,
                object,
                kind,
            } => {
                let Some(character) = projected.entities.characters.get(subject) else {
                    continue;
                };
                let holds = if projected.entities.factions.contains_key(object) {
                    character.faction_id.as_deref() == Some(object)
                } else if let Some(relationships) = character
                    .metadata
                    .get("relationships")
                    .and_then(Value::as_object)
                {
                    relationships.get(object).and_then(Value::as_str) == Some(kind)
                } else {
                    true
                };
                if !holds {
                    violations.push(
                        Violation::error(
                            RuleId::R8,
                            format!(
                                "relationship constraint '{subject} {kind} {object}' no longer \
                                 holds in the projected state"
                            ),
                        )
                        .with_entity(subject),
                    );
                }
            }
            Constraint::UniqueItem { item_id } => {
                if let Some(item) = projected.entities.items.get(item_id) {
                    if !item.unique || item.owner_id.is_none() {
                        violations.push(
                            Violation::error(
                                RuleId::R8,
                                format!(
                                    "unique item constraint on '{}' ({item_id}) broken: the item \
                                     must stay unique with a single owner",
                                    item.name
                                ),
                            )
                            .with_entity(item_id),
                        );
                    }
                }
            }
        }
    }

    violations
}

fn projected_entity_fields(state: &CanonicalState, entity_id: &str) -> Option<Map<String, Value>> {
    let value = if let Some(c) = state.entities.characters.get(entity_id) {
        serde_json::to_value(c)
    } else if let Some(i) = state.entities.items.get(entity_id) {
        serde_json::to_value(i)
    } else if let Some(l) = state.entities.locations.get(entity_id) {
        serde_json::to_value(l)
    } else if let Some(f) = state.entities.factions.get(entity_id) {
        serde_json::to_value(f)
    } else {
        return None;
    };

    match value {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

// ============================================================================
// R9: faction/relationship changes are traceable
// ============================================================================

fn check_traceability(
    state: &CanonicalState,
    _projected: &CanonicalState,
    events: &[Event],
    _draft: Option<&str>,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    for event in events {
        for (char_id, update) in character_updates(event) {
            if update.updates.contains_key("faction_id") {
                if let EventKind::FactionChange { character_id, .. } = &event.kind {
                    if character_id != char_id {
                        violations.push(
                            Violation::error(
                                RuleId::R9,
                                format!(
                                    "FACTION_CHANGE payload names '{character_id}' but the patch \
                                     changes '{char_id}'"
                                ),
                            )
                            .with_entity(char_id),
                        );
                    }
                }
            }

            let has_relationship_changes = update
                .updates
                .get("metadata")
                .and_then(Value::as_object)
                .map(|m| m.contains_key("relationship_changes"))
                .unwrap_or(false);
            if has_relationship_changes
                && !matches!(event.kind, EventKind::RelationshipChange { .. })
            {
                violations.push(
                    Violation::error(
                        RuleId::R9,
                        format!(
                            "relationship change on '{}' ({char_id}) without a \
                             RELATIONSHIP_CHANGE event",
                            state.character_name(char_id)
                        ),
                    )
                    .with_entity(char_id),
                );
            }
        }
    }
    violations
}

// ============================================================================
// R10: draft prose is faithful to canonical facts
// ============================================================================

const DEATH_PATTERNS: &[&str] = &[
    "is dead",
    "died",
    "dies",
    "was killed",
    "was slain",
    "lies dead",
    "passed away",
    "breathed his last",
    "breathed her last",
];

const LIVING_PATTERNS: &[&str] = &[
    "says",
    "said",
    "speaks",
    "shouts",
    "whispers",
    "replies",
    "laughs",
    "smiles",
    "walks",
    "rides",
    "strides",
    "attacks",
    "rises",
    "is alive",
];

const PLACEMENT_PATTERNS: &[&str] = &[
    "is at",
    "is in",
    "stands in",
    "stands at",
    "waits in",
    "waits at",
    "arrives at",
    "arrives in",
    "arrived at",
    "arrived in",
    "reaches",
    "sits in",
    "sits at",
];

/// Deliberately coarse: substring patterns over sentence splits. False
/// positives degrade to REWRITE, never to silent acceptance. Facts are
/// checked against the projected state, so a draft narrating this very
/// turn's DEATH or TRAVEL does not flag itself.
fn check_draft_fidelity(
    _state: &CanonicalState,
    projected: &CanonicalState,
    _events: &[Event],
    draft: Option<&str>,
) -> Vec<Violation> {
    let Some(draft) = draft else {
        return Vec::new();
    };

    let mut violations = Vec::new();
    for sentence in split_sentences(draft) {
        let lower = sentence.to_lowercase();

        for (char_id, character) in &projected.entities.characters {
            if !contains_word(&lower, &character.name.to_lowercase()) {
                continue;
            }

            if character.alive {
                if DEATH_PATTERNS.iter().any(|p| lower.contains(p)) {
                    violations.push(
                        Violation::error(
                            RuleId::R10,
                            format!(
                                "draft describes '{}' ({char_id}) as dead but the canonical \
                                 state has them alive",
                                character.name
                            ),
                        )
                        .with_entity(char_id),
                    );
                    continue;
                }
            } else if LIVING_PATTERNS.iter().any(|p| lower.contains(p)) {
                violations.push(
                    Violation::error(
                        RuleId::R10,
                        format!(
                            "draft has dead character '{}' ({char_id}) acting or speaking",
                            character.name
                        ),
                    )
                    .with_entity(char_id),
                );
                continue;
            }

            let Some(current_location) = &character.location_id else {
                continue;
            };
            for (location_id, location) in &projected.entities.locations {
                if location_id == current_location {
                    continue;
                }
                if contains_word(&lower, &location.name.to_lowercase())
                    && PLACEMENT_PATTERNS.iter().any(|p| lower.contains(p))
                {
                    let current_name = projected
                        .entities
                        .locations
                        .get(current_location)
                        .map(|l| l.name.as_str())
                        .unwrap_or(current_location);
                    violations.push(
                        Violation::error(
                            RuleId::R10,
                            format!(
                                "draft places '{}' ({char_id}) at '{}' but the canonical state \
                                 has them at '{current_name}'",
                                character.name, location.name
                            ),
                        )
                        .with_entity(char_id),
                    );
                    break;
                }
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{new_event_id, EventEvidence, EventLocation, EventParticipants};
    use crate::state::{Character, Item, StatePatch, TimeAnchor};
    use chrono::Utc;

    fn state_with_world() -> CanonicalState {
        let mut state = CanonicalState::scaffold("s");
        for (id, name) in [("luoyang", "Luoyang"), ("xuchang", "Xuchang")] {
            state.entities.locations.insert(
                id.to_string(),
                crate::state::Location {
                    id: id.to_string(),
                    name: name.to_string(),
                    metadata: Map::new(),
                },
            );
        }
        for (id, name, alive, location) in [
            ("caocao", "Cao Cao", true, "xuchang"),
            ("zhangfei", "Zhang Fei", true, "luoyang"),
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
        state.entities.items.insert(
            "sword_001".to_string(),
            Item {
                id: "sword_001".to_string(),
                name: "Qinggang Sword".to_string(),
                unique: true,
                owner_id: Some("caocao".to_string()),
                location_id: Some("xuchang".to_string()),
                metadata: Map::new(),
            },
        );
        state.time.anchor.order = 10;
        state
    }

    fn event(kind: EventKind, order: i64, patch: StatePatch) -> Event {
        Event {
            event_id: new_event_id(1),
            story_id: "s".to_string(),
            turn: 1,
            time: TimeAnchor {
                label: "Spring".to_string(),
                order,
            },
            place: EventLocation {
                location_id: "luoyang".to_string(),
            },
            who: EventParticipants::default(),
            kind,
            summary: "test event".to_string(),
            state_patch: patch,
            evidence: EventEvidence {
                source: "draft_turn_1".to_string(),
                text_span: None,
            },
            created_at: Utc::now(),
        }
    }

    fn char_patch(id: &str, field: &str, value: Value) -> StatePatch {
        let mut updates = Map::new();
        updates.insert(field.to_string(), value);
        StatePatch::for_entity(EntityKind::Character, id, updates)
    }

    fn item_patch(id: &str, field: &str, value: Value) -> StatePatch {
        let mut updates = Map::new();
        updates.insert(field.to_string(), value);
        StatePatch::for_entity(EntityKind::Item, id, updates)
    }

    #[test]
    fn test_empty_events_pass() {
        let gate = ConsistencyGate::new();
        let verdict = gate.review(&state_with_world(), None, &[]);
        assert_eq!(verdict.action, GateAction::Pass);
        assert!(verdict.violations.is_empty());
    }

    #[test]
    fn test_r2_suggests_location_fix() {
        let state = state_with_world();
        // Hand the sword to Zhang Fei (in Luoyang) but leave it in Xuchang.
        let e = event(
            EventKind::OwnershipChange {
                item_id: "sword_001".to_string(),
                old_owner_id: Some("caocao".to_string()),
                new_owner_id: Some("zhangfei".to_string()),
            },
            11,
            item_patch("sword_001", "owner_id", json!("zhangfei")),
        );

        let verdict = ConsistencyGate::new().review(&state, None, &[e]);
        assert_eq!(verdict.action, GateAction::AutoFix);

        let fixes = verdict.fixes.expect("fix patch");
        assert_eq!(
            fixes.entity_updates["sword_001"].updates["location_id"],
            json!("luoyang")
        );
    }

    #[test]
    fn test_r3_dead_actor() {
        let state = state_with_world();
        let mut e = event(
            EventKind::Other {},
            11,
            char_patch("caocao", "metadata", json!({"mood": "wary"})),
        );
        e.who.actors.push("lubu".to_string());

        let verdict = ConsistencyGate::new().review(&state, None, &[e]);
        assert_eq!(verdict.action, GateAction::Rewrite);
        assert!(verdict
            .violations
            .iter()
            .any(|v| v.rule_id == RuleId::R3 && v.entity_id.as_deref() == Some("lubu")));
    }

    #[test]
    fn test_r3_revival_requires_revival_event() {
        let state = state_with_world();
        let e = event(
            EventKind::Other {},
            11,
            char_patch("lubu", "alive", json!(true)),
        );
        let verdict = ConsistencyGate::new().review(&state, None, &[e]);
        assert_eq!(verdict.action, GateAction::Rewrite);
        assert!(verdict.violations.iter().any(|v| v.rule_id == RuleId::R3));
    }

    #[test]
    fn test_r4_faction_change_needs_event_type() {
        let state = state_with_world();
        let e = event(
            EventKind::Other {},
            11,
            char_patch("caocao", "faction_id", json!("wei")),
        );
        let verdict = ConsistencyGate::new().review(&state, None, &[e]);
        assert!(verdict.violations.iter().any(|v| v.rule_id == RuleId::R4));
    }

    #[test]
    fn test_r4_death_event_passes() {
        let state = state_with_world();
        let e = event(
            EventKind::Death {
                character_id: "zhangfei".to_string(),
            },
            11,
            char_patch("zhangfei", "alive", json!(false)),
        );
        let verdict = ConsistencyGate::new().review(&state, None, &[e]);
        assert_eq!(verdict.action, GateAction::Pass);
    }

    #[test]
    fn test_r5_travel_payload_mismatch() {
        let state = state_with_world();
        let e = event(
            EventKind::Travel {
                character_id: "caocao".to_string(),
                from_location_id: "luoyang".to_string(),
                to_location_id: "xuchang".to_string(),
            },
            11,
            char_patch("zhangfei", "location_id", json!("xuchang")),
        );
        let verdict = ConsistencyGate::new().review(&state, None, &[e]);
        assert!(verdict.violations.iter().any(|v| v.rule_id == RuleId::R5));
    }

    #[test]
    fn test_r6_two_locations_same_order() {
        let state = state_with_world();
        let a = event(
            EventKind::Travel {
                character_id: "zhangfei".to_string(),
                from_location_id: "luoyang".to_string(),
                to_location_id: "xuchang".to_string(),
            },
            11,
            char_patch("zhangfei", "location_id", json!("xuchang")),
        );
        let b = event(
            EventKind::Travel {
                character_id: "zhangfei".to_string(),
                from_location_id: "luoyang".to_string(),
                to_location_id: "luoyang".to_string(),
            },
            11,
            char_patch("zhangfei", "location_id", json!("luoyang")),
        );
        let verdict = ConsistencyGate::new().review(&state, None, &[a, b]);
        assert!(verdict.violations.iter().any(|v| v.rule_id == RuleId::R6));
    }

    #[test]
    fn test_r7_same_turn_rewind() {
        let state = state_with_world();
        let first = event(
            EventKind::Other {},
            13,
            char_patch("caocao", "metadata", json!({"scene": 1})),
        );
        let second = event(
            EventKind::Other {},
            12,
            char_patch("zhangfei", "metadata", json!({"scene": 2})),
        );
        let verdict = ConsistencyGate::new().review(&state, None, &[first, second]);
        assert_eq!(verdict.action, GateAction::Rewrite);
        assert!(verdict.violations.iter().any(|v| v.rule_id == RuleId::R7));
    }

    #[test]
    fn test_r8_entity_state_constraint() {
        let mut state = state_with_world();
        let mut value = Map::new();
        value.insert("alive".to_string(), json!(false));
        state.constraints.constraints.push(Constraint::EntityState {
            entity_id: "lubu".to_string(),
            value,
        });

        // A REVIVAL event legitimizes the alive flip past R3/R4, but the
        // immutable constraint still pins Lu Bu dead.
        let e = event(
            EventKind::Revival {
                character_id: "lubu".to_string(),
            },
            11,
            char_patch("lubu", "alive", json!(true)),
        );
        let verdict = ConsistencyGate::new().review(&state, None, &[e]);
        assert_eq!(verdict.action, GateAction::Rewrite);
        assert!(verdict.violations.iter().any(|v| v.rule_id == RuleId::R8));
    }

    #[test]
    fn test_r8_symmetric_contradiction_asks_user() {
        let mut state = state_with_world();
        let mut value = Map::new();
        value.insert("alive".to_string(), json!(false));
        state.constraints.constraints.push(Constraint::EntityState {
            entity_id: "lubu".to_string(),
            value,
        });

        let a = event(
            EventKind::Revival {
                character_id: "lubu".to_string(),
            },
            11,
            char_patch("lubu", "alive", json!(true)),
        );
        let b = event(
            EventKind::Revival {
                character_id: "lubu".to_string(),
            },
            12,
            char_patch("lubu", "metadata", json!({"manner": "ritual"})),
        );
        let verdict = ConsistencyGate::new().review(&state, None, &[a, b]);
        assert_eq!(verdict.action, GateAction::AskUser);
        assert!(!verdict.questions.is_empty());
    }

    #[test]
    fn test_r8_immutable_event_id() {
        let mut state = state_with_world();
        let e = event(
            EventKind::Other {},
            11,
            char_patch("caocao", "metadata", json!({"x": 1})),
        );
        state
            .constraints
            .immutable_events
            .insert(e.event_id.clone());

        let verdict = ConsistencyGate::new().review(&state, None, &[e]);
        assert_eq!(verdict.action, GateAction::Rewrite);
    }

    #[test]
    fn test_r9_relationship_changes_need_event() {
        let state = state_with_world();
        let e = event(
            EventKind::Other {},
            11,
            char_patch(
                "caocao",
                "metadata",
                json!({"relationship_changes": [{"toward": "zhangfei", "now": "rival"}]}),
            ),
        );
        let verdict = ConsistencyGate::new().review(&state, None, &[e]);
        assert!(verdict.violations.iter().any(|v| v.rule_id == RuleId::R9));
    }

    #[test]
    fn test_r10_draft_contradicts_alive() {
        let state = state_with_world();
        let draft = "Zhang Fei is dead, his banner trampled in the mud.";
        let verdict = ConsistencyGate::new().review(&state, Some(draft), &[]);
        assert_eq!(verdict.action, GateAction::Rewrite);
        assert!(verdict
            .violations
            .iter()
            .any(|v| v.rule_id == RuleId::R10 && v.entity_id.as_deref() == Some("zhangfei")));
    }

    #[test]
    fn test_r10_dead_character_speaking() {
        let state = state_with_world();
        let draft = "Lu Bu laughs and says the city will fall by dawn.";
        let verdict = ConsistencyGate::new().review(&state, Some(draft), &[]);
        assert!(verdict.violations.iter().any(|v| v.rule_id == RuleId::R10));
    }

    #[test]
    fn test_r10_respects_projection() {
        // A draft narrating this turn's DEATH must not flag itself: the
        // projected state already has the character dead.
        let state = state_with_world();
        let e = event(
            EventKind::Death {
                character_id: "zhangfei".to_string(),
            },
            11,
            char_patch("zhangfei", "alive", json!(false)),
        );
        let draft = "Zhang Fei died at the river crossing.";
        let verdict = ConsistencyGate::new().review(&state, Some(draft), &[e]);
        assert_eq!(verdict.action, GateAction::Pass);
    }

    #[test]
    fn test_r10_location_mismatch() {
        let state = state_with_world();
        let draft = "Cao Cao stands in Luoyang, surveying the ruined gates.";
        let verdict = ConsistencyGate::new().review(&state, Some(draft), &[]);
        assert!(verdict.violations.iter().any(|v| v.rule_id == RuleId::R10));
    }

    #[test]
    fn test_error_beats_fixable_warning() {
        let state = state_with_world();
        // One patch strands the sword with a faraway owner (R2 warning)
        // while another teleports Cao Cao (R5 error): the error wins.
        let mut updates = Map::new();
        updates.insert("location_id".to_string(), json!("luoyang"));
        let mut patch = StatePatch::for_entity(EntityKind::Character, "caocao", updates);
        let mut item = Map::new();
        item.insert("owner_id".to_string(), json!("zhangfei"));
        patch.entity_updates.insert(
            "sword_001".to_string(),
            EntityUpdate {
                entity_type: EntityKind::Item,
                entity_id: "sword_001".to_string(),
                updates: item,
            },
        );
        let e = event(EventKind::Other {}, 11, patch);

        let verdict = ConsistencyGate::new().review(&state, None, &[e]);
        assert_eq!(verdict.action, GateAction::Rewrite);
        assert!(verdict
            .violations
            .iter()
            .any(|v| v.rule_id == RuleId::R2 && v.severity == Severity::Warning));
        assert!(verdict
            .violations
            .iter()
            .any(|v| v.rule_id == RuleId::R5 && v.severity == Severity::Error));
    }

    #[test]
    fn test_contains_word_boundaries() {
        assert!(contains_word("i ask thor about it", "thor"));
        assert!(!contains_word("i ask thorin about it", "thor"));
        assert!(contains_word("thor, god of thunder", "thor"));
        assert!(contains_word("old tom waits", "old tom"));
        assert!(!contains_word("text", ""));
    }
}
