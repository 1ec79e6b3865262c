//! QA tests for the consistency gate: the seed scenarios every build
//! must keep passing, plus boundary behaviors around empty worlds.

use canon_core::gate::{ConsistencyGate, GateAction, RuleId};
use canon_core::state::{CanonicalState, EntityKind};
use canon_core::testing::{field_update, sample_state, EventBuilder};
use canon_core::EventKind;
use serde_json::json;

// =============================================================================
// Seed 1: ownership gift
// =============================================================================

#[test]
fn test_ownership_gift_passes() {
    let state = sample_state("s");
    let mut patch = field_update(EntityKind::Item, "sword_001", "owner_id", json!("player_001"));
    patch
        .entity_updates
        .get_mut("sword_001")
        .unwrap()
        .updates
        .insert("location_id".to_string(), json!("luoyang"));

    let event = EventBuilder::new("s", 1)
        .kind(EventKind::OwnershipChange {
            item_id: "sword_001".to_string(),
            old_owner_id: Some("caocao".to_string()),
            new_owner_id: Some("player_001".to_string()),
        })
        .actor("caocao")
        .actor("player_001")
        .at("luoyang")
        .summary("Cao Cao gives the sword to the player")
        .patch(patch)
        .build();

    let verdict = ConsistencyGate::new().review(&state, None, &[event]);
    assert_eq!(verdict.action, GateAction::Pass);
    assert!(verdict.violations.is_empty());
}

#[test]
fn test_ownership_gift_with_stale_location_is_fixable() {
    // Same gift, but the patch forgets to move the sword: R2 fires as a
    // fixable warning and the gate proposes the owner's location.
    let state = sample_state("s");
    let patch = field_update(EntityKind::Item, "sword_001", "owner_id", json!("player_001"));

    let event = EventBuilder::new("s", 1)
        .kind(EventKind::OwnershipChange {
            item_id: "sword_001".to_string(),
            old_owner_id: Some("caocao".to_string()),
            new_owner_id: Some("player_001".to_string()),
        })
        .at("luoyang")
        .summary("Cao Cao gives the sword to the player")
        .patch(patch)
        .build();

    let verdict = ConsistencyGate::new().review(&state, None, &[event]);
    assert_eq!(verdict.action, GateAction::AutoFix);

    let fixes = verdict.fixes.expect("merged fix patch");
    assert_eq!(
        fixes.entity_updates["sword_001"].updates["location_id"],
        json!("luoyang")
    );
}

// =============================================================================
// Seed 2: R1 clash on a unique item
// =============================================================================

#[test]
fn test_unique_item_clash_asks_user() {
    let state = sample_state("s");

    let to_zhangfei = EventBuilder::new("s", 1)
        .kind(EventKind::OwnershipChange {
            item_id: "seal_001".to_string(),
            old_owner_id: Some("caocao".to_string()),
            new_owner_id: Some("zhangfei".to_string()),
        })
        .order(11)
        .summary("The seal goes to Zhang Fei")
        .patch(field_update(
            EntityKind::Item,
            "seal_001",
            "owner_id",
            json!("zhangfei"),
        ))
        .build();

    let to_yuanshao = EventBuilder::new("s", 1)
        .kind(EventKind::OwnershipChange {
            item_id: "seal_001".to_string(),
            old_owner_id: Some("caocao".to_string()),
            new_owner_id: Some("yuanshao".to_string()),
        })
        .order(12)
        .summary("The seal goes to Yuan Shao")
        .patch(field_update(
            EntityKind::Item,
            "seal_001",
            "owner_id",
            json!("yuanshao"),
        ))
        .build();

    let verdict = ConsistencyGate::new().review(&state, None, &[to_zhangfei, to_yuanshao]);
    assert_eq!(verdict.action, GateAction::AskUser);
    assert!(verdict
        .violations
        .iter()
        .any(|v| v.rule_id == RuleId::R1 && v.entity_id.as_deref() == Some("seal_001")));

    // The generated question names the item.
    assert!(verdict.questions.iter().any(|q| q.contains("Imperial Seal")));
}

// =============================================================================
// Seed 3: R5 teleport
// =============================================================================

#[test]
fn test_teleport_without_travel_rewrites() {
    let state = sample_state("s");
    let event = EventBuilder::new("s", 1)
        .summary("Zhang Fei is suddenly elsewhere")
        .patch(field_update(
            EntityKind::Character,
            "zhangfei",
            "location_id",
            json!("xuchang"),
        ))
        .build();

    let verdict = ConsistencyGate::new().review(&state, None, &[event]);
    assert_eq!(verdict.action, GateAction::Rewrite);
    assert!(verdict
        .violations
        .iter()
        .any(|v| v.rule_id == RuleId::R5 && v.entity_id.as_deref() == Some("zhangfei")));
}

// =============================================================================
// Seed 4: R3 posthumous action
// =============================================================================

#[test]
fn test_dead_actor_rewrites() {
    let state = sample_state("s");
    let event = EventBuilder::new("s", 1)
        .actor("lubu")
        .summary("Lu Bu issues a challenge")
        .patch(field_update(
            EntityKind::Character,
            "lubu",
            "metadata",
            json!({"last_seen": "gate"}),
        ))
        .build();

    let verdict = ConsistencyGate::new().review(&state, None, &[event]);
    assert_eq!(verdict.action, GateAction::Rewrite);
    assert!(verdict.violations.iter().any(|v| v.rule_id == RuleId::R3));
}

// =============================================================================
// Seed 5: R7 rewind
// =============================================================================

#[test]
fn test_time_rewind_rewrites() {
    let state = sample_state("s"); // anchor order is 10
    let event = EventBuilder::new("s", 1)
        .order(5)
        .summary("A remembered spring")
        .patch(field_update(
            EntityKind::Character,
            "caocao",
            "metadata",
            json!({"mood": "wistful"}),
        ))
        .build();

    let verdict = ConsistencyGate::new().review(&state, None, &[event]);
    assert_eq!(verdict.action, GateAction::Rewrite);
    assert!(verdict.violations.iter().any(|v| v.rule_id == RuleId::R7));
}

// =============================================================================
// Seed 6: happy-path death (gate level)
// =============================================================================

#[test]
fn test_death_event_passes_gate() {
    let state = sample_state("s");
    let event = EventBuilder::new("s", 1)
        .kind(EventKind::Death {
            character_id: "yuanshao".to_string(),
        })
        .summary("Yuan Shao succumbs to illness")
        .patch(field_update(
            EntityKind::Character,
            "yuanshao",
            "alive",
            json!(false),
        ))
        .build();

    let verdict = ConsistencyGate::new().review(&state, None, &[event]);
    assert_eq!(verdict.action, GateAction::Pass);
}

// =============================================================================
// Boundary behaviors
// =============================================================================

#[test]
fn test_empty_world_degenerates_to_pass() {
    // With zero characters and items, R2-R6 have nothing to check.
    let state = CanonicalState::scaffold("empty");
    let event = EventBuilder::new("empty", 1)
        .order(0)
        .at("unknown")
        .summary("The story begins")
        .patch(field_update(
            EntityKind::Character,
            "player_001",
            "metadata",
            json!({"last_turn": 1}),
        ))
        .build();

    let verdict = ConsistencyGate::new().review(&state, Some("The story begins."), &[event]);
    assert_eq!(verdict.action, GateAction::Pass);
}

#[test]
fn test_fresh_anchor_accepts_any_nonnegative_order() {
    let state = CanonicalState::scaffold("fresh"); // anchor order 0
    for order in [0, 1, 100] {
        let event = EventBuilder::new("fresh", 1)
            .order(order)
            .at("unknown")
            .patch(field_update(
                EntityKind::Character,
                "player_001",
                "metadata",
                json!({"seen": order}),
            ))
            .build();
        let verdict = ConsistencyGate::new().review(&state, None, &[event]);
        assert_eq!(verdict.action, GateAction::Pass, "order {order} should pass");
    }
}

#[test]
fn test_travel_with_matching_payload_passes() {
    let state = sample_state("s");
    let mut patch = field_update(
        EntityKind::Character,
        "zhangfei",
        "location_id",
        json!("xuchang"),
    );
    patch
        .entity_updates
        .get_mut("zhangfei")
        .unwrap()
        .updates
        .insert("metadata".to_string(), json!({"mount": "horse"}));

    let event = EventBuilder::new("s", 1)
        .kind(EventKind::Travel {
            character_id: "zhangfei".to_string(),
            from_location_id: "luoyang".to_string(),
            to_location_id: "xuchang".to_string(),
        })
        .at("xuchang")
        .summary("Zhang Fei rides to Xuchang")
        .patch(patch)
        .build();

    let verdict = ConsistencyGate::new().review(&state, None, &[event]);
    assert_eq!(verdict.action, GateAction::Pass);
}
