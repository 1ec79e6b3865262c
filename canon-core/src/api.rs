//! Request/response contracts exposed to the external HTTP surface.
//!
//! The HTTP server itself lives outside this crate; these are the
//! serializable shapes it exchanges with the core. The RAG query pair
//! is delegated to the external retrieval collaborator.

use crate::event::Event;
use crate::gate::{GateAction, Violation};
use crate::state::CanonicalState;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `POST /draft/process` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDraftRequest {
    pub story_id: String,
    pub user_message: String,
    pub assistant_draft: String,
}

/// `POST /draft/process` response body. Gate dispositions are part of
/// the successful response, never wire errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDraftResponse {
    pub final_action: GateAction,
    /// Updated state, present on PASS / AUTO_FIX.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<CanonicalState>,
    /// Recent committed events, present on PASS / AUTO_FIX.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_events: Option<Vec<Event>>,
    /// Violations, present on REWRITE and (for observability) AUTO_FIX.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violations: Option<Vec<Violation>>,
    /// Human-readable instruction string, present on REWRITE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_instructions: Option<String>,
    /// Clarification questions, present on ASK_USER.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub questions: Option<Vec<String>>,
}

impl ProcessDraftResponse {
    pub fn pass(state: CanonicalState, recent_events: Vec<Event>) -> Self {
        Self {
            final_action: GateAction::Pass,
            state: Some(state),
            recent_events: Some(recent_events),
            violations: None,
            rewrite_instructions: None,
            questions: None,
        }
    }

    pub fn auto_fix(
        state: CanonicalState,
        recent_events: Vec<Event>,
        violations: Vec<Violation>,
    ) -> Self {
        Self {
            final_action: GateAction::AutoFix,
            state: Some(state),
            recent_events: Some(recent_events),
            violations: Some(violations),
            rewrite_instructions: None,
            questions: None,
        }
    }

    pub fn rewrite(instructions: String, violations: Vec<Violation>) -> Self {
        Self {
            final_action: GateAction::Rewrite,
            state: None,
            recent_events: None,
            violations: Some(violations),
            rewrite_instructions: Some(instructions),
            questions: None,
        }
    }

    pub fn ask_user(questions: Vec<String>) -> Self {
        Self {
            final_action: GateAction::AskUser,
            state: None,
            recent_events: None,
            violations: None,
            rewrite_instructions: None,
            questions: Some(questions),
        }
    }
}

/// `POST /rag/query` request body (handled by the retrieval collaborator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagQueryRequest {
    pub story_id: String,
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
}

fn default_top_k() -> u32 {
    5
}

/// One retrieval hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagHit {
    pub text: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// `POST /rag/query` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagQueryResponse {
    pub query: String,
    #[serde(default)]
    pub results: Vec<RagHit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_action_wire_names() {
        let response = ProcessDraftResponse::ask_user(vec!["Which owner?".to_string()]);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["final_action"], "ASK_USER");
        // Absent branches stay off the wire.
        assert!(value.get("state").is_none());
        assert!(value.get("rewrite_instructions").is_none());
    }

    #[test]
    fn test_rewrite_response_shape() {
        let response =
            ProcessDraftResponse::rewrite("Fix R5 and regenerate.".to_string(), Vec::new());
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["final_action"], "REWRITE");
        assert_eq!(value["rewrite_instructions"], "Fix R5 and regenerate.");
    }

    #[test]
    fn test_rag_request_default_top_k() {
        let request: RagQueryRequest =
            serde_json::from_str(r#"{"story_id": "s", "query": "the battle of Guandu"}"#).unwrap();
        assert_eq!(request.top_k, 5);
    }
}
