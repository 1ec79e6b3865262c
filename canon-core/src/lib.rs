//! Narrative consistency engine for LLM-driven interactive fiction.
//!
//! This crate provides:
//! - A canonical world state with strong referential invariants
//! - An append-only, durably stored event log
//! - An LLM-backed extractor turning narrative drafts into structured events
//! - A ten-rule consistency gate deciding PASS / AUTO_FIX / REWRITE / ASK_USER
//! - Atomic, per-story-serialized state application
//!
//! # Quick Start
//!
//! ```ignore
//! use canon_core::{EngineConfig, ProcessDraftRequest, StorySession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_env()?;
//!     let session = StorySession::new(config).await?;
//!
//!     let response = session
//!         .process_draft(&ProcessDraftRequest {
//!             story_id: "sanguo_yanyi".to_string(),
//!             user_message: "I ask Cao Cao for the sword.".to_string(),
//!             assistant_draft: "Cao Cao hands you the Qinggang Sword.".to_string(),
//!         })
//!         .await?;
//!
//!     println!("{:?}", response.final_action);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod event;
pub mod extractor;
pub mod gate;
pub mod manager;
pub mod session;
pub mod state;
pub mod store;
pub mod testing;

// Primary public API
pub use api::{ProcessDraftRequest, ProcessDraftResponse, RagQueryRequest, RagQueryResponse};
pub use config::{ConfigError, EngineConfig};
pub use event::{Event, EventKind};
pub use extractor::{DraftExtractor, EventExtractor, ExtractError, Extraction};
pub use gate::{ConsistencyGate, GateAction, RuleId, Verdict, Violation};
pub use manager::{apply_patch, ApplyError, StateManager};
pub use session::{SessionError, StorySession};
pub use state::{CanonicalState, StatePatch};
pub use store::{StateStore, StoreError};
