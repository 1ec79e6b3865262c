//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default turn budget in seconds.
pub const DEFAULT_TURN_TIMEOUT_SECONDS: u64 = 30;

/// Default number of whole-call extractor retries.
pub const DEFAULT_EXTRACTOR_RETRIES: u32 = 1;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("LLM_API_KEY is not set")]
    MissingApiKey,

    #[error("invalid value '{value}' for {name}")]
    InvalidValue { name: &'static str, value: String },
}

/// Configuration for a [`StorySession`](crate::session::StorySession).
///
/// Constructed once and threaded through components; there are no
/// process-wide singletons.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where the SQLite store lives.
    pub db_path: PathBuf,

    /// API key for the text model (required).
    pub llm_api_key: String,

    /// Base URL of an OpenAI-compatible gateway; `None` uses the
    /// client's default.
    pub llm_base_url: Option<String>,

    /// Model name; `None` uses the client's default.
    pub llm_model: Option<String>,

    /// Where the external retrieval collaborator keeps its indexes.
    pub rag_index_base_dir: Option<PathBuf>,

    /// Story used when a caller does not name one.
    pub default_story_id: String,

    /// Budget for one turn, extraction included.
    pub turn_timeout: Duration,

    /// Whole-call extractor retries after the first attempt.
    pub extractor_retry_count: u32,
}

impl EngineConfig {
    /// Create a config with defaults and the given API key.
    pub fn new(llm_api_key: impl Into<String>) -> Self {
        Self {
            db_path: PathBuf::from("data/canon.db"),
            llm_api_key: llm_api_key.into(),
            llm_base_url: None,
            llm_model: None,
            rag_index_base_dir: None,
            default_story_id: "default".to_string(),
            turn_timeout: Duration::from_secs(DEFAULT_TURN_TIMEOUT_SECONDS),
            extractor_retry_count: DEFAULT_EXTRACTOR_RETRIES,
        }
    }

    /// Load from the environment. `LLM_API_KEY` is required; everything
    /// else falls back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let llm_api_key = std::env::var("LLM_API_KEY").map_err(|_| ConfigError::MissingApiKey)?;
        let mut config = Self::new(llm_api_key);

        if let Ok(db_path) = std::env::var("DB_PATH") {
            config.db_path = PathBuf::from(db_path);
        }
        if let Ok(base_url) = std::env::var("LLM_BASE_URL") {
            config.llm_base_url = Some(base_url);
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            config.llm_model = Some(model);
        }
        if let Ok(dir) = std::env::var("RAG_INDEX_BASE_DIR") {
            config.rag_index_base_dir = Some(PathBuf::from(dir));
        }
        if let Ok(story_id) = std::env::var("DEFAULT_STORY_ID") {
            config.default_story_id = story_id;
        }
        if let Ok(seconds) = std::env::var("TURN_TIMEOUT_SECONDS") {
            let parsed = seconds
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    name: "TURN_TIMEOUT_SECONDS",
                    value: seconds,
                })?;
            config.turn_timeout = Duration::from_secs(parsed);
        }
        if let Ok(retries) = std::env::var("EXTRACTOR_RETRY_COUNT") {
            config.extractor_retry_count =
                retries
                    .parse::<u32>()
                    .map_err(|_| ConfigError::InvalidValue {
                        name: "EXTRACTOR_RETRY_COUNT",
                        value: retries,
                    })?;
        }

        Ok(config)
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.llm_base_url = Some(base_url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.llm_model = Some(model.into());
        self
    }

    pub fn with_default_story_id(mut self, story_id: impl Into<String>) -> Self {
        self.default_story_id = story_id.into();
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.extractor_retry_count = retries;
        self
    }
}
