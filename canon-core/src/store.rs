//! Durable storage for canonical states and the append-only event log.
//!
//! States and events are stored as opaque JSON blobs in SQLite; the
//! structure is recovered on read. A turn's state write and event
//! appends commit as a single transaction, so no partially-applied turn
//! is ever observable.

use crate::event::Event;
use crate::state::CanonicalState;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use thiserror::Error;

/// Schema for the two relations and their indexes.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS state (
  story_id TEXT PRIMARY KEY,
  state_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
  event_id TEXT PRIMARY KEY,
  story_id TEXT NOT NULL,
  turn INTEGER NOT NULL,
  time_order INTEGER NOT NULL,
  event_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_story_turn ON events(story_id, turn);
CREATE INDEX IF NOT EXISTS idx_events_story_time_order ON events(story_id, time_order);
CREATE INDEX IF NOT EXISTS idx_events_story ON events(story_id);
"#;

/// Errors from the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate event id '{0}'")]
    DuplicateEventId(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key/value store of canonical states plus the event log.
///
/// Safe for concurrent readers; the single-writer-per-story discipline
/// is enforced by the [`StateManager`](crate::manager::StateManager).
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Open (creating if missing) a store at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Open an in-memory store. A single pinned connection keeps the
    /// database alive for the pool's lifetime.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Fetch the current state for a story, or `None` if unknown.
    ///
    /// Self-healing happens here: an unparseable state row is replaced
    /// by the empty scaffold, and dangling location references are
    /// patched with persisted placeholders. Recovery never touches the
    /// event log.
    pub async fn get_state(&self, story_id: &str) -> Result<Option<CanonicalState>, StoreError> {
        let row: Option<String> =
            sqlx::query_scalar("SELECT state_json FROM state WHERE story_id = ?")
                .bind(story_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(state_json) = row else {
            return Ok(None);
        };

        let mut state: CanonicalState = match serde_json::from_str(&state_json) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    story_id = %story_id,
                    error = %e,
                    "Stored state is corrupt, reinitializing to the scaffold"
                );
                let scaffold = CanonicalState::scaffold(story_id);
                self.save_state(story_id, &scaffold).await?;
                return Ok(Some(scaffold));
            }
        };

        let healed = state.heal_missing_locations();
        if !healed.is_empty() {
            tracing::warn!(
                story_id = %story_id,
                locations = ?healed,
                "Healed dangling location references on load"
            );
            self.save_state(story_id, &state).await?;
        }

        Ok(Some(state))
    }

    /// Replace the state record for a story.
    pub async fn save_state(&self, story_id: &str, state: &CanonicalState) -> Result<(), StoreError> {
        let state_json = serde_json::to_string(state)?;
        sqlx::query("INSERT OR REPLACE INTO state (story_id, state_json, updated_at) VALUES (?, ?, ?)")
            .bind(story_id)
            .bind(state_json)
            .bind(state.meta.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetch the current state, creating and persisting the scaffold on
    /// first touch of a story id.
    pub async fn initialize_state(&self, story_id: &str) -> Result<CanonicalState, StoreError> {
        if let Some(state) = self.get_state(story_id).await? {
            return Ok(state);
        }
        let scaffold = CanonicalState::scaffold(story_id);
        self.save_state(story_id, &scaffold).await?;
        Ok(scaffold)
    }

    /// Append one event outside a turn commit.
    pub async fn append_event(&self, story_id: &str, event: &Event) -> Result<(), StoreError> {
        let event_json = serde_json::to_string(event)?;
        insert_event(&self.pool, story_id, event, &event_json).await
    }

    /// Commit a turn: the state write plus all event appends as one
    /// transaction. A duplicate event id rolls the whole turn back.
    pub async fn commit_turn(
        &self,
        story_id: &str,
        state: &CanonicalState,
        events: &[Event],
    ) -> Result<(), StoreError> {
        let state_json = serde_json::to_string(state)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR REPLACE INTO state (story_id, state_json, updated_at) VALUES (?, ?, ?)")
            .bind(story_id)
            .bind(state_json)
            .bind(state.meta.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;

        for event in events {
            let event_json = serde_json::to_string(event)?;
            let result = sqlx::query(
                "INSERT INTO events (event_id, story_id, turn, time_order, event_json, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&event.event_id)
            .bind(story_id)
            .bind(event.turn as i64)
            .bind(event.time.order)
            .bind(event_json)
            .bind(event.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await;

            if let Err(e) = result {
                return Err(map_insert_error(e, &event.event_id));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Fetch a single event by id.
    pub async fn get_event(&self, event_id: &str) -> Result<Option<Event>, StoreError> {
        let row: Option<String> =
            sqlx::query_scalar("SELECT event_json FROM events WHERE event_id = ?")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    /// All events of one turn, ordered by `time.order` ascending.
    pub async fn list_events_by_turn(
        &self,
        story_id: &str,
        turn: u64,
    ) -> Result<Vec<Event>, StoreError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT event_json FROM events WHERE story_id = ? AND turn = ? \
             ORDER BY time_order ASC, created_at ASC",
        )
        .bind(story_id)
        .bind(turn as i64)
        .fetch_all(&self.pool)
        .await?;

        parse_events(rows)
    }

    /// Events within an inclusive `time.order` range, ascending.
    pub async fn list_events_by_time_range(
        &self,
        story_id: &str,
        min_order: Option<i64>,
        max_order: Option<i64>,
    ) -> Result<Vec<Event>, StoreError> {
        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT event_json FROM events WHERE story_id = ",
        );
        builder.push_bind(story_id);
        if let Some(min_order) = min_order {
            builder.push(" AND time_order >= ");
            builder.push_bind(min_order);
        }
        if let Some(max_order) = max_order {
            builder.push(" AND time_order <= ");
            builder.push_bind(max_order);
        }
        builder.push(" ORDER BY time_order ASC, turn ASC, created_at ASC");

        let rows: Vec<String> = builder.build_query_scalar().fetch_all(&self.pool).await?;
        parse_events(rows)
    }

    /// The most recent events, ordered by `time.order` descending.
    pub async fn list_recent_events(
        &self,
        story_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Event>, StoreError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT event_json FROM events WHERE story_id = ? \
             ORDER BY time_order DESC, turn DESC, created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(story_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        parse_events(rows)
    }
}

async fn insert_event(
    pool: &SqlitePool,
    story_id: &str,
    event: &Event,
    event_json: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO events (event_id, story_id, turn, time_order, event_json, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&event.event_id)
    .bind(story_id)
    .bind(event.turn as i64)
    .bind(event.time.order)
    .bind(event_json)
    .bind(event.created_at.to_rfc3339())
    .execute(pool)
    .await
    .map_err(|e| map_insert_error(e, &event.event_id))?;
    Ok(())
}

fn map_insert_error(e: sqlx::Error, event_id: &str) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::DuplicateEventId(event_id.to_string())
        }
        _ => StoreError::Database(e),
    }
}

fn parse_events(rows: Vec<String>) -> Result<Vec<Event>, StoreError> {
    rows.iter()
        .map(|json| serde_json::from_str(json).map_err(StoreError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initialize_persists_scaffold() {
        let store = StateStore::in_memory().await.unwrap();
        assert!(store.get_state("fresh").await.unwrap().is_none());

        let state = store.initialize_state("fresh").await.unwrap();
        assert_eq!(state.meta.turn, 0);

        let loaded = store.get_state("fresh").await.unwrap().unwrap();
        assert_eq!(loaded.meta.story_id, "fresh");
    }

    #[tokio::test]
    async fn test_corrupt_state_heals_to_scaffold() {
        let store = StateStore::in_memory().await.unwrap();
        sqlx::query("INSERT INTO state (story_id, state_json, updated_at) VALUES (?, ?, ?)")
            .bind("broken")
            .bind("{not json")
            .bind("now")
            .execute(&store.pool)
            .await
            .unwrap();

        let state = store.get_state("broken").await.unwrap().unwrap();
        assert_eq!(state.meta.story_id, "broken");
        assert_eq!(state.meta.turn, 0);
    }

    #[tokio::test]
    async fn test_dangling_location_healed_and_persisted() {
        let store = StateStore::in_memory().await.unwrap();
        let mut state = CanonicalState::scaffold("heal");
        state.player.location_id = "xuchang".to_string();
        store.save_state("heal", &state).await.unwrap();

        let loaded = store.get_state("heal").await.unwrap().unwrap();
        assert!(loaded.entities.locations.contains_key("xuchang"));

        // The healed copy was written back.
        let reloaded = store.get_state("heal").await.unwrap().unwrap();
        assert!(reloaded.entities.locations.contains_key("xuchang"));
    }
}
