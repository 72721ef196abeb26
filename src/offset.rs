//! C8 — per-(table, keyspace, partition, destination) replication
//! progress, persisted transactionally with the destination write that
//! produced it (§4.8).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::reader::Token;

/// Uniquely identifies one progress row. Matches the offset table's unique
/// constraint `(table_name, keyspace, partition_id, destination)` (§6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OffsetKey {
    pub table: String,
    pub keyspace: String,
    pub partition_id: i64,
    pub destination: String,
}

impl OffsetKey {
    pub fn new(table: impl Into<String>, keyspace: impl Into<String>, partition_id: i64, destination: impl Into<String>) -> Self {
        OffsetKey { table: table.into(), keyspace: keyspace.into(), partition_id, destination: destination.into() }
    }
}

/// One progress row. Created lazily on first write for a key; updated
/// atomically with destination writes; never deleted (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    pub commitlog_file: String,
    pub commitlog_position: u64,
    pub last_event_timestamp_micros: i64,
    pub last_committed_at: DateTime<Utc>,
    pub events_replicated_count: u64,
}

impl Offset {
    fn token(&self) -> Token {
        Token::new(self.commitlog_file.clone(), self.commitlog_position)
    }
}

/// True if `(new_file, new_position)` is a strict advance over `existing`
/// (or there is no existing row yet). A non-advance means the event is a
/// duplicate replay already committed; callers must treat `advance`
/// returning `false` as a no-op, not an error (§4.8).
pub fn is_advance(existing: Option<&Offset>, new_file: &str, new_position: u64) -> bool {
    match existing {
        None => true,
        Some(o) => Token::new(new_file.to_string(), new_position) > o.token(),
    }
}

/// Persistence seam for offsets. The relational family embeds `advance`'s
/// write inside the same transaction as the data batch; the columnar
/// family writes to a separate deduplicating offsets table after the data
/// insert (§4.6, §9 open question).
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn read(&self, key: &OffsetKey) -> Result<Option<Offset>>;

    /// Advances the stored offset if `(new_file, new_position)` is a
    /// strict improvement; otherwise a no-op. Returns whether the store
    /// was actually updated.
    async fn advance(
        &self,
        key: &OffsetKey,
        new_file: &str,
        new_position: u64,
        new_timestamp_micros: i64,
        delta_events: u64,
    ) -> Result<bool>;
}

/// An in-memory `OffsetStore`, standing in for the relational warehouse's
/// backing table in tests (§5: "the offset store is owned by the
/// relational destination's backing database").
#[derive(Default)]
pub struct InMemoryOffsetStore {
    rows: DashMap<OffsetKey, Offset>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn read(&self, key: &OffsetKey) -> Result<Option<Offset>> {
        Ok(self.rows.get(key).map(|e| e.clone()))
    }

    async fn advance(
        &self,
        key: &OffsetKey,
        new_file: &str,
        new_position: u64,
        new_timestamp_micros: i64,
        delta_events: u64,
    ) -> Result<bool> {
        let existing = self.rows.get(key).map(|e| e.clone());
        if !is_advance(existing.as_ref(), new_file, new_position) {
            return Ok(false);
        }
        let events_replicated_count = existing.map(|o| o.events_replicated_count).unwrap_or(0) + delta_events;
        self.rows.insert(
            key.clone(),
            Offset {
                commitlog_file: new_file.to_string(),
                commitlog_position: new_position,
                last_event_timestamp_micros: new_timestamp_micros,
                last_committed_at: Utc::now(),
                events_replicated_count,
            },
        );
        Ok(true)
    }
}

/// Builds the resumption token to start the reader from: the oldest
/// (least-advanced) stored offset across every `(table, keyspace,
/// partition, destination)` key in the set, so that replaying from this
/// token never skips an event some destination has not yet committed.
/// `None` means no key has ever been written -- a cold start, which
/// resumes from "oldest available file, position 0" (§4.8).
pub async fn initial_token(store: &dyn OffsetStore, keys: &[OffsetKey]) -> Result<Option<Token>> {
    let mut best: Option<Token> = None;
    for key in keys {
        if let Some(offset) = store.read(key).await? {
            let token = offset.token();
            best = Some(match best {
                Some(b) if b < token => b,
                _ => token,
            });
        }
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> OffsetKey {
        OffsetKey::new("users", "ks", 7, "relational")
    }

    #[tokio::test]
    async fn advance_from_empty_always_succeeds() {
        let store = InMemoryOffsetStore::new();
        assert!(store.advance(&key(), "commitlog-0001.log", 100, 5, 3).await.unwrap());
        let offset = store.read(&key()).await.unwrap().unwrap();
        assert_eq!(offset.events_replicated_count, 3);
    }

    #[tokio::test]
    async fn duplicate_replay_is_a_noop() {
        let store = InMemoryOffsetStore::new();
        store.advance(&key(), "commitlog-0001.log", 100, 5, 3).await.unwrap();
        let advanced = store.advance(&key(), "commitlog-0001.log", 100, 5, 3).await.unwrap();
        assert!(!advanced);
        let offset = store.read(&key()).await.unwrap().unwrap();
        assert_eq!(offset.events_replicated_count, 3, "count must not double-count a replay");
    }

    #[tokio::test]
    async fn strictly_greater_position_advances_and_accumulates() {
        let store = InMemoryOffsetStore::new();
        store.advance(&key(), "commitlog-0001.log", 100, 5, 3).await.unwrap();
        store.advance(&key(), "commitlog-0001.log", 200, 9, 2).await.unwrap();
        let offset = store.read(&key()).await.unwrap().unwrap();
        assert_eq!(offset.commitlog_position, 200);
        assert_eq!(offset.events_replicated_count, 5);
    }

    #[tokio::test]
    async fn earlier_file_with_later_position_is_not_an_advance() {
        let store = InMemoryOffsetStore::new();
        store.advance(&key(), "commitlog-0002.log", 0, 5, 1).await.unwrap();
        let advanced = store.advance(&key(), "commitlog-0001.log", 999_999, 5, 1).await.unwrap();
        assert!(!advanced);
    }

    #[tokio::test]
    async fn initial_token_is_the_oldest_offset_across_destinations_regardless_of_order() {
        let store = InMemoryOffsetStore::new();
        let relational = OffsetKey::new("users", "ks", 7, "relational");
        let columnar = OffsetKey::new("users", "ks", 7, "columnar");
        // relational is far ahead; columnar has lagged behind.
        store.advance(&relational, "commitlog-0005.log", 900, 50, 10).await.unwrap();
        store.advance(&columnar, "commitlog-0002.log", 10, 20, 4).await.unwrap();

        let token = initial_token(&store, &[relational.clone(), columnar.clone()]).await.unwrap().unwrap();
        assert_eq!(token, Token::new("commitlog-0002.log", 10));

        // Order of the key list must not change the result.
        let token_reordered = initial_token(&store, &[columnar, relational]).await.unwrap().unwrap();
        assert_eq!(token_reordered, Token::new("commitlog-0002.log", 10));
    }

    #[tokio::test]
    async fn initial_token_is_none_on_a_cold_start() {
        let store = InMemoryOffsetStore::new();
        assert!(initial_token(&store, &[key()]).await.unwrap().is_none());
    }
}
