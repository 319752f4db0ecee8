//! SQLite datastore backend.
//!
//! Derived state is stored as versioned key/value rows — one row per
//! `(key, block_number)` write, `NULL` marking a delete — so rolling back
//! is a range delete rather than a reverse migration. An applied-blocks
//! log recovers the cursor hash for any rollback target.
//!
//! # Usage
//! ```rust,no_run
//! use demux_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./demux.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use demux_core::error::StoreError;
use demux_core::store::Datastore;
use demux_core::types::IndexState;

/// SQLite-backed datastore with versioned entries and an applied-blocks
/// log. Cloning shares the connection pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

enum WriteOp {
    Set { key: String, value: String },
    Delete { key: String },
}

/// Writes staged during one block's application; flushed as versioned
/// rows at commit, stamped with the block number from the staged cursor.
pub struct SqliteTx {
    tx: sqlx::Transaction<'static, sqlx::Sqlite>,
    staged: Vec<WriteOp>,
    staged_index: Option<IndexState>,
}

impl SqliteTx {
    /// Read the current value for `key`, staged writes first.
    pub async fn get(&mut self, key: &str) -> Result<Option<Value>, StoreError> {
        for op in self.staged.iter().rev() {
            match op {
                WriteOp::Set { key: k, value } if k == key => {
                    return Ok(Some(serde_json::from_str(value)?));
                }
                WriteOp::Delete { key: k } if k == key => return Ok(None),
                _ => {}
            }
        }

        let row = sqlx::query(
            "SELECT value FROM entries WHERE key = ? ORDER BY block_number DESC LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        match row {
            Some(row) => {
                let value: Option<String> = row.get("value");
                match value {
                    Some(text) => Ok(Some(serde_json::from_str(&text)?)),
                    None => Ok(None), // tombstone
                }
            }
            None => Ok(None),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: &Value) -> Result<(), StoreError> {
        self.staged.push(WriteOp::Set {
            key: key.into(),
            value: serde_json::to_string(value)?,
        });
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.staged.push(WriteOp::Delete { key: key.into() });
    }
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./demux.db"`) or a full
    /// SQLite URL (`"sqlite:./demux.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database. All data is lost when the pool
    /// is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        // Single connection: each SQLite connection gets its own
        // in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        // WAL mode — better concurrent read throughput
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS index_state (
                id           INTEGER PRIMARY KEY CHECK (id = 0),
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                is_replay    INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS applied_blocks (
                block_number INTEGER PRIMARY KEY,
                block_hash   TEXT    NOT NULL,
                is_replay    INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entries (
                key          TEXT    NOT NULL,
                block_number INTEGER NOT NULL,
                value        TEXT,
                PRIMARY KEY (key, block_number)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(())
    }

    /// Read the current value for `key` outside any transaction.
    pub async fn value(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query(
            "SELECT value FROM entries WHERE key = ? ORDER BY block_number DESC LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        match row {
            Some(row) => {
                let value: Option<String> = row.get("value");
                match value {
                    Some(text) => Ok(Some(serde_json::from_str(&text)?)),
                    None => Ok(None),
                }
            }
            None => Ok(None),
        }
    }

    /// Read the committed cursor outside any transaction.
    pub async fn current_index_state(&self) -> Result<Option<IndexState>, StoreError> {
        let row = sqlx::query(
            "SELECT block_number, block_hash, is_replay FROM index_state WHERE id = 0",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(row.map(index_state_from_row))
    }

    /// Delete entry versions superseded at or below `block_number`, and
    /// applied-block rows below it. Safe once those heights are
    /// irreversible; rollback below the pruned horizon is no longer
    /// possible.
    pub async fn prune_below(&self, block_number: u64) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM entries WHERE block_number <= ?1 AND block_number < (
                 SELECT MAX(e2.block_number) FROM entries e2
                 WHERE e2.key = entries.key AND e2.block_number <= ?1
             )",
        )
        .bind(block_number as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query("DELETE FROM applied_blocks WHERE block_number < ?")
            .bind(block_number as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        debug!(block_number, "pruned superseded versions");
        Ok(())
    }
}

fn index_state_from_row(row: sqlx::sqlite::SqliteRow) -> IndexState {
    IndexState {
        block_number: row.get::<i64, _>("block_number") as u64,
        block_hash: row.get("block_hash"),
        is_replay: row.get::<i64, _>("is_replay") != 0,
    }
}

#[async_trait]
impl Datastore for SqliteStore {
    type Tx = SqliteTx;

    async fn begin(&self) -> Result<SqliteTx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(SqliteTx {
            tx,
            staged: Vec::new(),
            staged_index: None,
        })
    }

    async fn commit(&self, mut tx: SqliteTx) -> Result<(), StoreError> {
        let Some(state) = tx.staged_index.take() else {
            if !tx.staged.is_empty() {
                return Err(StoreError::Backend(
                    "staged writes without a staged index state".into(),
                ));
            }
            return tx
                .tx
                .commit()
                .await
                .map_err(|e| StoreError::CommitFailed(e.to_string()));
        };

        let block_number = state.block_number as i64;
        for op in &tx.staged {
            let (key, value) = match op {
                WriteOp::Set { key, value } => (key, Some(value.as_str())),
                WriteOp::Delete { key } => (key, None),
            };
            sqlx::query(
                "INSERT OR REPLACE INTO entries (key, block_number, value) VALUES (?, ?, ?)",
            )
            .bind(key)
            .bind(block_number)
            .bind(value)
            .execute(&mut *tx.tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        }

        sqlx::query(
            "INSERT OR REPLACE INTO index_state
             (id, block_number, block_hash, is_replay, updated_at)
             VALUES (0, ?, ?, ?, ?)",
        )
        .bind(block_number)
        .bind(&state.block_hash)
        .bind(state.is_replay as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx.tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query(
            "INSERT OR REPLACE INTO applied_blocks (block_number, block_hash, is_replay)
             VALUES (?, ?, ?)",
        )
        .bind(block_number)
        .bind(&state.block_hash)
        .bind(state.is_replay as i64)
        .execute(&mut *tx.tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        tx.tx
            .commit()
            .await
            .map_err(|e| StoreError::CommitFailed(e.to_string()))?;

        debug!(block = state.block_number, hash = %state.block_hash, "block committed");
        Ok(())
    }

    async fn abort(&self, tx: SqliteTx) -> Result<(), StoreError> {
        tx.tx
            .rollback()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn read_index_state(&self, tx: &mut SqliteTx) -> Result<Option<IndexState>, StoreError> {
        if tx.staged_index.is_some() {
            return Ok(tx.staged_index.clone());
        }
        let row = sqlx::query(
            "SELECT block_number, block_hash, is_replay FROM index_state WHERE id = 0",
        )
        .fetch_optional(&mut *tx.tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(row.map(index_state_from_row))
    }

    async fn write_index_state(
        &self,
        tx: &mut SqliteTx,
        state: &IndexState,
    ) -> Result<(), StoreError> {
        tx.staged_index = Some(state.clone());
        Ok(())
    }

    async fn rollback_to(&self, block_number: u64) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let target = block_number as i64;
        sqlx::query("DELETE FROM entries WHERE block_number >= ?")
            .bind(target)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query("DELETE FROM applied_blocks WHERE block_number >= ?")
            .bind(target)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let surviving = sqlx::query(
            "SELECT block_number, block_hash, is_replay FROM applied_blocks
             ORDER BY block_number DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        match surviving {
            Some(row) => {
                let state = index_state_from_row(row);
                sqlx::query(
                    "INSERT OR REPLACE INTO index_state
                     (id, block_number, block_hash, is_replay, updated_at)
                     VALUES (0, ?, ?, ?, ?)",
                )
                .bind(state.block_number as i64)
                .bind(&state.block_hash)
                .bind(state.is_replay as i64)
                .bind(chrono::Utc::now().timestamp())
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            }
            None => {
                sqlx::query("DELETE FROM index_state")
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::CommitFailed(e.to_string()))?;

        debug!(target = block_number, "rolled back storage");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(block_number: u64) -> IndexState {
        IndexState {
            block_number,
            block_hash: format!("0x{block_number:016x}"),
            is_replay: false,
        }
    }

    /// Apply one block's worth of writes the way the handler does.
    async fn apply_block(store: &SqliteStore, block_number: u64, sets: &[(&str, Value)]) {
        let mut tx = store.begin().await.unwrap();
        for (key, value) in sets {
            tx.set(*key, value).unwrap();
        }
        store
            .write_index_state(&mut tx, &state(block_number))
            .await
            .unwrap();
        store.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn index_state_roundtrip() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.current_index_state().await.unwrap().is_none());

        apply_block(&store, 1_000, &[]).await;

        let loaded = store.current_index_state().await.unwrap().unwrap();
        assert_eq!(loaded.block_number, 1_000);
        assert_eq!(loaded.block_hash, format!("0x{:016x}", 1_000u64));
        assert!(!loaded.is_replay);
    }

    #[tokio::test]
    async fn index_state_upserts() {
        let store = SqliteStore::in_memory().await.unwrap();
        apply_block(&store, 100, &[]).await;
        apply_block(&store, 101, &[]).await;

        let loaded = store.current_index_state().await.unwrap().unwrap();
        assert_eq!(loaded.block_number, 101);
    }

    #[tokio::test]
    async fn versioned_reads_return_latest_value() {
        let store = SqliteStore::in_memory().await.unwrap();
        apply_block(&store, 1, &[("count", json!(1))]).await;
        apply_block(&store, 2, &[("count", json!(2))]).await;
        apply_block(&store, 3, &[("other", json!("x"))]).await;

        assert_eq!(store.value("count").await.unwrap(), Some(json!(2)));
        assert_eq!(store.value("other").await.unwrap(), Some(json!("x")));
        assert!(store.value("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn staged_writes_visible_inside_tx_only() {
        let store = SqliteStore::in_memory().await.unwrap();
        apply_block(&store, 1, &[("count", json!(1))]).await;

        let mut tx = store.begin().await.unwrap();
        tx.set("count", &json!(2)).unwrap();
        assert_eq!(tx.get("count").await.unwrap(), Some(json!(2)));

        store.abort(tx).await.unwrap();
        assert_eq!(store.value("count").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn delete_writes_a_tombstone() {
        let store = SqliteStore::in_memory().await.unwrap();
        apply_block(&store, 1, &[("k", json!("v"))]).await;

        let mut tx = store.begin().await.unwrap();
        tx.delete("k");
        assert!(tx.get("k").await.unwrap().is_none());
        store.write_index_state(&mut tx, &state(2)).await.unwrap();
        store.commit(tx).await.unwrap();

        assert!(store.value("k").await.unwrap().is_none());

        // Rolling back the tombstone's block resurfaces the old value.
        store.rollback_to(2).await.unwrap();
        assert_eq!(store.value("k").await.unwrap(), Some(json!("v")));
    }

    #[tokio::test]
    async fn rollback_purges_future_versions_and_restores_cursor() {
        let store = SqliteStore::in_memory().await.unwrap();
        for n in 1..=5u64 {
            apply_block(&store, n, &[("count", json!(n))]).await;
        }

        store.rollback_to(4).await.unwrap();

        assert_eq!(store.value("count").await.unwrap(), Some(json!(3)));
        let loaded = store.current_index_state().await.unwrap().unwrap();
        assert_eq!(loaded.block_number, 3);
        assert_eq!(loaded.block_hash, format!("0x{:016x}", 3u64));
    }

    #[tokio::test]
    async fn rollback_below_everything_clears_the_cursor() {
        let store = SqliteStore::in_memory().await.unwrap();
        apply_block(&store, 10, &[("k", json!(1))]).await;

        store.rollback_to(10).await.unwrap();

        assert!(store.current_index_state().await.unwrap().is_none());
        assert!(store.value("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_index_state_sees_staged_cursor() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        assert!(store.read_index_state(&mut tx).await.unwrap().is_none());

        store.write_index_state(&mut tx, &state(7)).await.unwrap();
        assert_eq!(
            store
                .read_index_state(&mut tx)
                .await
                .unwrap()
                .unwrap()
                .block_number,
            7
        );
        store.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn staged_writes_without_cursor_are_rejected() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.set("k", &json!(1)).unwrap();

        let err = store.commit(tx).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(store.value("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prune_keeps_latest_version_per_key() {
        let store = SqliteStore::in_memory().await.unwrap();
        for n in 1..=4u64 {
            apply_block(&store, n, &[("count", json!(n))]).await;
        }
        apply_block(&store, 5, &[("other", json!("x"))]).await;

        store.prune_below(4).await.unwrap();

        // Latest surviving version at or below 4 still reads back.
        assert_eq!(store.value("count").await.unwrap(), Some(json!(4)));
        assert_eq!(store.value("other").await.unwrap(), Some(json!("x")));

        // Rolling back to 5 lands on the retained version at block 4.
        store.rollback_to(5).await.unwrap();
        assert_eq!(store.value("count").await.unwrap(), Some(json!(4)));
        assert_eq!(
            store
                .current_index_state()
                .await
                .unwrap()
                .unwrap()
                .block_number,
            4
        );
    }
}
