//! Datastore capability set, plus an in-memory store for tests and
//! ephemeral runs.
//!
//! Persistent backends (SQLite, Postgres, ...) implement [`Datastore`] in
//! their own crates; the contract is the same everywhere: one transaction
//! per block, the index state written through that transaction, and a
//! `rollback_to` that restores derived state to an earlier cursor.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::types::IndexState;

/// Capabilities the handler needs from a datastore.
///
/// The ingestion lane is serialized, so at most one transaction is open
/// at a time; updaters mutate exclusively through the transaction handle.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    /// Transaction handle passed to updaters.
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;
    async fn abort(&self, tx: Self::Tx) -> Result<(), StoreError>;

    /// Read the persisted cursor inside `tx`.
    async fn read_index_state(&self, tx: &mut Self::Tx) -> Result<Option<IndexState>, StoreError>;

    /// Stage the new cursor in `tx`; durable once `tx` commits.
    async fn write_index_state(
        &self,
        tx: &mut Self::Tx,
        state: &IndexState,
    ) -> Result<(), StoreError>;

    /// Restore all derived state to the snapshot as of `block_number - 1`.
    /// Afterwards the persisted cursor is at most `block_number - 1`, or
    /// absent if nothing that old was ever applied.
    async fn rollback_to(&self, block_number: u64) -> Result<(), StoreError>;
}

// ─── In-memory store (tests / ephemeral runs) ─────────────────────────────────

/// In-memory datastore with copy-on-write transactions and per-block
/// snapshots for rollback. All data is lost when the process exits.
///
/// Cloning shares the underlying state, so a handle kept outside the
/// handler observes every commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
    fail_next_commit: Arc<AtomicBool>,
}

#[derive(Default)]
struct StoreInner {
    values: HashMap<String, Value>,
    index_state: Option<IndexState>,
    /// Full state as of each committed block, keyed by block number.
    snapshots: BTreeMap<u64, Snapshot>,
}

#[derive(Clone)]
struct Snapshot {
    values: HashMap<String, Value>,
    index_state: Option<IndexState>,
}

/// Staged writes for one block. Reads see staged values first, then the
/// committed state underneath.
pub struct MemoryTx {
    inner: Arc<Mutex<StoreInner>>,
    /// `None` marks a staged delete.
    staged: HashMap<String, Option<Value>>,
    staged_index: Option<IndexState>,
}

impl MemoryTx {
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(staged) = self.staged.get(key) {
            return staged.clone();
        }
        self.inner.lock().unwrap().values.get(key).cloned()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.staged.insert(key.into(), Some(value));
    }

    pub fn delete(&mut self, key: &str) {
        self.staged.insert(key.to_string(), None);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit` fail with `StoreError::CommitFailed`.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Read a committed value directly (outside any transaction).
    pub fn value(&self, key: &str) -> Option<Value> {
        self.inner.lock().unwrap().values.get(key).cloned()
    }

    /// Read the committed cursor directly (outside any transaction).
    pub fn current_index_state(&self) -> Option<IndexState> {
        self.inner.lock().unwrap().index_state.clone()
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        Ok(MemoryTx {
            inner: Arc::clone(&self.inner),
            staged: HashMap::new(),
            staged_index: None,
        })
    }

    async fn commit(&self, tx: MemoryTx) -> Result<(), StoreError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::CommitFailed("injected commit failure".into()));
        }

        let mut inner = self.inner.lock().unwrap();
        for (key, value) in tx.staged {
            match value {
                Some(v) => {
                    inner.values.insert(key, v);
                }
                None => {
                    inner.values.remove(&key);
                }
            }
        }
        if let Some(state) = tx.staged_index {
            let snapshot = Snapshot {
                values: inner.values.clone(),
                index_state: Some(state.clone()),
            };
            inner.snapshots.insert(state.block_number, snapshot);
            inner.index_state = Some(state);
        }
        Ok(())
    }

    async fn abort(&self, tx: MemoryTx) -> Result<(), StoreError> {
        drop(tx);
        Ok(())
    }

    async fn read_index_state(&self, tx: &mut MemoryTx) -> Result<Option<IndexState>, StoreError> {
        if tx.staged_index.is_some() {
            return Ok(tx.staged_index.clone());
        }
        Ok(self.inner.lock().unwrap().index_state.clone())
    }

    async fn write_index_state(
        &self,
        tx: &mut MemoryTx,
        state: &IndexState,
    ) -> Result<(), StoreError> {
        tx.staged_index = Some(state.clone());
        Ok(())
    }

    async fn rollback_to(&self, block_number: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let target = block_number.saturating_sub(1);

        let restore = inner
            .snapshots
            .range(..=target)
            .next_back()
            .map(|(n, snap)| (*n, snap.clone()));

        match restore {
            Some((at, snapshot)) => {
                inner.values = snapshot.values;
                inner.index_state = snapshot.index_state;
                let _ = inner.snapshots.split_off(&(at + 1));
            }
            None => {
                inner.values.clear();
                inner.index_state = None;
                inner.snapshots.clear();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(block_number: u64) -> IndexState {
        IndexState {
            block_number,
            block_hash: format!("0x{block_number:x}"),
            is_replay: false,
        }
    }

    #[tokio::test]
    async fn staged_writes_are_invisible_until_commit() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.set("k", json!(1));

        assert!(store.value("k").is_none());
        assert_eq!(tx.get("k"), Some(json!(1)));

        store.commit(tx).await.unwrap();
        assert_eq!(store.value("k"), Some(json!(1)));
    }

    #[tokio::test]
    async fn abort_discards_everything() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.set("k", json!(1));
        store
            .write_index_state(&mut tx, &state(1))
            .await
            .unwrap();

        store.abort(tx).await.unwrap();
        assert!(store.value("k").is_none());
        assert!(store.current_index_state().is_none());
    }

    #[tokio::test]
    async fn staged_delete_wins_over_committed_value() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.set("k", json!("old"));
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.delete("k");
        assert!(tx.get("k").is_none());
        store.commit(tx).await.unwrap();
        assert!(store.value("k").is_none());
    }

    #[tokio::test]
    async fn index_state_roundtrip() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        assert!(store.read_index_state(&mut tx).await.unwrap().is_none());

        store.write_index_state(&mut tx, &state(7)).await.unwrap();
        assert_eq!(
            store.read_index_state(&mut tx).await.unwrap().unwrap().block_number,
            7
        );
        store.commit(tx).await.unwrap();
        assert_eq!(store.current_index_state().unwrap().block_number, 7);
    }

    #[tokio::test]
    async fn rollback_restores_snapshot() {
        let store = MemoryStore::new();
        for n in 1..=5u64 {
            let mut tx = store.begin().await.unwrap();
            tx.set("count", json!(n));
            store.write_index_state(&mut tx, &state(n)).await.unwrap();
            store.commit(tx).await.unwrap();
        }

        store.rollback_to(4).await.unwrap();

        assert_eq!(store.value("count"), Some(json!(3)));
        assert_eq!(store.current_index_state().unwrap().block_number, 3);
    }

    #[tokio::test]
    async fn rollback_below_history_clears_store() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.set("count", json!(1));
        store.write_index_state(&mut tx, &state(10)).await.unwrap();
        store.commit(tx).await.unwrap();

        store.rollback_to(10).await.unwrap();

        assert!(store.value("count").is_none());
        assert!(store.current_index_state().is_none());
    }

    #[tokio::test]
    async fn injected_commit_failure_fires_once() {
        let store = MemoryStore::new();
        store.fail_next_commit();

        let mut tx = store.begin().await.unwrap();
        tx.set("k", json!(1));
        let err = store.commit(tx).await.unwrap_err();
        assert!(matches!(err, StoreError::CommitFailed(_)));
        assert!(store.value("k").is_none());

        let mut tx = store.begin().await.unwrap();
        tx.set("k", json!(1));
        store.commit(tx).await.unwrap();
        assert_eq!(store.value("k"), Some(json!(1)));
    }
}
