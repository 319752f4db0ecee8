//! Drives the full watcher/reader/handler pipeline against the SQLite
//! backend, including a fork and its rollback.

#![cfg(feature = "sqlite")]

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use demux_core::{
    Action, ActionHandler, ActionReader, ActionWatcher, ApplyContext, Block, EngineConfig,
    InMemoryChain, Tick, Updater, UpdaterError,
};
use demux_storage::sqlite::{SqliteStore, SqliteTx};

struct TransferCounter;

#[async_trait]
impl Updater<SqliteStore> for TransferCounter {
    fn action_type(&self) -> &str {
        "transfer"
    }

    async fn apply(
        &self,
        tx: &mut SqliteTx,
        _payload: &Value,
        _block: &Block,
        _ctx: &ApplyContext,
    ) -> Result<(), UpdaterError> {
        let count = tx
            .get("transfers")
            .await
            .map_err(|e| UpdaterError(e.to_string()))?
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        tx.set("transfers", &json!(count + 1))
            .map_err(|e| UpdaterError(e.to_string()))?;
        Ok(())
    }
}

async fn drain(watcher: &mut ActionWatcher<InMemoryChain, SqliteStore>) -> Vec<Tick> {
    let mut ticks = Vec::new();
    loop {
        match watcher.check_for_blocks().await.unwrap() {
            Tick::Idle => return ticks,
            tick => ticks.push(tick),
        }
    }
}

#[tokio::test]
async fn sqlite_pipeline_survives_a_fork() {
    let chain = InMemoryChain::new(100);
    for _ in 100..=103 {
        chain.append(vec![Action::new("transfer", json!({}))]);
    }

    let store = SqliteStore::in_memory().await.unwrap();
    let config = EngineConfig::new()
        .with_start_at_block(100)
        .with_poll_interval_ms(10);

    let reader = ActionReader::new(chain.clone(), &config);
    let handler = ActionHandler::new(
        store.clone(),
        vec![Arc::new(TransferCounter)],
        vec![],
        &config,
    );
    let mut watcher = ActionWatcher::new(reader, handler, config);

    drain(&mut watcher).await;
    assert_eq!(
        store.value("transfers").await.unwrap(),
        Some(json!(4))
    );
    assert_eq!(
        store.current_index_state().await.unwrap().unwrap().block_number,
        103
    );

    // Fork at 102: a longer replacement branch carrying one transfer.
    chain.reorg(
        102,
        vec![vec![Action::new("transfer", json!({}))], vec![], vec![]],
    );

    let ticks = drain(&mut watcher).await;
    assert_eq!(ticks[0], Tick::RolledBack { to: 102 });

    let state = store.current_index_state().await.unwrap().unwrap();
    assert_eq!(state.block_number, 104);
    assert_eq!(state.block_hash, chain.hash_at(104).unwrap());
    // 2 transfers from 100..101 plus 1 from the new branch.
    assert_eq!(
        store.value("transfers").await.unwrap(),
        Some(json!(3))
    );
}

#[tokio::test]
async fn sqlite_cursor_resumes_across_handler_instances() {
    let chain = InMemoryChain::new(1);
    chain.append(vec![Action::new("transfer", json!({}))]);
    chain.append(vec![Action::new("transfer", json!({}))]);

    let store = SqliteStore::in_memory().await.unwrap();
    let config = EngineConfig::new().with_poll_interval_ms(10);

    {
        let reader = ActionReader::new(chain.clone(), &config);
        let handler = ActionHandler::new(
            store.clone(),
            vec![Arc::new(TransferCounter)],
            vec![],
            &config,
        );
        let mut watcher = ActionWatcher::new(reader, handler, config.clone());
        drain(&mut watcher).await;
    }

    // A fresh handler over the same store sees the persisted cursor and
    // rejects a replayed block 2 as out of order.
    let handler = ActionHandler::new(
        store.clone(),
        vec![Arc::new(TransferCounter)],
        vec![],
        &config,
    );
    let loaded = handler.load_index_state().await.unwrap().unwrap();
    assert_eq!(loaded.block_number, 2);

    let replayed = block_at(&chain, 2).await;
    let err = handler.handle_block(&replayed, false).await.unwrap_err();
    assert!(matches!(
        err,
        demux_core::HandlerError::OutOfOrderBlock { expected: 3, got: 2 }
    ));
    assert_eq!(
        store.value("transfers").await.unwrap(),
        Some(json!(2))
    );
}

async fn block_at(chain: &InMemoryChain, number: u64) -> Block {
    demux_core::ChainAdapter::get_block(chain, number)
        .await
        .unwrap()
        .unwrap()
}
