//! Transfer-counter demo: a deterministic updater tallies transfer
//! actions while an effect announces each live block, driven end to end
//! by the watcher over a simulated chain.
//!
//! ```bash
//! cargo run --bin counter
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use demux_core::{
    Action, ActionHandler, ActionReader, ActionWatcher, ApplyContext, Block, Effect,
    EffectContext, EffectError, EngineConfig, InMemoryChain, MemoryStore, MemoryTx, Updater,
    UpdaterError,
};

struct TransferCounter;

#[async_trait]
impl Updater<MemoryStore> for TransferCounter {
    fn action_type(&self) -> &str {
        "transfer"
    }

    async fn apply(
        &self,
        tx: &mut MemoryTx,
        payload: &Value,
        _block: &Block,
        _ctx: &ApplyContext,
    ) -> Result<(), UpdaterError> {
        let count = tx.get("transfers").and_then(|v| v.as_u64()).unwrap_or(0);
        let amount = payload["amount"].as_u64().unwrap_or(0);
        let volume = tx.get("volume").and_then(|v| v.as_u64()).unwrap_or(0);
        tx.set("transfers", json!(count + 1));
        tx.set("volume", json!(volume + amount));
        Ok(())
    }
}

struct TransferAnnouncer;

#[async_trait]
impl Effect for TransferAnnouncer {
    fn action_type(&self) -> &str {
        "transfer"
    }

    async fn run(
        &self,
        payload: &Value,
        block: &Block,
        _ctx: &EffectContext,
    ) -> Result<(), EffectError> {
        println!(
            "  live transfer of {} at block {}",
            payload["amount"], block.block_number
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .init();

    let chain = InMemoryChain::new(1);
    chain.append(vec![Action::new("transfer", json!({"amount": 100}))]);

    let store = MemoryStore::new();
    let config = EngineConfig::new().with_poll_interval_ms(20);

    let reader = ActionReader::new(chain.clone(), &config);
    let handler = ActionHandler::new(
        store.clone(),
        vec![Arc::new(TransferCounter)],
        vec![Arc::new(TransferAnnouncer)],
        &config,
    );
    let mut watcher = ActionWatcher::new(reader, handler, config);
    let control = watcher.control();

    let loop_handle = tokio::spawn(async move { watcher.watch().await });

    // Produce a few live blocks while the watcher runs.
    for n in 2..=6u64 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        chain.append(vec![Action::new("transfer", json!({"amount": n * 10}))]);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    control.cancel();
    loop_handle.await??;

    let state = store.current_index_state().expect("no blocks applied");
    println!(
        "indexed through block {} ({} transfers, volume {})",
        state.block_number,
        store.value("transfers").unwrap_or(json!(0)),
        store.value("volume").unwrap_or(json!(0)),
    );
    Ok(())
}
