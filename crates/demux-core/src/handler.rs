//! Action handler — applies updaters atomically per block and records the
//! index-state commitment.
//!
//! Every block is applied inside a single datastore transaction: cursor
//! validation, updater mutations, and the new index state all commit
//! together or not at all. Effects are dispatched only after the commit
//! succeeds, and only for live (non-replay) blocks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::effects::{Effect, EffectDispatcher};
use crate::error::{HandlerError, StoreError, UpdaterError};
use crate::store::Datastore;
use crate::types::{ApplyContext, Block, IndexState};

/// Deterministic state mutator, invoked inside the block's transaction.
///
/// Updaters must be pure functions of the payload, the block, and prior
/// datastore state; anything else diverges on replay.
#[async_trait]
pub trait Updater<D: Datastore>: Send + Sync {
    /// Action type this updater subscribes to.
    fn action_type(&self) -> &str;

    /// Apply one action. Mutations must flow through `tx`.
    async fn apply(
        &self,
        tx: &mut D::Tx,
        payload: &Value,
        block: &Block,
        ctx: &ApplyContext,
    ) -> Result<(), UpdaterError>;
}

/// Applies blocks to a datastore and dispatches effects for live blocks.
pub struct ActionHandler<D: Datastore> {
    store: Arc<D>,
    updaters: HashMap<String, Vec<Arc<dyn Updater<D>>>>,
    effects: EffectDispatcher,
    start_at_block: u64,
    call_timeout: Duration,
}

impl<D: Datastore> ActionHandler<D> {
    /// Build from ordered updater and effect sequences; multiple entries
    /// per action type run in registration order.
    pub fn new(
        store: D,
        updaters: Vec<Arc<dyn Updater<D>>>,
        effects: Vec<Arc<dyn Effect>>,
        config: &EngineConfig,
    ) -> Self {
        let mut by_type: HashMap<String, Vec<Arc<dyn Updater<D>>>> = HashMap::new();
        for updater in updaters {
            by_type
                .entry(updater.action_type().to_string())
                .or_default()
                .push(updater);
        }
        Self {
            store: Arc::new(store),
            updaters: by_type,
            effects: EffectDispatcher::new(effects, config.effect_run_mode),
            start_at_block: config.start_at_block,
            call_timeout: config.call_timeout(),
        }
    }

    pub fn store(&self) -> &Arc<D> {
        &self.store
    }

    /// Read the persisted cursor.
    pub async fn load_index_state(&self) -> Result<Option<IndexState>, HandlerError> {
        let mut tx = self.begin().await?;
        let state = self.store.read_index_state(&mut tx).await?;
        self.store.abort(tx).await?;
        Ok(state)
    }

    /// Apply one block atomically, then dispatch effects if it is live.
    pub async fn handle_block(&self, block: &Block, is_replay: bool) -> Result<(), HandlerError> {
        let mut tx = self.begin().await?;
        if let Err(e) = self.apply_in_tx(&mut tx, block, is_replay).await {
            if let Err(abort_err) = self.store.abort(tx).await {
                warn!(block = block.block_number, "abort after failed apply: {abort_err}");
            }
            return Err(e);
        }

        with_deadline(self.call_timeout, self.store.commit(tx)).await?;
        debug!(
            block = block.block_number,
            hash = %block.block_hash,
            is_replay,
            "block committed"
        );

        if !is_replay {
            self.effects.dispatch(block).await;
        }
        Ok(())
    }

    /// Reverse application to the state as of `block_number - 1` and drop
    /// pending effects for discarded heights.
    pub async fn rollback_to(&self, block_number: u64) -> Result<(), HandlerError> {
        self.effects.discard_from(block_number);
        with_deadline(self.call_timeout, self.store.rollback_to(block_number)).await?;
        info!(target = block_number, "rolled back derived state");
        Ok(())
    }

    async fn begin(&self) -> Result<D::Tx, HandlerError> {
        Ok(with_deadline(self.call_timeout, self.store.begin()).await?)
    }

    async fn apply_in_tx(
        &self,
        tx: &mut D::Tx,
        block: &Block,
        is_replay: bool,
    ) -> Result<(), HandlerError> {
        let prior = self.store.read_index_state(tx).await?;
        self.validate_sequence(block, prior.as_ref())?;

        let ctx = ApplyContext {
            block_number: block.block_number,
            block_hash: block.block_hash.clone(),
            is_replay,
        };
        for action in &block.actions {
            let Some(updaters) = self.updaters.get(&action.action_type) else {
                continue;
            };
            for updater in updaters {
                updater
                    .apply(tx, &action.payload, block, &ctx)
                    .await
                    .map_err(|e| HandlerError::Updater {
                        action_type: action.action_type.clone(),
                        block_number: block.block_number,
                        reason: e.to_string(),
                    })?;
            }
        }

        let state = IndexState {
            block_number: block.block_number,
            block_hash: block.block_hash.clone(),
            is_replay,
        };
        self.store.write_index_state(tx, &state).await?;
        Ok(())
    }

    fn validate_sequence(
        &self,
        block: &Block,
        prior: Option<&IndexState>,
    ) -> Result<(), HandlerError> {
        match prior {
            None => {
                if block.block_number != self.start_at_block {
                    return Err(HandlerError::OutOfOrderBlock {
                        expected: self.start_at_block,
                        got: block.block_number,
                    });
                }
            }
            Some(state) => {
                if block.block_number != state.block_number + 1 {
                    return Err(HandlerError::OutOfOrderBlock {
                        expected: state.block_number + 1,
                        got: block.block_number,
                    });
                }
                if block.previous_block_hash != state.block_hash {
                    return Err(HandlerError::HashMismatch {
                        block_number: block.block_number,
                        expected: state.block_hash.clone(),
                        got: block.previous_block_hash.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(format!(
            "datastore call exceeded {}ms deadline",
            deadline.as_millis()
        ))),
    }
}
