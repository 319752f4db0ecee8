//! Chain adapter capability set, plus an in-memory chain for tests and
//! simulations.
//!
//! Concrete network clients (JSON-RPC, websocket, node-specific APIs)
//! implement [`ChainAdapter`] outside this crate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::ReaderError;
use crate::types::{Action, Block, BlockPointer};

/// Capabilities the reader needs from a chain client.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Current chain head block number.
    async fn head_block_number(&self) -> Result<u64, ReaderError>;

    /// Last irreversible block number. Chains without a finality gadget
    /// report the head.
    async fn irreversible_block_number(&self) -> Result<u64, ReaderError> {
        self.head_block_number().await
    }

    /// Fetch the block at `block_number`, or `None` if the chain has not
    /// produced that height yet.
    async fn get_block(&self, block_number: u64) -> Result<Option<Block>, ReaderError>;
}

// ─── In-memory chain (tests / simulations) ────────────────────────────────────

const GENESIS_PARENT_HASH: &str = "0x0000000000000000";

/// A programmable chain for tests, demos, and fork simulations.
///
/// Blocks are appended with auto-linked hashes; `reorg` replaces a suffix
/// of the chain with a fresh branch, and reachability can be toggled to
/// simulate an RPC outage.
#[derive(Clone, Default)]
pub struct InMemoryChain {
    inner: Arc<Mutex<ChainInner>>,
}

struct ChainInner {
    blocks: Vec<Block>,
    first_number: u64,
    irreversible: Option<u64>,
    reachable: bool,
    /// Hash counter. Survives reorgs so replacement blocks hash differently.
    sequence: u64,
}

impl Default for ChainInner {
    fn default() -> Self {
        Self {
            blocks: Vec::new(),
            first_number: 1,
            irreversible: None,
            reachable: true,
            sequence: 0,
        }
    }
}

impl InMemoryChain {
    /// Empty chain whose first appended block gets `first_number`.
    pub fn new(first_number: u64) -> Self {
        let chain = Self::default();
        chain.inner.lock().unwrap().first_number = first_number;
        chain
    }

    /// Append one block carrying `actions`; returns its pointer.
    ///
    /// Each action is stamped with the new block number; actions created
    /// via [`Action::new`] also get a transaction id and index.
    pub fn append(&self, actions: Vec<Action>) -> BlockPointer {
        let mut inner = self.inner.lock().unwrap();
        Self::push_block(&mut inner, actions)
    }

    /// Append `count` empty blocks.
    pub fn append_empty(&self, count: usize) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..count {
            Self::push_block(&mut inner, vec![]);
        }
    }

    /// Replace every block at or above `from_block` with a fresh branch,
    /// one entry of `new_blocks` per replacement block.
    pub fn reorg(&self, from_block: u64, new_blocks: Vec<Vec<Action>>) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            from_block >= inner.first_number,
            "cannot reorg below the first block"
        );
        let keep = (from_block - inner.first_number) as usize;
        inner.blocks.truncate(keep);
        for actions in new_blocks {
            Self::push_block(&mut inner, actions);
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().unwrap().reachable = reachable;
    }

    pub fn set_irreversible(&self, block_number: u64) {
        self.inner.lock().unwrap().irreversible = Some(block_number);
    }

    /// Pointer to the current tip, if any block exists.
    pub fn head(&self) -> Option<BlockPointer> {
        self.inner.lock().unwrap().blocks.last().map(Block::pointer)
    }

    /// Hash of the block at `block_number`, if present.
    pub fn hash_at(&self, block_number: u64) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        let idx = block_number.checked_sub(inner.first_number)? as usize;
        inner.blocks.get(idx).map(|b| b.block_hash.clone())
    }

    fn push_block(inner: &mut ChainInner, actions: Vec<Action>) -> BlockPointer {
        let block_number = inner.first_number + inner.blocks.len() as u64;
        let previous_block_hash = inner
            .blocks
            .last()
            .map(|b| b.block_hash.clone())
            .unwrap_or_else(|| GENESIS_PARENT_HASH.to_string());

        inner.sequence += 1;
        let block_hash = format!("0x{:016x}", inner.sequence);

        let actions = actions
            .into_iter()
            .enumerate()
            .map(|(i, mut action)| {
                action.block_number = block_number;
                if action.transaction_id.is_empty() {
                    action.transaction_id = format!("tx-{block_number}-{i}");
                    action.action_index = i as u32;
                }
                action
            })
            .collect();

        let block = Block {
            block_number,
            block_hash: block_hash.clone(),
            previous_block_hash,
            actions,
        };
        inner.blocks.push(block);

        BlockPointer {
            block_number,
            block_hash,
        }
    }
}

#[async_trait]
impl ChainAdapter for InMemoryChain {
    async fn head_block_number(&self) -> Result<u64, ReaderError> {
        let inner = self.inner.lock().unwrap();
        if !inner.reachable {
            return Err(ReaderError::ChainUnreachable("simulated outage".into()));
        }
        Ok(inner
            .blocks
            .last()
            .map(|b| b.block_number)
            .unwrap_or(inner.first_number.saturating_sub(1)))
    }

    async fn irreversible_block_number(&self) -> Result<u64, ReaderError> {
        let head = self.head_block_number().await?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.irreversible.unwrap_or(head))
    }

    async fn get_block(&self, block_number: u64) -> Result<Option<Block>, ReaderError> {
        let inner = self.inner.lock().unwrap();
        if !inner.reachable {
            return Err(ReaderError::ChainUnreachable("simulated outage".into()));
        }
        let Some(idx) = block_number.checked_sub(inner.first_number) else {
            return Ok(None);
        };
        Ok(inner.blocks.get(idx as usize).cloned())
    }
}
