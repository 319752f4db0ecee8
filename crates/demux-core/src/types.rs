//! Shared types for the ingestion and dispatch pipeline.

use serde::{Deserialize, Serialize};

// ─── Block ────────────────────────────────────────────────────────────────────

/// A block as delivered by the chain adapter.
///
/// `previous_block_hash` must equal the hash of the block one height below
/// on the same branch; the reader rejects anything else as a fork signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Block height, strictly monotonic on the canonical chain.
    pub block_number: u64,
    /// Unique block identifier.
    pub block_hash: String,
    /// Hash of the block at `block_number - 1` on the same branch.
    pub previous_block_hash: String,
    /// Actions in execution order.
    pub actions: Vec<Action>,
}

impl Block {
    /// Returns `true` if `self` directly extends the block behind `parent`.
    pub fn extends(&self, parent: &BlockPointer) -> bool {
        self.block_number == parent.block_number + 1
            && self.previous_block_hash == parent.block_hash
    }

    /// Pointer to this block for the history window.
    pub fn pointer(&self) -> BlockPointer {
        BlockPointer {
            block_number: self.block_number,
            block_hash: self.block_hash.clone(),
        }
    }
}

// ─── Action ───────────────────────────────────────────────────────────────────

/// A typed event/transaction item inside a block.
///
/// Actions arrive pre-ordered by `(transaction_id order, action_index)`;
/// the handler applies them in the order given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Selects which updaters and effects fire.
    pub action_type: String,
    /// Opaque, action-type-specific payload.
    pub payload: serde_json::Value,
    /// Height of the containing block.
    pub block_number: u64,
    /// Identifier of the containing transaction.
    pub transaction_id: String,
    /// Position within the transaction.
    pub action_index: u32,
}

impl Action {
    /// Create an action with just a type and payload. Block placement
    /// fields are stamped when the action lands in a block.
    pub fn new(action_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            action_type: action_type.into(),
            payload,
            block_number: 0,
            transaction_id: String::new(),
            action_index: 0,
        }
    }
}

// ─── BlockPointer ─────────────────────────────────────────────────────────────

/// A `(block_number, block_hash)` pair — what the history window retains
/// per accepted block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPointer {
    pub block_number: u64,
    pub block_hash: String,
}

// ─── IndexState ───────────────────────────────────────────────────────────────

/// The sole durable cursor, persisted in the user's datastore and written
/// in the same transaction that applies a block's updaters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    /// Last successfully applied block number.
    pub block_number: u64,
    /// Last successfully applied block hash.
    pub block_hash: String,
    /// Whether that block was applied during catch-up replay.
    pub is_replay: bool,
}

// ─── Handler contexts ─────────────────────────────────────────────────────────

/// Context handed to every updater invocation.
#[derive(Debug, Clone)]
pub struct ApplyContext {
    pub block_number: u64,
    pub block_hash: String,
    pub is_replay: bool,
}

/// Read-only context handed to effects. Effects never see the datastore
/// transaction.
#[derive(Debug, Clone)]
pub struct EffectContext {
    pub block_number: u64,
    pub block_hash: String,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
