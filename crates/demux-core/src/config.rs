//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the watcher treats effect completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EffectRunMode {
    /// Enqueue effects and move on without waiting (default).
    FireAndForget,
    /// Block the ingestion lane until every effect for the block completes.
    Await,
}

/// Configuration for a reader/handler/watcher trio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// First block to ingest.
    pub start_at_block: u64,
    /// Only deliver blocks at or below the last irreversible block.
    pub only_irreversible: bool,
    /// Watcher sleep between polls (milliseconds). Typical: half the
    /// chain's block time.
    pub poll_interval_ms: u64,
    /// Fork-detection window depth, in blocks. Must cover the deepest
    /// reorg the chain can produce.
    pub history_window: u32,
    /// Retry budget per block for transient failures.
    pub max_retries: u32,
    /// Whether the watcher blocks on effect completion.
    pub effect_run_mode: EffectRunMode,
    /// Per-call deadline for chain and datastore I/O (milliseconds).
    pub call_timeout_ms: u64,
    /// Replay boundary override. `None` = chain head observed when the
    /// watcher starts; blocks at or below it are applied as replays.
    pub replay_target: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            start_at_block: 1,
            only_irreversible: false,
            poll_interval_ms: 250,
            history_window: 180,
            max_retries: 10,
            effect_run_mode: EffectRunMode::FireAndForget,
            call_timeout_ms: 30_000,
            replay_target: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start_at_block(mut self, block: u64) -> Self {
        self.start_at_block = block;
        self
    }

    pub fn with_only_irreversible(mut self, gate: bool) -> Self {
        self.only_irreversible = gate;
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_history_window(mut self, blocks: u32) -> Self {
        self.history_window = blocks;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_effect_run_mode(mut self, mode: EffectRunMode) -> Self {
        self.effect_run_mode = mode;
        self
    }

    pub fn with_call_timeout_ms(mut self, ms: u64) -> Self {
        self.call_timeout_ms = ms;
        self
    }

    pub fn with_replay_target(mut self, block: u64) -> Self {
        self.replay_target = Some(block);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
