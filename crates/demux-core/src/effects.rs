//! Asynchronous effect dispatch.
//!
//! Effects run on per-action-type lanes: enqueue order is preserved within
//! a type, while lanes interleave freely across types. In fire-and-forget
//! mode each lane is a queue drained by a background task, so effect
//! completion never blocks the ingestion lane; in await mode effects run
//! inline after the block commits.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::config::EffectRunMode;
use crate::error::EffectError;
use crate::types::{Action, Block, EffectContext};

/// Non-deterministic side effect, fired on live canonical blocks only.
///
/// Effects receive a read-only context and never see the datastore
/// transaction. Failures are logged and do not affect ingestion.
#[async_trait]
pub trait Effect: Send + Sync {
    /// Action type this effect subscribes to.
    fn action_type(&self) -> &str;

    async fn run(
        &self,
        payload: &Value,
        block: &Block,
        ctx: &EffectContext,
    ) -> Result<(), EffectError>;
}

struct EffectJob {
    action: Action,
    block: Arc<Block>,
}

#[derive(Default)]
struct Lane {
    jobs: Mutex<VecDeque<EffectJob>>,
    notify: Notify,
    closed: AtomicBool,
}

struct LaneHandle {
    lane: Arc<Lane>,
    _worker: JoinHandle<()>,
}

/// Routes committed blocks' actions to their registered effects.
pub struct EffectDispatcher {
    registry: HashMap<String, Vec<Arc<dyn Effect>>>,
    run_mode: EffectRunMode,
    /// Lanes are created lazily, one per action type with registered effects.
    lanes: Mutex<HashMap<String, LaneHandle>>,
    /// Highest block number any effect has executed for.
    executed_watermark: Arc<AtomicU64>,
}

impl EffectDispatcher {
    /// Build from an ordered sequence; multiple effects per action type
    /// run in registration order.
    pub fn new(effects: Vec<Arc<dyn Effect>>, run_mode: EffectRunMode) -> Self {
        let mut registry: HashMap<String, Vec<Arc<dyn Effect>>> = HashMap::new();
        for effect in effects {
            registry
                .entry(effect.action_type().to_string())
                .or_default()
                .push(effect);
        }
        Self {
            registry,
            run_mode,
            lanes: Mutex::new(HashMap::new()),
            executed_watermark: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Dispatch all matching effects for a committed live block.
    pub async fn dispatch(&self, block: &Block) {
        match self.run_mode {
            EffectRunMode::Await => self.dispatch_inline(block).await,
            EffectRunMode::FireAndForget => self.enqueue(block),
        }
    }

    /// Drop queued effects for blocks at or above `target`. Effects that
    /// already executed for those heights cannot be unwound; that case is
    /// logged as a warning.
    pub fn discard_from(&self, target: u64) {
        let lanes = self.lanes.lock().unwrap();
        let mut dropped = 0usize;
        for handle in lanes.values() {
            let mut jobs = handle.lane.jobs.lock().unwrap();
            let before = jobs.len();
            jobs.retain(|job| job.block.block_number < target);
            dropped += before - jobs.len();
        }
        if dropped > 0 {
            warn!(target, dropped, "dropped pending effects for rolled-back blocks");
        }
        if self.executed_watermark.load(Ordering::Relaxed) >= target {
            warn!(
                target,
                "effects already executed for rolled-back blocks cannot be unwound"
            );
        }
    }

    /// Number of queued (not yet started) effect jobs across all lanes.
    pub fn pending(&self) -> usize {
        self.lanes
            .lock()
            .unwrap()
            .values()
            .map(|handle| handle.lane.jobs.lock().unwrap().len())
            .sum()
    }

    /// Close all lanes; workers drain their queues and exit.
    pub fn shutdown(&self) {
        let lanes = self.lanes.lock().unwrap();
        for handle in lanes.values() {
            handle.lane.closed.store(true, Ordering::Release);
            handle.lane.notify.notify_one();
        }
    }

    async fn dispatch_inline(&self, block: &Block) {
        let ctx = EffectContext {
            block_number: block.block_number,
            block_hash: block.block_hash.clone(),
        };
        for action in &block.actions {
            let Some(effects) = self.registry.get(&action.action_type) else {
                continue;
            };
            for effect in effects {
                if let Err(e) = effect.run(&action.payload, block, &ctx).await {
                    error!(
                        action_type = %action.action_type,
                        block = block.block_number,
                        "effect failed: {e}"
                    );
                }
            }
            self.executed_watermark
                .fetch_max(block.block_number, Ordering::Relaxed);
        }
    }

    fn enqueue(&self, block: &Block) {
        let shared = Arc::new(block.clone());
        let mut lanes = self.lanes.lock().unwrap();
        for action in &block.actions {
            if !self.registry.contains_key(&action.action_type) {
                continue;
            }
            let handle = lanes
                .entry(action.action_type.clone())
                .or_insert_with(|| self.spawn_lane(&action.action_type));
            handle.lane.jobs.lock().unwrap().push_back(EffectJob {
                action: action.clone(),
                block: Arc::clone(&shared),
            });
            handle.lane.notify.notify_one();
        }
    }

    fn spawn_lane(&self, action_type: &str) -> LaneHandle {
        let lane = Arc::new(Lane::default());
        let effects = self.registry.get(action_type).cloned().unwrap_or_default();
        let watermark = Arc::clone(&self.executed_watermark);
        let worker_lane = Arc::clone(&lane);

        let worker = tokio::spawn(async move {
            loop {
                let job = worker_lane.jobs.lock().unwrap().pop_front();
                match job {
                    Some(job) => {
                        let ctx = EffectContext {
                            block_number: job.block.block_number,
                            block_hash: job.block.block_hash.clone(),
                        };
                        for effect in &effects {
                            if let Err(e) =
                                effect.run(&job.action.payload, &job.block, &ctx).await
                            {
                                error!(
                                    action_type = %job.action.action_type,
                                    block = job.block.block_number,
                                    "effect failed: {e}"
                                );
                            }
                        }
                        watermark.fetch_max(job.block.block_number, Ordering::Relaxed);
                    }
                    None => {
                        if worker_lane.closed.load(Ordering::Acquire) {
                            break;
                        }
                        worker_lane.notify.notified().await;
                    }
                }
            }
        });

        LaneHandle {
            lane,
            _worker: worker,
        }
    }
}

impl Drop for EffectDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
