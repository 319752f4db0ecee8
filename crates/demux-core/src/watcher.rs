//! Action watcher — drives the reader/handler pair on a polling cadence
//! with replay and live-tip semantics.
//!
//! The watcher is the sole component that decides fatality: transient
//! failures are retried with bounded exponential backoff, updater
//! failures get exactly one retry (they are deterministic), and protocol
//! errors escalate to a rollback attempt while a fork is in play before
//! they exit the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::chain::ChainAdapter;
use crate::config::EngineConfig;
use crate::error::{HandlerError, ReaderError, WatcherError};
use crate::handler::ActionHandler;
use crate::reader::{ActionReader, ReaderEvent, ReaderState};
use crate::store::Datastore;
use crate::types::Block;

// ─── Backoff ──────────────────────────────────────────────────────────────────

/// Exponential backoff for transient failures: doubles from `base`, capped
/// at `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before the `attempt`-th retry (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let base_ms = self.base.as_millis() as u64;
        let ms = base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms).min(self.cap)
    }
}

// ─── Control ──────────────────────────────────────────────────────────────────

/// Cloneable control surface for a running watcher: pause, resume, cancel.
///
/// Cancellation is observed between iterations and interrupts backoff and
/// poll sleeps; an in-flight transaction is aborted by its own error path.
#[derive(Clone, Default)]
pub struct WatcherControl {
    inner: Arc<ControlInner>,
}

#[derive(Default)]
struct ControlInner {
    paused: AtomicBool,
    cancelled: AtomicBool,
    notify: Notify,
}

impl WatcherControl {
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep that wakes early on cancel/resume.
    async fn interruptible_sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.inner.notify.notified() => {}
        }
    }
}

// ─── Watcher ──────────────────────────────────────────────────────────────────

/// Outcome of a single watch iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Applied { block_number: u64, is_replay: bool },
    RolledBack { to: u64 },
    Idle,
}

/// Polls the reader and pushes blocks through the handler, one block per
/// iteration so rollbacks interrupt promptly.
pub struct ActionWatcher<C: ChainAdapter, D: Datastore> {
    reader: ActionReader<C>,
    handler: ActionHandler<D>,
    config: EngineConfig,
    backoff: Backoff,
    control: WatcherControl,
    /// Blocks at or below this height are replays. Locked on the first
    /// iteration from the observed chain head unless configured.
    replay_target: Option<u64>,
    /// Once a block beyond the replay target commits, live mode is
    /// permanent — even for rolled-back heights re-applied later.
    gone_live: bool,
    /// Set while recovering from a rollback; cleared by the next
    /// successful apply. Protocol errors in this window are escalated to
    /// a rollback attempt instead of fatal.
    fork_recovery: bool,
    /// One cursor realignment per recovery episode.
    realign_attempted: bool,
    reader_failures: u32,
}

enum ApplyOutcome {
    Applied,
    Realigned { resume_at: u64 },
}

impl<C: ChainAdapter, D: Datastore> ActionWatcher<C, D> {
    pub fn new(reader: ActionReader<C>, handler: ActionHandler<D>, config: EngineConfig) -> Self {
        let poll = config.poll_interval();
        Self {
            reader,
            handler,
            backoff: Backoff::new(poll, poll * 30),
            control: WatcherControl::default(),
            replay_target: config.replay_target,
            gone_live: false,
            fork_recovery: false,
            realign_attempted: false,
            reader_failures: 0,
            config,
        }
    }

    /// Control handle for pausing and cancelling from outside the loop.
    pub fn control(&self) -> WatcherControl {
        self.control.clone()
    }

    pub fn handler(&self) -> &ActionHandler<D> {
        &self.handler
    }

    pub fn reader(&self) -> &ActionReader<C> {
        &self.reader
    }

    /// Poll indefinitely until cancelled (`Ok`) or a fatal error (`Err`).
    pub async fn watch(&mut self) -> Result<(), WatcherError> {
        info!(start = self.config.start_at_block, "watcher starting");
        loop {
            if self.control.is_cancelled() {
                info!("watcher cancelled");
                return Ok(());
            }
            if self.control.is_paused() {
                self.control
                    .interruptible_sleep(self.config.poll_interval())
                    .await;
                continue;
            }

            match self.check_for_blocks().await {
                Ok(Tick::Idle) => {
                    self.control
                        .interruptible_sleep(self.config.poll_interval())
                        .await;
                }
                Ok(_) => {}
                Err(WatcherError::Reader(e)) if e.is_transient() => {
                    self.reader_failures += 1;
                    if self.reader_failures > self.config.max_retries {
                        error!(
                            attempts = self.reader_failures,
                            "chain unreachable, giving up: {e}"
                        );
                        return Err(WatcherError::Reader(e));
                    }
                    warn!(attempt = self.reader_failures, "transient reader failure: {e}");
                    self.control
                        .interruptible_sleep(self.backoff.delay(self.reader_failures))
                        .await;
                }
                Err(WatcherError::Reader(e))
                    if !matches!(e, ReaderError::ReorgTooDeep { .. })
                        && self.reader.state() == ReaderState::Rewinding =>
                {
                    // The fork walk was interrupted mid-rewind; retry so
                    // the reader can finish resolving the rollback.
                    self.reader_failures += 1;
                    if self.reader_failures > self.config.max_retries {
                        error!(
                            attempts = self.reader_failures,
                            "fork resolution keeps failing, giving up: {e}"
                        );
                        return Err(WatcherError::Reader(e));
                    }
                    warn!(
                        attempt = self.reader_failures,
                        "fork walk interrupted, retrying rollback: {e}"
                    );
                    self.control
                        .interruptible_sleep(self.backoff.delay(self.reader_failures))
                        .await;
                }
                Err(e) => {
                    error!("fatal watcher error: {e}");
                    return Err(e);
                }
            }
        }
    }

    /// One iteration: pull the next reader event and drive the handler.
    pub async fn check_for_blocks(&mut self) -> Result<Tick, WatcherError> {
        let replay_target = self.replay_target().await?;

        match self.reader.get_next_block().await? {
            ReaderEvent::NewBlock(block) => {
                self.reader_failures = 0;
                let is_replay = !self.gone_live && block.block_number <= replay_target;
                match self.apply_with_retry(&block, is_replay).await? {
                    ApplyOutcome::Applied => {
                        self.fork_recovery = false;
                        self.realign_attempted = false;
                        if block.block_number > replay_target {
                            self.gone_live = true;
                        }
                        Ok(Tick::Applied {
                            block_number: block.block_number,
                            is_replay,
                        })
                    }
                    ApplyOutcome::Realigned { resume_at } => {
                        self.fork_recovery = true;
                        Ok(Tick::RolledBack { to: resume_at })
                    }
                }
            }
            ReaderEvent::Rollback(target) => {
                self.reader_failures = 0;
                self.handler
                    .rollback_to(target)
                    .await
                    .map_err(WatcherError::Handler)?;
                self.fork_recovery = true;
                Ok(Tick::RolledBack { to: target })
            }
            ReaderEvent::NoNewBlock => {
                self.reader_failures = 0;
                Ok(Tick::Idle)
            }
        }
    }

    async fn replay_target(&mut self) -> Result<u64, WatcherError> {
        if let Some(target) = self.replay_target {
            return Ok(target);
        }
        let head = self
            .reader
            .chain()
            .head_block_number()
            .await
            .map_err(WatcherError::Reader)?;
        info!(replay_target = head, "replay boundary locked at chain head");
        self.replay_target = Some(head);
        Ok(head)
    }

    async fn apply_with_retry(
        &mut self,
        block: &Block,
        is_replay: bool,
    ) -> Result<ApplyOutcome, WatcherError> {
        let mut attempts = 0u32;
        loop {
            match self.handler.handle_block(block, is_replay).await {
                Ok(()) => return Ok(ApplyOutcome::Applied),
                Err(e) if e.is_transient() => {
                    attempts += 1;
                    if attempts > self.config.max_retries {
                        return Err(WatcherError::RetriesExhausted {
                            block_number: block.block_number,
                            attempts,
                            reason: e.to_string(),
                        });
                    }
                    warn!(
                        block = block.block_number,
                        attempt = attempts,
                        "transient apply failure: {e}"
                    );
                    self.control
                        .interruptible_sleep(self.backoff.delay(attempts))
                        .await;
                    if self.control.is_cancelled() {
                        return Ok(ApplyOutcome::Applied);
                    }
                }
                Err(e @ HandlerError::Updater { .. }) => {
                    attempts += 1;
                    if attempts > 1 {
                        return Err(WatcherError::Handler(e));
                    }
                    warn!(block = block.block_number, "updater failed, retrying once: {e}");
                }
                Err(e) if e.is_protocol() && self.fork_in_play() && !self.realign_attempted => {
                    return self.realign_to_cursor(block, e).await;
                }
                Err(e) => return Err(WatcherError::Handler(e)),
            }
        }
    }

    /// A protocol error counts as part of a fork when the reader is
    /// mid-rewind or a rollback was just processed.
    fn fork_in_play(&self) -> bool {
        self.fork_recovery || self.reader.state() == ReaderState::Rewinding
    }

    /// Roll both sides back to the durable cursor after the store and the
    /// reader diverged during fork recovery (e.g. the datastore restored
    /// deeper than the rollback target).
    async fn realign_to_cursor(
        &mut self,
        block: &Block,
        cause: HandlerError,
    ) -> Result<ApplyOutcome, WatcherError> {
        self.realign_attempted = true;
        let resume_at = match self
            .handler
            .load_index_state()
            .await
            .map_err(WatcherError::Handler)?
        {
            Some(state) => state.block_number + 1,
            None => self.config.start_at_block,
        };
        warn!(
            block = block.block_number,
            resume_at, "cursor diverged during fork recovery, realigning: {cause}"
        );
        self.handler
            .rollback_to(resume_at)
            .await
            .map_err(WatcherError::Handler)?;
        self.reader.seek_to_block(resume_at);
        Ok(ApplyOutcome::Realigned { resume_at })
    }
}
