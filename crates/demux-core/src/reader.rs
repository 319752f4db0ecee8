//! Action reader — walks the chain forward, detects forks, and rewinds.
//!
//! The reader delivers a strictly causal stream: every `NewBlock` extends
//! the previous one by hash link, and any divergence is reported as a
//! single `Rollback` before streaming resumes on the surviving branch.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{info, warn};

use crate::chain::ChainAdapter;
use crate::config::EngineConfig;
use crate::error::ReaderError;
use crate::history::BlockHistory;
use crate::types::{Block, BlockPointer};

/// One step of the reader's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    /// The next canonical block after the current head.
    NewBlock(Block),
    /// The chain diverged; the handler must discard blocks at and above
    /// the target before streaming resumes.
    Rollback(u64),
    /// Head is caught up; back off and poll again.
    NoNewBlock,
}

/// Reader lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// No block delivered yet (fresh start or after a seek).
    Initializing,
    /// Following the chain block by block.
    Streaming,
    /// Resolving a detected fork.
    Rewinding,
}

impl std::fmt::Display for ReaderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Streaming => write!(f, "streaming"),
            Self::Rewinding => write!(f, "rewinding"),
        }
    }
}

/// Walks the chain via a [`ChainAdapter`], maintaining a cursor and a
/// sliding window of accepted block pointers for fork resolution.
pub struct ActionReader<C: ChainAdapter> {
    chain: C,
    only_irreversible: bool,
    call_timeout: Duration,
    history: BlockHistory,
    /// Last delivered block number; the next candidate is `cursor + 1`.
    cursor: u64,
    state: ReaderState,
}

impl<C: ChainAdapter> ActionReader<C> {
    pub fn new(chain: C, config: &EngineConfig) -> Self {
        Self {
            chain,
            only_irreversible: config.only_irreversible,
            call_timeout: config.call_timeout(),
            history: BlockHistory::new(config.history_window as usize),
            cursor: config.start_at_block.saturating_sub(1),
            state: ReaderState::Initializing,
        }
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// The last accepted block, if any.
    pub fn head(&self) -> Option<&BlockPointer> {
        self.history.head()
    }

    /// Reset the cursor so the next `get_next_block` returns `block_number`.
    /// Clears the history window; the first block after a seek is accepted
    /// without a parent-hash check.
    pub fn seek_to_block(&mut self, block_number: u64) {
        self.cursor = block_number.saturating_sub(1);
        self.history.clear();
        self.state = ReaderState::Initializing;
        info!(block = block_number, "reader seek");
    }

    /// Advance one step: the next canonical block, a rollback signal, or
    /// nothing new.
    pub async fn get_next_block(&mut self) -> Result<ReaderEvent, ReaderError> {
        let next = self.cursor + 1;

        let gate = if self.only_irreversible {
            self.with_deadline(self.chain.irreversible_block_number())
                .await?
        } else {
            self.with_deadline(self.chain.head_block_number()).await?
        };
        if next > gate {
            return Ok(ReaderEvent::NoNewBlock);
        }

        let candidate = match self.fetch_block(next).await? {
            Some(block) => block,
            None => return Ok(ReaderEvent::NoNewBlock),
        };

        if let Some(head) = self.history.head() {
            if !candidate.extends(head) {
                warn!(
                    at = next,
                    expected = %head.block_hash,
                    got = %candidate.previous_block_hash,
                    "parent hash mismatch, resolving fork"
                );
                return self.resolve_fork().await;
            }
        }

        self.history.push(candidate.pointer());
        self.cursor = next;
        self.state = ReaderState::Streaming;
        Ok(ReaderEvent::NewBlock(candidate))
    }

    /// Walk the window newest-first against the live chain. The greatest
    /// height whose stored hash still matches becomes the new head; the
    /// handler rolls back to one past it.
    async fn resolve_fork(&mut self) -> Result<ReaderEvent, ReaderError> {
        self.state = ReaderState::Rewinding;

        let tracked: Vec<BlockPointer> = self.history.newest_first().cloned().collect();
        for pointer in tracked {
            let on_chain = self
                .fetch_block(pointer.block_number)
                .await?
                .ok_or(ReaderError::BlockNotFound {
                    block_number: pointer.block_number,
                })?;
            if on_chain.block_hash == pointer.block_hash {
                let resume_at = pointer.block_number + 1;
                self.history.rewind_to(pointer.block_number);
                self.cursor = pointer.block_number;
                self.state = ReaderState::Streaming;
                warn!(
                    fork_point = pointer.block_number,
                    resume_at, "fork resolved"
                );
                return Ok(ReaderEvent::Rollback(resume_at));
            }
        }

        Err(ReaderError::ReorgTooDeep {
            window: self.history.len(),
        })
    }

    async fn fetch_block(&self, block_number: u64) -> Result<Option<Block>, ReaderError> {
        let block = self
            .with_deadline(self.chain.get_block(block_number))
            .await?;
        if let Some(b) = &block {
            if b.block_number != block_number {
                return Err(ReaderError::MalformedBlock {
                    block_number,
                    reason: format!("chain returned block {}", b.block_number),
                });
            }
        }
        Ok(block)
    }

    async fn with_deadline<T, F>(&self, fut: F) -> Result<T, ReaderError>
    where
        F: Future<Output = Result<T, ReaderError>>,
    {
        match timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ReaderError::ChainUnreachable(format!(
                "call exceeded {}ms deadline",
                self.call_timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::InMemoryChain;
    use async_trait::async_trait;

    fn reader_at(chain: InMemoryChain, start: u64) -> ActionReader<InMemoryChain> {
        let config = EngineConfig::new().with_start_at_block(start);
        ActionReader::new(chain, &config)
    }

    async fn expect_block(reader: &mut ActionReader<InMemoryChain>, number: u64) -> Block {
        match reader.get_next_block().await.unwrap() {
            ReaderEvent::NewBlock(b) => {
                assert_eq!(b.block_number, number);
                b
            }
            other => panic!("expected NewBlock({number}), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn streams_sequential_blocks() {
        let chain = InMemoryChain::new(100);
        chain.append_empty(3);
        let mut reader = reader_at(chain, 100);

        assert_eq!(reader.state(), ReaderState::Initializing);
        for n in 100..=102 {
            expect_block(&mut reader, n).await;
        }
        assert_eq!(reader.state(), ReaderState::Streaming);
        assert_eq!(reader.head().unwrap().block_number, 102);
    }

    #[tokio::test]
    async fn no_new_block_when_caught_up() {
        let chain = InMemoryChain::new(1);
        chain.append_empty(1);
        let mut reader = reader_at(chain.clone(), 1);

        expect_block(&mut reader, 1).await;
        assert_eq!(
            reader.get_next_block().await.unwrap(),
            ReaderEvent::NoNewBlock
        );

        chain.append_empty(1);
        expect_block(&mut reader, 2).await;
    }

    #[tokio::test]
    async fn no_new_block_before_start_height_exists() {
        let chain = InMemoryChain::new(1);
        chain.append_empty(2); // head = 2
        let mut reader = reader_at(chain.clone(), 5);

        assert_eq!(
            reader.get_next_block().await.unwrap(),
            ReaderEvent::NoNewBlock
        );
        chain.append_empty(3); // head = 5
        expect_block(&mut reader, 5).await;
    }

    #[tokio::test]
    async fn shallow_fork_emits_one_rollback_then_resumes() {
        let chain = InMemoryChain::new(100);
        chain.append_empty(4); // 100..=103
        let mut reader = reader_at(chain.clone(), 100);
        for n in 100..=103 {
            expect_block(&mut reader, n).await;
        }

        // Reorg at 102: branch 102'..104'.
        chain.reorg(102, vec![vec![], vec![], vec![]]);

        assert_eq!(
            reader.get_next_block().await.unwrap(),
            ReaderEvent::Rollback(102)
        );
        assert_eq!(reader.head().unwrap().block_number, 101);

        for n in 102..=104 {
            let b = expect_block(&mut reader, n).await;
            assert_eq!(b.block_hash, chain.hash_at(n).unwrap());
        }
    }

    #[tokio::test]
    async fn fork_deeper_than_window_is_fatal() {
        let chain = InMemoryChain::new(100);
        chain.append_empty(11); // 100..=110
        let config = EngineConfig::new()
            .with_start_at_block(100)
            .with_history_window(5);
        let mut reader = ActionReader::new(chain.clone(), &config);
        for n in 100..=110 {
            expect_block(&mut reader, n).await;
        }

        // Fork originates 8 blocks back — beyond the 5-block window.
        chain.reorg(
            103,
            (0..9).map(|_| vec![]).collect(),
        );

        let err = reader.get_next_block().await.unwrap_err();
        assert!(matches!(err, ReaderError::ReorgTooDeep { window: 5 }));
    }

    #[tokio::test]
    async fn irreversible_gate_holds_back_tip() {
        let chain = InMemoryChain::new(1);
        chain.append_empty(10);
        chain.set_irreversible(4);
        let config = EngineConfig::new().with_only_irreversible(true);
        let mut reader = ActionReader::new(chain.clone(), &config);

        for n in 1..=4 {
            expect_block(&mut reader, n).await;
        }
        assert_eq!(
            reader.get_next_block().await.unwrap(),
            ReaderEvent::NoNewBlock
        );

        chain.set_irreversible(6);
        expect_block(&mut reader, 5).await;
    }

    #[tokio::test]
    async fn seek_resets_cursor_and_window() {
        let chain = InMemoryChain::new(1);
        chain.append_empty(6);
        let mut reader = reader_at(chain, 1);
        for n in 1..=6 {
            expect_block(&mut reader, n).await;
        }

        reader.seek_to_block(3);
        assert_eq!(reader.state(), ReaderState::Initializing);
        assert!(reader.head().is_none());
        expect_block(&mut reader, 3).await;
        expect_block(&mut reader, 4).await;
    }

    #[tokio::test]
    async fn transient_outage_surfaces_and_recovers() {
        let chain = InMemoryChain::new(1);
        chain.append_empty(2);
        let mut reader = reader_at(chain.clone(), 1);
        expect_block(&mut reader, 1).await;

        chain.set_reachable(false);
        let err = reader.get_next_block().await.unwrap_err();
        assert!(err.is_transient());

        chain.set_reachable(true);
        expect_block(&mut reader, 2).await;
    }

    struct WrongNumberChain;

    #[async_trait]
    impl ChainAdapter for WrongNumberChain {
        async fn head_block_number(&self) -> Result<u64, ReaderError> {
            Ok(10)
        }

        async fn get_block(&self, block_number: u64) -> Result<Option<Block>, ReaderError> {
            Ok(Some(Block {
                block_number: block_number + 1,
                block_hash: "0xbad".into(),
                previous_block_hash: "0x0".into(),
                actions: vec![],
            }))
        }
    }

    #[tokio::test]
    async fn wrong_height_response_is_malformed() {
        let config = EngineConfig::new();
        let mut reader = ActionReader::new(WrongNumberChain, &config);
        let err = reader.get_next_block().await.unwrap_err();
        assert!(matches!(err, ReaderError::MalformedBlock { block_number: 1, .. }));
    }
}
