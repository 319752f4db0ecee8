//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Errors surfaced by the action reader while walking the chain.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("chain unreachable: {0}")]
    ChainUnreachable(String),

    #[error("block {block_number} not found on chain")]
    BlockNotFound { block_number: u64 },

    #[error("malformed block at {block_number}: {reason}")]
    MalformedBlock { block_number: u64, reason: String },

    #[error("reorg deeper than the {window} tracked blocks")]
    ReorgTooDeep { window: usize },
}

impl ReaderError {
    /// Returns `true` if retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ChainUnreachable(_))
    }
}

/// Errors from a datastore backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("datastore unavailable: {0}")]
    Unavailable(String),

    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::CommitFailed(_))
    }
}

/// Error raised by a user-supplied updater. Aborts the block's transaction.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct UpdaterError(pub String);

impl From<&str> for UpdaterError {
    fn from(reason: &str) -> Self {
        Self(reason.to_string())
    }
}

impl From<String> for UpdaterError {
    fn from(reason: String) -> Self {
        Self(reason)
    }
}

/// Error raised by a user-supplied effect. Logged, never fatal.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct EffectError(pub String);

impl From<&str> for EffectError {
    fn from(reason: &str) -> Self {
        Self(reason.to_string())
    }
}

impl From<String> for EffectError {
    fn from(reason: String) -> Self {
        Self(reason)
    }
}

/// Errors from applying or rolling back a block.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("out-of-order block: expected {expected}, got {got}")]
    OutOfOrderBlock { expected: u64, got: u64 },

    #[error("hash mismatch at block {block_number}: index state has {expected}, block links to {got}")]
    HashMismatch {
        block_number: u64,
        expected: String,
        got: String,
    },

    #[error("updater for '{action_type}' failed at block {block_number}: {reason}")]
    Updater {
        action_type: String,
        block_number: u64,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HandlerError {
    /// Transient failures are retried by the watcher with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }

    /// Protocol violations: the block stream and the stored cursor
    /// disagree. Escalated to a rollback attempt when a fork is in play,
    /// fatal otherwise.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::OutOfOrderBlock { .. } | Self::HashMismatch { .. }
        )
    }

    pub fn is_updater(&self) -> bool {
        matches!(self, Self::Updater { .. })
    }
}

/// Fatal errors that terminate the watch loop. The watcher is the sole
/// component that decides fatality.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("gave up on block {block_number} after {attempts} attempts: {reason}")]
    RetriesExhausted {
        block_number: u64,
        attempts: u32,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_transience() {
        assert!(ReaderError::ChainUnreachable("down".into()).is_transient());
        assert!(!ReaderError::ReorgTooDeep { window: 180 }.is_transient());
        assert!(!ReaderError::BlockNotFound { block_number: 7 }.is_transient());
    }

    #[test]
    fn handler_transience_inherits_from_store() {
        let transient = HandlerError::Store(StoreError::CommitFailed("locked".into()));
        assert!(transient.is_transient());

        let fatal = HandlerError::OutOfOrderBlock {
            expected: 5,
            got: 9,
        };
        assert!(!fatal.is_transient());
    }

    #[test]
    fn protocol_classification() {
        assert!(HandlerError::OutOfOrderBlock { expected: 5, got: 9 }.is_protocol());
        assert!(HandlerError::HashMismatch {
            block_number: 5,
            expected: "0xa".into(),
            got: "0xb".into(),
        }
        .is_protocol());
        assert!(!HandlerError::Store(StoreError::Unavailable("down".into())).is_protocol());
    }

    #[test]
    fn updater_error_display() {
        let e = HandlerError::Updater {
            action_type: "transfer".into(),
            block_number: 150,
            reason: "bad payload".into(),
        };
        assert!(e.to_string().contains("transfer"));
        assert!(e.is_updater());
    }
}
