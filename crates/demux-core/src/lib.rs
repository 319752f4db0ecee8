//! demux-core — deterministic ingestion and dispatch engine for
//! reorg-capable chains.
//!
//! Walks a chain forward block by block, applies deterministic updaters to
//! a side datastore under one transaction per block, and fires
//! non-deterministic effects asynchronously on the live tip only. Forks
//! are detected by parent-hash linkage and resolved by rewinding both the
//! reader and the datastore to the deepest surviving block.
//!
//! # Architecture
//!
//! ```text
//! ActionWatcher   (poll loop, retry/backoff, replay boundary)
//!     ├── ActionReader    (cursor, BlockHistory, fork walk, LIB gate)
//!     │       └── ChainAdapter  (head / LIB / get_block)
//!     └── ActionHandler   (updaters in one tx per block, IndexState)
//!             ├── Datastore        (begin / commit / rollback_to)
//!             └── EffectDispatcher (per-type async lanes, live only)
//! ```

pub mod chain;
pub mod config;
pub mod effects;
pub mod error;
pub mod handler;
pub mod history;
pub mod reader;
pub mod store;
pub mod types;
pub mod watcher;

pub use chain::{ChainAdapter, InMemoryChain};
pub use config::{EffectRunMode, EngineConfig};
pub use effects::{Effect, EffectDispatcher};
pub use error::{
    EffectError, HandlerError, ReaderError, StoreError, UpdaterError, WatcherError,
};
pub use handler::{ActionHandler, Updater};
pub use history::BlockHistory;
pub use reader::{ActionReader, ReaderEvent, ReaderState};
pub use store::{Datastore, MemoryStore, MemoryTx};
pub use types::{Action, ApplyContext, Block, BlockPointer, EffectContext, IndexState};
pub use watcher::{ActionWatcher, Backoff, Tick, WatcherControl};
