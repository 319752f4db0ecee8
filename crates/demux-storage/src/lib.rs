//! demux-storage — persistent datastore backends for the demux engine.
//!
//! Backends:
//! - [`sqlite`] — SQLite via `sqlx` (feature `sqlite`, on by default):
//!   embedded, single-file persistence with versioned rows for rollback.
//!
//! The in-memory backend lives in `demux_core::store`, next to the
//! `Datastore` trait it implements.

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteStore, SqliteTx};
