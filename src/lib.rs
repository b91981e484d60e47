//! A transactional key-value store client over an IndexedDB-style engine.
//!
//! [`StoreClient`] owns one database connection at a time. Opening a database
//! brings its stores in line with a list of [`StoreSpec`]s, and every read or
//! write against a store runs on a lazily created readwrite transaction that is
//! reused until the engine reports it complete.
//!
//! The engine sits behind the traits in [`engine`]. [`MemoryEngine`] is an
//! ordered in-memory implementation that runs anywhere; on `wasm32` the
//! browser's IndexedDB is available as `WebFactory`.

#[cfg(target_arch = "wasm32")]
#[macro_use]
mod macros;

mod client;
mod config;
mod cursor;
pub mod engine;
mod error;
mod key;
mod key_range;
pub mod memory;
mod request;
mod schema;
mod transaction;
#[cfg(target_arch = "wasm32")]
mod web;

pub use crate::{
    client::{delete_database, Entry, StoreClient},
    config::DatabaseConfig,
    cursor::CursorIterator,
    error::{EngineError, Error, Result},
    key::{Key, KeyPath},
    key_range::{DeleteTarget, IntoDeleteTarget, IntoKeyRange, KeyRange, KeyRangeDescriptor},
    memory::MemoryEngine,
    schema::{
        reconcile, validate_specs, HasKeyTable, IndexParameters, IndexSpec, StoreAction,
        StoreParameters, StoreSpec, StoreUpdatePlan,
    },
    transaction::TransactionMode,
};

#[cfg(target_arch = "wasm32")]
pub use crate::web::WebFactory;
