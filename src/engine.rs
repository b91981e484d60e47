//! The boundary to the underlying ordered key-value engine.
//!
//! The engine is callback driven: every operation hands back a request whose
//! outcome is reported through `onsuccess` / `onerror` handlers, and
//! transactions and connections report lifecycle events the same way. The
//! traits are object safe and single threaded; backends live in
//! [`crate::memory`] and, in the browser, `crate::web`.

use std::rc::Rc;

use serde_json::Value;

use crate::{
    error::EngineError,
    key::Key,
    key_range::KeyRange,
    schema::{IndexParameters, StoreParameters},
    transaction::TransactionMode,
};

/// Event handler installed on a request, transaction or connection.
pub type Handler = Box<dyn FnMut()>;

/// Handler run inside the upgrade phase of a version-increasing open.
pub type UpgradeHandler = Box<dyn FnMut(&dyn UpgradeDatabase, VersionChange)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Pending,
    Done,
}

/// Versions involved in an upgrade. `old_version` is 0 for a fresh database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionChange {
    pub old_version: u32,
    pub new_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorDirection {
    Next,
    Prev,
}

/// What the engine can do beyond the baseline operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `delete` accepts a key range, not only a single key.
    pub ranged_delete: bool,
    /// Indexes accept a `locale` option.
    pub index_locale: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            ranged_delete: true,
            index_locale: false,
        }
    }
}

/// The entry a cursor currently points at.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorEntry {
    pub key: Key,
    pub value: Value,
}

/// A pending engine operation.
pub trait Request<T> {
    fn ready_state(&self) -> ReadyState;

    /// The outcome once `ready_state` is `Done`.
    fn result(&self) -> Result<T, EngineError>;

    fn set_onsuccess(&self, handler: Option<Handler>);

    fn set_onerror(&self, handler: Option<Handler>);
}

pub trait OpenRequest: Request<Rc<dyn Connection>> {
    fn set_onupgradeneeded(&self, handler: Option<UpgradeHandler>);

    /// Fired when another live connection prevents the upgrade.
    fn set_onblocked(&self, handler: Option<Handler>);
}

pub trait DeleteRequest: Request<()> {
    fn set_onblocked(&self, handler: Option<Handler>);
}

/// A cursor request reports once per position; `Ok(None)` past the end.
pub trait CursorRequest: Request<Option<CursorEntry>> {
    /// Move to the next position. The request goes back to `Pending` until
    /// the engine reports the new position.
    fn advance(&self) -> Result<(), EngineError>;
}

pub trait Factory {
    fn capabilities(&self) -> Capabilities;

    fn open(&self, name: &str, version: u32) -> Result<Rc<dyn OpenRequest>, EngineError>;

    fn delete_database(&self, name: &str) -> Result<Rc<dyn DeleteRequest>, EngineError>;
}

/// The database as seen from inside the upgrade phase.
pub trait UpgradeDatabase {
    fn object_store_names(&self) -> Vec<String>;

    fn create_object_store(
        &self,
        name: &str,
        parameters: &StoreParameters,
    ) -> Result<Rc<dyn SchemaStore>, EngineError>;

    fn delete_object_store(&self, name: &str) -> Result<(), EngineError>;

    /// Abort the upgrade; the open request then fails.
    fn abort(&self);
}

/// A store created during the upgrade phase.
pub trait SchemaStore {
    fn name(&self) -> String;

    fn create_index(&self, name: &str, parameters: &IndexParameters) -> Result<(), EngineError>;
}

pub trait Connection {
    fn name(&self) -> String;

    fn version(&self) -> u32;

    fn object_store_names(&self) -> Vec<String>;

    fn transaction(
        &self,
        store: &str,
        mode: TransactionMode,
    ) -> Result<Rc<dyn Transaction>, EngineError>;

    fn close(&self);

    /// Fired when the engine closes the connection on its own.
    fn set_onclose(&self, handler: Option<Handler>);

    /// Fired when another connection wants to upgrade or delete the database.
    fn set_onversionchange(&self, handler: Option<Handler>);
}

pub trait Transaction {
    fn object_store(&self, name: &str) -> Result<Rc<dyn ObjectStore>, EngineError>;

    fn abort(&self) -> Result<(), EngineError>;

    fn set_oncomplete(&self, handler: Option<Handler>);

    fn set_onabort(&self, handler: Option<Handler>);
}

pub trait ObjectStore {
    fn get(&self, key: &Key) -> Result<Rc<dyn Request<Option<Value>>>, EngineError>;

    /// Insert or replace. `key` is required for stores without a key path or
    /// key generator and forbidden for stores with a key path.
    fn put(&self, value: &Value, key: Option<&Key>) -> Result<Rc<dyn Request<Key>>, EngineError>;

    fn delete(&self, key: &Key) -> Result<Rc<dyn Request<()>>, EngineError>;

    /// Only available when [`Capabilities::ranged_delete`] is set.
    fn delete_range(&self, range: &KeyRange) -> Result<Rc<dyn Request<()>>, EngineError>;

    fn clear(&self) -> Result<Rc<dyn Request<()>>, EngineError>;

    fn count(&self, range: Option<&KeyRange>) -> Result<Rc<dyn Request<u64>>, EngineError>;

    fn open_cursor(
        &self,
        range: Option<&KeyRange>,
        direction: CursorDirection,
    ) -> Result<Rc<dyn CursorRequest>, EngineError>;
}
