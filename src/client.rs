use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use futures::future::try_join_all;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::DatabaseConfig,
    cursor::CursorIterator,
    engine::{
        Connection, CursorDirection, CursorEntry, DeleteRequest, Factory, Handler, ObjectStore,
        OpenRequest, UpgradeDatabase, UpgradeHandler, VersionChange,
    },
    error::{EngineError, Error, Result},
    key::Key,
    key_range::{DeleteTarget, IntoDeleteTarget, IntoKeyRange, KeyRangeDescriptor},
    request::RequestFuture,
    schema::{reconcile, validate_specs, HasKeyTable, StoreSpec},
    transaction::TransactionCache,
};

/// One write to a store that needs its key passed explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<V> {
    pub key: Key,
    pub value: V,
}

impl<V> Entry<V> {
    pub fn new(key: impl Into<Key>, value: V) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

type WarningHandler = Rc<dyn Fn(&Error)>;

struct Live {
    connection: Rc<dyn Connection>,
    generation: u64,
}

struct ClientState {
    live: RefCell<Option<Live>>,
    generation: Cell<u64>,
    has_key: RefCell<HasKeyTable>,
    cache: Rc<TransactionCache>,
    warning: RefCell<Option<WarningHandler>>,
}

impl ClientState {
    fn warn(&self, warning: Error) {
        tracing::warn!(%warning, "storage warning");
        let handler = self.warning.borrow().clone();
        if let Some(handler) = handler {
            handler(&warning);
        }
    }

    /// Forget the connection of `generation`, if it is still the live one.
    fn lose(&self, generation: u64, reason: &str) {
        let live = {
            let mut live = self.live.borrow_mut();
            match &*live {
                Some(current) if current.generation == generation => live.take(),
                _ => None,
            }
        };

        if let Some(live) = live {
            tracing::warn!(database = %live.connection.name(), reason, "connection lost");
            live.connection.set_onclose(None);
            live.connection.set_onversionchange(None);
            live.connection.close();
            self.cache.clear();
        }
    }
}

fn blocked_handler(state: Weak<ClientState>, warning: impl Fn() -> Error + 'static) -> Handler {
    Box::new(move || {
        let warning = warning();
        match state.upgrade() {
            Some(state) => state.warn(warning),
            None => tracing::warn!(%warning, "storage warning"),
        }
    })
}

/// A client for one database at a time.
///
/// Writes and reads against a store are issued on that store's cached
/// readwrite transaction, so requests made back to back commit together. Every
/// operation checks that a database is open and that the store was declared
/// in the last open call before anything reaches the engine.
///
/// # Examples
///
/// ```
/// use idb_kv::{KeyRangeDescriptor, MemoryEngine, StoreClient, StoreSpec};
/// use serde_json::{json, Value};
///
/// let engine = MemoryEngine::new();
/// let client = StoreClient::new(engine.clone());
/// let specs = [StoreSpec::new("kv").key_path("key")];
///
/// let first = engine
///     .run_until_complete(async {
///         client.open_database("example", 1, &specs).await?;
///         client
///             .set_item("kv", &json!({"key": "a", "value": 1}), None)
///             .await?;
///         client
///             .get_first_item::<Value>("kv", KeyRangeDescriptor::full())
///             .await
///     })
///     .unwrap()
///     .unwrap();
/// assert_eq!(first, Some(json!({"key": "a", "value": 1})));
/// ```
pub struct StoreClient {
    factory: Rc<dyn Factory>,
    state: Rc<ClientState>,
}

impl StoreClient {
    /// Create a client on `factory`. Nothing is opened until
    /// [`open_database`](Self::open_database) is called.
    pub fn new(factory: impl Factory + 'static) -> Self {
        Self::with_factory(Rc::new(factory))
    }

    pub fn with_factory(factory: Rc<dyn Factory>) -> Self {
        Self {
            factory,
            state: Rc::new(ClientState {
                live: RefCell::new(None),
                generation: Cell::new(0),
                has_key: RefCell::new(HasKeyTable::default()),
                cache: Rc::new(TransactionCache::new()),
                warning: RefCell::new(None),
            }),
        }
    }

    /// A client on the browser's IndexedDB.
    #[cfg(target_arch = "wasm32")]
    pub fn browser() -> Result<Self> {
        Ok(Self::new(crate::web::WebFactory::new()?))
    }

    /// Receive warnings that do not fail an operation, such as an open or a
    /// delete being blocked by another connection.
    pub fn set_warning_handler(&self, handler: impl Fn(&Error) + 'static) {
        *self.state.warning.borrow_mut() = Some(Rc::new(handler));
    }

    /// Whether a database is open. This turns false as soon as the engine
    /// closes the connection or another connection asks for a version change.
    pub fn is_open(&self) -> bool {
        self.state.live.borrow().is_some()
    }

    /// Name of the open database.
    pub fn name(&self) -> Option<String> {
        self.live_connection().map(|c| c.name())
    }

    /// Version of the open database.
    pub fn version(&self) -> Option<u32> {
        self.live_connection().map(|c| c.version())
    }

    /// Stores of the open database in ascending order, empty if nothing is
    /// open.
    pub fn store_names(&self) -> Vec<String> {
        self.live_connection()
            .map(|c| c.object_store_names())
            .unwrap_or_default()
    }

    /// Open `name` at `version`, closing any database this client has open.
    ///
    /// If the database is new or older than `version`, its stores are brought
    /// in line with `specs` during the upgrade. Resolves to whether an upgrade
    /// ran.
    pub async fn open_database(&self, name: &str, version: u32, specs: &[StoreSpec]) -> Result<bool> {
        validate_specs(specs)?;
        self.close_database();

        let open_failed = |source| Error::OpenFailed {
            name: name.to_owned(),
            source,
        };
        let capabilities = self.factory.capabilities();
        let request = self.factory.open(name, version).map_err(open_failed)?;

        let upgraded = Rc::new(Cell::new(false));
        let failure: Rc<RefCell<Option<EngineError>>> = Rc::new(RefCell::new(None));

        let on_upgrade: UpgradeHandler = {
            let specs = specs.to_vec();
            let upgraded = upgraded.clone();
            let failure = failure.clone();
            let database = name.to_owned();
            Box::new(move |db: &dyn UpgradeDatabase, change: VersionChange| {
                upgraded.set(true);
                tracing::debug!(
                    database = %database,
                    old_version = change.old_version,
                    new_version = change.new_version,
                    "upgrading schema"
                );
                match reconcile(db, &specs, capabilities) {
                    Ok(plan) => {
                        for (store, action) in plan.iter() {
                            tracing::debug!(database = %database, store, ?action, "store reconciled");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(database = %database, error = %e, "schema upgrade failed");
                        *failure.borrow_mut() = Some(e);
                        db.abort();
                    }
                }
            })
        };
        request.set_onupgradeneeded(Some(on_upgrade));

        let blocked_name = name.to_owned();
        request.set_onblocked(Some(blocked_handler(
            Rc::downgrade(&self.state),
            move || Error::OpenBlocked {
                name: blocked_name.clone(),
            },
        )));

        let opened: Result<Rc<dyn Connection>> =
            RequestFuture::<_, dyn OpenRequest>::new(request.clone()).await;
        request.set_onupgradeneeded(None);
        request.set_onblocked(None);

        let connection = match opened {
            Ok(connection) => connection,
            Err(Error::EngineOperationFailed(source)) => {
                let source = failure.borrow_mut().take().unwrap_or(source);
                return Err(open_failed(source));
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(database = name, version, upgraded = upgraded.get(), "database open");
        *self.state.has_key.borrow_mut() = HasKeyTable::from_specs(specs);
        self.attach(connection);

        Ok(upgraded.get())
    }

    /// [`open_database`](Self::open_database) with the name, version and
    /// stores of `config`.
    pub async fn open(&self, config: &DatabaseConfig) -> Result<bool> {
        self.open_database(&config.name, config.version, &config.stores)
            .await
    }

    /// Close the open database, if there is one.
    pub fn close_database(&self) {
        let live = self.state.live.borrow_mut().take();
        if let Some(live) = live {
            tracing::debug!(database = %live.connection.name(), "closing database");
            live.connection.set_onclose(None);
            live.connection.set_onversionchange(None);
            live.connection.close();
            self.state.cache.clear();
        }
    }

    /// Delete the database `name`. If it is the one this client has open, it
    /// is closed first.
    pub async fn delete_database(&self, name: &str) -> Result<()> {
        if self.name().as_deref() == Some(name) {
            self.close_database();
        }
        delete_with(&*self.factory, name, Rc::downgrade(&self.state)).await
    }

    /// Write `value`, passing `key` for stores that do not produce their own.
    /// Resolves to the key the value was stored under.
    pub async fn set_item<V: Serialize + ?Sized>(
        &self,
        store: &str,
        value: &V,
        key: Option<Key>,
    ) -> Result<Key> {
        let connection = self.connection_for(store)?;
        if key.is_none() && !self.has_key(store) {
            return Err(Error::MissingKeyOrValue("key"));
        }
        let value = serde_json::to_value(value)?;

        self.put(&*connection, store, value, key)?.await
    }

    /// Write several values at once.
    ///
    /// Stores that produce their own keys take raw values. Other stores take
    /// `{key, value}` objects, see [`Entry`]. Every entry is checked before the
    /// first write is issued.
    pub async fn set_items<V: Serialize>(&self, store: &str, entries: &[V]) -> Result<Vec<Key>> {
        let connection = self.connection_for(store)?;
        let has_key = self.has_key(store);

        let prepared = entries
            .iter()
            .map(|entry| {
                let entry = serde_json::to_value(entry)?;
                if has_key {
                    Ok((entry, None))
                } else {
                    split_entry(entry)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let writes = prepared
            .into_iter()
            .map(|(value, key)| self.put(&*connection, store, value, key))
            .collect::<Result<Vec<_>>>()?;

        try_join_all(writes).await
    }

    /// The value stored under `key`, or `None` if there is none.
    ///
    /// # Examples
    ///
    /// ```
    /// use idb_kv::{Key, MemoryEngine, StoreClient, StoreSpec};
    /// use serde_json::{json, Value};
    ///
    /// let engine = MemoryEngine::new();
    /// let client = StoreClient::new(engine.clone());
    ///
    /// let (found, missing) = engine
    ///     .run_until_complete(async {
    ///         client
    ///             .open_database("example", 1, &[StoreSpec::new("plain")])
    ///             .await?;
    ///         client
    ///             .set_item("plain", &json!("hello"), Some(Key::from("greeting")))
    ///             .await?;
    ///         let found: Option<Value> = client.get_item("plain", "greeting").await?;
    ///         let missing: Option<Value> = client.get_item("plain", "farewell").await?;
    ///         Ok::<_, idb_kv::Error>((found, missing))
    ///     })
    ///     .unwrap()
    ///     .unwrap();
    /// assert_eq!(found, Some(json!("hello")));
    /// assert_eq!(missing, None);
    /// ```
    pub async fn get_item<T: DeserializeOwned>(
        &self,
        store: &str,
        key: impl Into<Key>,
    ) -> Result<Option<T>> {
        let connection = self.connection_for(store)?;
        let key = key.into();

        let value: Option<Value> = self
            .state
            .cache
            .issue(&*connection, store, move |s| s.get(&key))?
            .await?;
        decode(value)
    }

    /// The value with the lowest key inside `range`.
    pub async fn get_first_item<T: DeserializeOwned>(
        &self,
        store: &str,
        range: impl IntoKeyRange,
    ) -> Result<Option<T>> {
        self.edge_item(store, range, CursorDirection::Next).await
    }

    /// The value with the highest key inside `range`.
    pub async fn get_last_item<T: DeserializeOwned>(
        &self,
        store: &str,
        range: impl IntoKeyRange,
    ) -> Result<Option<T>> {
        self.edge_item(store, range, CursorDirection::Prev).await
    }

    /// Delete the value under `key`. Deleting a missing key is not an error.
    pub async fn delete_item(&self, store: &str, key: impl Into<Key>) -> Result<()> {
        let connection = self.connection_for(store)?;
        let key = key.into();

        self.state
            .cache
            .issue(&*connection, store, move |s| s.delete(&key))?
            .await
    }

    /// Delete a list of keys or everything inside a key range.
    ///
    /// A full range clears the store. A bounded range is deleted in one
    /// request where the engine supports it and key by key otherwise.
    pub async fn delete_items(&self, store: &str, target: impl IntoDeleteTarget) -> Result<()> {
        let connection = self.connection_for(store)?;

        match target.into_delete_target()? {
            DeleteTarget::Keys(keys) => {
                let deletes = keys
                    .into_iter()
                    .map(|key| {
                        self.state
                            .cache
                            .issue(&*connection, store, move |s| s.delete(&key))
                    })
                    .collect::<std::result::Result<Vec<RequestFuture<()>>, EngineError>>()?;
                try_join_all(deletes).await?;
                Ok(())
            }
            DeleteTarget::Range(descriptor) => match descriptor.resolve()? {
                None => self.clear(&*connection, store)?.await,
                Some(range) if self.factory.capabilities().ranged_delete => {
                    self.state
                        .cache
                        .issue(&*connection, store, move |s| s.delete_range(&range))?
                        .await
                }
                Some(range) => {
                    let iterator: CursorIterator<Value> = CursorIterator::new(
                        connection.clone(),
                        self.state.cache.clone(),
                        store,
                        Some(range),
                    );
                    let mut deletes: Vec<RequestFuture<()>> = Vec::new();
                    while let Some((key, _)) = iterator.next_entry().await? {
                        deletes.push(
                            self.state
                                .cache
                                .issue(&*connection, store, move |s| s.delete(&key))?,
                        );
                    }
                    try_join_all(deletes).await?;
                    Ok(())
                }
            },
        }
    }

    /// Empty the store.
    pub async fn delete_all_items(&self, store: &str) -> Result<()> {
        let connection = self.connection_for(store)?;
        self.clear(&*connection, store)?.await
    }

    /// Number of values inside `range`.
    pub async fn count_items(&self, store: &str, range: impl IntoKeyRange) -> Result<u64> {
        let connection = self.connection_for(store)?;
        let range = range.into_key_range()?.resolve()?;

        self.state
            .cache
            .issue(&*connection, store, move |s| s.count(range.as_ref()))?
            .await
    }

    /// Iterate the values inside `range` in ascending key order.
    ///
    /// Nothing reaches the engine until the first pull.
    pub fn get_iterator<T: DeserializeOwned + 'static>(
        &self,
        store: &str,
        range: impl IntoKeyRange,
    ) -> Result<CursorIterator<T>> {
        let connection = self.connection_for(store)?;
        let range = range.into_key_range()?.resolve()?;

        Ok(CursorIterator::new(
            connection,
            self.state.cache.clone(),
            store,
            range,
        ))
    }

    /// Every value in the store that `filter` accepts, in key order.
    pub async fn get_all_matched_items<T: DeserializeOwned + 'static>(
        &self,
        store: &str,
        mut filter: impl FnMut(&T) -> bool,
    ) -> Result<Vec<T>> {
        let iterator = self.get_iterator::<T>(store, KeyRangeDescriptor::full())?;

        let mut matched = Vec::new();
        while let Some(item) = iterator.next_item().await? {
            if filter(&item) {
                matched.push(item);
            }
        }
        Ok(matched)
    }

    fn attach(&self, connection: Rc<dyn Connection>) {
        let generation = self.state.generation.get() + 1;
        self.state.generation.set(generation);

        let state = Rc::downgrade(&self.state);
        let on_close: Handler = Box::new(move || {
            if let Some(state) = state.upgrade() {
                state.lose(generation, "closed by the engine");
            }
        });
        connection.set_onclose(Some(on_close));

        let state = Rc::downgrade(&self.state);
        let on_versionchange: Handler = Box::new(move || {
            if let Some(state) = state.upgrade() {
                state.lose(generation, "another connection requested a version change");
            }
        });
        connection.set_onversionchange(Some(on_versionchange));

        *self.state.live.borrow_mut() = Some(Live {
            connection,
            generation,
        });
    }

    fn live_connection(&self) -> Option<Rc<dyn Connection>> {
        self.state
            .live
            .borrow()
            .as_ref()
            .map(|live| live.connection.clone())
    }

    fn connection_for(&self, store: &str) -> Result<Rc<dyn Connection>> {
        let connection = self.live_connection().ok_or(Error::DatabaseNotOpen)?;
        if !self.state.has_key.borrow().contains(store) {
            return Err(Error::StoreNotFound(store.to_owned()));
        }
        Ok(connection)
    }

    fn has_key(&self, store: &str) -> bool {
        self.state.has_key.borrow().get(store).unwrap_or(false)
    }

    fn put(
        &self,
        connection: &dyn Connection,
        store: &str,
        value: Value,
        key: Option<Key>,
    ) -> Result<RequestFuture<Key>> {
        Ok(self
            .state
            .cache
            .issue(connection, store, move |s| s.put(&value, key.as_ref()))?)
    }

    fn clear(&self, connection: &dyn Connection, store: &str) -> Result<RequestFuture<()>> {
        Ok(self
            .state
            .cache
            .issue(connection, store, |s: &dyn ObjectStore| s.clear())?)
    }

    async fn edge_item<T: DeserializeOwned>(
        &self,
        store: &str,
        range: impl IntoKeyRange,
        direction: CursorDirection,
    ) -> Result<Option<T>> {
        let connection = self.connection_for(store)?;
        let range = range.into_key_range()?.resolve()?;

        let entry: Option<CursorEntry> = self
            .state
            .cache
            .issue(&*connection, store, move |s| {
                s.open_cursor(range.as_ref(), direction)
            })?
            .await?;
        decode(entry.map(|entry| entry.value))
    }
}

impl Drop for StoreClient {
    fn drop(&mut self) {
        self.close_database();
    }
}

/// Delete the database `name` through `factory`.
///
/// While other connections keep the database open the delete waits for them;
/// this is reported as [`Error::DeleteBlocked`] through `tracing`.
pub async fn delete_database(factory: &dyn Factory, name: &str) -> Result<()> {
    delete_with(factory, name, Weak::new()).await
}

async fn delete_with(factory: &dyn Factory, name: &str, state: Weak<ClientState>) -> Result<()> {
    let delete_failed = |source| Error::DeleteFailed {
        name: name.to_owned(),
        source,
    };
    let request = factory.delete_database(name).map_err(delete_failed)?;

    let blocked_name = name.to_owned();
    request.set_onblocked(Some(blocked_handler(state, move || {
        Error::DeleteBlocked {
            name: blocked_name.clone(),
        }
    })));

    let deleted: Result<()> = RequestFuture::<_, dyn DeleteRequest>::new(request.clone()).await;
    request.set_onblocked(None);

    match deleted {
        Ok(()) => {
            tracing::debug!(database = name, "database deleted");
            Ok(())
        }
        Err(Error::EngineOperationFailed(source)) => Err(delete_failed(source)),
        Err(e) => Err(e),
    }
}

/// Split a `{key, value}` entry for a store without its own keys.
fn split_entry(entry: Value) -> Result<(Value, Option<Key>)> {
    let mut entry = match entry {
        Value::Object(entry) => entry,
        other => {
            return Err(Error::invalid(format!(
                "expected a {{key, value}} entry, got {}",
                other
            )))
        }
    };

    let key = entry.remove("key").ok_or(Error::MissingKeyOrValue("key"))?;
    let value = entry
        .remove("value")
        .ok_or(Error::MissingKeyOrValue("value"))?;
    let key = Key::from_value(&key)
        .ok_or_else(|| Error::invalid(format!("{} is not a valid key", key)))?;

    Ok((value, Some(key)))
}

fn decode<T: DeserializeOwned>(value: Option<Value>) -> Result<Option<T>> {
    Ok(value.map(serde_json::from_value).transpose()?)
}

#[cfg(test)]
mod test {
    use std::{cell::RefCell, rc::Rc};

    use serde_json::{json, Value};

    use super::{split_entry, StoreClient};
    use crate::{
        error::Error,
        key::Key,
        key_range::KeyRangeDescriptor,
        memory::MemoryEngine,
        schema::StoreSpec,
    };

    fn client() -> (MemoryEngine, StoreClient) {
        let engine = MemoryEngine::new();
        (engine.clone(), StoreClient::new(engine))
    }

    #[test]
    fn split_entry_requires_both_fields() {
        let (value, key) = split_entry(json!({"key": "a", "value": 1})).unwrap();
        assert_eq!(value, json!(1));
        assert_eq!(key, Some(Key::from("a")));

        assert!(matches!(
            split_entry(json!({"value": 1})),
            Err(Error::MissingKeyOrValue("key"))
        ));
        assert!(matches!(
            split_entry(json!({"key": 1})),
            Err(Error::MissingKeyOrValue("value"))
        ));
        assert!(matches!(
            split_entry(json!("a")),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            split_entry(json!({"key": true, "value": 1})),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn operations_need_an_open_database() {
        let (engine, client) = client();
        let result = engine
            .run_until_complete(client.get_item::<Value>("kv", "a"))
            .unwrap();
        assert!(matches!(result, Err(Error::DatabaseNotOpen)));
        assert!(!client.is_open());
    }

    #[test]
    fn open_reports_upgrade_once() {
        let (engine, client) = client();
        let specs = vec![StoreSpec::new("kv").key_path("key")];

        let upgraded = engine
            .run_until_complete(client.open_database("db", 1, &specs))
            .unwrap()
            .unwrap();
        assert!(upgraded);
        assert_eq!(client.name().as_deref(), Some("db"));
        assert_eq!(client.version(), Some(1));
        assert_eq!(client.store_names(), vec!["kv".to_owned()]);

        let upgraded = engine
            .run_until_complete(client.open_database("db", 1, &specs))
            .unwrap()
            .unwrap();
        assert!(!upgraded);
    }

    #[test]
    fn unknown_store_is_rejected() {
        let (engine, client) = client();
        engine
            .run_until_complete(client.open_database("db", 1, &[StoreSpec::new("kv")]))
            .unwrap()
            .unwrap();

        let result = engine
            .run_until_complete(client.delete_all_items("other"))
            .unwrap();
        assert!(matches!(result, Err(Error::StoreNotFound(store)) if store == "other"));
        assert_eq!(engine.transactions_begun("other"), 0);
    }

    #[test]
    fn explicit_key_store_needs_a_key() {
        let (engine, client) = client();
        engine
            .run_until_complete(client.open_database("db", 1, &[StoreSpec::new("kv")]))
            .unwrap()
            .unwrap();

        let result = engine
            .run_until_complete(client.set_item("kv", &json!(1), None))
            .unwrap();
        assert!(matches!(result, Err(Error::MissingKeyOrValue("key"))));

        let key = engine
            .run_until_complete(client.set_item("kv", &json!(1), Some("a".into())))
            .unwrap()
            .unwrap();
        assert_eq!(key, Key::from("a"));
    }

    #[test]
    fn version_change_lets_the_upgrade_through() {
        let engine = MemoryEngine::new();
        let first = StoreClient::new(engine.clone());
        let second = StoreClient::new(engine.clone());
        let warnings = Rc::new(RefCell::new(Vec::new()));
        {
            let warnings = warnings.clone();
            second.set_warning_handler(move |warning| warnings.borrow_mut().push(warning.to_string()));
        }

        let specs = vec![StoreSpec::new("kv")];
        engine
            .run_until_complete(first.open_database("shared", 1, &specs))
            .unwrap()
            .unwrap();

        // The first client closes itself on the version change, so the
        // upgrade goes through without ever being blocked.
        let upgraded = engine
            .run_until_complete(second.open_database("shared", 2, &specs))
            .unwrap()
            .unwrap();
        assert!(upgraded);
        assert!(!first.is_open());
        assert!(warnings.borrow().is_empty());
    }

    #[test]
    fn full_range_count() {
        let (engine, client) = client();
        engine
            .run_until_complete(client.open_database(
                "db",
                1,
                &[StoreSpec::new("kv").auto_increment(true)],
            ))
            .unwrap()
            .unwrap();

        let keys = engine
            .run_until_complete(client.set_items("kv", &[json!("x"), json!("y"), json!("z")]))
            .unwrap()
            .unwrap();
        assert_eq!(keys, vec![Key::from(1), Key::from(2), Key::from(3)]);

        let count = engine
            .run_until_complete(client.count_items("kv", KeyRangeDescriptor::full()))
            .unwrap()
            .unwrap();
        assert_eq!(count, 3);

        let count = engine
            .run_until_complete(client.count_items("kv", KeyRangeDescriptor::lower_bound(2, true)))
            .unwrap()
            .unwrap();
        assert_eq!(count, 1);
    }
}
