//! An ordered in-memory engine with IndexedDB semantics.
//!
//! Everything the engine reports goes through a task queue that stands in for
//! the browser's event loop: request outcomes, transaction completion,
//! version-change and blocked notifications. [`MemoryEngine::dispatch`] runs
//! one queued task; [`MemoryEngine::run_until_complete`] interleaves tasks with
//! polling a future, the way the browser interleaves events and microtasks.
//!
//! Transactions auto-commit: one completes on the first turn of the loop where
//! it has no outstanding requests. A request that is still queued when its
//! transaction aborts is never reported on.

use std::{
    cell::{Cell, RefCell},
    collections::{btree_map, BTreeMap, HashMap, VecDeque},
    ops::Bound,
    rc::{Rc, Weak},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::{
    task::{waker, ArcWake, Context, Poll},
    Future,
};
use serde_json::Value;

use crate::{
    engine::{
        Capabilities, Connection, CursorDirection, CursorEntry, CursorRequest, DeleteRequest,
        Factory, Handler, ObjectStore, OpenRequest, ReadyState, Request, SchemaStore,
        Transaction, UpgradeDatabase, UpgradeHandler, VersionChange,
    },
    error::EngineError,
    key::{Key, KeyPath},
    key_range::KeyRange,
    schema::{IndexParameters, StoreParameters},
    transaction::TransactionMode,
};

type Task = Box<dyn FnOnce(&Rc<EngineInner>)>;
type HandlerSlot = Slot<Handler>;

/// An event handler that may be set or cleared from inside itself.
struct Slot<H> {
    handler: RefCell<Option<H>>,
    installs: Cell<u64>,
}

impl<H> Default for Slot<H> {
    fn default() -> Self {
        Self {
            handler: RefCell::new(None),
            installs: Cell::new(0),
        }
    }
}

impl<H> Slot<H> {
    fn set(&self, handler: Option<H>) {
        *self.handler.borrow_mut() = handler;
        self.installs.set(self.installs.get() + 1);
    }

    /// Run the handler, putting it back unless it was set or cleared while
    /// running.
    fn run(&self, call: impl FnOnce(&mut H)) {
        let handler = self.handler.borrow_mut().take();
        if let Some(mut handler) = handler {
            let installs = self.installs.get();
            call(&mut handler);
            if self.installs.get() == installs {
                *self.handler.borrow_mut() = Some(handler);
            }
        }
    }
}

impl Slot<Handler> {
    fn fire(&self) {
        self.run(|handler| handler());
    }
}

/// In-memory engine. Clones share the same databases and event queue.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    inner: Rc<EngineInner>,
}

#[derive(Default)]
struct EngineInner {
    capabilities: Capabilities,
    databases: RefCell<HashMap<String, Rc<DatabaseState>>>,
    tasks: RefCell<VecDeque<Task>>,
    begun: RefCell<HashMap<String, usize>>,
    transactions: RefCell<Vec<Weak<MemoryTransaction>>>,
}

impl EngineInner {
    fn defer(&self, task: impl FnOnce(&Rc<EngineInner>) + 'static) {
        self.tasks.borrow_mut().push_back(Box::new(task));
    }

    fn database(&self, name: &str) -> Rc<DatabaseState> {
        self.databases
            .borrow_mut()
            .entry(name.to_owned())
            .or_insert_with(|| {
                Rc::new(DatabaseState {
                    name: name.to_owned(),
                    version: Cell::new(0),
                    stores: RefCell::new(BTreeMap::new()),
                    connections: RefCell::new(Vec::new()),
                    parked: RefCell::new(Vec::new()),
                })
            })
            .clone()
    }
}

struct Flag(AtomicBool);

impl ArcWake for Flag {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.store(true, Ordering::SeqCst);
    }
}

impl MemoryEngine {
    /// An engine with no databases and every capability enabled.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            inner: Rc::new(EngineInner {
                capabilities,
                ..EngineInner::default()
            }),
        }
    }

    /// Run the next queued engine task. Returns `false` if there was none.
    pub fn dispatch(&self) -> bool {
        let task = self.inner.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task(&self.inner);
                true
            }
            None => false,
        }
    }

    pub fn run_until_idle(&self) {
        while self.dispatch() {}
    }

    /// Drive `future` to completion, dispatching engine tasks whenever it is
    /// waiting. Returns `None` if the future stalls with no task left to run.
    pub fn run_until_complete<F: Future>(&self, future: F) -> Option<F::Output> {
        let flag = Arc::new(Flag(AtomicBool::new(true)));
        let waker = waker(flag.clone());
        let mut cx = Context::from_waker(&waker);
        futures::pin_mut!(future);

        loop {
            if flag.0.swap(false, Ordering::SeqCst) {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return Some(output);
                }
            } else if !self.dispatch() {
                return None;
            }
        }
    }

    /// How many transactions have been started on `store`, across databases.
    pub fn transactions_begun(&self, store: &str) -> usize {
        self.inner.begun.borrow().get(store).copied().unwrap_or(0)
    }

    /// Abort every active transaction on `store`.
    pub fn abort_transactions(&self, store: &str) {
        let transactions: Vec<_> = self
            .inner
            .transactions
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|tx| tx.store == store)
            .collect();
        for tx in transactions {
            let _ = tx.abort();
        }
    }

    /// Close every connection to `database` from the engine's side, as when
    /// the storage is cleared by the host.
    pub fn force_close(&self, database: &str) {
        let db = match self.inner.databases.borrow().get(database) {
            Some(db) => db.clone(),
            None => return,
        };
        for connection in db.open_connections() {
            connection.closed.set(true);
            self.inner
                .defer(move |_| connection.onclose.fire());
        }
        db.unpark(&self.inner);
    }

    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.databases.borrow().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Factory for MemoryEngine {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    fn open(&self, name: &str, version: u32) -> Result<Rc<dyn OpenRequest>, EngineError> {
        if version == 0 {
            return Err(EngineError::new("TypeError", "version must be at least 1"));
        }

        let request = Rc::new(MemoryOpenRequest::default());
        let name = name.to_owned();
        let pending = request.clone();
        self.inner
            .defer(move |engine| process_open(engine, pending, name, version, Stage::Fresh));
        Ok(request)
    }

    fn delete_database(&self, name: &str) -> Result<Rc<dyn DeleteRequest>, EngineError> {
        let request = Rc::new(MemoryDeleteRequest::default());
        let name = name.to_owned();
        let pending = request.clone();
        self.inner
            .defer(move |engine| process_delete(engine, pending, name, Stage::Fresh));
        Ok(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Other connections have not been told yet.
    Fresh,
    /// `versionchange` has been sent to the other connections.
    Notified,
    /// `blocked` has been reported; waiting for connections to close.
    Blocked,
}

/// Holds `blocking` back until the other connections are gone. Returns `true`
/// if the caller has to wait.
fn wait_for_connections(
    engine: &Rc<EngineInner>,
    db: &DatabaseState,
    stage: Stage,
    blocked: &HandlerSlot,
    retry: impl FnOnce(&Rc<EngineInner>, Stage) + 'static,
) -> bool {
    let others = db.open_connections();
    if others.is_empty() {
        return false;
    }

    match stage {
        Stage::Fresh => {
            for connection in others {
                engine.defer(move |_| {
                    if !connection.closed.get() {
                        connection.onversionchange.fire();
                    }
                });
            }
            engine.defer(move |engine| retry(engine, Stage::Notified));
        }
        Stage::Notified => {
            blocked.fire();
            db.parked
                .borrow_mut()
                .push(Box::new(move |engine: &Rc<EngineInner>| retry(engine, Stage::Blocked)));
        }
        Stage::Blocked => {
            db.parked
                .borrow_mut()
                .push(Box::new(move |engine: &Rc<EngineInner>| retry(engine, Stage::Blocked)));
        }
    }
    true
}

fn process_open(
    engine: &Rc<EngineInner>,
    request: Rc<MemoryOpenRequest>,
    name: String,
    version: u32,
    stage: Stage,
) {
    let db = engine.database(&name);
    let old_version = db.version.get();

    if version < old_version {
        request.request.deliver(Err(EngineError::new(
            "VersionError",
            format!(
                "requested version {} is less than the existing version {}",
                version, old_version
            ),
        )));
        return;
    }

    let upgrade = version > old_version;
    if upgrade {
        let retry_request = request.clone();
        let retry_name = name.clone();
        let waiting = wait_for_connections(engine, &db, stage, &request.onblocked, move |engine, stage| {
            process_open(engine, retry_request, retry_name, version, stage)
        });
        if waiting {
            return;
        }
    }

    let connection = Rc::new(ConnectionState {
        engine: Rc::downgrade(engine),
        db: db.clone(),
        version,
        closed: Cell::new(false),
        onclose: Slot::default(),
        onversionchange: Slot::default(),
    });
    db.connections
        .borrow_mut()
        .push(Rc::downgrade(&connection));

    if upgrade {
        let snapshot = db.stores.borrow().clone();
        db.version.set(version);

        let upgrader = MemoryUpgrade {
            db: db.clone(),
            aborted: Cell::new(false),
        };
        request.fire_upgrade(
            &upgrader,
            VersionChange {
                old_version,
                new_version: version,
            },
        );

        if upgrader.aborted.get() {
            *db.stores.borrow_mut() = snapshot;
            db.version.set(old_version);
            connection.closed.set(true);
            if old_version == 0 {
                engine.databases.borrow_mut().remove(&name);
            }
            request.request.deliver(Err(EngineError::abort(
                "the version change transaction was aborted",
            )));
            return;
        }
    }

    request.request.deliver(Ok(connection as Rc<dyn Connection>));
}

fn process_delete(
    engine: &Rc<EngineInner>,
    request: Rc<MemoryDeleteRequest>,
    name: String,
    stage: Stage,
) {
    let db = engine.databases.borrow().get(&name).cloned();
    let db = match db {
        Some(db) => db,
        None => {
            request.request.deliver(Ok(()));
            return;
        }
    };

    let retry_request = request.clone();
    let retry_name = name.clone();
    let waiting = wait_for_connections(engine, &db, stage, &request.onblocked, move |engine, stage| {
        process_delete(engine, retry_request, retry_name, stage)
    });
    if waiting {
        return;
    }

    engine.databases.borrow_mut().remove(&name);
    db.unpark(engine);
    request.request.deliver(Ok(()));
}

struct MemoryRequest<T> {
    outcome: RefCell<Option<Result<T, EngineError>>>,
    onsuccess: HandlerSlot,
    onerror: HandlerSlot,
}

impl<T> Default for MemoryRequest<T> {
    fn default() -> Self {
        Self {
            outcome: RefCell::new(None),
            onsuccess: Slot::default(),
            onerror: Slot::default(),
        }
    }
}

impl<T> MemoryRequest<T> {
    fn deliver(&self, outcome: Result<T, EngineError>) {
        let succeeded = outcome.is_ok();
        *self.outcome.borrow_mut() = Some(outcome);
        if succeeded {
            self.onsuccess.fire();
        } else {
            self.onerror.fire();
        }
    }

    fn rearm(&self) {
        *self.outcome.borrow_mut() = None;
    }
}

impl<T: Clone> Request<T> for MemoryRequest<T> {
    fn ready_state(&self) -> ReadyState {
        match *self.outcome.borrow() {
            Some(_) => ReadyState::Done,
            None => ReadyState::Pending,
        }
    }

    fn result(&self) -> Result<T, EngineError> {
        self.outcome
            .borrow()
            .clone()
            .unwrap_or_else(|| Err(EngineError::invalid_state("the request is still pending")))
    }

    fn set_onsuccess(&self, handler: Option<Handler>) {
        self.onsuccess.set(handler);
    }

    fn set_onerror(&self, handler: Option<Handler>) {
        self.onerror.set(handler);
    }
}

#[derive(Default)]
struct MemoryOpenRequest {
    request: MemoryRequest<Rc<dyn Connection>>,
    onupgradeneeded: Slot<UpgradeHandler>,
    onblocked: HandlerSlot,
}

impl MemoryOpenRequest {
    fn fire_upgrade(&self, db: &dyn UpgradeDatabase, change: VersionChange) {
        self.onupgradeneeded.run(|handler| handler(db, change));
    }
}

impl Request<Rc<dyn Connection>> for MemoryOpenRequest {
    fn ready_state(&self) -> ReadyState {
        self.request.ready_state()
    }

    fn result(&self) -> Result<Rc<dyn Connection>, EngineError> {
        self.request.result()
    }

    fn set_onsuccess(&self, handler: Option<Handler>) {
        self.request.set_onsuccess(handler)
    }

    fn set_onerror(&self, handler: Option<Handler>) {
        self.request.set_onerror(handler)
    }
}

impl OpenRequest for MemoryOpenRequest {
    fn set_onupgradeneeded(&self, handler: Option<UpgradeHandler>) {
        self.onupgradeneeded.set(handler);
    }

    fn set_onblocked(&self, handler: Option<Handler>) {
        self.onblocked.set(handler);
    }
}

#[derive(Default)]
struct MemoryDeleteRequest {
    request: MemoryRequest<()>,
    onblocked: HandlerSlot,
}

impl Request<()> for MemoryDeleteRequest {
    fn ready_state(&self) -> ReadyState {
        self.request.ready_state()
    }

    fn result(&self) -> Result<(), EngineError> {
        self.request.result()
    }

    fn set_onsuccess(&self, handler: Option<Handler>) {
        self.request.set_onsuccess(handler)
    }

    fn set_onerror(&self, handler: Option<Handler>) {
        self.request.set_onerror(handler)
    }
}

impl DeleteRequest for MemoryDeleteRequest {
    fn set_onblocked(&self, handler: Option<Handler>) {
        self.onblocked.set(handler);
    }
}

struct DatabaseState {
    name: String,
    version: Cell<u32>,
    stores: RefCell<BTreeMap<String, StoreData>>,
    connections: RefCell<Vec<Weak<ConnectionState>>>,
    parked: RefCell<Vec<Task>>,
}

impl DatabaseState {
    fn open_connections(&self) -> Vec<Rc<ConnectionState>> {
        let mut connections = self.connections.borrow_mut();
        connections.retain(|c| c.upgrade().map_or(false, |c| !c.closed.get()));
        connections.iter().filter_map(Weak::upgrade).collect()
    }

    /// Requeue opens and deletes that were waiting for connections to close.
    fn unpark(&self, engine: &EngineInner) {
        let parked = std::mem::take(&mut *self.parked.borrow_mut());
        for task in parked {
            engine.defer(task);
        }
    }
}

#[derive(Debug, Clone)]
struct StoreData {
    key_path: KeyPath,
    auto_increment: bool,
    next_key: u64,
    indexes: BTreeMap<String, IndexParameters>,
    records: BTreeMap<Key, Value>,
}

impl StoreData {
    fn new(parameters: &StoreParameters) -> Self {
        Self {
            key_path: parameters.key_path.clone(),
            auto_increment: parameters.auto_increment,
            next_key: 1,
            indexes: BTreeMap::new(),
            records: BTreeMap::new(),
        }
    }

    fn entries(&self, range: Option<&KeyRange>) -> btree_map::Range<'_, Key, Value> {
        let bounds = match range {
            Some(range) => range.bounds(),
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        self.records.range::<Key, _>(bounds)
    }

    /// The checks the engine makes before accepting a put at all.
    fn check_put(&self, value: &Value, key: Option<&Key>) -> Result<(), EngineError> {
        match (&self.key_path, key) {
            (KeyPath::None, None) if !self.auto_increment => Err(EngineError::data(
                "the store uses out-of-line keys and has no key generator; a key is required",
            )),
            (KeyPath::None, _) => Ok(()),
            (_, Some(_)) => Err(EngineError::data(
                "the store uses in-line keys; a key must not be provided",
            )),
            (path, None) => match path.evaluate(value) {
                Some(_) => Ok(()),
                None if self.auto_increment && value.is_object() => Ok(()),
                None => Err(EngineError::data(
                    "the value has no valid key at the store's key path",
                )),
            },
        }
    }

    fn put(&mut self, mut value: Value, key: Option<Key>) -> Result<Key, EngineError> {
        self.check_put(&value, key.as_ref())?;

        let key_path = self.key_path.clone();
        let key = match key.or_else(|| key_path.evaluate(&value)) {
            Some(key) => key,
            None => {
                let key = self.generate_key()?;
                if !key_path.is_none() && !key_path.inject(&mut value, &key) {
                    return Err(EngineError::data("the generated key could not be injected"));
                }
                key
            }
        };

        if self.auto_increment {
            if let Key::Number(n) = key {
                if n >= self.next_key as f64 {
                    self.next_key = n.floor() as u64 + 1;
                }
            }
        }

        for (name, index) in &self.indexes {
            if !index.unique {
                continue;
            }
            let keys = index_keys(index, &value);
            let taken = self
                .records
                .iter()
                .filter(|(other, _)| **other != key)
                .any(|(_, other)| index_keys(index, other).iter().any(|k| keys.contains(k)));
            if taken {
                return Err(EngineError::constraint(format!(
                    "unique index \"{}\" already contains the value's key",
                    name
                )));
            }
        }

        self.records.insert(key.clone(), value);
        Ok(key)
    }

    fn generate_key(&mut self) -> Result<Key, EngineError> {
        if !self.auto_increment {
            return Err(EngineError::data("the store has no key generator"));
        }
        let key = Key::Number(self.next_key as f64);
        self.next_key += 1;
        Ok(key)
    }
}

fn index_keys(index: &IndexParameters, value: &Value) -> Vec<Key> {
    match index.key_path.evaluate(value) {
        Some(Key::Array(items)) if index.multi_entry => items,
        Some(key) => vec![key],
        None => Vec::new(),
    }
}

struct MemoryUpgrade {
    db: Rc<DatabaseState>,
    aborted: Cell<bool>,
}

impl UpgradeDatabase for MemoryUpgrade {
    fn object_store_names(&self) -> Vec<String> {
        self.db.stores.borrow().keys().cloned().collect()
    }

    fn create_object_store(
        &self,
        name: &str,
        parameters: &StoreParameters,
    ) -> Result<Rc<dyn SchemaStore>, EngineError> {
        let mut stores = self.db.stores.borrow_mut();
        if stores.contains_key(name) {
            return Err(EngineError::constraint(format!(
                "an object store called \"{}\" already exists",
                name
            )));
        }
        let generator_compatible = match &parameters.key_path {
            KeyPath::None => true,
            KeyPath::Single(path) => !path.is_empty(),
            KeyPath::Multi(_) => false,
        };
        if parameters.auto_increment && !generator_compatible {
            return Err(EngineError::new(
                "InvalidAccessError",
                "a key generator needs an out-of-line key or a single non-empty key path",
            ));
        }

        stores.insert(name.to_owned(), StoreData::new(parameters));
        Ok(Rc::new(MemorySchemaStore {
            db: self.db.clone(),
            name: name.to_owned(),
        }))
    }

    fn delete_object_store(&self, name: &str) -> Result<(), EngineError> {
        match self.db.stores.borrow_mut().remove(name) {
            Some(_) => Ok(()),
            None => Err(EngineError::not_found(format!(
                "no object store called \"{}\"",
                name
            ))),
        }
    }

    fn abort(&self) {
        self.aborted.set(true);
    }
}

struct MemorySchemaStore {
    db: Rc<DatabaseState>,
    name: String,
}

impl SchemaStore for MemorySchemaStore {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn create_index(&self, name: &str, parameters: &IndexParameters) -> Result<(), EngineError> {
        let mut stores = self.db.stores.borrow_mut();
        let store = stores.get_mut(&self.name).ok_or_else(|| {
            EngineError::invalid_state(format!("object store \"{}\" was deleted", self.name))
        })?;
        if store.indexes.contains_key(name) {
            return Err(EngineError::constraint(format!(
                "an index called \"{}\" already exists",
                name
            )));
        }
        if parameters.multi_entry && matches!(parameters.key_path, KeyPath::Multi(_)) {
            return Err(EngineError::new(
                "InvalidAccessError",
                "a multi-entry index cannot use a compound key path",
            ));
        }
        store.indexes.insert(name.to_owned(), parameters.clone());
        Ok(())
    }
}

struct ConnectionState {
    engine: Weak<EngineInner>,
    db: Rc<DatabaseState>,
    version: u32,
    closed: Cell<bool>,
    onclose: HandlerSlot,
    onversionchange: HandlerSlot,
}

impl Connection for ConnectionState {
    fn name(&self) -> String {
        self.db.name.clone()
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn object_store_names(&self) -> Vec<String> {
        self.db.stores.borrow().keys().cloned().collect()
    }

    fn transaction(
        &self,
        store: &str,
        mode: TransactionMode,
    ) -> Result<Rc<dyn Transaction>, EngineError> {
        if self.closed.get() {
            return Err(EngineError::invalid_state("the connection is closed"));
        }
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| EngineError::invalid_state("the engine is gone"))?;
        let snapshot = match self.db.stores.borrow().get(store) {
            Some(data) => data.clone(),
            None => {
                return Err(EngineError::not_found(format!(
                    "no object store called \"{}\"",
                    store
                )))
            }
        };

        let tx = Rc::new_cyclic(|this| MemoryTransaction {
            this: this.clone(),
            engine: Rc::downgrade(&engine),
            db: self.db.clone(),
            store: store.to_owned(),
            mode,
            ranged_delete: engine.capabilities.ranged_delete,
            status: Cell::new(Status::Active),
            pending: Cell::new(0),
            snapshot: RefCell::new(Some(snapshot)),
            oncomplete: Slot::default(),
            onabort: Slot::default(),
        });

        *engine.begun.borrow_mut().entry(store.to_owned()).or_insert(0) += 1;
        let mut transactions = engine.transactions.borrow_mut();
        transactions.retain(|tx| tx.strong_count() > 0);
        transactions.push(Rc::downgrade(&tx));
        drop(transactions);

        tx.schedule_commit_check();
        Ok(tx)
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            self.db.unpark(&engine);
        }
    }

    fn set_onclose(&self, handler: Option<Handler>) {
        self.onclose.set(handler);
    }

    fn set_onversionchange(&self, handler: Option<Handler>) {
        self.onversionchange.set(handler);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Active,
    Committed,
    Aborted,
}

struct MemoryTransaction {
    this: Weak<MemoryTransaction>,
    engine: Weak<EngineInner>,
    db: Rc<DatabaseState>,
    store: String,
    mode: TransactionMode,
    ranged_delete: bool,
    status: Cell<Status>,
    pending: Cell<usize>,
    snapshot: RefCell<Option<StoreData>>,
    oncomplete: HandlerSlot,
    onabort: HandlerSlot,
}

impl MemoryTransaction {
    fn defer(&self, task: impl FnOnce(&Rc<MemoryTransaction>) + 'static) {
        if let (Some(engine), Some(tx)) = (self.engine.upgrade(), self.this.upgrade()) {
            engine.defer(move |_| task(&tx));
        }
    }

    fn schedule_commit_check(&self) {
        self.defer(|tx| {
            if tx.status.get() == Status::Active && tx.pending.get() == 0 {
                tx.status.set(Status::Committed);
                tx.snapshot.borrow_mut().take();
                tx.oncomplete.fire();
            }
        });
    }

    fn check_active(&self) -> Result<(), EngineError> {
        match self.status.get() {
            Status::Active => Ok(()),
            _ => Err(EngineError::inactive("the transaction has finished")),
        }
    }

    fn check_writable(&self) -> Result<(), EngineError> {
        self.check_active()?;
        match self.mode {
            TransactionMode::ReadWrite => Ok(()),
            TransactionMode::Readonly => Err(EngineError::new(
                "ReadOnlyError",
                "the transaction is read-only",
            )),
        }
    }

    /// Queue `op` against the store's data and hand back the request that
    /// will report its outcome.
    fn request<T: Clone + 'static>(
        &self,
        op: impl FnOnce(&mut StoreData) -> Result<T, EngineError> + 'static,
    ) -> Result<Rc<dyn Request<T>>, EngineError> {
        self.check_active()?;
        let request = Rc::new(MemoryRequest::default());
        self.pending.set(self.pending.get() + 1);

        let pending = request.clone();
        self.defer(move |tx| {
            if tx.status.get() != Status::Active {
                return;
            }
            let outcome = tx.with_data(op);
            tx.settle(&pending, outcome);
        });
        Ok(request)
    }

    fn with_data<T>(
        &self,
        op: impl FnOnce(&mut StoreData) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut stores = self.db.stores.borrow_mut();
        match stores.get_mut(&self.store) {
            Some(data) => op(data),
            None => Err(EngineError::invalid_state(format!(
                "object store \"{}\" was deleted",
                self.store
            ))),
        }
    }

    /// Report a request's outcome. A failed request aborts the transaction.
    fn settle<T>(&self, request: &MemoryRequest<T>, outcome: Result<T, EngineError>) {
        self.pending.set(self.pending.get().saturating_sub(1));
        let failed = outcome.is_err();
        request.deliver(outcome);
        if failed {
            let _ = self.abort();
        }
        self.schedule_commit_check();
    }

    fn abort(&self) -> Result<(), EngineError> {
        if self.status.get() != Status::Active {
            return Err(EngineError::invalid_state("the transaction has finished"));
        }
        self.status.set(Status::Aborted);
        self.pending.set(0);

        if let Some(snapshot) = self.snapshot.borrow_mut().take() {
            if let Some(data) = self.db.stores.borrow_mut().get_mut(&self.store) {
                *data = snapshot;
            }
        }

        self.defer(|tx| tx.onabort.fire());
        Ok(())
    }
}

impl Transaction for MemoryTransaction {
    fn object_store(&self, name: &str) -> Result<Rc<dyn ObjectStore>, EngineError> {
        if self.status.get() != Status::Active {
            return Err(EngineError::invalid_state("the transaction has finished"));
        }
        if name != self.store {
            return Err(EngineError::not_found(format!(
                "object store \"{}\" is not in the transaction's scope",
                name
            )));
        }
        let tx = self
            .this
            .upgrade()
            .ok_or_else(|| EngineError::invalid_state("the transaction is gone"))?;
        Ok(Rc::new(MemoryObjectStore { tx }))
    }

    fn abort(&self) -> Result<(), EngineError> {
        MemoryTransaction::abort(self)
    }

    fn set_oncomplete(&self, handler: Option<Handler>) {
        self.oncomplete.set(handler);
    }

    fn set_onabort(&self, handler: Option<Handler>) {
        self.onabort.set(handler);
    }
}

struct MemoryObjectStore {
    tx: Rc<MemoryTransaction>,
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, key: &Key) -> Result<Rc<dyn Request<Option<Value>>>, EngineError> {
        let key = key.clone();
        self.tx
            .request(move |data| Ok(data.records.get(&key).cloned()))
    }

    fn put(&self, value: &Value, key: Option<&Key>) -> Result<Rc<dyn Request<Key>>, EngineError> {
        self.tx.check_writable()?;
        self.tx.with_data(|data| data.check_put(value, key))?;

        let value = value.clone();
        let key = key.cloned();
        self.tx.request(move |data| data.put(value, key))
    }

    fn delete(&self, key: &Key) -> Result<Rc<dyn Request<()>>, EngineError> {
        self.tx.check_writable()?;
        let key = key.clone();
        self.tx.request(move |data| {
            data.records.remove(&key);
            Ok(())
        })
    }

    fn delete_range(&self, range: &KeyRange) -> Result<Rc<dyn Request<()>>, EngineError> {
        if !self.tx.ranged_delete {
            return Err(EngineError::new(
                "NotSupportedError",
                "the engine cannot delete by key range",
            ));
        }
        self.tx.check_writable()?;
        let range = range.clone();
        self.tx.request(move |data| {
            data.records.retain(|key, _| !range.contains(key));
            Ok(())
        })
    }

    fn clear(&self) -> Result<Rc<dyn Request<()>>, EngineError> {
        self.tx.check_writable()?;
        self.tx.request(|data| {
            data.records.clear();
            Ok(())
        })
    }

    fn count(&self, range: Option<&KeyRange>) -> Result<Rc<dyn Request<u64>>, EngineError> {
        let range = range.cloned();
        self.tx
            .request(move |data| Ok(data.entries(range.as_ref()).count() as u64))
    }

    fn open_cursor(
        &self,
        range: Option<&KeyRange>,
        direction: CursorDirection,
    ) -> Result<Rc<dyn CursorRequest>, EngineError> {
        self.tx.check_active()?;
        let cursor = Rc::new_cyclic(|this| MemoryCursorRequest {
            this: this.clone(),
            tx: self.tx.clone(),
            request: MemoryRequest::default(),
            range: range.cloned(),
            direction,
            remaining: RefCell::new(None),
        });
        cursor.step();
        Ok(cursor)
    }
}

/// Positions are taken from the store's contents when the cursor first
/// reports; later writes do not show up in the iteration.
struct MemoryCursorRequest {
    this: Weak<MemoryCursorRequest>,
    tx: Rc<MemoryTransaction>,
    request: MemoryRequest<Option<CursorEntry>>,
    range: Option<KeyRange>,
    direction: CursorDirection,
    remaining: RefCell<Option<VecDeque<CursorEntry>>>,
}

impl MemoryCursorRequest {
    fn step(&self) {
        let cursor = match self.this.upgrade() {
            Some(cursor) => cursor,
            None => return,
        };
        self.tx.pending.set(self.tx.pending.get() + 1);
        self.tx.defer(move |tx| {
            if tx.status.get() != Status::Active {
                return;
            }
            let outcome = cursor.next_entry();
            tx.settle(&cursor.request, outcome);
        });
    }

    fn next_entry(&self) -> Result<Option<CursorEntry>, EngineError> {
        let mut remaining = self.remaining.borrow_mut();
        if remaining.is_none() {
            let entries = self.tx.with_data(|data| {
                let entries = data.entries(self.range.as_ref()).map(|(key, value)| CursorEntry {
                    key: key.clone(),
                    value: value.clone(),
                });
                Ok(match self.direction {
                    CursorDirection::Next => entries.collect::<VecDeque<_>>(),
                    CursorDirection::Prev => entries.rev().collect::<VecDeque<_>>(),
                })
            })?;
            *remaining = Some(entries);
        }
        Ok(remaining.as_mut().and_then(VecDeque::pop_front))
    }
}

impl Request<Option<CursorEntry>> for MemoryCursorRequest {
    fn ready_state(&self) -> ReadyState {
        self.request.ready_state()
    }

    fn result(&self) -> Result<Option<CursorEntry>, EngineError> {
        self.request.result()
    }

    fn set_onsuccess(&self, handler: Option<Handler>) {
        self.request.set_onsuccess(handler)
    }

    fn set_onerror(&self, handler: Option<Handler>) {
        self.request.set_onerror(handler)
    }
}

impl CursorRequest for MemoryCursorRequest {
    fn advance(&self) -> Result<(), EngineError> {
        self.tx.check_active()?;
        match self.request.result() {
            Ok(Some(_)) => {}
            Ok(None) => return Err(EngineError::invalid_state("the cursor is past its end")),
            Err(_) => {
                return Err(EngineError::invalid_state(
                    "the cursor is still advancing or has failed",
                ))
            }
        }
        self.request.rearm();
        self.step();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{cell::Cell, rc::Rc};

    use super::HandlerSlot;

    #[test]
    fn handler_stays_installed() {
        let slot = Rc::new(HandlerSlot::default());
        let calls = Rc::new(Cell::new(0));

        let counter = calls.clone();
        slot.set(Some(Box::new(move || counter.set(counter.get() + 1))));
        slot.fire();
        slot.fire();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn handler_that_clears_itself_stays_cleared() {
        let slot = Rc::new(HandlerSlot::default());
        let calls = Rc::new(Cell::new(0));

        let counter = calls.clone();
        let this = Rc::downgrade(&slot);
        slot.set(Some(Box::new(move || {
            counter.set(counter.get() + 1);
            if let Some(slot) = this.upgrade() {
                slot.set(None);
            }
        })));
        slot.fire();
        slot.fire();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn handler_replaced_while_running_is_not_restored() {
        let slot = Rc::new(HandlerSlot::default());
        let seen = Rc::new(Cell::new(""));

        let first = seen.clone();
        let replacement = seen.clone();
        let this = Rc::downgrade(&slot);
        slot.set(Some(Box::new(move || {
            first.set("first");
            let replacement = replacement.clone();
            if let Some(slot) = this.upgrade() {
                slot.set(Some(Box::new(move || replacement.set("second"))));
            }
        })));
        slot.fire();
        assert_eq!(seen.get(), "first");
        slot.fire();
        assert_eq!(seen.get(), "second");
    }
}
