use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::{Rc, Weak},
    task::Waker,
};

use crate::{
    engine::{Connection, Handler, ObjectStore, Request, Transaction},
    error::EngineError,
    request::RequestFuture,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    Readonly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Completed,
    Aborted,
}

/// Lifecycle of one cached transaction, shared with the requests issued on it
/// so that an abort can fail requests the engine never reports on.
#[derive(Debug)]
pub(crate) struct TransactionWatch {
    store: String,
    state: Cell<TransactionState>,
    waiters: RefCell<Vec<Waker>>,
}

impl TransactionWatch {
    fn new(store: &str) -> Rc<Self> {
        Rc::new(Self {
            store: store.to_owned(),
            state: Cell::new(TransactionState::Active),
            waiters: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn store(&self) -> &str {
        &self.store
    }

    pub(crate) fn state(&self) -> TransactionState {
        self.state.get()
    }

    pub(crate) fn register(&self, waker: &Waker) {
        let mut waiters = self.waiters.borrow_mut();
        if !waiters.iter().any(|w| w.will_wake(waker)) {
            waiters.push(waker.clone());
        }
    }

    fn finish(&self, state: TransactionState) {
        self.state.set(state);
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waker in waiters {
            waker.wake();
        }
    }
}

/// A live readwrite transaction scoped to a single store.
#[derive(Clone)]
pub(crate) struct TransactionHandle {
    id: u64,
    transaction: Rc<dyn Transaction>,
    watch: Rc<TransactionWatch>,
}

impl TransactionHandle {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn issue<T, R: ?Sized + Request<T>>(
        &self,
        op: &impl Fn(&dyn ObjectStore) -> Result<Rc<R>, EngineError>,
    ) -> Result<RequestFuture<T, R>, EngineError> {
        let store = self.transaction.object_store(&self.watch.store)?;
        let request = op(&*store)?;
        Ok(RequestFuture::watched(request, self.watch.clone()))
    }
}

type Entries = RefCell<HashMap<String, TransactionHandle>>;

/// At most one live transaction per store name.
///
/// Requests against a store reuse its cached transaction until the engine
/// reports completion or abort, at which point the entry is evicted and the
/// next request begins a fresh one.
///
/// The generation counts how often the cache was cleared, which happens
/// whenever its connection goes away.
pub(crate) struct TransactionCache {
    entries: Rc<Entries>,
    next_id: Cell<u64>,
    generation: Cell<u64>,
}

impl TransactionCache {
    pub(crate) fn new() -> Self {
        Self {
            entries: Rc::new(RefCell::new(HashMap::new())),
            next_id: Cell::new(0),
            generation: Cell::new(0),
        }
    }

    /// The cached transaction for `store`, beginning one if there is none.
    pub(crate) fn acquire(
        &self,
        connection: &dyn Connection,
        store: &str,
    ) -> Result<TransactionHandle, EngineError> {
        let cached = self
            .entries
            .borrow()
            .get(store)
            .filter(|handle| handle.watch.state() == TransactionState::Active)
            .cloned();

        match cached {
            Some(handle) => Ok(handle),
            None => self.begin(connection, store),
        }
    }

    /// Issue a request on the store's cached transaction.
    ///
    /// The engine may have let the cached transaction lapse without reporting
    /// completion yet; in that case it is dropped and the request is issued
    /// once more on a fresh transaction.
    pub(crate) fn issue<T, R: ?Sized + Request<T>>(
        &self,
        connection: &dyn Connection,
        store: &str,
        op: impl Fn(&dyn ObjectStore) -> Result<Rc<R>, EngineError>,
    ) -> Result<RequestFuture<T, R>, EngineError> {
        let handle = self.acquire(connection, store)?;
        match handle.issue(&op) {
            Err(e) if e.is_transaction_gone() => {
                tracing::debug!(store, error = %e, "cached transaction is gone, beginning a new one");
                evict(&self.entries, store, handle.id);
                self.begin(connection, store)?.issue(&op)
            }
            other => other,
        }
    }

    pub(crate) fn clear(&self) {
        self.entries.borrow_mut().clear();
        self.generation.set(self.generation.get() + 1);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.get()
    }

    #[cfg(test)]
    pub(crate) fn cached(&self, store: &str) -> Option<u64> {
        self.entries.borrow().get(store).map(TransactionHandle::id)
    }

    fn begin(
        &self,
        connection: &dyn Connection,
        store: &str,
    ) -> Result<TransactionHandle, EngineError> {
        let transaction = connection.transaction(store, TransactionMode::ReadWrite)?;
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let watch = TransactionWatch::new(store);

        let on_complete = {
            let watch = watch.clone();
            let entries = Rc::downgrade(&self.entries);
            let handler: Handler = Box::new(move || {
                tracing::trace!(store = %watch.store, id, "transaction complete");
                watch.finish(TransactionState::Completed);
                evict_weak(&entries, &watch.store, id);
            });
            handler
        };
        transaction.set_oncomplete(Some(on_complete));

        let on_abort = {
            let watch = watch.clone();
            let entries = Rc::downgrade(&self.entries);
            let handler: Handler = Box::new(move || {
                tracing::warn!(store = %watch.store, id, "transaction aborted");
                watch.finish(TransactionState::Aborted);
                evict_weak(&entries, &watch.store, id);
            });
            handler
        };
        transaction.set_onabort(Some(on_abort));

        let handle = TransactionHandle {
            id,
            transaction,
            watch,
        };
        self.entries
            .borrow_mut()
            .insert(store.to_owned(), handle.clone());
        tracing::debug!(store, id, "began readwrite transaction");

        Ok(handle)
    }
}

fn evict(entries: &Entries, store: &str, id: u64) {
    let mut entries = entries.borrow_mut();
    if entries.get(store).map(TransactionHandle::id) == Some(id) {
        entries.remove(store);
    }
}

fn evict_weak(entries: &Weak<Entries>, store: &str, id: u64) {
    if let Some(entries) = entries.upgrade() {
        evict(&entries, store, id);
    }
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::TransactionCache;
    use crate::{
        engine::{Connection, Factory, OpenRequest, UpgradeDatabase, VersionChange},
        memory::MemoryEngine,
        request::RequestFuture,
        schema::{reconcile, StoreSpec},
    };

    fn open(engine: &MemoryEngine, store: &str) -> Rc<dyn Connection> {
        let request = engine.open("txn", 1).unwrap();
        let specs = vec![StoreSpec::new(store)];
        let capabilities = engine.capabilities();
        request.set_onupgradeneeded(Some(Box::new(
            move |db: &dyn UpgradeDatabase, _: VersionChange| {
                reconcile(db, &specs, capabilities).unwrap();
            },
        )));
        engine
            .run_until_complete(RequestFuture::<_, dyn OpenRequest>::new(request))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn acquire_reuses_until_complete() {
        let engine = MemoryEngine::new();
        let connection = open(&engine, "s");
        let cache = TransactionCache::new();

        let first = cache.acquire(&*connection, "s").unwrap();
        let second = cache.acquire(&*connection, "s").unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(engine.transactions_begun("s"), 1);

        // Nothing is outstanding, so the next turn of the event loop commits.
        engine.run_until_idle();
        assert_eq!(cache.cached("s"), None);

        let third = cache.acquire(&*connection, "s").unwrap();
        assert_ne!(third.id(), first.id());
        assert_eq!(engine.transactions_begun("s"), 2);
    }

    #[test]
    fn abort_evicts_entry() {
        let engine = MemoryEngine::new();
        let connection = open(&engine, "s");
        let cache = TransactionCache::new();

        let handle = cache.acquire(&*connection, "s").unwrap();
        assert_eq!(cache.cached("s"), Some(handle.id()));

        engine.abort_transactions("s");
        engine.run_until_idle();
        assert_eq!(cache.cached("s"), None);
    }

    #[test]
    fn acquire_on_missing_store_fails() {
        let engine = MemoryEngine::new();
        let connection = open(&engine, "s");
        let cache = TransactionCache::new();

        let err = cache.acquire(&*connection, "nope").err().unwrap();
        assert_eq!(err.name, "NotFoundError");
    }

    #[test]
    fn clear_starts_a_new_generation() {
        let engine = MemoryEngine::new();
        let connection = open(&engine, "s");
        let cache = TransactionCache::new();

        let before = cache.generation();
        cache.acquire(&*connection, "s").unwrap();
        assert_eq!(cache.generation(), before);

        cache.clear();
        assert_eq!(cache.cached("s"), None);
        assert_ne!(cache.generation(), before);
    }
}
