//! Pull-based iteration over a store's values.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, BTreeSet},
    fmt,
    marker::PhantomData,
    pin::Pin,
    rc::Rc,
    task::Waker,
};

use futures::{
    future::{poll_fn, LocalBoxFuture},
    task::{Context, Poll},
    Future, FutureExt, Stream,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    engine::{Connection, CursorDirection, CursorEntry, CursorRequest},
    error::{Error, Result},
    key::Key,
    key_range::KeyRange,
    request::RequestFuture,
    transaction::TransactionCache,
};

type CursorFuture = RequestFuture<Option<CursorEntry>, dyn CursorRequest>;

/// Hands out turns to pulls in the order they were issued.
#[derive(Default)]
struct PullQueue {
    next_ticket: Cell<u64>,
    serving: Cell<u64>,
    waiting: RefCell<BTreeMap<u64, Waker>>,
    abandoned: RefCell<BTreeSet<u64>>,
}

impl PullQueue {
    fn ticket(&self) -> u64 {
        let ticket = self.next_ticket.get();
        self.next_ticket.set(ticket + 1);
        ticket
    }

    fn poll_turn(&self, ticket: u64, cx: &mut Context) -> Poll<()> {
        if self.serving.get() == ticket {
            Poll::Ready(())
        } else {
            self.waiting
                .borrow_mut()
                .insert(ticket, cx.waker().clone());
            Poll::Pending
        }
    }

    /// Give up `ticket`, whether it was served or dropped while waiting.
    fn release(&self, ticket: u64) {
        self.waiting.borrow_mut().remove(&ticket);
        if ticket != self.serving.get() {
            self.abandoned.borrow_mut().insert(ticket);
            return;
        }

        let mut next = ticket + 1;
        {
            let mut abandoned = self.abandoned.borrow_mut();
            while abandoned.remove(&next) {
                next += 1;
            }
        }
        self.serving.set(next);

        let waker = self.waiting.borrow_mut().remove(&next);
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

struct Turn {
    shared: Rc<Shared>,
    ticket: u64,
}

impl Drop for Turn {
    fn drop(&mut self) {
        self.shared.queue.release(self.ticket);
    }
}

enum CursorState {
    Idle,
    /// Waiting on the engine for the next position. A pull dropped here
    /// leaves the request for the next pull to pick up.
    Advancing(CursorFuture),
    /// On an entry that has been handed out.
    Open(CursorFuture),
    Exhausted,
}

struct Shared {
    connection: Rc<dyn Connection>,
    cache: Rc<TransactionCache>,
    /// Cache generation the iterator was created under.
    generation: u64,
    store: String,
    range: Option<KeyRange>,
    queue: PullQueue,
    state: RefCell<CursorState>,
}

impl Shared {
    fn open(&self) -> Result<CursorFuture> {
        let range = self.range.as_ref();
        let cursor: CursorFuture = self
            .cache
            .issue(&*self.connection, &self.store, |store| {
                store.open_cursor(range, CursorDirection::Next)
            })?;
        Ok(cursor)
    }

    fn poll_advancing(&self, cx: &mut Context) -> Poll<Result<Option<CursorEntry>>> {
        match &mut *self.state.borrow_mut() {
            CursorState::Advancing(cursor) => Pin::new(cursor).poll(cx),
            _ => Poll::Ready(Ok(None)),
        }
    }

    /// The next entry. Only one pull runs this at a time.
    async fn pull(&self) -> Result<Option<CursorEntry>> {
        let state = self.state.replace(CursorState::Exhausted);
        if let CursorState::Exhausted = state {
            return Ok(None);
        }
        if self.cache.generation() != self.generation {
            tracing::debug!(store = %self.store, "iterator outlived its connection");
            return Err(Error::DatabaseNotOpen);
        }

        let cursor = match state {
            CursorState::Exhausted => return Ok(None),
            CursorState::Idle => self.open()?,
            CursorState::Advancing(cursor) => cursor,
            CursorState::Open(cursor) => {
                if let Err(e) = cursor.request().advance() {
                    tracing::debug!(store = %self.store, error = %e, "cursor cannot advance");
                    return Err(e.into());
                }
                cursor
            }
        };
        *self.state.borrow_mut() = CursorState::Advancing(cursor);

        let entry = poll_fn(|cx| self.poll_advancing(cx)).await;
        match (entry, self.state.replace(CursorState::Exhausted)) {
            (Ok(Some(entry)), CursorState::Advancing(cursor)) => {
                *self.state.borrow_mut() = CursorState::Open(cursor);
                Ok(Some(entry))
            }
            (entry, _) => entry,
        }
    }
}

/// A single-pass sequence of a store's values in ascending key order.
///
/// Pulls may be issued without waiting for earlier ones; they are served one
/// at a time in the order they were made, so at most one cursor advance is in
/// flight. Once the end is reached, or a pull fails, every later pull yields
/// `None`. A pull dropped before it resolves loses nothing: the next pull
/// gets the entry it was waiting for.
///
/// The sequence reflects the store as it was when iteration started. If the
/// engine commits the iterator's transaction between pulls (an IndexedDB
/// transaction commits as soon as it is left idle), the next pull fails with
/// a `TransactionInactiveError` rather than continuing on a newer view. The
/// iterator is also tied to the connection it was created on and fails with
/// [`Error::DatabaseNotOpen`] once its client closes or reopens.
///
/// The iterator is also a [`Stream`] of `Result<T>`.
pub struct CursorIterator<T = Value> {
    shared: Rc<Shared>,
    pending: Option<LocalBoxFuture<'static, Result<Option<T>>>>,
    item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned + 'static> CursorIterator<T> {
    pub(crate) fn new(
        connection: Rc<dyn Connection>,
        cache: Rc<TransactionCache>,
        store: &str,
        range: Option<KeyRange>,
    ) -> Self {
        Self {
            shared: Rc::new(Shared {
                connection,
                generation: cache.generation(),
                cache,
                store: store.to_owned(),
                range,
                queue: PullQueue::default(),
                state: RefCell::new(CursorState::Idle),
            }),
            pending: None,
            item: PhantomData,
        }
    }

    /// Queue a pull. The turn is taken now, so pulls are served in the order
    /// this is called.
    fn pull(&self) -> impl Future<Output = Result<Option<CursorEntry>>> + 'static {
        let shared = self.shared.clone();
        let turn = Turn {
            shared: shared.clone(),
            ticket: shared.queue.ticket(),
        };

        async move {
            poll_fn(|cx| turn.shared.queue.poll_turn(turn.ticket, cx)).await;
            let entry = shared.pull().await;
            drop(turn);
            entry
        }
    }

    /// Pull the next value. Resolves to `Ok(None)` at the end.
    pub fn next_item(&self) -> impl Future<Output = Result<Option<T>>> + 'static {
        let pull = self.pull();
        async move {
            match pull.await? {
                Some(entry) => Ok(Some(serde_json::from_value(entry.value)?)),
                None => Ok(None),
            }
        }
    }

    /// Pull the next entry, key included.
    pub fn next_entry(&self) -> impl Future<Output = Result<Option<(Key, T)>>> + 'static {
        let pull = self.pull();
        async move {
            match pull.await? {
                Some(CursorEntry { key, value }) => Ok(Some((key, serde_json::from_value(value)?))),
                None => Ok(None),
            }
        }
    }

    /// Drain the remaining values.
    pub async fn collect_items(&self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next_item().await? {
            items.push(item);
        }
        Ok(items)
    }

    pub fn store(&self) -> &str {
        &self.shared.store
    }
}

impl<T> fmt::Debug for CursorIterator<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CursorIterator")
            .field("store", &self.shared.store)
            .field("range", &self.shared.range)
            .finish()
    }
}

impl<T: DeserializeOwned + 'static> Stream for CursorIterator<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let mut pending = match self.pending.take() {
            Some(pending) => pending,
            None => self.next_item().boxed_local(),
        };

        match pending.poll_unpin(cx) {
            Poll::Ready(Ok(Some(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Ok(None)) => Poll::Ready(None),
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
            Poll::Pending => {
                self.pending = Some(pending);
                Poll::Pending
            }
        }
    }
}
