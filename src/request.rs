use futures::{
    task::{Context, Poll},
    Future,
};
use std::{fmt, marker::PhantomData, pin::Pin, rc::Rc};

use crate::{
    engine::{ReadyState, Request},
    error::Error,
    transaction::{TransactionState, TransactionWatch},
};

/// Adapts a callback-driven engine request into a future.
///
/// While the request is pending, `onsuccess` and `onerror` are pointed at the
/// current task's waker; once the engine marks it done the outcome is read
/// back from the request. Requests issued on a cached transaction also watch
/// that transaction, and fail with [`Error::TransactionAborted`] if it aborts
/// before the engine reports on them.
pub(crate) struct RequestFuture<T, R: ?Sized = dyn Request<T>> {
    request: Rc<R>,
    watch: Option<Rc<TransactionWatch>>,
    output: PhantomData<fn() -> T>,
}

impl<T, R: ?Sized + Request<T>> RequestFuture<T, R> {
    pub(crate) fn new(request: Rc<R>) -> Self {
        Self {
            request,
            watch: None,
            output: PhantomData,
        }
    }

    pub(crate) fn watched(request: Rc<R>, watch: Rc<TransactionWatch>) -> Self {
        Self {
            request,
            watch: Some(watch),
            output: PhantomData,
        }
    }

    /// The engine request behind this future. The future can be polled again
    /// after the request is re-armed.
    pub(crate) fn request(&self) -> &R {
        &self.request
    }

    fn set_wakers(&self, cx: &Context) {
        let waker = cx.waker().to_owned();
        self.request
            .set_onsuccess(Some(Box::new(move || waker.wake_by_ref())));

        let waker = cx.waker().to_owned();
        self.request
            .set_onerror(Some(Box::new(move || waker.wake_by_ref())));
    }
}

impl<T, R: ?Sized> fmt::Debug for RequestFuture<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RequestFuture")
    }
}

impl<T, R: ?Sized + Request<T>> Future for RequestFuture<T, R> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match self.request.ready_state() {
            ReadyState::Done => Poll::Ready(self.request.result().map_err(Error::from)),
            ReadyState::Pending => {
                if let Some(watch) = &self.watch {
                    if watch.state() == TransactionState::Aborted {
                        return Poll::Ready(Err(Error::TransactionAborted {
                            store: watch.store().to_owned(),
                        }));
                    }
                    watch.register(cx.waker());
                }

                self.set_wakers(cx);
                Poll::Pending
            }
        }
    }
}
