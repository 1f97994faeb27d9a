use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};

use tracing::trace;

use crate::diagnostics;
use crate::error::Error;
use crate::microtask;
use crate::outcome::IntoOutcome;

static NEXT_PROMISE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState<T> {
    Pending,
    Fulfilled(T),
    Rejected(Error),
}

impl<T> PromiseState<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, PromiseState::Pending)
    }
}

type Reaction<T> = Box<dyn FnOnce(Result<T, Error>)>;

struct Inner<T> {
    id: u64,
    state: PromiseState<T>,
    // set once the promise started adopting another one
    locked: bool,
    // set once anything subscribed; decides unhandled-rejection reporting
    handled: bool,
    reactions: Vec<Reaction<T>>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let PromiseState::Rejected(error) = &self.state {
            if !self.handled {
                diagnostics::report_unhandled(self.id, error);
            }
        }
    }
}

/// A settle-once value shared by reference.
///
/// Reactions registered with [`Promise::on_settle`] (or `then`/`catch`/
/// `finally`) run exactly once, in registration order, on a later microtask
/// than the one that registered them or settled the promise.
pub struct Promise<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> Promise<T> {
    fn with_state(state: PromiseState<T>) -> Self {
        Promise {
            inner: Rc::new(RefCell::new(Inner {
                id: NEXT_PROMISE_ID.fetch_add(1, Ordering::Relaxed),
                state,
                locked: false,
                handled: false,
                reactions: Vec::new(),
            })),
        }
    }

    pub fn pending() -> Self {
        Self::with_state(PromiseState::Pending)
    }

    pub fn fulfilled(value: T) -> Self {
        Self::with_state(PromiseState::Fulfilled(value))
    }

    pub fn rejected(error: Error) -> Self {
        Self::with_state(PromiseState::Rejected(error))
    }

    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    /// Fulfil with a value, or adopt the eventual state of another promise.
    ///
    /// No-op once the promise is settled or already adopting.
    pub fn resolve(&self, value: impl Into<Flow<T>>) {
        match value.into() {
            Flow::Ready(value) => {
                self.transition(Ok(value), false);
            }
            Flow::Pending(other) => {
                if Rc::ptr_eq(&self.inner, &other.inner) {
                    self.transition(Err(Error::SelfResolution), false);
                } else {
                    self.adopt(other);
                }
            }
        }
    }

    /// No-op once the promise is settled or already adopting.
    pub fn reject(&self, error: Error) {
        self.transition(Err(error), false);
    }

    pub(crate) fn settle_with(&self, outcome: Result<Flow<T>, Error>) {
        match outcome {
            Ok(flow) => self.resolve(flow),
            Err(error) => self.reject(error),
        }
    }

    fn adopt(&self, other: Promise<T>) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.locked || !inner.state.is_pending() {
                return;
            }
            inner.locked = true;
        }
        trace!(promise = self.id(), inner = other.id(), "adopting promise");
        let target = self.clone();
        other.subscribe_raw(move |result| {
            target.transition(result, true);
        });
    }

    fn transition(&self, result: Result<T, Error>, adopted: bool) -> bool {
        let (id, reactions) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.state.is_pending() || (inner.locked && !adopted) {
                return false;
            }
            inner.state = match &result {
                Ok(value) => PromiseState::Fulfilled(value.clone()),
                Err(error) => PromiseState::Rejected(error.clone()),
            };
            (inner.id, std::mem::take(&mut inner.reactions))
        };
        trace!(
            promise = id,
            fulfilled = result.is_ok(),
            reactions = reactions.len(),
            "promise settled"
        );
        for reaction in reactions {
            let result = result.clone();
            microtask::enqueue(move || reaction(result));
        }
        true
    }

    /// Register a reaction that receives the settled result.
    ///
    /// An already settled promise adopted by another one hands over its state
    /// in the same turn; only user-visible continuations pay the extra turn.
    fn subscribe_raw(&self, reaction: impl FnOnce(Result<T, Error>) + 'static) {
        let mut inner = self.inner.borrow_mut();
        inner.handled = true;
        let settled = match &inner.state {
            PromiseState::Pending => None,
            PromiseState::Fulfilled(value) => Some(Ok(value.clone())),
            PromiseState::Rejected(error) => Some(Err(error.clone())),
        };
        match settled {
            None => inner.reactions.push(Box::new(reaction)),
            Some(result) => {
                drop(inner);
                reaction(result);
            }
        }
    }

    /// Like `subscribe_raw` but the reaction always runs on a later turn.
    pub(crate) fn subscribe(&self, reaction: impl FnOnce(Result<T, Error>) + 'static) {
        let mut inner = self.inner.borrow_mut();
        inner.handled = true;
        let settled = match &inner.state {
            PromiseState::Pending => None,
            PromiseState::Fulfilled(value) => Some(Ok(value.clone())),
            PromiseState::Rejected(error) => Some(Err(error.clone())),
        };
        match settled {
            None => inner.reactions.push(Box::new(reaction)),
            Some(result) => {
                drop(inner);
                microtask::enqueue(move || reaction(result));
            }
        }
    }

    /// Register a continuation pair and get a promise for its outcome.
    ///
    /// Whatever the callback returns is flattened: returning a promise makes
    /// the continuation's promise adopt it.
    pub fn on_settle<U, F, G, O1, O2>(&self, on_fulfilled: F, on_rejected: G) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> O1 + 'static,
        G: FnOnce(Error) -> O2 + 'static,
        O1: IntoOutcome<Output = U>,
        O2: IntoOutcome<Output = U>,
    {
        let next = Promise::pending();
        let target = next.clone();
        self.subscribe(move |result| {
            let outcome = match result {
                Ok(value) => guarded("on_fulfilled", move || on_fulfilled(value).into_flow()),
                Err(error) => guarded("on_rejected", move || on_rejected(error).into_flow()),
            };
            target.settle_with(outcome);
        });
        next
    }

    pub fn then<U, F, O>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> O + 'static,
        O: IntoOutcome<Output = U>,
    {
        self.on_settle(on_fulfilled, |error| Err::<Flow<U>, Error>(error))
    }

    pub fn catch<F, O>(&self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Error) -> O + 'static,
        O: IntoOutcome<Output = T>,
    {
        self.on_settle(Flow::Ready, on_rejected)
    }

    /// Run `f` after settlement either way, passing the result through.
    /// A panic in `f` rejects the returned promise.
    pub fn finally<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce() + 'static,
    {
        let next = Promise::pending();
        let target = next.clone();
        self.subscribe(move |result| {
            match guarded("finally", move || {
                f();
                Ok(Flow::Ready(()))
            }) {
                Err(error) => target.reject(error),
                Ok(_) => target.settle_with(result.map(Flow::Ready)),
            }
        });
        next
    }

    /// Await the promise from async code.
    pub fn settled(&self) -> Settled<T> {
        let slot = Rc::new(RefCell::new(SettledSlot {
            result: None,
            waker: None,
        }));
        let filler = slot.clone();
        self.subscribe(move |result| {
            let mut slot = filler.borrow_mut();
            slot.result = Some(result);
            if let Some(waker) = slot.waker.take() {
                waker.wake();
            }
        });
        Settled { slot }
    }

    pub fn state(&self) -> PromiseState<T> {
        self.inner.borrow().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.borrow().state.is_pending()
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self.inner.borrow().state, PromiseState::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.inner.borrow().state, PromiseState::Rejected(_))
    }

    pub fn value(&self) -> Option<T> {
        match &self.inner.borrow().state {
            PromiseState::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<Error> {
        match &self.inner.borrow().state {
            PromiseState::Rejected(error) => Some(error.clone()),
            _ => None,
        }
    }

    pub fn ptr_eq(&self, other: &Promise<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Promise")
            .field("id", &inner.id)
            .field("state", &inner.state)
            .field("reactions", &inner.reactions.len())
            .finish()
    }
}

/// Run user code, turning a panic into a rejection reason.
pub(crate) fn guarded<R>(
    function: &str,
    f: impl FnOnce() -> Result<Flow<R>, Error>,
) -> Result<Flow<R>, Error> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(outcome) => outcome,
        Err(payload) => Err(Error::from_panic(function, payload)),
    }
}

/// A value that is either available now or still pending.
pub enum Flow<T> {
    Ready(T),
    Pending(Promise<T>),
}

impl<T> Flow<T> {
    pub fn is_promise(&self) -> bool {
        matches!(self, Flow::Pending(_))
    }
}

impl<T: Clone + 'static> Flow<T> {
    pub fn into_promise(self) -> Promise<T> {
        match self {
            Flow::Ready(value) => Promise::fulfilled(value),
            Flow::Pending(promise) => promise,
        }
    }
}

impl<T> From<T> for Flow<T> {
    fn from(value: T) -> Self {
        Flow::Ready(value)
    }
}

impl<T> From<Promise<T>> for Flow<T> {
    fn from(promise: Promise<T>) -> Self {
        Flow::Pending(promise)
    }
}

impl<T> From<&Promise<T>> for Flow<T> {
    fn from(promise: &Promise<T>) -> Self {
        Flow::Pending(promise.clone())
    }
}

struct SettledSlot<T> {
    result: Option<Result<T, Error>>,
    waker: Option<Waker>,
}

/// Future returned by [`Promise::settled`].
pub struct Settled<T> {
    slot: Rc<RefCell<SettledSlot<T>>>,
}

impl<T> Future for Settled<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        match slot.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::on_unhandled_rejection;
    use std::cell::Cell;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) + Clone) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        (log, move |line: &str| sink.borrow_mut().push(line.to_string()))
    }

    #[test]
    fn test_settles_once() {
        let p = Promise::<i32>::pending();
        assert!(p.is_pending());
        p.resolve(1);
        p.resolve(2);
        p.reject(Error::thrown("late"));
        assert_eq!(p.state(), PromiseState::Fulfilled(1));

        let q = Promise::<i32>::pending();
        q.reject(Error::thrown("first"));
        q.resolve(3);
        assert_eq!(q.error(), Some(Error::thrown("first")));
        let _ = q.catch(|_| 0);
    }

    #[test]
    fn test_reactions_never_run_inline() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let p = Promise::fulfilled(5);
        let _ = p.then(move |v| flag.set(v == 5));
        assert!(!ran.get());
        microtask::drain();
        assert!(ran.get());

        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let p = Promise::<i32>::pending();
        let _ = p.then(move |_| flag.set(true));
        p.resolve(1);
        assert!(!ran.get());
        microtask::drain();
        assert!(ran.get());
    }

    #[test]
    fn test_registration_order() {
        let (log, push) = recorder();
        let p = Promise::<i32>::pending();
        let c1 = push.clone();
        let c2 = push.clone();
        let _ = p.then(move |v| c1(&format!("c1 {v}")));
        let _ = p.then(move |v| c2(&format!("c2 {v}")));
        p.resolve(9);
        // registered after settlement, still after the first two
        let _ = p.then(move |v| push(&format!("c3 {v}")));
        microtask::drain();
        assert_eq!(*log.borrow(), vec!["c1 9", "c2 9", "c3 9"]);
    }

    #[test]
    fn test_resolve_with_promise_flattens() {
        let outer = Promise::<i32>::pending();
        let inner = Promise::<i32>::pending();
        outer.resolve(&inner);
        assert!(outer.is_pending());
        // locked while adopting
        outer.resolve(100);
        outer.reject(Error::thrown("ignored"));
        inner.resolve(7);
        assert!(outer.is_pending());
        microtask::drain();
        assert_eq!(outer.value(), Some(7));
    }

    #[test]
    fn test_adopting_settled_promise_is_immediate() {
        let outer = Promise::<i32>::pending();
        outer.resolve(Promise::fulfilled(4));
        assert_eq!(outer.value(), Some(4));

        let outer = Promise::<i32>::pending();
        outer.resolve(Promise::rejected(Error::thrown("nope")));
        assert_eq!(outer.error(), Some(Error::thrown("nope")));
        let _ = outer.catch(|_| 0);
    }

    #[test]
    fn test_self_resolution_rejects() {
        let p = Promise::<i32>::pending();
        p.resolve(p.clone());
        assert_eq!(p.error(), Some(Error::SelfResolution));
        let _ = p.catch(|_| 0);
    }

    #[test]
    fn test_then_chain_and_rejection_passthrough() {
        let p = Promise::<i32>::pending();
        let doubled = p.then(|v| v * 2);
        let text = doubled.then(|v| format!("v={v}"));
        p.resolve(21);
        microtask::drain();
        assert_eq!(text.value(), Some("v=42".to_string()));

        let p = Promise::<i32>::pending();
        let skipped = Rc::new(Cell::new(true));
        let flag = skipped.clone();
        let chained = p.then(move |v| {
            flag.set(false);
            v
        });
        let recovered = chained.catch(|e| match e {
            Error::Thrown(msg) => msg.len() as i32,
            _ => -1,
        });
        p.reject(Error::thrown("four"));
        microtask::drain();
        assert!(skipped.get());
        assert_eq!(chained.error(), Some(Error::thrown("four")));
        assert_eq!(recovered.value(), Some(4));
    }

    #[test]
    fn test_callback_returning_promise_is_flattened() {
        let later = Promise::<String>::pending();
        let hand_off = later.clone();
        let p = Promise::fulfilled(1);
        let chained: Promise<String> = p.then(move |_| hand_off);
        microtask::drain();
        assert!(chained.is_pending());
        later.resolve("done".to_string());
        microtask::drain();
        assert_eq!(chained.value(), Some("done".to_string()));
    }

    #[test]
    fn test_callback_err_and_panic_reject() {
        let p = Promise::fulfilled(1);
        let failed = p.then(|_| Err::<i32, _>(Error::thrown("bad input")));
        let panicked = p.then(|_| -> i32 { panic!("exploded") });
        microtask::drain();
        assert_eq!(failed.error(), Some(Error::thrown("bad input")));
        assert_eq!(
            panicked.error(),
            Some(Error::Panicked {
                function: "on_fulfilled".into(),
                message: "exploded".into()
            })
        );
        let _ = failed.catch(|_| 0);
        let _ = panicked.catch(|_| 0);
    }

    #[test]
    fn test_finally_passes_result_through() {
        let (log, push) = recorder();
        let p = Promise::<i32>::pending();
        let out = p.finally(move || push("cleanup"));
        p.reject(Error::thrown("x"));
        microtask::drain();
        assert_eq!(*log.borrow(), vec!["cleanup"]);
        assert_eq!(out.error(), Some(Error::thrown("x")));
        let _ = out.catch(|_| 0);
    }

    #[test]
    fn test_unhandled_rejection_reported_on_drop() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let _guard = on_unhandled_rejection(move |e| sink.borrow_mut().push(e.clone()));

        {
            let p = Promise::<i32>::pending();
            p.reject(Error::thrown("lost"));
        }
        assert_eq!(*seen.borrow(), vec![Error::thrown("lost")]);

        {
            let p = Promise::<i32>::pending();
            let handled = p.catch(|_| 0);
            p.reject(Error::thrown("caught"));
            microtask::drain();
            assert_eq!(handled.value(), Some(0));
        }
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_settled_future() {
        use futures_util::FutureExt;

        let p = Promise::<i32>::pending();
        let mut fut = p.settled();
        assert!((&mut fut).now_or_never().is_none());
        p.resolve(3);
        microtask::drain();
        assert_eq!(fut.now_or_never(), Some(Ok(3)));
    }
}
