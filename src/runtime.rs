//! The event loop.
//!
//! One turn drains the microtask queue, polls every ready task (draining
//! microtasks after each poll) and fires due timers, parking on a mio poll
//! when there is nothing to do but wait. The loop returns when it runs out of
//! work: see [`Runtime::run`].

use std::cell::{Cell, RefCell};
use std::collections::BinaryHeap;
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use mio::{Events, Token};
use scoped_tls::scoped_thread_local;
use tracing::{debug, trace};

use crate::bootstrap::Bootstrap;
use crate::error::{Error, Result};
use crate::executor::{Executor, ExecutorShared, ExternalWork};
use crate::microtask;
use crate::promise::{Flow, Promise, PromiseState};
use crate::task::Spawner;

const WAKER_TOKEN: Token = Token(0);

scoped_thread_local! { static RUNTIME_CONTEXT: RuntimeContext }

struct RuntimeContext {
    spawner: Spawner,
    executor_shared: Arc<ExecutorShared>,
    timer_manager: RefCell<TimerManager>,
    clock: Clock,
}

enum Clock {
    System { origin: Instant },
    /// Time moves only when the loop is idle, straight to the next deadline.
    Virtual { origin: Instant, elapsed: Cell<Duration> },
}

impl Clock {
    fn now(&self) -> Instant {
        match self {
            Clock::System { .. } => Instant::now(),
            Clock::Virtual { origin, elapsed } => *origin + elapsed.get(),
        }
    }

    fn elapsed(&self) -> Duration {
        match self {
            Clock::System { origin } => origin.elapsed(),
            Clock::Virtual { elapsed, .. } => elapsed.get(),
        }
    }

    fn is_virtual(&self) -> bool {
        matches!(self, Clock::Virtual { .. })
    }

    fn advance_to(&self, deadline: Instant) {
        if let Clock::Virtual { origin, elapsed } = self {
            let target = deadline.saturating_duration_since(*origin);
            if target > elapsed.get() {
                elapsed.set(target);
            }
        }
    }
}

struct TimerManager {
    timers: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerManager {
    fn new() -> Self {
        Self {
            timers: BinaryHeap::with_capacity(16),
            next_seq: 0,
        }
    }

    fn add(&mut self, wakeup_instant: Instant, waker: Waker) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.push(TimerEntry {
            wakeup_instant,
            seq,
            waker,
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|entry| entry.wakeup_instant)
    }

    fn wakeup_timers(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(entry) = self.timers.peek() {
            if entry.wakeup_instant > now {
                break;
            }
            if let Some(entry) = self.timers.pop() {
                entry.waker.wake();
                fired += 1;
            }
        }
        fired
    }
}

struct TimerEntry {
    wakeup_instant: Instant,
    // equal deadlines fire in registration order
    seq: u64,
    waker: Waker,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wakeup_instant == other.wakeup_instant && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // reversed: BinaryHeap is a max-heap, the earliest deadline must be on top
        other
            .wakeup_instant
            .cmp(&self.wakeup_instant)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct Builder {
    virtual_clock: bool,
    event_capacity: usize,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            virtual_clock: false,
            event_capacity: 64,
        }
    }

    /// Timers complete in deadline order without real waiting.
    pub fn virtual_clock(mut self, enabled: bool) -> Self {
        self.virtual_clock = enabled;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let mio_poll = mio::Poll::new()?;
        let mio_waker = Arc::new(mio::Waker::new(mio_poll.registry(), WAKER_TOKEN)?);
        let notifier_waker = mio_waker.clone();
        let executor = Executor::new(move || {
            // a failed wake only delays the loop until its next timeout
            let _ = notifier_waker.wake();
        });
        let origin = Instant::now();
        let clock = if self.virtual_clock {
            Clock::Virtual {
                origin,
                elapsed: Cell::new(Duration::ZERO),
            }
        } else {
            Clock::System { origin }
        };
        let runtime_context = RuntimeContext {
            spawner: executor.spawner(),
            executor_shared: executor.shared(),
            timer_manager: RefCell::new(TimerManager::new()),
            clock,
        };
        Ok(Runtime {
            executor,
            mio_poll,
            events: Events::with_capacity(self.event_capacity),
            mio_waker,
            runtime_context: Some(runtime_context),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Runtime {
    executor: Executor,
    mio_poll: mio::Poll,
    events: Events,
    mio_waker: Arc<mio::Waker>,
    runtime_context: Option<RuntimeContext>,
    shutdown: Arc<AtomicBool>,
}

impl Runtime {
    pub fn new() -> Result<Self> {
        Builder::new().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Run `f` with this runtime as the current one, without driving the loop.
    pub fn enter<R>(&mut self, f: impl FnOnce() -> R) -> Result<R> {
        self.with_context(|_, _| f())
    }

    /// Drive the loop until it runs out of work: no microtask queued, no
    /// timer pending, and no task that anything could still wake.
    pub fn run(&mut self) -> Result<()> {
        self.drive(|| false).map(|_| ())
    }

    /// Drive the loop until `promise` settles.
    ///
    /// Fails with [`Error::Stalled`] if the loop runs out of work first.
    pub fn block_on<T: Clone + 'static>(&mut self, promise: &Promise<T>) -> Result<T> {
        // observing the outcome here counts as handling it
        promise.subscribe(|_| {});
        let watched = promise.clone();
        self.drive(move || !watched.is_pending())?;
        match promise.state() {
            PromiseState::Fulfilled(value) => Ok(value),
            PromiseState::Rejected(error) => Err(error),
            PromiseState::Pending => Err(Error::Stalled),
        }
    }

    /// Fire `bootstrap` inside the runtime, then drive the loop to completion.
    /// Returns whether the entry ran.
    pub fn run_entry(&mut self, bootstrap: &Bootstrap) -> Result<bool> {
        let fired = self.enter(|| bootstrap.fire())?;
        self.run()?;
        Ok(fired)
    }

    pub fn shutdown_signal(&self) -> RuntimeShutdownSignal {
        RuntimeShutdownSignal {
            mio_waker: self.mio_waker.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn task_count(&self) -> usize {
        self.executor.task_count()
    }

    fn drive(&mut self, mut done: impl FnMut() -> bool) -> Result<bool> {
        self.with_context(|rt, context| rt.drive_in(context, &mut done))?
    }

    /// Set the runtime context for the duration of `f`. The context is put
    /// back even if `f` unwinds, so the runtime stays usable.
    fn with_context<R>(&mut self, f: impl FnOnce(&mut Self, &RuntimeContext) -> R) -> Result<R> {
        let runtime_context = self.runtime_context.take().ok_or(Error::AlreadyRunning)?;
        let r = panic::catch_unwind(AssertUnwindSafe(|| {
            RUNTIME_CONTEXT.set(&runtime_context, || f(self, &runtime_context))
        }));
        self.runtime_context = Some(runtime_context);
        match r {
            Ok(r) => Ok(r),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    fn drive_in(&mut self, context: &RuntimeContext, done: &mut dyn FnMut() -> bool) -> Result<bool> {
        loop {
            microtask::drain();
            if done() {
                return Ok(true);
            }
            let polls = self.executor.run();
            trace!(polls, tasks = self.executor.task_count(), "executor pass");
            if done() {
                return Ok(true);
            }
            // honoured once: a later run starts fresh
            if self.shutdown.swap(false, Ordering::AcqRel) {
                debug!("runtime shutdown requested");
                return Ok(false);
            }
            if self.executor.has_ready() || !microtask::is_empty() {
                continue;
            }

            let now = context.clock.now();
            let next_deadline = context.timer_manager.borrow().next_deadline();
            let quiet = context.executor_shared.is_quiet();
            match next_deadline {
                Some(deadline) if deadline <= now => {}
                Some(deadline) if context.clock.is_virtual() && quiet => {
                    context.clock.advance_to(deadline);
                }
                Some(_) if context.clock.is_virtual() => self.park(None)?,
                Some(deadline) => self.park(Some(deadline - now))?,
                None if self.executor.is_empty() || quiet => {
                    if !self.executor.is_empty() {
                        debug!(
                            tasks = self.executor.task_count(),
                            "event loop stalled: no task can be woken"
                        );
                    }
                    return Ok(false);
                }
                None => self.park(None)?,
            }
            let fired = context
                .timer_manager
                .borrow_mut()
                .wakeup_timers(context.clock.now());
            if fired > 0 {
                trace!(fired, elapsed = ?context.clock.elapsed(), "timers fired");
            }
        }
    }

    fn park(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self.mio_poll.poll(&mut self.events, timeout) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Stops a running loop from any thread.
#[derive(Clone)]
pub struct RuntimeShutdownSignal {
    mio_waker: Arc<mio::Waker>,
    shutdown: Arc<AtomicBool>,
}

impl RuntimeShutdownSignal {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.mio_waker.wake();
    }
}

/// Spawn `future` on the current runtime; its output settles the returned
/// promise. A panic while polling rejects it with [`Error::Panicked`].
/// Rejects with [`Error::NoRuntime`] outside a runtime.
pub fn spawn<T, F>(future: F) -> Promise<T>
where
    T: Clone + 'static,
    F: Future<Output = Result<T>> + 'static,
{
    let promise = Promise::pending();
    let target = promise.clone();
    let task = async move {
        let outcome = match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(Error::from_panic("spawned task", payload)),
        };
        target.settle_with(outcome.map(Flow::Ready));
    };
    let spawned = RUNTIME_CONTEXT.is_set() && RUNTIME_CONTEXT.with(|c| c.spawner.spawn(task));
    if !spawned {
        promise.reject(Error::NoRuntime);
    }
    promise
}

/// Whether a runtime is driving (or has entered) this thread.
pub fn is_running() -> bool {
    RUNTIME_CONTEXT.is_set()
}

/// Time since the current runtime was built, on its clock.
pub fn elapsed() -> Option<Duration> {
    if RUNTIME_CONTEXT.is_set() {
        Some(RUNTIME_CONTEXT.with(|c| c.clock.elapsed()))
    } else {
        None
    }
}

/// Marks off-loop work so the loop keeps waiting for its wakeup.
pub(crate) fn external_work() -> Option<ExternalWork> {
    if RUNTIME_CONTEXT.is_set() {
        Some(RUNTIME_CONTEXT.with(|c| c.executor_shared.external_work()))
    } else {
        None
    }
}

/// Completes after `duration` on the current runtime's clock.
/// Outside a runtime it completes immediately.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        deadline: None,
        registered: false,
    }
}

pub struct Sleep {
    duration: Duration,
    deadline: Option<Instant>,
    registered: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if !RUNTIME_CONTEXT.is_set() {
            return Poll::Ready(());
        }
        RUNTIME_CONTEXT.with(|c| {
            let now = c.clock.now();
            let duration = self.duration;
            let deadline = *self.deadline.get_or_insert(now + duration);
            if now >= deadline {
                Poll::Ready(())
            } else {
                if !self.registered {
                    c.timer_manager.borrow_mut().add(deadline, cx.waker().clone());
                    self.registered = true;
                }
                Poll::Pending
            }
        })
    }
}

/// A promise fulfilled with `value` after `duration`.
pub fn delay<T: Clone + 'static>(duration: Duration, value: T) -> Promise<T> {
    spawn(async move {
        sleep(duration).await;
        Ok(value)
    })
}
