use std::{
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::Context,
};

use concurrent_queue::ConcurrentQueue;
use slab::Slab;
use tracing::trace;

use crate::microtask;
use crate::task::{self, NewTasks, ReadyQueue, Spawner, TaskEntry};

/// Polls spawned futures on the current thread.
///
/// Wakers are `Send` and may fire from any thread: they push the task index
/// onto a shared queue and poke the notifier so a parked event loop wakes up.
/// Promise continuations queued while a task runs are drained right after
/// that task's poll.
pub struct Executor {
    tasks: Slab<TaskEntry>,
    ready: ReadyQueue,
    new_tasks: Rc<NewTasks>,
    shared: Arc<ExecutorShared>,
}

impl Executor {
    pub fn new(notifier: impl Fn() + Send + Sync + 'static) -> Self {
        Executor {
            tasks: Slab::new(),
            ready: ReadyQueue::new(),
            new_tasks: task::new_tasks(),
            shared: Arc::new(ExecutorShared {
                queue: ConcurrentQueue::unbounded(),
                notifier: ExecutorNotifier::new(notifier),
                external: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn spawner(&self) -> Spawner {
        Spawner {
            inner: Rc::downgrade(&self.new_tasks),
        }
    }

    pub(crate) fn shared(&self) -> Arc<ExecutorShared> {
        self.shared.clone()
    }

    fn admit_new_tasks(&mut self) {
        for future in self.new_tasks.take() {
            let entry = self.tasks.vacant_entry();
            let task_index = entry.key();
            entry.insert(TaskEntry::new(future, self.shared.clone(), task_index));
            self.ready.push(task_index);
        }
    }

    /// Poll every task that is ready until none is. Returns the number of polls.
    pub fn run(&mut self) -> usize {
        let mut polls = 0;
        let mut last_chunk_index = None;
        loop {
            self.admit_new_tasks();
            while let Ok(task_index) = self.shared.queue.pop() {
                self.ready.push(task_index);
            }

            if self.ready.is_empty() {
                // clear before the final check so a concurrent push re-notifies
                self.shared.notifier.notified.store(false, Ordering::Release);

                if self.shared.queue.is_empty() && self.new_tasks.is_empty() {
                    break;
                }
                self.shared.notifier.notified.store(true, Ordering::Release);
                continue;
            }

            let chunk = self.ready.take_chunk(last_chunk_index);
            last_chunk_index = Some(chunk.chunk_index);
            for task_index in chunk {
                let Some(entry) = self.tasks.get_mut(task_index) else {
                    continue; // task has gone
                };
                let mut cx = Context::from_waker(&entry.waker);
                polls += 1;
                let finished = entry.future.as_mut().poll(&mut cx).is_ready();
                if finished {
                    trace!(task = task_index, "task finished");
                    self.tasks.remove(task_index);
                }
                microtask::drain();
            }
        }
        polls
    }

    /// True if some task was woken or spawned and waits for a poll.
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty() || !self.shared.queue.is_empty() || !self.new_tasks.is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.new_tasks.is_empty()
    }
}

pub(crate) struct ExecutorShared {
    queue: ConcurrentQueue<usize>,
    notifier: ExecutorNotifier,
    // wakeups promised by work running off the loop (helper threads)
    external: AtomicUsize,
}

impl ExecutorShared {
    pub(crate) fn schedule_task(&self, task_index: usize) {
        // only fails once closed, and the queue is never closed
        let _ = self.queue.push(task_index);
        self.notifier.notify();
    }

    pub(crate) fn external_work(self: &Arc<Self>) -> ExternalWork {
        self.external.fetch_add(1, Ordering::SeqCst);
        ExternalWork {
            shared: self.clone(),
        }
    }

    /// No wakeup can arrive from outside the loop.
    pub(crate) fn is_quiet(&self) -> bool {
        // read the counter first: work finishing pushes its wakeup before decrementing
        self.external.load(Ordering::SeqCst) == 0 && self.queue.is_empty()
    }
}

/// Marks work in flight on another thread; dropping it releases the mark.
pub(crate) struct ExternalWork {
    shared: Arc<ExecutorShared>,
}

impl Drop for ExternalWork {
    fn drop(&mut self) {
        self.shared.external.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ExecutorNotifier {
    notifier: Box<dyn Fn() + Send + Sync>,
    notified: AtomicBool,
}

impl ExecutorNotifier {
    fn new<F>(notifier: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        ExecutorNotifier {
            notifier: Box::new(notifier),
            notified: AtomicBool::new(false),
        }
    }

    fn notify(&self) {
        if !self.notified.swap(true, Ordering::AcqRel) {
            (self.notifier)();
        }
    }
}
