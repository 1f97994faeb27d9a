//! Per-thread FIFO of promise continuations.
//!
//! Settling a promise never runs its reactions inline; it pushes them here and
//! the runtime drains the queue between executor passes.

use std::cell::RefCell;
use std::collections::VecDeque;

pub(crate) type Microtask = Box<dyn FnOnce()>;

thread_local! {
    static MICROTASKS: RefCell<VecDeque<Microtask>> = RefCell::new(VecDeque::new());
}

pub(crate) fn enqueue(task: impl FnOnce() + 'static) {
    MICROTASKS.with(|q| q.borrow_mut().push_back(Box::new(task)));
}

/// Run queued microtasks until the queue is empty, including the ones queued
/// while draining. Returns how many ran.
pub fn drain() -> usize {
    let mut ran = 0;
    // the borrow must be released before running: a microtask may enqueue more
    while let Some(task) = MICROTASKS.with(|q| q.borrow_mut().pop_front()) {
        task();
        ran += 1;
    }
    ran
}

pub fn is_empty() -> bool {
    MICROTASKS.with(|q| q.borrow().is_empty())
}

pub fn len() -> usize {
    MICROTASKS.with(|q| q.borrow().len())
}
