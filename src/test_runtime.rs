//! Cycle-stepped helpers for deterministic timing tests.
//!
//! A cycle is one millisecond on a virtual clock, so `sleep_cycles(3)` always
//! finishes before `sleep_cycles(5)` no matter how fast the machine is.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;
use crate::promise::Promise;
use crate::runtime::{self, Runtime};

pub(crate) const CYCLE: Duration = Duration::from_millis(1);

/// Run `f` to completion on a fresh test runtime.
pub(crate) fn test<R, F>(f: F) -> Result<R>
where
    R: Clone + 'static,
    F: Future<Output = Result<R>> + 'static,
{
    let mut runtime = TestRuntime::new();
    let promise = runtime.enter(|| runtime::spawn(f));
    runtime.block_on(&promise)
}

pub(crate) async fn sleep_cycles(cycles: u32) {
    runtime::sleep(CYCLE * cycles).await
}

pub(crate) fn current_cycle() -> u64 {
    runtime::elapsed().map_or(0, |elapsed| (elapsed.as_nanos() / CYCLE.as_nanos()) as u64)
}

/// A promise that settles with `result` after `cycles`.
pub(crate) fn settle_after<T: Clone + 'static>(cycles: u32, result: Result<T>) -> Promise<T> {
    runtime::spawn(async move {
        sleep_cycles(cycles).await;
        result
    })
}

pub(crate) struct TestRuntime {
    runtime: Runtime,
}

impl TestRuntime {
    pub(crate) fn new() -> Self {
        let runtime = Runtime::builder()
            .virtual_clock(true)
            .build()
            .expect("test runtime");
        TestRuntime { runtime }
    }

    pub(crate) fn enter<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.runtime.enter(f).expect("test runtime is not running")
    }

    pub(crate) fn run(&mut self) {
        self.runtime.run().expect("test runtime failed");
    }

    pub(crate) fn block_on<T: Clone + 'static>(&mut self, promise: &Promise<T>) -> Result<T> {
        self.runtime.block_on(promise)
    }

    pub(crate) fn current_cycle(&mut self) -> u64 {
        self.enter(current_cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decorate;
    use crate::error::Error;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn test_sleep_cycles() {
        let mut runtime = TestRuntime::new();
        let msgs = Rc::new(RefCell::new(Vec::new()));
        let sender = msgs.clone();
        let p = runtime.enter(|| {
            runtime::spawn(async move {
                for i in 0..5 {
                    sender.borrow_mut().push((i, current_cycle()));
                    sleep_cycles(3).await;
                }
                Ok(())
            })
        });
        runtime.run();
        assert!(p.is_fulfilled());
        assert_eq!(*msgs.borrow(), vec![(0, 0), (1, 3), (2, 6), (3, 9), (4, 12)]);
        assert_eq!(runtime.current_cycle(), 15);
    }

    #[test]
    fn test_test() {
        let woke_at = test(async {
            sleep_cycles(2).await;
            Ok(current_cycle())
        });
        assert_eq!(woke_at, Ok(2));
    }

    #[test]
    fn test_join_invokes_once_at_the_later_arrival() {
        for (t1, t2) in [(3, 5), (5, 3)] {
            let mut runtime = TestRuntime::new();
            let calls = Rc::new(Cell::new(Vec::new()));
            let record = calls.clone();
            let add = decorate(move |a: i32, b: i32| {
                let mut seen = record.take();
                seen.push((a, b, current_cycle()));
                record.set(seen);
                a + b
            });
            let sum = runtime.enter(|| add.call(settle_after(t1, Ok(2)), settle_after(t2, Ok(3))));
            assert_eq!(runtime.block_on(&sum), Ok(5));
            assert_eq!(calls.take(), vec![(2, 3, t1.max(t2) as u64)]);
        }
    }

    #[test]
    fn test_rejection_short_circuits_before_the_other_arrives() {
        let mut runtime = TestRuntime::new();
        let invoked = Rc::new(Cell::new(false));
        let flag = invoked.clone();
        let add = decorate(move |a: i32, b: i32| {
            flag.set(true);
            a + b
        });
        let settled_at = Rc::new(Cell::new(None));
        let at = settled_at.clone();
        let sum = runtime.enter(|| {
            let sum = add.call(
                settle_after(9, Ok(2)),
                settle_after(4, Err(Error::thrown("NetworkError"))),
            );
            sum.finally(move || at.set(Some(current_cycle())))
        });
        assert_eq!(runtime.block_on(&sum), Err(Error::thrown("NetworkError")));
        assert_eq!(settled_at.get(), Some(4));
        runtime.run();
        assert!(!invoked.get());
    }
}
