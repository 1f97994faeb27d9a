//! Running blocking work on a helper thread.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::thread;

use futures_util::task::AtomicWaker;
use tracing::trace;

use crate::error::{Error, Result};
use crate::runtime;

struct Shared<R> {
    result: Mutex<Option<thread::Result<R>>>,
    waker: AtomicWaker,
}

/// Run `f` on a new thread and get its result as a future.
///
/// While the work is in flight the current runtime does not consider itself
/// out of work. A panic in `f` resolves to [`Error::Panicked`].
pub fn spawn_blocking<R, F>(name: &str, f: F) -> Result<Blocking<R>>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let shared = Arc::new(Shared {
        result: Mutex::new(None),
        waker: AtomicWaker::new(),
    });
    let worker = shared.clone();
    let work = runtime::external_work();
    thread::Builder::new()
        .name(format!("dyad-blocking-{name}"))
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            *worker.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
            worker.waker.wake();
            // released after the wakeup is queued
            drop(work);
        })?;
    trace!(name, "blocking work started");
    Ok(Blocking {
        name: name.to_string(),
        shared,
    })
}

pub struct Blocking<R> {
    name: String,
    shared: Arc<Shared<R>>,
}

impl<R> Future for Blocking<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.shared.waker.register(cx.waker());
        let taken = self
            .shared
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            None => Poll::Pending,
            Some(Ok(value)) => Poll::Ready(Ok(value)),
            Some(Err(payload)) => Poll::Ready(Err(Error::from_panic(&self.name, payload))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, spawn};

    #[test]
    fn test_blocking_result_reaches_the_loop() {
        let mut rt = Runtime::builder().virtual_clock(true).build().unwrap();
        let p = rt
            .enter(|| {
                spawn(async {
                    let work = spawn_blocking("sum", || {
                        std::thread::sleep(std::time::Duration::from_millis(5));
                        (1..=10).sum::<u32>()
                    })?;
                    work.await
                })
            })
            .unwrap();
        assert_eq!(rt.block_on(&p), Ok(55));
    }

    #[test]
    fn test_blocking_panic_becomes_error() {
        let mut rt = Runtime::new().unwrap();
        let p = rt
            .enter(|| spawn(async { spawn_blocking("boom", || -> u8 { panic!("worker died") })?.await }))
            .unwrap();
        assert_eq!(
            rt.block_on(&p),
            Err(Error::Panicked {
                function: "boom".into(),
                message: "worker died".into()
            })
        );
    }
}
