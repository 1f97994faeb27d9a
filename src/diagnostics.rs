//! Unhandled-rejection reporting.
//!
//! A rejected promise dropped before anything subscribed to it is logged at
//! `warn` and passed to every hook installed on the current thread.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use slab::Slab;
use tracing::warn;

use crate::error::Error;

type Hook = Rc<dyn Fn(&Error)>;

thread_local! {
    static HOOKS: RefCell<Slab<Hook>> = RefCell::new(Slab::new());
}

/// Install a hook for unhandled rejections on this thread.
/// The hook is removed when the returned guard drops.
pub fn on_unhandled_rejection(hook: impl Fn(&Error) + 'static) -> HookGuard {
    let key = HOOKS.with(|hooks| hooks.borrow_mut().insert(Rc::new(hook)));
    HookGuard {
        key,
        phantom: PhantomData,
    }
}

pub struct HookGuard {
    key: usize,
    phantom: PhantomData<*mut ()>, // !Send, hooks are per thread
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        let _ = HOOKS.try_with(|hooks| {
            let mut hooks = hooks.borrow_mut();
            if hooks.contains(self.key) {
                hooks.remove(self.key);
            }
        });
    }
}

pub(crate) fn report_unhandled(promise: u64, error: &Error) {
    warn!(promise, %error, "unhandled promise rejection");
    // snapshot so a hook may drop promises (and re-enter) without a double borrow
    let hooks: Vec<Hook> = match HOOKS.try_with(|hooks| hooks.borrow().iter().map(|(_, h)| h.clone()).collect()) {
        Ok(hooks) => hooks,
        // thread-local storage already torn down
        Err(_) => return,
    };
    for hook in hooks {
        hook(error);
    }
}
