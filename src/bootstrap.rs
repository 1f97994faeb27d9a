use std::cell::RefCell;

use tracing::debug;

/// An entry point that runs at most once, when the host says it is ready.
pub struct Bootstrap {
    entry: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl Bootstrap {
    pub fn new(entry: impl FnOnce() + 'static) -> Self {
        Bootstrap {
            entry: RefCell::new(Some(Box::new(entry))),
        }
    }

    /// Run the entry. Returns false if it already ran.
    pub fn fire(&self) -> bool {
        let entry = self.entry.borrow_mut().take();
        match entry {
            Some(entry) => {
                debug!("bootstrap fired");
                entry();
                true
            }
            None => false,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.entry.borrow().is_none()
    }
}
