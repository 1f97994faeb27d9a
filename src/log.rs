//! Where `show` writes its lines.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use tracing::info;

/// Fire-and-forget line output.
pub trait LogSink {
    fn log(&self, message: &str);
}

/// Writes lines to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn log(&self, message: &str) {
        let mut stdout = std::io::stdout().lock();
        // nothing useful to do if stdout is gone
        let _ = writeln!(stdout, "{message}");
    }
}

/// Emits each line as an `info` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, message: &str) {
        info!(target: "dyad_flow::show", "{message}");
    }
}

/// Keeps every line; clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    lines: Rc<RefCell<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }
}

impl LogSink for MemorySink {
    fn log(&self, message: &str) {
        self.lines.borrow_mut().push(message.to_string());
    }
}
