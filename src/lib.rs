//! Promises on a single-threaded event loop, and a decorator that lets plain
//! functions take promises as arguments.

pub mod blocking;
pub mod bootstrap;
pub mod decorate;
pub mod demo;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod join;
pub mod log;
pub mod microtask;
pub mod outcome;
pub mod promise;
pub mod request;
pub mod runtime;
mod task;
#[cfg(test)]
pub(crate) mod test_runtime;

pub use bootstrap::Bootstrap;
pub use decorate::{Body, Decorated, decorate};
pub use error::{Error, Result};
pub use join::{Join, join_all};
pub use outcome::{IntoOutcome, flatten};
pub use promise::{Flow, Promise, PromiseState, Settled};
pub use runtime::{Builder, Runtime, RuntimeShutdownSignal};
