//! Rejection reasons.
//!
//! Every failure a promise can carry is an [`Error`]. The type is `Clone`
//! because a settled error is handed to every continuation attached to the
//! promise.

use thiserror::Error;

use crate::request::Method;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The request collaborator could not produce a payload.
    #[error("{method} {url} failed: {message}")]
    Transport {
        method: Method,
        url: String,
        message: String,
    },

    /// A decorated body or continuation returned `Err`.
    #[error("{0}")]
    Thrown(String),

    /// A decorated body or continuation panicked.
    #[error("{function} panicked: {message}")]
    Panicked { function: String, message: String },

    /// A promise was resolved with itself.
    #[error("promise resolved with itself")]
    SelfResolution,

    /// A runtime-only operation was used while no runtime was running.
    #[error("no runtime is running on this thread")]
    NoRuntime,

    /// The runtime was entered while it was already driving this thread.
    #[error("runtime is already running")]
    AlreadyRunning,

    /// The event loop ran out of work before the awaited promise settled.
    #[error("event loop stalled before the promise settled")]
    Stalled,

    /// Event loop setup or polling failed.
    #[error("runtime i/o error: {0}")]
    Io(String),
}

impl Error {
    /// Build a [`Error::Thrown`] from anything displayable.
    pub fn thrown(message: impl std::fmt::Display) -> Self {
        Error::Thrown(message.to_string())
    }

    pub fn transport(method: Method, url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Transport {
            method,
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Convert a `catch_unwind` payload.
    pub(crate) fn from_panic(function: &str, payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Error::Panicked {
            function: function.to_string(),
            message,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
