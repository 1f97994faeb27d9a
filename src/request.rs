//! The request collaborator.
//!
//! A [`Request`] pairs [`RequestOptions`] with a [`Transport`]. Sending it
//! spawns the transport future on the current runtime and returns a promise
//! for the payload.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blocking::spawn_blocking;
use crate::error::{Error, Result};
use crate::promise::Promise;
use crate::runtime;

pub type Payload = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown request method: {0}")]
pub struct ParseMethodError(String);

impl FromStr for Method {
    type Err = ParseMethodError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "HEAD" => Ok(Method::Head),
            _ => Err(ParseMethodError(s.to_string())),
        }
    }
}

impl TryFrom<String> for Method {
    type Error = ParseMethodError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Method> for String {
    fn from(method: Method) -> Self {
        method.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    pub method: Method,
    pub url: String,
}

impl RequestOptions {
    pub fn get(url: impl Into<String>) -> Self {
        RequestOptions {
            method: Method::Get,
            url: url.into(),
        }
    }
}

/// Produces payloads for requests. Implementations run on the event loop.
pub trait Transport {
    fn fetch(&self, options: &RequestOptions) -> LocalBoxFuture<'static, Result<Payload>>;
}

pub struct Request {
    options: RequestOptions,
    transport: Rc<dyn Transport>,
}

impl Request {
    pub fn new(options: RequestOptions, transport: Rc<dyn Transport>) -> Self {
        Request { options, transport }
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Fulfils with the payload, or rejects with [`Error::Transport`].
    /// Rejects with [`Error::NoRuntime`] when no runtime is running.
    pub fn send(&self) -> Promise<Payload> {
        if !runtime::is_running() {
            return Promise::rejected(Error::NoRuntime);
        }
        let RequestOptions { method, url } = self.options.clone();
        debug!(%method, %url, "sending request");
        let fetch = self.transport.fetch(&self.options);
        runtime::spawn(async move {
            match fetch.await {
                Ok(payload) => {
                    debug!(%method, %url, "request completed");
                    Ok(payload)
                }
                Err(error @ Error::Transport { .. }) => Err(error),
                Err(other) => Err(Error::transport(method, url, other)),
            }
        })
    }
}

/// Serves JSON files from a directory. Only GET and HEAD are supported.
pub struct FileTransport {
    root: PathBuf,
}

impl FileTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileTransport { root: root.into() }
    }

    fn resolve(&self, url: &str) -> std::result::Result<PathBuf, String> {
        let relative = Path::new(url);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err("path escapes the transport root".to_string());
        }
        Ok(self.root.join(relative))
    }
}

impl Transport for FileTransport {
    fn fetch(&self, options: &RequestOptions) -> LocalBoxFuture<'static, Result<Payload>> {
        let RequestOptions { method, url } = options.clone();
        let path = match method {
            Method::Get | Method::Head => self.resolve(&url),
            other => Err(format!("{other} is not supported by the file transport")),
        };
        async move {
            let path = path.map_err(|message| Error::transport(method, &url, message))?;
            let read = spawn_blocking(&url, move || -> std::result::Result<Payload, String> {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| format!("{}: {e}", path.display()))?;
                if method == Method::Head {
                    return Ok(Payload::Null);
                }
                serde_json::from_str(&text).map_err(|e| format!("invalid JSON: {e}"))
            })?;
            read.await?
                .map_err(|message| Error::transport(method, &url, message))
        }
        .boxed_local()
    }
}

#[derive(Clone)]
enum Fixture {
    Respond(Payload),
    Fail(String),
}

/// In-memory responses keyed by url, with an optional delay on the runtime
/// clock. Unknown urls fail with "not found".
#[derive(Clone, Default)]
pub struct FixtureTransport {
    fixtures: Rc<RefCell<HashMap<String, Fixture>>>,
    latency: Rc<RefCell<HashMap<String, Duration>>>,
    default_latency: Duration,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, url: impl Into<String>, payload: impl Into<Payload>) -> Self {
        self.fixtures
            .borrow_mut()
            .insert(url.into(), Fixture::Respond(payload.into()));
        self
    }

    pub fn fail(self, url: impl Into<String>, message: impl Into<String>) -> Self {
        self.fixtures
            .borrow_mut()
            .insert(url.into(), Fixture::Fail(message.into()));
        self
    }

    /// Delay applied to every url without its own.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    pub fn latency_for(self, url: impl Into<String>, latency: Duration) -> Self {
        self.latency.borrow_mut().insert(url.into(), latency);
        self
    }
}

impl Transport for FixtureTransport {
    fn fetch(&self, options: &RequestOptions) -> LocalBoxFuture<'static, Result<Payload>> {
        let RequestOptions { method, url } = options.clone();
        let fixture = self.fixtures.borrow().get(&url).cloned();
        let latency = self
            .latency
            .borrow()
            .get(&url)
            .copied()
            .unwrap_or(self.default_latency);
        async move {
            if !latency.is_zero() {
                runtime::sleep(latency).await;
            }
            match fixture {
                Some(Fixture::Respond(payload)) => Ok(payload),
                Some(Fixture::Fail(message)) => Err(Error::transport(method, url, message)),
                None => Err(Error::transport(method, url, "not found")),
            }
        }
        .boxed_local()
    }
}
