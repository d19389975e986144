//! # Services
//!
//! A service is a named unit that contributes handlers for routes of the form
//! `<service>.<method>`. Services enumerate their methods explicitly through
//! [`Service::register`]; there is no runtime discovery.
//!
//! ```rust
//! use bytes::Bytes;
//! use cluster_dispatch::service::{FnService, HandlerError};
//!
//! let slots = FnService::new("slots")
//!     .method("login", |_ctx, _data| async { Ok(Bytes::from_static(b"ok")) })
//!     .method("spin", |ctx, data| async move {
//!         ctx.push("slots.reel", data).await?;
//!         Ok::<_, HandlerError>(Bytes::new())
//!     });
//! # let _ = slots;
//! ```

mod context;
pub mod registry;

pub use context::Context;
pub use registry::ServiceRegistry;

use crate::config::Concurrency;
use crate::error::ProtocolError;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error returned by a handler. Its message is sent to the caller in an
/// error Response of kind `Handler`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<ProtocolError> for HandlerError {
    fn from(err: ProtocolError) -> Self {
        Self(err.to_string())
    }
}

pub type HandlerResult = std::result::Result<Bytes, HandlerError>;

/// Type-erased route handler.
pub type Handler = Arc<dyn Fn(Context, Bytes) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Context, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx, data| f(ctx, data).boxed())
}

/// Invocation policy a service asks for. Node configuration overrides it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceOptions {
    pub concurrency: Option<Concurrency>,
    pub deadline: Option<Duration>,
}

/// Methods collected from a service during registration.
#[derive(Default)]
pub struct MethodSet {
    methods: Vec<(String, Handler)>,
}

impl fmt::Debug for MethodSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.methods.iter().map(|(name, _)| name))
            .finish()
    }
}

impl MethodSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method backed by an async closure.
    pub fn add<F, Fut>(&mut self, method: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Context, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_handler(method, handler_fn(f))
    }

    pub fn add_handler(&mut self, method: impl Into<String>, handler: Handler) -> &mut Self {
        self.methods.push((method.into(), handler));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub(crate) fn into_inner(self) -> Vec<(String, Handler)> {
        self.methods
    }
}

/// A named collection of route handlers.
///
/// `register` receives the service behind an `Arc` so handlers can capture
/// shared service state:
///
/// ```rust
/// use bytes::Bytes;
/// use cluster_dispatch::service::{MethodSet, Service};
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use std::sync::Arc;
///
/// struct Counter(AtomicU64);
///
/// impl Service for Counter {
///     fn name(&self) -> &str {
///         "counter"
///     }
///
///     fn register(self: Arc<Self>, methods: &mut MethodSet) {
///         methods.add("incr", move |_ctx, _data| {
///             let this = Arc::clone(&self);
///             async move {
///                 let n = this.0.fetch_add(1, Ordering::SeqCst) + 1;
///                 Ok(Bytes::from(n.to_string()))
///             }
///         });
///     }
/// }
/// ```
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn register(self: Arc<Self>, methods: &mut MethodSet);

    fn options(&self) -> ServiceOptions {
        ServiceOptions::default()
    }
}

/// Closure-based service builder.
pub struct FnService {
    name: String,
    methods: Vec<(String, Handler)>,
    options: ServiceOptions,
}

impl fmt::Debug for FnService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnService")
            .field("name", &self.name)
            .field("methods", &self.methods.iter().map(|(m, _)| m).collect::<Vec<_>>())
            .field("options", &self.options)
            .finish()
    }
}

impl FnService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            options: ServiceOptions::default(),
        }
    }

    pub fn method<F, Fut>(mut self, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(Context, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.methods.push((method.into(), handler_fn(f)));
        self
    }

    pub fn handler(mut self, method: impl Into<String>, handler: Handler) -> Self {
        self.methods.push((method.into(), handler));
        self
    }

    pub fn concurrency(mut self, concurrency: Concurrency) -> Self {
        self.options.concurrency = Some(concurrency);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.options.deadline = Some(deadline);
        self
    }
}

impl Service for FnService {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(self: Arc<Self>, methods: &mut MethodSet) {
        for (method, handler) in &self.methods {
            methods.add_handler(method.clone(), Arc::clone(handler));
        }
    }

    fn options(&self) -> ServiceOptions {
        self.options
    }
}
