use crate::err::*;
use crate::method::{join_method, parse_method};
use crate::protocol::{Kwargs, Value};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type HandlerResult = Result<Value, HandlerError>;

type AsyncFn = dyn Fn(Invocation) -> BoxFuture<'static, HandlerResult> + Send + Sync;
type BlockingFn = dyn Fn(Invocation) -> HandlerResult + Send + Sync;

/// An error raised by a handler. Reaches the caller as `RemoteError::Handler`.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerError {
    kind: String,
    message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        HandlerError::new("Error", message)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<HandlerError> for RemoteError {
    fn from(error: HandlerError) -> Self {
        RemoteError::Handler {
            kind: error.kind,
            message: error.message,
        }
    }
}

impl From<RpcError> for HandlerError {
    fn from(error: RpcError) -> Self {
        HandlerError::new("RpcError", error.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        HandlerError::new("TypeError", error.to_string())
    }
}

/// A single invocation of a handler: the decoded arguments plus the token through which the
/// endpoint requests cancellation. Blocking handlers should check `is_cancelled` between units
/// of work.
pub struct Invocation {
    pub method: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    cancel: CancellationToken,
}

impl Invocation {
    pub(crate) fn new(method: String, args: Vec<Value>, kwargs: Kwargs, cancel: CancellationToken) -> Self {
        Invocation {
            method,
            args,
            kwargs,
            cancel,
        }
    }

    /// Deserialize the positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, HandlerError> {
        let value = self.args.get(index).ok_or_else(|| {
            HandlerError::new(
                "TypeError",
                format!("{}: missing positional argument {}", self.method, index),
            )
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            HandlerError::new(
                "TypeError",
                format!("{}: argument {}: {}", self.method, index, e),
            )
        })
    }

    /// Deserialize the keyword argument `name`, if it was supplied.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, HandlerError> {
        match self.kwargs.get(name) {
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                HandlerError::new(
                    "TypeError",
                    format!("{}: keyword argument {}: {}", self.method, name, e),
                )
            }),
            None => Ok(None),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The token cancelled when the caller gives up. An async handler is simply dropped at its
    /// next suspension point, so this is only needed to stop work it handed to other tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[derive(Clone)]
enum HandlerKind {
    Async(Arc<AsyncFn>),
    Blocking(Arc<BlockingFn>),
}

/// A callable a method name resolves to. Asynchronous handlers run on the runtime directly,
/// blocking handlers on the endpoint's bounded worker pool.
#[derive(Clone)]
pub struct Handler {
    kind: HandlerKind,
    accepts_timeout: bool,
}

impl Handler {
    pub fn new_async<F, Fut>(handler: F) -> Handler
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Handler {
            kind: HandlerKind::Async(Arc::new(move |invocation: Invocation| {
                handler(invocation).boxed()
            })),
            accepts_timeout: false,
        }
    }

    pub fn new_blocking<F>(handler: F) -> Handler
    where
        F: Fn(Invocation) -> HandlerResult + Send + Sync + 'static,
    {
        Handler {
            kind: HandlerKind::Blocking(Arc::new(handler)),
            accepts_timeout: false,
        }
    }

    /// Let the caller's `timeout` keyword argument through to this handler. Without this it is
    /// stripped before invocation.
    pub fn accepting_timeout(mut self) -> Handler {
        self.accepts_timeout = true;
        self
    }

    pub fn accepts_timeout(&self) -> bool {
        self.accepts_timeout
    }

    pub fn is_async(&self) -> bool {
        matches!(self.kind, HandlerKind::Async(_))
    }

    pub(crate) fn as_async(&self) -> Option<Arc<AsyncFn>> {
        match &self.kind {
            HandlerKind::Async(f) => Some(f.clone()),
            HandlerKind::Blocking(_) => None,
        }
    }

    pub(crate) fn as_blocking(&self) -> Option<Arc<BlockingFn>> {
        match &self.kind {
            HandlerKind::Blocking(f) => Some(f.clone()),
            HandlerKind::Async(_) => None,
        }
    }
}

/// Maps a method name to a handler.
pub trait Resolver: Send + Sync + 'static {
    fn resolve(&self, method: &str) -> Option<Handler>;
}

impl<F> Resolver for F
where
    F: Fn(&str) -> Option<Handler> + Send + Sync + 'static,
{
    fn resolve(&self, method: &str) -> Option<Handler> {
        self(method)
    }
}

/// The `Registry` stores handlers in a tree keyed by the fragments of their dotted method names,
/// so whole namespaces can be mounted under a prefix.
#[derive(Clone, Default)]
pub struct Registry {
    handler: Option<Handler>,
    children: HashMap<String, Registry>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            handler: None,
            children: HashMap::new(),
        }
    }

    /// Register `handler` under `method`. Errors if the name is invalid or already taken.
    pub fn register(&mut self, method: &str, handler: Handler) -> RpcResult<()> {
        let path = parse_method(method)?;
        self.insert(&path, handler)
            .map_err(|_| RpcError::MethodAlreadyRegistered(method.to_string()))
    }

    pub fn register_async<F, Fut>(&mut self, method: &str, handler: F) -> RpcResult<()>
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(method, Handler::new_async(handler))
    }

    pub fn register_blocking<F>(&mut self, method: &str, handler: F) -> RpcResult<()>
    where
        F: Fn(Invocation) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(method, Handler::new_blocking(handler))
    }

    /// Remove the handler registered under `method`, returning it.
    pub fn unregister(&mut self, method: &str) -> Option<Handler> {
        let path = parse_method(method).ok()?;
        self.remove(&path)
    }

    /// Register every method of `registry` under `prefix`, e.g. mounting a registry holding `add`
    /// at `math` exposes `math.add`.
    pub fn mount(&mut self, prefix: &str, registry: Registry) -> RpcResult<()> {
        parse_method(prefix)?;
        let mut entries = vec![];
        registry._entries(&mut vec![], &mut entries);
        for (name, handler) in entries {
            self.register(&join_method(prefix, &name), handler)?;
        }
        Ok(())
    }

    pub fn get(&self, method: &str) -> Option<&Handler> {
        let path = parse_method(method).ok()?;
        self.lookup(&path)
    }

    /// All registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut entries = vec![];
        self._entries(&mut vec![], &mut entries);
        let mut methods = entries.into_iter().map(|(name, _)| name).collect::<Vec<_>>();
        methods.sort();
        methods
    }

    pub fn is_empty(&self) -> bool {
        self.handler.is_none() && self.children.values().all(|c| c.is_empty())
    }

    fn insert(&mut self, path: &[&str], handler: Handler) -> Result<(), Handler> {
        if path.is_empty() {
            if self.handler.is_some() {
                return Err(handler);
            }
            self.handler = Some(handler);
            return Ok(());
        }

        self.children
            .entry(path[0].to_string())
            .or_default()
            .insert(&path[1..], handler)
    }

    fn remove(&mut self, path: &[&str]) -> Option<Handler> {
        if path.is_empty() {
            return self.handler.take();
        }

        let child = self.children.get_mut(path[0])?;
        let removed = child.remove(&path[1..]);
        if child.is_empty() {
            self.children.remove(path[0]);
        }
        removed
    }

    fn lookup(&self, path: &[&str]) -> Option<&Handler> {
        if path.is_empty() {
            return self.handler.as_ref();
        }

        self.children.get(path[0])?.lookup(&path[1..])
    }

    fn _entries(&self, path: &mut Vec<String>, results: &mut Vec<(String, Handler)>) {
        if let Some(handler) = &self.handler {
            results.push((path.join("."), handler.clone()));
        }

        for (name, child) in self.children.iter() {
            path.push(name.to_string());
            child._entries(path, results);
            path.pop();
        }
    }
}

impl Resolver for Registry {
    fn resolve(&self, method: &str) -> Option<Handler> {
        self.get(method).cloned()
    }
}

#[cfg(test)]
fn noop() -> Handler {
    Handler::new_blocking(|_| Ok(Value::Null))
}

#[test]
fn test_register_and_resolve() {
    let mut registry = Registry::new();
    registry.register("math.add", noop()).unwrap();
    registry
        .register_async("math.slow", |_| async { HandlerResult::Ok(Value::Null) })
        .unwrap();

    assert!(registry.resolve("math.add").is_some());
    assert!(!registry.resolve("math.add").unwrap().is_async());
    assert!(registry.resolve("math.slow").unwrap().is_async());
    assert!(registry.resolve("math").is_none());
    assert!(registry.resolve("math.sub").is_none());
    assert!(registry.resolve("math..add").is_none());
}

#[test]
fn test_register_twice_fails() {
    let mut registry = Registry::new();
    registry.register("echo", noop()).unwrap();
    assert_eq!(
        Err(RpcError::MethodAlreadyRegistered("echo".into())),
        registry.register("echo", noop())
    );
}

#[test]
fn test_register_invalid_name_fails() {
    let mut registry = Registry::new();
    assert_eq!(
        Err(RpcError::InvalidMethodName("math/add".into())),
        registry.register("math/add", noop())
    );
}

#[test]
fn test_namespace_and_leaf_coexist() {
    let mut registry = Registry::new();
    registry.register("math", noop()).unwrap();
    registry.register("math.add", noop()).unwrap();
    assert_eq!(vec!["math", "math.add"], registry.methods());
}

#[test]
fn test_mount() {
    let mut math = Registry::new();
    math.register("add", noop()).unwrap();
    math.register("trig.sin", noop()).unwrap();

    let mut registry = Registry::new();
    registry.register("echo", noop()).unwrap();
    registry.mount("math", math.clone()).unwrap();

    assert_eq!(vec!["echo", "math.add", "math.trig.sin"], registry.methods());
    assert_eq!(
        Err(RpcError::MethodAlreadyRegistered("math.add".into())),
        registry.mount("math", math)
    );
}

#[test]
fn test_unregister_prunes_empty_namespaces() {
    let mut registry = Registry::new();
    registry.register("a.b.c", noop()).unwrap();
    assert!(registry.unregister("a.b.c").is_some());
    assert!(registry.unregister("a.b.c").is_none());
    assert!(registry.is_empty());
    assert!(registry.methods().is_empty());
}

#[test]
fn test_closure_resolver() {
    let resolver = |method: &str| match method {
        "echo" => Some(noop()),
        _ => None,
    };
    assert!(Resolver::resolve(&resolver, "echo").is_some());
    assert!(Resolver::resolve(&resolver, "other").is_none());
}

#[test]
fn test_invocation_arguments() {
    let mut kwargs = Kwargs::new();
    kwargs.insert("scale".into(), serde_json::json!(2));
    let invocation = Invocation::new(
        "math.add".into(),
        vec![serde_json::json!(2), serde_json::json!("three")],
        kwargs,
        CancellationToken::new(),
    );

    assert_eq!(2i64, invocation.arg::<i64>(0).unwrap());
    assert_eq!("TypeError", invocation.arg::<i64>(1).unwrap_err().kind());
    assert_eq!("TypeError", invocation.arg::<i64>(2).unwrap_err().kind());
    assert_eq!(Some(2u32), invocation.kwarg::<u32>("scale").unwrap());
    assert_eq!(None, invocation.kwarg::<u32>("offset").unwrap());
    assert!(!invocation.is_cancelled());
}
