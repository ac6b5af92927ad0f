//! Type-erased remote functions.
//!
//! Registered functions come in three shapes, all stored behind
//! [`RemoteFunction`]:
//!
//! - async functions taking the raw [`CallArgs`]
//! - async functions taking a deserialized positional-argument tuple
//! - synchronous functions, run on tokio's blocking pool

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_lite::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{CallArgs, RemoteFailure};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of one invocation, before encoding.
pub type CallResult = std::result::Result<Value, RemoteFailure>;

/// A callable registered on a server.
///
/// Implement this directly for functions that need full control over
/// argument handling; the `register*` methods on
/// [`Server`](crate::Server) cover the common shapes.
pub trait RemoteFunction: Send + Sync {
    fn call(&self, args: CallArgs) -> BoxFuture<'static, CallResult>;
}

fn to_value<R: Serialize>(result: R) -> CallResult {
    serde_json::to_value(result).map_err(|e| {
        RemoteFailure::new(RemoteFailure::ERROR, format!("result is not serializable: {e}"))
    })
}

/// Async function over raw [`CallArgs`].
pub(super) struct ArgsFn<F, Fut, R> {
    func: F,
    _phantom: PhantomData<fn() -> (Fut, R)>,
}

impl<F, Fut, R> ArgsFn<F, Fut, R>
where
    F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, RemoteFailure>> + Send + 'static,
    R: Serialize + 'static,
{
    pub(super) fn new(func: F) -> Self {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut, R> RemoteFunction for ArgsFn<F, Fut, R>
where
    F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, RemoteFailure>> + Send + 'static,
    R: Serialize + 'static,
{
    fn call(&self, args: CallArgs) -> BoxFuture<'static, CallResult> {
        let fut = (self.func)(args);
        Box::pin(async move { to_value(fut.await?) })
    }
}

/// Positional arguments for a typed function. Typed functions have no
/// keyword parameters, so any keyword argument is an argument error.
fn positional_only<Args: DeserializeOwned>(args: &CallArgs) -> std::result::Result<Args, RemoteFailure> {
    // ---
    if !args.kwargs.is_empty() {
        let names: Vec<&str> = args.kwargs.keys().map(String::as_str).collect();
        return Err(RemoteFailure::argument(format!(
            "unexpected keyword argument(s): {}",
            names.join(", ")
        )));
    }
    args.positional()
}

/// Async function over a positional-argument tuple.
///
/// Register with [`ArgsFn`] to accept keyword arguments.
pub(super) struct TypedFn<F, Args, Fut, R> {
    func: F,
    _phantom: PhantomData<fn(Args) -> (Fut, R)>,
}

impl<F, Args, Fut, R> TypedFn<F, Args, Fut, R>
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Args: DeserializeOwned + 'static,
    Fut: Future<Output = std::result::Result<R, RemoteFailure>> + Send + 'static,
    R: Serialize + 'static,
{
    pub(super) fn new(func: F) -> Self {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Args, Fut, R> RemoteFunction for TypedFn<F, Args, Fut, R>
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Args: DeserializeOwned + 'static,
    Fut: Future<Output = std::result::Result<R, RemoteFailure>> + Send + 'static,
    R: Serialize + 'static,
{
    fn call(&self, args: CallArgs) -> BoxFuture<'static, CallResult> {
        // ---
        let args: Args = match positional_only(&args) {
            Ok(args) => args,
            Err(failure) => return Box::pin(async move { Err(failure) }),
        };

        let fut = (self.func)(args);
        Box::pin(async move { to_value(fut.await?) })
    }
}

/// Synchronous function over a positional-argument tuple.
pub(super) struct BlockingFn<F, Args, R> {
    func: Arc<F>,
    _phantom: PhantomData<fn(Args) -> R>,
}

impl<F, Args, R> BlockingFn<F, Args, R>
where
    F: Fn(Args) -> std::result::Result<R, RemoteFailure> + Send + Sync + 'static,
    Args: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    pub(super) fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
            _phantom: PhantomData,
        }
    }
}

impl<F, Args, R> RemoteFunction for BlockingFn<F, Args, R>
where
    F: Fn(Args) -> std::result::Result<R, RemoteFailure> + Send + Sync + 'static,
    Args: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    fn call(&self, args: CallArgs) -> BoxFuture<'static, CallResult> {
        // ---
        let args: Args = match positional_only(&args) {
            Ok(args) => args,
            Err(failure) => return Box::pin(async move { Err(failure) }),
        };

        let func = self.func.clone();
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || func(args)).await {
                Ok(result) => to_value(result?),
                Err(join) if join.is_panic() => Err(panic_failure(join.into_panic())),
                Err(join) => Err(RemoteFailure::msg(format!("blocking task failed: {join}"))),
            }
        })
    }
}

/// Run `func`, turning a panic anywhere in it into a `Panic` failure.
pub(super) async fn invoke(func: &dyn RemoteFunction, args: CallArgs) -> CallResult {
    // ---
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| func.call(args))) {
        Ok(fut) => fut,
        Err(payload) => return Err(panic_failure(payload)),
    };

    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(panic_failure(payload)),
    }
}

fn panic_failure(payload: Box<dyn Any + Send>) -> RemoteFailure {
    // ---
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "remote function panicked".to_string()
    };

    RemoteFailure::new(RemoteFailure::PANIC, message)
}

/// Registration name for a function item: the last segment of its path.
///
/// Closures have no usable name and yield `None`.
pub(super) fn function_name<F>() -> Option<&'static str> {
    // ---
    let full = std::any::type_name::<F>();
    if full.contains("{{closure}}") {
        return None;
    }

    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::").next().filter(|name| !name.is_empty())
}
