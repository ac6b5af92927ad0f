// src/server/mod.rs
//! RPC server side.
//!
//! A [`Server`] consumes `server_<id>_queue`, invokes the registered function
//! named by each request, and publishes exactly one response to the request's
//! `reply_to` queue with the request's correlation id.
//!
//! # Request handling
//!
//! Every delivery is acknowledged before anything else happens, so a handler
//! crash never leads to redelivery. Requests without `reply_to` or
//! `correlation_id`, and payloads that do not decode, are logged and dropped.
//! Every other request is answered, with a [`RemoteFailure`] when:
//!
//! - no function is registered under the name (`UnknownFunction`)
//! - the arguments do not fit the function (`ArgumentError`)
//! - the function returns an error (its own kind)
//! - the function panics (`Panic`)
//!
//! # Dispatch
//!
//! [`DispatchMode::Serial`] handles one request completely, response included,
//! before taking the next. [`DispatchMode::Parallel`] spawns a task per
//! request; responses go through a single publisher task.

mod builder;
mod handler;
mod publisher;
mod registry;

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::{
    // ---
    addressing,
    log_debug,
    log_error,
    log_info,
    log_warn,
    Address,
    CallArgs,
    CodecPtr,
    Delivery,
    DispatchMode,
    Envelope,
    RemoteFailure,
    Result,
    RpcConfig,
    RpcError,
    RpcRequest,
    RpcResponse,
    SubscribeOptions,
    SubscriptionHandle,
    TransportPtr,
};

pub use builder::ServerBuilder;
pub use handler::{BoxFuture, CallResult, RemoteFunction};

use handler::{ArgsFn, BlockingFn, TypedFn};
use publisher::ReplySender;
use registry::FunctionRegistry;

/// Server lifecycle.
///
/// `Created → Starting → Running → Stopping → Stopped`. A stopped server
/// cannot be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Serves registered functions on `server_<id>_queue`.
///
/// Cheap to clone (internally `Arc`-backed); clones share state, so one clone
/// can run [`start`](Self::start) while another calls [`stop`](Self::stop).
///
/// # Example
///
/// ```no_run
/// use callme::{RemoteFailure, RpcConfig, Server};
///
/// async fn madd((a, b): (i64, i64)) -> Result<i64, RemoteFailure> {
///     Ok(a + b)
/// }
///
/// # async fn example() -> callme::Result<()> {
/// let server = Server::connect(&RpcConfig::memory(), "fooserver").await?;
/// server.register_fn(madd)?;
///
/// let runner = server.clone();
/// let task = tokio::spawn(async move { runner.start().await });
///
/// // ...
///
/// server.stop().await;
/// task.await.ok();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    server_id: String,
    transport: TransportPtr,
    owns_transport: bool,
    codec: CodecPtr,
    dispatch: DispatchMode,
    queue_options: SubscribeOptions,
    registry: FunctionRegistry,
    state: watch::Sender<ServerState>,
}

/// A request that passed validation and must be answered.
struct Job {
    request: RpcRequest,
    reply_to: Address,
    correlation_id: Arc<str>,
}

impl Server {
    // ---
    pub(crate) fn new(
        transport: TransportPtr,
        server_id: String,
        dispatch: DispatchMode,
        codec: CodecPtr,
        queue_options: SubscribeOptions,
        owns_transport: bool,
    ) -> Self {
        // ---
        let (state, _) = watch::channel(ServerState::Created);

        Self {
            inner: Arc::new(Inner {
                server_id,
                transport,
                owns_transport,
                codec,
                dispatch,
                queue_options,
                registry: FunctionRegistry::default(),
                state,
            }),
        }
    }

    /// Connect to the transport selected by `config` and create a server
    /// for `server_id`. The transport is closed when the server stops.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the broker cannot be reached, and
    /// `RpcError::InvalidArgument` for an empty server id.
    pub async fn connect(config: &RpcConfig, server_id: &str) -> Result<Self> {
        // ---
        if server_id.is_empty() {
            return Err(RpcError::InvalidArgument("server id must not be empty".into()));
        }

        let transport = crate::create_transport(config, server_id).await?;
        ServerBuilder::new(transport, server_id)
            .dispatch(config.dispatch)
            .queue_options(config.server_queue_options())
            .owns_transport()
            .build()
    }

    /// Create a server on an existing, possibly shared, transport.
    pub fn with_transport(transport: TransportPtr, server_id: &str, config: &RpcConfig) -> Result<Self> {
        ServerBuilder::new(transport, server_id)
            .dispatch(config.dispatch)
            .queue_options(config.server_queue_options())
            .build()
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    pub fn dispatch(&self) -> DispatchMode {
        self.inner.dispatch
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.borrow()
    }

    /// Names of all registered functions, sorted.
    pub fn function_names(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register an async function that receives the raw [`CallArgs`].
    ///
    /// Registering an existing name replaces the earlier function. While the
    /// server is running, requests already dispatched may still see the old
    /// one.
    ///
    /// # Errors
    ///
    /// `RpcError::InvalidRegistration` for an empty name,
    /// `RpcError::InvalidState` once the server is stopping or stopped.
    pub fn register<F, Fut, R>(&self, name: &str, func: F) -> Result<()>
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, RemoteFailure>> + Send + 'static,
        R: Serialize + 'static,
    {
        self.register_function(name, Arc::new(ArgsFn::new(func)))
    }

    /// Register an async function over a positional-argument tuple.
    ///
    /// ```
    /// # use callme::{create_memory_transport, RemoteFailure, RpcConfig, Server};
    /// # fn example() -> callme::Result<()> {
    /// # let server = Server::with_transport(create_memory_transport("s"), "s", &RpcConfig::memory())?;
    /// server.register_typed("madd", |(a, b): (i64, i64)| async move {
    ///     Ok::<_, RemoteFailure>(a + b)
    /// })?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn register_typed<F, Args, Fut, R>(&self, name: &str, func: F) -> Result<()>
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Args: DeserializeOwned + 'static,
        Fut: Future<Output = std::result::Result<R, RemoteFailure>> + Send + 'static,
        R: Serialize + 'static,
    {
        self.register_function(name, Arc::new(TypedFn::new(func)))
    }

    /// Register a synchronous function. Each call runs on tokio's blocking
    /// thread pool.
    pub fn register_blocking<F, Args, R>(&self, name: &str, func: F) -> Result<()>
    where
        F: Fn(Args) -> std::result::Result<R, RemoteFailure> + Send + Sync + 'static,
        Args: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.register_function(name, Arc::new(BlockingFn::new(func)))
    }

    /// Register an async function item under its own name.
    ///
    /// `register_fn(madd)` registers `"madd"`. Closures have no name and are
    /// rejected; use [`register_typed`](Self::register_typed) for them.
    pub fn register_fn<F, Args, Fut, R>(&self, func: F) -> Result<()>
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Args: DeserializeOwned + 'static,
        Fut: Future<Output = std::result::Result<R, RemoteFailure>> + Send + 'static,
        R: Serialize + 'static,
    {
        let name = handler::function_name::<F>().ok_or_else(|| {
            RpcError::InvalidRegistration(
                "closures have no name; register them with an explicit name".into(),
            )
        })?;

        self.register_typed(name, func)
    }

    /// Register any [`RemoteFunction`] implementation.
    pub fn register_function(&self, name: &str, func: Arc<dyn RemoteFunction>) -> Result<()> {
        // ---
        if name.is_empty() {
            return Err(RpcError::InvalidRegistration("function name must not be empty".into()));
        }

        match self.state() {
            ServerState::Created | ServerState::Starting | ServerState::Running => {}
            state => {
                return Err(RpcError::InvalidState(format!(
                    "cannot register '{name}' on a server in state {state:?}"
                )));
            }
        }

        if self.inner.registry.insert(name, func) {
            log_info!("[{}] replaced function {name}", self.inner.server_id);
        } else {
            log_debug!("[{}] registered function {name}", self.inner.server_id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Consume requests until [`stop`](Self::stop) is called.
    ///
    /// # Errors
    ///
    /// - `RpcError::InvalidState` if the server was already started or stopped
    /// - `RpcError::Transport` if the inbound queue cannot be subscribed or
    ///   the subscription closes while running
    pub async fn start(&self) -> Result<()> {
        // ---
        let mut current = ServerState::Created;
        let began = self.inner.state.send_if_modified(|state| {
            current = *state;
            if *state == ServerState::Created {
                *state = ServerState::Starting;
                true
            } else {
                false
            }
        });

        if !began {
            return Err(RpcError::InvalidState(format!(
                "start() called on a server in state {current:?}"
            )));
        }

        // Reaches `Stopped` even if this future is dropped mid-run.
        let stopped = MarkStopped(&self.inner.state);

        let result = self.inner.clone().run().await;

        if let Err(e) = &result {
            log_error!("[{}] server loop failed: {e}", self.inner.server_id);
        }

        if self.inner.owns_transport {
            if let Err(e) = self.inner.transport.close().await {
                log_warn!("[{}] transport close failed: {e}", self.inner.server_id);
            }
        }

        drop(stopped);
        log_info!("[{}] server stopped", self.inner.server_id);

        result
    }

    /// Request an orderly stop and wait until the receive loop has exited and
    /// released its subscription.
    ///
    /// In parallel mode this also waits for requests already taken off the
    /// queue to be answered. Stopping a server that never started moves it
    /// straight to `Stopped`; stopping a stopped server does nothing.
    pub async fn stop(&self) {
        // ---
        let mut previous = ServerState::Created;
        self.inner.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                ServerState::Created => {
                    *state = ServerState::Stopped;
                    true
                }
                ServerState::Starting | ServerState::Running => {
                    *state = ServerState::Stopping;
                    true
                }
                ServerState::Stopping | ServerState::Stopped => false,
            }
        });

        match previous {
            ServerState::Stopped => return,
            ServerState::Created => {
                if self.inner.owns_transport {
                    if let Err(e) = self.inner.transport.close().await {
                        log_warn!("[{}] transport close failed: {e}", self.inner.server_id);
                    }
                }
                return;
            }
            _ => {}
        }

        log_info!("[{}] stopping", self.inner.server_id);

        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == ServerState::Stopped).await;
    }

    /// Wait until the server consumes its queue.
    ///
    /// # Errors
    ///
    /// `RpcError::InvalidState` if the server stopped without ever running.
    pub async fn wait_until_running(&self) -> Result<()> {
        // ---
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|state| {
                matches!(
                    state,
                    ServerState::Running | ServerState::Stopping | ServerState::Stopped
                )
            })
            .await
            .map(|state| *state)
            .map_err(|_| RpcError::InvalidState("server dropped".into()))?;

        match state {
            ServerState::Running => Ok(()),
            state => Err(RpcError::InvalidState(format!(
                "server is {state:?}, it will not run"
            ))),
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>) -> Result<()> {
        // ---
        let queue = addressing::server_address(&self.server_id);
        let mut subscription = self
            .transport
            .subscribe(queue.clone(), self.queue_options)
            .await?;

        let running = self.state.send_if_modified(|state| {
            if *state == ServerState::Starting {
                *state = ServerState::Running;
                true
            } else {
                false
            }
        });

        if !running {
            log_info!("[{}] stop requested during start", self.server_id);
            return Ok(());
        }

        log_info!(
            "[{}] serving {} function(s) on {queue}, {:?} dispatch",
            self.server_id,
            self.registry.names().len(),
            self.dispatch
        );

        match self.dispatch {
            DispatchMode::Serial => self.serve_serial(&mut subscription).await,
            DispatchMode::Parallel => self.serve_parallel(&mut subscription).await,
        }
    }

    /// Next delivery, or `None` once a stop was requested.
    async fn next_delivery(&self, subscription: &mut SubscriptionHandle) -> Result<Option<Delivery>> {
        // ---
        let mut stop_rx = self.state.subscribe();

        tokio::select! {
            biased;

            _ = stop_requested(&mut stop_rx) => Ok(None),

            next = subscription.inbox.recv() => match next {
                Some(delivery) => Ok(Some(delivery)),
                None => Err(RpcError::Transport(format!(
                    "inbound subscription for {} closed",
                    self.server_id
                ))),
            },
        }
    }

    async fn serve_serial(&self, subscription: &mut SubscriptionHandle) -> Result<()> {
        // ---
        while let Some(delivery) = self.next_delivery(subscription).await? {
            let Some(job) = self.accept(delivery).await else {
                continue;
            };

            if let Some(envelope) = self.execute(job).await {
                let reply_to = envelope.address.clone();
                if let Err(e) = self.transport.publish(envelope).await {
                    log_error!("[{}] failed to publish response to {reply_to}: {e}", self.server_id);
                }
            }
        }

        Ok(())
    }

    async fn serve_parallel(self: &Arc<Self>, subscription: &mut SubscriptionHandle) -> Result<()> {
        // ---
        let (replies, publisher) =
            publisher::spawn_publisher(self.server_id.clone(), self.transport.clone());

        let result = self.dispatch_parallel(subscription, &replies).await;

        // Workers still hold sender clones; the publisher drains their
        // responses and exits after the last one.
        drop(replies);
        if let Err(e) = publisher.await {
            log_error!("[{}] publisher task failed: {e}", self.server_id);
        }

        result
    }

    async fn dispatch_parallel(
        self: &Arc<Self>,
        subscription: &mut SubscriptionHandle,
        replies: &ReplySender,
    ) -> Result<()> {
        // ---
        while let Some(delivery) = self.next_delivery(subscription).await? {
            let Some(job) = self.accept(delivery).await else {
                continue;
            };

            let inner = self.clone();
            let replies = replies.clone();
            tokio::spawn(async move {
                if let Some(envelope) = inner.execute(job).await {
                    let _ = replies.send(envelope);
                }
            });
        }

        Ok(())
    }

    /// Acknowledge `delivery` and validate it as a request.
    async fn accept(&self, delivery: Delivery) -> Option<Job> {
        // ---
        if let Err(e) = delivery.ack().await {
            log_warn!("[{}] failed to ack request: {e}", self.server_id);
        }

        let envelope = delivery.envelope;

        let Some(reply_to) = envelope.reply_to else {
            log_warn!("[{}] dropping request without reply_to", self.server_id);
            return None;
        };

        let Some(correlation_id) = envelope.correlation_id else {
            log_warn!("[{}] dropping request without correlation_id", self.server_id);
            return None;
        };

        match self.codec.decode_request(&envelope.payload) {
            Ok(request) => Some(Job {
                request,
                reply_to,
                correlation_id,
            }),
            Err(e) => {
                let e = RpcError::InvalidMessage(e.to_string());
                log_warn!("[{}] dropping request {correlation_id}: {e}", self.server_id);
                None
            }
        }
    }

    /// Invoke the requested function and build the response envelope.
    async fn execute(&self, job: Job) -> Option<Envelope> {
        // ---
        let Job {
            request,
            reply_to,
            correlation_id,
        } = job;

        let (name, args) = request.into_parts();

        let result = match self.registry.get(&name) {
            Some(func) => handler::invoke(func.as_ref(), args).await,
            None => Err(RemoteFailure::unknown_function(&name)),
        };

        if let Err(failure) = &result {
            log_debug!("[{}] {name} ({correlation_id}) failed: {failure}", self.server_id);
        }

        let response = RpcResponse::from(result);
        let payload = match self.codec.encode_response(&response) {
            Ok(payload) => payload,
            Err(e) => {
                log_error!("[{}] cannot encode response for {name}: {e}", self.server_id);
                return None;
            }
        };

        Some(Envelope::response(
            reply_to,
            payload,
            correlation_id,
            self.codec.content_type().into(),
        ))
    }
}

struct MarkStopped<'a>(&'a watch::Sender<ServerState>);

impl Drop for MarkStopped<'_> {
    fn drop(&mut self) {
        self.0.send_replace(ServerState::Stopped);
    }
}

async fn stop_requested(rx: &mut watch::Receiver<ServerState>) {
    let _ = rx
        .wait_for(|state| matches!(state, ServerState::Stopping | ServerState::Stopped))
        .await;
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_transport_with_hub, MemoryHub};
    use std::time::Duration;

    async fn madd((a, b): (i64, i64)) -> std::result::Result<i64, RemoteFailure> {
        Ok(a + b)
    }

    fn server(hub: &Arc<MemoryHub>, id: &str) -> Server {
        let transport = create_memory_transport_with_hub(id, hub.clone());
        Server::with_transport(transport, id, &RpcConfig::memory()).unwrap()
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        // ---
        let hub = MemoryHub::new();
        let server = server(&hub, "twice");

        let runner = server.clone();
        let task = tokio::spawn(async move { runner.start().await });
        server.wait_until_running().await.unwrap();

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidState(_)));

        server.stop().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_deterministic() {
        // ---
        let hub = MemoryHub::new();
        let server = server(&hub, "stopper");
        let queue = addressing::server_address("stopper");

        let runner = server.clone();
        let task = tokio::spawn(async move { runner.start().await });
        server.wait_until_running().await.unwrap();
        assert!(hub.has_queue(&queue));

        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!hub.has_queue(&queue));

        // A second stop is a no-op.
        server.stop().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_aborted_start_still_reaches_stopped() {
        // ---
        let hub = MemoryHub::new();
        let server = server(&hub, "aborted");

        let runner = server.clone();
        let task = tokio::spawn(async move { runner.start().await });
        server.wait_until_running().await.unwrap();

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(server.state(), ServerState::Stopped);

        tokio::time::timeout(Duration::from_secs(1), server.stop())
            .await
            .expect("stop() hung after the server task was aborted");
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        // ---
        let hub = MemoryHub::new();
        let server = server(&hub, "never");

        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);

        assert!(matches!(server.start().await, Err(RpcError::InvalidState(_))));
        assert!(matches!(
            server.register_fn(madd),
            Err(RpcError::InvalidState(_))
        ));
        assert!(server.wait_until_running().await.is_err());
    }

    #[tokio::test]
    async fn test_registration_rules() {
        // ---
        let hub = MemoryHub::new();
        let server = server(&hub, "reg");

        server.register_fn(madd).unwrap();
        assert_eq!(server.function_names(), vec!["madd".to_string()]);

        let err = server
            .register_fn(|(a,): (i64,)| async move { Ok::<_, RemoteFailure>(a) })
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidRegistration(_)));

        let err = server
            .register_blocking("", |(a,): (i64,)| Ok::<_, RemoteFailure>(a))
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidRegistration(_)));
    }

    #[tokio::test]
    async fn test_closed_subscription_fails_start() {
        // ---
        let hub = MemoryHub::new();
        let transport = create_memory_transport_with_hub("fragile", hub.clone());
        let server = Server::with_transport(transport.clone(), "fragile", &RpcConfig::memory())
            .unwrap();

        let runner = server.clone();
        let task = tokio::spawn(async move { runner.start().await });
        server.wait_until_running().await.unwrap();

        transport.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RpcError::Transport(_))));
        assert_eq!(server.state(), ServerState::Stopped);
    }
}
