// src/client/mod.rs
//! RPC client side.
//!
//! This module contains the [`Proxy`] type which sends requests to servers and
//! waits for their responses over a transport.
//!
//! # Architecture
//!
//! On construction a proxy subscribes to its own exclusive, auto-deleting
//! reply queue (`client_<user>_queue_<token>`). Each call declares
//! `server_<id>_queue`, so a request sent before the server starts waits
//! there, and publishes one request to it carrying a fresh correlation id and
//! the reply queue as `reply_to`. It then drains the reply queue until the
//! correlated response arrives or the deadline passes.
//!
//! # Concurrency
//!
//! Calls take `&mut self`, so a proxy has at most one request in flight. Use
//! one proxy per concurrent caller.

mod reply;

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

use crate::{
    // ---
    addressing,
    log_debug,
    log_info,
    Address,
    CodecPtr,
    CorrelationId,
    Envelope,
    JsonCodec,
    Result,
    RpcConfig,
    RpcError,
    RpcRequest,
    SubscribeOptions,
    TransportPtr,
};

use reply::ReplyInbox;

/// Caller-side handle for invoking remote functions.
///
/// # Example
///
/// ```no_run
/// use callme::{Proxy, RpcConfig, RpcRequest};
/// use std::time::Duration;
///
/// # async fn example() -> callme::Result<()> {
/// let mut proxy = Proxy::connect(&RpcConfig::memory()).await?;
///
/// let sum: i64 = proxy
///     .use_server("fooserver")
///     .use_timeout(Duration::from_secs(1))
///     .call_as(RpcRequest::new("madd").arg(1).arg(1))
///     .await?;
/// assert_eq!(sum, 2);
/// # Ok(())
/// # }
/// ```
pub struct Proxy {
    // ---
    transport: TransportPtr,
    owns_transport: bool,
    codec: CodecPtr,
    replies: ReplyInbox,

    /// Flags the target server queue is declared with.
    server_queue: SubscribeOptions,

    /// Target used by [`call`](Self::call).
    server_id: Option<String>,

    /// Used when a call does not pass its own timeout. Zero waits forever.
    timeout: Duration,
}

impl Proxy {
    // ---
    /// Connect to the transport selected by `config` and set up the reply
    /// queue.
    ///
    /// The default timeout comes from `config.timeout`; there is no default
    /// server until [`use_server`](Self::use_server) is called.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the broker cannot be reached or the
    /// reply queue cannot be declared.
    pub async fn connect(config: &RpcConfig) -> Result<Self> {
        // ---
        let transport = crate::create_transport(config, "proxy").await?;
        Self::build(transport, config, true).await
    }

    /// Create a proxy on an existing transport.
    ///
    /// The transport is shared; [`close`](Self::close) leaves it open.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the reply queue cannot be declared.
    pub async fn with_transport(transport: TransportPtr, config: &RpcConfig) -> Result<Self> {
        Self::build(transport, config, false).await
    }

    async fn build(transport: TransportPtr, config: &RpcConfig, owns_transport: bool) -> Result<Self> {
        // ---
        let address = addressing::reply_address(config.user());

        let subscription = transport
            .subscribe(address.clone(), config.reply_queue_options())
            .await?;

        log_info!("[{address}] proxy ready on {}", transport.transport_id());

        Ok(Self {
            transport,
            owns_transport,
            codec: JsonCodec::shared(),
            replies: ReplyInbox::new(address, subscription),
            server_queue: config.server_queue_options(),
            server_id: None,
            timeout: config.timeout,
        })
    }

    /// Replace the payload codec. Servers must use the same one.
    pub fn with_codec(mut self, codec: CodecPtr) -> Self {
        self.codec = codec;
        self
    }

    /// Set the default target server. No I/O.
    pub fn use_server(&mut self, server_id: impl Into<String>) -> &mut Self {
        self.server_id = Some(server_id.into());
        self
    }

    /// Set the default per-call timeout. `Duration::ZERO` waits forever.
    pub fn use_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn server_id(&self) -> Option<&str> {
        self.server_id.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// This proxy's private reply queue.
    pub fn reply_address(&self) -> &Address {
        self.replies.address()
    }

    /// Invoke `request` on the default server with the default timeout.
    ///
    /// # Errors
    ///
    /// `RpcError::InvalidArgument` if no default server was set, otherwise
    /// as [`call_to`](Self::call_to).
    pub async fn call(&mut self, request: RpcRequest) -> Result<Value> {
        // ---
        let server_id = self.server_id.clone().ok_or_else(|| {
            RpcError::InvalidArgument("no server selected; call use_server() first".into())
        })?;

        self.call_to(&server_id, request, None).await
    }

    /// Like [`call`](Self::call), deserializing the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(&mut self, request: RpcRequest) -> Result<T> {
        let value = self.call(request).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Invoke `request` on `server_id` and wait for its response.
    ///
    /// `timeout` of `None` uses the proxy default; `Some(Duration::ZERO)`
    /// waits forever. The deadline is fixed when the request is published.
    ///
    /// # Errors
    ///
    /// - `RpcError::InvalidArgument` - empty server id or function name
    /// - `RpcError::Remote` - the remote function failed
    /// - `RpcError::Timeout` - no correlated response before the deadline
    /// - `RpcError::ConnectionLost` - the reply subscription closed
    /// - `RpcError::Transport` / `RpcError::Serialization` - the request could
    ///   not be sent
    pub async fn call_to(
        &mut self,
        server_id: &str,
        request: RpcRequest,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        // ---
        if server_id.is_empty() {
            return Err(RpcError::InvalidArgument("server id must not be empty".into()));
        }
        if request.function_name().is_empty() {
            return Err(RpcError::InvalidArgument("function name must not be empty".into()));
        }

        let timeout = timeout.unwrap_or(self.timeout);
        let correlation_id = CorrelationId::generate();
        let target = addressing::server_address(server_id);

        let envelope = Envelope::request(
            target.clone(),
            self.codec.encode_request(&request)?,
            correlation_id.as_shared(),
            self.replies.address().clone(),
            self.codec.content_type().into(),
        );

        log_debug!(
            "[{}] calling {}.{} ({correlation_id})",
            self.replies.address(),
            server_id,
            request.function_name()
        );

        let started = Instant::now();
        self.transport.declare(target, self.server_queue).await?;
        self.transport.publish(envelope).await?;

        let response = self
            .replies
            .wait_for(&correlation_id, &self.codec, started, timeout)
            .await?;

        response.into_result()
    }

    /// Release the reply queue, and the transport if this proxy created it.
    pub async fn close(self) -> Result<()> {
        // ---
        let Self {
            transport,
            owns_transport,
            replies,
            ..
        } = self;

        log_info!("[{}] proxy closing", replies.address());
        drop(replies);

        if owns_transport {
            transport.close().await?;
        }
        Ok(())
    }
}
