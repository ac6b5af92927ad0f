//! Server builder.
//!
//! Provides a fluent builder API for configuring a [`Server`] beyond what
//! [`RpcConfig`](crate::RpcConfig) carries.

use crate::{
    // ---
    CodecPtr,
    DispatchMode,
    JsonCodec,
    Result,
    RpcError,
    Server,
    SubscribeOptions,
    TransportPtr,
};

/// Builder for creating servers.
///
/// Accepts a transport and a server id, and allows overriding the dispatch
/// mode, the payload codec and the flags of the server queue.
///
/// # Example
///
/// ```
/// use callme::{create_memory_transport, DispatchMode, ServerBuilder};
///
/// # fn example() -> callme::Result<()> {
/// let transport = create_memory_transport("fooserver");
///
/// let server = ServerBuilder::new(transport, "fooserver")
///     .dispatch(DispatchMode::Parallel)
///     .build()?;
/// assert_eq!(server.server_id(), "fooserver");
/// # Ok(())
/// # }
/// ```
pub struct ServerBuilder {
    // ---
    transport: TransportPtr,
    server_id: String,
    dispatch: DispatchMode,
    codec: Option<CodecPtr>,
    queue_options: SubscribeOptions,
    owns_transport: bool,
}

impl ServerBuilder {
    /// Start building a server that consumes `server_<server_id>_queue`.
    ///
    /// Dispatch defaults to [`DispatchMode::Serial`], the codec to JSON and
    /// the queue to non-durable, auto-delete.
    pub fn new(transport: TransportPtr, server_id: impl Into<String>) -> Self {
        // ---
        Self {
            transport,
            server_id: server_id.into(),
            dispatch: DispatchMode::default(),
            codec: None,
            queue_options: SubscribeOptions::server_queue(),
            owns_transport: false,
        }
    }

    pub fn dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Replace the payload codec. Proxies must use the same one.
    pub fn codec(mut self, codec: CodecPtr) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Flags `server_<id>_queue` is declared with. Proxies must declare it
    /// with the same flags (see [`RpcConfig::server_queue_options`](crate::RpcConfig::server_queue_options)).
    pub fn queue_options(mut self, options: SubscribeOptions) -> Self {
        self.queue_options = options;
        self
    }

    /// Close the transport when the server stops.
    pub(crate) fn owns_transport(mut self) -> Self {
        self.owns_transport = true;
        self
    }

    /// Build the server (consumes self).
    ///
    /// # Errors
    ///
    /// Returns `RpcError::InvalidArgument` for an empty server id.
    pub fn build(self) -> Result<Server> {
        // ---
        if self.server_id.is_empty() {
            return Err(RpcError::InvalidArgument("server id must not be empty".into()));
        }

        Ok(Server::new(
            self.transport,
            self.server_id,
            self.dispatch,
            self.codec.unwrap_or_else(JsonCodec::shared),
            self.queue_options,
            self.owns_transport,
        ))
    }
}
