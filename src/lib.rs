//! Remote procedure calls over an AMQP message broker.
//!
//! A [`Server`] registers named functions and consumes requests from its queue
//! (`server_<id>_queue`); a [`Proxy`] publishes requests to that queue and
//! waits on a private reply queue for the correlated response. Remote failures
//! come back as values ([`RemoteFailure`]) and surface as
//! [`RpcError::Remote`], distinct from timeouts.
//!
//! Transports:
//!
//! - AMQP 0-9-1 via `lapin` (feature `transport_lapin`, default)
//! - an in-process memory hub with the same queue semantics, used when
//!   [`RpcConfig`] names no broker
//!
//! ```
//! use callme::{Proxy, RemoteFailure, RpcConfig, RpcRequest, Server};
//! use std::time::Duration;
//!
//! async fn madd((a, b): (i64, i64)) -> Result<i64, RemoteFailure> {
//!     Ok(a + b)
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> callme::Result<()> {
//! let config = RpcConfig::memory().with_timeout(Duration::from_secs(1));
//!
//! let server = Server::connect(&config, "doc_fooserver").await?;
//! server.register_fn(madd)?;
//! let runner = server.clone();
//! let task = tokio::spawn(async move { runner.start().await });
//! server.wait_until_running().await?;
//!
//! let mut proxy = Proxy::connect(&config).await?;
//! let sum: i64 = proxy
//!     .use_server("doc_fooserver")
//!     .call_as(RpcRequest::new("madd").arg(1).arg(1))
//!     .await?;
//! assert_eq!(sum, 2);
//!
//! server.stop().await;
//! task.await.ok();
//! # Ok(())
//! # }
//! ```

mod macros;

mod addressing;
mod client;
mod correlation;
mod domain;
mod error;
mod protocol;
mod rpc_config;
mod server;
mod transport;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// --- public re-exports
pub use addressing::{reply_address, server_address};
pub use client::Proxy;
pub use correlation::CorrelationId;
pub use error::{Result, RpcError};
pub use rpc_config::{BrokerConfig, DispatchMode, RpcConfig};

pub use protocol::{
    //
    CallArgs,
    Codec,
    CodecPtr,
    JsonCodec,
    Outcome,
    RemoteFailure,
    RpcRequest,
    RpcResponse,
};

pub use server::{
    //
    BoxFuture,
    CallResult,
    RemoteFunction,
    Server,
    ServerBuilder,
    ServerState,
};

pub use domain::{
    //
    Acker,
    Address,
    Delivery,
    Envelope,
    SubscribeOptions,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

pub use transport::{
    //
    create_memory_transport,
    create_memory_transport_with_hub,
    create_transport,
    MemoryHub,
};

#[cfg(feature = "transport_lapin")]
pub use transport::create_lapin_transport;
