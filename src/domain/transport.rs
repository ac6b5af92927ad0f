// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the message-bus interface used by the proxy and the
//! server. It intentionally avoids any reference to concrete brokers or client
//! libraries; implementations live under `src/transport/`.
//!
//! The transport delivers opaque envelopes to queue consumers and hands each
//! delivery an acknowledgment handle. RPC correlation, timeouts and dispatch
//! are handled by the layers above.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// A queue name.
///
/// Requests go to `server_<id>_queue`, responses to the caller's private
/// reply queue. The transport treats the string as opaque.
///
/// Addresses are immutable, cheap to clone, and safe to share across threads.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        Address(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a queue is declared, explicitly or on first subscription.
///
/// Declaration is idempotent for identical options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Survive a broker restart.
    pub durable: bool,

    /// Only the declaring connection may consume; a second consumer is refused.
    pub exclusive: bool,

    /// Remove the queue once its last consumer goes away.
    pub auto_delete: bool,
}

impl SubscribeOptions {
    /// Options for a proxy's private reply queue.
    pub fn reply_queue() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// Options for a server's inbound queue. Servers sharing an id compete
    /// for messages on the same queue.
    pub fn server_queue() -> Self {
        Self {
            durable: false,
            exclusive: false,
            auto_delete: true,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

/// An opaque message envelope.
///
/// An `Envelope` is the unit of transport between producers and consumers.
/// The payload is interpreted by a [`Codec`](crate::Codec); the remaining
/// fields are message metadata (AMQP message properties on a real broker).
///
/// # Examples
///
/// ```
/// # use callme::{Address, Envelope};
/// # use bytes::Bytes;
/// # use std::sync::Arc;
/// let request = Envelope::request(
///     Address::from("server_fooserver_queue"),
///     Bytes::from_static(b"{}"),
///     Arc::from("correlation-123"),
///     Address::from("client_guest_queue_1"),
///     Arc::from("application/json"),
/// );
///
/// let response = Envelope::response(
///     request.reply_to.clone().unwrap(),
///     Bytes::from_static(b"{}"),
///     request.correlation_id.clone().unwrap(),
///     Arc::from("application/json"),
/// );
/// assert_eq!(response.address.as_str(), "client_guest_queue_1");
/// ```
#[derive(Clone, Debug)]
pub struct Envelope {
    // ---
    /// Destination queue.
    pub address: Address,

    /// Opaque payload bytes.
    pub payload: Bytes,

    /// Correlation identifier used to associate requests with responses.
    pub correlation_id: Option<Arc<str>>,

    /// Where the response to a request must be published.
    pub reply_to: Option<Address>,

    /// Payload format (e.g., "application/json"). Informational.
    pub content_type: Option<Arc<str>>,
}

impl Envelope {
    // ---
    /// Create a request envelope.
    pub fn request(
        address: Address,
        payload: Bytes,
        correlation_id: Arc<str>,
        reply_to: Address,
        content_type: Arc<str>,
    ) -> Self {
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: Some(content_type),
        }
    }

    /// Create a response envelope. `address` is the request's `reply_to`.
    pub fn response(
        address: Address,
        payload: Bytes,
        correlation_id: Arc<str>,
        content_type: Arc<str>,
    ) -> Self {
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: None,
            content_type: Some(content_type),
        }
    }
}

/// Acknowledges one delivery back to the bus.
#[async_trait::async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// One message taken off a queue.
///
/// The consumer decides when to acknowledge. An unacknowledged delivery may
/// be redelivered by a broker after a consumer crash.
pub struct Delivery {
    pub envelope: Envelope,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(envelope: Envelope, acker: Box<dyn Acker>) -> Self {
        Self { envelope, acker }
    }

    /// Acknowledge this delivery.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Handle returned from a successful subscription.
///
/// Dropping the handle cancels the consumer. For an auto-delete queue this
/// also removes the queue from the broker.
#[derive(Debug)]
pub struct SubscriptionHandle {
    // ---
    /// Deliveries for the subscribed queue. `None` from `recv()` means the
    /// transport closed or the consumer failed.
    ///
    /// Unbounded: a subscriber that stops reading must not stall publishers
    /// on the same bus.
    pub inbox: mpsc::UnboundedReceiver<Delivery>,
}

/// Transport abstraction.
///
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, messages published *after* that
///   point to the subscribed queue are deliverable.
/// - Each message on a queue is delivered to exactly one of its consumers.
/// - `publish()` never waits on a consumer.
/// - `publish()` to a queue with no consumer does not fail. A declared queue
///   keeps the message for its first consumer; otherwise it is dropped.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Identifier used in log messages.
    fn transport_id(&self) -> &str;

    /// Publish an envelope to `env.address`.
    async fn publish(&self, env: Envelope) -> Result<()>;

    /// Declare `queue` without consuming from it. Idempotent.
    async fn declare(&self, queue: Address, opts: SubscribeOptions) -> Result<()>;

    /// Declare `queue` (idempotent) and start consuming from it.
    async fn subscribe(&self, queue: Address, opts: SubscribeOptions)
        -> Result<SubscriptionHandle>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` only increments a reference count; clones share the same
/// underlying connection.
pub type TransportPtr = Arc<dyn Transport>;
