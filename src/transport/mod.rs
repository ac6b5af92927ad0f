//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait. Broker-backed transports are hidden behind feature
//! flags and exposed only through constructor functions.
//!
//! Domain code must not depend on transport-specific types.

mod amqp;
mod memory;

#[cfg(feature = "transport_lapin")]
pub use amqp::create_lapin_transport;

pub use memory::{
    //
    create_memory_transport,
    create_memory_transport_with_hub,
    MemoryHub,
};

use crate::{Result, RpcConfig, TransportPtr};

/// Create the transport selected by `config`.
///
/// - A broker is configured and `transport_lapin` is enabled: AMQP via lapin.
/// - No broker is configured: the process-wide in-memory hub.
///
/// `transport_id` only appears in log messages.
///
/// # Errors
///
/// Returns [`RpcError::Transport`](crate::RpcError::Transport) if the broker cannot be reached, or if a
/// broker is configured but no broker transport was compiled in.
pub async fn create_transport(config: &RpcConfig, transport_id: &str) -> Result<TransportPtr> {
    // ---
    match &config.broker {
        None => Ok(create_memory_transport(transport_id)),

        #[cfg(feature = "transport_lapin")]
        Some(broker) => create_lapin_transport(broker, transport_id).await,

        #[cfg(not(feature = "transport_lapin"))]
        Some(_) => Err(crate::RpcError::Transport(
            "a broker is configured but the `transport_lapin` feature is disabled".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Envelope, SubscribeOptions};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_no_broker_selects_memory() {
        // ---
        let transport = create_transport(&RpcConfig::memory(), "select-test")
            .await
            .unwrap();
        assert_eq!(transport.transport_id(), "select-test");

        let mut sub = transport
            .subscribe("select_test_queue".into(), SubscribeOptions::reply_queue())
            .await
            .unwrap();

        let env = Envelope {
            address: "select_test_queue".into(),
            payload: Bytes::from_static(b"ping"),
            correlation_id: None,
            reply_to: None,
            content_type: None,
        };
        transport.publish(env).await.unwrap();

        let delivery = sub.inbox.recv().await.unwrap();
        assert_eq!(delivery.envelope.payload, Bytes::from_static(b"ping"));
    }
}
