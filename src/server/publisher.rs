//! Single response publisher for parallel dispatch.
//!
//! Worker tasks never touch the transport; they push finished response
//! envelopes into an unbounded queue drained by one task, so responses are
//! published one at a time and in completion order.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{log_debug, log_error, Envelope, TransportPtr};

pub(super) type ReplySender = mpsc::UnboundedSender<Envelope>;

/// Spawn the publisher. It exits once every [`ReplySender`] clone is dropped
/// and the queue is drained.
pub(super) fn spawn_publisher(server_id: String, transport: TransportPtr) -> (ReplySender, JoinHandle<()>) {
    // ---
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    let handle = tokio::spawn(async move {
        log_debug!("[{server_id}] publisher started");

        while let Some(envelope) = rx.recv().await {
            let reply_to = envelope.address.clone();
            if let Err(e) = transport.publish(envelope).await {
                log_error!("[{server_id}] failed to publish response to {reply_to}: {e}");
            }
        }

        log_debug!("[{server_id}] publisher stopped");
    });

    (tx, handle)
}
