//! The proxy's private reply queue.
//!
//! A proxy has at most one call in flight, so there is no pending-request
//! map: the caller itself drains the inbox until the delivery carrying its
//! correlation id shows up or the deadline passes.

use std::time::Duration;

use tokio::time::{self, Instant};

use crate::{
    //
    log_debug,
    log_warn,
    Address,
    CodecPtr,
    CorrelationId,
    Result,
    RpcError,
    RpcResponse,
    SubscriptionHandle,
};

pub(super) struct ReplyInbox {
    // ---
    address: Address,
    subscription: SubscriptionHandle,
}

impl ReplyInbox {
    pub(super) fn new(address: Address, subscription: SubscriptionHandle) -> Self {
        Self {
            address,
            subscription,
        }
    }

    pub(super) fn address(&self) -> &Address {
        &self.address
    }

    /// Wait for the response correlated with `awaited`.
    ///
    /// The deadline is `started + timeout`, fixed for the whole wait. A zero
    /// `timeout`, or one too large to represent as a deadline, waits until the
    /// response arrives or the subscription closes.
    ///
    /// Every delivery is acknowledged, matching or not. Stale and foreign
    /// deliveries are discarded.
    pub(super) async fn wait_for(
        &mut self,
        awaited: &CorrelationId,
        codec: &CodecPtr,
        started: Instant,
        timeout: Duration,
    ) -> Result<RpcResponse> {
        // ---
        let deadline = if timeout.is_zero() {
            None
        } else {
            started.checked_add(timeout)
        };

        loop {
            let next = match deadline {
                Some(deadline) => time::timeout_at(deadline, self.subscription.inbox.recv())
                    .await
                    .map_err(|_| RpcError::Timeout(timeout))?,
                None => self.subscription.inbox.recv().await,
            };

            let Some(delivery) = next else {
                log_warn!("[{}] reply subscription closed", self.address);
                return Err(RpcError::ConnectionLost);
            };

            if let Err(e) = delivery.ack().await {
                log_warn!("[{}] failed to ack reply: {e}", self.address);
            }

            let envelope = delivery.envelope;
            if !awaited.matches(envelope.correlation_id.as_deref()) {
                log_debug!(
                    "[{}] discarding reply for {:?}, waiting for {awaited}",
                    self.address,
                    envelope.correlation_id
                );
                continue;
            }

            match codec.decode_response(&envelope.payload) {
                Ok(response) => return Ok(response),
                Err(e) => {
                    log_warn!(
                        "[{}] malformed response for {awaited}, still waiting: {e}",
                        self.address
                    );
                }
            }
        }
    }
}
