//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport approximates the AMQP queue model the RPC layer
//! relies on:
//!
//! - Once `subscribe()` returns successfully, messages published *after* that
//!   point to the queue are deliverable.
//! - Consumers of one queue **compete**: each message goes to exactly one of
//!   them, round-robin.
//! - An exclusive queue refuses a second consumer while the first is alive.
//! - A declared queue holds messages until its first consumer arrives.
//!   Publishing to a queue that was never declared drops the message, like an
//!   unroutable publish on the AMQP default exchange.
//! - An auto-delete queue disappears once its last consumer goes away. A
//!   queue that never had a consumer is kept.
//! - Publishing never waits: consumer inboxes are unbounded.
//!
//! ## Non-Goals
//!
//! This transport does not emulate persistence, redelivery of unacknowledged
//! messages, or network failures. `durable` is accepted and ignored.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::mpsc;

use crate::{
    // ---
    log_debug,
    Acker,
    Address,
    Delivery,
    Envelope,
    Result,
    RpcError,
    SubscribeOptions,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Consumer {
    owner: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct Queue {
    exclusive: bool,
    auto_delete: bool,
    /// Set by the first subscription; auto-delete only applies afterwards.
    consumed: bool,
    consumers: Vec<Consumer>,
    next: usize,
    backlog: VecDeque<Envelope>,
}

impl Queue {
    fn new(opts: SubscribeOptions) -> Self {
        Self {
            exclusive: opts.exclusive,
            auto_delete: opts.auto_delete,
            consumed: false,
            consumers: Vec::new(),
            next: 0,
            backlog: VecDeque::new(),
        }
    }

    fn prune(&mut self) {
        self.consumers.retain(|c| !c.tx.is_closed());
    }

    /// Auto-delete queue whose last consumer is gone.
    fn abandoned(&self) -> bool {
        self.auto_delete && self.consumed && self.consumers.is_empty()
    }
}

/// Shared message bus for the in-memory transport.
///
/// Simulates a broker within a single process. All memory transports that
/// share a hub can publish to and consume from each other's queues.
///
/// # Usage in Tests
///
/// Construct a hub per test to isolate tests running in parallel:
///
/// ```
/// # async fn example() -> callme::Result<()> {
/// let hub = callme::MemoryHub::new();
/// let server_side = callme::create_memory_transport_with_hub("server", hub.clone());
/// let client_side = callme::create_memory_transport_with_hub("client", hub.clone());
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    queues: Mutex<HashMap<Address, Queue>>,
    acked: Arc<AtomicUsize>,
    next_owner: AtomicU64,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of deliveries acknowledged through this hub so far.
    pub fn acked_count(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    /// `true` while `queue` exists: declared or consumed, and not yet
    /// auto-deleted.
    pub fn has_queue(&self, queue: &Address) -> bool {
        let mut queues = lock_ignore_poison(&self.queues);
        Self::live_queue(&mut queues, queue).is_some()
    }

    /// Messages held by `queue` until a consumer arrives.
    pub fn queued_count(&self, queue: &Address) -> usize {
        let mut queues = lock_ignore_poison(&self.queues);
        Self::live_queue(&mut queues, queue).map_or(0, |q| q.backlog.len())
    }

    /// The queue named `address`, after removing it if it was auto-deleted.
    fn live_queue<'a>(
        queues: &'a mut HashMap<Address, Queue>,
        address: &Address,
    ) -> Option<&'a mut Queue> {
        // ---
        let abandoned = match queues.get_mut(address) {
            None => return None,
            Some(queue) => {
                queue.prune();
                queue.abandoned()
            }
        };

        if abandoned {
            queues.remove(address);
            return None;
        }
        queues.get_mut(address)
    }

    fn delivery(&self, env: Envelope) -> Delivery {
        Delivery::new(
            env,
            Box::new(MemoryAcker {
                acked: Arc::clone(&self.acked),
            }),
        )
    }

    fn publish(&self, transport_id: &str, mut env: Envelope) {
        // ---
        let address = env.address.clone();
        let mut queues = lock_ignore_poison(&self.queues);

        let Some(queue) = Self::live_queue(&mut queues, &address) else {
            log_debug!("[{transport_id}] no queue {address}, message dropped");
            return;
        };

        while !queue.consumers.is_empty() {
            let idx = queue.next % queue.consumers.len();
            queue.next = queue.next.wrapping_add(1);

            match queue.consumers[idx].tx.send(self.delivery(env)) {
                Ok(()) => {
                    log_debug!("[{transport_id}] delivered to {address}");
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    // The consumer went away since the last prune.
                    env = returned.envelope;
                    queue.prune();
                }
            }
        }

        if queue.abandoned() {
            queues.remove(&address);
            log_debug!("[{transport_id}] queue {address} gone, message dropped");
        } else {
            queue.backlog.push_back(env);
            log_debug!("[{transport_id}] queued on {address} until a consumer arrives");
        }
    }

    fn declare(&self, transport_id: &str, queue: Address, opts: SubscribeOptions) {
        // ---
        let mut queues = lock_ignore_poison(&self.queues);
        if Self::live_queue(&mut queues, &queue).is_none() {
            log_debug!("[{transport_id}] declared {queue} ({opts:?})");
            queues.insert(queue, Queue::new(opts));
        }
    }

    fn subscribe(
        &self,
        owner: u64,
        transport_id: &str,
        queue: Address,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        // ---
        let mut queues = lock_ignore_poison(&self.queues);
        if Self::live_queue(&mut queues, &queue).is_none() {
            queues.insert(queue.clone(), Queue::new(opts));
        }
        let Some(entry) = queues.get_mut(&queue) else {
            return Err(RpcError::Transport(format!("queue {queue} vanished")));
        };

        if !entry.consumers.is_empty() && (entry.exclusive || opts.exclusive) {
            return Err(RpcError::Transport(format!(
                "queue {queue} is exclusive to another consumer"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if entry.consumers.is_empty() {
            entry.exclusive = opts.exclusive;
        }
        entry.consumed = true;

        let held = entry.backlog.len();
        for env in entry.backlog.drain(..) {
            // The receiver is alive until this function returns it.
            let _ = tx.send(self.delivery(env));
        }
        entry.consumers.push(Consumer { owner, tx });

        log_debug!("[{transport_id}] consuming {queue} ({opts:?}), {held} waiting");
        Ok(SubscriptionHandle { inbox: rx })
    }

    /// Drop every consumer registered by `owner`, closing their inboxes.
    fn release(&self, owner: u64) {
        let mut queues = lock_ignore_poison(&self.queues);
        for queue in queues.values_mut() {
            queue.consumers.retain(|c| c.owner != owner);
            queue.prune();
        }
        queues.retain(|_, q| !q.abandoned());
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            acked: Arc::new(AtomicUsize::new(0)),
            next_owner: AtomicU64::new(1),
        }
    }
}

struct MemoryAcker {
    acked: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory transport: one "connection" to a [`MemoryHub`].
struct MemoryTransport {
    // ---
    transport_id: String,
    owner: u64,
    hub: Arc<MemoryHub>,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Transport(format!(
                "memory transport {} is closed",
                self.transport_id
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        self.ensure_open()?;
        self.hub.publish(&self.transport_id, env);
        Ok(())
    }

    async fn declare(&self, queue: Address, opts: SubscribeOptions) -> Result<()> {
        self.ensure_open()?;
        self.hub.declare(&self.transport_id, queue, opts);
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: Address,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        self.ensure_open()?;
        self.hub
            .subscribe(self.owner, &self.transport_id, queue, opts)
    }

    /// Close the transport.
    ///
    /// Only this transport's consumers are removed; other transports on the
    /// same hub are unaffected.
    async fn close(&self) -> Result<()> {
        // ---
        if !self.closed.swap(true, Ordering::SeqCst) {
            log_debug!("[{}] closing memory transport", self.transport_id);
            self.hub.release(self.owner);
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.hub.release(self.owner);
    }
}

/// Create a new in-memory transport on the process-global hub.
///
/// All transports created with this function share one bus, like nodes
/// connected to the same broker. For isolated tests use
/// [`create_memory_transport_with_hub`].
pub fn create_memory_transport(transport_id: &str) -> TransportPtr {
    create_memory_transport_with_hub(transport_id, global_hub())
}

/// Create a new in-memory transport on the provided hub.
pub fn create_memory_transport_with_hub(transport_id: &str, hub: Arc<MemoryHub>) -> TransportPtr {
    // ---
    let owner = hub.next_owner.fetch_add(1, Ordering::SeqCst);
    log_debug!("[{transport_id}] create memory transport");

    Arc::new(MemoryTransport {
        transport_id: transport_id.to_string(),
        owner,
        hub,
        closed: AtomicBool::new(false),
    })
}
