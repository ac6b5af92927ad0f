//! AMQP transport implementation using `lapin`.
//!
//! This module provides an implementation of the `Transport` trait backed by
//! an AMQP 0-9-1 broker connection (RabbitMQ). It follows an **actor-based
//! concurrency model** around the AMQP channel.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the AMQP connection and channel.
//! - The actor publishes outbound messages, declares queues, starts and
//!   cancels consumers, and closes the connection.
//! - No other task issues channel operations, so the channel is never used
//!   concurrently even when many workers publish replies.
//! - Each consumer runs in its own task that forwards deliveries to the
//!   subscriber's inbox. Acknowledgment goes through the delivery's own acker.
//!
//! ## Message mapping
//!
//! | Envelope field   | AMQP                                        |
//! |------------------|---------------------------------------------|
//! | `address`        | routing key on the default exchange (= queue) |
//! | `payload`        | message body                                |
//! | `correlation_id` | `correlation_id` property                   |
//! | `reply_to`       | `reply_to` property                         |
//! | `content_type`   | `content_type` property                     |
//!
//! ## Queue lifecycle
//!
//! Queues are declared with the flags taken from [`SubscribeOptions`], either
//! through `declare()` or on first subscription. Consumers use explicit
//! acknowledgment. Dropping a [`SubscriptionHandle`] cancels its consumer,
//! which removes an auto-delete queue once it was its last consumer.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_lite::stream::StreamExt;
use lapin::{
    //
    acker::Acker as LapinAcker,
    options::{
        //
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    Consumer,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    Acker,
    Address,
    BrokerConfig,
    Delivery,
    Envelope,
    Result,
    RpcError,
    SubscribeOptions,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

//
// Actor commands
//

enum Cmd {
    //
    Publish {
        env: Envelope,
        resp: oneshot::Sender<Result<()>>,
    },
    Declare {
        queue: Address,
        opts: SubscribeOptions,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        queue: Address,
        opts: SubscribeOptions,
        inbox: mpsc::UnboundedSender<Delivery>,
        resp: oneshot::Sender<Result<()>>,
    },
    Cancel {
        consumer_tag: String,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// AMQP transport implementation using lapin.
struct AmqpTransport {
    // ---
    transport_id: String,
    cmd_tx: mpsc::Sender<Cmd>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpTransport {
    /// Spawns the actor that owns `connection` and `channel`.
    fn create(transport_id: &str, connection: Connection, channel: Channel) -> TransportPtr {
        // ---
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let actor = Actor {
            transport_id: transport_id.to_string(),
            connection,
            channel,
            cmd_rx,
            cmd_tx: cmd_tx.downgrade(),
            consumers: HashMap::new(),
            next_tag: 0,
        };

        let handle = tokio::spawn(actor.run());

        Arc::new(Self {
            transport_id: transport_id.to_string(),
            cmd_tx,
            actor: Mutex::new(Some(handle)),
        })
    }

    async fn send_cmd<T>(&self, cmd: Cmd, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        // ---
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| RpcError::Transport(format!("amqp actor command channel closed: {e}")))?;

        rx.await.map_err(|e| {
            RpcError::Transport(format!("amqp actor dropped the request: {e}"))
        })?
    }
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    transport_id: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    /// Handed to consumer tasks so they can request a cancel without keeping
    /// the actor alive.
    cmd_tx: mpsc::WeakSender<Cmd>,
    consumers: HashMap<String, JoinHandle<()>>,
    next_tag: u64,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_info!("[{}] AMQP actor started", self.transport_id);

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Cmd::Publish { env, resp } => {
                    let _ = resp.send(self.do_publish(env).await);
                }
                Cmd::Declare { queue, opts, resp } => {
                    let _ = resp.send(self.declare_queue(&queue, opts).await);
                }
                Cmd::Subscribe {
                    queue,
                    opts,
                    inbox,
                    resp,
                } => {
                    let _ = resp.send(self.do_subscribe(queue, opts, inbox).await);
                }
                Cmd::Cancel { consumer_tag } => {
                    self.do_cancel(consumer_tag).await;
                }
                Cmd::Close { resp } => {
                    let _ = resp.send(Ok(()));
                    break;
                }
            }
        }

        log_info!("[{}] AMQP actor shutting down", self.transport_id);

        for (_, handle) in self.consumers.drain() {
            handle.abort();
        }

        let _ = self.channel.close(200, "Normal shutdown".into()).await;
        let _ = self.connection.close(200, "Normal shutdown".into()).await;

        log_info!("[{}] AMQP actor stopped", self.transport_id);
    }

    async fn do_publish(&mut self, env: Envelope) -> Result<()> {
        // ---
        let mut props = BasicProperties::default();
        if let Some(id) = &env.correlation_id {
            props = props.with_correlation_id(id.to_string().into());
        }
        if let Some(reply_to) = &env.reply_to {
            props = props.with_reply_to(reply_to.as_str().into());
        }
        if let Some(content_type) = &env.content_type {
            props = props.with_content_type(content_type.to_string().into());
        }

        let queue = env.address.as_str();

        self.channel
            .basic_publish(
                "".into(),    // default exchange
                queue.into(), // routing key = queue name
                BasicPublishOptions::default(),
                &env.payload,
                props,
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: publish to {queue} failed: {e}")))?;

        log_debug!("[{}] published to {queue}", self.transport_id);
        Ok(())
    }

    async fn declare_queue(&mut self, queue: &Address, opts: SubscribeOptions) -> Result<()> {
        // ---
        let declare = QueueDeclareOptions {
            durable: opts.durable,
            exclusive: opts.exclusive,
            auto_delete: opts.auto_delete,
            ..QueueDeclareOptions::default()
        };

        self.channel
            .queue_declare(queue.as_str().into(), declare, FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: declare {queue} failed: {e}")))?;

        log_debug!("[{}] declared queue {queue} ({opts:?})", self.transport_id);
        Ok(())
    }

    async fn do_subscribe(
        &mut self,
        queue: Address,
        opts: SubscribeOptions,
        inbox: mpsc::UnboundedSender<Delivery>,
    ) -> Result<()> {
        // ---
        self.declare_queue(&queue, opts).await?;

        self.next_tag += 1;
        let consumer_tag = format!("{}-{}", self.transport_id, self.next_tag);

        let consume = BasicConsumeOptions {
            no_ack: false,
            exclusive: opts.exclusive,
            ..BasicConsumeOptions::default()
        };

        let consumer = self
            .channel
            .basic_consume(
                queue.as_str().into(),
                consumer_tag.as_str().into(),
                consume,
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: consume {queue} failed: {e}")))?;

        log_info!("[{}] consuming {queue} as {consumer_tag}", self.transport_id);

        let task = ConsumerTask {
            transport_id: self.transport_id.clone(),
            queue,
            consumer_tag: consumer_tag.clone(),
            cmd_tx: self.cmd_tx.clone(),
        };
        let handle = tokio::spawn(task.run(consumer, inbox));
        self.consumers.insert(consumer_tag, handle);

        Ok(())
    }

    async fn do_cancel(&mut self, consumer_tag: String) {
        // ---
        self.consumers.remove(&consumer_tag);

        match self
            .channel
            .basic_cancel(consumer_tag.as_str().into(), BasicCancelOptions::default())
            .await
        {
            Ok(_) => log_debug!("[{}] cancelled consumer {consumer_tag}", self.transport_id),
            Err(e) => log_warn!(
                "[{}] cancel of consumer {consumer_tag} failed: {e}",
                self.transport_id
            ),
        }
    }
}

/// Forwards one consumer's deliveries to its subscriber.
struct ConsumerTask {
    transport_id: String,
    queue: Address,
    consumer_tag: String,
    cmd_tx: mpsc::WeakSender<Cmd>,
}

impl ConsumerTask {
    async fn run(self, mut consumer: Consumer, inbox: mpsc::UnboundedSender<Delivery>) {
        // ---
        let transport_id = &self.transport_id;
        let queue = &self.queue;

        loop {
            let next = tokio::select! {
                _ = inbox.closed() => {
                    log_debug!("[{transport_id}] subscriber for {queue} dropped");
                    self.request_cancel().await;
                    break;
                }
                next = consumer.next() => next,
            };

            let mut delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    log_error!("[{transport_id}] consumer error on {queue}: {e}");
                    break;
                }
                None => {
                    log_info!("[{transport_id}] consumer stream ended for {queue}");
                    break;
                }
            };

            let props = &delivery.properties;
            let correlation_id = props.correlation_id().as_ref().map(|s| Arc::from(s.as_str()));
            let reply_to = props.reply_to().as_ref().map(|s| Address::from(s.as_str()));
            let content_type = props.content_type().as_ref().map(|s| Arc::from(s.as_str()));

            let envelope = Envelope {
                address: queue.clone(),
                payload: Bytes::from(std::mem::take(&mut delivery.data)),
                correlation_id,
                reply_to,
                content_type,
            };

            let acker = Box::new(AmqpAcker(delivery.acker.clone()));

            if inbox.send(Delivery::new(envelope, acker)).is_err() {
                // Unacked; the broker requeues it once the consumer is cancelled.
                self.request_cancel().await;
                break;
            }
        }
    }

    async fn request_cancel(&self) {
        if let Some(cmd_tx) = self.cmd_tx.upgrade() {
            let _ = cmd_tx
                .send(Cmd::Cancel {
                    consumer_tag: self.consumer_tag.clone(),
                })
                .await;
        }
    }
}

struct AmqpAcker(LapinAcker);

#[async_trait::async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| RpcError::Transport(format!("amqp: ack failed: {e}")))
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Cmd::Publish { env, resp: tx }, rx).await
    }

    async fn declare(&self, queue: Address, opts: SubscribeOptions) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Cmd::Declare { queue, opts, resp: tx }, rx).await
    }

    async fn subscribe(
        &self,
        queue: Address,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        // ---
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();

        self.send_cmd(
            Cmd::Subscribe {
                queue,
                opts,
                inbox: inbox_tx,
                resp: tx,
            },
            rx,
        )
        .await?;

        Ok(SubscriptionHandle { inbox: inbox_rx })
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Close { resp: tx }).await.is_ok() {
            let _ = rx.await;
        }

        if let Some(handle) = self.actor.lock().await.take() {
            let _ = handle.await;
        }

        Ok(())
    }
}

/// Creates a lapin-based AMQP transport.
///
/// The connection is established before this function returns.
///
/// # Errors
///
/// Returns [`RpcError::Transport`] if the broker cannot be reached, the
/// credentials are refused, or no channel can be opened.
pub async fn create_transport(broker: &BrokerConfig, transport_id: &str) -> Result<TransportPtr> {
    // ---
    let (connection, channel) = create_amqp_connection(broker, transport_id).await?;
    Ok(AmqpTransport::create(transport_id, connection, channel))
}

async fn create_amqp_connection(
    broker: &BrokerConfig,
    transport_id: &str,
) -> Result<(Connection, Channel)> {
    // ---
    let uri = broker.uri();

    log_info!(
        "[{transport_id}] connecting to AMQP broker {}:{} vhost {}",
        broker.host,
        broker.port,
        broker.vhost
    );

    let connection = Connection::connect(&uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!(
                "amqp: connection failed (is the broker up and does user '{}' have \
                 permissions on the vhost?): {e}",
                broker.user
            );
            log_error!("[{transport_id}] {msg}");
            RpcError::Transport(msg)
        })?;

    let channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("[{transport_id}] {msg}");
        RpcError::Transport(msg)
    })?;

    log_info!("[{transport_id}] connected, channel open");

    Ok((connection, channel))
}
