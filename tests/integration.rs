// tests/integration.rs

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::json;
use tokio::task::JoinHandle;

use callme::{
    //
    create_memory_transport_with_hub,
    server_address,
    Address,
    CallArgs,
    Codec,
    CorrelationId,
    DispatchMode,
    Envelope,
    JsonCodec,
    MemoryHub,
    Proxy,
    RemoteFailure,
    Result,
    RpcConfig,
    RpcError,
    RpcRequest,
    Server,
    SubscribeOptions,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn madd((a, b): (i64, i64)) -> std::result::Result<i64, RemoteFailure> {
    Ok(a + b)
}

async fn snooze((millis,): (u64,)) -> std::result::Result<u64, RemoteFailure> {
    tokio::time::sleep(Duration::from_millis(millis)).await;
    Ok(millis)
}

/// A server running in its own task on a shared hub.
struct RunningServer {
    // ---
    server: Server,
    handle: JoinHandle<Result<()>>,
}

impl RunningServer {
    // ---
    fn create(hub: &Arc<MemoryHub>, server_id: &str, dispatch: DispatchMode) -> Server {
        let transport = create_memory_transport_with_hub(server_id, hub.clone());
        let config = RpcConfig::memory().with_dispatch(dispatch);
        Server::with_transport(transport, server_id, &config).expect("valid server id")
    }

    async fn start(server: Server) -> Result<Self> {
        // ---
        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.start().await });
        server.wait_until_running().await?;

        Ok(Self { server, handle })
    }

    async fn shutdown(self) -> Result<()> {
        // ---
        self.server.stop().await;

        // JoinError -> panic, inner Result -> ?
        self.handle.await.expect("server task panicked")?;
        Ok(())
    }
}

async fn proxy(hub: &Arc<MemoryHub>, name: &str) -> Result<Proxy> {
    let transport = create_memory_transport_with_hub(name, hub.clone());
    Proxy::with_transport(transport, &RpcConfig::memory()).await
}

#[tokio::test]
async fn test_end_to_end_madd() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = RunningServer::create(&hub, "fooserver", DispatchMode::Serial);
    server.register_fn(madd)?;
    let running = RunningServer::start(server).await?;

    let mut proxy = proxy(&hub, "client").await?;
    let value = proxy
        .call_to("fooserver", RpcRequest::new("madd").arg(1).arg(1), None)
        .await?;
    assert_eq!(value, json!(2));

    proxy.close().await?;
    running.shutdown().await
}

#[tokio::test]
async fn test_timeout_without_server() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let mut proxy = proxy(&hub, "client").await?;

    let started = Instant::now();
    let err = proxy
        .call_to("fooserver", RpcRequest::new("madd").arg(1).arg(1), Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout(), "expected timeout, got {err:?}");
    assert!(elapsed >= Duration::from_secs(1), "gave up early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "gave up late: {elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn test_wrong_arity_is_reported_and_server_survives() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = RunningServer::create(&hub, "fooserver", DispatchMode::Serial);
    server.register_fn(madd)?;
    let running = RunningServer::start(server).await?;

    let mut proxy = proxy(&hub, "client").await?;
    proxy.use_server("fooserver").use_timeout(Duration::from_secs(5));

    for bad in [
        RpcRequest::new("madd").arg(1).arg(2).arg(3),
        RpcRequest::new("madd").arg(1),
        RpcRequest::new("madd").arg("one").arg(2),
        RpcRequest::new("madd").arg(1).arg(1).kwarg("bogus", 5),
    ] {
        match proxy.call(bad).await {
            Err(RpcError::Remote(failure)) => {
                assert_eq!(failure.kind(), RemoteFailure::ARGUMENT_ERROR);
            }
            other => panic!("expected an argument failure, got {other:?}"),
        }
    }

    let sum: i64 = proxy.call_as(RpcRequest::new("madd").arg(2).arg(3)).await?;
    assert_eq!(sum, 5);

    running.shutdown().await
}

#[tokio::test]
async fn test_two_servers_are_never_swapped() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();

    let alpha = RunningServer::create(&hub, "alpha", DispatchMode::Serial);
    alpha.register("whoami", |_: CallArgs| async { Ok::<_, RemoteFailure>("alpha") })?;
    let alpha = RunningServer::start(alpha).await?;

    let beta = RunningServer::create(&hub, "beta", DispatchMode::Serial);
    beta.register("whoami", |_: CallArgs| async { Ok::<_, RemoteFailure>("beta") })?;
    let beta = RunningServer::start(beta).await?;

    let mut proxy = proxy(&hub, "client").await?;
    for _ in 0..5 {
        let a: String = proxy.use_server("alpha").call_as(RpcRequest::new("whoami")).await?;
        let b: String = proxy.use_server("beta").call_as(RpcRequest::new("whoami")).await?;
        assert_eq!(a, "alpha");
        assert_eq!(b, "beta");
    }

    alpha.shutdown().await?;
    beta.shutdown().await
}

#[tokio::test]
async fn test_sequential_calls_on_one_proxy() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = RunningServer::create(&hub, "fooserver", DispatchMode::Serial);
    server.register_fn(madd)?;
    server.register_typed("mmul", |(a, b): (i64, i64)| async move {
        Ok::<_, RemoteFailure>(a * b)
    })?;
    let running = RunningServer::start(server).await?;

    let mut proxy = proxy(&hub, "client").await?;

    let sum: i64 = proxy
        .use_server("fooserver")
        .use_timeout(Duration::from_secs(1))
        .call_as(RpcRequest::new("madd").arg(1).arg(2))
        .await?;
    let product: i64 = proxy.call_as(RpcRequest::new("mmul").arg(sum).arg(4)).await?;
    let again: i64 = proxy.call_as(RpcRequest::new("madd").arg(product).arg(0)).await?;

    assert_eq!((sum, product, again), (3, 12, 12));
    assert_eq!(proxy.timeout(), Duration::from_secs(1));

    running.shutdown().await
}

async fn five_concurrent_snoozes(hub: &Arc<MemoryHub>) -> Result<Duration> {
    // ---
    let mut proxies = Vec::new();
    for i in 0..5 {
        let mut proxy = proxy(hub, &format!("client-{i}")).await?;
        proxy.use_server("sleepy").use_timeout(Duration::from_secs(5));
        proxies.push(proxy);
    }

    let started = Instant::now();
    let calls: Vec<_> = proxies
        .into_iter()
        .map(|mut proxy| {
            tokio::spawn(async move { proxy.call_as::<u64>(RpcRequest::new("snooze").arg(100)).await })
        })
        .collect();

    for call in calls {
        assert_eq!(call.await.expect("call task panicked")?, 100);
    }

    Ok(started.elapsed())
}

#[tokio::test]
async fn test_parallel_dispatch_overlaps_calls() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = RunningServer::create(&hub, "sleepy", DispatchMode::Parallel);
    server.register_fn(snooze)?;
    let running = RunningServer::start(server).await?;

    let elapsed = five_concurrent_snoozes(&hub).await?;
    assert!(elapsed < Duration::from_millis(400), "calls did not overlap: {elapsed:?}");

    running.shutdown().await
}

#[tokio::test]
async fn test_serial_dispatch_runs_one_at_a_time() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = RunningServer::create(&hub, "sleepy", DispatchMode::Serial);
    server.register_fn(snooze)?;
    let running = RunningServer::start(server).await?;

    let elapsed = five_concurrent_snoozes(&hub).await?;
    assert!(elapsed >= Duration::from_millis(500), "calls overlapped: {elapsed:?}");

    running.shutdown().await
}

#[tokio::test]
async fn test_late_response_does_not_leak_into_next_call() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = RunningServer::create(&hub, "sleepy", DispatchMode::Parallel);
    server.register_fn(snooze)?;
    let running = RunningServer::start(server).await?;

    let mut proxy = proxy(&hub, "client").await?;
    proxy.use_server("sleepy");

    let err = proxy
        .call_to("sleepy", RpcRequest::new("snooze").arg(300), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // The 300 ms answer arrives while this call is waiting and is discarded.
    let value: u64 = proxy.call_as(RpcRequest::new("snooze").arg(400)).await?;
    assert_eq!(value, 400);

    running.shutdown().await
}

#[tokio::test]
async fn test_failures_are_values() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = RunningServer::create(&hub, "fooserver", DispatchMode::Serial);
    server.register_typed("fail", |(message,): (String,)| async move {
        Err::<(), _>(RemoteFailure::new("ValueError", message))
    })?;
    server.register("explode", |_: CallArgs| async {
        if true {
            panic!("boom");
        }
        Ok::<(), RemoteFailure>(())
    })?;
    server.register_fn(madd)?;
    let running = RunningServer::start(server).await?;

    let mut proxy = proxy(&hub, "client").await?;
    proxy.use_server("fooserver").use_timeout(Duration::from_secs(5));

    let err = proxy.call(RpcRequest::new("fail").arg("bad input")).await.unwrap_err();
    match err {
        RpcError::Remote(failure) => {
            assert_eq!(failure.kind(), "ValueError");
            assert_eq!(failure.message(), "bad input");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let err = proxy.call(RpcRequest::new("explode")).await.unwrap_err();
    assert!(matches!(&err, RpcError::Remote(f) if f.kind() == RemoteFailure::PANIC));

    let err = proxy.call(RpcRequest::new("nosuchfunction")).await.unwrap_err();
    assert!(matches!(&err, RpcError::Remote(f) if f.kind() == RemoteFailure::UNKNOWN_FUNCTION));
    assert!(!err.is_timeout());

    // Still serving.
    let sum: i64 = proxy.call_as(RpcRequest::new("madd").arg(20).arg(22)).await?;
    assert_eq!(sum, 42);

    running.shutdown().await
}

#[tokio::test]
async fn test_dotted_names_and_keyword_arguments() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = RunningServer::create(&hub, "fooserver", DispatchMode::Serial);
    server.register("examples.getStateName", |args: CallArgs| async move {
        let code: String = args.arg(0)?;
        let upper = args.kwarg::<bool>("upper")?.unwrap_or(false);
        let name = match code.as_str() {
            "CA" => "California",
            "NY" => "New York",
            _ => return Err(RemoteFailure::new("KeyError", code)),
        };
        Ok::<_, RemoteFailure>(if upper { name.to_uppercase() } else { name.to_string() })
    })?;
    let running = RunningServer::start(server).await?;

    let mut proxy = proxy(&hub, "client").await?;
    proxy.use_server("fooserver");

    let name: String = proxy
        .call_as(RpcRequest::new("examples.getStateName").arg("CA"))
        .await?;
    assert_eq!(name, "California");

    let name: String = proxy
        .call_as(RpcRequest::new("examples.getStateName").arg("NY").kwarg("upper", true))
        .await?;
    assert_eq!(name, "NEW YORK");

    let err = proxy
        .call(RpcRequest::new("examples").arg("CA"))
        .await
        .unwrap_err();
    assert!(matches!(&err, RpcError::Remote(f) if f.kind() == RemoteFailure::UNKNOWN_FUNCTION));

    running.shutdown().await
}

#[tokio::test]
async fn test_servers_sharing_an_id_compete() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();

    let first = RunningServer::create(&hub, "pool", DispatchMode::Serial);
    first.register("whoami", |_: CallArgs| async { Ok::<_, RemoteFailure>(1) })?;
    let first = RunningServer::start(first).await?;

    let second = RunningServer::create(&hub, "pool", DispatchMode::Serial);
    second.register("whoami", |_: CallArgs| async { Ok::<_, RemoteFailure>(2) })?;
    let second = RunningServer::start(second).await?;

    let mut proxy = proxy(&hub, "client").await?;
    proxy.use_server("pool");

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(proxy.call_as::<i64>(RpcRequest::new("whoami")).await?);
    }
    seen.sort();
    assert_eq!(seen, vec![1, 1, 2, 2]);

    first.shutdown().await?;
    second.shutdown().await
}

#[tokio::test]
async fn test_blocking_functions() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = RunningServer::create(&hub, "fooserver", DispatchMode::Parallel);
    server.register_blocking("fib", |(n,): (u32,)| {
        let (mut a, mut b) = (0u64, 1u64);
        for _ in 0..n {
            (a, b) = (b, a + b);
        }
        Ok::<_, RemoteFailure>(a)
    })?;
    let running = RunningServer::start(server).await?;

    let mut proxy = proxy(&hub, "client").await?;
    let fib: u64 = proxy
        .use_server("fooserver")
        .call_as(RpcRequest::new("fib").arg(50))
        .await?;
    assert_eq!(fib, 12_586_269_025);

    running.shutdown().await
}

#[tokio::test]
async fn test_idle_caller_does_not_stall_the_server() -> Result<()> {
    // ---
    init_logging();

    for (server_id, dispatch) in [
        ("serial_srv", DispatchMode::Serial),
        ("parallel_srv", DispatchMode::Parallel),
    ] {
        let hub = MemoryHub::new();
        let server = RunningServer::create(&hub, server_id, dispatch);
        server.register_fn(madd)?;
        let running = RunningServer::start(server).await?;

        // A caller that keeps its reply queue but never reads from it.
        let idle = create_memory_transport_with_hub("idle", hub.clone());
        let idle_queue = Address::from("client_idle_queue_1");
        let _unread = idle
            .subscribe(idle_queue.clone(), SubscribeOptions::reply_queue())
            .await?;

        let codec = JsonCodec::shared();
        let payload = codec.encode_request(&RpcRequest::new("madd").arg(1).arg(1))?;
        for _ in 0..200 {
            idle.publish(Envelope::request(
                server_address(server_id),
                payload.clone(),
                CorrelationId::generate().as_shared(),
                idle_queue.clone(),
                codec.content_type().into(),
            ))
            .await?;
        }

        let mut proxy = proxy(&hub, "client").await?;
        let sum: i64 = proxy
            .use_server(server_id)
            .use_timeout(Duration::from_secs(2))
            .call_as(RpcRequest::new("madd").arg(2).arg(2))
            .await?;
        assert_eq!(sum, 4, "{dispatch:?}");

        running.shutdown().await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_request_sent_before_start_is_served() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = RunningServer::create(&hub, "lateserver", DispatchMode::Serial);
    server.register_fn(madd)?;

    let mut proxy = proxy(&hub, "client").await?;
    let call = tokio::spawn(async move {
        proxy
            .call_to("lateserver", RpcRequest::new("madd").arg(1).arg(1), Some(Duration::from_secs(5)))
            .await
    });

    // The request waits in the declared queue.
    let queue = server_address("lateserver");
    tokio::time::timeout(Duration::from_secs(2), async {
        while hub.queued_count(&queue) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("request never reached the server queue");

    let running = RunningServer::start(server).await?;
    assert_eq!(call.await.expect("call task panicked")?, json!(2));

    running.shutdown().await
}

#[tokio::test]
async fn test_bad_requests_are_acked_and_dropped() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = RunningServer::create(&hub, "strict", DispatchMode::Serial);
    server.register_fn(madd)?;
    let running = RunningServer::start(server).await?;

    let client = create_memory_transport_with_hub("raw", hub.clone());
    let reply_queue = Address::from("client_raw_queue_1");
    let mut replies = client
        .subscribe(reply_queue.clone(), SubscribeOptions::reply_queue())
        .await?;

    let codec = JsonCodec::shared();
    let valid = codec.encode_request(&RpcRequest::new("madd").arg(1).arg(1))?;
    let request = |payload: Bytes, correlation_id: &str| {
        Envelope::request(
            server_address("strict"),
            payload,
            correlation_id.into(),
            reply_queue.clone(),
            codec.content_type().into(),
        )
    };

    let undecodable = request(Bytes::from_static(b"not a request"), "undecodable");
    let no_reply_to = Envelope {
        reply_to: None,
        ..request(valid.clone(), "no-reply-to")
    };
    let no_correlation = Envelope {
        correlation_id: None,
        ..request(valid.clone(), "unused")
    };

    for env in [undecodable, no_reply_to, no_correlation, request(valid, "good")] {
        client.publish(env).await?;
    }

    // Serial dispatch: the one reply comes after the bad requests were handled.
    let reply = tokio::time::timeout(Duration::from_secs(2), replies.inbox.recv())
        .await
        .expect("no reply to the valid request")
        .expect("reply subscription closed");
    assert_eq!(reply.envelope.correlation_id.as_deref(), Some("good"));
    assert_eq!(codec.decode_response(&reply.envelope.payload)?.into_result()?, json!(2));

    assert!(replies.inbox.try_recv().is_err(), "a bad request was answered");
    assert_eq!(hub.acked_count(), 4, "every request is acked, answered or not");

    running.shutdown().await
}
