//! Server and proxy in one process on the in-memory transport. No broker
//! needed.
//!
//! ```text
//! cargo run --example math_memory
//! ```

use std::time::{Duration, Instant};

use callme::{DispatchMode, Proxy, RemoteFailure, RpcConfig, RpcRequest, Server};

async fn madd((a, b): (i64, i64)) -> Result<i64, RemoteFailure> {
    Ok(a + b)
}

async fn slow_square((n,): (i64,)) -> Result<i64, RemoteFailure> {
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(n * n)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = RpcConfig::memory()
        .with_dispatch(DispatchMode::Parallel)
        .with_timeout(Duration::from_secs(2));

    let server = Server::connect(&config, "fooserver").await?;
    server.register_fn(madd)?;
    server.register_fn(slow_square)?;

    let runner = server.clone();
    let task = tokio::spawn(async move { runner.start().await });
    server.wait_until_running().await?;

    let mut proxy = Proxy::connect(&config).await?;
    let sum: i64 = proxy
        .use_server("fooserver")
        .call_as(RpcRequest::new("madd").arg(1).arg(1))
        .await?;
    println!("madd(1, 1) = {sum}");

    // One proxy per concurrent caller.
    let started = Instant::now();
    let mut calls = Vec::new();
    for n in 1..=5 {
        let mut proxy = Proxy::connect(&config).await?;
        proxy.use_server("fooserver");
        calls.push(tokio::spawn(async move {
            proxy.call_as::<i64>(RpcRequest::new("slow_square").arg(n)).await
        }));
    }
    for call in calls {
        println!("slow_square -> {}", call.await??);
    }
    println!("five parallel calls took {:?}", started.elapsed());

    proxy.close().await?;
    server.stop().await;
    task.await??;

    Ok(())
}
