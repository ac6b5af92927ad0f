//! Calls the `math_server` demo through a RabbitMQ broker.
//!
//! ```text
//! cargo run --example math_client
//! ```

use std::time::Duration;

use callme::{BrokerConfig, Proxy, RpcConfig, RpcError, RpcRequest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let config = RpcConfig::with_broker(BrokerConfig::from_env()?)
        .with_timeout(Duration::from_secs(5));

    let mut proxy = Proxy::connect(&config).await?;
    proxy.use_server("mathserver");

    let sum: i64 = proxy.call_as(RpcRequest::new("madd").arg(1).arg(1)).await?;
    println!("madd(1, 1) = {sum}");

    let diff: i64 = proxy.call_as(RpcRequest::new("msub").arg(10).arg(4)).await?;
    println!("msub(10, 4) = {diff}");

    let state: String = proxy
        .call_as(RpcRequest::new("examples.getStateName").arg("CA"))
        .await?;
    println!("examples.getStateName(\"CA\") = {state}");

    match proxy.call(RpcRequest::new("mdiv").arg(1.0).arg(0.0)).await {
        Err(RpcError::Remote(failure)) => println!("mdiv(1, 0) failed remotely: {failure}"),
        other => println!("mdiv(1, 0) = {other:?}"),
    }

    match proxy
        .call_to("nobody", RpcRequest::new("madd").arg(1).arg(1), Some(Duration::from_secs(1)))
        .await
    {
        Err(e) if e.is_timeout() => println!("call to a missing server: {e}"),
        other => println!("call to a missing server: {other:?}"),
    }

    proxy.close().await?;
    Ok(())
}
