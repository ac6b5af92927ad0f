//! Math server on a RabbitMQ broker.
//!
//! ```text
//! CALLME_AMQP_HOST=localhost cargo run --example math_server
//! ```
//!
//! Broker settings come from `CALLME_AMQP_*` (see `BrokerConfig::from_env`).
//! Stop with Ctrl-C.

use callme::{BrokerConfig, CallArgs, DispatchMode, RemoteFailure, RpcConfig, Server};

async fn madd((a, b): (i64, i64)) -> Result<i64, RemoteFailure> {
    Ok(a + b)
}

async fn msub((a, b): (i64, i64)) -> Result<i64, RemoteFailure> {
    Ok(a - b)
}

async fn mdiv((a, b): (f64, f64)) -> Result<f64, RemoteFailure> {
    if b == 0.0 {
        return Err(RemoteFailure::new("ZeroDivisionError", "division by zero"));
    }
    Ok(a / b)
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

    let config = RpcConfig::with_broker(BrokerConfig::from_env()?)
        .with_dispatch(DispatchMode::Parallel);

    let server = Server::connect(&config, "mathserver").await?;
    server.register_fn(madd)?;
    server.register_fn(msub)?;
    server.register_fn(mdiv)?;
    server.register("examples.getStateName", |args: CallArgs| async move {
        let code: String = args.arg(0)?;
        match code.as_str() {
            "CA" => Ok("California"),
            "NY" => Ok("New York"),
            "TX" => Ok("Texas"),
            _ => Err(RemoteFailure::new("KeyError", code)),
        }
    })?;

    let runner = server.clone();
    let task = tokio::spawn(async move { runner.start().await });

    tokio::signal::ctrl_c().await?;
    println!("ctrl-c received, stopping");

    server.stop().await;
    task.await??;

    Ok(())
}
