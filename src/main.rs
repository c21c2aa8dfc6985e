use std::time::Duration;

use cancelable_rpc::{config::Config, logging, CallContext, CancellationToken, RpcError, Server, Service};
use serde::Deserialize;
use tracing::{info, warn};

const SLOW_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
struct SlowParams {
    message: String,
    millis: u64,
}

fn echo_service() -> Service {
    Service::new()
        .method("Echo", |_ctx: CallContext, input: serde_json::Value| async move {
            Ok::<_, RpcError>(input)
        })
        .method("Slow", |ctx: CallContext, params: SlowParams| async move {
            info!(request_id = %ctx.request_id(), millis = params.millis, "slow call started");
            let mut remaining = Duration::from_millis(params.millis);
            while !remaining.is_zero() {
                let step = remaining.min(SLOW_CHECK_INTERVAL);
                tokio::select! {
                    _ = ctx.cancelled() => {
                        info!(request_id = %ctx.request_id(), "slow call canceled");
                        return Err(RpcError::Canceled);
                    }
                    _ = tokio::time::sleep(step) => remaining -= step,
                }
            }
            Ok(params.message)
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let bind_socket = config.bind_socket()?;

    let mut server = Server::with_config(config);
    server.register_name("Echo", echo_service())?;

    let listener = tokio::net::TcpListener::bind(bind_socket).await?;
    info!(bind = %bind_socket, methods = ?server.methods(), "server starting");

    let root = CancellationToken::new();
    tokio::spawn({
        let root = root.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested");
                    root.cancel();
                }
                Err(err) => warn!(error = %err, "failed to listen for ctrl-c"),
            }
        }
    });

    server.accept(root, listener).await;
    Ok(())
}
