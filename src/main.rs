use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use junction::config::{Config, EchoMode};
use junction::handler::{Echo, EchoLine, Handler};
use junction::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let cfg = Config::load();

    let handler: Arc<dyn Handler> = match cfg.mode {
        EchoMode::Raw => Arc::new(Echo),
        EchoMode::Line => Arc::new(EchoLine),
    };
    tracing::info!(mode = ?cfg.mode, addr = %cfg.listen_addr, "starting echo server");

    let shutdown = CancellationToken::new();
    let server = Server::new(cfg.listen_addr.as_str(), handler).with_shutdown(shutdown.clone());

    let serving = tokio::spawn(async move { server.listen_and_serve().await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    shutdown.cancel();

    match cfg.shutdown_timeout {
        Some(t) => match tokio::time::timeout(t, serving).await {
            Ok(res) => res??,
            Err(_) => tracing::warn!("shutdown timed out with connections still draining"),
        },
        None => serving.await??,
    }

    Ok(())
}
