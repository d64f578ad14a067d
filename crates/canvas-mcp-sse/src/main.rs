use std::sync::Arc;

use canvas_mcp_sse::{CanvasClient, SseServer, canvas_server_factory, config::Cli};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout is left alone, logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let probe = Arc::new(CanvasClient::new(&cli.credentials())?);
    let config = cli.into_server_config();
    let api_key_enabled = config.api_key.is_some();
    let ct_signal = config.ct.clone();

    let sse_server = SseServer::serve_with_config(config, canvas_server_factory, probe).await?;
    let bind_addr = sse_server.config.bind;
    tracing::info!("listening on http://{bind_addr}");
    tracing::info!("sse endpoint: http://{bind_addr}{}", sse_server.config.sse_path);
    tracing::info!("health check: http://{bind_addr}/health");
    if api_key_enabled {
        tracing::info!("api key authentication enabled");
    }

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        tracing::info!("shutting down");
        ct_signal.cancel();
    });

    sse_server.waiting().await?;
    tracing::info!("server stopped");
    Ok(())
}
