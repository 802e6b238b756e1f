use anyhow::Context;

use chat_relay::config::{QueueBacking, RelayConfig};
use chat_relay::logging;
use chat_relay::service::{RelayService, ServiceDeps};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("Invalid configuration")?;
    let _log_guard = logging::init_logging(config.log_dir.as_deref())?;

    eprintln!("💬 Chat Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   HTTP: http://0.0.0.0:{}/api", config.port);
    eprintln!("   WS:   ws://0.0.0.0:{}/ws", config.port);
    eprintln!("   Upstream: {}", config.upstream.endpoint());
    eprintln!("   Database: {}", config.db_path.display());
    match &config.queue {
        QueueBacking::Memory => eprintln!("   Queue: in-memory"),
        QueueBacking::LibSql(path) => eprintln!("   Queue journal: {}", path.display()),
    }
    eprintln!("   Tokens: {} configured\n", config.api_tokens.len());

    let deps = ServiceDeps::from_config(&config)
        .await
        .context("Failed to open relay dependencies")?;
    let service = RelayService::start(&config, deps)
        .await
        .context("Failed to start relay")?;

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Chat relay listening");

    axum::serve(listener, service.app())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("Server error")?;

    service.shutdown().await;
    Ok(())
}
