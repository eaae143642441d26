use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (CHATTR_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("CHATTR_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("chattr_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = chattr_server::config::ServerConfig::parse();
    tracing::info!("Starting chat server on {}", config.listen_addr);
    if config.companion {
        tracing::info!("Companion enabled as {}", config.companion_name);
    }
    if config.admin_token.is_none() {
        tracing::warn!("No admin token configured; admin API disabled");
    }

    chattr_server::server::Server::new(config).run().await
}
