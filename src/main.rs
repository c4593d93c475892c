//! Gatehouse server entry point.
//!
//! # Responsibilities
//!
//! - Parse CLI arguments and environment variables (via Clap)
//! - Load configuration from file, environment, and CLI overrides
//! - Initialize logging and application state
//! - Open the store, applying migrations
//! - Start the public and admin HTTP servers

use clap::Parser;
use gatehouse::{config::GatehouseConfig, server::service, state::AppState};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::fmt;

/// CLI arguments definition for the gatehouse server.
///
/// Field documentation is used by Clap to generate help text, so keep them in
/// rustdoc format.
#[derive(Parser, Debug, Clone)]
#[command(name = "gatehouse", version, about = "OAuth 2.0 / OpenID Connect server", long_about = None)]
struct Args {
    /// Config file path (overrides default path and GATEHOUSE_CONFIG_PATH)
    #[arg(long = "config-file", value_name = "FILE", env = "GATEHOUSE_CONFIG_PATH")]
    config_file: Option<std::path::PathBuf>,

    /// Issuer URL override (optional)
    #[arg(long = "issuer", value_name = "URL", env = "GATEHOUSE_ISSUER")]
    issuer: Option<String>,

    /// Public listener bind address override (optional)
    #[arg(
        long = "public-bind-address",
        value_name = "PUBLIC_BIND_ADDRESS",
        env = "GATEHOUSE_PUBLIC_BIND_ADDRESS",
        required = false
    )]
    public_bind_address: Option<String>,

    /// Admin listener bind address override (optional)
    #[arg(
        long = "admin-bind-address",
        value_name = "ADMIN_BIND_ADDRESS",
        env = "GATEHOUSE_ADMIN_BIND_ADDRESS",
        required = false
    )]
    admin_bind_address: Option<String>,

    /// Development mode: relaxed cookie attributes, suffixed cookie names
    #[arg(long = "dev", env = "GATEHOUSE_DEV", required = false)]
    dev: Option<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(tracing_subscriber::filter::EnvFilter::new(env_filter))
        .init();

    let config = GatehouseConfig::load_with_overrides(
        args.config_file,
        args.issuer,
        args.public_bind_address,
        args.admin_bind_address,
        args.dev,
    )?;

    if config.dev {
        tracing::warn!("Development mode is enabled; cookies are not marked Secure");
    }

    let app = AppState::new(config)?;
    tracing::debug!("State initialized");

    match service::start(app).await {
        Ok(_) => tracing::debug!("Server has exited"),
        Err(e) => tracing::error!("Server execution failed: {:?}", e),
    }

    Ok(())
}
