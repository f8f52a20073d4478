//! relay-server: websocket hub for an end-to-end-encrypted chat.
//!
//! Holds live client connections, routes typed frames between them,
//! persists a delivery-tracked message log, and drives the friend
//! handshake. Ciphertext and rotation metadata pass through opaque.

mod config;
mod handlers;
mod registry;
mod server;
mod session;
mod sync;
#[cfg(test)]
mod test_util;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use config::ServerConfig;
use relay_store::{SqliteStore, Store};
use server::RelayServer;

/// relay-server — encrypted chat relay
#[derive(Parser, Debug)]
#[command(name = "relay-server", version, about = "Encrypted chat relay server")]
struct Cli {
    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.ratchet-relay/config.toml")]
    config: String,

    /// SQLite database path
    #[arg(long)]
    db: Option<String>,

    /// Hex-encoded token-signing secret
    #[arg(long)]
    token_secret: Option<String>,

    /// Token time-to-live in seconds
    #[arg(long)]
    session_ttl: Option<u64>,

    /// Mint a capability token for this identity and exit
    #[arg(long, value_name = "IDENTITY")]
    issue_token: Option<String>,

    /// Provision (or update) a user directory row and exit
    #[arg(long, value_name = "IDENTITY")]
    add_user: Option<String>,

    /// Display name for --add-user
    #[arg(long, default_value = "")]
    display_name: String,

    /// Avatar URL for --add-user
    #[arg(long, default_value = "")]
    avatar_url: String,

    /// Public key for --add-user
    #[arg(long, default_value = "")]
    public_key: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.bind.as_deref(),
        cli.port,
        cli.db.as_deref(),
        cli.token_secret.as_deref(),
        cli.session_ttl,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // Tooling path: mint a token against the configured secret.
    if let Some(identity) = cli.issue_token {
        let Some(secret) = server_config.token_secret.as_deref() else {
            error!("--issue-token requires a configured token secret");
            std::process::exit(1);
        };
        println!(
            "{}",
            relay_core::issue_token(secret, &identity, server_config.session_ttl)
        );
        return;
    }

    let store = match SqliteStore::open(&server_config.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "failed to open store");
            std::process::exit(1);
        }
    };

    // Tooling path: provision a directory row out-of-band.
    if let Some(identity) = cli.add_user {
        let user = relay_store::UserProfile {
            identity,
            display_name: cli.display_name,
            avatar_url: cli.avatar_url,
            public_key: cli.public_key,
        };
        if let Err(e) = store.upsert_user(user).await {
            error!(error = %e, "failed to provision user");
            std::process::exit(1);
        }
        info!("user provisioned");
        return;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = server_config.port,
        "starting relay-server"
    );

    let relay = Arc::new(RelayServer::new(server_config, store));

    tokio::select! {
        result = relay.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("relay-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
