//! Core server: accepts TCP connections, authorizes the websocket
//! upgrade, and hands each accepted stream to a session loop.
//!
//! The capability token travels as a `token` query parameter on the
//! upgrade request; a missing, malformed, or expired token refuses the
//! handshake with HTTP 401 before any frame is exchanged.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use relay_core::{validate_token, Claims, RelayError, RelayResult};
use relay_store::Store;

use crate::config::ServerConfig;
use crate::handlers::FrameRouter;
use crate::registry::ConnectionRegistry;
use crate::session;

/// The relay server instance: configuration, token secret, and the
/// router shared by all session loops.
pub struct RelayServer {
    config: ServerConfig,
    secret: Vec<u8>,
    router: Arc<FrameRouter>,
}

impl RelayServer {
    /// Create a server over an injected store. Without a configured
    /// token secret an ephemeral one is generated, which invalidates
    /// all outstanding tokens on restart.
    pub fn new(config: ServerConfig, store: Arc<dyn Store>) -> Self {
        let secret = match &config.token_secret {
            Some(secret) => secret.clone(),
            None => {
                warn!("no token secret configured, generating an ephemeral one");
                relay_core::generate_secret()
            }
        };

        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(FrameRouter::new(registry, store));

        Self {
            config,
            secret,
            router,
        }
    }

    pub fn router(&self) -> &Arc<FrameRouter> {
        &self.router
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> RelayResult<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind, self.config.port)
            .parse()
            .map_err(|e| RelayError::Other(format!("invalid listen address: {e}")))?;
        let listener = TcpListener::bind(addr).await?;

        info!(addr = %addr, "relay server ready");
        self.serve_on(listener).await
    }

    /// Accept loop over an already-bound listener. Each connection gets
    /// its own task; a failed handshake never affects the others.
    pub async fn serve_on(self: Arc<Self>, listener: TcpListener) -> RelayResult<()> {
        loop {
            let (stream, remote) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote).await {
                    debug!(remote = %remote, error = %e, "connection ended");
                }
            });
        }
    }

    /// Authorize and upgrade one TCP stream, then run its session loop.
    async fn handle_connection(&self, stream: TcpStream, remote: SocketAddr) -> RelayResult<()> {
        let mut claims: Option<Claims> = None;

        let callback = |request: &Request, response: Response| {
            match authorize_upgrade(&self.secret, request) {
                Ok(validated) => {
                    claims = Some(validated);
                    Ok(response)
                }
                Err(e) => {
                    warn!(remote = %remote, error = %e, "refusing websocket upgrade");
                    let mut refusal = ErrorResponse::new(Some("invalid or expired token".into()));
                    *refusal.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(refusal)
                }
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let claims = claims
            .ok_or_else(|| RelayError::Unauthorized("upgrade accepted without claims".into()))?;

        info!(remote = %remote, identity = %claims.identity, "websocket upgrade authorized");
        session::run_session(self.router.clone(), ws, claims).await;
        Ok(())
    }
}

/// Validate the `token` query parameter of the upgrade request.
fn authorize_upgrade(secret: &[u8], request: &Request) -> RelayResult<Claims> {
    let token = request
        .uri()
        .query()
        .and_then(token_from_query)
        .ok_or_else(|| RelayError::Unauthorized("missing token".into()))?;

    validate_token(secret, token)
}

fn token_from_query(query: &str) -> Option<&str> {
    query.split('&').find_map(|pair| pair.strip_prefix("token="))
}
