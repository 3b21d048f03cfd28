//! WebSocket gateway server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use crate::auth::ConnectRequest;
use crate::config::GatewayConfig;
use crate::error::{ServerError, ServerResult};
use crate::handlers::{handle_client, RouteContext};
use crate::session::SessionRegistry;

/// Cloneable handle that stops a running [`GatewayServer`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Signal the serving loop to stop. Safe to call more than once and from
    /// any thread.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Gateway server fronting the media and control backends.
#[derive(Debug, Clone)]
pub struct GatewayServer {
    /// Server configuration.
    config: Arc<GatewayConfig>,
    /// Sessions opened on `/device`.
    registry: Arc<SessionRegistry>,
    /// Stop signal observed by the accept loop.
    shutdown: ShutdownHandle,
}

impl GatewayServer {
    /// Create a gateway server with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: GatewayConfig) -> ServerResult<Self> {
        config.validate()?;
        let (tx, _rx) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
        })
    }

    /// Get the server configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Get access to the session registry.
    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Handle for stopping the server from elsewhere.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Trigger server shutdown.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Bind the configured address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::BindFailed`] if the address cannot be bound.
    pub async fn bind(&self) -> ServerResult<TcpListener> {
        let addr = self.config.bind_target();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::BindFailed { addr, source })
    }

    /// Bind the configured address and serve until shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn run_forever(&self) -> ServerResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections on an already bound listener until shut down.
    ///
    /// On shutdown open connections get `shutdown_grace` to close on their
    /// own; whatever is left is aborted.
    ///
    /// # Errors
    ///
    /// Currently infallible once the listener exists.
    pub async fn serve(&self, listener: TcpListener) -> ServerResult<()> {
        let mut shutdown_rx = self.shutdown.tx.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return Ok(());
        }

        let local = listener.local_addr().ok();
        info!(
            addr = ?local,
            media_backend = %self.config.media_backend_url,
            control_backend = %self.config.control_backend_url,
            token_required = self.config.token_required(),
            "Gateway server listening"
        );

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            while connections.try_join_next().is_some() {}
                            if connections.len() >= self.config.max_connections {
                                warn!(
                                    peer = %peer,
                                    max = self.config.max_connections,
                                    "Connection rejected: max connections reached"
                                );
                                continue;
                            }
                            let ctx = RouteContext {
                                config: Arc::clone(&self.config),
                                registry: Arc::clone(&self.registry),
                                shutdown: self.shutdown.tx.subscribe(),
                            };
                            let ws_config = self.config.websocket_config();
                            connections.spawn(serve_connection(stream, peer, ctx, ws_config));
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        drop(listener);
        self.drain(&mut connections).await;
        info!("Gateway server stopped");
        Ok(())
    }

    /// Wait for open connections to wind down, then abort stragglers and
    /// close the sessions they leave behind.
    async fn drain(&self, connections: &mut JoinSet<()>) {
        let grace = self.config.shutdown_grace;
        let finished = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if finished.is_ok() {
            return;
        }

        warn!(
            remaining = connections.len(),
            grace_ms = grace.as_millis() as u64,
            "Connections still open after shutdown grace, aborting"
        );
        connections.shutdown().await;
        for session in self.registry.list_sessions() {
            self.registry.close_session(&session.session_id);
            debug!(session = %session.session_id, "Session closed after abort");
        }
    }
}

/// Complete the WebSocket handshake and run the route handler.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: RouteContext,
    ws_config: WebSocketConfig,
) {
    let mut captured: Option<ConnectRequest> = None;
    let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        captured = Some(ConnectRequest::from_http(req));
        Ok(resp)
    };

    let ws = match accept_hdr_async_with_config(stream, capture, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let request = captured.unwrap_or_default();
    debug!(peer = %peer, path = %request.path, "WebSocket connection established");

    match handle_client(ws, request, ctx).await {
        Ok(()) => debug!(peer = %peer, "Connection closed normally"),
        Err(e) => debug!(peer = %peer, error = %e, "Connection ended with error"),
    }
}
