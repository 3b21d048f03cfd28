//! Per-connection route handlers.
//!
//! Every client is authenticated first, then routed by path:
//!
//! - `/health` answers once and closes
//! - `/device` pipes the client to the media backend in both directions
//! - `/control` forwards each text message to the control backend over a
//!   fresh connection and acknowledges the result

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, StreamExt};
use sisi_proto::{extract_control_type, is_control_payload, now_ms, GatewayMessage};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async_with_config, WebSocketStream};
use tracing::{debug, info, warn};

use crate::auth::{authorize, ConnectRequest};
use crate::config::GatewayConfig;
use crate::error::{ServerError, ServerResult};
use crate::session::SessionRegistry;

/// Device ID used when the query omits one.
pub const DEFAULT_DEVICE_ID: &str = "unknown_device";

/// Ack reason for binary frames on `/control`.
pub const CONTROL_TEXT_ONLY: &str = "control_lane_text_only";

/// Close reason for paths other than the known routes.
pub const UNKNOWN_ROUTE: &str = "unknown_route";

/// Close reason when the media backend cannot be reached.
pub const MEDIA_BACKEND_UNAVAILABLE: &str = "media_backend_unavailable";

/// Capacity of the per-connection outbound queue.
const OUTBOUND_QUEUE: usize = 256;

/// An accepted client WebSocket.
pub type ClientSocket = WebSocketStream<TcpStream>;

/// Gateway routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// `/health` probe.
    Health,
    /// `/device` media pipe.
    Device,
    /// `/control` message forwarding.
    Control,
    /// Anything else.
    Unknown,
}

impl Route {
    /// Resolve a request path.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        match path {
            "/health" => Self::Health,
            "/device" => Self::Device,
            "/control" => Self::Control,
            _ => Self::Unknown,
        }
    }
}

/// Shared state handed to every connection.
#[derive(Debug, Clone)]
pub struct RouteContext {
    /// Gateway configuration.
    pub config: Arc<GatewayConfig>,
    /// Session registry.
    pub registry: Arc<SessionRegistry>,
    /// Server shutdown signal; open routes wind down when it flips.
    pub shutdown: watch::Receiver<bool>,
}

/// Authenticate and serve one client until it disconnects.
pub async fn handle_client(
    mut ws: ClientSocket,
    request: ConnectRequest,
    ctx: RouteContext,
) -> ServerResult<()> {
    let decision = authorize(&ctx.config.access_token, &request);
    if !decision.is_allowed() {
        info!(path = %request.path, reason = decision.reason(), "client rejected");
        reject(&mut ws, decision.reason()).await;
        return Ok(());
    }

    match Route::from_path(&request.path) {
        Route::Health => {
            send_message(&mut ws, &GatewayMessage::health()).await?;
            close_with(&mut ws, CloseCode::Normal, "ok").await;
            Ok(())
        }
        Route::Device => handle_device(ws, &request, &ctx).await,
        Route::Control => handle_control(ws, &request, &ctx).await,
        Route::Unknown => {
            debug!(path = %request.path, "unknown route");
            reject(&mut ws, UNKNOWN_ROUTE).await;
            Ok(())
        }
    }
}

/// Query value, or `default` when absent or blank.
fn query_or(request: &ConnectRequest, key: &str, default: impl FnOnce() -> String) -> String {
    request
        .query_param(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(default, str::to_string)
}

fn session_identity(request: &ConnectRequest) -> (String, String) {
    let device_id = query_or(request, "device_id", || DEFAULT_DEVICE_ID.to_string());
    let session_id = query_or(request, "session_id", || uuid::Uuid::new_v4().to_string());
    (device_id, session_id)
}

async fn send_message<S>(sink: &mut S, msg: &GatewayMessage) -> ServerResult<()>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    sink.send(WsMessage::Text(msg.to_json()?)).await?;
    Ok(())
}

async fn close_with(ws: &mut ClientSocket, code: CloseCode, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Owned(reason.to_string()),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!(error = %e, "close failed");
    }
}

/// Send a `gateway_error` and close with a policy violation.
async fn reject(ws: &mut ClientSocket, reason: &str) {
    if let Err(e) = send_message(ws, &GatewayMessage::gateway_error(reason)).await {
        debug!(error = %e, "failed to send gateway error");
    }
    close_with(ws, CloseCode::Policy, reason).await;
}

// ==================== /device ====================

async fn handle_device(
    ws: ClientSocket,
    request: &ConnectRequest,
    ctx: &RouteContext,
) -> ServerResult<()> {
    let (device_id, session_id) = session_identity(request);
    ctx.registry.open_session(&session_id, &device_id, None, None);
    info!(session = %session_id, device = %device_id, "device session opened");

    let result = run_device_pipe(ws, &session_id, &device_id, ctx).await;

    ctx.registry.close_session(&session_id);
    info!(session = %session_id, device = %device_id, "device session closed");
    result
}

async fn run_device_pipe(
    mut ws: ClientSocket,
    session_id: &str,
    device_id: &str,
    ctx: &RouteContext,
) -> ServerResult<()> {
    send_message(
        &mut ws,
        &GatewayMessage::gateway_session(session_id, device_id, now_ms()),
    )
    .await?;

    let url = ctx.config.media_backend_url.as_str();
    let backend = match connect_async_with_config(url, Some(ctx.config.websocket_config()), false)
        .await
    {
        Ok((backend, _)) => backend,
        Err(e) => {
            warn!(backend = %url, error = %e, "media backend connect failed");
            close_with(&mut ws, CloseCode::Error, MEDIA_BACKEND_UNAVAILABLE).await;
            return Err(ServerError::BackendUnavailable {
                url: url.to_string(),
                reason: e.to_string(),
            });
        }
    };

    let (client_sink, mut client_stream) = ws.split();
    let (mut backend_sink, mut backend_stream) = backend.split();
    let (out_tx, out_rx) = mpsc::channel::<WsMessage>(OUTBOUND_QUEUE);
    let ack_tx = out_tx.clone();
    let registry = ctx.registry.as_ref();
    let backend_out = &mut backend_sink;
    let mut shutdown = ctx.shutdown.clone();

    let client_to_backend = async move {
        while let Some(msg) = client_stream.next().await {
            let msg = msg?;
            match msg {
                WsMessage::Text(text) => {
                    registry.touch(session_id, None);
                    let control_type =
                        is_control_payload(&text).then(|| extract_control_type(&text));
                    backend_out.send(WsMessage::Text(text)).await?;
                    if let Some(control_type) = control_type {
                        let ack = GatewayMessage::control_ack(
                            true,
                            session_id,
                            device_id,
                            &control_type,
                            None,
                            Some(now_ms()),
                        );
                        ack_tx
                            .send(WsMessage::Text(ack.to_json()?))
                            .await
                            .map_err(|_| ServerError::ConnectionClosed)?;
                    }
                }
                WsMessage::Binary(data) => {
                    registry.touch(session_id, None);
                    backend_out.send(WsMessage::Binary(data)).await?;
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        Ok::<(), ServerError>(())
    };

    let backend_to_client = async move {
        while let Some(msg) = backend_stream.next().await {
            let msg = msg?;
            match msg {
                WsMessage::Text(_) | WsMessage::Binary(_) => {
                    registry.touch(session_id, None);
                    out_tx
                        .send(msg)
                        .await
                        .map_err(|_| ServerError::ConnectionClosed)?;
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        Ok::<(), ServerError>(())
    };

    // The first pump to finish ends the pipe. Dropping both pumps drops
    // every queue sender, so the writer flushes what is queued and closes.
    let pumps = async move {
        tokio::select! {
            r = client_to_backend => ("client_to_backend", r),
            r = backend_to_client => ("backend_to_client", r),
            () = shutdown_requested(&mut shutdown) => ("shutdown", Ok(())),
        }
    };
    let writer = write_client(client_sink, out_rx, ctx.config.ping_interval);
    let ((direction, outcome), written) = tokio::join!(pumps, writer);

    if let Err(e) = backend_sink.close().await {
        debug!(session = %session_id, error = %e, "media backend close failed");
    }
    match outcome {
        Ok(()) => debug!(session = %session_id, direction, "device pipe finished"),
        Err(e) => warn!(session = %session_id, direction, error = %e, "device pipe ended with error"),
    }
    if let Err(e) = written {
        debug!(session = %session_id, error = %e, "device writer ended early");
    }
    Ok(())
}

/// Sole writer to a `/device` client. Sends queued messages and keep-alive
/// pings until every sender is gone, then closes the client normally.
async fn write_client<S>(
    mut sink: S,
    mut out_rx: mpsc::Receiver<WsMessage>,
    ping_interval: Duration,
) -> ServerResult<()>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let mut ping = (!ping_interval.is_zero()).then(|| {
        let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            biased;
            msg = out_rx.recv() => match msg {
                Some(msg) => sink.send(msg).await?,
                None => break,
            },
            () = next_ping(&mut ping) => sink.send(WsMessage::Ping(Vec::new())).await?,
        }
    }

    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Borrowed(""),
    };
    // Fails harmlessly when the client already started the close handshake.
    if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
        debug!(error = %e, "client close frame not sent");
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "client close flush failed");
    }
    Ok(())
}

async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Resolves once the server has been asked to shut down.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ==================== /control ====================

async fn handle_control(
    mut ws: ClientSocket,
    request: &ConnectRequest,
    ctx: &RouteContext,
) -> ServerResult<()> {
    let (device_id, session_id) = session_identity(request);
    info!(session = %session_id, device = %device_id, "control lane opened");

    let mut shutdown = ctx.shutdown.clone();
    loop {
        let msg = tokio::select! {
            msg = ws.next() => msg,
            () = shutdown_requested(&mut shutdown) => {
                close_with(&mut ws, CloseCode::Away, "gateway_shutdown").await;
                break;
            }
        };
        let Some(msg) = msg else {
            break;
        };
        let ack = match msg? {
            WsMessage::Text(text) => {
                let control_type = extract_control_type(&text);
                match forward_control(&ctx.config, text).await {
                    Ok(()) => GatewayMessage::control_ack(
                        true,
                        session_id.as_str(),
                        device_id.as_str(),
                        &control_type,
                        None,
                        Some(now_ms()),
                    ),
                    Err(reason) => GatewayMessage::control_ack(
                        false,
                        session_id.as_str(),
                        device_id.as_str(),
                        &control_type,
                        Some(&reason),
                        Some(now_ms()),
                    ),
                }
            }
            WsMessage::Binary(_) => GatewayMessage::control_ack(
                false,
                session_id.as_str(),
                device_id.as_str(),
                "unknown",
                Some(CONTROL_TEXT_ONLY),
                Some(now_ms()),
            ),
            WsMessage::Close(_) => break,
            _ => continue,
        };
        send_message(&mut ws, &ack).await?;
    }

    info!(session = %session_id, device = %device_id, "control lane closed");
    Ok(())
}

/// Deliver one payload to the control backend over a short-lived connection.
///
/// On failure the returned reason is `forward_failed:<error>`.
pub async fn forward_control(config: &GatewayConfig, payload: String) -> Result<(), String> {
    let url = config.control_backend_url.as_str();
    let connect = connect_async_with_config(url, Some(config.websocket_config()), false);

    let result = match timeout(config.control_connect_timeout, connect).await {
        Ok(Ok((mut backend, _))) => {
            let sent = backend.send(WsMessage::Text(payload)).await;
            if let Err(e) = backend.close(None).await {
                debug!(error = %e, "control backend close failed");
            }
            sent.map_err(|e| e.to_string())
        }
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("connect timed out".to_string()),
    };

    result.map_err(|e| {
        warn!(backend = %url, error = %e, "control forward failed");
        format!("forward_failed:{e}")
    })
}
