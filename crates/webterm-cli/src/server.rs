//! WebSocket server for `webterm serve`.
//!
//! Each socket is one session: text frames are decoded into client events
//! and handed to [`Dispatcher::serve_connection`], server events come back
//! out as JSON text frames.

use std::future;
use std::io;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderValue, Method};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use webterm::session::MessagePayload;
use webterm::{ClientEvent, Config, Dispatcher, Health, ServerEvent, SessionId};

/// Buffered events between a connection and its socket writer
const OUTBOX_BUFFER: usize = 256;

#[derive(Clone)]
struct AppState {
    dispatcher: Dispatcher,
    port: Option<u16>,
    shutdown: CancellationToken,
    connections: TaskTracker,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
    client_id: Option<String>,
}

pub async fn serve(config: &Config) -> Result<()> {
    let dispatcher = Dispatcher::new(config).context("invalid language configuration")?;
    let server = &config.server;

    let listener = bind(&server.host, server.port, server.max_port_attempts).await?;
    let addr = listener.local_addr().context("failed to read bound address")?;

    let shutdown = CancellationToken::new();
    let connections = TaskTracker::new();
    let state = AppState {
        dispatcher: dispatcher.clone(),
        port: Some(addr.port()),
        shutdown: shutdown.clone(),
        connections: connections.clone(),
    };
    let app = router(state, &server.allowed_origins);

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    info!(%addr, languages = dispatcher.health().languages.len(), "Starting server");
    info!("WebSocket endpoint: ws://{addr}/ws");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("server error")?;

    // Upgraded sockets outlive the HTTP server; wait for their sessions to
    // cancel and clean up before the temp root goes away.
    connections.close();
    connections.wait().await;
    dispatcher.backend().workspaces.purge().await;
    info!("Server stopped");
    Ok(())
}

fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/ws", get(connect))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origin: AllowOrigin = if allowed_origins.iter().any(|origin| origin == "*") {
        Any.into()
    } else {
        allowed_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin, "ignoring invalid allowed origin");
                    None
                }
            })
            .collect::<Vec<_>>()
            .into()
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET])
        .allow_headers(Any)
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(state.dispatcher.health())
}

async fn connect(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
) -> impl IntoResponse {
    let tracked = state.connections.token();
    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, state, params.client_id).await;
        drop(tracked);
    })
}

async fn handle_socket(socket: WebSocket, state: AppState, client_id: Option<String>) {
    let session_id = SessionId::generate();
    let client_id = client_id.unwrap_or_else(|| session_id.to_string());
    let (mut sink, stream) = socket.split();
    let (outgoing, mut outbox) = mpsc::channel::<ServerEvent>(OUTBOX_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(event) = outbox.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode server event");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                debug!("socket closed while sending");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let rejects = outgoing.clone();
    let incoming = stream
        .take_until(state.shutdown.clone().cancelled_owned())
        .take_while(|frame| future::ready(!matches!(frame, Err(_) | Ok(Message::Close(_)))))
        .filter_map(move |frame| {
            let rejects = rejects.clone();
            async move {
                match decode_frame(frame.ok()?)? {
                    Ok(event) => Some(event),
                    Err(e) => {
                        debug!(error = %e, "undecodable client message");
                        let message = MessagePayload::new(format!("Invalid message: {e}"));
                        let _ = rejects.send(ServerEvent::Error(message)).await;
                        None
                    }
                }
            }
        });

    state
        .dispatcher
        .serve_connection(session_id, &client_id, state.port, incoming, outgoing)
        .await;

    if let Err(e) = writer.await {
        warn!(error = %e, "socket writer failed");
    }
}

/// Decode one frame; control frames yield `None`
fn decode_frame(message: Message) -> Option<Result<ClientEvent, serde_json::Error>> {
    match message {
        Message::Text(text) => Some(serde_json::from_str(text.as_str())),
        Message::Binary(bytes) => Some(serde_json::from_slice(&bytes)),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

/// Bind `host:port`, moving to the next port while the current one is taken
async fn bind(host: &str, port: u16, attempts: u16) -> Result<TcpListener> {
    let last = port.saturating_add(attempts.max(1) - 1);
    for candidate in port..=last {
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!(port = candidate, "port in use, trying the next one");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to bind {host}:{candidate}"));
            }
        }
    }
    anyhow::bail!("no free port between {port} and {last} on {host}")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
