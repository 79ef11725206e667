//! Connection handling
//!
//! [`Dispatcher`] drives one client connection from a stream of decoded
//! [`ClientEvent`]s to a channel of [`ServerEvent`]s. It knows nothing about
//! sockets, so the same code serves WebSocket clients, the CLI and tests.

use std::pin::pin;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, ConfigError};
use crate::session::{
    Backend, ClientEvent, ExecutionRequest, ExecutionSession, MessagePayload, PreferenceStore,
    ServerEvent, ServerInfo, SessionError, SessionEvent,
};
use crate::types::ExecutionResult;
use crate::workspace::SessionId;

/// Buffered events between a session and the connection writer
const EVENT_BUFFER: usize = 256;

/// Liveness report for health checks
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub languages: Vec<String>,
}

/// Shared entry point for every client connection
#[derive(Debug, Clone)]
pub struct Dispatcher {
    backend: Arc<Backend>,
    preferences: PreferenceStore,
    started: Instant,
}

impl Dispatcher {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            backend: Arc::new(Backend::new(config)?),
            preferences: PreferenceStore::new(),
            started: Instant::now(),
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn preferences(&self) -> &PreferenceStore {
        &self.preferences
    }

    /// Stateless liveness report
    pub fn health(&self) -> Health {
        Health {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.started.elapsed().as_secs(),
            languages: self.supported_languages(),
        }
    }

    /// Greeting sent to every new connection
    pub fn server_info(&self, port: Option<u16>) -> ServerInfo {
        ServerInfo {
            message: "Connected to webterm server".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            port,
            supported_languages: self.supported_languages(),
        }
    }

    fn supported_languages(&self) -> Vec<String> {
        self.backend
            .registry
            .list_supported()
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    /// Create a session that reports into `events`
    pub fn session(
        &self,
        id: SessionId,
        client_id: &str,
        events: mpsc::Sender<SessionEvent>,
    ) -> ExecutionSession {
        ExecutionSession::new(
            id,
            Arc::clone(&self.backend),
            self.preferences.handle(client_id),
            events,
        )
    }

    /// Serve one connection until `incoming` ends.
    ///
    /// `server-info` is sent first. When the client goes away the running
    /// execution is cancelled and the session directory is removed.
    #[instrument(skip_all, fields(session = %session_id, client = client_id))]
    pub async fn serve_connection<S>(
        &self,
        session_id: SessionId,
        client_id: &str,
        port: Option<u16>,
        incoming: S,
        outgoing: mpsc::Sender<ServerEvent>,
    ) where
        S: Stream<Item = ClientEvent>,
    {
        info!("client connected");
        let _ = outgoing
            .send(ServerEvent::ServerInfo(self.server_info(port)))
            .await;

        let (events, mut session_events) = mpsc::channel(EVENT_BUFFER);
        let session = self.session(session_id, client_id, events);

        // Session events go out in order on their own task so a long
        // execution never blocks reading `stop` from the client.
        let relay = {
            let outgoing = outgoing.clone();
            tokio::spawn(async move {
                while let Some(event) = session_events.recv().await {
                    if outgoing.send(event.into()).await.is_err() {
                        break;
                    }
                }
            })
        };

        let mut running: Option<JoinHandle<ExecutionResult>> = None;
        let mut incoming = pin!(incoming);

        while let Some(event) = incoming.next().await {
            match event {
                ClientEvent::Execute(payload) => {
                    if let Some(preferences) = payload.preferences {
                        session.preferences().set(preferences);
                    }
                    let request = ExecutionRequest::new(payload.code, payload.language);
                    match session.start(request) {
                        Ok(handle) => running = Some(handle),
                        Err(SessionError::Busy) => {
                            let busy = MessagePayload::new("An execution is already running");
                            let _ = outgoing.send(ServerEvent::Busy(busy)).await;
                        }
                    }
                }
                ClientEvent::Stop => {
                    if !session.cancel() {
                        debug!("stop received with nothing running");
                    }
                }
                ClientEvent::GetTemplate(extension) => {
                    let template = self
                        .backend
                        .registry
                        .template_for_extension(&extension)
                        .map(str::to_owned);
                    let _ = outgoing.send(ServerEvent::Template(template)).await;
                }
            }
        }

        info!("client disconnected");
        session.cancel();
        if let Some(handle) = running.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "execution task failed during teardown");
        }
        session.teardown().await;

        // Dropping the session closes the event channel and ends the relay
        drop(session);
        if let Err(e) = relay.await {
            warn!(error = %e, "event relay failed");
        }
    }
}
