use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthError, CredentialVerifier};
use crate::bridge::{HttpMemoBackend, MemoBackend};
use crate::config::ServerConfig;
use crate::handler::{ProtocolHandler, Session};
use crate::registry::SessionRegistry;

pub struct AppState {
    handler: ProtocolHandler,
    verifier: CredentialVerifier,
    outbound_buffer: usize,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        handler: ProtocolHandler,
        verifier: CredentialVerifier,
        outbound_buffer: usize,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            handler,
            verifier,
            outbound_buffer: outbound_buffer.max(1),
            metrics,
        }
    }

    /// Wires the HTTP backend, verifier and an empty registry from config.
    pub fn from_config(config: &ServerConfig, metrics: Option<PrometheusHandle>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.bridge_timeout)
            .build()
            .context("failed to build backend http client")?;
        let backend: Arc<dyn MemoBackend> = Arc::new(HttpMemoBackend::new(
            client,
            config.api_base_url.clone(),
            config.internal_service_token.clone(),
        ));
        let handler = ProtocolHandler::new(SessionRegistry::new(), backend, config.bridge_timeout);
        let verifier = CredentialVerifier::new(config.jwt_secret.as_bytes(), &config.auth_cookie);
        Ok(Self::new(
            handler,
            verifier,
            config.outbound_buffer,
            metrics,
        ))
    }

    pub fn registry(&self) -> &SessionRegistry {
        self.handler.registry()
    }

    fn stats(&self) -> StatsResponse {
        let mut connections: Vec<ConnectionStats> = self
            .registry()
            .connections()
            .into_iter()
            .map(|(identity, connection)| ConnectionStats {
                identity,
                connection_id: connection.id(),
                groups: connection.membership().groups(),
            })
            .collect();
        connections.sort_by(|a, b| a.identity.cmp(&b.identity));
        StatsResponse {
            active_connections: connections.len(),
            connections,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_connections: usize,
    connections: Vec<ConnectionStats>,
}

#[derive(Debug, Serialize)]
struct ConnectionStats {
    identity: String,
    connection_id: Uuid,
    groups: Vec<String>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Credentials are checked before the upgrade; a failed check still upgrades
/// so the peer receives a policy-violation close frame with a reason.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let verdict = state.verifier.authenticate(&headers);
    ws.on_upgrade(move |socket| handle_connection(socket, state, verdict))
}

async fn handle_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    verdict: Result<String, AuthError>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(state.outbound_buffer);
    let mut session = Session::new(outbound_tx);
    session.begin_authentication();

    let identity = match verdict {
        Ok(identity) => identity,
        Err(err) => {
            warn!(error = %err, "rejecting websocket handshake");
            let frame = state.handler.reject(&mut session, &err);
            if let Err(err) = ws_tx.send(Message::Close(Some(frame))).await {
                debug!(error = %err, "failed to deliver close frame");
            }
            return;
        }
    };

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_tx.send(frame).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let admission = state.handler.authenticate(&mut session, identity).await;
    info!(
        identity = %admission.identity(),
        connection_id = %admission.connection_id(),
        active = state.registry().len(),
        "connection authenticated"
    );

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => state.handler.handle_text(&session, &text).await,
            Ok(Message::Binary(bytes)) => state.handler.handle_binary(&session, &bytes).await,
            Ok(Message::Close(frame)) => {
                debug!(
                    identity = %admission.identity(),
                    code = frame.as_ref().map(|f| f.code),
                    "peer closed connection"
                );
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(identity = %admission.identity(), error = %err, "websocket read failed");
                break;
            }
        }
    }

    session.close();
    let identity = admission.identity().to_string();
    let connection_id = admission.connection_id();
    drop(admission);
    drop(session);
    writer.abort();
    info!(
        identity = %identity,
        connection_id = %connection_id,
        active = state.registry().len(),
        "connection closed"
    );
}
