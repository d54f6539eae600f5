//! Dashboard and operator surface.
//!
//! - `GET /ws?scope=endpoint:<id>` (or `?endpoint=<id>` / `?instance=<id>`):
//!   a WebSocket that first receives the current view of the scope, then every
//!   state update pushed to it.
//! - `GET /health`, `GET /api/endpoints`, `GET /api/scopes/{kind}/{id}`,
//!   `GET /api/connections`, `GET /api/metrics`.
//! - `POST /api/endpoints/{id}/connect`, `POST /api/endpoints/{id}/disconnect`,
//!   `POST /api/cleanup`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lib_fleet::SyncError;
use lib_fleet::SyncContext;
use lib_fleet::core::{Outbound, ScopeView};
use lib_fleet::model::Scope;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<SyncContext>,
    /// Cancelled when the server stops accepting; open sessions close on it.
    pub closing: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/endpoints", get(endpoints_handler))
        .route("/api/scopes/{kind}/{id}", get(scope_handler))
        .route("/api/connections", get(connections_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/api/endpoints/{id}/connect", post(connect_handler))
        .route("/api/endpoints/{id}/disconnect", post(disconnect_handler))
        .route("/api/cleanup", post(cleanup_handler))
        .with_state(state)
}

pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(&addr).await?;
    info!("Downstream server listening on {}", listener.local_addr()?);
    Ok(listener)
}

pub async fn run(
    listener: TcpListener,
    ctx: Arc<SyncContext>,
    shutdown: tokio_graceful::ShutdownGuard,
) -> std::io::Result<()> {
    let closing = CancellationToken::new();
    let app = router(AppState {
        ctx,
        closing: closing.clone(),
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Downstream server shutting down.");
            closing.cancel();
        })
        .await?;
    Ok(())
}

struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::UnknownEndpoint(_) | SyncError::UnknownInstance(_) => StatusCode::NOT_FOUND,
            SyncError::Configuration(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ScopeQuery {
    scope: Option<String>,
    endpoint: Option<String>,
    instance: Option<String>,
}

impl ScopeQuery {
    fn resolve(&self) -> Result<Scope, SyncError> {
        match (&self.scope, &self.endpoint, &self.instance) {
            (Some(s), None, None) => s.parse(),
            (None, Some(id), None) => Scope::from_parts("endpoint", id),
            (None, None, Some(id)) => Scope::from_parts("instance", id),
            _ => Err(SyncError::Configuration(
                "exactly one of scope, endpoint or instance is required".into(),
            )),
        }
    }
}

/// First frame of every session.
#[derive(Debug, Serialize)]
struct Snapshot {
    kind: &'static str,
    scope: String,
    data: Option<ScopeView>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ScopeQuery>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let scope = query.resolve()?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, scope)))
}

async fn handle_socket(socket: WebSocket, state: AppState, scope: Scope) {
    let ctx = &state.ctx;
    let mut sub = ctx.subscribe(scope.clone());
    let client_id = sub.id;
    info!("Client {} connected to {}", client_id, scope);

    let (mut sink, mut stream) = socket.split();

    let snapshot = Snapshot {
        kind: "snapshot",
        scope: scope.to_string(),
        data: ctx.get_by_scope(&scope),
    };
    if let Ok(text) = serde_json::to_string(&snapshot) {
        if sink.send(Message::Text(text.into())).await.is_err() {
            ctx.unsubscribe(client_id);
            return;
        }
    }

    loop {
        tokio::select! {
            _ = state.closing.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            outbound = sub.receiver.recv() => match outbound {
                Some(Outbound::Update(update)) => {
                    let Ok(text) = serde_json::to_string(update.as_ref()) else {
                        continue;
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break; // client disconnected
                    }
                }
                Some(Outbound::Ping) => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
                None => {
                    // Evicted as a slow consumer, timed out, or the hub stopped
                    debug!("Client {} dropped by the hub", client_id);
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => ctx.touch(client_id),
                Some(Err(e)) => {
                    warn!("Client {} socket error: {}", client_id, e);
                    break;
                }
            },
        }
    }

    ctx.unsubscribe(client_id);
    info!("Client {} disconnected", client_id);
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn endpoints_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.ctx.get_all())
}

async fn scope_handler(
    Path((kind, id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<ScopeView>, ApiError> {
    let scope = Scope::from_parts(&kind, &id)?;
    state.ctx.get_by_scope(&scope).map(Json).ok_or_else(|| {
        ApiError(match scope {
            Scope::Endpoint(id) => SyncError::UnknownEndpoint(id),
            Scope::Instance(id) => SyncError::UnknownInstance(id),
        })
    })
}

async fn connections_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.ctx.connection_statuses())
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.ctx.metrics())
}

async fn connect_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.ctx.connect(&id)?;
    info!("Operator connect for endpoint {}", id);
    Ok(StatusCode::ACCEPTED)
}

async fn disconnect_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.ctx.disconnect(&id, true)?;
    info!("Operator disconnect for endpoint {}", id);
    Ok(StatusCode::NO_CONTENT)
}

async fn cleanup_handler(State(state): State<AppState>) -> Response {
    match state.ctx.run_cleanup().await {
        Some(report) => Json(report).into_response(),
        None => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "a cleanup run is already in progress" })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(scope: Option<&str>, endpoint: Option<&str>, instance: Option<&str>) -> ScopeQuery {
        ScopeQuery {
            scope: scope.map(String::from),
            endpoint: endpoint.map(String::from),
            instance: instance.map(String::from),
        }
    }

    #[test]
    fn scope_query_accepts_each_spelling() {
        assert_eq!(
            query(Some("instance:i1"), None, None).resolve().unwrap(),
            Scope::Instance("i1".into())
        );
        assert_eq!(
            query(None, Some("e1"), None).resolve().unwrap(),
            Scope::Endpoint("e1".into())
        );
        assert_eq!(
            query(None, None, Some("i2")).resolve().unwrap(),
            Scope::Instance("i2".into())
        );
    }

    #[test]
    fn scope_query_rejects_ambiguity_and_garbage() {
        assert!(query(None, None, None).resolve().is_err());
        assert!(query(Some("endpoint:e1"), Some("e1"), None).resolve().is_err());
        assert!(query(Some("tenant:t1"), None, None).resolve().is_err());
        assert!(query(None, Some("  "), None).resolve().is_err());
    }

    #[test]
    fn unknown_ids_map_to_not_found() {
        let resp = ApiError(SyncError::UnknownEndpoint("e9".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = ApiError(SyncError::Configuration("bad".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
