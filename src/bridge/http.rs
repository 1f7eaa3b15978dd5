//! HTTP surface for field nodes.

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::registry::{NodeInfo, NodeRegistry, NodeTransport};
use super::websocket::{self, Connections};
use super::{EventSink, NodeConfigStore, NodeEvent};
use crate::error::BridgeError;
use crate::now_ms_lossy;

#[derive(Clone)]
pub(crate) struct BridgeState {
    pub registry: NodeRegistry,
    pub connections: Connections,
    pub config_store: Arc<dyn NodeConfigStore>,
    pub events: EventSink,
    pub max_image_bytes: usize,
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            log::warn!("node api error: {:#}", self);
        }
        (status, Json(json!({ "status": "error", "error": self.to_string() }))).into_response()
    }
}

impl From<JsonRejection> for BridgeError {
    fn from(rejection: JsonRejection) -> Self {
        BridgeError::InvalidRequest(rejection.body_text())
    }
}

pub(crate) fn router(state: BridgeState) -> Router {
    let body_limit = state.max_image_bytes + 64 * 1024;
    Router::new()
        .route("/health", get(health))
        .route("/nodes", get(list_nodes))
        .route("/node/register", post(register))
        .route("/node/{id}/data", post(node_data))
        .route("/node/{id}/image", post(node_image))
        .route("/node/{id}/config", get(get_config).post(set_config))
        .route("/ws", get(ws_upgrade))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Serve the router on a current-thread runtime until the shutdown signal fires.
pub(crate) fn serve(listener: std::net::TcpListener, state: BridgeState) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build node api runtime")?;
    let mut shutdown = state.shutdown.clone();
    let app = router(state);
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::from_std(listener)?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await?;
        Ok::<(), anyhow::Error>(())
    })
}

async fn health(State(state): State<BridgeState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "nodes_online": state.registry.online_count(),
        "server_time": now_ms_lossy(),
    }))
}

async fn list_nodes(State(state): State<BridgeState>) -> Json<Value> {
    Json(json!({ "nodes": state.registry.list() }))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    node_id: Option<String>,
    #[serde(flatten)]
    info: NodeInfo,
}

async fn register(
    State(state): State<BridgeState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<Value>, BridgeError> {
    let Json(request) = body?;
    let node_id = request
        .node_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| BridgeError::InvalidRequest("node_id is required".into()))?;

    let node = state
        .registry
        .register(&node_id, request.info, NodeTransport::Http);
    if let Err(err) = state.events.emit(NodeEvent::Registered(node)) {
        log::debug!("registration event for '{}' not forwarded: {}", node_id, err);
    }
    Ok(Json(json!({
        "status": "registered",
        "node_id": node_id,
        "server_time": now_ms_lossy(),
    })))
}

async fn node_data(
    State(state): State<BridgeState>,
    Path(node_id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, BridgeError> {
    let Json(payload) = body?;
    state.registry.touch(&node_id, NodeTransport::Http);
    state.events.emit(NodeEvent::Data {
        node_id,
        transport: NodeTransport::Http,
        payload,
    })?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn node_image(
    State(state): State<BridgeState>,
    Path(node_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<Value>, BridgeError> {
    let mut image: Option<(Vec<u8>, Option<String>)> = None;
    let mut metadata = json!({});

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| BridgeError::InvalidRequest(format!("multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "image" => {
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| BridgeError::InvalidRequest(format!("image field: {}", e)))?;
                if bytes.len() > state.max_image_bytes {
                    return Err(BridgeError::InvalidRequest(format!(
                        "image of {} bytes exceeds {}",
                        bytes.len(),
                        state.max_image_bytes
                    )));
                }
                image = Some((bytes.to_vec(), content_type));
            }
            "metadata" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| BridgeError::InvalidRequest(format!("metadata field: {}", e)))?;
                if !text.trim().is_empty() {
                    metadata = serde_json::from_str(&text).map_err(|e| {
                        BridgeError::InvalidRequest(format!("metadata is not JSON: {}", e))
                    })?;
                }
            }
            _ => {}
        }
    }

    let (image, content_type) = image
        .filter(|(bytes, _)| !bytes.is_empty())
        .ok_or_else(|| BridgeError::InvalidRequest("image field is required".into()))?;
    state.registry.touch(&node_id, NodeTransport::Http);
    log::debug!("node '{}' uploaded {} byte image", node_id, image.len());
    state.events.emit(NodeEvent::Image {
        node_id,
        image,
        content_type,
        metadata,
    })?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn get_config(
    State(state): State<BridgeState>,
    Path(node_id): Path<String>,
) -> Result<Json<Value>, BridgeError> {
    if !state.registry.contains(&node_id) {
        return Err(BridgeError::UnknownNode(node_id));
    }
    let config = state.config_store.get(&node_id)?.unwrap_or_else(|| json!({}));
    Ok(Json(json!({ "node_id": node_id, "config": config })))
}

async fn set_config(
    State(state): State<BridgeState>,
    Path(node_id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, BridgeError> {
    let Json(config) = body?;
    if !config.is_object() {
        return Err(BridgeError::InvalidRequest("config must be a JSON object".into()));
    }
    if !state.registry.contains(&node_id) {
        return Err(BridgeError::UnknownNode(node_id));
    }
    state.config_store.set(&node_id, config)?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<BridgeState>) -> Response {
    ws.on_upgrade(move |socket| websocket::handle_socket(socket, state))
}
