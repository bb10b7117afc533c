//! The REST contract surface consumed by the HTTP layer.
//!
//! Every handler returns either well-formed JSON or `{"error": "..."}`;
//! clients never see a half-updated snapshot.

use crate::bus::ConfigEvent;
use crate::discovery;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use pulse_alert::ThresholdConfig;
use pulse_common::id::short_id;
use pulse_common::types::{Capabilities, NodeConfig, NodeKind, Snapshot};
use pulse_proxmox::{ClientConfig, PbsClient, PveClient};
use pulse_store::export::{export_nodes, import_nodes, ExportBundle};
use pulse_store::system::{OVERRIDES_FILE, THRESHOLDS_FILE};
use pulse_store::{NodeView, StoreError};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn store_error_response(e: StoreError) -> Response {
    let status = match e {
        StoreError::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
        StoreError::Config { .. } => StatusCode::BAD_REQUEST,
        StoreError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

// ---- state & charts ----

pub async fn get_state(State(state): State<AppState>) -> Response {
    match state.hub.current_snapshot() {
        Some(snapshot) => Json(snapshot.as_ref().clone()).into_response(),
        None => Json(Snapshot::default()).into_response(),
    }
}

#[derive(Deserialize)]
pub struct ChartsQuery {
    #[serde(default)]
    range: Option<String>,
    #[serde(default)]
    entity: Option<String>,
    #[serde(default, rename = "maxPoints")]
    max_points: Option<usize>,
}

pub async fn get_charts(
    State(state): State<AppState>,
    Query(query): Query<ChartsQuery>,
) -> Response {
    let window = match query.range.as_deref().unwrap_or("1h") {
        "1h" => Duration::hours(1),
        "24h" => Duration::hours(24),
        "7d" => Duration::days(7),
        other => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("unknown range {other:?}, expected 1h, 24h or 7d"),
            )
        }
    };
    let to = Utc::now();
    let from = to - window;
    let max_points = query.max_points.unwrap_or(300).min(5000);

    let history = state.history.lock().unwrap_or_else(|p| p.into_inner());
    let series = match &query.entity {
        Some(entity) => {
            let mut single = std::collections::HashMap::new();
            single.insert(entity.clone(), history.range(entity, from, to, max_points));
            single
        }
        None => history.range_all(from, to, max_points),
    };
    Json(series).into_response()
}

// ---- node config CRUD ----

pub async fn list_nodes(State(state): State<AppState>) -> Response {
    let nodes = state.nodes.read().unwrap_or_else(|p| p.into_inner());
    let views: Vec<NodeView> = nodes.iter().map(NodeView::from).collect();
    Json(views).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePayload {
    pub kind: NodeKind,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token_name: Option<String>,
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default)]
    pub verify_tls: bool,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl NodePayload {
    fn into_config(self, id: String) -> NodeConfig {
        NodeConfig {
            id,
            kind: self.kind,
            name: self.name,
            url: self.url.trim_end_matches('/').to_string(),
            user: self.user,
            password: self.password,
            token_name: self.token_name,
            token_secret: self.token_secret,
            verify_tls: self.verify_tls,
            capabilities: self.capabilities.unwrap_or_default(),
            timeout_secs: self.timeout_secs,
            cluster_name: None,
            cluster_endpoints: Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is required".into());
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err("url must include a scheme".into());
        }
        let has_token = self.token_name.is_some() && self.token_secret.is_some();
        let has_password = self.user.is_some() && self.password.is_some();
        if !has_token && !has_password {
            return Err("either token or username/password credentials are required".into());
        }
        Ok(())
    }
}

fn persist(state: &AppState, nodes: &[NodeConfig]) -> Result<(), Response> {
    state.node_store.save(nodes).map_err(|e| {
        tracing::error!(error = %e, "failed to persist node config");
        store_error_response(e)
    })
}

pub async fn create_node(
    State(state): State<AppState>,
    Json(payload): Json<NodePayload>,
) -> Response {
    if let Err(reason) = payload.validate() {
        return error_response(StatusCode::BAD_REQUEST, reason);
    }
    let node = payload.into_config(short_id());

    let mut nodes = state.nodes.write().unwrap_or_else(|p| p.into_inner());
    nodes.push(node.clone());
    if let Err(resp) = persist(&state, &nodes) {
        nodes.pop();
        return resp;
    }
    drop(nodes);

    state.bus.publish(ConfigEvent::NodeAdded(node.clone()));
    (StatusCode::CREATED, Json(NodeView::from(&node))).into_response()
}

pub async fn update_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<NodePayload>,
) -> Response {
    let mut nodes = state.nodes.write().unwrap_or_else(|p| p.into_inner());
    let Some(existing) = nodes.iter_mut().find(|n| n.id == id) else {
        return error_response(StatusCode::NOT_FOUND, format!("no node with id {id}"));
    };

    let previous = existing.clone();
    let mut updated = payload.into_config(id.clone());
    // Secrets omitted from the payload keep their stored values, so the
    // config UI can round-trip without re-entering credentials.
    if updated.password.is_none() {
        updated.password = previous.password.clone();
        updated.user = updated.user.or_else(|| previous.user.clone());
    }
    if updated.token_secret.is_none() {
        updated.token_secret = previous.token_secret.clone();
        updated.token_name = updated.token_name.or_else(|| previous.token_name.clone());
    }
    *existing = updated.clone();

    if let Err(resp) = persist(&state, &nodes) {
        if let Some(slot) = nodes.iter_mut().find(|n| n.id == id) {
            *slot = previous;
        }
        return resp;
    }
    drop(nodes);

    state.bus.publish(ConfigEvent::NodeUpdated(updated.clone()));
    Json(NodeView::from(&updated)).into_response()
}

pub async fn delete_node(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let mut nodes = state.nodes.write().unwrap_or_else(|p| p.into_inner());
    let before = nodes.len();
    nodes.retain(|n| n.id != id);
    if nodes.len() == before {
        return error_response(StatusCode::NOT_FOUND, format!("no node with id {id}"));
    }
    if let Err(resp) = persist(&state, &nodes) {
        return resp;
    }
    drop(nodes);

    state.bus.publish(ConfigEvent::NodeRemoved(id));
    StatusCode::NO_CONTENT.into_response()
}

// ---- connection test ----

pub async fn test_connection(Json(payload): Json<NodePayload>) -> Response {
    if let Err(reason) = payload.validate() {
        return error_response(StatusCode::BAD_REQUEST, reason);
    }
    let node = payload.into_config("test".into());
    let config = ClientConfig::from_node(&node);
    if matches!(config.credentials, None) {
        return error_response(StatusCode::BAD_REQUEST, "credentials required");
    }

    let started = std::time::Instant::now();
    let result = match node.kind {
        NodeKind::Pve => match PveClient::new(config) {
            Ok(client) => client.version().await,
            Err(e) => Err(e),
        },
        NodeKind::Pbs => match PbsClient::new(config) {
            Ok(client) => client.version().await,
            Err(e) => Err(e),
        },
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(version) => Json(json!({
            "status": "ok",
            "version": version.version,
            "latencyMs": latency_ms,
        }))
        .into_response(),
        Err(e) => Json(json!({
            "status": "failed",
            "error": e.to_string(),
            "latencyMs": latency_ms,
        }))
        .into_response(),
    }
}

// ---- thresholds ----

pub async fn get_thresholds(State(state): State<AppState>) -> Response {
    let engine = state.engine.lock().unwrap_or_else(|p| p.into_inner());
    Json(engine.config().clone()).into_response()
}

pub async fn set_thresholds(
    State(state): State<AppState>,
    Json(config): Json<ThresholdConfig>,
) -> Response {
    let mut base = config.clone();
    let overrides = std::mem::take(&mut base.overrides);
    if let Err(e) = pulse_store::system::save_json(&state.data_dir.join(THRESHOLDS_FILE), &base) {
        return store_error_response(e);
    }
    if let Err(e) = pulse_store::system::save_json(&state.data_dir.join(OVERRIDES_FILE), &overrides)
    {
        return store_error_response(e);
    }

    let mut engine = state.engine.lock().unwrap_or_else(|p| p.into_inner());
    engine.update_config(config.clone());
    Json(config).into_response()
}

// ---- alerts ----

pub async fn ack_alert(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let mut engine = state.engine.lock().unwrap_or_else(|p| p.into_inner());
    if engine.acknowledge(&id) {
        Json(json!({ "acknowledged": id })).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, format!("no active alert {id}"))
    }
}

// ---- discovery ----

pub async fn get_discover(State(state): State<AppState>) -> Response {
    let excluded: HashSet<String> = {
        let nodes = state.nodes.read().unwrap_or_else(|p| p.into_inner());
        nodes
            .iter()
            .filter_map(|n| discovery::host(&n.url).map(str::to_string))
            .chain(
                nodes
                    .iter()
                    .flat_map(|n| n.cluster_endpoints.iter().map(|m| m.host.clone())),
            )
            .collect()
    };
    Json(discovery::filter_excluded(&state.hub, &excluded)).into_response()
}

// ---- export / import ----

#[derive(Deserialize)]
pub struct ExportRequest {
    pub passphrase: String,
}

pub async fn export_config(
    State(state): State<AppState>,
    Json(request): Json<ExportRequest>,
) -> Response {
    if request.passphrase.len() < 8 {
        return error_response(StatusCode::BAD_REQUEST, "passphrase must be at least 8 chars");
    }
    let nodes = state.nodes.read().unwrap_or_else(|p| p.into_inner());
    match export_nodes(&nodes, &request.passphrase) {
        Ok(bundle) => Json(bundle).into_response(),
        Err(e) => store_error_response(e),
    }
}

#[derive(Deserialize)]
pub struct ImportRequest {
    pub passphrase: String,
    pub bundle: ExportBundle,
}

pub async fn import_config(
    State(state): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> Response {
    let imported = match import_nodes(&request.bundle, &request.passphrase) {
        Ok(nodes) => nodes,
        Err(e) => return store_error_response(e),
    };

    let previous: Vec<NodeConfig> = {
        let mut nodes = state.nodes.write().unwrap_or_else(|p| p.into_inner());
        let previous = std::mem::replace(&mut *nodes, imported.clone());
        if let Err(resp) = persist(&state, &nodes) {
            *nodes = previous;
            return resp;
        }
        previous
    };

    for node in previous {
        state.bus.publish(ConfigEvent::NodeRemoved(node.id));
    }
    for node in &imported {
        state.bus.publish(ConfigEvent::NodeAdded(node.clone()));
    }
    Json(json!({ "imported": imported.len() })).into_response()
}

// ---- system ----

pub async fn get_system(State(state): State<AppState>) -> Response {
    let uptime_secs = (Utc::now() - state.start_time).num_seconds().max(0);
    Json(json!({
        "pollIntervalSecs": state.settings.poll_interval_secs,
        "discoveryEnabled": state.settings.discovery_enabled,
        "updateChannel": state.settings.update_channel,
        "autoUpdate": state.settings.auto_update,
        "subscribers": state.hub.subscriber_count(),
        "droppedEvents": state.dispatcher.dropped_events(),
        "historyEntities": state.history.lock().unwrap_or_else(|p| p.into_inner()).entity_count(),
        "uptimeSecs": uptime_secs,
    }))
    .into_response()
}
