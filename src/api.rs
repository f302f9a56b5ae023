//! Coordinator REST surface.
//!
//! Request handlers are short store sequences; validation fails fast before
//! any write. The DV trigger holds a coordinator-wide lease so iterations
//! never overlap. Everything else relies on per-document atomicity in the
//! store.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::detector::{Detection, Detector};
use crate::domain::{Edge, GeoPoint, MetricsPatch, Node, RouteKey, RoutingEntry};
use crate::dv::{run_dv_update_once, DvParams};
use crate::error::Error;
use crate::green::{compute_green_times, EdgeState, GreenParams};
use crate::routing_table::{build_routing_table, RoutingTable, TableParams};
use crate::store::{update_traffic_by_node, TrafficRepo};

/// Shared coordinator state: the repository, the detector, and the engine
/// tunables, plus the lease that serializes DV iterations.
pub struct AppState {
    pub repo: Arc<dyn TrafficRepo>,
    pub detector: Arc<dyn Detector>,
    pub dv: DvParams,
    pub table: TableParams,
    pub green: GreenParams,
    dv_lease: tokio::sync::Mutex<()>,
}

impl AppState {
    pub fn new(
        repo: Arc<dyn TrafficRepo>,
        detector: Arc<dyn Detector>,
        dv: DvParams,
        table: TableParams,
        green: GreenParams,
    ) -> Self {
        Self {
            repo,
            detector,
            dv,
            table,
            green,
            dv_lease: tokio::sync::Mutex::new(()),
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        // Admin path.
        .route("/node/", post(add_node))
        .route("/edge/", post(add_edge))
        .route("/edge/update/{edge_id}/{node_id}/", post(update_traffic))
        .route("/add_routing_entry/", post(add_routing_entry))
        // Node-agent path.
        .route("/green/{node_id}/", post(calculate_green))
        .route("/gettable/node/{node_id}/", get(get_table))
        // Manual trigger; a deployment would put this on a timer.
        .route("/routing/dv-update/", post(dv_update))
        .layer(DefaultBodyLimit::max(8 * 1024 * 1024))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::BadRequest(_) | Error::NotConnected { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound(_) | Error::NoRoute(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Detector(_) | Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn health() -> Json<Health> {
    Json(Health { status: "UP" })
}

#[derive(Debug, Deserialize)]
pub struct AddNodeRequest {
    pub node_id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeCreated {
    pub node_id: String,
    pub name: String,
}

async fn add_node(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddNodeRequest>,
) -> Result<Json<NodeCreated>, Error> {
    if req.node_id.is_empty() || req.name.is_empty() {
        return Err(Error::BadRequest("node_id and name are required".into()));
    }

    let now = Utc::now().timestamp();
    let node = state.repo.create_node(Node {
        node_id: req.node_id,
        name: req.name,
        location: req.location,
        is_active: req.is_active.unwrap_or(true),
        created_at: now,
        updated_at: now,
    })?;

    info!(node_id = %node.node_id, "node created");
    Ok(Json(NodeCreated {
        node_id: node.node_id,
        name: node.name,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AddEdgeRequest {
    pub edge_id: String,
    pub name: String,
    pub in_node_id: String,
    pub out_node_id: String,
    pub camera_id: String,
    pub road_length_m: f64,
    pub road_width_m: f64,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EdgeCreated {
    pub edge_id: String,
    #[serde(rename = "in")]
    pub in_node: String,
    #[serde(rename = "out")]
    pub out_node: String,
}

async fn add_edge(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddEdgeRequest>,
) -> Result<Json<EdgeCreated>, Error> {
    for (field, value) in [
        ("edge_id", &req.edge_id),
        ("name", &req.name),
        ("in_node_id", &req.in_node_id),
        ("out_node_id", &req.out_node_id),
        ("camera_id", &req.camera_id),
    ] {
        if value.is_empty() {
            return Err(Error::BadRequest(format!("{field} is required")));
        }
    }
    if req.in_node_id == req.out_node_id {
        return Err(Error::BadRequest(
            "in_node_id and out_node_id must differ".into(),
        ));
    }
    if !(req.road_length_m.is_finite() && req.road_length_m > 0.0)
        || !(req.road_width_m.is_finite() && req.road_width_m > 0.0)
    {
        return Err(Error::BadRequest("road dimensions must be positive".into()));
    }
    for node_id in [&req.in_node_id, &req.out_node_id] {
        if state.repo.find_node(node_id)?.is_none() {
            return Err(Error::BadRequest(format!("unknown node {node_id}")));
        }
    }

    let edge = state.repo.create_edge(Edge {
        edge_id: req.edge_id,
        name: req.name,
        in_node_id: req.in_node_id,
        out_node_id: req.out_node_id,
        camera_id: req.camera_id,
        road_length_m: req.road_length_m,
        road_width_m: req.road_width_m,
        incoming_traffic: Default::default(),
        outgoing_traffic: Default::default(),
        is_active: req.is_active.unwrap_or(true),
        created_at: Utc::now().timestamp(),
    })?;

    info!(edge_id = %edge.edge_id, tail = %edge.in_node_id, head = %edge.out_node_id, "edge created");
    Ok(Json(EdgeCreated {
        edge_id: edge.edge_id,
        in_node: edge.in_node_id,
        out_node: edge.out_node_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AddRoutingEntryRequest {
    pub from_node: String,
    pub dest_node: String,
    pub next_hop: String,
    pub cost: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoutingEntryCreated {
    pub from: String,
    pub dest: String,
    pub via: String,
    pub cost: f64,
}

async fn add_routing_entry(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddRoutingEntryRequest>,
) -> Result<Json<RoutingEntryCreated>, Error> {
    for (field, value) in [
        ("from_node", &req.from_node),
        ("dest_node", &req.dest_node),
        ("next_hop", &req.next_hop),
    ] {
        if value.is_empty() {
            return Err(Error::BadRequest(format!("{field} is required")));
        }
    }
    if !req.cost.is_finite() || req.cost < 0.0 {
        return Err(Error::BadRequest(format!(
            "cost must be finite and non-negative, got {}",
            req.cost
        )));
    }

    let entry = state.repo.create_routing_entry(RoutingEntry::new(
        RouteKey::new(req.from_node, req.dest_node, req.next_hop),
        req.cost,
        Utc::now().timestamp(),
    ))?;

    Ok(Json(RoutingEntryCreated {
        from: entry.from_node_id,
        dest: entry.destination_node_id,
        via: entry.next_hop_node_id,
        cost: entry.cost,
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTrafficRequest {
    pub updates: MetricsPatch,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrafficUpdated {
    pub edge_id: String,
    pub updated_for_node: String,
}

async fn update_traffic(
    State(state): State<Arc<AppState>>,
    Path((edge_id, node_id)): Path<(String, String)>,
    Json(req): Json<UpdateTrafficRequest>,
) -> Result<Json<TrafficUpdated>, Error> {
    req.updates.validate().map_err(Error::BadRequest)?;

    let now = Utc::now().timestamp();
    let edge = update_traffic_by_node(state.repo.as_ref(), &node_id, &edge_id, &req.updates, now)?;

    Ok(Json(TrafficUpdated {
        edge_id: edge.edge_id,
        updated_for_node: node_id,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MlResult {
    pub edge_id: String,
    pub ml: Detection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GreenResponse {
    pub node_id: String,
    pub green_times: IndexMap<String, u32>,
    pub edges_used: Vec<String>,
    pub ml_results: Vec<MlResult>,
}

/// The composite hot path: per uploaded image, verify the edge reports to
/// this node, run the detector, persist the metrics, then run the
/// allocator over the batch. Metric writes are independent; a detector
/// failure aborts the call but earlier writes stay.
async fn calculate_green(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<GreenResponse>, Error> {
    let reporting_edges: HashMap<String, Edge> = state
        .repo
        .find_edges_by_out_node(&node_id, true)?
        .into_iter()
        .map(|e| (e.edge_id.clone(), e))
        .collect();

    let mut states: Vec<EdgeState> = Vec::new();
    let mut ml_results: Vec<MlResult> = Vec::new();
    let mut edges_used: Vec<String> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadRequest(format!("malformed multipart body: {e}")))?
    {
        let edge_id = field
            .name()
            .ok_or_else(|| Error::BadRequest("multipart part without a name".into()))?
            .to_string();
        let image = field
            .bytes()
            .await
            .map_err(|e| Error::BadRequest(format!("unreadable part {edge_id}: {e}")))?;

        let edge = reporting_edges.get(&edge_id).ok_or_else(|| {
            Error::BadRequest(format!("edge {edge_id} is not outgoing from node {node_id}"))
        })?;

        let detection = state.detector.detect(&image, &edge.camera_id)?;

        let patch = MetricsPatch {
            total_vehicles: Some(detection.vehicle_counts),
            queue_length_m: Some(detection.queue_length_m),
            density: Some(detection.density),
            pressure: Some(detection.pressure),
            last_green_ts: None,
        };
        let now = Utc::now().timestamp();
        let updated =
            update_traffic_by_node(state.repo.as_ref(), &node_id, &edge_id, &patch, now)?;

        states.push(EdgeState {
            edge_id: edge_id.clone(),
            total_vehicles: detection.vehicle_counts,
            queue_length_m: detection.queue_length_m,
            pressure: detection.pressure,
            last_green_ts: updated.outgoing_traffic.last_green_ts,
        });
        edges_used.push(edge_id.clone());
        ml_results.push(MlResult {
            edge_id,
            ml: detection,
        });
    }

    let green_times = compute_green_times(&states, &state.green, Utc::now().timestamp());
    info!(node_id = %node_id, edges = edges_used.len(), "green schedule computed");

    Ok(Json(GreenResponse {
        node_id,
        green_times,
        edges_used,
        ml_results,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TableResponse {
    pub node_id: String,
    pub routing_table: RoutingTable,
    pub generated_at: i64,
}

async fn get_table(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> Result<Json<TableResponse>, Error> {
    state
        .repo
        .find_node(&node_id)?
        .filter(|n| n.is_active)
        .ok_or_else(|| Error::NotFound(format!("invalid or inactive node {node_id}")))?;

    let routing_table = build_routing_table(state.repo.as_ref(), &node_id, &state.table)?;

    Ok(Json(TableResponse {
        node_id,
        routing_table,
        generated_at: Utc::now().timestamp(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DvTickResponse {
    pub updates_applied: usize,
}

async fn dv_update(State(state): State<Arc<AppState>>) -> Result<Json<DvTickResponse>, Error> {
    // One iteration at a time, coordinator-wide.
    let _lease = state.dv_lease.lock().await;
    let updates_applied =
        run_dv_update_once(state.repo.as_ref(), &state.dv, Utc::now().timestamp())?;
    Ok(Json(DvTickResponse { updates_applied }))
}
