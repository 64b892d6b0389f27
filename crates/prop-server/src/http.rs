//! Axum routes over an EstimationServer.

use crate::{EstimationServer, ServerError};
use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use prop_types::{BackendStatus, BaseResponse, StatusResponse, SubmitData, SubmitRequest, SubmitResponse};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

pub fn router(server: EstimationServer) -> Router {
    Router::new()
        .route("/requests", post(handle_submit))
        .route("/requests/status", get(handle_status))
        .route("/backend/status", get(handle_backend_status))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

async fn handle_submit(
    State(server): State<EstimationServer>,
    Json(req): Json<SubmitRequest>,
) -> Json<SubmitResponse> {
    let work_items = req.dataset.len() * req.replicates.len();
    match server.request_estimate(req).await {
        Ok(request_id) => Json(BaseResponse {
            code: 200,
            message: "Request accepted".to_string(),
            data: Some(SubmitData {
                request_id,
                work_items,
            }),
        }),
        Err(e) => Json(BaseResponse::error(e.code(), e.to_string())),
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub request_id: Option<String>,
}

async fn handle_status(
    State(server): State<EstimationServer>,
    Query(q): Query<StatusQuery>,
) -> Json<StatusResponse> {
    let Some(request_id) = q.request_id.as_deref() else {
        return Json(BaseResponse::error(400, "request_id is required"));
    };
    match server.status(request_id).await {
        Ok(data) => Json(BaseResponse::ok(data)),
        Err(ServerError::NotFound(_)) => Json(BaseResponse::error(404, "Request not found")),
        Err(e) => Json(BaseResponse::error(e.code(), e.to_string())),
    }
}

async fn handle_backend_status(
    State(server): State<EstimationServer>,
) -> Json<BaseResponse<BackendStatus>> {
    Json(BaseResponse::ok(server.backend_status().await))
}

async fn handle_health() -> &'static str {
    "ok"
}
