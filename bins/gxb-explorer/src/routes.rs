use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use gxb_core::error::GxbError;
use gxb_core::types::{SignedBlock, TxRecord};
use gxb_node_lib::{ExplorerStatus, Supply};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

// ── Error helper ─────────────────────────────────────────────────────────────

struct ApiError(GxbError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GxbError::NotFound(_) => StatusCode::NOT_FOUND,
            e if e.is_connectivity() => StatusCode::SERVICE_UNAVAILABLE,
            GxbError::Decode(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

impl From<GxbError> for ApiError {
    fn from(e: GxbError) -> Self {
        ApiError(e)
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ── Router ───────────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status))
        .route("/api/supply", get(supply))
        .route("/api/object/:id", get(object))
        .route("/api/block/:height", get(block))
        .route("/api/transaction/:txid", get(transaction))
        .layer(cors)
        .with_state(state)
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn status(State(s): State<AppState>) -> Json<ExplorerStatus> {
    Json(s.explorer.status())
}

async fn supply(State(s): State<AppState>) -> ApiResult<Supply> {
    Ok(Json(s.explorer.supply().await?))
}

async fn object(State(s): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    Ok(Json(s.explorer.object(&id).await?.payload))
}

async fn block(State(s): State<AppState>, Path(height): Path<u64>) -> ApiResult<SignedBlock> {
    Ok(Json(s.explorer.block(height).await?))
}

async fn transaction(State(s): State<AppState>, Path(txid): Path<String>) -> ApiResult<TxRecord> {
    Ok(Json(s.explorer.transaction(&txid).await?))
}
