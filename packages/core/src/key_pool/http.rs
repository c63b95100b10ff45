//! HTTP surface of the key pool authority.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::error::KeyError;
use crate::key_pool::{KeyId, KeyPool, KeyState};
use crate::protocol::messages::{
    AckResponse, ConsumeQuery, ConsumeResponse, ErrorResponse, HealthResponse, KeyRequestBody, KeyResponse,
    ProvisionRequest, ProvisionResponse, RevokeResponse, StatusQuery, StatusResponse,
};

/// Map a pool error onto the status codes clients rely on.
pub struct ApiError(pub KeyError);

impl From<KeyError> for ApiError {
    fn from(err: KeyError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            KeyError::Exhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            KeyError::NotFound(_) => StatusCode::NOT_FOUND,
            KeyError::Gone(_) | KeyError::AlreadyConsumed(_) => StatusCode::GONE,
            KeyError::InvalidState { .. } => StatusCode::CONFLICT,
            KeyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            KeyError::Unavailable(_) => StatusCode::BAD_GATEWAY,
            KeyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn create_router(pool: Arc<KeyPool>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(pool_status))
        .route("/keys", post(request_key))
        .route("/keys/status", get(key_status))
        .route("/keys/provision", post(provision))
        .route("/keys/:key_id", get(retrieve_key).delete(revoke_key))
        .route("/keys/:key_id/consume", post(consume_key))
        .route("/keys/:key_id/release", post(release_key))
        .route("/keys/:key_id/retain", post(retain_key))
        .with_state(pool)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        stats: None,
    })
}

async fn pool_status(State(pool): State<Arc<KeyPool>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        stats: Some(pool.stats()),
    })
}

async fn request_key(
    State(pool): State<Arc<KeyPool>>,
    Json(body): Json<KeyRequestBody>,
) -> ApiResult<Json<KeyResponse>> {
    let material = pool.request(&body.peer_id, body.size, body.purpose)?;
    Ok(Json(KeyResponse::from(&material)))
}

async fn retrieve_key(
    State(pool): State<Arc<KeyPool>>,
    Path(key_id): Path<KeyId>,
) -> ApiResult<Json<KeyResponse>> {
    let material = pool.retrieve(key_id)?;
    Ok(Json(KeyResponse::from(&material)))
}

async fn consume_key(
    State(pool): State<Arc<KeyPool>>,
    Path(key_id): Path<KeyId>,
    Query(query): Query<ConsumeQuery>,
) -> ApiResult<Json<ConsumeResponse>> {
    let consumed_at = pool.consume_with_token(key_id, query.token)?;
    Ok(Json(ConsumeResponse { key_id, consumed_at }))
}

async fn release_key(
    State(pool): State<Arc<KeyPool>>,
    Path(key_id): Path<KeyId>,
) -> ApiResult<Json<AckResponse>> {
    pool.release(key_id)?;
    Ok(Json(AckResponse {
        key_id,
        state: KeyState::Provisioned,
    }))
}

async fn retain_key(
    State(pool): State<Arc<KeyPool>>,
    Path(key_id): Path<KeyId>,
) -> ApiResult<Json<AckResponse>> {
    pool.retain(key_id)?;
    Ok(Json(AckResponse {
        key_id,
        state: KeyState::Retained,
    }))
}

async fn revoke_key(
    State(pool): State<Arc<KeyPool>>,
    Path(key_id): Path<KeyId>,
) -> ApiResult<Json<RevokeResponse>> {
    let zeroized_at = pool.revoke(key_id)?;
    Ok(Json(RevokeResponse { key_id, zeroized_at }))
}

async fn key_status(
    State(pool): State<Arc<KeyPool>>,
    Query(query): Query<StatusQuery>,
) -> Json<StatusResponse> {
    Json(pool.status(query.peer_id.as_ref()))
}

async fn provision(
    State(pool): State<Arc<KeyPool>>,
    Json(body): Json<ProvisionRequest>,
) -> ApiResult<Json<ProvisionResponse>> {
    let available = pool.provision(&body.peer_id, body.purpose, body.amount)?;
    Ok(Json(ProvisionResponse {
        peer_id: body.peer_id,
        purpose: body.purpose,
        available,
    }))
}
