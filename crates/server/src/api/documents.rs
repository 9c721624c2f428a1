// Document lifecycle endpoints.
//
// Routes:
//   POST /docs      — create a document with seed content
//   GET  /docs/{id} — snapshot read

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::{
    auth::{jwt::AccessTokenService, middleware::require_bearer_auth},
    engine::DocRegistry,
    error::{ApiError, ErrorCode},
};

#[derive(Debug, Default, Deserialize)]
pub struct CreateDocumentRequest {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentResponse {
    pub doc_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub content: String,
    pub version: u64,
}

pub fn router(registry: Arc<DocRegistry>, jwt_service: Arc<AccessTokenService>) -> Router {
    Router::new()
        .route("/docs", post(create_document))
        .route("/docs/{id}", get(get_document))
        .with_state(registry)
        .route_layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth))
}

async fn create_document(
    State(registry): State<Arc<DocRegistry>>,
    payload: Option<Json<CreateDocumentRequest>>,
) -> Response {
    let seed = payload.and_then(|Json(request)| request.content).unwrap_or_default();

    match registry.create_document(seed).await {
        Ok(doc_id) => {
            (StatusCode::CREATED, Json(CreateDocumentResponse { doc_id })).into_response()
        }
        Err(create_error) => {
            error!(error = %create_error, "failed to create document");
            ApiError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn get_document(
    State(registry): State<Arc<DocRegistry>>,
    Path(doc_id): Path<Uuid>,
) -> Response {
    // Prefer the live authority; documents nobody has attached are served
    // from the durable record.
    if let Some(authority) = registry.attached(doc_id).await {
        let (content, version) = authority.snapshot().await;
        return Json(DocumentSnapshot { content, version }).into_response();
    }

    match registry.store().fetch(doc_id).await {
        Ok(Some(record)) => {
            Json(DocumentSnapshot { content: record.content, version: record.version })
                .into_response()
        }
        Ok(None) => ApiError::new(ErrorCode::NotFound, "document not found").into_response(),
        Err(fetch_error) => {
            error!(error = %fetch_error, doc_id = %doc_id, "failed to read document");
            ApiError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}
