// Demo-grade identity endpoint: mints a bearer token for a caller-chosen
// userId. Production deployments substitute real authentication here; the
// rest of the server only ever sees the verified token.

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    auth::jwt::AccessTokenService,
    error::{ApiError, ErrorCode},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub user_id: String,
}

pub fn router(jwt_service: Arc<AccessTokenService>) -> Router {
    Router::new().route("/auth/login", post(login)).with_state(jwt_service)
}

async fn login(
    State(jwt_service): State<Arc<AccessTokenService>>,
    Json(payload): Json<LoginRequest>,
) -> Response {
    let user_id = payload.user_id.trim().to_string();
    if user_id.is_empty() {
        return ApiError::new(ErrorCode::ValidationFailed, "userId must not be empty")
            .into_response();
    }

    match jwt_service.issue_token(&user_id) {
        Ok(token) => {
            (StatusCode::CREATED, Json(LoginResponse { token, user_id })).into_response()
        }
        Err(issue_error) => {
            error!(error = ?issue_error, "failed to issue access token");
            ApiError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}
