pub mod auth;
pub mod documents;

use std::sync::Arc;

use axum::Router;

use crate::auth::jwt::AccessTokenService;
use crate::engine::DocRegistry;

pub fn build_router(jwt_service: Arc<AccessTokenService>, registry: Arc<DocRegistry>) -> Router {
    auth::router(Arc::clone(&jwt_service)).merge(documents::router(registry, jwt_service))
}
