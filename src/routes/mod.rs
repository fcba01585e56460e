use axum::http::{HeaderValue, Method};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{auth::AdminUser, state::AppState};

pub mod admin;
pub mod health;
pub mod submit;

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

pub fn create_router(state: AppState) -> Router<()> {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    let cors = if let Some(origins) = state.config.cors_allowed_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .filter_map(|value| {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    return None;
                }
                match trimmed.parse::<HeaderValue>() {
                    Ok(header) => Some(header),
                    Err(err) => {
                        warn!(origin = %trimmed, error = %err, "ignoring invalid CORS origin");
                        None
                    }
                }
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(methods)
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(methods)
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true)
    };

    let admin_routes = Router::new()
        .route("/records", get(admin::list_records))
        .route("/records/delete", post(admin::delete_records))
        .route("/records/:id", get(admin::get_record))
        .route("/token/info", get(admin::token_info))
        .route("/token/refresh", post(admin::refresh_token))
        .route("/sync/trigger", post(admin::trigger_sync))
        .route("/cleanup/trigger", post(admin::trigger_cleanup))
        .layer(middleware::from_extractor_with_state::<AdminUser, _>(
            state.clone(),
        ));

    Router::new()
        .route("/api/submit", post(submit::submit))
        .route("/api/health", get(health::health_check))
        .nest("/api", admin_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}
