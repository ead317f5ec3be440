use crate::auth;
use crate::handlers;
use crate::state::AppState;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Multipart framing on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

fn cors_layer(origin: &str) -> CorsLayer {
    let allow_origin = match HeaderValue::from_str(origin) {
        Ok(value) => AllowOrigin::exact(value),
        Err(err) => {
            warn!("invalid CORS_ORIGIN {:?} ({}), falling back to any origin", origin, err);
            AllowOrigin::any()
        }
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::header::AUTHORIZATION,
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static(auth::USER_ID_HEADER),
        ])
}

fn generation_api(state: &AppState) -> Router<AppState> {
    let upload_limit = state.config.max_upload_bytes + MULTIPART_OVERHEAD;

    Router::new()
        .route("/question-types", get(handlers::list_question_types))
        .route(
            "/question-types/validate-selection",
            post(handlers::validate_selection),
        )
        .route(
            "/source/upload-image",
            post(handlers::upload_image).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/source/upload-pdf",
            post(handlers::upload_pdf).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/source/validate-prompt", post(handlers::validate_prompt))
        .route("/balance", get(handlers::get_balance))
        .route("/balance/history", get(handlers::get_history))
        .route("/balance/reset", post(handlers::reset_usage))
        .route("/start", post(handlers::start_generation))
        .route("/status/:session_id", get(handlers::generation_status))
        .route("/result/:session_id", get(handlers::generation_result))
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origin);
    let api = Router::new()
        .nest("/ai-generation", generation_api(&state))
        .layer(middleware::from_fn_with_state(state.clone(), auth::api_rate_limit));

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(|| async { "ok" }))
        .route("/api-docs", get(handlers::api_docs))
        .nest("/api/v1", api)
        .route("/api/webhooks", post(handlers::receive_webhook))
        .route("/ws/generation/:session_id", get(handlers::ws_generation))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockAiClient;
    use crate::config::{AppConfig, RateLimitConfig};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn router(config: AppConfig) -> Router {
        let state = crate::build_state_with_client(config, Arc::new(MockAiClient)).unwrap();
        build_router(state)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn api_routes_need_an_identity() {
        let app = router(AppConfig::default());
        let resp = app.oneshot(get("/api/v1/ai-generation/balance")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn api_limit_applies_per_client_ip() {
        let app = router(AppConfig {
            api_rate_limit: RateLimitConfig {
                max_requests: 1,
                window: Duration::from_secs(60),
            },
            ..AppConfig::default()
        });
        let first = app.clone().oneshot(get("/api/v1/ai-generation/question-types")).await.unwrap();
        assert_eq!(first.status(), StatusCode::UNAUTHORIZED);
        let second = app.clone().oneshot(get("/api/v1/ai-generation/question-types")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let health = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }
}
