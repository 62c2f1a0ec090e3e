// Web服务器模块

pub mod error;
pub mod handlers;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use crate::config::ServerConfig;
use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

/// 构建 CORS 中间件
///
/// 配置中包含 "*" 时允许任意来源
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let list: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("忽略无效的 CORS 来源: {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(list))
}

/// 构建完整路由
pub fn build_router(app_state: AppState, server: &ServerConfig) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&server.cors_origins));

    let video_routes = Router::new()
        .route("/info", post(handlers::get_video_info))
        .route("/download", post(handlers::start_download))
        .route("/downloads", get(handlers::get_all_downloads))
        .route("/status/:id", get(handlers::get_download_status))
        .route("/cancel/:id", post(handlers::cancel_download))
        .route("/download/:id", get(handlers::download_file))
        .with_state(app_state);

    Router::new()
        .nest("/api/video", video_routes)
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health_check))
        .layer(middleware)
}
