pub mod error;
pub mod response;
pub mod v1;

use axum::http::{header, HeaderValue, Method};
use axum::Router;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::{config::ServerConfig, controller::AppState};

const BODY_LIMIT_BYTES: usize = 1024 * 1024;

pub fn router(state: AppState, server: &ServerConfig) -> Router {
    let mut router = Router::new().nest("/api/v1", v1::router(state));

    if server.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(HeaderValue::from_static("http://localhost:3000"))
            .allow_methods([Method::GET, Method::POST, Method::PUT])
            .allow_headers([header::CONTENT_TYPE]);
        router = router.layer(cors);
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(axum::extract::DefaultBodyLimit::max(BODY_LIMIT_BYTES))
                .layer(TimeoutLayer::new(Duration::from_secs(server.request_timeout_secs))),
        )
        .layer(TraceLayer::new_for_http())
}

#[cfg(feature = "metrics")]
pub fn with_metrics(app: Router, handle: metrics_exporter_prometheus::PrometheusHandle) -> Router {
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    );
    app.merge(metrics_router)
}
