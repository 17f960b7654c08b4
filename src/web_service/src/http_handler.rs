use axum::http::header::CONTENT_TYPE;
use axum::routing::get;
use axum::{http, Router};

#[derive(Clone, Copy)]
pub struct MetricsHandler;

impl MetricsHandler {
    pub fn render(&self) -> String {
        if let Some(prometheus_handle) = common::metrics::try_handle() {
            prometheus_handle.render()
        } else {
            "Please initialize the prometheus context first.".to_string()
        }
    }
}

pub fn route_metrics<S>(metrics_handler: MetricsHandler) -> Router<S> {
    Router::new()
        .route("/metrics", get(metrics_get))
        .with_state(metrics_handler)
}

pub async fn healthz() -> (http::StatusCode, [(axum::http::HeaderName, &'static str); 1], &'static str) {
    (http::StatusCode::OK, [(CONTENT_TYPE, "application/json")], "{\"status\":\"ok\"}")
}

#[axum_macros::debug_handler]
async fn metrics_get(state: axum::extract::State<MetricsHandler>) -> String {
    state.render()
}
