use crate::http_handler::*;

use anyhow::anyhow;
use axum::routing::get;
use axum::Router;
use std::future::Future;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

pub struct HaentglProxyRest;

impl HaentglProxyRest {
    pub async fn start_server<F>(
        addr: String,
        port: u16,
        enable_metric: bool,
        shutdown: F,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut app = Router::new()
            .route("/", get("Hi I'm HaentglProxyRest"))
            .route("/healthz", get(healthz));

        if enable_metric {
            app = app.nest("", route_metrics(MetricsHandler {}));
        }

        app = app.layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new()));
        let listener = tokio::net::TcpListener::bind(format!("{addr}:{port}"))
            .await
            .unwrap();

        match axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                println!("Failed to start HaentglProxyRest {e:?}");
                Err(anyhow!(e.to_string()))
            }
        }
    }
}
