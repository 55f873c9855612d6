//! HTTP server: scrape endpoint, push ingestion and health checks.

use std::net::SocketAddr;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::WebConfig;
use crate::export::SharedExporter;
use crate::ingest::SharedIngestor;
use crate::network::SharedListenerStats;
use crate::push::ingest_push;
use crate::render::{CONTENT_TYPE, SelfMetrics, TextRenderer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    ingestor: SharedIngestor,
    exporter: SharedExporter,
    listener_stats: Option<SharedListenerStats>,
    metrics_path: String,
}

impl AppState {
    pub fn new(ingestor: SharedIngestor, exporter: SharedExporter) -> Self {
        Self {
            ingestor,
            exporter,
            listener_stats: None,
            metrics_path: "/metrics".to_string(),
        }
    }

    /// Include the network listener's counters in scrape output.
    pub fn with_listener_stats(mut self, stats: SharedListenerStats) -> Self {
        self.listener_stats = Some(stats);
        self
    }
}

/// Create the HTTP router.
///
/// The push route is only mounted when `web.push_path` is non-empty.
pub fn create_router(mut state: AppState, web: &WebConfig) -> Router {
    state.metrics_path = web.metrics_path.clone();

    let mut router = Router::new()
        .route("/", get(landing_handler))
        .route(&web.metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler));

    if !web.push_path.is_empty() {
        router = router.route(&web.push_path, post(push_handler));
    }

    router.layer(CorsLayer::permissive()).with_state(state)
}

/// Handler for the scrape endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let mut renderer = TextRenderer::new();
    let emitted = state.exporter.export(&mut renderer);

    let self_metrics = SelfMetrics {
        entries: state.exporter.store().len(),
        store: state.exporter.store().stats(),
        ingest: state.ingestor.stats(),
        listener: state.listener_stats.as_ref().map(|s| s.read().clone()),
    };

    debug!(
        emitted,
        duplicates = renderer.duplicates(),
        kind_conflicts = renderer.kind_conflicts(),
        "Serving scrape"
    );
    let body = renderer.finish(state.exporter.prefix(), Some(&self_metrics));

    (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response()
}

/// Handler for collectd `write_http` pushes.
async fn push_handler(State(state): State<AppState>, body: Bytes) -> Response {
    match ingest_push(&state.ingestor, &body) {
        Ok(report) => {
            debug!(
                accepted = report.accepted,
                rejected = report.rejected,
                values_skipped = report.values_skipped,
                "Push processed"
            );
            StatusCode::OK.into_response()
        }
        Err(e) => {
            warn!(error = %e, "Rejected push request");
            (StatusCode::BAD_REQUEST, format!("{}\n", e)).into_response()
        }
    }
}

async fn landing_handler(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n<head><title>Collectd Exporter</title></head>\n<body>\n\
         <h1>Collectd Exporter</h1>\n\
         <p><a href=\"{}\">Metrics</a></p>\n\
         </body>\n</html>\n",
        state.metrics_path
    ))
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Handler for the /ready endpoint.
async fn ready_handler(State(state): State<AppState>) -> Response {
    if state.ingestor.stats().samples_accepted > 0 {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - no samples received yet\n",
        )
            .into_response()
    }
}

/// A bound HTTP server.
pub struct HttpServer {
    listener: TcpListener,
    router: Router,
    metrics_path: String,
}

impl HttpServer {
    /// Bind the listen address. Fails if the address is unavailable.
    pub async fn bind(listen_addr: SocketAddr, state: AppState, web: &WebConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", listen_addr, e))?;

        Ok(Self {
            listener,
            router: create_router(state, web),
            metrics_path: web.metrics_path.clone(),
        })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(
            addr = %addr,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::Exporter;
    use crate::ingest::{Ingestor, LastPush};
    use crate::store::MetricStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn make_state() -> AppState {
        let store = Arc::new(MetricStore::new());
        let last_push = Arc::new(LastPush::new());
        let ingestor = Arc::new(Ingestor::new(store.clone(), last_push.clone()));
        let exporter = Arc::new(Exporter::new(store, last_push, "collectd", HashMap::new()));
        AppState::new(ingestor, exporter)
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    const PUSH: &str = r#"[{"values":[0.5],"dstypes":["gauge"],"dsnames":["value"],
        "time":1700000000,"interval":10,"host":"web01","plugin":"load",
        "plugin_instance":"","type":"load","type_instance":""}]"#;

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let router = create_router(make_state(), &WebConfig::default());

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            CONTENT_TYPE
        );
        let body = body_string(response).await;
        assert!(body.starts_with("# HELP collectd_last_push_timestamp_seconds"));
        assert!(body.contains("collectd_last_push_timestamp_seconds 0\n"));
    }

    #[tokio::test]
    async fn test_push_then_scrape() {
        let router = create_router(make_state(), &WebConfig::default());

        let response = router
            .clone()
            .oneshot(
                Request::post("/collectd-post")
                    .body(Body::from(PUSH))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_string(response).await;
        assert!(body.contains("collectd_load{instance=\"web01\"} 0.5\n"));
        assert!(body.contains("collectd_exporter_samples_accepted_total 1\n"));
    }

    #[tokio::test]
    async fn test_invalid_push_is_bad_request() {
        let router = create_router(make_state(), &WebConfig::default());

        let response = router
            .oneshot(
                Request::post("/collectd-post")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_push_path_can_be_disabled() {
        let web = WebConfig {
            push_path: String::new(),
            ..Default::default()
        };
        let router = create_router(make_state(), &web);

        let response = router
            .oneshot(
                Request::post("/collectd-post")
                    .body(Body::from(PUSH))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_landing_page_links_metrics() {
        let web = WebConfig {
            metrics_path: "/prom".to_string(),
            ..Default::default()
        };
        let router = create_router(make_state(), &web);

        let response = router
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("href=\"/prom\""));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let router = create_router(make_state(), &WebConfig::default());

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_after_first_sample() {
        let router = create_router(make_state(), &WebConfig::default());

        let response = router
            .clone()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        router
            .clone()
            .oneshot(
                Request::post("/collectd-post")
                    .body(Body::from(PUSH))
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = router
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
