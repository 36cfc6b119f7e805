//! Health and metrics HTTP surface: `/healthz` for liveness probes, `/metrics` for Prometheus
//! scraping. No trading API lives behind this router - it exists purely so an operator can see
//! the process is alive and watch queue depth without attaching a debugger.
//!
//! Grounded on `main.rs`'s `Router::new().route(...).layer(CorsLayer::permissive())` assembly
//! idiom, generalized from the teacher's large authenticated API surface down to two public
//! routes, since this crate has no API consumers to authenticate.

use crate::queue::Queue;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct MetricsState {
    queue: Queue,
    prometheus: PrometheusHandle,
}

/// Builds the prometheus recorder/exporter and registers the gauges this crate reports.
/// Must be called once, before any `metrics::gauge!`/`counter!` call, so install it at startup
/// before spawning the consumer/scheduler/fill monitor.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install prometheus recorder: {e}"))?;
    metrics::describe_gauge!(
        "zdte_queue_pending_depth",
        "Number of tasks currently sitting in the pending state"
    );
    metrics::describe_counter!(
        "zdte_tasks_completed_total",
        "Tasks that finished processing without a retriable failure"
    );
    metrics::describe_counter!(
        "zdte_tasks_failed_total",
        "Tasks that finished processing with a retriable failure"
    );
    Ok(handle)
}

pub fn router(queue: Queue, prometheus: PrometheusHandle) -> Router {
    let state = Arc::new(MetricsState { queue, prometheus });
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(
    axum::extract::State(state): axum::extract::State<Arc<MetricsState>>,
) -> (axum::http::StatusCode, &'static str) {
    match state.queue.pending_depth() {
        Ok(_) => (axum::http::StatusCode::OK, "ok"),
        Err(_) => (axum::http::StatusCode::SERVICE_UNAVAILABLE, "queue unreachable"),
    }
}

async fn metrics_endpoint(
    axum::extract::State(state): axum::extract::State<Arc<MetricsState>>,
) -> String {
    if let Ok(depth) = state.queue.pending_depth() {
        metrics::gauge!("zdte_queue_pending_depth").set(depth as f64);
    }
    state.prometheus.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_reports_ok_when_queue_reachable() {
        let db = Db::open_in_memory().unwrap();
        let queue = Queue::new(db);
        let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let app = router(queue, prometheus);

        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let db = Db::open_in_memory().unwrap();
        let queue = Queue::new(db);
        let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let app = router(queue, prometheus);

        let resp = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }
}
