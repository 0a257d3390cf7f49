use std::future::ready;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use common_kafka::lifecycle::Lifecycle;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

pub async fn index() -> &'static str {
    "vk sender"
}

/// 200 while the consumer has joined its group, 503 otherwise.
async fn readiness(State(lifecycle): State<Lifecycle>) -> (StatusCode, String) {
    let state = lifecycle.state();
    if lifecycle.is_running() {
        (StatusCode::OK, state.to_string())
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, state.to_string())
    }
}

pub fn router(lifecycle: Lifecycle) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(|| ready("ok")))
        .with_state(lifecycle)
}

const HTTP_REQUESTS: &str = "vk_sender_http_requests_total";
const HTTP_DURATION: &str = "vk_sender_http_request_duration_seconds";

/// Health checks answer in microseconds; VK round-trips take up to the request timeout.
const SECONDS_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Mount `/metrics` and wrap every route with request metrics. Routes added
/// afterwards are not measured.
pub fn setup_metrics_routes(router: Router, handle: PrometheusHandle) -> Router {
    router
        .route("/metrics", get(move || ready(handle.render())))
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .add_global_label("service", "vk-sender")
        .set_buckets_for_metric(Matcher::Suffix("_duration_seconds".to_owned()), SECONDS_BUCKETS)?
        .install_recorder()?;
    Ok(handle)
}

/// Unrouted paths share one label so scanners cannot blow up cardinality.
fn route_label(req: &Request<Body>) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_owned(), |path| path.as_str().to_owned())
}

async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let route = route_label(&req);
    if route == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let start = Instant::now();
    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS, &labels).increment(1);
    metrics::histogram!(HTTP_DURATION, &labels).record(start.elapsed().as_secs_f64());

    response
}
