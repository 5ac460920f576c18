//! The HTTP side of a mail worker: `/metrics` for prometheus, and request metrics for the
//! health routes (`/_liveness`, `/_readiness`) served next to it.
use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Serve `router` on `bind` until the listener fails.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add `/metrics` to the worker's router and wrap every route in `track_endpoint_requests`.
/// Call it after all other routes are added, the layer only applies to existing routes.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_endpoint_requests)))
}

/// Install the global prometheus recorder. Can only succeed once per process.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // SMTP round trips range from tens of milliseconds to the send timeout.
    const SEND_SECONDS: &[f64] = &[
        0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(SEND_SECONDS)?
        .install_recorder()
}

/// Count and time requests to the worker's own endpoints, labelled by route and status.
/// A liveness check that starts failing shows up here as `status="500"` on `/_liveness`.
pub async fn track_endpoint_requests(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let route = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => "unmatched".to_owned(),
    };

    let response = next.run(req).await;

    let labels = [
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!("mail_worker_http_requests_total", &labels).increment(1);
    metrics::histogram!("mail_worker_http_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
