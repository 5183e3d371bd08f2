use super::Metrics;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::Filter;

pub fn serve_metrics(metrics: Arc<Metrics>, cancel_token: CancellationToken, port: u16) {
    let route = warp::path("metrics").and(warp::get()).map(move || {
        let body = metrics.gather();
        warp::reply::with_header(body, "content-type", "text/plain; version=0.0.4")
    });

    tokio::spawn(async move {
        let (addr, server) =
            warp::serve(route).bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
                cancel_token.cancelled().await;
            });
        info!("Metrics server listening on {addr}");
        server.await;
        info!("Metrics server stopped");
    });
}
