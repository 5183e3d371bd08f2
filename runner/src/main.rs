mod benchmark;
mod clients;
mod consensus;
mod mempool;
mod metrics;

use crate::benchmark::{NetworkBenchmark, RunParams};
use anyhow::{Context, Error};
use common::config::Config;
use common::metrics::{Metrics, server::serve_metrics};
use common::utils::logging::init_logging;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_logging();
    info!(
        "🚀 Starting benchmark runner v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::read_env_variables();
    info!("Configuration:\n{config}");
    let params = RunParams::from_config(&config)?;

    let cancel_token = CancellationToken::new();

    // a panic anywhere tears the whole run down
    let panic_cancel = cancel_token.clone();
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("Panic: {info}");
        panic_cancel.cancel();
        default_hook(info);
    }));

    let self_metrics = Arc::new(Metrics::new());
    serve_metrics(
        self_metrics.clone(),
        cancel_token.clone(),
        config.metrics_server_port,
    );

    let signal_cancel = cancel_token.clone();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received ctrl-c, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
        signal_cancel.cancel();
    });

    let output_dir = config.output_dir.clone();
    let benchmark = NetworkBenchmark::new(config, params, self_metrics, cancel_token.clone());
    let result = benchmark.run().await;
    cancel_token.cancel();

    let result = result?;
    info!(
        "Benchmark finished: success={} complete={}",
        result.success, result.complete
    );

    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create output dir {output_dir}"))?;
    let path = format!("{output_dir}/result.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&result)?)
        .with_context(|| format!("failed to write {path}"))?;
    info!("Run result written to {path}");

    Ok(())
}
