pub mod server;

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use tracing::error;

pub struct Metrics {
    registry: Registry,
    blocks_built: IntCounter,
    blocks_validated: IntCounter,
    txs_submitted: IntCounter,
    critical_errors: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let blocks_built = Self::register_counter(
            &registry,
            "runner_blocks_built",
            "Number of payloads built on the sequencer node",
        );
        let blocks_validated = Self::register_counter(
            &registry,
            "runner_blocks_validated",
            "Number of payloads validated on the validator node",
        );
        let txs_submitted = Self::register_counter(
            &registry,
            "runner_txs_submitted",
            "Number of raw transactions submitted to the sequencer mempool",
        );
        let critical_errors = Self::register_counter(
            &registry,
            "runner_critical_errors",
            "Number of errors that aborted a benchmark phase",
        );

        Self {
            registry,
            blocks_built,
            blocks_validated,
            txs_submitted,
            critical_errors,
        }
    }

    fn register_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
        #[allow(clippy::expect_used)]
        let counter = IntCounter::new(name, help).expect("counter options are static");
        if let Err(e) = registry.register(Box::new(counter.clone())) {
            error!("Failed to register metric {name}: {e}");
        }
        counter
    }

    pub fn inc_blocks_built(&self) {
        self.blocks_built.inc();
    }

    pub fn inc_blocks_validated(&self) {
        self.blocks_validated.inc();
    }

    pub fn add_txs_submitted(&self, count: u64) {
        self.txs_submitted.inc_by(count);
    }

    pub fn inc_critical_errors(&self) {
        self.critical_errors.inc();
    }

    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("Failed to encode metrics: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
