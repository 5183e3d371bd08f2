use super::{ConsensusDriver, ConsensusError};
use crate::metrics::{BlockMetrics, GAS_PER_BLOCK, GAS_PER_SECOND, NEW_PAYLOAD_LATENCY};
use common::engine::types::ExecutionPayload;
use std::time::Instant;

/// Replays payloads built by the sequencer against a second client: fork
/// choice at the current head, then validation. No pacing, the client is
/// fed as fast as it validates.
pub struct Validator {
    driver: ConsensusDriver,
}

impl Validator {
    pub fn new(driver: ConsensusDriver) -> Self {
        Self { driver }
    }

    pub async fn validate_block(
        &mut self,
        payload: &ExecutionPayload,
        metrics: &mut BlockMetrics,
    ) -> Result<(), ConsensusError> {
        let start = Instant::now();
        self.driver.propose_fork_choice(None, metrics).await?;
        self.driver
            .validate_payload(payload, NEW_PAYLOAD_LATENCY, metrics)
            .await?;

        #[allow(clippy::cast_precision_loss)]
        {
            let gas_used = payload.gas_used.to::<u64>() as f64;
            metrics.record(GAS_PER_BLOCK, gas_used);
            // validation is unpaced, so throughput comes from the measured
            // validation time, never the nominal block time
            metrics.record(GAS_PER_SECOND, gas_used / start.elapsed().as_secs_f64());
        }
        Ok(())
    }
}
