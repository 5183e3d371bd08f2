use super::attributes::{L1BlockInfo, build_attributes};
use super::{ConsensusDriver, ConsensusError};
use crate::mempool::Mempool;
use crate::metrics::{
    BlockMetrics, GAS_PER_BLOCK, GAS_PER_SECOND, SEND_TXS_LATENCY,
    SEQUENCER_NEW_PAYLOAD_LATENCY, TRANSACTIONS_PER_BLOCK,
};
use alloy::primitives::{Address, B256, Bytes};
use alloy::providers::{DynProvider, Provider};
use alloy::rpc::client::{BatchRequest, ClientRef};
use common::engine::types::ExecutionPayload;
use futures_util::StreamExt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of one production cycle: the payload the client built and the
/// number of raw transactions it accepted into its pool.
pub struct ProposedBlock {
    pub payload: ExecutionPayload,
    pub submitted: u64,
}

/// Drives one client through the block-production side of the Engine API:
/// build attributes, fork choice, feed the pool, retrieve and self-validate.
pub struct Sequencer<M> {
    driver: ConsensusDriver,
    eth: DynProvider,
    mempool: M,
    l1_origin_number: u64,
    l1_origin_hash: B256,
    sequence_number: u64,
}

impl<M: Mempool> Sequencer<M> {
    pub fn new(driver: ConsensusDriver, eth: DynProvider, mempool: M) -> Self {
        // a synthetic L1 origin; nothing downstream resolves it
        let l1_origin_number: u64 = 1;
        let l1_origin_hash = alloy::primitives::keccak256(l1_origin_number.to_be_bytes());
        Self {
            driver,
            eth,
            mempool,
            l1_origin_number,
            l1_origin_hash,
            sequence_number: 0,
        }
    }

    pub fn head_block_number(&self) -> u64 {
        self.driver.head_block_number()
    }

    /// One full production cycle; returns the payload the client built and
    /// accepted. Setup cycles use the looser setup gas limit.
    pub async fn propose_block(
        &mut self,
        metrics: &mut BlockMetrics,
        setup: bool,
    ) -> Result<ProposedBlock, ConsensusError> {
        let cycle_start = Instant::now();
        let next = self
            .mempool
            .next_block()
            .await
            .map_err(|e| ConsensusError::SubmissionFailure(e.to_string()))?;

        let timestamp = self.driver.next_timestamp();
        let gas_limit = if setup {
            self.driver.options().setup_gas_limit
        } else {
            self.driver.options().gas_limit
        };
        let info = L1BlockInfo {
            number: self.l1_origin_number,
            time: timestamp,
            block_hash: self.l1_origin_hash,
            base_fee: alloy::primitives::U256::from(1u64),
            blob_base_fee: alloy::primitives::U256::from(1u64),
            batcher_address: Address::ZERO,
            sequence_number: self.sequence_number,
            base_fee_scalar: 0,
            blob_base_fee_scalar: 0,
            operator_fee_scalar: 0,
            operator_fee_constant: 0,
        };
        let attributes = build_attributes(timestamp, gas_limit, &info, next.attributes);

        self.driver
            .propose_fork_choice(Some(&attributes), metrics)
            .await?;

        // submission eats into the block time budget; the client gets
        // whatever remains to pack the pool into the payload
        let submit_start = Instant::now();
        let submitted = self.submit_transactions(&next.submit, metrics).await?;
        debug!(
            "Submitted {submitted} transactions for block {}",
            self.driver.head_block_number() + 1
        );
        if let Some(remaining) = self
            .driver
            .options()
            .block_time
            .checked_sub(submit_start.elapsed())
        {
            self.driver.wait(remaining).await?;
        }

        let payload = self.driver.fetch_payload(metrics).await?;
        self.driver
            .validate_payload(&payload, SEQUENCER_NEW_PAYLOAD_LATENCY, metrics)
            .await?;

        #[allow(clippy::cast_precision_loss)]
        {
            let gas_used = payload.gas_used.to::<u64>() as f64;
            metrics.record(GAS_PER_BLOCK, gas_used);
            // throughput over the measured cycle, not the nominal block time
            metrics.record(GAS_PER_SECOND, gas_used / cycle_start.elapsed().as_secs_f64());
            metrics.record(TRANSACTIONS_PER_BLOCK, payload.transactions.len() as f64);
        }

        self.sequence_number += 1;
        Ok(ProposedBlock { payload, submitted })
    }

    /// Batched eth_sendRawTransaction with a bounded number of sub-batches
    /// in flight. Individual rejections abort the run unless tolerated.
    async fn submit_transactions(
        &self,
        txs: &[Bytes],
        metrics: &mut BlockMetrics,
    ) -> Result<u64, ConsensusError> {
        if txs.is_empty() {
            metrics.record_duration(SEND_TXS_LATENCY, Duration::ZERO);
            return Ok(0);
        }

        let options = self.driver.options();
        let client = self.eth.client();
        let start = Instant::now();
        let batches: Vec<_> = txs
            .chunks(options.tx_batch_size.max(1))
            .map(|chunk| send_batch(&client, chunk))
            .collect();
        let outcomes: Vec<Result<BatchOutcome, ConsensusError>> =
            futures_util::stream::iter(batches)
                .buffer_unordered(options.parallel_batches.max(1))
                .collect()
                .await;
        metrics.record_duration(SEND_TXS_LATENCY, start.elapsed());

        let mut accepted = 0u64;
        for outcome in outcomes {
            let outcome = outcome?;
            accepted += outcome.accepted;
            for rejection in outcome.rejections {
                if options.tolerate_tx_failures {
                    warn!("Transaction rejected: {rejection}");
                } else {
                    return Err(ConsensusError::SubmissionFailure(rejection));
                }
            }
        }
        Ok(accepted)
    }
}

struct BatchOutcome {
    accepted: u64,
    rejections: Vec<String>,
}

async fn send_batch(
    client: &ClientRef<'_>,
    chunk: &[Bytes],
) -> Result<BatchOutcome, ConsensusError> {
    let mut batch = BatchRequest::new(client);
    let mut waiters = Vec::with_capacity(chunk.len());
    for tx in chunk {
        let waiter = batch
            .add_call::<_, B256>("eth_sendRawTransaction", &(tx.clone(),))
            .map_err(|e| ConsensusError::SubmissionFailure(e.to_string()))?;
        waiters.push(waiter);
    }
    batch
        .send()
        .await
        .map_err(|e| ConsensusError::SubmissionFailure(e.to_string()))?;

    let mut outcome = BatchOutcome {
        accepted: 0,
        rejections: Vec::new(),
    };
    for waiter in waiters {
        match waiter.await {
            Ok(_hash) => outcome.accepted += 1,
            Err(e) => outcome.rejections.push(e.to_string()),
        }
    }
    Ok(outcome)
}
