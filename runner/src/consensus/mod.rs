pub mod attributes;
pub mod error;
pub mod sequencer;
pub mod validator;

pub use error::ConsensusError;

use crate::metrics::{BlockMetrics, FORK_CHOICE_LATENCY, GET_PAYLOAD_LATENCY};
use alloy::primitives::B256;
use common::engine::client::EngineRpc;
use common::engine::types::{
    ExecutionPayload, ForkchoiceState, PayloadAttributes, PayloadId, PayloadStatusKind,
};
use std::future::Future;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

pub const SETUP_GAS_LIMIT: u64 = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub block_time: Duration,
    pub gas_limit: u64,
    /// Looser limit used while the workload is being funded.
    pub setup_gas_limit: u64,
    /// Raw transactions per batched eth_sendRawTransaction call.
    pub tx_batch_size: usize,
    /// Sub-batches allowed in flight at once.
    pub parallel_batches: usize,
    /// Warn on individual rejected transactions instead of aborting.
    pub tolerate_tx_failures: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            block_time: Duration::from_secs(2),
            gas_limit: 30_000_000,
            setup_gas_limit: SETUP_GAS_LIMIT,
            tx_batch_size: 100,
            parallel_batches: 4,
            tolerate_tx_failures: false,
        }
    }
}

/// Tracks the chain head the way a consensus client would and issues the
/// Engine API exchanges for one execution client. At most one payload build
/// is in flight at a time.
pub struct ConsensusDriver {
    engine: EngineRpc,
    options: DriverOptions,
    cancel_token: CancellationToken,
    head_block_hash: B256,
    head_block_number: u64,
    last_timestamp: u64,
    current_payload_id: Option<PayloadId>,
}

impl ConsensusDriver {
    pub fn new(
        engine: EngineRpc,
        head_block_hash: B256,
        head_block_number: u64,
        last_timestamp: u64,
        options: DriverOptions,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            engine,
            options,
            cancel_token,
            head_block_hash,
            head_block_number,
            last_timestamp,
            current_payload_id: None,
        }
    }

    pub fn head_block_hash(&self) -> B256 {
        self.head_block_hash
    }

    pub fn head_block_number(&self) -> u64 {
        self.head_block_number
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn next_timestamp(&self) -> u64 {
        next_timestamp_after(self.last_timestamp)
    }

    /// head = safe = finalized; with attributes this starts a build job and
    /// a missing payload id is fatal.
    pub async fn propose_fork_choice(
        &mut self,
        attributes: Option<&PayloadAttributes>,
        metrics: &mut BlockMetrics,
    ) -> Result<Option<PayloadId>, ConsensusError> {
        let state = ForkchoiceState::at_head(self.head_block_hash);
        let start = Instant::now();
        let updated = self
            .checked(self.engine.fork_choice_updated(state, attributes))
            .await?;
        metrics.record_duration(FORK_CHOICE_LATENCY, start.elapsed());

        if updated.payload_status.status != PayloadStatusKind::Valid {
            return Err(ConsensusError::ValidationRejected {
                status: updated.payload_status.status,
                validation_error: updated.payload_status.validation_error,
            });
        }
        if attributes.is_some() && updated.payload_id.is_none() {
            return Err(ConsensusError::BuildRejected);
        }

        self.current_payload_id = updated.payload_id;
        Ok(updated.payload_id)
    }

    /// Retrieves the payload for the in-flight build job and consumes its id.
    pub async fn fetch_payload(
        &mut self,
        metrics: &mut BlockMetrics,
    ) -> Result<ExecutionPayload, ConsensusError> {
        let payload_id = self
            .current_payload_id
            .take()
            .ok_or(ConsensusError::BuildRejected)?;

        let start = Instant::now();
        let envelope = self.checked(self.engine.get_payload(payload_id)).await?;
        metrics.record_duration(GET_PAYLOAD_LATENCY, start.elapsed());
        Ok(envelope.execution_payload)
    }

    /// Sends the payload for validation; the head only advances once the
    /// client has accepted it.
    pub async fn validate_payload(
        &mut self,
        payload: &ExecutionPayload,
        metric_name: &str,
        metrics: &mut BlockMetrics,
    ) -> Result<(), ConsensusError> {
        let start = Instant::now();
        let status = self.checked(self.engine.new_payload(payload)).await?;
        metrics.record_duration(metric_name, start.elapsed());

        if status.status != PayloadStatusKind::Valid {
            return Err(ConsensusError::ValidationRejected {
                status: status.status,
                validation_error: status.validation_error,
            });
        }

        self.head_block_hash = payload.block_hash;
        self.head_block_number = payload.block_number.to::<u64>();
        self.last_timestamp = payload.timestamp.to::<u64>();
        Ok(())
    }

    pub async fn wait(&self, duration: Duration) -> Result<(), ConsensusError> {
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(ConsensusError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn checked<T>(
        &self,
        call: impl Future<Output = Result<T, anyhow::Error>> + Send,
    ) -> Result<T, ConsensusError> {
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(ConsensusError::Cancelled),
            result = call => result.map_err(ConsensusError::Engine),
        }
    }
}

/// Strictly increasing block timestamps that track the wall clock once it is
/// ahead of the chain.
fn next_timestamp_after(last: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    now.max(last + 1)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use common::engine::auth::JwtSecret;
    use serde_json::json;

    fn test_driver(url: &str, cancel_token: CancellationToken) -> ConsensusDriver {
        let secret = JwtSecret::from_hex(&"33".repeat(32)).expect("secret");
        let engine = EngineRpc::new(url, secret, Duration::from_secs(5)).expect("engine");
        ConsensusDriver::new(
            engine,
            B256::repeat_byte(0x01),
            5,
            1_700_000_000,
            DriverOptions::default(),
            cancel_token,
        )
    }

    fn attributes() -> PayloadAttributes {
        attributes::build_attributes(
            1_700_000_001,
            30_000_000,
            &attributes::L1BlockInfo {
                number: 1,
                time: 1_700_000_001,
                block_hash: B256::ZERO,
                base_fee: alloy::primitives::U256::from(1u64),
                blob_base_fee: alloy::primitives::U256::from(1u64),
                batcher_address: alloy::primitives::Address::ZERO,
                sequence_number: 0,
                base_fee_scalar: 0,
                blob_base_fee_scalar: 0,
                operator_fee_scalar: 0,
                operator_fee_constant: 0,
            },
            vec![],
        )
    }

    #[test]
    fn test_next_timestamp_is_strictly_increasing() {
        let far_future = u64::from(u32::MAX) * 2;
        assert_eq!(next_timestamp_after(far_future), far_future + 1);

        // an old chain jumps to the wall clock
        let now_ish = next_timestamp_after(0);
        assert!(now_ish > 1_700_000_000);
    }

    #[tokio::test]
    async fn test_missing_payload_id_is_build_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "payloadStatus": {"status": "VALID"},
                        "payloadId": null
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let mut driver = test_driver(&server.url(), CancellationToken::new());
        let mut metrics = BlockMetrics::new(6);
        let attrs = attributes();
        let err = driver
            .propose_fork_choice(Some(&attrs), &mut metrics)
            .await
            .expect_err("should reject");
        assert!(matches!(err, ConsensusError::BuildRejected));
        // the failed call is still measured
        assert!(metrics.get(FORK_CHOICE_LATENCY).is_some());
    }

    #[tokio::test]
    async fn test_invalid_new_payload_is_validation_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "status": "INVALID",
                        "latestValidHash": null,
                        "validationError": "invalid state root"
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let mut driver = test_driver(&server.url(), CancellationToken::new());
        let head_before = driver.head_block_hash();
        let payload = test_payload(6);
        let mut metrics = BlockMetrics::new(6);

        let err = driver
            .validate_payload(&payload, crate::metrics::NEW_PAYLOAD_LATENCY, &mut metrics)
            .await
            .expect_err("should reject");
        match err {
            ConsensusError::ValidationRejected {
                status,
                validation_error,
            } => {
                assert_eq!(status, PayloadStatusKind::Invalid);
                assert_eq!(validation_error.as_deref(), Some("invalid state root"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // head must not move past a rejected payload
        assert_eq!(driver.head_block_hash(), head_before);
    }

    #[tokio::test]
    async fn test_valid_payload_advances_head() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {"status": "VALID", "latestValidHash": null}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let mut driver = test_driver(&server.url(), CancellationToken::new());
        let payload = test_payload(6);
        let mut metrics = BlockMetrics::new(6);
        driver
            .validate_payload(&payload, crate::metrics::NEW_PAYLOAD_LATENCY, &mut metrics)
            .await
            .expect("valid payload");

        assert_eq!(driver.head_block_hash(), payload.block_hash);
        assert_eq!(driver.head_block_number(), 6);
    }

    #[tokio::test]
    async fn test_cancellation_short_circuits_calls() {
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();
        // unroutable address: the call must not even be attempted
        let mut driver = test_driver("http://127.0.0.1:1", cancel_token);
        let mut metrics = BlockMetrics::new(6);

        let err = driver
            .propose_fork_choice(None, &mut metrics)
            .await
            .expect_err("cancelled");
        assert!(err.is_cancellation());
    }

    pub(crate) fn test_payload(number: u64) -> ExecutionPayload {
        use alloy::primitives::{Address, Bloom, Bytes, U64, U256};
        ExecutionPayload {
            parent_hash: B256::repeat_byte(0x01),
            fee_recipient: Address::ZERO,
            state_root: B256::ZERO,
            receipts_root: B256::ZERO,
            logs_bloom: Bloom::ZERO,
            prev_randao: B256::ZERO,
            block_number: U64::from(number),
            gas_limit: U64::from(30_000_000u64),
            gas_used: U64::from(42_000u64),
            timestamp: U64::from(1_700_000_001u64),
            extra_data: Bytes::new(),
            base_fee_per_gas: U256::from(7u64),
            block_hash: B256::repeat_byte(0xbb),
            transactions: vec![Bytes::from(vec![0x7e, 0x01]), Bytes::from(vec![0x02, 0x02])],
            withdrawals: vec![],
            blob_gas_used: U64::ZERO,
            excess_blob_gas: U64::ZERO,
            withdrawals_root: Some(B256::ZERO),
        }
    }
}
