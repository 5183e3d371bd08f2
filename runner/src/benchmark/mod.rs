use crate::clients::{BlockListener, ClientKind, RemoteNode};
use crate::consensus::attributes::mint_deposit_tx;
use crate::consensus::sequencer::Sequencer;
use crate::consensus::validator::Validator;
use crate::consensus::{ConsensusDriver, ConsensusError, DriverOptions};
use crate::mempool::synthetic::SyntheticMempool;
use crate::mempool::{Mempool, WorkloadMempool};
use crate::mempool::replay::{ReplayMempool, RpcBlockSource};
use crate::metrics::collectors::MetricsCollector;
use crate::metrics::{
    BlockMetrics, FileMetricsWriter, SequencerSummary, ValidatorSummary, summarize_sequencer,
    summarize_validator,
};
use alloy::primitives::{B256, U256, keccak256};
use alloy::providers::{DynProvider, Provider};
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Error, anyhow};
use common::config::Config;
use common::engine::auth::JwtSecret;
use common::engine::types::ExecutionPayload;
use common::metrics::Metrics;
use common::utils::alloy_tools::create_alloy_provider;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const WEI_PER_ETH: u64 = 1_000_000_000_000_000_000;
const GWEI: u64 = 1_000_000_000;
const RECEIPT_ATTEMPTS: u32 = 60;
const RECEIPT_INTERVAL: Duration = Duration::from_secs(1);

/// Immutable description of one benchmark run.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub node_type: ClientKind,
    pub gas_limit: u64,
    pub block_time: Duration,
    pub num_blocks: u64,
    pub tags: BTreeMap<String, String>,
    pub node_args: Vec<String>,
}

impl RunParams {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let node_type = ClientKind::from_str(&config.node_type)
            .map_err(|_| anyhow!("unknown node type: {}", config.node_type))?;

        let mut tags = BTreeMap::new();
        for pair in config.benchmark_tags.split(',') {
            if pair.trim().is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed tag (expected key=value): {pair}"))?;
            tags.insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(Self {
            node_type,
            gas_limit: config.gas_limit,
            block_time: Duration::from_millis(config.block_time_ms),
            num_blocks: config.num_blocks,
            tags,
            node_args: config
                .node_args
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    /// Both role summaries are present.
    pub complete: bool,
    pub tags: BTreeMap<String, String>,
    pub node_args: Vec<String>,
    pub sequencer_metrics: Option<SequencerSummary>,
    pub validator_metrics: Option<ValidatorSummary>,
}

struct SequencerOutput {
    payloads: Vec<ExecutionPayload>,
    first_test_block: usize,
}

struct PhaseReport<T> {
    outcome: Result<T, ConsensusError>,
    history: Vec<BlockMetrics>,
}

/// Runs the two phases back to back: produce blocks on the sequencer node,
/// then replay the produced payloads on the validator node.
pub struct NetworkBenchmark {
    config: Config,
    params: RunParams,
    metrics: Arc<Metrics>,
    cancel_token: CancellationToken,
}

impl NetworkBenchmark {
    pub fn new(
        config: Config,
        params: RunParams,
        metrics: Arc<Metrics>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            params,
            metrics,
            cancel_token,
        }
    }

    pub async fn run(&self) -> Result<RunResult, Error> {
        let jwt = JwtSecret::from_hex(&self.config.jwt_secret)?;
        let engine_timeout = Duration::from_millis(self.config.engine_api_timeout_ms);
        let writer = FileMetricsWriter::new(Path::new(&self.config.output_dir));
        let options = self.driver_options();

        // ---- sequencer phase ----
        let sequencer_node = RemoteNode::connect(
            self.params.node_type,
            &self.config.sequencer,
            &jwt,
            engine_timeout,
        )
        .await
        .context("failed to connect to sequencer node")?;
        let chain_id = sequencer_node.rpc.get_chain_id().await?;
        let mempool = self.build_mempool(chain_id).await?;
        let prefunded = PrivateKeySigner::from_str(&self.config.prefunded_private_key)
            .map_err(|e| anyhow!("invalid prefunded private key: {e}"))?;
        let prefund_amount =
            U256::from(self.config.prefund_amount_eth) * U256::from(WEI_PER_ETH);

        let (result_tx, result_rx) = oneshot::channel();
        let phase_cancel = self.cancel_token.child_token();
        tokio::spawn(run_sequencer_phase(
            sequencer_node,
            mempool,
            options.clone(),
            self.params.num_blocks,
            prefunded,
            prefund_amount,
            self.metrics.clone(),
            phase_cancel,
            result_tx,
        ));
        let report: PhaseReport<SequencerOutput> = result_rx
            .await
            .map_err(|_| anyhow!("sequencer phase dropped its result channel"))?;

        if let Err(e) = writer.write("sequencer", &report.history) {
            warn!("Failed to write sequencer metrics: {e}");
        }
        let sequencer_summary = summarize_sequencer(&report.history);

        let output = match report.outcome {
            Ok(output) => output,
            Err(e) if e.is_cancellation() => return Err(anyhow!("benchmark cancelled")),
            Err(e) => {
                error!("Sequencer phase failed: {e}");
                self.metrics.inc_critical_errors();
                return Ok(self.result(false, false, Some(sequencer_summary), None));
            }
        };
        info!(
            "Sequencer phase complete: {} payloads ({} setup)",
            output.payloads.len(),
            output.first_test_block
        );

        // ---- validator phase ----
        let validator_node = RemoteNode::connect(
            self.params.node_type,
            &self.config.validator,
            &jwt,
            engine_timeout,
        )
        .await
        .context("failed to connect to validator node")?;
        let test_payloads: Vec<ExecutionPayload> =
            output.payloads[output.first_test_block..].to_vec();

        let (result_tx, result_rx) = oneshot::channel();
        let phase_cancel = self.cancel_token.child_token();
        tokio::spawn(run_validator_phase(
            validator_node,
            test_payloads,
            options,
            self.metrics.clone(),
            phase_cancel,
            result_tx,
        ));
        let report: PhaseReport<()> = result_rx
            .await
            .map_err(|_| anyhow!("validator phase dropped its result channel"))?;

        if let Err(e) = writer.write("validator", &report.history) {
            warn!("Failed to write validator metrics: {e}");
        }
        let validator_summary = summarize_validator(&report.history);

        match report.outcome {
            Ok(()) => Ok(self.result(
                true,
                true,
                Some(sequencer_summary),
                Some(validator_summary),
            )),
            Err(e) if e.is_cancellation() => Err(anyhow!("benchmark cancelled")),
            Err(e) => {
                error!("Validator phase failed: {e}");
                self.metrics.inc_critical_errors();
                Ok(self.result(
                    false,
                    false,
                    Some(sequencer_summary),
                    Some(validator_summary),
                ))
            }
        }
    }

    fn result(
        &self,
        success: bool,
        complete: bool,
        sequencer_metrics: Option<SequencerSummary>,
        validator_metrics: Option<ValidatorSummary>,
    ) -> RunResult {
        RunResult {
            success,
            complete,
            tags: self.params.tags.clone(),
            node_args: self.params.node_args.clone(),
            sequencer_metrics,
            validator_metrics,
        }
    }

    fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            block_time: self.params.block_time,
            gas_limit: self.params.gas_limit,
            tx_batch_size: self.config.tx_batch_size,
            parallel_batches: self.config.parallel_batches,
            tolerate_tx_failures: self.config.tolerate_tx_failures,
            ..DriverOptions::default()
        }
    }

    async fn build_mempool(&self, chain_id: u64) -> Result<WorkloadMempool, Error> {
        match self.config.payload_type.as_str() {
            "transfer-only" => Ok(WorkloadMempool::Synthetic(SyntheticMempool::new(
                self.config.account_seed,
                self.config.num_accounts,
                chain_id,
                self.params.gas_limit,
            )?)),
            "replay" => {
                let url = self
                    .config
                    .replay_rpc_url
                    .as_deref()
                    .ok_or_else(|| anyhow!("REPLAY_RPC_URL is required for replay payloads"))?;
                let provider = create_alloy_provider(url).await?;
                Ok(WorkloadMempool::Replay(ReplayMempool::new(
                    RpcBlockSource::new(provider),
                    self.config.replay_start_block,
                )))
            }
            other => Err(anyhow!("unknown payload type: {other}")),
        }
    }
}

struct BlockLogger;

impl BlockListener for BlockLogger {
    fn on_block(&self, number: u64, hash: B256) {
        debug!("Chain advanced to block {number} ({hash})");
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_sequencer_phase(
    node: RemoteNode,
    mempool: WorkloadMempool,
    options: DriverOptions,
    num_blocks: u64,
    prefunded: PrivateKeySigner,
    prefund_amount: U256,
    self_metrics: Arc<Metrics>,
    cancel: CancellationToken,
    result_tx: oneshot::Sender<PhaseReport<SequencerOutput>>,
) {
    let mut collector = node.new_collector();
    let report = sequencer_phase(
        node,
        mempool,
        options,
        num_blocks,
        prefunded,
        prefund_amount,
        self_metrics,
        cancel,
        &mut collector,
    )
    .await;
    let _ = result_tx.send(PhaseReport {
        outcome: report,
        history: collector.take_history(),
    });
}

#[allow(clippy::too_many_arguments)]
async fn sequencer_phase(
    node: RemoteNode,
    mempool: WorkloadMempool,
    options: DriverOptions,
    num_blocks: u64,
    prefunded: PrivateKeySigner,
    prefund_amount: U256,
    self_metrics: Arc<Metrics>,
    cancel: CancellationToken,
    collector: &mut MetricsCollector,
) -> Result<SequencerOutput, ConsensusError> {
    let head = node
        .latest_head()
        .await
        .map_err(ConsensusError::Engine)?;
    info!(
        "Sequencing from block {} ({})",
        head.number, head.hash
    );

    let rpc = node.rpc.clone();
    let stream = node.watch_blocks(BlockLogger, Duration::from_millis(500), &cancel);

    let setup_task = spawn_setup(&mempool, rpc.clone(), prefunded, prefund_amount, &cancel);

    let driver = ConsensusDriver::new(
        node.engine,
        head.hash,
        head.number,
        head.timestamp,
        options,
        cancel.clone(),
    );
    let mut sequencer = Sequencer::new(driver, rpc, mempool);

    let outcome = produce_blocks(
        &mut sequencer,
        setup_task,
        num_blocks,
        &self_metrics,
        collector,
    )
    .await;

    stream.stop();
    outcome
}

/// The sequencer loop proper: setup cycles until the workload task is done,
/// then the measured window. Kept free of node plumbing.
async fn produce_blocks<M: Mempool>(
    sequencer: &mut Sequencer<M>,
    setup_task: tokio::task::JoinHandle<Result<(), ConsensusError>>,
    num_blocks: u64,
    self_metrics: &Metrics,
    collector: &mut MetricsCollector,
) -> Result<SequencerOutput, ConsensusError> {
    // setup window: produce blocks until the workload is funded
    let mut payloads: Vec<ExecutionPayload> = Vec::new();
    loop {
        let mut metrics = BlockMetrics::new(sequencer.head_block_number() + 1);
        let block = sequencer.propose_block(&mut metrics, true).await?;
        self_metrics.inc_blocks_built();
        self_metrics.add_txs_submitted(block.submitted);
        payloads.push(block.payload);

        if setup_task.is_finished() {
            match setup_task.await {
                Ok(result) => result?,
                Err(e) => {
                    return Err(ConsensusError::Engine(anyhow!("setup task panicked: {e}")));
                }
            }
            break;
        }
    }
    let first_test_block = payloads.len();
    info!("Workload setup complete after {first_test_block} blocks");

    // measured window
    for _ in 0..num_blocks {
        let mut metrics = BlockMetrics::new(sequencer.head_block_number() + 1);
        let block = sequencer.propose_block(&mut metrics, false).await?;
        self_metrics.inc_blocks_built();
        self_metrics.add_txs_submitted(block.submitted);
        if let Err(e) = collector.collect(&mut metrics).await {
            warn!("Metrics scrape failed: {e}");
        }
        payloads.push(block.payload);
    }

    Ok(SequencerOutput {
        payloads,
        first_test_block,
    })
}

fn spawn_setup(
    mempool: &WorkloadMempool,
    rpc: DynProvider,
    prefunded: PrivateKeySigner,
    prefund_amount: U256,
    cancel: &CancellationToken,
) -> tokio::task::JoinHandle<Result<(), ConsensusError>> {
    match mempool {
        WorkloadMempool::Synthetic(m) => {
            let handle = m.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                setup_synthetic_workload(handle, rpc, prefunded, prefund_amount, cancel).await
            })
        }
        // replayed load needs no funding
        WorkloadMempool::Replay(_) => tokio::spawn(async { Ok::<(), ConsensusError>(()) }),
    }
}

/// Mints the benchmark balance to the prefunded key through a deposit, then
/// fans it out to the generated accounts, waiting for each step to land.
async fn setup_synthetic_workload(
    mempool: SyntheticMempool,
    rpc: DynProvider,
    prefunded: PrivateKeySigner,
    prefund_amount: U256,
    cancel: CancellationToken,
) -> Result<(), ConsensusError> {
    let mut handle = mempool.clone();
    let entropy = keccak256(prefunded.address());
    let (deposit, deposit_hash) = mint_deposit_tx(prefunded.address(), prefund_amount, entropy);
    handle.add_transactions(vec![deposit]);
    wait_for_receipt(&rpc, deposit_hash, &cancel).await?;

    let balance = rpc
        .get_balance(prefunded.address())
        .await
        .map_err(|e| ConsensusError::Engine(e.into()))?;
    if balance < prefund_amount {
        return Err(ConsensusError::Engine(anyhow!(
            "prefunded account balance {balance} below requested {prefund_amount}"
        )));
    }

    let nonce = rpc
        .get_transaction_count(prefunded.address())
        .await
        .map_err(|e| ConsensusError::Engine(e.into()))?;

    // leave room for the fan-out gas itself
    let num_accounts = U256::from(mempool.account_count());
    let gas_reserve = U256::from(22_000u64) * U256::from(GWEI) * num_accounts;
    let per_account = prefund_amount
        .checked_sub(gas_reserve)
        .ok_or_else(|| {
            ConsensusError::Engine(anyhow!(
                "prefund amount {prefund_amount} does not cover funding gas {gas_reserve}"
            ))
        })?
        / num_accounts;

    let (count, last_hash) = mempool
        .stage_funding(&prefunded, nonce, per_account)
        .map_err(ConsensusError::Engine)?;
    debug!("Staged funding for {count} accounts, {per_account} wei each");
    wait_for_receipt(&rpc, last_hash, &cancel).await?;
    Ok(())
}

/// Fixed-interval receipt poll; the bounded retry here is the only retry
/// loop in the runner.
async fn wait_for_receipt(
    rpc: &DynProvider,
    tx_hash: B256,
    cancel: &CancellationToken,
) -> Result<(), ConsensusError> {
    for _ in 0..RECEIPT_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(ConsensusError::Cancelled);
        }
        if let Ok(Some(_receipt)) = rpc.get_transaction_receipt(tx_hash).await {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConsensusError::Cancelled),
            _ = tokio::time::sleep(RECEIPT_INTERVAL) => {}
        }
    }
    Err(ConsensusError::ConfirmationTimeout {
        tx_hash,
        attempts: RECEIPT_ATTEMPTS,
    })
}

async fn run_validator_phase(
    node: RemoteNode,
    payloads: Vec<ExecutionPayload>,
    options: DriverOptions,
    self_metrics: Arc<Metrics>,
    cancel: CancellationToken,
    result_tx: oneshot::Sender<PhaseReport<()>>,
) {
    let mut collector = node.new_collector();
    let outcome = validator_phase(node, payloads, options, self_metrics, cancel, &mut collector).await;
    let _ = result_tx.send(PhaseReport {
        outcome,
        history: collector.take_history(),
    });
}

async fn validator_phase(
    node: RemoteNode,
    payloads: Vec<ExecutionPayload>,
    options: DriverOptions,
    self_metrics: Arc<Metrics>,
    cancel: CancellationToken,
    collector: &mut MetricsCollector,
) -> Result<(), ConsensusError> {
    let head = node
        .latest_head()
        .await
        .map_err(ConsensusError::Engine)?;
    info!(
        "Validating {} payloads from block {}",
        payloads.len(),
        head.number + 1
    );

    let driver = ConsensusDriver::new(
        node.engine,
        head.hash,
        head.number,
        head.timestamp,
        options,
        cancel,
    );
    let mut validator = Validator::new(driver);
    validate_payloads(&mut validator, &payloads, &self_metrics, collector).await
}

/// One BlockMetrics per payload, scraped after each validation.
async fn validate_payloads(
    validator: &mut Validator,
    payloads: &[ExecutionPayload],
    self_metrics: &Metrics,
    collector: &mut MetricsCollector,
) -> Result<(), ConsensusError> {
    for payload in payloads {
        let mut metrics = BlockMetrics::new(payload.block_number.to::<u64>());
        validator.validate_block(payload, &mut metrics).await?;
        self_metrics.inc_blocks_validated();
        if let Err(e) = collector.collect(&mut metrics).await {
            warn!("Metrics scrape failed: {e}");
        }
    }
    Ok(())
}
