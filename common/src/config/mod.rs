use std::fmt;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct NodeEndpoints {
    pub rpc_url: String,
    pub auth_rpc_url: String,
    pub metrics_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub sequencer: NodeEndpoints,
    pub validator: NodeEndpoints,
    pub jwt_secret: String,
    pub node_type: String,
    pub payload_type: String,
    pub block_time_ms: u64,
    pub num_blocks: u64,
    pub gas_limit: u64,
    pub tx_batch_size: usize,
    pub parallel_batches: usize,
    pub tolerate_tx_failures: bool,
    pub prefunded_private_key: String,
    pub prefund_amount_eth: u64,
    pub num_accounts: usize,
    pub account_seed: u64,
    pub replay_rpc_url: Option<String>,
    pub replay_start_block: u64,
    pub engine_api_timeout_ms: u64,
    pub metrics_server_port: u16,
    pub output_dir: String,
    pub benchmark_tags: String,
    pub node_args: String,
}

impl Config {
    pub fn read_env_variables() -> Self {
        dotenvy::dotenv().ok();

        let read_endpoint = |env_var: &str, default: &str| {
            std::env::var(env_var).unwrap_or_else(|_| {
                warn!("No endpoint found in {} env var, using default", env_var);
                default.to_string()
            })
        };

        let sequencer = NodeEndpoints {
            rpc_url: read_endpoint("SEQUENCER_RPC_URL", "http://localhost:8545"),
            auth_rpc_url: read_endpoint("SEQUENCER_AUTH_RPC_URL", "http://localhost:8551"),
            metrics_url: read_endpoint("SEQUENCER_METRICS_URL", "http://localhost:6060"),
        };

        let validator = NodeEndpoints {
            rpc_url: read_endpoint("VALIDATOR_RPC_URL", "http://localhost:8645"),
            auth_rpc_url: read_endpoint("VALIDATOR_AUTH_RPC_URL", "http://localhost:8651"),
            metrics_url: read_endpoint("VALIDATOR_METRICS_URL", "http://localhost:6061"),
        };

        let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
            warn!("No JWT secret found in JWT_SECRET env var, using all-zero secret");
            "0x0000000000000000000000000000000000000000000000000000000000000000".to_string()
        });

        let node_type = std::env::var("NODE_TYPE").unwrap_or("geth".to_string());

        let payload_type = std::env::var("PAYLOAD_TYPE").unwrap_or("transfer-only".to_string());

        let block_time_ms = std::env::var("BLOCK_TIME_MS")
            .unwrap_or("2000".to_string())
            .parse::<u64>()
            .expect("BLOCK_TIME_MS must be a number");

        let num_blocks = std::env::var("NUM_BLOCKS")
            .unwrap_or("100".to_string())
            .parse::<u64>()
            .expect("NUM_BLOCKS must be a number");

        let gas_limit = std::env::var("GAS_LIMIT")
            .unwrap_or("30000000".to_string())
            .parse::<u64>()
            .expect("GAS_LIMIT must be a number");

        let tx_batch_size = std::env::var("TX_BATCH_SIZE")
            .unwrap_or("100".to_string())
            .parse::<usize>()
            .expect("TX_BATCH_SIZE must be a number");

        let parallel_batches = std::env::var("PARALLEL_BATCHES")
            .unwrap_or("4".to_string())
            .parse::<usize>()
            .expect("PARALLEL_BATCHES must be a number");

        let tolerate_tx_failures = std::env::var("TOLERATE_TX_FAILURES")
            .unwrap_or("false".to_string())
            .parse::<bool>()
            .expect("TOLERATE_TX_FAILURES must be a boolean");

        let prefunded_private_key = std::env::var("PREFUNDED_PRIVATE_KEY").unwrap_or_else(|_| {
            warn!("No key found in PREFUNDED_PRIVATE_KEY env var, using well-known dev key");
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".to_string()
        });

        let prefund_amount_eth = std::env::var("PREFUND_AMOUNT_ETH")
            .unwrap_or("1000".to_string())
            .parse::<u64>()
            .expect("PREFUND_AMOUNT_ETH must be a number");

        let num_accounts = std::env::var("NUM_ACCOUNTS")
            .unwrap_or("10000".to_string())
            .parse::<usize>()
            .expect("NUM_ACCOUNTS must be a number");

        let account_seed = std::env::var("ACCOUNT_SEED")
            .unwrap_or("100".to_string())
            .parse::<u64>()
            .expect("ACCOUNT_SEED must be a number");

        let replay_rpc_url = std::env::var("REPLAY_RPC_URL").ok();

        let replay_start_block = std::env::var("REPLAY_START_BLOCK")
            .unwrap_or("0".to_string())
            .parse::<u64>()
            .expect("REPLAY_START_BLOCK must be a number");

        let engine_api_timeout_ms = std::env::var("ENGINE_API_TIMEOUT_MS")
            .unwrap_or("5000".to_string())
            .parse::<u64>()
            .expect("ENGINE_API_TIMEOUT_MS must be a number");

        let metrics_server_port = std::env::var("METRICS_SERVER_PORT")
            .unwrap_or("9898".to_string())
            .parse::<u16>()
            .expect("METRICS_SERVER_PORT must be a number");

        let output_dir = std::env::var("OUTPUT_DIR").unwrap_or("./output".to_string());

        let benchmark_tags = std::env::var("BENCHMARK_TAGS").unwrap_or_default();

        let node_args = std::env::var("NODE_ARGS").unwrap_or_default();

        Config {
            sequencer,
            validator,
            jwt_secret,
            node_type,
            payload_type,
            block_time_ms,
            num_blocks,
            gas_limit,
            tx_batch_size,
            parallel_batches,
            tolerate_tx_failures,
            prefunded_private_key,
            prefund_amount_eth,
            num_accounts,
            account_seed,
            replay_rpc_url,
            replay_start_block,
            engine_api_timeout_ms,
            metrics_server_port,
            output_dir,
            benchmark_tags,
            node_args,
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sequencer endpoints: {:#?}", self.sequencer)?;
        writeln!(f, "Validator endpoints: {:#?}", self.validator)?;
        writeln!(f, "node type: {}", self.node_type)?;
        writeln!(f, "payload type: {}", self.payload_type)?;
        writeln!(f, "block time: {}ms", self.block_time_ms)?;
        writeln!(f, "blocks to benchmark: {}", self.num_blocks)?;
        writeln!(f, "gas limit: {}", self.gas_limit)?;
        writeln!(f, "tx batch size: {}", self.tx_batch_size)?;
        writeln!(f, "parallel batches: {}", self.parallel_batches)?;
        writeln!(f, "tolerate tx failures: {}", self.tolerate_tx_failures)?;
        writeln!(f, "accounts: {}", self.num_accounts)?;
        writeln!(f, "replay start block: {}", self.replay_start_block)?;
        writeln!(f, "engine api timeout: {}ms", self.engine_api_timeout_ms)?;
        writeln!(f, "output dir: {}", self.output_dir)?;
        Ok(())
    }
}
