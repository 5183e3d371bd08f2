use crate::metrics::collectors::{DebugJsonCollector, MetricsCollector, PrometheusCollector};
use alloy::primitives::B256;
use alloy::providers::{DynProvider, Provider};
use alloy::rpc::types::BlockNumberOrTag;
use anyhow::{Error, anyhow};
use common::config::NodeEndpoints;
use common::engine::auth::JwtSecret;
use common::engine::client::EngineRpc;
use common::utils::alloy_tools::create_alloy_provider;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use strum::{Display, EnumString};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ClientKind {
    Geth,
    Reth,
}

#[derive(Debug, Clone, Copy)]
pub struct HeadInfo {
    pub hash: B256,
    pub number: u64,
    pub timestamp: u64,
}

/// A running execution client, reachable through its pre-provisioned
/// endpoints. Process lifecycle is somebody else's problem.
pub struct RemoteNode {
    pub kind: ClientKind,
    pub rpc: DynProvider,
    pub engine: EngineRpc,
    pub metrics_url: String,
}

impl RemoteNode {
    pub async fn connect(
        kind: ClientKind,
        endpoints: &NodeEndpoints,
        jwt: &JwtSecret,
        engine_timeout: Duration,
    ) -> Result<Self, Error> {
        let rpc = create_alloy_provider(&endpoints.rpc_url).await?;
        let engine = EngineRpc::new(&endpoints.auth_rpc_url, jwt.clone(), engine_timeout)?;
        info!("Connected to {kind} node at {}", endpoints.rpc_url);
        Ok(Self {
            kind,
            rpc,
            engine,
            metrics_url: endpoints.metrics_url.clone(),
        })
    }

    pub fn new_collector(&self) -> MetricsCollector {
        match self.kind {
            ClientKind::Geth => {
                MetricsCollector::DebugJson(DebugJsonCollector::new(&self.metrics_url))
            }
            ClientKind::Reth => {
                MetricsCollector::Prometheus(PrometheusCollector::new(&self.metrics_url))
            }
        }
    }

    pub async fn latest_head(&self) -> Result<HeadInfo, Error> {
        let block = self
            .rpc
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await?
            .ok_or_else(|| anyhow!("node has no latest block"))?;
        Ok(HeadInfo {
            hash: block.header.hash,
            number: block.header.number,
            timestamp: block.header.timestamp,
        })
    }

    /// Polls for new canonical blocks and notifies the listener. Detached
    /// from the node handle; stop it through the returned stream.
    pub fn watch_blocks<L: BlockListener>(
        &self,
        listener: L,
        poll_interval: Duration,
        parent: &CancellationToken,
    ) -> BlockStream {
        BlockStream::spawn(self.rpc.clone(), listener, poll_interval, parent)
    }
}

pub trait BlockListener: Send + Sync + 'static {
    fn on_block(&self, number: u64, hash: B256);
}

/// Handle to a background block poller. `stop` is idempotent; only the
/// first call tears the task down.
pub struct BlockStream {
    stopped: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl BlockStream {
    pub fn spawn<L: BlockListener>(
        rpc: DynProvider,
        listener: L,
        poll_interval: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut last_seen: Option<u64> = None;
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                match rpc.get_block_by_number(BlockNumberOrTag::Latest).await {
                    Ok(Some(block)) => {
                        let number = block.header.number;
                        if last_seen.is_none_or(|seen| number > seen) {
                            listener.on_block(number, block.header.hash);
                            last_seen = Some(number);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Block poll failed: {e}"),
                }
            }
        });

        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            cancel,
        }
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_client_kind_parses_case_insensitively() {
        assert_eq!(ClientKind::from_str("geth").expect("parse"), ClientKind::Geth);
        assert_eq!(ClientKind::from_str("Reth").expect("parse"), ClientKind::Reth);
        assert!(ClientKind::from_str("besu").is_err());
    }

    #[tokio::test]
    async fn test_block_stream_stop_is_idempotent() {
        let provider = alloy::providers::ProviderBuilder::new()
            .connect_http("http://127.0.0.1:1".parse().expect("url"))
            .erased();
        struct Nop;
        impl BlockListener for Nop {
            fn on_block(&self, _number: u64, _hash: B256) {}
        }

        let parent = CancellationToken::new();
        let stream = BlockStream::spawn(provider, Nop, Duration::from_millis(50), &parent);
        assert!(!stream.is_stopped());
        stream.stop();
        stream.stop();
        assert!(stream.is_stopped());
        assert!(stream.cancel.is_cancelled());
        // the parent token must be unaffected
        assert!(!parent.is_cancelled());
    }
}
