pub mod replay;
pub mod synthetic;

use alloy::primitives::{Address, Bytes};
use anyhow::Error;
use replay::{ReplayMempool, RpcBlockSource};
use synthetic::SyntheticMempool;

/// Transaction type byte of rollup deposit transactions.
pub const DEPOSIT_TX_TYPE: u8 = 0x7e;

/// One cycle's worth of load: transactions submitted through the public
/// mempool, and transactions forced into the block via payload attributes.
#[derive(Debug, Clone, Default)]
pub struct NextBlock {
    pub submit: Vec<Bytes>,
    pub attributes: Vec<Bytes>,
}

pub trait Mempool {
    fn next_block(&mut self) -> impl std::future::Future<Output = Result<NextBlock, Error>> + Send;
    /// Externally injected raw transactions. Deposit-typed ones ride in the
    /// attributes of the next block, the rest go through the pool.
    fn add_transactions(&mut self, txs: Vec<Bytes>);
    fn transaction_count(&self, address: Address) -> u64;
}

pub fn is_deposit(raw: &Bytes) -> bool {
    raw.first() == Some(&DEPOSIT_TX_TYPE)
}

/// The two workload generators behind one dispatching type, picked by the
/// configured payload type.
pub enum WorkloadMempool {
    Synthetic(SyntheticMempool),
    Replay(ReplayMempool<RpcBlockSource>),
}

impl Mempool for WorkloadMempool {
    async fn next_block(&mut self) -> Result<NextBlock, Error> {
        match self {
            Self::Synthetic(m) => m.next_block().await,
            Self::Replay(m) => m.next_block().await,
        }
    }

    fn add_transactions(&mut self, txs: Vec<Bytes>) {
        match self {
            Self::Synthetic(m) => m.add_transactions(txs),
            Self::Replay(m) => m.add_transactions(txs),
        }
    }

    fn transaction_count(&self, address: Address) -> u64 {
        match self {
            Self::Synthetic(m) => m.transaction_count(address),
            Self::Replay(m) => m.transaction_count(address),
        }
    }
}
