use super::{Mempool, NextBlock, is_deposit};
use alloy::consensus::Transaction as _;
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{Address, Bytes};
use alloy::providers::{DynProvider, Provider};
use anyhow::{Error, anyhow};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
pub struct SourceTransaction {
    pub raw: Bytes,
    pub sender: Address,
    pub nonce: u64,
}

#[derive(Debug, Clone)]
pub struct SourceBlock {
    pub number: u64,
    pub transactions: Vec<SourceTransaction>,
}

/// Where replayed blocks come from. The default source is a standard RPC
/// endpoint of a node that has the history.
pub trait BlockSource {
    fn block_by_number(
        &self,
        number: u64,
    ) -> impl std::future::Future<Output = Result<Option<SourceBlock>, Error>> + Send;
}

pub struct RpcBlockSource {
    provider: DynProvider,
}

impl RpcBlockSource {
    pub fn new(provider: DynProvider) -> Self {
        Self { provider }
    }
}

impl BlockSource for RpcBlockSource {
    async fn block_by_number(&self, number: u64) -> Result<Option<SourceBlock>, Error> {
        let Some(block) = self
            .provider
            .get_block_by_number(number.into())
            .full()
            .await?
        else {
            return Ok(None);
        };

        let transactions = block
            .transactions
            .into_transactions()
            .map(|tx| SourceTransaction {
                raw: Bytes::from(tx.inner.inner().encoded_2718()),
                sender: tx.inner.signer(),
                nonce: tx.inner.nonce(),
            })
            .collect();

        Ok(Some(SourceBlock {
            number,
            transactions,
        }))
    }
}

/// Feeds previously recorded blocks through the driver: a cursor walks the
/// source chain one block per cycle, deposit transactions are routed into
/// the attributes and everything else through the pool. Pairs with the
/// tolerant submission mode, since historical transactions can be stale.
pub struct ReplayMempool<S> {
    source: S,
    cursor: u64,
    nonces: HashMap<Address, u64>,
    injected_submit: VecDeque<Bytes>,
    injected_attributes: VecDeque<Bytes>,
}

impl<S: BlockSource> ReplayMempool<S> {
    pub fn new(source: S, start_block: u64) -> Self {
        Self {
            source,
            cursor: start_block,
            nonces: HashMap::new(),
            injected_submit: VecDeque::new(),
            injected_attributes: VecDeque::new(),
        }
    }

    pub fn current_block(&self) -> u64 {
        self.cursor
    }
}

impl<S: BlockSource + Send> Mempool for ReplayMempool<S> {
    async fn next_block(&mut self) -> Result<NextBlock, Error> {
        let block = self
            .source
            .block_by_number(self.cursor)
            .await?
            .ok_or_else(|| anyhow!("replay source has no block {}", self.cursor))?;
        self.cursor += 1;

        let mut next = NextBlock {
            submit: self.injected_submit.drain(..).collect(),
            attributes: self.injected_attributes.drain(..).collect(),
        };
        for tx in block.transactions {
            // next expected nonce for the sender, per the source chain
            self.nonces.insert(tx.sender, tx.nonce + 1);
            if is_deposit(&tx.raw) {
                next.attributes.push(tx.raw);
            } else {
                next.submit.push(tx.raw);
            }
        }
        Ok(next)
    }

    fn add_transactions(&mut self, txs: Vec<Bytes>) {
        for tx in txs {
            if is_deposit(&tx) {
                self.injected_attributes.push_back(tx);
            } else {
                self.injected_submit.push_back(tx);
            }
        }
    }

    fn transaction_count(&self, address: Address) -> u64 {
        self.nonces.get(&address).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubSource {
        blocks: HashMap<u64, SourceBlock>,
    }

    impl BlockSource for StubSource {
        async fn block_by_number(&self, number: u64) -> Result<Option<SourceBlock>, Error> {
            Ok(self.blocks.get(&number).cloned())
        }
    }

    fn tx(first_byte: u8, sender: Address, nonce: u64) -> SourceTransaction {
        SourceTransaction {
            raw: Bytes::from(vec![first_byte, 0x01]),
            sender,
            nonce,
        }
    }

    fn source() -> StubSource {
        let sender = Address::repeat_byte(0xaa);
        let mut blocks = HashMap::new();
        blocks.insert(
            10,
            SourceBlock {
                number: 10,
                transactions: vec![tx(0x7e, Address::ZERO, 0), tx(0x02, sender, 4)],
            },
        );
        blocks.insert(
            11,
            SourceBlock {
                number: 11,
                transactions: vec![tx(0x02, sender, 5)],
            },
        );
        StubSource { blocks }
    }

    #[tokio::test]
    async fn test_cursor_walks_and_splits_deposits() {
        let mut mempool = ReplayMempool::new(source(), 10);

        let first = mempool.next_block().await.expect("block 10");
        assert_eq!(first.attributes.len(), 1);
        assert_eq!(first.submit.len(), 1);
        assert_eq!(mempool.current_block(), 11);

        let second = mempool.next_block().await.expect("block 11");
        assert!(second.attributes.is_empty());
        assert_eq!(second.submit.len(), 1);
    }

    #[tokio::test]
    async fn test_nonces_track_latest_observed() {
        let sender = Address::repeat_byte(0xaa);
        let mut mempool = ReplayMempool::new(source(), 10);
        assert_eq!(mempool.transaction_count(sender), 0);

        mempool.next_block().await.expect("block 10");
        assert_eq!(mempool.transaction_count(sender), 5);

        mempool.next_block().await.expect("block 11");
        assert_eq!(mempool.transaction_count(sender), 6);
    }

    #[tokio::test]
    async fn test_exhausted_source_is_an_error() {
        let mut mempool = ReplayMempool::new(source(), 12);
        let err = mempool.next_block().await.expect_err("missing block");
        assert!(err.to_string().contains("no block 12"));
    }
}
