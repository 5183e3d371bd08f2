use super::{Mempool, NextBlock, is_deposit};
use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{Address, B256, Bytes, TxKind, U256};
use alloy::signers::{SignerSync, local::PrivateKeySigner};
use anyhow::{Error, anyhow};
use rand::{RngCore, SeedableRng, rngs::StdRng};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const TRANSFER_GAS: u64 = 21_000;
const MAX_FEE_PER_GAS: u128 = 1_000_000_000; // 1 gwei
const MAX_PRIORITY_FEE: u128 = 2;

/// Generates round-robin value transfers between a deterministic population
/// of accounts until each cycle's gas target is filled.
///
/// A clone is a handle onto the same state, so the funding task and the
/// sequencer can both feed it.
#[derive(Clone)]
pub struct SyntheticMempool {
    inner: Arc<Mutex<State>>,
}

struct State {
    accounts: Vec<PrivateKeySigner>,
    addresses: Vec<Address>,
    nonces: HashMap<Address, u64>,
    pending_submit: VecDeque<Bytes>,
    pending_attributes: VecDeque<Bytes>,
    next_account: usize,
    chain_id: u64,
    gas_target: u64,
}

impl SyntheticMempool {
    pub fn new(
        seed: u64,
        num_accounts: usize,
        chain_id: u64,
        gas_target: u64,
    ) -> Result<Self, Error> {
        if num_accounts < 2 {
            return Err(anyhow!("need at least 2 accounts for transfers"));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut accounts = Vec::with_capacity(num_accounts);
        let mut addresses = Vec::with_capacity(num_accounts);
        while accounts.len() < num_accounts {
            let mut key = [0u8; 32];
            rng.fill_bytes(&mut key);
            // keys outside the curve order are skipped, keeping the
            // population a pure function of the seed
            let Ok(signer) = PrivateKeySigner::from_slice(&key) else {
                continue;
            };
            addresses.push(signer.address());
            accounts.push(signer);
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(State {
                accounts,
                addresses,
                nonces: HashMap::new(),
                pending_submit: VecDeque::new(),
                pending_attributes: VecDeque::new(),
                next_account: 0,
                chain_id,
                gas_target,
            })),
        })
    }

    /// Stages one transfer from the prefunded key to every generated account.
    /// Returns the number of transfers and the hash of the last one, so the
    /// caller can wait for the whole batch to land.
    pub fn stage_funding(
        &self,
        funder: &PrivateKeySigner,
        start_nonce: u64,
        per_account: U256,
    ) -> Result<(usize, B256), Error> {
        let mut state = self.lock();
        let mut last_hash = B256::ZERO;
        let chain_id = state.chain_id;
        let recipients = state.addresses.clone();
        for (i, to) in recipients.iter().enumerate() {
            let nonce = start_nonce
                .checked_add(u64::try_from(i)?)
                .ok_or_else(|| anyhow!("funder nonce overflow"))?;
            let (raw, hash) = encode_transfer(funder, chain_id, nonce, *to, per_account)?;
            state.pending_submit.push_back(raw);
            last_hash = hash;
        }
        Ok((recipients.len(), last_hash))
    }

    pub fn account_count(&self) -> usize {
        self.lock().addresses.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Mempool for SyntheticMempool {
    async fn next_block(&mut self) -> Result<NextBlock, Error> {
        let mut state = self.lock();
        let attributes: Vec<Bytes> = state.pending_attributes.drain(..).collect();

        // staged transactions (funding batches) take the whole cycle
        if !state.pending_submit.is_empty() {
            let submit = state.pending_submit.drain(..).collect();
            return Ok(NextBlock { submit, attributes });
        }

        let submit = state.generate_transfers()?;
        Ok(NextBlock { submit, attributes })
    }

    fn add_transactions(&mut self, txs: Vec<Bytes>) {
        let mut state = self.lock();
        for tx in txs {
            if is_deposit(&tx) {
                state.pending_attributes.push_back(tx);
            } else {
                state.pending_submit.push_back(tx);
            }
        }
    }

    fn transaction_count(&self, address: Address) -> u64 {
        self.lock().nonces.get(&address).copied().unwrap_or(0)
    }
}

impl State {
    fn generate_transfers(&mut self) -> Result<Vec<Bytes>, Error> {
        let mut txs = Vec::new();
        let mut gas_used = 0u64;
        while gas_used < self.gas_target {
            let idx = self.next_account;
            let from = self.addresses[idx];
            let to = self.addresses[(idx + 1) % self.addresses.len()];
            let nonce = self.nonces.get(&from).copied().unwrap_or(0);

            let (raw, _) =
                encode_transfer(&self.accounts[idx], self.chain_id, nonce, to, U256::from(1))?;
            txs.push(raw);

            self.nonces.insert(from, nonce + 1);
            gas_used += TRANSFER_GAS;
            self.next_account = (idx + 1) % self.accounts.len();
        }
        Ok(txs)
    }
}

fn encode_transfer(
    signer: &PrivateKeySigner,
    chain_id: u64,
    nonce: u64,
    to: Address,
    value: U256,
) -> Result<(Bytes, B256), Error> {
    let tx = TxEip1559 {
        chain_id,
        nonce,
        gas_limit: TRANSFER_GAS,
        max_fee_per_gas: MAX_FEE_PER_GAS,
        max_priority_fee_per_gas: MAX_PRIORITY_FEE,
        to: TxKind::Call(to),
        value,
        ..Default::default()
    };

    let signature = signer.sign_hash_sync(&tx.signature_hash())?;
    let envelope: TxEnvelope = tx.into_signed(signature).into();
    let hash = *envelope.tx_hash();
    Ok((Bytes::from(envelope.encoded_2718()), hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mempool(gas_target: u64) -> SyntheticMempool {
        SyntheticMempool::new(100, 4, 1337, gas_target).expect("mempool")
    }

    #[tokio::test]
    async fn test_same_seed_produces_same_transactions() {
        let mut a = mempool(4 * TRANSFER_GAS);
        let mut b = mempool(4 * TRANSFER_GAS);

        let block_a = a.next_block().await.expect("next block");
        let block_b = b.next_block().await.expect("next block");
        assert_eq!(block_a.submit, block_b.submit);
        assert_eq!(block_a.submit.len(), 4);
    }

    #[tokio::test]
    async fn test_transfers_fill_gas_target_round_robin() {
        let mut mempool = mempool(5 * TRANSFER_GAS);
        let block = mempool.next_block().await.expect("next block");

        // 5 transfers over 4 accounts: the first account signed twice
        assert_eq!(block.submit.len(), 5);
        let first = mempool.lock().addresses[0];
        assert_eq!(mempool.transaction_count(first), 2);
    }

    #[tokio::test]
    async fn test_injected_deposits_go_into_attributes() {
        let mut mempool = mempool(TRANSFER_GAS);
        mempool.add_transactions(vec![
            Bytes::from(vec![0x7e, 0xaa]),
            Bytes::from(vec![0x02, 0xbb]),
        ]);

        let block = mempool.next_block().await.expect("next block");
        assert_eq!(block.attributes, vec![Bytes::from(vec![0x7e, 0xaa])]);
        // the injected regular tx preempts generated transfers
        assert_eq!(block.submit, vec![Bytes::from(vec![0x02, 0xbb])]);
    }

    #[tokio::test]
    async fn test_staged_funding_is_served_before_transfers() {
        let mempool = mempool(TRANSFER_GAS);
        let funder = PrivateKeySigner::random();

        let (count, last_hash) = mempool
            .stage_funding(&funder, 7, U256::from(1_000_000u64))
            .expect("stage funding");
        assert_eq!(count, 4);
        assert_ne!(last_hash, B256::ZERO);

        let mut handle = mempool.clone();
        let block = handle.next_block().await.expect("next block");
        assert_eq!(block.submit.len(), 4);
    }
}
