use crate::mempool::DEPOSIT_TX_TYPE;
use alloy::primitives::{Address, B64, B256, Bytes, U64, U256, address, keccak256};
use alloy_rlp::{Encodable, RlpEncodable};
use common::engine::types::PayloadAttributes;
use lazy_static::lazy_static;

/// Predeploy that receives the L1-context call at the top of every block.
const L1_BLOCK_CONTRACT: Address = address!("4200000000000000000000000000000000000015");
/// Magic sender of L1-info deposits.
const L1_INFO_DEPOSITOR: Address = address!("DeaDDEaDDeAdDeAdDEAdDEaddeAddEAdDEAd0001");
const L1_INFO_TX_GAS: u64 = 1_000_000;
const MINT_DEPOSIT_GAS: u64 = 21_000;

const FEE_RECIPIENT: Address = address!("4300000000000000000000000000000000000000");

/// EIP-1559 denominator 250 / elasticity 6, big-endian u32 pairs.
const EIP_1559_PARAMS: B64 = B64::new([0, 0, 0, 250, 0, 0, 0, 6]);

// deposit source-hash domains
const USER_DEPOSIT_DOMAIN: u64 = 0;
const L1_INFO_DEPOSIT_DOMAIN: u64 = 1;

lazy_static! {
    static ref L1_INFO_SELECTOR: [u8; 4] = {
        let hash = keccak256(b"setL1BlockValuesIsthmus()");
        [hash[0], hash[1], hash[2], hash[3]]
    };
}

/// L1-context metadata the sequencer stamps into every block it builds.
#[derive(Debug, Clone)]
pub struct L1BlockInfo {
    pub number: u64,
    pub time: u64,
    pub block_hash: B256,
    pub base_fee: U256,
    pub blob_base_fee: U256,
    pub batcher_address: Address,
    pub sequence_number: u64,
    pub base_fee_scalar: u32,
    pub blob_base_fee_scalar: u32,
    pub operator_fee_scalar: u32,
    pub operator_fee_constant: u64,
}

#[derive(RlpEncodable)]
struct DepositTransaction {
    source_hash: B256,
    from: Address,
    to: Address,
    mint: U256,
    value: U256,
    gas: u64,
    is_system_tx: bool,
    data: Bytes,
}

impl DepositTransaction {
    fn encoded(&self) -> Bytes {
        let mut out = vec![DEPOSIT_TX_TYPE];
        self.encode(&mut out);
        Bytes::from(out)
    }
}

fn source_hash(domain: u64, inner: B256) -> B256 {
    keccak256([B256::from(U256::from(domain)).as_slice(), inner.as_slice()].concat())
}

fn l1_info_source_hash(l1_block_hash: B256, sequence_number: u64) -> B256 {
    let inner = keccak256(
        [
            l1_block_hash.as_slice(),
            B256::from(U256::from(sequence_number)).as_slice(),
        ]
        .concat(),
    );
    source_hash(L1_INFO_DEPOSIT_DOMAIN, inner)
}

/// Fixed binary calldata layout: 4-byte selector, then big-endian scalars,
/// uint256 fees, the L1 block hash and the batcher address padded to 32
/// bytes, and the operator fee pair.
fn encode_l1_info_data(info: &L1BlockInfo) -> Bytes {
    let mut data = Vec::with_capacity(176);
    data.extend_from_slice(&*L1_INFO_SELECTOR);
    data.extend_from_slice(&info.base_fee_scalar.to_be_bytes());
    data.extend_from_slice(&info.blob_base_fee_scalar.to_be_bytes());
    data.extend_from_slice(&info.sequence_number.to_be_bytes());
    data.extend_from_slice(&info.time.to_be_bytes());
    data.extend_from_slice(&info.number.to_be_bytes());
    data.extend_from_slice(&info.base_fee.to_be_bytes::<32>());
    data.extend_from_slice(&info.blob_base_fee.to_be_bytes::<32>());
    data.extend_from_slice(info.block_hash.as_slice());
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(info.batcher_address.as_slice());
    data.extend_from_slice(&info.operator_fee_scalar.to_be_bytes());
    data.extend_from_slice(&info.operator_fee_constant.to_be_bytes());
    Bytes::from(data)
}

pub fn l1_info_deposit_tx(info: &L1BlockInfo) -> Bytes {
    DepositTransaction {
        source_hash: l1_info_source_hash(info.block_hash, info.sequence_number),
        from: L1_INFO_DEPOSITOR,
        to: L1_BLOCK_CONTRACT,
        mint: U256::ZERO,
        value: U256::ZERO,
        gas: L1_INFO_TX_GAS,
        is_system_tx: false,
        data: encode_l1_info_data(info),
    }
    .encoded()
}

/// Deposit that mints `amount` straight to `recipient`, used to seed the
/// prefunded benchmark account. Returns the raw tx and its hash.
pub fn mint_deposit_tx(recipient: Address, amount: U256, entropy: B256) -> (Bytes, B256) {
    let raw = DepositTransaction {
        source_hash: source_hash(USER_DEPOSIT_DOMAIN, entropy),
        from: recipient,
        to: recipient,
        mint: amount,
        value: U256::ZERO,
        gas: MINT_DEPOSIT_GAS,
        is_system_tx: false,
        data: Bytes::new(),
    }
    .encoded();
    let hash = keccak256(&raw);
    (raw, hash)
}

/// Attributes for the next block: the L1-info deposit always leads, then any
/// forced transactions from the mempool. The pool stays open so submitted
/// load is picked up by the builder.
pub fn build_attributes(
    timestamp: u64,
    gas_limit: u64,
    info: &L1BlockInfo,
    forced_txs: Vec<Bytes>,
) -> PayloadAttributes {
    let mut transactions = Vec::with_capacity(1 + forced_txs.len());
    transactions.push(l1_info_deposit_tx(info));
    transactions.extend(forced_txs);

    PayloadAttributes {
        timestamp: U64::from(timestamp),
        prev_randao: B256::ZERO,
        suggested_fee_recipient: FEE_RECIPIENT,
        withdrawals: Vec::new(),
        parent_beacon_block_root: B256::ZERO,
        transactions,
        no_tx_pool: false,
        gas_limit: U64::from(gas_limit),
        eip_1559_params: EIP_1559_PARAMS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> L1BlockInfo {
        L1BlockInfo {
            number: 100,
            time: 1_700_000_000,
            block_hash: B256::repeat_byte(0x11),
            base_fee: U256::from(7u64),
            blob_base_fee: U256::from(1u64),
            batcher_address: Address::repeat_byte(0x22),
            sequence_number: 3,
            base_fee_scalar: 1368,
            blob_base_fee_scalar: 810949,
            operator_fee_scalar: 0,
            operator_fee_constant: 0,
        }
    }

    #[test]
    fn test_l1_info_calldata_layout() {
        let data = encode_l1_info_data(&info());
        assert_eq!(data.len(), 176);
        assert_eq!(&data[..4], &*L1_INFO_SELECTOR);
        // baseFeeScalar at offset 4
        assert_eq!(&data[4..8], &1368u32.to_be_bytes());
        // sequence number at offset 12
        assert_eq!(&data[12..20], &3u64.to_be_bytes());
        // batcher address left-padded into the 32 bytes at offset 132
        assert_eq!(&data[132..144], &[0u8; 12]);
        assert_eq!(&data[144..164], Address::repeat_byte(0x22).as_slice());
    }

    #[test]
    fn test_l1_info_tx_is_deposit_typed() {
        let raw = l1_info_deposit_tx(&info());
        assert_eq!(raw[0], DEPOSIT_TX_TYPE);
    }

    #[test]
    fn test_source_hash_depends_on_sequence_number() {
        let a = l1_info_source_hash(B256::ZERO, 0);
        let b = l1_info_source_hash(B256::ZERO, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_mint_deposit_hash_matches_encoding() {
        let recipient = Address::repeat_byte(0x33);
        let (raw, hash) = mint_deposit_tx(recipient, U256::from(10u64), B256::ZERO);
        assert_eq!(raw[0], DEPOSIT_TX_TYPE);
        assert_eq!(hash, keccak256(&raw));
    }

    #[test]
    fn test_attributes_lead_with_l1_info() {
        let forced = vec![Bytes::from(vec![0x7e, 0xff])];
        let attributes = build_attributes(1_700_000_123, 30_000_000, &info(), forced);

        assert_eq!(attributes.transactions.len(), 2);
        assert_eq!(attributes.transactions[0][0], DEPOSIT_TX_TYPE);
        assert_eq!(attributes.transactions[1], Bytes::from(vec![0x7e, 0xff]));
        assert!(!attributes.no_tx_pool);
        assert_eq!(attributes.gas_limit, U64::from(30_000_000u64));
    }
}
