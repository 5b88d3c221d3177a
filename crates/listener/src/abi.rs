//! ABI types and decoding for the bridge contract.
//!
//! TokensLocked event. Decode from the JSON-RPC log shape returned by eth_getLogs.

use crate::error::MalformedLogError;
use alloy::primitives::{Address, B256, U256};
use serde::Deserialize;
use sha3::{Digest, Keccak256};

/// `TokensLocked(address indexed user, address indexed token, uint256 amount, uint256 destinationChainId)`.
pub const DEFAULT_EVENT_SIGNATURE: &str = "TokensLocked(address,address,uint256,uint256)";

/// keccak256 of an event signature, i.e. its topic0.
pub fn topic_from_signature(signature: &str) -> [u8; 32] {
    let digest = Keccak256::digest(signature.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Raw log as returned by the ledger. Fields are kept as sent; [normalize] validates them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub data: Option<String>,
    pub block_number: Option<String>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<String>,
    /// Set by nodes for logs dropped by a reorg.
    #[serde(default)]
    pub removed: bool,
}

impl RawLog {
    /// topic0 bytes, if present and well-formed.
    pub fn topic0(&self) -> Option<[u8; 32]> {
        let t0 = self.topics.first()?;
        parse_hex_bytes_32(t0, "topic0").ok()
    }
}

/// Structured TokensLocked event with chain metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub tx_hash: B256,
    pub block_number: u64,
    pub log_index: u64,
    /// Contract that emitted the log.
    pub source_address: Address,
    pub user: Address,
    pub token: Address,
    pub amount: U256,
    pub destination_chain_id: U256,
}

impl NormalizedEvent {
    /// Dedup key: lowercase 0x-prefixed transaction hash.
    pub fn tx_id(&self) -> String {
        format!("0x{}", hex::encode(self.tx_hash))
    }

    /// Ledger emission order.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// Decode a raw log into a [NormalizedEvent].
pub fn normalize(log: &RawLog) -> Result<NormalizedEvent, MalformedLogError> {
    let block_number = parse_hex_u64(required(&log.block_number, "blockNumber")?, "blockNumber")?;
    let log_index = parse_hex_u64(required(&log.log_index, "logIndex")?, "logIndex")?;
    let tx_hash = parse_hex_bytes_32(required(&log.transaction_hash, "transactionHash")?, "transactionHash")?;
    let source_address = parse_address(required(&log.address, "address")?, "address")?;
    if log.topics.len() < 3 {
        return Err(MalformedLogError::new(format!(
            "expected at least 3 topics, got {}",
            log.topics.len()
        )));
    }
    // user and token are indexed: topics[1], topics[2].
    let user = parse_address(&log.topics[1], "topic1")?;
    let token = parse_address(&log.topics[2], "topic2")?;
    let data = parse_hex_bytes(required(&log.data, "data")?, "data")?;
    if data.len() < 64 {
        return Err(MalformedLogError::new(format!(
            "data too short for (uint256, uint256): {} bytes",
            data.len()
        )));
    }
    let amount = U256::from_be_slice(&data[0..32]);
    let destination_chain_id = U256::from_be_slice(&data[32..64]);

    Ok(NormalizedEvent {
        tx_hash: B256::from(tx_hash),
        block_number,
        log_index,
        source_address,
        user,
        token,
        amount,
        destination_chain_id,
    })
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str, MalformedLogError> {
    field
        .as_deref()
        .ok_or_else(|| MalformedLogError::new(format!("missing {}", name)))
}

fn parse_hex_u64(s: &str, name: &str) -> Result<u64, MalformedLogError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| MalformedLogError::new(format!("{}: {}", name, e)))
}

fn parse_hex_bytes(s: &str, name: &str) -> Result<Vec<u8>, MalformedLogError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|e| MalformedLogError::new(format!("{}: {}", name, e)))
}

fn parse_hex_bytes_32(s: &str, name: &str) -> Result<[u8; 32], MalformedLogError> {
    let bytes = parse_hex_bytes(s, name)?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        MalformedLogError::new(format!("{}: expected 32 bytes, got {}", name, b.len()))
    })
}

fn parse_address(s: &str, name: &str) -> Result<Address, MalformedLogError> {
    let bytes = parse_hex_bytes(s, name)?;
    match bytes.len() {
        20 => Ok(Address::from_slice(&bytes)),
        // Indexed address in EVM is a 32-byte word; take last 20.
        32 => Ok(Address::from_slice(&bytes[12..32])),
        n => Err(MalformedLogError::new(format!(
            "{}: expected 20 or 32 bytes for address, got {}",
            name, n
        ))),
    }
}
