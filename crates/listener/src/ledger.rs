//! Ledger reader: chain height and logs for a block range.
//!
//! [HttpLedger] talks JSON-RPC over HTTP (eth_blockNumber, eth_getLogs). No retries here; the
//! coordinator owns retry policy.

use crate::abi::RawLog;
use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// Narrows eth_getLogs to one contract and one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFilter {
    pub address: [u8; 20],
    pub topic0: [u8; 32],
}

impl LogFilter {
    /// True if the log was emitted by the filtered contract with the filtered topic0.
    pub fn matches(&self, log: &RawLog) -> bool {
        let address_matches = log
            .address
            .as_deref()
            .and_then(|a| hex::decode(a.strip_prefix("0x").unwrap_or(a)).ok())
            .map(|b| b == self.address)
            .unwrap_or(false);
        address_matches && log.topic0() == Some(self.topic0)
    }
}

#[async_trait]
pub trait LedgerReader: Send + Sync {
    /// Latest block number.
    async fn current_height(&self) -> Result<u64, TransportError>;

    /// Logs in `[from_block, to_block]` matching `filter`, in ledger emission order.
    async fn logs_in_range(
        &self,
        from_block: u64,
        to_block: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawLog>, TransportError>;
}

fn build_logs_filter(filter: &LogFilter, from_block: u64, to_block: u64, with_topic: bool) -> Value {
    let mut params = json!({
        "address": format!("0x{}", hex::encode(filter.address)),
        "fromBlock": format!("0x{:x}", from_block),
        "toBlock": format!("0x{:x}", to_block),
    });
    // Single-topic filter: [topic0] only (some nodes reject [topic0, null, null, null]).
    if with_topic {
        params["topics"] = json!([format!("0x{}", hex::encode(filter.topic0))]);
    }
    params
}

async fn http_json_rpc(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Value,
    id: u64,
) -> Result<Value, TransportError> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params
    });
    let resp = client.post(url).json(&body).send().await?;
    let resp = resp.error_for_status()?;
    let json: Value = resp.json().await?;
    if let Some(err) = json.get("error") {
        return Err(TransportError::Rpc(err.to_string()));
    }
    json.get("result")
        .cloned()
        .ok_or_else(|| TransportError::Decode("Missing result".into()))
}

fn parse_quantity(v: &Value) -> Result<u64, TransportError> {
    let s = v
        .as_str()
        .ok_or_else(|| TransportError::Decode("blockNumber not string".into()))?;
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| TransportError::Decode(e.to_string()))
}

/// JSON-RPC ledger reader.
#[derive(Debug, Clone)]
pub struct HttpLedger {
    client: reqwest::Client,
    url: String,
}

impl HttpLedger {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().no_proxy().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn get_logs(&self, params: Value) -> Result<Vec<RawLog>, TransportError> {
        let result = http_json_rpc(&self.client, &self.url, "eth_getLogs", json!([params]), 2).await?;
        serde_json::from_value(result).map_err(|e| TransportError::Decode(format!("getLogs: {}", e)))
    }
}

#[async_trait]
impl LedgerReader for HttpLedger {
    async fn current_height(&self) -> Result<u64, TransportError> {
        let result = http_json_rpc(&self.client, &self.url, "eth_blockNumber", json!([]), 1).await?;
        parse_quantity(&result)
    }

    async fn logs_in_range(
        &self,
        from_block: u64,
        to_block: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawLog>, TransportError> {
        if from_block > to_block {
            return Err(TransportError::InvalidRange {
                from: from_block,
                to: to_block,
            });
        }
        match self.get_logs(build_logs_filter(filter, from_block, to_block, true)).await {
            Ok(logs) => Ok(logs),
            Err(TransportError::Rpc(e)) => {
                tracing::debug!(reason = %e, "eth_getLogs with topic filter failed, trying address-only");
                let raw = self
                    .get_logs(build_logs_filter(filter, from_block, to_block, false))
                    .await?;
                Ok(raw.into_iter().filter(|log| filter.matches(log)).collect())
            }
            Err(e) => Err(e),
        }
    }
}
