//! Sink notifier: hands a normalized event to the destination-chain relayer.
//!
//! [HttpSink] POSTs one JSON request per event. 2xx is an acknowledgement; 408/429/5xx and
//! transport failures are transient; any other status is a permanent rejection.

use crate::abi::NormalizedEvent;
use crate::error::SinkError;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Sink acknowledgement. The coordinator only relies on its presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait SinkNotifier: Send + Sync {
    async fn deliver(&self, event: &NormalizedEvent) -> Result<Ack, SinkError>;
}

/// Request body sent to the relayer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub source_transaction_hash: String,
    pub source_block_number: u64,
    pub recipient: String,
    pub token_address: String,
    /// Decimal string; uint256 does not fit a JSON number.
    pub amount: String,
    pub target_chain_id: String,
}

impl RelayRequest {
    pub fn from_event(ev: &NormalizedEvent) -> Self {
        Self {
            source_transaction_hash: ev.tx_id(),
            source_block_number: ev.block_number,
            recipient: format!("0x{}", hex::encode(ev.user)),
            token_address: format!("0x{}", hex::encode(ev.token)),
            amount: ev.amount.to_string(),
            target_chain_id: ev.destination_chain_id.to_string(),
        }
    }
}

/// How a sink HTTP status is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Accepted,
    Transient,
    Rejected,
}

pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Accepted,
        408 | 429 => StatusClass::Transient,
        500..=599 => StatusClass::Transient,
        _ => StatusClass::Rejected,
    }
}

/// HTTP relayer client.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl SinkNotifier for HttpSink {
    async fn deliver(&self, event: &NormalizedEvent) -> Result<Ack, SinkError> {
        let request = RelayRequest::from_event(event);
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| SinkError::Delivery(format!("relayer request failed: {}", e)))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| SinkError::Delivery(format!("relayer response body: {}", e)))?;
        match classify_status(status) {
            StatusClass::Accepted => Ok(Ack { status, body }),
            StatusClass::Transient => Err(SinkError::Delivery(format!("relayer returned {}: {}", status, body))),
            StatusClass::Rejected => Err(SinkError::Rejected { status, body }),
        }
    }
}
