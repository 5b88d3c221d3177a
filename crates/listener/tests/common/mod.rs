//! Common helpers for integration tests.
//! Some helpers are only used by specific test binaries; allow dead_code to avoid per-binary warnings.
#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use listener::abi::{topic_from_signature, DEFAULT_EVENT_SIGNATURE};
use listener::{
    Ack, CheckpointStore, CoordinatorBuilder, LedgerReader, LogFilter, MemoryCheckpointStore,
    NormalizedEvent, PersistedState, PersistenceError, RawLog, RetryConfig, ScanError, SinkError,
    ShutdownHandle, SinkNotifier, TransportError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

pub const CONTRACT: [u8; 20] = [0x5f; 20];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("listener=debug".parse().unwrap()))
        .with_test_writer()
        .try_init();
}

pub fn filter() -> LogFilter {
    LogFilter {
        address: CONTRACT,
        topic0: topic_from_signature(DEFAULT_EVENT_SIGNATURE),
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        max_jitter: Duration::ZERO,
    }
}

/// Transaction hash whose every byte is `tx`.
pub fn tx_id(tx: u8) -> String {
    format!("0x{}", hex::encode([tx; 32]))
}

fn word(bytes: &[u8]) -> [u8; 32] {
    let mut w = [0u8; 32];
    w[32 - bytes.len()..].copy_from_slice(bytes);
    w
}

/// A well-formed TokensLocked log.
pub fn make_log(block: u64, log_index: u64, tx: u8) -> RawLog {
    let mut data = word(&(1000 + block).to_be_bytes()).to_vec();
    data.extend_from_slice(&word(&[0x89]));
    RawLog {
        address: Some(format!("0x{}", hex::encode(CONTRACT))),
        topics: vec![
            format!("0x{}", hex::encode(topic_from_signature(DEFAULT_EVENT_SIGNATURE))),
            format!("0x{}", hex::encode(word(&[0xaa; 20]))),
            format!("0x{}", hex::encode(word(&[0xbb; 20]))),
        ],
        data: Some(format!("0x{}", hex::encode(data))),
        block_number: Some(format!("0x{:x}", block)),
        transaction_hash: Some(tx_id(tx)),
        log_index: Some(format!("0x{:x}", log_index)),
        removed: false,
    }
}

pub fn rpc_log_json(log: &RawLog) -> serde_json::Value {
    serde_json::json!({
        "address": log.address,
        "topics": log.topics,
        "data": log.data,
        "blockNumber": log.block_number,
        "transactionHash": log.transaction_hash,
        "logIndex": log.log_index,
        "removed": log.removed,
    })
}

#[derive(Default)]
struct LedgerState {
    height: u64,
    logs: Vec<(u64, RawLog)>,
    /// Remaining calls (height or logs) that fail before the ledger recovers.
    failures: u32,
    requested: Vec<(u64, u64)>,
}

/// Scriptable in-memory ledger. Clones share state.
#[derive(Clone, Default)]
pub struct FakeLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl FakeLedger {
    pub fn new(height: u64) -> Self {
        let ledger = Self::default();
        ledger.set_height(height);
        ledger
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    pub fn push_log(&self, log: RawLog) {
        let block = u64::from_str_radix(
            log.block_number.as_deref().unwrap_or("0x0").trim_start_matches("0x"),
            16,
        )
        .unwrap_or(0);
        self.state.lock().unwrap().logs.push((block, log));
    }

    /// Put a log at `block` regardless of what its own fields say.
    pub fn push_log_at(&self, block: u64, log: RawLog) {
        self.state.lock().unwrap().logs.push((block, log));
    }

    pub fn fail_next(&self, n: u32) {
        self.state.lock().unwrap().failures = n;
    }

    /// Ranges passed to logs_in_range, in call order.
    pub fn requested_ranges(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().requested.clone()
    }

    fn take_failure(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        if s.failures > 0 {
            s.failures -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl LedgerReader for FakeLedger {
    async fn current_height(&self) -> Result<u64, TransportError> {
        if self.take_failure() {
            return Err(TransportError::Rpc("connection refused".into()));
        }
        Ok(self.state.lock().unwrap().height)
    }

    async fn logs_in_range(
        &self,
        from_block: u64,
        to_block: u64,
        _filter: &LogFilter,
    ) -> Result<Vec<RawLog>, TransportError> {
        if from_block > to_block {
            return Err(TransportError::InvalidRange {
                from: from_block,
                to: to_block,
            });
        }
        if self.take_failure() {
            return Err(TransportError::Rpc("connection refused".into()));
        }
        let mut s = self.state.lock().unwrap();
        s.requested.push((from_block, to_block));
        Ok(s
            .logs
            .iter()
            .filter(|(b, _)| *b >= from_block && *b <= to_block)
            .map(|(_, l)| l.clone())
            .collect())
    }
}

/// How the fake sink answers for one transaction.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Accept,
    Reject(u16),
    /// Transient failure this many times, then accept.
    FailTimes(u32),
    AlwaysFail,
    /// Never answer (exercises the call timeout).
    Hang,
}

#[derive(Default)]
struct SinkState {
    behaviors: HashMap<String, Behavior>,
    attempts: Vec<String>,
    delivered: Vec<NormalizedEvent>,
    shutdown_on: Option<(String, ShutdownHandle)>,
}

/// Scriptable in-memory sink. Clones share state.
#[derive(Clone, Default)]
pub struct FakeSink {
    state: Arc<Mutex<SinkState>>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn behave(&self, tx: u8, behavior: Behavior) {
        self.state.lock().unwrap().behaviors.insert(tx_id(tx), behavior);
    }

    /// Request shutdown while `tx` is being delivered.
    pub fn shutdown_during(&self, tx: u8, handle: ShutdownHandle) {
        self.state.lock().unwrap().shutdown_on = Some((tx_id(tx), handle));
    }

    /// Every deliver() call, by tx id.
    pub fn attempts(&self) -> Vec<String> {
        self.state.lock().unwrap().attempts.clone()
    }

    /// Acknowledged events, in delivery order.
    pub fn delivered(&self) -> Vec<NormalizedEvent> {
        self.state.lock().unwrap().delivered.clone()
    }

    pub fn delivered_ids(&self) -> Vec<String> {
        self.delivered().iter().map(|e| e.tx_id()).collect()
    }
}

#[async_trait]
impl SinkNotifier for FakeSink {
    async fn deliver(&self, event: &NormalizedEvent) -> Result<Ack, SinkError> {
        let id = event.tx_id();
        let behavior = {
            let mut s = self.state.lock().unwrap();
            s.attempts.push(id.clone());
            if let Some((target, handle)) = &s.shutdown_on {
                if *target == id {
                    handle.trigger();
                }
            }
            let b = s.behaviors.get(&id).copied().unwrap_or(Behavior::Accept);
            if let Behavior::FailTimes(n) = b {
                let next = if n > 1 { Behavior::FailTimes(n - 1) } else { Behavior::Accept };
                s.behaviors.insert(id.clone(), next);
            }
            b
        };
        match behavior {
            Behavior::Accept => {
                self.state.lock().unwrap().delivered.push(event.clone());
                Ok(Ack {
                    status: 202,
                    body: "{\"queued\":true}".into(),
                })
            }
            Behavior::Reject(status) => Err(SinkError::Rejected {
                status,
                body: "{\"error\":\"unsupported token\"}".into(),
            }),
            Behavior::FailTimes(_) | Behavior::AlwaysFail => Err(SinkError::Delivery("relayer returned 503".into())),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Memory store that refuses any save moving the cursor past `fail_above`,
/// simulating a crash between delivery and the batch checkpoint.
#[derive(Clone)]
pub struct CrashingStore {
    pub inner: MemoryCheckpointStore,
    pub fail_above: u64,
}

impl CheckpointStore for CrashingStore {
    fn load(&self) -> Result<Option<PersistedState>, ScanError> {
        self.inner.load()
    }

    fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        if state.last_scanned_block > self.fail_above {
            return Err(PersistenceError::Write {
                path: "memory".into(),
                source: std::io::Error::other("disk full"),
            });
        }
        self.inner.save(state)
    }
}

/// Builder wired to the fakes with fast retries and depth 5.
pub fn builder(ledger: &FakeLedger, sink: &FakeSink, store: impl CheckpointStore + 'static) -> CoordinatorBuilder {
    CoordinatorBuilder::new()
        .ledger(ledger.clone())
        .sink(sink.clone())
        .store(store)
        .filter(filter())
        .confirmation_depth(5)
        .poll_interval(Duration::from_millis(10))
        .call_timeout(Duration::from_secs(2))
        .retry(fast_retry(3))
}

/// One recorded HTTP request.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub path: String,
    pub body: String,
}

type Handler = Arc<dyn Fn(&str) -> (u16, String) + Send + Sync>;

#[derive(Clone)]
struct StubState {
    handler: Handler,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

async fn stub_handler(State(state): State<StubState>, uri: Uri, body: Bytes) -> impl IntoResponse {
    let body = String::from_utf8_lossy(&body).to_string();
    let (status, reply) = (state.handler)(&body);
    state.requests.lock().unwrap().push(Recorded {
        path: uri.path().to_string(),
        body,
    });
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, "application/json")], reply)
}

/// Local HTTP server answering every request with `handler(body)`.
pub struct StubServer {
    pub url: String,
    pub requests: Arc<Mutex<Vec<Recorded>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl StubServer {
    pub async fn start<F>(handler: F) -> Result<StubServer>
    where
        F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.context("bind stub server")?;
        let url = format!("http://{}", listener.local_addr()?);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = StubState {
            handler: Arc::new(handler),
            requests: Arc::clone(&requests),
        };
        let app = Router::new().fallback(stub_handler).with_state(state);
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::warn!(reason = %e, "stub server stopped");
            }
        });
        Ok(StubServer { url, requests, task })
    }

    pub fn bodies(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|r| r.body.clone()).collect()
    }
}
