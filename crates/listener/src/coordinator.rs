//! Scan coordinator: the scan → confirm → deliver → checkpoint loop.
//!
//! One loop owns the cursor and the processed-transaction set. Each iteration reads the chain
//! height, derives the final range from the [Strategy], fetches and normalizes logs batch by
//! batch, delivers each new event to the sink, and only then advances and persists the cursor.
//! A crash anywhere before the batch checkpoint makes the next run rescan the same range; the
//! processed set (persisted after every terminal outcome) absorbs the overlap.
//!
//! Only persistence and configuration failures stop the loop ([ScanError]). Ledger and transient
//! sink failures abandon the iteration with the cursor untouched and are retried next poll.

use crate::abi::{normalize, NormalizedEvent};
use crate::backoff;
use crate::checkpoint::{CheckpointStore, FileCheckpointStore, PersistedState};
use crate::config::{
    ListenerConfig, RetryConfig, DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_CONFIRMATION_BLOCKS,
    DEFAULT_DEDUP_RETENTION_BLOCKS, DEFAULT_MAX_BLOCK_RANGE, DEFAULT_POLL_INTERVAL_SECS,
};
use crate::cursor::{Cursor, StartPoint};
use crate::dedup::ProcessedSet;
use crate::error::{ConfigurationError, IterationError, ScanError, SinkError, TransportError};
use crate::finality::{plan_range, BlockRange, ConfirmationDepth, Strategy};
use crate::ledger::{HttpLedger, LedgerReader, LogFilter};
use crate::sink::{Ack, HttpSink, SinkNotifier};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Polling,
    Scanning,
    Processing,
    Checkpointing,
    ShuttingDown,
    Stopped,
}

/// Receiving side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Sending side of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn channel() -> (ShutdownHandle, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownHandle { tx }, Shutdown { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Shutdown {
        Self::channel().1
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested. Pends forever if the handle is gone.
    pub async fn requested(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Counters for one checkpointed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub delivered: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub malformed: usize,
}

impl BatchStats {
    fn add(&mut self, other: BatchStats) {
        self.delivered += other.delivered;
        self.rejected += other.rejected;
        self.duplicates += other.duplicates;
        self.malformed += other.malformed;
    }
}

/// Result of one iteration that did not hit a fatal error.
#[derive(Debug)]
pub enum IterationOutcome {
    /// Nothing new is final yet.
    Idle { latest: u64, safe_head: u64 },
    /// `range` fully processed; cursor now at `range.to`.
    Advanced { range: BlockRange, stats: BatchStats },
    /// Shutdown observed before the range completed. Completed batches are checkpointed.
    Interrupted { cursor: Cursor },
    /// Ledger or sink kept failing; cursor unchanged.
    Aborted(IterationError),
}

enum Delivery {
    Acked(Ack),
    Rejected { status: u16, body: String },
}

/// Builder for the coordinator.
pub struct CoordinatorBuilder {
    ledger: Option<Box<dyn LedgerReader>>,
    sink: Option<Box<dyn SinkNotifier>>,
    store: Option<Box<dyn CheckpointStore>>,
    strategy: Option<Box<dyn Strategy>>,
    filter: Option<LogFilter>,
    start_block: Option<u64>,
    poll_interval: Duration,
    max_block_range: u64,
    call_timeout: Duration,
    retention_blocks: u64,
    retry: RetryConfig,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            ledger: None,
            sink: None,
            store: None,
            strategy: None,
            filter: None,
            start_block: None,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_block_range: DEFAULT_MAX_BLOCK_RANGE,
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            retention_blocks: DEFAULT_DEDUP_RETENTION_BLOCKS,
            retry: RetryConfig::default(),
        }
    }

    /// Tuning, filter and start block from a config. Collaborators are still required.
    pub fn from_config(config: &ListenerConfig) -> Self {
        Self::new()
            .confirmation_depth(config.confirmation_depth)
            .filter(LogFilter {
                address: config.contract_address,
                topic0: config.event_topic,
            })
            .poll_interval(config.poll_interval)
            .max_block_range(config.max_block_range)
            .call_timeout(config.call_timeout)
            .retention_blocks(config.dedup_retention_blocks)
            .retry(config.retry.clone())
            .start_block(config.start_block)
    }

    pub fn ledger(mut self, ledger: impl LedgerReader + 'static) -> Self {
        self.ledger = Some(Box::new(ledger));
        self
    }

    pub fn sink(mut self, sink: impl SinkNotifier + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn store(mut self, store: impl CheckpointStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Set the finality strategy (stored as `Box<dyn Strategy>`).
    pub fn strategy(mut self, s: impl Strategy + 'static) -> Self {
        self.strategy = Some(Box::new(s));
        self
    }

    /// Convenience: equivalent to `.strategy(ConfirmationDepth(k))`.
    pub fn confirmation_depth(mut self, k: u64) -> Self {
        self.strategy = Some(Box::new(ConfirmationDepth(k)));
        self
    }

    pub fn filter(mut self, filter: LogFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Cursor height when the store is empty; scanning begins at the next block. `None` uses the
    /// current chain height.
    pub fn start_block(mut self, block: Option<u64>) -> Self {
        self.start_block = block;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    pub fn max_block_range(mut self, n: u64) -> Self {
        self.max_block_range = n;
        self
    }

    pub fn call_timeout(mut self, d: Duration) -> Self {
        self.call_timeout = d;
        self
    }

    pub fn retention_blocks(mut self, n: u64) -> Self {
        self.retention_blocks = n;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Result<Coordinator, ConfigurationError> {
        let ledger = self.ledger.ok_or(ConfigurationError::Missing("ledger"))?;
        let sink = self.sink.ok_or(ConfigurationError::Missing("sink"))?;
        let store = self.store.ok_or(ConfigurationError::Missing("checkpoint store"))?;
        let filter = self.filter.ok_or(ConfigurationError::Missing("log filter"))?;
        let strategy = self
            .strategy
            .unwrap_or_else(|| Box::new(ConfirmationDepth(DEFAULT_CONFIRMATION_BLOCKS)));
        if self.max_block_range == 0 {
            return Err(ConfigurationError::Invalid {
                key: "MAX_BLOCK_RANGE",
                reason: "must be greater than 0".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigurationError::Invalid {
                key: "MAX_DELIVERY_ATTEMPTS",
                reason: "must be greater than 0".into(),
            });
        }
        Ok(Coordinator {
            ledger,
            sink,
            store,
            strategy,
            filter,
            start_block: self.start_block,
            poll_interval: self.poll_interval,
            max_block_range: self.max_block_range,
            call_timeout: self.call_timeout,
            retention_blocks: self.retention_blocks,
            retry: self.retry,
            cursor: Cursor::default(),
            processed: ProcessedSet::new(),
            phase: Phase::Initializing,
            initialized: false,
        })
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the cursor and drives the scan loop.
pub struct Coordinator {
    ledger: Box<dyn LedgerReader>,
    sink: Box<dyn SinkNotifier>,
    store: Box<dyn CheckpointStore>,
    strategy: Box<dyn Strategy>,
    filter: LogFilter,
    start_block: Option<u64>,
    poll_interval: Duration,
    max_block_range: u64,
    call_timeout: Duration,
    retention_blocks: u64,
    retry: RetryConfig,
    cursor: Cursor,
    processed: ProcessedSet,
    phase: Phase,
    initialized: bool,
}

impl Coordinator {
    /// HTTP ledger, HTTP sink and file store, all from `config`.
    pub fn from_config(config: &ListenerConfig) -> Result<Coordinator, ConfigurationError> {
        config.validate()?;
        let ledger = HttpLedger::new(&config.rpc_url, config.call_timeout).map_err(|e| {
            ConfigurationError::Invalid {
                key: "SOURCE_CHAIN_RPC_URL",
                reason: e.to_string(),
            }
        })?;
        let sink = HttpSink::new(&config.relayer_endpoint, config.call_timeout).map_err(|e| {
            ConfigurationError::Invalid {
                key: "RELAYER_API_ENDPOINT",
                reason: e.to_string(),
            }
        })?;
        let store = FileCheckpointStore::new(&config.state_file);
        tracing::debug!(path = %store.path().display(), "using file checkpoint store");
        CoordinatorBuilder::from_config(config)
            .ledger(ledger)
            .sink(sink)
            .store(store)
            .build()
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn processed(&self) -> &ProcessedSet {
        &self.processed
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::trace!(from = ?self.phase, to = ?phase, "phase");
            self.phase = phase;
        }
    }

    /// Decide where to start: persisted state if present, else the configured start height, else
    /// the current chain height. A fresh start is persisted immediately. Ledger failures while
    /// reading the height are retried until the ledger answers.
    pub async fn init(&mut self) -> Result<StartPoint, ScanError> {
        self.set_phase(Phase::Initializing);
        let start = match self.store.load()? {
            Some(state) => StartPoint::Resumed {
                cursor: Cursor::new(state.last_scanned_block),
                processed: state.processed_transactions,
            },
            None => {
                let start_height = match self.start_block {
                    Some(b) => b,
                    None => self.current_height_with_retry().await,
                };
                StartPoint::Fresh { start_height }
            }
        };
        self.cursor = start.cursor();
        match &start {
            StartPoint::Resumed { processed, .. } => {
                self.processed =
                    ProcessedSet::from_persisted(processed.iter().cloned(), self.cursor.last_scanned_block);
                tracing::info!(
                    cursor = self.cursor.last_scanned_block,
                    processed = self.processed.len(),
                    "resuming from persisted state"
                );
            }
            StartPoint::Fresh { start_height } => {
                self.processed = ProcessedSet::new();
                tracing::info!(start_height, next_block = self.cursor.next_block(), "no persisted state, starting fresh");
                self.persist()?;
            }
        }
        self.initialized = true;
        self.set_phase(Phase::Polling);
        Ok(start)
    }

    async fn current_height_with_retry(&self) -> u64 {
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            let result = timeout(self.call_timeout, self.ledger.current_height())
                .await
                .unwrap_or_else(|_| Err(TransportError::Timeout(self.call_timeout)));
            match result {
                Ok(latest) => return latest,
                Err(e) => {
                    let wait = backoff::delay(&self.retry, attempt);
                    tracing::warn!(attempt, reason = %e, wait_ms = wait.as_millis() as u64, "could not read chain height at startup");
                    sleep(wait).await;
                }
            }
        }
    }

    /// Run until shutdown or a fatal error. On shutdown the current state is persisted.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> Result<(), ScanError> {
        if !self.initialized {
            let started = tokio::select! {
                r = self.init() => Some(r?),
                _ = shutdown.requested() => None,
            };
            if started.is_none() {
                tracing::info!("shutdown requested before startup completed");
                self.set_phase(Phase::Stopped);
                return Ok(());
            }
        }
        tracing::info!(
            cursor = self.cursor.last_scanned_block,
            next_block = self.cursor.next_block(),
            "scan loop started"
        );
        loop {
            if shutdown.is_requested() {
                break;
            }
            match self.run_iteration(&mut shutdown).await {
                Ok(IterationOutcome::Idle { latest, safe_head }) => {
                    tracing::debug!(latest, safe_head, cursor = self.cursor.last_scanned_block, "no new final blocks");
                }
                Ok(IterationOutcome::Advanced { range, stats }) => {
                    tracing::info!(
                        from = range.from,
                        to = range.to,
                        delivered = stats.delivered,
                        rejected = stats.rejected,
                        duplicates = stats.duplicates,
                        malformed = stats.malformed,
                        "range processed"
                    );
                }
                Ok(IterationOutcome::Interrupted { .. }) => break,
                Ok(IterationOutcome::Aborted(e)) => {
                    tracing::error!(reason = %e, cursor = self.cursor.last_scanned_block, "iteration aborted, range will be retried");
                }
                Err(e) => {
                    tracing::error!(reason = %e, "fatal error, stopping");
                    self.set_phase(Phase::Stopped);
                    return Err(e);
                }
            }
            self.set_phase(Phase::Polling);
            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                _ = shutdown.requested() => break,
            }
        }
        self.set_phase(Phase::ShuttingDown);
        self.persist()?;
        self.set_phase(Phase::Stopped);
        tracing::info!(cursor = self.cursor.last_scanned_block, "stopped");
        Ok(())
    }

    /// One pass of the algorithm. `Err` only for fatal errors.
    pub async fn run_iteration(&mut self, shutdown: &mut Shutdown) -> Result<IterationOutcome, ScanError> {
        self.set_phase(Phase::Polling);
        let latest = match ledger_call(&self.retry, self.call_timeout, "eth_blockNumber", shutdown, || {
            self.ledger.current_height()
        })
        .await
        {
            Ok(Some(latest)) => latest,
            Ok(None) => return Ok(IterationOutcome::Interrupted { cursor: self.cursor }),
            Err(e) => return Ok(IterationOutcome::Aborted(e)),
        };
        let cursor = self.cursor.last_scanned_block;
        let Some(range) = plan_range(cursor, latest, self.strategy.as_ref()) else {
            return Ok(IterationOutcome::Idle {
                latest,
                safe_head: self.strategy.safe_head(latest),
            });
        };
        tracing::info!(from = range.from, to = range.to, blocks = range.block_count(), latest, "scanning final range");

        let mut total = BatchStats::default();
        for batch in range.batches(self.max_block_range) {
            if shutdown.is_requested() {
                return Ok(IterationOutcome::Interrupted { cursor: self.cursor });
            }
            match self.process_batch(batch, latest, shutdown).await? {
                Ok(stats) => total.add(stats),
                Err(outcome) => return Ok(outcome),
            }
        }
        Ok(IterationOutcome::Advanced { range, stats: total })
    }

    /// Scan, deliver and checkpoint one batch. The inner `Err` carries a non-fatal early exit.
    async fn process_batch(
        &mut self,
        batch: BlockRange,
        latest: u64,
        shutdown: &mut Shutdown,
    ) -> Result<Result<BatchStats, IterationOutcome>, ScanError> {
        self.set_phase(Phase::Scanning);
        let filter = self.filter;
        let logs = match ledger_call(&self.retry, self.call_timeout, "eth_getLogs", shutdown, || {
            self.ledger.logs_in_range(batch.from, batch.to, &filter)
        })
        .await
        {
            Ok(Some(logs)) => logs,
            Ok(None) => return Ok(Err(IterationOutcome::Interrupted { cursor: self.cursor })),
            Err(e) => return Ok(Err(IterationOutcome::Aborted(e))),
        };

        self.set_phase(Phase::Processing);
        let mut stats = BatchStats::default();
        let mut events: Vec<NormalizedEvent> = Vec::with_capacity(logs.len());
        for log in &logs {
            if log.removed {
                tracing::warn!(tx = ?log.transaction_hash, "ledger returned a removed log, skipping");
                continue;
            }
            match normalize(log) {
                Ok(ev) => events.push(ev),
                Err(e) => {
                    stats.malformed += 1;
                    tracing::warn!(tx = ?log.transaction_hash, reason = %e, "skipping malformed log");
                }
            }
        }
        events.sort_by_key(|ev| ev.position());
        tracing::debug!(from = batch.from, to = batch.to, raw = logs.len(), events = events.len(), "batch fetched");

        for ev in events {
            if ev.block_number < batch.from
                || ev.block_number > batch.to
                || !self.strategy.is_final(ev.block_number, latest)
            {
                tracing::warn!(block = ev.block_number, from = batch.from, to = batch.to, "log outside requested final range, skipping");
                continue;
            }
            if shutdown.is_requested() {
                return Ok(Err(IterationOutcome::Interrupted { cursor: self.cursor }));
            }
            let tx_id = ev.tx_id();
            if self.processed.contains(&tx_id) {
                stats.duplicates += 1;
                tracing::debug!(tx = %tx_id, "already processed, skipping");
                continue;
            }
            match self.deliver_with_retry(&ev).await {
                Ok(Delivery::Acked(ack)) => {
                    stats.delivered += 1;
                    tracing::info!(tx = %tx_id, block = ev.block_number, status = ack.status, "event delivered");
                }
                Ok(Delivery::Rejected { status, body }) => {
                    stats.rejected += 1;
                    tracing::warn!(
                        target: "audit",
                        tx = %tx_id,
                        block = ev.block_number,
                        status,
                        body = %body,
                        outcome = "rejected",
                        "relayer permanently rejected event; marked processed without delivery"
                    );
                }
                Err(e) => return Ok(Err(IterationOutcome::Aborted(e))),
            }
            self.processed.insert(tx_id, ev.block_number);
            self.persist()?;
        }

        self.set_phase(Phase::Checkpointing);
        self.cursor.advance_to(batch.to);
        let evicted = self.processed.prune(self.cursor.last_scanned_block, self.retention_blocks);
        if evicted > 0 {
            tracing::debug!(evicted, retained = self.processed.len(), "pruned processed set");
        }
        self.persist()?;
        Ok(Ok(stats))
    }

    async fn deliver_with_retry(&self, ev: &NormalizedEvent) -> Result<Delivery, IterationError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = timeout(self.call_timeout, self.sink.deliver(ev))
                .await
                .unwrap_or_else(|_| Err(SinkError::Delivery(format!("timed out after {:?}", self.call_timeout))));
            match result {
                Ok(ack) => return Ok(Delivery::Acked(ack)),
                Err(SinkError::Rejected { status, body }) => return Ok(Delivery::Rejected { status, body }),
                Err(e) if attempt >= self.retry.max_attempts => {
                    return Err(IterationError::Delivery {
                        tx_hash: ev.tx_id(),
                        attempts: attempt,
                        source: e,
                    })
                }
                Err(e) => {
                    let wait = backoff::delay(&self.retry, attempt);
                    tracing::warn!(tx = %ev.tx_id(), attempt, reason = %e, wait_ms = wait.as_millis() as u64, "delivery failed, backing off");
                    sleep(wait).await;
                }
            }
        }
    }

    fn persist(&self) -> Result<(), ScanError> {
        let state = PersistedState::new(self.cursor.last_scanned_block, self.processed.to_sorted_ids());
        self.store.save(&state)?;
        Ok(())
    }
}

/// Ledger call with timeout, bounded retries, and shutdown observed at every wait.
/// `Ok(None)` means shutdown was requested.
async fn ledger_call<T, F, Fut>(
    retry: &RetryConfig,
    call_timeout: Duration,
    what: &'static str,
    shutdown: &mut Shutdown,
    mut op: F,
) -> Result<Option<T>, IterationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = tokio::select! {
            r = timeout(call_timeout, op()) => r.unwrap_or_else(|_| Err(TransportError::Timeout(call_timeout))),
            _ = shutdown.requested() => return Ok(None),
        };
        match result {
            Ok(v) => return Ok(Some(v)),
            Err(e) if attempt >= retry.max_attempts => {
                return Err(IterationError::Transport {
                    attempts: attempt,
                    source: e,
                })
            }
            Err(e) => {
                let wait = backoff::delay(retry, attempt);
                tracing::warn!(call = what, attempt, reason = %e, wait_ms = wait.as_millis() as u64, "ledger call failed, backing off");
                tokio::select! {
                    _ = sleep(wait) => {}
                    _ = shutdown.requested() => return Ok(None),
                }
            }
        }
    }
}
