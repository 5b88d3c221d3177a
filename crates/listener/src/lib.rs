//! Bridge event listener: finality-delayed log scanning with exactly-once relay notification.
//!
//! - **Ledger** ([LedgerReader]): chain height and `eth_getLogs` over JSON-RPC.
//! - **Normalizer** ([normalize]): raw log → [NormalizedEvent] (TokensLocked layout).
//! - **Sink** ([SinkNotifier]): POSTs each event to the destination-chain relayer.
//! - **Checkpoint** ([CheckpointStore]): atomic JSON state file (cursor + processed set).
//! - **Coordinator** ([Coordinator]): scans only blocks that are final per the configured
//!   [Strategy] (e.g. [ConfirmationDepth]), dedups by transaction id, retries transient
//!   failures with backoff, and advances the cursor only after a batch is fully handled.

pub mod abi;
pub mod backoff;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod dedup;
pub mod error;
pub mod finality;
pub mod ledger;
pub mod sink;

pub use abi::{normalize, NormalizedEvent, RawLog};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, PersistedState};
pub use config::{ListenerConfig, RetryConfig};
pub use coordinator::{
    BatchStats, Coordinator, CoordinatorBuilder, IterationOutcome, Phase, Shutdown, ShutdownHandle,
};
pub use cursor::{Cursor, StartPoint};
pub use dedup::ProcessedSet;
pub use error::{
    ConfigurationError, IterationError, MalformedLogError, PersistenceError, ScanError, SinkError,
    TransportError,
};
pub use finality::{BlockRange, ConfirmationDepth, Strategy};
pub use ledger::{HttpLedger, LedgerReader, LogFilter};
pub use sink::{Ack, HttpSink, SinkNotifier};
