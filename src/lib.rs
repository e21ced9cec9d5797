//! Offline-resilient write path for a point-of-sale till.
//!
//! Writes are checked against local stock, held optimistically, and either
//! sent straight to the backend or journaled to a durable queue that drains
//! in order once connectivity returns.

pub mod config;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod network;
pub mod operation;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod till;

pub use config::{Config, RetryPolicy};
pub use error::{Error, Result};
pub use gate::{CartLine, InsufficientStock, Reservation, Shortfall, StockGate};
pub use ledger::StockLedger;
pub use network::{ConnectivityMonitor, ConnectivityProbe, ConnectivitySignal, Subscription, TcpProbe};
pub use operation::{OperationId, OperationKind, PendingOperation, SaleLine, SyncDomain};
pub use queue::{PendingQueue, QueueChanged};
pub use remote::{ApplyOutcome, MemoryRemote, RemoteError, RemoteStore};
pub use sync::{FailureReason, PassSummary, SyncDriver, SyncEvent, SyncStatus, Trigger};
pub use till::{CheckoutError, Delivery, SaleDetails, SaleReceipt, Till};
