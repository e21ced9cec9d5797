//! Point-of-sale facade.
//!
//! [`Till`] owns the queue, ledger, gate and sync driver and is the only way
//! callers write. Every write runs in two phases: the stock effect is held in
//! the ledger first, then the write is sent directly (online, nothing queued
//! ahead of it) or journaled for the driver. The hold follows the write until
//! the remote confirms or rejects it, so no call site applies an optimistic
//! effect by hand.

use crate::config::Config;
use crate::error::Error;
use crate::gate::{CartLine, InsufficientStock, StockGate};
use crate::ledger::{HoldKey, ReservationId, StockLedger};
use crate::network::{ConnectivityMonitor, ConnectivityProbe, Subscription};
use crate::operation::{
    OperationId, OperationKind, PendingOperation, ProductId, ReturnPayload, SaleLine,
    SalePayload, StockAdjustmentPayload, SupplyPayload,
};
use crate::queue::{PendingQueue, QueueChanged};
use crate::remote::{self, ApplyOutcome, RemoteStore};
use crate::storage::Storage;
use crate::sync::{PassSummary, SyncDriver, SyncEvent, SyncStatus};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error(transparent)]
    Insufficient(#[from] InsufficientStock),
    /// The remote refused the write outright. Nothing was queued.
    #[error("rejected by remote: {0}")]
    Rejected(String),
    #[error(transparent)]
    Storage(#[from] Error),
}

/// Where a write ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Synced,
    Queued(OperationId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleDetails {
    pub payment_method: String,
    pub sold_by: String,
    pub notes: Option<String>,
}

impl SaleDetails {
    pub fn new(payment_method: impl Into<String>, sold_by: impl Into<String>) -> Self {
        Self {
            payment_method: payment_method.into(),
            sold_by: sold_by.into(),
            notes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleReceipt {
    /// Needed later to record a return against this sale.
    pub sale_key: Uuid,
    pub total: i64,
    pub delivery: Delivery,
}

pub struct Till {
    config: Config,
    queue: Arc<PendingQueue>,
    ledger: Arc<StockLedger>,
    gate: StockGate,
    monitor: Arc<ConnectivityMonitor>,
    remote: Arc<dyn RemoteStore>,
    driver: Arc<SyncDriver>,
    probe: Mutex<Option<JoinHandle<()>>>,
    /// Held from the direct-send decision until the write is sent or queued.
    submitting: tokio::sync::Mutex<()>,
}

impl Till {
    /// Opens the durable queue under `config.data_dir` and rebuilds stock
    /// holds for whatever is still pending.
    pub fn open(
        config: Config,
        remote: Arc<dyn RemoteStore>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Result<Self, Error> {
        let storage = Storage::new(&config.data_dir, "pending");
        let queue = Arc::new(PendingQueue::open(storage, config.compact_after)?);
        let ledger = Arc::new(StockLedger::new());
        ledger.restore(&queue.all());

        let driver = SyncDriver::new(
            Arc::clone(&queue),
            Arc::clone(&ledger),
            Arc::clone(&monitor),
            Arc::clone(&remote),
            config.retry.clone(),
        );
        tracing::info!(
            data_dir = %config.data_dir.display(),
            pending = queue.len(),
            online = monitor.is_online(),
            "till opened"
        );

        Ok(Self {
            gate: StockGate::new(Arc::clone(&ledger)),
            config,
            queue,
            ledger,
            monitor,
            remote,
            driver,
            probe: Mutex::new(None),
            submitting: tokio::sync::Mutex::new(()),
        })
    }

    /// Starts background sync on the configured interval.
    pub fn start(&self) {
        self.driver.start(self.config.sync_interval());
    }

    /// Polls `probe` on the configured interval and feeds the monitor.
    pub fn watch_connectivity(&self, probe: Arc<dyn ConnectivityProbe>) {
        let handle = self.monitor.spawn_probe(probe, self.config.probe_interval());
        let previous = self
            .probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn shutdown(&self) {
        self.driver.stop();
        if let Some(probe) = self.probe.lock().unwrap_or_else(PoisonError::into_inner).take() {
            probe.abort();
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn driver(&self) -> &Arc<SyncDriver> {
        &self.driver
    }

    pub fn gate(&self) -> &StockGate {
        &self.gate
    }

    /// Loads fresh remote stock figures. Unconfirmed holds stay applied.
    pub fn refresh_stock<I>(&self, figures: I)
    where
        I: IntoIterator<Item = (ProductId, u32)>,
    {
        self.ledger.refresh_baseline(figures);
    }

    pub fn available_stock(&self, product_id: &str) -> u32 {
        self.gate.available_stock(product_id)
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn pending(&self) -> Vec<PendingOperation> {
        self.queue.all()
    }

    pub fn status(&self) -> SyncStatus {
        self.driver.status()
    }

    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.driver.subscribe()
    }

    pub fn subscribe_queue(&self) -> broadcast::Receiver<QueueChanged> {
        self.queue.subscribe()
    }

    pub fn on_connectivity<F>(&self, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.monitor.subscribe(listener)
    }

    /// Retries everything now, including operations that are backing off or
    /// have used up their attempts.
    pub async fn sync_now(&self) -> Option<PassSummary> {
        self.driver.force_sync().await
    }

    /// Checks the cart against local stock and records the sale. Fails
    /// without side effects when any line is short.
    pub async fn record_sale(
        &self,
        lines: Vec<SaleLine>,
        details: SaleDetails,
    ) -> Result<SaleReceipt, CheckoutError> {
        let cart: Vec<CartLine> = lines
            .iter()
            .map(|line| CartLine::new(line.product_id.clone(), line.quantity))
            .collect();
        let reservation = self.gate.reserve(&cart)?;

        let sale = SalePayload {
            idempotency_key: Uuid::new_v4(),
            lines,
            payment_method: details.payment_method,
            sold_by: details.sold_by,
            notes: details.notes,
        };
        let delivery = self
            .submit(OperationKind::CreateSale, &sale, Some(reservation.id))
            .await?;
        Ok(SaleReceipt {
            sale_key: sale.idempotency_key,
            total: sale.total(),
            delivery,
        })
    }

    /// Manual correction. Not gated: a count may go below what the ledger
    /// believes.
    pub async fn adjust_stock(
        &self,
        product_id: impl Into<ProductId>,
        delta: i64,
        reason: impl Into<String>,
    ) -> Result<Delivery, CheckoutError> {
        let adjustment = StockAdjustmentPayload {
            idempotency_key: Uuid::new_v4(),
            product_id: product_id.into(),
            delta,
            reason: reason.into(),
        };
        let hold = self.ledger.hold(vec![(adjustment.product_id.clone(), delta)]);
        self.submit(OperationKind::AdjustStock, &adjustment, Some(hold))
            .await
    }

    pub async fn record_return(
        &self,
        sale_key: Uuid,
        product_id: impl Into<ProductId>,
        quantity: u32,
        restock: bool,
        reason: impl Into<String>,
    ) -> Result<Delivery, CheckoutError> {
        let ret = ReturnPayload {
            idempotency_key: Uuid::new_v4(),
            sale_key,
            product_id: product_id.into(),
            quantity,
            restock,
            reason: reason.into(),
        };
        let deltas = ret.stock_deltas();
        let hold = (!deltas.is_empty()).then(|| self.ledger.hold(deltas));
        self.submit(OperationKind::CreateReturn, &ret, hold).await
    }

    pub async fn receive_supply(
        &self,
        product_id: impl Into<ProductId>,
        quantity: u32,
        unit_cost: i64,
        supplier: impl Into<String>,
    ) -> Result<Delivery, CheckoutError> {
        let supply = SupplyPayload {
            idempotency_key: Uuid::new_v4(),
            product_id: product_id.into(),
            quantity,
            unit_cost,
            supplier: supplier.into(),
        };
        let hold = self
            .ledger
            .hold(vec![(supply.product_id.clone(), i64::from(supply.quantity))]);
        self.submit(OperationKind::AddSupply, &supply, Some(hold))
            .await
    }

    /// Writes with no stock effect (expenses, product edits, return updates).
    pub async fn record(
        &self,
        kind: OperationKind,
        payload: serde_json::Value,
    ) -> Result<Delivery, CheckoutError> {
        self.submit(kind, &payload, None).await
    }

    async fn submit<T: Serialize>(
        &self,
        kind: OperationKind,
        payload: &T,
        hold: Option<ReservationId>,
    ) -> Result<Delivery, CheckoutError> {
        let value = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(err) => {
                self.release(hold);
                return Err(Error::from(err).into());
            }
        };

        // A direct send may not overtake writes already queued or in flight.
        let _submitting = self.submitting.lock().await;
        if self.monitor.is_online() && self.queue.is_empty() {
            match remote::dispatch(self.remote.as_ref(), kind, &value).await {
                ApplyOutcome::Applied => {
                    if let Some(id) = hold {
                        self.ledger.confirm(HoldKey::Reservation(id));
                    }
                    tracing::info!(%kind, "write applied directly");
                    return Ok(Delivery::Synced);
                }
                ApplyOutcome::Permanent(reason) => {
                    self.release(hold);
                    tracing::warn!(%kind, %reason, "write rejected by remote");
                    return Err(CheckoutError::Rejected(reason));
                }
                ApplyOutcome::Transient(reason) => {
                    tracing::info!(%kind, %reason, "direct send failed, queueing");
                }
            }
        }

        let ledger = &self.ledger;
        let enqueued = self.queue.enqueue_with(kind, value, |operation| {
            if let Some(id) = hold {
                ledger.bind(id, operation.id);
            }
        });
        match enqueued {
            Ok(operation) => {
                tracing::info!(id = %operation.id, %kind, "write queued");
                Ok(Delivery::Queued(operation.id))
            }
            Err(err) => {
                self.release(hold);
                Err(err.into())
            }
        }
    }

    fn release(&self, hold: Option<ReservationId>) {
        if let Some(id) = hold {
            self.ledger.release(HoldKey::Reservation(id));
        }
    }
}

impl Drop for Till {
    fn drop(&mut self) {
        self.shutdown();
    }
}
