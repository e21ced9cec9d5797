//! Remote system of record.
//!
//! [`RemoteStore`] has one call per operation kind. Its errors form a closed
//! set, and [`classify`] turns each into applied / transient / permanent for
//! the kind at hand. Retry policy never looks at error text.

use crate::operation::{
    OperationKind, ProductId, ReturnPayload, SalePayload, StockAdjustmentPayload, SupplyPayload,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("request timed out")]
    Timeout,
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited")]
    RateLimited,
    #[error("network error: {0}")]
    Network(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The idempotency key was already used.
    #[error("already applied")]
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Keep queued, retry later.
    Transient(String),
    /// Drop and surface, will never succeed as-is.
    Permanent(String),
}

pub fn classify(kind: OperationKind, result: Result<(), RemoteError>) -> ApplyOutcome {
    let err = match result {
        Ok(()) => return ApplyOutcome::Applied,
        Err(err) => err,
    };
    match err {
        RemoteError::Timeout
        | RemoteError::Unavailable(_)
        | RemoteError::RateLimited
        | RemoteError::Network(_) => ApplyOutcome::Transient(err.to_string()),
        RemoteError::Rejected(_) | RemoteError::NotFound(_) | RemoteError::Conflict(_) => {
            ApplyOutcome::Permanent(err.to_string())
        }
        RemoteError::Duplicate if kind.is_idempotent() => ApplyOutcome::Applied,
        RemoteError::Duplicate => ApplyOutcome::Permanent(err.to_string()),
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create_sale(&self, sale: &SalePayload) -> Result<(), RemoteError>;

    async fn adjust_stock(&self, adjustment: &StockAdjustmentPayload) -> Result<(), RemoteError>;

    async fn create_return(&self, ret: &ReturnPayload) -> Result<(), RemoteError>;

    async fn add_supply(&self, supply: &SupplyPayload) -> Result<(), RemoteError>;

    /// Kinds without a typed payload.
    async fn apply_raw(
        &self,
        kind: OperationKind,
        payload: &serde_json::Value,
    ) -> Result<(), RemoteError>;
}

/// Sends one write to the remote through the call for its kind and
/// classifies the answer. A payload that no longer decodes can never succeed,
/// so it is permanent.
pub async fn dispatch(
    remote: &dyn RemoteStore,
    kind: OperationKind,
    payload: &serde_json::Value,
) -> ApplyOutcome {
    let result = match kind {
        OperationKind::CreateSale => match decode::<SalePayload>(kind, payload) {
            Ok(sale) => remote.create_sale(&sale).await,
            Err(outcome) => return outcome,
        },
        OperationKind::AdjustStock => match decode::<StockAdjustmentPayload>(kind, payload) {
            Ok(adjustment) => remote.adjust_stock(&adjustment).await,
            Err(outcome) => return outcome,
        },
        OperationKind::CreateReturn => match decode::<ReturnPayload>(kind, payload) {
            Ok(ret) => remote.create_return(&ret).await,
            Err(outcome) => return outcome,
        },
        OperationKind::AddSupply => match decode::<SupplyPayload>(kind, payload) {
            Ok(supply) => remote.add_supply(&supply).await,
            Err(outcome) => return outcome,
        },
        OperationKind::UpdateReturn | OperationKind::UpdateProduct | OperationKind::AddExpense => {
            remote.apply_raw(kind, payload).await
        }
    };
    classify(kind, result)
}

fn decode<T: DeserializeOwned>(
    kind: OperationKind,
    payload: &serde_json::Value,
) -> Result<T, ApplyOutcome> {
    T::deserialize(payload).map_err(|err| {
        tracing::error!(%kind, %err, "payload does not decode");
        ApplyOutcome::Permanent(format!("undecodable payload: {err}"))
    })
}

#[derive(Default)]
struct MemoryState {
    stock: HashMap<ProductId, u32>,
    sale_keys: HashSet<Uuid>,
    return_keys: HashSet<Uuid>,
    movement_keys: HashSet<Uuid>,
    applied: Vec<OperationKind>,
    reachable: bool,
    scripted: VecDeque<RemoteError>,
    lose_next_reply: bool,
}

/// In-process stand-in for the backend. Keeps its own stock figures, enforces
/// idempotency keys and can be made unreachable or told to fail.
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryRemote {
    pub fn new<I>(stock: I) -> Self
    where
        I: IntoIterator<Item = (ProductId, u32)>,
    {
        Self {
            state: Mutex::new(MemoryState {
                stock: stock.into_iter().collect(),
                reachable: true,
                ..MemoryState::default()
            }),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Queues an error for the next call, ahead of any real processing.
    pub fn fail_next(&self, err: RemoteError) {
        self.lock().scripted.push_back(err);
    }

    /// The next successful call is applied, but its answer is lost and the
    /// caller sees a timeout.
    pub fn lose_next_reply(&self) {
        self.lock().lose_next_reply = true;
    }

    pub fn stock(&self, product_id: &str) -> u32 {
        self.lock().stock.get(product_id).copied().unwrap_or(0)
    }

    pub fn stock_figures(&self) -> Vec<(ProductId, u32)> {
        self.lock()
            .stock
            .iter()
            .map(|(product_id, quantity)| (product_id.clone(), *quantity))
            .collect()
    }

    /// Kinds applied so far, in order.
    pub fn applied(&self) -> Vec<OperationKind> {
        self.lock().applied.clone()
    }

    /// Highest number of calls that were ever in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn call<F>(&self, apply: F) -> Result<(), RemoteError>
    where
        F: FnOnce(&mut MemoryState) -> Result<(), RemoteError>,
    {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = {
            let mut state = self.lock();
            if let Some(err) = state.scripted.pop_front() {
                Err(err)
            } else if !state.reachable {
                Err(RemoteError::Unavailable("backend unreachable".into()))
            } else {
                let result = apply(&mut *state);
                if result.is_ok() && std::mem::take(&mut state.lose_next_reply) {
                    Err(RemoteError::Timeout)
                } else {
                    result
                }
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryState {
    fn move_stock(&mut self, product_id: &str, delta: i64) -> Result<(), RemoteError> {
        let current = self
            .stock
            .get(product_id)
            .copied()
            .ok_or_else(|| RemoteError::NotFound(format!("product {product_id}")))?;
        let next = i64::from(current) + delta;
        let next = u32::try_from(next).map_err(|_| {
            RemoteError::Rejected(format!("insufficient stock for {product_id}"))
        })?;
        self.stock.insert(product_id.to_string(), next);
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn create_sale(&self, sale: &SalePayload) -> Result<(), RemoteError> {
        self.call(|state| {
            if state.sale_keys.contains(&sale.idempotency_key) {
                return Err(RemoteError::Duplicate);
            }
            let mut demand: BTreeMap<&str, u64> = BTreeMap::new();
            for line in &sale.lines {
                *demand.entry(line.product_id.as_str()).or_insert(0) += u64::from(line.quantity);
            }
            for (product_id, requested) in &demand {
                let on_hand = state
                    .stock
                    .get(*product_id)
                    .copied()
                    .ok_or_else(|| RemoteError::NotFound(format!("product {product_id}")))?;
                if u64::from(on_hand) < *requested {
                    return Err(RemoteError::Rejected(format!(
                        "insufficient stock for {product_id}"
                    )));
                }
            }
            for (product_id, requested) in demand {
                state.move_stock(product_id, -i64::try_from(requested).unwrap_or(i64::MAX))?;
            }
            state.sale_keys.insert(sale.idempotency_key);
            state.applied.push(OperationKind::CreateSale);
            Ok(())
        })
        .await
    }

    async fn adjust_stock(&self, adjustment: &StockAdjustmentPayload) -> Result<(), RemoteError> {
        self.call(|state| {
            if state.movement_keys.contains(&adjustment.idempotency_key) {
                return Err(RemoteError::Duplicate);
            }
            state.move_stock(&adjustment.product_id, adjustment.delta)?;
            state.movement_keys.insert(adjustment.idempotency_key);
            state.applied.push(OperationKind::AdjustStock);
            Ok(())
        })
        .await
    }

    async fn create_return(&self, ret: &ReturnPayload) -> Result<(), RemoteError> {
        self.call(|state| {
            if state.return_keys.contains(&ret.idempotency_key) {
                return Err(RemoteError::Duplicate);
            }
            if !state.sale_keys.contains(&ret.sale_key) {
                return Err(RemoteError::NotFound(format!("sale {}", ret.sale_key)));
            }
            if ret.restock {
                state.move_stock(&ret.product_id, i64::from(ret.quantity))?;
            }
            state.return_keys.insert(ret.idempotency_key);
            state.applied.push(OperationKind::CreateReturn);
            Ok(())
        })
        .await
    }

    async fn add_supply(&self, supply: &SupplyPayload) -> Result<(), RemoteError> {
        self.call(|state| {
            if state.movement_keys.contains(&supply.idempotency_key) {
                return Err(RemoteError::Duplicate);
            }
            let current = state.stock.entry(supply.product_id.clone()).or_insert(0);
            *current = current.saturating_add(supply.quantity);
            state.movement_keys.insert(supply.idempotency_key);
            state.applied.push(OperationKind::AddSupply);
            Ok(())
        })
        .await
    }

    async fn apply_raw(
        &self,
        kind: OperationKind,
        _payload: &serde_json::Value,
    ) -> Result<(), RemoteError> {
        self.call(|state| {
            state.applied.push(kind);
            Ok(())
        })
        .await
    }
}
