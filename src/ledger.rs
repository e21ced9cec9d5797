//! Local belief about stock: the last remote figures plus every optimistic
//! movement the remote has not confirmed yet.

use crate::operation::{OperationId, PendingOperation, ProductId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReservationId(pub u64);

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res-{}", self.0)
    }
}

/// Owner of a set of unconfirmed stock movements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HoldKey {
    /// Taken at checkout, not yet queued or confirmed.
    Reservation(ReservationId),
    /// Backing a queued operation.
    Operation(OperationId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shortfall {
    pub product_id: ProductId,
    pub requested: u32,
    pub available: u32,
}

impl Shortfall {
    pub fn missing(&self) -> u32 {
        self.requested.saturating_sub(self.available)
    }
}

#[derive(Default)]
struct LedgerState {
    baseline: HashMap<ProductId, u32>,
    holds: BTreeMap<HoldKey, Vec<(ProductId, i64)>>,
    /// Sum of all holds per product.
    pending: HashMap<ProductId, i64>,
    next_reservation: u64,
}

impl LedgerState {
    fn available(&self, product_id: &str) -> u32 {
        let base = i64::from(self.baseline.get(product_id).copied().unwrap_or(0));
        let pending = self.pending.get(product_id).copied().unwrap_or(0);
        clamp_stock(base + pending)
    }

    fn add_hold(&mut self, key: HoldKey, deltas: Vec<(ProductId, i64)>) {
        for (product_id, delta) in &deltas {
            *self.pending.entry(product_id.clone()).or_insert(0) += delta;
        }
        self.holds.insert(key, deltas);
    }

    fn take_hold(&mut self, key: HoldKey) -> Option<Vec<(ProductId, i64)>> {
        let deltas = self.holds.remove(&key)?;
        for (product_id, delta) in &deltas {
            if let Some(total) = self.pending.get_mut(product_id) {
                *total -= delta;
                if *total == 0 {
                    self.pending.remove(product_id);
                }
            }
        }
        Some(deltas)
    }

    fn fold(&mut self, deltas: Vec<(ProductId, i64)>) {
        for (product_id, delta) in deltas {
            let base = self.baseline.entry(product_id).or_insert(0);
            *base = clamp_stock(i64::from(*base) + delta);
        }
    }

    fn next_reservation(&mut self) -> ReservationId {
        self.next_reservation += 1;
        ReservationId(self.next_reservation)
    }
}

fn clamp_stock(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

#[derive(Default)]
pub struct StockLedger {
    state: Mutex<LedgerState>,
}

impl StockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the remote baseline with a fresh feed. Holds are kept: the
    /// feed cannot include movements the remote has not applied yet.
    pub fn refresh_baseline<I>(&self, figures: I)
    where
        I: IntoIterator<Item = (ProductId, u32)>,
    {
        let mut state = self.lock();
        state.baseline = figures.into_iter().collect();
        tracing::debug!(products = state.baseline.len(), holds = state.holds.len(), "stock baseline refreshed");
    }

    pub fn set_baseline(&self, product_id: impl Into<ProductId>, quantity: u32) {
        self.lock().baseline.insert(product_id.into(), quantity);
    }

    pub fn available(&self, product_id: &str) -> u32 {
        self.lock().available(product_id)
    }

    /// Sum of unconfirmed movements for a product.
    pub fn pending_delta(&self, product_id: &str) -> i64 {
        self.lock().pending.get(product_id).copied().unwrap_or(0)
    }

    pub fn hold_count(&self) -> usize {
        self.lock().holds.len()
    }

    /// Availability for every product the ledger knows about.
    pub fn snapshot(&self) -> BTreeMap<ProductId, u32> {
        let state = self.lock();
        state
            .baseline
            .keys()
            .chain(state.pending.keys())
            .map(|product_id| (product_id.clone(), state.available(product_id)))
            .collect()
    }

    /// Checks every demanded quantity and, only if all fit, records them as one
    /// reservation. Check and hold happen under a single lock.
    pub fn try_reserve(
        &self,
        demand: &BTreeMap<ProductId, u32>,
    ) -> Result<ReservationId, Vec<Shortfall>> {
        let mut state = self.lock();
        let shortfalls: Vec<Shortfall> = demand
            .iter()
            .filter_map(|(product_id, requested)| {
                let available = state.available(product_id);
                (*requested > available).then(|| Shortfall {
                    product_id: product_id.clone(),
                    requested: *requested,
                    available,
                })
            })
            .collect();
        if !shortfalls.is_empty() {
            return Err(shortfalls);
        }

        let id = state.next_reservation();
        let deltas = demand
            .iter()
            .filter(|(_, quantity)| **quantity > 0)
            .map(|(product_id, quantity)| (product_id.clone(), -i64::from(*quantity)))
            .collect();
        state.add_hold(HoldKey::Reservation(id), deltas);
        Ok(id)
    }

    /// Records movements without an availability check (restocks, manual
    /// corrections).
    pub fn hold(&self, deltas: Vec<(ProductId, i64)>) -> ReservationId {
        let mut state = self.lock();
        let id = state.next_reservation();
        state.add_hold(HoldKey::Reservation(id), deltas);
        id
    }

    /// Re-keys a reservation to the queued operation that now carries it.
    pub fn bind(&self, reservation: ReservationId, operation: OperationId) -> bool {
        let mut state = self.lock();
        match state.take_hold(HoldKey::Reservation(reservation)) {
            Some(deltas) => {
                state.add_hold(HoldKey::Operation(operation), deltas);
                true
            }
            None => false,
        }
    }

    /// The remote applied the movement: fold it into the baseline until the
    /// next refresh brings the authoritative figure.
    pub fn confirm(&self, key: HoldKey) -> bool {
        let mut state = self.lock();
        match state.take_hold(key) {
            Some(deltas) => {
                state.fold(deltas);
                true
            }
            None => false,
        }
    }

    /// The movement will never happen: give the stock back.
    pub fn release(&self, key: HoldKey) -> bool {
        self.lock().take_hold(key).is_some()
    }

    /// Rebuilds operation holds from the queue, e.g. after a restart.
    pub fn restore(&self, operations: &[PendingOperation]) {
        let mut state = self.lock();
        let stale: Vec<HoldKey> = state
            .holds
            .keys()
            .filter(|key| matches!(key, HoldKey::Operation(_)))
            .copied()
            .collect();
        for key in stale {
            state.take_hold(key);
        }
        for operation in operations {
            let deltas = operation.stock_deltas();
            if !deltas.is_empty() {
                state.add_hold(HoldKey::Operation(operation.id), deltas);
            }
        }
        tracing::debug!(holds = state.holds.len(), "ledger holds restored from queue");
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationKind, SaleLine, SalePayload};
    use chrono::Utc;

    fn demand(items: &[(&str, u32)]) -> BTreeMap<ProductId, u32> {
        items.iter().map(|(p, q)| (p.to_string(), *q)).collect()
    }

    #[test]
    fn reservation_lowers_availability() {
        let ledger = StockLedger::new();
        ledger.set_baseline("beer", 10);
        ledger.try_reserve(&demand(&[("beer", 4)])).expect("reserve");
        assert_eq!(ledger.available("beer"), 6);
        assert_eq!(ledger.pending_delta("beer"), -4);
    }

    #[test]
    fn refresh_keeps_unconfirmed_holds() {
        let ledger = StockLedger::new();
        ledger.set_baseline("beer", 10);
        let res = ledger.try_reserve(&demand(&[("beer", 4)])).expect("reserve");
        ledger.bind(res, OperationId(1));

        ledger.refresh_baseline([("beer".to_string(), 12)]);
        assert_eq!(ledger.available("beer"), 8);
    }

    #[test]
    fn confirm_folds_and_release_restores() {
        let ledger = StockLedger::new();
        ledger.set_baseline("beer", 10);
        let a = ledger.try_reserve(&demand(&[("beer", 3)])).expect("reserve");
        let b = ledger.try_reserve(&demand(&[("beer", 2)])).expect("reserve");
        ledger.bind(a, OperationId(1));
        ledger.bind(b, OperationId(2));

        assert!(ledger.confirm(HoldKey::Operation(OperationId(1))));
        assert_eq!(ledger.available("beer"), 5);
        assert_eq!(ledger.pending_delta("beer"), -2);

        assert!(ledger.release(HoldKey::Operation(OperationId(2))));
        assert_eq!(ledger.available("beer"), 7);
        assert!(!ledger.release(HoldKey::Operation(OperationId(2))));
        assert_eq!(ledger.hold_count(), 0);
    }

    #[test]
    fn shortfalls_leave_ledger_untouched() {
        let ledger = StockLedger::new();
        ledger.set_baseline("beer", 2);
        ledger.set_baseline("soda", 5);
        let err = ledger
            .try_reserve(&demand(&[("beer", 3), ("soda", 1), ("wine", 1)]))
            .expect_err("short");
        assert_eq!(err.len(), 2);
        assert_eq!(err[0].product_id, "beer");
        assert_eq!(err[0].missing(), 1);
        assert_eq!(err[1].product_id, "wine");
        assert_eq!(ledger.available("beer"), 2);
        assert_eq!(ledger.available("soda"), 5);
        assert_eq!(ledger.hold_count(), 0);
    }

    #[test]
    fn restore_rebuilds_from_queue() {
        let ledger = StockLedger::new();
        ledger.set_baseline("beer", 10);
        let sale = SalePayload {
            idempotency_key: uuid::Uuid::new_v4(),
            lines: vec![SaleLine { product_id: "beer".into(), quantity: 4, unit_price: 500 }],
            payment_method: "cash".into(),
            sold_by: "alice".into(),
            notes: None,
        };
        let op = PendingOperation {
            id: OperationId(3),
            kind: OperationKind::CreateSale,
            payload: serde_json::to_value(&sale).expect("value"),
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
        };

        ledger.restore(std::slice::from_ref(&op));
        ledger.restore(std::slice::from_ref(&op));
        assert_eq!(ledger.available("beer"), 6);
    }

    #[test]
    fn negative_belief_clamps_to_zero() {
        let ledger = StockLedger::new();
        ledger.set_baseline("beer", 1);
        ledger.hold(vec![("beer".to_string(), -5)]);
        assert_eq!(ledger.available("beer"), 0);
        assert_eq!(ledger.snapshot().get("beer"), Some(&0));
    }
}
