//! Checkout-time stock check. Never touches the network: it answers from the
//! local ledger, so it behaves the same online and offline.

use crate::ledger::{ReservationId, StockLedger};
use crate::operation::ProductId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use crate::ledger::Shortfall;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

impl CartLine {
    pub fn new(product_id: impl Into<ProductId>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("insufficient stock for {} product(s)", .shortfalls.len())]
pub struct InsufficientStock {
    /// One entry per offending product, ordered by product id.
    pub shortfalls: Vec<Shortfall>,
}

/// Stock taken out of the ledger for one cart. The caller must hand it on to
/// the queue (`StockLedger::bind`) or settle/release it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Reservation {
    pub id: ReservationId,
    pub lines: Vec<CartLine>,
}

pub struct StockGate {
    ledger: Arc<StockLedger>,
}

impl StockGate {
    pub fn new(ledger: Arc<StockLedger>) -> Self {
        Self { ledger }
    }

    pub fn available_stock(&self, product_id: &str) -> u32 {
        self.ledger.available(product_id)
    }

    /// All-or-nothing: either every line fits and the whole cart is held, or
    /// nothing changes and every shortfall is reported. Lines naming the same
    /// product are summed before checking.
    pub fn reserve(&self, lines: &[CartLine]) -> Result<Reservation, InsufficientStock> {
        let mut demand: BTreeMap<ProductId, u32> = BTreeMap::new();
        for line in lines {
            let total = demand.entry(line.product_id.clone()).or_insert(0);
            *total = total.saturating_add(line.quantity);
        }

        match self.ledger.try_reserve(&demand) {
            Ok(id) => {
                tracing::debug!(reservation = %id, products = demand.len(), "cart reserved");
                Ok(Reservation {
                    id,
                    lines: lines.to_vec(),
                })
            }
            Err(shortfalls) => {
                tracing::info!(short = shortfalls.len(), "cart rejected for insufficient stock");
                Err(InsufficientStock { shortfalls })
            }
        }
    }

    /// Callback form of [`reserve`](Self::reserve). Exactly one of the two
    /// callbacks runs, after the ledger lock is released.
    pub fn validate_and_apply<S, F, R>(&self, lines: &[CartLine], on_success: S, on_failure: F) -> R
    where
        S: FnOnce(Reservation) -> R,
        F: FnOnce(InsufficientStock) -> R,
    {
        match self.reserve(lines) {
            Ok(reservation) => on_success(reservation),
            Err(failure) => on_failure(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn gate(stock: &[(&str, u32)]) -> (StockGate, Arc<StockLedger>) {
        let ledger = Arc::new(StockLedger::new());
        ledger.refresh_baseline(stock.iter().map(|(p, q)| (p.to_string(), *q)));
        (StockGate::new(Arc::clone(&ledger)), ledger)
    }

    #[test]
    fn exact_quantity_succeeds() {
        let (gate, ledger) = gate(&[("beer", 2), ("soda", 9)]);
        let reservation = gate.reserve(&[CartLine::new("beer", 2)]).expect("reserve");
        assert_eq!(reservation.lines.len(), 1);
        assert_eq!(ledger.available("beer"), 0);
        assert_eq!(ledger.available("soda"), 9);
    }

    #[test]
    fn duplicate_lines_are_summed() {
        let (gate, ledger) = gate(&[("beer", 3)]);
        let failure = gate
            .reserve(&[CartLine::new("beer", 2), CartLine::new("beer", 2)])
            .expect_err("over");
        assert_eq!(
            failure.shortfalls,
            vec![Shortfall { product_id: "beer".into(), requested: 4, available: 3 }]
        );
        assert_eq!(ledger.available("beer"), 3);
    }

    #[test]
    fn one_bad_line_blocks_whole_cart() {
        let (gate, ledger) = gate(&[("beer", 5), ("soda", 1)]);
        let result = gate.reserve(&[CartLine::new("beer", 1), CartLine::new("soda", 2)]);
        assert!(result.is_err());
        assert_eq!(ledger.available("beer"), 5);
        assert_eq!(ledger.hold_count(), 0);
    }

    #[test]
    fn callbacks_run_exactly_once() {
        let (gate, ledger) = gate(&[("beer", 4)]);
        let successes = Cell::new(0);
        let failures = Cell::new(0);

        for _ in 0..3 {
            gate.validate_and_apply(
                &[CartLine::new("beer", 2)],
                |_| successes.set(successes.get() + 1),
                |_| failures.set(failures.get() + 1),
            );
        }

        assert_eq!(successes.get(), 2);
        assert_eq!(failures.get(), 1);
        assert_eq!(ledger.available("beer"), 0);
    }

    #[test]
    fn failure_names_product_and_shortfall() {
        let (gate, _) = gate(&[("beer", 1)]);
        let message = gate.validate_and_apply(
            &[CartLine::new("beer", 3)],
            |_| String::from("sold"),
            |failure| {
                let short = &failure.shortfalls[0];
                format!("{} short by {}", short.product_id, short.missing())
            },
        );
        assert_eq!(message, "beer short by 2");
    }

    #[test]
    fn concurrent_checkouts_never_oversell() {
        let (gate, ledger) = gate(&[("beer", 50)]);
        let gate = Arc::new(gate);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| gate.reserve(&[CartLine::new("beer", 1)]).is_ok())
                        .count()
                })
            })
            .collect();
        let sold: usize = handles.into_iter().map(|h| h.join().expect("join")).sum();
        assert_eq!(sold, 50);
        assert_eq!(ledger.available("beer"), 0);
    }
}
