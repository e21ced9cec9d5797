use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type ProductId = String;

/// Queue position of an operation. Assigned in creation order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum OperationKind {
    CreateSale,
    AdjustStock,
    CreateReturn,
    UpdateReturn,
    AddSupply,
    UpdateProduct,
    AddExpense,
}

/// Which cached views a confirmed operation invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncDomain {
    Sales,
    Stock,
    Returns,
    Expenses,
}

impl OperationKind {
    pub fn domain(self) -> SyncDomain {
        match self {
            OperationKind::CreateSale => SyncDomain::Sales,
            OperationKind::AdjustStock | OperationKind::AddSupply | OperationKind::UpdateProduct => {
                SyncDomain::Stock
            }
            OperationKind::CreateReturn | OperationKind::UpdateReturn => SyncDomain::Returns,
            OperationKind::AddExpense => SyncDomain::Expenses,
        }
    }

    /// Kinds whose payload carries an idempotency key, so a remote "already
    /// exists" answer means an earlier attempt landed.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            OperationKind::CreateSale
                | OperationKind::CreateReturn
                | OperationKind::AdjustStock
                | OperationKind::AddSupply
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::CreateSale => "CREATE_SALE",
            OperationKind::AdjustStock => "ADJUST_STOCK",
            OperationKind::CreateReturn => "CREATE_RETURN",
            OperationKind::UpdateReturn => "UPDATE_RETURN",
            OperationKind::AddSupply => "ADD_SUPPLY",
            OperationKind::UpdateProduct => "UPDATE_PRODUCT",
            OperationKind::AddExpense => "ADD_EXPENSE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl PendingOperation {
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Stock movements this operation will cause once applied remotely.
    /// Used to rebuild ledger holds after a restart.
    pub fn stock_deltas(&self) -> Vec<(ProductId, i64)> {
        let deltas = match self.kind {
            OperationKind::CreateSale => self
                .payload_as::<SalePayload>()
                .map(|sale| sale.stock_deltas()),
            OperationKind::AdjustStock => self
                .payload_as::<StockAdjustmentPayload>()
                .map(|adj| vec![(adj.product_id, adj.delta)]),
            OperationKind::CreateReturn => self
                .payload_as::<ReturnPayload>()
                .map(|ret| ret.stock_deltas()),
            OperationKind::AddSupply => self
                .payload_as::<SupplyPayload>()
                .map(|supply| vec![(supply.product_id, i64::from(supply.quantity))]),
            OperationKind::UpdateReturn | OperationKind::UpdateProduct | OperationKind::AddExpense => {
                Ok(Vec::new())
            }
        };
        deltas.unwrap_or_else(|err| {
            tracing::warn!(id = %self.id, kind = %self.kind, %err, "unreadable payload, no stock deltas");
            Vec::new()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleLine {
    pub product_id: ProductId,
    pub quantity: u32,
    /// Minor currency units.
    pub unit_price: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalePayload {
    pub idempotency_key: Uuid,
    pub lines: Vec<SaleLine>,
    pub payment_method: String,
    pub sold_by: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SalePayload {
    pub fn total(&self) -> i64 {
        self.lines
            .iter()
            .map(|line| line.unit_price * i64::from(line.quantity))
            .sum()
    }

    pub fn stock_deltas(&self) -> Vec<(ProductId, i64)> {
        self.lines
            .iter()
            .map(|line| (line.product_id.clone(), -i64::from(line.quantity)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjustmentPayload {
    pub idempotency_key: Uuid,
    pub product_id: ProductId,
    pub delta: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnPayload {
    pub idempotency_key: Uuid,
    pub sale_key: Uuid,
    pub product_id: ProductId,
    pub quantity: u32,
    /// Returned goods go back on the shelf.
    pub restock: bool,
    pub reason: String,
}

impl ReturnPayload {
    pub fn stock_deltas(&self) -> Vec<(ProductId, i64)> {
        if self.restock {
            vec![(self.product_id.clone(), i64::from(self.quantity))]
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyPayload {
    pub idempotency_key: Uuid,
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_cost: i64,
    pub supplier: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OperationKind, payload: serde_json::Value) -> PendingOperation {
        PendingOperation {
            id: OperationId(1),
            kind,
            payload,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
        }
    }

    #[test]
    fn kind_uses_wire_names() {
        let json = serde_json::to_string(&OperationKind::CreateSale).expect("serialize");
        assert_eq!(json, "\"CREATE_SALE\"");
        let parsed: OperationKind = serde_json::from_str("\"ADJUST_STOCK\"").expect("deserialize");
        assert_eq!(parsed, OperationKind::AdjustStock);
    }

    #[test]
    fn sale_decrements_every_line() {
        let sale = SalePayload {
            idempotency_key: Uuid::new_v4(),
            lines: vec![
                SaleLine { product_id: "beer".into(), quantity: 3, unit_price: 500 },
                SaleLine { product_id: "soda".into(), quantity: 1, unit_price: 250 },
            ],
            payment_method: "cash".into(),
            sold_by: "alice".into(),
            notes: None,
        };
        assert_eq!(sale.total(), 1750);

        let pending = op(OperationKind::CreateSale, serde_json::to_value(&sale).expect("value"));
        assert_eq!(
            pending.stock_deltas(),
            vec![("beer".to_string(), -3), ("soda".to_string(), -1)]
        );
    }

    #[test]
    fn return_without_restock_moves_no_stock() {
        let ret = ReturnPayload {
            idempotency_key: Uuid::new_v4(),
            sale_key: Uuid::new_v4(),
            product_id: "beer".into(),
            quantity: 2,
            restock: false,
            reason: "broken bottle".into(),
        };
        let pending = op(OperationKind::CreateReturn, serde_json::to_value(&ret).expect("value"));
        assert!(pending.stock_deltas().is_empty());
    }

    #[test]
    fn malformed_payload_yields_no_deltas() {
        let pending = op(OperationKind::AdjustStock, serde_json::json!({ "nope": true }));
        assert!(pending.stock_deltas().is_empty());
    }

    #[test]
    fn domains_follow_kind() {
        assert_eq!(OperationKind::CreateSale.domain(), SyncDomain::Sales);
        assert_eq!(OperationKind::AddSupply.domain(), SyncDomain::Stock);
        assert_eq!(OperationKind::UpdateReturn.domain(), SyncDomain::Returns);
        assert!(OperationKind::CreateReturn.is_idempotent());
        assert!(OperationKind::AdjustStock.is_idempotent());
        assert!(!OperationKind::AddExpense.is_idempotent());
    }
}
