use std::fmt;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cart::Cart;
use crate::pricing::round_money;
use crate::StoreError;

pub const INVOICE_REQUESTED: &str = "InvoiceRequested";

/// Human-facing order number, distinct from the order's row id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderNumber(pub i64);

impl OrderNumber {
    pub fn invoice_file_name(&self) -> String {
        format!("pedido_{}.pdf", self)
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLineSnapshot {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
}

impl OrderLineSnapshot {
    pub fn subtotal(&self) -> BigDecimal {
        &self.unit_price * BigDecimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDecrement {
    pub product_id: Uuid,
    pub quantity: i32,
    pub remaining: i32,
}

/// Everything an order write needs, computed from the cart before touching
/// storage. Unit prices are rounded to cents and the total is the sum of the
/// rounded line subtotals, so stored lines always add up to the order total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlan {
    pub total: BigDecimal,
    pub lines: Vec<OrderLineSnapshot>,
    pub stock: Vec<StockDecrement>,
}

impl OrderPlan {
    pub fn from_cart(cart: &Cart) -> Result<Self, StoreError> {
        if cart.is_empty() {
            return Err(StoreError::EmptyCart);
        }

        let lines: Vec<OrderLineSnapshot> = cart
            .lines
            .iter()
            .map(|line| OrderLineSnapshot {
                product_id: line.product_id,
                product_name: line.product_name.clone(),
                quantity: line.quantity,
                unit_price: round_money(&line.unit_price()),
            })
            .collect();

        let stock = cart
            .lines
            .iter()
            .map(|line| StockDecrement {
                product_id: line.product_id,
                quantity: line.quantity,
                remaining: remaining_stock(line.stock, line.quantity),
            })
            .collect();

        let total = lines
            .iter()
            .fold(BigDecimal::from(0), |acc, line| acc + line.subtotal());

        Ok(Self {
            total,
            lines,
            stock,
        })
    }
}

/// Stock left after selling `quantity` units. Overselling clamps to zero.
pub fn remaining_stock(stock: i32, quantity: i32) -> i32 {
    stock.saturating_sub(quantity).max(0)
}

/// Outbox payload asking for an order's invoice to be rendered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRequested {
    pub order_id: Uuid,
    pub order_number: OrderNumber,
}
