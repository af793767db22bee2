use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pricing::discounted_price;

/// A cart line joined with the product data needed to price it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub price: BigDecimal,
    pub discount: i32,
    pub stock: i32,
}

impl CartLine {
    pub fn unit_price(&self) -> BigDecimal {
        discounted_price(&self.price, self.discount)
    }

    pub fn subtotal(&self) -> BigDecimal {
        self.unit_price() * BigDecimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    pub id: Uuid,
    pub user_id: Uuid,
    pub shipping_address: Option<String>,
    pub lines: Vec<CartLine>,
}

impl Cart {
    pub fn total(&self) -> BigDecimal {
        self.lines
            .iter()
            .fold(BigDecimal::from(0), |acc, line| acc + line.subtotal())
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Number of units across all lines.
    pub fn item_count(&self) -> i64 {
        self.lines.iter().map(|line| i64::from(line.quantity)).sum()
    }

    pub fn line(&self, product_id: Uuid) -> Option<&CartLine> {
        self.lines.iter().find(|line| line.product_id == product_id)
    }
}

/// What to do with the stored line after a cart operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineChange {
    Insert,
    SetQuantity(i32),
    Delete,
    Unchanged,
}

/// Adding one unit: out-of-stock products are ignored and an existing line
/// only grows while it stays within the available stock.
pub fn add_one(current: Option<i32>, stock: i32) -> LineChange {
    if stock <= 0 {
        return LineChange::Unchanged;
    }
    match current {
        None => LineChange::Insert,
        Some(quantity) if quantity < stock => LineChange::SetQuantity(quantity + 1),
        Some(_) => LineChange::Unchanged,
    }
}

/// Removing one unit deletes the line instead of leaving a zero quantity.
pub fn remove_one(current: Option<i32>) -> LineChange {
    match current {
        None => LineChange::Unchanged,
        Some(quantity) if quantity > 1 => LineChange::SetQuantity(quantity - 1),
        Some(_) => LineChange::Delete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn line(name: &str, quantity: i32, price: &str, discount: i32) -> CartLine {
        CartLine {
            product_id: Uuid::new_v4(),
            product_name: name.to_string(),
            quantity,
            price: BigDecimal::from_str(price).unwrap(),
            discount,
            stock: 10,
        }
    }

    fn cart(lines: Vec<CartLine>) -> Cart {
        Cart {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            shipping_address: None,
            lines,
        }
    }

    #[test]
    fn test_empty_cart_total_is_zero() {
        let cart = cart(vec![]);
        assert!(cart.is_empty());
        assert_eq!(cart.total(), BigDecimal::from(0));
        assert_eq!(cart.item_count(), 0);
    }

    #[test]
    fn test_total_uses_discounted_prices() {
        let cart = cart(vec![
            line("Mouse Gamer", 2, "100.00", 0),
            line("Teclado Mecánico", 1, "200.00", 50),
        ]);
        assert_eq!(cart.total(), BigDecimal::from(300));
        assert_eq!(cart.item_count(), 3);
    }

    #[test]
    fn test_total_is_sum_of_subtotals() {
        let cart = cart(vec![
            line("Auriculares", 3, "45.50", 10),
            line("Parlante", 1, "120.00", 0),
        ]);
        let expected: BigDecimal = cart
            .lines
            .iter()
            .map(|l| l.unit_price() * BigDecimal::from(l.quantity))
            .fold(BigDecimal::from(0), |acc, v| acc + v);
        assert_eq!(cart.total(), expected);
    }

    #[test]
    fn test_add_out_of_stock_is_ignored() {
        assert_eq!(add_one(None, 0), LineChange::Unchanged);
        assert_eq!(add_one(Some(2), 0), LineChange::Unchanged);
    }

    #[test]
    fn test_add_same_product_increments_until_stock() {
        assert_eq!(add_one(None, 2), LineChange::Insert);
        assert_eq!(add_one(Some(1), 2), LineChange::SetQuantity(2));
        assert_eq!(add_one(Some(2), 2), LineChange::Unchanged);
    }

    #[test]
    fn test_repeated_adds_never_exceed_stock() {
        let stock = 3;
        let mut quantity: Option<i32> = None;
        for _ in 0..10 {
            match add_one(quantity, stock) {
                LineChange::Insert => quantity = Some(1),
                LineChange::SetQuantity(q) => quantity = Some(q),
                LineChange::Unchanged => {}
                LineChange::Delete => unreachable!(),
            }
        }
        assert_eq!(quantity, Some(stock));
    }

    #[test]
    fn test_remove_decrements_then_deletes() {
        assert_eq!(remove_one(Some(3)), LineChange::SetQuantity(2));
        assert_eq!(remove_one(Some(1)), LineChange::Delete);
        assert_eq!(remove_one(None), LineChange::Unchanged);
    }
}
