pub mod cart;
pub mod error;
pub mod order;
pub mod pricing;

pub use cart::{add_one, remove_one, Cart, CartLine, LineChange};
pub use error::StoreError;
pub use order::{
    remaining_stock, InvoiceRequested, OrderLineSnapshot, OrderNumber, OrderPlan, StockDecrement,
    INVOICE_REQUESTED,
};
pub use pricing::{discounted_price, format_money, round_money, savings, validate_discount};

/// Currency every price in the catalog is expressed in.
pub const CURRENCY_ID: &str = "ARS";
