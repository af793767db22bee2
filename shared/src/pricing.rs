use bigdecimal::{BigDecimal, RoundingMode};

use crate::StoreError;

pub const MAX_DISCOUNT: i32 = 100;

/// Price after applying a whole-number percentage discount.
pub fn discounted_price(price: &BigDecimal, discount: i32) -> BigDecimal {
    if discount == 0 {
        return price.clone();
    }
    price - savings(price, discount)
}

/// Amount taken off the list price by the discount.
pub fn savings(price: &BigDecimal, discount: i32) -> BigDecimal {
    if discount == 0 {
        return BigDecimal::from(0);
    }
    price * BigDecimal::from(discount) / BigDecimal::from(100)
}

pub fn validate_discount(discount: i32) -> Result<(), StoreError> {
    if !(0..=MAX_DISCOUNT).contains(&discount) {
        return Err(StoreError::Invalid(format!(
            "discount must be between 0 and {}, got {}",
            MAX_DISCOUNT, discount
        )));
    }
    Ok(())
}

/// Rounds to cents, half away from zero, the way a `NUMERIC(10,2)` column
/// stores it.
pub fn round_money(amount: &BigDecimal) -> BigDecimal {
    amount.with_scale_round(2, RoundingMode::HalfUp)
}

/// Two-decimal amount with a leading `$`, as printed on invoices.
pub fn format_money(amount: &BigDecimal) -> String {
    format!("${}", round_money(amount))
}
