use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::UserDetails;

/// Customer cart as submitted by the ordering client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    pub session_id: String,
    pub table_id: String,
    #[serde(default)]
    pub user_details: UserDetails,
    pub payment_method: String,
    #[serde(default)]
    pub items: Vec<CartLine>,
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
}

/// One line of the cart. `name` and `price` become the order's snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    #[serde(alias = "id")]
    pub item_id: String,
    pub name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub quantity: i64,
}

/// Totals are compared in minor currency units.
const CURRENCY_SCALE: u32 = 2;

impl CartLine {
    /// `price * quantity`, or `None` when the product does not fit a `Decimal`.
    pub fn line_total(&self) -> Option<Decimal> {
        self.price.checked_mul(Decimal::from(self.quantity))
    }
}

impl Cart {
    /// Checks the cart before any store access and returns the total
    /// recomputed from its lines.
    pub fn validate(&self) -> Result<Decimal, CartError> {
        if self.items.is_empty() {
            return Err(CartError::Empty);
        }
        if self.total.is_sign_negative() && !self.total.is_zero() {
            return Err(CartError::NegativeTotal(self.total));
        }

        let mut computed = Decimal::ZERO;
        for line in &self.items {
            if line.item_id.trim().is_empty() {
                return Err(CartError::MissingItemId);
            }
            if line.quantity <= 0 {
                return Err(CartError::NonPositiveQuantity {
                    item_id: line.item_id.clone(),
                    quantity: line.quantity,
                });
            }
            if line.price.is_sign_negative() && !line.price.is_zero() {
                return Err(CartError::NegativePrice {
                    item_id: line.item_id.clone(),
                });
            }
            computed = line
                .line_total()
                .and_then(|amount| computed.checked_add(amount))
                .ok_or_else(|| CartError::AmountOverflow {
                    item_id: line.item_id.clone(),
                })?;
        }

        // Clients sum float prices, so the submitted total can carry binary noise.
        if self.total.round_dp(CURRENCY_SCALE) != computed.round_dp(CURRENCY_SCALE) {
            return Err(CartError::TotalMismatch {
                submitted: self.total,
                computed,
            });
        }

        Ok(computed)
    }
}

/// Reasons a cart is rejected before it reaches the store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CartError {
    #[error("cart has no items")]
    Empty,
    #[error("cart line is missing an item id")]
    MissingItemId,
    #[error("quantity for {item_id} must be positive (got {quantity})")]
    NonPositiveQuantity { item_id: String, quantity: i64 },
    #[error("price for {item_id} must not be negative")]
    NegativePrice { item_id: String },
    #[error("order total must not be negative (got {0})")]
    NegativeTotal(Decimal),
    #[error("order amount for {item_id} is out of range")]
    AmountOverflow { item_id: String },
    #[error("order total {submitted} does not match line items ({computed})")]
    TotalMismatch { submitted: Decimal, computed: Decimal },
}
