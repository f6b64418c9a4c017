//! Shared primitive types used across the crate.

/// Customer identifier as it appears in the source table.
pub type CustomerId = String;

/// Day index since the earliest transaction date in the dataset, 1-based.
pub type PurchDay = u32;

/// Amount in integer cents. Spend is scaled before any summation.
pub type Cents = i64;

/// Scale a decimal currency amount to integer cents.
pub fn to_cents(amount: f64) -> Cents {
    (amount * 100.0).round() as Cents
}

pub fn from_cents(cents: Cents) -> f64 {
    cents as f64 / 100.0
}
