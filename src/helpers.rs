//! Shared numeric helpers: Decimal ↔ f64 for geo columns and the unit
//! conversions providers apply when normalizing into the canonical record.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

/// Convert an f64 to Decimal preserving full precision.
///
/// Used for geographic values (latitude, longitude) where exact values
/// matter: the city table's coordinate pair is the dedup key.
pub(crate) fn f64_to_decimal_full(v: f64) -> Decimal {
    if !v.is_finite() {
        tracing::warn!(
            "f64_to_decimal_full received non-finite value {}, defaulting to 0",
            v
        );
        return Decimal::ZERO;
    }
    Decimal::from_f64(v).unwrap_or_else(|| Decimal::new(v as i64, 0))
}

/// Convert a Decimal to f64, defaulting to 0.0 for values that can't be represented.
pub(crate) fn dec_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

/// km/h → m/s, rounded to 2 decimal places.
pub(crate) fn kmh_to_ms(v: f64) -> f64 {
    (v / 3.6 * 100.0).round() / 100.0
}

/// cm → mm, as whole millimetres.
pub(crate) fn cm_to_mm(v: f64) -> i32 {
    (v * 10.0).round() as i32
}
