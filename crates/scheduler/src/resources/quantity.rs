//! Fixed-point resource quantities
//!
//! Fractional requests such as `{CPU: 0.3}` are stored as integer multiples of
//! 1/10000 so that reserve/release pairs restore availability exactly.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

/// Number of fixed-point units per whole resource unit
pub const UNITS_PER_RESOURCE: i64 = 10_000;

/// A non-negative resource amount in fixed-point units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(i64);

impl Quantity {
    /// Zero units
    pub const ZERO: Quantity = Quantity(0);

    /// Build from raw fixed-point units
    pub const fn from_units(units: i64) -> Self {
        Self(units)
    }

    /// Convert a floating-point amount, rounding to the nearest unit
    ///
    /// Returns `None` for negative, NaN or infinite input.
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let scaled = (value * UNITS_PER_RESOURCE as f64).round();
        if scaled > i64::MAX as f64 {
            return None;
        }
        Some(Self(scaled as i64))
    }

    /// Raw fixed-point units
    pub const fn units(self) -> i64 {
        self.0
    }

    /// Floating-point view, for reporting only
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / UNITS_PER_RESOURCE as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Subtract, returning `None` instead of going negative
    pub fn checked_sub(self, rhs: Quantity) -> Option<Quantity> {
        self.0.checked_sub(rhs.0).filter(|v| *v >= 0).map(Quantity)
    }

    pub fn checked_add(self, rhs: Quantity) -> Option<Quantity> {
        self.0.checked_add(rhs.0).map(Quantity)
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    /// Saturating at zero; use [`Quantity::checked_sub`] where underflow is a bug
    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity((self.0 - rhs.0).max(0))
    }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Quantity {
        iter.fold(Quantity::ZERO, |acc, q| acc + q)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_f64())
    }
}
