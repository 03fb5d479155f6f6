//! Common value types.

use serde::{Deserialize, Serialize};

/// A measured value with a symmetric uncertainty.
///
/// Addition accumulates values linearly and errors in quadrature, matching
/// how per-process yields are combined into totals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueWithError {
    /// Central value.
    pub value: f64,
    /// Symmetric uncertainty (one standard deviation).
    pub error: f64,
}

impl ValueWithError {
    /// Create a new value with error.
    pub fn new(value: f64, error: f64) -> Self {
        Self { value, error }
    }

    /// Relative uncertainty `error / value`, defined as 0 for zero value.
    pub fn relative(&self) -> f64 {
        if self.value != 0.0 {
            self.error / self.value
        } else {
            0.0
        }
    }
}

impl std::ops::Add for ValueWithError {
    type Output = ValueWithError;

    fn add(self, other: ValueWithError) -> ValueWithError {
        ValueWithError {
            value: self.value + other.value,
            error: (self.error * self.error + other.error * other.error).sqrt(),
        }
    }
}

impl std::ops::AddAssign for ValueWithError {
    fn add_assign(&mut self, other: ValueWithError) {
        *self = *self + other;
    }
}

/// A named floating parameter from a fit snapshot (central value + error).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitParameter {
    /// Parameter name.
    pub name: String,
    /// Central value.
    pub value: f64,
    /// Estimated error.
    pub error: f64,
}

impl FitParameter {
    /// The parameter as a [`ValueWithError`].
    pub fn estimate(&self) -> ValueWithError {
        ValueWithError::new(self.value, self.error)
    }
}
