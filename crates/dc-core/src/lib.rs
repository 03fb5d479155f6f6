//! # dc-core
//!
//! Shared types for the datacard crates: error handling, value-with-error
//! arithmetic, and the histogram value types used by shape inputs and
//! fit-diagnostics artifacts.

#![warn(clippy::all)]

pub mod error;
pub mod hist;
pub mod types;

pub use error::{Error, Result};
pub use hist::{Hist1, Hist2, Series, ShapeObject};
pub use types::{FitParameter, ValueWithError};
