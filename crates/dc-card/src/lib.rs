//! # dc-card
//!
//! Builds a statistical model description (bins x processes x systematics,
//! rate parameters, shape uncertainties) and serializes it to the plain-text
//! datacard format consumed by the external fitting tool, plus the matching
//! re-parser used by the result reader.

#![warn(clippy::all)]

pub mod parse;
pub mod writer;

#[cfg(test)]
mod tests;

pub use writer::{CardWriter, RateParameter, UncertaintyKind, ValidationError};
