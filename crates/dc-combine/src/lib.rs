//! # dc-combine
//!
//! Invokes the external `combine` fitting toolchain on written datacards,
//! defines the JSON schemas of its artifacts, and reads fit results back
//! into derived views (pulls, uncertainty decompositions, region histograms,
//! rebinned reconstructions).

#![warn(clippy::all)]

pub mod diagnostics;
pub mod rebin;
pub mod results;
pub mod runner;

pub use diagnostics::{FitDiagnostics, FitSnapshot, LimitTable, NllRecord, ShapeStage};
pub use results::{FitReader, ShapeUncertainties, UncertaintyMap};
pub use runner::{CombineRunner, ScratchDir};
