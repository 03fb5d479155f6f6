//! Reconstruction of fit results for a rebinned channel.
//!
//! The rebinned channel is fitted together with the original card (original
//! channels masked out of the likelihood), then the diagnostics documents
//! are rewritten so a normal [`FitReader`](crate::FitReader) can consume
//! them: histograms truncated to the rebinned bin count, series-typed data
//! converted to histograms, and the covariance entries renamed.

use std::path::{Path, PathBuf};

use dc_card::parse;
use dc_core::{Result, ShapeObject};

use crate::diagnostics::{FitDiagnostics, ShapeStage};
use crate::runner::CombineRunner;

/// Channel name given to the masked original card in the combination.
pub const ORIGINAL_CHANNEL: &str = "dc_orig";
/// Channel name given to the rebinned card in the combination.
pub const REBINNED_CHANNEL: &str = "dc_rebin";

/// Fit a rebinned card against the original model and write reader-ready
/// diagnostics artifacts into `out_dir`. Returns the rewritten diagnostics
/// path.
pub fn create_rebinned_results(
    runner: &CombineRunner,
    original_card: &Path,
    rebinned_card: &Path,
    out_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(out_dir)?;
    let n_bins = parse::bin_list(&parse::read_card(rebinned_card)?)?.len();

    let combined = out_dir.join("rebinned_shapeCard.txt");
    runner.combine_cards(
        &[
            (ORIGINAL_CHANNEL.to_string(), original_card.to_path_buf()),
            (REBINNED_CHANNEL.to_string(), rebinned_card.to_path_buf()),
        ],
        &combined,
    )?;

    let workspace = out_dir.join("rebinned_shapeCard.root");
    runner.create_masked_workspace(&combined, &workspace, &[ORIGINAL_CHANNEL.to_string()])?;

    let diagnostics_path = out_dir.join("rebinned_shapeCard_FD.json");
    let mut doc = runner.fit_diagnostics(&workspace, &diagnostics_path, false)?;
    rewrite_diagnostics(&mut doc, REBINNED_CHANNEL, n_bins, true);
    doc.write(&diagnostics_path)?;

    let stat_path = out_dir.join("rebinned_shapeCard_statOnly_FD.json");
    let mut stat_doc = runner.fit_diagnostics(&workspace, &stat_path, true)?;
    rewrite_diagnostics(&mut stat_doc, REBINNED_CHANNEL, n_bins, true);
    stat_doc.write(&stat_path)?;

    tracing::info!(path = %diagnostics_path.display(), "rebinned diagnostics written");
    Ok(diagnostics_path)
}

/// Rewrite one channel of a diagnostics document in place: truncate every
/// histogram to `n_bins` and convert series-typed data to histograms with
/// Poisson errors. For a non-combined fit, rename `total_covar` to
/// `process_covar` and add the `total_overall` alias for `total`; a
/// combined fit already carries the overall covariance separately.
pub fn rewrite_diagnostics(
    doc: &mut FitDiagnostics,
    channel: &str,
    n_bins: usize,
    combined: bool,
) {
    for stage in [ShapeStage::Prefit, ShapeStage::FitS, ShapeStage::FitB] {
        let shapes = doc.shapes_mut(stage);
        let Some(entries) = shapes.remove(channel) else { continue };
        let mut rewritten = std::collections::BTreeMap::new();
        for (name, obj) in entries {
            let (name, obj) = match obj {
                ShapeObject::Hist(h) => (name, ShapeObject::Hist(h.truncated(n_bins))),
                ShapeObject::Series(s) => {
                    let hist = s.to_hist(name.clone(), n_bins);
                    (name, ShapeObject::Hist(hist))
                }
                ShapeObject::Hist2(m) if !combined && name == "total_covar" => {
                    ("process_covar".to_string(), ShapeObject::Hist2(m.truncated(n_bins)))
                }
                ShapeObject::Hist2(m) => (name, ShapeObject::Hist2(m.truncated(n_bins))),
            };
            rewritten.insert(name, obj);
        }
        if !combined {
            if let Some(total) = rewritten.get("total").cloned() {
                rewritten.insert("total_overall".to_string(), total);
            }
        }
        shapes.insert(channel.to_string(), rewritten);
    }
}
