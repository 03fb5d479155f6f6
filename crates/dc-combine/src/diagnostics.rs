//! On-disk artifact schemas for the external fitter's outputs.
//!
//! The fitter writes one diagnostics document per fit (signal+background and
//! background-only snapshots plus pre/post-fit shapes), a limit table and an
//! NLL record. All three are JSON; shape entries are a tagged union resolved
//! once at deserialization time.

use std::collections::BTreeMap;
use std::path::Path;

use dc_core::{FitParameter, Hist2, Result, ShapeObject};
use serde::{Deserialize, Serialize};

/// Per-channel maps of named shape objects.
pub type ShapeMap = BTreeMap<String, BTreeMap<String, ShapeObject>>;

/// Which shape directory of the diagnostics document to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeStage {
    /// Shapes before the fit.
    Prefit,
    /// Shapes after the signal+background fit.
    FitS,
    /// Shapes after the background-only fit.
    FitB,
}

/// One fit snapshot: parameter lists before and after minimization, plus the
/// parameter correlation matrix when the fitter stored one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitSnapshot {
    /// Parameters at their initial values.
    #[serde(default)]
    pub params_init: Vec<FitParameter>,
    /// Parameters at the minimum.
    #[serde(default)]
    pub params_final: Vec<FitParameter>,
    /// Labeled parameter correlation matrix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<Hist2>,
}

impl FitSnapshot {
    /// Look up an initial parameter by name.
    pub fn param_init(&self, name: &str) -> Option<&FitParameter> {
        self.params_init.iter().find(|p| p.name == name)
    }

    /// Look up a fitted parameter by name.
    pub fn param_final(&self, name: &str) -> Option<&FitParameter> {
        self.params_final.iter().find(|p| p.name == name)
    }
}

/// The full fit-diagnostics document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    /// Signal+background fit snapshot.
    #[serde(default)]
    pub fit_s: FitSnapshot,
    /// Background-only fit snapshot.
    #[serde(default)]
    pub fit_b: FitSnapshot,
    /// Pre-fit nuisance parameters.
    #[serde(default)]
    pub nuisances_prefit: Vec<FitParameter>,
    /// Pre-fit shapes per channel.
    #[serde(default)]
    pub shapes_prefit: ShapeMap,
    /// Post-fit (s+b) shapes per channel.
    #[serde(default)]
    pub shapes_fit_s: ShapeMap,
    /// Post-fit (b-only) shapes per channel.
    #[serde(default)]
    pub shapes_fit_b: ShapeMap,
    /// Bin-by-bin covariance over all channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_total_covar: Option<Hist2>,
    /// Per-process yield covariance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_covar: Option<Hist2>,
    /// Per-process yield correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_corr: Option<Hist2>,
}

impl FitDiagnostics {
    /// Read a document from a JSON file.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            dc_core::Error::MissingArtifact(format!("{}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write the document to a JSON file, pretty-printed.
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    /// The shape directory for one stage.
    pub fn shapes(&self, stage: ShapeStage) -> &ShapeMap {
        match stage {
            ShapeStage::Prefit => &self.shapes_prefit,
            ShapeStage::FitS => &self.shapes_fit_s,
            ShapeStage::FitB => &self.shapes_fit_b,
        }
    }

    /// Mutable access to the shape directory for one stage.
    pub fn shapes_mut(&mut self, stage: ShapeStage) -> &mut ShapeMap {
        match stage {
            ShapeStage::Prefit => &mut self.shapes_prefit,
            ShapeStage::FitS => &mut self.shapes_fit_s,
            ShapeStage::FitB => &mut self.shapes_fit_b,
        }
    }
}

/// One row of the asymptotic-limit table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitRow {
    /// Expected quantile, `-1` for the observed limit.
    pub quantile_expected: f64,
    /// Limit on the signal strength.
    pub limit: f64,
}

/// The asymptotic-limit artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitTable {
    /// Observed plus expected-quantile rows.
    pub rows: Vec<LimitRow>,
}

impl LimitTable {
    /// Read a table from a JSON file.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            dc_core::Error::MissingArtifact(format!("{}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Limits keyed by the quantile formatted to three decimals
    /// (`"-1.000"` is the observed limit).
    pub fn as_map(&self) -> BTreeMap<String, f64> {
        self.rows.iter().map(|r| (format!("{:.3}", r.quantile_expected), r.limit)).collect()
    }
}

/// The NLL artifact of a point-estimate fit: the baseline value and the
/// change from the fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NllRecord {
    /// NLL at the initial parameter snapshot.
    pub nll0: f64,
    /// NLL change from minimization.
    pub nll: f64,
}

impl NllRecord {
    /// Read a record from a JSON file.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            dc_core::Error::MissingArtifact(format!("{}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Absolute NLL at the minimum.
    pub fn nll_abs(&self) -> f64 {
        self.nll0 + self.nll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dc_core::{Hist1, Series};

    #[test]
    fn snapshot_lookup_by_name() {
        let snap = FitSnapshot {
            params_init: vec![FitParameter { name: "r".into(), value: 1.0, error: 0.0 }],
            params_final: vec![FitParameter { name: "r".into(), value: 0.8, error: 0.2 }],
            correlation: None,
        };
        assert_eq!(snap.param_init("r").map(|p| p.value), Some(1.0));
        assert_eq!(snap.param_final("r").map(|p| p.error), Some(0.2));
        assert!(snap.param_final("x").is_none());
    }

    #[test]
    fn diagnostics_round_trips_tagged_shapes() {
        let mut doc = FitDiagnostics::default();
        let mut channel = BTreeMap::new();
        channel.insert(
            "total".to_string(),
            ShapeObject::Hist(Hist1 {
                name: "total".into(),
                content: vec![5.0, 6.0],
                error: vec![0.5, 0.6],
                labels: None,
            }),
        );
        channel.insert(
            "data".to_string(),
            ShapeObject::Series(Series {
                name: "data".into(),
                points: vec![(0.5, 4.0), (1.5, 7.0)],
            }),
        );
        doc.shapes_fit_b.insert("Bin0".to_string(), channel);

        let json = serde_json::to_string(&doc).unwrap();
        let back: FitDiagnostics = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
        let data = &back.shapes(ShapeStage::FitB)["Bin0"]["data"];
        assert!(matches!(data, ShapeObject::Series(_)));
    }

    #[test]
    fn limit_table_keys_by_formatted_quantile() {
        let table = LimitTable {
            rows: vec![
                LimitRow { quantile_expected: -1.0, limit: 1.9 },
                LimitRow { quantile_expected: 0.5, limit: 2.1 },
                LimitRow { quantile_expected: 0.975, limit: 4.3 },
            ],
        };
        let map = table.as_map();
        assert_eq!(map["-1.000"], 1.9);
        assert_eq!(map["0.500"], 2.1);
        assert_eq!(map["0.975"], 4.3);
    }

    #[test]
    fn nll_record_absolute_value() {
        let rec = NllRecord { nll0: 100.0, nll: -2.5 };
        assert!((rec.nll_abs() - 97.5).abs() < 1e-12);
    }
}
