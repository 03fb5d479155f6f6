//! Datacard model builder.
//!
//! `CardWriter` accumulates bins, processes, observed counts, expected
//! yields, systematic uncertainty values and rate parameters, validates the
//! accumulated model, and serializes it to the fixed-column datacard text
//! format. Mutators return a `ValidationError` instead of aborting; a failed
//! call leaves the builder unchanged, so a long model-building sequence can
//! keep going past a bad call and detect it from the return value.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use dc_core::{Hist1, Result};
use thiserror::Error;

/// Hard cap on bin, process and uncertainty name lengths (column width).
pub const MAX_NAME_WIDTH: usize = 30;
/// Hard cap on the encoded uncertainty type string.
pub const MAX_TYPE_WIDTH: usize = 30;

/// Why a builder call was rejected. The builder is left unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A name exceeds the fixed column width.
    #[error("name '{name}' exceeds {limit} characters")]
    NameTooLong {
        /// The offending name.
        name: String,
        /// The applicable limit.
        limit: usize,
    },
    /// The name is already registered.
    #[error("'{0}' is already registered")]
    DuplicateName(String),
    /// A referenced bin / process / uncertainty was never added.
    #[error("unknown {kind} '{name}'")]
    UnknownReference {
        /// What was referenced ("bin", "process", "uncertainty").
        kind: &'static str,
        /// The unknown name.
        name: String,
    },
    /// A supplied value is NaN or infinite.
    #[error("non-finite value {value} for {context}")]
    NonFiniteValue {
        /// What the value was supplied for.
        context: String,
        /// The offending value.
        value: f64,
    },
    /// A gmN uncertainty was added without its integer parameter.
    #[error("gmN uncertainty requires n > 0")]
    GammaWithoutN,
}

/// Systematic uncertainty encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UncertaintyKind {
    /// Log-normal scalar (or asymmetric pair rendered as one factor).
    LnN,
    /// Gamma/Poisson-constrained with control-region count `n`.
    GmN(u64),
    /// Bin-by-bin shape morphing (requires histograms).
    Shape,
}

impl UncertaintyKind {
    /// The type string as rendered in the card.
    pub fn encoded(&self) -> String {
        match self {
            UncertaintyKind::LnN => "lnN".to_string(),
            UncertaintyKind::GmN(n) => format!("gmN {}", n),
            UncertaintyKind::Shape => "shape".to_string(),
        }
    }
}

/// A freely floating multiplicative normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RateParameter {
    /// Process name the parameter scales (may carry a `*` wildcard suffix).
    pub process: String,
    /// Initial value.
    pub value: f64,
    /// Allowed range `[lo, hi]`.
    pub range: (f64, f64),
}

/// A named per-bin floating parameter (one `rateParam` line per bin).
#[derive(Debug, Clone, PartialEq)]
pub struct FreeParameter {
    /// Parameter name.
    pub name: String,
    /// Process the parameter scales.
    pub process: String,
    /// Initial value.
    pub value: f64,
    /// Allowed range `[lo, hi]`.
    pub range: (f64, f64),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct YieldKey {
    bin: String,
    process: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UncKey {
    uncertainty: String,
    bin: String,
    process: String,
}

/// Accumulator for a datacard model; write-once in practice.
#[derive(Debug, Clone)]
pub struct CardWriter {
    bins: Vec<String>,
    nice_names: HashMap<String, String>,
    muted: HashMap<String, bool>,
    processes: HashMap<String, Vec<String>>,
    uncertainties: Vec<String>,
    uncertainty_kind: HashMap<String, UncertaintyKind>,
    uncertainty_values: HashMap<UncKey, f64>,
    expectation: HashMap<YieldKey, f64>,
    observation: HashMap<String, i64>,
    contamination: HashMap<String, f64>,
    has_contamination: bool,
    rate_parameters: Vec<RateParameter>,
    free_parameters: Vec<FreeParameter>,
    control_regions: Vec<String>,
    signal_regions: Vec<String>,
    region_mapping: Vec<usize>,
    precision: u32,
    column_width: usize,
}

impl Default for CardWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl CardWriter {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            bins: Vec::new(),
            nice_names: HashMap::new(),
            muted: HashMap::new(),
            processes: HashMap::new(),
            uncertainties: Vec::new(),
            uncertainty_kind: HashMap::new(),
            uncertainty_values: HashMap::new(),
            expectation: HashMap::new(),
            observation: HashMap::new(),
            contamination: HashMap::new(),
            has_contamination: false,
            rate_parameters: Vec::new(),
            free_parameters: Vec::new(),
            control_regions: Vec::new(),
            signal_regions: Vec::new(),
            region_mapping: Vec::new(),
            precision: 10,
            column_width: 12,
        }
    }

    /// Clear all accumulated tables.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Set the decimal precision applied to stored rates and uncertainties.
    pub fn set_precision(&mut self, precision: u32) {
        self.precision = precision;
    }

    /// Registered bin names, in insertion order.
    pub fn bins(&self) -> &[String] {
        &self.bins
    }

    /// Processes of a bin (including the implicit `signal`).
    pub fn processes(&self, bin: &str) -> Option<&[String]> {
        self.processes.get(bin).map(|v| v.as_slice())
    }

    /// Registered uncertainty names, in insertion order.
    pub fn uncertainties(&self) -> &[String] {
        &self.uncertainties
    }

    /// Stored expectation for a (bin, process) pair.
    pub fn expectation(&self, bin: &str, process: &str) -> Option<f64> {
        self.expectation.get(&YieldKey { bin: bin.into(), process: process.into() }).copied()
    }

    /// Stored uncertainty value for an (uncertainty, bin, process) triple.
    pub fn uncertainty_value(&self, uncertainty: &str, bin: &str, process: &str) -> Option<f64> {
        self.uncertainty_values
            .get(&UncKey {
                uncertainty: uncertainty.into(),
                bin: bin.into(),
                process: process.into(),
            })
            .copied()
    }

    /// Register a bin with its background processes; `signal` is implicit.
    pub fn add_bin(
        &mut self,
        name: &str,
        processes: &[&str],
        nice_name: &str,
    ) -> std::result::Result<(), ValidationError> {
        if name.len() > MAX_NAME_WIDTH {
            return self.reject(ValidationError::NameTooLong {
                name: name.to_string(),
                limit: MAX_NAME_WIDTH,
            });
        }
        if self.nice_names.contains_key(name) {
            return self.reject(ValidationError::DuplicateName(name.to_string()));
        }
        for p in processes {
            if p.len() > MAX_NAME_WIDTH {
                return self.reject(ValidationError::NameTooLong {
                    name: p.to_string(),
                    limit: MAX_NAME_WIDTH,
                });
            }
        }
        self.nice_names.insert(name.to_string(), nice_name.to_string());
        self.bins.push(name.to_string());
        self.muted.insert(name.to_string(), false);
        let mut procs = vec!["signal".to_string()];
        procs.extend(processes.iter().map(|p| p.to_string()));
        self.processes.insert(name.to_string(), procs);
        Ok(())
    }

    /// Mute a bin: it keeps its tables but is dropped from serialization.
    pub fn mute(&mut self, bin: &str) -> std::result::Result<(), ValidationError> {
        match self.muted.get_mut(bin) {
            Some(m) => {
                *m = true;
                Ok(())
            }
            None => self.reject(ValidationError::UnknownReference {
                kind: "bin",
                name: bin.to_string(),
            }),
        }
    }

    /// Register a systematic uncertainty. Registration is atomic: a rejected
    /// call leaves no trace of the name.
    pub fn add_uncertainty(
        &mut self,
        name: &str,
        kind: UncertaintyKind,
    ) -> std::result::Result<(), ValidationError> {
        if name.len() > MAX_NAME_WIDTH {
            return self.reject(ValidationError::NameTooLong {
                name: name.to_string(),
                limit: MAX_NAME_WIDTH,
            });
        }
        if self.uncertainty_kind.contains_key(name) {
            return self.reject(ValidationError::DuplicateName(name.to_string()));
        }
        if kind == UncertaintyKind::GmN(0) {
            return self.reject(ValidationError::GammaWithoutN);
        }
        let encoded = kind.encoded();
        if encoded.len() > MAX_TYPE_WIDTH {
            return self.reject(ValidationError::NameTooLong { name: encoded, limit: MAX_TYPE_WIDTH });
        }
        self.uncertainties.push(name.to_string());
        self.uncertainty_kind.insert(name.to_string(), kind);
        Ok(())
    }

    /// Register a rate parameter; duplicate process patterns are ignored.
    pub fn add_rate_parameter(
        &mut self,
        process: &str,
        value: f64,
        range: (f64, f64),
    ) -> std::result::Result<(), ValidationError> {
        if self.rate_parameters.iter().any(|r| r.process == process) {
            return self.reject(ValidationError::DuplicateName(process.to_string()));
        }
        self.rate_parameters.push(RateParameter { process: process.to_string(), value, range });
        Ok(())
    }

    /// Register a per-bin free parameter; duplicate names are ignored.
    pub fn add_free_parameter(
        &mut self,
        name: &str,
        process: &str,
        value: f64,
        range: (f64, f64),
    ) -> std::result::Result<(), ValidationError> {
        if self.free_parameters.iter().any(|r| r.name == name) {
            return self.reject(ValidationError::DuplicateName(name.to_string()));
        }
        self.free_parameters.push(FreeParameter {
            name: name.to_string(),
            process: process.to_string(),
            value,
            range,
        });
        Ok(())
    }

    /// Declare the control-region bins of the grouped-region variant.
    pub fn add_control_regions(&mut self, bins: &[&str]) {
        self.control_regions = bins.iter().map(|b| b.to_string()).collect();
    }

    /// Declare the signal-region bins of the grouped-region variant.
    pub fn add_signal_regions(&mut self, bins: &[&str]) {
        self.signal_regions = bins.iter().map(|b| b.to_string()).collect();
    }

    /// Map each control region to the number of consecutive signal-region
    /// bins its rate parameter also scales.
    pub fn add_region_mapping(&mut self, mapping: &[usize]) {
        self.region_mapping = mapping.to_vec();
    }

    /// Store an expected yield, rounded to the configured precision.
    pub fn specify_expectation(
        &mut self,
        bin: &str,
        process: &str,
        value: f64,
    ) -> std::result::Result<(), ValidationError> {
        self.check_bin_process(bin, process)?;
        if !value.is_finite() {
            return self.reject(ValidationError::NonFiniteValue {
                context: format!("expectation ({}, {})", bin, process),
                value,
            });
        }
        self.expectation.insert(
            YieldKey { bin: bin.to_string(), process: process.to_string() },
            round_to(value, self.precision),
        );
        Ok(())
    }

    /// Store an observed count.
    pub fn specify_observation(
        &mut self,
        bin: &str,
        observed: i64,
    ) -> std::result::Result<(), ValidationError> {
        if !self.nice_names.contains_key(bin) {
            return self.reject(ValidationError::UnknownReference {
                kind: "bin",
                name: bin.to_string(),
            });
        }
        self.observation.insert(bin.to_string(), observed);
        Ok(())
    }

    /// Store a signal contamination value; enables the contamination row.
    pub fn specify_contamination(
        &mut self,
        bin: &str,
        value: f64,
    ) -> std::result::Result<(), ValidationError> {
        if !self.nice_names.contains_key(bin) {
            return self.reject(ValidationError::UnknownReference {
                kind: "bin",
                name: bin.to_string(),
            });
        }
        if !value.is_finite() {
            return self.reject(ValidationError::NonFiniteValue {
                context: format!("contamination ({})", bin),
                value,
            });
        }
        self.contamination.insert(bin.to_string(), value);
        self.has_contamination = true;
        Ok(())
    }

    /// Store an uncertainty value for one (uncertainty, bin, process) triple.
    ///
    /// Negative values are coerced to `1.0`: for lnN/gmN the sign encodes the
    /// correlation direction in the fitter's convention, and it is discarded
    /// here under the assumption that the correlation pattern is irrelevant
    /// (check!).
    pub fn specify_uncertainty(
        &mut self,
        uncertainty: &str,
        bin: &str,
        process: &str,
        value: f64,
    ) -> std::result::Result<(), ValidationError> {
        if !self.uncertainty_kind.contains_key(uncertainty) {
            return self.reject(ValidationError::UnknownReference {
                kind: "uncertainty",
                name: uncertainty.to_string(),
            });
        }
        self.check_bin_process(bin, process)?;
        if !value.is_finite() {
            return self.reject(ValidationError::NonFiniteValue {
                context: format!("uncertainty ({}, {}, {})", uncertainty, bin, process),
                value,
            });
        }
        let value = if value < 0.0 {
            tracing::warn!(
                uncertainty,
                bin,
                process,
                value,
                "negative uncertainty, reversing sign under the assumption that \
                 the correlation pattern is irrelevant (check!)"
            );
            1.0
        } else {
            value
        };
        self.uncertainty_values.insert(
            UncKey {
                uncertainty: uncertainty.to_string(),
                bin: bin.to_string(),
                process: process.to_string(),
            },
            round_to(value, self.precision),
        );
        Ok(())
    }

    /// Apply one uncertainty value to every (bin, process) pair.
    pub fn specify_flat_uncertainty(
        &mut self,
        uncertainty: &str,
        value: f64,
    ) -> std::result::Result<(), ValidationError> {
        if !self.uncertainty_kind.contains_key(uncertainty) {
            return self.reject(ValidationError::UnknownReference {
                kind: "uncertainty",
                name: uncertainty.to_string(),
            });
        }
        let pairs: Vec<(String, String)> = self
            .bins
            .iter()
            .flat_map(|b| {
                self.processes[b].iter().map(move |p| (b.clone(), p.clone())).collect::<Vec<_>>()
            })
            .collect();
        for (bin, process) in pairs {
            self.specify_uncertainty(uncertainty, &bin, &process, value)?;
        }
        Ok(())
    }

    /// Verify the model is complete enough to serialize: every unmuted bin
    /// has an observation, every (bin, process) pair an expectation, every
    /// stored uncertainty value is finite.
    pub fn check_completeness(&self) -> bool {
        for bin in &self.bins {
            if self.muted.get(bin).copied().unwrap_or(false) {
                continue;
            }
            if !self.observation.contains_key(bin) {
                tracing::warn!(bin, "no valid observation");
                return false;
            }
            if self.has_contamination && !self.contamination.contains_key(bin) {
                tracing::warn!(bin, "no valid contamination");
                return false;
            }
            let procs = &self.processes[bin];
            if procs.is_empty() {
                tracing::warn!(bin, "bin has no processes");
            }
            for process in procs {
                let key = YieldKey { bin: bin.clone(), process: process.clone() };
                match self.expectation.get(&key) {
                    Some(v) if v.is_finite() => {}
                    _ => {
                        tracing::warn!(bin, process, "no valid expectation");
                        return false;
                    }
                }
            }
        }
        for (key, value) in &self.uncertainty_values {
            if !value.is_finite() {
                tracing::warn!(
                    uncertainty = key.uncertainty,
                    bin = key.bin,
                    process = key.process,
                    value,
                    "uncertainty value invalid"
                );
                return false;
            }
        }
        true
    }

    /// Serialize the model to `path`. Returns `Ok(None)` without writing
    /// anything when the completeness check fails.
    pub fn write_to_file(&self, path: &Path) -> Result<Option<PathBuf>> {
        self.write_card(path, None, false)
    }

    /// Like [`write_to_file`](Self::write_to_file) with a `shapes` header
    /// pointing at `shape_file` and, unless `no_mc_stats`, an `autoMCStats`
    /// trailer.
    pub fn write_to_file_with_shapes(
        &self,
        path: &Path,
        shape_file: &str,
        no_mc_stats: bool,
    ) -> Result<Option<PathBuf>> {
        self.write_card(path, Some(shape_file), no_mc_stats)
    }

    fn write_card(
        &self,
        path: &Path,
        shape_file: Option<&str>,
        no_mc_stats: bool,
    ) -> Result<Option<PathBuf>> {
        if !self.check_completeness() {
            tracing::warn!(path = %path.display(), "incomplete specification, card not written");
            return Ok(None);
        }

        let unmuted: Vec<&String> =
            self.bins.iter().filter(|b| !self.muted.get(*b).copied().unwrap_or(false)).collect();

        // Numeric process ids: signal -> 0, backgrounds -> 1..N by first appearance.
        let mut number_id: HashMap<&str, usize> = HashMap::new();
        number_id.insert("signal", 0);
        let mut next_id = 1;
        for bin in &unmuted {
            for p in &self.processes[*bin] {
                if p != "signal" && !number_id.contains_key(p.as_str()) {
                    number_id.insert(p, next_id);
                    next_id += 1;
                }
            }
        }

        let lspace = MAX_TYPE_WIDTH + MAX_NAME_WIDTH + 2;
        let w = self.column_width;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);

        writeln!(out, "imax {}", unmuted.len())?;
        writeln!(out, "jmax *")?;
        writeln!(out, "kmax *")?;
        writeln!(out)?;

        for bin in &self.bins {
            if self.muted.get(bin).copied().unwrap_or(false) {
                writeln!(out, "#Muted: {}: {}", bin, self.nice_names[bin])?;
            } else {
                writeln!(out, "# {}: {}", bin, self.nice_names[bin])?;
            }
        }
        writeln!(out)?;

        if let Some(shapes) = shape_file {
            writeln!(out, "shapes * * {} $CHANNEL_$PROCESS $CHANNEL_$PROCESS_$SYSTEMATIC", shapes)?;
            writeln!(out)?;
        }

        let row = |label: &str, cells: Vec<String>| -> String {
            format!(
                "{:<lw$}{}",
                label,
                cells.iter().map(|c| format!("{:>w$}", c)).collect::<Vec<_>>().join(" "),
                lw = lspace,
            )
        };

        writeln!(out, "{}", row("bin", unmuted.iter().map(|b| b.to_string()).collect()))?;
        writeln!(
            out,
            "{}",
            row("observation", unmuted.iter().map(|b| self.observation[*b].to_string()).collect())
        )?;
        if self.has_contamination {
            writeln!(
                out,
                "{}",
                row(
                    "contamination",
                    unmuted
                        .iter()
                        .map(|b| format_value(self.contamination[*b], self.precision))
                        .collect()
                )
            )?;
        }
        writeln!(out)?;

        let per_process = |f: &dyn Fn(&str, &str) -> String| -> Vec<String> {
            unmuted
                .iter()
                .flat_map(|b| self.processes[*b].iter().map(move |p| f(b, p)))
                .collect()
        };
        writeln!(out, "{}", row("bin", per_process(&|b, _| b.to_string())))?;
        writeln!(out, "{}", row("process", per_process(&|_, p| p.to_string())))?;
        writeln!(out, "{}", row("process", per_process(&|_, p| number_id[p].to_string())))?;
        writeln!(
            out,
            "{}",
            row(
                "rate",
                per_process(&|b, p| format_value(
                    self.expectation(b, p).unwrap_or(0.0),
                    self.precision
                ))
            )
        )?;
        writeln!(out)?;

        for unc in &self.uncertainties {
            let kind = self.uncertainty_kind[unc];
            let cells = per_process(&|b, p| self.uncertainty_cell(unc, kind, b, p));
            writeln!(
                out,
                "{:<nw$} {:<tw$} {}",
                unc,
                kind.encoded(),
                cells.iter().map(|c| format!("{:>w$}", c)).collect::<Vec<_>>().join(" "),
                nw = MAX_NAME_WIDTH,
                tw = MAX_TYPE_WIDTH,
            )?;
        }

        self.write_rate_parameters(&mut out, &unmuted)?;

        for fp in &self.free_parameters {
            writeln!(out)?;
            for bin in &self.bins {
                writeln!(
                    out,
                    "{} rateParam {} {} {} [{},{}]",
                    fp.name, bin, fp.process, fp.value, fp.range.0, fp.range.1
                )?;
            }
        }

        if shape_file.is_some() && !no_mc_stats {
            writeln!(out, "* autoMCStats 10")?;
        }

        out.flush()?;
        tracing::info!(path = %path.display(), "card file written");
        Ok(Some(path.to_path_buf()))
    }

    /// Rate-parameter block: each parameter floats one normalization per
    /// control-region group; signal-region bins mapped to the group are tied
    /// to it via the `(@0*1)` indirection. Without declared regions the
    /// parameter spans all bins with a single `extArg`.
    fn write_rate_parameters<Wr: Write>(&self, out: &mut Wr, unmuted: &[&String]) -> Result<()> {
        for rp in &self.rate_parameters {
            writeln!(out)?;
            if self.control_regions.is_empty() {
                let param = format!("{}_norm", rp.process);
                for bin in unmuted {
                    writeln!(
                        out,
                        "{}_norm_{} rateParam {} {} (@0*1) {}",
                        rp.process, bin, bin, rp.process, param
                    )?;
                }
                writeln!(out, "{} extArg {} [{},{}]", param, rp.value, rp.range.0, rp.range.1)?;
                continue;
            }

            let mut shift = 0;
            for (i_cr, cr) in self.control_regions.iter().enumerate() {
                let param = format!("{}_norm_{}", rp.process, cr);
                let n_sr = self.region_mapping.get(i_cr).copied().unwrap_or(0);
                writeln!(
                    out,
                    "{}_norm_{} rateParam {} {} (@0*1) {}",
                    rp.process, cr, cr, rp.process, param
                )?;
                for sr in self.signal_regions.iter().skip(shift).take(n_sr) {
                    writeln!(
                        out,
                        "{}_norm_{} rateParam {} {} (@0*1) {}",
                        rp.process, sr, sr, rp.process, param
                    )?;
                }
                writeln!(out, "{} extArg {} [{},{}]", param, rp.value, rp.range.0, rp.range.1)?;
                shift += n_sr;
            }
        }
        Ok(())
    }

    fn uncertainty_cell(&self, unc: &str, kind: UncertaintyKind, bin: &str, process: &str) -> String {
        if let UncertaintyKind::GmN(n) = kind {
            return match self.uncertainty_value(unc, bin, process) {
                Some(v) if v > 0.0 => {
                    let rate = self.expectation(bin, process).unwrap_or(0.0);
                    format_value(rate / n as f64, self.precision)
                }
                _ => "-".to_string(),
            };
        }
        match self.uncertainty_value(unc, bin, process) {
            Some(v) => format_value(v, self.precision),
            None => "-".to_string(),
        }
    }

    /// Write the shape-input file (JSON map of named histograms) and the
    /// companion card referencing it. Central histograms carry statistical
    /// errors from `Stat_<bin>_<process>` entries; every `shape` uncertainty
    /// gets `<process>_<unc>Up` / `<process>_<unc>Down` variation histograms.
    pub fn write_to_shape_file(&self, path: &Path, no_mc_stats: bool) -> Result<Option<PathBuf>> {
        let bins = natural_sort(&self.bins);
        let n = bins.len();

        let shape_nuisances: Vec<&String> = self
            .uncertainties
            .iter()
            .filter(|u| {
                !u.to_lowercase().contains("stat")
                    && self.uncertainty_kind[*u] == UncertaintyKind::Shape
            })
            .collect();

        let mut processes: Vec<String> = Vec::new();
        for bin in &bins {
            for p in &self.processes[bin] {
                if !processes.contains(p) {
                    processes.push(p.clone());
                }
            }
        }

        let mut histos: std::collections::BTreeMap<String, Hist1> =
            std::collections::BTreeMap::new();

        let mut data_obs = Hist1::zeroed("data_obs", n);
        for (i, bin) in bins.iter().enumerate() {
            data_obs.content[i] = self.observation.get(bin).copied().unwrap_or(0) as f64;
        }
        histos.insert("data_obs".to_string(), data_obs);

        let mut card = self.clone();
        for process in &processes {
            let mut central = Hist1::zeroed(process.clone(), n);
            for (i, bin) in bins.iter().enumerate() {
                let Some(expect) = self.expectation(bin, process) else { continue };
                let stat = self
                    .uncertainty_value(&format!("Stat_{}_{}", bin, process), bin, process)
                    .unwrap_or(1.0);
                central.content[i] = expect;
                central.error[i] = (stat - 1.0) * expect;

                for unc in &shape_nuisances {
                    let Some(rel) = self.uncertainty_value(unc, bin, process) else { continue };
                    let up_name = format!("{}_{}Up", process, unc);
                    let down_name = format!("{}_{}Down", process, unc);
                    histos
                        .entry(up_name.clone())
                        .or_insert_with(|| Hist1::zeroed(up_name, n))
                        .content[i] = rel * expect;
                    histos
                        .entry(down_name.clone())
                        .or_insert_with(|| Hist1::zeroed(down_name, n))
                        .content[i] = if rel != 0.0 { expect / rel } else { 0.0 };
                    // the card cell only switches the template on
                    card.specify_uncertainty(unc, bin, process, 1.0)
                        .map_err(|e| dc_core::Error::Validation(e.to_string()))?;
                }
            }
            histos.insert(process.clone(), central);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &histos)?;

        let card_path = card_path_for_shape_file(path);
        let shape_name = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        card.write_to_file_with_shapes(&card_path, &shape_name, no_mc_stats)
    }

    /// Closed-form pre-fit Poisson NLL from expectations and observations,
    /// for cross-checks without invoking the fitter.
    pub fn poisson_prefit_nll(&self) -> f64 {
        let mut nll = 0.0;
        for bin in &self.bins {
            let obs = self.observation.get(bin).copied().unwrap_or(0);
            let lam: f64 =
                self.processes[bin].iter().filter_map(|p| self.expectation(bin, p)).sum();
            let log_factorial: f64 = (1..=obs).map(|k| (k as f64).ln()).sum();
            // lam == 0 with obs == 0 contributes nothing; with obs > 0 the
            // likelihood vanishes
            let term = if lam > 0.0 {
                -lam + obs as f64 * lam.ln() - log_factorial
            } else if obs == 0 {
                -lam
            } else {
                f64::NEG_INFINITY
            };
            nll -= term;
        }
        nll
    }

    fn check_bin_process(
        &self,
        bin: &str,
        process: &str,
    ) -> std::result::Result<(), ValidationError> {
        if !self.nice_names.contains_key(bin) {
            return self.reject(ValidationError::UnknownReference {
                kind: "bin",
                name: bin.to_string(),
            });
        }
        if !self.processes[bin].iter().any(|p| p == process) {
            return self.reject(ValidationError::UnknownReference {
                kind: "process",
                name: process.to_string(),
            });
        }
        Ok(())
    }

    fn reject(&self, error: ValidationError) -> std::result::Result<(), ValidationError> {
        tracing::warn!(%error, "rejected builder call");
        Err(error)
    }
}

/// Companion card path for a shape file: `foo.json` -> `fooCard.txt`.
fn card_path_for_shape_file(shape_path: &Path) -> PathBuf {
    let stem = shape_path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    shape_path.with_file_name(format!("{}Card.txt", stem))
}

/// Round to `precision` decimal digits at storage time, so repeated reads of
/// the same value are stable.
pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// Render a stored numeric value: integral values keep one decimal digit
/// (`3.0`), everything else uses the shortest round-trip representation.
pub fn format_value(value: f64, precision: u32) -> String {
    let v = round_to(value, precision);
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}

/// Sort strings into natural alphanumeric order (`Bin2` before `Bin10`).
pub fn natural_sort(names: &[String]) -> Vec<String> {
    #[derive(PartialEq, Eq, PartialOrd, Ord)]
    enum Chunk {
        Num(u64),
        Text(String),
    }
    fn chunks(s: &str) -> Vec<Chunk> {
        let mut out = Vec::new();
        let mut cur = String::new();
        let mut digits = false;
        for c in s.chars() {
            if c.is_ascii_digit() != digits && !cur.is_empty() {
                out.push(if digits { Chunk::Num(cur.parse().unwrap_or(0)) } else { Chunk::Text(cur.clone()) });
                cur.clear();
            }
            digits = c.is_ascii_digit();
            cur.push(c);
        }
        if !cur.is_empty() {
            out.push(if digits { Chunk::Num(cur.parse().unwrap_or(0)) } else { Chunk::Text(cur) });
        }
        out
    }
    let mut sorted = names.to_vec();
    sorted.sort_by_key(|s| chunks(s));
    sorted
}
