//! Reader for fit results: recovers the model structure from the datacard
//! text, loads the fitter's diagnostics artifacts lazily, and derives the
//! views downstream consumers ask for (pulls, per-nuisance yield bands,
//! region histograms, covariance matrices).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dc_card::parse;
use dc_card::writer::natural_sort;
use dc_core::{Error, FitParameter, Hist1, Hist2, Result, ShapeObject, ValueWithError};

use crate::diagnostics::{FitDiagnostics, ShapeStage};
use crate::runner::CombineRunner;

/// Relative uncertainty magnitudes: nuisance -> bin -> process.
pub type UncertaintyMap = BTreeMap<String, BTreeMap<String, BTreeMap<String, f64>>>;

/// A lazily filled artifact cache. Once ready it is never invalidated.
#[derive(Debug, Clone, Default)]
enum Slot<T> {
    #[default]
    Unloaded,
    Ready(T),
}

impl<T: Clone> Slot<T> {
    fn ready(&self) -> Option<T> {
        match self {
            Slot::Ready(v) => Some(v.clone()),
            Slot::Unloaded => None,
        }
    }

    fn fill(&mut self, value: T) -> T {
        *self = Slot::Ready(value.clone());
        value
    }
}

/// Shape-derived relative uncertainties plus the per-process relative-error
/// histograms they came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapeUncertainties {
    /// nuisance -> bin -> process -> relative magnitude.
    pub values: UncertaintyMap,
    /// `<process>_<nuisance>` -> per-bin relative magnitudes.
    pub histos: BTreeMap<String, Hist1>,
}

/// Reads a written card plus the fit artifacts derived from it.
///
/// Getters that touch an artifact take `&mut self` and return owned values;
/// each artifact family has one cache slot per pre/post-fit stage, filled on
/// first use.
#[derive(Debug)]
pub struct FitReader {
    card_path: PathBuf,
    card: String,
    shape_card: Option<String>,
    shape_inputs: BTreeMap<String, BTreeMap<String, Hist1>>,
    workspace_path: PathBuf,
    diagnostics_path: PathBuf,
    stat_diagnostics_path: PathBuf,
    is_search: bool,

    diagnostics: Slot<FitDiagnostics>,
    stat_diagnostics: Slot<FitDiagnostics>,
    card_unc: [Slot<UncertaintyMap>; 2],
    shape_unc: [Slot<ShapeUncertainties>; 2],
}

fn stage_index(postfit: bool) -> usize {
    usize::from(postfit)
}

impl FitReader {
    /// Open a written card and locate its companion artifacts. Missing
    /// optional inputs (shape card, shape files) narrow the available views
    /// and are warned about; missing mandatory artifacts surface as errors
    /// from the getters that need them.
    pub fn open(card_path: &Path) -> Result<Self> {
        let card = parse::read_card(card_path)?;
        let dir = card_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let stem = card_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let shape_card_path = dir.join(format!("{}_shapeCard.txt", stem));
        let shape_card = match parse::read_card(&shape_card_path) {
            Ok(content) => Some(content),
            Err(_) => {
                tracing::warn!(path = %shape_card_path.display(), "no shape card found");
                None
            }
        };

        let mut shape_inputs = BTreeMap::new();
        if let Some(content) = &shape_card {
            for (channel, file) in parse::shape_files(content, &dir) {
                match read_shape_file(&file) {
                    Ok(histos) => {
                        shape_inputs.insert(channel, histos);
                    }
                    Err(e) => {
                        tracing::warn!(channel, path = %file.display(), error = %e, "shape input unreadable");
                    }
                }
            }
        }

        Ok(Self {
            card_path: card_path.to_path_buf(),
            card,
            shape_card,
            shape_inputs,
            workspace_path: dir.join(format!("{}_shapeCard.root", stem)),
            diagnostics_path: dir.join(format!("{}_shapeCard_FD.json", stem)),
            stat_diagnostics_path: dir.join(format!("{}_shapeCard_statOnly_FD.json", stem)),
            is_search: false,
            diagnostics: Slot::Unloaded,
            stat_diagnostics: Slot::Unloaded,
            card_unc: [Slot::Unloaded, Slot::Unloaded],
            shape_unc: [Slot::Unloaded, Slot::Unloaded],
        })
    }

    /// Exclude the signal process from nuisance yield totals (search mode).
    pub fn set_is_search(&mut self, is_search: bool) {
        self.is_search = is_search;
    }

    /// Path of the card this reader was opened on.
    pub fn card_path(&self) -> &Path {
        &self.card_path
    }

    /// Run the external toolchain for any absent workspace or diagnostics
    /// artifacts.
    pub fn create_missing_inputs(&mut self, runner: &CombineRunner) -> Result<()> {
        let fit_card = if self.shape_card.is_some() {
            self.card_path.with_file_name(format!(
                "{}_shapeCard.txt",
                self.card_path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default()
            ))
        } else {
            self.card_path.clone()
        };
        if !self.workspace_path.exists() {
            runner.create_workspace(&fit_card, &self.workspace_path)?;
        }
        if !self.diagnostics_path.exists() {
            let doc = runner.fit_diagnostics(&self.workspace_path, &self.diagnostics_path, false)?;
            self.diagnostics.fill(doc);
        }
        if !self.stat_diagnostics_path.exists() {
            let doc =
                runner.fit_diagnostics(&self.workspace_path, &self.stat_diagnostics_path, true)?;
            self.stat_diagnostics.fill(doc);
        }
        Ok(())
    }

    // ---- structure recovered from the card text ----

    /// Channel names (`Bin0` for a plain card, sub-card names for a
    /// combined card).
    pub fn channels(&self) -> Vec<String> {
        parse::channels(&self.card)
    }

    /// Unique bin names in card order.
    pub fn bin_list(&self) -> Result<Vec<String>> {
        parse::bin_list(&self.card)
    }

    /// Bin labels from the card's comment lines (muted bins included).
    pub fn bin_labels(&self) -> BTreeMap<String, String> {
        parse::bin_comments(&self.card).into_iter().map(|c| (c.bin, c.label)).collect()
    }

    /// Per-bin process lists, in card order.
    pub fn processes_per_bin(&self) -> Result<Vec<(String, Vec<String>)>> {
        parse::processes_per_bin(&self.card)
    }

    /// Unique process names over all bins.
    pub fn process_list(&self) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        for (_, procs) in self.processes_per_bin()? {
            for p in procs {
                if !out.contains(&p) {
                    out.push(p);
                }
            }
        }
        Ok(out)
    }

    /// Observed counts per bin.
    pub fn observation(&self) -> Result<BTreeMap<String, i64>> {
        let bins = self.bin_list()?;
        let obs = parse::observation_row(&self.card)?;
        if bins.len() != obs.len() {
            return Err(Error::Parse(format!(
                "{} bins but {} observation columns",
                bins.len(),
                obs.len()
            )));
        }
        Ok(bins.into_iter().zip(obs).collect())
    }

    /// Expected yields per bin and process, from the rate row.
    pub fn estimates(&self) -> Result<BTreeMap<String, BTreeMap<String, f64>>> {
        let grouped = self.processes_per_bin()?;
        let rates = parse::rate_row(&self.card)?;
        let mut out: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        let mut col = 0;
        for (bin, procs) in grouped {
            for p in procs {
                let rate = rates.get(col).copied().ok_or_else(|| {
                    Error::Parse(format!("rate row shorter than process columns ({})", col))
                })?;
                out.entry(bin.clone()).or_default().insert(p, rate);
                col += 1;
            }
        }
        Ok(out)
    }

    /// Nuisance names from the card's uncertainty rows.
    pub fn card_nuisances(&self) -> Vec<String> {
        parse::uncertainty_names(&self.card)
    }

    /// Rate-parameter attribution: parameter -> bin -> affected processes.
    pub fn rate_param_info(&self) -> Result<BTreeMap<String, BTreeMap<String, Vec<String>>>> {
        let known = self.process_list()?;
        let source = self.shape_card.as_deref().unwrap_or(&self.card);
        Ok(parse::rate_param_info(source, &known))
    }

    // ---- diagnostics-backed views ----

    fn diagnostics(&mut self) -> Result<FitDiagnostics> {
        if let Some(doc) = self.diagnostics.ready() {
            return Ok(doc);
        }
        let doc = FitDiagnostics::read(&self.diagnostics_path)?;
        Ok(self.diagnostics.fill(doc))
    }

    fn stat_diagnostics(&mut self) -> Result<FitDiagnostics> {
        if let Some(doc) = self.stat_diagnostics.ready() {
            return Ok(doc);
        }
        let doc = FitDiagnostics::read(&self.stat_diagnostics_path)?;
        Ok(self.stat_diagnostics.fill(doc))
    }

    /// Fitted nuisance names: the s+b snapshot's initial parameters without
    /// the signal-strength POI.
    pub fn nuisances_list(&mut self) -> Result<Vec<String>> {
        let doc = self.diagnostics()?;
        Ok(doc
            .fit_s
            .params_init
            .iter()
            .filter(|p| p.name != "r")
            .map(|p| p.name.clone())
            .collect())
    }

    /// Fitted parameters (pulls), POI excluded.
    pub fn pulls(&mut self) -> Result<Vec<FitParameter>> {
        let doc = self.diagnostics()?;
        Ok(doc.fit_s.params_final.iter().filter(|p| p.name != "r").cloned().collect())
    }

    /// Pre-fit parameters, POI excluded.
    pub fn pulls_prefit(&mut self) -> Result<Vec<FitParameter>> {
        let doc = self.diagnostics()?;
        Ok(doc.fit_s.params_init.iter().filter(|p| p.name != "r").cloned().collect())
    }

    /// One fitted parameter by name.
    pub fn pull(&mut self, name: &str) -> Result<FitParameter> {
        let doc = self.diagnostics()?;
        doc.fit_s
            .param_final(name)
            .cloned()
            .ok_or_else(|| Error::Parse(format!("no fitted parameter '{}'", name)))
    }

    /// Fitted values of the card's rate parameters.
    pub fn rate_parameters(&mut self) -> Result<BTreeMap<String, ValueWithError>> {
        let info = self.rate_param_info()?;
        let doc = self.diagnostics()?;
        let mut out = BTreeMap::new();
        for name in info.keys() {
            if let Some(p) = doc.fit_s.param_final(name) {
                out.insert(name.clone(), p.estimate());
            }
        }
        Ok(out)
    }

    /// Post-fit constraint width of one nuisance (1.0 when not fitted).
    fn pull_sigma(&mut self, nuisance: &str) -> Result<f64> {
        let doc = self.diagnostics()?;
        Ok(doc.fit_s.param_final(nuisance).map(|p| p.error.abs()).unwrap_or(1.0))
    }

    /// Signed relative per-(bin, process) offsets of the card's scalar
    /// uncertainties (`value - 1`), post-fit scaled by the fitted
    /// constraint width. Quadrature consumers square the offset, so the
    /// sign survives here.
    pub fn card_uncertainties(&mut self, postfit: bool) -> Result<UncertaintyMap> {
        if let Some(map) = self.card_unc[stage_index(postfit)].ready() {
            return Ok(map);
        }
        let grouped = self.processes_per_bin()?;
        let names = self.card_nuisances();
        let mut out = UncertaintyMap::new();
        for unc in names {
            let Some(cells) = parse::uncertainty_values(&self.card, &unc) else { continue };
            let scale = if postfit { self.pull_sigma(&unc)? } else { 1.0 };
            let entry = out.entry(unc).or_default();
            let mut col = 0;
            for (bin, procs) in &grouped {
                for p in procs {
                    if let Some(Some(v)) = cells.get(col) {
                        entry
                            .entry(bin.clone())
                            .or_default()
                            .insert(p.clone(), (v - 1.0) * scale);
                    }
                    col += 1;
                }
            }
        }
        Ok(self.card_unc[stage_index(postfit)].fill(out))
    }

    /// Bin order of the shape-input histograms for a plain card.
    fn shape_bins(&self) -> Result<Vec<String>> {
        Ok(natural_sort(&self.bin_list()?))
    }

    /// Relative uncertainties recovered from the shape-input histograms:
    /// statistical per-bin errors of the central templates plus the
    /// up-variation templates of `shape` nuisances. Bins with zero central
    /// content are defined as 0.
    pub fn shape_uncertainties(&mut self, postfit: bool) -> Result<ShapeUncertainties> {
        if let Some(v) = self.shape_unc[stage_index(postfit)].ready() {
            return Ok(v);
        }
        let bins = self.shape_bins()?;
        let processes = self.process_list()?;
        let inputs = self.shape_inputs.clone();

        let mut out = ShapeUncertainties::default();
        for histos in inputs.values() {
            for process in &processes {
                let Some(central) = histos.get(process) else { continue };

                let mut stat_rel = Hist1::zeroed(format!("{}_stat", process), bins.len());
                for (i, bin) in bins.iter().enumerate() {
                    let c = central.bin_content(i);
                    let mut rel = if c != 0.0 { central.bin_error(i).abs() / c } else { 0.0 };
                    if postfit {
                        // bin-by-bin nuisances are one fitted parameter per bin
                        rel *= self.pull_sigma(&format!("prop_bin{}", bin))?;
                    }
                    stat_rel.content[i] = rel;
                    out.values
                        .entry("stat".to_string())
                        .or_default()
                        .entry(bin.clone())
                        .or_default()
                        .insert(process.clone(), rel);
                }
                out.histos.insert(stat_rel.name.clone(), stat_rel);

                for (name, up) in histos {
                    let Some(unc) = name
                        .strip_prefix(&format!("{}_", process))
                        .and_then(|rest| rest.strip_suffix("Up"))
                    else {
                        continue;
                    };
                    let scale = if postfit { self.pull_sigma(unc)? } else { 1.0 };
                    let mut rel_hist =
                        Hist1::zeroed(format!("{}_{}", process, unc), bins.len());
                    for (i, bin) in bins.iter().enumerate() {
                        let c = central.bin_content(i);
                        let rel =
                            if c != 0.0 { (up.bin_content(i) - c).abs() / c * scale } else { 0.0 };
                        rel_hist.content[i] = rel;
                        out.values
                            .entry(unc.to_string())
                            .or_default()
                            .entry(bin.clone())
                            .or_default()
                            .insert(process.clone(), rel);
                    }
                    out.histos.insert(rel_hist.name.clone(), rel_hist);
                }
            }
        }
        Ok(self.shape_unc[stage_index(postfit)].fill(out))
    }

    /// Relative effect of one nuisance on one (bin, process) pair. Rate
    /// parameters contribute `sigma / value` on their matched processes;
    /// scalar card uncertainties contribute their signed offsets,
    /// shape/stat uncertainties their stored magnitudes; everything else
    /// is 0.
    pub fn relative_uncertainty(
        &mut self,
        nuisance: &str,
        bin: &str,
        process: &str,
        postfit: bool,
    ) -> Result<f64> {
        let rate_info = self.rate_param_info()?;
        if let Some(bins) = rate_info.get(nuisance) {
            let matched = bins.get(bin).map(|ps| ps.iter().any(|p| p == process)).unwrap_or(false);
            if !matched {
                return Ok(0.0);
            }
            let est = self.pull(nuisance)?.estimate();
            return Ok(if est.value != 0.0 { (est.error / est.value).abs() } else { 0.0 });
        }

        let card = self.card_uncertainties(postfit)?;
        if let Some(v) = card
            .get(nuisance)
            .and_then(|bins| bins.get(bin))
            .and_then(|procs| procs.get(process))
        {
            // shape rows carry a 1.0 switch, their magnitude lives in the
            // shape inputs
            if *v != 0.0 {
                return Ok(*v);
            }
        }

        let shapes = self.shape_uncertainties(postfit)?;
        Ok(shapes
            .values
            .get(nuisance)
            .and_then(|bins| bins.get(bin))
            .and_then(|procs| procs.get(process))
            .copied()
            .unwrap_or(0.0))
    }

    /// Total yield of a bin with the quadrature error induced by one
    /// nuisance: `y ± sqrt(sum_p (yield_p * u_p)^2)`. In search mode the
    /// signal process is excluded from the total.
    pub fn nuisance_bin_yield(
        &mut self,
        nuisance: &str,
        bin: &str,
        postfit: bool,
    ) -> Result<ValueWithError> {
        let estimates = self.estimates()?;
        let procs = estimates
            .get(bin)
            .ok_or_else(|| Error::Parse(format!("no bin '{}' in rate row", bin)))?
            .clone();
        let mut total = 0.0;
        let mut var = 0.0;
        for (process, y) in procs {
            if self.is_search && process == "signal" {
                continue;
            }
            total += y;
            let u = self.relative_uncertainty(nuisance, bin, &process, postfit)?;
            var += (y * u) * (y * u);
        }
        Ok(ValueWithError::new(total, var.sqrt()))
    }

    /// [`nuisance_bin_yield`](Self::nuisance_bin_yield) over every bin.
    pub fn nuisance_yields(
        &mut self,
        nuisance: &str,
        postfit: bool,
    ) -> Result<BTreeMap<String, ValueWithError>> {
        let bins = self.bin_list()?;
        let mut out = BTreeMap::new();
        for bin in bins {
            let v = self.nuisance_bin_yield(nuisance, &bin, postfit)?;
            out.insert(bin, v);
        }
        Ok(out)
    }

    /// Region histograms of one channel at one stage: every named shape of
    /// the diagnostics document, data series converted to a histogram,
    /// covariance entries dropped, `total` / `total_background` errors
    /// inflated by the fitted rate-parameter uncertainties, bin labels
    /// applied.
    pub fn region_histos(
        &mut self,
        stage: ShapeStage,
        channel: &str,
    ) -> Result<BTreeMap<String, Hist1>> {
        let doc = self.diagnostics()?;
        let shapes = doc
            .shapes(stage)
            .get(channel)
            .ok_or_else(|| Error::MissingArtifact(format!("no shapes for channel '{}'", channel)))?
            .clone();

        let n = shapes
            .values()
            .find_map(|o| o.as_hist().map(|h| h.n_bins()))
            .unwrap_or_default();

        let mut out: BTreeMap<String, Hist1> = BTreeMap::new();
        for (name, obj) in shapes {
            if name.starts_with("total_covar") || name.starts_with("process_") {
                continue;
            }
            let hist = match obj {
                ShapeObject::Hist(h) => h,
                ShapeObject::Series(s) => s.to_hist(name.clone(), n),
                ShapeObject::Hist2(_) => continue,
            };
            out.insert(name, hist);
        }

        self.inflate_rate_param_errors(&mut out)?;

        let labels = self.bin_labels();
        let bins = self.shape_bins()?;
        let label_list: Vec<String> =
            bins.iter().map(|b| labels.get(b).cloned().unwrap_or_else(|| b.clone())).collect();
        for hist in out.values_mut() {
            if hist.n_bins() == label_list.len() {
                hist.labels = Some(label_list.clone());
            }
        }
        Ok(out)
    }

    /// Widen the `total` / `total_background` errors by the fitted
    /// rate-parameter uncertainties of the processes each parameter scales.
    fn inflate_rate_param_errors(&mut self, histos: &mut BTreeMap<String, Hist1>) -> Result<()> {
        let info = self.rate_param_info()?;
        if info.is_empty() {
            return Ok(());
        }
        let fitted = self.rate_parameters()?;
        let estimates = self.estimates()?;
        let bins = self.shape_bins()?;

        for (param, per_bin) in &info {
            let Some(est) = fitted.get(param) else { continue };
            let rel = if est.value != 0.0 { (est.error / est.value).abs() } else { 0.0 };
            for (i, bin) in bins.iter().enumerate() {
                let Some(procs) = per_bin.get(bin) else { continue };
                let matched_yield: f64 = procs
                    .iter()
                    .filter_map(|p| estimates.get(bin).and_then(|m| m.get(p)))
                    .sum();
                let extra = rel * matched_yield;
                for key in ["total", "total_background"] {
                    if let Some(h) = histos.get_mut(key) {
                        let e = h.bin_error(i);
                        h.set_bin_error(i, (e * e + extra * extra).sqrt());
                    }
                }
            }
        }
        Ok(())
    }

    /// Observed data minus the fitted background, with the data's errors.
    pub fn background_subtracted(&mut self, stage: ShapeStage, channel: &str) -> Result<Hist1> {
        let histos = self.region_histos(stage, channel)?;
        let data = histos
            .get("data")
            .ok_or_else(|| Error::MissingArtifact("no data shape".to_string()))?;
        let background = histos
            .get("total_background")
            .ok_or_else(|| Error::MissingArtifact("no total_background shape".to_string()))?;
        let mut out = data.clone();
        out.name = "data_minus_background".to_string();
        out.add_scaled(background, -1.0);
        Ok(out)
    }

    /// Band of one nuisance around the fitted `total`: per bin,
    /// `total ± sqrt(sum_p (yield_p * u_p)^2)`.
    pub fn nuisance_band(
        &mut self,
        nuisance: &str,
        stage: ShapeStage,
        channel: &str,
        postfit: bool,
    ) -> Result<(Hist1, Hist1)> {
        let histos = self.region_histos(stage, channel)?;
        let total = histos
            .get("total")
            .ok_or_else(|| Error::MissingArtifact("no total shape".to_string()))?
            .clone();
        let bins = self.shape_bins()?;

        let mut up = total.clone();
        up.name = format!("total_{}Up", nuisance);
        let mut down = total.clone();
        down.name = format!("total_{}Down", nuisance);
        // the fitter's channel histogram can be narrower than the card's
        // bin list (masked fits, combined cards)
        let n = total.n_bins().min(bins.len());
        for (i, bin) in bins.iter().enumerate().take(n) {
            let v = self.nuisance_bin_yield(nuisance, bin, postfit)?;
            up.set_bin_content(i, total.bin_content(i) + v.error);
            down.set_bin_content(i, total.bin_content(i) - v.error);
        }
        Ok((up, down))
    }

    /// Statistical-only band around the fitted `total`, from the stat-only
    /// diagnostics rerun.
    pub fn stat_band(&mut self, stage: ShapeStage, channel: &str) -> Result<(Hist1, Hist1)> {
        let doc = self.stat_diagnostics()?;
        let total = doc
            .shapes(stage)
            .get(channel)
            .and_then(|m| m.get("total"))
            .and_then(|o| o.as_hist())
            .cloned()
            .ok_or_else(|| Error::MissingArtifact("no stat-only total shape".to_string()))?;
        let mut up = total.clone();
        up.name = "total_statUp".to_string();
        let mut down = total.clone();
        down.name = "total_statDown".to_string();
        for i in 0..total.n_bins() {
            up.content[i] = total.bin_content(i) + total.bin_error(i);
            down.content[i] = total.bin_content(i) - total.bin_error(i);
        }
        Ok((up, down))
    }

    /// The overall bin-by-bin covariance matrix, scaled so the maximum cell
    /// is 1 and relabeled with the bin labels.
    pub fn covariance_histo(&mut self) -> Result<Hist2> {
        let doc = self.diagnostics()?;
        let mut covar = doc
            .overall_total_covar
            .clone()
            .ok_or_else(|| Error::MissingArtifact("no overall covariance".to_string()))?;
        let max = covar.maximum();
        if max > 0.0 {
            covar.scale(1.0 / max);
        }
        let labels = self.bin_labels();
        let bins = self.shape_bins()?;
        if bins.len() == covar.n {
            covar.labels = Some(
                bins.iter().map(|b| labels.get(b).cloned().unwrap_or_else(|| b.clone())).collect(),
            );
        }
        Ok(covar)
    }

    /// The fitted-parameter correlation matrix of the s+b snapshot.
    pub fn correlation_histo(&mut self) -> Result<Hist2> {
        let doc = self.diagnostics()?;
        doc.fit_s
            .correlation
            .clone()
            .ok_or_else(|| Error::MissingArtifact("no parameter correlation matrix".to_string()))
    }
}

fn read_shape_file(path: &Path) -> Result<BTreeMap<String, Hist1>> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::MissingArtifact(format!("{}: {}", path.display(), e)))?;
    Ok(serde_json::from_slice(&bytes)?)
}
