//! Structured invocation of the external fitting toolchain.
//!
//! Every fit runs inside a [`ScratchDir`] guard so aborted invocations leave
//! no litter behind. Commands are built separately from execution so the
//! argument lists can be unit-tested without the external binaries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use dc_core::{Error, Result};
use rand::Rng;

use crate::diagnostics::{FitDiagnostics, LimitTable, NllRecord};

/// A working directory removed on drop.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    keep: bool,
}

impl ScratchDir {
    /// Create a fresh directory under `parent` with a random hex suffix.
    pub fn create(parent: &Path) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..12).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect();
        let path = parent.join(format!("scratch_{}", suffix));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path, keep: false })
    }

    /// The directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Disarm the guard: the directory outlives the value.
    pub fn keep(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

/// Invoker for the external `combine` toolchain.
///
/// Binary paths are configurable so the invoker works both inside a release
/// environment and against wrapper scripts in tests.
#[derive(Debug, Clone)]
pub struct CombineRunner {
    combine: PathBuf,
    text2workspace: PathBuf,
    combine_cards: PathBuf,
    scratch_parent: PathBuf,
}

impl Default for CombineRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CombineRunner {
    /// Runner with the default binary names resolved from `PATH` and
    /// scratch directories under the system temp dir.
    pub fn new() -> Self {
        Self {
            combine: PathBuf::from("combine"),
            text2workspace: PathBuf::from("text2workspace.py"),
            combine_cards: PathBuf::from("combineCards.py"),
            scratch_parent: std::env::temp_dir(),
        }
    }

    /// Override the `combine` binary path.
    pub fn with_combine(mut self, path: impl Into<PathBuf>) -> Self {
        self.combine = path.into();
        self
    }

    /// Override the workspace-builder binary path.
    pub fn with_text2workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.text2workspace = path.into();
        self
    }

    /// Override the card-combiner binary path.
    pub fn with_combine_cards(mut self, path: impl Into<PathBuf>) -> Self {
        self.combine_cards = path.into();
        self
    }

    /// Override the parent directory for scratch dirs.
    pub fn with_scratch_parent(mut self, path: impl Into<PathBuf>) -> Self {
        self.scratch_parent = path.into();
        self
    }

    /// Build the workspace for a card and return the workspace path.
    pub fn create_workspace(&self, card: &Path, workspace: &Path) -> Result<PathBuf> {
        let mut cmd = self.workspace_command(card, workspace, &[]);
        self.run(&mut cmd, "text2workspace")?;
        expect_artifact(workspace)
    }

    /// Build a workspace with the listed channels masked out of the fit.
    pub fn create_masked_workspace(
        &self,
        card: &Path,
        workspace: &Path,
        masked_channels: &[String],
    ) -> Result<PathBuf> {
        let mut cmd = self.workspace_command(card, workspace, masked_channels);
        self.run(&mut cmd, "text2workspace")?;
        expect_artifact(workspace)
    }

    pub(crate) fn workspace_command(
        &self,
        card: &Path,
        workspace: &Path,
        masked_channels: &[String],
    ) -> Command {
        let mut cmd = Command::new(&self.text2workspace);
        cmd.arg(card).arg("-o").arg(workspace);
        if !masked_channels.is_empty() {
            cmd.arg("--channel-masks");
        }
        cmd
    }

    /// Run the asymptotic-limit method and return limits keyed by quantile
    /// (`"-1.000"` observed, `"0.500"` median expected, ...).
    pub fn asymptotic_limits(&self, card: &Path) -> Result<BTreeMap<String, f64>> {
        let scratch = ScratchDir::create(&self.scratch_parent)?;
        let mut cmd = self.limit_command(card, scratch.path());
        self.run(&mut cmd, "combine AsymptoticLimits")?;
        let artifact = expect_artifact(&scratch.path().join("limits.json"))?;
        Ok(LimitTable::read(&artifact)?.as_map())
    }

    pub(crate) fn limit_command(&self, card: &Path, workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.combine);
        cmd.current_dir(workdir).arg("-M").arg("AsymptoticLimits").arg(card);
        cmd
    }

    /// Run the significance method and return the observed significance.
    pub fn significance(&self, card: &Path) -> Result<f64> {
        let scratch = ScratchDir::create(&self.scratch_parent)?;
        let mut cmd = Command::new(&self.combine);
        cmd.current_dir(scratch.path())
            .arg("-M")
            .arg("Significance")
            .arg("--uncapped")
            .arg("1")
            .arg(card);
        self.run(&mut cmd, "combine Significance")?;
        let artifact = expect_artifact(&scratch.path().join("significance.json"))?;
        let bytes = std::fs::read(&artifact)?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        value
            .get("significance")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| Error::Parse(format!("no significance in {}", artifact.display())))
    }

    /// Point-estimate NLL at a frozen signal strength.
    pub fn nll(&self, workspace: &Path, r: f64) -> Result<NllRecord> {
        let scratch = ScratchDir::create(&self.scratch_parent)?;
        let mut cmd = self.nll_command(workspace, r, scratch.path());
        self.run(&mut cmd, "combine MultiDimFit")?;
        let artifact = expect_artifact(&scratch.path().join("nll.json"))?;
        NllRecord::read(&artifact)
    }

    pub(crate) fn nll_command(&self, workspace: &Path, r: f64, workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.combine);
        cmd.current_dir(workdir)
            .arg("-M")
            .arg("MultiDimFit")
            .arg("--algo")
            .arg("none")
            .arg("--setParameters")
            .arg(format!("r={}", r))
            .arg("--freezeParameters")
            .arg("r")
            .arg(workspace);
        cmd
    }

    /// Scan the POI over `points` equidistant values in `[start, stop]`.
    pub fn poi_scan(
        &self,
        workspace: &Path,
        start: f64,
        stop: f64,
        points: usize,
    ) -> Result<Vec<(f64, f64)>> {
        let scratch = ScratchDir::create(&self.scratch_parent)?;
        let mut cmd = Command::new(&self.combine);
        cmd.current_dir(scratch.path())
            .arg("-M")
            .arg("MultiDimFit")
            .arg("--algo")
            .arg("grid")
            .arg("--points")
            .arg(points.to_string())
            .arg("--rMin")
            .arg(start.to_string())
            .arg("--rMax")
            .arg(stop.to_string())
            .arg(workspace);
        self.run(&mut cmd, "combine MultiDimFit grid")?;
        let artifact = expect_artifact(&scratch.path().join("scan.json"))?;
        let bytes = std::fs::read(&artifact)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Run the fit-diagnostics method and move its document to `out`.
    ///
    /// With `stat_only` every parameter except the bin-by-bin `prop` ones is
    /// frozen, so the remaining uncertainty is statistical.
    pub fn fit_diagnostics(
        &self,
        workspace: &Path,
        out: &Path,
        stat_only: bool,
    ) -> Result<FitDiagnostics> {
        let scratch = ScratchDir::create(&self.scratch_parent)?;
        let mut cmd = self.fit_diagnostics_command(workspace, scratch.path(), stat_only);
        self.run(&mut cmd, "combine FitDiagnostics")?;
        let artifact = expect_artifact(&scratch.path().join("fitDiagnostics.json"))?;
        let doc = FitDiagnostics::read(&artifact)?;
        doc.write(out)?;
        Ok(doc)
    }

    pub(crate) fn fit_diagnostics_command(
        &self,
        workspace: &Path,
        workdir: &Path,
        stat_only: bool,
    ) -> Command {
        let mut cmd = Command::new(&self.combine);
        cmd.current_dir(workdir)
            .arg("-M")
            .arg("FitDiagnostics")
            .arg("--saveShapes")
            .arg("--saveWithUncertainties")
            .arg("--saveOverallShapes");
        if stat_only {
            cmd.arg("--freezeParameters").arg("allConstrainedNuisances");
        }
        cmd.arg(workspace);
        cmd
    }

    /// Combine named per-channel cards into one card at `out`.
    pub fn combine_cards(&self, cards: &[(String, PathBuf)], out: &Path) -> Result<PathBuf> {
        let mut cmd = self.combine_cards_command(cards, out);
        self.run(&mut cmd, "combineCards")?;
        expect_artifact(out)
    }

    pub(crate) fn combine_cards_command(&self, cards: &[(String, PathBuf)], out: &Path) -> Command {
        let mut cmd = Command::new(&self.combine_cards);
        for (name, path) in cards {
            cmd.arg(format!("{}={}", name, path.display()));
        }
        cmd.arg("--outfile").arg(out);
        cmd
    }

    fn run(&self, cmd: &mut Command, what: &str) -> Result<()> {
        tracing::info!(command = ?cmd, "{}", what);
        let status = cmd
            .status()
            .map_err(|e| Error::External(format!("{}: failed to start: {}", what, e)))?;
        if !status.success() {
            return Err(Error::External(format!("{} exited with {}", what, status)));
        }
        Ok(())
    }
}

fn expect_artifact(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        Ok(path.to_path_buf())
    } else {
        Err(Error::MissingArtifact(path.display().to_string()))
    }
}
