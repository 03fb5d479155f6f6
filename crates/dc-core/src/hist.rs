//! Histogram value types used by shape inputs and fit-diagnostics artifacts.
//!
//! Analysis regions are serialized as unit-width bins `[0, n)`, so only bin
//! contents, errors and optional labels are carried — no edge arrays.

use serde::{Deserialize, Serialize};

/// A 1D histogram: per-bin contents and errors, with optional bin labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hist1 {
    /// Histogram name.
    pub name: String,
    /// Bin contents.
    pub content: Vec<f64>,
    /// Per-bin errors.
    #[serde(default)]
    pub error: Vec<f64>,
    /// Bin labels, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
}

impl Hist1 {
    /// Create a zeroed histogram with `n_bins` bins.
    pub fn zeroed(name: impl Into<String>, n_bins: usize) -> Self {
        Self { name: name.into(), content: vec![0.0; n_bins], error: vec![0.0; n_bins], labels: None }
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.content.len()
    }

    /// Bin content, 0 for out-of-range bins.
    pub fn bin_content(&self, i: usize) -> f64 {
        self.content.get(i).copied().unwrap_or(0.0)
    }

    /// Bin error, 0 for out-of-range bins or when errors are not stored.
    pub fn bin_error(&self, i: usize) -> f64 {
        self.error.get(i).copied().unwrap_or(0.0)
    }

    /// Set a bin content, growing the error vector if needed.
    pub fn set_bin_content(&mut self, i: usize, value: f64) {
        if i < self.content.len() {
            self.content[i] = value;
        }
    }

    /// Set a bin error.
    pub fn set_bin_error(&mut self, i: usize, value: f64) {
        if self.error.len() < self.content.len() {
            self.error.resize(self.content.len(), 0.0);
        }
        if i < self.error.len() {
            self.error[i] = value;
        }
    }

    /// Add `other` scaled by `weight` bin-by-bin (contents only).
    pub fn add_scaled(&mut self, other: &Hist1, weight: f64) {
        for (i, v) in other.content.iter().enumerate() {
            if i < self.content.len() {
                self.content[i] += weight * v;
            }
        }
    }

    /// Scale all contents (and errors) by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for v in &mut self.content {
            *v *= factor;
        }
        for e in &mut self.error {
            *e *= factor;
        }
    }

    /// Multiply bin-by-bin by `other`'s contents.
    pub fn multiply(&mut self, other: &Hist1) {
        for (i, v) in self.content.iter_mut().enumerate() {
            *v *= other.bin_content(i);
        }
    }

    /// Divide bin-by-bin by `other`'s contents; bins with zero denominator
    /// are set to 0 rather than NaN.
    pub fn divide(&mut self, other: &Hist1) {
        for (i, v) in self.content.iter_mut().enumerate() {
            let d = other.bin_content(i);
            *v = if d != 0.0 { *v / d } else { 0.0 };
        }
    }

    /// Sum of contents over the inclusive bin range `[first, last]`.
    pub fn integral(&self, first: usize, last: usize) -> f64 {
        self.content
            .iter()
            .enumerate()
            .filter(|(i, _)| *i >= first && *i <= last)
            .map(|(_, v)| v)
            .sum()
    }

    /// Sum of all contents.
    pub fn integral_all(&self) -> f64 {
        self.content.iter().sum()
    }

    /// A copy keeping only the listed bins, in order.
    pub fn reduced(&self, keep_bins: &[usize]) -> Hist1 {
        let mut out = Hist1::zeroed(self.name.clone(), keep_bins.len());
        let mut labels = Vec::new();
        for (j, &i) in keep_bins.iter().enumerate() {
            out.content[j] = self.bin_content(i);
            out.error[j] = self.bin_error(i);
            if let Some(l) = self.labels.as_ref().and_then(|l| l.get(i)) {
                labels.push(l.clone());
            }
        }
        if labels.len() == keep_bins.len() {
            out.labels = Some(labels);
        }
        out
    }

    /// A copy truncated to the first `n` bins.
    pub fn truncated(&self, n: usize) -> Hist1 {
        let n = n.min(self.n_bins());
        let keep: Vec<usize> = (0..n).collect();
        self.reduced(&keep)
    }
}

/// A labeled square matrix histogram (covariance / correlation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hist2 {
    /// Histogram name.
    pub name: String,
    /// Matrix dimension.
    pub n: usize,
    /// Row-major cell contents (`n * n`).
    pub content: Vec<f64>,
    /// Row-major cell errors.
    #[serde(default)]
    pub error: Vec<f64>,
    /// Axis labels, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
}

impl Hist2 {
    /// Create a zeroed `n x n` matrix.
    pub fn zeroed(name: impl Into<String>, n: usize) -> Self {
        Self { name: name.into(), n, content: vec![0.0; n * n], error: vec![0.0; n * n], labels: None }
    }

    /// Cell content at `(i, j)`.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.content.get(i * self.n + j).copied().unwrap_or(0.0)
    }

    /// Cell error at `(i, j)`.
    pub fn get_error(&self, i: usize, j: usize) -> f64 {
        self.error.get(i * self.n + j).copied().unwrap_or(0.0)
    }

    /// Set the cell content at `(i, j)`.
    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        if i < self.n && j < self.n {
            self.content[i * self.n + j] = value;
        }
    }

    /// Set the cell error at `(i, j)`.
    pub fn set_error(&mut self, i: usize, j: usize, value: f64) {
        if self.error.len() < self.content.len() {
            self.error.resize(self.content.len(), 0.0);
        }
        if i < self.n && j < self.n {
            self.error[i * self.n + j] = value;
        }
    }

    /// Scale all cells by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for v in &mut self.content {
            *v *= factor;
        }
    }

    /// Maximum cell content, 0 for an empty matrix.
    pub fn maximum(&self) -> f64 {
        self.content.iter().copied().fold(f64::NEG_INFINITY, f64::max).max(0.0)
    }

    /// A copy truncated to the upper-left `n x n` block.
    pub fn truncated(&self, n: usize) -> Hist2 {
        let n = n.min(self.n);
        let mut out = Hist2::zeroed(self.name.clone(), n);
        for i in 0..n {
            for j in 0..n {
                out.set(i, j, self.get(i, j));
                out.set_error(i, j, self.get_error(i, j));
            }
        }
        out
    }
}

/// A point series — the graph-typed representation the fitter uses for
/// observed data (point per bin center, asymmetric errors collapsed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// Series name.
    pub name: String,
    /// `(x, y)` points, ordered by `x`.
    pub points: Vec<(f64, f64)>,
}

impl Series {
    /// Evaluate the series at `x` by linear interpolation between the
    /// surrounding points (constant extrapolation beyond the range).
    pub fn eval(&self, x: f64) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        if x <= self.points[0].0 {
            return self.points[0].1;
        }
        if x >= self.points[self.points.len() - 1].0 {
            return self.points[self.points.len() - 1].1;
        }
        for w in self.points.windows(2) {
            let (x0, y0) = w[0];
            let (x1, y1) = w[1];
            if x >= x0 && x <= x1 {
                if x1 == x0 {
                    return y0;
                }
                return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
            }
        }
        0.0
    }

    /// Convert to a histogram with `n` unit-width bins: contents are the
    /// series evaluated at bin centers, errors are Poisson (`sqrt`).
    pub fn to_hist(&self, name: impl Into<String>, n: usize) -> Hist1 {
        let mut h = Hist1::zeroed(name, n);
        for i in 0..n {
            let y = self.eval(i as f64 + 0.5);
            h.content[i] = y;
            h.error[i] = y.max(0.0).sqrt();
        }
        h
    }
}

/// A shape object from a diagnostics artifact, resolved once at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ShapeObject {
    /// A binned 1D histogram.
    #[serde(rename = "hist")]
    Hist(Hist1),
    /// A labeled square matrix.
    #[serde(rename = "hist2")]
    Hist2(Hist2),
    /// A point series (graph-typed observed data).
    #[serde(rename = "series")]
    Series(Series),
}

impl ShapeObject {
    /// The object's name.
    pub fn name(&self) -> &str {
        match self {
            ShapeObject::Hist(h) => &h.name,
            ShapeObject::Hist2(h) => &h.name,
            ShapeObject::Series(s) => &s.name,
        }
    }

    /// The contained 1D histogram, if this is one.
    pub fn as_hist(&self) -> Option<&Hist1> {
        match self {
            ShapeObject::Hist(h) => Some(h),
            _ => None,
        }
    }

    /// The contained matrix, if this is one.
    pub fn as_hist2(&self) -> Option<&Hist2> {
        match self {
            ShapeObject::Hist2(h) => Some(h),
            _ => None,
        }
    }
}
