//! Re-parser for the datacard text format.
//!
//! The card is a fixed-row table: bin / process-name / process-number / rate
//! rows in fixed order, one row per uncertainty, then rate-parameter lines.
//! Everything here walks whitespace-delimited tokens positionally; this is
//! the read half of the round trip with [`crate::CardWriter`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dc_core::{Error, Result};

/// A `# <bin>: <nice name>` comment line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinComment {
    /// Bin name.
    pub bin: String,
    /// Free-text label.
    pub label: String,
    /// Whether the bin was muted when the card was written.
    pub muted: bool,
}

/// Read a card file into a string.
pub fn read_card(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::MissingArtifact(format!("{}: {}", path.display(), e)))
}

/// Channel names of a card: sub-card names from a `Combination` header line
/// (`name=path` tokens), or the single implicit channel `Bin0`.
pub fn channels(content: &str) -> Vec<String> {
    let first = content.lines().next().unwrap_or_default();
    if !first.starts_with("Combination") {
        return vec!["Bin0".to_string()];
    }
    first
        .split_whitespace()
        .filter(|tok| tok.contains('='))
        .map(|tok| tok.split('=').next().unwrap_or_default().to_string())
        .collect()
}

/// Shape-input files from `shapes` header lines, keyed by channel. A `*`
/// channel resolves to `Bin0` and the file path relative to `card_dir`.
pub fn shape_files(content: &str, card_dir: &Path) -> BTreeMap<String, PathBuf> {
    let mut out = BTreeMap::new();
    for line in content.lines() {
        if !line.starts_with("shapes") {
            if out.is_empty() {
                continue;
            }
            break;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 4 {
            continue;
        }
        let (channel, file) = if tokens[2] == "*" {
            ("Bin0".to_string(), card_dir.join(tokens[3]))
        } else {
            (tokens[2].to_string(), card_dir.join(tokens[3]))
        };
        out.insert(channel, file);
    }
    out
}

fn rows_starting_with<'a>(content: &'a str, label: &str) -> Vec<Vec<&'a str>> {
    content
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .filter(|tokens| tokens.first().map(|t| t.eq_ignore_ascii_case(label)).unwrap_or(false))
        .collect()
}

/// The per-process bin row (second `bin` row): one bin name per column.
pub fn bin_row(content: &str) -> Result<Vec<String>> {
    let rows = rows_starting_with(content, "bin");
    let row = rows.get(1).ok_or_else(|| Error::Parse("no per-process bin row".into()))?;
    Ok(row[1..].iter().map(|s| s.to_string()).collect())
}

/// Unique bin names in row order.
pub fn bin_list(content: &str) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for b in bin_row(content)? {
        if !out.contains(&b) {
            out.push(b);
        }
    }
    Ok(out)
}

/// The observation row.
pub fn observation_row(content: &str) -> Result<Vec<i64>> {
    let rows = rows_starting_with(content, "observation");
    let row = rows.first().ok_or_else(|| Error::Parse("no observation row".into()))?;
    row[1..]
        .iter()
        .map(|t| t.parse::<i64>().map_err(|e| Error::Parse(format!("observation '{}': {}", t, e))))
        .collect()
}

/// The process-name row: one process per column, aligned with [`bin_row`].
pub fn process_row(content: &str) -> Result<Vec<String>> {
    let rows = rows_starting_with(content, "process");
    let row = rows.first().ok_or_else(|| Error::Parse("no process row".into()))?;
    Ok(row[1..].iter().map(|s| s.to_string()).collect())
}

/// The rate row, aligned with [`bin_row`].
pub fn rate_row(content: &str) -> Result<Vec<f64>> {
    let rows = rows_starting_with(content, "rate");
    let row = rows.first().ok_or_else(|| Error::Parse("no rate row".into()))?;
    row[1..]
        .iter()
        .map(|t| t.parse::<f64>().map_err(|e| Error::Parse(format!("rate '{}': {}", t, e))))
        .collect()
}

/// Per-bin process grouping, recovered by walking the bin and process rows
/// column-by-column and splitting on bin change.
pub fn processes_per_bin(content: &str) -> Result<Vec<(String, Vec<String>)>> {
    let bins = bin_row(content)?;
    let procs = process_row(content)?;
    if bins.len() != procs.len() {
        return Err(Error::Parse(format!(
            "bin row has {} columns but process row has {}",
            bins.len(),
            procs.len()
        )));
    }
    let mut out: Vec<(String, Vec<String>)> = Vec::new();
    for (bin, proc) in bins.iter().zip(procs.iter()) {
        match out.last_mut() {
            Some((b, list)) if b == bin => list.push(proc.clone()),
            _ => out.push((bin.clone(), vec![proc.clone()])),
        }
    }
    Ok(out)
}

/// Bin comment lines, in card order (muted bins included).
pub fn bin_comments(content: &str) -> Vec<BinComment> {
    let mut out = Vec::new();
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("#Muted: ") {
            if let Some((bin, label)) = rest.split_once(": ") {
                out.push(BinComment { bin: bin.to_string(), label: label.to_string(), muted: true });
            }
        } else if let Some(rest) = line.strip_prefix("# ") {
            if let Some((bin, label)) = rest.split_once(": ") {
                out.push(BinComment {
                    bin: bin.to_string(),
                    label: label.to_string(),
                    muted: false,
                });
            }
        }
    }
    out
}

/// Uncertainty row names, in card order.
pub fn uncertainty_names(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                [name, kind, ..] if matches!(*kind, "lnN" | "shape" | "gmN") => {
                    Some(name.to_string())
                }
                _ => None,
            }
        })
        .collect()
}

/// Column values of one uncertainty row, aligned with [`bin_row`]; a `-`
/// cell is `None`. Returns `None` if the row does not exist.
pub fn uncertainty_values(content: &str, nuisance: &str) -> Option<Vec<Option<f64>>> {
    for line in content.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&nuisance) {
            continue;
        }
        let kind = tokens.get(1)?;
        let first_cell = match *kind {
            "lnN" | "shape" => 2,
            "gmN" => 3,
            _ => continue,
        };
        return Some(
            tokens[first_cell..]
                .iter()
                .map(|t| if *t == "-" { None } else { t.parse::<f64>().ok() })
                .collect(),
        );
    }
    None
}

/// Rate-parameter attribution from `rateParam` / `extArg` lines:
/// `parameter -> bin -> affected processes`. A process token with a `*`
/// suffix matches every known process sharing the prefix. `rateParam` lines
/// with a `(@0*1)` formula attribute their bin to the referenced `extArg`
/// parameter.
pub fn rate_param_info(
    content: &str,
    known_processes: &[String],
) -> BTreeMap<String, BTreeMap<String, Vec<String>>> {
    let mut out: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
    for line in content.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [name, "extArg", ..] => {
                out.entry(name.to_string()).or_default();
            }
            [name, "rateParam", bin, proc, rest @ ..] => {
                let param = match rest {
                    [formula, reference, ..] if formula.starts_with('(') => reference.to_string(),
                    _ => name.to_string(),
                };
                let procs: Vec<String> = if proc.contains('*') {
                    let prefix = proc.trim_end_matches('*');
                    known_processes
                        .iter()
                        .filter(|p| p.starts_with(prefix))
                        .cloned()
                        .collect()
                } else {
                    vec![proc.to_string()]
                };
                let bins = out.entry(param).or_default();
                let entry = bins.entry(bin.to_string()).or_default();
                for p in procs {
                    if !entry.contains(&p) {
                        entry.push(p);
                    }
                }
            }
            _ => {}
        }
    }
    out
}
