//! Tests for the card builder and the text re-parser.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::writer::{format_value, natural_sort, round_to};
use crate::{parse, CardWriter, UncertaintyKind, ValidationError};

fn tmp_path(filename: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("dc_card_{}_{}_{}", std::process::id(), nanos, filename));
    p
}

fn two_bin_model() -> CardWriter {
    let mut c = CardWriter::new();
    c.add_bin("SR1", &["bkgA", "bkgB"], "signal region 1").unwrap();
    c.add_bin("SR2", &["bkgA", "bkgB"], "signal region 2").unwrap();
    c.specify_observation("SR1", 10).unwrap();
    c.specify_observation("SR2", 7).unwrap();
    c.specify_expectation("SR1", "signal", 1.0).unwrap();
    c.specify_expectation("SR1", "bkgA", 3.0).unwrap();
    c.specify_expectation("SR1", "bkgB", 4.5).unwrap();
    c.specify_expectation("SR2", "signal", 0.5).unwrap();
    c.specify_expectation("SR2", "bkgA", 2.0).unwrap();
    c.specify_expectation("SR2", "bkgB", 3.0).unwrap();
    c
}

#[test]
fn bin_name_length_limit() {
    let mut c = CardWriter::new();
    let ok = "a".repeat(30);
    let too_long = "a".repeat(31);
    assert!(c.add_bin(&ok, &[], "").is_ok());
    assert_eq!(
        c.add_bin(&too_long, &[], ""),
        Err(ValidationError::NameTooLong { name: too_long.clone(), limit: 30 })
    );
    assert_eq!(c.bins(), &[ok]);
}

#[test]
fn duplicate_bin_is_rejected() {
    let mut c = CardWriter::new();
    c.add_bin("SR1", &[], "").unwrap();
    assert_eq!(c.add_bin("SR1", &[], ""), Err(ValidationError::DuplicateName("SR1".into())));
    assert_eq!(c.bins().len(), 1);
}

#[test]
fn long_process_name_rejects_whole_bin() {
    let mut c = CardWriter::new();
    let long = "p".repeat(31);
    assert!(c.add_bin("SR1", &["ok", &long], "").is_err());
    assert!(c.bins().is_empty());
}

#[test]
fn gamma_uncertainty_encoding() {
    let mut c = CardWriter::new();
    c.add_uncertainty("X", UncertaintyKind::GmN(5)).unwrap();
    assert_eq!(UncertaintyKind::GmN(5).encoded(), "gmN 5");
    assert_eq!(
        c.add_uncertainty("Y", UncertaintyKind::GmN(0)),
        Err(ValidationError::GammaWithoutN)
    );
    assert_eq!(c.uncertainties(), &["X".to_string()]);
}

#[test]
fn duplicate_uncertainty_is_rejected() {
    let mut c = CardWriter::new();
    c.add_uncertainty("lumi", UncertaintyKind::LnN).unwrap();
    assert!(c.add_uncertainty("lumi", UncertaintyKind::LnN).is_err());
    assert_eq!(c.uncertainties().len(), 1);
}

#[test]
fn negative_uncertainty_is_coerced_to_one() {
    let mut c = two_bin_model();
    c.add_uncertainty("sys", UncertaintyKind::LnN).unwrap();
    c.specify_uncertainty("sys", "SR1", "bkgA", -0.2).unwrap();
    assert_eq!(c.uncertainty_value("sys", "SR1", "bkgA"), Some(1.0));
}

#[test]
fn unknown_references_are_rejected() {
    let mut c = two_bin_model();
    assert!(matches!(
        c.specify_uncertainty("nope", "SR1", "bkgA", 1.1),
        Err(ValidationError::UnknownReference { kind: "uncertainty", .. })
    ));
    c.add_uncertainty("sys", UncertaintyKind::LnN).unwrap();
    assert!(matches!(
        c.specify_uncertainty("sys", "SR9", "bkgA", 1.1),
        Err(ValidationError::UnknownReference { kind: "bin", .. })
    ));
    assert!(matches!(
        c.specify_uncertainty("sys", "SR1", "ghost", 1.1),
        Err(ValidationError::UnknownReference { kind: "process", .. })
    ));
    assert!(matches!(
        c.specify_expectation("SR1", "ghost", 1.0),
        Err(ValidationError::UnknownReference { kind: "process", .. })
    ));
}

#[test]
fn non_finite_values_are_rejected() {
    let mut c = two_bin_model();
    assert!(matches!(
        c.specify_expectation("SR1", "bkgA", f64::NAN),
        Err(ValidationError::NonFiniteValue { .. })
    ));
    c.add_uncertainty("sys", UncertaintyKind::LnN).unwrap();
    assert!(matches!(
        c.specify_uncertainty("sys", "SR1", "bkgA", f64::INFINITY),
        Err(ValidationError::NonFiniteValue { .. })
    ));
}

#[test]
fn rounding_happens_at_storage_time() {
    let mut c = two_bin_model();
    c.set_precision(3);
    c.specify_expectation("SR1", "bkgA", 1.23456789).unwrap();
    assert_eq!(c.expectation("SR1", "bkgA"), Some(1.235));
    assert_eq!(c.expectation("SR1", "bkgA"), Some(1.235));
}

#[test]
fn completeness_gates_serialization() {
    let mut c = CardWriter::new();
    c.add_bin("SR1", &["bkgA"], "").unwrap();
    c.specify_expectation("SR1", "signal", 1.0).unwrap();
    c.specify_expectation("SR1", "bkgA", 2.0).unwrap();
    // missing observation
    assert!(!c.check_completeness());
    let path = tmp_path("incomplete.txt");
    assert!(c.write_to_file(&path).unwrap().is_none());
    assert!(!path.exists());

    c.specify_observation("SR1", 3).unwrap();
    assert!(c.check_completeness());
    let written = c.write_to_file(&path).unwrap();
    assert_eq!(written, Some(path.clone()));
    std::fs::remove_file(path).unwrap();
}

#[test]
fn missing_expectation_fails_completeness() {
    let mut c = CardWriter::new();
    c.add_bin("SR1", &["bkgA"], "").unwrap();
    c.specify_observation("SR1", 3).unwrap();
    c.specify_expectation("SR1", "signal", 1.0).unwrap();
    // bkgA has no expectation
    assert!(!c.check_completeness());
}

#[test]
fn muted_bins_are_skipped_by_completeness_and_serialization() {
    let mut c = two_bin_model();
    c.mute("SR2").unwrap();
    c.specify_observation("SR2", 0).unwrap();
    let path = tmp_path("muted.txt");
    c.write_to_file(&path).unwrap().unwrap();
    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("imax 1"));
    assert!(content.contains("#Muted: SR2:"));
    assert_eq!(parse::bin_list(&content).unwrap(), vec!["SR1".to_string()]);
    std::fs::remove_file(path).unwrap();
}

#[test]
fn rate_parameter_is_idempotent() {
    let mut c = CardWriter::new();
    c.add_rate_parameter("ttZ", 1.0, (0.0, 5.0)).unwrap();
    assert!(c.add_rate_parameter("ttZ", 2.0, (0.0, 3.0)).is_err());
}

#[test]
fn scenario_round_trip() {
    let mut c = two_bin_model();
    c.add_uncertainty("lumi", UncertaintyKind::LnN).unwrap();
    for bin in ["SR1", "SR2"] {
        for process in ["bkgA", "bkgB"] {
            c.specify_uncertainty("lumi", bin, process, 1.025).unwrap();
        }
    }
    assert!(c.check_completeness());

    let path = tmp_path("scenario.txt");
    c.write_to_file(&path).unwrap().unwrap();
    let content = std::fs::read_to_string(&path).unwrap();

    assert!(content.contains("imax 2"));
    assert_eq!(content.matches("1.025").count(), 4);

    assert_eq!(parse::bin_list(&content).unwrap(), vec!["SR1".to_string(), "SR2".to_string()]);
    let grouped = parse::processes_per_bin(&content).unwrap();
    assert_eq!(grouped.len(), 2);
    for (_, procs) in &grouped {
        assert_eq!(procs, &["signal".to_string(), "bkgA".to_string(), "bkgB".to_string()]);
    }
    assert_eq!(parse::uncertainty_names(&content), vec!["lumi".to_string()]);
    assert_eq!(parse::observation_row(&content).unwrap(), vec![10, 7]);

    let lumi = parse::uncertainty_values(&content, "lumi").unwrap();
    assert_eq!(lumi, vec![None, Some(1.025), Some(1.025), None, Some(1.025), Some(1.025)]);

    std::fs::remove_file(path).unwrap();
}

#[test]
fn rate_row_matches_stored_expectations() {
    let c = two_bin_model();
    let path = tmp_path("rates.txt");
    c.write_to_file(&path).unwrap().unwrap();
    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(parse::rate_row(&content).unwrap(), vec![1.0, 3.0, 4.5, 0.5, 2.0, 3.0]);
    std::fs::remove_file(path).unwrap();
}

#[test]
fn gamma_cell_renders_rate_over_n() {
    let mut c = two_bin_model();
    c.add_uncertainty("crStat", UncertaintyKind::GmN(5)).unwrap();
    c.specify_uncertainty("crStat", "SR1", "bkgA", 1.0).unwrap();
    let path = tmp_path("gamma.txt");
    c.write_to_file(&path).unwrap().unwrap();
    let content = std::fs::read_to_string(&path).unwrap();
    // expectation 3.0 / n=5 = 0.6, only for the one specified cell
    let cells = parse::uncertainty_values(&content, "crStat").unwrap();
    assert_eq!(cells, vec![None, Some(0.6), None, None, None, None]);
    std::fs::remove_file(path).unwrap();
}

#[test]
fn rate_parameter_lines_round_trip() {
    let mut c = two_bin_model();
    c.add_rate_parameter("bkgA", 1.0, (0.0, 5.0)).unwrap();
    let path = tmp_path("rateparam.txt");
    c.write_to_file(&path).unwrap().unwrap();
    let content = std::fs::read_to_string(&path).unwrap();

    assert!(content.contains("bkgA_norm_SR1 rateParam SR1 bkgA (@0*1) bkgA_norm"));
    assert!(content.contains("bkgA_norm extArg 1 [0,5]"));

    let known = vec!["signal".to_string(), "bkgA".to_string(), "bkgB".to_string()];
    let info = parse::rate_param_info(&content, &known);
    let bins = &info["bkgA_norm"];
    assert_eq!(bins["SR1"], vec!["bkgA".to_string()]);
    assert_eq!(bins["SR2"], vec!["bkgA".to_string()]);
    std::fs::remove_file(path).unwrap();
}

#[test]
fn grouped_rate_parameters_tie_signal_regions_to_control_regions() {
    let mut c = CardWriter::new();
    for (i, name) in ["CR0", "CR1", "SR0", "SR1", "SR2"].iter().enumerate() {
        c.add_bin(name, &["ttZ"], "").unwrap();
        c.specify_observation(name, i as i64).unwrap();
        c.specify_expectation(name, "signal", 1.0).unwrap();
        c.specify_expectation(name, "ttZ", 2.0).unwrap();
    }
    c.add_control_regions(&["CR0", "CR1"]);
    c.add_signal_regions(&["SR0", "SR1", "SR2"]);
    c.add_region_mapping(&[2, 1]);
    c.add_rate_parameter("ttZ", 1.0, (0.0, 5.0)).unwrap();

    let path = tmp_path("grouped.txt");
    c.write_to_file(&path).unwrap().unwrap();
    let content = std::fs::read_to_string(&path).unwrap();

    assert!(content.contains("ttZ_norm_CR0 rateParam CR0 ttZ (@0*1) ttZ_norm_CR0"));
    assert!(content.contains("ttZ_norm_SR0 rateParam SR0 ttZ (@0*1) ttZ_norm_CR0"));
    assert!(content.contains("ttZ_norm_SR1 rateParam SR1 ttZ (@0*1) ttZ_norm_CR0"));
    assert!(content.contains("ttZ_norm_SR2 rateParam SR2 ttZ (@0*1) ttZ_norm_CR1"));
    assert!(content.contains("ttZ_norm_CR0 extArg 1 [0,5]"));
    std::fs::remove_file(path).unwrap();
}

#[test]
fn wildcard_rate_param_matches_prefix() {
    let card = "procA_norm rateParam SR1 procA* 1.0 [0,2]\n";
    let known =
        vec!["procA_2016".to_string(), "procA_2017".to_string(), "other".to_string()];
    let info = parse::rate_param_info(card, &known);
    assert_eq!(
        info["procA_norm"]["SR1"],
        vec!["procA_2016".to_string(), "procA_2017".to_string()]
    );
}

#[test]
fn shape_file_writes_variations_and_companion_card() {
    let mut c = two_bin_model();
    c.add_uncertainty("jes", UncertaintyKind::Shape).unwrap();
    c.specify_uncertainty("jes", "SR1", "bkgA", 1.1).unwrap();
    c.specify_uncertainty("jes", "SR2", "bkgA", 1.2).unwrap();

    let path = tmp_path("shape.json");
    let card_path = c.write_to_shape_file(&path, false).unwrap().unwrap();

    let histos: std::collections::BTreeMap<String, dc_core::Hist1> =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(histos["data_obs"].content, vec![10.0, 7.0]);
    assert_eq!(histos["bkgA"].content, vec![3.0, 2.0]);
    assert!((histos["bkgA_jesUp"].content[0] - 3.3).abs() < 1e-9);
    assert!((histos["bkgA_jesDown"].content[0] - 3.0 / 1.1).abs() < 1e-9);

    let card = std::fs::read_to_string(&card_path).unwrap();
    assert!(card.contains("shapes * *"));
    assert!(card.contains("* autoMCStats 10"));
    // the shape cells are switched on, not carrying the morphing strength
    let jes = parse::uncertainty_values(&card, "jes").unwrap();
    assert_eq!(jes[1], Some(1.0));

    std::fs::remove_file(path).unwrap();
    std::fs::remove_file(card_path).unwrap();
}

#[test]
fn channels_detection() {
    assert_eq!(parse::channels("imax 2\n"), vec!["Bin0".to_string()]);
    assert_eq!(
        parse::channels("Combination of dc_2016=card16.txt  dc_2017=card17.txt\n"),
        vec!["dc_2016".to_string(), "dc_2017".to_string()]
    );
}

#[test]
fn bin_comments_parse_both_forms() {
    let content = "# SR1: first region\n#Muted: SR2: second region\n";
    let comments = parse::bin_comments(content);
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[0].bin, "SR1");
    assert_eq!(comments[0].label, "first region");
    assert!(!comments[0].muted);
    assert!(comments[1].muted);
}

#[test]
fn value_formatting() {
    assert_eq!(format_value(3.0, 10), "3.0");
    assert_eq!(format_value(1.025, 10), "1.025");
    assert_eq!(round_to(1.23456789, 3), 1.235);
}

#[test]
fn natural_sort_orders_numerically() {
    let names = vec!["Bin10".to_string(), "Bin2".to_string(), "Bin1".to_string()];
    assert_eq!(
        natural_sort(&names),
        vec!["Bin1".to_string(), "Bin2".to_string(), "Bin10".to_string()]
    );
}

#[test]
fn poisson_prefit_nll_single_bin() {
    let mut c = CardWriter::new();
    c.add_bin("SR1", &[], "").unwrap();
    c.specify_observation("SR1", 2).unwrap();
    c.specify_expectation("SR1", "signal", 3.0).unwrap();
    // -(-lam + n ln lam - ln n!) with lam=3, n=2
    let expected = -(-3.0 + 2.0 * 3.0_f64.ln() - 2.0_f64.ln());
    assert!((c.poisson_prefit_nll() - expected).abs() < 1e-12);
}

#[test]
fn poisson_prefit_nll_handles_empty_bins() {
    let mut c = CardWriter::new();
    c.add_bin("SR1", &[], "").unwrap();
    c.specify_observation("SR1", 0).unwrap();
    c.specify_expectation("SR1", "signal", 0.0).unwrap();
    let nll = c.poisson_prefit_nll();
    assert!(nll.is_finite());
    assert_eq!(nll, 0.0);
}
