//! retention-runner: headless batch runner for RFM aggregation and
//! retention model fits.
//!
//! Usage:
//!   retention-runner rfm    --input txns.csv  --config analysis.json [--cdnow] [--header] [--output rfm.json]
//!   retention-runner sbg    --input cohort.csv [--config analysis.json] [--output fit.json]
//!   retention-runner sbbgb  --input panel.csv  [--config analysis.json] [--variant correlated] [--id-column] [--output fit.json]

use anyhow::{bail, Context, Result};
use retention_core::{
    cohort::CohortRetentionTable,
    config::AnalysisConfig,
    fit::FitResult,
    heterogeneity::{self, EstimationContext},
    incidence::{calibration_groups, IncidencePanel},
    rfm_aggregator::{RfmAggregator, RfmSummary},
    sbbgb_model,
    sbg_model::{self, SbgParams},
    transaction::{TransactionColumns, TransactionTable},
};
use serde::Serialize;
use std::env;
use std::fs::File;
use std::io::BufReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    Homogeneous,
    Uncorrelated,
    Correlated,
}

impl std::str::FromStr for Variant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "homogeneous"  => Ok(Self::Homogeneous),
            "uncorrelated" => Ok(Self::Uncorrelated),
            "correlated"   => Ok(Self::Correlated),
            other => bail!("unknown variant '{other}' (homogeneous|uncorrelated|correlated)"),
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");
    let input = flag_value(&args, "--input");
    let output = flag_value(&args, "--output");

    let config = match flag_value(&args, "--config") {
        Some(path) => AnalysisConfig::load(path)?,
        None => AnalysisConfig::from_json_str("{}")?,
    };

    match command {
        "rfm" => {
            let input = input.context("rfm needs --input <transactions.csv>")?;
            let columns = if has_flag(&args, "--cdnow") {
                TransactionColumns::cdnow_sample()
            } else {
                TransactionColumns::default()
            };
            let summary = run_rfm(input, &config, columns, has_flag(&args, "--header"))?;
            print_rfm_summary(&summary);
            write_json(output, &summary)?;
        }
        "sbg" => {
            let input = input.context("sbg needs --input <cohort.csv>")?;
            let fit = run_sbg(input, &config)?;
            write_json(output, &fit)?;
        }
        "sbbgb" => {
            let input = input.context("sbbgb needs --input <panel.csv>")?;
            let variant: Variant = flag_value(&args, "--variant").unwrap_or("homogeneous").parse()?;
            let fit = run_sbbgb(input, &config, variant, has_flag(&args, "--id-column"))?;
            write_json(output, &fit)?;
        }
        _ => {
            println!("retention-runner <rfm|sbg|sbbgb> --input <csv> [--config <json>] [--output <json>]");
        }
    }

    Ok(())
}

fn run_rfm(input: &str, config: &AnalysisConfig, columns: TransactionColumns, header: bool) -> Result<RfmSummary> {
    let rfm = config.rfm()?;
    let file = File::open(input).with_context(|| format!("Cannot open {input}"))?;
    let table = TransactionTable::from_csv_reader(BufReader::new(file), header, columns)?;

    println!("retention-runner: rfm");
    println!("  input:       {input}");
    println!("  rows:        {}", table.len());
    println!("  boundary:    day {}", rfm.calibration_boundary);
    println!();

    Ok(RfmAggregator::from_config(rfm).aggregate(&table)?)
}

fn run_sbg(input: &str, config: &AnalysisConfig) -> Result<FitResult> {
    let file = File::open(input).with_context(|| format!("Cannot open {input}"))?;
    let full = CohortRetentionTable::from_csv_reader(BufReader::new(file))?;
    let train = full.training(config.cohort.training_periods)?;

    let fit = sbg_model::fit(&train, (1.0, 1.0), &config.estimation)?;
    print_fit(&fit);

    let params = SbgParams::from_fit(&fit)?;
    let predicted = params.predict_alive(full.horizon(), full.cohort_size());
    println!("  period   actual     predicted");
    for (t, (actual, expected)) in full.alive().iter().zip(&predicted).enumerate() {
        let marker = if t <= train.horizon() { "" } else { "  (holdout)" };
        println!("  {t:>6}   {actual:>8.0}   {expected:>9.1}{marker}");
    }
    Ok(fit)
}

fn run_sbbgb(input: &str, config: &AnalysisConfig, variant: Variant, id_column: bool) -> Result<FitResult> {
    let file = File::open(input).with_context(|| format!("Cannot open {input}"))?;
    let panel = IncidencePanel::from_csv_reader(BufReader::new(file), id_column, config.incidence.calibration_periods)?;
    let groups = calibration_groups(&panel.rfm());
    log::info!("sbbgb: {} customers in {} calibration groups", panel.len(), groups.len());

    let fit = match variant {
        Variant::Homogeneous => sbbgb_model::fit_homogeneous(&groups, (0.5, 0.5), &config.estimation)?,
        Variant::Uncorrelated => {
            let ctx = EstimationContext::from_config(&config.estimation)?;
            heterogeneity::fit_uncorrelated(&groups, &ctx, &config.estimation)?
        }
        Variant::Correlated => {
            let ctx = EstimationContext::from_config(&config.estimation)?;
            heterogeneity::fit_correlated(&groups, &ctx, &config.estimation)?
        }
    };
    print_fit(&fit);
    Ok(fit)
}

fn print_rfm_summary(summary: &RfmSummary) {
    let records = &summary.records;
    let repeaters = records.iter().filter(|r| r.p1x > 0).count();
    let total_p1x: u64 = records.iter().map(|r| r.p1x as u64).sum();
    let total_p2x: u64 = records.iter().map(|r| r.p2x as u64).sum();

    println!("=== RFM SUMMARY ===");
    println!("  customers:        {}", records.len());
    println!("  repeat buyers:    {repeaters}");
    println!("  calib repeats:    {total_p1x}");
    println!("  holdout repeats:  {total_p2x}");
    println!("  late trials:      {}", summary.late_trial_customers.len());
    println!("  resellers:        {}", summary.removed_resellers.len());
}

fn print_fit(fit: &FitResult) {
    println!("=== FIT: {} ===", fit.model);
    for (name, value) in &fit.parameters {
        println!("  {name:<12} {value:>12.6}");
    }
    for (name, value) in &fit.derived {
        println!("  {name:<12} {value:>12.6}  (derived)");
    }
    println!("  LL:          {:.4}", fit.log_likelihood);
    println!("  AIC:         {:.4}", fit.aic());
    println!("  BIC:         {:.4}", fit.bic());
    println!("  converged:   {} ({} iterations)", fit.converged, fit.iterations);
    if !fit.boundary_parameters.is_empty() {
        println!("  at bound:    {:?}", fit.boundary_parameters);
    }
    println!();
}

fn write_json<T: Serialize>(path: Option<&str>, value: &T) -> Result<()> {
    if let Some(path) = path {
        let file = File::create(path).with_context(|| format!("Cannot create {path}"))?;
        serde_json::to_writer_pretty(file, value)?;
        log::info!("wrote {path}");
    }
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
