use retention_core::{
    config::AnalysisConfig,
    model_selection::{aic, bic},
    sbg_model::{self, predict_alive},
    cohort::CohortRetentionTable,
};

#[test]
fn aic_reference_value() {
    assert!((aic(2, -100.0) - 204.0).abs() < 1e-12);
}

#[test]
fn bic_reference_value() {
    let expected = 2.0 * 50f64.ln() + 200.0;
    assert!((bic(2, 50, -100.0) - expected).abs() < 1e-12);
}

/// Either sign of the log-likelihood gives the same criterion.
#[test]
fn criteria_normalize_sign() {
    assert_eq!(aic(2, 100.0), aic(2, -100.0));
    assert_eq!(bic(2, 50, 100.0), bic(2, 50, -100.0));
}

/// A fit result carries its own AIC/BIC with n = cohort size.
#[test]
fn fit_result_criteria_use_its_own_counts() {
    let alive = predict_alive(0.8, 1.6, 6, 500.0).unwrap();
    let table = CohortRetentionTable::from_alive(alive).unwrap();
    let fit = sbg_model::fit(&table, (1.0, 1.0), &AnalysisConfig::default_test().estimation).unwrap();

    assert_eq!(fit.aic(), aic(2, fit.log_likelihood));
    assert_eq!(fit.bic(), bic(2, 500, fit.log_likelihood));
    assert!(fit.bic() > fit.aic(), "ln(500) > 2");
}
