use chrono::{Duration, NaiveDate};
use retention_core::{
    config::AnalysisConfig,
    error::RetentionError,
    rfm_aggregator::{aggregate, customer_slices, filter_unauthorized, prepare, RfmAggregator, RfmRecord},
    transaction::{Transaction, TransactionColumns, TransactionTable},
};

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Route library logs through the test harness; repeat calls are no-ops.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn table(rows: &[(&str, &str, i64, f64)]) -> TransactionTable {
    init_logging();
    TransactionTable::new(
        rows.iter()
            .map(|(id, date, q, s)| Transaction::new(*id, *date, *q, *s))
            .collect(),
    )
}

/// Day 1 = 1997-01-01; boundary day 20 = 1997-01-20.
fn sample_table() -> TransactionTable {
    table(&[
        ("1", "19970101", 1, 10.00),
        ("1", "19970101", 1, 5.00),
        ("1", "19970110", 2, 20.00),
        ("1", "19970201", 1, 7.50),
        ("2", "19970103", 1, 12.00),
        ("3", "19970105", 1, 3.00),
        ("3", "19970106", 3, 9.99),
        ("4", "19970125", 1, 40.00),
    ])
}

fn record<'a>(records: &'a [RfmRecord], id: &str) -> &'a RfmRecord {
    records
        .iter()
        .find(|r| r.customer_id == id)
        .unwrap_or_else(|| panic!("no record for customer {id}"))
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-12
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// Hand-checked values for a small log spanning both windows.
#[test]
fn aggregates_hand_checked_customers() {
    let summary = aggregate(&sample_table(), "%Y%m%d", 20).unwrap();
    let records = &summary.records;

    let c1 = record(records, "1");
    assert_eq!((c1.p1x, c1.p2x), (1, 1));
    assert!(close(c1.t_x, 9.0 / 7.0), "t_x = {}", c1.t_x);
    assert!(close(c1.t_cal, 19.0 / 7.0), "T = {}", c1.t_cal);
    assert!(close(c1.p1rec, 10.0 / 7.0));
    assert_eq!(c1.p1x_spend_cents, 2000);
    assert_eq!(c1.p2x_spend_cents, 750);
    assert_eq!((c1.p1x_quant, c1.p2x_quant), (2, 1));
    assert!(close(c1.m_x_calib, 20.0));
    assert!(close(c1.m_x_valid, 7.5));
    assert!(close(c1.zbar, 20.0));

    let c3 = record(records, "3");
    assert_eq!(c3.p1x, 1);
    assert!(close(c3.t_x, 1.0 / 7.0));
    assert!(close(c3.m_x_calib, 9.99));
}

/// A customer with no repeats gets zero frequency, recency and monetary value.
#[test]
fn single_purchase_customer_has_zero_rfm() {
    let summary = aggregate(&sample_table(), "%Y%m%d", 20).unwrap();
    let c2 = record(&summary.records, "2");

    assert_eq!((c2.p1x, c2.p2x), (0, 0));
    assert_eq!(c2.t_x, 0.0);
    assert_eq!(c2.zbar, 0.0);
    assert_eq!(c2.m_x_calib, 0.0);
    assert!(close(c2.t_cal, 17.0 / 7.0));
}

/// Customers acquired after the boundary are reported, not silently dropped.
#[test]
fn late_trial_customers_are_listed_separately() {
    let summary = aggregate(&sample_table(), "%Y%m%d", 20).unwrap();

    assert_eq!(summary.late_trial_customers, vec!["4".to_string()]);
    assert!(summary.records.iter().all(|r| r.customer_id != "4"));
    assert_eq!(summary.records.len(), 3);
}

/// P1X + P2X equals the number of the customer's DoR ≥ 1 transactions.
#[test]
fn frequency_counts_every_repeat_once() {
    let t = sample_table();
    let prepared = prepare(&t, "%Y%m%d").unwrap();
    let summary = aggregate(&t, "%Y%m%d", 20).unwrap();

    for r in &summary.records {
        let repeats = prepared
            .iter()
            .filter(|p| p.customer_id == r.customer_id && p.dor >= 1)
            .count() as u32;
        assert_eq!(r.p1x + r.p2x, repeats, "customer {}", r.customer_id);
    }
}

/// DoR runs 0, 1, 2, ... along each customer's dates.
#[test]
fn dor_follows_date_order() {
    let t = table(&[
        ("9", "19970301", 1, 1.0),
        ("9", "19970105", 1, 1.0),
        ("9", "19970220", 1, 1.0),
        ("9", "19970105", 1, 1.0),
        ("8", "19970102", 1, 1.0),
    ]);
    let prepared = prepare(&t, "%Y%m%d").unwrap();

    for txns in customer_slices(&prepared) {
        for (expected, txn) in txns.iter().enumerate() {
            assert_eq!(txn.dor as usize, expected, "customer {}", txn.customer_id);
        }
        assert!(txns.windows(2).all(|w| w[0].date < w[1].date));
    }
    assert_eq!(prepared.iter().filter(|p| p.customer_id == "9").count(), 3, "same-day rows merge");
}

/// 0 ≤ t_x ≤ T whenever P1X > 0, and t_x = 0 otherwise.
#[test]
fn recency_stays_inside_calibration_window() {
    let base = NaiveDate::from_ymd_opt(1997, 1, 1).unwrap();
    let mut rows = Vec::new();
    for c in 0..40i64 {
        let id = c.to_string();
        for k in 0..(c % 6) {
            let date = base + Duration::days(c + 11 * k);
            rows.push(Transaction::new(id.clone(), date.format("%Y%m%d").to_string(), 1, 2.5));
        }
    }
    let summary = aggregate(&TransactionTable::new(rows), "%Y%m%d", 60).unwrap();

    for r in &summary.records {
        if r.p1x > 0 {
            assert!(r.t_x >= 0.0 && r.t_x <= r.t_cal, "customer {}: t_x={} T={}", r.customer_id, r.t_x, r.t_cal);
        } else {
            assert_eq!(r.t_x, 0.0, "customer {}", r.customer_id);
        }
    }
}

/// One trial plus one repeat each, boundary after every repeat: P1X=1, P2X=0.
#[test]
fn trial_plus_one_repeat_lands_in_calibration() {
    let base = NaiveDate::from_ymd_opt(1997, 1, 1).unwrap();
    let mut rows = Vec::new();
    for c in 0..25i64 {
        let trial = base + Duration::days(c);
        let repeat = trial + Duration::days(1 + c % 4);
        rows.push(Transaction::new(format!("c{c}"), trial.format("%Y%m%d").to_string(), 1, 10.0));
        rows.push(Transaction::new(format!("c{c}"), repeat.format("%Y%m%d").to_string(), 1, 12.0));
    }
    // Latest repeat: customer 23 on day 24 + 4 = 28.
    let summary = aggregate(&TransactionTable::new(rows), "%Y%m%d", 28).unwrap();

    assert_eq!(summary.records.len(), 25);
    for r in &summary.records {
        assert_eq!((r.p1x, r.p2x), (1, 0), "customer {}", r.customer_id);
    }
}

/// Spend is summed in integer cents, so 0.1 + 0.2 is exactly 30 cents.
#[test]
fn spend_sums_without_float_drift() {
    let t = table(&[
        ("1", "19970101", 1, 1.00),
        ("1", "19970102", 1, 0.10),
        ("1", "19970102", 1, 0.20),
        ("1", "19970103", 1, 0.10),
    ]);
    let summary = aggregate(&t, "%Y%m%d", 3).unwrap();
    let c1 = &summary.records[0];
    assert_eq!(c1.p1x_spend_cents, 40);
    assert_eq!(c1.p1x, 2);
    assert!(close(c1.m_x_calib, 0.20));
}

/// The reseller filter compares calibration-window repeat spend only.
#[test]
fn reseller_filter_uses_calibration_spend() {
    let t = table(&[
        ("big", "19970101", 1, 10.0),
        ("big", "19970105", 50, 4500.0),
        ("late_big", "19970101", 1, 10.0),
        ("late_big", "19970201", 50, 9000.0),
        ("small", "19970101", 1, 10.0),
        ("small", "19970105", 1, 30.0),
    ]);
    let summary = RfmAggregator::new("%Y%m%d", 20)
        .with_unauthorized_threshold(Some(4000.0))
        .aggregate(&t)
        .unwrap();

    assert_eq!(summary.removed_resellers, vec!["big".to_string()]);
    let kept: Vec<&str> = summary.records.iter().map(|r| r.customer_id.as_str()).collect();
    assert_eq!(kept, vec!["late_big", "small"]);

    let (kept_again, removed) = filter_unauthorized(summary.records, 4000.0);
    assert_eq!(kept_again.len(), 2);
    assert!(removed.is_empty(), "filter must be idempotent");
}

/// A malformed date aborts the run and names row and customer.
#[test]
fn malformed_date_is_parse_error() {
    let t = table(&[("1", "19970101", 1, 1.0), ("2", "1997-13-45", 1, 1.0)]);
    match aggregate(&t, "%Y%m%d", 1) {
        Err(RetentionError::Parse { row, customer_id, .. }) => {
            assert_eq!(row, 2);
            assert_eq!(customer_id, "2");
        }
        other => panic!("expected Parse error, got {other:?}"),
    }
}

#[test]
fn boundary_beyond_data_is_configuration_error() {
    let err = aggregate(&sample_table(), "%Y%m%d", 400).unwrap_err();
    assert!(matches!(err, RetentionError::Configuration(_)), "got {err:?}");
}

#[test]
fn empty_table_is_insufficient_data() {
    let err = aggregate(&TransactionTable::default(), "%Y%m%d", 1).unwrap_err();
    assert!(matches!(err, RetentionError::InsufficientData { .. }), "got {err:?}");
}

/// CSV in the CDNOW sample layout through the configured aggregator.
#[test]
fn cdnow_layout_end_to_end() {
    let data = "\
4,1,19970101,2,29.33
4,1,19970118,2,29.73
4,1,19970802,1,14.96
18,2,19970101,1,11.77
21,3,19970101,2,26.48
21,3,19970101,1,10.00
";
    let t = TransactionTable::from_csv_reader(data.as_bytes(), false, TransactionColumns::cdnow_sample()).unwrap();
    let mut config = AnalysisConfig::default_test();
    if let Some(rfm) = config.rfm.as_mut() {
        rfm.calibration_boundary = 31;
        rfm.unauthorized_spend_threshold = None;
    }
    let summary = RfmAggregator::from_config(config.rfm().unwrap()).aggregate(&t).unwrap();

    let c1 = record(&summary.records, "1");
    assert_eq!((c1.p1x, c1.p2x), (1, 1), "Jan 18 is calibration, Aug 2 is holdout");
    assert!(close(c1.t_x, 17.0 / 7.0));
    let c3 = record(&summary.records, "3");
    assert_eq!(c3.p1x, 0, "two same-day rows are one trial");
}
