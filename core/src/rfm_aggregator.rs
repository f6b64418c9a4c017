//! RFM aggregation: transaction log → one behavioural summary per customer.
//!
//! Pipeline, each step a plain function composed by `RfmAggregator`:
//!   1. prepare              parse dates, PurchDay, merge same-day rows, assign DoR
//!   2. compute_frequency    P1X / P2X repeat counts
//!   3. compute_spend_quant  repeat spend (cents) and quantity per window
//!   4. compute_avg_spend    m_x per window
//!   5. compute_recency      t_x, T, calendar recency
//!
//! A caller wanting different behaviour for one step supplies a different
//! function through `AggregationSteps`.
//!
//! PurchDay shares one origin across the whole dataset: day 1 is the
//! earliest date in the table, not the customer's own first purchase.

use crate::{
    config::RfmConfig,
    error::{RetentionError, RetentionResult},
    transaction::TransactionTable,
    types::{from_cents, to_cents, Cents, CustomerId, PurchDay},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ── Public types ─────────────────────────────────────────────────────────────

/// One customer-day after parsing and same-day merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedTransaction {
    pub customer_id: CustomerId,
    pub date:        NaiveDate,
    pub purch_day:   PurchDay,
    pub quantity:    i64,
    pub spend_cents: Cents,
    /// Depth of repeat: 0 = trial, 1 = first repeat, ...
    pub dor:         u32,
}

impl PreparedTransaction {
    pub fn is_repeat(&self) -> bool {
        self.dor > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frequency {
    pub customer_id: CustomerId,
    pub p1x:         u32,
    pub p2x:         u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendQuant {
    pub customer_id:     CustomerId,
    pub p1x_spend_cents: Cents,
    pub p1x_quant:       i64,
    pub p2x_spend_cents: Cents,
    pub p2x_quant:       i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvgSpend {
    pub customer_id: CustomerId,
    pub m_x_calib:   f64,
    pub m_x_valid:   f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recency {
    pub customer_id: CustomerId,
    pub trial_day:   PurchDay,
    pub t_x:         f64,
    pub t_cal:       f64,
    pub p1rec:       f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfmRecord {
    pub customer_id:     CustomerId,
    /// Repeat transactions in the calibration window.
    pub p1x:             u32,
    /// Repeat transactions in the holdout window.
    pub p2x:             u32,
    /// Trial to last calibration repeat, in time units; 0 when p1x = 0.
    pub t_x:             f64,
    /// T: trial to calibration boundary, in time units.
    pub t_cal:           f64,
    /// Calendar recency: PurchDay of the last calibration purchase in time units.
    pub p1rec:           f64,
    pub p1x_spend_cents: Cents,
    pub p1x_quant:       i64,
    pub p2x_spend_cents: Cents,
    pub p2x_quant:       i64,
    pub m_x_calib:       f64,
    pub m_x_valid:       f64,
    pub zbar:            f64,
}

impl RfmRecord {
    pub fn p1x_spend(&self) -> f64 {
        from_cents(self.p1x_spend_cents)
    }

    pub fn p2x_spend(&self) -> f64 {
        from_cents(self.p2x_spend_cents)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RfmSummary {
    pub records:              Vec<RfmRecord>,
    /// Customers whose trial purchase falls after the calibration boundary.
    pub late_trial_customers: Vec<CustomerId>,
    /// Customers removed by the unauthorized-reseller filter.
    pub removed_resellers:    Vec<CustomerId>,
}

// ── Pipeline steps ───────────────────────────────────────────────────────────

pub type FrequencyFn  = fn(&[PreparedTransaction], PurchDay) -> Vec<Frequency>;
pub type SpendQuantFn = fn(&[PreparedTransaction], &[Frequency], PurchDay) -> Vec<SpendQuant>;
pub type AvgSpendFn   = fn(&[SpendQuant], &[Frequency]) -> Vec<AvgSpend>;
pub type RecencyFn    = fn(&[PreparedTransaction], &[Frequency], PurchDay, u32) -> Vec<Recency>;

/// The functions `RfmAggregator` runs, in order.
#[derive(Clone, Copy)]
pub struct AggregationSteps {
    pub frequency:   FrequencyFn,
    pub spend_quant: SpendQuantFn,
    pub avg_spend:   AvgSpendFn,
    pub recency:     RecencyFn,
}

impl Default for AggregationSteps {
    fn default() -> Self {
        Self {
            frequency:   compute_frequency,
            spend_quant: compute_spend_quant,
            avg_spend:   compute_avg_spend,
            recency:     compute_recency,
        }
    }
}

/// Sort key keeping numeric ids in numeric order. The raw id is part of
/// the key so "007" and "7" stay distinct customers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum CustomerKey {
    Numeric(i64, String),
    Text(String),
}

impl CustomerKey {
    fn new(id: &str) -> Self {
        match id.parse::<i64>() {
            Ok(n)  => Self::Numeric(n, id.to_string()),
            Err(_) => Self::Text(id.to_string()),
        }
    }
}

/// Parse, assign PurchDay, merge same-customer-same-date rows and assign DoR.
///
/// Output is sorted by customer then date, so each customer's rows are
/// contiguous and DoR increases by one along them.
pub fn prepare(table: &TransactionTable, date_format: &str) -> RetentionResult<Vec<PreparedTransaction>> {
    if table.is_empty() {
        return Err(RetentionError::InsufficientData {
            model:    "rfm",
            required: 1,
            actual:   0,
        });
    }

    let mut parsed = Vec::with_capacity(table.len());
    for (index, txn) in table.rows().iter().enumerate() {
        let date = NaiveDate::parse_from_str(txn.date.trim(), date_format).map_err(|e| {
            RetentionError::Parse {
                row:         index + 1,
                customer_id: txn.customer_id.clone(),
                message:     format!("date '{}' does not match '{date_format}': {e}", txn.date),
            }
        })?;
        parsed.push((date, txn));
    }

    let min_date = parsed
        .iter()
        .map(|(date, _)| *date)
        .min()
        .ok_or(RetentionError::InsufficientData { model: "rfm", required: 1, actual: 0 })?;

    // (customer, date) -> (quantity, cents)
    let mut merged: BTreeMap<(CustomerKey, NaiveDate), (i64, Cents)> = BTreeMap::new();
    for (date, txn) in &parsed {
        let entry = merged
            .entry((CustomerKey::new(&txn.customer_id), *date))
            .or_insert((0, 0));
        entry.0 += txn.quantity;
        entry.1 += to_cents(txn.spend);
    }

    let mut prepared: Vec<PreparedTransaction> = Vec::with_capacity(merged.len());
    for ((key, date), (quantity, spend_cents)) in merged {
        let customer_id = match key {
            CustomerKey::Numeric(_, id) | CustomerKey::Text(id) => id,
        };
        let dor = match prepared.last() {
            Some(prev) if prev.customer_id == customer_id => prev.dor + 1,
            _ => 0,
        };
        let purch_day = (date - min_date).num_days() as PurchDay + 1;
        prepared.push(PreparedTransaction { customer_id, date, purch_day, quantity, spend_cents, dor });
    }

    log::debug!(
        "rfm prepare: {} raw rows -> {} customer-days",
        table.len(),
        prepared.len()
    );
    Ok(prepared)
}

/// Contiguous per-customer slices of a prepared log.
pub fn customer_slices(prepared: &[PreparedTransaction]) -> impl Iterator<Item = &[PreparedTransaction]> {
    prepared.chunk_by(|a, b| a.customer_id == b.customer_id)
}

/// Frequency: repeat transactions in the calibration and holdout windows.
pub fn compute_frequency(prepared: &[PreparedTransaction], calibration_boundary: PurchDay) -> Vec<Frequency> {
    customer_slices(prepared)
        .map(|txns| {
            let (p1x, p2x) = txns
                .iter()
                .filter(|t| t.is_repeat())
                .fold((0, 0), |(p1, p2), t| {
                    if t.purch_day <= calibration_boundary { (p1 + 1, p2) } else { (p1, p2 + 1) }
                });
            Frequency { customer_id: txns[0].customer_id.clone(), p1x, p2x }
        })
        .collect()
}

/// Repeat spend and quantity per window.
pub fn compute_spend_quant(
    prepared: &[PreparedTransaction],
    _freq: &[Frequency],
    calibration_boundary: PurchDay,
) -> Vec<SpendQuant> {
    customer_slices(prepared)
        .map(|txns| {
            let mut sq = SpendQuant {
                customer_id:     txns[0].customer_id.clone(),
                p1x_spend_cents: 0,
                p1x_quant:       0,
                p2x_spend_cents: 0,
                p2x_quant:       0,
            };
            for t in txns.iter().filter(|t| t.is_repeat()) {
                if t.purch_day <= calibration_boundary {
                    sq.p1x_spend_cents += t.spend_cents;
                    sq.p1x_quant += t.quantity;
                } else {
                    sq.p2x_spend_cents += t.spend_cents;
                    sq.p2x_quant += t.quantity;
                }
            }
            sq
        })
        .collect()
}

/// Monetary value: average spend per repeat transaction, 0 for an empty window.
pub fn compute_avg_spend(spend_quant: &[SpendQuant], freq: &[Frequency]) -> Vec<AvgSpend> {
    spend_quant
        .iter()
        .zip(freq)
        .map(|(sq, f)| AvgSpend {
            customer_id: sq.customer_id.clone(),
            m_x_calib:   average(sq.p1x_spend_cents, f.p1x),
            m_x_valid:   average(sq.p2x_spend_cents, f.p2x),
        })
        .collect()
}

fn average(total_cents: Cents, count: u32) -> f64 {
    if count == 0 { 0.0 } else { from_cents(total_cents) / count as f64 }
}

/// Recency t_x, effective calibration length T and calendar recency.
pub fn compute_recency(
    prepared: &[PreparedTransaction],
    freq: &[Frequency],
    calibration_boundary: PurchDay,
    time_unit_divisor: u32,
) -> Vec<Recency> {
    let unit = time_unit_divisor as f64;
    customer_slices(prepared)
        .zip(freq)
        .map(|(txns, f)| {
            let trial_day = txns[0].purch_day;
            // DoR 0..=P1X are exactly the calibration purchases.
            let last_calib_day = txns
                .iter()
                .filter(|t| t.dor <= f.p1x)
                .map(|t| t.purch_day)
                .max()
                .unwrap_or(trial_day);
            Recency {
                customer_id: txns[0].customer_id.clone(),
                trial_day,
                t_x:   (last_calib_day - trial_day) as f64 / unit,
                t_cal: (calibration_boundary as f64 - trial_day as f64) / unit,
                p1rec: last_calib_day as f64 / unit,
            }
        })
        .collect()
}

/// Drop customers whose calibration-window repeat spend exceeds `threshold`
/// (currency units). Returns the kept records and the removed ids.
pub fn filter_unauthorized(records: Vec<RfmRecord>, threshold: f64) -> (Vec<RfmRecord>, Vec<CustomerId>) {
    let limit = to_cents(threshold);
    let (removed, kept): (Vec<_>, Vec<_>) = records
        .into_iter()
        .partition(|r| r.p1x_spend_cents > limit);
    let removed_ids: Vec<CustomerId> = removed.into_iter().map(|r| r.customer_id).collect();
    if !removed_ids.is_empty() {
        log::warn!(
            "rfm: removed {} customers with calibration repeat spend above {threshold:.2}",
            removed_ids.len()
        );
    }
    (kept, removed_ids)
}

// ── Aggregator ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RfmAggregator {
    pub date_format:                  String,
    pub calibration_boundary:         PurchDay,
    pub time_unit_divisor:            u32,
    pub unauthorized_spend_threshold: Option<f64>,
    steps:                            AggregationSteps,
}

impl RfmAggregator {
    pub fn new(date_format: impl Into<String>, calibration_boundary: PurchDay) -> Self {
        Self {
            date_format: date_format.into(),
            calibration_boundary,
            time_unit_divisor: 7,
            unauthorized_spend_threshold: None,
            steps: AggregationSteps::default(),
        }
    }

    pub fn from_config(config: &RfmConfig) -> Self {
        Self::new(config.date_format.clone(), config.calibration_boundary)
            .with_time_unit_divisor(config.time_unit_divisor)
            .with_unauthorized_threshold(config.unauthorized_spend_threshold)
    }

    pub fn with_time_unit_divisor(mut self, divisor: u32) -> Self {
        self.time_unit_divisor = divisor;
        self
    }

    pub fn with_unauthorized_threshold(mut self, threshold: Option<f64>) -> Self {
        self.unauthorized_spend_threshold = threshold;
        self
    }

    pub fn with_steps(mut self, steps: AggregationSteps) -> Self {
        self.steps = steps;
        self
    }

    /// Run the full pipeline over a transaction table.
    pub fn aggregate(&self, table: &TransactionTable) -> RetentionResult<RfmSummary> {
        if self.time_unit_divisor == 0 {
            return Err(RetentionError::Configuration("time_unit_divisor must be > 0".into()));
        }
        if self.calibration_boundary == 0 {
            return Err(RetentionError::Configuration("calibration_boundary must be >= 1".into()));
        }

        let prepared = prepare(table, &self.date_format)?;
        let last_day = prepared.iter().map(|t| t.purch_day).max().unwrap_or(1);
        if self.calibration_boundary > last_day {
            return Err(RetentionError::Configuration(format!(
                "calibration boundary {} is beyond the observed range 1..={last_day}",
                self.calibration_boundary
            )));
        }

        let (eligible, late_trial_customers) = self.split_late_trials(prepared);
        if !late_trial_customers.is_empty() {
            log::warn!(
                "rfm: {} customers have their trial after day {} and are reported separately",
                late_trial_customers.len(),
                self.calibration_boundary
            );
        }

        let boundary = self.calibration_boundary;
        let freq = (self.steps.frequency)(&eligible, boundary);
        let spend_quant = (self.steps.spend_quant)(&eligible, &freq, boundary);
        let avg_spend = (self.steps.avg_spend)(&spend_quant, &freq);
        let recency = (self.steps.recency)(&eligible, &freq, boundary, self.time_unit_divisor);

        let mut records = combine(freq, spend_quant, avg_spend, recency)?;

        let mut removed_resellers = Vec::new();
        if let Some(threshold) = self.unauthorized_spend_threshold {
            let (kept, removed) = filter_unauthorized(records, threshold);
            records = kept;
            removed_resellers = removed;
        }

        log::info!(
            "rfm: {} customers aggregated (boundary day {}, unit {} days)",
            records.len(),
            boundary,
            self.time_unit_divisor
        );

        Ok(RfmSummary { records, late_trial_customers, removed_resellers })
    }

    fn split_late_trials(&self, prepared: Vec<PreparedTransaction>) -> (Vec<PreparedTransaction>, Vec<CustomerId>) {
        let late: Vec<CustomerId> = customer_slices(&prepared)
            .filter(|txns| txns[0].purch_day > self.calibration_boundary)
            .map(|txns| txns[0].customer_id.clone())
            .collect();
        if late.is_empty() {
            return (prepared, late);
        }
        let excluded: BTreeSet<&CustomerId> = late.iter().collect();
        let eligible = prepared
            .into_iter()
            .filter(|t| !excluded.contains(&t.customer_id))
            .collect();
        (eligible, late)
    }
}

/// Aggregate with the default time unit (weeks) and no reseller filter.
pub fn aggregate(
    table: &TransactionTable,
    date_format: &str,
    calibration_boundary: PurchDay,
) -> RetentionResult<RfmSummary> {
    RfmAggregator::new(date_format, calibration_boundary).aggregate(table)
}

fn combine(
    freq: Vec<Frequency>,
    spend_quant: Vec<SpendQuant>,
    avg_spend: Vec<AvgSpend>,
    recency: Vec<Recency>,
) -> RetentionResult<Vec<RfmRecord>> {
    if spend_quant.len() != freq.len() || avg_spend.len() != freq.len() || recency.len() != freq.len() {
        return Err(RetentionError::InvalidData(format!(
            "aggregation steps disagree on customer count: {} / {} / {} / {}",
            freq.len(),
            spend_quant.len(),
            avg_spend.len(),
            recency.len()
        )));
    }

    freq.into_iter()
        .zip(spend_quant)
        .zip(avg_spend)
        .zip(recency)
        .map(|(((f, sq), avg), rec)| {
            if sq.customer_id != f.customer_id
                || avg.customer_id != f.customer_id
                || rec.customer_id != f.customer_id
            {
                return Err(RetentionError::InvalidData(format!(
                    "aggregation steps out of order at customer '{}'",
                    f.customer_id
                )));
            }
            let zbar = if f.p1x > 0 { avg.m_x_calib } else { 0.0 };
            Ok(RfmRecord {
                customer_id:     f.customer_id,
                p1x:             f.p1x,
                p2x:             f.p2x,
                t_x:             rec.t_x,
                t_cal:           rec.t_cal,
                p1rec:           rec.p1rec,
                p1x_spend_cents: sq.p1x_spend_cents,
                p1x_quant:       sq.p1x_quant,
                p2x_spend_cents: sq.p2x_spend_cents,
                p2x_quant:       sq.p2x_quant,
                m_x_calib:       avg.m_x_calib,
                m_x_valid:       avg.m_x_valid,
                zbar,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;

    fn table(rows: &[(&str, &str, i64, f64)]) -> TransactionTable {
        TransactionTable::new(
            rows.iter()
                .map(|(id, date, q, s)| Transaction::new(*id, *date, *q, *s))
                .collect(),
        )
    }

    #[test]
    fn customer_key_orders_numeric_ids_numerically() {
        let mut keys = vec![CustomerKey::new("10"), CustomerKey::new("9"), CustomerKey::new("abc")];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                CustomerKey::Numeric(9, "9".into()),
                CustomerKey::Numeric(10, "10".into()),
                CustomerKey::Text("abc".into()),
            ]
        );
        assert_ne!(CustomerKey::new("007"), CustomerKey::new("7"));
    }

    #[test]
    fn same_day_rows_merge_before_dor() {
        let t = table(&[
            ("1", "19970101", 1, 10.00),
            ("1", "19970101", 2, 5.25),
            ("1", "19970105", 1, 3.10),
        ]);
        let prepared = prepare(&t, "%Y%m%d").unwrap();
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].quantity, 3);
        assert_eq!(prepared[0].spend_cents, 1525);
        assert_eq!(prepared[0].dor, 0);
        assert_eq!(prepared[1].dor, 1);
        assert_eq!(prepared[1].purch_day, 5);
    }

    #[test]
    fn custom_step_replaces_default() {
        fn no_holdout(prepared: &[PreparedTransaction], boundary: PurchDay) -> Vec<Frequency> {
            compute_frequency(prepared, boundary)
                .into_iter()
                .map(|f| Frequency { p2x: 0, ..f })
                .collect()
        }

        let t = table(&[
            ("1", "19970101", 1, 1.0),
            ("1", "19970103", 1, 1.0),
            ("1", "19970120", 1, 1.0),
        ]);
        let steps = AggregationSteps { frequency: no_holdout, ..AggregationSteps::default() };
        let summary = RfmAggregator::new("%Y%m%d", 10).with_steps(steps).aggregate(&t).unwrap();
        assert_eq!(summary.records[0].p1x, 1);
        assert_eq!(summary.records[0].p2x, 0);
    }

    #[test]
    fn late_trial_customers_are_split_out_wherever_they_sort() {
        let t = table(&[
            ("1", "19970101", 1, 1.0),
            ("1", "19970104", 1, 1.0),
            ("2", "19970115", 1, 1.0),
            ("3", "19970102", 1, 1.0),
            ("3", "19970120", 1, 1.0),
            ("4", "19970112", 1, 1.0),
            ("4", "19970113", 1, 1.0),
        ]);
        let summary = RfmAggregator::new("%Y%m%d", 10).aggregate(&t).unwrap();
        let kept: Vec<&str> = summary.records.iter().map(|r| r.customer_id.as_str()).collect();
        assert_eq!(kept, vec!["1", "3"]);
        assert_eq!(summary.late_trial_customers, vec!["2".to_string(), "4".to_string()]);
    }
}
