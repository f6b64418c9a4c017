//! Discrete-time purchase incidence: one 0/1 indicator per customer per
//! transaction opportunity, and the RFM summaries the S_BB-G/B model fits on.
//!
//! Panel layout per row: optional customer id, the acquisition period
//! (always 1 for a cohort member), then one column per opportunity.
//! The first `calibration_periods` opportunities form the calibration
//! window; the rest are holdout.

use crate::{
    error::{RetentionError, RetentionResult},
    types::CustomerId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidencePanel {
    customer_ids:        Vec<CustomerId>,
    /// Indicators per customer, acquisition column excluded.
    opportunities:       Vec<Vec<bool>>,
    calibration_periods: usize,
}

/// Per-customer discrete RFM summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscreteRfm {
    pub customer_id: CustomerId,
    pub p1x:         u32,
    /// Opportunity index (1-based) of the last calibration purchase, 0 if none.
    pub t_x:         u32,
    pub n_p1x:       u32,
    pub p2x:         u32,
    pub n_p2x:       u32,
}

/// Customers sharing `(P1X, t_x, n)`; the weight is usually a head count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationGroup {
    pub p1x:    u32,
    pub t_x:    u32,
    pub n:      u32,
    pub weight: f64,
}

impl CalibrationGroup {
    pub fn new(p1x: u32, t_x: u32, n: u32, weight: f64) -> Self {
        Self { p1x, t_x, n, weight }
    }
}

/// Customers sharing `(P2X, n*)` in the holdout window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HoldoutGroup {
    pub p2x:   u32,
    pub n:     u32,
    pub count: u64,
}

impl IncidencePanel {
    pub fn new(
        customer_ids: Vec<CustomerId>,
        opportunities: Vec<Vec<bool>>,
        calibration_periods: usize,
    ) -> RetentionResult<Self> {
        if customer_ids.len() != opportunities.len() {
            return Err(RetentionError::InvalidData(format!(
                "{} customer ids for {} panel rows",
                customer_ids.len(),
                opportunities.len()
            )));
        }
        let width = opportunities.first().map(Vec::len).unwrap_or(0);
        if let Some((row, bad)) = opportunities.iter().enumerate().find(|(_, r)| r.len() != width) {
            return Err(RetentionError::InvalidData(format!(
                "panel row {} has {} opportunities, expected {width}",
                row + 1,
                bad.len()
            )));
        }
        if calibration_periods == 0 || calibration_periods > width {
            return Err(RetentionError::Configuration(format!(
                "calibration_periods {calibration_periods} outside 1..={width}"
            )));
        }
        Ok(Self { customer_ids, opportunities, calibration_periods })
    }

    /// Read a headerless 0/1 panel. With `has_id_column` the first field is
    /// the customer id; otherwise ids are the 1-based row numbers.
    pub fn from_csv_reader<R: Read>(
        reader: R,
        has_id_column: bool,
        calibration_periods: usize,
    ) -> RetentionResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut customer_ids = Vec::new();
        let mut opportunities = Vec::new();
        for (index, record) in csv_reader.records().enumerate() {
            let record = record?;
            let row = index + 1;
            let mut fields = record.iter();

            let customer_id = if has_id_column {
                fields.next().unwrap_or_default().to_string()
            } else {
                row.to_string()
            };

            let mut indicators = Vec::with_capacity(record.len());
            for raw in fields {
                let flag = match raw {
                    "0" => false,
                    "1" => true,
                    other => {
                        return Err(RetentionError::Parse {
                            row,
                            customer_id,
                            message: format!("incidence indicator must be 0 or 1, got '{other}'"),
                        })
                    }
                };
                indicators.push(flag);
            }
            if indicators.is_empty() {
                return Err(RetentionError::Parse {
                    row,
                    customer_id,
                    message: "missing acquisition column".into(),
                });
            }
            // Drop the acquisition column.
            indicators.remove(0);

            customer_ids.push(customer_id);
            opportunities.push(indicators);
        }

        log::debug!("incidence panel: read {} customers", customer_ids.len());
        Self::new(customer_ids, opportunities, calibration_periods)
    }

    pub fn len(&self) -> usize {
        self.customer_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.customer_ids.is_empty()
    }

    pub fn calibration_periods(&self) -> usize {
        self.calibration_periods
    }

    pub fn holdout_periods(&self) -> usize {
        self.opportunities.first().map(Vec::len).unwrap_or(0) - self.calibration_periods
    }

    pub fn rows(&self) -> impl Iterator<Item = (&CustomerId, &[bool])> {
        self.customer_ids.iter().zip(self.opportunities.iter().map(Vec::as_slice))
    }

    pub fn rfm(&self) -> Vec<DiscreteRfm> {
        let n_p1x = self.calibration_periods as u32;
        let n_p2x = self.holdout_periods() as u32;
        self.rows()
            .map(|(id, row)| {
                let (calib, holdout) = row.split_at(self.calibration_periods);
                let t_x = calib
                    .iter()
                    .rposition(|&bought| bought)
                    .map(|i| i as u32 + 1)
                    .unwrap_or(0);
                DiscreteRfm {
                    customer_id: id.clone(),
                    p1x:         calib.iter().filter(|&&b| b).count() as u32,
                    t_x,
                    n_p1x,
                    p2x:         holdout.iter().filter(|&&b| b).count() as u32,
                    n_p2x,
                }
            })
            .collect()
    }
}

/// Collapse customers into `(P1X, t_x, n)` groups, sorted by t_x then P1X,
/// both descending.
pub fn calibration_groups(records: &[DiscreteRfm]) -> Vec<CalibrationGroup> {
    let mut counts: BTreeMap<(u32, u32, u32), u64> = BTreeMap::new();
    for r in records {
        *counts.entry((r.t_x, r.p1x, r.n_p1x)).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .rev()
        .map(|((t_x, p1x, n), count)| CalibrationGroup::new(p1x, t_x, n, count as f64))
        .collect()
}

/// Collapse customers into `(P2X, n*)` groups, sorted by P2X descending.
pub fn holdout_groups(records: &[DiscreteRfm]) -> Vec<HoldoutGroup> {
    let mut counts: BTreeMap<(u32, u32), u64> = BTreeMap::new();
    for r in records {
        *counts.entry((r.p2x, r.n_p2x)).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .rev()
        .map(|((p2x, n), count)| HoldoutGroup { p2x, n, count })
        .collect()
}
