//! Contractual cohort retention series: customers still active per renewal period.
//!
//! Row 0 is the full cohort at acquisition. Periods are contiguous and the
//! alive count never increases.

use crate::error::{RetentionError, RetentionResult};
use serde::{Deserialize, Serialize};
use std::io::Read;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortRetentionTable {
    alive: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct CohortRow {
    period:          f64,
    customers_alive: f64,
}

impl CohortRetentionTable {
    /// Build from alive counts indexed by period (index 0 = period 0).
    pub fn from_alive(alive: Vec<f64>) -> RetentionResult<Self> {
        if alive.is_empty() {
            return Err(RetentionError::InsufficientData { model: "cohort", required: 1, actual: 0 });
        }
        for (period, &count) in alive.iter().enumerate() {
            if !count.is_finite() || count < 0.0 {
                return Err(RetentionError::InvalidData(format!(
                    "period {period}: customers_alive must be a non-negative number, got {count}"
                )));
            }
            if period > 0 && count > alive[period - 1] {
                return Err(RetentionError::InvalidData(format!(
                    "period {period}: customers_alive rose from {} to {count}",
                    alive[period - 1]
                )));
            }
        }
        if alive[0] <= 0.0 {
            return Err(RetentionError::InvalidData("period 0 cohort size must be positive".into()));
        }
        Ok(Self { alive })
    }

    /// Build from explicit `(period, alive)` columns; periods must read 0, 1, 2, ...
    pub fn from_columns(periods: &[u32], alive: &[f64]) -> RetentionResult<Self> {
        if periods.len() != alive.len() {
            return Err(RetentionError::InvalidData(format!(
                "{} periods but {} alive counts",
                periods.len(),
                alive.len()
            )));
        }
        for (expected, &period) in periods.iter().enumerate() {
            if period as usize != expected {
                return Err(RetentionError::InvalidData(format!(
                    "expected period {expected}, found {period}"
                )));
            }
        }
        Self::from_alive(alive.to_vec())
    }

    /// Read `period,customers_alive` rows with a header line.
    pub fn from_csv_reader<R: Read>(reader: R) -> RetentionResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut alive = Vec::new();
        for (index, row) in csv_reader.deserialize::<CohortRow>().enumerate() {
            let row = row?;
            if row.period != index as f64 {
                return Err(RetentionError::InvalidData(format!(
                    "row {}: expected period {index}, found {}",
                    index + 1,
                    row.period
                )));
            }
            alive.push(row.customers_alive);
        }
        Self::from_alive(alive)
    }

    pub fn alive(&self) -> &[f64] {
        &self.alive
    }

    pub fn cohort_size(&self) -> f64 {
        self.alive[0]
    }

    /// Number of observed periods, period 0 included.
    pub fn len(&self) -> usize {
        self.alive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }

    /// Last period index observed.
    pub fn horizon(&self) -> usize {
        self.alive.len() - 1
    }

    /// Customers lost between period t-1 and t, for t = 1..=horizon.
    pub fn lost(&self) -> Vec<f64> {
        self.alive.windows(2).map(|w| w[0] - w[1]).collect()
    }

    /// Prefix holding period 0 and the first `renewal_periods` renewals.
    pub fn training(&self, renewal_periods: usize) -> RetentionResult<Self> {
        if renewal_periods + 1 > self.alive.len() {
            return Err(RetentionError::InsufficientData {
                model:    "cohort",
                required: renewal_periods + 1,
                actual:   self.alive.len(),
            });
        }
        Ok(Self { alive: self.alive[..=renewal_periods].to_vec() })
    }
}
