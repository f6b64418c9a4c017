//! Transaction log input.
//!
//! The aggregator only needs a conforming table of
//! `{customer_id, date, quantity, spend}` rows; source-specific loaders
//! hand it one. The CSV reader here covers headerless CDNOW-style files
//! and files with a header row.

use crate::{
    error::{RetentionError, RetentionResult},
    types::CustomerId,
};
use serde::{Deserialize, Serialize};
use std::io::Read;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub customer_id: CustomerId,
    /// Unparsed date string; parsed by the aggregator with the configured format.
    pub date:        String,
    pub quantity:    i64,
    pub spend:       f64,
}

impl Transaction {
    pub fn new(customer_id: impl Into<CustomerId>, date: impl Into<String>, quantity: i64, spend: f64) -> Self {
        Self {
            customer_id: customer_id.into(),
            date:        date.into(),
            quantity,
            spend,
        }
    }
}

/// Column positions of the four required fields in a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionColumns {
    pub customer_id: usize,
    pub date:        usize,
    pub quantity:    usize,
    pub spend:       usize,
}

impl Default for TransactionColumns {
    fn default() -> Self {
        Self { customer_id: 0, date: 1, quantity: 2, spend: 3 }
    }
}

impl TransactionColumns {
    /// CDNOW sample layout: a leading sample-customer column precedes the id.
    pub fn cdnow_sample() -> Self {
        Self { customer_id: 1, date: 2, quantity: 3, spend: 4 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionTable {
    rows: Vec<Transaction>,
}

impl TransactionTable {
    pub fn new(rows: Vec<Transaction>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Transaction] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Read a comma-separated transaction log.
    ///
    /// Fails on the first malformed row; the whole read is aborted rather
    /// than skipping rows.
    pub fn from_csv_reader<R: Read>(
        reader: R,
        has_header: bool,
        columns: TransactionColumns,
    ) -> RetentionResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(has_header)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut rows = Vec::new();
        for (index, record) in csv_reader.records().enumerate() {
            let record = record?;
            let row = index + 1;

            let field = |position: usize, label: &str, customer_id: &str| {
                record.get(position).ok_or_else(|| RetentionError::Parse {
                    row,
                    customer_id: customer_id.to_string(),
                    message: format!("missing {label} column (index {position})"),
                })
            };

            let customer_id = field(columns.customer_id, "customer_id", "")?.to_string();
            if customer_id.is_empty() {
                return Err(RetentionError::Parse {
                    row,
                    customer_id,
                    message: "empty customer_id".into(),
                });
            }
            let date = field(columns.date, "date", &customer_id)?.to_string();

            let quantity_raw = field(columns.quantity, "quantity", &customer_id)?;
            let quantity: i64 = quantity_raw.parse().map_err(|_| RetentionError::Parse {
                row,
                customer_id: customer_id.clone(),
                message: format!("non-numeric quantity '{quantity_raw}'"),
            })?;

            let spend_raw = field(columns.spend, "spend", &customer_id)?;
            let spend: f64 = spend_raw
                .parse()
                .ok()
                .filter(|v: &f64| v.is_finite())
                .ok_or_else(|| RetentionError::Parse {
                    row,
                    customer_id: customer_id.clone(),
                    message: format!("non-numeric spend '{spend_raw}'"),
                })?;

            rows.push(Transaction { customer_id, date, quantity, spend });
        }

        log::debug!("transaction table: read {} rows", rows.len());
        Ok(Self { rows })
    }
}
