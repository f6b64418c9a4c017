use thiserror::Error;

#[derive(Error, Debug)]
pub enum RetentionError {
    #[error("Parse error at row {row} (customer '{customer_id}'): {message}")]
    Parse {
        row:         usize,
        customer_id: String,
        message:     String,
    },

    #[error("Insufficient data for {model}: need at least {required}, got {actual}")]
    InsufficientData {
        model:    &'static str,
        required: usize,
        actual:   usize,
    },

    #[error("Model divergence in {model} after {iterations} iterations at {params:?}: {reason}")]
    ModelDivergence {
        model:      &'static str,
        reason:     String,
        params:     Vec<f64>,
        iterations: usize,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RetentionError {
    /// Likelihood undefined at a fixed parameter point (no optimizer involved).
    pub fn divergence(model: &'static str, reason: impl Into<String>, params: &[f64]) -> Self {
        Self::ModelDivergence {
            model,
            reason: reason.into(),
            params: params.to_vec(),
            iterations: 0,
        }
    }

    pub fn is_divergence(&self) -> bool {
        matches!(self, Self::ModelDivergence { .. })
    }
}

pub type RetentionResult<T> = Result<T, RetentionError>;
