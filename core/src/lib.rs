pub mod cohort;
pub mod config;
pub mod error;
pub mod fit;
pub mod heterogeneity;
pub mod incidence;
pub mod model_selection;
pub mod optimizer;
pub mod rfm_aggregator;
pub mod rng;
pub mod sbbgb_model;
pub mod sbg_model;
pub mod simulate;
pub mod transaction;
pub mod types;
