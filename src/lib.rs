//! CltvForge: customer lifetime value forecasting for retail transaction logs
//!
//! Transactions are aggregated into per-customer recency/frequency/monetary
//! summaries, a BG/NBD purchase-count model and a Gamma-Gamma spend model are
//! fitted on the repeat customers, and their forecasts are combined into a
//! discounted lifetime value that is split into quantile segments. A
//! deterministic historical CLTV and rule-based RFM scoring are available as
//! alternative modes.

pub mod cli;
pub mod clv;
pub mod config;
pub mod data;
pub mod diagnostics;
pub mod error;
pub mod historical;
pub mod model;
pub mod pipeline;
pub mod rfm;
pub mod segment;
pub mod summary;

// Re-export public items for easier access
pub use cli::{Args, Mode};
pub use clv::{customer_lifetime_value, ValueHorizon};
pub use config::{PipelineConfig, ValidationPolicy};
pub use data::{load_transactions, CustomerId, IngestOptions, TransactionRecord};
pub use error::{CltvError, CltvResult};
pub use model::{BetaGeoModel, CountModel, GammaGammaModel, MonetaryModel, PurchaseHistory};
pub use pipeline::{top_expected_purchasers, CltvPipeline, CltvReport, CustomerValue};
pub use segment::{quantile_segments, Segmentation, Tier};
pub use summary::CustomerSummary;

/// Common result type used at the I/O edges of the application
pub type Result<T> = anyhow::Result<T>;
