//! Command-line interface definitions and argument parsing

use chrono::{NaiveDate, NaiveDateTime};
use clap::{Parser, ValueEnum};

use crate::config::{PipelineConfig, ValidationPolicy};
use crate::data::IngestOptions;
use crate::model::PurchaseHistory;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// BG/NBD + Gamma-Gamma forecast
    Probabilistic,
    /// Observed spend and cohort churn rate
    Historical,
    /// Rule-based recency/frequency/monetary segments
    Rfm,
}

/// Customer lifetime value forecasting and segmentation for transaction logs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the input CSV file
    #[arg(short, long, default_value = "data.csv")]
    pub input: String,

    /// Analysis cutoff, `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS`
    #[arg(long)]
    pub cutoff: Option<String>,

    /// TOML file with pipeline settings; flags override it
    #[arg(short, long)]
    pub config: Option<String>,

    #[arg(short, long, value_enum, default_value_t = Mode::Probabilistic)]
    pub mode: Mode,

    /// Write the per-customer table to this CSV file
    #[arg(short, long)]
    pub output: Option<String>,

    /// Number of value segments
    #[arg(short = 'k', long)]
    pub segments: Option<usize>,

    /// CLV horizon in months
    #[arg(long)]
    pub horizon: Option<u32>,

    /// Monthly discount rate
    #[arg(long)]
    pub discount_rate: Option<f64>,

    /// L2 penalty for the purchase-count model
    #[arg(long)]
    pub count_penalizer: Option<f64>,

    /// L2 penalty for the spend model
    #[arg(long)]
    pub monetary_penalizer: Option<f64>,

    /// Drop invalid rows and customers instead of failing
    #[arg(long)]
    pub lenient: bool,

    /// Keep quantity and price outliers as they are
    #[arg(long)]
    pub no_clamp: bool,

    /// Number of customers in the top-purchasers listing
    #[arg(long, default_value = "10")]
    pub top: usize,

    /// Prediction mode: provide frequency,recency,age,monetary as comma-separated string
    /// Example: --predict "5,20.5,30,42.0" (recency and age in weeks)
    #[arg(short, long)]
    pub predict: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Purchase history and average spend given on the command line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub history: PurchaseHistory,
    pub monetary: f64,
}

impl Args {
    /// Parse the predict string
    /// Expected format: "frequency,recency,age,monetary"
    pub fn parse_prediction(&self) -> crate::Result<Option<Prediction>> {
        let Some(ref predict_str) = self.predict else {
            return Ok(None);
        };
        let parts: Vec<&str> = predict_str.split(',').collect();
        if parts.len() != 4 {
            anyhow::bail!("Predict values must be in format 'frequency,recency,age,monetary'");
        }

        let field = |i: usize, name: &str| -> crate::Result<f64> {
            parts[i]
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid {} value: {}", name, parts[i]))
        };
        let frequency = field(0, "frequency")?;
        let recency = field(1, "recency")?;
        let age = field(2, "age")?;
        let monetary = field(3, "monetary")?;

        Ok(Some(Prediction {
            history: PurchaseHistory {
                frequency,
                recency,
                age,
            },
            monetary,
        }))
    }

    pub fn parse_cutoff(&self) -> crate::Result<Option<NaiveDateTime>> {
        let Some(ref raw) = self.cutoff else {
            return Ok(None);
        };
        let raw = raw.trim();
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
            return Ok(Some(ts));
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("Invalid cutoff: {raw}"))
    }

    /// Settings from `--config` (or defaults) with the flags applied on top.
    pub fn pipeline_config(&self) -> crate::Result<PipelineConfig> {
        let mut config = match self.config {
            Some(ref path) => PipelineConfig::from_toml_file(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(cutoff) = self.parse_cutoff()? {
            config.analysis_cutoff = cutoff;
        }
        if let Some(segments) = self.segments {
            config.segments = segments;
        }
        if let Some(horizon) = self.horizon {
            config.horizon_periods = horizon;
        }
        if let Some(rate) = self.discount_rate {
            config.discount_rate = rate;
        }
        if let Some(penalizer) = self.count_penalizer {
            config.count_penalizer = penalizer;
        }
        if let Some(penalizer) = self.monetary_penalizer {
            config.monetary_penalizer = penalizer;
        }
        if self.lenient {
            config.validation = ValidationPolicy::Lenient;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn ingest_options(&self, config: &PipelineConfig) -> IngestOptions {
        IngestOptions {
            policy: config.validation,
            clamp_outliers: !self.no_clamp,
        }
    }
}
