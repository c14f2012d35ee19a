//! Pipeline settings, loadable from TOML and overridden by CLI flags.

use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::clv::ValueHorizon;
use crate::error::{CltvError, CltvResult};
use crate::model::{FitOptions, OptimizerSettings};
use crate::segment::MAX_BUCKETS;

/// What to do with customers whose summary breaks an invariant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    /// Fail the run on the first invalid customer
    #[default]
    Strict,
    /// Drop invalid customers and report them
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Reference instant for recency and age; purchases after it are invalid
    pub analysis_cutoff: NaiveDateTime,
    /// Days per model time unit (7 = weeks)
    pub time_unit_days: f64,
    /// Windows, in time units, for the expected-purchase columns
    pub purchase_horizons: Vec<u32>,
    /// Number of discounting periods in the CLV horizon
    pub horizon_periods: u32,
    /// Time units per discounting period
    pub period_length: f64,
    pub discount_rate: f64,
    pub count_penalizer: f64,
    pub monetary_penalizer: f64,
    /// Number of CLV segments
    pub segments: usize,
    /// Score levels per RFM dimension
    pub rfm_segments: usize,
    /// Margin used by the historical CLTV formula
    pub profit_rate: f64,
    pub validation: ValidationPolicy,
    pub optimizer: OptimizerSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analysis_cutoff: NaiveDate::from_ymd_opt(2011, 12, 11)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap_or_default(),
            time_unit_days: 7.0,
            purchase_horizons: vec![1, 4, 12],
            horizon_periods: 3,
            period_length: 4.345,
            discount_rate: 0.01,
            count_penalizer: 0.001,
            monetary_penalizer: 0.01,
            segments: 4,
            rfm_segments: 5,
            profit_rate: 0.10,
            validation: ValidationPolicy::Strict,
            optimizer: OptimizerSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Read a TOML file; keys left out keep their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CltvResult<()> {
        let positive = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(CltvError::InvalidConfig(format!("{name} must be positive, got {value}")))
            }
        };
        let non_negative = |name: &str, value: f64| {
            if value.is_finite() && value >= 0.0 {
                Ok(())
            } else {
                Err(CltvError::InvalidConfig(format!("{name} must be non-negative, got {value}")))
            }
        };

        positive("time_unit_days", self.time_unit_days)?;
        positive("period_length", self.period_length)?;
        non_negative("discount_rate", self.discount_rate)?;
        non_negative("count_penalizer", self.count_penalizer)?;
        non_negative("monetary_penalizer", self.monetary_penalizer)?;
        positive("profit_rate", self.profit_rate)?;
        positive("optimizer.x_tolerance", self.optimizer.x_tolerance)?;
        positive("optimizer.f_tolerance", self.optimizer.f_tolerance)?;

        if self.segments == 0 || self.segments > MAX_BUCKETS {
            return Err(CltvError::InvalidConfig(format!(
                "segments must be between 1 and {MAX_BUCKETS}, got {}",
                self.segments
            )));
        }
        if self.rfm_segments != 5 {
            return Err(CltvError::InvalidConfig(format!(
                "rfm_segments must be 5, got {}",
                self.rfm_segments
            )));
        }
        if self.optimizer.max_iterations == 0 {
            return Err(CltvError::InvalidConfig(
                "optimizer.max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn count_fit_options(&self) -> FitOptions {
        FitOptions {
            penalizer: self.count_penalizer,
            optimizer: self.optimizer,
        }
    }

    pub fn monetary_fit_options(&self) -> FitOptions {
        FitOptions {
            penalizer: self.monetary_penalizer,
            optimizer: self.optimizer,
        }
    }

    pub fn value_horizon(&self) -> ValueHorizon {
        ValueHorizon {
            periods: self.horizon_periods,
            period_length: self.period_length,
            discount_rate: self.discount_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.purchase_horizons, vec![1, 4, 12]);
        assert_eq!(config.validation, ValidationPolicy::Strict);
        assert_eq!(config.analysis_cutoff.to_string(), "2011-12-11 00:00:00");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "analysis_cutoff = \"2011-06-01T00:00:00\"").unwrap();
        writeln!(file, "segments = 5").unwrap();
        writeln!(file, "validation = \"lenient\"").unwrap();
        writeln!(file, "[optimizer]").unwrap();
        writeln!(file, "max_iterations = 500").unwrap();

        let config = PipelineConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.segments, 5);
        assert_eq!(config.validation, ValidationPolicy::Lenient);
        assert_eq!(config.optimizer.max_iterations, 500);
        assert_eq!(config.optimizer.x_tolerance, 1e-6);
        assert_eq!(config.discount_rate, 0.01);
        assert_eq!(config.analysis_cutoff.to_string(), "2011-06-01 00:00:00");
    }

    #[test]
    fn test_out_of_domain_settings_are_rejected() {
        let mut config = PipelineConfig::default();
        config.segments = 0;
        assert!(matches!(config.validate(), Err(CltvError::InvalidConfig(_))));

        let mut config = PipelineConfig::default();
        config.time_unit_days = -7.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.rfm_segments = 4;
        assert!(config.validate().is_err());

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "discount_rate = -0.5").unwrap();
        assert!(PipelineConfig::from_toml_file(file.path()).is_err());
    }
}
