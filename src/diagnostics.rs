//! Calibration check: observed vs model-implied purchase-count histogram.

use std::fmt;

use crate::model::{BetaGeoModel, PurchaseHistory};

/// One histogram bar; `purchases == None` is the overflow bar
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodBucket {
    pub purchases: Option<u32>,
    pub actual: usize,
    pub expected: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodTransactions {
    pub buckets: Vec<PeriodBucket>,
    pub customers: usize,
}

impl PeriodTransactions {
    /// Largest gap between observed and expected customer counts.
    pub fn max_abs_error(&self) -> f64 {
        self.buckets
            .iter()
            .map(|b| (b.actual as f64 - b.expected).abs())
            .fold(0.0, f64::max)
    }
}

/// Count customers by purchase frequency in `0..max_purchases` plus an
/// overflow bucket, next to the count the model expects when every customer
/// is observed over their own age.
pub fn period_transactions(
    model: &BetaGeoModel,
    histories: &[PurchaseHistory],
    max_purchases: u32,
) -> PeriodTransactions {
    let mut buckets: Vec<PeriodBucket> = (0..max_purchases)
        .map(|n| PeriodBucket {
            purchases: Some(n),
            actual: 0,
            expected: 0.0,
        })
        .collect();
    buckets.push(PeriodBucket {
        purchases: None,
        actual: 0,
        expected: 0.0,
    });
    let overflow = max_purchases as usize;

    for history in histories {
        let observed = history.frequency.max(0.0) as usize;
        buckets[observed.min(overflow)].actual += 1;

        let mut covered = 0.0;
        for (n, bucket) in buckets.iter_mut().take(overflow).enumerate() {
            let p = model.probability_of_purchases(history.age, n as u32);
            bucket.expected += p;
            covered += p;
        }
        buckets[overflow].expected += (1.0 - covered).max(0.0);
    }

    log::debug!(
        "Period transactions over {} customers in {} buckets",
        histories.len(),
        buckets.len()
    );

    PeriodTransactions {
        buckets,
        customers: histories.len(),
    }
}

impl fmt::Display for PeriodTransactions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>10} {:>10} {:>10}", "purchases", "actual", "model")?;
        for bucket in &self.buckets {
            let label = match bucket.purchases {
                Some(n) => n.to_string(),
                None => format!("{}+", self.buckets.len() - 1),
            };
            writeln!(f, "{:>10} {:>10} {:>10.1}", label, bucket.actual, bucket.expected)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BetaGeoParams;

    fn cdnow() -> BetaGeoModel {
        BetaGeoModel::from_params(BetaGeoParams {
            r: 0.243,
            alpha: 4.414,
            a: 0.793,
            b: 2.426,
        })
    }

    #[test]
    fn test_histogram_totals_match_customer_count() {
        let histories: Vec<PurchaseHistory> = (0..30u32)
            .map(|i| PurchaseHistory {
                frequency: f64::from(i % 9),
                recency: f64::from(i % 9),
                age: 20.0 + f64::from(i),
            })
            .collect();

        let table = period_transactions(&cdnow(), &histories, 7);
        assert_eq!(table.buckets.len(), 8);
        assert_eq!(table.customers, 30);

        let actual: usize = table.buckets.iter().map(|b| b.actual).sum();
        assert_eq!(actual, 30);
        let expected: f64 = table.buckets.iter().map(|b| b.expected).sum();
        assert!((expected - 30.0).abs() < 1e-6);

        // frequencies 7 and 8 fall into the overflow bucket
        assert_eq!(table.buckets[7].actual, 6);
        assert_eq!(table.buckets[7].purchases, None);
        assert!(table.to_string().contains("7+"));
    }

    #[test]
    fn test_zero_purchases_dominate_for_cdnow_like_cohort() {
        let histories: Vec<PurchaseHistory> = (0..10)
            .map(|_| PurchaseHistory {
                frequency: 0.0,
                recency: 0.0,
                age: 39.0,
            })
            .collect();
        let table = period_transactions(&cdnow(), &histories, 5);
        let zero = &table.buckets[0];
        assert_eq!(zero.actual, 10);
        assert!(zero.expected > table.buckets[1].expected);
        assert!(table.max_abs_error() < 10.0);
    }
}
