//! Transaction aggregation: one immutable summary row per customer.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::config::ValidationPolicy;
use crate::data::{CustomerId, TransactionRecord};
use crate::error::{CltvError, CltvResult};
use crate::model::PurchaseHistory;

/// Per-customer metrics derived once from the full transaction set
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerSummary {
    pub customer_id: CustomerId,
    /// Time between first and last purchase event, in time units
    pub recency: f64,
    /// Time between first purchase and the analysis cutoff (T), in time units
    pub age: f64,
    /// Number of distinct purchase events (invoices)
    pub frequency: u32,
    /// Average spend per purchase event
    pub monetary: f64,
    /// Spend across all purchase events
    pub total_spend: f64,
    pub first_purchase: NaiveDateTime,
    pub last_purchase: NaiveDateTime,
}

impl CustomerSummary {
    /// Only customers with more than one purchase event carry information
    /// about repeat behaviour.
    pub fn is_repeat_customer(&self) -> bool {
        self.frequency > 1
    }

    pub fn history(&self) -> PurchaseHistory {
        PurchaseHistory {
            frequency: f64::from(self.frequency),
            recency: self.recency,
            age: self.age,
        }
    }

    /// Check `age >= recency >= 0` and a positive average spend.
    pub fn validate(&self) -> CltvResult<()> {
        let invalid = |reason: String| CltvError::InvalidSummary {
            customer_id: self.customer_id,
            reason,
        };
        if !self.recency.is_finite() || self.recency < 0.0 {
            return Err(invalid(format!("negative recency {}", self.recency)));
        }
        if !self.age.is_finite() || self.age < self.recency {
            return Err(invalid(format!(
                "age {} is smaller than recency {} (purchase after the analysis cutoff?)",
                self.age, self.recency
            )));
        }
        if !(self.monetary.is_finite() && self.monetary > 0.0) {
            return Err(invalid(format!("non-positive monetary value {}", self.monetary)));
        }
        Ok(())
    }
}

/// A customer removed in lenient mode, with the reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedCustomer {
    pub customer_id: CustomerId,
    pub reason: String,
}

/// Summaries that passed validation plus whatever lenient mode removed
#[derive(Debug, Clone, Default)]
pub struct ValidatedSummaries {
    pub summaries: Vec<CustomerSummary>,
    pub dropped: Vec<DroppedCustomer>,
}

#[derive(Default)]
struct Accumulator {
    invoices: BTreeSet<String>,
    first: Option<NaiveDateTime>,
    last: Option<NaiveDateTime>,
    spend: f64,
}

/// Group records by customer and compute recency, age, frequency and
/// monetary value relative to `cutoff`.
///
/// Elapsed times are counted in whole days (as the retail reports do) and
/// then divided by `time_unit_days`. The output is ordered by customer id.
pub fn aggregate(
    records: &[TransactionRecord],
    cutoff: NaiveDateTime,
    time_unit_days: f64,
) -> CltvResult<Vec<CustomerSummary>> {
    if records.is_empty() {
        return Err(CltvError::EmptyInput);
    }
    if !(time_unit_days.is_finite() && time_unit_days > 0.0) {
        return Err(CltvError::InvalidConfig(format!(
            "time unit must be a positive number of days, got {time_unit_days}"
        )));
    }

    let mut groups: BTreeMap<CustomerId, Accumulator> = BTreeMap::new();
    for record in records {
        let acc = groups.entry(record.customer_id).or_default();
        acc.invoices.insert(record.invoice.clone());
        acc.first = Some(acc.first.map_or(record.timestamp, |t| t.min(record.timestamp)));
        acc.last = Some(acc.last.map_or(record.timestamp, |t| t.max(record.timestamp)));
        acc.spend += record.total();
    }

    let summaries: Vec<CustomerSummary> = groups
        .into_iter()
        .filter_map(|(customer_id, acc)| {
            let (first, last) = (acc.first?, acc.last?);
            let frequency = acc.invoices.len() as u32;
            Some(CustomerSummary {
                customer_id,
                recency: whole_days(last - first) / time_unit_days,
                age: whole_days(cutoff - first) / time_unit_days,
                frequency,
                monetary: acc.spend / f64::from(frequency),
                total_spend: acc.spend,
                first_purchase: first,
                last_purchase: last,
            })
        })
        .collect();

    log::info!(
        "Aggregated {} records into {} customer summaries ({} repeat customers)",
        records.len(),
        summaries.len(),
        summaries.iter().filter(|s| s.is_repeat_customer()).count()
    );

    Ok(summaries)
}

/// Elapsed whole days, rounded down so a purchase hours after the cutoff
/// still yields a negative age.
fn whole_days(elapsed: Duration) -> f64 {
    elapsed.num_seconds().div_euclid(86_400) as f64
}

/// Apply the validation policy to every summary.
///
/// Strict mode fails on the first invalid customer; lenient mode drops it
/// and records why.
pub fn validate_summaries(
    summaries: Vec<CustomerSummary>,
    policy: ValidationPolicy,
) -> CltvResult<ValidatedSummaries> {
    let mut validated = ValidatedSummaries::default();
    for summary in summaries {
        match summary.validate() {
            Ok(()) => validated.summaries.push(summary),
            Err(err) if policy == ValidationPolicy::Lenient => {
                log::warn!("Dropping customer {}: {err}", summary.customer_id);
                validated.dropped.push(DroppedCustomer {
                    customer_id: summary.customer_id,
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }
    if !validated.dropped.is_empty() {
        log::warn!(
            "Lenient validation dropped {} of {} customers",
            validated.dropped.len(),
            validated.dropped.len() + validated.summaries.len()
        );
    }
    Ok(validated)
}
