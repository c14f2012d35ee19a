//! Rule-based RFM scoring and segment lookup.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::data::CustomerId;
use crate::error::{CltvError, CltvResult};
use crate::segment::{quantile_segments, Segmentation};
use crate::summary::CustomerSummary;

/// Named behavioural segment keyed by (recency score, frequency score)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RfmSegment {
    Hibernating,
    AtRisk,
    CantLoose,
    AboutToSleep,
    NeedAttention,
    LoyalCustomers,
    Promising,
    NewCustomers,
    PotentialLoyalist,
    Champions,
}

impl RfmSegment {
    pub const ALL: [RfmSegment; 10] = [
        RfmSegment::Hibernating,
        RfmSegment::AtRisk,
        RfmSegment::CantLoose,
        RfmSegment::AboutToSleep,
        RfmSegment::NeedAttention,
        RfmSegment::LoyalCustomers,
        RfmSegment::Promising,
        RfmSegment::NewCustomers,
        RfmSegment::PotentialLoyalist,
        RfmSegment::Champions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RfmSegment::Hibernating => "hibernating",
            RfmSegment::AtRisk => "at_risk",
            RfmSegment::CantLoose => "cant_loose",
            RfmSegment::AboutToSleep => "about_to_sleep",
            RfmSegment::NeedAttention => "need_attention",
            RfmSegment::LoyalCustomers => "loyal_customers",
            RfmSegment::Promising => "promising",
            RfmSegment::NewCustomers => "new_customers",
            RfmSegment::PotentialLoyalist => "potential_loyalist",
            RfmSegment::Champions => "champions",
        }
    }

    /// Decision table over 1..=5 recency and frequency scores.
    pub fn from_scores(recency: u8, frequency: u8) -> Option<Self> {
        use RfmSegment::*;
        let segment = match (recency, frequency) {
            (1..=2, 1..=2) => Hibernating,
            (1..=2, 3..=4) => AtRisk,
            (1..=2, 5) => CantLoose,
            (3, 1..=2) => AboutToSleep,
            (3, 3) => NeedAttention,
            (3..=4, 4..=5) => LoyalCustomers,
            (4, 1) => Promising,
            (5, 1) => NewCustomers,
            (4..=5, 2..=3) => PotentialLoyalist,
            (5, 4..=5) => Champions,
            _ => return None,
        };
        Some(segment)
    }
}

impl fmt::Display for RfmSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RFM metrics, scores and segment of one customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfmRow {
    pub customer_id: CustomerId,
    /// Whole days from the last purchase to the cutoff
    pub recency_days: i64,
    pub frequency: u32,
    /// Spend across all purchase events
    pub monetary: f64,
    pub recency_score: u8,
    pub frequency_score: u8,
    pub monetary_score: u8,
    pub segment: RfmSegment,
}

impl RfmRow {
    /// Two-digit recency/frequency code, e.g. `"54"`.
    pub fn score_code(&self) -> String {
        format!("{}{}", self.recency_score, self.frequency_score)
    }
}

/// Score every customer with positive spend into 5x5x5 RFM cells and map the
/// recency/frequency pair to a segment.
///
/// Recency is scored inverted: the most recent fifth gets 5.
pub fn score_customers(
    summaries: &[CustomerSummary],
    cutoff: NaiveDateTime,
    buckets: usize,
) -> CltvResult<Vec<RfmRow>> {
    if buckets != 5 {
        return Err(CltvError::InvalidConfig(format!(
            "RFM segment table is defined on 5 score levels, got {buckets}"
        )));
    }
    let scored: Vec<&CustomerSummary> = summaries.iter().filter(|s| s.total_spend > 0.0).collect();
    if scored.is_empty() {
        return Err(CltvError::EmptyInput);
    }

    let recency_days: Vec<(CustomerId, i64)> = scored
        .iter()
        .map(|s| (s.customer_id, (cutoff - s.last_purchase).num_days()))
        .collect();

    // Negated so that the most recent customers rank highest.
    let recency = quantile_segments(
        &recency_days
            .iter()
            .map(|(id, days)| (*id, -(*days as f64)))
            .collect::<Vec<_>>(),
        buckets,
    )?;
    let frequency = quantile_segments(
        &scored
            .iter()
            .map(|s| (s.customer_id, f64::from(s.frequency)))
            .collect::<Vec<_>>(),
        buckets,
    )?;
    let monetary = quantile_segments(
        &scored
            .iter()
            .map(|s| (s.customer_id, s.total_spend))
            .collect::<Vec<_>>(),
        buckets,
    )?;

    let rows = scored
        .iter()
        .zip(recency_days)
        .map(|(s, (_, days))| {
            let score = |seg: &Segmentation| {
                seg.tier(s.customer_id).map_or(1, |t| t.score())
            };
            let (r, f, m) = (score(&recency), score(&frequency), score(&monetary));
            let segment = RfmSegment::from_scores(r, f).ok_or_else(|| CltvError::InvalidSummary {
                customer_id: s.customer_id,
                reason: format!("score pair {r}{f} outside the segment table"),
            })?;
            Ok(RfmRow {
                customer_id: s.customer_id,
                recency_days: days,
                frequency: s.frequency,
                monetary: s.total_spend,
                recency_score: r,
                frequency_score: f,
                monetary_score: m,
                segment,
            })
        })
        .collect::<CltvResult<Vec<_>>>()?;

    log::info!("RFM scored {} customers", rows.len());
    Ok(rows)
}
