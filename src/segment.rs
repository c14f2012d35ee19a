//! Rank-based quantile segmentation.
//!
//! Bucket boundaries come from the current population's ranks, never from
//! fixed thresholds, so labels are relative to the cohort being scored.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::CustomerId;
use crate::error::{CltvError, CltvResult};

/// Largest bucket count that still maps to a single letter tier
pub const MAX_BUCKETS: usize = 26;

/// Quantile bucket of one customer; bucket 0 holds the lowest values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tier {
    pub bucket: usize,
    pub buckets: usize,
}

impl Tier {
    /// Letter label: `A` for the top bucket, then `B`, `C`, ... downwards.
    pub fn letter(&self) -> char {
        let from_top = self.buckets.saturating_sub(1 + self.bucket) as u8;
        char::from(b'A' + from_top)
    }

    /// One-based score, 1 for the lowest bucket and `buckets` for the top.
    pub fn score(&self) -> u8 {
        (self.bucket + 1) as u8
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Bucket assignment for a whole population
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
    pub tiers: BTreeMap<CustomerId, Tier>,
    pub buckets: usize,
    /// Fewer distinct values than buckets; each distinct value got its own
    /// bucket and some buckets are empty
    pub degenerate: bool,
}

impl Segmentation {
    pub fn tier(&self, customer_id: CustomerId) -> Option<Tier> {
        self.tiers.get(&customer_id).copied()
    }

    /// Customers per bucket, lowest bucket first.
    pub fn bucket_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.buckets];
        for tier in self.tiers.values() {
            sizes[tier.bucket] += 1;
        }
        sizes
    }
}

/// Split `values` into `k` equal-population buckets by rank.
///
/// Ties are broken by customer id so every customer gets exactly one bucket
/// and repeated runs give identical labels. When there are fewer distinct
/// values than buckets, equal-population buckets are impossible: every
/// distinct value then keeps its own bucket, spread evenly from the lowest
/// bucket to the highest (a single distinct value lands in the lowest).
pub fn quantile_segments(values: &[(CustomerId, f64)], k: usize) -> CltvResult<Segmentation> {
    if k == 0 || k > MAX_BUCKETS {
        return Err(CltvError::InvalidConfig(format!(
            "bucket count must be between 1 and {MAX_BUCKETS}, got {k}"
        )));
    }
    if let Some((customer_id, value)) = values.iter().find(|(_, v)| !v.is_finite()) {
        return Err(CltvError::InvalidSummary {
            customer_id: *customer_id,
            reason: format!("cannot segment non-finite value {value}"),
        });
    }

    let mut ranked: Vec<(CustomerId, f64)> = values.to_vec();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    let n = ranked.len();
    let distinct = count_distinct(&ranked);
    let mut tiers = BTreeMap::new();

    if distinct >= k {
        for (rank, (customer_id, _)) in ranked.iter().enumerate() {
            let bucket = rank * k / n;
            tiers.insert(*customer_id, Tier { bucket, buckets: k });
        }
        return Ok(Segmentation {
            tiers,
            buckets: k,
            degenerate: false,
        });
    }

    if n > 0 {
        log::warn!(
            "Only {distinct} distinct values for {k} buckets across {n} customers; merging buckets"
        );
    }
    let mut distinct_rank = 0;
    let mut previous: Option<f64> = None;
    for (customer_id, value) in &ranked {
        if let Some(prev) = previous {
            if *value != prev {
                distinct_rank += 1;
            }
        }
        previous = Some(*value);
        let bucket = if distinct > 1 {
            distinct_rank * (k - 1) / (distinct - 1)
        } else {
            0
        };
        tiers.insert(*customer_id, Tier { bucket, buckets: k });
    }
    Ok(Segmentation {
        tiers,
        buckets: k,
        degenerate: n > 0,
    })
}

fn count_distinct(sorted: &[(CustomerId, f64)]) -> usize {
    if sorted.is_empty() {
        return 0;
    }
    1 + sorted.windows(2).filter(|w| w[0].1 != w[1].1).count()
}
