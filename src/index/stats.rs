use super::key::IndexKey;
use chrono::{DateTime, Utc};

const HISTOGRAM_BUCKETS: usize = 16;
const NON_NUMERIC_RANGE_SELECTIVITY: f64 = 0.3;

/// Equal-width histogram over numeric keys.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub lo: f64,
    pub hi: f64,
    pub buckets: Vec<u64>,
}

impl Histogram {
    fn build(values: &[f64]) -> Option<Self> {
        let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !lo.is_finite() || !hi.is_finite() || lo >= hi {
            return None;
        }
        let mut buckets = vec![0u64; HISTOGRAM_BUCKETS];
        let width = (hi - lo) / HISTOGRAM_BUCKETS as f64;
        for v in values {
            let idx = (((v - lo) / width) as usize).min(HISTOGRAM_BUCKETS - 1);
            buckets[idx] += 1;
        }
        Some(Self { lo, hi, buckets })
    }

    /// Fraction of entries expected inside `[lo, hi]`, by bucket-weighted
    /// overlap.
    fn overlap(&self, lo: f64, hi: f64) -> f64 {
        let total: u64 = self.buckets.iter().sum();
        if total == 0 {
            return 0.0;
        }
        let width = (self.hi - self.lo) / self.buckets.len() as f64;
        let mut covered = 0.0;
        for (idx, count) in self.buckets.iter().enumerate() {
            let b_lo = self.lo + idx as f64 * width;
            let b_hi = b_lo + width;
            let span = (hi.min(b_hi) - lo.max(b_lo)).max(0.0);
            if span > 0.0 {
                covered += (*count as f64) * (span / width).min(1.0);
            }
        }
        (covered / total as f64).clamp(0.0, 1.0)
    }
}

/// Per-index statistics backing the planner's selectivity estimates.
/// `stale` flips on every write; `analyze` recomputes from a full scan.
#[derive(Debug, Clone, Default)]
pub struct IndexStatistics {
    pub total_entries: u64,
    pub unique_keys: u64,
    pub min: Option<IndexKey>,
    pub max: Option<IndexKey>,
    pub histogram: Option<Histogram>,
    pub last_updated: Option<DateTime<Utc>>,
    pub stale: bool,
}

impl IndexStatistics {
    /// Recomputes everything from an ordered full scan of the index.
    pub fn recompute(&mut self, entries: &[(IndexKey, crate::storage::RecordId)]) {
        self.total_entries = entries.len() as u64;
        self.unique_keys = {
            let mut uniques = 0u64;
            let mut prev: Option<&IndexKey> = None;
            for (key, _) in entries {
                if prev != Some(key) {
                    uniques += 1;
                }
                prev = Some(key);
            }
            uniques
        };
        self.min = entries.first().map(|(k, _)| k.clone());
        self.max = entries.last().map(|(k, _)| k.clone());
        let numeric: Vec<f64> = entries.iter().filter_map(|(k, _)| k.as_f64()).collect();
        self.histogram =
            if numeric.len() == entries.len() { Histogram::build(&numeric) } else { None };
        self.last_updated = Some(Utc::now());
        self.stale = false;
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Distinct-key count.
    #[must_use]
    pub fn cardinality(&self) -> u64 {
        self.unique_keys
    }

    /// `unique / total`, 1.0 for an empty index.
    #[must_use]
    pub fn equality_selectivity(&self) -> f64 {
        if self.total_entries == 0 {
            1.0
        } else {
            self.unique_keys as f64 / self.total_entries as f64
        }
    }

    /// Expected fraction of entries inside `[lo, hi]`. Histogram
    /// overlap when available; else linear interpolation over the
    /// min/max span; 0.3 when nothing is numeric.
    #[must_use]
    pub fn range_selectivity(&self, lo: Option<&IndexKey>, hi: Option<&IndexKey>) -> f64 {
        let lo_n = lo.and_then(IndexKey::as_f64);
        let hi_n = hi.and_then(IndexKey::as_f64);
        let (min_n, max_n) =
            (self.min.as_ref().and_then(IndexKey::as_f64), self.max.as_ref().and_then(IndexKey::as_f64));
        let Some((min_n, max_n)) = min_n.zip(max_n) else {
            return NON_NUMERIC_RANGE_SELECTIVITY;
        };
        let lo_v = lo_n.unwrap_or(min_n);
        let hi_v = hi_n.unwrap_or(max_n);
        if lo.is_some() && lo_n.is_none() || hi.is_some() && hi_n.is_none() {
            return NON_NUMERIC_RANGE_SELECTIVITY;
        }
        if let Some(hist) = &self.histogram {
            return hist.overlap(lo_v, hi_v);
        }
        if max_n <= min_n {
            return 1.0;
        }
        ((hi_v - lo_v) / (max_n - min_n)).clamp(0.0, 1.0)
    }
}
