use super::types::{CmpOp, Filter};
use crate::document::Value;
use crate::index::{IndexKey, KeyType, ManagedIndex};
use serde::Serialize;
use std::sync::Arc;

/// How the collection will satisfy a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanStrategy {
    IndexLookup,
    RangeScan,
    FullScan,
}

/// Chosen access path, also the payload of `explain`.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub index: Option<String>,
    pub strategy: ScanStrategy,
    pub estimated_cost: f64,
    /// Equality key for `IndexLookup`.
    pub eq_key: Option<IndexKey>,
    /// Bounds for `RangeScan`.
    pub range: (Option<IndexKey>, Option<IndexKey>),
}

impl QueryPlan {
    fn full_scan(total_docs: u64) -> Self {
        Self {
            index: None,
            strategy: ScanStrategy::FullScan,
            estimated_cost: total_docs as f64,
            eq_key: None,
            range: (None, None),
        }
    }
}

/// Flattens the top-level conjunction.
fn conjuncts(filter: &Filter) -> Vec<&Filter> {
    match filter {
        Filter::True => Vec::new(),
        Filter::And(subs) => subs.iter().flat_map(conjuncts).collect(),
        other => vec![other],
    }
}

fn eq_value<'a>(conjuncts: &[&'a Filter], field: &str) -> Option<&'a Value> {
    conjuncts.iter().find_map(|f| match f {
        Filter::Cmp { path, op: CmpOp::Eq, value } if path == field => Some(value),
        _ => None,
    })
}

fn range_bounds<'a>(
    conjuncts: &[&'a Filter],
    field: &str,
) -> (Option<&'a Value>, Option<&'a Value>) {
    let mut lo = None;
    let mut hi = None;
    for f in conjuncts {
        if let Filter::Cmp { path, op, value } = f
            && path == field
        {
            match op {
                CmpOp::Gt | CmpOp::Gte => lo = lo.or(Some(value)),
                CmpOp::Lt | CmpOp::Lte => hi = hi.or(Some(value)),
                CmpOp::Eq | CmpOp::Ne => {}
            }
        }
    }
    (lo, hi)
}

/// A partial index is only eligible when every conjunct of its stored
/// filter appears verbatim in the query; the index never answers for
/// documents its filter excluded.
fn partial_filter_covered(index: &ManagedIndex, query_conjuncts: &[&Filter]) -> bool {
    match &index.spec.partial_filter {
        None => true,
        Some(stored) => {
            conjuncts(stored).iter().all(|needed| query_conjuncts.iter().any(|have| have == needed))
        }
    }
}

fn candidate(index: &ManagedIndex, query_conjuncts: &[&Filter]) -> Option<QueryPlan> {
    if !index.is_ready() || !partial_filter_covered(index, query_conjuncts) {
        return None;
    }
    let spec = &index.spec;
    let stats = index.statistics();
    let total = stats.total_entries.max(1) as f64;

    // Equality selectivity is unique/total: the expected rows for a
    // point lookup is its reciprocal (average entries per key).
    let lookup_cost = (1.0 / stats.equality_selectivity().max(f64::EPSILON)).max(1.0);

    if spec.fields.len() == 1 {
        let field = &spec.fields[0];
        if let Some(value) = eq_value(query_conjuncts, field) {
            let key = IndexKey::from_value(value, spec.key_type).ok()?;
            return Some(QueryPlan {
                index: Some(spec.name.clone()),
                strategy: ScanStrategy::IndexLookup,
                estimated_cost: lookup_cost,
                eq_key: Some(key),
                range: (None, None),
            });
        }
        let (lo, hi) = range_bounds(query_conjuncts, field);
        if lo.is_some() || hi.is_some() {
            let lo_key = lo.and_then(|v| IndexKey::from_value(v, spec.key_type).ok());
            let hi_key = hi.and_then(|v| IndexKey::from_value(v, spec.key_type).ok());
            if lo.is_some() && lo_key.is_none() || hi.is_some() && hi_key.is_none() {
                return None;
            }
            let selectivity = stats.range_selectivity(lo_key.as_ref(), hi_key.as_ref());
            return Some(QueryPlan {
                index: Some(spec.name.clone()),
                strategy: ScanStrategy::RangeScan,
                estimated_cost: (selectivity * total).max(1.0),
                eq_key: None,
                range: (lo_key, hi_key),
            });
        }
        return None;
    }

    // Compound: equality on every field is a point lookup; equality on
    // a non-empty prefix becomes a range scan from the prefix tuple.
    debug_assert_eq!(spec.key_type, KeyType::Composite);
    let mut prefix = Vec::new();
    for field in &spec.fields {
        match eq_value(query_conjuncts, field) {
            Some(value) => prefix.push(IndexKey::from_value_infer(value).ok()?),
            None => break,
        }
    }
    if prefix.is_empty() {
        return None;
    }
    if prefix.len() == spec.fields.len() {
        return Some(QueryPlan {
            index: Some(spec.name.clone()),
            strategy: ScanStrategy::IndexLookup,
            estimated_cost: lookup_cost,
            eq_key: Some(IndexKey::Composite(prefix)),
            range: (None, None),
        });
    }
    Some(QueryPlan {
        index: Some(spec.name.clone()),
        strategy: ScanStrategy::RangeScan,
        estimated_cost: (0.5 * total).max(1.0),
        eq_key: None,
        range: (Some(IndexKey::Composite(prefix)), None),
    })
}

/// Picks the cheapest access path: the ready index with the highest
/// expected selectivity whose key prefix covers the filter, else a full
/// collection scan.
#[must_use]
pub fn plan_query(
    filter: &Filter,
    indexes: &[Arc<ManagedIndex>],
    total_docs: u64,
) -> QueryPlan {
    let query_conjuncts = conjuncts(filter);
    let mut best = QueryPlan::full_scan(total_docs);
    for index in indexes {
        if let Some(plan) = candidate(index, &query_conjuncts)
            && plan.estimated_cost < best.estimated_cost
        {
            best = plan;
        }
    }
    best
}
