use super::types::{CmpOp, Filter, UpdateDoc};
use crate::document::{Document, Value, compare_values};
use std::cmp::Ordering;

/// Evaluates a filter against one document.
#[must_use]
pub fn matches(filter: &Filter, doc: &Document) -> bool {
    match filter {
        Filter::True => true,
        Filter::And(subs) => subs.iter().all(|f| matches(f, doc)),
        Filter::Or(subs) => subs.iter().any(|f| matches(f, doc)),
        Filter::Not(inner) => !matches(inner, doc),
        Filter::Exists { path, exists } => doc.get_path(path).is_some() == *exists,
        Filter::In { path, values } => doc
            .get_path(path)
            .is_some_and(|v| values.iter().any(|w| compare_values(v, w) == Ordering::Equal)),
        Filter::Nin { path, values } => !doc
            .get_path(path)
            .is_some_and(|v| values.iter().any(|w| compare_values(v, w) == Ordering::Equal)),
        Filter::Cmp { path, op, value } => {
            let Some(actual) = doc.get_path(path) else {
                // A missing field only satisfies inequality.
                return *op == CmpOp::Ne;
            };
            let ord = compare_values(actual, value);
            match op {
                CmpOp::Eq => ord == Ordering::Equal,
                CmpOp::Ne => ord != Ordering::Equal,
                CmpOp::Gt => ord == Ordering::Greater,
                CmpOp::Gte => ord != Ordering::Less,
                CmpOp::Lt => ord == Ordering::Less,
                CmpOp::Lte => ord != Ordering::Greater,
            }
        }
    }
}

/// Applies an update spec, returning whether anything changed.
pub fn apply_update(doc: &mut Document, update: &UpdateDoc) -> bool {
    let mut changed = false;
    for (path, value) in &update.set {
        if doc.get(path) != Some(value) {
            doc.set(path.clone(), value.clone());
            changed = true;
        }
    }
    for (path, by) in &update.inc {
        let next = match doc.get(path) {
            Some(Value::Int32(i)) => Value::Double(f64::from(*i) + by),
            Some(Value::Int64(i)) => Value::Double(*i as f64 + by),
            Some(Value::Double(f)) => Value::Double(f + by),
            _ => Value::Double(*by),
        };
        doc.set(path.clone(), next);
        changed = true;
    }
    for path in &update.unset {
        if doc.remove(path).is_some() {
            changed = true;
        }
    }
    changed
}
