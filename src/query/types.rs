use crate::document::Value;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Filter AST, parsed once at operation entry. Dotted paths descend
/// embedded documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    True,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Exists { path: String, exists: bool },
    In { path: String, values: Vec<Value> },
    Nin { path: String, values: Vec<Value> },
    Cmp { path: String, op: CmpOp, value: Value },
}

impl Filter {
    /// Shorthand for an equality comparison.
    #[must_use]
    pub fn eq(path: impl Into<String>, value: Value) -> Self {
        Self::Cmp { path: path.into(), op: CmpOp::Eq, value }
    }

    /// ANDs two filters, flattening when possible.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::True, f) | (f, Self::True) => f,
            (Self::And(mut xs), Self::And(ys)) => {
                xs.extend(ys);
                Self::And(xs)
            }
            (Self::And(mut xs), f) => {
                xs.push(f);
                Self::And(xs)
            }
            (f, Self::And(mut ys)) => {
                ys.insert(0, f);
                Self::And(ys)
            }
            (a, b) => Self::And(vec![a, b]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Options for `find`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindOptions {
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    pub projection: Option<Vec<String>>,
}

/// Update document: `$set`-style assignments plus `$inc` and
/// `$unset`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDoc {
    pub set: Vec<(String, Value)>,
    pub inc: Vec<(String, f64)>,
    pub unset: Vec<String>,
}

impl UpdateDoc {
    #[must_use]
    pub fn set_field(mut self, path: impl Into<String>, value: Value) -> Self {
        self.set.push((path.into(), value));
        self
    }

    #[must_use]
    pub fn inc_field(mut self, path: impl Into<String>, by: f64) -> Self {
        self.inc.push((path.into(), by));
        self
    }

    #[must_use]
    pub fn unset_field(mut self, path: impl Into<String>) -> Self {
        self.unset.push(path.into());
        self
    }
}

/// The pipeline stages the core contracts to run; the full aggregation
/// evaluator lives outside the storage engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AggregateStage {
    Match(Filter),
    Sort { field: String, order: SortOrder },
    Skip(usize),
    Limit(usize),
    Project(Vec<String>),
    Count(String),
}
