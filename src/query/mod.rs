mod eval;
mod plan;
mod types;

pub use eval::{apply_update, matches};
pub use plan::{QueryPlan, ScanStrategy, plan_query};
pub use types::{AggregateStage, CmpOp, Filter, FindOptions, SortOrder, UpdateDoc};
