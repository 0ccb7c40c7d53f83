mod core;
mod index_admin;
mod ops;

pub use self::core::{Collection, CollectionCatalog};
pub use self::ops::ExplainReport;
