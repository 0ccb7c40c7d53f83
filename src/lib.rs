#![forbid(unsafe_code)]

//! LauraDB storage core: a document-oriented engine with a paged buffer
//! pool, write-ahead logging, slotted-page document storage, B+ tree
//! secondary indexes, MVCC snapshot reads, and a sharding layer with a
//! durable config server.

pub mod audit;
pub mod cancel;
pub mod collection;
pub mod database;
pub mod document;
pub mod errors;
pub mod index;
pub mod logger;
pub mod mvcc;
pub mod query;
pub mod shard;
pub mod storage;

pub use cancel::CancelToken;
pub use collection::Collection;
pub use database::{Database, DatabaseConfig};
pub use document::{Document, ObjectId, Value};
pub use errors::DbError;
pub use query::{Filter, FindOptions, UpdateDoc};
