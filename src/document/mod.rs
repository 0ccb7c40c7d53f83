mod codec;
mod oid;
mod value;

pub use codec::{decode_document, encode_document};
pub use oid::ObjectId;
pub use value::{Document, Value, compare_values};

/// Reserved primary-key field, unique within a collection.
pub const ID_FIELD: &str = "_id";
