mod chunk;
mod config_server;
mod key;
mod router;

pub use chunk::{Chunk, ChunkManager, Shard, ShardState};
pub use config_server::{ConfigServer, ShardedCollection};
pub use key::{ShardKey, ShardKeyKind};
pub use router::ShardRouter;
