pub mod chunk;

pub use chunk::{ChunkStore, KvMap};
