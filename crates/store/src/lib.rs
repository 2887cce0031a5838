//! SQLite persistence for Agora.
//!
//! The [`Store`] wraps one `rusqlite` connection behind a mutex; reads
//! go straight through, while all mutations are expected to funnel
//! through the [`write_queue::WriteQueue`] so the file never sees
//! interleaved writers. [`cache::Cache`] provides TTL read-through
//! caching on top.

pub mod cache;
pub mod records;
pub mod schema;
mod store;
pub mod write_queue;

mod queries;

pub use cache::{Cache, CacheStats};
pub use store::Store;
pub use write_queue::WriteQueue;
