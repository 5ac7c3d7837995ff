//! Buffer pool for a page-oriented storage engine.
//!
//! Caches fixed-size pages of tablespaces in memory, ages them with a
//! midpoint-insertion LRU, tracks dirty pages in LSN order for
//! checkpoints, keeps compressed copies in a buddy allocator, and resizes
//! online.

#![warn(missing_docs)]

pub mod buf;
pub mod primitives;
pub mod types;

pub use buf::{BufferPool, BufferPoolBuilder, FetchMode, LatchMode, PageGuard, PoolOptions};
pub use types::{BufError, Lsn, PageId, Result};
