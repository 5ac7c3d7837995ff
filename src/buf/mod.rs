//! The page cache proper.
//!
//! A [`BufferPool`] owns one or more instances. Each instance has its own
//! arena of blocks, page hash, free, LRU and flush lists, and buddy
//! allocator for compressed page images.

mod arena;
mod buddy;
mod descriptor;
mod evict;
mod flush;
mod guard;
mod hash;
mod hazard;
mod instance;
mod list;
mod pool;
mod resize;
mod stats;
mod writeback;

pub mod codec;
pub mod lru;
pub mod options;

pub use buddy::{BuddyAddr, BuddyStat};
pub use codec::{PageCodec, PassthroughCodec};
pub use descriptor::{FlushType, IoFix, PageState};
pub use guard::{FetchMode, LatchMode, PageGuard, PageHandle, ScratchBlock};
pub use options::{ConfigError, PoolOptions};
pub use pool::{BufferPool, BufferPoolBuilder};
pub use resize::ResizeStatus;
pub use stats::{InstanceStats, PoolStats};
