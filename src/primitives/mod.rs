//! Low-level primitives the buffer pool is built on.
//!
//! Positioned file I/O, the asynchronous page transfer substrate and the
//! time source used for LRU aging.

pub mod aio;
pub mod clock;
pub mod io;
