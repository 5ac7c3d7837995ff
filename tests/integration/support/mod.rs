#![allow(dead_code)]

use std::sync::{Arc, Once};

use bufpool::buf::PoolOptions;
use bufpool::primitives::aio::SpaceFiles;
use bufpool::primitives::io::MemFileIo;
use bufpool::types::page::SpaceInfo;
use bufpool::BufferPool;

pub const PAGE_SIZE: usize = 4096;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_default())
            .with_test_writer()
            .try_init();
    });
}

pub fn options(pages: usize) -> PoolOptions {
    PoolOptions {
        page_size: PAGE_SIZE,
        pool_pages: pages,
        chunk_pages: 32,
        lru_old_min_len: 32,
        lru_scan_depth: 16,
        free_block_max_iterations: 16,
        ..PoolOptions::default()
    }
}

/// Registry with in-memory spaces 1 (plain) and 2 (compressed to 2 KiB).
pub fn mem_spaces() -> Arc<SpaceFiles> {
    let files = Arc::new(SpaceFiles::new());
    files.attach(SpaceInfo::new(1, PAGE_SIZE), Arc::new(MemFileIo::new()));
    files.attach(
        SpaceInfo::new(2, PAGE_SIZE).with_zip_size(2048),
        Arc::new(MemFileIo::new()),
    );
    files
}

pub fn mem_pool(options: PoolOptions) -> (BufferPool, Arc<SpaceFiles>) {
    init_tracing();
    let files = mem_spaces();
    let pool = BufferPool::with_files(options, Arc::clone(&files)).expect("pool");
    (pool, files)
}
