//! Asynchronous page I/O substrate and tablespace registry.
//!
//! The cache hands a transfer buffer to [`PageIo`] and gets it back through
//! a completion callback. Callbacks may run on the submitting thread
//! ([`InlineIo`]) or on a worker ([`ThreadedIo`]); the cache never holds a
//! pool lock while submitting.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, error};

use super::io::{FileIo, StdFileIo};
use crate::types::page::SpaceInfo;
use crate::types::{BufError, PageId, Result};

/// One page transfer.
#[derive(Debug)]
pub struct IoRequest {
    /// Page being transferred.
    pub page_id: PageId,
    /// Byte offset inside the tablespace file.
    pub offset: u64,
    /// Source (write) or destination (read) bytes; its length is the
    /// physical transfer size.
    pub buf: Vec<u8>,
}

/// Completion callback: receives the request back with the outcome.
pub type IoCallback = Box<dyn FnOnce(IoRequest, Result<()>) + Send + 'static>;

/// Submits page reads and writes.
pub trait PageIo: Send + Sync + 'static {
    /// Reads `req.buf.len()` bytes at `req.offset`, then calls `on_complete`.
    fn submit_read(&self, req: IoRequest, on_complete: IoCallback);
    /// Writes `req.buf` at `req.offset`, then calls `on_complete`.
    fn submit_write(&self, req: IoRequest, on_complete: IoCallback);
}

/// Tablespace metadata lookup. `None` means the space was dropped.
pub trait SpaceRegistry: Send + Sync + 'static {
    /// Metadata of tablespace `id`.
    fn space(&self, id: u32) -> Option<SpaceInfo>;
}

struct SpaceEntry {
    info: SpaceInfo,
    file: Arc<dyn FileIo>,
}

/// Tablespace registry backed by one [`FileIo`] per space.
#[derive(Default)]
pub struct SpaceFiles {
    spaces: RwLock<FxHashMap<u32, SpaceEntry>>,
}

impl SpaceFiles {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a space backed by `file`, replacing any previous entry.
    pub fn attach(&self, info: SpaceInfo, file: Arc<dyn FileIo>) {
        debug!(space = info.id, page_size = info.page_size, zip_size = info.zip_size, "aio.space.attach");
        self.spaces.write().insert(info.id, SpaceEntry { info, file });
    }

    /// Opens (or creates) the file at `path` for space `info.id`.
    pub fn open(&self, info: SpaceInfo, path: impl AsRef<Path>) -> Result<()> {
        let file = StdFileIo::open(path)?;
        self.attach(info, Arc::new(file));
        Ok(())
    }

    /// Forgets a space. Later reads of its pages fail with
    /// [`BufError::TablespaceDeleted`].
    pub fn drop_space(&self, id: u32) -> bool {
        let removed = self.spaces.write().remove(&id).is_some();
        debug!(space = id, removed, "aio.space.drop");
        removed
    }

    /// File handle of a space.
    pub fn file(&self, id: u32) -> Option<Arc<dyn FileIo>> {
        self.spaces.read().get(&id).map(|entry| Arc::clone(&entry.file))
    }

    /// Flushes the file of a space to stable storage.
    pub fn sync_space(&self, id: u32) -> Result<()> {
        let file = self.file(id).ok_or(BufError::TablespaceDeleted(id))?;
        file.sync_all()
    }

    fn read(&self, req: &mut IoRequest) -> Result<()> {
        let file = self
            .file(req.page_id.space)
            .ok_or(BufError::TablespaceDeleted(req.page_id.space))?;
        file.read_page(req.offset, &mut req.buf)
    }

    fn write(&self, req: &IoRequest) -> Result<()> {
        let file = self
            .file(req.page_id.space)
            .ok_or(BufError::TablespaceDeleted(req.page_id.space))?;
        file.write_at(req.offset, &req.buf)
    }
}

impl SpaceRegistry for SpaceFiles {
    fn space(&self, id: u32) -> Option<SpaceInfo> {
        self.spaces.read().get(&id).map(|entry| entry.info)
    }
}

/// Performs the transfer on the submitting thread and completes inline.
pub struct InlineIo {
    spaces: Arc<SpaceFiles>,
}

impl InlineIo {
    /// Substrate over `spaces`.
    pub fn new(spaces: Arc<SpaceFiles>) -> Self {
        Self { spaces }
    }
}

impl PageIo for InlineIo {
    fn submit_read(&self, mut req: IoRequest, on_complete: IoCallback) {
        let result = self.spaces.read(&mut req);
        on_complete(req, result);
    }

    fn submit_write(&self, req: IoRequest, on_complete: IoCallback) {
        let result = self.spaces.write(&req);
        on_complete(req, result);
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum JobKind {
    Read,
    Write,
}

struct Job {
    kind: JobKind,
    req: IoRequest,
    on_complete: IoCallback,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    shutdown: bool,
}

struct IoShared {
    spaces: Arc<SpaceFiles>,
    state: Mutex<QueueState>,
    wakeup: Condvar,
}

/// Worker threads draining a shared request queue.
pub struct ThreadedIo {
    shared: Arc<IoShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadedIo {
    /// Starts `threads` workers (at least one).
    pub fn new(spaces: Arc<SpaceFiles>, threads: usize) -> Result<Self> {
        let shared = Arc::new(IoShared {
            spaces,
            state: Mutex::new(QueueState::default()),
            wakeup: Condvar::new(),
        });
        let mut workers = Vec::new();
        for idx in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("bufpool-io-{idx}"))
                .spawn(move || Self::worker_loop(shared))?;
            workers.push(handle);
        }
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    fn enqueue(&self, job: Job) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            drop(state);
            let req = job.req;
            let err = BufError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "io substrate shut down",
            ));
            (job.on_complete)(req, Err(err));
            return;
        }
        state.pending.push_back(job);
        debug!(pending = state.pending.len(), "aio.threaded.enqueue");
        self.shared.wakeup.notify_one();
    }

    fn worker_loop(shared: Arc<IoShared>) {
        loop {
            let job = {
                let mut state = shared.state.lock();
                loop {
                    if let Some(job) = state.pending.pop_front() {
                        break Some(job);
                    }
                    if state.shutdown {
                        break None;
                    }
                    shared.wakeup.wait(&mut state);
                }
            };
            let Some(mut job) = job else {
                debug!("aio.threaded.worker_exit");
                return;
            };
            let result = match job.kind {
                JobKind::Read => shared.spaces.read(&mut job.req),
                JobKind::Write => shared.spaces.write(&job.req),
            };
            if let Err(err) = &result {
                error!(page = %job.req.page_id, kind = ?job.kind, error = %err, "aio.threaded.failed");
            }
            (job.on_complete)(job.req, result);
        }
    }
}

impl PageIo for ThreadedIo {
    fn submit_read(&self, req: IoRequest, on_complete: IoCallback) {
        self.enqueue(Job {
            kind: JobKind::Read,
            req,
            on_complete,
        });
    }

    fn submit_write(&self, req: IoRequest, on_complete: IoCallback) {
        self.enqueue(Job {
            kind: JobKind::Write,
            req,
            on_complete,
        });
    }
}

impl Drop for ThreadedIo {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.wakeup.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}
