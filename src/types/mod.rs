//! Identifiers, error types and on-disk page layout shared by the cache.

use std::fmt;

pub mod checksum;
pub mod page;

/// Identity of a page: tablespace id plus page number within the space.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId {
    /// Tablespace identifier.
    pub space: u32,
    /// Page number inside the tablespace.
    pub page_no: u32,
}

impl PageId {
    /// Builds a page identity.
    pub const fn new(space: u32, page_no: u32) -> Self {
        Self { space, page_no }
    }

    /// Hash fold used to pick page hash buckets.
    pub fn fold(self) -> u32 {
        (self.space << 20)
            .wrapping_add(self.space)
            .wrapping_add(self.page_no)
    }

    /// Fold of the 64-page extent containing this page; selects the pool instance
    /// so neighbouring pages share an instance.
    pub fn extent_fold(self) -> u32 {
        (self.space << 20)
            .wrapping_add(self.space)
            .wrapping_add(self.page_no >> 6)
    }

    pub(crate) fn to_raw(self) -> u64 {
        (u64::from(self.space) << 32) | u64::from(self.page_no)
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Self {
            space: (raw >> 32) as u32,
            page_no: raw as u32,
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.space, self.page_no)
    }
}

/// Log sequence number.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The "clean" marker for modification stamps.
    pub const ZERO: Lsn = Lsn(0);

    /// Returns true for the zero LSN.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the buffer pool.
#[derive(thiserror::Error, Debug)]
pub enum BufError {
    /// File-level failure in the storage layer.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Checksum or format mismatch on read.
    #[error("page {0} is corrupted")]
    PageCorrupted(PageId),
    /// The page decrypted to garbage.
    #[error("page {0} failed to decrypt")]
    DecryptionFailed(PageId),
    /// The tablespace was dropped.
    #[error("tablespace {0} was deleted")]
    TablespaceDeleted(u32),
    /// No free block or sentinel could be found.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
    /// A stored handle no longer names its page.
    #[error("stale handle for page {0}")]
    StaleHandle(PageId),
    /// Caller-side argument error.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Rejected pool configuration.
    #[error(transparent)]
    Config(#[from] crate::buf::ConfigError),
    /// Reported by `validate`.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, BufError>;

/// Outcome of a completed page read, recorded on the descriptor so every
/// waiter observes the same result.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum IoStatus {
    /// Page content is valid.
    Success = 0,
    /// Checksum or format mismatch.
    PageCorrupted = 1,
    /// Encryption-layer checksum matched but plaintext did not.
    DecryptionFailed = 2,
    /// The tablespace disappeared while the read was outstanding.
    TablespaceDeleted = 3,
    /// The file read itself failed.
    IoError = 4,
}

impl IoStatus {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => IoStatus::Success,
            1 => IoStatus::PageCorrupted,
            2 => IoStatus::DecryptionFailed,
            3 => IoStatus::TablespaceDeleted,
            _ => IoStatus::IoError,
        }
    }

    /// Converts a failed status into the error handed to fetch callers.
    pub fn into_result(self, id: PageId) -> Result<()> {
        match self {
            IoStatus::Success => Ok(()),
            IoStatus::PageCorrupted => Err(BufError::PageCorrupted(id)),
            IoStatus::DecryptionFailed => Err(BufError::DecryptionFailed(id)),
            IoStatus::TablespaceDeleted => Err(BufError::TablespaceDeleted(id.space)),
            IoStatus::IoError => Err(BufError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("read of page {id} failed"),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_id_raw_roundtrip() {
        let id = PageId::new(7, 0xDEAD_BEEF);
        assert_eq!(PageId::from_raw(id.to_raw()), id);
    }

    #[test]
    fn extent_fold_groups_neighbours() {
        let a = PageId::new(3, 64);
        let b = PageId::new(3, 127);
        let c = PageId::new(3, 128);
        assert_eq!(a.extent_fold(), b.extent_fold());
        assert_ne!(a.extent_fold(), c.extent_fold());
    }

    #[test]
    fn io_status_maps_to_errors() {
        let id = PageId::new(1, 2);
        assert!(IoStatus::Success.into_result(id).is_ok());
        assert!(matches!(
            IoStatus::PageCorrupted.into_result(id),
            Err(BufError::PageCorrupted(p)) if p == id
        ));
        assert!(matches!(
            IoStatus::TablespaceDeleted.into_result(id),
            Err(BufError::TablespaceDeleted(1))
        ));
        assert_eq!(IoStatus::from_u8(2), IoStatus::DecryptionFailed);
    }
}
