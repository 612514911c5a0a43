//! The read-only file-content source the paging core consumes when
//! loading an `InFile` page. Everything about how files are named,
//! opened, or laid out on disk belongs to the surrounding filesystem
//! (spec.md Non-goals: "filesystem layout"); this crate only needs to
//! read bytes at an offset from an already-open file.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::mm::FileId;

/// Read-only access to file contents, keyed by an opaque `FileId` the
/// loader obtained however it likes.
pub trait FileSystem: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset` into `buf`.
    /// Returns the number of bytes actually read (short reads happen at
    /// end of file, mirroring `file_read`'s contract).
    fn read_at(&self, file: FileId, offset: u64, buf: &mut [u8]) -> usize;
}

/// In-memory filesystem mock: a flat map from `FileId` to its full
/// contents.
#[derive(Default)]
pub struct InMemoryFileSystem {
    files: BTreeMap<FileId, Vec<u8>>,
}

impl InMemoryFileSystem {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, file: FileId, contents: Vec<u8>) {
        self.files.insert(file, contents);
    }
}

impl FileSystem for InMemoryFileSystem {
    fn read_at(&self, file: FileId, offset: u64, buf: &mut [u8]) -> usize {
        let Some(contents) = self.files.get(&file) else {
            return 0;
        };
        let offset = offset as usize;
        if offset >= contents.len() {
            return 0;
        }
        let available = &contents[offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        n
    }
}
