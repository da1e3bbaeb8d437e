//! Byte-counting file wrapper.
//!
//! Keeps a running total of the bytes resident in a cache file so that size
//! queries (disk budget checks, `size()` reports) never stat the file:
//! - writes add to the count
//! - reads subtract from it
//! - truncation resets it to the new length
//!
//! The count lives behind a shared [`ByteCounter`] so it can be read from
//! other threads while the file itself is owned elsewhere.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared, read-only view of a [`CountingFile`]'s byte count.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    /// Bytes currently resident in the file.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::SeqCst);
    }

    fn sub(&self, n: u64) {
        // Reads past what we counted (a file appended to behind our back)
        // clamp at zero instead of wrapping.
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(n)));
    }

    fn set(&self, n: u64) {
        self.0.store(n, Ordering::SeqCst);
    }
}

/// A file handle that tracks the net number of bytes it holds.
#[derive(Debug)]
pub struct CountingFile {
    file: File,
    count: ByteCounter,
}

impl CountingFile {
    /// Wrap an open file. The starting count is the current file length.
    pub fn new(file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        let count = ByteCounter::default();
        count.set(len);
        Ok(Self { file, count })
    }

    /// Net bytes resident in the file.
    pub fn count(&self) -> u64 {
        self.count.get()
    }

    /// A handle to the count that outlives borrows of this file.
    pub fn counter(&self) -> ByteCounter {
        self.count.clone()
    }

    /// Length on disk, from file metadata.
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// True if the file holds no bytes on disk.
    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Seek back to the start of the file.
    pub fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Truncate the file to `len` bytes; the count becomes `len`.
    pub fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)?;
        self.count.set(len);
        Ok(())
    }

    /// Seek to the start and drop every byte in the file.
    pub fn reset(&mut self) -> io::Result<()> {
        self.rewind()?;
        self.truncate(0)
    }

    /// Flush file contents and metadata to the device.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Borrow the underlying file.
    pub fn get_ref(&self) -> &File {
        &self.file
    }

    /// Consume the wrapper and hand back the file.
    pub fn into_inner(self) -> File {
        self.file
    }
}

impl Read for CountingFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read(buf)?;
        self.count.sub(n as u64);
        Ok(n)
    }
}

impl Write for CountingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.count.add(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for CountingFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}
