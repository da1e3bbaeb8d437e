//! The disk half of a chancacher.
//!
//! Holds the cache file pair once it is open, and the flags the forwarding
//! and drain threads coordinate through:
//! - the writer side (file + encoder) sits behind one mutex, shared by the
//!   spill path and the role swap
//! - the reader side is owned by the drain thread while it runs, and parked
//!   here when it stops
//! - byte counts are read lock-free through [`ByteCounter`] handles that
//!   follow the files across swaps

use std::io::{self, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use chancache_codec::{ByteCounter, CountingFile, Encoder};
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::latch::{lock, Gate, Latch};
use crate::store::{DirLock, FilePair};

/// How often a spill blocked on the disk budget rechecks the size.
pub(crate) const BUDGET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Who may give up the directory lock.
#[derive(Debug)]
struct LockState {
    dir_lock: Option<DirLock>,
    /// A commit owns the release once it has started.
    committing: bool,
}

/// Disk-backed overflow shared by the forwarding and drain threads.
#[derive(Debug)]
pub(crate) struct DiskCache {
    writer: Mutex<Option<Encoder<CountingFile>>>,
    reader: Mutex<Option<CountingFile>>,
    counters: [ByteCounter; 2],
    /// Maximum bytes across both files, 0 for no limit.
    max_size: u64,
    /// The writer holds data the drain has not picked up.
    modified: AtomicBool,
    /// The drain is working through a reader that may still hold data.
    reading: AtomicBool,
    /// Set when the drain gave up because nobody reads the output.
    abandoned: AtomicBool,
    lock: Mutex<LockState>,
    /// Open while spilling is allowed.
    pub(crate) gate: Gate,
    /// Tells the drain thread to stop after the current file.
    pub(crate) done: Latch,
    /// Fired by the drain thread once it will no longer touch the output.
    pub(crate) ack: Latch,
}

impl DiskCache {
    pub(crate) fn new(pair: FilePair, max_size: u64) -> Self {
        let FilePair {
            reader,
            writer,
            lock: dir_lock,
            ..
        } = pair;

        let counters = [reader.counter(), writer.counter()];
        let reading = reader.count() > 0;
        let modified = writer.count() > 0;

        Self {
            writer: Mutex::new(Some(Encoder::new(writer))),
            reader: Mutex::new(Some(reader)),
            counters,
            max_size,
            modified: AtomicBool::new(modified),
            reading: AtomicBool::new(reading),
            abandoned: AtomicBool::new(false),
            lock: Mutex::new(LockState {
                dir_lock: Some(dir_lock),
                committing: false,
            }),
            gate: Gate::open(),
            done: Latch::new(),
            ack: Latch::new(),
        }
    }

    /// Bytes resident across both files.
    pub(crate) fn size(&self) -> u64 {
        self.counters.iter().map(ByteCounter::get).sum()
    }

    /// True while any spilled value has not yet been handed to the output.
    pub(crate) fn has_data(&self) -> bool {
        self.modified.load(Ordering::SeqCst) || self.reading.load(Ordering::SeqCst)
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Append a value to the writer file.
    ///
    /// Blocks while the disk budget is used up, until the drain is asked to
    /// stop: a stopped drain never frees space, so the value is written over
    /// budget. Encode failures are logged and the value is dropped; a
    /// partially written frame is cut off so the file stays decodable.
    pub(crate) fn spill<T: Serialize>(&self, value: &T) {
        while self.over_budget() && !self.done.is_fired() {
            thread::sleep(BUDGET_POLL_INTERVAL);
        }
        self.write_value(value);
    }

    /// Spill without waiting. Returns false if the disk budget is used up.
    pub(crate) fn try_spill<T: Serialize>(&self, value: &T) -> bool {
        if self.over_budget() {
            return false;
        }
        self.write_value(value);
        true
    }

    fn over_budget(&self) -> bool {
        self.max_size != 0 && self.size() >= self.max_size
    }

    /// Append a value regardless of the disk budget.
    pub(crate) fn write_value<T: Serialize>(&self, value: &T) {
        let mut writer = lock(&self.writer);
        let Some(enc) = writer.as_mut() else {
            error!("cache files are closed, dropping value");
            return;
        };

        let start = enc.get_mut().stream_position();
        match enc.encode(value) {
            Ok(n) => {
                trace!(bytes = n, "spilled value to cache");
                self.modified.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                error!(error = %e, "failed to encode value into cache");
                if let Ok(pos) = start {
                    let file = enc.get_mut();
                    if let Err(e) = file.truncate(pos).and_then(|_| file.seek(SeekFrom::Start(pos))) {
                        warn!(error = %e, "failed to roll back partial cache record");
                    }
                }
            }
        }
    }

    /// Hand the reader file to the drain thread.
    pub(crate) fn take_reader(&self) -> Option<CountingFile> {
        lock(&self.reader).take()
    }

    /// Return the reader file when the drain thread stops.
    pub(crate) fn park_reader(&self, reader: CountingFile) {
        *lock(&self.reader) = Some(reader);
    }

    /// Mark the current reader as fully drained and reset.
    pub(crate) fn finish_reading(&self) {
        self.reading.store(false, Ordering::SeqCst);
    }

    /// Stop draining for good without emptying the reader.
    pub(crate) fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
        self.reading.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_modified(&self) -> bool {
        self.modified.load(Ordering::SeqCst)
    }

    /// Exchange reader and writer roles.
    ///
    /// `reader` must be the drained (empty) reader. Afterwards it holds the
    /// old writer rewound to its start, and the drained file takes new
    /// writes through a fresh encoder.
    pub(crate) fn swap(&self, reader: &mut CountingFile) -> io::Result<()> {
        let mut writer = lock(&self.writer);
        let Some(enc) = writer.take() else {
            return Ok(());
        };

        let mut drained = enc.into_inner();
        std::mem::swap(&mut drained, reader);
        *writer = Some(Encoder::new(drained));

        // reading goes up before modified comes down, so has_data never
        // blinks false mid-swap
        self.reading.store(true, Ordering::SeqCst);
        self.modified.store(false, Ordering::SeqCst);
        debug!(bytes = reader.count(), "swapped cache files");

        reader.rewind()
    }

    /// Ask the drain thread to stop. Safe to call more than once.
    pub(crate) fn finish(&self) {
        if self.done.fire() {
            debug!("signalled cache drain to stop");
        }
    }

    /// Sync and close both files. Later spills are logged and dropped.
    pub(crate) fn close_files(&self) {
        if let Some(enc) = lock(&self.writer).take() {
            if let Err(e) = enc.get_ref().sync() {
                error!(error = %e, "failed to sync cache writer");
            }
        }
        if let Some(reader) = lock(&self.reader).take() {
            if let Err(e) = reader.sync() {
                error!(error = %e, "failed to sync cache reader");
            }
        }
    }

    /// Hand the lock release over to a commit. Teardown leaves the
    /// directory locked from here on.
    pub(crate) fn begin_commit(&self) {
        lock(&self.lock).committing = true;
    }

    /// Release the directory at the end of teardown, unless a commit has
    /// started and will release it itself.
    pub(crate) fn release_after_teardown(&self) {
        let mut state = lock(&self.lock);
        if state.committing {
            debug!("commit in progress, leaving cache lock to it");
            return;
        }
        Self::release(&mut state);
    }

    /// Give up ownership of the cache directory.
    pub(crate) fn release_lock(&self) {
        Self::release(&mut lock(&self.lock));
    }

    #[cfg(test)]
    pub(crate) fn holds_lock(&self) -> bool {
        lock(&self.lock).dir_lock.is_some()
    }

    fn release(state: &mut LockState) {
        if let Some(dir_lock) = state.dir_lock.take() {
            debug!(lock = %dir_lock.path().display(), "released cache lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chancache_codec::Decoder;
    use tempfile::TempDir;

    fn open_cache(dir: &TempDir, max_size: u64) -> DiskCache {
        DiskCache::new(FilePair::open::<u32>(dir.path()).unwrap(), max_size)
    }

    #[test]
    fn test_fresh_cache_has_no_data() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 0);
        assert!(!cache.has_data());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_spill_marks_modified_and_counts_bytes() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 0);

        cache.spill(&7u32);
        assert!(cache.has_data());
        assert!(cache.is_modified());
        assert!(cache.size() > 0);
    }

    #[test]
    fn test_swap_moves_spilled_values_to_reader() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 0);
        let mut reader = cache.take_reader().unwrap();

        cache.spill(&1u32);
        cache.spill(&2u32);
        let spilled = cache.size();

        cache.swap(&mut reader).unwrap();
        assert!(!cache.is_modified());
        assert!(cache.has_data());
        assert_eq!(cache.size(), spilled);

        let mut dec = Decoder::new(&mut reader);
        assert_eq!(dec.decode::<u32>().unwrap(), Some(1));
        assert_eq!(dec.decode::<u32>().unwrap(), Some(2));
        assert_eq!(dec.decode::<u32>().unwrap(), None);
        drop(dec);

        reader.reset().unwrap();
        cache.finish_reading();
        assert!(!cache.has_data());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_try_spill_respects_budget() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 1);

        assert!(cache.try_spill(&1u32));
        assert!(!cache.try_spill(&2u32));

        // commit path ignores the budget
        let before = cache.size();
        cache.write_value(&3u32);
        assert!(cache.size() > before);
    }

    #[test]
    fn test_spill_over_budget_returns_once_stopping() {
        let dir = TempDir::new().unwrap();
        let cache = std::sync::Arc::new(open_cache(&dir, 1));
        cache.spill(&1u32);

        let (tx, rx) = crossbeam_channel::bounded(1);
        let spiller = {
            let cache = std::sync::Arc::clone(&cache);
            thread::spawn(move || {
                cache.spill(&2u32);
                let _ = tx.send(());
            })
        };

        // no drain is running, so only the stop frees the spill
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        cache.finish();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        spiller.join().unwrap();

        let mut reader = cache.take_reader().unwrap();
        cache.swap(&mut reader).unwrap();
        let mut dec = Decoder::new(&mut reader);
        assert_eq!(dec.decode::<u32>().unwrap(), Some(1));
        assert_eq!(dec.decode::<u32>().unwrap(), Some(2));
    }

    #[test]
    fn test_teardown_release_defers_to_commit() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 0);

        cache.begin_commit();
        cache.release_after_teardown();
        assert!(cache.holds_lock());
        assert!(FilePair::open::<u32>(dir.path()).is_err());

        cache.close_files();
        cache.release_lock();
        assert!(!cache.holds_lock());
        assert!(FilePair::open::<u32>(dir.path()).is_ok());
    }

    #[test]
    fn test_spill_after_close_is_dropped() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 0);
        cache.close_files();

        cache.spill(&1u32);
        assert!(!cache.is_modified());
    }

    #[test]
    fn test_release_lock_frees_directory() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 0);
        assert!(FilePair::open::<u32>(dir.path()).is_err());

        cache.release_lock();
        cache.close_files();
        assert!(FilePair::open::<u32>(dir.path()).is_ok());
    }

    #[test]
    fn test_reopen_with_writer_data_is_modified() {
        let dir = TempDir::new().unwrap();
        {
            let cache = open_cache(&dir, 0);
            cache.spill(&1u32);
            cache.close_files();
            cache.release_lock();
        }

        // the populated writer is shuffled into the reader slot
        let cache = open_cache(&dir, 0);
        assert!(cache.has_data());
        assert!(!cache.is_modified());
    }
}
