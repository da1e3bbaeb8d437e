//! The drain thread: feeds spilled values back into the output.
//!
//! It alternates between two states:
//! - reading: decode the reader file front to back, sending each value to
//!   the output, then truncate it
//! - swapping: once the writer has picked up data, trade file roles and go
//!   back to reading
//!
//! Between files it checks the stop latch, and while idle it waits on it
//! with a short timeout so a stop is noticed promptly.

use std::sync::Arc;
use std::time::Duration;

use chancache_codec::{CountingFile, Decoder};
use crossbeam_channel::Sender;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::spill::DiskCache;

/// How often an idle drain checks the writer for new data.
pub(crate) const SWAP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, PartialEq, Eq)]
enum Pass {
    /// Every value in the file reached the output.
    Drained,
    /// The output receiver is gone.
    OutputClosed,
}

/// Run the drain loop until stopped, then fire the ack latch.
pub(crate) fn run<T>(cache: Arc<DiskCache>, output: Sender<T>)
where
    T: DeserializeOwned,
{
    let Some(mut reader) = cache.take_reader() else {
        error!("cache reader already taken, drain not started");
        cache.ack.fire();
        return;
    };

    loop {
        if read_file(&mut reader, &output) == Pass::OutputClosed {
            // keep what is left on disk for the next owner
            warn!(
                bytes = reader.count(),
                "output closed while draining cache, leaving remaining values on disk"
            );
            cache.abandon();
            break;
        }

        if let Err(e) = reader.reset() {
            error!(error = %e, "failed to reset cache reader");
        }
        cache.finish_reading();

        if !wait_for_data(&cache) {
            break;
        }

        if let Err(e) = cache.swap(&mut reader) {
            error!(error = %e, "failed to rewind swapped cache file");
        }
    }

    cache.park_reader(reader);
    cache.ack.fire();
    debug!("cache drain stopped");
}

fn read_file<T>(reader: &mut CountingFile, output: &Sender<T>) -> Pass
where
    T: DeserializeOwned,
{
    let mut dec = Decoder::new(reader);
    loop {
        match dec.decode::<T>() {
            Ok(Some(value)) => {
                if output.send(value).is_err() {
                    return Pass::OutputClosed;
                }
            }
            Ok(None) => return Pass::Drained,
            Err(e) => {
                // the rest of this file is unreachable; treat as end of file
                error!(error = %e, offset = dec.offset(), "unexpected error while parsing cache");
                return Pass::Drained;
            }
        }
    }
}

/// Wait for the writer to hold data. Returns false once asked to stop.
fn wait_for_data(cache: &DiskCache) -> bool {
    if cache.done.is_fired() {
        return false;
    }
    while !cache.is_modified() {
        if cache.done.wait_timeout(SWAP_POLL_INTERVAL) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FilePair;
    use chancache_codec::Encoder;
    use crossbeam_channel::bounded;
    use std::io::Write;
    use std::thread;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Arc<DiskCache> {
        Arc::new(DiskCache::new(
            FilePair::open::<u32>(dir.path()).unwrap(),
            0,
        ))
    }

    #[test]
    fn test_drain_delivers_spilled_values_in_order() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        let (tx, rx) = bounded(0);

        for v in 0..10u32 {
            cache.spill(&v);
        }

        let worker = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || run::<u32>(cache, tx))
        };

        for want in 0..10u32 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), want);
        }

        cache.finish();
        assert!(cache.ack.wait_timeout(Duration::from_secs(2)));
        worker.join().unwrap();
        assert!(!cache.has_data());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_corrupt_record_ends_file_and_drain_continues() {
        let dir = TempDir::new().unwrap();
        let mut pair = FilePair::open::<u32>(dir.path()).unwrap();

        // a good record followed by bytes that are not a frame
        Encoder::new(&mut pair.reader).encode(&7u32).unwrap();
        pair.reader.write_all(b"not a frame!").unwrap();
        pair.reader.rewind().unwrap();

        let cache = Arc::new(DiskCache::new(pair, 0));
        assert!(cache.has_data());
        let (tx, rx) = bounded(0);
        let worker = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || run::<u32>(cache, tx))
        };

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while cache.has_data() || cache.size() > 0 {
            assert!(std::time::Instant::now() < deadline, "reader never reset");
            thread::sleep(Duration::from_millis(20));
        }

        cache.spill(&8u32);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 8);

        cache.finish();
        assert!(cache.ack.wait_timeout(Duration::from_secs(2)));
        worker.join().unwrap();
    }

    #[test]
    fn test_drain_stops_when_output_closed() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        let (tx, rx) = bounded::<u32>(0);
        drop(rx);

        cache.spill(&1u32);
        let worker = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || run::<u32>(cache, tx))
        };

        assert!(cache.ack.wait_timeout(Duration::from_secs(2)));
        worker.join().unwrap();
        assert!(cache.is_abandoned());
        assert!(cache.take_reader().is_some());
    }

    #[test]
    fn test_drain_idle_stop_acks() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        let (tx, _rx) = bounded::<u32>(1);

        let worker = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || run::<u32>(cache, tx))
        };

        cache.finish();
        assert!(cache.ack.wait_timeout(Duration::from_secs(2)));
        worker.join().unwrap();
        assert!(!cache.is_abandoned());
    }
}
