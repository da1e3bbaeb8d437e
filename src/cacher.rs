//! The chancacher pipeline.
//!
//! Values go in through [`ChanCacher::sender`] and come out of
//! [`ChanCacher::output`]. Between them sits a bounded in-memory buffer,
//! and behind that an optional pair of files on disk:
//!
//! ```text
//! input ──► forward thread ──► output buffer ──► consumer
//!                │                  ▲
//!                ▼ (buffer full)    │
//!             writer file ──swap──► reader file ──► drain thread
//! ```
//!
//! The forward thread hands each value to the output if there is room.
//! Otherwise, with a cache directory configured and spilling enabled, it
//! races the output against the spill gate and appends the value to the
//! writer file if the gate wins. The drain thread decodes the reader file
//! into the output and swaps file roles whenever the writer has data.
//!
//! Order is FIFO while everything stays in memory, and spilled values come
//! back out in the order they were spilled. A value that finds room in the
//! buffer while older values are still on disk goes out ahead of them, and
//! [`ChanCacher::commit`] appends the buffered values after whatever is
//! already on disk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Select, SendError, Sender, TrySendError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn, Span};

use crate::config::ChanCacherConfig;
use crate::drain;
use crate::error::{ChanCacherError, ChanCacherResult};
use crate::spill::DiskCache;
use crate::store::FilePair;

/// Poll interval for teardown and [`ChanCacher::drain`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Values a chancacher can carry.
pub trait CacheValue: Serialize + DeserializeOwned + Send + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Send + 'static {}

#[derive(Debug)]
struct Shared {
    /// The forward thread has seen the input close.
    run_done: AtomicBool,
    committed: AtomicBool,
    /// The [`ChanCacher`] handle is gone, so nobody can commit.
    detached: AtomicBool,
    cache: Option<Arc<DiskCache>>,
}

impl Shared {
    fn is_run_done(&self) -> bool {
        self.run_done.load(Ordering::SeqCst)
    }

    fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

/// A bounded channel that overflows to disk.
///
/// # Example
///
/// ```no_run
/// use chancache::{ChanCacher, ChanCacherConfig};
///
/// let config = ChanCacherConfig::new(100).with_cache_dir("/tmp/chancache");
/// let mut cacher = ChanCacher::<String>::new(config)?;
///
/// let tx = cacher.sender().expect("input open");
/// tx.send("hello".to_string()).unwrap();
/// drop(tx);
/// cacher.close_input();
///
/// assert_eq!(cacher.output().recv().unwrap(), "hello");
/// # Ok::<(), chancache::ChanCacherError>(())
/// ```
#[derive(Debug)]
pub struct ChanCacher<T> {
    input: Option<Sender<T>>,
    output: Receiver<T>,
    shared: Arc<Shared>,
}

impl<T: CacheValue> ChanCacher<T> {
    /// Build a chancacher whose threads log under the current span.
    pub fn new(config: ChanCacherConfig) -> ChanCacherResult<Self> {
        Self::with_span(config, Span::current())
    }

    /// Build a chancacher whose threads log under `span`.
    ///
    /// With a cache directory configured this takes the directory lock,
    /// recovers whatever a previous owner left behind, and fails if the
    /// directory is unusable or already owned.
    pub fn with_span(config: ChanCacherConfig, span: Span) -> ChanCacherResult<Self> {
        let depth = config.effective_depth();
        if depth < config.depth {
            warn!(requested = config.depth, depth, "clamped chancacher depth");
        }

        let cache = match config.cache_path() {
            Some(dir) => {
                let pair = {
                    let _enter = span.enter();
                    FilePair::open::<T>(dir)?
                };
                info!(
                    parent: &span,
                    dir = %dir.display(),
                    depth,
                    max_size = config.max_size,
                    recovery = ?pair.recovery,
                    "opened chancacher cache"
                );
                Some(Arc::new(DiskCache::new(pair, config.max_size)))
            }
            None => None,
        };

        let (input_tx, input_rx) = bounded::<T>(0);
        let (output_tx, output_rx) = bounded::<T>(depth);

        let shared = Arc::new(Shared {
            run_done: AtomicBool::new(false),
            committed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            cache,
        });

        if let Some(cache) = &shared.cache {
            let cache = Arc::clone(cache);
            let output_tx = output_tx.clone();
            let span = span.clone();
            spawn("chancache-drain", move || {
                let _enter = span.enter();
                drain::run(cache, output_tx);
            })?;
        }

        {
            let shared = Arc::clone(&shared);
            spawn("chancache-forward", move || {
                let _enter = span.enter();
                forward(&shared, input_rx, output_tx);
            })?;
        }

        Ok(Self {
            input: Some(input_tx),
            output: output_rx,
            shared,
        })
    }

    /// A handle for sending values in, or `None` once the input is closed.
    pub fn sender(&self) -> Option<Sender<T>> {
        self.input.clone()
    }

    /// Drop this chancacher's input handle.
    ///
    /// The input closes once every sender handed out by [`Self::sender`] is
    /// dropped as well.
    pub fn close_input(&mut self) {
        self.input = None;
    }

    /// The output end. Closes after the input closes and every value has
    /// been delivered or committed to disk.
    pub fn output(&self) -> &Receiver<T> {
        &self.output
    }

    /// Values waiting in the in-memory output buffer.
    pub fn buffer_size(&self) -> usize {
        self.output.len()
    }

    /// Bytes resident in the cache files, 0 without a cache.
    pub fn size(&self) -> u64 {
        self.shared.cache.as_ref().map_or(0, |c| c.size())
    }

    /// True while any value has been spilled but not yet delivered.
    pub fn cache_has_data(&self) -> bool {
        self.shared.cache.as_ref().is_some_and(|c| c.has_data())
    }

    /// Allow spilling to disk. This is the default.
    pub fn cache_start(&self) {
        if let Some(cache) = &self.shared.cache {
            cache.gate.start();
            debug!("cache spilling enabled");
        }
    }

    /// Stop spilling new values. A full buffer then blocks the input.
    ///
    /// Values already on disk keep draining.
    pub fn cache_stop(&self) {
        if let Some(cache) = &self.shared.cache {
            cache.gate.stop();
            debug!("cache spilling disabled");
        }
    }

    /// Block until the in-memory buffer is empty.
    pub fn drain(&self) {
        while !self.output.is_empty() {
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Write everything still in flight to disk and release the directory.
    ///
    /// Stops the drain thread, pulls whatever is in the output buffer back
    /// out and spills it, then syncs and closes both files. Blocks until the
    /// input has been closed; call [`Self::close_input`] and drop any other
    /// senders first. Without a cache this only marks the chancacher as
    /// committed.
    pub fn commit(&self) {
        let Some(cache) = &self.shared.cache else {
            self.shared.committed.store(true, Ordering::SeqCst);
            return;
        };

        cache.begin_commit();
        cache.finish();

        let mut drain_stopped = false;
        let mut recommitted = 0u64;
        while !self.shared.is_run_done() || !self.output.is_empty() || !drain_stopped {
            if cache.ack.is_fired() {
                drain_stopped = true;
            }
            match self.output.recv_timeout(POLL_INTERVAL) {
                Ok(value) => {
                    // the drain is stopping, so the budget would never free up
                    cache.write_value(&value);
                    recommitted += 1;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        cache.close_files();
        cache.release_lock();
        self.shared.committed.store(true, Ordering::SeqCst);
        info!(recommitted, "committed chancacher to disk");
    }
}

impl<T> Drop for ChanCacher<T> {
    fn drop(&mut self) {
        self.shared.detached.store(true, Ordering::SeqCst);
    }
}

fn spawn<F>(name: &'static str, f: F) -> ChanCacherResult<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(drop)
        .map_err(|source| ChanCacherError::Spawn { name, source })
}

/// Move values from the input to the output, spilling when it is full.
fn forward<T: CacheValue>(shared: &Shared, input: Receiver<T>, output: Sender<T>) {
    for value in input.iter() {
        let value = match output.try_send(value) {
            Ok(()) => continue,
            Err(TrySendError::Full(value)) => value,
            Err(TrySendError::Disconnected(value)) => {
                orphan(shared, &value);
                continue;
            }
        };

        match &shared.cache {
            None => {
                if let Err(SendError(value)) = output.send(value) {
                    orphan(shared, &value);
                }
            }
            Some(cache) => send_or_spill(cache, &output, value),
        }
    }

    shared.run_done.store(true, Ordering::SeqCst);
    debug!("chancacher input closed");

    if let Some(cache) = &shared.cache {
        // buffered values may still be committed, so keep the directory
        // until they are read or the handle is dropped
        while (cache.has_data() || (!output.is_empty() && !shared.is_detached()))
            && !shared.is_committed()
            && !cache.is_abandoned()
        {
            thread::sleep(POLL_INTERVAL);
        }
        cache.finish();
        cache.ack.wait();
        cache.release_after_teardown();
    }

    // the output closes once the drain thread's sender is gone too
    drop(output);
    debug!("chancacher forward stopped");
}

/// Block until the output has room or spilling is allowed, whichever
/// comes first.
fn send_or_spill<T: CacheValue>(cache: &DiskCache, output: &Sender<T>, value: T) {
    let gate = cache.gate.receiver();

    let mut sel = Select::new();
    let send_op = sel.send(output);
    sel.recv(&gate);
    let oper = sel.select();

    if oper.index() == send_op {
        if let Err(SendError(value)) = oper.send(output, value) {
            if !cache.try_spill(&value) {
                warn!("chancacher output closed and cache full, dropping value");
            }
        }
    } else {
        // nothing is sent on the gate; ready means open
        let _ = oper.recv(&gate);
        cache.spill(&value);
    }
}

/// Handle a value whose output receiver is gone.
fn orphan<T: CacheValue>(shared: &Shared, value: &T) {
    match &shared.cache {
        Some(cache) if cache.try_spill(value) => {}
        Some(_) => warn!("chancacher output closed and cache full, dropping value"),
        None => warn!("chancacher output closed, dropping value"),
    }
}
