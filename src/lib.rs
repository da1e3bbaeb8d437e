//! Chancache - a bounded channel that spills to disk
//!
//! A [`ChanCacher`] moves values from an input channel to an output channel
//! through a bounded in-memory buffer. When the buffer is full and a cache
//! directory is configured, values are appended to a pair of files on disk
//! instead of blocking the producer, and fed back into the output as the
//! consumer catches up.
//!
//! On shutdown, [`ChanCacher::commit`] writes everything still in flight to
//! disk. The next chancacher opened on the same directory recovers it,
//! merging what a crash may have left behind and quarantining files that no
//! longer decode.

pub mod cacher;
pub mod config;
pub mod error;
pub mod inspect;
pub mod latch;
pub mod signal;
pub mod store;

mod drain;
mod spill;

pub use cacher::{CacheValue, ChanCacher};
pub use config::{ChanCacherConfig, ConfigError, FileConfig, LogConfig, MAX_DEPTH};
pub use error::{ChanCacherError, ChanCacherResult};
pub use inspect::{inspect, CacheReport};
pub use store::{DirLock, LockError, Recovery};
