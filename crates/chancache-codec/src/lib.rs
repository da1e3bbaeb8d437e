//! Chancache Codec
//!
//! The on-disk side of the chancache disk spill: a self-delimiting record
//! stream and a file wrapper that keeps a live count of resident bytes.

pub mod counting;
pub mod error;
pub mod frame;

pub use counting::{ByteCounter, CountingFile};
pub use error::{CodecError, CodecResult};
pub use frame::{Decoder, Encoder, FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_FRAME_SIZE};
