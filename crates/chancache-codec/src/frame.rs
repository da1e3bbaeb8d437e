//! Record framing.
//!
//! A cache file is a plain concatenation of frames:
//!
//! ```text
//! +-------+----------+------------+-----------------+
//! | magic | crc32 LE | length LE  | payload (json)  |
//! | 4 B   | 4 B      | 4 B        | length bytes    |
//! +-------+----------+------------+-----------------+
//! ```
//!
//! Frames carry no stream-level state, so a writer can be handed a fresh
//! [`Encoder`] at any frame boundary and a reader can start decoding at any
//! frame boundary. A zero-length payload is a null record and is skipped by
//! the decoder.

use std::io::{self, BufReader, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CodecError, CodecResult};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"CHCA";

/// Size of the frame header (magic + crc + length).
pub const FRAME_HEADER_SIZE: usize = 4 + 4 + 4;

/// Largest payload a decoder will accept (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Writes values as frames onto an underlying writer.
#[derive(Debug)]
pub struct Encoder<W: Write> {
    writer: W,
}

impl<W: Write> Encoder<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Append one value as a single frame.
    ///
    /// The whole frame goes out in one `write_all`, so a failing write never
    /// leaves a header without its payload in our own buffers.
    ///
    /// Returns the number of bytes written.
    pub fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> CodecResult<usize> {
        let payload = serde_json::to_vec(value).map_err(CodecError::Encode)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                offset: 0,
                length: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        self.writer.write_all(&frame)?;
        Ok(frame.len())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Reads frames back from an underlying reader.
///
/// Reads are buffered; the decoder should be the only consumer of the
/// reader until it is dropped.
#[derive(Debug)]
pub struct Decoder<R: Read> {
    reader: BufReader<R>,
    offset: u64,
}

impl<R: Read> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            offset: 0,
        }
    }

    /// Byte offset of the next frame, relative to where decoding started.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Decode the next non-null value.
    ///
    /// Returns `Ok(None)` on a clean end of stream: no bytes left at a frame
    /// boundary. Any partial or damaged frame is an error.
    pub fn decode<T: DeserializeOwned>(&mut self) -> CodecResult<Option<T>> {
        loop {
            let Some(payload) = self.next_payload()? else {
                return Ok(None);
            };
            if payload.is_empty() {
                continue;
            }
            let offset = self.offset - (FRAME_HEADER_SIZE + payload.len()) as u64;
            return serde_json::from_slice(&payload)
                .map(Some)
                .map_err(|source| CodecError::Payload { offset, source });
        }
    }

    /// Decode every remaining value, returning how many there were.
    ///
    /// Used to prove a file is readable end to end before trusting it.
    pub fn validate<T: DeserializeOwned>(&mut self) -> CodecResult<u64> {
        let mut records = 0;
        while self.decode::<T>()?.is_some() {
            records += 1;
        }
        Ok(records)
    }

    fn next_payload(&mut self) -> CodecResult<Option<Vec<u8>>> {
        let offset = self.offset;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let filled = read_full(&mut self.reader, &mut header)?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < FRAME_HEADER_SIZE {
            return Err(CodecError::Truncated {
                offset,
                reason: "short header",
            });
        }
        if header[0..4] != FRAME_MAGIC {
            return Err(CodecError::InvalidMagic { offset });
        }

        let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let length = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                offset,
                length,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut payload = vec![0u8; length];
        if read_full(&mut self.reader, &mut payload)? < length {
            return Err(CodecError::Truncated {
                offset,
                reason: "short payload",
            });
        }

        let actual = crc32fast::hash(&payload);
        if actual != expected {
            return Err(CodecError::ChecksumMismatch {
                offset,
                expected,
                actual,
            });
        }

        self.offset += (FRAME_HEADER_SIZE + length) as u64;
        Ok(Some(payload))
    }
}

/// Fill `buf` as far as the reader allows, returning the bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
