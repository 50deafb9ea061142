//! Frame encoding: zstd compression followed by optional AES-256-GCM sealing.

use crate::crypto::{self, DerivedKey};
use crate::utils::errors::{EngineError, Result};
use std::io::{Read, Write};
use std::sync::Arc;

/// Size of the little-endian frame length prefix
pub const FRAME_HEADER: u64 = 4;

/// Turns source chunks into stored frames and back
#[derive(Clone)]
pub struct FrameCodec {
    level: Option<i32>,
    key: Option<Arc<DerivedKey>>,
}

impl FrameCodec {
    pub fn new(level: Option<i32>, key: Option<Arc<DerivedKey>>) -> Self {
        Self { level, key }
    }

    /// Bytes pass through untouched (mirror trees)
    pub fn identity() -> Self {
        Self {
            level: None,
            key: None,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.level.is_none() && self.key.is_none()
    }

    pub fn encode(&self, chunk: &[u8]) -> Result<Vec<u8>> {
        let compressed = match self.level {
            Some(level) => zstd::stream::encode_all(chunk, level)
                .map_err(|e| EngineError::Compression(e.to_string()))?,
            None => chunk.to_vec(),
        };

        match &self.key {
            Some(key) => crypto::seal(&compressed, key),
            None => Ok(compressed),
        }
    }

    pub fn decode(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let opened = match &self.key {
            Some(key) => crypto::open(frame, key)?,
            None => frame.to_vec(),
        };

        match self.level {
            Some(_) => zstd::stream::decode_all(opened.as_slice())
                .map_err(|e| EngineError::Compression(e.to_string())),
            None => Ok(opened),
        }
    }
}

/// Write one length-prefixed frame, returning the bytes written
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> std::io::Result<u64> {
    let len = u32::try_from(payload.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame exceeds 4 GiB"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    Ok(FRAME_HEADER + payload.len() as u64)
}

/// Iterate the frames of one entry: exactly `length` bytes of `reader`
pub struct FrameReader<R> {
    reader: R,
    remaining: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, length: u64) -> Self {
        Self {
            reader,
            remaining: length,
        }
    }

    /// Next stored frame; `Ok(None)` once the entry's range is consumed
    pub fn next_frame(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if self.remaining < FRAME_HEADER {
            return Err(truncated());
        }

        let mut header = [0u8; 4];
        self.reader.read_exact(&mut header)?;
        let len = u32::from_le_bytes(header) as u64;
        if FRAME_HEADER + len > self.remaining {
            return Err(truncated());
        }

        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload)?;
        self.remaining -= FRAME_HEADER + len;
        Ok(Some(payload))
    }
}

fn truncated() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "frame runs past the entry's stored range")
}
