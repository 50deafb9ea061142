//! Reading stored entries back out of an archive.

use super::BackupArchive;
use crate::executor::codec::{FrameCodec, FrameReader};
use crate::executor::manifest::{BackupFileEntry, StoredLocation};
use crate::utils::errors::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Hashes of one entry as found at the destination
#[derive(Debug, Clone)]
pub struct EntryDigest {
    pub stored_hash: String,
    /// Content hash and length, when the entry was decoded
    pub content: Option<(String, u64)>,
}

/// Reader that hashes everything passing through it
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Stream one entry. With a codec the content is decoded and passed to
/// `sink` chunk by chunk; without one only the stored bytes are hashed.
pub fn read_entry<F>(
    archive: &BackupArchive,
    entry: &BackupFileEntry,
    codec: Option<&FrameCodec>,
    mut sink: F,
) -> Result<EntryDigest>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    match &entry.location {
        StoredLocation::Tree { path } => read_plain(&archive.path.join(path), codec.is_some(), sink),
        StoredLocation::Raw => read_plain(&archive.path, codec.is_some(), sink),
        StoredLocation::Packed { offset, length } => {
            let mut file = File::open(&archive.path)?;
            file.seek(SeekFrom::Start(*offset))?;
            let mut hashing = HashingReader {
                inner: BufReader::new(file).take(*length),
                hasher: Sha256::new(),
            };

            let content = match codec {
                Some(codec) => {
                    let mut frames = FrameReader::new(&mut hashing, *length);
                    let mut content_hasher = Sha256::new();
                    let mut total = 0u64;
                    while let Some(frame) = frames.next_frame()? {
                        let plain = codec.decode(&frame)?;
                        content_hasher.update(&plain);
                        total += plain.len() as u64;
                        sink(&plain)?;
                    }
                    Some((format!("{:x}", content_hasher.finalize()), total))
                }
                None => {
                    let copied = std::io::copy(&mut hashing, &mut std::io::sink())?;
                    if copied != *length {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "payload is shorter than the recorded entry",
                        )
                        .into());
                    }
                    None
                }
            };

            Ok(EntryDigest {
                stored_hash: format!("{:x}", hashing.hasher.finalize()),
                content,
            })
        }
    }
}

/// Stored bytes equal the content: one pass yields both hashes
fn read_plain<F>(path: &Path, decode: bool, mut sink: F) -> Result<EntryDigest>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
        if decode {
            sink(&buf[..n])?;
        }
    }
    let hash = format!("{:x}", hasher.finalize());
    Ok(EntryDigest {
        content: decode.then(|| (hash.clone(), total)),
        stored_hash: hash,
    })
}
