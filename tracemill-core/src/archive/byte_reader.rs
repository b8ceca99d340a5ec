//! Unified pull/push byte source adapter.
//!
//! The archive layer consumes bytes through one `read(n)` contract whether
//! the underlying source is pull-style (anything implementing [`Read`]) or
//! push-style (externally driven chunks of arbitrary size, e.g. a download
//! callback handing over buffers). For push sources the adapter holds the
//! current chunk and an offset, pulling another chunk only when the remainder
//! cannot satisfy the request.

use std::io::{self, Read};

/// Supplier of push-style chunks. `Ok(None)` signals end of input.
pub trait ChunkFeed: Send {
    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>>;
}

impl<I> ChunkFeed for I
where
    I: Iterator<Item = Vec<u8>> + Send,
{
    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.next())
    }
}

/// Byte source adapter over a pull or push origin.
///
/// Contract: `read(0)` returns an empty buffer without consuming input;
/// reading past end-of-input returns whatever remains, never an error.
pub enum ByteReader {
    Pull(Box<dyn Read + Send>),
    Push {
        feed: Box<dyn ChunkFeed>,
        current: Vec<u8>,
        offset: usize,
        exhausted: bool,
    },
}

impl std::fmt::Debug for ByteReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ByteReader::Pull(_) => f.write_str("ByteReader::Pull"),
            ByteReader::Push {
                current, offset, ..
            } => f
                .debug_struct("ByteReader::Push")
                .field("buffered", &(current.len() - offset))
                .finish(),
        }
    }
}

impl ByteReader {
    pub fn from_pull(reader: impl Read + Send + 'static) -> Self {
        ByteReader::Pull(Box::new(reader))
    }

    pub fn from_push(feed: impl ChunkFeed + 'static) -> Self {
        ByteReader::Push {
            feed: Box::new(feed),
            current: Vec::new(),
            offset: 0,
            exhausted: false,
        }
    }

    /// Read up to `n` bytes. Returns fewer only at end of input.
    pub fn read_n(&mut self, n: usize) -> io::Result<Vec<u8>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        match self {
            ByteReader::Pull(reader) => {
                let mut out = vec![0u8; n];
                let mut filled = 0;
                while filled < n {
                    match reader.read(&mut out[filled..]) {
                        Ok(0) => break,
                        Ok(read) => filled += read,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                out.truncate(filled);
                Ok(out)
            }
            ByteReader::Push {
                feed,
                current,
                offset,
                exhausted,
            } => {
                let mut out = Vec::with_capacity(n);
                loop {
                    let available = current.len() - *offset;
                    if available > 0 {
                        let take = available.min(n - out.len());
                        out.extend_from_slice(&current[*offset..*offset + take]);
                        *offset += take;
                    }
                    if out.len() == n || *exhausted {
                        return Ok(out);
                    }
                    match feed.next_chunk()? {
                        Some(chunk) => {
                            *current = chunk;
                            *offset = 0;
                        }
                        None => {
                            *exhausted = true;
                            return Ok(out);
                        }
                    }
                }
            }
        }
    }
}

impl Read for ByteReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = self.read_n(buf.len())?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}
