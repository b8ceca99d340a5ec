//! Cached, streaming access to compressed transcript archives.
//!
//! Many work units reference the same archive; parsing its member index once
//! per process and caching it keeps scheduler throughput independent of
//! archive (possibly remote) round-trips. The cache is an explicit service
//! with injected lifetime: construct one per process, share it by `Arc`.

pub mod byte_reader;
pub mod central_directory;

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use flate2::read::DeflateDecoder;
use futures::stream::BoxStream;
use tracing::debug;

use tracemill_model::{SourceDescriptor, TranscriptRef};

use crate::error::{EngineError, Result};
use crate::source::{ContentFilter, TranscriptContent, TranscriptSource};

pub use byte_reader::{ByteReader, ChunkFeed};
pub use central_directory::{
    CentralDirectory, CompressionMethod, MemberEntry, parse_central_directory,
};
use central_directory::{LFH_LEN, SIG_LFH};

/// Process-wide cache of parsed archive member indexes.
///
/// `get_or_parse` uses a per-identity lock created on demand; the coarse
/// `locks` mutex guards only the "does this identity's lock exist" check,
/// never the parse itself, so distinct archives never block each other.
#[derive(Debug, Default)]
pub struct ArchiveDirectoryCache {
    directories: DashMap<String, Arc<CentralDirectory>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArchiveDirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn identity_lock(&self, identity: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| EngineError::Internal("archive lock map poisoned".into()))?;
        Ok(locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    /// Return the cached central directory for `archive`, parsing it exactly
    /// once under concurrent first access.
    pub async fn get_or_parse(&self, archive: &Path) -> Result<Arc<CentralDirectory>> {
        let identity = archive.display().to_string();
        if let Some(dir) = self.directories.get(&identity) {
            return Ok(dir.clone());
        }

        let lock = self.identity_lock(&identity)?;
        let _guard = lock.lock().await;
        // Re-check under the identity lock: a racing caller may have parsed.
        if let Some(dir) = self.directories.get(&identity) {
            return Ok(dir.clone());
        }

        let path = archive.to_path_buf();
        let parse_identity = identity.clone();
        let directory = tokio::task::spawn_blocking(move || {
            let mut file = File::open(&path).map_err(|e| EngineError::CorruptArchive {
                archive: parse_identity.clone(),
                reason: format!("open failed: {e}"),
            })?;
            parse_central_directory(&mut file, &parse_identity)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("archive parse task failed: {e}")))??;

        debug!(archive = %identity, members = directory.len(), "parsed archive central directory");
        let directory = Arc::new(directory);
        self.directories.insert(identity, directory.clone());
        Ok(directory)
    }

    /// Like [`Self::get_or_parse`], but for non-seekable origins: the byte
    /// source (pull or push) is drained through the [`ByteReader`] adapter
    /// into memory, then indexed from the buffer. Archives arriving as chunk
    /// callbacks rather than files reach the same cache this way. `identity`
    /// keys the cache entry and labels error reports.
    pub async fn get_or_parse_stream(
        &self,
        identity: &str,
        source: ByteReader,
    ) -> Result<Arc<CentralDirectory>> {
        if let Some(dir) = self.directories.get(identity) {
            return Ok(dir.clone());
        }

        let lock = self.identity_lock(identity)?;
        let _guard = lock.lock().await;
        if let Some(dir) = self.directories.get(identity) {
            return Ok(dir.clone());
        }

        let parse_identity = identity.to_string();
        let directory = tokio::task::spawn_blocking(move || {
            let mut source = source;
            let mut buffer = Vec::new();
            source
                .read_to_end(&mut buffer)
                .map_err(|e| EngineError::CorruptArchive {
                    archive: parse_identity.clone(),
                    reason: format!("stream read failed: {e}"),
                })?;
            parse_central_directory(&mut std::io::Cursor::new(buffer), &parse_identity)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("archive parse task failed: {e}")))??;

        debug!(archive = %identity, members = directory.len(), "parsed streamed central directory");
        let directory = Arc::new(directory);
        self.directories.insert(identity.to_string(), directory.clone());
        Ok(directory)
    }

    /// Number of cached directories, for tests and metrics.
    pub fn cached_len(&self) -> usize {
        self.directories.len()
    }
}

/// Open handle on one archive member.
///
/// Holds the underlying file handle for its scope; `reader()` may be called
/// repeatedly, each call yielding a fresh bounded, lazily-decompressing pass
/// over the member's byte range. The handle is released deterministically by
/// `close()` or by drop, so a consumer that obtains the stream and abandons
/// it before iterating still releases the handle.
#[derive(Debug)]
pub struct ArchiveMember {
    archive: String,
    name: String,
    entry: MemberEntry,
    data_offset: u64,
    file: Option<File>,
}

impl ArchiveMember {
    /// Open `name` within the archive at `path`, resolving the payload
    /// offset through the member's local file header.
    pub fn open(path: &Path, directory: &CentralDirectory, name: &str) -> Result<Self> {
        let archive = path.display().to_string();
        let entry = *directory
            .get(name)
            .ok_or_else(|| EngineError::MemberNotFound {
                archive: archive.clone(),
                member: name.to_string(),
            })?;

        let mut file = File::open(path)?;
        let file_len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(entry.header_offset))?;
        let mut lfh = [0u8; LFH_LEN];
        file.read_exact(&mut lfh)?;
        if u32::from_le_bytes([lfh[0], lfh[1], lfh[2], lfh[3]]) != SIG_LFH {
            return Err(EngineError::CorruptArchive {
                archive,
                reason: format!("bad local header for member '{name}'"),
            });
        }
        let name_len = u16::from_le_bytes([lfh[26], lfh[27]]) as u64;
        let extra_len = u16::from_le_bytes([lfh[28], lfh[29]]) as u64;
        let data_offset = entry.header_offset + LFH_LEN as u64 + name_len + extra_len;
        if data_offset.saturating_add(entry.compressed_size) > file_len {
            return Err(EngineError::CorruptArchive {
                archive,
                reason: format!("member '{name}' payload out of bounds"),
            });
        }

        Ok(Self {
            archive,
            name: name.to_string(),
            entry,
            data_offset,
            file: Some(file),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.entry.uncompressed_size
    }

    /// Fresh decompressing reader over the member payload. Re-iterable while
    /// the member is open.
    pub fn reader(&mut self) -> Result<MemberReader<'_>> {
        let compressed = self.entry.compressed_size;
        let method = self.entry.method;
        let offset = self.data_offset;
        let file = self.file.as_mut().ok_or_else(|| EngineError::Internal(
            format!("member '{}' already closed", self.name),
        ))?;
        file.seek(SeekFrom::Start(offset))?;
        let bounded = Read::take(file, compressed);
        Ok(match method {
            CompressionMethod::Stored => MemberReader::Stored(bounded),
            CompressionMethod::Deflate => MemberReader::Deflate(DeflateDecoder::new(bounded)),
        })
    }

    /// Read the whole decompressed payload.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let expected = self.entry.uncompressed_size as usize;
        let archive = self.archive.clone();
        let name = self.name.clone();
        let mut out = Vec::with_capacity(expected);
        self.reader()?
            .read_to_end(&mut out)
            .map_err(|e| EngineError::CorruptArchive {
                archive,
                reason: format!("member '{name}' failed to decompress: {e}"),
            })?;
        Ok(out)
    }

    /// Release the underlying handle now instead of at drop.
    pub fn close(&mut self) {
        self.file = None;
    }
}

/// Bounded, lazily-decompressing stream over one member's byte range.
pub enum MemberReader<'a> {
    Stored(std::io::Take<&'a mut File>),
    Deflate(DeflateDecoder<std::io::Take<&'a mut File>>),
}

impl std::fmt::Debug for MemberReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberReader::Stored(_) => f.write_str("MemberReader::Stored"),
            MemberReader::Deflate(_) => f.write_str("MemberReader::Deflate"),
        }
    }
}

impl Read for MemberReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            MemberReader::Stored(r) => r.read(buf),
            MemberReader::Deflate(r) => r.read(buf),
        }
    }
}

/// Transcript source over a zip archive of transcript files. Member stems are
/// transcript ids; the shared directory cache avoids re-parsing the index for
/// every unit.
#[derive(Debug, Clone)]
pub struct ArchiveTranscriptSource {
    path: PathBuf,
    cache: Arc<ArchiveDirectoryCache>,
}

impl ArchiveTranscriptSource {
    pub fn new(path: impl Into<PathBuf>, cache: Arc<ArchiveDirectoryCache>) -> Self {
        Self {
            path: path.into(),
            cache,
        }
    }

    fn transcript_id(member: &str) -> Option<&str> {
        let file = member.rsplit('/').next()?;
        let stem = file
            .strip_suffix(".jsonl")
            .or_else(|| file.strip_suffix(".json"))?;
        (!stem.is_empty()).then_some(stem)
    }
}

#[async_trait]
impl TranscriptSource for ArchiveTranscriptSource {
    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            kind: "archive".to_string(),
            location: self.path.display().to_string(),
        }
    }

    fn enumerate(&self) -> BoxStream<'_, Result<TranscriptRef>> {
        Box::pin(async_stream::try_stream! {
            let directory = self.cache.get_or_parse(&self.path).await?;
            let mut members: Vec<String> =
                directory.member_names().map(str::to_string).collect();
            members.sort();
            for member in members {
                if let Some(id) = Self::transcript_id(&member) {
                    yield TranscriptRef::in_archive(id, member.clone());
                }
            }
        })
    }

    async fn read(&self, id: &str, _filter: ContentFilter) -> Result<TranscriptContent> {
        let directory = self.cache.get_or_parse(&self.path).await?;
        let member = directory
            .member_names()
            .find(|name| Self::transcript_id(name) == Some(id))
            .map(str::to_string)
            .ok_or_else(|| EngineError::TranscriptNotFound(id.to_string()))?;

        let path = self.path.clone();
        let directory = directory.clone();
        let id_owned = id.to_string();
        let body = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut open = ArchiveMember::open(&path, &directory, &member)?;
            let bytes = open.read_all()?;
            open.close();
            Ok(bytes)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("archive read task failed: {e}")))??;

        Ok(TranscriptContent {
            id: id_owned,
            body,
            segment: None,
        })
    }
}
