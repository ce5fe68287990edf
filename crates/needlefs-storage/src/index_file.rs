//! Needle index log
//!
//! Append-only log with one fixed-size record per insert, overwrite or delete:
//! ```text
//! +----------+--------+------+
//! | NeedleId | Offset | Size |
//! | 8B       | 4B     | 4B   |
//! +----------+--------+------+
//! ```
//! All fields are big-endian. A delete is written as `(key, 0, 0)`; offset
//! zero is the only tombstone signal during replay.

use needlefs_common::{
    Error, NEEDLE_ENTRY_SIZE, NEEDLE_ID_SIZE, NeedleId, OFFSET_SIZE, Offset, Result, SIZE_SIZE,
    Size,
};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;

/// Read buffer used when walking index files
const READ_BUFFER_SIZE: usize = 64 * 1024; // 64KB

/// One index log record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexRecord {
    pub key: NeedleId,
    pub offset: Offset,
    pub size: Size,
}

impl IndexRecord {
    /// Encoded size in bytes
    pub const SIZE: usize = NEEDLE_ENTRY_SIZE;

    #[must_use]
    pub const fn new(key: NeedleId, offset: Offset, size: Size) -> Self {
        Self { key, offset, size }
    }

    /// Record marking `key` deleted
    #[must_use]
    pub const fn tombstone(key: NeedleId) -> Self {
        Self::new(key, Offset::ZERO, 0)
    }

    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.offset.is_zero()
    }

    /// Serialize to the 16-byte wire form
    #[must_use]
    pub fn to_bytes(&self) -> [u8; NEEDLE_ENTRY_SIZE] {
        let mut buf = [0u8; NEEDLE_ENTRY_SIZE];
        buf[..NEEDLE_ID_SIZE].copy_from_slice(&self.key.to_be_bytes());
        buf[NEEDLE_ID_SIZE..NEEDLE_ID_SIZE + OFFSET_SIZE].copy_from_slice(&self.offset.to_be_bytes());
        buf[NEEDLE_ID_SIZE + OFFSET_SIZE..].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    /// Parse the first record in `data`
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < NEEDLE_ENTRY_SIZE {
            return Err(Error::DataCorruption(format!(
                "index record needs {} bytes, got {}",
                NEEDLE_ENTRY_SIZE,
                data.len()
            )));
        }

        let mut key = [0u8; NEEDLE_ID_SIZE];
        let mut offset = [0u8; OFFSET_SIZE];
        let mut size = [0u8; SIZE_SIZE];
        key.copy_from_slice(&data[..NEEDLE_ID_SIZE]);
        offset.copy_from_slice(&data[NEEDLE_ID_SIZE..NEEDLE_ID_SIZE + OFFSET_SIZE]);
        size.copy_from_slice(&data[NEEDLE_ID_SIZE + OFFSET_SIZE..NEEDLE_ENTRY_SIZE]);

        Ok(Self {
            key: NeedleId::from_be_bytes(key),
            offset: Offset::from_be_bytes(offset),
            size: Size::from_be_bytes(size),
        })
    }
}

/// Turns an arbitrarily chunked byte stream back into whole records.
///
/// Bytes that do not yet complete a record are held until the next chunk.
#[derive(Debug, Default)]
pub struct RecordReassembler {
    pending: Vec<u8>,
}

impl RecordReassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, calling `f` for every record it completes.
    ///
    /// Returns the number of records emitted.
    pub fn push<F>(&mut self, chunk: &[u8], mut f: F) -> Result<u64>
    where
        F: FnMut(IndexRecord) -> Result<()>,
    {
        let mut input = chunk;
        let mut emitted = 0u64;

        if !self.pending.is_empty() {
            let take = (NEEDLE_ENTRY_SIZE - self.pending.len()).min(input.len());
            self.pending.extend_from_slice(&input[..take]);
            input = &input[take..];

            if self.pending.len() < NEEDLE_ENTRY_SIZE {
                return Ok(0);
            }
            f(IndexRecord::from_bytes(&self.pending)?)?;
            self.pending.clear();
            emitted += 1;
        }

        let mut records = input.chunks_exact(NEEDLE_ENTRY_SIZE);
        for raw in &mut records {
            f(IndexRecord::from_bytes(raw)?)?;
            emitted += 1;
        }
        self.pending.extend_from_slice(records.remainder());

        Ok(emitted)
    }

    /// Bytes held back waiting for the rest of a record
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// End of input: any held-back bytes mean the stream was cut mid-record
    pub fn finish(self) -> Result<()> {
        match self.pending.len() {
            0 => Ok(()),
            leftover => Err(Error::CorruptStream { leftover }),
        }
    }
}

/// Summary of one pass over an index file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexWalk {
    /// Complete records visited
    pub records: u64,
    /// Length of the file prefix made of complete records
    pub valid_len: u64,
    /// Trailing bytes that do not form a record (torn write)
    pub torn_bytes: usize,
}

/// Stream every complete record of an index file through `f`.
///
/// A missing file walks as empty. A torn trailing record is reported in
/// [`IndexWalk::torn_bytes`] and never passed to `f`.
pub fn walk_index_file<F>(path: impl AsRef<Path>, mut f: F) -> Result<IndexWalk>
where
    F: FnMut(IndexRecord) -> Result<()>,
{
    let mut file = match File::open(path.as_ref()) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(IndexWalk::default()),
        Err(e) => return Err(Error::Storage(format!("failed to open {:?} for streaming: {}", path.as_ref(), e))),
    };

    let mut reassembler = RecordReassembler::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut walk = IndexWalk::default();

    loop {
        let bytes_read = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Storage(format!("failed to read index: {}", e))),
        };
        walk.records += reassembler.push(&buf[..bytes_read], &mut f)?;
    }

    walk.valid_len = walk.records * NEEDLE_ENTRY_SIZE as u64;
    walk.torn_bytes = reassembler.pending();
    Ok(walk)
}

/// Reads a fixed-length prefix of a volume file in chunks
pub struct FileChunks {
    file: File,
    remaining: u64,
    chunk_size: usize,
}

impl FileChunks {
    /// Open `path` for reading its first `len` bytes
    pub fn open(path: impl AsRef<Path>, len: u64, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::Storage(format!("failed to open {:?} for streaming: {}", path, e)))?;
        Ok(Self {
            file,
            remaining: len,
            chunk_size: chunk_size.max(1),
        })
    }
}

impl Iterator for FileChunks {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let want = self.remaining.min(self.chunk_size as u64) as usize;
        let mut chunk = vec![0u8; want];
        match self.file.read_exact(&mut chunk) {
            Ok(()) => {
                self.remaining -= want as u64;
                Some(Ok(chunk))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(Error::Storage(format!("failed to read chunk: {}", e))))
            }
        }
    }
}

/// Buffered append-only index log writer
pub struct IndexLog {
    writer: BufWriter<File>,
    len: u64,
}

impl IndexLog {
    /// Create (or truncate) an index log
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path.as_ref())
            .map_err(|e| Error::Storage(format!("failed to create index: {}", e)))?;

        Ok(Self {
            writer: BufWriter::with_capacity(READ_BUFFER_SIZE, file),
            len: 0,
        })
    }

    /// Open an index log for appending
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .map_err(|e| Error::Storage(format!("failed to open {:?} for streaming: {}", path.as_ref(), e)))?;
        let len = file.metadata()?.len();

        Ok(Self {
            writer: BufWriter::with_capacity(READ_BUFFER_SIZE, file),
            len,
        })
    }

    pub fn append(&mut self, record: &IndexRecord) -> Result<()> {
        self.writer
            .write_all(&record.to_bytes())
            .map_err(|e| Error::Storage(format!("index write failed: {}", e)))?;
        self.len += NEEDLE_ENTRY_SIZE as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| Error::Storage(format!("index flush failed: {}", e)))
    }

    /// Flush and fsync
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::Storage(format!("index sync failed: {}", e)))
    }

    /// Log length in bytes, buffered records included
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}
