//! Needle records in volume data files
//!
//! ```text
//! +--------+------+------+------------+-------+--------+---------+
//! | Cookie | Id   | Size | Data       | Flags | CRC32C | Padding |
//! | 4B     | 8B   | 4B   | Size bytes | 1B    | 4B     | to 8B   |
//! +--------+------+------+------------+-------+--------+---------+
//! ```
//! Integers are big-endian; the CRC covers the data bytes.

use bytes::Bytes;
use needlefs_common::{Cookie, Error, NEEDLE_PADDING_SIZE, NeedleId, Result, Size};

/// Cookie + id + size
pub const NEEDLE_HEADER_SIZE: usize = 16;

/// Flags byte + CRC32C
pub const NEEDLE_TRAILER_SIZE: usize = 5;

/// Needle is a chunk manifest listing the chunks of a large file
pub const FLAG_CHUNK_MANIFEST: u8 = 0x80;

/// Padded on-disk length of a needle with `size` data bytes
#[must_use]
pub const fn disk_size(size: Size) -> u64 {
    let raw = (NEEDLE_HEADER_SIZE + NEEDLE_TRAILER_SIZE) as u64 + size as u64;
    raw.div_ceil(NEEDLE_PADDING_SIZE) * NEEDLE_PADDING_SIZE
}

/// A stored blob
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Needle {
    pub cookie: Cookie,
    pub id: NeedleId,
    pub data: Bytes,
    pub flags: u8,
}

impl Needle {
    pub fn new(id: NeedleId, cookie: Cookie, data: impl Into<Bytes>) -> Self {
        Self {
            cookie,
            id,
            data: data.into(),
            flags: 0,
        }
    }

    #[must_use]
    pub fn with_chunk_manifest(mut self, manifest: bool) -> Self {
        if manifest {
            self.flags |= FLAG_CHUNK_MANIFEST;
        } else {
            self.flags &= !FLAG_CHUNK_MANIFEST;
        }
        self
    }

    #[must_use]
    pub const fn is_chunk_manifest(&self) -> bool {
        self.flags & FLAG_CHUNK_MANIFEST != 0
    }

    /// Data length as stored in the header
    pub fn size(&self) -> Result<Size> {
        Size::try_from(self.data.len()).map_err(|_| {
            Error::invalid_argument(format!(
                "needle {} data of {} bytes exceeds the size field",
                self.id,
                self.data.len()
            ))
        })
    }

    /// Serialize to the padded on-disk form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let size = self.size()?;
        let total = disk_size(size) as usize;
        let mut buf = Vec::with_capacity(total);

        buf.extend_from_slice(&self.cookie.get().to_be_bytes());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.push(self.flags);
        buf.extend_from_slice(&crc32c::crc32c(&self.data).to_be_bytes());
        buf.resize(total, 0);

        Ok(buf)
    }

    /// Parse and verify a needle read from disk
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < NEEDLE_HEADER_SIZE + NEEDLE_TRAILER_SIZE {
            return Err(Error::DataCorruption(format!(
                "needle record too small: {} bytes",
                buf.len()
            )));
        }

        let cookie = Cookie::new(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[4..12]);
        let size = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize;

        let data_end = NEEDLE_HEADER_SIZE + size;
        if buf.len() < data_end + NEEDLE_TRAILER_SIZE {
            return Err(Error::DataCorruption(format!(
                "needle record truncated: size {} needs {} bytes, got {}",
                size,
                data_end + NEEDLE_TRAILER_SIZE,
                buf.len()
            )));
        }

        let data = &buf[NEEDLE_HEADER_SIZE..data_end];
        let flags = buf[data_end];
        let expected = u32::from_be_bytes([
            buf[data_end + 1],
            buf[data_end + 2],
            buf[data_end + 3],
            buf[data_end + 4],
        ]);
        let actual = crc32c::crc32c(data);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            cookie,
            id: NeedleId::from_be_bytes(id),
            data: Bytes::copy_from_slice(data),
            flags,
        })
    }

    /// Parse only the header fields (cookie, id, size)
    pub fn header_from_bytes(buf: &[u8]) -> Result<(Cookie, NeedleId, Size)> {
        if buf.len() < NEEDLE_HEADER_SIZE {
            return Err(Error::DataCorruption("needle header truncated".into()));
        }
        let cookie = Cookie::new(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[4..12]);
        let size = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        Ok((cookie, NeedleId::from_be_bytes(id), size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_size_is_padded() {
        assert_eq!(disk_size(0), 24);
        assert_eq!(disk_size(3), 24);
        assert_eq!(disk_size(4), 32);
        assert_eq!(disk_size(100), 128);
    }

    #[test]
    fn test_needle_bytes() {
        let needle = Needle::new(NeedleId::new(0x1234), Cookie::new(0xdeadbeef), &b"hello"[..]);
        let bytes = needle.to_bytes().unwrap();
        assert_eq!(bytes.len() as u64, disk_size(5));
        assert_eq!(&bytes[..4], &[0xde, 0xad, 0xbe, 0xef]);

        let parsed = Needle::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, needle);
        assert!(!parsed.is_chunk_manifest());

        let (cookie, id, size) = Needle::header_from_bytes(&bytes).unwrap();
        assert_eq!((cookie, id, size), (needle.cookie, needle.id, 5));
    }

    #[test]
    fn test_chunk_manifest_flag() {
        let needle = Needle::new(NeedleId::new(1), Cookie::new(1), &b"[]"[..]).with_chunk_manifest(true);
        assert_eq!(needle.flags, FLAG_CHUNK_MANIFEST);
        let parsed = Needle::from_bytes(&needle.to_bytes().unwrap()).unwrap();
        assert!(parsed.is_chunk_manifest());
        assert!(!parsed.with_chunk_manifest(false).is_chunk_manifest());
    }

    #[test]
    fn test_corrupted_data_fails_checksum() {
        let needle = Needle::new(NeedleId::new(1), Cookie::new(2), &b"payload"[..]);
        let mut bytes = needle.to_bytes().unwrap();
        bytes[NEEDLE_HEADER_SIZE] ^= 0xFF;

        assert!(matches!(
            Needle::from_bytes(&bytes),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_needle() {
        let needle = Needle::new(NeedleId::new(1), Cookie::new(2), vec![7u8; 64]);
        let bytes = needle.to_bytes().unwrap();
        assert!(matches!(
            Needle::from_bytes(&bytes[..40]),
            Err(Error::DataCorruption(_))
        ));
    }
}
