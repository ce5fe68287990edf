//! Core type definitions for needlefs
//!
//! Fixed-width identifiers shared by the index, the volume files and the
//! wire protocol. Widths here define the on-disk index record layout, so
//! they must never change for an existing deployment.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Width of a needle key in an index record
pub const NEEDLE_ID_SIZE: usize = 8;
/// Width of a compact offset in an index record
pub const OFFSET_SIZE: usize = 4;
/// Width of a size field in an index record
pub const SIZE_SIZE: usize = 4;
/// Width of one index record: key + offset + size
pub const NEEDLE_ENTRY_SIZE: usize = NEEDLE_ID_SIZE + OFFSET_SIZE + SIZE_SIZE;
/// Alignment unit of needles inside a data file
pub const NEEDLE_PADDING_SIZE: u64 = 8;

/// Needle payload size in bytes
pub type Size = u32;

/// Identifier of a volume on a storage node
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct VolumeId(u32);

impl VolumeId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeId({})", self.0)
    }
}

impl FromStr for VolumeId {
    type Err = FileIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim();
        if !is_decimal(digits) {
            return Err(FileIdError::InvalidVolumeId(s.to_string()));
        }
        digits
            .parse::<u32>()
            .map(Self)
            .map_err(|_| FileIdError::InvalidVolumeId(s.to_string()))
    }
}

/// Plain decimal digits; `parse` alone also takes a leading `+`
fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Key of a needle, unique among the live entries of one volume
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
)]
pub struct NeedleId(u64);

impl NeedleId {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Big-endian encoding used in index records
    #[must_use]
    pub const fn to_be_bytes(self) -> [u8; NEEDLE_ID_SIZE] {
        self.0.to_be_bytes()
    }

    #[must_use]
    pub const fn from_be_bytes(bytes: [u8; NEEDLE_ID_SIZE]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Debug for NeedleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NeedleId({:x})", self.0)
    }
}

impl fmt::Display for NeedleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Compact needle position: the physical byte position divided by
/// [`NEEDLE_PADDING_SIZE`].
///
/// `Offset(0)` is the tombstone sentinel. Position 0 of every data file
/// holds the superblock, so no live needle can ever be stored there.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
)]
pub struct Offset(u32);

impl Offset {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Convert a physical byte position into a compact offset.
    ///
    /// Returns `None` when the position is not aligned or does not fit.
    #[must_use]
    pub fn from_actual(position: u64) -> Option<Self> {
        if position % NEEDLE_PADDING_SIZE != 0 {
            return None;
        }
        u32::try_from(position / NEEDLE_PADDING_SIZE).ok().map(Self)
    }

    /// Physical byte position in the data file
    #[must_use]
    pub const fn to_actual(self) -> u64 {
        self.0 as u64 * NEEDLE_PADDING_SIZE
    }

    #[must_use]
    pub const fn to_be_bytes(self) -> [u8; OFFSET_SIZE] {
        self.0.to_be_bytes()
    }

    #[must_use]
    pub const fn from_be_bytes(bytes: [u8; OFFSET_SIZE]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offset({})", self.0)
    }
}

/// Random value stored with a needle and embedded in its file id
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct Cookie(u32);

impl Cookie {
    #[must_use]
    pub const fn new(cookie: u32) -> Self {
        Self(cookie)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie({:08x})", self.0)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Backing structure of a volume's needle index
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeedleMapKind {
    /// Ordered tree, one node per live key
    #[default]
    BTree,
    /// Sorted fixed-width array with an overflow tree for out-of-order keys
    Compact,
}

impl NeedleMapKind {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BTree => "btree",
            Self::Compact => "compact",
        }
    }
}

impl fmt::Display for NeedleMapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for NeedleMapKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "btree" | "b-tree" | "tree" | "" => Ok(Self::BTree),
            "compact" | "array" => Ok(Self::Compact),
            _ => Err(format!("unknown needle map kind: {s}")),
        }
    }
}

/// Parsed `"<volumeId>,<needleKeyHex><cookieHex>"` file identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId {
    pub volume_id: VolumeId,
    pub key: NeedleId,
    pub cookie: Cookie,
}

impl FileId {
    #[must_use]
    pub const fn new(volume_id: VolumeId, key: NeedleId, cookie: Cookie) -> Self {
        Self {
            volume_id,
            key,
            cookie,
        }
    }

    /// Parse the `<needleKeyHex><cookieHex>[_delta]` part of a file id
    pub fn parse_key_cookie(key_cookie: &str) -> Result<(NeedleId, Cookie), FileIdError> {
        let (hash, delta) = match key_cookie.split_once('_') {
            Some((hash, delta)) => (hash, Some(delta)),
            None => (key_cookie, None),
        };

        if !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FileIdError::InvalidHex(hash.to_string()));
        }
        let len = hash.len();
        if len <= 8 {
            return Err(FileIdError::TooShort);
        }
        if len > 24 {
            return Err(FileIdError::TooLong);
        }

        let (key_hex, cookie_hex) = hash.split_at(len - 8);
        let key = u64::from_str_radix(key_hex, 16)
            .map_err(|_| FileIdError::InvalidHex(key_hex.to_string()))?;
        let cookie = u32::from_str_radix(cookie_hex, 16)
            .map_err(|_| FileIdError::InvalidHex(cookie_hex.to_string()))?;

        let key = match delta {
            Some(delta) => {
                if !is_decimal(delta) {
                    return Err(FileIdError::InvalidDelta(delta.to_string()));
                }
                let delta = delta
                    .parse::<u64>()
                    .map_err(|_| FileIdError::InvalidDelta(delta.to_string()))?;
                key.checked_add(delta)
                    .ok_or_else(|| FileIdError::InvalidDelta(delta.to_string()))?
            }
            None => key,
        };

        Ok((NeedleId(key), Cookie(cookie)))
    }
}

impl FromStr for FileId {
    type Err = FileIdError;

    fn from_str(fid: &str) -> Result<Self, Self::Err> {
        let (vid, key_cookie) = fid.split_once(',').ok_or(FileIdError::MissingComma)?;
        if vid.is_empty() {
            return Err(FileIdError::MissingComma);
        }
        let volume_id = vid.parse::<VolumeId>()?;
        let (key, cookie) = Self::parse_key_cookie(key_cookie)?;
        Ok(Self {
            volume_id,
            key,
            cookie,
        })
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{:x}{:08x}", self.volume_id, self.key.0, self.cookie.0)
    }
}

/// Errors that can occur when parsing a file id
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileIdError {
    #[error("wrong fid format: expected <volumeId>,<key><cookie>")]
    MissingComma,
    #[error("invalid volume id: {0}")]
    InvalidVolumeId(String),
    #[error("key hash is too short")]
    TooShort,
    #[error("key hash is too long")]
    TooLong,
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("invalid key delta: {0}")]
    InvalidDelta(String),
}
