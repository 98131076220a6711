//! Core identifiers and byte-range arithmetic shared by the layout manager.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length value meaning "to the end of the file, whatever its size".
pub const NFS4_UINT64_MAX: u64 = u64::MAX;

/// A file, identified by its filesystem id and file id within that filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId {
    /// Filesystem id (used by FSID-wide layout returns)
    pub fsid: u64,
    /// File id within the filesystem
    pub ino: u64,
}

impl FileId {
    /// Creates a file id.
    pub fn new(fsid: u64, ino: u64) -> Self {
        Self { fsid, ino }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fsid, self.ino)
    }
}

/// A client, as established by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{:x}", self.0)
    }
}

/// Opaque 16-byte pNFS device identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub [u8; 16]);

impl DeviceId {
    /// Builds a device id whose trailing 8 bytes carry `n` big-endian.
    pub fn from_u64(n: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[8..16].copy_from_slice(&n.to_be_bytes());
        DeviceId(bytes)
    }

    /// Hex rendering of the id.
    pub fn as_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_hex())
    }
}

/// pNFS layout type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum LayoutType {
    /// Object-based layout, version 2
    ObjectsV2 = 5,
    /// Flexible File layout (RFC 8435)
    FlexFiles = 4,
}

impl LayoutType {
    /// Converts a u32 value to a LayoutType, returning None for unknown values.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            4 => Some(LayoutType::FlexFiles),
            5 => Some(LayoutType::ObjectsV2),
            _ => None,
        }
    }
}

impl fmt::Display for LayoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutType::ObjectsV2 => f.write_str("OBJECTS_V2"),
            LayoutType::FlexFiles => f.write_str("FLEX_FILES"),
        }
    }
}

/// pNFS I/O mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum IoMode {
    /// Read-only access
    Read = 1,
    /// Read-write access
    ReadWrite = 2,
    /// Any access mode (only meaningful when returning layouts)
    Any = 3,
}

impl IoMode {
    /// Converts a u32 value to an IoMode, returning None for invalid values.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(IoMode::Read),
            2 => Some(IoMode::ReadWrite),
            3 => Some(IoMode::Any),
            _ => None,
        }
    }

    /// Whether a return/recall filter of this mode selects segments of `held` mode.
    pub fn matches(self, held: IoMode) -> bool {
        self == IoMode::Any || self == held
    }

    /// Whether two outstanding modes held by different clients conflict.
    pub fn conflicts_with(self, other: IoMode) -> bool {
        self == IoMode::ReadWrite || other == IoMode::ReadWrite
    }
}

/// RPC credential flavors a storage device may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFlavor {
    /// AUTH_NONE
    None,
    /// AUTH_SYS
    Sys,
    /// AUTH_SHORT
    Short,
    /// AUTH_DH
    Dh,
    /// RPCSEC_GSS
    RpcsecGss,
}

/// A byte range within a file. A length of [`NFS4_UINT64_MAX`] runs to infinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// Starting byte offset
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
}

impl ByteRange {
    /// Creates a range.
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// The whole file.
    pub fn whole_file() -> Self {
        Self::new(0, NFS4_UINT64_MAX)
    }

    /// From `offset` to infinity.
    pub fn to_end(offset: u64) -> Self {
        Self::new(offset, NFS4_UINT64_MAX)
    }

    /// Builds the range `[start, end)`; an `end` of `u64::MAX` is unbounded.
    pub fn from_bounds(start: u64, end: u64) -> Self {
        if end == u64::MAX {
            Self::to_end(start)
        } else {
            Self::new(start, end.saturating_sub(start))
        }
    }

    /// Whether the range runs to infinity.
    pub fn is_unbounded(&self) -> bool {
        self.length == NFS4_UINT64_MAX || self.offset.checked_add(self.length).is_none()
    }

    /// Whether the range covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Exclusive end offset; `u64::MAX` for unbounded ranges.
    pub fn end(&self) -> u64 {
        if self.is_unbounded() {
            u64::MAX
        } else {
            self.offset + self.length
        }
    }

    /// Whether the range covers a given byte offset
    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }

    /// Whether the two ranges share at least one byte.
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.offset < other.end()
            && other.offset < self.end()
    }

    /// Whether `other` lies entirely within this range.
    pub fn contains(&self, other: &ByteRange) -> bool {
        other.offset >= self.offset && other.end() <= self.end()
    }

    /// Whether `other` lies strictly inside this range, touching neither end.
    pub fn is_interior(&self, other: &ByteRange) -> bool {
        !other.is_empty() && other.offset > self.offset && other.end() < self.end()
    }

    /// The parts of this range not covered by `other` (zero, one or two pieces).
    pub fn subtract(&self, other: &ByteRange) -> Vec<ByteRange> {
        if !self.overlaps(other) {
            return vec![*self];
        }
        let mut pieces = Vec::with_capacity(2);
        if other.offset > self.offset {
            pieces.push(ByteRange::from_bounds(self.offset, other.offset));
        }
        if other.end() < self.end() {
            pieces.push(ByteRange::from_bounds(other.end(), self.end()));
        }
        pieces
    }

    /// Merges overlapping or adjacent ranges into one.
    pub fn coalesce(&self, other: &ByteRange) -> Option<ByteRange> {
        let touching = self.overlaps(other)
            || self.end() == other.offset
            || other.end() == self.offset;
        if !touching {
            return None;
        }
        Some(ByteRange::from_bounds(
            self.offset.min(other.offset),
            self.end().max(other.end()),
        ))
    }

    /// Whether the union of `ranges` covers this range completely.
    pub fn covered_by(&self, ranges: &[ByteRange]) -> bool {
        if self.is_empty() {
            return true;
        }
        let mut sorted: Vec<&ByteRange> = ranges.iter().filter(|r| !r.is_empty()).collect();
        sorted.sort_by_key(|r| r.offset);

        let mut cursor = self.offset;
        for r in sorted {
            if r.offset > cursor {
                break;
            }
            if r.end() > cursor {
                cursor = r.end();
            }
            if cursor >= self.end() {
                return true;
            }
        }
        cursor >= self.end()
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbounded() {
            write!(f, "[{}, inf)", self.offset)
        } else {
            write!(f, "[{}, {})", self.offset, self.end())
        }
    }
}
