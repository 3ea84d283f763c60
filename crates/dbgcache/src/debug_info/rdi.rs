//! The RDI container: the converted debug info format loaded by the debug-info cache.
//!
//! A container is a fixed little-endian header followed by the payload:
//!
//! | offset | size | field              |
//! |--------|------|--------------------|
//! | 0      | 8    | magic              |
//! | 8      | 4    | `encoding_version` |
//! | 12     | 4    | `flags`            |
//! | 16     | 8    | `unpacked_size`    |
//!
//! When [`FLAG_ZSTD`] is set, the payload is a zstd frame that decompresses to exactly
//! `unpacked_size` bytes.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::Mmap;

/// Identifies RDI containers.
pub const MAGIC: u64 = 0x0000_6762_6464_6172;

/// The payload encoding this build reads and writes.
pub const ENCODING_VERSION: u32 = 1;

/// The payload is zstd compressed.
pub const FLAG_ZSTD: u32 = 1;

/// The size of the container header.
pub const HEADER_SIZE: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum RdiError {
    #[error("failed to read debug info")]
    Io(#[from] io::Error),
    #[error("not an RDI container")]
    BadMagic,
    #[error("unsupported encoding version {0}")]
    UnsupportedVersion(u32),
    #[error("truncated container")]
    Truncated,
    #[error("failed to decompress payload")]
    Decompress(#[source] io::Error),
    #[error("payload unpacked to {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// The header of an RDI container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RdiHeader {
    pub encoding_version: u32,
    pub flags: u32,
    pub unpacked_size: u64,
}

impl RdiHeader {
    /// Parses and validates the header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, RdiError> {
        let header = bytes.get(..HEADER_SIZE).ok_or(RdiError::Truncated)?;
        if !is_rdi(header) {
            return Err(RdiError::BadMagic);
        }
        let encoding_version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if encoding_version != ENCODING_VERSION {
            return Err(RdiError::UnsupportedVersion(encoding_version));
        }
        let flags = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        let mut unpacked_size = [0; 8];
        unpacked_size.copy_from_slice(&header[16..24]);
        Ok(Self {
            encoding_version,
            flags,
            unpacked_size: u64::from_le_bytes(unpacked_size),
        })
    }

    /// Reads and validates the header of the file at `path`.
    pub fn read(path: &Path) -> Result<Self, RdiError> {
        let mut bytes = [0; HEADER_SIZE];
        File::open(path)?.read_exact(&mut bytes).map_err(|error| match error.kind() {
            io::ErrorKind::UnexpectedEof => RdiError::Truncated,
            _ => RdiError::Io(error),
        })?;
        Self::parse(&bytes)
    }

    pub fn is_packed(&self) -> bool {
        self.flags & FLAG_ZSTD != 0
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0; HEADER_SIZE];
        bytes[..8].copy_from_slice(&MAGIC.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.encoding_version.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.flags.to_le_bytes());
        bytes[16..].copy_from_slice(&self.unpacked_size.to_le_bytes());
        bytes
    }
}

/// Checks whether `bytes` start with the RDI magic.
pub fn is_rdi(bytes: &[u8]) -> bool {
    bytes.get(..8).is_some_and(|magic| magic == MAGIC.to_le_bytes())
}

/// Checks whether the file at `path` starts with the RDI magic.
pub fn is_rdi_file(path: &Path) -> bool {
    let mut magic = [0; 8];
    File::open(path)
        .and_then(|mut file| file.read_exact(&mut magic))
        .is_ok_and(|_| is_rdi(&magic))
}

/// Writes `payload` as an RDI container, optionally zstd compressed.
pub fn write_container<W: Write>(mut writer: W, payload: &[u8], compress: bool) -> io::Result<()> {
    let header = RdiHeader {
        encoding_version: ENCODING_VERSION,
        flags: if compress { FLAG_ZSTD } else { 0 },
        unpacked_size: payload.len() as u64,
    };
    writer.write_all(&header.to_bytes())?;
    if compress {
        let packed = zstd::encode_all(payload, 0)?;
        writer.write_all(&packed)?;
    } else {
        writer.write_all(payload)?;
    }
    writer.flush()
}

enum Data {
    Mapped(Mmap),
    Unpacked(Vec<u8>),
}

/// Keeps a count of live [`ParsedDebugInfo`]s.
#[derive(Debug)]
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A loaded RDI container.
///
/// Uncompressed containers stay memory mapped; compressed ones are unpacked into memory.
pub struct ParsedDebugInfo {
    header: RdiHeader,
    data: Data,
    _live: Option<LiveGuard>,
}

impl fmt::Debug for ParsedDebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = match self.data {
            Data::Mapped(_) => "mapped",
            Data::Unpacked(_) => "unpacked",
        };
        f.debug_struct("ParsedDebugInfo")
            .field("header", &self.header)
            .field("data", &data)
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

impl ParsedDebugInfo {
    /// Maps the container at `path`, validating its header and unpacking its payload.
    pub fn open(path: &Path) -> Result<Self, RdiError> {
        let file = File::open(path)?;
        // SAFETY: The converter never rewrites an output in place; a changed file is replaced
        // and loaded again as a new generation.
        let mmap = unsafe { Mmap::map(&file)? };
        let header = RdiHeader::parse(&mmap)?;

        let data = if header.is_packed() {
            let unpacked =
                zstd::decode_all(&mmap[HEADER_SIZE..]).map_err(RdiError::Decompress)?;
            if unpacked.len() as u64 != header.unpacked_size {
                return Err(RdiError::SizeMismatch {
                    expected: header.unpacked_size,
                    actual: unpacked.len() as u64,
                });
            }
            Data::Unpacked(unpacked)
        } else {
            let actual = (mmap.len() - HEADER_SIZE) as u64;
            if actual != header.unpacked_size {
                return Err(RdiError::SizeMismatch {
                    expected: header.unpacked_size,
                    actual,
                });
            }
            Data::Mapped(mmap)
        };

        Ok(Self {
            header,
            data,
            _live: None,
        })
    }

    /// Counts this instance in `counter` for as long as it lives.
    pub(crate) fn tracked(mut self, counter: &Arc<AtomicUsize>) -> Self {
        self._live = Some(LiveGuard::new(counter));
        self
    }

    pub fn header(&self) -> &RdiHeader {
        &self.header
    }

    /// The unpacked payload.
    pub fn payload(&self) -> &[u8] {
        match &self.data {
            Data::Mapped(mmap) => &mmap[HEADER_SIZE..],
            Data::Unpacked(data) => data,
        }
    }
}
