//! Archive binary format
//!
//! All multi-byte integers are little-endian. A file is
//!
//! ```text
//! ┌──────────────────────┐
//! │ ArchiveHeader (40 B) │
//! ├──────────────────────┤
//! │ classes              │  (name, class-file blob)*
//! │ heap objects         │  (class name, fields, payload)*
//! │ heap roots           │  (name, object index)*
//! ├──────────────────────┤
//! │ SHA-256 of payload   │
//! └──────────────────────┘
//! ```
//!
//! The header carries the layout parameters the archive was dumped with;
//! loading under different parameters is refused.

use super::ArchiveError;
use crate::codec::{ByteReader, ByteWriter};
use sha2::{Digest, Sha256};

/// Magic bytes: "HLYDCDS\0"
pub const ARCHIVE_MAGIC: [u8; 8] = *b"HLYDCDS\0";

/// Current archive format version
pub const ARCHIVE_VERSION: u32 = 1;

/// Endianness marker; reads back swapped on a big-endian writer
pub const ENDIANNESS_MARKER: u32 = 0x0102_0304;

/// Encoded header size
pub const HEADER_SIZE: usize = 40;

/// Checksum trailer size
pub const CHECKSUM_SIZE: usize = 32;

/// Header flag: the archive has a heap-object section
pub const FLAG_HEAP_OBJECTS: u8 = 0x01;

/// Pointer width of this process in bits
pub const NATIVE_POINTER_WIDTH: u8 = (std::mem::size_of::<usize>() * 8) as u8;

/// Archive header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    /// Format version
    pub version: u32,
    /// Pointer width in bits of the dumping process
    pub pointer_width: u8,
    /// Whether references were compressed when dumped
    pub compressed_refs: bool,
    /// log2 of the region size heap objects were laid out for
    pub region_size_log2: u8,
    /// `FLAG_*` bits
    pub flags: u8,
    /// Number of archived classes
    pub class_count: u32,
    /// Number of archived heap objects
    pub object_count: u32,
    /// Number of named heap roots
    pub root_count: u32,
    /// Payload length in bytes
    pub payload_len: u64,
}

impl ArchiveHeader {
    /// Whether a heap-object section is present
    pub fn has_heap_objects(&self) -> bool {
        self.flags & FLAG_HEAP_OBJECTS != 0
    }

    /// Region size the heap section was laid out for
    pub fn region_size(&self) -> usize {
        1usize << self.region_size_log2
    }

    /// Encode the header
    pub fn encode(&self, writer: &mut ByteWriter) {
        writer.emit_bytes(&ARCHIVE_MAGIC);
        writer.emit_u32(self.version);
        writer.emit_u32(ENDIANNESS_MARKER);
        writer.emit_u8(self.pointer_width);
        writer.emit_u8(self.compressed_refs as u8);
        writer.emit_u8(self.region_size_log2);
        writer.emit_u8(self.flags);
        writer.emit_u32(self.class_count);
        writer.emit_u32(self.object_count);
        writer.emit_u32(self.root_count);
        writer.emit_u64(self.payload_len);
    }

    /// Decode and validate the header
    pub fn decode(bytes: &[u8]) -> Result<Self, ArchiveError> {
        let mut reader = ByteReader::new(bytes);
        let corrupt = |e: crate::codec::DecodeError| ArchiveError::corrupt(format!("header: {}", e));
        if reader.read_bytes(8).map_err(corrupt)? != ARCHIVE_MAGIC {
            return Err(ArchiveError::corrupt("invalid magic"));
        }
        let version = reader.read_u32().map_err(corrupt)?;
        if version != ARCHIVE_VERSION {
            return Err(ArchiveError::corrupt(format!(
                "format version {} (expected {})",
                version, ARCHIVE_VERSION
            )));
        }
        match reader.read_u32().map_err(corrupt)? {
            ENDIANNESS_MARKER => {}
            marker if marker == ENDIANNESS_MARKER.swap_bytes() => {
                return Err(ArchiveError::ArchiveIncompatible(
                    "archive was written with a different byte order".to_string(),
                ))
            }
            _ => return Err(ArchiveError::corrupt("invalid endianness marker")),
        }
        let pointer_width = reader.read_u8().map_err(corrupt)?;
        let compressed_refs = match reader.read_u8().map_err(corrupt)? {
            0 => false,
            1 => true,
            other => {
                return Err(ArchiveError::corrupt(format!(
                    "invalid compressed-refs flag {}",
                    other
                )))
            }
        };
        let region_size_log2 = reader.read_u8().map_err(corrupt)?;
        if region_size_log2 >= usize::BITS as u8 {
            return Err(ArchiveError::corrupt(format!(
                "region size 2^{}",
                region_size_log2
            )));
        }
        Ok(Self {
            version,
            pointer_width,
            compressed_refs,
            region_size_log2,
            flags: reader.read_u8().map_err(corrupt)?,
            class_count: reader.read_u32().map_err(corrupt)?,
            object_count: reader.read_u32().map_err(corrupt)?,
            root_count: reader.read_u32().map_err(corrupt)?,
            payload_len: reader.read_u64().map_err(corrupt)?,
        })
    }

    /// Check the header against the running configuration
    pub fn check_compatible(&self, compressed_refs: bool) -> Result<(), ArchiveError> {
        if self.pointer_width != NATIVE_POINTER_WIDTH {
            return Err(ArchiveError::ArchiveIncompatible(format!(
                "pointer width {} (process uses {})",
                self.pointer_width, NATIVE_POINTER_WIDTH
            )));
        }
        if self.compressed_refs != compressed_refs {
            return Err(ArchiveError::ArchiveIncompatible(format!(
                "archive compressed references {} but process uses {}",
                on_off(self.compressed_refs),
                on_off(compressed_refs)
            )));
        }
        Ok(())
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

/// SHA-256 of `payload`
pub fn checksum(payload: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Split a whole file into header, payload and checksum, verifying sizes
/// and the checksum
pub fn split_checked(bytes: &[u8]) -> Result<(ArchiveHeader, std::ops::Range<usize>), ArchiveError> {
    if bytes.len() < HEADER_SIZE + CHECKSUM_SIZE {
        return Err(ArchiveError::corrupt(format!(
            "file is {} bytes, shorter than header and checksum",
            bytes.len()
        )));
    }
    let header = ArchiveHeader::decode(&bytes[..HEADER_SIZE])?;
    let expected = header
        .payload_len
        .saturating_add((HEADER_SIZE + CHECKSUM_SIZE) as u64);
    if bytes.len() as u64 != expected {
        return Err(ArchiveError::corrupt(format!(
            "file is {} bytes, header describes {}",
            bytes.len(),
            expected
        )));
    }
    let payload = HEADER_SIZE..HEADER_SIZE + header.payload_len as usize;
    let stored = &bytes[payload.end..];
    if checksum(&bytes[payload.clone()]).as_slice() != stored {
        return Err(ArchiveError::corrupt("checksum mismatch"));
    }
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ArchiveHeader {
        ArchiveHeader {
            version: ARCHIVE_VERSION,
            pointer_width: NATIVE_POINTER_WIDTH,
            compressed_refs: true,
            region_size_log2: 16,
            flags: FLAG_HEAP_OBJECTS,
            class_count: 3,
            object_count: 2,
            root_count: 1,
            payload_len: 0,
        }
    }

    #[test]
    fn test_header_size_and_decode() {
        let mut writer = ByteWriter::new();
        header().encode(&mut writer);
        assert_eq!(writer.offset(), HEADER_SIZE);
        let decoded = ArchiveHeader::decode(writer.buffer()).unwrap();
        assert_eq!(decoded, header());
        assert!(decoded.has_heap_objects());
        assert_eq!(decoded.region_size(), 65536);
    }

    #[test]
    fn test_incompatible_parameters() {
        let h = header();
        h.check_compatible(true).unwrap();
        assert!(matches!(
            h.check_compatible(false),
            Err(ArchiveError::ArchiveIncompatible(_))
        ));
        let narrow = ArchiveHeader {
            pointer_width: 16,
            ..header()
        };
        assert!(matches!(
            narrow.check_compatible(true),
            Err(ArchiveError::ArchiveIncompatible(_))
        ));
    }

    #[test]
    fn test_swapped_marker_is_incompatible() {
        let mut writer = ByteWriter::new();
        header().encode(&mut writer);
        let mut bytes = writer.into_bytes();
        bytes[12..16].copy_from_slice(&ENDIANNESS_MARKER.to_be_bytes());
        assert!(matches!(
            ArchiveHeader::decode(&bytes),
            Err(ArchiveError::ArchiveIncompatible(_))
        ));
        bytes[0] = b'X';
        assert!(matches!(
            ArchiveHeader::decode(&bytes),
            Err(ArchiveError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn test_split_checked_detects_tampering() {
        let payload = b"payload bytes";
        let mut writer = ByteWriter::new();
        ArchiveHeader {
            payload_len: payload.len() as u64,
            ..header()
        }
        .encode(&mut writer);
        writer.emit_bytes(payload);
        writer.emit_bytes(&checksum(payload));
        let mut bytes = writer.into_bytes();

        let (_, range) = split_checked(&bytes).unwrap();
        assert_eq!(&bytes[range], payload);

        bytes[HEADER_SIZE] ^= 0xff;
        assert!(matches!(split_checked(&bytes), Err(ArchiveError::ArchiveCorrupt(_))));
        assert!(matches!(
            split_checked(&bytes[..bytes.len() - 1]),
            Err(ArchiveError::ArchiveCorrupt(_))
        ));
    }
}
