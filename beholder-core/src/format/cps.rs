//! Support for the compressed-resource envelope that wraps most on-disk
//! assets (images, level scripts, tile data).
//!
//! The envelope is a small fixed header in front of the compressed payload:
//! a declared stream length, the compression tag, the declared uncompressed
//! size (meaningful for the copy and RLE schemes) and a palette-size field.
//! The payload starts at offset 4 for copy/RLE (those two read the size
//! fields as their own sub-header) and at offset 10 for LZ77.

use std::io::Cursor;

use binrw::BinRead;
use snafu::ensure;
use tracing::trace;

use crate::format::{compression, FormatError, Result, StructuralMismatchSnafu};

#[derive(BinRead, Debug)]
#[br(little)]
struct RawEnvelope {
    declared_length: u16,
    compression_tag: u16,
    uncompressed_size: u32,
    palette_size: u16,
}

/// A decoded compressed-resource file.
///
/// The decoded buffer is freshly allocated and never aliases the source.
pub struct Cps {
    data: Vec<u8>,
}

impl Cps {
    /// Parses the envelope and decompresses the payload.
    ///
    /// The declared stream length must equal the buffer length, or the buffer
    /// length minus two; some producers include the length field itself in
    /// the count and some do not, and both kinds of file exist, so both are
    /// tolerated.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() >= 2,
            StructuralMismatchSnafu {
                declared: 0usize,
                actual: data.len()
            }
        );
        let declared = u16::from_le_bytes([data[0], data[1]]) as usize;
        ensure!(
            declared == data.len() || declared + 2 == data.len(),
            StructuralMismatchSnafu {
                declared,
                actual: data.len()
            }
        );

        let mut cur = Cursor::new(data);
        let envelope = RawEnvelope::read(&mut cur).map_err(|_| FormatError::Overflow {
            offset: data.len(),
        })?;
        trace!(
            declared_length = envelope.declared_length,
            compression_tag = envelope.compression_tag,
            uncompressed_size = envelope.uncompressed_size,
            palette_size = envelope.palette_size,
            "parsed resource envelope"
        );

        // Copy and RLE re-read the size fields as their sub-header; LZ77 has
        // no size prefix at all, so its stream starts past the palette field.
        let payload_start = match envelope.compression_tag & 0xff {
            0 | 3 => 4,
            _ => 10,
        };
        let data = compression::decompress(envelope.compression_tag, &data[payload_start..])?;

        Ok(Self { data })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::Cps;
    use crate::format::FormatError;

    /// A minimal copy-scheme file: the envelope's size fields double as the
    /// copy sub-header (length 4, skip 0), followed by the data.
    fn copy_file(declared: u16) -> Vec<u8> {
        let mut data = declared.to_le_bytes().to_vec();
        data.extend_from_slice(&0u16.to_le_bytes()); // tag 0
        data.extend_from_slice(&4u32.to_le_bytes()); // payload length
        data.extend_from_slice(&0u16.to_le_bytes()); // skip offset
        data.extend_from_slice(b"ABCD");
        data
    }

    #[test]
    fn declared_length_may_include_itself() {
        // 14-byte file; both 14 and 12 are accepted declarations
        assert_eq!(Cps::from_bytes(&copy_file(14)).unwrap().data(), b"ABCD");
        assert_eq!(Cps::from_bytes(&copy_file(12)).unwrap().data(), b"ABCD");
    }

    #[test]
    fn other_declared_lengths_are_rejected() {
        assert_eq!(
            Cps::from_bytes(&copy_file(13)).err().unwrap(),
            FormatError::StructuralMismatch {
                declared: 13,
                actual: 14
            }
        );
    }

    #[test]
    fn unknown_tag_is_rejected_with_the_tag() {
        let mut data = copy_file(14);
        data[2] = 7;
        assert_eq!(
            Cps::from_bytes(&data).err().unwrap(),
            FormatError::UnknownCompression { tag: 7 }
        );
    }

    #[test]
    fn lz77_payload_starts_past_the_size_fields() {
        let mut data = Vec::new();
        data.extend_from_slice(&14u16.to_le_bytes());
        data.extend_from_slice(&4u16.to_le_bytes()); // tag 4
        data.extend_from_slice(&6u32.to_le_bytes()); // uncompressed size
        data.extend_from_slice(&0u16.to_le_bytes()); // palette size
        data.extend_from_slice(&hex::decode("81412001").unwrap()); // 'A' then distance-1 run
        assert_eq!(Cps::from_bytes(&data).unwrap().data(), b"AAAAAA");
    }
}
