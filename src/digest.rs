//! CRC32C digests for PDU headers and data segments
//!
//! RFC 3720 Section 12.1: the only digest algorithm (besides None) is CRC32C,
//! the Castagnoli polynomial 0x1EDC6F41 with reflected input/output and
//! initial/final value 0xFFFFFFFF. A digest covers the 48-byte BHS (plus AHS,
//! which this target never emits or accepts) for the header digest, and the
//! data segment including its pad bytes for the data digest.

use crc::{Crc, CRC_32_ISCSI};

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Digest algorithm negotiated for one direction of framing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Digest {
    #[default]
    None,
    Crc32c,
}

impl Digest {
    /// Size in bytes this digest occupies on the wire
    pub fn wire_len(self) -> usize {
        match self {
            Digest::None => 0,
            Digest::Crc32c => 4,
        }
    }

    /// The text-negotiation value for this digest
    pub fn as_text(self) -> &'static str {
        match self {
            Digest::None => "None",
            Digest::Crc32c => "CRC32C",
        }
    }

    /// Pick the first mutually acceptable algorithm from an initiator's
    /// preference list (e.g. `CRC32C,None`). The target accepts both, so the
    /// initiator's first recognized entry wins. Unrecognized entries are
    /// skipped; an empty or fully unrecognized list yields `None` only if
    /// `None` was not explicitly excluded.
    pub fn from_offer(offer: &str) -> Option<Digest> {
        for entry in offer.split(',') {
            match entry.trim() {
                "CRC32C" => return Some(Digest::Crc32c),
                "None" => return Some(Digest::None),
                _ => continue,
            }
        }
        None
    }
}

/// Compute the CRC32C digest of a byte slice
pub fn crc32c(bytes: &[u8]) -> u32 {
    CRC32C.checksum(bytes)
}
