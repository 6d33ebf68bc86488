//! Over-the-air packet framing.
//!
//! Per packet, little-endian: 4-byte frame_id, 4-byte symbol_id, 4-byte
//! cell_id, 4-byte ant_id, then `samps_per_symbol * 2` interleaved i16 I/Q
//! samples. No trailer, no padding.

use thiserror::Error;

pub const HEADER_BYTES: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("packet truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_id: u32,
    pub symbol_id: u32,
    pub cell_id: u32,
    pub ant_id: u32,
}

impl PacketHeader {
    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), WireError> {
        if out.len() < HEADER_BYTES {
            return Err(WireError::Truncated {
                need: HEADER_BYTES,
                got: out.len(),
            });
        }
        out[0..4].copy_from_slice(&self.frame_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.symbol_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.cell_id.to_le_bytes());
        out[12..16].copy_from_slice(&self.ant_id.to_le_bytes());
        Ok(())
    }

    pub fn decode_from(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_BYTES {
            return Err(WireError::Truncated {
                need: HEADER_BYTES,
                got: buf.len(),
            });
        }
        let word = |i: usize| u32::from_le_bytes(buf[i..i + 4].try_into().unwrap());
        Ok(Self {
            frame_id: word(0),
            symbol_id: word(4),
            cell_id: word(8),
            ant_id: word(12),
        })
    }
}

/// Total bytes of a packet carrying `samps` complex samples.
pub fn packet_len(samps: usize) -> usize {
    HEADER_BYTES + samps * 2 * 2
}

/// Serialize header and interleaved I/Q into `out`, which must hold
/// `packet_len(iq.len() / 2)` bytes.
pub fn encode_packet(header: &PacketHeader, iq: &[i16], out: &mut [u8]) -> Result<(), WireError> {
    let need = HEADER_BYTES + iq.len() * 2;
    if out.len() < need {
        return Err(WireError::Truncated {
            need,
            got: out.len(),
        });
    }
    header.encode_into(out)?;
    for (i, &s) in iq.iter().enumerate() {
        let at = HEADER_BYTES + i * 2;
        out[at..at + 2].copy_from_slice(&s.to_le_bytes());
    }
    Ok(())
}

/// Parse a packet, copying the payload into `iq` (length fixes the expected
/// sample count).
pub fn decode_packet_into(buf: &[u8], iq: &mut [i16]) -> Result<PacketHeader, WireError> {
    let need = HEADER_BYTES + iq.len() * 2;
    if buf.len() < need {
        return Err(WireError::Truncated {
            need,
            got: buf.len(),
        });
    }
    let header = PacketHeader::decode_from(buf)?;
    for (i, slot) in iq.iter_mut().enumerate() {
        let at = HEADER_BYTES + i * 2;
        *slot = i16::from_le_bytes(buf[at..at + 2].try_into().unwrap());
    }
    Ok(header)
}
