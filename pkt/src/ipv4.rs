use std::net::Ipv4Addr;

use crate::{checksum, ParseError};

pub const HEADER_LEN: usize = 20;

/// Don't Fragment.
pub const FLAG_DF: u16 = 0x4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    pub flags_frag: u16,
    pub ttl: u8,
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Fresh header for a packet this host originates. DF set, length and
    /// checksum filled in on serialize.
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, id: u16, ttl: u8, proto: u8) -> Self {
        Self {
            tos: 0,
            total_len: 0,
            id,
            flags_frag: FLAG_DF,
            ttl,
            proto,
            src,
            dst,
        }
    }

    /// Parse a header and return it with the payload sliced to the header's
    /// total length (clamped to the captured bytes).
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        if data.len() < HEADER_LEN {
            return Err(ParseError::Truncated("ipv4"));
        }
        let version = data[0] >> 4;
        if version != 4 {
            return Err(ParseError::UnsupportedVersion(version));
        }
        let ihl = usize::from(data[0] & 0x0f) * 4;
        if ihl < HEADER_LEN || data.len() < ihl {
            return Err(ParseError::BadLength("ipv4", ihl));
        }
        let total_len = u16::from_be_bytes([data[2], data[3]]);
        if usize::from(total_len) < ihl {
            return Err(ParseError::BadLength("ipv4", usize::from(total_len)));
        }
        let header = Self {
            tos: data[1],
            total_len,
            id: u16::from_be_bytes([data[4], data[5]]),
            flags_frag: u16::from_be_bytes([data[6], data[7]]),
            ttl: data[8],
            proto: data[9],
            src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        };
        let end = data.len().min(usize::from(total_len));
        Ok((header, &data[ihl..end]))
    }

    /// Emit a 20-byte header (options are not carried over) followed by the
    /// payload, with total length and header checksum recomputed.
    pub fn serialize(&self, payload: &[u8]) -> Vec<u8> {
        let total_len = (HEADER_LEN + payload.len()) as u16;
        let mut out = vec![0u8; HEADER_LEN + payload.len()];
        out[0] = 0x45;
        out[1] = self.tos;
        out[2..4].copy_from_slice(&total_len.to_be_bytes());
        out[4..6].copy_from_slice(&self.id.to_be_bytes());
        out[6..8].copy_from_slice(&self.flags_frag.to_be_bytes());
        out[8] = self.ttl;
        out[9] = self.proto;
        out[12..16].copy_from_slice(&self.src.octets());
        out[16..20].copy_from_slice(&self.dst.octets());
        let csum = checksum::checksum(&out[..HEADER_LEN]);
        out[10..12].copy_from_slice(&csum.to_be_bytes());
        out[HEADER_LEN..].copy_from_slice(payload);
        out
    }
}
