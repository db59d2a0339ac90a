use std::net::IpAddr;

use crate::{checksum, ParseError, PROTO_TCP};

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_PSH: u8 = 0x08;
pub const FLAG_ACK: u8 = 0x10;

pub const HEADER_LEN: usize = 20;

pub const DEFAULT_WINDOW: u16 = 65535;
pub const DEFAULT_MSS: u16 = 1460;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub urgent: u16,
    /// MSS option appended on serialize when present (SYN/SYN+ACK only).
    pub mss: Option<u16>,
}

impl TcpHeader {
    /// The synthesized handshake reply.
    pub fn syn_ack(src_port: u16, dst_port: u16, seq: u32, ack: u32) -> Self {
        Self {
            src_port,
            dst_port,
            seq,
            ack,
            flags: FLAG_SYN | FLAG_ACK,
            window: DEFAULT_WINDOW,
            urgent: 0,
            mss: Some(DEFAULT_MSS),
        }
    }

    /// A data segment on the synthesized stream.
    pub fn psh_ack(src_port: u16, dst_port: u16, seq: u32, ack: u32) -> Self {
        Self {
            src_port,
            dst_port,
            seq,
            ack,
            flags: FLAG_PSH | FLAG_ACK,
            window: DEFAULT_WINDOW,
            urgent: 0,
            mss: None,
        }
    }

    /// Parse a segment; options are skipped, the payload follows the data
    /// offset.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        if data.len() < HEADER_LEN {
            return Err(ParseError::Truncated("tcp"));
        }
        let offset = usize::from(data[12] >> 4) * 4;
        if offset < HEADER_LEN || data.len() < offset {
            return Err(ParseError::BadLength("tcp", offset));
        }
        let header = Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: data[13],
            window: u16::from_be_bytes([data[14], data[15]]),
            urgent: u16::from_be_bytes([data[18], data[19]]),
            mss: None,
        };
        Ok((header, &data[offset..]))
    }

    /// Emit the segment with the checksum computed over the pseudo-header
    /// for the given address family.
    pub fn serialize(&self, src: IpAddr, dst: IpAddr, payload: &[u8]) -> Vec<u8> {
        let opts = if self.mss.is_some() { 4 } else { 0 };
        let header_len = HEADER_LEN + opts;
        let total = header_len + payload.len();
        let mut out = vec![0u8; total];
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack.to_be_bytes());
        out[12] = ((header_len / 4) as u8) << 4;
        out[13] = self.flags;
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent.to_be_bytes());
        if let Some(mss) = self.mss {
            out[20] = 2;
            out[21] = 4;
            out[22..24].copy_from_slice(&mss.to_be_bytes());
        }
        out[header_len..].copy_from_slice(payload);
        let csum = checksum::fold(pseudo_sum(src, dst, total as u32) + checksum::sum(&out));
        out[16..18].copy_from_slice(&csum.to_be_bytes());
        out
    }
}

fn pseudo_sum(src: IpAddr, dst: IpAddr, len: u32) -> u32 {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => checksum::pseudo_sum_v4(s, d, PROTO_TCP, len as u16),
        (IpAddr::V6(s), IpAddr::V6(d)) => checksum::pseudo_sum_v6(s, d, PROTO_TCP, len),
        // Mixed families never reach serialization; sum over nothing.
        _ => 0,
    }
}
