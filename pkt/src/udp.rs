use std::net::IpAddr;

use crate::{checksum, ParseError, PROTO_UDP};

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
}

impl UdpHeader {
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        Self { src_port, dst_port }
    }

    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        if data.len() < HEADER_LEN {
            return Err(ParseError::Truncated("udp"));
        }
        let len = usize::from(u16::from_be_bytes([data[4], data[5]]));
        if len < HEADER_LEN {
            return Err(ParseError::BadLength("udp", len));
        }
        let header = Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
        };
        let end = data.len().min(len);
        Ok((header, &data[HEADER_LEN..end]))
    }

    pub fn serialize(&self, src: IpAddr, dst: IpAddr, payload: &[u8]) -> Vec<u8> {
        let total = HEADER_LEN + payload.len();
        let mut out = vec![0u8; total];
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..6].copy_from_slice(&(total as u16).to_be_bytes());
        out[HEADER_LEN..].copy_from_slice(payload);
        let acc = pseudo_sum(src, dst, total as u32) + checksum::sum(&out);
        let mut csum = checksum::fold(acc);
        // An all-zero checksum means "not computed" on the wire.
        if csum == 0 {
            csum = 0xffff;
        }
        out[6..8].copy_from_slice(&csum.to_be_bytes());
        out
    }
}

fn pseudo_sum(src: IpAddr, dst: IpAddr, len: u32) -> u32 {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => checksum::pseudo_sum_v4(s, d, PROTO_UDP, len as u16),
        (IpAddr::V6(s), IpAddr::V6(d)) => checksum::pseudo_sum_v6(s, d, PROTO_UDP, len),
        _ => 0,
    }
}
