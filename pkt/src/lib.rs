//! Packet parsing and building for the tunnel data plane.
//!
//! Every layer is a small owned header struct with `parse` returning the
//! header plus the remaining bytes, and `serialize` producing wire bytes
//! with lengths and checksums recomputed. The [`Indicator`] ties a whole
//! captured frame together and derives the endpoints the NAT works with.

pub mod checksum;
pub mod ethernet;
pub mod icmpv4;
pub mod indicator;
pub mod ipv4;
pub mod ipv6;
pub mod loopback;
pub mod tcp;
pub mod udp;

pub use ethernet::MacAddr;
pub use indicator::{Embedded, Endpoint, Indicator, Link, LinkKind, Network, TransProto, Transport};

/// IP protocol numbers for the transports the data plane carries.
pub const PROTO_ICMPV4: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("frame truncated in {0} header")]
    Truncated(&'static str),
    #[error("unsupported ethertype {0:#06x}")]
    UnsupportedEtherType(u16),
    #[error("unsupported loopback family {0}")]
    UnsupportedFamily(u32),
    #[error("unsupported ip version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported transport protocol {0}")]
    UnsupportedTransport(u8),
    #[error("bad {0} header length {1}")]
    BadLength(&'static str, usize),
}
