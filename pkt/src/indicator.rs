//! The parsed view of one captured frame and the endpoints the NAT keys on.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::ethernet::{EthernetHeader, ETHERTYPE_IPV4, ETHERTYPE_IPV6};
use crate::icmpv4::{self, Icmpv4Header};
use crate::ipv4::Ipv4Header;
use crate::ipv6::Ipv6Header;
use crate::tcp::TcpHeader;
use crate::udp::UdpHeader;
use crate::{checksum, loopback, ParseError, PROTO_ICMPV4, PROTO_TCP, PROTO_UDP};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransProto {
    Tcp,
    Udp,
    Icmpv4,
}

impl TransProto {
    pub fn number(self) -> u8 {
        match self {
            TransProto::Tcp => PROTO_TCP,
            TransProto::Udp => PROTO_UDP,
            TransProto::Icmpv4 => PROTO_ICMPV4,
        }
    }
}

impl fmt::Display for TransProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransProto::Tcp => "tcp",
            TransProto::Udp => "udp",
            TransProto::Icmpv4 => "icmpv4",
        })
    }
}

/// An address paired with a port (TCP/UDP) or an ICMP identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub value: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, value: u16) -> Self {
        Self { ip, value }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.value),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.value),
        }
    }
}

/// Which link layer a capture produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    Loopback,
}

#[derive(Debug, Clone, Copy)]
pub enum Link {
    Ethernet(EthernetHeader),
    Loopback(u32),
}

#[derive(Debug, Clone, Copy)]
pub enum Network {
    V4(Ipv4Header),
    V6(Ipv6Header),
}

impl Network {
    pub fn src(&self) -> IpAddr {
        match self {
            Network::V4(h) => IpAddr::V4(h.src),
            Network::V6(h) => IpAddr::V6(h.src),
        }
    }

    pub fn dst(&self) -> IpAddr {
        match self {
            Network::V4(h) => IpAddr::V4(h.dst),
            Network::V6(h) => IpAddr::V6(h.dst),
        }
    }

    pub fn is_v6(&self) -> bool {
        matches!(self, Network::V6(_))
    }

    /// TTL or hop limit.
    pub fn ttl(&self) -> u8 {
        match self {
            Network::V4(h) => h.ttl,
            Network::V6(h) => h.hop_limit,
        }
    }

    pub fn serialize(&self, payload: &[u8]) -> Vec<u8> {
        match self {
            Network::V4(h) => h.serialize(payload),
            Network::V6(h) => h.serialize(payload),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Transport {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Icmpv4(Icmpv4Header),
}

impl Transport {
    pub fn proto(&self) -> TransProto {
        match self {
            Transport::Tcp(_) => TransProto::Tcp,
            Transport::Udp(_) => TransProto::Udp,
            Transport::Icmpv4(_) => TransProto::Icmpv4,
        }
    }

    /// Source port, or the identifier for ICMPv4.
    pub fn src_value(&self) -> u16 {
        match self {
            Transport::Tcp(h) => h.src_port,
            Transport::Udp(h) => h.src_port,
            Transport::Icmpv4(h) => h.id(),
        }
    }

    /// Destination port, or the identifier for ICMPv4.
    pub fn dst_value(&self) -> u16 {
        match self {
            Transport::Tcp(h) => h.dst_port,
            Transport::Udp(h) => h.dst_port,
            Transport::Icmpv4(h) => h.id(),
        }
    }
}

/// The datagram quoted inside an ICMPv4 error: its IPv4 header plus however
/// much of the transport header was included (at least the port/id words).
#[derive(Debug, Clone)]
pub struct Embedded {
    pub ipv4: Ipv4Header,
    pub proto: TransProto,
    src_value: u16,
    dst_value: u16,
    quoted_kind: u8,
    raw: Vec<u8>,
    ihl: usize,
}

impl Embedded {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let (ipv4, _) = Ipv4Header::parse(data)?;
        let ihl = usize::from(data[0] & 0x0f) * 4;
        let t = &data[ihl..];
        let (proto, src_value, dst_value, quoted_kind) = match ipv4.proto {
            PROTO_TCP | PROTO_UDP => {
                if t.len() < 4 {
                    return Err(ParseError::Truncated("embedded transport"));
                }
                let src = u16::from_be_bytes([t[0], t[1]]);
                let dst = u16::from_be_bytes([t[2], t[3]]);
                let proto = if ipv4.proto == PROTO_TCP {
                    TransProto::Tcp
                } else {
                    TransProto::Udp
                };
                (proto, src, dst, 0)
            }
            PROTO_ICMPV4 => {
                if t.len() < icmpv4::HEADER_LEN {
                    return Err(ParseError::Truncated("embedded transport"));
                }
                let id = u16::from_be_bytes([t[4], t[5]]);
                (TransProto::Icmpv4, id, id, t[0])
            }
            other => return Err(ParseError::UnsupportedTransport(other)),
        };
        Ok(Self {
            ipv4,
            proto,
            src_value,
            dst_value,
            quoted_kind,
            raw: data.to_vec(),
            ihl,
        })
    }

    /// The quoted packet's source endpoint.
    pub fn src(&self) -> Endpoint {
        Endpoint::new(IpAddr::V4(self.ipv4.src), self.src_value)
    }

    /// The quoted packet's destination endpoint.
    pub fn dst(&self) -> Endpoint {
        Endpoint::new(IpAddr::V4(self.ipv4.dst), self.dst_value)
    }

    /// Whether the quoted transport is an ICMPv4 query.
    pub fn is_query(&self) -> bool {
        self.proto == TransProto::Icmpv4 && icmpv4::is_query_type(self.quoted_kind)
    }

    /// Quoted bytes with the destination address and port/id rewritten and
    /// the quoted IPv4 header checksum recomputed.
    pub fn rewrite_dst(&self, dst: Ipv4Addr, value: u16) -> Vec<u8> {
        let mut out = self.raw.clone();
        out[16..20].copy_from_slice(&dst.octets());
        let at = match self.proto {
            TransProto::Tcp | TransProto::Udp => self.ihl + 2,
            TransProto::Icmpv4 => self.ihl + 4,
        };
        out[at..at + 2].copy_from_slice(&value.to_be_bytes());
        refresh_header_checksum(&mut out, self.ihl);
        out
    }

    /// Quoted bytes with the source address and port/id rewritten.
    pub fn rewrite_src(&self, src: Ipv4Addr, value: u16) -> Vec<u8> {
        let mut out = self.raw.clone();
        out[12..16].copy_from_slice(&src.octets());
        let at = match self.proto {
            TransProto::Tcp | TransProto::Udp => self.ihl,
            TransProto::Icmpv4 => self.ihl + 4,
        };
        out[at..at + 2].copy_from_slice(&value.to_be_bytes());
        refresh_header_checksum(&mut out, self.ihl);
        out
    }
}

fn refresh_header_checksum(bytes: &mut [u8], ihl: usize) {
    bytes[10] = 0;
    bytes[11] = 0;
    let csum = checksum::checksum(&bytes[..ihl]);
    bytes[10..12].copy_from_slice(&csum.to_be_bytes());
}

/// One parsed frame (or bare IP packet): owned headers, borrowed payload.
#[derive(Debug, Clone)]
pub struct Indicator<'a> {
    pub link: Option<Link>,
    pub net: Network,
    pub transport: Transport,
    pub payload: &'a [u8],
    /// Present iff the transport is an ICMPv4 error.
    pub embedded: Option<Embedded>,
}

impl<'a> Indicator<'a> {
    /// Parse a captured frame starting at the link layer.
    pub fn parse_frame(frame: &'a [u8], kind: LinkKind) -> Result<Self, ParseError> {
        let (link, rest) = match kind {
            LinkKind::Ethernet => {
                let (header, rest) = EthernetHeader::parse(frame)?;
                match header.ethertype {
                    ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => {}
                    other => return Err(ParseError::UnsupportedEtherType(other)),
                }
                (Link::Ethernet(header), rest)
            }
            LinkKind::Loopback => {
                let (family, rest) = loopback::parse(frame)?;
                match family {
                    loopback::FAMILY_IPV4 | loopback::FAMILY_IPV6 => {}
                    other => return Err(ParseError::UnsupportedFamily(other)),
                }
                (Link::Loopback(family), rest)
            }
        };
        Self::parse_net(rest, Some(link))
    }

    /// Parse a bare IP packet (the decrypted inner contents).
    pub fn parse_ip(data: &'a [u8]) -> Result<Self, ParseError> {
        Self::parse_net(data, None)
    }

    fn parse_net(data: &'a [u8], link: Option<Link>) -> Result<Self, ParseError> {
        let version = data.first().map(|b| b >> 4).ok_or(ParseError::Truncated("ip"))?;
        let (net, proto, rest) = match version {
            4 => {
                let (header, rest) = Ipv4Header::parse(data)?;
                (Network::V4(header), header.proto, rest)
            }
            6 => {
                let (header, rest) = Ipv6Header::parse(data)?;
                (Network::V6(header), header.next_header, rest)
            }
            other => return Err(ParseError::UnsupportedVersion(other)),
        };
        let (transport, payload, embedded) = match proto {
            PROTO_TCP => {
                let (header, payload) = TcpHeader::parse(rest)?;
                (Transport::Tcp(header), payload, None)
            }
            PROTO_UDP => {
                let (header, payload) = UdpHeader::parse(rest)?;
                (Transport::Udp(header), payload, None)
            }
            PROTO_ICMPV4 if !net.is_v6() => {
                let (header, payload) = Icmpv4Header::parse(rest)?;
                let embedded = if header.is_error() {
                    Some(Embedded::parse(payload)?)
                } else {
                    None
                };
                (Transport::Icmpv4(header), payload, embedded)
            }
            other => return Err(ParseError::UnsupportedTransport(other)),
        };
        Ok(Self {
            link,
            net,
            transport,
            payload,
            embedded,
        })
    }

    pub fn src(&self) -> Endpoint {
        Endpoint::new(self.net.src(), self.transport.src_value())
    }

    pub fn dst(&self) -> Endpoint {
        Endpoint::new(self.net.dst(), self.transport.dst_value())
    }

    pub fn is_icmpv4_error(&self) -> bool {
        self.embedded.is_some()
    }

    /// The endpoint the NAT allocates for, client-to-upstream direction.
    /// For an ICMPv4 error this is the quoted packet's destination: the
    /// error travels the reverse path of the flow it complains about.
    pub fn nat_src(&self) -> Endpoint {
        match &self.embedded {
            Some(emb) => emb.dst(),
            None => self.src(),
        }
    }

    /// The endpoint the NAT looks up, upstream-to-client direction.
    pub fn nat_dst(&self) -> Endpoint {
        match &self.embedded {
            Some(emb) => emb.src(),
            None => self.dst(),
        }
    }

    /// The protocol of the flow this packet belongs to; for an ICMPv4 error
    /// that is the quoted transport's protocol.
    pub fn nat_proto(&self) -> TransProto {
        match &self.embedded {
            Some(emb) => emb.proto,
            None => self.transport.proto(),
        }
    }
}

/// Pick the EtherType matching a network layer.
pub fn ethertype_for(net: &Network) -> u16 {
    if net.is_v6() {
        ETHERTYPE_IPV6
    } else {
        ETHERTYPE_IPV4
    }
}

/// Pick the loopback family word matching a network layer.
pub fn loopback_family_for(net: &Network) -> u32 {
    if net.is_v6() {
        loopback::FAMILY_IPV6
    } else {
        loopback::FAMILY_IPV4
    }
}
