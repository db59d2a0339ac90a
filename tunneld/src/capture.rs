//! Devices, raw captures and the bound connections the pipelines use.

use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

use socket2::{Domain, SockAddr, Socket, Type};

use pkt::indicator::{ethertype_for, loopback_family_for};
use pkt::{ethernet, loopback, LinkKind, MacAddr, Network, PROTO_ICMPV4, PROTO_TCP, PROTO_UDP};

const SNAPLEN: usize = 65535;

/// A capture endpoint.
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub alias: String,
    pub mac: MacAddr,
    pub addrs: Vec<IpAddr>,
    pub loopback: bool,
}

impl Device {
    pub fn new(name: &str, mac: MacAddr, addrs: Vec<IpAddr>) -> Self {
        Self {
            name: name.to_string(),
            alias: name.to_string(),
            mac,
            addrs,
            loopback: name.starts_with("lo"),
        }
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.addrs.iter().find_map(|addr| match addr {
            IpAddr::V4(ip) => Some(*ip),
            IpAddr::V6(_) => None,
        })
    }

    pub fn ipv6(&self) -> Option<Ipv6Addr> {
        self.addrs.iter().find_map(|addr| match addr {
            IpAddr::V6(ip) => Some(*ip),
            IpAddr::V4(_) => None,
        })
    }

    pub fn addr_for(&self, v6: bool) -> Option<IpAddr> {
        if v6 {
            self.ipv6().map(IpAddr::V6)
        } else {
            self.ipv4().map(IpAddr::V4)
        }
    }

    pub fn link_kind(&self) -> LinkKind {
        if self.loopback {
            LinkKind::Loopback
        } else {
            LinkKind::Ethernet
        }
    }
}

impl FromStr for Device {
    type Err = String;

    /// `name,mac,ip[,ip...]`, e.g. `eth0,52:54:00:12:34:56,192.0.2.1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',');
        let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(|| format!("bad device spec {s:?}"))?;
        let mac: MacAddr = parts
            .next()
            .ok_or_else(|| format!("device spec {s:?} is missing a mac"))?
            .parse()?;
        let mut addrs = Vec::new();
        for part in parts {
            let addr: IpAddr = part
                .parse()
                .map_err(|_| format!("bad address {part:?} in device spec"))?;
            addrs.push(addr);
        }
        if addrs.is_empty() {
            return Err(format!("device spec {s:?} has no addresses"));
        }
        Ok(Device::new(name, mac, addrs))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.alias, self.mac)
    }
}

/// The two capture programs the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// `tcp && dst port P`: tunnel traffic arriving from clients.
    Listen { port: u16 },
    /// `((tcp || udp) && not dst port P) || icmp`: upstream replies.
    Upstream { port: u16 },
}

impl Filter {
    pub fn matches(&self, frame: &[u8], kind: LinkKind) -> bool {
        let Some((proto, t_off)) = transport_layer(frame, kind) else {
            return false;
        };
        match *self {
            Filter::Listen { port } => proto == PROTO_TCP && dst_port(frame, t_off) == Some(port),
            Filter::Upstream { port } => match proto {
                PROTO_ICMPV4 => true,
                PROTO_TCP | PROTO_UDP => dst_port(frame, t_off)
                    .map(|p| p != port)
                    .unwrap_or(false),
                _ => false,
            },
        }
    }
}

fn transport_layer(frame: &[u8], kind: LinkKind) -> Option<(u8, usize)> {
    let ip = match kind {
        LinkKind::Ethernet => {
            if frame.len() < ethernet::HEADER_LEN {
                return None;
            }
            match u16::from_be_bytes([frame[12], frame[13]]) {
                ethernet::ETHERTYPE_IPV4 | ethernet::ETHERTYPE_IPV6 => ethernet::HEADER_LEN,
                _ => return None,
            }
        }
        LinkKind::Loopback => loopback::HEADER_LEN,
    };
    let rest = frame.get(ip..)?;
    match rest.first()? >> 4 {
        4 => {
            let ihl = usize::from(rest[0] & 0x0f) * 4;
            let proto = *rest.get(9)?;
            (rest.len() >= ihl && ihl >= 20).then_some((proto, ip + ihl))
        }
        6 => {
            let next = *rest.get(6)?;
            (rest.len() >= 40).then_some((next, ip + 40))
        }
        _ => None,
    }
}

fn dst_port(frame: &[u8], t_off: usize) -> Option<u16> {
    let bytes = frame.get(t_off + 2..t_off + 4)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Blocking raw-frame I/O. Reads are serial per capture; writes are atomic
/// per call.
pub trait Capture: Send + Sync {
    fn read_frame(&self) -> io::Result<Vec<u8>>;
    fn write_frame(&self, frame: &[u8]) -> io::Result<()>;
    fn close(&self);
}

/// `AF_PACKET` capture bound to one device.
pub struct RawCapture {
    sock: Socket,
    filter: Filter,
    kind: LinkKind,
}

impl RawCapture {
    pub fn open(device: &Device, filter: Filter) -> io::Result<Self> {
        let proto = i32::from((libc::ETH_P_ALL as u16).to_be());
        let sock = Socket::new(Domain::from(libc::AF_PACKET), Type::RAW, Some(proto.into()))?;
        sock.bind(&link_addr(&device.name)?)?;
        Ok(Self {
            sock,
            filter,
            kind: device.link_kind(),
        })
    }
}

fn link_addr(name: &str) -> io::Result<SockAddr> {
    let ifname = std::ffi::CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad device name"))?;
    let index = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    {
        let sll = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_ll;
        unsafe {
            (*sll).sll_family = libc::AF_PACKET as libc::sa_family_t;
            (*sll).sll_protocol = (libc::ETH_P_ALL as u16).to_be();
            (*sll).sll_ifindex = index as i32;
        }
    }
    let len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    Ok(unsafe { SockAddr::new(storage, len) })
}

impl Capture for RawCapture {
    fn read_frame(&self) -> io::Result<Vec<u8>> {
        let mut buf: [MaybeUninit<u8>; SNAPLEN] = unsafe { MaybeUninit::uninit().assume_init() };
        loop {
            let len = self.sock.recv(&mut buf)?;
            let frame: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
            if self.filter.matches(frame, self.kind) {
                return Ok(frame.to_vec());
            }
        }
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        self.sock.send(frame)?;
        Ok(())
    }

    fn close(&self) {
        let _ = self.sock.shutdown(std::net::Shutdown::Both);
    }
}

/// A bound (source device, destination device) pair over one capture.
/// Cloneable so a reply can be written on the connection a packet arrived
/// through.
#[derive(Clone)]
pub struct Connection {
    src_dev: Device,
    dst_dev: Device,
    cap: Arc<dyn Capture>,
}

impl Connection {
    pub fn new(src_dev: Device, dst_dev: Device, cap: Arc<dyn Capture>) -> Self {
        Self {
            src_dev,
            dst_dev,
            cap,
        }
    }

    pub fn open_raw(src_dev: Device, dst_dev: Device, filter: Filter) -> io::Result<Self> {
        let cap = Arc::new(RawCapture::open(&src_dev, filter)?);
        Ok(Self::new(src_dev, dst_dev, cap))
    }

    pub fn read_frame(&self) -> io::Result<Vec<u8>> {
        self.cap.read_frame()
    }

    pub fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        self.cap.write_frame(frame)
    }

    pub fn close(&self) {
        self.cap.close();
    }

    pub fn is_loopback(&self) -> bool {
        self.src_dev.loopback
    }

    pub fn link_kind(&self) -> LinkKind {
        self.src_dev.link_kind()
    }

    /// The capture device's address for the requested family.
    pub fn local_addr(&self, v6: bool) -> Option<IpAddr> {
        self.src_dev.addr_for(v6)
    }

    pub fn src_dev(&self) -> &Device {
        &self.src_dev
    }

    /// Wrap a serialized IP packet in the link layer this connection emits.
    pub fn frame(&self, net: &Network, packet: &[u8]) -> Vec<u8> {
        if self.is_loopback() {
            loopback::frame(loopback_family_for(net), packet)
        } else {
            ethernet::frame(self.dst_dev.mac, self.src_dev.mac, ethertype_for(net), packet)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use pkt::ipv4::Ipv4Header;
    use pkt::tcp::TcpHeader;

    fn tcp_frame(dst_port: u16) -> Vec<u8> {
        let src = Ipv4Addr::new(10, 0, 0, 5);
        let dst = Ipv4Addr::new(192, 0, 2, 1);
        let seg = TcpHeader::psh_ack(50000, dst_port, 0, 0).serialize(
            IpAddr::V4(src),
            IpAddr::V4(dst),
            &[],
        );
        let packet = Ipv4Header::new(src, dst, 0, 64, PROTO_TCP).serialize(&seg);
        ethernet::frame(
            MacAddr([1; 6]),
            MacAddr([2; 6]),
            ethernet::ETHERTYPE_IPV4,
            &packet,
        )
    }

    fn icmp_frame() -> Vec<u8> {
        let src = Ipv4Addr::new(1, 1, 1, 1);
        let dst = Ipv4Addr::new(203, 0, 113, 7);
        let icmp = pkt::icmpv4::Icmpv4Header::echo_reply(7, 1).serialize(&[]);
        let packet = Ipv4Header::new(src, dst, 0, 64, PROTO_ICMPV4).serialize(&icmp);
        ethernet::frame(
            MacAddr([1; 6]),
            MacAddr([2; 6]),
            ethernet::ETHERTYPE_IPV4,
            &packet,
        )
    }

    #[test]
    fn test_listen_filter() {
        let filter = Filter::Listen { port: 8080 };
        assert!(filter.matches(&tcp_frame(8080), LinkKind::Ethernet));
        assert!(!filter.matches(&tcp_frame(9999), LinkKind::Ethernet));
        assert!(!filter.matches(&icmp_frame(), LinkKind::Ethernet));
    }

    #[test]
    fn test_upstream_filter() {
        let filter = Filter::Upstream { port: 8080 };
        // Tunnel traffic itself is excluded, everything else passes.
        assert!(!filter.matches(&tcp_frame(8080), LinkKind::Ethernet));
        assert!(filter.matches(&tcp_frame(9999), LinkKind::Ethernet));
        assert!(filter.matches(&icmp_frame(), LinkKind::Ethernet));
    }

    #[test]
    fn test_filter_ignores_garbage() {
        let filter = Filter::Listen { port: 8080 };
        assert!(!filter.matches(&[0u8; 6], LinkKind::Ethernet));
        assert!(!filter.matches(&[0xffu8; 64], LinkKind::Ethernet));
    }

    #[test]
    fn test_device_from_str() {
        let dev: Device = "eth0,52:54:00:12:34:56,192.0.2.1,2001:db8::1".parse().unwrap();
        assert_eq!(dev.name, "eth0");
        assert!(!dev.loopback);
        assert_eq!(dev.ipv4(), Some(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(dev.ipv6(), Some("2001:db8::1".parse().unwrap()));

        let lo: Device = "lo0,00:00:00:00:00:00,127.0.0.1".parse().unwrap();
        assert!(lo.loopback);
        assert_eq!(lo.link_kind(), LinkKind::Loopback);

        assert!("eth0".parse::<Device>().is_err());
        assert!("eth0,52:54:00:12:34:56".parse::<Device>().is_err());
    }
}
