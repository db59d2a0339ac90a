//! The tunnel server data plane: the synthesized client handshake, the
//! client-to-upstream pipeline and the upstream-to-client pipeline.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{debug, info, trace, warn};

use pkt::icmpv4::Icmpv4Header;
use pkt::ipv4::Ipv4Header;
use pkt::ipv6::Ipv6Header;
use pkt::tcp::{TcpHeader, FLAG_SYN};
use pkt::{Endpoint, Indicator, Network, TransProto, Transport, PROTO_TCP};

use crate::capture::Connection;
use crate::crypt::Crypt;
use crate::error::PipelineError;
use crate::nat::{Mapping, Nat, Quintuple};
use crate::session::{Client, ClientTable};

/// Bound of the listener fan-in queue; readers block when it is full.
pub const FAN_IN_CAPACITY: usize = 1000;

/// TTL on the synthesized IPv4 SYN+ACK.
pub const SYN_ACK_TTL: u8 = 128;

/// Hop limit on the synthesized IPv6 SYN+ACK.
pub const SYN_ACK_HOP_LIMIT: u8 = 64;

pub struct Server {
    port: u16,
    crypt: Arc<dyn Crypt>,
    listeners: Vec<Connection>,
    upstream: Connection,
    clients: ClientTable,
    nat: Nat,
    ipv4_id: AtomicU16,
    closed: AtomicBool,
}

impl Server {
    pub fn new(
        port: u16,
        listeners: Vec<Connection>,
        upstream: Connection,
        crypt: Arc<dyn Crypt>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(port != 0, "listen port must be in 1..=65535");
        anyhow::ensure!(!listeners.is_empty(), "at least one listen device is required");
        Ok(Self {
            port,
            crypt,
            listeners,
            upstream,
            clients: ClientTable::new(),
            nat: Nat::new(),
            ipv4_id: AtomicU16::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Spawn one reader per listener into the fan-in queue plus the inbound
    /// worker, then drive the upstream capture on the calling thread until
    /// the server is closed or the capture dies.
    pub fn run(self: &Arc<Self>) -> std::io::Result<()> {
        let (tx, rx) = mpsc::sync_channel::<(Vec<u8>, Connection)>(FAN_IN_CAPACITY);
        let mut readers = Vec::new();
        for conn in &self.listeners {
            let conn = conn.clone();
            let tx = tx.clone();
            let server = Arc::clone(self);
            let name = format!("listen-{}", conn.src_dev().name);
            info!("listening on {} port {}", conn.src_dev(), self.port);
            readers.push(thread::Builder::new().name(name).spawn(move || loop {
                match conn.read_frame() {
                    Ok(frame) => {
                        if tx.send((frame, conn.clone())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if !server.closed.load(Ordering::SeqCst) {
                            warn!("listener {} read failed: {}", conn.src_dev(), e);
                        }
                        break;
                    }
                }
            })?);
        }
        drop(tx);

        let worker = {
            let server = Arc::clone(self);
            thread::Builder::new()
                .name("inbound".to_string())
                .spawn(move || {
                    while let Ok((frame, conn)) = rx.recv() {
                        if let Err(e) = server.handle_listen(&frame, &conn) {
                            warn!("dropped client frame: {}", e);
                        }
                    }
                })?
        };

        info!("forwarding via {}", self.upstream.src_dev());
        let result = loop {
            match self.upstream.read_frame() {
                Ok(frame) => {
                    if let Err(e) = self.handle_upstream(&frame) {
                        warn!("dropped upstream frame: {}", e);
                    }
                }
                Err(e) => {
                    if self.closed.load(Ordering::SeqCst) {
                        break Ok(());
                    }
                    self.close();
                    break Err(e);
                }
            }
        };

        for reader in readers {
            let _ = reader.join();
        }
        let _ = worker.join();
        result
    }

    /// Close every capture; blocked readers observe an error and exit
    /// silently.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for conn in &self.listeners {
            conn.close();
        }
        self.upstream.close();
    }

    fn next_ipv4_id(&self) -> u16 {
        self.ipv4_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Client-to-upstream: handshake, or decrypt one inner packet, rewrite
    /// its source to this host's upstream address and emit it.
    pub fn handle_listen(&self, frame: &[u8], conn: &Connection) -> Result<(), PipelineError> {
        let now = Instant::now();
        let ind = Indicator::parse_frame(frame, conn.link_kind())?;
        let tcp = match &ind.transport {
            Transport::Tcp(t) => *t,
            _ => return Err(PipelineError::UnsupportedLayer("expected tcp on listener")),
        };
        let src = ind.src();

        if tcp.flags & FLAG_SYN != 0 {
            return self.handshake(&ind, &tcp, src, conn);
        }
        if ind.payload.is_empty() {
            // The bare ACK completing the three-way handshake.
            return Ok(());
        }

        let client = self
            .clients
            .get(&src)
            .ok_or(PipelineError::Unauthorized(src))?;
        client.ack.fetch_add(ind.payload.len() as u32, Ordering::Relaxed);

        let plain = client.crypt.decrypt(ind.payload)?;
        let inner = Indicator::parse_ip(&plain)?;
        if let Transport::Icmpv4(h) = &inner.transport {
            if !h.is_query() && !h.is_error() {
                return Err(PipelineError::UnsupportedLayer("icmpv4 message kind"));
            }
        }
        if let Some(emb) = &inner.embedded {
            // Errors are never raised about errors; a quoted ICMP message
            // must carry an identifier for the translation to mean anything.
            if emb.proto == TransProto::Icmpv4 && !emb.is_query() {
                return Err(PipelineError::UnsupportedLayer("icmpv4 error quoting a non-query"));
            }
        }

        let proto = inner.nat_proto();
        let emb_src = inner.nat_src();
        let quintuple = Quintuple {
            src: emb_src,
            client: src,
            proto,
        };
        // An ICMPv4 error only makes sense against an existing mapping; it
        // never allocates one.
        let value = match &inner.embedded {
            Some(_) => self
                .nat
                .lookup_value(&quintuple)
                .ok_or(PipelineError::MissingNat(emb_src))?,
            None => self.nat.external_for(&quintuple, now)?,
        };

        // Clone the inner network layer and re-source it at this host.
        let mut net = inner.net;
        let up_ip = match &mut net {
            Network::V4(h) => {
                let ip = match self.upstream.local_addr(false) {
                    Some(IpAddr::V4(ip)) => ip,
                    _ => return Err(PipelineError::NoUpstreamAddr),
                };
                h.src = ip;
                IpAddr::V4(ip)
            }
            Network::V6(h) => {
                let ip = match self.upstream.local_addr(true) {
                    Some(IpAddr::V6(ip)) => ip,
                    _ => return Err(PipelineError::NoUpstreamAddr),
                };
                h.src = ip;
                IpAddr::V6(ip)
            }
        };

        let transport_bytes = match (&inner.transport, &inner.embedded) {
            (Transport::Tcp(h), _) => {
                let mut h = *h;
                h.src_port = value;
                h.serialize(net.src(), net.dst(), inner.payload)
            }
            (Transport::Udp(h), _) => {
                let mut h = *h;
                h.src_port = value;
                h.serialize(net.src(), net.dst(), inner.payload)
            }
            (Transport::Icmpv4(h), None) => {
                let mut h = *h;
                h.set_id(value);
                h.serialize(inner.payload)
            }
            (Transport::Icmpv4(h), Some(emb)) => {
                let up4 = match up_ip {
                    IpAddr::V4(ip) => ip,
                    IpAddr::V6(_) => return Err(PipelineError::FamilyMismatch),
                };
                // Rebuild the quoted datagram so it names the translated
                // flow, then wrap it in a fresh error header.
                let quote = emb.rewrite_dst(up4, value);
                Icmpv4Header {
                    kind: h.kind,
                    code: h.code,
                    rest: h.rest,
                }
                .serialize(&quote)
            }
        };

        let packet = net.serialize(&transport_bytes);
        self.upstream.write_frame(&self.upstream.frame(&net, &packet))?;
        debug!("{} {} -> {} as {}", proto, emb_src, inner.dst(), value);

        if inner.embedded.is_none() {
            self.nat.insert(
                (Endpoint::new(up_ip, value), proto),
                Mapping {
                    src,
                    dst: ind.dst(),
                    emb_src,
                    conn: conn.clone(),
                },
            );
        }
        self.nat.touch(proto, value, now);
        Ok(())
    }

    /// Reply to a SYN with a synthesized SYN+ACK and (re)install the
    /// session.
    fn handshake(
        &self,
        ind: &Indicator,
        tcp: &TcpHeader,
        src: Endpoint,
        conn: &Connection,
    ) -> Result<(), PipelineError> {
        let ack = tcp.seq.wrapping_add(1);
        let syn_ack = TcpHeader::syn_ack(tcp.dst_port, tcp.src_port, 0, ack);
        let net = match &ind.net {
            Network::V4(h) => Network::V4(Ipv4Header::new(
                h.dst,
                h.src,
                self.next_ipv4_id(),
                SYN_ACK_TTL,
                PROTO_TCP,
            )),
            Network::V6(h) => Network::V6(Ipv6Header::new(
                h.dst,
                h.src,
                SYN_ACK_HOP_LIMIT,
                PROTO_TCP,
            )),
        };
        let segment = syn_ack.serialize(net.src(), net.dst(), &[]);
        let packet = net.serialize(&segment);
        conn.write_frame(&conn.frame(&net, &packet))?;

        self.clients
            .insert(src, Client::new(self.crypt.clone(), 1, ack));
        info!("client {} connected ({} total)", src, self.clients.len());
        Ok(())
    }

    /// Upstream-to-client: match a reply against the NAT, restore the
    /// client's inner addressing, encrypt and deliver on the synthesized
    /// stream.
    pub fn handle_upstream(&self, frame: &[u8]) -> Result<(), PipelineError> {
        let now = Instant::now();
        let ind = Indicator::parse_frame(frame, self.upstream.link_kind())?;
        let proto = ind.nat_proto();
        let key = (ind.nat_dst(), proto);
        let Some(mapping) = self.nat.get(&key) else {
            // Host traffic that belongs to no tunneled flow.
            trace!("no mapping for {} {}", proto, key.0);
            return Ok(());
        };
        let client = self
            .clients
            .get(&mapping.src)
            .ok_or(PipelineError::Unauthorized(mapping.src))?;
        self.nat.touch(proto, key.0.value, now);

        // Restore the inner destination the client used.
        let mut net = ind.net;
        match &mut net {
            Network::V4(h) => match mapping.emb_src.ip {
                IpAddr::V4(ip) => h.dst = ip,
                IpAddr::V6(_) => return Err(PipelineError::FamilyMismatch),
            },
            Network::V6(h) => match mapping.emb_src.ip {
                IpAddr::V6(ip) => h.dst = ip,
                IpAddr::V4(_) => return Err(PipelineError::FamilyMismatch),
            },
        }

        let transport_bytes = match (&ind.transport, &ind.embedded) {
            (Transport::Tcp(h), _) => {
                let mut h = *h;
                h.dst_port = mapping.emb_src.value;
                h.serialize(net.src(), net.dst(), ind.payload)
            }
            (Transport::Udp(h), _) => {
                let mut h = *h;
                h.dst_port = mapping.emb_src.value;
                h.serialize(net.src(), net.dst(), ind.payload)
            }
            (Transport::Icmpv4(h), None) => {
                let mut h = *h;
                h.set_id(mapping.emb_src.value);
                h.serialize(ind.payload)
            }
            (Transport::Icmpv4(h), Some(emb)) => {
                let src4 = match mapping.emb_src.ip {
                    IpAddr::V4(ip) => ip,
                    IpAddr::V6(_) => return Err(PipelineError::FamilyMismatch),
                };
                let quote = emb.rewrite_src(src4, mapping.emb_src.value);
                Icmpv4Header {
                    kind: h.kind,
                    code: h.code,
                    rest: h.rest,
                }
                .serialize(&quote)
            }
        };

        let contents = net.serialize(&transport_bytes);
        let sealed = client.crypt.encrypt(&contents)?;

        let seq = client.seq.load(Ordering::Relaxed);
        let ack = client.ack.load(Ordering::Relaxed);
        let segment = TcpHeader::psh_ack(mapping.dst.value, mapping.src.value, seq, ack);
        let ttl = ind.net.ttl().saturating_sub(1);
        let outer = match (mapping.dst.ip, mapping.src.ip) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                Network::V4(Ipv4Header::new(src, dst, self.next_ipv4_id(), ttl, PROTO_TCP))
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                Network::V6(Ipv6Header::new(src, dst, ttl, PROTO_TCP))
            }
            _ => return Err(PipelineError::FamilyMismatch),
        };
        let outer_segment = segment.serialize(outer.src(), outer.dst(), &sealed);
        let outer_packet = outer.serialize(&outer_segment);
        mapping.conn.write_frame(&mapping.conn.frame(&outer, &outer_packet))?;

        client.seq.fetch_add(sealed.len() as u32, Ordering::Relaxed);
        debug!("{} {} -> client {}", proto, key.0, mapping.src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use pkt::ethernet::{self, EthernetHeader, ETHERTYPE_IPV4};
    use pkt::icmpv4::{self, TYPE_DEST_UNREACHABLE, TYPE_TIME_EXCEEDED};
    use pkt::tcp::{FLAG_ACK, FLAG_PSH};
    use pkt::udp::UdpHeader;
    use pkt::{LinkKind, MacAddr, TransProto, PROTO_ICMPV4, PROTO_UDP};

    use crate::capture::testing::MemCapture;
    use crate::capture::Device;
    use crate::crypt::Plain;

    const SRV_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x00, 0x00, 0x01]);
    const GW_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x00, 0x00, 0x02]);
    const UP_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x00, 0x00, 0x03]);
    const CLIENT_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x00, 0x00, 0xaa]);

    const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const LISTEN_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const UP_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);
    const REMOTE_IP: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

    struct Harness {
        server: Server,
        listen_cap: Arc<MemCapture>,
        up_cap: Arc<MemCapture>,
        listen_conn: Connection,
    }

    fn harness() -> Harness {
        let listen_dev = Device::new("eth0", SRV_MAC, vec![IpAddr::V4(LISTEN_IP)]);
        let gw_dev = Device::new("gw0", GW_MAC, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 254))]);
        let up_dev = Device::new("eth1", UP_MAC, vec![IpAddr::V4(UP_IP)]);
        let listen_cap = MemCapture::new();
        let up_cap = MemCapture::new();
        let listen_conn = Connection::new(listen_dev, gw_dev.clone(), listen_cap.clone());
        let upstream = Connection::new(up_dev, gw_dev, up_cap.clone());
        let server = Server::new(8080, vec![listen_conn.clone()], upstream, Arc::new(Plain)).unwrap();
        Harness {
            server,
            listen_cap,
            up_cap,
            listen_conn,
        }
    }

    fn client_ep() -> Endpoint {
        Endpoint::new(IpAddr::V4(CLIENT_IP), 50000)
    }

    fn eth_to_server(packet: &[u8]) -> Vec<u8> {
        ethernet::frame(SRV_MAC, CLIENT_MAC, ETHERTYPE_IPV4, packet)
    }

    fn eth_to_upstream(packet: &[u8]) -> Vec<u8> {
        ethernet::frame(UP_MAC, GW_MAC, ETHERTYPE_IPV4, packet)
    }

    fn syn_frame(seq: u32) -> Vec<u8> {
        let tcp = TcpHeader {
            src_port: 50000,
            dst_port: 8080,
            seq,
            ack: 0,
            flags: FLAG_SYN,
            window: 64240,
            urgent: 0,
            mss: None,
        };
        let seg = tcp.serialize(IpAddr::V4(CLIENT_IP), IpAddr::V4(LISTEN_IP), &[]);
        let packet = Ipv4Header::new(CLIENT_IP, LISTEN_IP, 42, 64, PROTO_TCP).serialize(&seg);
        eth_to_server(&packet)
    }

    fn data_frame(seq: u32, payload: &[u8]) -> Vec<u8> {
        let tcp = TcpHeader::psh_ack(50000, 8080, seq, 1);
        let seg = tcp.serialize(IpAddr::V4(CLIENT_IP), IpAddr::V4(LISTEN_IP), payload);
        let packet = Ipv4Header::new(CLIENT_IP, LISTEN_IP, 43, 64, PROTO_TCP).serialize(&seg);
        eth_to_server(&packet)
    }

    fn inner_udp(payload: &[u8]) -> Vec<u8> {
        let udp = UdpHeader::new(33000, 53).serialize(
            IpAddr::V4(CLIENT_IP),
            IpAddr::V4(REMOTE_IP),
            payload,
        );
        Ipv4Header::new(CLIENT_IP, REMOTE_IP, 7, 64, PROTO_UDP).serialize(&udp)
    }

    fn parse(frame: &[u8]) -> Indicator<'_> {
        Indicator::parse_frame(frame, LinkKind::Ethernet).unwrap()
    }

    fn ipv4_of(ind: &Indicator) -> Ipv4Header {
        match ind.net {
            Network::V4(h) => h,
            Network::V6(_) => panic!("expected ipv4"),
        }
    }

    fn tcp_of(ind: &Indicator) -> TcpHeader {
        match ind.transport {
            Transport::Tcp(h) => h,
            _ => panic!("expected tcp"),
        }
    }

    fn udp_of(ind: &Indicator) -> UdpHeader {
        match ind.transport {
            Transport::Udp(h) => h,
            _ => panic!("expected udp"),
        }
    }

    fn icmp_of(ind: &Indicator) -> Icmpv4Header {
        match ind.transport {
            Transport::Icmpv4(h) => h,
            _ => panic!("expected icmpv4"),
        }
    }

    #[test]
    fn test_syn_handshake_emits_syn_ack() {
        let h = harness();
        h.server.handle_listen(&syn_frame(1000), &h.listen_conn).unwrap();

        let written = h.listen_cap.written();
        assert_eq!(written.len(), 1);
        let (eth, _) = EthernetHeader::parse(&written[0]).unwrap();
        assert_eq!(eth.src, SRV_MAC);
        assert_eq!(eth.dst, GW_MAC);

        let reply = parse(&written[0]);
        let ip = ipv4_of(&reply);
        assert_eq!(ip.src, LISTEN_IP);
        assert_eq!(ip.dst, CLIENT_IP);
        assert_eq!(ip.id, 0);
        assert_eq!(ip.ttl, SYN_ACK_TTL);
        let tcp = tcp_of(&reply);
        assert_eq!(tcp.src_port, 8080);
        assert_eq!(tcp.dst_port, 50000);
        assert_eq!(tcp.seq, 0);
        assert_eq!(tcp.ack, 1001);
        assert_eq!(tcp.flags, FLAG_SYN | FLAG_ACK);
        assert!(reply.payload.is_empty());

        let client = h.server.clients.get(&client_ep()).unwrap();
        assert_eq!(client.seq.load(Ordering::Relaxed), 1);
        assert_eq!(client.ack.load(Ordering::Relaxed), 1001);
    }

    #[test]
    fn test_repeated_syn_resets_session() {
        let h = harness();
        h.server.handle_listen(&syn_frame(1000), &h.listen_conn).unwrap();
        let stale = h.server.clients.get(&client_ep()).unwrap();
        stale.ack.fetch_add(40, Ordering::Relaxed);

        h.server.handle_listen(&syn_frame(5000), &h.listen_conn).unwrap();
        let written = h.listen_cap.written();
        // Exactly one SYN+ACK per SYN, with the IPv4 id advancing.
        assert_eq!(written.len(), 2);
        assert_eq!(ipv4_of(&parse(&written[1])).id, 1);
        assert_eq!(tcp_of(&parse(&written[1])).ack, 5001);

        let client = h.server.clients.get(&client_ep()).unwrap();
        assert_eq!(client.seq.load(Ordering::Relaxed), 1);
        assert_eq!(client.ack.load(Ordering::Relaxed), 5001);
    }

    #[test]
    fn test_bare_ack_is_ignored() {
        let h = harness();
        h.server.handle_listen(&syn_frame(1000), &h.listen_conn).unwrap();
        h.server.handle_listen(&data_frame(1001, &[]), &h.listen_conn).unwrap();
        assert_eq!(h.listen_cap.written().len(), 1);
        assert!(h.up_cap.written().is_empty());
        let client = h.server.clients.get(&client_ep()).unwrap();
        assert_eq!(client.ack.load(Ordering::Relaxed), 1001);
    }

    #[test]
    fn test_non_tcp_listener_frame_is_rejected() {
        let h = harness();
        let udp = UdpHeader::new(50000, 8080).serialize(
            IpAddr::V4(CLIENT_IP),
            IpAddr::V4(LISTEN_IP),
            b"x",
        );
        let packet = Ipv4Header::new(CLIENT_IP, LISTEN_IP, 1, 64, PROTO_UDP).serialize(&udp);
        let err = h.server.handle_listen(&eth_to_server(&packet), &h.listen_conn);
        assert!(matches!(err, Err(PipelineError::UnsupportedLayer(_))));
    }

    #[test]
    fn test_data_without_session_is_unauthorized() {
        let h = harness();
        let err = h.server.handle_listen(&data_frame(1, b"data"), &h.listen_conn);
        assert!(matches!(err, Err(PipelineError::Unauthorized(_))));
        assert!(h.up_cap.written().is_empty());
    }

    #[test]
    fn test_inbound_udp_rewrite_and_nat() {
        let h = harness();
        h.server.handle_listen(&syn_frame(1000), &h.listen_conn).unwrap();

        let inner = inner_udp(&[0xab; 20]);
        h.server.handle_listen(&data_frame(1001, &inner), &h.listen_conn).unwrap();

        let ups = h.up_cap.written();
        assert_eq!(ups.len(), 1);
        let (eth, _) = EthernetHeader::parse(&ups[0]).unwrap();
        assert_eq!(eth.src, UP_MAC);
        assert_eq!(eth.dst, GW_MAC);

        let out = parse(&ups[0]);
        let ip = ipv4_of(&out);
        assert_eq!(ip.src, UP_IP);
        assert_eq!(ip.dst, REMOTE_IP);
        // The inner packet's own id and ttl ride through untouched.
        assert_eq!(ip.id, 7);
        assert_eq!(ip.ttl, 64);
        let udp = udp_of(&out);
        assert_eq!(udp.src_port, 49152);
        assert_eq!(udp.dst_port, 53);
        assert_eq!(out.payload, &[0xab; 20]);

        let client = h.server.clients.get(&client_ep()).unwrap();
        assert_eq!(
            client.ack.load(Ordering::Relaxed),
            1001 + inner.len() as u32
        );

        let key = (Endpoint::new(IpAddr::V4(UP_IP), 49152), TransProto::Udp);
        let mapping = h.server.nat.get(&key).unwrap();
        assert_eq!(mapping.src, client_ep());
        assert_eq!(mapping.dst, Endpoint::new(IpAddr::V4(LISTEN_IP), 8080));
        assert_eq!(mapping.emb_src, Endpoint::new(IpAddr::V4(CLIENT_IP), 33000));
    }

    #[test]
    fn test_outbound_udp_reply_wrapped() {
        let h = harness();
        h.server.handle_listen(&syn_frame(1000), &h.listen_conn).unwrap();
        let inner = inner_udp(&[0xab; 20]);
        h.server.handle_listen(&data_frame(1001, &inner), &h.listen_conn).unwrap();

        let reply_udp = UdpHeader::new(53, 49152).serialize(
            IpAddr::V4(REMOTE_IP),
            IpAddr::V4(UP_IP),
            &[0xcd; 60],
        );
        let reply = Ipv4Header::new(REMOTE_IP, UP_IP, 99, 57, PROTO_UDP).serialize(&reply_udp);
        h.server.handle_upstream(&eth_to_upstream(&reply)).unwrap();

        let written = h.listen_cap.written();
        assert_eq!(written.len(), 2);
        let out = parse(&written[1]);
        let ip = ipv4_of(&out);
        assert_eq!(ip.src, LISTEN_IP);
        assert_eq!(ip.dst, CLIENT_IP);
        assert_eq!(ip.ttl, 56); // inner ttl - 1
        assert_eq!(ip.id, 1); // id 0 went to the SYN+ACK
        let tcp = tcp_of(&out);
        assert_eq!(tcp.src_port, 8080);
        assert_eq!(tcp.dst_port, 50000);
        assert_eq!(tcp.seq, 1);
        assert_eq!(tcp.ack, 1001 + inner.len() as u32);
        assert_eq!(tcp.flags, FLAG_PSH | FLAG_ACK);

        // With the plain cipher the payload is the inner packet itself.
        let contents = Indicator::parse_ip(out.payload).unwrap();
        let inner_ip = ipv4_of(&contents);
        assert_eq!(inner_ip.src, REMOTE_IP);
        assert_eq!(inner_ip.dst, CLIENT_IP);
        let payload_udp = udp_of(&contents);
        assert_eq!(payload_udp.src_port, 53);
        assert_eq!(payload_udp.dst_port, 33000);
        assert_eq!(contents.payload, &[0xcd; 60]);

        let client = h.server.clients.get(&client_ep()).unwrap();
        assert_eq!(
            client.seq.load(Ordering::Relaxed),
            1 + out.payload.len() as u32
        );
    }

    #[test]
    fn test_icmp_echo_round_trip() {
        let h = harness();
        h.server.handle_listen(&syn_frame(1000), &h.listen_conn).unwrap();

        let target = Ipv4Addr::new(1, 1, 1, 1);
        let echo = icmpv4::Icmpv4Header::echo_request(0x1234, 1).serialize(b"ping");
        let inner = Ipv4Header::new(CLIENT_IP, target, 3, 64, PROTO_ICMPV4).serialize(&echo);
        h.server.handle_listen(&data_frame(1001, &inner), &h.listen_conn).unwrap();

        let ups = h.up_cap.written();
        assert_eq!(ups.len(), 1);
        let out = parse(&ups[0]);
        assert_eq!(ipv4_of(&out).src, UP_IP);
        assert_eq!(ipv4_of(&out).dst, target);
        let icmp = icmp_of(&out);
        assert_eq!(icmp.kind, icmpv4::TYPE_ECHO_REQUEST);
        assert_eq!(icmp.id(), 0); // first allocated identifier
        assert_eq!(icmp.seq(), 1);
        assert_eq!(out.payload, b"ping");

        let reply_icmp = icmpv4::Icmpv4Header::echo_reply(0, 1).serialize(b"ping");
        let reply = Ipv4Header::new(target, UP_IP, 9, 60, PROTO_ICMPV4).serialize(&reply_icmp);
        h.server.handle_upstream(&eth_to_upstream(&reply)).unwrap();

        let written = h.listen_cap.written();
        assert_eq!(written.len(), 2);
        let contents = Indicator::parse_ip(parse(&written[1]).payload).unwrap();
        assert_eq!(ipv4_of(&contents).src, target);
        assert_eq!(ipv4_of(&contents).dst, CLIENT_IP);
        let icmp = icmp_of(&contents);
        assert_eq!(icmp.kind, icmpv4::TYPE_ECHO_REPLY);
        assert_eq!(icmp.id(), 0x1234);
        assert_eq!(contents.payload, b"ping");
    }

    #[test]
    fn test_inbound_icmp_error_without_mapping_dropped() {
        let h = harness();
        h.server.handle_listen(&syn_frame(1000), &h.listen_conn).unwrap();

        // Error about a flow that was never tunneled.
        let quote = Ipv4Header::new(REMOTE_IP, CLIENT_IP, 1, 64, PROTO_UDP).serialize(
            &UdpHeader::new(53, 33000).serialize(IpAddr::V4(REMOTE_IP), IpAddr::V4(CLIENT_IP), b"x"),
        );
        let error = Icmpv4Header {
            kind: TYPE_DEST_UNREACHABLE,
            code: 3,
            rest: [0; 4],
        }
        .serialize(&quote);
        let inner = Ipv4Header::new(CLIENT_IP, REMOTE_IP, 2, 64, PROTO_ICMPV4).serialize(&error);

        let err = h.server.handle_listen(&data_frame(1001, &inner), &h.listen_conn);
        assert!(matches!(err, Err(PipelineError::MissingNat(_))));
        assert!(h.up_cap.written().is_empty());
    }

    #[test]
    fn test_inbound_icmp_error_rides_existing_flow() {
        let h = harness();
        h.server.handle_listen(&syn_frame(1000), &h.listen_conn).unwrap();
        h.server.handle_listen(&data_frame(1001, &inner_udp(b"q")), &h.listen_conn).unwrap();

        // The client reports the reply direction of the mapped flow as
        // unreachable; the quote is the packet it received.
        let quote = Ipv4Header::new(REMOTE_IP, CLIENT_IP, 1, 64, PROTO_UDP).serialize(
            &UdpHeader::new(53, 33000).serialize(IpAddr::V4(REMOTE_IP), IpAddr::V4(CLIENT_IP), b"r"),
        );
        let error = Icmpv4Header {
            kind: TYPE_DEST_UNREACHABLE,
            code: 3,
            rest: [0; 4],
        }
        .serialize(&quote);
        let inner = Ipv4Header::new(CLIENT_IP, REMOTE_IP, 2, 64, PROTO_ICMPV4).serialize(&error);
        h.server.handle_listen(&data_frame(2000, &inner), &h.listen_conn).unwrap();

        let ups = h.up_cap.written();
        assert_eq!(ups.len(), 2);
        let out = parse(&ups[1]);
        assert_eq!(ipv4_of(&out).src, UP_IP);
        assert_eq!(ipv4_of(&out).dst, REMOTE_IP);
        assert!(out.is_icmpv4_error());
        // The quoted destination now names the translated flow.
        let emb = out.embedded.as_ref().unwrap();
        assert_eq!(emb.src(), Endpoint::new(IpAddr::V4(REMOTE_IP), 53));
        assert_eq!(emb.dst(), Endpoint::new(IpAddr::V4(UP_IP), 49152));
    }

    #[test]
    fn test_outbound_icmp_error_translated_back() {
        let h = harness();
        h.server.handle_listen(&syn_frame(1000), &h.listen_conn).unwrap();
        h.server.handle_listen(&data_frame(1001, &inner_udp(b"q")), &h.listen_conn).unwrap();

        // A router reports time-exceeded, quoting our translated packet.
        let router = Ipv4Addr::new(198, 51, 100, 1);
        let quote = Ipv4Header::new(UP_IP, REMOTE_IP, 7, 1, PROTO_UDP).serialize(
            &UdpHeader::new(49152, 53).serialize(IpAddr::V4(UP_IP), IpAddr::V4(REMOTE_IP), b"q"),
        );
        let error = Icmpv4Header {
            kind: TYPE_TIME_EXCEEDED,
            code: 0,
            rest: [0; 4],
        }
        .serialize(&quote);
        let reply = Ipv4Header::new(router, UP_IP, 9, 60, PROTO_ICMPV4).serialize(&error);
        h.server.handle_upstream(&eth_to_upstream(&reply)).unwrap();

        let written = h.listen_cap.written();
        assert_eq!(written.len(), 2);
        let contents = Indicator::parse_ip(parse(&written[1]).payload).unwrap();
        assert_eq!(ipv4_of(&contents).src, router);
        assert_eq!(ipv4_of(&contents).dst, CLIENT_IP);
        assert!(contents.is_icmpv4_error());
        let emb = contents.embedded.as_ref().unwrap();
        // The quote names the client's own flow again.
        assert_eq!(emb.src(), Endpoint::new(IpAddr::V4(CLIENT_IP), 33000));
        assert_eq!(emb.dst(), Endpoint::new(IpAddr::V4(REMOTE_IP), 53));
    }

    #[test]
    fn test_upstream_without_mapping_is_silently_dropped() {
        let h = harness();
        let udp = UdpHeader::new(53, 49152).serialize(
            IpAddr::V4(REMOTE_IP),
            IpAddr::V4(UP_IP),
            b"stray",
        );
        let packet = Ipv4Header::new(REMOTE_IP, UP_IP, 1, 57, PROTO_UDP).serialize(&udp);
        h.server.handle_upstream(&eth_to_upstream(&packet)).unwrap();
        assert!(h.listen_cap.written().is_empty());
    }

    #[test]
    fn test_seq_accumulates_across_replies() {
        let h = harness();
        h.server.handle_listen(&syn_frame(1000), &h.listen_conn).unwrap();
        h.server.handle_listen(&data_frame(1001, &inner_udp(b"q")), &h.listen_conn).unwrap();

        let mut expected_seq = 1u32;
        for (len, id) in [(10usize, 99u16), (25, 100)] {
            let reply_udp = UdpHeader::new(53, 49152).serialize(
                IpAddr::V4(REMOTE_IP),
                IpAddr::V4(UP_IP),
                &vec![0x11; len],
            );
            let reply = Ipv4Header::new(REMOTE_IP, UP_IP, id, 57, PROTO_UDP).serialize(&reply_udp);
            h.server.handle_upstream(&eth_to_upstream(&reply)).unwrap();

            let written = h.listen_cap.written();
            let out = parse(written.last().unwrap());
            assert_eq!(tcp_of(&out).seq, expected_seq);
            expected_seq += out.payload.len() as u32;
        }
        let client = h.server.clients.get(&client_ep()).unwrap();
        assert_eq!(client.seq.load(Ordering::Relaxed), expected_seq);
    }

    #[test]
    fn test_run_drains_queued_frames_and_close_stops_it() {
        let h = harness();
        h.listen_cap.push_incoming(syn_frame(1000));
        let server = Arc::new(h.server);
        let runner = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.run())
        };

        // Wait for the reader/worker pair to answer the handshake.
        let mut tries = 0;
        while h.listen_cap.written().is_empty() {
            tries += 1;
            assert!(tries < 500, "no SYN+ACK emitted");
            thread::sleep(std::time::Duration::from_millis(2));
        }

        server.close();
        // Readers see errors on closed captures and exit silently.
        assert!(runner.join().unwrap().is_ok());
        assert_eq!(h.listen_cap.written().len(), 1);
    }

    #[test]
    fn test_close_before_run_exits_cleanly() {
        let h = harness();
        let server = Arc::new(h.server);
        server.close();
        assert!(server.run().is_ok());
    }

    #[test]
    fn test_ipv4_id_counter_wraps() {
        let h = harness();
        h.server.ipv4_id.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(h.server.next_ipv4_id(), u16::MAX);
        assert_eq!(h.server.next_ipv4_id(), 0);
        assert_eq!(h.server.next_ipv4_id(), 1);
    }

    #[test]
    fn test_open_validation() {
        let h = harness();
        let upstream = h.server.upstream.clone();
        assert!(Server::new(0, vec![h.listen_conn.clone()], upstream.clone(), Arc::new(Plain)).is_err());
        assert!(Server::new(8080, Vec::new(), upstream, Arc::new(Plain)).is_err());
    }
}
