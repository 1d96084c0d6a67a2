//! The frame switch.
//!
//! [`VirtualNetwork::accept_qemu`] drives one guest link until the link
//! closes or its token is cancelled. A single task owns all network state;
//! host sockets are serviced by helper tasks that report back over a
//! bounded event channel, so no state is shared. A flow's host reader
//! pauses while the flow has
//! [`TCP_PENDING_LIMIT`](crate::constants::TCP_PENDING_LIMIT) bytes queued
//! for the guest.
//!
//! ## Link Framing
//!
//! QEMU `-netdev socket` framing: every Ethernet frame is preceded by its
//! length as a 4-byte big-endian integer.

use crate::constants::{DNS_PORT, MAX_FRAME_LEN, SWITCH_QUEUE_DEPTH, UDP_FLOW_IDLE};
use crate::error::{Error, Result};
use crate::network::config::NetworkConfig;
use crate::network::dhcp;
use crate::network::nat::NatTable;
use crate::network::tcp::{self, FlowKey, Output, TcpConn};
use crate::network::wire::{
    self, ARP_REPLY, ARP_REQUEST, Arp, ETHERTYPE_ARP, ETHERTYPE_IPV4, Ethernet, Ipv4, MacAddr,
    PROTO_ICMP, PROTO_TCP, PROTO_UDP, Tcp, Udp, flags,
};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// First gateway-side port used for forwarded connections.
const FORWARD_PORT_BASE: u16 = 32768;

/// A guest's virtual network: gateway, DHCP, NAT and port forwards.
pub struct VirtualNetwork {
    config: NetworkConfig,
    nat: NatTable,
    forwards: Vec<(std::net::TcpListener, SocketAddrV4)>,
}

impl std::fmt::Debug for VirtualNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualNetwork")
            .field("config", &self.config)
            .field("forwards", &self.forwards.len())
            .finish()
    }
}

impl VirtualNetwork {
    /// Builds the network and binds every forward's host listener.
    pub fn new(config: NetworkConfig) -> Result<Self> {
        let nat = NatTable::new(&config);

        let mut forwards = Vec::with_capacity(config.forwards().len());
        for forward in config.forwards() {
            let listener = std::net::TcpListener::bind(forward.host).map_err(|e| {
                Error::InvalidNetworkConfig(format!("binding forward {} failed: {}", forward.host, e))
            })?;
            listener.set_nonblocking(true)?;
            debug!(
                "Forwarding {} to guest port {}",
                forward.host, forward.guest_port
            );
            let target = nat.inbound(forward.host).ok_or_else(|| {
                Error::Internal(format!("no translation for forward {}", forward.host))
            })?;
            forwards.push((listener, target));
        }

        info!(
            "Virtual network {}/{} ready (gateway {}, guest {})",
            config.network(),
            config.prefix_len(),
            config.gateway(),
            config.guest_address()
        );
        Ok(Self {
            config,
            nat,
            forwards,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Local addresses of the forward listeners.
    pub fn forward_addrs(&self) -> Vec<SocketAddr> {
        self.forwards
            .iter()
            .filter_map(|(l, _)| l.local_addr().ok())
            .collect()
    }

    /// Carries the guest link over `stream` until it closes or `cancel`
    /// fires.
    pub async fn accept_qemu<S>(self, stream: S, cancel: CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut tasks = JoinSet::new();

        let (frames_tx, frames) = mpsc::channel::<FrameResult>(SWITCH_QUEUE_DEPTH);
        let (link_tx, link_rx) = mpsc::channel::<Vec<u8>>(SWITCH_QUEUE_DEPTH);
        let (events_tx, events) = mpsc::channel::<Event>(SWITCH_QUEUE_DEPTH);

        tasks.spawn(read_frames(reader, frames_tx));
        tasks.spawn(write_frames(writer, link_rx));
        for (listener, target) in self.forwards {
            let listener = TcpListener::from_std(listener)?;
            tasks.spawn(accept_forwards(listener, target, events_tx.clone()));
        }

        let mut switch = Switch {
            config: self.config,
            nat: self.nat,
            link: link_tx,
            events: events_tx,
            tcp: HashMap::new(),
            udp: HashMap::new(),
            next_id: 0,
            next_forward_port: FORWARD_PORT_BASE,
            tasks,
        };

        let result = switch.run(frames, events, cancel).await;

        debug!("Network link closed");
        switch.tasks.abort_all();
        result
    }
}

// =============================================================================
// Link I/O
// =============================================================================

/// Reads one length-prefixed frame. Returns `None` at end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Internal(format!(
            "link frame of {} bytes exceeds {}",
            len, MAX_FRAME_LEN
        )));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    writer.write_all(frame).await?;
    Ok(())
}

type FrameResult = std::result::Result<Vec<u8>, Error>;

async fn read_frames<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<FrameResult>) {
    loop {
        let item = match read_frame(&mut reader).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => return,
            Err(e) => Err(e),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            return;
        }
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!("Link write failed: {}", e);
            return;
        }
    }
}

// =============================================================================
// Host Side Helpers
// =============================================================================

enum Event {
    Inbound {
        stream: TcpStream,
        target: SocketAddrV4,
    },
    Connected {
        key: FlowKey,
        id: u64,
        result: std::io::Result<TcpStream>,
    },
    TcpData {
        key: FlowKey,
        id: u64,
        data: Vec<u8>,
    },
    TcpEof {
        key: FlowKey,
        id: u64,
    },
    UdpReply {
        key: UdpKey,
        data: Vec<u8>,
    },
    UdpIdle {
        key: UdpKey,
        id: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct UdpKey {
    guest_port: u16,
    remote: SocketAddrV4,
}

async fn accept_forwards(listener: TcpListener, target: SocketAddrV4, events: mpsc::Sender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Forwarded connection from {} to {}", peer, target);
                if events.send(Event::Inbound { stream, target }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("Forward listener for {} failed: {}", target, e);
                return;
            }
        }
    }
}

async fn read_host(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    key: FlowKey,
    id: u64,
    events: mpsc::Sender<Event>,
    mut gate: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; crate::constants::TCP_MSS * 4];
    loop {
        // Closed while the guest's backlog is full.
        if gate.wait_for(|open| *open).await.is_err() {
            return;
        }
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = events.send(Event::TcpEof { key, id }).await;
                return;
            }
            Ok(n) => {
                let data = buf[..n].to_vec();
                if events.send(Event::TcpData { key, id, data }).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write_host(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(data) = rx.recv().await {
        if writer.write_all(&data).await.is_err() {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn relay_udp(
    socket: Arc<UdpSocket>,
    key: UdpKey,
    id: u64,
    events: mpsc::Sender<Event>,
) {
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    loop {
        match tokio::time::timeout(UDP_FLOW_IDLE, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                let data = buf[..n].to_vec();
                if events.send(Event::UdpReply { key, data }).await.is_err() {
                    return;
                }
            }
            Ok(Err(_)) | Err(_) => {
                let _ = events.send(Event::UdpIdle { key, id }).await;
                return;
            }
        }
    }
}

// =============================================================================
// Switch
// =============================================================================

struct TcpEntry {
    conn: TcpConn,
    to_host: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Open while the host reader may keep reading.
    gate: Option<watch::Sender<bool>>,
    /// Host stream of a forwarded connection, held until the guest answers.
    parked: Option<TcpStream>,
}

struct UdpFlow {
    id: u64,
    socket: Arc<UdpSocket>,
}

struct Switch {
    config: NetworkConfig,
    nat: NatTable,
    link: mpsc::Sender<Vec<u8>>,
    events: mpsc::Sender<Event>,
    tcp: HashMap<FlowKey, TcpEntry>,
    udp: HashMap<UdpKey, UdpFlow>,
    next_id: u64,
    next_forward_port: u16,
    tasks: JoinSet<()>,
}

impl Switch {
    async fn run(
        &mut self,
        mut frames: mpsc::Receiver<FrameResult>,
        mut events: mpsc::Receiver<Event>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = frames.recv() => match frame {
                    Some(Ok(frame)) => self.on_frame(&frame).await,
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
                Some(event) = events.recv() => self.on_event(event).await,
                Some(joined) = self.tasks.join_next() => reap(joined),
            }
        }
    }

    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    async fn send_ip(&self, packet: Vec<u8>) {
        self.send_frame(self.config.guest_mac(), ETHERTYPE_IPV4, &packet)
            .await;
    }

    async fn send_frame(&self, dst: MacAddr, ethertype: u16, payload: &[u8]) {
        let frame = wire::ethernet(dst, self.config.gateway_mac(), ethertype, payload);
        let _ = self.link.send(frame).await;
    }

    async fn on_frame(&mut self, frame: &[u8]) {
        let Some(eth) = Ethernet::parse(frame) else {
            return;
        };
        if eth.dst != self.config.gateway_mac() && !eth.dst.is_broadcast() {
            return;
        }
        match eth.ethertype {
            ETHERTYPE_ARP => self.on_arp(eth.payload).await,
            ETHERTYPE_IPV4 => self.on_ipv4(eth.payload).await,
            _ => {}
        }
    }

    async fn on_arp(&mut self, data: &[u8]) {
        let Some(arp) = Arp::parse(data) else { return };
        if arp.op != ARP_REQUEST || arp.target_ip != self.config.gateway() {
            return;
        }
        let reply = Arp {
            op: ARP_REPLY,
            sender_mac: self.config.gateway_mac(),
            sender_ip: self.config.gateway(),
            target_mac: arp.sender_mac,
            target_ip: arp.sender_ip,
        };
        self.send_frame(arp.sender_mac, ETHERTYPE_ARP, &reply.to_bytes())
            .await;
    }

    async fn on_ipv4(&mut self, data: &[u8]) {
        let Some(ip) = Ipv4::parse(data) else { return };
        match ip.protocol {
            PROTO_ICMP => {
                if ip.dst == self.config.gateway()
                    && let Some(reply) = wire::icmp_echo_reply(ip.payload)
                {
                    self.send_ip(wire::ipv4_packet(ip.dst, ip.src, PROTO_ICMP, &reply))
                        .await;
                }
            }
            PROTO_UDP => {
                if let Some(udp) = Udp::parse(ip.payload) {
                    self.on_udp(&ip, &udp).await;
                }
            }
            PROTO_TCP => {
                if ip.src == self.config.guest_address()
                    && let Some(tcp) = Tcp::parse(ip.payload)
                {
                    self.on_tcp(ip.dst, &tcp).await;
                }
            }
            _ => {}
        }
    }

    async fn on_udp(&mut self, ip: &Ipv4<'_>, udp: &Udp<'_>) {
        if udp.dst_port == dhcp::SERVER_PORT {
            self.on_dhcp(udp.payload).await;
            return;
        }
        if ip.src != self.config.guest_address()
            || ip.dst == self.config.broadcast()
            || ip.dst == Ipv4Addr::BROADCAST
        {
            return;
        }

        let key = UdpKey {
            guest_port: udp.src_port,
            remote: SocketAddrV4::new(ip.dst, udp.dst_port),
        };
        if !self.udp.contains_key(&key) {
            let target = self.nat.outbound(key.remote);
            let socket = match bind_udp(target).await {
                Ok(socket) => Arc::new(socket),
                Err(e) => {
                    debug!("UDP flow to {} failed: {}", target, e);
                    return;
                }
            };
            if key.remote.port() == DNS_PORT && *key.remote.ip() == self.config.gateway() {
                debug!("Relaying DNS to {}", target);
            }
            let id = self.id();
            self.tasks
                .spawn(relay_udp(Arc::clone(&socket), key, id, self.events.clone()));
            self.udp.insert(key, UdpFlow { id, socket });
        }
        if let Some(flow) = self.udp.get(&key)
            && let Err(e) = flow.socket.try_send(udp.payload)
        {
            debug!("UDP send to {} failed: {}", key.remote, e);
        }
    }

    async fn on_dhcp(&mut self, data: &[u8]) {
        let Some(request) = dhcp::Message::parse(data) else {
            return;
        };
        let Some((kind, reply)) = dhcp::reply(&self.config, &request) else {
            return;
        };
        debug!("DHCP {:?} -> {:?}", request.message_type, kind);

        let (dst_ip, dst_mac) = if request.wants_broadcast() {
            (Ipv4Addr::BROADCAST, MacAddr::BROADCAST)
        } else {
            (self.config.guest_address(), request.chaddr)
        };
        let gateway = self.config.gateway();
        let segment = wire::udp_segment(gateway, dhcp::SERVER_PORT, dst_ip, dhcp::CLIENT_PORT, &reply);
        let packet = wire::ipv4_packet(gateway, dst_ip, PROTO_UDP, &segment);
        self.send_frame(dst_mac, ETHERTYPE_IPV4, &packet).await;
    }

    async fn on_tcp(&mut self, dst: Ipv4Addr, seg: &Tcp<'_>) {
        let key = FlowKey {
            guest_port: seg.src_port,
            remote: SocketAddrV4::new(dst, seg.dst_port),
        };
        let guest = self.config.guest_address();

        if !self.tcp.contains_key(&key) {
            if seg.has(flags::SYN) && !seg.has(flags::ACK) {
                self.start_egress(key, seg);
            } else if let Some(rst) = tcp::reset_for(guest, key, seg) {
                self.send_ip(rst).await;
            }
            return;
        }

        let Some(entry) = self.tcp.get_mut(&key) else {
            return;
        };
        let out = entry.conn.on_segment(seg);
        let parked = if out.established {
            entry.parked.take().map(|stream| (stream, entry.conn.id))
        } else {
            None
        };
        if let Some((stream, id)) = parked {
            let (tx, gate) = self.spawn_host_io(stream, key, id);
            if let Some(entry) = self.tcp.get_mut(&key) {
                entry.to_host = Some(tx);
                entry.gate = Some(gate);
            }
        }
        self.apply(key, out).await;
    }

    fn start_egress(&mut self, key: FlowKey, syn: &Tcp<'_>) {
        let id = self.id();
        let conn = TcpConn::from_syn(id, key, self.config.guest_address(), syn);
        self.tcp.insert(
            key,
            TcpEntry {
                conn,
                to_host: None,
                gate: None,
                parked: None,
            },
        );

        let target = self.nat.outbound(key.remote);
        let events = self.events.clone();
        self.tasks.spawn(async move {
            let result = TcpStream::connect(target).await;
            let _ = events.send(Event::Connected { key, id, result }).await;
        });
    }

    fn spawn_host_io(
        &mut self,
        stream: TcpStream,
        key: FlowKey,
        id: u64,
    ) -> (mpsc::UnboundedSender<Vec<u8>>, watch::Sender<bool>) {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (gate, gate_rx) = watch::channel(true);
        self.tasks
            .spawn(read_host(reader, key, id, self.events.clone(), gate_rx));
        self.tasks.spawn(write_host(writer, rx));
        (tx, gate)
    }

    async fn apply(&mut self, key: FlowKey, out: Output) {
        for packet in out.packets {
            self.send_ip(packet).await;
        }
        if let Some(entry) = self.tcp.get_mut(&key) {
            if !out.to_host.is_empty()
                && let Some(tx) = &entry.to_host
            {
                let _ = tx.send(out.to_host);
            }
            if out.shutdown_host {
                entry.to_host = None;
            }
            if let Some(gate) = &entry.gate {
                let open = entry.conn.wants_host_data();
                gate.send_if_modified(|current| std::mem::replace(current, open) != open);
            }
        }
        if out.closed {
            debug!("TCP flow {}:{} closed", key.remote, key.guest_port);
            self.tcp.remove(&key);
        }
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Inbound { stream, target } => {
                let port = self.next_forward_port;
                self.next_forward_port = self.next_forward_port.checked_add(1).unwrap_or(FORWARD_PORT_BASE);
                let key = FlowKey {
                    guest_port: target.port(),
                    remote: SocketAddrV4::new(self.config.gateway(), port),
                };
                if let Some(old) = self.tcp.remove(&key) {
                    debug!("Replacing stale forwarded flow {}", old.conn.id);
                }
                let id = self.id();
                let (conn, syn) = TcpConn::open(id, key, *target.ip());
                self.tcp.insert(
                    key,
                    TcpEntry {
                        conn,
                        to_host: None,
                        gate: None,
                        parked: Some(stream),
                    },
                );
                self.send_ip(syn).await;
            }
            Event::Connected { key, id, result } => {
                let Some(entry) = self.tcp.get_mut(&key).filter(|e| e.conn.id == id) else {
                    return;
                };
                match result {
                    Ok(stream) => {
                        let out = entry.conn.connected();
                        let (tx, gate) = self.spawn_host_io(stream, key, id);
                        if let Some(entry) = self.tcp.get_mut(&key) {
                            entry.to_host = Some(tx);
                            entry.gate = Some(gate);
                        }
                        self.apply(key, out).await;
                    }
                    Err(e) => {
                        debug!("Egress connect to {} failed: {}", key.remote, e);
                        let rst = entry.conn.refuse();
                        self.tcp.remove(&key);
                        self.send_ip(rst).await;
                    }
                }
            }
            Event::TcpData { key, id, data } => {
                if let Some(entry) = self.tcp.get_mut(&key).filter(|e| e.conn.id == id) {
                    let out = entry.conn.on_host_data(&data);
                    self.apply(key, out).await;
                }
            }
            Event::TcpEof { key, id } => {
                if let Some(entry) = self.tcp.get_mut(&key).filter(|e| e.conn.id == id) {
                    let out = entry.conn.on_host_eof();
                    self.apply(key, out).await;
                }
            }
            Event::UdpReply { key, data } => {
                let guest = self.config.guest_address();
                let remote = key.remote;
                let segment =
                    wire::udp_segment(*remote.ip(), remote.port(), guest, key.guest_port, &data);
                self.send_ip(wire::ipv4_packet(*remote.ip(), guest, PROTO_UDP, &segment))
                    .await;
            }
            Event::UdpIdle { key, id } => {
                if self.udp.get(&key).is_some_and(|f| f.id == id) {
                    self.udp.remove(&key);
                }
            }
        }
    }
}

fn reap(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined
        && !e.is_cancelled()
    {
        warn!("Network helper task failed: {}", e);
    }
}

async fn bind_udp(target: SocketAddr) -> std::io::Result<UdpSocket> {
    let local: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(target).await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest_frame(config: &NetworkConfig, packet: &[u8]) -> Vec<u8> {
        wire::ethernet(
            config.gateway_mac(),
            config.guest_mac(),
            ETHERTYPE_IPV4,
            packet,
        )
    }

    fn switch(config: NetworkConfig) -> (Switch, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<Event>) {
        let (link, link_rx) = mpsc::channel(SWITCH_QUEUE_DEPTH);
        let (events, events_rx) = mpsc::channel(SWITCH_QUEUE_DEPTH);
        let switch = Switch {
            nat: NatTable::new(&config),
            config,
            link,
            events,
            tcp: HashMap::new(),
            udp: HashMap::new(),
            next_id: 0,
            next_forward_port: FORWARD_PORT_BASE,
            tasks: JoinSet::new(),
        };
        (switch, link_rx, events_rx)
    }

    #[tokio::test]
    async fn test_finished_helper_tasks_are_reaped() {
        let config = NetworkConfig::builder().build().unwrap();
        let (mut switch, _link, events) = switch(config);
        for _ in 0..8 {
            switch.tasks.spawn(async {});
        }
        switch.tasks.spawn(async { panic!("helper failed") });

        let (_frames_tx, frames) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            stop.cancel();
        });

        switch.run(frames, events, cancel).await.unwrap();
        assert!(switch.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"frame").await.unwrap();
        drop(a);
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"frame");
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_gateway_answers_arp_and_ping() {
        let config = NetworkConfig::builder().build().unwrap();
        let vn = VirtualNetwork::new(config.clone()).unwrap();
        let (host, guest) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let link = tokio::spawn(vn.accept_qemu(host, cancel.clone()));
        let (mut rd, mut wr) = tokio::io::split(guest);

        let arp = Arp {
            op: ARP_REQUEST,
            sender_mac: config.guest_mac(),
            sender_ip: config.guest_address(),
            target_mac: MacAddr([0; 6]),
            target_ip: config.gateway(),
        };
        let frame = wire::ethernet(
            MacAddr::BROADCAST,
            config.guest_mac(),
            ETHERTYPE_ARP,
            &arp.to_bytes(),
        );
        write_frame(&mut wr, &frame).await.unwrap();

        let reply = read_frame(&mut rd).await.unwrap().unwrap();
        let eth = Ethernet::parse(&reply).unwrap();
        let arp = Arp::parse(eth.payload).unwrap();
        assert_eq!(arp.op, ARP_REPLY);
        assert_eq!(arp.sender_mac, config.gateway_mac());

        let mut echo = vec![8, 0, 0, 0, 0, 1, 0, 1, 1, 2, 3];
        let sum = wire::checksum(&[&echo]);
        echo[2..4].copy_from_slice(&sum.to_be_bytes());
        let ping = wire::ipv4_packet(config.guest_address(), config.gateway(), PROTO_ICMP, &echo);
        write_frame(&mut wr, &guest_frame(&config, &ping)).await.unwrap();

        let reply = read_frame(&mut rd).await.unwrap().unwrap();
        let eth = Ethernet::parse(&reply).unwrap();
        let ip = Ipv4::parse(eth.payload).unwrap();
        assert_eq!(ip.src, config.gateway());
        assert_eq!(ip.payload[0], 0);

        cancel.cancel();
        link.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_guest_connects_to_host_service() {
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = service.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = service.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"pong").await.unwrap();
            buf
        });

        let config = NetworkConfig::builder().build().unwrap();
        let vn = VirtualNetwork::new(config.clone()).unwrap();
        let (host, guest) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let link = tokio::spawn(vn.accept_qemu(host, cancel.clone()));
        let (mut rd, mut wr) = tokio::io::split(guest);

        let send = |seq: u32, ack: u32, f: u8, payload: &[u8]| {
            let segment = wire::tcp_segment(
                &wire::TcpHeader {
                    src: config.guest_address(),
                    src_port: 45000,
                    dst: config.gateway(),
                    dst_port: port,
                    seq,
                    ack,
                    flags: f,
                    window: 65535,
                    mss: None,
                },
                payload,
            );
            let packet =
                wire::ipv4_packet(config.guest_address(), config.gateway(), PROTO_TCP, &segment);
            guest_frame(&config, &packet)
        };
        let recv_tcp = |frame: Vec<u8>| {
            let eth = Ethernet::parse(&frame).unwrap();
            let ip = Ipv4::parse(eth.payload).unwrap();
            let tcp = Tcp::parse(ip.payload).unwrap();
            (tcp.seq, tcp.ack, tcp.flags, tcp.payload.to_vec())
        };

        write_frame(&mut wr, &send(100, 0, flags::SYN, &[])).await.unwrap();
        let (isn, ack, f, _) = recv_tcp(read_frame(&mut rd).await.unwrap().unwrap());
        assert_eq!(f, flags::SYN | flags::ACK);
        assert_eq!(ack, 101);

        let mut snd_ack = isn.wrapping_add(1);
        write_frame(&mut wr, &send(101, snd_ack, flags::ACK | flags::PSH, b"ping"))
            .await
            .unwrap();

        let mut received = Vec::new();
        while received.len() < 4 {
            let (seq, _, _, payload) = recv_tcp(read_frame(&mut rd).await.unwrap().unwrap());
            if !payload.is_empty() {
                assert_eq!(seq, snd_ack);
                snd_ack = snd_ack.wrapping_add(payload.len() as u32);
                received.extend(payload);
            }
        }
        assert_eq!(received, b"pong");
        assert_eq!(&server.await.unwrap(), b"ping");

        cancel.cancel();
        link.await.unwrap().unwrap();
    }
}
