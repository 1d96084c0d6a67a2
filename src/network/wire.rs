//! Wire formats of the virtual link.
//!
//! Minimal parsers and builders for the protocols the gateway speaks:
//! Ethernet II, ARP, IPv4, ICMP echo, UDP and TCP. Parsers borrow from the
//! frame; builders return complete frames with checksums filled in.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const ETH_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const TCP_HEADER_LEN: usize = 20;
const ARP_LEN: usize = 28;
const DEFAULT_TTL: u8 = 64;

/// TCP flag bits.
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

// =============================================================================
// Link Addresses
// =============================================================================

/// Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(format!("'{}' is not a 6-byte hardware address", s));
        }
        let mut mac = [0u8; 6];
        for (byte, part) in mac.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(format!("'{}' is not a 6-byte hardware address", s));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("'{}' is not a 6-byte hardware address", s))?;
        }
        Ok(MacAddr(mac))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

// =============================================================================
// Ethernet
// =============================================================================

pub struct Ethernet<'a> {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
    pub payload: &'a [u8],
}

impl<'a> Ethernet<'a> {
    pub fn parse(frame: &'a [u8]) -> Option<Self> {
        if frame.len() < ETH_HEADER_LEN {
            return None;
        }
        Some(Self {
            dst: MacAddr(frame[0..6].try_into().ok()?),
            src: MacAddr(frame[6..12].try_into().ok()?),
            ethertype: u16::from_be_bytes([frame[12], frame[13]]),
            payload: &frame[ETH_HEADER_LEN..],
        })
    }
}

pub fn ethernet(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETH_HEADER_LEN + payload.len());
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

// =============================================================================
// ARP
// =============================================================================

pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

pub struct Arp {
    pub op: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl Arp {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ARP_LEN {
            return None;
        }
        let htype = u16::from_be_bytes([data[0], data[1]]);
        let ptype = u16::from_be_bytes([data[2], data[3]]);
        if htype != 1 || ptype != ETHERTYPE_IPV4 || data[4] != 6 || data[5] != 4 {
            return None;
        }
        Some(Self {
            op: u16::from_be_bytes([data[6], data[7]]),
            sender_mac: MacAddr(data[8..14].try_into().ok()?),
            sender_ip: ipv4(&data[14..18]),
            target_mac: MacAddr(data[18..24].try_into().ok()?),
            target_ip: ipv4(&data[24..28]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(ARP_LEN);
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        data.push(6);
        data.push(4);
        data.extend_from_slice(&self.op.to_be_bytes());
        data.extend_from_slice(&self.sender_mac.0);
        data.extend_from_slice(&self.sender_ip.octets());
        data.extend_from_slice(&self.target_mac.0);
        data.extend_from_slice(&self.target_ip.octets());
        data
    }
}

// =============================================================================
// IPv4
// =============================================================================

pub struct Ipv4<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub payload: &'a [u8],
}

impl<'a> Ipv4<'a> {
    /// Parses an unfragmented IPv4 packet.
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < IPV4_HEADER_LEN || data[0] >> 4 != 4 {
            return None;
        }
        let ihl = usize::from(data[0] & 0x0f) * 4;
        let total = usize::from(u16::from_be_bytes([data[2], data[3]]));
        if ihl < IPV4_HEADER_LEN || total < ihl || total > data.len() {
            return None;
        }
        let frag = u16::from_be_bytes([data[6], data[7]]);
        if frag & 0x2000 != 0 || frag & 0x1fff != 0 {
            return None;
        }
        Some(Self {
            src: ipv4(&data[12..16]),
            dst: ipv4(&data[16..20]),
            protocol: data[9],
            payload: &data[ihl..total],
        })
    }
}

pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let total = (IPV4_HEADER_LEN + payload.len()) as u16;
    let mut packet = Vec::with_capacity(usize::from(total));
    packet.extend_from_slice(&[0x45, 0]);
    packet.extend_from_slice(&total.to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0x40, 0]); // id 0, don't fragment
    packet.push(DEFAULT_TTL);
    packet.push(protocol);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dst.octets());
    let sum = checksum(&[&packet[..IPV4_HEADER_LEN]]);
    packet[10..12].copy_from_slice(&sum.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

// =============================================================================
// ICMP
// =============================================================================

/// Builds the echo reply to an ICMP echo request, if `data` is one.
pub fn icmp_echo_reply(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < 8 || data[0] != 8 || data[1] != 0 {
        return None;
    }
    let mut reply = data.to_vec();
    reply[0] = 0;
    reply[2..4].copy_from_slice(&[0, 0]);
    let sum = checksum(&[&reply]);
    reply[2..4].copy_from_slice(&sum.to_be_bytes());
    Some(reply)
}

// =============================================================================
// UDP
// =============================================================================

pub struct Udp<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> Udp<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < UDP_HEADER_LEN {
            return None;
        }
        let len = usize::from(u16::from_be_bytes([data[4], data[5]]));
        if len < UDP_HEADER_LEN || len > data.len() {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            payload: &data[UDP_HEADER_LEN..len],
        })
    }
}

pub fn udp_segment(
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let len = (UDP_HEADER_LEN + payload.len()) as u16;
    let mut segment = Vec::with_capacity(usize::from(len));
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dst_port.to_be_bytes());
    segment.extend_from_slice(&len.to_be_bytes());
    segment.extend_from_slice(&[0, 0]);
    segment.extend_from_slice(payload);
    let mut sum = checksum(&[&pseudo_header(src, dst, PROTO_UDP, len), &segment]);
    if sum == 0 {
        sum = 0xffff;
    }
    segment[6..8].copy_from_slice(&sum.to_be_bytes());
    segment
}

// =============================================================================
// TCP
// =============================================================================

pub struct Tcp<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: &'a [u8],
}

impl<'a> Tcp<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < TCP_HEADER_LEN {
            return None;
        }
        let offset = usize::from(data[12] >> 4) * 4;
        if offset < TCP_HEADER_LEN || offset > data.len() {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: data[13],
            window: u16::from_be_bytes([data[14], data[15]]),
            payload: &data[offset..],
        })
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Sequence space consumed by this segment.
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.has(flags::SYN) {
            len += 1;
        }
        if self.has(flags::FIN) {
            len += 1;
        }
        len
    }
}

/// Fields of an outgoing TCP segment.
pub struct TcpHeader {
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    /// Advertised MSS, sent only on SYN segments.
    pub mss: Option<u16>,
}

pub fn tcp_segment(header: &TcpHeader, payload: &[u8]) -> Vec<u8> {
    let options: &[u8] = match header.mss {
        Some(mss) => &[2, 4, (mss >> 8) as u8, mss as u8],
        None => &[],
    };
    let offset = TCP_HEADER_LEN + options.len();
    let len = offset + payload.len();

    let mut segment = Vec::with_capacity(len);
    segment.extend_from_slice(&header.src_port.to_be_bytes());
    segment.extend_from_slice(&header.dst_port.to_be_bytes());
    segment.extend_from_slice(&header.seq.to_be_bytes());
    segment.extend_from_slice(&header.ack.to_be_bytes());
    segment.push(((offset / 4) as u8) << 4);
    segment.push(header.flags);
    segment.extend_from_slice(&header.window.to_be_bytes());
    segment.extend_from_slice(&[0, 0, 0, 0]);
    segment.extend_from_slice(options);
    segment.extend_from_slice(payload);

    let sum = checksum(&[
        &pseudo_header(header.src, header.dst, PROTO_TCP, len as u16),
        &segment,
    ]);
    segment[16..18].copy_from_slice(&sum.to_be_bytes());
    segment
}

// =============================================================================
// Checksums
// =============================================================================

fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: u16) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0..4].copy_from_slice(&src.octets());
    header[4..8].copy_from_slice(&dst.octets());
    header[9] = protocol;
    header[10..12].copy_from_slice(&len.to_be_bytes());
    header
}

/// Internet checksum over the concatenation of `parts`.
///
/// Every part but the last must have even length.
pub fn checksum(parts: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    for part in parts {
        let mut chunks = part.chunks_exact(2);
        for chunk in &mut chunks {
            sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        if let [last] = chunks.remainder() {
            sum += u32::from(*last) << 8;
        }
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn ipv4(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}
