//! User-space TCP terminator.
//!
//! Each guest TCP connection ends at the gateway and is spliced onto a host
//! socket. [`TcpConn`] is the connection state machine only: it consumes
//! guest segments and host stream events and returns what to send each way.
//! The frame switch owns the host sockets.
//!
//! ```text
//!  egress:   guest SYN ─► Connecting ─(host connect)─► SynReceived ─(ACK)─► Established
//!  forward:  host accept ─► SynSent ─(guest SYN-ACK)─► Established
//! ```
//!
//! The link is lossless, so there are no retransmission timers. Data sent
//! to the guest never exceeds the window it advertised.

use crate::constants::{TCP_MSS, TCP_PENDING_LIMIT, TCP_WINDOW};
use crate::network::wire::{self, PROTO_TCP, Tcp, TcpHeader, flags};
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Identifies a connection from the guest's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Guest's local port.
    pub guest_port: u16,
    /// Remote endpoint as the guest addresses it.
    pub remote: SocketAddrV4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// Guest SYN received, host connect in progress.
    Connecting,
    /// SYN-ACK sent to the guest.
    SynReceived,
    /// SYN sent to the guest for a forwarded connection.
    SynSent,
    Established,
}

/// What a state transition asks the switch to do.
#[derive(Debug, Default)]
pub struct Output {
    /// IPv4 packets for the guest.
    pub packets: Vec<Vec<u8>>,
    /// Bytes for the host socket.
    pub to_host: Vec<u8>,
    /// The guest will send no more data.
    pub shutdown_host: bool,
    /// The handshake just completed.
    pub established: bool,
    /// The connection is finished and can be dropped.
    pub closed: bool,
}

/// One terminated connection.
#[derive(Debug)]
pub struct TcpConn {
    pub id: u64,
    key: FlowKey,
    guest_ip: Ipv4Addr,
    state: TcpState,
    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,
    peer_window: u32,
    pending: VecDeque<u8>,
    host_eof: bool,
    fin_sent: bool,
    guest_fin: bool,
}

impl TcpConn {
    /// Starts an egress connection from a guest SYN.
    pub fn from_syn(id: u64, key: FlowKey, guest_ip: Ipv4Addr, syn: &Tcp<'_>) -> Self {
        let isn = rand::random::<u32>();
        Self {
            id,
            key,
            guest_ip,
            state: TcpState::Connecting,
            snd_una: isn,
            snd_nxt: isn,
            rcv_nxt: syn.seq.wrapping_add(1),
            peer_window: u32::from(syn.window),
            pending: VecDeque::new(),
            host_eof: false,
            fin_sent: false,
            guest_fin: false,
        }
    }

    /// Starts a forwarded connection, returning the SYN for the guest.
    pub fn open(id: u64, key: FlowKey, guest_ip: Ipv4Addr) -> (Self, Vec<u8>) {
        let isn = rand::random::<u32>();
        let mut conn = Self {
            id,
            key,
            guest_ip,
            state: TcpState::SynSent,
            snd_una: isn,
            snd_nxt: isn,
            rcv_nxt: 0,
            peer_window: 0,
            pending: VecDeque::new(),
            host_eof: false,
            fin_sent: false,
            guest_fin: false,
        };
        let syn = conn.packet(flags::SYN, Some(TCP_MSS as u16), &[]);
        conn.snd_nxt = isn.wrapping_add(1);
        (conn, syn)
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    /// The host socket of an egress connection is connected.
    pub fn connected(&mut self) -> Output {
        let mut out = Output::default();
        if self.state != TcpState::Connecting {
            return out;
        }
        out.packets
            .push(self.packet(flags::SYN | flags::ACK, Some(TCP_MSS as u16), &[]));
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.state = TcpState::SynReceived;
        out
    }

    /// Reset sent to the guest when the host side cannot be reached.
    pub fn refuse(&self) -> Vec<u8> {
        self.packet(flags::RST | flags::ACK, None, &[])
    }

    /// Handles a segment from the guest.
    pub fn on_segment(&mut self, seg: &Tcp<'_>) -> Output {
        let mut out = Output::default();

        if seg.has(flags::RST) {
            out.closed = true;
            return out;
        }

        match self.state {
            TcpState::Connecting => return out,
            TcpState::SynSent => {
                if !(seg.has(flags::SYN) && seg.has(flags::ACK)) {
                    return out;
                }
                if seg.ack != self.snd_nxt {
                    out.packets.push(self.packet(flags::RST, None, &[]));
                    out.closed = true;
                    return out;
                }
                self.rcv_nxt = seg.seq.wrapping_add(1);
                self.snd_una = seg.ack;
                self.peer_window = u32::from(seg.window);
                self.state = TcpState::Established;
                out.established = true;
                out.packets.push(self.packet(flags::ACK, None, &[]));
                self.flush(&mut out);
                return out;
            }
            TcpState::SynReceived => {
                if !seg.has(flags::ACK) || seg.ack != self.snd_nxt {
                    return out;
                }
                self.state = TcpState::Established;
                out.established = true;
            }
            TcpState::Established => {}
        }

        if seg.has(flags::ACK) && seq_lt(self.snd_una, seg.ack) && seq_le(seg.ack, self.snd_nxt) {
            self.snd_una = seg.ack;
        }
        self.peer_window = u32::from(seg.window);

        if seg.seq_len() > 0 {
            if seg.seq == self.rcv_nxt {
                out.to_host.extend_from_slice(seg.payload);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(seg.payload.len() as u32);
                if seg.has(flags::FIN) && !self.guest_fin {
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                    self.guest_fin = true;
                    out.shutdown_host = true;
                }
            }
            // In-order data is acknowledged; anything else gets a duplicate ACK.
            out.packets.push(self.packet(flags::ACK, None, &[]));
        }

        self.flush(&mut out);
        if self.guest_fin && self.fin_sent && self.snd_una == self.snd_nxt {
            out.closed = true;
        }
        out
    }

    /// Queues bytes read from the host socket.
    pub fn on_host_data(&mut self, data: &[u8]) -> Output {
        let mut out = Output::default();
        self.pending.extend(data);
        self.flush(&mut out);
        out
    }

    /// The host socket reached end of stream.
    pub fn on_host_eof(&mut self) -> Output {
        let mut out = Output::default();
        self.host_eof = true;
        self.flush(&mut out);
        out
    }

    /// Bytes queued for the guest but not yet sent.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether more host data may be queued. False once the backlog
    /// reaches [`TCP_PENDING_LIMIT`], until the guest acknowledges enough
    /// of it.
    pub fn wants_host_data(&self) -> bool {
        self.pending.len() < TCP_PENDING_LIMIT
    }

    fn flush(&mut self, out: &mut Output) {
        if self.state != TcpState::Established || self.fin_sent {
            return;
        }

        loop {
            let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
            let room = self.peer_window.saturating_sub(in_flight) as usize;
            let len = self.pending.len().min(room).min(TCP_MSS);
            if len == 0 {
                break;
            }
            let chunk: Vec<u8> = self.pending.drain(..len).collect();
            out.packets
                .push(self.packet(flags::ACK | flags::PSH, None, &chunk));
            self.snd_nxt = self.snd_nxt.wrapping_add(len as u32);
        }

        if self.host_eof && self.pending.is_empty() {
            out.packets.push(self.packet(flags::FIN | flags::ACK, None, &[]));
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.fin_sent = true;
        }
    }

    fn packet(&self, flags: u8, mss: Option<u16>, payload: &[u8]) -> Vec<u8> {
        let src = *self.key.remote.ip();
        let segment = wire::tcp_segment(
            &TcpHeader {
                src,
                src_port: self.key.remote.port(),
                dst: self.guest_ip,
                dst_port: self.key.guest_port,
                seq: self.snd_nxt,
                ack: if flags & flags::ACK != 0 { self.rcv_nxt } else { 0 },
                flags,
                window: TCP_WINDOW,
                mss,
            },
            payload,
        );
        wire::ipv4_packet(src, self.guest_ip, PROTO_TCP, &segment)
    }
}

/// Reset for a guest segment that matches no connection.
pub fn reset_for(guest_ip: Ipv4Addr, key: FlowKey, seg: &Tcp<'_>) -> Option<Vec<u8>> {
    if seg.has(flags::RST) {
        return None;
    }
    let (seq, ack, flags) = if seg.has(flags::ACK) {
        (seg.ack, 0, flags::RST)
    } else {
        (0, seg.seq.wrapping_add(seg.seq_len()), flags::RST | flags::ACK)
    };
    let src = *key.remote.ip();
    let segment = wire::tcp_segment(
        &TcpHeader {
            src,
            src_port: key.remote.port(),
            dst: guest_ip,
            dst_port: key.guest_port,
            seq,
            ack,
            flags,
            window: 0,
            mss: None,
        },
        &[],
    );
    Some(wire::ipv4_packet(src, guest_ip, PROTO_TCP, &segment))
}

fn seq_lt(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

fn seq_le(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) >= 0
}
