//! Static DHCP server.
//!
//! The gateway leases exactly one address: the configured guest address, to
//! the configured guest hardware address.
//!
//! | Client message               | Reply  |
//! |------------------------------|--------|
//! | DISCOVER                     | OFFER  |
//! | REQUEST for the lease        | ACK    |
//! | REQUEST for anything else    | NAK    |
//! | from another hardware address| none   |
//! | RELEASE, DECLINE, INFORM     | none   |

use crate::constants::{DHCP_LEASE_SECS, NETWORK_MTU};
use crate::network::config::NetworkConfig;
use crate::network::wire::MacAddr;
use std::net::Ipv4Addr;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const FIXED_LEN: usize = 236;
const BROADCAST_FLAG: u16 = 0x8000;

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_MTU: u8 = 26;
const OPT_BROADCAST: u8 = 28;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl MessageType {
    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }

    fn code(self) -> u8 {
        match self {
            Self::Discover => 1,
            Self::Offer => 2,
            Self::Request => 3,
            Self::Decline => 4,
            Self::Ack => 5,
            Self::Nak => 6,
            Self::Release => 7,
            Self::Inform => 8,
        }
    }
}

/// The parts of a client message the server looks at.
#[derive(Debug)]
pub struct Message {
    pub message_type: MessageType,
    pub xid: u32,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub chaddr: MacAddr,
    pub requested_ip: Option<Ipv4Addr>,
}

impl Message {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < FIXED_LEN + MAGIC_COOKIE.len() || data[0] != 1 {
            return None;
        }
        if data[1] != 1 || data[2] != 6 || data[FIXED_LEN..FIXED_LEN + 4] != MAGIC_COOKIE {
            return None;
        }

        let mut message_type = None;
        let mut requested_ip = None;
        let mut options = &data[FIXED_LEN + 4..];
        while let [code, rest @ ..] = options {
            match *code {
                OPT_PAD => {
                    options = rest;
                    continue;
                }
                OPT_END => break,
                _ => {}
            }
            let [len, rest @ ..] = rest else { break };
            let len = usize::from(*len);
            if rest.len() < len {
                break;
            }
            let value = &rest[..len];
            match *code {
                OPT_MESSAGE_TYPE if len == 1 => message_type = MessageType::from_code(value[0]),
                OPT_REQUESTED_IP if len == 4 => {
                    requested_ip = Some(Ipv4Addr::new(value[0], value[1], value[2], value[3]))
                }
                _ => {}
            }
            options = &rest[len..];
        }

        Some(Self {
            message_type: message_type?,
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            chaddr: MacAddr(data[28..34].try_into().ok()?),
            requested_ip,
        })
    }

    /// Whether the client asked for replies to be broadcast.
    pub fn wants_broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }
}

/// Computes the server's reply to a client message, if any.
pub fn reply(config: &NetworkConfig, request: &Message) -> Option<(MessageType, Vec<u8>)> {
    if request.chaddr != config.guest_mac() {
        return None;
    }

    let lease = config.guest_address();
    let kind = match request.message_type {
        MessageType::Discover => MessageType::Offer,
        MessageType::Request => {
            let asked = request.requested_ip.unwrap_or(request.ciaddr);
            if asked == lease {
                MessageType::Ack
            } else {
                MessageType::Nak
            }
        }
        _ => return None,
    };
    Some((kind, encode(config, request, kind)))
}

fn encode(config: &NetworkConfig, request: &Message, kind: MessageType) -> Vec<u8> {
    let mut out = vec![0u8; FIXED_LEN];
    out[0] = 2; // BOOTREPLY
    out[1] = 1;
    out[2] = 6;
    out[4..8].copy_from_slice(&request.xid.to_be_bytes());
    out[10..12].copy_from_slice(&request.flags.to_be_bytes());
    if kind != MessageType::Nak {
        out[16..20].copy_from_slice(&config.guest_address().octets());
    }
    out[20..24].copy_from_slice(&config.gateway().octets());
    out[28..34].copy_from_slice(&request.chaddr.0);
    out.extend_from_slice(&MAGIC_COOKIE);

    let mut option = |code: u8, value: &[u8]| {
        out.push(code);
        out.push(value.len() as u8);
        out.extend_from_slice(value);
    };
    option(OPT_MESSAGE_TYPE, &[kind.code()]);
    option(OPT_SERVER_ID, &config.gateway().octets());
    if kind != MessageType::Nak {
        option(OPT_LEASE_TIME, &DHCP_LEASE_SECS.to_be_bytes());
        option(OPT_SUBNET_MASK, &config.netmask().octets());
        option(OPT_ROUTER, &config.gateway().octets());
        option(OPT_DNS, &config.gateway().octets());
        option(OPT_BROADCAST, &config.broadcast().octets());
        option(OPT_MTU, &NETWORK_MTU.to_be_bytes());
    }
    out.push(OPT_END);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_message(kind: u8, mac: MacAddr, requested: Option<Ipv4Addr>) -> Vec<u8> {
        let mut data = vec![0u8; FIXED_LEN];
        data[0] = 1;
        data[1] = 1;
        data[2] = 6;
        data[4..8].copy_from_slice(&0xdead_beefu32.to_be_bytes());
        data[28..34].copy_from_slice(&mac.0);
        data.extend_from_slice(&MAGIC_COOKIE);
        data.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, kind]);
        if let Some(ip) = requested {
            data.extend_from_slice(&[OPT_REQUESTED_IP, 4]);
            data.extend_from_slice(&ip.octets());
        }
        data.push(OPT_END);
        data
    }

    fn config() -> NetworkConfig {
        NetworkConfig::builder().build().unwrap()
    }

    #[test]
    fn test_discover_gets_offer_of_lease() {
        let config = config();
        let request =
            Message::parse(&client_message(1, config.guest_mac(), None)).unwrap();
        let (kind, data) = reply(&config, &request).unwrap();
        assert_eq!(kind, MessageType::Offer);
        assert_eq!(&data[16..20], &config.guest_address().octets());
        assert_eq!(&data[4..8], &0xdead_beefu32.to_be_bytes());
    }

    #[test]
    fn test_request_for_lease_is_acked() {
        let config = config();
        let msg = client_message(3, config.guest_mac(), Some(config.guest_address()));
        let (kind, _) = reply(&config, &Message::parse(&msg).unwrap()).unwrap();
        assert_eq!(kind, MessageType::Ack);
    }

    #[test]
    fn test_request_for_other_address_is_nakked() {
        let config = config();
        let msg = client_message(3, config.guest_mac(), Some(Ipv4Addr::new(192, 168, 127, 9)));
        let (kind, data) = reply(&config, &Message::parse(&msg).unwrap()).unwrap();
        assert_eq!(kind, MessageType::Nak);
        assert_eq!(&data[16..20], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_foreign_hardware_address_ignored() {
        let config = config();
        let other = MacAddr([0x02, 0, 0, 0, 0, 1]);
        let msg = client_message(1, other, None);
        assert!(reply(&config, &Message::parse(&msg).unwrap()).is_none());
    }

    #[test]
    fn test_release_ignored() {
        let config = config();
        let msg = client_message(7, config.guest_mac(), None);
        assert!(reply(&config, &Message::parse(&msg).unwrap()).is_none());
    }
}
