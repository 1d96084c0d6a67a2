//! Address translation between the guest's view and the host's.
//!
//! Outbound, the guest addresses real hosts directly; only the gateway's own
//! address is rewritten: its DNS port goes to the upstream resolver and every
//! other port to the host's loopback interface. Inbound, each forward maps a
//! host listener to a guest port.

use crate::constants::DNS_PORT;
use crate::network::config::{Forward, NetworkConfig};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Translation rules of one virtual network.
#[derive(Debug, Clone)]
pub struct NatTable {
    gateway: Ipv4Addr,
    dns_upstream: SocketAddr,
    inbound: HashMap<SocketAddr, SocketAddrV4>,
}

impl NatTable {
    pub fn new(config: &NetworkConfig) -> Self {
        let inbound = config
            .forwards()
            .iter()
            .map(|f: &Forward| (f.host, config.forward_target(f)))
            .collect();
        Self {
            gateway: config.gateway(),
            dns_upstream: config.dns_upstream(),
            inbound,
        }
    }

    /// Host address a guest packet for `dst` is sent to.
    pub fn outbound(&self, dst: SocketAddrV4) -> SocketAddr {
        if *dst.ip() != self.gateway {
            return SocketAddr::V4(dst);
        }
        if dst.port() == DNS_PORT {
            self.dns_upstream
        } else {
            SocketAddr::from((Ipv4Addr::LOCALHOST, dst.port()))
        }
    }

    /// Guest endpoint of the forward listening on `host`.
    pub fn inbound(&self, host: SocketAddr) -> Option<SocketAddrV4> {
        self.inbound.get(&host).copied()
    }
}
