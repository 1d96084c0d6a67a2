//! Virtual network configuration.
//!
//! Every option is parsed when it is set; [`NetworkConfigBuilder::build`]
//! reports the first invalid option and checks that the options agree with
//! each other (guest inside the subnet, distinct from the gateway, and so on).
//!
//! ```rust,ignore
//! let net = NetworkConfig::builder()
//!     .subnet("10.0.2.0/24")
//!     .guest_address("10.0.2.15")
//!     .forward("8080", "80")
//!     .build()?;
//! ```

use crate::constants::{
    DEFAULT_DNS_UPSTREAM, DEFAULT_GUEST_IP, DEFAULT_GUEST_MAC, DEFAULT_PORT_RANGE, DEFAULT_SUBNET,
    GATEWAY_MAC,
};
use crate::error::{Error, Result};
use crate::network::wire::MacAddr;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// A host port forwarded into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Forward {
    /// Host address the forward listens on.
    pub host: SocketAddr,
    /// Guest port connections are delivered to.
    pub guest_port: u16,
}

/// Validated virtual network configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    network: Ipv4Addr,
    prefix_len: u8,
    guest: Ipv4Addr,
    guest_mac: MacAddr,
    gateway_mac: MacAddr,
    forwards: Vec<Forward>,
    port_range: (u16, u16),
    dns_upstream: SocketAddr,
}

impl NetworkConfig {
    pub fn builder() -> NetworkConfigBuilder {
        NetworkConfigBuilder::default()
    }

    /// Network address of the subnet.
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask(self.prefix_len))
    }

    /// Highest address of the subnet.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask(self.prefix_len))
    }

    /// The gateway is the first host address of the subnet.
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    pub fn gateway_mac(&self) -> MacAddr {
        self.gateway_mac
    }

    pub fn guest_address(&self) -> Ipv4Addr {
        self.guest
    }

    pub fn guest_mac(&self) -> MacAddr {
        self.guest_mac
    }

    pub fn forwards(&self) -> &[Forward] {
        &self.forwards
    }

    /// Inclusive range searched for the sandbox's link listener.
    pub fn port_range(&self) -> (u16, u16) {
        self.port_range
    }

    pub fn dns_upstream(&self) -> SocketAddr {
        self.dns_upstream
    }

    /// Returns true if `ip` lies inside the subnet.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & mask(self.prefix_len) == u32::from(self.network)
    }

    /// Guest endpoint a forward delivers to.
    pub fn forward_target(&self, forward: &Forward) -> SocketAddrV4 {
        SocketAddrV4::new(self.guest, forward.guest_port)
    }
}

fn mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        n => u32::MAX << (32 - u32::from(n)),
    }
}

/// Builder for [`NetworkConfig`].
#[derive(Debug, Clone)]
pub struct NetworkConfigBuilder {
    subnet: String,
    guest: String,
    guest_mac: String,
    forwards: Vec<(String, String)>,
    port_range: (u16, u16),
    dns_upstream: String,
}

impl Default for NetworkConfigBuilder {
    fn default() -> Self {
        Self {
            subnet: DEFAULT_SUBNET.to_string(),
            guest: DEFAULT_GUEST_IP.to_string(),
            guest_mac: DEFAULT_GUEST_MAC.to_string(),
            forwards: Vec::new(),
            port_range: DEFAULT_PORT_RANGE,
            dns_upstream: DEFAULT_DNS_UPSTREAM.to_string(),
        }
    }
}

impl NetworkConfigBuilder {
    /// IPv4 subnet in CIDR notation.
    pub fn subnet(mut self, cidr: impl Into<String>) -> Self {
        self.subnet = cidr.into();
        self
    }

    pub fn guest_address(mut self, ip: impl Into<String>) -> Self {
        self.guest = ip.into();
        self
    }

    pub fn guest_mac(mut self, mac: impl Into<String>) -> Self {
        self.guest_mac = mac.into();
        self
    }

    /// Forwards `host` (a port, or `ip:port`) to `guest` (a port).
    pub fn forward(mut self, host: impl Into<String>, guest: impl Into<String>) -> Self {
        self.forwards.push((host.into(), guest.into()));
        self
    }

    /// Range searched for a free link listener port.
    pub fn port_range(mut self, low: u16, high: u16) -> Self {
        self.port_range = (low, high);
        self
    }

    /// Resolver that DNS queries to the gateway are relayed to.
    pub fn dns_upstream(mut self, addr: impl Into<String>) -> Self {
        self.dns_upstream = addr.into();
        self
    }

    pub fn build(self) -> Result<NetworkConfig> {
        let (network, prefix_len) = parse_cidr(&self.subnet)?;
        if prefix_len > 30 {
            return Err(invalid(format!(
                "subnet {} leaves no room for a gateway and a guest",
                self.subnet
            )));
        }

        let guest: Ipv4Addr = self
            .guest
            .parse()
            .map_err(|_| invalid(format!("container address '{}' is not IPv4", self.guest)))?;
        let guest_mac: MacAddr = self.guest_mac.parse().map_err(invalid)?;
        let gateway_mac: MacAddr = GATEWAY_MAC.parse().map_err(invalid)?;
        if guest_mac.is_broadcast() || guest_mac.0[0] & 1 == 1 {
            return Err(invalid(format!("{} is a multicast address", guest_mac)));
        }
        if guest_mac == gateway_mac {
            return Err(invalid(format!("{} is the gateway's address", guest_mac)));
        }

        let (low, high) = self.port_range;
        if low == 0 || low > high {
            return Err(invalid(format!("bad port range {}-{}", low, high)));
        }

        let dns_upstream: SocketAddr = self.dns_upstream.parse().map_err(|_| {
            invalid(format!("DNS upstream '{}' is not ip:port", self.dns_upstream))
        })?;

        let forwards = self
            .forwards
            .iter()
            .map(|(host, guest)| parse_forward(host, guest))
            .collect::<Result<Vec<_>>>()?;
        for (i, forward) in forwards.iter().enumerate() {
            if forwards[..i].iter().any(|f| f.host == forward.host) {
                return Err(invalid(format!("host {} forwarded twice", forward.host)));
            }
        }

        let config = NetworkConfig {
            network,
            prefix_len,
            guest,
            guest_mac,
            gateway_mac,
            forwards,
            port_range: self.port_range,
            dns_upstream,
        };

        if !config.contains(guest) {
            return Err(invalid(format!(
                "container address {} is outside {}",
                guest, self.subnet
            )));
        }
        if guest == config.network() || guest == config.broadcast() || guest == config.gateway() {
            return Err(invalid(format!(
                "container address {} is reserved in {}",
                guest, self.subnet
            )));
        }
        Ok(config)
    }
}

fn invalid(reason: impl ToString) -> Error {
    Error::InvalidNetworkConfig(reason.to_string())
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (ip, len) = cidr
        .split_once('/')
        .ok_or_else(|| invalid(format!("'{}' is not in CIDR notation", cidr)))?;
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| invalid(format!("container network '{}' is not IPv4", cidr)))?;
    let len: u8 = len
        .parse()
        .ok()
        .filter(|l| *l <= 32)
        .ok_or_else(|| invalid(format!("bad prefix length in '{}'", cidr)))?;
    Ok((Ipv4Addr::from(u32::from(ip) & mask(len)), len))
}

fn parse_forward(host: &str, guest: &str) -> Result<Forward> {
    let host = match host.parse::<u16>() {
        Ok(port) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        Err(_) => host
            .parse::<SocketAddr>()
            .map_err(|_| invalid(format!("forward host '{}' is not a port or ip:port", host)))?,
    };
    let guest_port = guest
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| invalid("guest must be a valid port number"))?;
    Ok(Forward { host, guest_port })
}
