//! # Virtual Network
//!
//! User-space network for a single sandbox. The sandbox's NIC is a QEMU
//! style socket link; the host side of that link is a gateway that speaks
//! just enough of the stack to give the guest outbound connectivity and
//! inbound port forwards.
//!
//! ## Topology
//!
//! ```text
//!   guest 192.168.127.2  ──link──  gateway 192.168.127.1 ── host sockets
//!   5a:94:ef:e4:0c:ee              5a:94:ef:e4:0c:dd
//! ```
//!
//! ## Services
//!
//! | Service          | Behavior                                              |
//! |------------------|-------------------------------------------------------|
//! | ARP              | answers for the gateway address                       |
//! | DHCP             | one static lease for the guest                        |
//! | ICMP             | echo replies from the gateway                         |
//! | UDP              | NAT through host sockets; gateway:53 to the resolver  |
//! | TCP              | terminated at the gateway and spliced to host sockets |
//! | forwards         | host listener to guest port                           |
//!
//! ## Bring-up
//!
//! 1. [`VirtualNetwork::new`] takes a validated [`NetworkConfig`] and binds
//!    the forward listeners.
//! 2. [`bind_listener`] picks a free loopback port for the link. The
//!    listener is handed to the sandbox, which accepts on it.
//! 3. The host dials the port and passes the connection to
//!    [`VirtualNetwork::accept_qemu`].

pub mod config;
pub mod dhcp;
pub mod nat;
pub mod port;
pub mod stack;
pub mod tcp;
pub mod wire;

pub use config::{Forward, NetworkConfig, NetworkConfigBuilder};
pub use port::bind_listener;
pub use stack::VirtualNetwork;
pub use wire::MacAddr;
