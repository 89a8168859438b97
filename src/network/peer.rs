//! Peer Identity
//!
//! A participant is identified by its network address plus its TCP listen
//! port. The ordering is byte-wise on the address, then by port, so every
//! node that sees the same set of peers picks the same minimum.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::net::{IpAddr, SocketAddr};

/// Identity of a peer: externally visible address and listen port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId {
    pub address: IpAddr,
    pub port: u16,
}

impl PeerId {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    /// Socket address to connect to this peer's listener.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<SocketAddr> for PeerId {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

fn address_octets(address: &IpAddr) -> Vec<u8> {
    match address {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lexicographic slice order: common prefix first, then shorter address wins.
        address_octets(&self.address)
            .cmp(&address_octets(&other.address))
            .then(self.port.cmp(&other.port))
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
