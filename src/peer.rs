use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

use crate::id::Id;

/// A ring member: its position on the ring and the address its peer server
/// listens on. The id is derived by hashing the address string, so the
/// address is the canonical identity and equality compares addresses only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Peer {
    pub id: Id,
    pub addr: String,
}

impl Peer {
    pub fn new(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        let id = Id::hash(addr.as_bytes());
        Peer { id, addr }
    }

    #[cfg(test)]
    pub fn with_id(id: Id, addr: impl Into<String>) -> Self {
        Peer {
            id,
            addr: addr.into(),
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Peer {}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Valid TCP port, 1 through 65535 inclusive.
pub fn is_port(port: u32) -> bool {
    (1..=65535).contains(&port)
}

/// Compact `host:port` check: host must be a dotted-decimal IPv4 literal,
/// port a decimal number in the valid range. Run before any dial attempt.
pub fn is_address(addr: &str) -> bool {
    let mut parts = addr.trim().splitn(2, ':');
    let (Some(host), Some(port)) = (parts.next(), parts.next()) else {
        return false;
    };
    if host.parse::<Ipv4Addr>().is_err() {
        return false;
    }
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    port.parse::<u32>().map(is_port).unwrap_or(false)
}
