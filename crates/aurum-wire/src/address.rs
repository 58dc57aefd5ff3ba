//! Network addresses, service flags, and address grouping.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::time::SystemTime;

/// Bitfield of services advertised by a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ServiceFlags(pub u64);

impl ServiceFlags {
    /// No services.
    pub const NONE: ServiceFlags = ServiceFlags(0);

    /// Full node: the peer can serve the complete block chain.
    pub const NETWORK: ServiceFlags = ServiceFlags(1);

    /// Committed filter server: the peer can serve GCS committed filters.
    pub const CF: ServiceFlags = ServiceFlags(1 << 1);

    /// Whether all of the desired flags are set.
    pub fn has(self, desired: ServiceFlags) -> bool {
        self.0 & desired.0 == desired.0
    }

    /// The subset of `desired` flags that are not set on `self`.
    pub fn missing(self, desired: ServiceFlags) -> ServiceFlags {
        ServiceFlags(desired.0 & !self.0)
    }

    /// Clear the given flags.
    pub fn without(self, flags: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 & !flags.0)
    }
}

impl BitOr for ServiceFlags {
    type Output = ServiceFlags;
    fn bitor(self, rhs: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ServiceFlags {
    fn bitor_assign(&mut self, rhs: ServiceFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ServiceFlags {
    type Output = ServiceFlags;
    fn bitand(self, rhs: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 & rhs.0)
    }
}

impl fmt::Display for ServiceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for ServiceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceFlags({:#x})", self.0)
    }
}

/// Address family of a network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

/// A peer network address together with the services it advertises and the
/// time it was last known to be alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddress {
    pub ip: IpAddr,
    pub port: u16,
    pub services: ServiceFlags,
    pub timestamp: SystemTime,
}

impl NetAddress {
    /// Create an address stamped with the current time.
    pub fn new(ip: IpAddr, port: u16, services: ServiceFlags) -> Self {
        Self {
            ip,
            port,
            services,
            timestamp: SystemTime::now(),
        }
    }

    /// Canonical `host:port` key for this address, suitable for map keys and
    /// duplicate suppression.
    pub fn key(&self) -> String {
        match self.ip {
            IpAddr::V4(ip) => format!("{}:{}", ip, self.port),
            IpAddr::V6(ip) => format!("[{}]:{}", ip, self.port),
        }
    }

    /// Address family.
    pub fn family(&self) -> AddressFamily {
        match self.ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// Coarse network-topology key used to diversify outbound connections.
    ///
    /// IPv4 addresses group by /16 and IPv6 addresses by /32. Loopback
    /// addresses all share the `local` group.
    pub fn group_key(&self) -> String {
        match self.ip {
            _ if self.ip.is_loopback() => "local".to_string(),
            IpAddr::V4(ip) => {
                let o = ip.octets();
                format!("{}.{}.0.0/16", o[0], o[1])
            }
            IpAddr::V6(ip) => {
                let s = ip.segments();
                format!("{:x}:{:x}::/32", s[0], s[1])
            }
        }
    }
}

/// Split a `host:port` string into its host and port parts.
///
/// IPv6 hosts are expected in bracketed form, e.g. `[::1]:9108`.
pub fn split_host_port(addr: &str) -> Option<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        return Some((host.to_string(), port.parse().ok()?));
    }
    let (host, port) = addr.rsplit_once(':')?;
    if host.contains(':') {
        // Unbracketed IPv6 with no port separator.
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

/// An IP subnet in CIDR notation, used for whitelist matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSubnet {
    network: IpAddr,
    prefix: u8,
}

impl IpSubnet {
    /// Parse `a.b.c.d/len` or `addr/len` notation. A bare address is treated
    /// as a host subnet (/32 or /128).
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr.parse().ok()?;
                let prefix: u8 = len.parse().ok()?;
                (addr, prefix)
            }
            None => {
                let addr: IpAddr = s.parse().ok()?;
                let prefix = match addr {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                (addr, prefix)
            }
        };
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return None;
        }
        Some(Self {
            network: addr,
            prefix,
        })
    }

    /// Whether the subnet contains the given IP.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_v4(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_v6(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn prefix_mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

/// Convenience constructors used throughout the server and its tests.
impl NetAddress {
    /// IPv4 address with the given octets and port, no services.
    pub fn from_v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port, ServiceFlags::NONE)
    }

    /// IPv6 loopback with the given port, no services.
    pub fn v6_loopback(port: u16) -> Self {
        Self::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port, ServiceFlags::NONE)
    }
}
