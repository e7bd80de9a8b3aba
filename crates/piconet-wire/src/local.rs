//! This host's own addresses, used to drop our own broadcasts.

use std::collections::HashSet;
use std::net::IpAddr;
use tracing::{debug, warn};

/// The set of addresses that belong to this host. Read-only after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalAddressSet {
    addresses: HashSet<IpAddr>,
}

impl LocalAddressSet {
    /// An empty set (nothing is treated as local).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Enumerate the addresses of every network interface.
    ///
    /// IPv4 addresses are always included, IPv6 only when `ipv6` is set.
    /// Loopback is included. Enumeration failure yields an empty set.
    pub fn detect(ipv6: bool) -> Self {
        let interfaces = match local_ip_address::list_afinet_netifas() {
            Ok(ifs) => ifs,
            Err(e) => {
                warn!(error = %e, "Failed to list network interfaces, self-filter disabled");
                return Self::empty();
            }
        };

        let set: Self = interfaces
            .into_iter()
            .map(|(_name, ip)| ip)
            .filter(|ip| ip.is_ipv4() || ipv6)
            .collect();
        debug!(count = set.len(), "Detected local addresses");
        set
    }

    /// Whether `ip` belongs to this host.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.addresses.contains(&ip.to_canonical())
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpAddr> {
        self.addresses.iter()
    }
}

impl FromIterator<IpAddr> for LocalAddressSet {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        Self {
            addresses: iter.into_iter().map(|ip| ip.to_canonical()).collect(),
        }
    }
}
