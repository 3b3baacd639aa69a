use anyhow::{anyhow, Result};
use if_addrs::{get_if_addrs, IfAddr};
use local_ip_address::local_ip;
use log::{debug, warn};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    Ethernet,
    Wifi,
    Virtual,
    Loopback,
    Other,
}

impl InterfaceKind {
    /// Detect the kind of an interface from its name and address
    fn detect(name: &str, ip: &IpAddr) -> Self {
        let name = name.to_lowercase();
        if ip.is_loopback() || name == "lo" || name.starts_with("lo0") {
            Self::Loopback
        } else if ["docker", "veth", "br-", "virbr", "tun", "tap", "utun", "vmnet"]
            .iter()
            .any(|prefix| name.starts_with(prefix))
        {
            Self::Virtual
        } else if name.starts_with("wl") || name.contains("wifi") || name.contains("wi-fi") {
            Self::Wifi
        } else if name.starts_with("en") || name.starts_with("eth") {
            Self::Ethernet
        } else {
            Self::Other
        }
    }

    /// Higher number = better candidate for LAN peers to reach us
    fn priority(&self) -> u8 {
        match self {
            Self::Ethernet => 80,
            Self::Wifi => 60,
            Self::Other => 30,
            Self::Virtual => 5,
            Self::Loopback => 1,
        }
    }
}

/// An address peers on the local network might reach the relay on
#[derive(Debug, Clone)]
pub struct LanAddress {
    pub interface: String,
    pub ip: IpAddr,
    pub kind: InterfaceKind,
}

impl LanAddress {
    fn new(interface: String, ip: IpAddr) -> Self {
        let kind = InterfaceKind::detect(&interface, &ip);
        Self { interface, ip, kind }
    }

    fn rank(&self) -> (u8, bool) {
        // IPv4 first within the same interface class; browsers handle it best
        (self.kind.priority(), self.ip.is_ipv4())
    }
}

/// Every usable interface address, best candidate first
pub fn lan_addresses() -> Result<Vec<LanAddress>> {
    let interfaces =
        get_if_addrs().map_err(|e| anyhow!("Failed to get network interfaces: {}", e))?;

    let mut addresses: Vec<LanAddress> = interfaces
        .into_iter()
        .filter_map(|iface| {
            let ip = match iface.addr {
                IfAddr::V4(addr) => IpAddr::V4(addr.ip),
                IfAddr::V6(addr) => IpAddr::V6(addr.ip),
            };
            if ip.is_unspecified() || ip.is_multicast() {
                return None;
            }
            Some(LanAddress::new(iface.name, ip))
        })
        .collect();

    rank_addresses(&mut addresses);
    for addr in &addresses {
        debug!("Interface {} ({:?}): {}", addr.interface, addr.kind, addr.ip);
    }

    Ok(addresses)
}

fn rank_addresses(addresses: &mut [LanAddress]) {
    addresses.sort_by(|a, b| b.rank().cmp(&a.rank()));
}

/// The address to advertise to browsers on the LAN
pub fn best_lan_address() -> Result<IpAddr> {
    match lan_addresses() {
        Ok(addresses) => {
            if let Some(best) = addresses
                .iter()
                .find(|a| a.kind != InterfaceKind::Loopback)
            {
                return Ok(best.ip);
            }
            warn!("No non-loopback interface found, asking the routing table");
        }
        Err(e) => warn!("{}", e),
    }

    local_ip().map_err(|e| anyhow!("Failed to determine local IP: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_kind_detection() {
        let lan = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(InterfaceKind::detect("eth0", &lan), InterfaceKind::Ethernet);
        assert_eq!(InterfaceKind::detect("en0", &lan), InterfaceKind::Ethernet);
        assert_eq!(InterfaceKind::detect("wlan0", &lan), InterfaceKind::Wifi);
        assert_eq!(InterfaceKind::detect("docker0", &lan), InterfaceKind::Virtual);
        assert_eq!(
            InterfaceKind::detect("lo", &IpAddr::V4(Ipv4Addr::LOCALHOST)),
            InterfaceKind::Loopback
        );
    }

    #[test]
    fn test_ranking_prefers_physical_ipv4() {
        let mut addresses = vec![
            LanAddress::new("lo".into(), IpAddr::V4(Ipv4Addr::LOCALHOST)),
            LanAddress::new("docker0".into(), IpAddr::V4(Ipv4Addr::new(172, 17, 0, 1))),
            LanAddress::new(
                "eth0".into(),
                IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
            ),
            LanAddress::new("wlan0".into(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))),
            LanAddress::new("eth0".into(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))),
        ];
        rank_addresses(&mut addresses);

        let order: Vec<String> = addresses.iter().map(|a| a.ip.to_string()).collect();
        assert_eq!(order[0], "192.168.1.20");
        assert_eq!(order[1], "fe80::1");
        assert_eq!(order[2], "10.0.0.7");
        assert_eq!(order.last().unwrap(), "127.0.0.1");
    }
}
