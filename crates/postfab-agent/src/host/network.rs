//! Network interface enumeration, loopback excluded.

use std::collections::BTreeMap;
use std::net::IpAddr;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use tracing::debug;

use postfab_proto::v1::{Addr, NetworkInfo, NetworkInterface};

use super::HostError;

pub fn network_info() -> Result<NetworkInfo, HostError> {
    let mut interfaces: BTreeMap<String, NetworkInterface> = BTreeMap::new();

    for ifaddr in getifaddrs()? {
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        let entry = interfaces
            .entry(ifaddr.interface_name.clone())
            .or_insert_with(|| NetworkInterface {
                device: ifaddr.interface_name.clone(),
                up: ifaddr.flags.contains(InterfaceFlags::IFF_UP),
                addresses: Vec::new(),
            });

        let (Some(address), Some(netmask)) = (ifaddr.address, ifaddr.netmask) else {
            continue;
        };
        let Some((ip, mask)) = ip_and_mask(&address, &netmask) else {
            debug!(
                interface = %ifaddr.interface_name,
                "skipping non-IP address"
            );
            continue;
        };
        entry.addresses.push(Addr {
            cidr: format!("{ip}/{}", prefix_len(mask)),
            address: ip.to_string(),
            mask: mask_string(mask),
        });
    }

    Ok(NetworkInfo {
        network_interfaces: interfaces.into_values().collect(),
    })
}

fn ip_and_mask(
    address: &nix::sys::socket::SockaddrStorage,
    netmask: &nix::sys::socket::SockaddrStorage,
) -> Option<(IpAddr, IpAddr)> {
    if let (Some(addr), Some(mask)) = (address.as_sockaddr_in(), netmask.as_sockaddr_in()) {
        return Some((IpAddr::V4(addr.ip()), IpAddr::V4(mask.ip())));
    }
    if let (Some(addr), Some(mask)) = (address.as_sockaddr_in6(), netmask.as_sockaddr_in6()) {
        return Some((IpAddr::V6(addr.ip()), IpAddr::V6(mask.ip())));
    }
    None
}

fn prefix_len(mask: IpAddr) -> u32 {
    match mask {
        IpAddr::V4(mask) => u32::from(mask).count_ones(),
        IpAddr::V6(mask) => u128::from(mask).count_ones(),
    }
}

/// Netmask in unseparated hex octets (`ffffff00` for /24), the form host
/// tooling conventionally prints masks in.
fn mask_string(mask: IpAddr) -> String {
    let octets = match mask {
        IpAddr::V4(mask) => mask.octets().to_vec(),
        IpAddr::V6(mask) => mask.octets().to_vec(),
    };
    octets.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_length_counts_mask_bits() {
        assert_eq!(prefix_len("255.255.255.0".parse().unwrap()), 24);
        assert_eq!(prefix_len("255.255.0.0".parse().unwrap()), 16);
        assert_eq!(prefix_len("ffff:ffff:ffff:ffff::".parse().unwrap()), 64);
    }

    #[test]
    fn mask_is_hex_octets() {
        assert_eq!(mask_string("255.255.255.0".parse().unwrap()), "ffffff00");
        assert_eq!(mask_string("255.255.0.0".parse().unwrap()), "ffff0000");
        assert_eq!(
            mask_string("ffff:ffff:ffff:ffff::".parse().unwrap()),
            "ffffffffffffffff0000000000000000"
        );
    }

    #[test]
    fn enumeration_excludes_loopback() {
        let info = network_info().unwrap();
        assert!(info
            .network_interfaces
            .iter()
            .all(|i| !i.device.starts_with("lo")));
    }
}
