//! Network interface resolution: turns an interface name into its current
//! IPv4 address, polling until both the HL2-side and Wi-Fi-side interfaces
//! are up. Mirrors the reference implementation's `search_interfaces` loop.

use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use pnet::ipnetwork::IpNetwork;

const POLL_INTERVAL: Duration = Duration::from_secs(4);

/// Resolves `name` to its current IPv4 address, or `None` if the interface
/// doesn't currently exist or carries no IPv4 address.
pub fn resolve_ipv4(name: &str) -> Option<Ipv4Addr> {
    pnet::datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .and_then(|iface| {
            iface.ips.iter().find_map(|ip| match ip {
                IpNetwork::V4(v4) => Some(v4.ip()),
                _ => None,
            })
        })
}

/// Resolved addresses for both sides of the relay.
pub struct Interfaces {
    pub hl2_addr: Ipv4Addr,
    pub wifi_addr: Ipv4Addr,
}

/// Busy-waits, polling every 4 seconds, until both interfaces report an
/// IPv4 address. Absence is not an error: it is the ordinary state of a
/// system that hasn't finished bringing its network up yet.
pub fn wait_for_interfaces(hl2_name: &str, wifi_name: &str) -> Interfaces {
    loop {
        let hl2_addr = resolve_ipv4(hl2_name);
        let wifi_addr = resolve_ipv4(wifi_name);
        match (hl2_addr, wifi_addr) {
            (Some(hl2_addr), Some(wifi_addr)) => {
                log::info!(
                    "resolved interfaces: {hl2_name}={hl2_addr}, {wifi_name}={wifi_addr}"
                );
                return Interfaces { hl2_addr, wifi_addr };
            }
            _ => {
                log::warn!(
                    "waiting for interfaces ({hl2_name}: {}, {wifi_name}: {})",
                    present(hl2_addr),
                    present(wifi_addr)
                );
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn present(addr: Option<Ipv4Addr>) -> &'static str {
    if addr.is_some() {
        "up"
    } else {
        "down"
    }
}
