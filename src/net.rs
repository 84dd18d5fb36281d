use crate::config::parse_mac;
use crate::ptp::PTP_MULTICAST_ADDR;
use anyhow::{anyhow, Context, Result};
use if_addrs::IfAddr;
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtpInterface {
    pub name: String,
    pub addr: Ipv4Addr,
}

fn is_likely_wireless(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.starts_with("wl") || lower.contains("wifi") || lower.contains("wireless")
}

/// Choose the interface PTP multicast joins on: `wanted` by name, else
/// the first wired IPv4 interface, else any non-loopback IPv4 one.
pub fn select_interface(wanted: Option<&str>) -> Result<PtpInterface> {
    let candidates: Vec<PtpInterface> = if_addrs::get_if_addrs()
        .context("listing network interfaces")?
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) => Some(PtpInterface {
                name: iface.name,
                addr: v4.ip,
            }),
            _ => None,
        })
        .collect();

    if let Some(name) = wanted {
        return candidates
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| anyhow!("Interface {} has no IPv4 address", name));
    }

    let best = candidates
        .iter()
        .find(|c| !is_likely_wireless(&c.name))
        .or_else(|| candidates.first())
        .cloned()
        .ok_or_else(|| anyhow!("No suitable IPv4 interface found"))?;
    debug!("[PTP] Selected interface {} ({})", best.name, best.addr);
    Ok(best)
}

/// MAC for the clock identity: configured value, then sysfs, then a
/// locally administered address derived from the interface IPv4.
pub fn interface_mac(iface: &PtpInterface, configured: Option<&str>) -> Result<[u8; 6]> {
    if let Some(text) = configured {
        return parse_mac(text);
    }
    let path = format!("/sys/class/net/{}/address", iface.name);
    match std::fs::read_to_string(&path) {
        Ok(text) => match parse_mac(text.trim()) {
            Ok(mac) if mac != [0; 6] => return Ok(mac),
            _ => warn!("[PTP] Unusable MAC in {}", path),
        },
        Err(e) => debug!("[PTP] {}: {}", path, e),
    }
    let o = iface.addr.octets();
    let mac = [0x02, 0x00, o[0], o[1], o[2], o[3]];
    info!("[PTP] Using locally administered MAC derived from {}", iface.addr);
    Ok(mac)
}

pub fn create_multicast_socket(port: u16, interface_ip: Ipv4Addr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&addr.into())
        .with_context(|| format!("binding UDP port {} (hint: PTP ports require root)", port))?;

    let multi_addr: Ipv4Addr = PTP_MULTICAST_ADDR.parse()?;
    socket.join_multicast_v4(&multi_addr, &interface_ip)?;
    socket.set_multicast_if_v4(&interface_ip)?;
    // Our own Sync must not come back as a request
    socket.set_multicast_loop_v4(false)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}
