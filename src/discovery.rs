//! LAN discovery of cards.
//!
//! A fixed ASCII probe goes out on UDP to the broadcast address of every
//! non-loopback interface and to the discovery multicast group. Cards answer
//! with newline separated `key=value` records.

use crate::{PslError, PslResult};
use log::{debug, warn};
use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    time::{Duration, Instant},
};

pub const DISCOVERY_PORT: u16 = 8755;
pub const DISCOVERY_PROBE: &[u8] = b"SiToro discovery v1 ";
pub const DISCOVERY_MULTICAST: Ipv4Addr = Ipv4Addr::new(236, 97, 11, 116);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub address: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredCard {
    pub address: Option<IpAddr>,
    pub num_channels: Option<u32>,
    pub product_name: String,
    pub product_id: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub host_name: String,
}

impl DiscoveredCard {
    /// Parses one discovery reply. Unknown keys are ignored.
    pub fn parse(reply: &str, from: Option<IpAddr>) -> Self {
        let mut card = DiscoveredCard {
            address: from,
            ..Default::default()
        };
        for line in reply.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim() {
                "numChannels" => card.num_channels = value.parse().ok(),
                "productName" => card.product_name = value,
                "productId" => card.product_id = value,
                "serialNumber" => card.serial_number = value,
                "firmwareVersion" => card.firmware_version = value,
                "hostName" => card.host_name = value,
                other => debug!("ignoring discovery key {}", other),
            }
        }
        card
    }
}

/// Non-loopback IPv4 interfaces that have a broadcast address.
#[cfg(unix)]
pub fn list_interfaces() -> PslResult<Vec<InterfaceAddr>> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs fills `head` with a list we free below.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(PslError::OutOfResources);
    }

    let mut found = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: cursor walks the list returned by getifaddrs.
        let ifa = unsafe { &*cursor };
        cursor = ifa.ifa_next;

        let flags = ifa.ifa_flags;
        if flags & (libc::IFF_LOOPBACK as libc::c_uint) != 0
            || flags & (libc::IFF_BROADCAST as libc::c_uint) == 0
            || ifa.ifa_addr.is_null()
        {
            continue;
        }
        // SAFETY: non-null sockaddr pointers from getifaddrs are valid.
        let family = unsafe { (*ifa.ifa_addr).sa_family };
        if i32::from(family) != libc::AF_INET {
            continue;
        }
        let address = unsafe { sockaddr_v4(ifa.ifa_addr) };
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let broadcast_ptr = ifa.ifa_ifu;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let broadcast_ptr = ifa.ifa_dstaddr;
        let broadcast = if broadcast_ptr.is_null() {
            Ipv4Addr::BROADCAST
        } else {
            unsafe { sockaddr_v4(broadcast_ptr) }
        };
        found.push(InterfaceAddr { address, broadcast });
    }

    // SAFETY: head came from getifaddrs and is freed once.
    unsafe { libc::freeifaddrs(head) };
    Ok(found)
}

#[cfg(unix)]
unsafe fn sockaddr_v4(addr: *const libc::sockaddr) -> Ipv4Addr {
    let sin = &*(addr as *const libc::sockaddr_in);
    Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))
}

#[cfg(not(unix))]
pub fn list_interfaces() -> PslResult<Vec<InterfaceAddr>> {
    Ok(Vec::new())
}

pub struct Discovery {
    socket: UdpSocket,
    interfaces: Vec<InterfaceAddr>,
}

impl Discovery {
    pub fn new() -> PslResult<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .map_err(|_| PslError::OutOfResources)?;
        socket
            .set_broadcast(true)
            .map_err(|_| PslError::OutOfResources)?;
        let interfaces = list_interfaces()?;
        debug!("discovery over {} interface(s)", interfaces.len());
        Ok(Self { socket, interfaces })
    }

    pub fn interfaces(&self) -> &[InterfaceAddr] {
        &self.interfaces
    }

    /// Sends the probe everywhere. A failure on one interface is logged and
    /// the rest are still tried.
    pub fn probe(&self) -> PslResult<()> {
        let mut targets: Vec<SocketAddr> = self
            .interfaces
            .iter()
            .map(|iface| SocketAddr::V4(SocketAddrV4::new(iface.broadcast, DISCOVERY_PORT)))
            .collect();
        targets.push(SocketAddr::V4(SocketAddrV4::new(
            DISCOVERY_MULTICAST,
            DISCOVERY_PORT,
        )));

        let mut sent = 0;
        for target in targets {
            match self.socket.send_to(DISCOVERY_PROBE, target) {
                Ok(_) => sent += 1,
                Err(e) => warn!("discovery probe to {} failed: {}", target, e),
            }
        }
        if sent == 0 {
            return Err(PslError::WriteFailed);
        }
        Ok(())
    }

    /// Collects replies until `timeout` passes.
    pub fn collect(&self, timeout: Duration) -> PslResult<Vec<DiscoveredCard>> {
        let deadline = Instant::now() + timeout;
        let mut cards: Vec<DiscoveredCard> = Vec::new();
        let mut buf = [0u8; 2048];

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.socket
                .set_read_timeout(Some(deadline - now))
                .map_err(|_| PslError::ReadFailed)?;
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let reply = String::from_utf8_lossy(&buf[..n]);
                    if reply.as_bytes() == DISCOVERY_PROBE {
                        // our own multicast looped back
                        continue;
                    }
                    let card = DiscoveredCard::parse(&reply, Some(from.ip()));
                    if !cards.iter().any(|c| c.address == card.address) {
                        debug!("discovered {:?}", card);
                        cards.push(card);
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    break
                }
                Err(e) => {
                    warn!("discovery receive failed: {}", e);
                    return Err(PslError::ReadFailed);
                }
            }
        }
        Ok(cards)
    }
}

/// Probes the LAN once and returns every card that answered within `timeout`.
pub fn discover(timeout: Duration) -> PslResult<Vec<DiscoveredCard>> {
    let discovery = Discovery::new()?;
    discovery.probe()?;
    discovery.collect(timeout)
}
