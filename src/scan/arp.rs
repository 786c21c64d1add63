//! Active ARP sweep over a raw packet socket.
//!
//! Broadcasts one ARP request per host of the local subnet and collects the
//! replies arriving within the receive window. The AF_PACKET socket comes
//! from `afpacket`, Ethernet II framing from `etherparse`; requires root
//! (CAP_NET_RAW).

use afpacket::sync::RawPacketStream;
use anyhow::{Context, Result};
use etherparse::{EtherType, Ethernet2Header};
use ipnetwork::Ipv4Network;
use log::{debug, warn};
use nix::sys::{
    socket::{setsockopt, sockopt::ReceiveTimeout},
    time::{TimeVal, TimeValLike},
};
use std::{
    io::{ErrorKind, Read, Write},
    net::Ipv4Addr,
    os::fd::{AsRawFd, BorrowedFd},
    time::{Duration, Instant},
};

/// Ethernet II header (14) + ARP payload (28).
const ARP_FRAME_LEN: usize = 42;
/// ARP payload length for Ethernet/IPv4.
const ARP_BODY_LEN: usize = 28;
const BROADCAST: [u8; 6] = [0xff; 6];
/// Receive poll granularity, so the sweep loop stays responsive.
const RECV_TICK_MS: i64 = 200;

/// Build an Ethernet broadcast frame carrying an ARP who-has request.
pub fn build_request(
    src_mac: [u8; 6],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
) -> Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(ARP_FRAME_LEN);
    Ethernet2Header {
        destination: BROADCAST,
        source: src_mac,
        ether_type: EtherType::ARP,
    }
    .write(&mut frame)
    .context("write ethernet header")?;
    // Target hardware address stays zero for a request.
    frame.extend_from_slice(&arp_body(1, src_mac, src_ip, [0u8; 6], dst_ip));
    Ok(frame)
}

/// The 28-byte Ethernet/IPv4 ARP payload: htype ethernet, ptype IPv4,
/// hlen 6, plen 4, then operation and the two address pairs.
fn arp_body(
    operation: u16,
    sender_mac: [u8; 6],
    sender_ip: Ipv4Addr,
    target_mac: [u8; 6],
    target_ip: Ipv4Addr,
) -> [u8; ARP_BODY_LEN] {
    let mut body = [0u8; ARP_BODY_LEN];
    body[0..2].copy_from_slice(&1u16.to_be_bytes());
    body[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
    body[4] = 6;
    body[5] = 4;
    body[6..8].copy_from_slice(&operation.to_be_bytes());
    body[8..14].copy_from_slice(&sender_mac);
    body[14..18].copy_from_slice(&sender_ip.octets());
    body[18..24].copy_from_slice(&target_mac);
    body[24..28].copy_from_slice(&target_ip.octets());
    body
}

/// Parse an ARP reply frame into its `(sender ip, sender mac)` pair.
pub fn parse_reply(frame: &[u8]) -> Option<(Ipv4Addr, [u8; 6])> {
    let (header, body) = Ethernet2Header::from_slice(frame).ok()?;
    if header.ether_type != EtherType::ARP || body.len() < ARP_BODY_LEN {
        return None;
    }
    // Operation 2 is a reply.
    if u16::from_be_bytes([body[6], body[7]]) != 2 {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&body[8..14]);
    let ip = Ipv4Addr::new(body[14], body[15], body[16], body[17]);
    Some((ip, mac))
}

/// Render a raw MAC as the canonical uppercase colon-separated form.
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Sweep the subnet of `network` from `interface`, returning the unique
/// `(ip, mac)` pairs that answered within `window`.
pub async fn sweep(
    interface: &str,
    src_mac: [u8; 6],
    network: Ipv4Network,
    window: Duration,
) -> Result<Vec<(Ipv4Addr, String)>> {
    let interface = interface.to_string();
    tokio::task::spawn_blocking(move || sweep_blocking(&interface, src_mac, network, window))
        .await
        .context("join sweep task")?
}

fn sweep_blocking(
    interface: &str,
    src_mac: [u8; 6],
    network: Ipv4Network,
    window: Duration,
) -> Result<Vec<(Ipv4Addr, String)>> {
    let mut stream = RawPacketStream::new().context("open packet socket")?;
    stream
        .bind(interface)
        .with_context(|| format!("bind packet socket to {}", interface))?;
    // afpacket hands out only a RawFd; borrow it for the timeout sockopt.
    let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    setsockopt(&fd, ReceiveTimeout, &TimeVal::milliseconds(RECV_TICK_MS))
        .context("set receive timeout")?;

    let src_ip = network.ip();
    let mut sent = 0usize;
    for host in network.iter() {
        if host == src_ip || host == network.network() || host == network.broadcast() {
            continue;
        }
        let frame = build_request(src_mac, src_ip, host)?;
        if let Err(e) = stream.write_all(&frame) {
            warn!("ARP request to {} failed: {}", host, e);
        } else {
            sent += 1;
        }
    }
    debug!("ARP sweep sent {} requests on {}", sent, interface);

    let deadline = Instant::now() + window;
    let mut replies: Vec<(Ipv4Addr, String)> = Vec::new();
    let mut buf = [0u8; 256];
    while Instant::now() < deadline {
        match stream.read(&mut buf) {
            Ok(len) => {
                if let Some((ip, mac)) = parse_reply(&buf[..len]) {
                    let mac = format_mac(&mac);
                    if !replies.iter().any(|(_, m)| *m == mac) {
                        debug!("ARP reply: {} is at {}", ip, mac);
                        replies.push((ip, mac));
                    }
                }
            }
            // Receive timeout tick, loop until the window closes.
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                warn!("ARP receive failed: {}", e);
                break;
            }
        }
    }

    Ok(replies)
}
