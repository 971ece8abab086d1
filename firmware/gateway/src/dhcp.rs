//! Minimal DHCP server for the config access point.
//!
//! A phone that joins the setup AP needs an address before the captive DNS
//! and control page can do anything. This hands out leases from a small
//! fixed pool on 192.168.4.0/24 and points router + DNS at the device
//! itself. DISCOVER/REQUEST are answered with OFFER/ACK; DECLINE/RELEASE
//! free the lease; everything else is ignored.

use defmt::*;
use embassy_futures::select::{select, Either};
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpAddress, IpEndpoint, Ipv4Address, Stack};
use heapless::Vec;

use crate::cancel::CancelToken;
use crate::net::AP_ADDR;

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

const POOL_START: u8 = 16; // 192.168.4.16 ..
const POOL_SIZE: u8 = 8;
const LEASE_SECS: u32 = 7200;

/// BOOTP frames are fixed-layout up to the option area at offset 240.
const OPTIONS_OFFSET: usize = 240;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const MSG_DISCOVER: u8 = 1;
const MSG_OFFER: u8 = 2;
const MSG_REQUEST: u8 = 3;
const MSG_DECLINE: u8 = 4;
const MSG_ACK: u8 = 5;
const MSG_RELEASE: u8 = 7;

struct DhcpMessage {
    msg_type: u8,
    xid: [u8; 4],
    chaddr: [u8; 6],
    requested_ip: Option<Ipv4Address>,
    server_id: Option<Ipv4Address>,
}

#[derive(Clone, Copy)]
struct Lease {
    mac: [u8; 6],
    ip_low: u8,
}

#[embassy_executor::task]
pub async fn dhcp_server_task(stack: Stack<'static>, cancel: &'static CancelToken) {
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut tx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx_storage = [0u8; 768];
    let mut tx_storage = [0u8; 768];

    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_storage,
        &mut tx_meta,
        &mut tx_storage,
    );
    if let Err(err) = socket.bind(DHCP_SERVER_PORT) {
        warn!("dhcp: bind {} failed: {:?}", DHCP_SERVER_PORT, err);
        return;
    }

    info!(
        "dhcp: serving {} leases from 192.168.4.{} on the config AP",
        POOL_SIZE, POOL_START
    );

    let mut leases: Vec<Lease, { POOL_SIZE as usize }> = Vec::new();
    let mut frame = [0u8; 768];
    let mut reply = [0u8; 768];

    loop {
        let len = match select(cancel.cancelled(), socket.recv_from(&mut frame)).await {
            Either::First(()) => break,
            Either::Second(Ok((len, _meta))) => len,
            Either::Second(Err(_)) => {
                warn!("dhcp: truncated datagram");
                continue;
            }
        };

        let Some(message) = parse_message(&frame[..len]) else {
            continue;
        };

        // A REQUEST naming a different server means the client picked
        // another offer; stay quiet.
        if message.msg_type == MSG_REQUEST
            && message.server_id.is_some()
            && message.server_id != Some(AP_ADDR)
        {
            continue;
        }

        let reply_type = match message.msg_type {
            MSG_DISCOVER => MSG_OFFER,
            MSG_REQUEST => MSG_ACK,
            MSG_DECLINE | MSG_RELEASE => {
                leases.retain(|lease| lease.mac != message.chaddr);
                continue;
            }
            _ => continue,
        };

        let Some(ip_low) = ensure_lease(&mut leases, message.chaddr, message.requested_ip) else {
            warn!("dhcp: lease pool exhausted");
            continue;
        };
        let offer = Ipv4Address::new(192, 168, 4, ip_low);

        let n = build_reply(&mut reply, &message, reply_type, offer);
        let dest = IpEndpoint::new(IpAddress::Ipv4(Ipv4Address::BROADCAST), DHCP_CLIENT_PORT);
        if let Err(err) = socket.send_to(&reply[..n], dest).await {
            warn!("dhcp: send error: {:?}", err);
        } else {
            info!(
                "dhcp: {} {} for client",
                if reply_type == MSG_OFFER { "OFFER" } else { "ACK" },
                offer
            );
        }
    }

    info!("dhcp: stopped");
}

fn parse_message(frame: &[u8]) -> Option<DhcpMessage> {
    if frame.len() < OPTIONS_OFFSET + 4 {
        return None;
    }
    // BOOTREQUEST over Ethernet only.
    if frame[0] != 1 || frame[1] != 1 || frame[2] != 6 {
        return None;
    }
    if frame[236..240] != MAGIC_COOKIE {
        return None;
    }

    let mut xid = [0u8; 4];
    xid.copy_from_slice(&frame[4..8]);
    let mut chaddr = [0u8; 6];
    chaddr.copy_from_slice(&frame[28..34]);

    let mut msg_type = None;
    let mut requested_ip = None;
    let mut server_id = None;

    let mut idx = OPTIONS_OFFSET;
    while idx < frame.len() {
        let code = frame[idx];
        match code {
            0 => {
                idx += 1;
                continue;
            }
            255 => break,
            _ => {}
        }
        let len = *frame.get(idx + 1)? as usize;
        let value = frame.get(idx + 2..idx + 2 + len)?;
        match code {
            53 if len == 1 => msg_type = Some(value[0]),
            50 if len == 4 => {
                requested_ip = Some(Ipv4Address::new(value[0], value[1], value[2], value[3]))
            }
            54 if len == 4 => {
                server_id = Some(Ipv4Address::new(value[0], value[1], value[2], value[3]))
            }
            _ => {}
        }
        idx += 2 + len;
    }

    Some(DhcpMessage {
        msg_type: msg_type?,
        xid,
        chaddr,
        requested_ip,
        server_id,
    })
}

/// Find or allocate a pool slot for `mac`. A requested address inside the
/// pool is honored when free.
fn ensure_lease(
    leases: &mut Vec<Lease, { POOL_SIZE as usize }>,
    mac: [u8; 6],
    requested: Option<Ipv4Address>,
) -> Option<u8> {
    if let Some(lease) = leases.iter().find(|lease| lease.mac == mac) {
        return Some(lease.ip_low);
    }

    let wanted = requested
        .map(|ip| ip.octets())
        .filter(|o| o[..3] == [192, 168, 4] && (POOL_START..POOL_START + POOL_SIZE).contains(&o[3]))
        .map(|o| o[3]);

    let free = |leases: &Vec<Lease, { POOL_SIZE as usize }>, low: u8| {
        leases.iter().all(|lease| lease.ip_low != low)
    };

    let ip_low = match wanted {
        Some(low) if free(leases, low) => low,
        _ => (POOL_START..POOL_START + POOL_SIZE).find(|&low| free(leases, low))?,
    };

    leases.push(Lease { mac, ip_low }).ok()?;
    Some(ip_low)
}

fn build_reply(reply: &mut [u8; 768], message: &DhcpMessage, reply_type: u8, offer: Ipv4Address) -> usize {
    reply.fill(0);
    reply[0] = 2; // BOOTREPLY
    reply[1] = 1;
    reply[2] = 6;
    reply[4..8].copy_from_slice(&message.xid);
    reply[16..20].copy_from_slice(&offer.octets()); // yiaddr
    reply[20..24].copy_from_slice(&AP_ADDR.octets()); // siaddr
    reply[28..34].copy_from_slice(&message.chaddr);
    reply[236..240].copy_from_slice(&MAGIC_COOKIE);

    let mut idx = OPTIONS_OFFSET;
    let mut put = |reply: &mut [u8; 768], code: u8, value: &[u8]| {
        reply[idx] = code;
        reply[idx + 1] = value.len() as u8;
        reply[idx + 2..idx + 2 + value.len()].copy_from_slice(value);
        idx += 2 + value.len();
    };

    put(reply, 53, &[reply_type]);
    put(reply, 54, &AP_ADDR.octets()); // server id
    put(reply, 51, &LEASE_SECS.to_be_bytes());
    put(reply, 1, &[255, 255, 255, 0]); // subnet mask
    put(reply, 3, &AP_ADDR.octets()); // router
    put(reply, 6, &AP_ADDR.octets()); // DNS -> the captive responder
    reply[idx] = 255;
    idx += 1;

    // Stay at or above the classic 300-byte BOOTP minimum.
    idx.max(300)
}
