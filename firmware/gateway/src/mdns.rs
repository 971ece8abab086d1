//! mDNS responder: answers A queries for `<hostname>.local` on the station
//! network, silent for everything else.

use defmt::*;
use embassy_futures::select::{select, Either};
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpAddress, IpEndpoint, Ipv4Address, Stack};
use embassy_time::{Duration, Timer};
use heapless::String;
use modgate_namewire as namewire;

use crate::cancel::CancelToken;
use crate::net;

const MDNS_MULTICAST_V4: Ipv4Address = Ipv4Address::new(224, 0, 0, 251);
const MDNS_PORT: u16 = 5353;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Append `.local` to the configured hostname.
pub fn fqdn_from_hostname(hostname: &str) -> String<64> {
    let mut out: String<64> = String::new();
    let _ = out.push_str(hostname);
    let _ = out.push_str(".local");
    out
}

#[embassy_executor::task]
pub async fn mdns_task(stack: Stack<'static>, cancel: &'static CancelToken) {
    let fqdn = fqdn_from_hostname(crate::HOSTNAME);

    'run: loop {
        if let Either::First(()) = select(cancel.cancelled(), stack.wait_config_up()).await {
            break;
        }

        let ip = match stack.config_v4() {
            Some(v4) => v4.address.address(),
            None => {
                Timer::after(RETRY_DELAY).await;
                continue;
            }
        };

        if let Err(err) = stack.join_multicast_group(IpAddress::Ipv4(MDNS_MULTICAST_V4)) {
            warn!(
                "mdns: failed to join multicast group (hostname={}): {:?}",
                fqdn.as_str(),
                err
            );
            Timer::after(RETRY_DELAY).await;
            continue;
        }

        let mut rx_meta = [PacketMetadata::EMPTY; 4];
        let mut tx_meta = [PacketMetadata::EMPTY; 4];
        let mut rx_storage = [0u8; 512];
        let mut tx_storage = [0u8; 512];
        let mut recv_buf = [0u8; 512];
        let mut resp_buf = [0u8; 512];

        let mut socket = UdpSocket::new(
            stack,
            &mut rx_meta,
            &mut rx_storage,
            &mut tx_meta,
            &mut tx_storage,
        );
        socket.set_hop_limit(Some(255));
        // Binding to the current IPv4 address (instead of 0.0.0.0) avoids emitting responses
        // with a source address of 0.0.0.0, which some resolvers will drop.
        if let Err(err) = socket.bind((IpAddress::Ipv4(ip), MDNS_PORT)) {
            warn!("mdns: bind {} failed (hostname={}): {:?}", MDNS_PORT, fqdn.as_str(), err);
            Timer::after(RETRY_DELAY).await;
            continue;
        }

        info!(
            "mdns: answering A queries for {} (ip={})",
            fqdn.as_str(),
            ip
        );

        loop {
            let (len, _meta) =
                match select(cancel.cancelled(), socket.recv_from(&mut recv_buf)).await {
                    Either::First(()) => break 'run,
                    Either::Second(Ok((len, meta))) => (len, meta),
                    Either::Second(Err(_)) => {
                        warn!("mdns: truncated datagram");
                        continue;
                    }
                };

            let query = &recv_buf[..len];
            if let Some(n) = answer_for(query, &fqdn, &mut resp_buf) {
                // Answers always go back to the group, the standard
                // multicast-responder behavior.
                let dest = IpEndpoint::new(IpAddress::Ipv4(MDNS_MULTICAST_V4), MDNS_PORT);
                if let Err(err) = socket.send_to(&resp_buf[..n], dest).await {
                    warn!("mdns: send error: {:?}", err);
                }
            }

            if !stack.is_config_up() {
                // Address changed or link dropped; rebind on the new config.
                break;
            }
        }

        drop(socket);
        Timer::after(RETRY_DELAY).await;
    }

    info!("mdns: stopped");
}

/// Build the authoritative answer for a matching `<hostname>.local` A
/// query; `None` for everything that must stay unanswered.
fn answer_for(query: &[u8], fqdn: &str, resp_buf: &mut [u8]) -> Option<usize> {
    if !namewire::is_query(query) {
        return None;
    }
    let question = namewire::walk_question(query)?;
    if question.qtype != namewire::QTYPE_A {
        return None;
    }

    let mut name = namewire::Name::new();
    namewire::decode_name(query, namewire::HEADER_LEN, &mut name)?;
    if !namewire::name_matches(&name, fqdn) {
        return None;
    }

    let ip = net::device_ip();
    namewire::build_mdns_response(query, &question, ip.octets(), resp_buf)
}
