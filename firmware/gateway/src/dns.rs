//! Captive DNS responder on the access-point interface.
//!
//! Every A query gets answered with the device's currently-best address so
//! any hostname a configuration client tries resolves to the control page.
//! The target address is re-resolved per response (see
//! [`net::dns_target_ip`]); everything else in the packet is echoed back
//! unchanged with a single answer record appended.

use defmt::*;
use embassy_futures::select::{select, Either};
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::Stack;
use modgate_namewire as namewire;

use crate::cancel::CancelToken;
use crate::net;

const DNS_PORT: u16 = 53;

#[embassy_executor::task]
pub async fn captive_dns_task(stack: Stack<'static>, cancel: &'static CancelToken) {
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut tx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx_storage = [0u8; 512];
    let mut tx_storage = [0u8; 512];

    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_storage,
        &mut tx_meta,
        &mut tx_storage,
    );
    if let Err(err) = socket.bind(DNS_PORT) {
        warn!("captive-dns: bind {} failed: {:?}", DNS_PORT, err);
        return;
    }

    info!(
        "captive-dns: answering all A queries on port {} (target follows device address)",
        DNS_PORT
    );

    let mut query_buf = [0u8; 512];
    let mut resp_buf = [0u8; 512];

    loop {
        let (len, meta) = match select(cancel.cancelled(), socket.recv_from(&mut query_buf)).await
        {
            Either::First(()) => break,
            Either::Second(Ok((len, meta))) => (len, meta),
            Either::Second(Err(_)) => {
                warn!("captive-dns: truncated datagram");
                continue;
            }
        };

        let query = &query_buf[..len];
        if !namewire::is_query(query) {
            continue;
        }
        // Short packets and unwalkable questions are dropped silently.
        let Some(question) = namewire::walk_question(query) else {
            continue;
        };
        if question.qtype != namewire::QTYPE_A {
            continue;
        }

        let target = net::dns_target_ip();
        let Some(n) =
            namewire::build_captive_response(query, &question, target.octets(), &mut resp_buf)
        else {
            continue;
        };

        if let Err(err) = socket.send_to(&resp_buf[..n], meta.endpoint).await {
            warn!("captive-dns: send error: {:?}", err);
        }
    }

    info!("captive-dns: stopped");
}
