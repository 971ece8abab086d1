//! TCP command service: one UTF-8 command line per connection, one reply
//! line back, connection closed. No persistent sessions; the dispatcher is
//! stateless and the protocol stays trivially scriptable (`nc` one-liners).

use alloc::string::String;
use defmt::*;
use embassy_net::tcp::TcpSocket;
use embassy_net::Stack;
use embassy_time::{with_timeout, Duration, Timer};

use crate::http::write_all;
use crate::services;

pub const CMD_PORT: u16 = 12345;

/// Per-connection budget for the single read. A stalled client holds only
/// its own listener task, never the UI or the HTTP service.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_LINE: usize = 1024;

/// One listener per network interface (AP and STA stacks), each serving a
/// single client at a time.
#[embassy_executor::task(pool_size = 2)]
pub async fn cmd_server_task(stack: Stack<'static>, label: &'static str) {
    let mut rx_buf = [0u8; MAX_LINE];
    let mut tx_buf = [0u8; MAX_LINE];

    info!("cmd: {} listener starting (port={})", label, CMD_PORT);

    loop {
        stack.wait_config_up().await;

        let mut socket = TcpSocket::new(stack, &mut rx_buf, &mut tx_buf);
        // Transport-level backstop behind the explicit read timeout below.
        socket.set_timeout(Some(Duration::from_secs(60)));

        match socket.accept(CMD_PORT).await {
            Ok(()) => {
                if let Err(err) = handle_connection(&mut socket).await {
                    warn!("cmd: {} connection error: {:?}", label, err);
                }
            }
            Err(err) => {
                warn!("cmd: {} accept error: {:?}", label, err);
                Timer::after(Duration::from_millis(200)).await;
            }
        }

        socket.abort();
    }
}

async fn handle_connection(socket: &mut TcpSocket<'_>) -> Result<(), embassy_net::tcp::Error> {
    let mut buf = [0u8; MAX_LINE];

    let n = match with_timeout(READ_TIMEOUT, socket.read(&mut buf)).await {
        Ok(result) => result?,
        // Stalled client: close without a response.
        Err(_) => return Ok(()),
    };
    if n == 0 {
        return Ok(());
    }

    let cmd = String::from_utf8_lossy(&buf[..n]);
    let reply = services::dispatch(cmd.trim());
    info!("cmd: {} -> {}", cmd.trim(), reply.as_str());

    write_all(socket, reply.as_bytes()).await?;
    write_all(socket, b"\n").await?;
    socket.flush().await
}
