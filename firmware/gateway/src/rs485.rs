//! The two RS-485 channels behind the gateway's `RS SEND`/`RS RECV`
//! commands. CH0 and CH1 map onto UART0 and UART1; both run 115200-8-N-1.
//!
//! Access is synchronous and short: `send` pushes one small line out through
//! the FIFO, `recv` drains only bytes the FIFO already holds. Both are safe
//! to call from any task through the critical-section mutex.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use esp_hal::uart::Uart;
use esp_hal::Blocking;

pub const CHANNEL_COUNT: usize = 2;
pub const BAUD: u32 = 115_200;

type Port = Uart<'static, Blocking>;

static PORTS: Mutex<CriticalSectionRawMutex, RefCell<[Option<Port>; CHANNEL_COUNT]>> =
    Mutex::new(RefCell::new([None, None]));

/// Register the configured UARTs. Called once during boot, before any
/// network service can dispatch an `RS` command.
pub fn install(ch0: Port, ch1: Port) {
    PORTS.lock(|ports| {
        let mut ports = ports.borrow_mut();
        ports[0] = Some(ch0);
        ports[1] = Some(ch1);
    });
}

pub fn send(channel: u8, data: &[u8]) -> Result<usize, &'static str> {
    with_port(channel, |port| {
        let mut written = 0;
        while written < data.len() {
            match port.write(&data[written..]) {
                Ok(0) => return Err("uart write stalled"),
                Ok(n) => written += n,
                Err(_) => return Err("uart write failed"),
            }
        }
        if port.flush().is_err() {
            return Err("uart flush failed");
        }
        Ok(written)
    })
}

/// Read whatever the RX FIFO already buffered, up to `buf.len()` bytes.
/// Returns 0 when the channel is idle; never waits for more input.
pub fn recv(channel: u8, buf: &mut [u8]) -> Result<usize, &'static str> {
    with_port(channel, |port| {
        port.read_buffered(buf).map_err(|_| "uart read failed")
    })
}

fn with_port<R>(
    channel: u8,
    f: impl FnOnce(&mut Port) -> Result<R, &'static str>,
) -> Result<R, &'static str> {
    if channel as usize >= CHANNEL_COUNT {
        return Err("channel must be 0 or 1");
    }
    PORTS.lock(|ports| {
        let mut ports = ports.borrow_mut();
        match ports[channel as usize].as_mut() {
            Some(port) => f(port),
            None => Err("uart not initialized"),
        }
    })
}
