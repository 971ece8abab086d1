//! Firmware-side implementations of the dispatcher's collaborator
//! interfaces, bridging `modgate-command` onto the Wi-Fi state snapshot,
//! the RS-485 channels and the status LED. Both the TCP command service and
//! `POST /cmd` call [`dispatch`].

use core::cell::RefCell;

use embassy_net::Ipv4Address;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use esp_hal::gpio::Output;
use modgate_command::{
    CollabError, IfConfig, Indicator, Ipv4, NetworkStatus, Reply, SerialChannel, Services,
    WifiReport,
};

use crate::{net, rs485};

static LED: BlockingMutex<CriticalSectionRawMutex, RefCell<Option<Output<'static>>>> =
    BlockingMutex::new(RefCell::new(None));

pub fn install_led(led: Output<'static>) {
    LED.lock(|cell| cell.borrow_mut().replace(led));
}

pub fn set_led(on: bool) {
    LED.lock(|cell| {
        if let Some(led) = cell.borrow_mut().as_mut() {
            if on {
                led.set_high();
            } else {
                led.set_low();
            }
        }
    });
}

fn to_cmd_ip(ip: Ipv4Address) -> Ipv4 {
    Ipv4(ip.octets())
}

/// `SYS STATUS` / `SYS WIFI` read the station interface; when it holds no
/// config the fields render as zeros rather than erroring, so a
/// disconnected unit still answers status queries.
pub struct NetStatus;

impl NetworkStatus for NetStatus {
    fn ifconfig(&self) -> Result<IfConfig, CollabError> {
        let state = net::wifi_snapshot();
        Ok(IfConfig {
            ip: to_cmd_ip(state.sta_ip.unwrap_or(Ipv4Address::UNSPECIFIED)),
            netmask: to_cmd_ip(net::prefix_to_netmask(state.sta_prefix)),
            gateway: to_cmd_ip(state.sta_gateway.unwrap_or(Ipv4Address::UNSPECIFIED)),
            dns: to_cmd_ip(state.sta_dns.unwrap_or(Ipv4Address::UNSPECIFIED)),
        })
    }

    fn wifi(&self) -> Result<WifiReport, CollabError> {
        let state = net::wifi_snapshot();
        Ok(WifiReport {
            active: state.sta_started,
            connected: state.sta_connected,
            ip: to_cmd_ip(state.sta_ip.unwrap_or(Ipv4Address::UNSPECIFIED)),
            rssi: state.rssi,
        })
    }
}

pub struct SerialPorts;

impl SerialChannel for SerialPorts {
    fn send(&mut self, channel: u8, data: &[u8]) -> Result<usize, CollabError> {
        rs485::send(channel, data).map_err(CollabError::new)
    }

    fn recv(&mut self, channel: u8, buf: &mut [u8]) -> Result<usize, CollabError> {
        rs485::recv(channel, buf).map_err(CollabError::new)
    }
}

pub struct StatusLed;

impl Indicator for StatusLed {
    fn set(&mut self, on: bool) {
        set_led(on);
    }
}

/// Run one command against the live collaborators.
pub fn dispatch(cmd: &str) -> Reply {
    let net_status = NetStatus;
    let mut serial = SerialPorts;
    let mut led = StatusLed;
    let mut services = Services {
        net: &net_status,
        serial: &mut serial,
        indicator: &mut led,
    };
    modgate_command::dispatch(cmd, &mut services)
}
