//! Wi-Fi manager: the config access point, the station link, and the two
//! embassy-net stacks the network services bind their listeners on.
//!
//! The radio runs AP+STA. The AP side is always up with a static
//! 192.168.4.1/24 so a phone can reach the control page; the STA side
//! auto-joins the build-time network when one is configured and can be
//! re-pointed at runtime through `connect()` (HTTP API or the on-device
//! keypad). Scan/connect requests from other tasks are funneled through a
//! small channel to the task that owns the controller; results come back on
//! signals. Everyone else only ever reads the eventually-consistent
//! [`WifiState`] snapshot.

use core::cell::Cell;
use core::str::FromStr;
use core::sync::atomic::{AtomicU8, Ordering};

use alloc::string::String;
use defmt::*;
use embassy_executor::Spawner;
use embassy_futures::select::{select3, Either3};
use embassy_net::{
    Config as NetConfig, DhcpConfig, Ipv4Address, Ipv4Cidr, Stack, StackResources, StaticConfigV4,
};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration, Timer};
use enumset::{enum_set, EnumSet};
use esp_hal::peripherals::WIFI;
use esp_hal::rng::Rng;
use esp_radio::{
    init as radio_init, Controller as RadioController,
    wifi::{
        self, ApConfig, AuthMethod, ClientConfig, ModeConfig, ScanConfig, WifiController,
        WifiDevice, WifiEvent,
    },
};
use heapless::{String as HString, Vec};
use static_cell::StaticCell;

use crate::{AP_PSK, AP_SSID, STA_DNS, STA_GATEWAY, STA_NETMASK, STA_PSK, STA_SSID, STA_STATIC_IP};

/// The access point's own address; also the captive DNS fallback target.
pub const AP_ADDR: Ipv4Address = Ipv4Address::new(192, 168, 4, 1);
pub const AP_PREFIX: u8 = 24;

/// Station connect budget, association plus DHCP. Long enough for slow
/// consumer routers, short enough that a bad PSK fails while the person
/// provisioning is still looking at the screen.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
const SCAN_TIMEOUT: Duration = Duration::from_secs(15);
const STATE_REFRESH: Duration = Duration::from_secs(5);

pub const MAX_SCAN_RESULTS: usize = 16;

#[derive(Clone, Debug)]
pub struct ScanEntry {
    pub ssid: HString<32>,
    pub bssid: [u8; 6],
    pub channel: u8,
    pub rssi: i8,
    pub auth: &'static str,
}

pub type ScanList = Vec<ScanEntry, MAX_SCAN_RESULTS>;

/// Bounded failure text, embedded verbatim in JSON error payloads.
pub type WifiFailure = HString<80>;

/// Shared Wi-Fi/IPv4 state snapshot for the services and the UI.
#[derive(Clone, Copy, Debug)]
pub struct WifiState {
    pub sta_started: bool,
    pub sta_connected: bool,
    pub sta_ip: Option<Ipv4Address>,
    pub sta_prefix: u8,
    pub sta_gateway: Option<Ipv4Address>,
    pub sta_dns: Option<Ipv4Address>,
    pub rssi: Option<i8>,
    pub ap_active: bool,
}

impl WifiState {
    const fn new() -> Self {
        Self {
            sta_started: false,
            sta_connected: false,
            sta_ip: None,
            sta_prefix: 0,
            sta_gateway: None,
            sta_dns: None,
            rssi: None,
            ap_active: false,
        }
    }
}

enum WifiRequest {
    Scan,
    Connect { ssid: HString<32>, psk: HString<64> },
}

static WIFI_STATE: BlockingMutex<CriticalSectionRawMutex, Cell<WifiState>> =
    BlockingMutex::new(Cell::new(WifiState::new()));
static AP_CLIENT_COUNT: AtomicU8 = AtomicU8::new(0);

static REQUESTS: Channel<CriticalSectionRawMutex, WifiRequest, 2> = Channel::new();
static SCAN_RESULTS: Signal<CriticalSectionRawMutex, Result<ScanList, WifiFailure>> = Signal::new();
static CONNECT_RESULTS: Signal<CriticalSectionRawMutex, bool> = Signal::new();

static RADIO_CONTROLLER: StaticCell<RadioController<'static>> = StaticCell::new();
// Each stack serves at most one TCP session plus its UDP responders at a
// time; 8 sockets leave headroom for teardown overlap.
static STA_RESOURCES: StaticCell<StackResources<8>> = StaticCell::new();
static AP_RESOURCES: StaticCell<StackResources<8>> = StaticCell::new();

/// The two network stacks the listener tasks bind on.
#[derive(Clone, Copy)]
pub struct NetStacks {
    pub ap: Stack<'static>,
    pub sta: Stack<'static>,
}

pub fn wifi_snapshot() -> WifiState {
    WIFI_STATE.lock(|cell| cell.get())
}

fn update_state(f: impl FnOnce(&mut WifiState)) {
    WIFI_STATE.lock(|cell| {
        let mut state = cell.get();
        f(&mut state);
        cell.set(state);
    });
}

pub fn ap_client_count() -> u8 {
    AP_CLIENT_COUNT.load(Ordering::Relaxed)
}

/// The address the captive DNS responder hands out, resolved per response.
/// While a configuration client is still associated to the AP, answers keep
/// pointing at the AP address even after the station joins a home network,
/// so that client is not stranded on an address it cannot reach.
pub fn dns_target_ip() -> Ipv4Address {
    let state = wifi_snapshot();
    if state.ap_active && ap_client_count() > 0 {
        return AP_ADDR;
    }
    if state.sta_connected {
        if let Some(ip) = state.sta_ip {
            return ip;
        }
    }
    AP_ADDR
}

/// The device's current best address (station preferred), used by the mDNS
/// responder and the status page.
pub fn device_ip() -> Ipv4Address {
    match wifi_snapshot().sta_ip {
        Some(ip) => ip,
        None => AP_ADDR,
    }
}

/// Ask the Wi-Fi task for a scan; results are sorted strongest-first with
/// hidden (empty-SSID) entries dropped.
pub async fn scan() -> Result<ScanList, WifiFailure> {
    SCAN_RESULTS.reset();
    REQUESTS.send(WifiRequest::Scan).await;
    match with_timeout(SCAN_TIMEOUT, SCAN_RESULTS.wait()).await {
        Ok(result) => result,
        Err(_) => Err(failure("scan timed out")),
    }
}

/// Ask the Wi-Fi task to (re)join `ssid`. Blocks up to the connect budget;
/// the HTTP connect endpoint accepts that as a rare administrative action.
pub async fn connect(ssid: &str, psk: &str) -> bool {
    let mut req_ssid: HString<32> = HString::new();
    if req_ssid.push_str(ssid).is_err() {
        return false;
    }
    let mut req_psk: HString<64> = HString::new();
    if req_psk.push_str(psk).is_err() {
        return false;
    }

    CONNECT_RESULTS.reset();
    REQUESTS
        .send(WifiRequest::Connect {
            ssid: req_ssid,
            psk: req_psk,
        })
        .await;
    match with_timeout(CONNECT_TIMEOUT + Duration::from_secs(3), CONNECT_RESULTS.wait()).await {
        Ok(ok) => ok,
        Err(_) => false,
    }
}

/// Bring up the radio in AP+STA mode and spawn the stack runners plus the
/// Wi-Fi task. Returns `None` when the radio is unavailable, in which case
/// the rest of the firmware keeps running without network services.
pub fn start(spawner: &Spawner, wifi_peripheral: WIFI<'static>) -> Option<NetStacks> {
    let radio = match radio_init() {
        Ok(ctrl) => ctrl,
        Err(err) => {
            warn!("Wi-Fi radio init failed; disabling network services: {:?}", err);
            return None;
        }
    };
    let radio_ctrl = RADIO_CONTROLLER.init(radio);

    let (controller, interfaces) = match wifi::new(radio_ctrl, wifi_peripheral, Default::default())
    {
        Ok(v) => v,
        Err(err) => {
            warn!("Wi-Fi driver init failed; disabling network services: {:?}", err);
            return None;
        }
    };

    let sta_device: WifiDevice<'static> = interfaces.sta;
    let ap_device: WifiDevice<'static> = interfaces.ap;

    let rng = Rng::new();
    let sta_seed = (rng.random() as u64) << 32 | rng.random() as u64;
    let ap_seed = (rng.random() as u64) << 32 | rng.random() as u64;

    let (sta_cfg, is_static) = build_sta_net_config();
    let sta_resources = STA_RESOURCES.init(StackResources::<8>::new());
    let (sta_stack, sta_runner) = embassy_net::new(sta_device, sta_cfg, sta_resources, sta_seed);

    let mut ap_dns: Vec<Ipv4Address, 3> = Vec::new();
    let _ = ap_dns.push(AP_ADDR);
    let ap_cfg = NetConfig::ipv4_static(StaticConfigV4 {
        address: Ipv4Cidr::new(AP_ADDR, AP_PREFIX),
        gateway: Some(AP_ADDR),
        dns_servers: ap_dns,
    });
    let ap_resources = AP_RESOURCES.init(StackResources::<8>::new());
    let (ap_stack, ap_runner) = embassy_net::new(ap_device, ap_cfg, ap_resources, ap_seed);

    info!("spawning network stack runners (sta_static_ip={})", is_static);
    spawner
        .spawn(net_task(sta_runner))
        .expect("sta net_task spawn");
    spawner
        .spawn(net_task(ap_runner))
        .expect("ap net_task spawn");

    info!("spawning Wi-Fi task");
    spawner
        .spawn(wifi_task(controller, sta_stack))
        .expect("wifi_task spawn");

    Some(NetStacks {
        ap: ap_stack,
        sta: sta_stack,
    })
}

#[embassy_executor::task(pool_size = 2)]
async fn net_task(mut runner: embassy_net::Runner<'static, WifiDevice<'static>>) {
    runner.run().await;
}

fn ap_config() -> ApConfig {
    let cfg = ApConfig::default().with_ssid(String::from(AP_SSID));
    if AP_PSK.is_empty() {
        cfg
    } else {
        cfg.with_password(String::from(AP_PSK))
            .with_auth_method(AuthMethod::Wpa2Personal)
    }
}

#[embassy_executor::task]
async fn wifi_task(mut controller: WifiController<'static>, sta_stack: Stack<'static>) {
    info!(
        "Wi-Fi task starting (ap_ssid=\"{}\", sta_ssid={:?})",
        AP_SSID, STA_SSID
    );

    let initial_client = match (STA_SSID, STA_PSK) {
        (Some(ssid), Some(psk)) => ClientConfig::default()
            .with_ssid(String::from(ssid))
            .with_password(String::from(psk)),
        _ => ClientConfig::default(),
    };

    if let Err(err) = controller.set_config(&ModeConfig::ApSta(initial_client, ap_config())) {
        warn!("Wi-Fi set_config error: {:?}", err);
        return;
    }
    if let Err(err) = controller.start_async().await {
        warn!("Wi-Fi start_async error: {:?}", err);
        return;
    }

    update_state(|s| {
        s.ap_active = true;
        s.sta_started = true;
    });
    info!(
        "config AP active: \"{}\" ({}); control page at http://{}",
        AP_SSID,
        if AP_PSK.is_empty() { "open" } else { "wpa2" },
        AP_ADDR
    );

    if let (Some(ssid), Some(psk)) = (STA_SSID, STA_PSK) {
        if try_connect(&mut controller, sta_stack, ssid, psk).await {
            info!("Wi-Fi auto-join succeeded");
        } else {
            warn!("Wi-Fi auto-join failed; AP provisioning remains available");
        }
    }

    const EVENTS: EnumSet<WifiEvent> = enum_set!(
        WifiEvent::ApStaconnected | WifiEvent::ApStadisconnected | WifiEvent::StaDisconnected
    );

    loop {
        match select3(
            REQUESTS.receive(),
            controller.wait_for_events(EVENTS, true),
            Timer::after(STATE_REFRESH),
        )
        .await
        {
            Either3::First(WifiRequest::Scan) => {
                SCAN_RESULTS.signal(run_scan(&mut controller).await);
            }
            Either3::First(WifiRequest::Connect { ssid, psk }) => {
                let ok = try_connect(&mut controller, sta_stack, &ssid, &psk).await;
                CONNECT_RESULTS.signal(ok);
            }
            Either3::Second(events) => {
                if events.contains(WifiEvent::ApStaconnected) {
                    let count = AP_CLIENT_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
                    info!("AP client associated (count={})", count);
                }
                if events.contains(WifiEvent::ApStadisconnected) {
                    let _ = AP_CLIENT_COUNT.fetch_update(
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                        |count| Some(count.saturating_sub(1)),
                    );
                    info!("AP client left (count={})", ap_client_count());
                }
                if events.contains(WifiEvent::StaDisconnected) {
                    warn!("Wi-Fi STA disconnected");
                    update_state(|s| {
                        s.sta_connected = false;
                        s.rssi = None;
                    });
                }
            }
            Either3::Third(_) => {}
        }

        refresh_sta_snapshot(&mut controller, sta_stack);
    }
}

fn refresh_sta_snapshot(controller: &mut WifiController<'static>, stack: Stack<'static>) {
    let connected = matches!(controller.is_connected(), Ok(true));
    let cfg = stack.config_v4();
    let rssi = if connected { controller.rssi().ok() } else { None };

    update_state(|s| {
        s.sta_connected = connected && cfg.is_some();
        s.rssi = rssi;
        match cfg {
            Some(ref cfg) => {
                s.sta_ip = Some(cfg.address.address());
                s.sta_prefix = cfg.address.prefix_len();
                s.sta_gateway = cfg.gateway;
                s.sta_dns = cfg.dns_servers.first().copied();
            }
            None => {
                s.sta_ip = None;
                s.sta_prefix = 0;
                s.sta_gateway = None;
                s.sta_dns = None;
            }
        }
    });
}

async fn try_connect(
    controller: &mut WifiController<'static>,
    stack: Stack<'static>,
    ssid: &str,
    psk: &str,
) -> bool {
    info!("Wi-Fi connecting (ssid=\"{}\")", ssid);

    if matches!(controller.is_connected(), Ok(true)) {
        let _ = controller.disconnect_async().await;
    }

    let client = ClientConfig::default()
        .with_ssid(String::from(ssid))
        .with_password(String::from(psk));
    if let Err(err) = controller.set_config(&ModeConfig::ApSta(client, ap_config())) {
        warn!("Wi-Fi set_config error: {:?}", err);
        return false;
    }

    let attempt = async {
        controller.connect_async().await?;
        stack.wait_config_up().await;
        Ok::<(), wifi::WifiError>(())
    };

    match with_timeout(CONNECT_TIMEOUT, attempt).await {
        Ok(Ok(())) => {
            refresh_sta_snapshot(controller, stack);
            if let Some(cfg) = stack.config_v4() {
                info!(
                    "Wi-Fi link up: ip={} gw={}",
                    cfg.address.address(),
                    cfg.gateway.unwrap_or(Ipv4Address::UNSPECIFIED)
                );
            }
            true
        }
        Ok(Err(err)) => {
            warn!("Wi-Fi connect error: {:?}", err);
            false
        }
        Err(_) => {
            warn!("Wi-Fi connect timed out (ssid=\"{}\")", ssid);
            false
        }
    }
}

async fn run_scan(controller: &mut WifiController<'static>) -> Result<ScanList, WifiFailure> {
    info!("Wi-Fi scan requested");
    match controller.scan_with_config_async(ScanConfig::default()).await {
        Ok(found) => {
            let mut list = ScanList::new();
            for ap in found {
                if ap.ssid.is_empty() {
                    // Hidden networks are useless on the picker.
                    continue;
                }
                let mut ssid: HString<32> = HString::new();
                for ch in ap.ssid.chars() {
                    if ssid.push(ch).is_err() {
                        break;
                    }
                }
                let entry = ScanEntry {
                    ssid,
                    bssid: ap.bssid,
                    channel: ap.channel,
                    rssi: ap.signal_strength,
                    auth: auth_mode_str(ap.auth_method),
                };
                if list.push(entry).is_err() {
                    break;
                }
            }
            list.as_mut_slice()
                .sort_unstable_by(|a, b| b.rssi.cmp(&a.rssi));
            info!("Wi-Fi scan done (found={})", list.len());
            Ok(list)
        }
        Err(err) => {
            warn!("Wi-Fi scan failed: {:?}", err);
            Err(debug_failure("scan failed: ", &err))
        }
    }
}

pub fn auth_mode_str(auth: Option<AuthMethod>) -> &'static str {
    match auth {
        None | Some(AuthMethod::None) => "OPEN",
        Some(AuthMethod::Wep) => "WEP",
        Some(AuthMethod::Wpa) => "WPA",
        Some(AuthMethod::Wpa2Personal) => "WPA2",
        Some(AuthMethod::WpaWpa2Personal) => "WPA/WPA2",
        Some(AuthMethod::Wpa2Enterprise) => "WPA2-ENT",
        Some(AuthMethod::Wpa3Personal) => "WPA3",
        Some(AuthMethod::Wpa2Wpa3Personal) => "WPA2/WPA3",
        Some(_) => "OTHER",
    }
}

fn failure(msg: &str) -> WifiFailure {
    let mut out = WifiFailure::new();
    let _ = out.push_str(msg);
    out
}

fn debug_failure(prefix: &str, err: &impl core::fmt::Debug) -> WifiFailure {
    let mut out = failure(prefix);
    struct Truncating<'a>(&'a mut WifiFailure);
    impl core::fmt::Write for Truncating<'_> {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            // Silently drop what no longer fits; the bound is the point.
            let _ = self.0.push_str(s);
            Ok(())
        }
    }
    let _ = core::fmt::write(&mut Truncating(&mut out), format_args!("{:?}", err));
    out
}

fn parse_ipv4(s: &str) -> Option<Ipv4Address> {
    let mut parts = [0u8; 4];
    let mut idx = 0;
    for part in s.split('.') {
        if idx >= 4 {
            return None;
        }
        parts[idx] = u8::from_str(part).ok()?;
        idx += 1;
    }
    if idx != 4 {
        return None;
    }
    Some(Ipv4Address::new(parts[0], parts[1], parts[2], parts[3]))
}

fn netmask_to_prefix(mask: Ipv4Address) -> Option<u8> {
    let value = u32::from_be_bytes(mask.octets());
    let prefix = value.count_ones() as u8;
    let reconstructed = if prefix == 0 {
        0
    } else {
        u32::MAX.checked_shl(u32::from(32 - prefix))?
    };
    if reconstructed == value { Some(prefix) } else { None }
}

/// Inverse of [`netmask_to_prefix`], for rendering `SYS STATUS`.
pub fn prefix_to_netmask(prefix: u8) -> Ipv4Address {
    let value: u32 = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    };
    let octets = value.to_be_bytes();
    Ipv4Address::new(octets[0], octets[1], octets[2], octets[3])
}

fn build_sta_net_config() -> (NetConfig, bool) {
    if let (Some(ip_s), Some(mask_s), Some(gw_s)) = (STA_STATIC_IP, STA_NETMASK, STA_GATEWAY) {
        if let (Some(ip), Some(mask), Some(gw)) =
            (parse_ipv4(ip_s), parse_ipv4(mask_s), parse_ipv4(gw_s))
        {
            if let Some(prefix) = netmask_to_prefix(mask) {
                let mut dns_servers: Vec<Ipv4Address, 3> = Vec::new();
                if let Some(dns_ip) = STA_DNS.and_then(parse_ipv4) {
                    let _ = dns_servers.push(dns_ip);
                }

                let static_cfg = StaticConfigV4 {
                    address: Ipv4Cidr::new(ip, prefix),
                    gateway: Some(gw),
                    dns_servers,
                };
                info!(
                    "Wi-Fi STA using static IPv4: addr={} prefix={} gw={}",
                    ip, prefix, gw
                );
                return (NetConfig::ipv4_static(static_cfg), true);
            }
            warn!("Wi-Fi STA static netmask invalid; falling back to DHCP");
        } else {
            warn!("Wi-Fi STA static config parse failed; falling back to DHCP");
        }
    }

    (NetConfig::dhcpv4(DhcpConfig::default()), false)
}
