#![no_std]
#![no_main]

// Heap allocations (String, Vec) back the Wi-Fi stack and HTTP bodies.
extern crate alloc;

use defmt::*;
use embassy_executor::Spawner;
use embassy_time::{Duration, Instant, Timer};
use embedded_graphics::pixelcolor::Rgb565;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::spi::Mode;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::uart::{Config as UartConfig, Uart};
use esp_hal::{self as hal};
use heapless::String as HString;
use lcd_async::raw_framebuf::RawFrameBuf;
use static_cell::StaticCell;
use {esp_backtrace as _, esp_println as _}; // panic handler + defmt logger over espflash

mod battery;
mod buttons;
mod cancel;
mod cmd_server;
mod dhcp;
mod display;
mod dns;
mod http;
mod mdns;
mod net;
mod rs485;
mod services;
mod ui;

use buttons::{Buttons, Key};
use cancel::CancelToken;
use display::{Screen, DISPLAY_HEIGHT, DISPLAY_WIDTH, FRAMEBUFFER_LEN};

esp_bootloader_esp_idf::esp_app_desc!();

/// Firmware version string baked in at build time.
pub const FW_VERSION: &str = env!("MODGATE_FW_VERSION");

// Network identity injected by build.rs (environment or repo-root .env).
pub const AP_SSID: &str = env!("MODGATE_AP_SSID");
pub const AP_PSK: &str = env!("MODGATE_AP_PSK");
pub const HOSTNAME: &str = env!("MODGATE_HOSTNAME");
pub const STA_SSID: Option<&str> = option_env!("MODGATE_STA_SSID");
pub const STA_PSK: Option<&str> = option_env!("MODGATE_STA_PSK");
pub const STA_STATIC_IP: Option<&str> = option_env!("MODGATE_STA_STATIC_IP");
pub const STA_NETMASK: Option<&str> = option_env!("MODGATE_STA_NETMASK");
pub const STA_GATEWAY: Option<&str> = option_env!("MODGATE_STA_GATEWAY");
pub const STA_DNS: Option<&str> = option_env!("MODGATE_STA_DNS");

/// Tick quantum: short while a panel is attached so keys feel immediate,
/// relaxed in headless mode where only network services matter.
const TICK_INTERACTIVE: Duration = Duration::from_millis(15);
const TICK_HEADLESS: Duration = Duration::from_millis(200);

/// A+B held this long reboots the device.
const REBOOT_HOLD_MS: u64 = 2_000;

#[repr(align(32))]
struct Align32<T>(T);

static FRAMEBUFFER: StaticCell<Align32<[u8; FRAMEBUFFER_LEN]>> = StaticCell::new();

static DNS_CANCEL: CancelToken = CancelToken::new();
static DHCP_CANCEL: CancelToken = CancelToken::new();
static MDNS_CANCEL: CancelToken = CancelToken::new();

/// Wrapping millisecond clock for rate limiting and caches.
pub fn now_ms32() -> u32 {
    Instant::now().as_millis() as u32
}

#[esp_rtos::main]
async fn main(spawner: Spawner) {
    let peripherals = hal::init(hal::Config::default());

    // Reserve reclaimed bootloader RAM as heap for Wi-Fi + HTTP allocations.
    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 64 * 1024);

    // The preemptive scheduler backing esp-radio + embassy-net must run
    // before any network task is spawned.
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("ModGate firmware version: {}", FW_VERSION);
    info!(
        "identity: hostname={}.local ap_ssid=\"{}\"",
        HOSTNAME, AP_SSID
    );

    // Status LED, shared with the dispatcher's LED verb.
    services::install_led(Output::new(
        peripherals.GPIO21,
        Level::Low,
        OutputConfig::default(),
    ));

    // I2C0 (GPIO8=SDA, GPIO9=SCL): battery monitor on the UPS hat.
    let i2c = I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_khz(400)),
    )
    .expect("i2c0 init")
    .with_sda(peripherals.GPIO8)
    .with_scl(peripherals.GPIO9)
    .into_async();
    let battery_ok = battery::init(i2c).await;

    // RS-485 channels: CH0 on UART1 (GPIO17/18), CH1 on UART2 (GPIO12/13).
    let uart_cfg = UartConfig::default().with_baudrate(rs485::BAUD);
    let rs485_err = {
        let ch0 = Uart::new(peripherals.UART1, uart_cfg.clone())
            .map(|u| u.with_tx(peripherals.GPIO17).with_rx(peripherals.GPIO18));
        let ch1 = Uart::new(peripherals.UART2, uart_cfg)
            .map(|u| u.with_tx(peripherals.GPIO12).with_rx(peripherals.GPIO13));
        match (ch0, ch1) {
            (Ok(ch0), Ok(ch1)) => {
                rs485::install(ch0, ch1);
                info!("RS485 CH0/CH1 init ok");
                None
            }
            _ => Some("RS485 init failed"),
        }
    };

    // Display on SPI2; init failure drops to the headless screen variant.
    let _backlight = Output::new(peripherals.GPIO15, Level::High, OutputConfig::default());
    let mut screen = if cfg!(feature = "headless") {
        Screen::headless()
    } else {
        let spi = Spi::new(
            peripherals.SPI2,
            SpiConfig::default()
                .with_frequency(Rate::from_mhz(40))
                .with_mode(Mode::_0),
        )
        .expect("spi init")
        .with_sck(peripherals.GPIO5)
        .with_mosi(peripherals.GPIO7)
        .into_async();
        let cs = Output::new(peripherals.GPIO16, Level::High, OutputConfig::default());
        let dc = Output::new(peripherals.GPIO10, Level::High, OutputConfig::default());
        let rst = Output::new(peripherals.GPIO6, Level::High, OutputConfig::default());
        match Screen::init(spi, cs, dc, rst).await {
            Ok(screen) => screen,
            Err(err) => {
                warn!("display init failed; running headless: {:?}", err);
                Screen::headless()
            }
        }
    };
    let headless = screen.is_headless();
    if headless {
        info!("display not available; UI disabled (headless mode)");
    }

    // Front-panel keys, active low.
    let in_cfg = InputConfig::default().with_pull(Pull::Up);
    let mut buttons = Buttons::new(
        Input::new(peripherals.GPIO1, in_cfg),
        Input::new(peripherals.GPIO2, in_cfg),
        Input::new(peripherals.GPIO3, in_cfg),
        Input::new(peripherals.GPIO4, in_cfg),
        Input::new(peripherals.GPIO38, in_cfg),
        Input::new(peripherals.GPIO39, in_cfg),
        Input::new(peripherals.GPIO40, in_cfg),
        Input::new(peripherals.GPIO41, in_cfg),
        Input::new(peripherals.GPIO42, in_cfg),
    );

    // One-time self-check before the loop starts; the only fatal path.
    run_system_checks(headless, battery_ok, rs485_err).await;

    // Network bring-up: Wi-Fi manager, then one listener per interface for
    // the TCP and HTTP services, plus the three UDP responders.
    if let Some(stacks) = net::start(&spawner, peripherals.WIFI) {
        spawner
            .spawn(cmd_server::cmd_server_task(stacks.ap, "ap"))
            .expect("cmd ap spawn");
        spawner
            .spawn(cmd_server::cmd_server_task(stacks.sta, "sta"))
            .expect("cmd sta spawn");
        spawner
            .spawn(http::http_server_task(stacks.ap, "ap"))
            .expect("http ap spawn");
        spawner
            .spawn(http::http_server_task(stacks.sta, "sta"))
            .expect("http sta spawn");
        spawner
            .spawn(dns::captive_dns_task(stacks.ap, &DNS_CANCEL))
            .expect("dns spawn");
        spawner
            .spawn(dhcp::dhcp_server_task(stacks.ap, &DHCP_CANCEL))
            .expect("dhcp spawn");
        spawner
            .spawn(mdns::mdns_task(stacks.sta, &MDNS_CANCEL))
            .expect("mdns spawn");
    }

    let framebuffer = FRAMEBUFFER.init(Align32([0u8; FRAMEBUFFER_LEN]));

    battery::tick(true).await;
    let mut ui = ui::UiModel::new();
    let mut last_gauge: HString<8> = battery::gauge_text();
    let mut dirty = true;
    let tick = if headless {
        TICK_HEADLESS
    } else {
        TICK_INTERACTIVE
    };

    info!("entering supervisor loop (tick={}ms)", tick.as_millis());

    // The tick supervisor: buttons -> UI state machine -> battery gauge ->
    // reboot chord, then sleep one quantum. Network services run on their
    // own tasks and never block this loop.
    loop {
        battery::tick(false).await;
        let gauge = battery::gauge_text();
        if gauge != last_gauge {
            last_gauge = gauge;
            dirty = true;
        }

        if reboot_chord_held(&buttons).await {
            info!("A+B held; rebooting");
            ui.notice = Some("Rebooting...");
            present(&mut screen, &mut framebuffer.0, &ui).await;
            Timer::after(Duration::from_millis(300)).await;
            esp_hal::system::software_reset();
        }

        if !headless {
            if let Some(key) = buttons.scan() {
                let accepted = if key == Key::Ctrl && ui.page == ui::Page::Connect {
                    buttons.hold_gate()
                } else {
                    buttons.debounce()
                };
                if accepted {
                    buttons.wait_release(key).await;
                    match ui.handle_key(key) {
                        ui::Action::Scan => {
                            present(&mut screen, &mut framebuffer.0, &ui).await;
                            ui.scan_done(net::scan().await);
                        }
                        ui::Action::Connect => {
                            present(&mut screen, &mut framebuffer.0, &ui).await;
                            let ssid: HString<32> = ui.connect_ssid.clone();
                            let psk: HString<64> = ui.psk.clone();
                            let ok = net::connect(ssid.as_str(), psk.as_str()).await;
                            ui.connect_done(ok);
                        }
                        ui::Action::Redraw | ui::Action::None => {}
                    }
                    dirty = true;
                }
            }

            if dirty {
                present(&mut screen, &mut framebuffer.0, &ui).await;
                dirty = false;
            }
        }

        Timer::after(tick).await;
    }
}

async fn present(screen: &mut Screen, framebuffer: &mut [u8; FRAMEBUFFER_LEN], ui: &ui::UiModel) {
    if screen.is_headless() {
        return;
    }
    {
        let mut frame =
            RawFrameBuf::<Rgb565, _>::new(&mut framebuffer[..], DISPLAY_WIDTH, DISPLAY_HEIGHT);
        ui::render(&mut frame, ui);
    }
    screen.present(&framebuffer[..]).await;
}

/// A+B held for the reboot window. Returns quickly when the chord is not
/// (or no longer) down.
async fn reboot_chord_held(buttons: &Buttons) -> bool {
    if !(buttons.pressed(Key::A) && buttons.pressed(Key::B)) {
        return false;
    }
    let t0 = Instant::now();
    while buttons.pressed(Key::A) && buttons.pressed(Key::B) {
        if Instant::now().duration_since(t0) >= Duration::from_millis(REBOOT_HOLD_MS) {
            return true;
        }
        Timer::after(Duration::from_millis(20)).await;
    }
    false
}

/// Boot-time module checks, mirroring what a field unit needs to be usable:
/// battery telemetry and the RS-485 channels must answer; a missing display
/// only forces headless mode. Failures halt with the blink pattern so a
/// wedged unit is visibly dead rather than half-alive.
async fn run_system_checks(headless: bool, battery_ok: bool, rs485_err: Option<&'static str>) {
    info!("=== system checks ===");
    let mut failure: Option<&'static str> = None;

    if headless {
        info!("display: absent or disabled (headless mode)");
    } else {
        info!("display: ready");
    }

    if battery_ok {
        if let Some(reading) = battery::last_reading() {
            info!(
                "UPS/INA219 ok: {}V, {}A, ~{}%",
                reading.volts, reading.amps, reading.percent
            );
        }
    } else {
        warn!("UPS/INA219 not available: {}", battery::last_error().unwrap_or("unknown"));
        failure = Some("battery monitor missing");
    }

    match rs485_err {
        None => {}
        Some(err) => {
            warn!("{}", err);
            failure = Some(err);
        }
    }

    if let Some(reason) = failure {
        fail_halt(reason).await;
    }
}

/// Terminal blink loop for a failed self-check.
async fn fail_halt(reason: &'static str) -> ! {
    error!("FATAL: {}", reason);
    loop {
        services::set_led(true);
        Timer::after(Duration::from_millis(250)).await;
        services::set_led(false);
        Timer::after(Duration::from_millis(250)).await;
    }
}
