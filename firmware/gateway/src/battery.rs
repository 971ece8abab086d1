//! Battery/UPS readout over I2C.
//!
//! The UPS hat carries an INA219 at 0x43 (0x40 on older boards). The monitor
//! keeps a cached reading refreshed at most every couple of seconds so the
//! UI header can poll it every tick without hammering the bus, and remembers
//! the last error for the boot self-check report.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex as AsyncMutex;
use embedded_hal_async::i2c::I2c as EhI2c;
use esp_hal::i2c::master::I2c;
use esp_hal::Async;
use heapless::String;
use static_cell::StaticCell;

const REG_CONFIG: u8 = 0x00;
const REG_BUSVOLTAGE: u8 = 0x02;
const REG_CURRENT: u8 = 0x04;
const REG_CALIBRATION: u8 = 0x05;

/// Candidate 7-bit addresses, probed in order.
const ADDRS: [u8; 2] = [0x43, 0x40];

/// 32V/2A calibration, matching the UPS hat's shunt.
const CAL_VALUE: u16 = 4096;

// 32V range, /8 gain (320mV), 12-bit 4-sample averaging on both ADCs,
// continuous shunt+bus conversions.
const CONFIG_VALUE: u16 = (0x01 << 13) | (0x03 << 11) | (0x0A << 7) | (0x0A << 3) | 0x07;

/// Minimum interval between bus transactions when polled from the UI tick.
const READ_INTERVAL_MS: u32 = 2_000;

/// Bus mutex for short, serialized monitor transactions.
type MonitorBus = AsyncMutex<CriticalSectionRawMutex, I2c<'static, Async>>;

#[derive(Debug, Clone, Copy, defmt::Format)]
pub enum BatteryError {
    I2c,
}

#[derive(Clone, Copy, Debug)]
pub struct BatteryReading {
    pub volts: f32,
    pub amps: f32,
    pub percent: u8,
}

/// Minimal INA219 driver over embedded-hal-async I2C.
#[derive(Clone, Copy)]
struct Ina219 {
    addr_7bit: u8,
}

impl Ina219 {
    const fn new(addr_7bit: u8) -> Self {
        Self { addr_7bit }
    }

    async fn read_reg<I2C: EhI2c>(&self, i2c: &mut I2C, reg: u8) -> Result<u16, BatteryError> {
        let mut out = [0u8; 2];
        i2c.write_read(self.addr_7bit, &[reg], &mut out)
            .await
            .map_err(|_| BatteryError::I2c)?;
        Ok(u16::from_be_bytes(out))
    }

    async fn write_reg<I2C: EhI2c>(
        &self,
        i2c: &mut I2C,
        reg: u8,
        value: u16,
    ) -> Result<(), BatteryError> {
        let v = value.to_be_bytes();
        i2c.write(self.addr_7bit, &[reg, v[0], v[1]])
            .await
            .map_err(|_| BatteryError::I2c)
    }

    async fn configure<I2C: EhI2c>(&self, i2c: &mut I2C) -> Result<(), BatteryError> {
        self.write_reg(i2c, REG_CALIBRATION, CAL_VALUE).await?;
        self.write_reg(i2c, REG_CONFIG, CONFIG_VALUE).await
    }

    async fn bus_voltage_v<I2C: EhI2c>(&self, i2c: &mut I2C) -> Result<f32, BatteryError> {
        // First read flushes a possibly-stale conversion.
        let _ = self.read_reg(i2c, REG_BUSVOLTAGE).await?;
        let raw = self.read_reg(i2c, REG_BUSVOLTAGE).await?;
        Ok(f32::from(raw >> 3) * 0.004)
    }

    async fn current_a<I2C: EhI2c>(&self, i2c: &mut I2C) -> Result<f32, BatteryError> {
        let raw = self.read_reg(i2c, REG_CURRENT).await? as i16;
        Ok(f32::from(raw) / 1000.0)
    }
}

static BUS_CELL: StaticCell<MonitorBus> = StaticCell::new();
static BUS: BlockingMutex<CriticalSectionRawMutex, Cell<Option<&'static MonitorBus>>> =
    BlockingMutex::new(Cell::new(None));
static DEVICE: BlockingMutex<CriticalSectionRawMutex, Cell<Option<Ina219>>> =
    BlockingMutex::new(Cell::new(None));
static READING: BlockingMutex<CriticalSectionRawMutex, Cell<Option<BatteryReading>>> =
    BlockingMutex::new(Cell::new(None));
static LAST_ERROR: BlockingMutex<CriticalSectionRawMutex, Cell<Option<&'static str>>> =
    BlockingMutex::new(Cell::new(None));
static LAST_READ_MS: AtomicU32 = AtomicU32::new(0);
static AVAILABLE: AtomicBool = AtomicBool::new(true);

/// Take ownership of the monitor's I2C peripheral, probe the INA219 and
/// take a first reading. Returns false when nothing answers on either
/// address; the gauge then stays blank for this boot.
pub async fn init(i2c: I2c<'static, Async>) -> bool {
    let bus: &'static MonitorBus = BUS_CELL.init(AsyncMutex::new(i2c));
    BUS.lock(|cell| cell.set(Some(bus)));

    for addr in ADDRS {
        let dev = Ina219::new(addr);
        let ok = {
            let mut guard = bus.lock().await;
            dev.configure(&mut *guard).await.is_ok()
        };
        if ok {
            defmt::info!("battery: INA219 found at 0x{:02x}", addr);
            DEVICE.lock(|cell| cell.set(Some(dev)));
            AVAILABLE.store(true, Ordering::Relaxed);
            refresh().await;
            return true;
        }
    }

    defmt::warn!("battery: INA219 not responding (tried 0x43/0x40)");
    AVAILABLE.store(false, Ordering::Relaxed);
    LAST_ERROR.lock(|cell| cell.set(Some("INA219 not responding")));
    false
}

pub fn available() -> bool {
    AVAILABLE.load(Ordering::Relaxed)
}

/// Periodic poll from the tick loop; rate-limited unless forced.
pub async fn tick(force: bool) {
    if !available() {
        return;
    }
    let now = crate::now_ms32();
    if !force && now.wrapping_sub(LAST_READ_MS.load(Ordering::Relaxed)) < READ_INTERVAL_MS {
        return;
    }
    refresh().await;
}

async fn refresh() {
    let Some(dev) = DEVICE.lock(|cell| cell.get()) else {
        return;
    };
    let Some(bus) = BUS.lock(|cell| cell.get()) else {
        return;
    };

    let result = {
        let mut guard = bus.lock().await;
        match (
            dev.bus_voltage_v(&mut *guard).await,
            dev.current_a(&mut *guard).await,
        ) {
            (Ok(volts), Ok(amps)) => Ok((volts, amps)),
            _ => Err(BatteryError::I2c),
        }
    };

    match result {
        Ok((volts, amps)) => {
            // Linear 3.0-4.2V estimate; good enough for a header gauge.
            let percent = ((volts - 3.0) / 1.2 * 100.0).clamp(0.0, 100.0) as u8;
            READING.lock(|cell| {
                cell.set(Some(BatteryReading {
                    volts,
                    amps,
                    percent,
                }))
            });
            LAST_ERROR.lock(|cell| cell.set(None));
            LAST_READ_MS.store(crate::now_ms32(), Ordering::Relaxed);
        }
        Err(_) => {
            defmt::warn!("battery: INA219 read failed");
            LAST_ERROR.lock(|cell| cell.set(Some("INA219 read failed")));
        }
    }
}

/// Last successful reading, if any.
pub fn last_reading() -> Option<BatteryReading> {
    READING.lock(|cell| cell.get())
}

pub fn last_error() -> Option<&'static str> {
    LAST_ERROR.lock(|cell| cell.get())
}

/// Header gauge text, e.g. `87%`; empty when no UPS is present.
pub fn gauge_text() -> String<8> {
    let mut out: String<8> = String::new();
    if let Some(reading) = last_reading() {
        let _ = core::fmt::write(&mut out, format_args!("{}%", reading.percent));
    }
    out
}
