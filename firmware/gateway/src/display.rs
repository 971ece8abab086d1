//! Display output behind an explicit two-variant interface: a real ST7789
//! panel or a no-op headless screen, chosen once at startup. Everything
//! above this module draws into the shared framebuffer and calls
//! `present()`; nobody probes driver capabilities after boot.

use defmt::*;
use embassy_time::Delay;
use embedded_hal_bus::spi::ExclusiveDevice;
use esp_hal::gpio::Output;
use esp_hal::spi::master::Spi;
use esp_hal::Async;
use lcd_async::{
    interface::SpiInterface,
    models::ST7789,
    options::{ColorInversion, ColorOrder, Orientation},
    Builder,
};

pub const DISPLAY_WIDTH: usize = 240;
pub const DISPLAY_HEIGHT: usize = 240;
pub const FRAMEBUFFER_LEN: usize = DISPLAY_WIDTH * DISPLAY_HEIGHT * 2;

// The panel is the only device on this SPI bus.
type PanelSpi = ExclusiveDevice<Spi<'static, Async>, Output<'static>, Delay>;
type PanelDisplay =
    lcd_async::Display<SpiInterface<PanelSpi, Output<'static>>, ST7789, Output<'static>>;

#[derive(Debug, defmt::Format)]
pub struct DisplayInitError;

/// The selected display variant.
pub struct Screen {
    panel: Option<PanelDisplay>,
}

impl Screen {
    /// The no-op variant: every present() is discarded.
    pub fn headless() -> Self {
        Self { panel: None }
    }

    /// Bring up the real panel. Failure here is how a missing display is
    /// detected; the caller falls back to [`Screen::headless`].
    pub async fn init(
        spi: Spi<'static, Async>,
        cs: Output<'static>,
        dc: Output<'static>,
        rst: Output<'static>,
    ) -> Result<Self, DisplayInitError> {
        let spi_device = ExclusiveDevice::new(spi, cs, Delay).map_err(|_| DisplayInitError)?;
        let interface = SpiInterface::new(spi_device, dc);

        match Builder::new(ST7789, interface)
            .display_size(DISPLAY_WIDTH as u16, DISPLAY_HEIGHT as u16)
            .invert_colors(ColorInversion::Inverted)
            .color_order(ColorOrder::Rgb)
            .orientation(Orientation::new())
            .reset_pin(rst)
            .init(&mut Delay)
            .await
        {
            Ok(display) => Ok(Self {
                panel: Some(display),
            }),
            Err(_) => Err(DisplayInitError),
        }
    }

    pub fn is_headless(&self) -> bool {
        self.panel.is_none()
    }

    /// Push one full RGB565 frame; a no-op when headless.
    pub async fn present(&mut self, frame: &[u8]) {
        let Some(panel) = self.panel.as_mut() else {
            return;
        };
        if panel
            .show_raw_data(
                0,
                0,
                DISPLAY_WIDTH as u16,
                DISPLAY_HEIGHT as u16,
                frame,
            )
            .await
            .is_err()
        {
            warn!("display: frame push failed");
        }
    }
}
