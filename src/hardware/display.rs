//! SH1106 OLED front panel for the target-weight knob
//! Using embedded-graphics for rendering

use crate::automation::controls::{ControlValue, MachineShadow};
use crate::automation::ControlHandler;
use crate::system::events::Notifier;
use crate::types::{LinkStatus, DEFAULT_TARGET_WEIGHT};
use embedded_graphics::{
    mono_font::{ascii::FONT_10X20, ascii::FONT_6X10, MonoTextStyle},
    pixelcolor::BinaryColor,
    prelude::*,
    primitives::{Polyline, PrimitiveStyle},
    text::{Baseline, Text},
};
use log::{debug, info};
use sh1106::Builder;
use std::sync::Mutex;

/// What the panel shows.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayState {
    pub target_weight: i8,
    pub link: LinkStatus,
    pub confirmed: bool,
    pub machine: String,
}

impl Default for DisplayState {
    fn default() -> Self {
        Self {
            target_weight: DEFAULT_TARGET_WEIGHT,
            link: LinkStatus::Disconnected,
            confirmed: false,
            machine: String::from("--"),
        }
    }
}

impl DisplayState {
    pub fn value_text(&self) -> String {
        format!("{}g", self.target_weight)
    }

    pub fn link_text(&self) -> &'static str {
        match self.link {
            LinkStatus::Disconnected => "BLE: idle",
            LinkStatus::Connecting => "BLE: ...",
            LinkStatus::Connected => "BLE: linked",
            LinkStatus::Failed => "BLE: failed",
        }
    }
}

/// Collects notifications from every thread; the UI thread redraws from it.
pub struct DisplaySink {
    inner: Mutex<(DisplayState, bool)>,
}

impl Default for DisplaySink {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplaySink {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((DisplayState::default(), true)),
        }
    }

    fn update(&self, f: impl FnOnce(&mut DisplayState)) {
        if let Ok(mut guard) = self.inner.lock() {
            let before = guard.0.clone();
            f(&mut guard.0);
            if guard.0 != before {
                guard.1 = true;
            }
        }
    }

    /// Current state if anything changed since the last call.
    pub fn take_dirty(&self) -> Option<DisplayState> {
        let mut guard = self.inner.lock().ok()?;
        if !guard.1 {
            return None;
        }
        guard.1 = false;
        Some(guard.0.clone())
    }
}

impl Notifier for DisplaySink {
    fn on_value_changed(&self, value: i8) {
        self.update(|s| s.target_weight = value);
    }

    fn on_link_status_changed(&self, status: LinkStatus) {
        self.update(|s| s.link = status);
    }

    fn on_value_confirmed(&self, value: i8) {
        self.update(|s| {
            s.target_weight = value;
            s.confirmed = true;
        });
    }

    fn on_confirmation_cleared(&self) {
        self.update(|s| s.confirmed = false);
    }
}

impl ControlHandler for DisplaySink {
    fn on_command(&self, _value: ControlValue) {}

    fn on_shadow_changed(&self, shadow: &MachineShadow) {
        let line = shadow.summary();
        self.update(|s| s.machine = line);
    }
}

pub struct DisplayController<I2C>
where
    I2C: embedded_hal::blocking::i2c::Write + embedded_hal::blocking::i2c::WriteRead,
{
    display: sh1106::mode::GraphicsMode<sh1106::interface::I2cInterface<I2C>>,
}

impl<I2C> DisplayController<I2C>
where
    I2C: embedded_hal::blocking::i2c::Write + embedded_hal::blocking::i2c::WriteRead,
    <I2C as embedded_hal::blocking::i2c::Write>::Error: std::fmt::Debug,
    <I2C as embedded_hal::blocking::i2c::WriteRead>::Error: std::fmt::Debug,
{
    pub fn new(i2c: I2C) -> Result<Self, Box<dyn std::error::Error>> {
        info!("Initializing SH1106 OLED display");

        let mut display: sh1106::mode::GraphicsMode<_> = Builder::new().connect_i2c(i2c).into();

        display
            .init()
            .map_err(|e| format!("Display init failed: {:?}", e))?;
        display.clear();
        display
            .flush()
            .map_err(|e| format!("Display flush failed: {:?}", e))?;

        info!("✅ SH1106 display initialized");
        Ok(Self { display })
    }

    pub fn render(&mut self, state: &DisplayState) -> Result<(), Box<dyn std::error::Error>> {
        debug!("Redrawing panel: {:?}", state);
        self.display.clear();

        let value_style = MonoTextStyle::new(&FONT_10X20, BinaryColor::On);
        let text_style = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);

        Text::with_baseline(&state.value_text(), Point::new(0, 4), value_style, Baseline::Top)
            .draw(&mut self.display)
            .map_err(|e| format!("Display draw error: {:?}", e))?;

        if state.confirmed {
            Polyline::new(&[Point::new(108, 14), Point::new(113, 19), Point::new(123, 7)])
                .into_styled(PrimitiveStyle::with_stroke(BinaryColor::On, 2))
                .draw(&mut self.display)
                .map_err(|e| format!("Display draw error: {:?}", e))?;
        }

        Text::with_baseline(state.link_text(), Point::new(0, 32), text_style, Baseline::Top)
            .draw(&mut self.display)
            .map_err(|e| format!("Display draw error: {:?}", e))?;

        Text::with_baseline(&state.machine, Point::new(0, 48), text_style, Baseline::Top)
            .draw(&mut self.display)
            .map_err(|e| format!("Display draw error: {:?}", e))?;

        self.display
            .flush()
            .map_err(|e| format!("Display flush failed: {:?}", e))?;
        Ok(())
    }
}

#[cfg(target_os = "espidf")]
pub fn create_display_controller(
    i2c: esp_idf_svc::hal::i2c::I2C0,
    sda: esp_idf_svc::hal::gpio::AnyIOPin,
    scl: esp_idf_svc::hal::gpio::AnyIOPin,
) -> Result<DisplayController<esp_idf_svc::hal::i2c::I2cDriver<'static>>, Box<dyn std::error::Error>> {
    use esp_idf_svc::hal::i2c::{I2cConfig, I2cDriver};
    use esp_idf_svc::hal::prelude::*;

    info!("Setting up I2C for SH1106 display");
    let config = I2cConfig::new().baudrate(400.kHz().into());
    let i2c = I2cDriver::new(i2c, sda, scl, &config)?;
    DisplayController::new(i2c)
}
