use std::time::Duration;

use drip_traits::{BoxError, LoadCell};
use rppal::gpio::{Gpio, InputPin, OutputPin};
use tracing::{trace, warn};

use crate::error::{HwError, Result};
use crate::util::{sign_extend_24, wait_until_low_with_timeout};

const DATA_READY_POLL: Duration = Duration::from_micros(200);

/// HX711 24-bit load-cell ADC, bit-banged over two GPIO lines.
pub struct Hx711 {
    dout: InputPin,
    sck: OutputPin,
    gain_pulses: u8, // 25 = channel A gain 128, 26 = B/32, 27 = A/64
    offset_counts: i32,
    scale_g_per_count: f32,
}

impl Hx711 {
    pub fn open(dout_pin: u8, sck_pin: u8) -> Result<Self> {
        let gpio = Gpio::new().map_err(|e| HwError::Gpio(e.to_string()))?;
        let dout = gpio
            .get(dout_pin)
            .map_err(|e| HwError::Gpio(e.to_string()))?
            .into_input();
        let sck = gpio
            .get(sck_pin)
            .map_err(|e| HwError::Gpio(e.to_string()))?
            .into_output_low(); // clock idle low
        Ok(Self {
            dout,
            sck,
            gain_pulses: 25,
            offset_counts: 0,
            scale_g_per_count: 1.0,
        })
    }

    fn pulse(&mut self) {
        self.sck.set_high();
        std::hint::spin_loop();
        self.sck.set_low();
        std::hint::spin_loop();
    }

    pub fn read_with_timeout(&mut self, timeout: Duration) -> Result<i32> {
        let dout = &self.dout;
        wait_until_low_with_timeout(|| dout.is_high(), timeout, DATA_READY_POLL)?;

        let mut value: u32 = 0;
        for _ in 0..24 {
            self.sck.set_high();
            std::hint::spin_loop();
            value = (value << 1) | u32::from(self.dout.is_high());
            self.sck.set_low();
            std::hint::spin_loop();
        }
        // Extra pulses select gain/channel for the next conversion.
        for _ in 0..self.gain_pulses.saturating_sub(24) {
            self.pulse();
        }

        let raw = sign_extend_24(value);
        trace!(raw, "hx711 raw read");
        Ok(raw)
    }
}

impl LoadCell for Hx711 {
    fn is_ready(&mut self) -> bool {
        self.dout.is_low()
    }

    fn read_grams(&mut self, timeout: Duration) -> std::result::Result<f32, BoxError> {
        let raw = self.read_with_timeout(timeout).inspect_err(|e| {
            warn!(error = %e, "hx711 read failed");
        })?;
        Ok(raw.saturating_sub(self.offset_counts) as f32 * self.scale_g_per_count)
    }

    fn read_raw(&mut self, timeout: Duration) -> std::result::Result<i32, BoxError> {
        Ok(self.read_with_timeout(timeout)?)
    }

    fn set_calibration(&mut self, offset_counts: i32, scale_g_per_count: f32) {
        self.offset_counts = offset_counts;
        self.scale_g_per_count = scale_g_per_count;
    }
}
