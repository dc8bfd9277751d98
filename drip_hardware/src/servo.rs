//! Hobby-servo line clamp.
//!
//! The servo is driven with a 50 Hz frame; the pulse width encodes the angle
//! linearly from 1000 µs (0°) to 2000 µs (180°). After a move the output can
//! be detached so the horn holds mechanically without jitter.
use std::time::Duration;

use drip_traits::{BoxError, ClampActuator, Clock};
use tracing::{debug, trace};

use crate::error::{HwError, Result};

pub const SERVO_FRAME: Duration = Duration::from_millis(20);
pub const MIN_PULSE_US: u16 = 1000;
pub const MAX_PULSE_US: u16 = 2000;
pub const MAX_ANGLE: u8 = 180;

/// Pulse width for `angle` degrees.
pub fn angle_to_pulse_us(angle: u8) -> Result<u16> {
    if angle > MAX_ANGLE {
        return Err(HwError::AngleOutOfRange(angle));
    }
    let span = u32::from(MAX_PULSE_US - MIN_PULSE_US);
    let us = u32::from(MIN_PULSE_US) + span * u32::from(angle) / u32::from(MAX_ANGLE);
    Ok(us as u16)
}

/// Something that can emit a servo pulse train.
pub trait PulseOutput {
    /// Start (or retarget) a 50 Hz pulse train with the given high time.
    fn set_pulse_us(&mut self, width_us: u16) -> Result<()>;
    /// Stop emitting pulses.
    fn disable(&mut self) -> Result<()>;
}

impl<T: PulseOutput + ?Sized> PulseOutput for Box<T> {
    fn set_pulse_us(&mut self, width_us: u16) -> Result<()> {
        (**self).set_pulse_us(width_us)
    }
    fn disable(&mut self) -> Result<()> {
        (**self).disable()
    }
}

/// Clamp/open positions and the optional graduated motion.
#[derive(Debug, Clone, Copy)]
pub struct ServoPositions {
    pub clamp_angle: u8,
    pub open_angle: u8,
    /// Per-degree delay; zero moves in a single command.
    pub step_delay: Duration,
}

impl Default for ServoPositions {
    fn default() -> Self {
        Self {
            clamp_angle: 90,
            open_angle: 0,
            step_delay: Duration::ZERO,
        }
    }
}

pub struct ServoClamp<P: PulseOutput, C: Clock> {
    out: P,
    clock: C,
    positions: ServoPositions,
    /// Last commanded angle, if any.
    angle: Option<u8>,
    attached: bool,
}

impl<P: PulseOutput, C: Clock> ServoClamp<P, C> {
    pub fn new(out: P, clock: C, positions: ServoPositions) -> Result<Self> {
        angle_to_pulse_us(positions.clamp_angle)?;
        angle_to_pulse_us(positions.open_angle)?;
        Ok(Self {
            out,
            clock,
            positions,
            angle: None,
            attached: false,
        })
    }

    pub fn angle(&self) -> Option<u8> {
        self.angle
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    fn write_angle(&mut self, angle: u8) -> Result<()> {
        let us = angle_to_pulse_us(angle)?;
        self.out.set_pulse_us(us)?;
        self.angle = Some(angle);
        self.attached = true;
        trace!(angle, pulse_us = us, "servo write");
        Ok(())
    }

    /// Move to `target`, one degree at a time when a step delay is configured.
    pub fn move_to(&mut self, target: u8) -> Result<()> {
        let step_delay = self.positions.step_delay;
        match self.angle {
            Some(mut pos) if !step_delay.is_zero() && pos != target => {
                while pos != target {
                    pos = if pos < target { pos + 1 } else { pos - 1 };
                    self.write_angle(pos)?;
                    self.clock.sleep(step_delay);
                }
                Ok(())
            }
            _ => self.write_angle(target),
        }
    }

    pub fn into_inner(self) -> P {
        self.out
    }
}

impl<P: PulseOutput, C: Clock> ClampActuator for ServoClamp<P, C> {
    fn clamp(&mut self) -> std::result::Result<(), BoxError> {
        debug!(angle = self.positions.clamp_angle, "servo clamp");
        self.move_to(self.positions.clamp_angle)?;
        Ok(())
    }

    fn release(&mut self) -> std::result::Result<(), BoxError> {
        debug!(angle = self.positions.open_angle, "servo release");
        self.move_to(self.positions.open_angle)?;
        Ok(())
    }

    fn detach(&mut self) -> std::result::Result<(), BoxError> {
        self.out.disable()?;
        self.attached = false;
        debug!("servo detached");
        Ok(())
    }
}

/// Software PWM on any GPIO line.
#[cfg(feature = "hardware")]
pub struct GpioPulse {
    pin: rppal::gpio::OutputPin,
}

#[cfg(feature = "hardware")]
impl GpioPulse {
    pub fn open(bcm_pin: u8) -> Result<Self> {
        let gpio = rppal::gpio::Gpio::new().map_err(|e| HwError::Gpio(e.to_string()))?;
        let pin = gpio
            .get(bcm_pin)
            .map_err(|e| HwError::Gpio(e.to_string()))?
            .into_output_low();
        Ok(Self { pin })
    }
}

#[cfg(feature = "hardware")]
impl PulseOutput for GpioPulse {
    fn set_pulse_us(&mut self, width_us: u16) -> Result<()> {
        self.pin
            .set_pwm(SERVO_FRAME, Duration::from_micros(u64::from(width_us)))
            .map_err(|e| HwError::Pwm(e.to_string()))
    }

    fn disable(&mut self) -> Result<()> {
        self.pin
            .clear_pwm()
            .map_err(|e| HwError::Pwm(e.to_string()))?;
        self.pin.set_low();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drip_traits::clock::test_clock::TestClock;
    use rstest::rstest;

    #[derive(Default)]
    struct Recorder {
        pulses: Vec<u16>,
        disabled: usize,
    }

    impl PulseOutput for Recorder {
        fn set_pulse_us(&mut self, width_us: u16) -> Result<()> {
            self.pulses.push(width_us);
            Ok(())
        }
        fn disable(&mut self) -> Result<()> {
            self.disabled += 1;
            Ok(())
        }
    }

    #[rstest]
    #[case(0, 1000)]
    #[case(90, 1500)]
    #[case(180, 2000)]
    fn angle_maps_linearly_to_pulse(#[case] angle: u8, #[case] us: u16) {
        assert_eq!(angle_to_pulse_us(angle).unwrap(), us);
    }

    #[test]
    fn angle_above_180_is_rejected() {
        assert!(matches!(
            angle_to_pulse_us(181),
            Err(HwError::AngleOutOfRange(181))
        ));
    }

    #[test]
    fn clamp_release_detach_sequence() {
        let mut servo =
            ServoClamp::new(Recorder::default(), TestClock::new(), ServoPositions::default())
                .unwrap();
        servo.clamp().unwrap();
        assert_eq!(servo.angle(), Some(90));
        servo.release().unwrap();
        servo.detach().unwrap();
        assert!(!servo.is_attached());
        let out = servo.into_inner();
        assert_eq!(out.pulses, vec![1500, 1000]);
        assert_eq!(out.disabled, 1);
    }

    #[test]
    fn smooth_clamp_steps_one_degree_at_a_time() {
        let clock = TestClock::new();
        let epoch = drip_traits::Clock::now(&clock);
        let positions = ServoPositions {
            clamp_angle: 10,
            open_angle: 0,
            step_delay: Duration::from_millis(15),
        };
        let mut servo = ServoClamp::new(Recorder::default(), clock.clone(), positions).unwrap();
        servo.release().unwrap();
        servo.clamp().unwrap();
        // One initial write plus ten single-degree steps.
        assert_eq!(clock.ms_since(epoch), 150);
        let out = servo.into_inner();
        assert_eq!(out.pulses.len(), 11);
        assert_eq!(out.pulses.last().copied(), Some(angle_to_pulse_us(10).unwrap()));
    }

    #[test]
    fn invalid_positions_fail_construction() {
        let positions = ServoPositions {
            clamp_angle: 200,
            ..ServoPositions::default()
        };
        assert!(ServoClamp::new(Recorder::default(), TestClock::new(), positions).is_err());
    }
}
