use crate::error::{Error, Result};

/// Hardware output taking a duty fraction in `0.0..=1.0`.
pub trait DutyDriver: Send {
    fn set_duty(&mut self, fraction: f64) -> Result<()>;
}

impl<D: DutyDriver + ?Sized> DutyDriver for Box<D> {
    fn set_duty(&mut self, fraction: f64) -> Result<()> {
        (**self).set_duty(fraction)
    }
}

/// Maps duty fractions onto a fixed number of hardware steps and reports only changes.
#[derive(Debug, Clone)]
pub struct DutyQuantizer {
    precision: u32,
    last_step: Option<u32>,
}

impl DutyQuantizer {
    pub fn new(precision: u32) -> Self {
        Self {
            precision: precision.max(2),
            last_step: None,
        }
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    /// Step count for `fraction`, rounded down to an even step. `None` when unchanged.
    pub fn step(&mut self, fraction: f64) -> Option<u32> {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let step = ((fraction * f64::from(self.precision)) as u32 / 2) * 2;
        if self.last_step == Some(step) {
            return None;
        }
        self.last_step = Some(step);
        Some(step)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightState {
    pub is_on: bool,
    pub brightness: f64,
}

/// Owns gain and floor and forwards to the duty driver only when the output changes.
pub struct BrightnessController<D> {
    driver: D,
    gain: f64,
    floor: f64,
    level: f64,
    last_output: Option<f64>,
}

impl<D: DutyDriver> BrightnessController<D> {
    pub fn new(driver: D, gain: f64, floor: f64) -> Result<Self> {
        Ok(Self {
            driver,
            gain: validate_fraction(gain)?,
            floor: validate_fraction(floor)?,
            level: 0.0,
            last_output: None,
        })
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn floor(&self) -> f64 {
        self.floor
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Output duty for a logical level: zero stays dark, anything above starts at the floor
    /// and reaches `gain` at full level.
    pub fn output_for(&self, level: f64) -> f64 {
        if level <= 0.0 {
            return 0.0;
        }
        let floor = self.floor.min(1.0);
        self.gain * (floor + (1.0 - floor) * level.min(1.0))
    }

    /// Applies a logical level. Returns whether the driver was called.
    pub fn apply(&mut self, level: f64) -> Result<bool> {
        if !level.is_finite() {
            return Err(Error::InvalidBrightness(level));
        }
        self.level = level.clamp(0.0, 1.0);
        self.write_output()
    }

    pub fn set_gain(&mut self, gain: f64) -> Result<bool> {
        self.gain = validate_fraction(gain)?;
        self.write_output()
    }

    pub fn set_floor(&mut self, floor: f64) -> Result<bool> {
        self.floor = validate_fraction(floor)?;
        self.write_output()
    }

    fn write_output(&mut self) -> Result<bool> {
        let output = self.output_for(self.level);
        if let Some(last) = self.last_output {
            if (last - output).abs() < f64::EPSILON {
                return Ok(false);
            }
        }
        self.driver.set_duty(output)?;
        self.last_output = Some(output);
        Ok(true)
    }
}

pub fn validate_fraction(value: f64) -> Result<f64> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(Error::InvalidBrightness(value))
    }
}
