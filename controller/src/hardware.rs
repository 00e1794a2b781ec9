use std::path::{Path, PathBuf};

use tracing::{debug, info};

use sunrise_common::{
    config::{ButtonHardwareConfig, LightHardwareConfig},
    DutyDriver, DutyQuantizer, Error, InputSampler, Result, RuntimeConfig,
};

const PWM_ROOT: &str = "/sys/class/pwm";
const GPIO_ROOT: &str = "/sys/class/gpio";

/// Opens the actuator and the button. Any failure here is fatal for the process.
pub fn open(config: &RuntimeConfig) -> Result<(Box<dyn DutyDriver>, Box<dyn InputSampler>)> {
    config.validate_hardware()?;

    if config.mock {
        info!("mock hardware: duty writes are logged, button never pressed");
        return Ok((Box::new(LoggingDuty::default()), Box::new(IdleButton)));
    }

    let light = SysfsPwm::open(&config.light)?;
    let button = SysfsButton::open(&config.button)?;
    Ok((Box::new(light), Box::new(button)))
}

fn write_attribute(path: &Path, value: &str) -> Result<()> {
    std::fs::write(path, value).map_err(|err| {
        Error::HardwareFault(format!("write {value:?} to {}: {err}", path.display()))
    })
}

fn read_attribute(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|raw| raw.trim().to_string())
        .map_err(|err| Error::HardwareFault(format!("read {}: {err}", path.display())))
}

/// Hardware PWM channel driven through the kernel's sysfs interface.
pub struct SysfsPwm {
    duty_cycle: PathBuf,
    period_ns: u64,
    quantizer: DutyQuantizer,
}

impl SysfsPwm {
    pub fn open(config: &LightHardwareConfig) -> Result<Self> {
        let chip = config
            .pwm_chip
            .ok_or_else(|| Error::HardwareFault("light pwm_chip unspecified".to_string()))?;
        let chip_dir = PathBuf::from(format!("{PWM_ROOT}/pwmchip{chip}"));
        let channel_dir = chip_dir.join(format!("pwm{}", config.pwm_channel));

        if !channel_dir.exists() {
            write_attribute(&chip_dir.join("export"), &config.pwm_channel.to_string())?;
        }

        let period_ns = config.period_ns();
        let duty_cycle = channel_dir.join("duty_cycle");
        // The kernel rejects a period shorter than the current duty cycle.
        write_attribute(&duty_cycle, "0")?;
        write_attribute(&channel_dir.join("period"), &period_ns.to_string())?;
        write_attribute(&channel_dir.join("enable"), "1")?;

        info!(
            chip,
            channel = config.pwm_channel,
            frequency_hz = config.frequency_hz,
            precision = config.precision,
            "pwm channel ready"
        );

        Ok(Self {
            duty_cycle,
            period_ns,
            quantizer: DutyQuantizer::new(config.precision),
        })
    }
}

impl DutyDriver for SysfsPwm {
    fn set_duty(&mut self, fraction: f64) -> Result<()> {
        let Some(step) = self.quantizer.step(fraction) else {
            return Ok(());
        };
        let duty_ns = self.period_ns * u64::from(step) / u64::from(self.quantizer.precision());
        debug!(fraction, step, duty_ns, "pwm duty");
        write_attribute(&self.duty_cycle, &duty_ns.to_string())
    }
}

impl Drop for SysfsPwm {
    fn drop(&mut self) {
        let _ = std::fs::write(&self.duty_cycle, "0");
    }
}

/// GPIO input read through sysfs. Edges are derived from consecutive reads.
pub struct SysfsButton {
    value: PathBuf,
    active_low: bool,
    last_pressed: bool,
    edge: bool,
}

impl SysfsButton {
    pub fn open(config: &ButtonHardwareConfig) -> Result<Self> {
        let gpio = config
            .gpio
            .ok_or_else(|| Error::HardwareFault("button gpio unspecified".to_string()))?;
        let pin_dir = PathBuf::from(format!("{GPIO_ROOT}/gpio{gpio}"));

        if !pin_dir.exists() {
            write_attribute(&PathBuf::from(GPIO_ROOT).join("export"), &gpio.to_string())?;
        }
        write_attribute(&pin_dir.join("direction"), "in")?;

        let mut button = Self {
            value: pin_dir.join("value"),
            active_low: config.active_low,
            last_pressed: false,
            edge: false,
        };
        button.last_pressed = button.read_level()?;
        info!(gpio, active_low = config.active_low, "button ready");
        Ok(button)
    }

    fn read_level(&self) -> Result<bool> {
        let raw = read_attribute(&self.value)?;
        let high = match raw.as_str() {
            "1" => true,
            "0" => false,
            other => {
                return Err(Error::HardwareFault(format!(
                    "unexpected gpio value {other:?} in {}",
                    self.value.display()
                )))
            }
        };
        Ok(high != self.active_low)
    }
}

impl InputSampler for SysfsButton {
    fn is_pressed(&mut self) -> Result<bool> {
        let pressed = self.read_level()?;
        if pressed && !self.last_pressed {
            self.edge = true;
        }
        self.last_pressed = pressed;
        Ok(pressed)
    }

    fn take_edge(&mut self) -> bool {
        std::mem::take(&mut self.edge)
    }
}

/// Stand-in actuator for mock mode.
#[derive(Debug, Default)]
pub struct LoggingDuty {
    last: Option<f64>,
}

impl DutyDriver for LoggingDuty {
    fn set_duty(&mut self, fraction: f64) -> Result<()> {
        if self.last != Some(fraction) {
            info!(fraction, "mock duty");
            self.last = Some(fraction);
        }
        Ok(())
    }
}

/// Stand-in button for mock mode.
#[derive(Debug, Default)]
pub struct IdleButton;

impl InputSampler for IdleButton {
    fn is_pressed(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn take_edge(&mut self) -> bool {
        false
    }
}
