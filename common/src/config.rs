use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    schedule::WeeklySchedule,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampSettings {
    pub wake_up_length_minutes: u32,
    pub gain: f64,
    pub floor: f64,
}

impl Default for RampSettings {
    fn default() -> Self {
        Self {
            wake_up_length_minutes: 60,
            gain: 0.25,
            floor: 0.02,
        }
    }
}

impl RampSettings {
    pub fn wake_up_length(&self) -> Duration {
        Duration::minutes(i64::from(self.wake_up_length_minutes))
    }

    pub fn sanitize(&mut self) {
        self.wake_up_length_minutes = self.wake_up_length_minutes.clamp(1, 24 * 60);
        self.gain = sanitize_fraction(self.gain, 0.25);
        self.floor = sanitize_fraction(self.floor, 0.02);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureConfig {
    pub sample_hz: u32,
    pub debounce_samples: u32,
    pub long_press_samples: u32,
    pub min_spacing_ms: u64,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            sample_hz: 60,
            debounce_samples: 4,
            long_press_samples: 5 * 60,
            min_spacing_ms: 250,
        }
    }
}

impl GestureConfig {
    pub fn sample_period(&self) -> std::time::Duration {
        std::time::Duration::from_micros(1_000_000 / u64::from(self.sample_hz.max(1)))
    }

    pub fn sanitize(&mut self) {
        self.sample_hz = self.sample_hz.clamp(10, 1_000);
        self.debounce_samples = self.debounce_samples.max(1);
        self.long_press_samples = self.long_press_samples.max(self.debounce_samples + 1);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightHardwareConfig {
    pub pwm_chip: Option<u32>,
    pub pwm_channel: u32,
    pub frequency_hz: u32,
    pub precision: u32,
}

impl Default for LightHardwareConfig {
    fn default() -> Self {
        Self {
            pwm_chip: None,
            pwm_channel: 0,
            // The Pi goes down to ~4.7kHz and the dimmer tops out at 10kHz.
            frequency_hz: 10_000,
            precision: 128,
        }
    }
}

impl LightHardwareConfig {
    pub fn period_ns(&self) -> u64 {
        1_000_000_000 / u64::from(self.frequency_hz.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ButtonHardwareConfig {
    pub gpio: Option<u32>,
    pub active_low: bool,
}

impl Default for ButtonHardwareConfig {
    fn default() -> Self {
        Self {
            gpio: None,
            active_low: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub device_id: String,
    pub client_id: String,
    pub base_topic: String,
    pub retained_settle_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 1883,
            user: String::new(),
            pass: String::new(),
            device_id: "sunrise".to_string(),
            client_id: "sunrise".to_string(),
            base_topic: "homie".to_string(),
            retained_settle_ms: 1_500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub mock: bool,
    pub log_level: String,
    pub timezone: String,
    pub light: LightHardwareConfig,
    pub button: ButtonHardwareConfig,
    pub ramp: RampSettings,
    pub gesture: GestureConfig,
    pub rest: RestConfig,
    pub mqtt: MqttConfig,
    pub schedule: WeeklySchedule,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mock: false,
            log_level: "info".to_string(),
            timezone: "UTC".to_string(),
            light: LightHardwareConfig::default(),
            button: ButtonHardwareConfig::default(),
            ramp: RampSettings::default(),
            gesture: GestureConfig::default(),
            rest: RestConfig::default(),
            mqtt: MqttConfig::default(),
            schedule: WeeklySchedule::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(raw: &[u8]) -> serde_json::Result<Self> {
        let mut config: Self = serde_json::from_slice(raw)?;
        config.sanitize();
        Ok(config)
    }

    pub fn sanitize(&mut self) {
        self.ramp.sanitize();
        self.gesture.sanitize();
        self.light.precision = self.light.precision.max(2);

        if self.mqtt.device_id.trim().is_empty() {
            self.mqtt.device_id = "sunrise".to_string();
        }
        if self.mqtt.client_id.trim().is_empty() {
            self.mqtt.client_id = "sunrise".to_string();
        }
    }

    /// Real hardware needs both pins; mock mode needs neither.
    pub fn validate_hardware(&self) -> Result<()> {
        if self.mock {
            return Ok(());
        }
        if self.light.pwm_chip.is_none() || self.button.gpio.is_none() {
            return Err(Error::HardwareFault(
                "light pwm_chip or button gpio unspecified".to_string(),
            ));
        }
        Ok(())
    }
}

fn sanitize_fraction(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::DayOfWeek;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let config = RuntimeConfig::from_json(
            br#"{ "mock": true, "mqtt": { "host": "broker.lan" }, "ramp": { "gain": 3.0 } }"#,
        )
        .unwrap();

        assert!(config.mock);
        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.device_id, "sunrise");
        assert_eq!(config.ramp.gain, 1.0);
        assert_eq!(config.ramp.wake_up_length(), Duration::hours(1));
        assert_eq!(config.gesture, GestureConfig::default());
    }

    #[test]
    fn schedule_loads_from_config() {
        let mut days = vec![serde_json::json!({ "enabled": false, "time": "07:00" }); 7];
        days[1] = serde_json::json!({ "enabled": true, "time": "06:15" });
        let raw = serde_json::to_vec(&serde_json::json!({ "schedule": days })).unwrap();

        let config = RuntimeConfig::from_json(&raw).unwrap();
        let monday = config.schedule[DayOfWeek::Monday];
        assert!(monday.enabled);
        assert_eq!(monday.time_of_day.to_string(), "06:15");
    }

    #[test]
    fn malformed_schedule_time_is_rejected() {
        let raw = br#"{ "schedule": [{ "enabled": true, "time": "25:00" }] }"#;
        assert!(RuntimeConfig::from_json(raw).is_err());
    }

    #[test]
    fn hardware_pins_required_unless_mocked() {
        let mut config = RuntimeConfig::default();
        assert!(matches!(
            config.validate_hardware(),
            Err(Error::HardwareFault(_))
        ));

        config.mock = true;
        assert!(config.validate_hardware().is_ok());
    }

    #[test]
    fn gesture_timing_follows_sample_rate() {
        let config = GestureConfig::default();
        assert_eq!(config.sample_period().as_micros(), 16_666);
    }
}
