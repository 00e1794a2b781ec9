use serde::{Deserialize, Serialize};

use crate::schedule::WeeklySchedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmPhase {
    Idle,
    Armed,
    Ramping,
    CooldownCancelled,
}

impl AlarmPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Armed => "ARMED",
            Self::Ramping => "RAMPING",
            Self::CooldownCancelled => "COOLDOWN_CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gesture {
    ShortPress,
    LongPress,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub on: bool,
    pub brightness: f64,
    pub gain: f64,
    #[serde(rename = "startBrightness")]
    pub start_brightness: f64,
    pub phase: &'static str,
    #[serde(rename = "todayAlarmEpoch")]
    pub today_alarm_epoch: Option<i64>,
    #[serde(rename = "cancelledUntilEpoch")]
    pub cancelled_until_epoch: Option<i64>,
    #[serde(rename = "wakeUpLengthMin")]
    pub wake_up_length_min: i64,
    pub schedule: WeeklySchedule,
    pub timezone: String,
}
