pub mod alarm;
pub mod config;
pub mod error;
pub mod gesture;
pub mod homie;
pub mod light;
pub mod schedule;
pub mod topics;
pub mod types;

pub use alarm::{AlarmEngine, EngineAction, SNOOZE_MINUTES};
pub use config::{GestureConfig, RampSettings, RuntimeConfig};
pub use error::{Error, Result};
pub use gesture::{GestureInterpreter, InputSampler};
pub use homie::{DeviceState, PropertyCommand, PropertyId, PropertySnapshot, RetainedSync, Route};
pub use light::{BrightnessController, DutyDriver, DutyQuantizer, LightState};
pub use schedule::{AlarmSlot, DayOfWeek, TimeOfDay, WeeklySchedule};
pub use topics::Topics;
pub use types::{AlarmPhase, ControllerStatus, Gesture};
