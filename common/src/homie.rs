//! Homie-style property tree for the light and alarm nodes, plus the bookkeeping that keeps
//! the device's own retained publishes from being read back as commands.

use std::collections::HashSet;

use chrono::Duration;

use crate::{
    error::{Error, Result},
    light::validate_fraction,
    schedule::{parse_wake_up_length, DayOfWeek, TimeOfDay, WeeklySchedule},
    topics::HOMIE_VERSION,
};

pub const NODE_LIGHT: &str = "light";
pub const NODE_ALARM: &str = "alarm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyId {
    LightOn,
    LightBrightness,
    Alarm(DayOfWeek),
    AlarmEnabled(DayOfWeek),
    WakeUpLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    Boolean,
    Float,
    Integer,
    String,
}

impl Datatype {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Float => "float",
            Self::Integer => "integer",
            Self::String => "string",
        }
    }
}

impl PropertyId {
    pub fn all() -> Vec<Self> {
        let mut ids = vec![Self::LightOn, Self::LightBrightness];
        ids.extend(DayOfWeek::ALL.into_iter().map(Self::Alarm));
        ids.extend(DayOfWeek::ALL.into_iter().map(Self::AlarmEnabled));
        ids.push(Self::WakeUpLength);
        ids
    }

    pub fn node(self) -> &'static str {
        match self {
            Self::LightOn | Self::LightBrightness => NODE_LIGHT,
            Self::Alarm(_) | Self::AlarmEnabled(_) | Self::WakeUpLength => NODE_ALARM,
        }
    }

    pub fn id(self) -> String {
        match self {
            Self::LightOn => "on".to_string(),
            Self::LightBrightness => "brightness".to_string(),
            Self::Alarm(day) => day.name().to_string(),
            Self::AlarmEnabled(day) => format!("{}Enabled", day.name()),
            Self::WakeUpLength => "wake-up-length".to_string(),
        }
    }

    pub fn path(self) -> String {
        format!("{}/{}", self.node(), self.id())
    }

    pub fn from_path(path: &str) -> Option<Self> {
        let (node, id) = path.split_once('/')?;
        match (node, id) {
            (NODE_LIGHT, "on") => Some(Self::LightOn),
            (NODE_LIGHT, "brightness") => Some(Self::LightBrightness),
            (NODE_ALARM, "wake-up-length") => Some(Self::WakeUpLength),
            (NODE_ALARM, id) => match id.strip_suffix("Enabled") {
                Some(day) => DayOfWeek::from_name(day).map(Self::AlarmEnabled),
                None => DayOfWeek::from_name(id).map(Self::Alarm),
            },
            _ => None,
        }
    }

    pub fn display_name(self) -> String {
        match self {
            Self::LightOn => "On".to_string(),
            Self::LightBrightness => "Brightness".to_string(),
            Self::Alarm(day) => format!("{} alarm", day.name()),
            Self::AlarmEnabled(day) => format!("{} alarm enabled", day.name()),
            Self::WakeUpLength => "Wake-up length".to_string(),
        }
    }

    pub fn datatype(self) -> Datatype {
        match self {
            Self::LightOn | Self::AlarmEnabled(_) => Datatype::Boolean,
            Self::LightBrightness => Datatype::Float,
            Self::Alarm(_) => Datatype::String,
            Self::WakeUpLength => Datatype::Integer,
        }
    }

    pub fn settable(self) -> bool {
        true
    }

    pub fn unit(self) -> Option<&'static str> {
        match self {
            Self::LightBrightness => Some("%"),
            Self::WakeUpLength => Some("min"),
            _ => None,
        }
    }

    pub fn format(self) -> Option<&'static str> {
        match self {
            Self::LightBrightness => Some("0:100"),
            Self::WakeUpLength => Some("1:1440"),
            _ => None,
        }
    }

    /// Decodes a remote payload into a setter call without touching any state.
    pub fn decode(self, payload: &str) -> Result<PropertyCommand> {
        let payload = payload.trim();
        let invalid = || Error::InvalidPayload {
            property: self.path(),
            payload: payload.to_string(),
        };

        match self {
            Self::LightOn => parse_bool(payload)
                .map(PropertyCommand::SetOn)
                .ok_or_else(invalid),
            Self::AlarmEnabled(day) => parse_bool(payload)
                .map(|enabled| PropertyCommand::SetAlarmEnabled(day, enabled))
                .ok_or_else(invalid),
            Self::LightBrightness => {
                let percent = payload.parse::<f64>().map_err(|_| invalid())?;
                let gain = validate_fraction(percent / 100.0)?;
                Ok(PropertyCommand::SetBrightnessGain(gain))
            }
            Self::Alarm(day) => Ok(PropertyCommand::SetAlarm(day, payload.parse()?)),
            Self::WakeUpLength => Ok(PropertyCommand::SetWakeUpLength(parse_wake_up_length(
                payload,
            )?)),
        }
    }
}

/// Rounds up so a sub-minute length never goes out as `0`.
fn whole_minutes(length: Duration) -> i64 {
    ((length.num_seconds() + 59) / 60).max(1)
}

fn parse_bool(payload: &str) -> Option<bool> {
    match payload.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyCommand {
    SetOn(bool),
    SetBrightnessGain(f64),
    SetAlarm(DayOfWeek, TimeOfDay),
    SetAlarmEnabled(DayOfWeek, bool),
    SetWakeUpLength(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Init,
    Ready,
    Lost,
    Disconnected,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Ready => "ready",
            Self::Lost => "lost",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Device attributes, nodes, then one block per property. Paths are relative to the device root.
pub fn description(device_name: &str) -> Vec<(String, String)> {
    let mut messages = vec![
        ("$homie".to_string(), HOMIE_VERSION.to_string()),
        ("$name".to_string(), device_name.to_string()),
        ("$nodes".to_string(), format!("{NODE_LIGHT},{NODE_ALARM}")),
        ("$extensions".to_string(), String::new()),
    ];

    for (node, name) in [(NODE_LIGHT, "Light"), (NODE_ALARM, "Alarm")] {
        let properties: Vec<String> = PropertyId::all()
            .into_iter()
            .filter(|id| id.node() == node)
            .map(PropertyId::id)
            .collect();
        messages.push((format!("{node}/$name"), name.to_string()));
        messages.push((format!("{node}/$type"), node.to_string()));
        messages.push((format!("{node}/$properties"), properties.join(",")));
    }

    for id in PropertyId::all() {
        let path = id.path();
        messages.push((format!("{path}/$name"), id.display_name()));
        messages.push((format!("{path}/$datatype"), id.datatype().as_str().to_string()));
        messages.push((format!("{path}/$settable"), id.settable().to_string()));
        messages.push((format!("{path}/$retained"), "true".to_string()));
        if let Some(unit) = id.unit() {
            messages.push((format!("{path}/$unit"), unit.to_string()));
        }
        if let Some(format) = id.format() {
            messages.push((format!("{path}/$format"), format.to_string()));
        }
    }

    messages
}

/// Current value of every exposed property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySnapshot {
    pub on: bool,
    pub gain: f64,
    pub schedule: WeeklySchedule,
    pub wake_up_length: Duration,
}

impl PropertySnapshot {
    pub fn payload(&self, id: PropertyId) -> String {
        match id {
            PropertyId::LightOn => if self.on { "1" } else { "0" }.to_string(),
            PropertyId::LightBrightness => format!("{:.1}", self.gain * 100.0),
            PropertyId::Alarm(day) => self.schedule[day].time_of_day.to_string(),
            PropertyId::AlarmEnabled(day) => self.schedule[day].enabled.to_string(),
            PropertyId::WakeUpLength => whole_minutes(self.wake_up_length).to_string(),
        }
    }

    pub fn payloads(&self) -> Vec<(PropertyId, String)> {
        PropertyId::all()
            .into_iter()
            .map(|id| (id, self.payload(id)))
            .collect()
    }

    /// Properties whose payload differs from `previous`.
    pub fn changed_since(&self, previous: &Self) -> Vec<(PropertyId, String)> {
        self.payloads()
            .into_iter()
            .filter(|(id, payload)| previous.payload(*id) != *payload)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// External command on `<property>/set`.
    Command(PropertyId),
    /// Retained value on the bare topic, taken once per connection.
    Initial(PropertyId),
    Ignore,
}

/// Per-connection tracker deciding which bare-topic messages may still feed a setter.
#[derive(Debug, Clone)]
pub struct RetainedSync {
    awaiting_initial: HashSet<PropertyId>,
}

impl RetainedSync {
    pub fn new() -> Self {
        Self {
            awaiting_initial: PropertyId::all()
                .into_iter()
                .filter(|id| id.settable())
                .collect(),
        }
    }

    pub fn route(&mut self, id: PropertyId, is_set: bool) -> Route {
        if is_set {
            return Route::Command(id);
        }
        if self.awaiting_initial.remove(&id) {
            Route::Initial(id)
        } else {
            Route::Ignore
        }
    }

    pub fn is_awaiting(&self, id: PropertyId) -> bool {
        self.awaiting_initial.contains(&id)
    }

    /// Ends the retained-value window; returns the properties that never received one.
    pub fn close(&mut self) -> Vec<PropertyId> {
        self.awaiting_initial.drain().collect()
    }
}

impl Default for RetainedSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snapshot() -> PropertySnapshot {
        PropertySnapshot {
            on: false,
            gain: 0.25,
            schedule: WeeklySchedule::default(),
            wake_up_length: Duration::minutes(30),
        }
    }

    #[test]
    fn every_property_path_round_trips() {
        let ids = PropertyId::all();
        assert_eq!(ids.len(), 2 + 7 + 7 + 1);
        for id in ids {
            assert_eq!(PropertyId::from_path(&id.path()), Some(id));
        }
        assert_eq!(PropertyId::from_path("alarm/Funday"), None);
        assert_eq!(PropertyId::from_path("light"), None);
    }

    #[test]
    fn decodes_remote_payloads() {
        assert_eq!(
            PropertyId::LightOn.decode("1"),
            Ok(PropertyCommand::SetOn(true))
        );
        assert_eq!(
            PropertyId::LightOn.decode("0"),
            Ok(PropertyCommand::SetOn(false))
        );
        assert_eq!(
            PropertyId::LightBrightness.decode("40"),
            Ok(PropertyCommand::SetBrightnessGain(0.4))
        );
        assert_eq!(
            PropertyId::Alarm(DayOfWeek::Friday).decode("06:30"),
            Ok(PropertyCommand::SetAlarm(
                DayOfWeek::Friday,
                TimeOfDay::from_hm(6, 30).unwrap()
            ))
        );
        assert_eq!(
            PropertyId::WakeUpLength.decode("45"),
            Ok(PropertyCommand::SetWakeUpLength(Duration::minutes(45)))
        );
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(
            PropertyId::LightOn.decode("maybe"),
            Err(Error::InvalidPayload { .. })
        ));
        assert_eq!(
            PropertyId::LightBrightness.decode("150"),
            Err(Error::InvalidBrightness(1.5))
        );
        assert!(matches!(
            PropertyId::Alarm(DayOfWeek::Sunday).decode("7am"),
            Err(Error::InvalidTimeFormat(_))
        ));
        assert!(matches!(
            PropertyId::WakeUpLength.decode("0"),
            Err(Error::InvalidDuration(_))
        ));
    }

    #[test]
    fn snapshot_payloads_match_wire_format() {
        let mut snapshot = snapshot();
        snapshot.on = true;

        assert_eq!(snapshot.payload(PropertyId::LightOn), "1");
        assert_eq!(snapshot.payload(PropertyId::LightBrightness), "25.0");
        assert_eq!(snapshot.payload(PropertyId::Alarm(DayOfWeek::Monday)), "07:00");
        assert_eq!(
            snapshot.payload(PropertyId::AlarmEnabled(DayOfWeek::Monday)),
            "false"
        );
        assert_eq!(snapshot.payload(PropertyId::WakeUpLength), "30");
    }

    #[test]
    fn partial_minutes_round_up_to_a_readable_length() {
        let mut snapshot = snapshot();

        snapshot.wake_up_length = Duration::seconds(30);
        let payload = snapshot.payload(PropertyId::WakeUpLength);
        assert_eq!(payload, "1");
        assert!(PropertyId::WakeUpLength.decode(&payload).is_ok());

        snapshot.wake_up_length = Duration::seconds(90);
        assert_eq!(snapshot.payload(PropertyId::WakeUpLength), "2");
    }

    #[test]
    fn diff_only_reports_changed_properties() {
        let before = snapshot();
        let mut after = before.clone();
        after.on = true;
        after.schedule[DayOfWeek::Tuesday].enabled = true;

        assert_eq!(
            after.changed_since(&before),
            vec![
                (PropertyId::LightOn, "1".to_string()),
                (
                    PropertyId::AlarmEnabled(DayOfWeek::Tuesday),
                    "true".to_string()
                ),
            ]
        );
    }

    #[test]
    fn bare_topic_is_consumed_once() {
        let mut sync = RetainedSync::new();

        assert_eq!(
            sync.route(PropertyId::LightOn, false),
            Route::Initial(PropertyId::LightOn)
        );
        // The device's own republish echoing back.
        assert_eq!(sync.route(PropertyId::LightOn, false), Route::Ignore);
        assert_eq!(
            sync.route(PropertyId::LightOn, true),
            Route::Command(PropertyId::LightOn)
        );
    }

    #[test]
    fn closing_the_window_ignores_late_retained_values() {
        let mut sync = RetainedSync::new();
        sync.route(PropertyId::WakeUpLength, false);

        let unclaimed = sync.close();
        assert_eq!(unclaimed.len(), PropertyId::all().len() - 1);
        assert!(!unclaimed.contains(&PropertyId::WakeUpLength));
        assert!(!sync.is_awaiting(PropertyId::LightOn));
        assert_eq!(sync.route(PropertyId::LightOn, false), Route::Ignore);
    }

    #[test]
    fn description_lists_nodes_and_property_metadata() {
        let description = description("Sunrise");
        let lookup = |path: &str| {
            description
                .iter()
                .find(|(topic, _)| topic == path)
                .map(|(_, payload)| payload.as_str())
        };

        assert_eq!(lookup("$nodes"), Some("light,alarm"));
        assert_eq!(lookup("light/$properties"), Some("on,brightness"));
        assert_eq!(lookup("light/brightness/$unit"), Some("%"));
        assert_eq!(lookup("alarm/MondayEnabled/$datatype"), Some("boolean"));
        assert_eq!(lookup("alarm/wake-up-length/$settable"), Some("true"));
        assert_eq!(description[0], ("$homie".to_string(), "4.0".to_string()));
    }
}
