use chrono::{DateTime, Duration, FixedOffset};

use crate::{
    error::{Error, Result},
    light::LightState,
    schedule::{parse_wake_up_length, DayOfWeek, TimeOfDay, WeeklySchedule},
    types::{AlarmPhase, Gesture},
};

pub const SNOOZE_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    /// Logical light level for the brightness controller.
    SetLevel(f64),
    /// Run [`AlarmEngine::expire_cooldown`] with `generation` once `delay` has passed.
    ArmCooldown {
        generation: u64,
        delay: std::time::Duration,
    },
    Armed(DateTime<FixedOffset>),
    RampStarted(DateTime<FixedOffset>),
    RampFinished,
    Snoozed(DateTime<FixedOffset>),
    Cancelled(DateTime<FixedOffset>),
    CooldownExpired,
    SkippedAlreadyOn(DateTime<FixedOffset>),
}

/// Weekly wake-up schedule plus the sunrise ramp state machine.
///
/// All time is injected; the engine never reads a clock. Hardware effects come back
/// as [`EngineAction`]s for the caller to apply after releasing its lock.
#[derive(Debug, Clone)]
pub struct AlarmEngine {
    schedule: WeeklySchedule,
    wake_up_length: Duration,

    phase: AlarmPhase,
    today_alarm: Option<DateTime<FixedOffset>>,
    cancelled_until: Option<DateTime<FixedOffset>>,
    cooldown_generation: u64,
    skip_reported: bool,

    light: LightState,
}

impl AlarmEngine {
    pub fn new(schedule: WeeklySchedule, wake_up_length: Duration) -> Self {
        Self {
            schedule,
            wake_up_length: if wake_up_length > Duration::zero() {
                wake_up_length
            } else {
                Duration::hours(1)
            },
            phase: AlarmPhase::Idle,
            today_alarm: None,
            cancelled_until: None,
            cooldown_generation: 0,
            skip_reported: false,
            light: LightState {
                is_on: false,
                brightness: 0.0,
            },
        }
    }

    pub fn schedule(&self) -> &WeeklySchedule {
        &self.schedule
    }

    pub fn wake_up_length(&self) -> Duration {
        self.wake_up_length
    }

    pub fn phase(&self) -> AlarmPhase {
        self.phase
    }

    pub fn today_alarm(&self) -> Option<DateTime<FixedOffset>> {
        self.today_alarm
    }

    pub fn cancelled_until(&self) -> Option<DateTime<FixedOffset>> {
        self.cancelled_until
    }

    pub fn light(&self) -> LightState {
        self.light
    }

    pub fn set_alarm(&mut self, day: DayOfWeek, time_of_day: &str) -> Result<()> {
        let time: TimeOfDay = time_of_day.parse()?;
        self.set_alarm_time(day, time);
        Ok(())
    }

    pub fn set_alarm_time(&mut self, day: DayOfWeek, time_of_day: TimeOfDay) {
        self.schedule[day].time_of_day = time_of_day;
    }

    pub fn set_alarm_enabled(&mut self, day: DayOfWeek, enabled: bool) {
        self.schedule[day].enabled = enabled;
    }

    pub fn set_wake_up_length(&mut self, value: &str) -> Result<()> {
        self.wake_up_length = parse_wake_up_length(value)?;
        Ok(())
    }

    pub fn set_wake_up_length_duration(&mut self, length: Duration) -> Result<()> {
        if length <= Duration::zero() {
            return Err(Error::InvalidDuration(format!("{}s", length.num_seconds())));
        }
        self.wake_up_length = length;
        Ok(())
    }

    /// Advances the state machine. Called once per second with the local wall clock.
    pub fn tick(&mut self, now: DateTime<FixedOffset>) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        if self.phase != AlarmPhase::Ramping {
            self.expire_cooldown_if_due(now, &mut actions);
            self.evaluate_schedule(now, &mut actions);
        }

        if self.phase == AlarmPhase::Ramping {
            self.advance_ramp(now, &mut actions);
        }

        actions
    }

    pub fn set_on(&mut self, on: bool, now: DateTime<FixedOffset>) -> Vec<EngineAction> {
        if on {
            self.turn_on(now)
        } else {
            self.turn_off(now)
        }
    }

    /// Manual full brightness. Cancels a running ramp.
    pub fn turn_on(&mut self, now: DateTime<FixedOffset>) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        if self.phase == AlarmPhase::Ramping {
            self.cancel_ramp(now, &mut actions);
        }
        self.set_light(true, 1.0, &mut actions);
        actions
    }

    /// Manual off. Cancels a running ramp.
    pub fn turn_off(&mut self, now: DateTime<FixedOffset>) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        if self.phase == AlarmPhase::Ramping {
            self.cancel_ramp(now, &mut actions);
        }
        self.set_light(false, 0.0, &mut actions);
        actions
    }

    /// Pushes today's trigger back by [`SNOOZE_MINUTES`]. No-op unless ramping.
    pub fn snooze(&mut self) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        if self.phase != AlarmPhase::Ramping {
            return actions;
        }
        if let Some(trigger) = self.today_alarm {
            let snoozed = trigger + Duration::minutes(SNOOZE_MINUTES);
            self.today_alarm = Some(snoozed);
            actions.push(EngineAction::Snoozed(snoozed));
        }
        actions
    }

    /// Stops a running ramp, leaving the light off. No-op unless ramping.
    pub fn cancel(&mut self, now: DateTime<FixedOffset>) -> Vec<EngineAction> {
        if self.phase != AlarmPhase::Ramping {
            return Vec::new();
        }
        self.turn_off(now)
    }

    pub fn register_gesture(
        &mut self,
        gesture: Gesture,
        now: DateTime<FixedOffset>,
    ) -> Vec<EngineAction> {
        match (self.phase, gesture) {
            (AlarmPhase::Ramping, Gesture::ShortPress) => self.snooze(),
            (AlarmPhase::Ramping, Gesture::LongPress) => self.turn_off(now),
            _ if self.light.is_on => self.turn_off(now),
            _ => self.turn_on(now),
        }
    }

    /// Cooldown timer callback. Stale generations are ignored.
    pub fn expire_cooldown(&mut self, generation: u64) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        if self.phase == AlarmPhase::CooldownCancelled && generation == self.cooldown_generation {
            self.finish_cooldown(&mut actions);
        }
        actions
    }

    fn expire_cooldown_if_due(
        &mut self,
        now: DateTime<FixedOffset>,
        actions: &mut Vec<EngineAction>,
    ) {
        if self.phase != AlarmPhase::CooldownCancelled {
            return;
        }
        if self.cancelled_until.map(|until| now >= until).unwrap_or(true) {
            self.finish_cooldown(actions);
        }
    }

    fn finish_cooldown(&mut self, actions: &mut Vec<EngineAction>) {
        self.phase = AlarmPhase::Armed;
        self.cancelled_until = None;
        actions.push(EngineAction::CooldownExpired);
    }

    fn evaluate_schedule(&mut self, now: DateTime<FixedOffset>, actions: &mut Vec<EngineAction>) {
        let Some(candidate) = self.schedule.trigger_for(now) else {
            if self.phase == AlarmPhase::Armed {
                self.phase = AlarmPhase::Idle;
            }
            self.today_alarm = None;
            return;
        };

        // Day rollover or a live edit of today's slot.
        if self.today_alarm != Some(candidate) && candidate > now {
            self.today_alarm = Some(candidate);
            if self.phase == AlarmPhase::CooldownCancelled {
                self.cooldown_generation += 1;
                self.cancelled_until = None;
            }
            self.phase = AlarmPhase::Armed;
            self.skip_reported = false;
            actions.push(EngineAction::Armed(candidate));
        }

        if self.phase != AlarmPhase::Armed {
            return;
        }
        let Some(trigger) = self.today_alarm else {
            return;
        };
        if trigger <= now {
            return;
        }

        let till_start = trigger - now - self.wake_up_length;
        if till_start > Duration::zero() {
            return;
        }

        // A lit room holds the alarm armed; the ramp picks up once the light goes off.
        if self.light.is_on {
            if !self.skip_reported {
                self.skip_reported = true;
                actions.push(EngineAction::SkippedAlreadyOn(trigger));
            }
            return;
        }

        self.phase = AlarmPhase::Ramping;
        self.skip_reported = false;
        actions.push(EngineAction::RampStarted(trigger));
    }

    fn advance_ramp(&mut self, now: DateTime<FixedOffset>, actions: &mut Vec<EngineAction>) {
        let Some(trigger) = self.today_alarm else {
            self.phase = AlarmPhase::Idle;
            return;
        };

        let remaining = trigger - now;
        if remaining > Duration::zero() {
            let length_ms = self.wake_up_length.num_milliseconds() as f64;
            let elapsed_ms = (self.wake_up_length - remaining).num_milliseconds() as f64;
            let level = (elapsed_ms / length_ms).clamp(0.0, 1.0);
            self.set_light(false, level, actions);
            return;
        }

        self.set_light(true, 1.0, actions);
        self.phase = AlarmPhase::Idle;
        actions.push(EngineAction::RampFinished);
    }

    fn cancel_ramp(&mut self, now: DateTime<FixedOffset>, actions: &mut Vec<EngineAction>) {
        // Recomputed from the schedule so that snoozes do not move the reference point.
        let original = self.schedule.trigger_for(now).or(self.today_alarm);
        let until = match (original, self.today_alarm) {
            (Some(original), Some(snoozed)) => Some(original.max(snoozed)),
            (original, snoozed) => original.or(snoozed),
        };

        let Some(until) = until else {
            self.phase = AlarmPhase::Idle;
            return;
        };

        self.today_alarm = original;
        self.phase = AlarmPhase::CooldownCancelled;
        self.cancelled_until = Some(until);
        self.cooldown_generation += 1;

        actions.push(EngineAction::Cancelled(until));
        actions.push(EngineAction::ArmCooldown {
            generation: self.cooldown_generation,
            delay: (until - now).to_std().unwrap_or_default(),
        });
    }

    fn set_light(&mut self, is_on: bool, brightness: f64, actions: &mut Vec<EngineAction>) {
        let changed = (self.light.brightness - brightness).abs() > f64::EPSILON;
        self.light = LightState { is_on, brightness };
        if changed {
            actions.push(EngineAction::SetLevel(brightness));
        }
    }
}
