use crate::{config::GestureConfig, error::Result, types::Gesture};

/// Raw button access.
pub trait InputSampler: Send {
    /// Current level, `true` while the button is held.
    fn is_pressed(&mut self) -> Result<bool>;

    /// Whether a press edge was seen since the previous call. Clears the flag.
    fn take_edge(&mut self) -> bool;
}

/// Turns fixed-rate button samples into press gestures. Knows nothing about alarms.
#[derive(Debug, Clone)]
pub struct GestureInterpreter {
    config: GestureConfig,
    held_samples: u32,
    last_event_ms: Option<u64>,
}

impl GestureInterpreter {
    pub fn new(config: GestureConfig) -> Self {
        Self {
            config,
            held_samples: 0,
            last_event_ms: None,
        }
    }

    pub fn held_samples(&self) -> u32 {
        self.held_samples
    }

    pub fn sample(&mut self, pressed: bool, edge: bool, now_ms: u64) -> Option<Gesture> {
        if edge && self.within_spacing(now_ms) {
            // Contact bounce right after the last gesture.
            self.held_samples = 0;
            return None;
        }

        if pressed {
            self.held_samples = self.held_samples.saturating_add(1);
            return None;
        }

        let held = std::mem::take(&mut self.held_samples);
        if held <= self.config.debounce_samples || self.within_spacing(now_ms) {
            return None;
        }

        self.last_event_ms = Some(now_ms);
        if held > self.config.long_press_samples {
            Some(Gesture::LongPress)
        } else {
            Some(Gesture::ShortPress)
        }
    }

    fn within_spacing(&self, now_ms: u64) -> bool {
        self.last_event_ms
            .map(|last| now_ms.saturating_sub(last) < self.config.min_spacing_ms)
            .unwrap_or(false)
    }
}
