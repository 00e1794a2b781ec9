use crate::homie::PropertyId;

pub const HOMIE_VERSION: &str = "4.0";
pub const STATE_ATTRIBUTE: &str = "$state";
pub const SET_SUFFIX: &str = "/set";

/// Topic names under one device root, e.g. `homie/sunrise`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    root: String,
}

impl Topics {
    pub fn new(base_topic: &str, device_id: &str) -> Self {
        let base = base_topic.trim_matches('/');
        let root = if base.is_empty() {
            device_id.to_string()
        } else {
            format!("{base}/{device_id}")
        };
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn state(&self) -> String {
        self.attribute(STATE_ATTRIBUTE)
    }

    /// Absolute topic for a path relative to the device root.
    pub fn attribute(&self, relative: &str) -> String {
        format!("{}/{relative}", self.root)
    }

    pub fn property(&self, id: PropertyId) -> String {
        self.attribute(&id.path())
    }

    pub fn set(&self, id: PropertyId) -> String {
        format!("{}{SET_SUFFIX}", self.property(id))
    }

    /// Splits an absolute topic into its property and whether it is the `/set` channel.
    pub fn parse(&self, topic: &str) -> Option<(PropertyId, bool)> {
        let relative = topic.strip_prefix(&self.root)?.strip_prefix('/')?;
        match relative.strip_suffix(SET_SUFFIX) {
            Some(path) => PropertyId::from_path(path).map(|id| (id, true)),
            None => PropertyId::from_path(relative).map(|id| (id, false)),
        }
    }
}
