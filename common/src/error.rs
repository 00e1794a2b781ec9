use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("invalid time of day {0:?}, expected HH:MM")]
    InvalidTimeFormat(String),

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("brightness {0} is outside 0..=1")]
    InvalidBrightness(f64),

    #[error("invalid payload {payload:?} for {property}")]
    InvalidPayload { property: String, payload: String },

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("hardware fault: {0}")]
    HardwareFault(String),
}

pub type Result<T> = std::result::Result<T, Error>;
