use thiserror::Error;

/// Rejected sweep input, detected before any device is touched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("angle step size must be positive, got {0}")]
    NonPositiveStep(i32),
    #[error("coefficient {name} is not a number: {text:?}")]
    InvalidCoefficient { name: &'static str, text: String },
    #[error("coefficient {name} is not finite")]
    NonFiniteCoefficient { name: &'static str },
    #[error("sweep would need {frames} frames, more than the limit of {limit}")]
    TooManyFrames { frames: i64, limit: i64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("device {device} rejected command: {reason}")]
    Rejected { device: String, reason: String },
    #[error("device {device} did not settle within {timeout_ms} ms")]
    SettleTimeout { device: String, timeout_ms: u64 },
    #[error("device communication failed: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaptureError {
    #[error("camera not ready: {0}")]
    NotReady(String),
    #[error("camera hardware failure: {0}")]
    Hardware(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AcquisitionError {
    #[error("no open acquisition named {0}")]
    NotOpen(String),
    #[error("acquisition {0} is already open")]
    AlreadyOpen(String),
    #[error("acquisition {name}: {coords} is outside {bounds}")]
    OutOfBounds {
        name: String,
        coords: String,
        bounds: String,
    },
    #[error("frame is {got} but acquisition {name} holds {expected} images")]
    ShapeMismatch {
        name: String,
        expected: String,
        got: String,
    },
    #[error("writing acquisition {name} failed: {reason}")]
    Storage { name: String, reason: String },
}

/// Everything that can end a sweep early.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SweepError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
}
