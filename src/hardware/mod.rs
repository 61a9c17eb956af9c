//! Device contracts used by the sweep, plus simulated implementations.

mod sim;

pub use sim::{SimulatedCamera, SimulatedMotor};

use crate::error::{CaptureError, DeviceError};
use serde_json::{Map, Value};

/// Tag holding the illumination angle a frame was captured at.
pub const ANGLE_TAG: &str = "Angle";

/// One 16-bit monochrome camera image with its metadata tags.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
    pub tags: Map<String, Value>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u16>) -> Self {
        Self {
            width,
            height,
            pixels,
            tags: Map::new(),
        }
    }

    pub fn tag_angle(&mut self, angle: i64) {
        self.tags.insert(ANGLE_TAG.to_string(), Value::from(angle));
    }

    pub fn angle(&self) -> Option<i64> {
        self.tags.get(ANGLE_TAG).and_then(Value::as_i64)
    }

    pub fn max_value(&self) -> u16 {
        self.pixels.iter().copied().max().unwrap_or(0)
    }
}

/// Which device property moves the illumination angle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotorTarget {
    pub device: String,
    pub property: String,
}

impl Default for MotorTarget {
    fn default() -> Self {
        Self {
            device: "TITIRF".to_string(),
            property: "Position".to_string(),
        }
    }
}

pub trait MotorDevice {
    fn name(&self) -> &str;

    /// Commands `property` of `device` to the integral `value`.
    fn set_position(&mut self, device: &str, property: &str, value: i64)
        -> Result<(), DeviceError>;

    /// Blocks until `device` reports it is no longer moving.
    fn wait_for_settle(&mut self, device: &str) -> Result<(), DeviceError>;
}

pub trait Camera {
    fn name(&self) -> &str;

    /// Snaps one image and returns it untagged.
    fn capture_frame(&mut self) -> Result<Frame, CaptureError>;
}
