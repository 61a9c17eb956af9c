use super::{Camera, Frame, MotorDevice};
use crate::error::{CaptureError, DeviceError};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// In-memory stand-in for the TIRF motor.
#[derive(Debug, Clone)]
pub struct SimulatedMotor {
    device: String,
    properties: HashMap<String, i64>,
    range: RangeInclusive<i64>,
    settle_time: Duration,
    moves: Vec<i64>,
}

impl SimulatedMotor {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            properties: HashMap::new(),
            range: -1_000_000..=1_000_000,
            settle_time: Duration::ZERO,
            moves: Vec::new(),
        }
    }

    pub fn with_range(mut self, range: RangeInclusive<i64>) -> Self {
        self.range = range;
        self
    }

    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    pub fn property(&self, property: &str) -> Option<i64> {
        self.properties.get(property).copied()
    }

    /// Every accepted position, in command order.
    pub fn moves(&self) -> &[i64] {
        &self.moves
    }

    fn check_device(&self, device: &str) -> Result<(), DeviceError> {
        if device == self.device {
            Ok(())
        } else {
            Err(DeviceError::UnknownDevice(device.to_string()))
        }
    }
}

impl MotorDevice for SimulatedMotor {
    fn name(&self) -> &str {
        &self.device
    }

    fn set_position(
        &mut self,
        device: &str,
        property: &str,
        value: i64,
    ) -> Result<(), DeviceError> {
        self.check_device(device)?;
        if !self.range.contains(&value) {
            return Err(DeviceError::Rejected {
                device: device.to_string(),
                reason: format!(
                    "{} {} outside {}..={}",
                    property,
                    value,
                    self.range.start(),
                    self.range.end()
                ),
            });
        }
        self.properties.insert(property.to_string(), value);
        self.moves.push(value);
        debug!("simulated {}.{} = {}", device, property, value);
        Ok(())
    }

    fn wait_for_settle(&mut self, device: &str) -> Result<(), DeviceError> {
        self.check_device(device)?;
        if !self.settle_time.is_zero() {
            thread::sleep(self.settle_time);
        }
        Ok(())
    }
}

/// Produces noisy fringe images whose phase advances with every snap.
pub struct SimulatedCamera {
    width: u32,
    height: u32,
    rng: SmallRng,
    noise: u16,
    snaps: u64,
}

impl SimulatedCamera {
    const OFFSET: f64 = 100.0;
    const AMPLITUDE: f64 = 3000.0;

    pub fn new(width: u32, height: u32) -> Self {
        Self::with_seed(width, height, rand::random())
    }

    pub fn with_seed(width: u32, height: u32, seed: u64) -> Self {
        Self {
            width,
            height,
            rng: SmallRng::seed_from_u64(seed),
            noise: 50,
            snaps: 0,
        }
    }

    pub fn snaps(&self) -> u64 {
        self.snaps
    }
}

impl Camera for SimulatedCamera {
    fn name(&self) -> &str {
        "Simulated camera"
    }

    fn capture_frame(&mut self) -> Result<Frame, CaptureError> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::NotReady("empty sensor region".to_string()));
        }
        let phase = self.snaps as f64 * 0.35;
        let k = std::f64::consts::TAU * 3.0 / self.width as f64;
        let mut pixels = Vec::with_capacity((self.width * self.height) as usize);
        for _y in 0..self.height {
            for x in 0..self.width {
                let fringe = 0.5 * (1.0 + (k * x as f64 + phase).cos());
                let noise = self.rng.gen_range(0..=self.noise) as f64;
                let value = Self::OFFSET + Self::AMPLITUDE * fringe + noise;
                pixels.push(value.min(u16::MAX as f64) as u16);
            }
        }
        self.snaps += 1;
        Ok(Frame::new(self.width, self.height, pixels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motor_records_accepted_moves() {
        let mut motor = SimulatedMotor::new("TITIRF").with_range(-10..=10);
        motor.set_position("TITIRF", "Position", 4).unwrap();
        motor.wait_for_settle("TITIRF").unwrap();
        assert_eq!(motor.property("Position"), Some(4));
        assert!(matches!(
            motor.set_position("TITIRF", "Position", 11),
            Err(DeviceError::Rejected { .. })
        ));
        assert_eq!(
            motor.wait_for_settle("Other"),
            Err(DeviceError::UnknownDevice("Other".to_string()))
        );
        assert_eq!(motor.moves(), &[4]);
    }

    #[test]
    fn camera_frames_have_sensor_size() {
        let mut camera = SimulatedCamera::with_seed(16, 8, 7);
        let frame = camera.capture_frame().unwrap();
        assert_eq!(frame.pixels.len(), 16 * 8);
        assert!(frame.pixels.iter().all(|&p| p >= 100));
        assert!(frame.tags.is_empty());
        assert_eq!(camera.snaps(), 1);
        assert!(SimulatedCamera::with_seed(0, 8, 7).capture_frame().is_err());
    }
}
