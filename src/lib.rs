//! Calibration and angle-sweep acquisition for a SAIM/TIRF illumination stage.
//!
//! [`sweep::run_sweep`] drives a motor, a camera and an acquisition sink
//! through one sweep; [`calibration`] maps illumination angles to motor
//! positions. Everything hardware-facing sits behind the traits in
//! [`hardware`] and [`acquisition`].

pub mod acquisition;
pub mod calibration;
pub mod error;
pub mod hardware;
pub mod preferences;
pub mod sweep;

pub use acquisition::{AcquisitionSink, AcquisitionStore, FrameCoords, OpenAcquisition};
pub use calibration::{
    position_for_angle, CalibrationCoefficients, CalibrationEvaluator, CalibrationObserver,
};
pub use error::{AcquisitionError, CaptureError, ConfigError, DeviceError, SweepError};
pub use hardware::{Camera, Frame, MotorDevice, MotorTarget};
pub use sweep::{
    run_sweep, AngleSweepPlan, AngleSweepSequencer, CancellationToken, RunOutcome,
    SweepHardware, SweepParameters, SweepProgress,
};
