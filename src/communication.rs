// =======================================================================
// src/communication.rs
// =======================================================================

use chrono::{DateTime, Utc};
use egui::ColorImage;
use saim_control::{CalibrationCoefficients, MotorTarget, RunOutcome, SweepParameters, SweepProgress};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;

//======================================================================
//  命令: Frontend -> Backend
//======================================================================

#[derive(Debug, Clone)]
pub enum Command {
    General(GeneralCommand),
    Device(DeviceCommand),
    Calibration(CalibrationCommand),
    Acquisition(AcquisitionCommand),
}

#[derive(Debug, Clone)]
pub enum GeneralCommand {
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum DeviceCommand {
    RefreshSerialPorts,
    /// `device` is the label the controller answers to.
    ConnectSerialMotor {
        port: String,
        baud_rate: u32,
        device: String,
    },
    ConnectSimulatedMotor { device: String },
    DisconnectMotor,
    ConnectSimulatedCamera { width: u32, height: u32 },
    DisconnectCamera,
    /// Moves the motor to the calibrated position of one angle.
    GoToAngle {
        angle: i32,
        coeffs: CalibrationCoefficients,
        target: MotorTarget,
    },
}

#[derive(Debug, Clone)]
pub enum CalibrationCommand {
    LoadFromFile { path: PathBuf },
}

#[derive(Debug, Clone)]
pub enum AcquisitionCommand {
    Run(SweepRequest),
    Abort,
}

/// Everything one sweep needs, captured when the operator presses Run.
#[derive(Debug, Clone)]
pub struct SweepRequest {
    pub params: SweepParameters,
    pub coeffs: CalibrationCoefficients,
    pub target: MotorTarget,
}

#[derive(Debug, Clone)]
pub struct LogMessage {
    pub level: Level,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub target: String,
}

//======================================================================
//  更新: Backend -> Frontend
//======================================================================

#[derive(Clone, Debug)]
pub enum Update {
    General(GeneralUpdate),
    Device(DeviceUpdate),
    Calibration(CalibrationUpdate),
    Sweep(SweepUpdate),
}

#[derive(Clone, Debug)]
pub enum GeneralUpdate {
    StatusMessage(String),
    Error(String),
    NewLog(LogMessage),
}

#[derive(Clone, Debug)]
pub enum DeviceUpdate {
    SerialPortsList(Vec<String>),
    /// `Some(name)` when a motor is connected.
    MotorStatus(Option<String>),
    CameraStatus(Option<String>),
    MotorPosition(i64),
}

#[derive(Clone, Debug)]
pub enum CalibrationUpdate {
    Loaded(CalibrationCoefficients),
}

#[derive(Clone, Debug)]
pub enum SweepUpdate {
    Running(bool),
    Progress(SweepProgress),
    NewFrame { angle: i64, image: Arc<ColorImage> },
    Finished(RunOutcome),
    Failed(String),
}
