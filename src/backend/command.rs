use super::{Arc, BackendState, CancellationToken, Mutex};
use crate::communication::*;
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Sender;
use saim_control::{CalibrationCoefficients, CalibrationEvaluator};
use std::fs;
use std::path::Path;
use tracing::info;

fn send_status<S: Into<String>>(tx: &Sender<Update>, msg: S) -> Result<()> {
    tx.send(Update::General(GeneralUpdate::StatusMessage(msg.into())))?;
    Ok(())
}

pub fn handle_general(
    cmd: GeneralCommand,
    _state: Arc<Mutex<BackendState>>,
    _tx: &Sender<Update>,
    _token: CancellationToken,
) -> Result<()> {
    match cmd {
        // 关停由主循环直接处理
        GeneralCommand::Shutdown => {}
    }
    Ok(())
}

pub fn handle_device(
    cmd: DeviceCommand,
    state: Arc<Mutex<BackendState>>,
    tx: &Sender<Update>,
    token: CancellationToken,
) -> Result<()> {
    match cmd {
        DeviceCommand::RefreshSerialPorts => {
            let ports = super::serial::get_available_ports(token);
            tx.send(Update::Device(DeviceUpdate::SerialPortsList(ports)))?;
        }
        DeviceCommand::ConnectSerialMotor {
            port,
            baud_rate,
            device,
        } => {
            if let Err(e) = super::serial::connect(&state, port, baud_rate, &device, tx) {
                tx.send(Update::Device(DeviceUpdate::MotorStatus(None)))?;
                return Err(e);
            }
        }
        DeviceCommand::ConnectSimulatedMotor { device } => {
            super::camera::connect_simulated_motor(&state, &device, tx)?;
        }
        DeviceCommand::DisconnectMotor => {
            state.lock().devices.motor = None; // Drop 会自动关闭串口
            tx.send(Update::Device(DeviceUpdate::MotorStatus(None)))?;
            info!("电机已断开");
        }
        DeviceCommand::ConnectSimulatedCamera { width, height } => {
            super::camera::connect_simulated_camera(&state, width, height, tx)?;
        }
        DeviceCommand::DisconnectCamera => {
            state.lock().devices.camera = None;
            tx.send(Update::Device(DeviceUpdate::CameraStatus(None)))?;
            info!("相机已断开");
        }
        DeviceCommand::GoToAngle {
            angle,
            coeffs,
            target,
        } => {
            let motor = {
                let s = state.lock();
                if s.sweep.task_token.is_some() {
                    return Err(anyhow!("角度扫描进行中，不能手动移动电机"));
                }
                s.devices.motor.clone().ok_or_else(|| anyhow!("未连接电机"))?
            };
            let position = CalibrationEvaluator::new(coeffs).position_for_angle(f64::from(angle));
            info!("移动到角度 {}，位置 {}", angle, position);
            let mut motor = motor.lock();
            motor.set_position(&target.device, &target.property, position)?;
            motor.wait_for_settle(&target.device)?;
            tx.send(Update::Device(DeviceUpdate::MotorPosition(position)))?;
            send_status(tx, format!("已到达角度 {}", angle))?;
        }
    }
    Ok(())
}

pub fn handle_calibration(
    cmd: CalibrationCommand,
    _state: Arc<Mutex<BackendState>>,
    tx: &Sender<Update>,
    _token: CancellationToken,
) -> Result<()> {
    match cmd {
        CalibrationCommand::LoadFromFile { path } => {
            let coeffs = load_coefficients(&path)?;
            info!("已从 {} 读取校准系数", path.display());
            tx.send(Update::Calibration(CalibrationUpdate::Loaded(coeffs)))?;
        }
    }
    Ok(())
}

pub fn handle_acquisition(
    cmd: AcquisitionCommand,
    state: Arc<Mutex<BackendState>>,
    tx: &Sender<Update>,
    token: CancellationToken,
) -> Result<()> {
    match cmd {
        AcquisitionCommand::Run(request) => {
            // 这个命令线程就是扫描线程，直到扫描结束才返回
            super::sweep::run(&state, tx, request, token)?;
        }
        AcquisitionCommand::Abort => {
            super::sweep::abort(&state);
        }
    }
    Ok(())
}

/// Reads `{"x3": .., "x2": .., "x1": .., "x0": ..}` from a JSON file.
fn load_coefficients(path: &Path) -> Result<CalibrationCoefficients> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("无法读取校准文件 {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("校准文件格式错误: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn coefficients_load_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"x3": 0.001, "x2": 0.0, "x1": 2.5, "x0": -10}}"#).unwrap();
        let coeffs = load_coefficients(file.path()).unwrap();
        assert_eq!(coeffs, CalibrationCoefficients::new(0.001, 0.0, 2.5, -10.0).unwrap());
    }

    #[test]
    fn incomplete_calibration_files_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"x3": 1.0, "x2": 0.0}}"#).unwrap();
        assert!(load_coefficients(file.path()).is_err());
    }
}
