use super::{Arc, BackendState, Mutex};
use crate::communication::{DeviceUpdate, Update};
use anyhow::{bail, Result};
use crossbeam_channel::Sender;
use egui::ColorImage;
use saim_control::hardware::{SimulatedCamera, SimulatedMotor};
use saim_control::Frame;
use tracing::info;

/// Stretches a 16-bit frame to 8-bit grey between its min and max for display.
pub fn frame_to_color_image(frame: &Frame) -> ColorImage {
    let min = frame.pixels.iter().copied().min().unwrap_or(0);
    let max = frame.max_value();
    let span = f32::from(max.saturating_sub(min)).max(1.0);
    let gray: Vec<u8> = frame
        .pixels
        .iter()
        .map(|&p| (f32::from(p - min) / span * 255.0).round() as u8)
        .collect();
    ColorImage::from_gray([frame.width as usize, frame.height as usize], &gray)
}

pub fn connect_simulated_camera(
    state: &Arc<Mutex<BackendState>>,
    width: u32,
    height: u32,
    tx: &Sender<Update>,
) -> Result<()> {
    if width == 0 || height == 0 {
        bail!("传感器尺寸无效: {}x{}", width, height);
    }
    let camera = SimulatedCamera::new(width, height);
    let name = format!("{} {}x{}", saim_control::Camera::name(&camera), width, height);
    state.lock().devices.camera = Some(Arc::new(Mutex::new(Box::new(camera))));
    info!("相机已连接: {}", name);
    tx.send(Update::Device(DeviceUpdate::CameraStatus(Some(name))))?;
    Ok(())
}

pub fn connect_simulated_motor(
    state: &Arc<Mutex<BackendState>>,
    device: &str,
    tx: &Sender<Update>,
) -> Result<()> {
    let motor = SimulatedMotor::new(device);
    state.lock().devices.motor = Some(Arc::new(Mutex::new(Box::new(motor))));
    info!("模拟电机已连接，设备名 {}", device);
    tx.send(Update::Device(DeviceUpdate::MotorStatus(Some(format!(
        "模拟 ({})",
        device
    )))))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_stretched_to_full_grey_range() {
        let frame = Frame::new(3, 1, vec![100, 600, 1100]);
        let image = frame_to_color_image(&frame);
        assert_eq!(image.size, [3, 1]);
        let levels: Vec<u8> = image.pixels.iter().map(|c| c.r()).collect();
        assert_eq!(levels, vec![0, 128, 255]);
    }

    #[test]
    fn flat_frames_do_not_divide_by_zero() {
        let frame = Frame::new(2, 2, vec![42; 4]);
        let image = frame_to_color_image(&frame);
        assert!(image.pixels.iter().all(|c| c.r() == 0));
    }
}
