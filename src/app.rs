// src/app.rs

use crate::communication::*;
use crossbeam_channel::{Receiver, Sender};
use egui::{
    CentralPanel, Color32, ComboBox, DragValue, Frame, RichText, SidePanel, TopBottomPanel, Ui,
};
use egui_plot::{Legend, Line, Plot, PlotPoints, Points};
use saim_control::preferences::AcquisitionSettings;
use saim_control::{
    AngleSweepPlan, CalibrationCoefficients, CalibrationEvaluator, CalibrationObserver,
    RunOutcome, SweepProgress,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn, Level};

const LOG_CAPACITY: usize = 200;
const BAUD_RATES: [u32; 4] = [9600, 19200, 57600, 115200];
const CURVE_SAMPLES: usize = 200;

pub struct SaimApp {
    // --- 通信 ---
    cmd_tx: Sender<Command>,
    update_rx: Receiver<Update>,
    backend_handle: Option<thread::JoinHandle<()>>,
    log_buffer: VecDeque<LogMessage>,
    status_message: String,

    // --- 持久化的采集设置 ---
    settings: AcquisitionSettings,

    // --- 设备 ---
    serial_ports: Vec<String>,
    selected_serial_port: String,
    baud_rate: u32,
    motor_status: Option<String>,
    motor_position: Option<i64>,
    camera_status: Option<String>,
    sim_camera_size: [u32; 2],
    manual_angle: i32,

    // --- 扫描 ---
    is_running: bool,
    progress: Option<SweepProgress>,
    last_result: Option<String>,
    frame_texture: Option<egui::TextureHandle>,
    frame_image: Option<Arc<egui::ColorImage>>,
    frame_angle: Option<i64>,
}

impl eframe::App for SaimApp {
    fn save(&mut self, storage: &mut dyn eframe::Storage) {
        self.settings.store(storage);
    }

    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        info!("前端：正在退出，通知后端关闭...");
        if let Err(e) = self.cmd_tx.send(Command::General(GeneralCommand::Shutdown)) {
            error!("前端：发送关闭指令失败: {}", e);
        }
        if let Some(handle) = self.backend_handle.take() {
            info!("前端：等待后端线程完成...");
            if let Err(e) = handle.join() {
                error!("前端：等待后端线程时发生错误: {:?}", e);
            } else {
                info!("前端：后端线程已成功关闭。");
            }
        }
    }

    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.handle_backend_updates();
        if let Some(image) = self.frame_image.take() {
            let texture = ctx.load_texture("sweep_frame", image, Default::default());
            self.frame_texture = Some(texture);
        }

        TopBottomPanel::bottom("status_bar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.label(&self.status_message);
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    ui.label(concat!("v", env!("CARGO_PKG_VERSION")));
                });
            });
        });

        let panel_width = ctx.available_rect().width() * 0.45;
        SidePanel::right("monitor_panel")
            .exact_width(panel_width)
            .resizable(false)
            .show(ctx, |ui| {
                self.draw_monitor_panel(ui);
            });

        CentralPanel::default().show(ctx, |ui| {
            egui::ScrollArea::vertical().show(ui, |ui| {
                self.draw_devices_section(ui);
                ui.separator();
                self.draw_setup_section(ui);
                ui.separator();
                self.draw_calibration_section(ui);
                ui.separator();
                self.draw_acquire_section(ui);
            });
        });

        if self.is_running {
            ctx.request_repaint();
        } else {
            ctx.request_repaint_after(std::time::Duration::from_millis(100));
        }
    }
}

impl CalibrationObserver for SaimApp {
    fn calibration_changed(&mut self, coeffs: CalibrationCoefficients) {
        self.settings.calibration_changed(coeffs);
    }
}

impl SaimApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        cmd_tx: Sender<Command>,
        update_rx: Receiver<Update>,
        backend_handle: Option<thread::JoinHandle<()>>,
    ) -> Self {
        let settings = cc
            .storage
            .map(|storage| AcquisitionSettings::load(storage))
            .unwrap_or_default();

        let mut app = Self {
            cmd_tx,
            update_rx,
            backend_handle,
            log_buffer: VecDeque::with_capacity(LOG_CAPACITY),
            status_message: "就绪".to_string(),
            settings,
            serial_ports: vec!["刷新中...".to_string()],
            selected_serial_port: String::new(),
            baud_rate: BAUD_RATES[0],
            motor_status: None,
            motor_position: None,
            camera_status: None,
            sim_camera_size: [512, 512],
            manual_angle: 0,
            is_running: false,
            progress: None,
            last_result: None,
            frame_texture: None,
            frame_image: None,
            frame_angle: None,
        };
        app.send(Command::Device(DeviceCommand::RefreshSerialPorts));
        app
    }

    fn send(&mut self, cmd: Command) {
        if let Err(e) = self.cmd_tx.send(cmd) {
            error!("前端：发送指令失败: {}", e);
            self.status_message = "后端已停止".to_string();
        }
    }

    fn handle_backend_updates(&mut self) {
        while let Ok(update) = self.update_rx.try_recv() {
            match update {
                Update::General(update) => match update {
                    GeneralUpdate::StatusMessage(msg) => self.status_message = msg,
                    GeneralUpdate::Error(err_msg) => {
                        self.status_message = format!("错误: {}", err_msg);
                        self.is_running = false;
                    }
                    GeneralUpdate::NewLog(log_line) => {
                        self.log_buffer.push_back(log_line);
                        if self.log_buffer.len() > LOG_CAPACITY {
                            self.log_buffer.pop_front();
                        }
                    }
                },
                Update::Device(update) => match update {
                    DeviceUpdate::SerialPortsList(ports) => {
                        self.serial_ports = ports;
                        if let Some(first) = self.serial_ports.first() {
                            self.selected_serial_port = first.clone();
                        }
                    }
                    DeviceUpdate::MotorStatus(status) => {
                        if status.is_none() {
                            self.motor_position = None;
                        }
                        self.motor_status = status;
                    }
                    DeviceUpdate::CameraStatus(status) => {
                        if status.is_none() {
                            self.frame_texture = None;
                        }
                        self.camera_status = status;
                    }
                    DeviceUpdate::MotorPosition(position) => self.motor_position = Some(position),
                },
                Update::Calibration(CalibrationUpdate::Loaded(coeffs)) => {
                    self.calibration_changed(coeffs);
                    self.status_message = "已导入校准系数".to_string();
                }
                Update::Sweep(update) => match update {
                    SweepUpdate::Running(running) => self.is_running = running,
                    SweepUpdate::Progress(progress) => {
                        self.motor_position = Some(progress.position);
                        self.progress = Some(progress);
                    }
                    SweepUpdate::NewFrame { angle, image } => {
                        self.frame_angle = Some(angle);
                        self.frame_image = Some(image);
                    }
                    SweepUpdate::Finished(outcome) => {
                        self.last_result = Some(match &outcome {
                            RunOutcome::Completed { acquisition, frames } => {
                                format!("{} 完成，共 {} 帧", acquisition, frames)
                            }
                            RunOutcome::Cancelled { acquisition, frames } => {
                                format!("{} 已中止，保留 {} 帧", acquisition, frames)
                            }
                        });
                    }
                    SweepUpdate::Failed(reason) => {
                        self.last_result = Some(format!("失败: {}", reason));
                        self.status_message = format!("错误: {}", reason);
                    }
                },
            }
        }
    }

    fn draw_devices_section(&mut self, ui: &mut Ui) {
        ui.heading("Devices");
        ui.add_space(5.0);

        ui.label(RichText::new("Motor").strong());
        ui.horizontal(|ui| {
            ui.label("Device:");
            ui.add_enabled(
                !self.is_running,
                egui::TextEdit::singleline(&mut self.settings.motor.device).desired_width(90.0),
            );
            ui.label("Property:");
            ui.add_enabled(
                !self.is_running,
                egui::TextEdit::singleline(&mut self.settings.motor.property).desired_width(90.0),
            );
        });
        ui.horizontal(|ui| {
            ComboBox::from_id_source("serial_select")
                .selected_text(self.selected_serial_port.clone())
                .show_ui(ui, |ui| {
                    for port in &self.serial_ports {
                        ui.selectable_value(&mut self.selected_serial_port, port.clone(), port);
                    }
                });
            ComboBox::from_id_source("baud_select")
                .selected_text(self.baud_rate.to_string())
                .show_ui(ui, |ui| {
                    for rate in BAUD_RATES {
                        ui.selectable_value(&mut self.baud_rate, rate, rate.to_string());
                    }
                });
            if ui.button("Refresh").clicked() {
                self.send(Command::Device(DeviceCommand::RefreshSerialPorts));
            }
        });
        ui.horizontal(|ui| {
            ui.add_enabled_ui(!self.is_running, |ui| {
                if self.motor_status.is_some() {
                    if ui.button("Disconnect").clicked() {
                        self.send(Command::Device(DeviceCommand::DisconnectMotor));
                    }
                } else {
                    if ui.button("Connect serial").clicked() && !self.selected_serial_port.is_empty()
                    {
                        let cmd = DeviceCommand::ConnectSerialMotor {
                            port: self.selected_serial_port.clone(),
                            baud_rate: self.baud_rate,
                            device: self.settings.motor.device.clone(),
                        };
                        self.send(Command::Device(cmd));
                    }
                    if ui.button("Simulate").clicked() {
                        let device = self.settings.motor.device.clone();
                        self.send(Command::Device(DeviceCommand::ConnectSimulatedMotor { device }));
                    }
                }
            });
        });

        ui.add_space(5.0);
        ui.label(RichText::new("Camera").strong());
        ui.horizontal(|ui| {
            ui.add_enabled_ui(!self.is_running, |ui| {
                if self.camera_status.is_some() {
                    if ui.button("Disconnect").clicked() {
                        self.send(Command::Device(DeviceCommand::DisconnectCamera));
                    }
                } else {
                    ui.label("Sensor:");
                    ui.add(DragValue::new(&mut self.sim_camera_size[0]).clamp_range(1..=4096));
                    ui.label("x");
                    ui.add(DragValue::new(&mut self.sim_camera_size[1]).clamp_range(1..=4096));
                    if ui.button("Simulate").clicked() {
                        let [width, height] = self.sim_camera_size;
                        self.send(Command::Device(DeviceCommand::ConnectSimulatedCamera {
                            width,
                            height,
                        }));
                    }
                }
            });
        });
    }

    fn draw_setup_section(&mut self, ui: &mut Ui) {
        ui.heading("Setup");
        ui.add_enabled_ui(!self.is_running, |ui| {
            egui::Grid::new("setup_grid").num_columns(2).show(ui, |ui| {
                ui.label("Step");
                ui.add(DragValue::new(&mut self.settings.angle_step).clamp_range(0..=400));
                ui.end_row();
                ui.label("Start angle");
                ui.add(DragValue::new(&mut self.settings.start_angle));
                ui.end_row();
                ui.label("End angle");
                ui.add(DragValue::new(&mut self.settings.end_angle));
                ui.end_row();
                ui.label("");
                ui.checkbox(&mut self.settings.double_zero, "Double zero");
                ui.end_row();
            });
        });
    }

    fn draw_calibration_section(&mut self, ui: &mut Ui) {
        ui.heading("Calibration Values");
        ui.add_enabled_ui(!self.is_running, |ui| {
            egui::Grid::new("coeff_grid").num_columns(2).show(ui, |ui| {
                for (label, text) in ["x^3", "x^2", "x", "x^0"]
                    .into_iter()
                    .zip(self.settings.coeff_texts.iter_mut())
                {
                    ui.label(label);
                    ui.add(egui::TextEdit::singleline(text).desired_width(140.0));
                    ui.end_row();
                }
            });
            if ui.button("Load calibration file...").clicked() {
                if let Some(path) = rfd::FileDialog::new()
                    .add_filter("JSON", &["json"])
                    .pick_file()
                {
                    self.send(Command::Calibration(CalibrationCommand::LoadFromFile { path }));
                }
            }
        });

        let coeffs = match self.settings.coefficients() {
            Ok(coeffs) => coeffs,
            Err(e) => {
                ui.label(RichText::new(e.to_string()).color(Color32::LIGHT_RED));
                return;
            }
        };

        ui.horizontal(|ui| {
            ui.label("Go to angle:");
            ui.add(DragValue::new(&mut self.manual_angle));
            let evaluator = CalibrationEvaluator::new(coeffs);
            ui.label(format!("-> {}", evaluator.position_for_angle(f64::from(self.manual_angle))));
            let can_move = self.motor_status.is_some() && !self.is_running;
            if ui.add_enabled(can_move, egui::Button::new("Move")).clicked() {
                let cmd = DeviceCommand::GoToAngle {
                    angle: self.manual_angle,
                    coeffs,
                    target: self.settings.motor.clone(),
                };
                self.send(Command::Device(cmd));
            }
        });

        self.draw_calibration_plot(ui, coeffs);
    }

    /// Model curve over the sweep range, with the planned angles marked.
    fn draw_calibration_plot(&self, ui: &mut Ui, coeffs: CalibrationCoefficients) {
        let evaluator = CalibrationEvaluator::new(coeffs);
        let reach = f64::from(self.settings.start_angle.unsigned_abs().max(1));
        let step = f64::from(self.settings.angle_step.max(0));
        let curve = evaluator.curve(-reach, reach + step, CURVE_SAMPLES);
        let planned: Vec<[f64; 2]> =
            AngleSweepPlan::derive(self.settings.start_angle, self.settings.angle_step)
                .map(|plan| {
                    plan.iter()
                        .map(|p| [p.angle as f64, evaluator.position_for_angle(p.angle as f64) as f64])
                        .collect()
                })
                .unwrap_or_default();

        Plot::new("calibration_plot")
            .height(220.0)
            .legend(Legend::default())
            .x_axis_label("angle")
            .y_axis_label("position")
            .show(ui, |plot_ui| {
                plot_ui.line(Line::new(PlotPoints::from(curve)).name("calibration"));
                if !planned.is_empty() {
                    plot_ui.points(
                        Points::new(PlotPoints::from(planned))
                            .name("planned")
                            .shape(egui_plot::MarkerShape::Cross)
                            .radius(4.0),
                    );
                }
            });
    }

    fn draw_acquire_section(&mut self, ui: &mut Ui) {
        ui.heading("Acquire");
        ui.add_enabled_ui(!self.is_running, |ui| {
            ui.horizontal(|ui| {
                ui.label("Dir root");
                ui.add(egui::TextEdit::singleline(&mut self.settings.dir_root).desired_width(220.0));
                if ui.button("...").clicked() {
                    if let Some(path) = rfd::FileDialog::new().pick_folder() {
                        self.settings.dir_root = path.to_string_lossy().to_string();
                    }
                }
            });
            ui.horizontal(|ui| {
                ui.label("Name prefix");
                ui.text_edit_singleline(&mut self.settings.name_prefix);
            });
            ui.checkbox(&mut self.settings.save_images, "Save images");
        });

        ui.add_space(5.0);
        let label = if self.is_running {
            "Abort Acquisition"
        } else {
            "Run Acquisition"
        };
        if ui.button(RichText::new(label).strong()).clicked() {
            if self.is_running {
                self.send(Command::Acquisition(AcquisitionCommand::Abort));
            } else {
                self.start_sweep();
            }
        }

        if let Some(progress) = &self.progress {
            let fraction = (progress.index + 1) as f32 / progress.total.max(1) as f32;
            ui.add(egui::ProgressBar::new(fraction).text(format!(
                "Image {} / {}, angle {}, position {}",
                progress.index + 1,
                progress.total,
                progress.angle,
                progress.position
            )));
        }
        if let Some(result) = &self.last_result {
            ui.label(result);
        }
    }

    fn start_sweep(&mut self) {
        let coeffs = match self.settings.coefficients() {
            Ok(coeffs) => coeffs,
            Err(e) => {
                warn!("校准系数无效: {}", e);
                self.status_message = format!("错误: {}", e);
                return;
            }
        };
        let params = self.settings.sweep_parameters();
        if let Err(e) = params.validate() {
            warn!("扫描参数无效: {}", e);
            self.status_message = format!("错误: {}", e);
            return;
        }
        self.progress = None;
        self.last_result = None;
        self.is_running = true;
        let request = SweepRequest {
            params,
            coeffs,
            target: self.settings.motor.clone(),
        };
        self.send(Command::Acquisition(AcquisitionCommand::Run(request)));
    }

    fn draw_monitor_panel(&mut self, ui: &mut Ui) {
        TopBottomPanel::top("monitor_top_panel")
            .frame(Frame::none())
            .show_inside(ui, |ui| {
                ui.heading("Status");
                ui.group(|ui| {
                    ui.set_width(ui.available_width());
                    ui.label(device_status("Motor", self.motor_status.as_deref()));
                    ui.label(device_status("Camera", self.camera_status.as_deref()));
                    if let Some(position) = self.motor_position {
                        ui.label(format!("Motor position: {}", position));
                    }
                });
                ui.add_space(5.0);
            });

        TopBottomPanel::bottom("monitor_bottom_panel")
            .frame(Frame::none())
            .show_inside(ui, |ui| {
                ui.add_space(5.0);
                ui.label(RichText::new("Log").strong());
                Frame::group(ui.style()).show(ui, |ui| {
                    ui.set_height(160.0);
                    egui::ScrollArea::vertical()
                        .auto_shrink([false, false])
                        .stick_to_bottom(true)
                        .show(ui, |ui| {
                            for log in &self.log_buffer {
                                draw_log_message(ui, log);
                            }
                        });
                });
            });

        CentralPanel::default()
            .frame(Frame::none())
            .show_inside(ui, |ui| {
                let title = match self.frame_angle {
                    Some(angle) => format!("Last frame (angle {})", angle),
                    None => "Last frame".to_string(),
                };
                ui.label(RichText::new(title).strong());
                Frame::canvas(ui.style())
                    .stroke(ui.style().visuals.window_stroke)
                    .show(ui, |ui| {
                        ui.set_width(ui.available_width());
                        ui.set_height(ui.available_height());
                        match &self.frame_texture {
                            Some(texture) => {
                                let image = egui::Image::new(texture)
                                    .max_size(ui.available_size())
                                    .maintain_aspect_ratio(true);
                                ui.centered_and_justified(|ui| {
                                    ui.add(image);
                                });
                            }
                            None => {
                                ui.centered_and_justified(|ui| {
                                    ui.label("[no image]");
                                });
                            }
                        }
                    });
            });
    }
}

fn device_status(kind: &str, status: Option<&str>) -> RichText {
    match status {
        Some(name) => RichText::new(format!("✅ {}: {}", kind, name)).color(Color32::GREEN),
        None => RichText::new(format!("❌ {}: not connected", kind)).color(Color32::LIGHT_RED),
    }
}

fn draw_log_message(ui: &mut Ui, log: &LogMessage) {
    let (level_str, color) = level_to_style(log.level);

    let layout_response = ui
        .horizontal_wrapped(|ui| {
            ui.style_mut().spacing.item_spacing.x = 4.0;
            ui.label(
                RichText::new(format!("[{}]", level_str))
                    .color(color)
                    .monospace(),
            );
            ui.label(RichText::new(&log.message).monospace());
            ui.label(
                RichText::new(format!("({})", &log.target))
                    .color(Color32::from_rgb(100, 160, 180))
                    .monospace(),
            );
        })
        .response;

    layout_response.on_hover_text(format!(
        "Timestamp: {}\nTarget: {}",
        log.timestamp.format("%Y-%m-%d %H:%M:%S %Z"),
        log.target
    ));
}

fn level_to_style(level: Level) -> (&'static str, Color32) {
    match level {
        Level::ERROR => ("ERROR", Color32::from_rgb(255, 80, 80)),
        Level::WARN => ("WARN", Color32::from_rgb(255, 215, 0)),
        Level::INFO => ("INFO", Color32::from_rgb(0, 192, 255)),
        Level::DEBUG => ("DEBUG", Color32::from_rgb(128, 128, 128)),
        Level::TRACE => ("TRACE", Color32::from_rgb(150, 100, 200)),
    }
}
