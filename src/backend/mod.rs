mod camera;
mod command;
mod serial;
mod sweep;

use crate::communication::{AcquisitionCommand, Command, GeneralCommand, GeneralUpdate, Update};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use saim_control::{AcquisitionStore, Camera, CancellationToken, MotorDevice};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info};
use anyhow::Result;

pub use camera::frame_to_color_image;

pub type SharedMotor = Arc<Mutex<Box<dyn MotorDevice + Send>>>;
pub type SharedCamera = Arc<Mutex<Box<dyn Camera + Send>>>;

pub struct BackgroundTask {
    handle: JoinHandle<()>,
    // 每个任务有自己的取消令牌，用于单独取消
    cancellation_token: CancellationToken,
}

#[derive(Default)]
pub struct DeviceState {
    motor: Option<SharedMotor>,
    camera: Option<SharedCamera>,
}

pub struct SweepState {
    /// Present while a sweep runs; at most one sweep at a time.
    task_token: Option<CancellationToken>,
    store: Arc<Mutex<AcquisitionStore>>,
}

pub struct BackendState {
    pub devices: DeviceState,
    pub sweep: SweepState,
    pub shutdown_signal: CancellationToken,
}

impl SweepState {
    fn new() -> Self {
        Self {
            task_token: None,
            store: Arc::new(Mutex::new(AcquisitionStore::new())),
        }
    }
}

impl BackendState {
    fn new() -> Self {
        Self {
            devices: DeviceState::default(),
            sweep: SweepState::new(),
            shutdown_signal: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// 后端主循环：每条命令在自己的工作线程里执行
pub fn backend_loop(cmd_rx: Receiver<Command>, update_tx: Sender<Update>) {
    info!("后端线程已启动");
    let mut active_tasks: Vec<BackgroundTask> = Vec::new();
    let state = Arc::new(Mutex::new(BackendState::new()));
    let global_shutdown_signal = state.lock().shutdown_signal.clone();

    while !global_shutdown_signal.load(Ordering::Relaxed) {
        let Ok(command) = cmd_rx.recv_timeout(Duration::from_millis(200)) else {
            active_tasks.retain(|task| !task.handle.is_finished());
            continue;
        };
        if matches!(&command, Command::General(GeneralCommand::Shutdown)) {
            info!("收到关停指令，将触发全局关停信号。");
            global_shutdown_signal.store(true, Ordering::Relaxed);
            continue;
        }

        active_tasks.retain(|task| !task.handle.is_finished());

        let task_token: CancellationToken = Arc::new(AtomicBool::new(false));
        // 扫描槽位在派发时占用，之后到达的 Abort 一定能找到令牌
        if let Err(e) = reserve_sweep_slot(&command, &state, &task_token) {
            error!("{}", e);
            let _ = update_tx.send(Update::General(GeneralUpdate::Error(e.to_string())));
            continue;
        }
        let state_clone = Arc::clone(&state);
        let update_tx_clone = update_tx.clone();
        let token_clone = task_token.clone();

        let handle = thread::spawn(move || {
            let result = dispatch_command(command, state_clone, &update_tx_clone, token_clone);
            if let Err(e) = result {
                let error_msg = format!("执行命令时出错: {:#}", e);
                error!("{}", error_msg);
                let _ = update_tx_clone.send(Update::General(GeneralUpdate::Error(error_msg)));
            }
        });

        active_tasks.push(BackgroundTask {
            handle,
            cancellation_token: task_token,
        });
    }

    // --- 关停流程 ---
    state.lock().sweep.abort();

    info!("向 {} 个活动任务发送停止信号...", active_tasks.len());
    for task in &active_tasks {
        task.cancellation_token.store(true, Ordering::Relaxed);
    }

    let tasks_to_join = std::mem::take(&mut active_tasks);
    for (i, task) in tasks_to_join.into_iter().enumerate() {
        if let Err(e) = task.handle.join() {
            error!("等待任务 {} 时发生错误: {:?}", i, e);
        }
    }

    {
        let mut state_guard = state.lock();
        state_guard.devices.motor = None;
        state_guard.devices.camera = None;
    }
    info!("后端线程已完全清理并终止");
}

/// Claims the single sweep slot for a Run command before its worker starts.
fn reserve_sweep_slot(
    command: &Command,
    state: &Arc<Mutex<BackendState>>,
    token: &CancellationToken,
) -> Result<()> {
    match command {
        Command::Acquisition(AcquisitionCommand::Run(_)) => state.lock().sweep.claim(token.clone()),
        _ => Ok(()),
    }
}

fn dispatch_command(
    command: Command,
    state: Arc<Mutex<BackendState>>,
    update_tx: &Sender<Update>,
    token: CancellationToken,
) -> Result<()> {
    match command {
        Command::General(cmd) => command::handle_general(cmd, state, update_tx, token),
        Command::Device(cmd) => command::handle_device(cmd, state, update_tx, token),
        Command::Calibration(cmd) => command::handle_calibration(cmd, state, update_tx, token),
        Command::Acquisition(cmd) => command::handle_acquisition(cmd, state, update_tx, token),
    }
}
