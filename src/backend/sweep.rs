use super::{frame_to_color_image, Arc, BackendState, Mutex, SweepState};
use crate::communication::{DeviceUpdate, GeneralUpdate, SweepRequest, SweepUpdate, Update};
use anyhow::{anyhow, bail, Result};
use crossbeam_channel::Sender;
use saim_control::{
    run_sweep, AcquisitionError, AcquisitionSink, AcquisitionStore, CancellationToken,
    FrameCoords, OpenAcquisition, SweepHardware, SweepProgress,
};
use saim_control::Frame;
use std::sync::atomic::Ordering;
use tracing::{error, info};

impl SweepState {
    /// Reserves the single sweep slot for `token`.
    pub fn claim(&mut self, token: CancellationToken) -> Result<()> {
        if self.task_token.is_some() {
            bail!("已有角度扫描在进行，拒绝新的运行请求");
        }
        self.task_token = Some(token);
        Ok(())
    }

    pub fn release(&mut self) {
        self.task_token = None;
    }

    /// Cancels the active sweep. Returns false when none is active.
    pub fn abort(&self) -> bool {
        match &self.task_token {
            Some(token) => {
                info!("正在中止角度扫描");
                token.store(true, Ordering::Relaxed);
                true
            }
            None => {
                info!("没有正在进行的角度扫描");
                false
            }
        }
    }
}

/// Frees the sweep slot and resets the panel's toggle however the worker exits.
struct SweepSlot<'a> {
    state: &'a Arc<Mutex<BackendState>>,
    tx: &'a Sender<Update>,
}

impl Drop for SweepSlot<'_> {
    fn drop(&mut self) {
        self.state.lock().sweep.release();
        let _ = self.tx.send(Update::Sweep(SweepUpdate::Running(false)));
    }
}

/// Files frames into the store and mirrors them to the live view when the
/// acquisition asked to be shown.
struct DisplayingSink<'a> {
    store: &'a mut AcquisitionStore,
    tx: &'a Sender<Update>,
    show: bool,
}

impl AcquisitionSink for DisplayingSink<'_> {
    fn close_all(&mut self) -> Result<(), AcquisitionError> {
        self.store.close_all()
    }

    fn unique_name(&mut self, prefix: &str) -> Result<String, AcquisitionError> {
        self.store.unique_name(prefix)
    }

    fn open(&mut self, request: &OpenAcquisition) -> Result<(), AcquisitionError> {
        self.store.open(request)?;
        self.show = request.show;
        Ok(())
    }

    fn insert_frame(
        &mut self,
        name: &str,
        coords: FrameCoords,
        frame: Frame,
    ) -> Result<(), AcquisitionError> {
        self.store.insert_frame(name, coords, frame)?;
        if !self.show {
            return Ok(());
        }
        // 只预览已被采集接受（尺寸已校验）的帧
        let preview = self
            .store
            .get(name)
            .and_then(|acq| acq.frame(&coords))
            .map(|frame| (frame.angle().unwrap_or_default(), frame_to_color_image(frame)));
        if let Some((angle, image)) = preview {
            let _ = self.tx.send(Update::Sweep(SweepUpdate::NewFrame {
                angle,
                image: Arc::new(image),
            }));
        }
        Ok(())
    }

    fn close(&mut self, name: &str) -> Result<(), AcquisitionError> {
        self.store.close(name)
    }
}

/// Runs one sweep on the calling worker thread. The backend loop has already
/// claimed the sweep slot with `token`.
pub fn run(
    state: &Arc<Mutex<BackendState>>,
    tx: &Sender<Update>,
    request: SweepRequest,
    token: CancellationToken,
) -> Result<()> {
    let _slot = SweepSlot { state, tx };
    let (motor, camera, store) = {
        let s = state.lock();
        let motor = s.devices.motor.clone().ok_or_else(|| anyhow!("未连接电机"))?;
        let camera = s.devices.camera.clone().ok_or_else(|| anyhow!("未连接相机"))?;
        (motor, camera, s.sweep.store.clone())
    };
    tx.send(Update::Sweep(SweepUpdate::Running(true)))?;

    let result = {
        // 状态锁已释放，Abort 命令才能拿到令牌
        let mut motor = motor.lock();
        let mut camera = camera.lock();
        let mut store = store.lock();
        let mut sink = DisplayingSink {
            store: &mut *store,
            tx,
            show: false,
        };
        let mut hw = SweepHardware {
            motor: &mut **motor,
            target: &request.target,
            camera: &mut **camera,
            sink: &mut sink,
        };
        let mut last_position = None;
        let result = run_sweep(
            &request.params,
            &request.coeffs,
            &mut hw,
            &token,
            &mut |progress: &SweepProgress| {
                last_position = Some(progress.position);
                let _ = tx.send(Update::Sweep(SweepUpdate::Progress(*progress)));
            },
        );
        if let Some(position) = last_position {
            let _ = tx.send(Update::Device(DeviceUpdate::MotorPosition(position)));
        }
        result
    };

    match result {
        Ok(outcome) => {
            let status = format!("{}: {} 帧", outcome.acquisition(), outcome.frames());
            tx.send(Update::Sweep(SweepUpdate::Finished(outcome)))?;
            tx.send(Update::General(GeneralUpdate::StatusMessage(status)))?;
        }
        Err(e) => {
            error!("角度扫描失败: {}", e);
            tx.send(Update::Sweep(SweepUpdate::Failed(e.to_string())))?;
        }
    }
    Ok(())
}

pub fn abort(state: &Arc<Mutex<BackendState>>) {
    state.lock().sweep.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicBool;

    fn new_token() -> CancellationToken {
        Arc::new(AtomicBool::new(false))
    }

    fn request(name: &str) -> OpenAcquisition {
        OpenAcquisition {
            name: name.to_string(),
            root: Default::default(),
            channels: 1,
            slices: 1,
            frames: 2,
            positions: 1,
            show: true,
            save: false,
            summary: Default::default(),
        }
    }

    #[test]
    fn only_one_sweep_holds_the_slot() {
        let mut sweep = SweepState::new();
        sweep.claim(new_token()).unwrap();
        assert!(sweep.claim(new_token()).is_err());
        sweep.release();
        assert!(sweep.claim(new_token()).is_ok());
    }

    #[test]
    fn abort_cancels_the_claimed_token() {
        let mut sweep = SweepState::new();
        assert!(!sweep.abort());
        let token = new_token();
        sweep.claim(token.clone()).unwrap();
        assert!(sweep.abort());
        assert!(token.load(Ordering::Relaxed));
    }

    #[test]
    fn slot_is_released_when_the_worker_panics() {
        let state = Arc::new(Mutex::new(BackendState::new()));
        let (tx, rx) = unbounded();
        state.lock().sweep.claim(new_token()).unwrap();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _slot = SweepSlot { state: &state, tx: &tx };
            panic!("camera driver crashed");
        }));
        assert!(result.is_err());
        assert!(state.lock().sweep.task_token.is_none());
        assert!(matches!(
            rx.try_recv(),
            Ok(Update::Sweep(SweepUpdate::Running(false)))
        ));
    }

    #[test]
    fn malformed_frames_are_rejected_without_a_preview() {
        let (tx, rx) = unbounded();
        let mut store = AcquisitionStore::new();
        let mut sink = DisplayingSink {
            store: &mut store,
            tx: &tx,
            show: false,
        };
        sink.open(&request("run")).unwrap();

        let short = Frame::new(2, 2, vec![1, 2, 3]);
        assert!(matches!(
            sink.insert_frame("run", FrameCoords::frame(0), short),
            Err(AcquisitionError::ShapeMismatch { .. })
        ));
        assert!(rx.try_recv().is_err());

        let mut good = Frame::new(2, 2, vec![1, 2, 3, 4]);
        good.tag_angle(-10);
        sink.insert_frame("run", FrameCoords::frame(0), good).unwrap();
        match rx.try_recv() {
            Ok(Update::Sweep(SweepUpdate::NewFrame { angle, image })) => {
                assert_eq!(angle, -10);
                assert_eq!(image.size, [2, 2]);
            }
            other => panic!("expected a preview, got {:?}", other),
        }
    }
}
