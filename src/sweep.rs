//! The SAIM angle sweep: plan derivation and the per-angle acquisition loop.
//!
//! A sweep visits the start angle up to zero, then zero up past the mirror
//! of the start angle. Every angle is converted to a motor position, the
//! motor is moved and allowed to settle, one frame is snapped, tagged with
//! its angle and filed into a freshly opened acquisition.

use crate::acquisition::{AcquisitionSink, FrameCoords, OpenAcquisition};
use crate::calibration::{CalibrationCoefficients, CalibrationEvaluator};
use crate::error::{ConfigError, SweepError};
use crate::hardware::{Camera, MotorDevice, MotorTarget};
use serde_json::{json, Map};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Set to `true` to stop a running sweep before its next angle.
pub type CancellationToken = Arc<AtomicBool>;

/// Upper bound on planned frames; protects against absurd start/step pairs.
pub const MAX_FRAMES: i64 = 100_000;

#[derive(Debug, Clone, PartialEq)]
pub struct SweepParameters {
    pub start_angle: i32,
    /// Degrees between neighbouring angles. Must be positive.
    pub step: i32,
    /// Recorded with the acquisition; does not change the plan.
    pub double_zero: bool,
    pub name_prefix: String,
    pub save_images: bool,
    pub root_dir: PathBuf,
}

impl Default for SweepParameters {
    fn default() -> Self {
        Self {
            start_angle: 0,
            step: 100,
            double_zero: false,
            name_prefix: String::new(),
            save_images: false,
            root_dir: PathBuf::new(),
        }
    }
}

impl SweepParameters {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.step <= 0 {
            return Err(ConfigError::NonPositiveStep(self.step));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepLeg {
    /// From the start angle up to zero.
    ToZero,
    /// From zero onwards.
    FromZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedAngle {
    /// Position in visiting order, counted across both legs.
    pub index: u32,
    pub leg: SweepLeg,
    pub angle: i64,
}

/// Ordered angles of one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AngleSweepPlan {
    nr_angles: i64,
    entries: Vec<PlannedAngle>,
}

impl AngleSweepPlan {
    pub fn derive(start_angle: i32, step: i32) -> Result<Self, ConfigError> {
        if step <= 0 {
            return Err(ConfigError::NonPositiveStep(step));
        }
        let start = i64::from(start_angle);
        let step = i64::from(step);
        let nr_angles = start.abs() * 2 / step;
        let half = nr_angles / 2;
        let to_zero = half + 1;
        let from_zero = half + (half + 1) + 1;
        let total = to_zero + from_zero;
        if total > MAX_FRAMES {
            return Err(ConfigError::TooManyFrames {
                frames: total,
                limit: MAX_FRAMES,
            });
        }

        let first = (0..to_zero).map(|k| (SweepLeg::ToZero, start + k * step));
        let second = (0..from_zero).map(|k| (SweepLeg::FromZero, k * step));
        let entries = first
            .chain(second)
            .enumerate()
            .map(|(index, (leg, angle))| PlannedAngle {
                index: index as u32,
                leg,
                angle,
            })
            .collect();
        Ok(Self { nr_angles, entries })
    }

    pub fn from_parameters(params: &SweepParameters) -> Result<Self, ConfigError> {
        params.validate()?;
        Self::derive(params.start_angle, params.step)
    }

    /// `|start| * 2 / step`, integer division.
    pub fn nr_angles(&self) -> i64 {
        self.nr_angles
    }

    /// Frame count the acquisition was historically declared with.
    ///
    /// Differs from [`AngleSweepPlan::len`] for every non-trivial sweep; the
    /// acquisition is sized with `len` instead.
    pub fn nominal_frame_count(&self) -> i64 {
        self.nr_angles + 2
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlannedAngle> {
        self.entries.iter()
    }

    pub fn leg(&self, leg: SweepLeg) -> impl Iterator<Item = &PlannedAngle> {
        self.entries.iter().filter(move |p| p.leg == leg)
    }

    pub fn angles(&self) -> Vec<i64> {
        self.entries.iter().map(|p| p.angle).collect()
    }
}

/// Reported before the motor is commanded for each angle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepProgress {
    pub index: u32,
    pub total: u32,
    pub leg: SweepLeg,
    pub angle: i64,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { acquisition: String, frames: u32 },
    /// Stopped through the cancellation token; frames already filed are kept.
    Cancelled { acquisition: String, frames: u32 },
}

impl RunOutcome {
    pub fn acquisition(&self) -> &str {
        match self {
            RunOutcome::Completed { acquisition, .. } | RunOutcome::Cancelled { acquisition, .. } => {
                acquisition
            }
        }
    }

    pub fn frames(&self) -> u32 {
        match self {
            RunOutcome::Completed { frames, .. } | RunOutcome::Cancelled { frames, .. } => *frames,
        }
    }
}

/// The external collaborators a sweep drives.
pub struct SweepHardware<'a> {
    pub motor: &'a mut dyn MotorDevice,
    pub target: &'a MotorTarget,
    pub camera: &'a mut dyn Camera,
    pub sink: &'a mut dyn AcquisitionSink,
}

#[derive(Debug, Clone)]
pub struct AngleSweepSequencer {
    params: SweepParameters,
    plan: AngleSweepPlan,
    evaluator: CalibrationEvaluator,
}

impl AngleSweepSequencer {
    pub fn new(
        params: SweepParameters,
        coeffs: CalibrationCoefficients,
    ) -> Result<Self, ConfigError> {
        let plan = AngleSweepPlan::from_parameters(&params)?;
        Ok(Self {
            params,
            plan,
            evaluator: CalibrationEvaluator::new(coeffs),
        })
    }

    pub fn plan(&self) -> &AngleSweepPlan {
        &self.plan
    }

    pub fn parameters(&self) -> &SweepParameters {
        &self.params
    }

    /// Runs the whole sweep. The acquisition is closed on every exit path.
    pub fn run(
        &self,
        hw: &mut SweepHardware<'_>,
        token: &CancellationToken,
        progress: &mut dyn FnMut(&SweepProgress),
    ) -> Result<RunOutcome, SweepError> {
        let frames = self.plan.len() as u32;
        if i64::from(frames) != self.plan.nominal_frame_count() {
            warn!(
                "计划帧数 {} 与名义帧数 nrAngles + 2 = {} 不一致，采集按计划帧数开启",
                frames,
                self.plan.nominal_frame_count()
            );
        }

        hw.sink.close_all()?;
        let name = hw.sink.unique_name(&self.params.name_prefix)?;
        hw.sink.open(&OpenAcquisition {
            name: name.clone(),
            root: self.params.root_dir.clone(),
            channels: 1,
            slices: 1,
            frames,
            positions: 1,
            show: true,
            save: self.params.save_images,
            summary: self.summary(&hw.target),
        })?;
        info!("开始角度扫描 {}: {} 个角度", name, frames);

        let result = self.run_steps(&name, hw, token, progress);
        let closed = hw.sink.close(&name);
        match (result, closed) {
            (Ok(outcome), Ok(())) => {
                info!("角度扫描 {} 结束: {:?}", name, outcome);
                Ok(outcome)
            }
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!("中止后关闭采集 {} 失败: {}", name, close_err);
                Err(e)
            }
        }
    }

    fn run_steps(
        &self,
        name: &str,
        hw: &mut SweepHardware<'_>,
        token: &CancellationToken,
        progress: &mut dyn FnMut(&SweepProgress),
    ) -> Result<RunOutcome, SweepError> {
        let total = self.plan.len() as u32;
        let mut inserted = 0;
        for planned in self.plan.iter() {
            if token.load(Ordering::Relaxed) {
                info!("角度扫描被用户中断，已采集 {} 帧", inserted);
                return Ok(RunOutcome::Cancelled {
                    acquisition: name.to_string(),
                    frames: inserted,
                });
            }
            let position = self.evaluator.position_for_angle(planned.angle as f64);
            info!(
                "Image: {}, angle: {}, val: {}",
                planned.index, planned.angle, position
            );
            progress(&SweepProgress {
                index: planned.index,
                total,
                leg: planned.leg,
                angle: planned.angle,
                position,
            });

            hw.motor
                .set_position(&hw.target.device, &hw.target.property, position)?;
            hw.motor.wait_for_settle(&hw.target.device)?;
            let mut frame = hw.camera.capture_frame()?;
            frame.tag_angle(planned.angle);
            hw.sink
                .insert_frame(name, FrameCoords::frame(planned.index), frame)?;
            inserted += 1;
        }
        Ok(RunOutcome::Completed {
            acquisition: name.to_string(),
            frames: inserted,
        })
    }

    fn summary(&self, target: &MotorTarget) -> Map<String, serde_json::Value> {
        let mut summary = Map::new();
        summary.insert("Prefix".into(), json!(self.params.name_prefix));
        summary.insert("StartAngle".into(), json!(self.params.start_angle));
        summary.insert("AngleStepSize".into(), json!(self.params.step));
        summary.insert("DoubleZero".into(), json!(self.params.double_zero));
        summary.insert(
            "NominalFrames".into(),
            json!(self.plan.nominal_frame_count()),
        );
        summary.insert("Device".into(), json!(target.device));
        summary.insert("Property".into(), json!(target.property));
        summary.insert(
            "Coefficients".into(),
            json!(self.evaluator.coefficients().as_array()),
        );
        summary.insert("StartTime".into(), json!(chrono::Local::now().to_rfc3339()));
        summary
    }
}

/// Validates the inputs, then runs one sweep against `hw`.
pub fn run_sweep(
    params: &SweepParameters,
    coeffs: &CalibrationCoefficients,
    hw: &mut SweepHardware<'_>,
    token: &CancellationToken,
    progress: &mut dyn FnMut(&SweepProgress),
) -> Result<RunOutcome, SweepError> {
    AngleSweepSequencer::new(params.clone(), *coeffs)?.run(hw, token, progress)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leg_angles(plan: &AngleSweepPlan, leg: SweepLeg) -> Vec<i64> {
        plan.leg(leg).map(|p| p.angle).collect()
    }

    #[test]
    fn symmetric_sweep_from_minus_fifty() {
        let plan = AngleSweepPlan::derive(-50, 10).unwrap();
        assert_eq!(plan.nr_angles(), 10);
        assert_eq!(
            leg_angles(&plan, SweepLeg::ToZero),
            vec![-50, -40, -30, -20, -10, 0]
        );
        assert_eq!(
            leg_angles(&plan, SweepLeg::FromZero),
            vec![0, 10, 20, 30, 40, 50, 60]
        );
        assert_eq!(plan.len(), 13);
        assert_eq!(plan.nominal_frame_count(), 12);
    }

    #[test]
    fn indices_run_across_both_legs() {
        let plan = AngleSweepPlan::derive(-50, 10).unwrap();
        let indices: Vec<u32> = plan.iter().map(|p| p.index).collect();
        assert_eq!(indices, (0..13).collect::<Vec<u32>>());
        assert_eq!(plan.iter().nth(6).unwrap().leg, SweepLeg::FromZero);
    }

    #[test]
    fn zero_start_still_visits_three_angles() {
        let plan = AngleSweepPlan::derive(0, 10).unwrap();
        assert_eq!(plan.nr_angles(), 0);
        assert_eq!(plan.angles(), vec![0, 0, 10]);
    }

    #[test]
    fn positive_start_and_uneven_step() {
        // nrAngles = 70 / 10 = 7, half = 3
        let plan = AngleSweepPlan::derive(35, 10).unwrap();
        assert_eq!(leg_angles(&plan, SweepLeg::ToZero), vec![35, 45, 55, 65]);
        assert_eq!(
            leg_angles(&plan, SweepLeg::FromZero),
            vec![0, 10, 20, 30, 40, 50, 60, 70]
        );
        assert_eq!(plan.nominal_frame_count(), 9);
    }

    #[test]
    fn leg_lengths_follow_the_loop_bounds() {
        for (start, step) in [(-50, 10), (-45, 10), (-400, 7), (13, 400), (-1, 1)] {
            let plan = AngleSweepPlan::derive(start, step).unwrap();
            let half = (i64::from(start).abs() * 2 / i64::from(step)) / 2;
            assert_eq!(plan.leg(SweepLeg::ToZero).count() as i64, half + 1);
            assert_eq!(plan.leg(SweepLeg::FromZero).count() as i64, 2 * half + 2);
        }
    }

    #[test]
    fn step_must_be_positive() {
        assert_eq!(
            AngleSweepPlan::derive(-50, 0),
            Err(ConfigError::NonPositiveStep(0))
        );
        assert_eq!(
            AngleSweepPlan::derive(-50, -10),
            Err(ConfigError::NonPositiveStep(-10))
        );
    }

    #[test]
    fn oversized_plans_are_rejected() {
        assert!(matches!(
            AngleSweepPlan::derive(i32::MIN, 1),
            Err(ConfigError::TooManyFrames { .. })
        ));
    }

    #[test]
    fn outcome_accessors() {
        let outcome = RunOutcome::Cancelled {
            acquisition: "saim_1".to_string(),
            frames: 4,
        };
        assert_eq!(outcome.acquisition(), "saim_1");
        assert_eq!(outcome.frames(), 4);
    }
}
