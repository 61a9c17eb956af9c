//! Persisted panel settings over an opaque string key/value store.

use crate::calibration::{format_coefficient, CalibrationCoefficients, CalibrationObserver};
use crate::error::ConfigError;
use crate::hardware::MotorTarget;
use crate::sweep::SweepParameters;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

pub const ANGLE_STEP_SIZE: &str = "acq.anglestepsize";
pub const START_ANGLE: &str = "acq.startangle";
pub const END_ANGLE: &str = "acq.endangle";
pub const DOUBLE_ZERO: &str = "acq.doublezero";
pub const SAVE_IMAGES: &str = "acq.saveimages";
pub const DIR_ROOT: &str = "acq.dirroot";
pub const NAME_PREFIX: &str = "acq.nameprefix";
/// Coefficient keys, highest power first.
pub const COEFFS: [&str; 4] = ["acq.coeff3", "acq.coeff2", "acq.coeff1", "acq.coeff0"];
pub const MOTOR_DEVICE: &str = "acq.motordevice";
pub const MOTOR_PROPERTY: &str = "acq.motorproperty";

pub trait PreferenceStore {
    fn get_string(&self, key: &str) -> Option<String>;
    fn set_string(&mut self, key: &str, value: String);
}

impl PreferenceStore for BTreeMap<String, String> {
    fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }

    fn set_string(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

impl PreferenceStore for dyn eframe::Storage + '_ {
    fn get_string(&self, key: &str) -> Option<String> {
        eframe::Storage::get_string(self, key)
    }

    fn set_string(&mut self, key: &str, value: String) {
        eframe::Storage::set_string(self, key, value)
    }
}

/// Everything the acquisition panel remembers between sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    pub angle_step: i32,
    pub start_angle: i32,
    pub end_angle: i32,
    pub double_zero: bool,
    pub save_images: bool,
    pub dir_root: String,
    pub name_prefix: String,
    /// Raw text of the x^3, x^2, x, x^0 fields.
    pub coeff_texts: [String; 4],
    pub motor: MotorTarget,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            angle_step: 100,
            start_angle: 0,
            end_angle: 0,
            double_zero: false,
            save_images: false,
            dir_root: String::new(),
            name_prefix: String::new(),
            coeff_texts: Default::default(),
            motor: MotorTarget::default(),
        }
    }
}

fn parsed_or<S, T>(store: &S, key: &str, default: T) -> T
where
    S: PreferenceStore + ?Sized,
    T: FromStr,
{
    match store.get_string(key) {
        None => default,
        Some(text) => text.trim().parse().unwrap_or_else(|_| {
            warn!("偏好设置 {} 的值 {:?} 无效，使用默认值", key, text);
            default
        }),
    }
}

impl AcquisitionSettings {
    pub fn load<S: PreferenceStore + ?Sized>(store: &S) -> Self {
        let defaults = Self::default();
        Self {
            angle_step: parsed_or(store, ANGLE_STEP_SIZE, defaults.angle_step),
            start_angle: parsed_or(store, START_ANGLE, defaults.start_angle),
            end_angle: parsed_or(store, END_ANGLE, defaults.end_angle),
            double_zero: parsed_or(store, DOUBLE_ZERO, defaults.double_zero),
            save_images: parsed_or(store, SAVE_IMAGES, defaults.save_images),
            dir_root: store.get_string(DIR_ROOT).unwrap_or(defaults.dir_root),
            name_prefix: store.get_string(NAME_PREFIX).unwrap_or(defaults.name_prefix),
            coeff_texts: COEFFS.map(|key| store.get_string(key).unwrap_or_default()),
            motor: MotorTarget {
                device: store
                    .get_string(MOTOR_DEVICE)
                    .unwrap_or(defaults.motor.device),
                property: store
                    .get_string(MOTOR_PROPERTY)
                    .unwrap_or(defaults.motor.property),
            },
        }
    }

    pub fn store<S: PreferenceStore + ?Sized>(&self, store: &mut S) {
        store.set_string(ANGLE_STEP_SIZE, self.angle_step.to_string());
        store.set_string(START_ANGLE, self.start_angle.to_string());
        store.set_string(END_ANGLE, self.end_angle.to_string());
        store.set_string(DOUBLE_ZERO, self.double_zero.to_string());
        store.set_string(SAVE_IMAGES, self.save_images.to_string());
        store.set_string(DIR_ROOT, self.dir_root.clone());
        store.set_string(NAME_PREFIX, self.name_prefix.clone());
        for (key, text) in COEFFS.iter().zip(&self.coeff_texts) {
            store.set_string(key, text.clone());
        }
        store.set_string(MOTOR_DEVICE, self.motor.device.clone());
        store.set_string(MOTOR_PROPERTY, self.motor.property.clone());
    }

    pub fn coefficients(&self) -> Result<CalibrationCoefficients, ConfigError> {
        let [x3, x2, x1, x0] = &self.coeff_texts;
        CalibrationCoefficients::parse([x3.as_str(), x2.as_str(), x1.as_str(), x0.as_str()])
    }

    /// Replaces the coefficient texts with the display form of `coeffs`.
    pub fn set_coefficients(&mut self, coeffs: &CalibrationCoefficients) {
        self.coeff_texts = coeffs.as_array().map(format_coefficient);
    }

    pub fn sweep_parameters(&self) -> SweepParameters {
        SweepParameters {
            start_angle: self.start_angle,
            step: self.angle_step,
            double_zero: self.double_zero,
            name_prefix: self.name_prefix.clone(),
            save_images: self.save_images,
            root_dir: PathBuf::from(&self.dir_root),
        }
    }
}

impl CalibrationObserver for AcquisitionSettings {
    fn calibration_changed(&mut self, coeffs: CalibrationCoefficients) {
        self.set_coefficients(&coeffs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_gives_defaults() {
        let store: BTreeMap<String, String> = BTreeMap::new();
        let settings = AcquisitionSettings::load(&store);
        assert_eq!(settings, AcquisitionSettings::default());
        assert_eq!(settings.angle_step, 100);
        assert_eq!(settings.motor.device, "TITIRF");
    }

    #[test]
    fn settings_survive_a_store_and_load() {
        let mut settings = AcquisitionSettings {
            angle_step: 10,
            start_angle: -50,
            end_angle: 50,
            double_zero: true,
            save_images: true,
            dir_root: "/data/saim".to_string(),
            name_prefix: "cells".to_string(),
            ..Default::default()
        };
        settings.coeff_texts = [
            "0.0001".to_string(),
            "-0.02".to_string(),
            "3".to_string(),
            "1200".to_string(),
        ];
        let mut store: BTreeMap<String, String> = BTreeMap::new();
        settings.store(&mut store);
        assert_eq!(AcquisitionSettings::load(&store), settings);
    }

    #[test]
    fn each_coefficient_has_its_own_key() {
        let mut settings = AcquisitionSettings::default();
        settings.coeff_texts = ["3", "2", "1", "0"].map(String::from);
        let mut store: BTreeMap<String, String> = BTreeMap::new();
        settings.store(&mut store);
        assert_eq!(store["acq.coeff3"], "3");
        assert_eq!(store["acq.coeff2"], "2");
        assert_eq!(store["acq.coeff1"], "1");
        assert_eq!(store["acq.coeff0"], "0");
    }

    #[test]
    fn malformed_values_fall_back_to_defaults() {
        let mut store: BTreeMap<String, String> = BTreeMap::new();
        store.set_string(ANGLE_STEP_SIZE, "ten".to_string());
        store.set_string(START_ANGLE, " -40 ".to_string());
        store.set_string(SAVE_IMAGES, "yes".to_string());
        let settings = AcquisitionSettings::load(&store);
        assert_eq!(settings.angle_step, 100);
        assert_eq!(settings.start_angle, -40);
        assert!(!settings.save_images);
    }

    #[test]
    fn coefficient_texts_are_parsed_on_demand() {
        let mut settings = AcquisitionSettings::default();
        assert!(settings.coefficients().is_err());
        settings.set_coefficients(&CalibrationCoefficients::new(0.0, 0.0, 2.0, 5.0).unwrap());
        assert_eq!(settings.coeff_texts, ["0", "0", "2", "5"].map(String::from));
        assert_eq!(settings.coefficients().unwrap().as_array(), [0.0, 0.0, 2.0, 5.0]);
    }

    #[test]
    fn sweep_parameters_mirror_the_settings() {
        let settings = AcquisitionSettings {
            angle_step: 10,
            start_angle: -50,
            name_prefix: "run".to_string(),
            dir_root: "/tmp/x".to_string(),
            ..Default::default()
        };
        let params = settings.sweep_parameters();
        assert_eq!(params.step, 10);
        assert_eq!(params.start_angle, -50);
        assert_eq!(params.root_dir, PathBuf::from("/tmp/x"));
        assert!(params.validate().is_ok());
    }

    #[test]
    fn repeated_calibration_updates_are_idempotent() {
        let coeffs = CalibrationCoefficients::new(1.5e-5, -0.003, 12.25, 1024.0).unwrap();
        let mut settings = AcquisitionSettings::default();
        settings.calibration_changed(coeffs);
        let first = settings.clone();
        settings.calibration_changed(coeffs);
        assert_eq!(settings, first);
        assert_eq!(
            settings.coeff_texts,
            ["0.000015", "-0.003", "12.25", "1024"].map(String::from)
        );
        assert_eq!(settings.coefficients().unwrap(), coeffs);
    }
}
