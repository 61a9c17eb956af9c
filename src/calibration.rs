//! Angle → motor position calibration.
//!
//! The TIRF motor only accepts integral positions, so the cubic model is
//! evaluated in floating point and rounded half away from zero.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

const COEFFICIENT_NAMES: [&str; 4] = ["x^3", "x^2", "x", "x^0"];

/// Coefficients of `x3*a^3 + x2*a^2 + x1*a + x0`. Always finite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoefficients")]
pub struct CalibrationCoefficients {
    x3: f64,
    x2: f64,
    x1: f64,
    x0: f64,
}

#[derive(Deserialize)]
struct RawCoefficients {
    x3: f64,
    x2: f64,
    x1: f64,
    x0: f64,
}

impl TryFrom<RawCoefficients> for CalibrationCoefficients {
    type Error = ConfigError;

    fn try_from(raw: RawCoefficients) -> Result<Self, Self::Error> {
        Self::new(raw.x3, raw.x2, raw.x1, raw.x0)
    }
}

impl CalibrationCoefficients {
    pub fn new(x3: f64, x2: f64, x1: f64, x0: f64) -> Result<Self, ConfigError> {
        for (name, value) in COEFFICIENT_NAMES.into_iter().zip([x3, x2, x1, x0]) {
            if !value.is_finite() {
                return Err(ConfigError::NonFiniteCoefficient { name });
            }
        }
        Ok(Self { x3, x2, x1, x0 })
    }

    /// Parses the four coefficient fields, highest power first.
    pub fn parse(texts: [&str; 4]) -> Result<Self, ConfigError> {
        let mut values = [0.0; 4];
        for ((slot, text), name) in values.iter_mut().zip(texts).zip(COEFFICIENT_NAMES) {
            *slot = text
                .trim()
                .parse::<f64>()
                .map_err(|_| ConfigError::InvalidCoefficient {
                    name,
                    text: text.to_string(),
                })?;
        }
        Self::new(values[0], values[1], values[2], values[3])
    }

    /// Highest power first, same order as [`CalibrationCoefficients::parse`].
    pub fn as_array(&self) -> [f64; 4] {
        [self.x3, self.x2, self.x1, self.x0]
    }

    pub fn display_texts(&self) -> [String; 4] {
        self.as_array().map(format_coefficient)
    }

    fn evaluate(&self, angle: f64) -> f64 {
        self.x3 * angle.powi(3) + self.x2 * angle.powi(2) + self.x1 * angle + self.x0
    }
}

/// Motor position for `angle`, rounded half away from zero.
///
/// Values beyond the `i64` range saturate.
pub fn position_for_angle(angle: f64, coeffs: &CalibrationCoefficients) -> i64 {
    coeffs.evaluate(angle).round() as i64
}

#[derive(Debug, Clone, Copy)]
pub struct CalibrationEvaluator {
    coeffs: CalibrationCoefficients,
}

impl CalibrationEvaluator {
    pub fn new(coeffs: CalibrationCoefficients) -> Self {
        Self { coeffs }
    }

    pub fn coefficients(&self) -> &CalibrationCoefficients {
        &self.coeffs
    }

    pub fn position_for_angle(&self, angle: f64) -> i64 {
        position_for_angle(angle, &self.coeffs)
    }

    /// Unrounded model sampled at `samples` evenly spaced angles in `[from, to]`.
    pub fn curve(&self, from: f64, to: f64, samples: usize) -> Vec<[f64; 2]> {
        match samples {
            0 => Vec::new(),
            1 => vec![[from, self.coeffs.evaluate(from)]],
            n => {
                let step = (to - from) / (n - 1) as f64;
                (0..n)
                    .map(|i| {
                        let angle = from + step * i as f64;
                        [angle, self.coeffs.evaluate(angle)]
                    })
                    .collect()
            }
        }
    }
}

/// Receives coefficient sets produced by a calibration procedure.
pub trait CalibrationObserver {
    fn calibration_changed(&mut self, coeffs: CalibrationCoefficients);
}

/// Formats like the `0.#########` decimal pattern: at most nine fractional
/// digits, no trailing zeros, and never a bare `-0`.
pub fn format_coefficient(value: f64) -> String {
    let mut text = format!("{:.9}", value);
    if text.contains('.') {
        let trimmed = text.trim_end_matches('0').trim_end_matches('.').len();
        text.truncate(trimmed);
    }
    if text == "-0" {
        text = "0".to_string();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coeffs(x3: f64, x2: f64, x1: f64, x0: f64) -> CalibrationCoefficients {
        CalibrationCoefficients::new(x3, x2, x1, x0).unwrap()
    }

    #[test]
    fn linear_model() {
        assert_eq!(position_for_angle(10.0, &coeffs(0.0, 0.0, 2.0, 5.0)), 25);
    }

    #[test]
    fn cubic_model() {
        // 0.5*8 - 1*4 + 3*2 + 1 = 7
        assert_eq!(position_for_angle(2.0, &coeffs(0.5, -1.0, 3.0, 1.0)), 7);
        assert_eq!(position_for_angle(-2.0, &coeffs(1.0, 0.0, 0.0, 0.0)), -8);
    }

    #[test]
    fn ties_round_away_from_zero() {
        assert_eq!(position_for_angle(0.0, &coeffs(0.0, 0.0, 0.0, 2.5)), 3);
        assert_eq!(position_for_angle(0.0, &coeffs(0.0, 0.0, 0.0, -2.5)), -3);
        assert_eq!(position_for_angle(1.0, &coeffs(0.0, 0.0, 0.5, 0.0)), 1);
        assert_eq!(position_for_angle(-1.0, &coeffs(0.0, 0.0, 0.5, 0.0)), -1);
        assert_eq!(position_for_angle(0.0, &coeffs(0.0, 0.0, 0.0, 2.49)), 2);
    }

    #[test]
    fn parse_accepts_whitespace_and_scientific_notation() {
        let parsed = CalibrationCoefficients::parse([" 1e-6", "0", "-3.5 ", "1200"]).unwrap();
        assert_eq!(parsed.as_array(), [1e-6, 0.0, -3.5, 1200.0]);
    }

    #[test]
    fn parse_names_the_bad_field() {
        let err = CalibrationCoefficients::parse(["0", "0", "abc", "1"]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidCoefficient {
                name: "x",
                text: "abc".to_string()
            }
        );
        assert!(CalibrationCoefficients::parse(["", "0", "0", "0"]).is_err());
    }

    #[test]
    fn non_finite_values_are_rejected() {
        assert_eq!(
            CalibrationCoefficients::new(0.0, f64::NAN, 0.0, 0.0),
            Err(ConfigError::NonFiniteCoefficient { name: "x^2" })
        );
        assert!(CalibrationCoefficients::parse(["inf", "0", "0", "0"]).is_err());
    }

    #[test]
    fn deserialize_validates() {
        let ok: CalibrationCoefficients =
            serde_json::from_str(r#"{"x3":0.0,"x2":0.001,"x1":2.0,"x0":5.0}"#).unwrap();
        assert_eq!(ok.as_array(), [0.0, 0.001, 2.0, 5.0]);
        assert!(serde_json::from_str::<CalibrationCoefficients>(r#"{"x3":0.0}"#).is_err());
    }

    #[test]
    fn coefficient_formatting() {
        assert_eq!(format_coefficient(2.0), "2");
        assert_eq!(format_coefficient(0.5), "0.5");
        assert_eq!(format_coefficient(-12.25), "-12.25");
        assert_eq!(format_coefficient(1.234_567_891_2), "1.234567891");
        assert_eq!(format_coefficient(1e-9), "0.000000001");
        assert_eq!(format_coefficient(-1e-12), "0");
        assert_eq!(format_coefficient(0.0), "0");
    }

    #[test]
    fn curve_spans_the_requested_range() {
        let evaluator = CalibrationEvaluator::new(coeffs(0.0, 0.0, 2.0, 5.0));
        let curve = evaluator.curve(-10.0, 10.0, 5);
        assert_eq!(curve.len(), 5);
        assert_eq!(curve[0], [-10.0, -15.0]);
        assert_eq!(curve[2], [0.0, 5.0]);
        assert_eq!(curve[4], [10.0, 25.0]);
        assert!(evaluator.curve(0.0, 1.0, 0).is_empty());
        assert_eq!(evaluator.position_for_angle(10.0), 25);
    }
}
