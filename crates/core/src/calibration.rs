//! Raw-to-screen calibration.
//!
//! The model is an independent offset/scale per axis:
//! `screen = raw * scale + offset`. Fitting is ordinary least squares on each
//! axis, which is deterministic for identical input.

use crate::sample::Sample;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_CALIBRATION_POINTS: usize = 4;

const COINCIDENT_EPSILON: f64 = 1e-12;
// Per-axis variance below this share of the total spread means the points lie on an axis-aligned line.
const AXIS_SPREAD_EPSILON: f64 = 1e-12;
// Squared correlation of raw x and y above `1 - COLINEAR_EPSILON` means a sloped line.
// Independent of the relative units of the two raw axes.
const COLINEAR_EPSILON: f64 = 1e-6;
const SCALE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationState {
    Uncalibrated,
    Calibrating,
    Calibrated,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("insufficient calibration points: got {got}, need at least {needed}")]
    InsufficientPoints { got: usize, needed: usize },
    #[error("degenerate calibration geometry: {0}")]
    DegenerateGeometry(&'static str),
}

/// One raw observation paired with the screen point the user was looking at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub raw_x: f64,
    pub raw_y: f64,
    pub target_x: f64,
    pub target_y: f64,
}

impl CalibrationPoint {
    pub fn new(raw_x: f64, raw_y: f64, target_x: f64, target_y: f64) -> Self {
        Self {
            raw_x,
            raw_y,
            target_x,
            target_y,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.raw_x.is_finite()
            && self.raw_y.is_finite()
            && self.target_x.is_finite()
            && self.target_y.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub offset_x: f64,
    pub offset_y: f64,
    pub scale_x: f64,
    pub scale_y: f64,
    pub state: CalibrationState,
    /// Number of point pairs behind the fit; 0 for configured overrides.
    pub points_used: usize,
    /// Root-mean-square residual of the fit, in screen units.
    pub rms_error: f64,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self::identity()
    }
}

impl CalibrationProfile {
    pub fn identity() -> Self {
        Self {
            offset_x: 0.0,
            offset_y: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            state: CalibrationState::Uncalibrated,
            points_used: 0,
            rms_error: 0.0,
        }
    }

    /// Build a calibrated profile from operator-supplied coefficients.
    pub fn from_overrides(
        offset_x: f64,
        offset_y: f64,
        scale_x: f64,
        scale_y: f64,
    ) -> Result<Self, CalibrationError> {
        if !(offset_x.is_finite() && offset_y.is_finite()) {
            return Err(CalibrationError::DegenerateGeometry(
                "offset override is not finite",
            ));
        }
        check_scale(scale_x)?;
        check_scale(scale_y)?;
        Ok(Self {
            offset_x,
            offset_y,
            scale_x,
            scale_y,
            state: CalibrationState::Calibrated,
            points_used: 0,
            rms_error: 0.0,
        })
    }

    pub fn is_calibrated(&self) -> bool {
        self.state == CalibrationState::Calibrated
    }

    pub fn with_state(mut self, state: CalibrationState) -> Self {
        self.state = state;
        self
    }

    pub fn map_point(&self, x: f64, y: f64) -> (f64, f64) {
        (
            x * self.scale_x + self.offset_x,
            y * self.scale_y + self.offset_y,
        )
    }

    /// Map a sample into screen space. Pure; everything except x/y is preserved.
    pub fn apply(&self, sample: &Sample) -> Sample {
        let (x, y) = self.map_point(sample.x, sample.y);
        Sample { x, y, ..*sample }
    }
}

fn check_scale(scale: f64) -> Result<(), CalibrationError> {
    if scale.is_finite() && scale.abs() > SCALE_EPSILON {
        Ok(())
    } else {
        Err(CalibrationError::DegenerateGeometry(
            "scale factor is zero or not finite",
        ))
    }
}

pub fn calibrate(points: &[CalibrationPoint]) -> Result<CalibrationProfile, CalibrationError> {
    if points.len() < MIN_CALIBRATION_POINTS {
        return Err(CalibrationError::InsufficientPoints {
            got: points.len(),
            needed: MIN_CALIBRATION_POINTS,
        });
    }
    if points.iter().any(|p| !p.is_finite()) {
        return Err(CalibrationError::DegenerateGeometry(
            "calibration point is not finite",
        ));
    }

    let n = points.len() as f64;
    let mean = |f: fn(&CalibrationPoint) -> f64| points.iter().map(f).sum::<f64>() / n;
    let mean_rx = mean(|p| p.raw_x);
    let mean_ry = mean(|p| p.raw_y);
    let mean_tx = mean(|p| p.target_x);
    let mean_ty = mean(|p| p.target_y);

    let (mut sxx, mut syy, mut sxy, mut sxt, mut syt) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for p in points {
        let dx = p.raw_x - mean_rx;
        let dy = p.raw_y - mean_ry;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
        sxt += dx * (p.target_x - mean_tx);
        syt += dy * (p.target_y - mean_ty);
    }

    let spread = sxx + syy;
    if spread <= COINCIDENT_EPSILON {
        return Err(CalibrationError::DegenerateGeometry(
            "raw points are coincident",
        ));
    }
    if sxx <= AXIS_SPREAD_EPSILON * spread || syy <= AXIS_SPREAD_EPSILON * spread {
        return Err(CalibrationError::DegenerateGeometry(
            "raw points are colinear",
        ));
    }
    let correlation = (sxy * sxy) / (sxx * syy);
    if correlation > 1.0 - COLINEAR_EPSILON {
        return Err(CalibrationError::DegenerateGeometry(
            "raw points are colinear",
        ));
    }

    let scale_x = sxt / sxx;
    let scale_y = syt / syy;
    check_scale(scale_x)?;
    check_scale(scale_y)?;
    let offset_x = mean_tx - scale_x * mean_rx;
    let offset_y = mean_ty - scale_y * mean_ry;

    let sq_err: f64 = points
        .iter()
        .map(|p| {
            let ex = p.raw_x * scale_x + offset_x - p.target_x;
            let ey = p.raw_y * scale_y + offset_y - p.target_y;
            ex * ex + ey * ey
        })
        .sum();

    Ok(CalibrationProfile {
        offset_x,
        offset_y,
        scale_x,
        scale_y,
        state: CalibrationState::Calibrated,
        points_used: points.len(),
        rms_error: (sq_err / n).sqrt(),
    })
}

/// Point pairs collected while the service is calibrating.
#[derive(Debug, Default, Clone)]
pub struct CalibrationSession {
    points: Vec<CalibrationPoint>,
}

impl CalibrationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_point(&mut self, point: CalibrationPoint) -> usize {
        self.points.push(point);
        self.points.len()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    pub fn finish(&self) -> Result<CalibrationProfile, CalibrationError> {
        calibrate(&self.points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::RawSample;
    use std::time::Instant;

    fn screen_pairs() -> Vec<CalibrationPoint> {
        // Normalized camera space onto a 1920x1080 screen with a small shift.
        [(0.2, 0.2), (0.8, 0.2), (0.2, 0.8), (0.8, 0.8)]
            .into_iter()
            .map(|(rx, ry)| CalibrationPoint::new(rx, ry, rx * 1920.0 + 15.0, ry * 1080.0 - 8.0))
            .collect()
    }

    #[test]
    fn four_spread_points_fit_within_tolerance() {
        let pairs = screen_pairs();
        let profile = calibrate(&pairs).expect("fit succeeds");
        assert_eq!(profile.state, CalibrationState::Calibrated);
        assert_eq!(profile.points_used, 4);
        assert!(profile.rms_error < 1e-6);

        for p in &pairs {
            let raw = Sample::from_raw(&RawSample::new(p.raw_x, p.raw_y, 0.9), 1, Instant::now(), 0.0);
            let mapped = profile.apply(&raw);
            assert!((mapped.x - p.target_x).abs() < 1e-6, "x {} vs {}", mapped.x, p.target_x);
            assert!((mapped.y - p.target_y).abs() < 1e-6, "y {} vs {}", mapped.y, p.target_y);
            assert_eq!(mapped.confidence, 0.9);
            assert_eq!(mapped.seq, 1);
        }
    }

    #[test]
    fn noisy_points_still_fit_close_to_targets() {
        let mut pairs = screen_pairs();
        pairs.push(CalibrationPoint::new(0.5, 0.5, 0.5 * 1920.0 + 15.0 + 4.0, 0.5 * 1080.0 - 8.0 - 3.0));
        let profile = calibrate(&pairs).expect("fit succeeds");
        for p in &pairs {
            let (x, y) = profile.map_point(p.raw_x, p.raw_y);
            assert!((x - p.target_x).abs() < 5.0);
            assert!((y - p.target_y).abs() < 5.0);
        }
        assert!(profile.rms_error > 0.0);
    }

    #[test]
    fn three_points_are_insufficient() {
        let pairs = &screen_pairs()[..3];
        assert_eq!(
            calibrate(pairs),
            Err(CalibrationError::InsufficientPoints { got: 3, needed: 4 })
        );
    }

    #[test]
    fn colinear_points_are_degenerate() {
        let pairs: Vec<_> = (0..4)
            .map(|i| {
                let v = i as f64 * 0.25;
                CalibrationPoint::new(v, v, v * 100.0, v * 100.0)
            })
            .collect();
        assert!(matches!(
            calibrate(&pairs),
            Err(CalibrationError::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn anisotropic_rectangle_is_not_colinear() {
        // Raw x spans 1000 units while raw y spans 1.
        let pairs: Vec<_> = [(0.0, 0.0), (1000.0, 0.0), (0.0, 1.0), (1000.0, 1.0)]
            .into_iter()
            .map(|(rx, ry)| CalibrationPoint::new(rx, ry, rx * 1.92, ry * 1080.0))
            .collect();
        let profile = calibrate(&pairs).expect("rectangle should fit");
        assert!((profile.scale_x - 1.92).abs() < 1e-9);
        assert!((profile.scale_y - 1080.0).abs() < 1e-9);
        assert!(profile.offset_x.abs() < 1e-9 && profile.offset_y.abs() < 1e-9);
        assert!(profile.rms_error < 1e-9);

        let sloped: Vec<_> = (0..4)
            .map(|i| {
                let rx = i as f64 * 1000.0;
                CalibrationPoint::new(rx, i as f64 * 0.001, rx, i as f64)
            })
            .collect();
        assert_eq!(
            calibrate(&sloped),
            Err(CalibrationError::DegenerateGeometry("raw points are colinear"))
        );
    }

    #[test]
    fn axis_aligned_and_coincident_points_are_degenerate() {
        let horizontal: Vec<_> = (0..4)
            .map(|i| CalibrationPoint::new(i as f64, 0.5, i as f64 * 10.0, 300.0))
            .collect();
        assert!(matches!(
            calibrate(&horizontal),
            Err(CalibrationError::DegenerateGeometry(_))
        ));

        let same = vec![CalibrationPoint::new(0.5, 0.5, 100.0, 100.0); 5];
        assert_eq!(
            calibrate(&same),
            Err(CalibrationError::DegenerateGeometry("raw points are coincident"))
        );
    }

    #[test]
    fn collapsed_targets_are_rejected() {
        let pairs: Vec<_> = screen_pairs()
            .into_iter()
            .map(|p| CalibrationPoint { target_x: 500.0, ..p })
            .collect();
        assert!(matches!(
            calibrate(&pairs),
            Err(CalibrationError::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn fit_is_deterministic() {
        let pairs = screen_pairs();
        assert_eq!(calibrate(&pairs), calibrate(&pairs));
    }

    #[test]
    fn overrides_reject_zero_scale() {
        assert!(CalibrationProfile::from_overrides(10.0, 20.0, 0.0, 1.0).is_err());
        let profile = CalibrationProfile::from_overrides(10.0, 20.0, 2.0, 3.0).unwrap();
        assert!(profile.is_calibrated());
        assert_eq!(profile.map_point(1.0, 1.0), (12.0, 23.0));
    }

    #[test]
    fn session_collects_points_then_fits() {
        let mut session = CalibrationSession::new();
        assert!(session.is_empty());
        for p in screen_pairs() {
            session.add_point(p);
        }
        assert_eq!(session.len(), 4);
        assert!(session.finish().unwrap().is_calibrated());
    }
}
