//! Trajectory-based course correction.
//!
//! The outlet solver picks the outlet whose *equilibrium* matches the
//! target, but a heavy building may take many hours to get there, and a
//! forecast swing can push it through the target on the way. After the
//! search, the solver simulates a short trajectory and, if it misbehaves,
//! adds a correction sized by the building's own inertia:
//!
//! ```text
//! correction = error * (tau * 4 / eff) * (1 + time_pressure)
//! ```
//!
//! where `error` is `target - min(trajectory)` for an undershoot and
//! `target - max(trajectory)` for an overshoot.

use serde::{Deserialize, Serialize};

use crate::config::ParamBound;
use crate::physics::{ThermalCoefficients, FLOAT_SLACK};
use crate::types::TrajectoryResult;

/// Multiplier applied to `tau / eff` in the correction scale.
pub const CORRECTION_SCALE_FACTOR: f64 = 4.0;

/// Limit of `time_pressure` as the reach time grows without bound.
const TIME_PRESSURE_ASYMPTOTE: f64 = 0.9;

/// How urgently the trajectory needs help, in `[0, 1]`.
///
/// With `r = reaches_target_at / cycle_hours`:
///
/// | reach time | pressure |
/// |---|---|
/// | `r <= 1` | `0.0` |
/// | `1 < r <= 2` | `0.3 * (r - 1)` |
/// | `2 < r <= 4` | `0.3 + 0.15 * (r - 2)` |
/// | `r > 4` | `0.6 + 0.3 * (1 - exp(-(r - 4) / 4))`, approaching `0.9` |
/// | never | `1.0` |
///
/// Continuous and non-decreasing in `r`. Only the 0.3 / 0.6 waypoints are
/// pinned by observed behaviour; the shape between them awaits
/// product-owner confirmation.
pub fn time_pressure(reaches_target_at: Option<f64>, cycle_hours: f64) -> f64 {
    let Some(reach) = reaches_target_at else {
        return 1.0;
    };
    if !(cycle_hours > 0.0) || !reach.is_finite() {
        return 1.0;
    }
    let r = reach / cycle_hours;
    if r <= 1.0 {
        0.0
    } else if r <= 2.0 {
        0.3 * (r - 1.0)
    } else if r <= 4.0 {
        0.3 + 0.15 * (r - 2.0)
    } else {
        0.6 + (TIME_PRESSURE_ASYMPTOTE - 0.6) * (1.0 - (-(r - 4.0) / 4.0).exp())
    }
}

/// `1 + time_pressure`, in `[1, 2]`.
#[inline]
pub fn urgency(time_pressure: f64) -> f64 {
    1.0 + time_pressure.clamp(0.0, 1.0)
}

/// `tau * 4 / eff`: outlet degrees per indoor degree of error.
pub fn correction_scale(coefficients: &ThermalCoefficients) -> Option<f64> {
    let eff = coefficients.outlet_effectiveness;
    if !(eff > 0.0) {
        return None;
    }
    let scale = coefficients.thermal_time_constant * CORRECTION_SCALE_FACTOR / eff;
    scale.is_finite().then_some(scale)
}

/// Per-cycle correction limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectionLimits {
    /// Largest upward correction (positive).
    pub max_increase: f64,
    /// Largest downward correction (positive magnitude).
    pub max_decrease: f64,
}

/// Direction of the worst excursion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Excursion {
    Undershoot,
    Overshoot,
}

/// A correction computed from a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryCorrection {
    pub excursion: Excursion,
    /// `target - min` or `target - max`.
    pub trajectory_error: f64,
    pub time_pressure: f64,
    pub urgency: f64,
    /// Before clamping to the limits.
    pub raw_correction: f64,
    /// After clamping to the limits.
    pub correction: f64,
}

/// `true` if the trajectory reaches the target within one cycle and never
/// leaves `target ± tolerance`.
pub fn trajectory_acceptable(
    trajectory: &TrajectoryResult,
    target: f64,
    cycle_hours: f64,
    tolerance: f64,
) -> bool {
    let band = tolerance + FLOAT_SLACK;
    let reached_in_cycle = trajectory
        .reaches_target_at
        .is_some_and(|t| t <= cycle_hours + FLOAT_SLACK);
    reached_in_cycle && trajectory.trajectory.iter().all(|t| (t - target).abs() <= band)
}

/// Correction for `trajectory`, or `None` when it is acceptable, empty, or
/// the coefficients give no usable scale.
///
/// Both directions are checked; the larger excursion beyond the tolerance
/// band wins.
pub fn compute_correction(
    trajectory: &TrajectoryResult,
    target: f64,
    cycle_hours: f64,
    tolerance: f64,
    coefficients: &ThermalCoefficients,
    limits: CorrectionLimits,
) -> Option<TrajectoryCorrection> {
    if trajectory_acceptable(trajectory, target, cycle_hours, tolerance) {
        return None;
    }
    let min = trajectory.min_temp()?;
    let max = trajectory.max_temp()?;
    let scale = correction_scale(coefficients)?;

    let below = target - min;
    let above = max - target;
    let (excursion, trajectory_error) = if below >= above {
        (Excursion::Undershoot, below)
    } else {
        (Excursion::Overshoot, -above)
    };
    if trajectory_error == 0.0 {
        return None;
    }

    let time_pressure = time_pressure(trajectory.reaches_target_at, cycle_hours);
    let urgency = urgency(time_pressure);
    let raw_correction = trajectory_error * scale * urgency;
    let correction = ParamBound::new(-limits.max_decrease, limits.max_increase).clamp(raw_correction);

    Some(TrajectoryCorrection {
        excursion,
        trajectory_error,
        time_pressure,
        urgency,
        raw_correction,
        correction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const LIMITS: CorrectionLimits = CorrectionLimits {
        max_increase: 10.0,
        max_decrease: 20.0,
    };

    fn traj(points: Vec<f64>, reach: Option<f64>) -> TrajectoryResult {
        TrajectoryResult {
            trajectory: points,
            time_step_hours: 0.5,
            reaches_target_at: reach,
            equilibrium_temp: 21.0,
            overshoot_predicted: false,
        }
    }

    #[test]
    fn time_pressure_waypoints() {
        let cycle = 0.5;
        assert_eq!(time_pressure(Some(0.5), cycle), 0.0);
        assert_relative_eq!(time_pressure(Some(1.0), cycle), 0.3, epsilon = 1e-12);
        assert_relative_eq!(time_pressure(Some(2.0), cycle), 0.6, epsilon = 1e-12);
        assert_eq!(time_pressure(None, cycle), 1.0);
        let far = time_pressure(Some(100.0), cycle);
        assert!(far > 0.85 && far < 0.9);
    }

    #[test]
    fn time_pressure_is_monotonic() {
        let mut prev = 0.0;
        for i in 0..400 {
            let tp = time_pressure(Some(i as f64 * 0.05), 0.5);
            assert!(tp >= prev - 1e-12, "decreased at {i}");
            assert!(tp <= 1.0);
            prev = tp;
        }
    }

    #[test]
    fn urgency_range() {
        assert_eq!(urgency(0.0), 1.0);
        assert_eq!(urgency(1.0), 2.0);
        assert_eq!(urgency(3.0), 2.0);
    }

    #[test]
    fn acceptable_trajectory_needs_no_correction() {
        let t = traj(vec![20.95, 21.02, 21.0, 21.01], Some(0.5));
        let c = compute_correction(&t, 21.0, 0.5, 0.1, &ThermalCoefficients::default(), LIMITS);
        assert!(c.is_none());
    }

    #[test]
    fn undershoot_gives_bounded_positive_correction() {
        let t = traj(vec![20.5, 20.6, 20.7, 20.8], None);
        let c = compute_correction(&t, 21.0, 0.5, 0.1, &ThermalCoefficients::default(), LIMITS)
            .unwrap();
        assert_eq!(c.excursion, Excursion::Undershoot);
        assert_relative_eq!(c.trajectory_error, 0.5, epsilon = 1e-12);
        assert_eq!(c.urgency, 2.0);
        assert!(c.raw_correction > 10.0);
        assert_eq!(c.correction, 10.0);
    }

    #[test]
    fn overshoot_gives_negative_correction() {
        let t = traj(vec![21.05, 21.4, 21.6, 21.7], Some(0.5));
        let c = compute_correction(&t, 21.0, 0.5, 0.1, &ThermalCoefficients::default(), LIMITS)
            .unwrap();
        assert_eq!(c.excursion, Excursion::Overshoot);
        assert_relative_eq!(c.trajectory_error, -0.7, epsilon = 1e-9);
        assert!(c.correction < 0.0);
        assert!(c.correction >= -20.0);
    }

    #[test]
    fn mid_trajectory_dip_triggers_even_if_endpoint_fine() {
        let t = traj(vec![21.0, 20.7, 20.95, 21.0], Some(0.5));
        let c = compute_correction(&t, 21.0, 0.5, 0.1, &ThermalCoefficients::default(), LIMITS)
            .unwrap();
        assert_eq!(c.excursion, Excursion::Undershoot);
        assert_eq!(c.time_pressure, 0.0);
        assert!(c.correction > 0.0);
    }

    #[test]
    fn small_error_scales_physically() {
        let coeffs = ThermalCoefficients::new(2.0, 0.08, 0.5);
        let t = traj(vec![20.88, 20.9, 20.95], Some(1.0));
        let c = compute_correction(&t, 21.0, 0.5, 0.1, &coeffs, LIMITS).unwrap();
        // scale = 2 * 4 / 0.5 = 16, urgency = 1.3
        assert_relative_eq!(c.correction, 0.12 * 16.0 * 1.3, epsilon = 1e-9);
    }

    #[test]
    fn empty_trajectory_yields_nothing() {
        let t = traj(vec![], None);
        assert!(compute_correction(&t, 21.0, 0.5, 0.1, &ThermalCoefficients::default(), LIMITS).is_none());
    }
}
