//! Input validation for configuration, coefficients and cycle inputs.
//!
//! All validation functions run eagerly before any computation begins, so a
//! bad deployment fails at startup with a clear diagnostic instead of
//! producing odd setpoints later. Every public function returns
//! [`ValidationError`] on failure, which converts into
//! [`ControlError::InvalidInput`](crate::error::ControlError::InvalidInput)
//! via `From`.
//!
//! # Limits
//!
//! | Resource            | Limit   | Constant                  |
//! |---------------------|---------|---------------------------|
//! | Search iterations   | 1,000   | [`MAX_ITERATIONS`]        |
//! | Recent error window | 1,000   | [`MAX_WINDOW`]            |
//! | Controller id       | 128 B   | [`MAX_CONTROLLER_ID_LEN`] |

use tracing::warn;

use crate::config::{ControlConfig, ParamBound, LEGACY_CHANGE_THRESHOLD};
use crate::error::ValidationError;
use crate::physics::ThermalCoefficients;
use crate::types::CycleInputs;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Maximum bisection steps accepted in configuration.
pub const MAX_ITERATIONS: usize = 1_000;

/// Maximum recent-error window size.
pub const MAX_WINDOW: usize = 1_000;

/// Maximum controller id length in bytes.
pub const MAX_CONTROLLER_ID_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn finite(name: &str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::NonFiniteValue(format!("{name} = {value}")))
    }
}

fn positive(name: &str, value: f64) -> Result<(), ValidationError> {
    finite(name, value)?;
    if value > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::ParameterOutOfRange {
            name: name.into(),
            value: value.to_string(),
            expected: "> 0".into(),
        })
    }
}

fn in_range(name: &str, value: f64, lo: f64, hi: f64) -> Result<(), ValidationError> {
    finite(name, value)?;
    if value >= lo && value <= hi {
        Ok(())
    } else {
        Err(ValidationError::ParameterOutOfRange {
            name: name.into(),
            value: value.to_string(),
            expected: format!("[{lo}, {hi}]"),
        })
    }
}

fn ordered(name: &str, lower: f64, upper: f64) -> Result<(), ValidationError> {
    finite(&format!("{name}.min"), lower)?;
    finite(&format!("{name}.max"), upper)?;
    if lower < upper {
        Ok(())
    } else {
        Err(ValidationError::InvertedBounds {
            name: name.into(),
            lower,
            upper,
        })
    }
}

fn bound(name: &str, b: ParamBound) -> Result<(), ValidationError> {
    ordered(name, b.min, b.max)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Validate a complete [`ControlConfig`].
///
/// Checks, in order:
///
/// 1. Cycle interval is positive.
/// 2. Outlet bounds are ordered; tolerance, resolution and horizon are
///    positive; iteration cap is in `1..=MAX_ITERATIONS`; correction limits
///    are non-negative.
/// 3. Learner window is in `2..=MAX_WINDOW`; rates and confidences are
///    ordered and the defaults lie inside them; step fraction is in
///    `(0, 1]`.
/// 4. Day/night hours are ordered within `0..=24`.
/// 5. Every coefficient bound is ordered, and `eff_min + loss_min > 0` so
///    the learner can never clamp the model into a zero-conductance state.
/// 6. The initial coefficients pass [`validate_coefficients`].
///
/// # Errors
///
/// Returns the first violation found.
pub fn validate_config(config: &ControlConfig) -> Result<(), ValidationError> {
    positive("cycle_interval_minutes", config.cycle_interval_minutes)?;

    // Solver
    let s = &config.solver;
    ordered("solver.outlet", s.min_outlet, s.max_outlet)?;
    positive("solver.target_tolerance", s.target_tolerance)?;
    positive("solver.min_resolution", s.min_resolution)?;
    positive("solver.trajectory_horizon_hours", s.trajectory_horizon_hours)?;
    if s.max_iterations == 0 || s.max_iterations > MAX_ITERATIONS {
        return Err(ValidationError::ParameterOutOfRange {
            name: "solver.max_iterations".into(),
            value: s.max_iterations.to_string(),
            expected: format!("[1, {MAX_ITERATIONS}]"),
        });
    }
    in_range("solver.max_correction_increase", s.max_correction_increase, 0.0, f64::MAX)?;
    in_range("solver.max_correction_decrease", s.max_correction_decrease, 0.0, f64::MAX)?;

    // Learner
    let l = &config.learner;
    if l.recent_error_window < 2 || l.recent_error_window > MAX_WINDOW {
        return Err(ValidationError::ParameterOutOfRange {
            name: "learner.recent_error_window".into(),
            value: l.recent_error_window.to_string(),
            expected: format!("[2, {MAX_WINDOW}]"),
        });
    }
    positive("learner.min_learning_rate", l.min_learning_rate)?;
    ordered("learner.learning_rate", l.min_learning_rate, l.max_learning_rate)?;
    positive("learner.base_learning_rate", l.base_learning_rate)?;
    positive("learner.min_confidence", l.min_confidence)?;
    ordered("learner.confidence", l.min_confidence, l.max_confidence)?;
    in_range(
        "learner.default_confidence",
        l.default_confidence,
        l.min_confidence,
        l.max_confidence,
    )?;
    in_range("learner.confidence_growth", l.confidence_growth, 1.0, 2.0)?;
    in_range("learner.confidence_decay", l.confidence_decay, 0.5, 1.0)?;
    in_range("learner.max_step_fraction", l.max_step_fraction, f64::MIN_POSITIVE, 1.0)?;
    in_range("learner.notable_change_threshold", l.notable_change_threshold, 0.0, f64::MAX)?;
    if l.notable_change_threshold >= LEGACY_CHANGE_THRESHOLD {
        warn!(
            notable_change_threshold = l.notable_change_threshold,
            legacy = LEGACY_CHANGE_THRESHOLD,
            "notable threshold at legacy gating level, small steps will only log at debug"
        );
    }
    positive("learner.gradient_epsilon", l.gradient_epsilon)?;

    // Forecast
    let f = &config.forecast;
    if f.day_start_hour >= f.day_end_hour || f.day_end_hour > 24 {
        return Err(ValidationError::InvertedBounds {
            name: "forecast.day_hours".into(),
            lower: f.day_start_hour as f64,
            upper: f.day_end_hour as f64,
        });
    }
    in_range("forecast.daytime_solar_persistence", f.daytime_solar_persistence, 0.0, 1.0)?;
    finite("forecast.daytime_warming_per_hour", f.daytime_warming_per_hour)?;
    finite("forecast.nighttime_cooling_per_hour", f.nighttime_cooling_per_hour)?;

    // Bounds
    let b = &config.bounds;
    bound("bounds.thermal_time_constant", b.thermal_time_constant)?;
    bound("bounds.heat_loss_coefficient", b.heat_loss_coefficient)?;
    bound("bounds.outlet_effectiveness", b.outlet_effectiveness)?;
    bound("bounds.default_external_weight", b.default_external_weight)?;
    for (channel, weight_bound) in &b.external_source_weights {
        bound(&format!("bounds.external_source_weights.{channel}"), *weight_bound)?;
    }
    if b.thermal_time_constant.min <= 0.0 {
        return Err(ValidationError::ParameterOutOfRange {
            name: "bounds.thermal_time_constant.min".into(),
            value: b.thermal_time_constant.min.to_string(),
            expected: "> 0".into(),
        });
    }
    if b.heat_loss_coefficient.min < 0.0 || b.outlet_effectiveness.min < 0.0 {
        return Err(ValidationError::ParameterOutOfRange {
            name: "bounds.conductance.min".into(),
            value: format!(
                "loss {} / eff {}",
                b.heat_loss_coefficient.min, b.outlet_effectiveness.min
            ),
            expected: ">= 0".into(),
        });
    }
    if !(b.heat_loss_coefficient.min + b.outlet_effectiveness.min > 0.0) {
        return Err(ValidationError::ParameterOutOfRange {
            name: "bounds.outlet_effectiveness.min + bounds.heat_loss_coefficient.min".into(),
            value: (b.heat_loss_coefficient.min + b.outlet_effectiveness.min).to_string(),
            expected: "> 0".into(),
        });
    }

    validate_coefficients(&config.initial_coefficients)
}

// ---------------------------------------------------------------------------
// Coefficients
// ---------------------------------------------------------------------------

/// Validate a coefficient set on its own (no bounds).
///
/// Requires finite values, `tau > 0`, non-negative loss and effectiveness,
/// `eff + loss > 0`, and finite non-negative channel weights.
///
/// # Errors
///
/// Returns the first violation found.
pub fn validate_coefficients(c: &ThermalCoefficients) -> Result<(), ValidationError> {
    positive("thermal_time_constant", c.thermal_time_constant)?;
    in_range("heat_loss_coefficient", c.heat_loss_coefficient, 0.0, f64::MAX)?;
    in_range("outlet_effectiveness", c.outlet_effectiveness, 0.0, f64::MAX)?;
    positive("outlet_effectiveness + heat_loss_coefficient", c.conductance())?;
    for (channel, weight) in &c.external_source_weights {
        in_range(&format!("external_source_weights.{channel}"), *weight, 0.0, f64::MAX)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Cycle inputs
// ---------------------------------------------------------------------------

/// Validate the readings of one cycle.
///
/// Target, indoor and outdoor temperatures must be finite. A non-finite
/// `current_outlet` or negative external level is tolerated (it is read as
/// unknown / zero downstream) but emits a [`tracing::warn`].
///
/// # Errors
///
/// [`ValidationError::NonFiniteValue`] for the first non-finite reading.
pub fn validate_cycle_inputs(inputs: &CycleInputs) -> Result<(), ValidationError> {
    finite("target_indoor", inputs.target_indoor)?;
    finite("current_indoor", inputs.current_indoor)?;
    finite("outdoor_temp", inputs.outdoor_temp)?;

    if inputs.current_outlet.is_some_and(|o| !o.is_finite()) {
        warn!(current_outlet = ?inputs.current_outlet, "non-finite current outlet treated as unknown");
    }
    if let Some(hour) = inputs.hour_of_day {
        if hour > 23 {
            warn!(hour, "hour_of_day outside 0..=23, wrapping");
        }
    }
    Ok(())
}

/// Validate a controller id for use as a store key.
///
/// Ids must be non-empty, at most [`MAX_CONTROLLER_ID_LEN`] bytes, and use
/// only ASCII alphanumerics, `-`, `_` and `.`, without a leading `.`.
///
/// # Errors
///
/// [`ValidationError::InvalidControllerId`].
///
/// # Examples
///
/// ```
/// use hearth_control::validation::validate_controller_id;
///
/// assert!(validate_controller_id("living-room_1").is_ok());
/// assert!(validate_controller_id("../etc").is_err());
/// ```
pub fn validate_controller_id(id: &str) -> Result<(), ValidationError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_CONTROLLER_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidControllerId(id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;

    #[test]
    fn default_config_passes() {
        assert!(validate_config(&ControlConfig::default()).is_ok());
    }

    #[test]
    fn inverted_outlet_bounds() {
        let mut config = ControlConfig::default();
        config.solver.min_outlet = 50.0;
        config.solver.max_outlet = 40.0;
        assert!(matches!(
            validate_config(&config),
            Err(ValidationError::InvertedBounds { .. })
        ));
    }

    #[test]
    fn zero_conductance_bounds_rejected() {
        let mut config = ControlConfig::default();
        config.bounds.outlet_effectiveness.min = 0.0;
        config.bounds.heat_loss_coefficient.min = 0.0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("outlet_effectiveness.min"));
    }

    #[test]
    fn nan_tolerance_rejected() {
        let mut config = ControlConfig::default();
        config.solver.target_tolerance = f64::NAN;
        assert!(matches!(
            validate_config(&config),
            Err(ValidationError::NonFiniteValue(_))
        ));
    }

    #[test]
    fn tiny_window_rejected() {
        let mut config = ControlConfig::default();
        config.learner.recent_error_window = 1;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn default_confidence_outside_bounds_rejected() {
        let mut config = ControlConfig::default();
        config.learner.default_confidence = 9.0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn coefficients_need_conductance() {
        assert!(validate_coefficients(&ThermalCoefficients::new(4.0, 0.0, 0.0)).is_err());
        assert!(validate_coefficients(&ThermalCoefficients::new(0.0, 0.1, 0.1)).is_err());
        assert!(validate_coefficients(&ThermalCoefficients::default()).is_ok());
        let negative = ThermalCoefficients::default().with_weight("tv", -0.1);
        assert!(validate_coefficients(&negative).is_err());
    }

    #[test]
    fn cycle_inputs_need_finite_temperatures() {
        assert!(validate_cycle_inputs(&CycleInputs::new(21.0, 20.0, 5.0)).is_ok());
        assert!(validate_cycle_inputs(&CycleInputs::new(21.0, f64::INFINITY, 5.0)).is_err());
        let odd_outlet = CycleInputs::new(21.0, 20.0, 5.0).with_current_outlet(f64::NAN);
        assert!(validate_cycle_inputs(&odd_outlet).is_ok());
    }

    #[test]
    fn controller_ids() {
        assert!(validate_controller_id("hp-1").is_ok());
        assert!(validate_controller_id("").is_err());
        assert!(validate_controller_id("a/b").is_err());
        assert!(validate_controller_id(".hidden").is_err());
        assert!(validate_controller_id(&"x".repeat(129)).is_err());
    }
}
