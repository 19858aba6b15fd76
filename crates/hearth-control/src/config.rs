//! Configuration for the control engine.
//!
//! Every struct derives `serde` with `#[serde(default)]`, so a JSON file
//! only needs to name the values it overrides. Call
//! [`ControlConfig::validate`] (the loaders do it for you) before building a
//! controller.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ControlError, Result, ValidationError};
use crate::physics::ThermalCoefficients;
use crate::types::{SearchBudget, CHANNEL_FIREPLACE, CHANNEL_PV, CHANNEL_TV};

/// Minimum parameter change that once gated history recording. History is
/// now recorded unconditionally; configs that set the notable threshold at
/// or above this value are warned about in validation.
pub const LEGACY_CHANGE_THRESHOLD: f64 = 0.01;

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

/// Closed interval `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamBound {
    pub min: f64,
    pub max: f64,
}

impl ParamBound {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// `max - min` of the [`ordered`](Self::ordered) interval. Never
    /// negative.
    #[inline]
    pub fn width(&self) -> f64 {
        let b = self.ordered();
        b.max - b.min
    }

    /// The same interval with `min <= max`. Inverted endpoints are swapped;
    /// a NaN endpoint collapses onto the other one.
    #[inline]
    pub fn ordered(&self) -> Self {
        Self {
            min: self.min.min(self.max),
            max: self.min.max(self.max),
        }
    }

    /// Clamp into the [`ordered`](Self::ordered) interval. Unlike
    /// [`f64::clamp`] this never panics; a NaN `value` maps to `min`.
    #[inline]
    pub fn clamp(&self, value: f64) -> f64 {
        let b = self.ordered();
        value.max(b.min).min(b.max)
    }

    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Allowed range of every learned coefficient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoefficientBounds {
    /// Default: `[0.5, 24.0]` hours.
    pub thermal_time_constant: ParamBound,
    /// Default: `[0.0, 1.0]`.
    pub heat_loss_coefficient: ParamBound,
    /// Default: `[0.01, 1.0]`.
    pub outlet_effectiveness: ParamBound,
    /// Per-channel weight bounds. Defaults: `pv` `[0, 0.005]`,
    /// `fireplace` `[0, 1.0]`, `tv` `[0, 0.2]`.
    pub external_source_weights: BTreeMap<String, ParamBound>,
    /// Bound for channels without an entry above. Default: `[0, 1.0]`.
    pub default_external_weight: ParamBound,
}

impl Default for CoefficientBounds {
    fn default() -> Self {
        let mut external = BTreeMap::new();
        external.insert(CHANNEL_PV.to_string(), ParamBound::new(0.0, 0.005));
        external.insert(CHANNEL_FIREPLACE.to_string(), ParamBound::new(0.0, 1.0));
        external.insert(CHANNEL_TV.to_string(), ParamBound::new(0.0, 0.2));
        Self {
            thermal_time_constant: ParamBound::new(0.5, 24.0),
            heat_loss_coefficient: ParamBound::new(0.0, 1.0),
            outlet_effectiveness: ParamBound::new(0.01, 1.0),
            external_source_weights: external,
            default_external_weight: ParamBound::new(0.0, 1.0),
        }
    }
}

impl CoefficientBounds {
    /// Bound that applies to an external channel.
    pub fn external(&self, channel: &str) -> ParamBound {
        self.external_source_weights
            .get(channel)
            .copied()
            .unwrap_or(self.default_external_weight)
    }

    /// Clamp every coefficient into its bound. Non-finite values are
    /// replaced by the lower bound. Logs a warning for each change.
    pub fn clamp(&self, coefficients: &ThermalCoefficients) -> ThermalCoefficients {
        let fix = |name: &str, value: f64, bound: ParamBound| -> f64 {
            let fixed = if value.is_finite() {
                bound.clamp(value)
            } else {
                bound.ordered().min
            };
            if fixed != value {
                warn!(parameter = name, value, fixed, "coefficient outside bounds, clamped");
            }
            fixed
        };

        ThermalCoefficients {
            thermal_time_constant: fix(
                "thermal_time_constant",
                coefficients.thermal_time_constant,
                self.thermal_time_constant,
            ),
            heat_loss_coefficient: fix(
                "heat_loss_coefficient",
                coefficients.heat_loss_coefficient,
                self.heat_loss_coefficient,
            ),
            outlet_effectiveness: fix(
                "outlet_effectiveness",
                coefficients.outlet_effectiveness,
                self.outlet_effectiveness,
            ),
            external_source_weights: coefficients
                .external_source_weights
                .iter()
                .map(|(channel, &w)| (channel.clone(), fix(channel, w, self.external(channel))))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Component configs
// ---------------------------------------------------------------------------

/// Outlet solver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Lowest outlet temperature the actuator accepts. Default: 25.0 °C.
    pub min_outlet: f64,
    /// Highest outlet temperature the actuator accepts. Default: 60.0 °C.
    pub max_outlet: f64,
    /// Acceptable equilibrium error. Default: 0.1 °C.
    pub target_tolerance: f64,
    /// Search stops once its interval is narrower. Default: 0.05 °C.
    pub min_resolution: f64,
    /// Bisection cap. Default: 20.
    pub max_iterations: usize,
    /// Run trajectory verification and course correction. Default: true.
    pub trajectory_correction_enabled: bool,
    /// Simulated horizon for verification. Default: 4.0 h.
    pub trajectory_horizon_hours: f64,
    /// Largest upward correction per cycle. Default: 10.0 °C.
    pub max_correction_increase: f64,
    /// Largest downward correction per cycle. Default: 20.0 °C.
    pub max_correction_decrease: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            min_outlet: 25.0,
            max_outlet: 60.0,
            target_tolerance: 0.1,
            min_resolution: 0.05,
            max_iterations: 20,
            trajectory_correction_enabled: true,
            trajectory_horizon_hours: 4.0,
            max_correction_increase: 10.0,
            max_correction_decrease: 20.0,
        }
    }
}

impl SolverConfig {
    /// Search limits as a [`SearchBudget`].
    pub fn search_budget(&self) -> SearchBudget {
        SearchBudget {
            max_iterations: self.max_iterations,
            tolerance: self.target_tolerance,
            min_resolution: self.min_resolution,
        }
    }

    /// Outlet range as an ordered bound. A non-finite endpoint is replaced
    /// by its default so the solver always has a finite range to work in.
    pub fn outlet_bounds(&self) -> ParamBound {
        let defaults = Self::default();
        let min = if self.min_outlet.is_finite() {
            self.min_outlet
        } else {
            defaults.min_outlet
        };
        let max = if self.max_outlet.is_finite() {
            self.max_outlet
        } else {
            defaults.max_outlet
        };
        ParamBound::new(min, max).ordered()
    }
}

/// Adaptive learner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    /// Samples in the recent-error window. Default: 10.
    pub recent_error_window: usize,
    /// Rate at default confidence. Default: 0.01.
    pub base_learning_rate: f64,
    /// Default: 0.001.
    pub min_learning_rate: f64,
    /// Default: 0.05.
    pub max_learning_rate: f64,
    /// Confidence after construction. Default: 3.0.
    pub default_confidence: f64,
    /// Default: 0.5.
    pub min_confidence: f64,
    /// Default: 5.0.
    pub max_confidence: f64,
    /// Confidence multiplier when errors shrink. Default: 1.05.
    pub confidence_growth: f64,
    /// Confidence multiplier when errors grow. Default: 0.95.
    pub confidence_decay: f64,
    /// Largest per-cycle move as a fraction of the coefficient's range.
    /// Default: 0.02.
    pub max_step_fraction: f64,
    /// Smallest change logged at info level. Default: 1e-4.
    pub notable_change_threshold: f64,
    /// Relative perturbation for finite-difference derivatives.
    /// Default: 1e-4.
    pub gradient_epsilon: f64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            recent_error_window: 10,
            base_learning_rate: 0.01,
            min_learning_rate: 0.001,
            max_learning_rate: 0.05,
            default_confidence: 3.0,
            min_confidence: 0.5,
            max_confidence: 5.0,
            confidence_growth: 1.05,
            confidence_decay: 0.95,
            max_step_fraction: 0.02,
            notable_change_threshold: 1e-4,
            gradient_epsilon: 1e-4,
        }
    }
}

impl LearnerConfig {
    /// `[min_confidence, max_confidence]`.
    pub fn confidence_bounds(&self) -> ParamBound {
        ParamBound::new(self.min_confidence, self.max_confidence)
    }

    /// `[min_learning_rate, max_learning_rate]`.
    pub fn learning_rate_bounds(&self) -> ParamBound {
        ParamBound::new(self.min_learning_rate, self.max_learning_rate)
    }
}

/// Forecast heuristic settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// First daytime hour (inclusive). Default: 6.
    pub day_start_hour: u32,
    /// First night-time hour. Default: 18.
    pub day_end_hour: u32,
    /// Fraction of current solar power assumed to persist by day.
    /// Default: 0.8.
    pub daytime_solar_persistence: f64,
    /// Default: 0.2 °C/h.
    pub daytime_warming_per_hour: f64,
    /// Default: 0.2 °C/h.
    pub nighttime_cooling_per_hour: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            day_start_hour: 6,
            day_end_hour: 18,
            daytime_solar_persistence: 0.8,
            daytime_warming_per_hour: 0.2,
            nighttime_cooling_per_hour: 0.2,
        }
    }
}

// ---------------------------------------------------------------------------
// ControlConfig
// ---------------------------------------------------------------------------

/// Top-level configuration.
///
/// ```
/// use hearth_control::config::ControlConfig;
///
/// let config = ControlConfig::from_json_str(r#"{ "shadow_mode": true, "solver": { "max_outlet": 50.0 } }"#).unwrap();
/// assert!(config.shadow_mode);
/// assert_eq!(config.solver.max_outlet, 50.0);
/// assert_eq!(config.solver.min_outlet, 25.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Minutes between control cycles. Default: 30.
    pub cycle_interval_minutes: f64,
    /// Compute and learn but mark decisions as not applied. Default: false.
    pub shadow_mode: bool,
    pub solver: SolverConfig,
    pub learner: LearnerConfig,
    pub forecast: ForecastConfig,
    pub bounds: CoefficientBounds,
    /// Coefficients used when no persisted state exists.
    pub initial_coefficients: ThermalCoefficients,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            cycle_interval_minutes: 30.0,
            shadow_mode: false,
            solver: SolverConfig::default(),
            learner: LearnerConfig::default(),
            forecast: ForecastConfig::default(),
            bounds: CoefficientBounds::default(),
            initial_coefficients: ThermalCoefficients::default(),
        }
    }
}

impl ControlConfig {
    /// Cycle length in hours.
    #[inline]
    pub fn cycle_hours(&self) -> f64 {
        self.cycle_interval_minutes / 60.0
    }

    /// Check every value; see [`validate_config`](crate::validation::validate_config).
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        crate::validation::validate_config(self)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(ControlError::Io)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ControlConfig::default().validate().unwrap();
    }

    #[test]
    fn serde_roundtrip() {
        let config = ControlConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: ControlConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ControlConfig::from_json_str(r#"{ "learner": { "recent_error_window": 6 } }"#).unwrap();
        assert_eq!(config.learner.recent_error_window, 6);
        assert_eq!(config.learner.default_confidence, 3.0);
        assert_eq!(config.cycle_interval_minutes, 30.0);
    }

    #[test]
    fn invalid_json_values_rejected() {
        let err = ControlConfig::from_json_str(r#"{ "solver": { "min_outlet": 70.0 } }"#).unwrap_err();
        assert!(matches!(err, ControlError::InvalidInput(_)));
    }

    #[test]
    fn malformed_json_is_serialization_error() {
        let err = ControlConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ControlError::Serialization(_)));
    }

    #[test]
    fn clamp_pulls_coefficients_into_bounds() {
        let bounds = CoefficientBounds::default();
        let wild = ThermalCoefficients::new(100.0, -1.0, f64::NAN)
            .with_weight(CHANNEL_PV, 1.0)
            .with_weight("heater", 5.0);
        let fixed = bounds.clamp(&wild);
        assert_eq!(fixed.thermal_time_constant, 24.0);
        assert_eq!(fixed.heat_loss_coefficient, 0.0);
        assert_eq!(fixed.outlet_effectiveness, 0.01);
        assert_eq!(fixed.weight(CHANNEL_PV), 0.005);
        assert_eq!(fixed.weight("heater"), 1.0);
        assert!(fixed.is_physical());
    }

    #[test]
    fn param_bound_tolerates_inverted_and_nan_endpoints() {
        let inverted = ParamBound::new(60.0, 25.0);
        assert_eq!(inverted.ordered(), ParamBound::new(25.0, 60.0));
        assert_eq!(inverted.width(), 35.0);
        assert_eq!(inverted.clamp(70.0), 60.0);
        assert_eq!(inverted.clamp(10.0), 25.0);

        let half_nan = ParamBound::new(f64::NAN, 40.0);
        assert_eq!(half_nan.clamp(55.0), 40.0);
        assert_eq!(ParamBound::new(25.0, 60.0).clamp(f64::NAN), 25.0);
    }

    #[test]
    fn outlet_bounds_replace_non_finite_endpoints() {
        let config = SolverConfig {
            min_outlet: f64::NAN,
            max_outlet: 30.0,
            ..Default::default()
        };
        assert_eq!(config.outlet_bounds(), ParamBound::new(25.0, 30.0));
    }

    #[test]
    fn cycle_hours_from_minutes() {
        let config = ControlConfig {
            cycle_interval_minutes: 15.0,
            ..Default::default()
        };
        assert_eq!(config.cycle_hours(), 0.25);
    }
}
