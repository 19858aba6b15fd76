//! Core types shared across the control engine.
//!
//! Provides [`ExternalHeat`] for the open-ended set of auxiliary heat
//! channels, the per-cycle [`CycleInputs`] and [`PredictionContext`], and the
//! result types produced by the solver ([`OutletDecision`]) and the physics
//! model ([`TrajectoryResult`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::events::ControlEvent;
use crate::forecast::HourlyForecast;

// ---------------------------------------------------------------------------
// External heat channels
// ---------------------------------------------------------------------------

/// Solar (photovoltaic) channel. Level is instantaneous power in watts.
pub const CHANNEL_PV: &str = "pv";
/// Fireplace channel. Level is 0/1 or a burn-intensity count.
pub const CHANNEL_FIREPLACE: &str = "fireplace";
/// Television / media channel. Level is 0/1.
pub const CHANNEL_TV: &str = "tv";

/// Levels of the external (non-heat-pump) heat sources active this cycle.
///
/// Keyed by channel name so new sources can be added without touching the
/// equilibrium formula. A channel that is absent has level zero; negative or
/// non-finite levels are read back as zero.
///
/// ```
/// use hearth_control::types::{ExternalHeat, CHANNEL_PV};
///
/// let heat = ExternalHeat::new().with(CHANNEL_PV, 1500.0).with("sauna", 1.0);
/// assert_eq!(heat.level(CHANNEL_PV), 1500.0);
/// assert_eq!(heat.level("fireplace"), 0.0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalHeat {
    levels: BTreeMap<String, f64>,
}

impl ExternalHeat {
    /// No external heat.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, channel: impl Into<String>, level: f64) -> Self {
        self.set(channel, level);
        self
    }

    /// Set the level of a channel.
    pub fn set(&mut self, channel: impl Into<String>, level: f64) {
        self.levels.insert(channel.into(), level);
    }

    /// Sanitised level of a channel (zero when missing, negative or
    /// non-finite).
    pub fn level(&self, channel: &str) -> f64 {
        self.levels
            .get(channel)
            .copied()
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(0.0)
    }

    /// Solar power in watts.
    #[inline]
    pub fn pv_watts(&self) -> f64 {
        self.level(CHANNEL_PV)
    }

    /// Iterate over `(channel, sanitised level)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.levels
            .keys()
            .map(move |name| (name.as_str(), self.level(name)))
    }

    /// `true` if no channel carries a positive level.
    pub fn is_idle(&self) -> bool {
        self.iter().all(|(_, level)| level == 0.0)
    }
}

// ---------------------------------------------------------------------------
// Per-cycle inputs
// ---------------------------------------------------------------------------

/// Conditions under which a prediction was made, stored with each sample.
///
/// Every field is optional: a sample recorded without context still counts
/// towards accuracy metrics and the cycle counter, it just cannot drive a
/// gradient.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionContext {
    /// Outlet temperature that was applied during the cycle.
    pub outlet_temp: Option<f64>,
    /// Outdoor temperature at the start of the cycle.
    pub outdoor_temp: Option<f64>,
    /// Indoor temperature at the start of the cycle.
    pub current_indoor: Option<f64>,
    /// External heat levels during the cycle.
    pub external: ExternalHeat,
    /// Hours between the prediction and the observed outcome.
    pub elapsed_hours: Option<f64>,
}

impl PredictionContext {
    /// Context with the three thermal readings set.
    pub fn new(outlet_temp: f64, outdoor_temp: f64, current_indoor: f64) -> Self {
        Self {
            outlet_temp: Some(outlet_temp),
            outdoor_temp: Some(outdoor_temp),
            current_indoor: Some(current_indoor),
            ..Default::default()
        }
    }

    /// Attach external heat levels.
    pub fn with_external(mut self, external: ExternalHeat) -> Self {
        self.external = external;
        self
    }

    /// Attach the elapsed time between prediction and outcome.
    pub fn with_elapsed_hours(mut self, hours: f64) -> Self {
        self.elapsed_hours = Some(hours);
        self
    }

    /// Names of the thermal readings that are missing or non-finite.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (name, value) in [
            ("outlet_temp", self.outlet_temp),
            ("outdoor_temp", self.outdoor_temp),
            ("current_indoor", self.current_indoor),
        ] {
            if !value.is_some_and(f64::is_finite) {
                missing.push(name);
            }
        }
        missing
    }
}

/// Everything the solver needs for one control cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleInputs {
    /// Target indoor temperature (°C).
    pub target_indoor: f64,
    /// Measured indoor temperature (°C).
    pub current_indoor: f64,
    /// Measured outdoor temperature (°C).
    pub outdoor_temp: f64,
    /// External heat levels.
    #[serde(default)]
    pub external: ExternalHeat,
    /// Outlet temperature currently applied by the actuator, if known.
    #[serde(default)]
    pub current_outlet: Option<f64>,
    /// Hourly forecast, if the provider returned one.
    #[serde(default)]
    pub forecast: Option<HourlyForecast>,
    /// Local hour of day (0-23), used by the day/night forecast heuristic.
    #[serde(default)]
    pub hour_of_day: Option<u32>,
}

impl CycleInputs {
    /// Inputs with no external heat, forecast or current outlet.
    pub fn new(target_indoor: f64, current_indoor: f64, outdoor_temp: f64) -> Self {
        Self {
            target_indoor,
            current_indoor,
            outdoor_temp,
            external: ExternalHeat::new(),
            current_outlet: None,
            forecast: None,
            hour_of_day: None,
        }
    }

    /// Attach external heat levels.
    pub fn with_external(mut self, external: ExternalHeat) -> Self {
        self.external = external;
        self
    }

    /// Attach the outlet temperature currently applied.
    pub fn with_current_outlet(mut self, outlet: f64) -> Self {
        self.current_outlet = Some(outlet);
        self
    }

    /// Attach an hourly forecast.
    pub fn with_forecast(mut self, forecast: HourlyForecast) -> Self {
        self.forecast = Some(forecast);
        self
    }

    /// Attach the local hour of day.
    pub fn with_hour_of_day(mut self, hour: u32) -> Self {
        self.hour_of_day = Some(hour);
        self
    }
}

// ---------------------------------------------------------------------------
// Trajectory result
// ---------------------------------------------------------------------------

/// Simulated indoor temperatures over a short future horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryResult {
    /// Predicted indoor temperature at the end of each time step.
    pub trajectory: Vec<f64>,
    /// Length of one step in hours.
    pub time_step_hours: f64,
    /// Elapsed hours at which the trajectory first comes within tolerance
    /// of the target.
    pub reaches_target_at: Option<f64>,
    /// Equilibrium under the conditions at the start of the simulation.
    pub equilibrium_temp: f64,
    /// `true` if any step passes the target by more than the tolerance on
    /// the far side of the approach.
    pub overshoot_predicted: bool,
}

impl TrajectoryResult {
    /// Coldest predicted temperature.
    pub fn min_temp(&self) -> Option<f64> {
        self.trajectory.iter().copied().reduce(f64::min)
    }

    /// Warmest predicted temperature.
    pub fn max_temp(&self) -> Option<f64> {
        self.trajectory.iter().copied().reduce(f64::max)
    }

    /// Simulated horizon in hours.
    pub fn horizon_hours(&self) -> f64 {
        self.trajectory.len() as f64 * self.time_step_hours
    }
}

// ---------------------------------------------------------------------------
// Solver result types
// ---------------------------------------------------------------------------

/// How the outlet temperature of a decision was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveMethod {
    /// Binary search converged within tolerance or resolution.
    BinarySearch,
    /// Binary search ran out of iterations; best candidate used.
    BestEffortSearch,
    /// Target is colder than the equilibrium at the minimum outlet bound.
    TargetBelowRange,
    /// Target is warmer than the equilibrium at the maximum outlet bound.
    TargetAboveRange,
    /// Physics evaluation failed; analytic inversion used.
    AnalyticFallback,
    /// Physics and analytic inversion failed; current outlet held.
    HoldCurrentOutlet,
}

impl SolveMethod {
    /// `true` for the two pre-check outcomes.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, SolveMethod::TargetBelowRange | SolveMethod::TargetAboveRange)
    }

    /// `true` when the physics model could not be used.
    pub fn is_fallback(&self) -> bool {
        matches!(self, SolveMethod::AnalyticFallback | SolveMethod::HoldCurrentOutlet)
    }
}

impl std::fmt::Display for SolveMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolveMethod::BinarySearch => write!(f, "binary-search"),
            SolveMethod::BestEffortSearch => write!(f, "best-effort-search"),
            SolveMethod::TargetBelowRange => write!(f, "target-below-range"),
            SolveMethod::TargetAboveRange => write!(f, "target-above-range"),
            SolveMethod::AnalyticFallback => write!(f, "analytic-fallback"),
            SolveMethod::HoldCurrentOutlet => write!(f, "hold-current-outlet"),
        }
    }
}

/// Iteration limits for the outlet search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchBudget {
    /// Hard cap on bisection steps.
    pub max_iterations: usize,
    /// Acceptable distance between predicted equilibrium and target (°C).
    pub tolerance: f64,
    /// Stop once the search interval is narrower than this (°C).
    pub min_resolution: f64,
}

impl Default for SearchBudget {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            tolerance: 0.1,
            min_resolution: 0.05,
        }
    }
}

/// Outcome of one solver invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutletDecision {
    /// Final bounded outlet temperature to apply.
    pub outlet_temp: f64,
    /// Outlet temperature before course correction.
    pub base_outlet: f64,
    /// How `base_outlet` was obtained.
    pub method: SolveMethod,
    /// Correction added on top of `base_outlet` (after clamping).
    pub correction: f64,
    /// Whether a trajectory correction changed the setpoint.
    pub correction_applied: bool,
    /// Confidence in the decision, in `[0, 1]`.
    pub confidence: f64,
    /// Bisection steps executed.
    pub iterations: usize,
    /// Equilibrium predicted for `outlet_temp`.
    pub predicted_equilibrium: f64,
    /// Indoor temperature predicted one cycle ahead for `outlet_temp`.
    pub predicted_next_indoor: f64,
    /// Trajectory used for verification, when enabled.
    pub trajectory: Option<TrajectoryResult>,
    /// `false` in shadow mode: the setpoint is advisory only.
    pub applied: bool,
    /// Everything notable that happened while deciding.
    pub events: Vec<ControlEvent>,
}
