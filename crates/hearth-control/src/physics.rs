//! First-order thermal model of the building.
//!
//! The building is treated as a single thermal mass coupled to three kinds
//! of source: the heat-pump outlet (through `outlet_effectiveness`), the
//! outdoors (through `heat_loss_coefficient`) and any number of external
//! channels (solar gain, fireplace, appliances). Steady state is the
//! conductance-weighted average
//!
//! ```text
//! T_eq = (eff * T_outlet + loss * T_outdoor + sum_c w_c * level_c) / (eff + loss)
//! ```
//!
//! and the indoor temperature relaxes towards it exponentially with time
//! constant `thermal_time_constant`:
//!
//! ```text
//! T(t + dt) = T_eq + (T(t) - T_eq) * exp(-dt / tau)
//! ```
//!
//! Heat loss is proportional to the indoor/outdoor difference only; there is
//! no hidden reference temperature, so shifting every input by the same
//! offset shifts the equilibrium by exactly that offset.
//!
//! # Failing closed
//!
//! When `eff + loss` is not strictly positive the formula has no meaning.
//! [`ThermalModel::try_equilibrium`] reports this as
//! [`ControlError::InvalidPhysicsState`]; the infallible
//! [`ThermalModel::predict_equilibrium_temperature`] returns the outdoor
//! temperature instead, which is what an unheated building settles to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ControlError, Result};
use crate::forecast::ForecastWindow;
use crate::types::{ExternalHeat, TrajectoryResult, CHANNEL_FIREPLACE, CHANNEL_PV, CHANNEL_TV};

/// Smallest conductance (`eff + loss`) treated as physical.
pub const MIN_CONDUCTANCE: f64 = 1e-9;

/// Trajectory points within this distance of the target count as reached.
/// Matches the 0.1 °C resolution of typical room sensors.
pub const TARGET_TOLERANCE: f64 = 0.1;

/// Slack added to tolerance comparisons so that values that are 0.1 in
/// decimal but 0.1000000000000014 in binary land on the inclusive side.
pub(crate) const FLOAT_SLACK: f64 = 1e-9;

/// Default simulation step for trajectories (hours).
pub const DEFAULT_TIME_STEP_HOURS: f64 = 1.0;

// ---------------------------------------------------------------------------
// ThermalCoefficients
// ---------------------------------------------------------------------------

/// Learned physical parameters of the building.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalCoefficients {
    /// Building thermal inertia in hours.
    pub thermal_time_constant: f64,
    /// Coupling to the outdoors. Must be `>= 0`.
    pub heat_loss_coefficient: f64,
    /// Fraction of the outlet/indoor differential that becomes heating
    /// power. Must be `>= 0`.
    pub outlet_effectiveness: f64,
    /// Contribution coefficient per external channel. `pv` is °C per watt,
    /// the others are a direct contribution per unit level.
    #[serde(default)]
    pub external_source_weights: BTreeMap<String, f64>,
}

impl Default for ThermalCoefficients {
    fn default() -> Self {
        let mut weights = BTreeMap::new();
        weights.insert(CHANNEL_PV.to_string(), 0.0005);
        weights.insert(CHANNEL_FIREPLACE.to_string(), 0.3);
        weights.insert(CHANNEL_TV.to_string(), 0.05);
        Self {
            thermal_time_constant: 4.0,
            heat_loss_coefficient: 0.08,
            outlet_effectiveness: 0.10,
            external_source_weights: weights,
        }
    }
}

impl ThermalCoefficients {
    /// Coefficients without any external channel weights.
    pub fn new(thermal_time_constant: f64, heat_loss_coefficient: f64, outlet_effectiveness: f64) -> Self {
        Self {
            thermal_time_constant,
            heat_loss_coefficient,
            outlet_effectiveness,
            external_source_weights: BTreeMap::new(),
        }
    }

    /// Builder-style setter for one channel weight.
    pub fn with_weight(mut self, channel: impl Into<String>, weight: f64) -> Self {
        self.external_source_weights.insert(channel.into(), weight);
        self
    }

    /// Weight of a channel (zero when unknown).
    pub fn weight(&self, channel: &str) -> f64 {
        self.external_source_weights
            .get(channel)
            .copied()
            .unwrap_or(0.0)
    }

    /// Total conductance `eff + loss`.
    #[inline]
    pub fn conductance(&self) -> f64 {
        self.outlet_effectiveness + self.heat_loss_coefficient
    }

    /// `true` if the coefficients can produce a finite equilibrium.
    pub fn is_physical(&self) -> bool {
        self.conductance() > MIN_CONDUCTANCE
            && self.conductance().is_finite()
            && self.thermal_time_constant.is_finite()
            && self.thermal_time_constant > 0.0
    }

    /// `sum_c w_c * level_c` for the given external heat levels.
    pub fn external_contribution(&self, external: &ExternalHeat) -> f64 {
        external
            .iter()
            .map(|(channel, level)| self.weight(channel) * level)
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Equilibrium from raw parts. `None` when the conductance is not physical
/// or the result is not finite.
pub(crate) fn equilibrium_from_parts(
    outlet_effectiveness: f64,
    heat_loss_coefficient: f64,
    external_sum: f64,
    outlet_temp: f64,
    outdoor_temp: f64,
) -> Option<f64> {
    let conductance = outlet_effectiveness + heat_loss_coefficient;
    if !(conductance > MIN_CONDUCTANCE) {
        return None;
    }
    let t_eq = (outlet_effectiveness * outlet_temp
        + heat_loss_coefficient * outdoor_temp
        + external_sum)
        / conductance;
    t_eq.is_finite().then_some(t_eq)
}

/// Exponential relaxation of `current` towards `equilibrium` over `hours`.
#[inline]
pub(crate) fn relax(current: f64, equilibrium: f64, hours: f64, time_constant: f64) -> f64 {
    if !(time_constant > 0.0) || !time_constant.is_finite() {
        return equilibrium;
    }
    equilibrium + (current - equilibrium) * (-hours.max(0.0) / time_constant).exp()
}

// ---------------------------------------------------------------------------
// ThermalModel
// ---------------------------------------------------------------------------

/// Equilibrium and trajectory predictions from a set of coefficients.
///
/// The model itself is a pure function of its coefficients; only the
/// [`AdaptiveLearner`](crate::learner::AdaptiveLearner) mutates them.
///
/// ```
/// use hearth_control::physics::{ThermalCoefficients, ThermalModel};
/// use hearth_control::types::ExternalHeat;
///
/// let model = ThermalModel::new(ThermalCoefficients::new(4.0, 0.08, 0.1));
/// let t_eq = model.predict_equilibrium_temperature(45.0, 5.0, 20.0, &ExternalHeat::new());
/// assert!((t_eq - 27.222).abs() < 0.01);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalModel {
    coefficients: ThermalCoefficients,
    time_step_hours: f64,
    tolerance: f64,
}

impl Default for ThermalModel {
    fn default() -> Self {
        Self::new(ThermalCoefficients::default())
    }
}

impl ThermalModel {
    /// Model with hourly trajectory steps and 0.1 °C target tolerance.
    pub fn new(coefficients: ThermalCoefficients) -> Self {
        Self {
            coefficients,
            time_step_hours: DEFAULT_TIME_STEP_HOURS,
            tolerance: TARGET_TOLERANCE,
        }
    }

    /// Override the trajectory time step (hours, must be positive).
    pub fn with_time_step(mut self, hours: f64) -> Self {
        if hours > 0.0 && hours.is_finite() {
            self.time_step_hours = hours;
        }
        self
    }

    /// Current coefficients.
    #[inline]
    pub fn coefficients(&self) -> &ThermalCoefficients {
        &self.coefficients
    }

    /// Trajectory time step in hours.
    #[inline]
    pub fn time_step_hours(&self) -> f64 {
        self.time_step_hours
    }

    /// Target tolerance used by trajectory analysis.
    #[inline]
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub(crate) fn set_coefficients(&mut self, coefficients: ThermalCoefficients) {
        self.coefficients = coefficients;
    }

    /// Steady-state indoor temperature, or an error when the coefficients
    /// are not physical.
    ///
    /// `current_indoor` does not enter the steady state; it is accepted so
    /// every prediction entry point takes the same reading set.
    pub fn try_equilibrium(
        &self,
        outlet_temp: f64,
        outdoor_temp: f64,
        _current_indoor: f64,
        external: &ExternalHeat,
    ) -> Result<f64> {
        let c = &self.coefficients;
        equilibrium_from_parts(
            c.outlet_effectiveness,
            c.heat_loss_coefficient,
            c.external_contribution(external),
            outlet_temp,
            outdoor_temp,
        )
        .ok_or_else(|| {
            ControlError::physics(format!(
                "cannot evaluate equilibrium: eff={} loss={} outlet={} outdoor={}",
                c.outlet_effectiveness, c.heat_loss_coefficient, outlet_temp, outdoor_temp,
            ))
        })
    }

    /// Steady-state indoor temperature. Falls back to `outdoor_temp` when
    /// the coefficients are not physical.
    pub fn predict_equilibrium_temperature(
        &self,
        outlet_temp: f64,
        outdoor_temp: f64,
        current_indoor: f64,
        external: &ExternalHeat,
    ) -> f64 {
        match self.try_equilibrium(outlet_temp, outdoor_temp, current_indoor, external) {
            Ok(t_eq) => t_eq,
            Err(err) => {
                warn!(%err, outdoor_temp, "equilibrium unavailable, assuming outdoor temperature");
                if outdoor_temp.is_finite() {
                    outdoor_temp
                } else {
                    current_indoor
                }
            }
        }
    }

    /// Indoor temperature after `elapsed_hours` with everything held
    /// constant.
    pub fn try_indoor_after(
        &self,
        current_indoor: f64,
        outlet_temp: f64,
        outdoor_temp: f64,
        external: &ExternalHeat,
        elapsed_hours: f64,
    ) -> Result<f64> {
        let t_eq = self.try_equilibrium(outlet_temp, outdoor_temp, current_indoor, external)?;
        let next = relax(
            current_indoor,
            t_eq,
            elapsed_hours,
            self.coefficients.thermal_time_constant,
        );
        if next.is_finite() {
            Ok(next)
        } else {
            Err(ControlError::physics(format!(
                "non-finite indoor prediction from current={current_indoor} t_eq={t_eq}"
            )))
        }
    }

    /// Infallible variant of [`try_indoor_after`](Self::try_indoor_after).
    pub fn predict_indoor_after(
        &self,
        current_indoor: f64,
        outlet_temp: f64,
        outdoor_temp: f64,
        external: &ExternalHeat,
        elapsed_hours: f64,
    ) -> f64 {
        self.try_indoor_after(current_indoor, outlet_temp, outdoor_temp, external, elapsed_hours)
            .unwrap_or_else(|err| {
                warn!(%err, "indoor prediction unavailable, holding current temperature");
                current_indoor
            })
    }

    /// Simulate indoor temperature over `time_horizon` hours.
    ///
    /// With `forecast`, the outdoor temperature and solar level of step `k`
    /// are taken from `forecast[k]` (the last window is held if the forecast
    /// is shorter than the horizon), and the exponential approach is
    /// re-anchored to the equilibrium of each step. Other external channels
    /// are held at their current levels.
    pub fn predict_thermal_trajectory(
        &self,
        current_indoor: f64,
        target_indoor: f64,
        outlet_temp: f64,
        outdoor_temp: f64,
        time_horizon: f64,
        external: &ExternalHeat,
        forecast: Option<&[ForecastWindow]>,
    ) -> TrajectoryResult {
        let step = self.time_step_hours;
        let tau = self.coefficients.thermal_time_constant;
        let steps = if time_horizon > 0.0 && time_horizon.is_finite() {
            ((time_horizon / step) - FLOAT_SLACK).ceil().max(1.0) as usize
        } else {
            0
        };

        let equilibrium_temp =
            self.predict_equilibrium_temperature(outlet_temp, outdoor_temp, current_indoor, external);

        let mut trajectory = Vec::with_capacity(steps);
        let mut temp = current_indoor;
        for k in 0..steps {
            let t_eq = match forecast.and_then(|w| w.get(k).or_else(|| w.last())) {
                Some(window) => {
                    let mut step_heat = external.clone();
                    step_heat.set(CHANNEL_PV, window.solar_watts);
                    self.predict_equilibrium_temperature(
                        outlet_temp,
                        window.outdoor_temp,
                        temp,
                        &step_heat,
                    )
                }
                None => equilibrium_temp,
            };
            temp = relax(temp, t_eq, step, tau);
            trajectory.push(temp);
        }

        let tolerance = self.tolerance + FLOAT_SLACK;
        let reaches_target_at = trajectory
            .iter()
            .position(|t| (t - target_indoor).abs() <= tolerance)
            .map(|idx| (idx + 1) as f64 * step);

        let approaching_from_below = current_indoor <= target_indoor;
        let overshoot_predicted = trajectory.iter().any(|&t| {
            if approaching_from_below {
                t > target_indoor + tolerance
            } else {
                t < target_indoor - tolerance
            }
        });

        debug!(
            steps,
            step_hours = step,
            equilibrium_temp,
            ?reaches_target_at,
            overshoot_predicted,
            "trajectory simulated"
        );

        TrajectoryResult {
            trajectory,
            time_step_hours: step,
            reaches_target_at,
            equilibrium_temp,
            overshoot_predicted,
        }
    }

    /// Outlet temperature whose equilibrium equals `target_indoor`, by
    /// inverting the equilibrium formula:
    ///
    /// ```text
    /// T_outlet = (T_target * (eff + loss) - loss * T_outdoor - sum_c w_c * level_c) / eff
    /// ```
    ///
    /// The result is unbounded; callers clamp it to the actuator range.
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidPhysicsState`] when `outlet_effectiveness` is
    /// (near) zero or the result is not finite.
    pub fn calculate_optimal_outlet_temperature(
        &self,
        target_indoor: f64,
        _current_indoor: f64,
        outdoor_temp: f64,
        external: &ExternalHeat,
    ) -> Result<f64> {
        let c = &self.coefficients;
        if !(c.outlet_effectiveness > MIN_CONDUCTANCE) {
            return Err(ControlError::physics(format!(
                "outlet_effectiveness {} too small to invert",
                c.outlet_effectiveness
            )));
        }
        let outlet = (target_indoor * c.conductance()
            - c.heat_loss_coefficient * outdoor_temp
            - c.external_contribution(external))
            / c.outlet_effectiveness;
        if outlet.is_finite() {
            Ok(outlet)
        } else {
            Err(ControlError::physics("analytic outlet is not finite"))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
