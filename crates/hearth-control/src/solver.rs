//! Outlet temperature solver.
//!
//! [`OutletSolver`] inverts the [`ThermalModel`] under the actuator's
//! safety bounds. Each call walks a fixed state machine that always ends in
//! a finite, bounded setpoint:
//!
//! | Stage | Outcome |
//! |-------|---------|
//! | Pre-check | target outside `[T_eq(min), T_eq(max)]` -> that bound, 0 iterations |
//! | Binary search | equilibrium within tolerance, or interval below resolution |
//! | Budget exhausted | best candidate so far (soft failure) |
//! | Trajectory verification | optional course correction, see [`correction`](crate::correction) |
//!
//! # Fallback chain
//!
//! When the physics model cannot be evaluated the solver falls back through:
//!
//! **analytic inversion -> current outlet -> minimum outlet**

use std::borrow::Cow;

use tracing::{debug, info, instrument, warn};

use crate::budget::BudgetEnforcer;
use crate::config::SolverConfig;
use crate::correction::{compute_correction, CorrectionLimits};
use crate::error::{ControlError, Result};
use crate::events::ControlEvent;
use crate::forecast::{AlignmentSource, ForecastAligner};
use crate::physics::ThermalModel;
use crate::types::{CycleInputs, OutletDecision, SolveMethod, TrajectoryResult};

/// Confidence penalty when a trajectory correction moved the setpoint.
const CORRECTION_CONFIDENCE_PENALTY: f64 = 0.15;

/// Result of the search stage, before trajectory verification.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub outlet: f64,
    pub method: SolveMethod,
    pub iterations: usize,
    /// Equilibrium at `outlet`.
    pub equilibrium: f64,
}

// ---------------------------------------------------------------------------
// OutletSolver
// ---------------------------------------------------------------------------

/// Finds the outlet temperature that holds the target.
///
/// # Example
///
/// ```rust
/// use hearth_control::config::SolverConfig;
/// use hearth_control::forecast::ForecastAligner;
/// use hearth_control::physics::ThermalModel;
/// use hearth_control::solver::OutletSolver;
/// use hearth_control::types::CycleInputs;
///
/// let solver = OutletSolver::new(SolverConfig::default(), ForecastAligner::default(), 0.5);
/// let decision = solver.solve(&ThermalModel::default(), &CycleInputs::new(21.0, 21.0, 5.0));
/// assert!(decision.outlet_temp >= 25.0 && decision.outlet_temp <= 60.0);
/// assert!(decision.iterations <= 20);
/// ```
#[derive(Debug, Clone)]
pub struct OutletSolver {
    config: SolverConfig,
    aligner: ForecastAligner,
    cycle_hours: f64,
}

impl OutletSolver {
    /// Create a solver for cycles of `cycle_hours`.
    pub fn new(config: SolverConfig, aligner: ForecastAligner, cycle_hours: f64) -> Self {
        Self {
            config,
            aligner,
            cycle_hours,
        }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn aligner(&self) -> &ForecastAligner {
        &self.aligner
    }

    pub fn cycle_hours(&self) -> f64 {
        self.cycle_hours
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Choose the outlet temperature for one cycle. Never fails; every
    /// abnormal path is reported through [`OutletDecision::method`] and
    /// [`OutletDecision::events`].
    #[instrument(
        skip_all,
        fields(
            target = inputs.target_indoor,
            indoor = inputs.current_indoor,
            outdoor = inputs.outdoor_temp,
        )
    )]
    pub fn solve(&self, model: &ThermalModel, inputs: &CycleInputs) -> OutletDecision {
        let mut events = Vec::new();

        if !inputs.target_indoor.is_finite()
            || !inputs.current_indoor.is_finite()
            || !inputs.outdoor_temp.is_finite()
        {
            let reason = "non-finite sensor input".to_string();
            warn!(%reason, "holding current outlet");
            return self.hold_decision(inputs, reason, events);
        }

        let search = match self.search(model, inputs, &mut events) {
            Ok(outcome) => outcome,
            Err(err) => return self.fallback(model, inputs, err, events),
        };

        if search.method.is_unreachable() || !self.config.trajectory_correction_enabled {
            return self.finish(model, inputs, search, None, None, events);
        }

        let trajectory = self.verify_trajectory(model, inputs, search.outlet, &mut events);
        let correction = compute_correction(
            &trajectory,
            inputs.target_indoor,
            self.cycle_hours,
            self.config.target_tolerance,
            model.coefficients(),
            CorrectionLimits {
                max_increase: self.config.max_correction_increase,
                max_decrease: self.config.max_correction_decrease,
            },
        );

        let corrected = correction.map(|c| {
            let outlet = self.config.outlet_bounds().clamp(search.outlet + c.correction);
            info!(
                trajectory_error = c.trajectory_error,
                urgency = c.urgency,
                raw = c.raw_correction,
                base_outlet = search.outlet,
                corrected_outlet = outlet,
                "trajectory correction"
            );
            events.push(ControlEvent::CorrectionApplied {
                trajectory_error: c.trajectory_error,
                urgency: c.urgency,
                correction: outlet - search.outlet,
                base_outlet: search.outlet,
                corrected_outlet: outlet,
            });
            outlet
        });

        self.finish(model, inputs, search, corrected, Some(trajectory), events)
    }

    /// Pre-check followed by bounded bisection.
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidPhysicsState`] if the model cannot evaluate an
    /// equilibrium. Budget exhaustion is not an error here; it yields
    /// [`SolveMethod::BestEffortSearch`].
    pub fn search(
        &self,
        model: &ThermalModel,
        inputs: &CycleInputs,
        events: &mut Vec<ControlEvent>,
    ) -> Result<SearchOutcome> {
        let bounds = self.config.outlet_bounds();
        let (min, max) = (bounds.min, bounds.max);
        let target = inputs.target_indoor;
        let eq = |outlet: f64| {
            model.try_equilibrium(outlet, inputs.outdoor_temp, inputs.current_indoor, &inputs.external)
        };

        let eq_min = eq(min)?;
        let eq_max = eq(max)?;
        let unreachable = if target < eq_min {
            Some((SolveMethod::TargetBelowRange, min, eq_min))
        } else if target > eq_max {
            Some((SolveMethod::TargetAboveRange, max, eq_max))
        } else {
            None
        };
        if let Some((method, outlet, equilibrium)) = unreachable {
            warn!(
                target,
                eq_min,
                eq_max,
                chosen_outlet = outlet,
                "target unreachable within outlet bounds"
            );
            events.push(ControlEvent::TargetUnreachable {
                target,
                min_equilibrium: eq_min,
                max_equilibrium: eq_max,
                chosen_outlet: outlet,
            });
            return Ok(SearchOutcome {
                outlet,
                method,
                iterations: 0,
                equilibrium,
            });
        }

        let mut enforcer = BudgetEnforcer::new(self.config.search_budget());
        let (mut lo, mut hi) = (min, max);
        let mut best = SearchOutcome {
            outlet: 0.5 * (lo + hi),
            method: SolveMethod::BinarySearch,
            iterations: 0,
            equilibrium: f64::NAN,
        };
        let mut best_err = f64::INFINITY;

        while !enforcer.interval_collapsed(hi - lo) {
            match enforcer.check_iteration(hi - lo, best.outlet) {
                Ok(()) => {}
                Err(ControlError::SearchNonConvergence {
                    iterations,
                    interval_width,
                    best_outlet,
                }) => {
                    warn!(
                        iterations,
                        interval_width,
                        best_outlet,
                        "outlet search exhausted its budget, using best candidate"
                    );
                    events.push(ControlEvent::SearchExhausted {
                        iterations,
                        interval_width,
                        best_outlet,
                    });
                    best.method = SolveMethod::BestEffortSearch;
                    best.iterations = iterations;
                    return Ok(best);
                }
                Err(other) => return Err(other),
            }

            let mid = 0.5 * (lo + hi);
            let t_eq = eq(mid)?;
            let err = t_eq - target;
            if err.abs() < best_err {
                best_err = err.abs();
                best.outlet = mid;
                best.equilibrium = t_eq;
            }
            if enforcer.within_tolerance(err) {
                break;
            }
            if err < 0.0 {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        if !best.equilibrium.is_finite() {
            best.equilibrium = eq(best.outlet)?;
            best_err = (best.equilibrium - target).abs();
        }
        best.iterations = enforcer.iterations_used();
        debug!(
            iterations = best.iterations,
            outlet = best.outlet,
            equilibrium_error = best_err,
            elapsed_us = enforcer.elapsed_us(),
            "outlet search converged"
        );
        events.push(ControlEvent::SearchConverged {
            iterations: best.iterations,
            outlet: best.outlet,
            equilibrium_error: best_err,
        });
        Ok(best)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Simulate the horizon with cycle-aligned forecast windows.
    fn verify_trajectory(
        &self,
        model: &ThermalModel,
        inputs: &CycleInputs,
        outlet: f64,
        events: &mut Vec<ControlEvent>,
    ) -> TrajectoryResult {
        let horizon = self.config.trajectory_horizon_hours;
        let steps = ((horizon / self.cycle_hours) - 1e-9).ceil().max(1.0) as usize;
        let aligned = self.aligner.align(
            inputs.outdoor_temp,
            inputs.external.pv_watts(),
            inputs.forecast.as_ref(),
            inputs.hour_of_day,
            self.cycle_hours,
            steps,
        );
        if inputs.forecast.is_some() {
            for (series, source) in [
                ("outdoor_temp", aligned.outdoor_source),
                ("solar_watts", aligned.solar_source),
            ] {
                if source != AlignmentSource::Forecast {
                    debug!(series, ?source, "forecast series substituted");
                    events.push(ControlEvent::ForecastSubstituted {
                        series: series.to_string(),
                        source,
                    });
                }
            }
        }

        let sim = self.cycle_model(model);
        sim.predict_thermal_trajectory(
            inputs.current_indoor,
            inputs.target_indoor,
            outlet,
            inputs.outdoor_temp,
            horizon,
            &inputs.external,
            Some(&aligned.windows),
        )
    }

    /// The model stepped at the cycle length.
    fn cycle_model<'a>(&self, model: &'a ThermalModel) -> Cow<'a, ThermalModel> {
        if (model.time_step_hours() - self.cycle_hours).abs() < 1e-12 {
            Cow::Borrowed(model)
        } else {
            Cow::Owned(model.clone().with_time_step(self.cycle_hours))
        }
    }

    fn finish(
        &self,
        model: &ThermalModel,
        inputs: &CycleInputs,
        search: SearchOutcome,
        corrected: Option<f64>,
        trajectory: Option<TrajectoryResult>,
        events: Vec<ControlEvent>,
    ) -> OutletDecision {
        let bounds = self.config.outlet_bounds();
        let base_outlet = bounds.clamp(search.outlet);
        let outlet_temp = corrected.map(|o| bounds.clamp(o)).unwrap_or(base_outlet);
        let correction = outlet_temp - base_outlet;
        let correction_applied = corrected.is_some() && correction != 0.0;

        let predicted_equilibrium = model.predict_equilibrium_temperature(
            outlet_temp,
            inputs.outdoor_temp,
            inputs.current_indoor,
            &inputs.external,
        );
        let predicted_next_indoor = model.predict_indoor_after(
            inputs.current_indoor,
            outlet_temp,
            inputs.outdoor_temp,
            &inputs.external,
            self.cycle_hours,
        );

        let mut confidence = method_confidence(search.method);
        if correction_applied {
            confidence -= CORRECTION_CONFIDENCE_PENALTY;
        }

        info!(
            method = %search.method,
            outlet = outlet_temp,
            base_outlet,
            correction,
            iterations = search.iterations,
            predicted_equilibrium,
            "outlet decided"
        );

        OutletDecision {
            outlet_temp,
            base_outlet,
            method: search.method,
            correction,
            correction_applied,
            confidence: confidence.clamp(0.0, 1.0),
            iterations: search.iterations,
            predicted_equilibrium,
            predicted_next_indoor,
            trajectory,
            applied: true,
            events,
        }
    }

    /// Analytic inversion, then the current outlet.
    fn fallback(
        &self,
        model: &ThermalModel,
        inputs: &CycleInputs,
        err: ControlError,
        mut events: Vec<ControlEvent>,
    ) -> OutletDecision {
        warn!(error = %err, "physics search failed, trying analytic inversion");
        match model.calculate_optimal_outlet_temperature(
            inputs.target_indoor,
            inputs.current_indoor,
            inputs.outdoor_temp,
            &inputs.external,
        ) {
            Ok(outlet) => {
                events.push(ControlEvent::PhysicsFallback {
                    method: SolveMethod::AnalyticFallback,
                    reason: err.to_string(),
                });
                let search = SearchOutcome {
                    outlet: self.config.outlet_bounds().clamp(outlet),
                    method: SolveMethod::AnalyticFallback,
                    iterations: 0,
                    equilibrium: f64::NAN,
                };
                self.finish(model, inputs, search, None, None, events)
            }
            Err(analytic_err) => {
                warn!(error = %analytic_err, "analytic inversion failed, holding current outlet");
                self.hold_decision(inputs, format!("{err}; {analytic_err}"), events)
            }
        }
    }

    /// Keep the current outlet (or the minimum when unknown).
    fn hold_decision(
        &self,
        inputs: &CycleInputs,
        reason: String,
        mut events: Vec<ControlEvent>,
    ) -> OutletDecision {
        let bounds = self.config.outlet_bounds();
        let outlet_temp = bounds.clamp(
            inputs
                .current_outlet
                .filter(|o| o.is_finite())
                .unwrap_or(bounds.min),
        );
        events.push(ControlEvent::PhysicsFallback {
            method: SolveMethod::HoldCurrentOutlet,
            reason,
        });
        let indoor = if inputs.current_indoor.is_finite() {
            inputs.current_indoor
        } else {
            inputs.target_indoor
        };
        OutletDecision {
            outlet_temp,
            base_outlet: outlet_temp,
            method: SolveMethod::HoldCurrentOutlet,
            correction: 0.0,
            correction_applied: false,
            confidence: method_confidence(SolveMethod::HoldCurrentOutlet),
            iterations: 0,
            predicted_equilibrium: indoor,
            predicted_next_indoor: indoor,
            trajectory: None,
            applied: true,
            events,
        }
    }
}

/// Baseline confidence of each solve path.
fn method_confidence(method: SolveMethod) -> f64 {
    match method {
        SolveMethod::BinarySearch => 0.95,
        SolveMethod::BestEffortSearch => 0.7,
        SolveMethod::TargetBelowRange | SolveMethod::TargetAboveRange => 0.5,
        SolveMethod::AnalyticFallback => 0.3,
        SolveMethod::HoldCurrentOutlet => 0.1,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
