//! Events emitted by the control engine.
//!
//! Every decision and feedback outcome carries the [`ControlEvent`]s raised
//! while producing it, so a caller can see why a setpoint looks the way it
//! does (target out of range, search exhausted, correction applied) without
//! scraping logs. The controller also keeps a short ring of recent events
//! for telemetry.

use serde::{Deserialize, Serialize};

use crate::forecast::AlignmentSource;
use crate::types::SolveMethod;

/// Events emitted during a control cycle.
///
/// Events are tagged with `#[serde(tag = "type")]` so they serialise as
/// `{ "type": "TargetUnreachable", ... }` for easy ingestion into event
/// stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlEvent {
    /// The target lies outside the equilibrium range of the outlet bounds.
    TargetUnreachable {
        /// Requested indoor temperature.
        target: f64,
        /// Equilibrium at the minimum outlet.
        min_equilibrium: f64,
        /// Equilibrium at the maximum outlet.
        max_equilibrium: f64,
        /// Bound that was returned instead.
        chosen_outlet: f64,
    },

    /// The outlet search converged.
    SearchConverged {
        /// Bisection steps executed.
        iterations: usize,
        /// Outlet found.
        outlet: f64,
        /// `|T_eq(outlet) - target|`.
        equilibrium_error: f64,
    },

    /// The outlet search hit its iteration cap; the best candidate was used.
    SearchExhausted {
        /// Bisection steps executed.
        iterations: usize,
        /// Width of the interval left (°C).
        interval_width: f64,
        /// Candidate returned.
        best_outlet: f64,
    },

    /// Trajectory verification changed the setpoint.
    CorrectionApplied {
        /// Trajectory error that triggered the correction (°C).
        trajectory_error: f64,
        /// `1 + time_pressure`.
        urgency: f64,
        /// Correction after clamping (°C).
        correction: f64,
        /// Outlet before correction.
        base_outlet: f64,
        /// Outlet after correction.
        corrected_outlet: f64,
    },

    /// The physics model could not be evaluated; a fallback was used.
    PhysicsFallback {
        /// Strategy used instead.
        method: SolveMethod,
        /// Human-readable reason.
        reason: String,
    },

    /// A forecast series was filled in rather than taken from the provider.
    ForecastSubstituted {
        /// `"outdoor_temp"` or `"solar_watts"`.
        series: String,
        /// Substitute used.
        source: AlignmentSource,
    },

    /// Feedback was recorded but learning was skipped.
    LearningSkipped {
        /// Cycle number of the skipped feedback.
        cycle: u64,
        /// Human-readable reason.
        reason: String,
    },

    /// The learner moved at least one coefficient.
    ParametersAdjusted {
        /// Cycle number.
        cycle: u64,
        /// Learning rate used.
        learning_rate: f64,
        /// Largest absolute coefficient change this cycle.
        max_delta: f64,
    },

    /// A feedback sample lacked readings needed for gradients.
    MissingContext {
        /// Names of the missing readings.
        fields: Vec<String>,
    },

    /// Writing state to the store failed. Retried next cycle.
    PersistenceFailed {
        /// Error text.
        error: String,
        /// Failures since the controller was created.
        failure_count: u64,
    },
}

impl ControlEvent {
    /// Short name of the variant, for counters and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlEvent::TargetUnreachable { .. } => "target_unreachable",
            ControlEvent::SearchConverged { .. } => "search_converged",
            ControlEvent::SearchExhausted { .. } => "search_exhausted",
            ControlEvent::CorrectionApplied { .. } => "correction_applied",
            ControlEvent::PhysicsFallback { .. } => "physics_fallback",
            ControlEvent::ForecastSubstituted { .. } => "forecast_substituted",
            ControlEvent::LearningSkipped { .. } => "learning_skipped",
            ControlEvent::ParametersAdjusted { .. } => "parameters_adjusted",
            ControlEvent::MissingContext { .. } => "missing_context",
            ControlEvent::PersistenceFailed { .. } => "persistence_failed",
        }
    }
}
