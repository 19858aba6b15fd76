//! Online calibration of the thermal coefficients.
//!
//! [`AdaptiveLearner`] owns the [`ThermalModel`] (the only writer of its
//! coefficients) and the [`PredictionTracker`]. Each feedback event:
//!
//! 1. is appended to the tracker and bumps `cycle_count`, unconditionally;
//! 2. is skipped for learning if it is the first since construction or
//!    load, because the prediction it answers was made by a different
//!    process;
//! 3. otherwise enters the recent window, nudges the learning confidence,
//!    and, once the window is full, drives one gradient step on
//!    `thermal_time_constant`, `heat_loss_coefficient` and
//!    `outlet_effectiveness`.
//!
//! Gradients are `g_p = mean(e_i * d pred_i / d p)` over the window with
//! `e = actual - predicted`, evaluated by central finite differences on the
//! one-step prediction at the current coefficients. Moving `p` along `g_p`
//! reduces the squared prediction error.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::{CoefficientBounds, LearnerConfig, ParamBound};
use crate::error::Result;
use crate::events::ControlEvent;
use crate::physics::{equilibrium_from_parts, relax, ThermalCoefficients, ThermalModel};
use crate::tracker::{PredictionSample, PredictionTracker};
use crate::types::PredictionContext;

/// Names of the learned scalar coefficients, in gradient order.
pub const LEARNED_PARAMETERS: [&str; 3] = [
    "thermal_time_constant",
    "heat_loss_coefficient",
    "outlet_effectiveness",
];

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// One gradient step, recorded whether or not it moved anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterHistoryEntry {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub gradients: BTreeMap<String, f64>,
    /// Change actually applied after step limiting and clamping.
    pub deltas: BTreeMap<String, f64>,
    pub learning_rate: f64,
    pub learning_confidence: f64,
    /// MAE of the window that produced the step.
    pub window_mae: f64,
    /// `true` if the largest delta exceeded the notable threshold.
    pub notable: bool,
}

impl ParameterHistoryEntry {
    /// Largest absolute applied change.
    pub fn max_delta(&self) -> f64 {
        self.deltas.values().fold(0.0, |acc, d| acc.max(d.abs()))
    }
}

fn first_cycle_since_load() -> bool {
    true
}

/// Persistent learning progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningState {
    /// Number of the next feedback cycle. Starts at 1.
    pub cycle_count: u64,
    pub learning_confidence: f64,
    /// Most recent samples used for confidence and gradients.
    pub recent_window: VecDeque<PredictionSample>,
    pub parameter_history: Vec<ParameterHistoryEntry>,
    /// Set on construction and on every load; cleared by the first feedback.
    #[serde(skip, default = "first_cycle_since_load")]
    pub is_first_cycle_since_load: bool,
}

impl LearningState {
    /// Fresh state with the configured default confidence.
    pub fn new(config: &LearnerConfig) -> Self {
        Self {
            cycle_count: 1,
            learning_confidence: config.default_confidence,
            recent_window: VecDeque::with_capacity(config.recent_error_window),
            parameter_history: Vec::new(),
            is_first_cycle_since_load: true,
        }
    }

    /// Errors of the recent window, oldest first.
    pub fn recent_errors(&self) -> Vec<f64> {
        self.recent_window.iter().map(|s| s.error).collect()
    }
}

/// Whether the learner is adjusting coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LearningStatus {
    /// The next feedback will be recorded but not learned from.
    FirstCycleSkip,
    /// The recent window is not full yet.
    InsufficientData { have: usize, need: usize },
    /// Gradient steps are being taken.
    Active,
}

/// Result of one [`AdaptiveLearner::update_prediction_feedback`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackOutcome {
    /// Cycle number this feedback was recorded under.
    pub cycle: u64,
    pub status: LearningStatus,
    /// `actual - predicted`.
    pub error: f64,
    /// History entry for this cycle, if a step was taken.
    pub step: Option<ParameterHistoryEntry>,
    pub events: Vec<ControlEvent>,
}

/// Snapshot of learner progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningMetrics {
    pub status: LearningStatus,
    pub cycle_count: u64,
    pub learning_confidence: f64,
    pub learning_rate: f64,
    pub window_len: usize,
    pub window_mae: Option<f64>,
    pub parameter_updates: usize,
    pub coefficients: ThermalCoefficients,
}

// ---------------------------------------------------------------------------
// AdaptiveLearner
// ---------------------------------------------------------------------------

/// Gradient-based coefficient calibration.
#[derive(Debug, Clone)]
pub struct AdaptiveLearner {
    model: ThermalModel,
    tracker: PredictionTracker,
    state: LearningState,
    config: LearnerConfig,
    bounds: CoefficientBounds,
}

impl AdaptiveLearner {
    /// Learner with fresh state. The model's coefficients are clamped into
    /// `bounds`.
    pub fn new(model: ThermalModel, config: LearnerConfig, bounds: CoefficientBounds) -> Self {
        let state = LearningState::new(&config);
        Self::from_state(model, state, config, bounds)
    }

    /// Learner resuming from persisted state. The first feedback after this
    /// call is always skipped.
    pub fn from_state(
        mut model: ThermalModel,
        mut state: LearningState,
        config: LearnerConfig,
        bounds: CoefficientBounds,
    ) -> Self {
        model.set_coefficients(bounds.clamp(model.coefficients()));
        state.is_first_cycle_since_load = true;
        state.cycle_count = state.cycle_count.max(1);
        state.learning_confidence = if state.learning_confidence.is_finite() {
            config.confidence_bounds().clamp(state.learning_confidence)
        } else {
            config.default_confidence
        };
        while state.recent_window.len() > config.recent_error_window {
            state.recent_window.pop_front();
        }
        Self {
            model,
            tracker: PredictionTracker::new(),
            state,
            config,
            bounds,
        }
    }

    /// Replace the (empty) prediction log, e.g. with restored samples.
    pub fn with_tracker(mut self, tracker: PredictionTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn model(&self) -> &ThermalModel {
        &self.model
    }

    pub fn tracker(&self) -> &PredictionTracker {
        &self.tracker
    }

    pub fn state(&self) -> &LearningState {
        &self.state
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    pub fn bounds(&self) -> &CoefficientBounds {
        &self.bounds
    }

    /// `clamp(base * default_confidence / confidence, min_rate, max_rate)`.
    ///
    /// Confidence rises while errors shrink, so a well-calibrated model
    /// takes smaller steps and a drifting one larger steps.
    ///
    /// The direction of this scaling (inverse in confidence) awaits
    /// product-owner confirmation.
    pub fn current_learning_rate(&self) -> f64 {
        let c = &self.config;
        let confidence = self.state.learning_confidence.max(f64::EPSILON);
        c.learning_rate_bounds()
            .clamp(c.base_learning_rate * c.default_confidence / confidence)
    }

    /// Current learning status.
    pub fn status(&self) -> LearningStatus {
        let need = self.config.recent_error_window;
        let have = self.state.recent_window.len();
        if self.state.is_first_cycle_since_load {
            LearningStatus::FirstCycleSkip
        } else if have < need {
            LearningStatus::InsufficientData { have, need }
        } else {
            LearningStatus::Active
        }
    }

    /// Progress snapshot.
    pub fn learning_metrics(&self) -> LearningMetrics {
        let errors = self.state.recent_errors();
        LearningMetrics {
            status: self.status(),
            cycle_count: self.state.cycle_count,
            learning_confidence: self.state.learning_confidence,
            learning_rate: self.current_learning_rate(),
            window_len: errors.len(),
            window_mae: mean_abs(&errors),
            parameter_updates: self.state.parameter_history.len(),
            coefficients: self.model.coefficients().clone(),
        }
    }

    /// Record an observed outcome and learn from it.
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidInput`](crate::error::ControlError::InvalidInput)
    /// if `predicted` or `actual` is not finite. Nothing is recorded and the
    /// cycle counter is left alone in that case.
    #[instrument(skip(self, context), fields(cycle = self.state.cycle_count))]
    pub fn update_prediction_feedback(
        &mut self,
        predicted: f64,
        actual: f64,
        context: PredictionContext,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<FeedbackOutcome> {
        let sample = self
            .tracker
            .add_prediction(predicted, actual, context, timestamp)?
            .clone();
        let cycle = self.state.cycle_count;
        self.state.cycle_count += 1;

        let mut events = Vec::new();
        let missing = sample.context.missing_fields();
        if !missing.is_empty() {
            debug!(?missing, "feedback context incomplete, gradients default to zero");
            events.push(ControlEvent::MissingContext {
                fields: missing.iter().map(|f| f.to_string()).collect(),
            });
        }

        if self.state.is_first_cycle_since_load {
            self.state.is_first_cycle_since_load = false;
            info!(cycle, error = sample.error, "first cycle since load, learning skipped");
            events.push(ControlEvent::LearningSkipped {
                cycle,
                reason: "first cycle since load".into(),
            });
            return Ok(FeedbackOutcome {
                cycle,
                status: LearningStatus::FirstCycleSkip,
                error: sample.error,
                step: None,
                events,
            });
        }

        let error = sample.error;
        if self.state.recent_window.len() == self.config.recent_error_window {
            self.state.recent_window.pop_front();
        }
        self.state.recent_window.push_back(sample);
        self.update_confidence();

        let need = self.config.recent_error_window;
        let have = self.state.recent_window.len();
        if have < need {
            debug!(have, need, "recent window filling");
            return Ok(FeedbackOutcome {
                cycle,
                status: LearningStatus::InsufficientData { have, need },
                error,
                step: None,
                events,
            });
        }

        let step = self.gradient_step(cycle, timestamp.unwrap_or_else(Utc::now));
        if step.notable {
            info!(
                cycle,
                learning_rate = step.learning_rate,
                max_delta = step.max_delta(),
                deltas = ?step.deltas,
                "coefficients adjusted"
            );
            events.push(ControlEvent::ParametersAdjusted {
                cycle,
                learning_rate: step.learning_rate,
                max_delta: step.max_delta(),
            });
        } else {
            debug!(cycle, max_delta = step.max_delta(), "coefficient step below notable threshold");
        }

        // Every active cycle is recorded, including zero-delta steps.
        self.state.parameter_history.push(step.clone());

        Ok(FeedbackOutcome {
            cycle,
            status: LearningStatus::Active,
            error,
            step: Some(step),
            events,
        })
    }

    /// Compare the older and newer halves of the window.
    fn update_confidence(&mut self) {
        let errors = self.state.recent_errors();
        if errors.len() < 4 {
            return;
        }
        let mid = errors.len() / 2;
        let (older, newer) = errors.split_at(mid);
        let (Some(older), Some(newer)) = (mean_abs(older), mean_abs(newer)) else {
            return;
        };
        let c = &self.config;
        let factor = if newer < older {
            c.confidence_growth
        } else if newer > older {
            c.confidence_decay
        } else {
            1.0
        };
        let before = self.state.learning_confidence;
        self.state.learning_confidence = c.confidence_bounds().clamp(before * factor);
        debug!(
            older_mae = older,
            newer_mae = newer,
            confidence = self.state.learning_confidence,
            "learning confidence updated"
        );
    }

    /// One bounded gradient step over the full window.
    fn gradient_step(&mut self, cycle: u64, timestamp: DateTime<Utc>) -> ParameterHistoryEntry {
        let coeffs = self.model.coefficients().clone();
        let default_hours = self.model.time_step_hours();
        let eps = self.config.gradient_epsilon;

        let params = [
            coeffs.thermal_time_constant,
            coeffs.heat_loss_coefficient,
            coeffs.outlet_effectiveness,
        ];
        let bounds: [ParamBound; 3] = [
            self.bounds.thermal_time_constant,
            self.bounds.heat_loss_coefficient,
            self.bounds.outlet_effectiveness,
        ];

        let mut gradients = [0.0f64; 3];
        let window = &self.state.recent_window;
        for sample in window {
            let Some(inputs) = GradientInputs::from_context(&sample.context, &coeffs, default_hours)
            else {
                continue;
            };
            for (idx, grad) in gradients.iter_mut().enumerate() {
                let h = eps * params[idx].abs().max(1.0);
                let mut up = params;
                let mut down = params;
                up[idx] += h;
                down[idx] -= h;
                if let (Some(p_up), Some(p_down)) = (inputs.predict(up), inputs.predict(down)) {
                    let derivative = (p_up - p_down) / (2.0 * h);
                    if derivative.is_finite() {
                        *grad += sample.error * derivative;
                    }
                }
            }
        }
        let n = window.len().max(1) as f64;
        for g in &mut gradients {
            *g /= n;
        }

        let rate = self.current_learning_rate();
        let mut updated = params;
        let mut deltas = [0.0f64; 3];
        for idx in 0..3 {
            let max_step = self.config.max_step_fraction * bounds[idx].width();
            let raw = ParamBound::new(-max_step, max_step).clamp(rate * gradients[idx]);
            updated[idx] = bounds[idx].clamp(params[idx] + raw);
            deltas[idx] = updated[idx] - params[idx];
        }

        let mut next = coeffs;
        next.thermal_time_constant = updated[0];
        next.heat_loss_coefficient = updated[1];
        next.outlet_effectiveness = updated[2];
        self.model.set_coefficients(next);

        let max_delta = deltas.iter().fold(0.0f64, |acc, d| acc.max(d.abs()));
        ParameterHistoryEntry {
            cycle,
            timestamp,
            gradients: named(&gradients),
            deltas: named(&deltas),
            learning_rate: rate,
            learning_confidence: self.state.learning_confidence,
            window_mae: mean_abs(&self.state.recent_errors()).unwrap_or(0.0),
            notable: max_delta > self.config.notable_change_threshold,
        }
    }
}

/// Sample readings needed to re-evaluate a one-step prediction.
struct GradientInputs {
    outlet: f64,
    outdoor: f64,
    indoor: f64,
    external_sum: f64,
    hours: f64,
}

impl GradientInputs {
    fn from_context(
        ctx: &PredictionContext,
        coeffs: &ThermalCoefficients,
        default_hours: f64,
    ) -> Option<Self> {
        let finite = |v: Option<f64>| v.filter(|x| x.is_finite());
        Some(Self {
            outlet: finite(ctx.outlet_temp)?,
            outdoor: finite(ctx.outdoor_temp)?,
            indoor: finite(ctx.current_indoor)?,
            external_sum: coeffs.external_contribution(&ctx.external),
            hours: finite(ctx.elapsed_hours)
                .filter(|h| *h > 0.0)
                .unwrap_or(default_hours),
        })
    }

    /// One-step prediction for `[tau, loss, eff]`.
    fn predict(&self, [tau, loss, eff]: [f64; 3]) -> Option<f64> {
        let t_eq = equilibrium_from_parts(eff, loss, self.external_sum, self.outlet, self.outdoor)?;
        let next = relax(self.indoor, t_eq, self.hours, tau);
        next.is_finite().then_some(next)
    }
}

fn named(values: &[f64; 3]) -> BTreeMap<String, f64> {
    LEARNED_PARAMETERS
        .iter()
        .zip(values)
        .map(|(name, v)| (name.to_string(), *v))
        .collect()
}

fn mean_abs(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().map(|v| v.abs()).sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn learner() -> AdaptiveLearner {
        AdaptiveLearner::new(
            ThermalModel::default().with_time_step(0.5),
            LearnerConfig::default(),
            CoefficientBounds::default(),
        )
    }

    fn ctx() -> PredictionContext {
        PredictionContext::new(40.0, 5.0, 20.0).with_elapsed_hours(0.5)
    }

    #[test]
    fn fresh_state() {
        let l = learner();
        assert_eq!(l.state().cycle_count, 1);
        assert_eq!(l.state().learning_confidence, 3.0);
        assert_eq!(l.status(), LearningStatus::FirstCycleSkip);
        assert_relative_eq!(l.current_learning_rate(), 0.01);
    }

    #[test]
    fn first_feedback_is_recorded_but_skipped() {
        let mut l = learner();
        let before = l.model().coefficients().clone();
        let out = l.update_prediction_feedback(20.5, 21.0, ctx(), None).unwrap();
        assert_eq!(out.status, LearningStatus::FirstCycleSkip);
        assert_eq!(out.cycle, 1);
        assert!(matches!(out.events[0], ControlEvent::LearningSkipped { cycle: 1, .. }));
        assert_eq!(l.tracker().len(), 1);
        assert_eq!(l.state().cycle_count, 2);
        assert!(l.state().recent_window.is_empty());
        assert_eq!(l.model().coefficients(), &before);
    }

    #[test]
    fn insufficient_data_until_window_full() {
        let mut l = learner();
        l.update_prediction_feedback(20.5, 21.0, ctx(), None).unwrap();
        for i in 1..10 {
            let out = l.update_prediction_feedback(20.5, 21.0, ctx(), None).unwrap();
            assert_eq!(out.status, LearningStatus::InsufficientData { have: i, need: 10 });
        }
        let out = l.update_prediction_feedback(20.5, 21.0, ctx(), None).unwrap();
        assert_eq!(out.status, LearningStatus::Active);
        assert!(out.step.is_some());
        assert_eq!(l.state().parameter_history.len(), 1);
    }

    #[test]
    fn learning_rate_tracks_confidence_inversely() {
        let mut l = learner();
        l.state.learning_confidence = 1.5;
        assert_relative_eq!(l.current_learning_rate(), 0.02, epsilon = 1e-12);
        l.state.learning_confidence = 5.0;
        assert_relative_eq!(l.current_learning_rate(), 0.006, epsilon = 1e-12);
        l.state.learning_confidence = 0.5;
        assert_relative_eq!(l.current_learning_rate(), 0.05, epsilon = 1e-12);
    }

    #[test]
    fn confidence_rises_when_errors_shrink() {
        let mut l = learner();
        l.update_prediction_feedback(20.0, 20.0, ctx(), None).unwrap();
        for err in [1.0, 0.8, 0.3, 0.1] {
            l.update_prediction_feedback(20.0, 20.0 + err, ctx(), None).unwrap();
        }
        assert!(l.state().learning_confidence > 3.0);
    }

    #[test]
    fn confidence_stays_bounded() {
        let mut l = learner();
        l.update_prediction_feedback(20.0, 20.0, ctx(), None).unwrap();
        let mut err: f64 = 0.01;
        for _ in 0..200 {
            err *= 1.1;
            l.update_prediction_feedback(20.0, 20.0 + err.min(50.0), ctx(), None)
                .unwrap();
        }
        assert!(l.state().learning_confidence >= 0.5 - 1e-12);
    }

    #[test]
    fn warmer_than_predicted_raises_effectiveness() {
        let mut l = learner();
        let eff0 = l.model().coefficients().outlet_effectiveness;
        for _ in 0..11 {
            l.update_prediction_feedback(20.5, 21.0, ctx(), None).unwrap();
        }
        let eff1 = l.model().coefficients().outlet_effectiveness;
        assert!(eff1 > eff0, "eff {eff0} -> {eff1}");
        let step = &l.state().parameter_history[0];
        assert!(step.max_delta() <= 0.02 * 23.5 + 1e-12);
    }

    #[test]
    fn missing_context_records_noop_history() {
        let mut l = learner();
        for _ in 0..11 {
            l.update_prediction_feedback(20.5, 21.0, PredictionContext::default(), None)
                .unwrap();
        }
        assert_eq!(l.state().parameter_history.len(), 1);
        let step = &l.state().parameter_history[0];
        assert_eq!(step.max_delta(), 0.0);
        assert!(!step.notable);
        assert_eq!(l.state().cycle_count, 12);
    }

    #[test]
    fn restored_state_skips_first_cycle_again() {
        let mut l = learner();
        for _ in 0..3 {
            l.update_prediction_feedback(20.5, 21.0, ctx(), None).unwrap();
        }
        let json = serde_json::to_string(l.state()).unwrap();
        let state: LearningState = serde_json::from_str(&json).unwrap();
        assert!(state.is_first_cycle_since_load);
        let mut restored = AdaptiveLearner::from_state(
            l.model().clone(),
            state,
            LearnerConfig::default(),
            CoefficientBounds::default(),
        );
        assert_eq!(restored.state().cycle_count, 4);
        let out = restored.update_prediction_feedback(20.5, 21.0, ctx(), None).unwrap();
        assert_eq!(out.status, LearningStatus::FirstCycleSkip);
        assert_eq!(restored.state().recent_window.len(), 2);
    }

    #[test]
    fn non_finite_feedback_rejected_without_side_effects() {
        let mut l = learner();
        assert!(l.update_prediction_feedback(20.0, f64::NAN, ctx(), None).is_err());
        assert_eq!(l.state().cycle_count, 1);
        assert!(l.tracker().is_empty());
    }
}
