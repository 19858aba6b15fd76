//! Controller façade sequencing one control cycle.
//!
//! [`ThermalController`] owns the learner (and through it the model and the
//! tracker), the solver and a handle to the [`StateStore`]. A cycle is:
//!
//! 1. [`decide`](ThermalController::decide): solve for an outlet, remember
//!    the one-cycle indoor prediction, persist;
//! 2. the caller applies the outlet and waits one cycle;
//! 3. [`record_outcome`](ThermalController::record_outcome): compare the
//!    measured indoor temperature with the pending prediction, learn,
//!    persist.
//!
//! All mutating methods take `&mut self`, so record -> learn -> persist is a
//! critical section. Wrap the controller in [`SharedController`] to use it
//! from several threads. A failed write to the store never changes the
//! returned decision or outcome; it is logged, counted and retried on the
//! next cycle.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::ControlConfig;
use crate::error::Result;
use crate::events::ControlEvent;
use crate::forecast::ForecastAligner;
use crate::learner::{AdaptiveLearner, FeedbackOutcome, LearningState};
use crate::physics::ThermalModel;
use crate::solver::OutletSolver;
use crate::state::{BaselineParameters, BaselineSource, OperationalState, PersistedState};
use crate::telemetry::TelemetrySnapshot;
use crate::traits::StateStore;
use crate::tracker::PredictionTracker;
use crate::types::{CycleInputs, OutletDecision, PredictionContext};
use crate::validation::{validate_controller_id, validate_cycle_inputs};

/// Number of recent events kept for telemetry.
pub const EVENT_RING_CAPACITY: usize = 64;

/// Controller shared between threads.
pub type SharedController = Arc<Mutex<ThermalController>>;

/// Prediction made by the last decision, awaiting its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPrediction {
    pub predicted_indoor: f64,
    pub context: PredictionContext,
    pub made_at: DateTime<Utc>,
}

/// One controller instance: learner, solver and persistence glue.
pub struct ThermalController {
    id: String,
    config: ControlConfig,
    learner: AdaptiveLearner,
    solver: OutletSolver,
    store: Arc<dyn StateStore>,
    baseline_source: BaselineSource,
    operational: OperationalState,
    pending: Option<PendingPrediction>,
    recent_events: VecDeque<ControlEvent>,
}

impl std::fmt::Debug for ThermalController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThermalController")
            .field("id", &self.id)
            .field("store", &self.store.backend())
            .field("cycle_count", &self.learner.state().cycle_count)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl ThermalController {
    /// Build a controller, resuming from `store` if it holds state for `id`.
    ///
    /// A store read failure is logged and the controller starts from the
    /// configured coefficients.
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidInput`](crate::error::ControlError::InvalidInput)
    /// if `id` or `config` is invalid.
    #[instrument(skip(config, store), fields(backend = store.backend()))]
    pub fn new(id: &str, config: ControlConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        validate_controller_id(id)?;
        config.validate()?;

        let restored = match store.get(id) {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "could not load persisted state, starting fresh");
                None
            }
        };

        let cycle_hours = config.cycle_hours();
        let (learner, baseline_source, operational) = match restored {
            Some(state) => {
                info!(
                    cycle_count = state.learning_state.cycle_count,
                    source = ?state.baseline_parameters.source,
                    saved_at = %state.saved_at,
                    "resuming from persisted state"
                );
                let model = ThermalModel::new(state.baseline_parameters.values).with_time_step(cycle_hours);
                let learner = AdaptiveLearner::from_state(
                    model,
                    state.learning_state,
                    config.learner.clone(),
                    config.bounds.clone(),
                )
                .with_tracker(PredictionTracker::from_samples(state.prediction_samples));
                (learner, state.baseline_parameters.source, state.operational_state)
            }
            None => {
                info!("no persisted state, starting from configured coefficients");
                let model = ThermalModel::new(config.initial_coefficients.clone()).with_time_step(cycle_hours);
                let learner = AdaptiveLearner::from_state(
                    model,
                    LearningState::new(&config.learner),
                    config.learner.clone(),
                    config.bounds.clone(),
                );
                (learner, BaselineSource::Config, OperationalState::default())
            }
        };

        let solver = OutletSolver::new(
            config.solver.clone(),
            ForecastAligner::new(config.forecast.clone()),
            cycle_hours,
        );

        Ok(Self {
            id: id.to_string(),
            operational: OperationalState {
                shadow_mode: config.shadow_mode,
                ..operational
            },
            config,
            learner,
            solver,
            store,
            baseline_source,
            pending: None,
            recent_events: VecDeque::with_capacity(EVENT_RING_CAPACITY),
        })
    }

    /// Wrap in `Arc<Mutex<_>>`.
    pub fn into_shared(self) -> SharedController {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn learner(&self) -> &AdaptiveLearner {
        &self.learner
    }

    pub fn model(&self) -> &ThermalModel {
        self.learner.model()
    }

    pub fn solver(&self) -> &OutletSolver {
        &self.solver
    }

    pub fn pending_prediction(&self) -> Option<&PendingPrediction> {
        self.pending.as_ref()
    }

    pub fn operational_state(&self) -> &OperationalState {
        &self.operational
    }

    pub fn baseline_source(&self) -> BaselineSource {
        self.baseline_source
    }

    /// Events from recent cycles, oldest first.
    pub fn recent_events(&self) -> impl Iterator<Item = &ControlEvent> {
        self.recent_events.iter()
    }

    // -----------------------------------------------------------------------
    // Cycle
    // -----------------------------------------------------------------------

    /// Choose the outlet for this cycle.
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidInput`](crate::error::ControlError::InvalidInput)
    /// when the target, indoor or outdoor reading is not finite.
    pub fn decide(&mut self, inputs: &CycleInputs) -> Result<OutletDecision> {
        self.decide_at(inputs, Utc::now())
    }

    /// [`decide`](Self::decide) with an explicit clock.
    #[instrument(skip(self, inputs), fields(id = %self.id))]
    pub fn decide_at(&mut self, inputs: &CycleInputs, now: DateTime<Utc>) -> Result<OutletDecision> {
        validate_cycle_inputs(inputs)?;

        let mut decision = self.solver.solve(self.learner.model(), inputs);
        decision.applied = !self.config.shadow_mode;
        if self.config.shadow_mode {
            info!(outlet = decision.outlet_temp, "shadow mode, decision not applied");
        }

        if self.pending.is_some() {
            debug!("previous prediction had no outcome, replacing it");
        }
        self.pending = Some(PendingPrediction {
            predicted_indoor: decision.predicted_next_indoor,
            context: PredictionContext::new(
                decision.outlet_temp,
                inputs.outdoor_temp,
                inputs.current_indoor,
            )
            .with_external(inputs.external.clone())
            .with_elapsed_hours(self.config.cycle_hours()),
            made_at: now,
        });

        self.operational.last_outlet = Some(decision.outlet_temp);
        self.operational.last_target = Some(inputs.target_indoor);
        self.operational.last_cycle_at = Some(now);

        self.remember(&decision.events);
        if let Some(event) = self.persist(now) {
            decision.events.push(event);
        }
        Ok(decision)
    }

    /// Feed back the indoor temperature measured one cycle after the last
    /// decision.
    ///
    /// `applied_outlet` is the outlet the actuator actually ran, when it
    /// differs from the decision (shadow mode, manual override); the
    /// prediction is re-evaluated for it so the learner sees model error,
    /// not the override. `timestamp` defaults to now.
    ///
    /// Returns `Ok(None)` when no decision is pending.
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidInput`](crate::error::ControlError::InvalidInput)
    /// when `actual_indoor` is not finite. The pending prediction is kept.
    #[instrument(skip(self), fields(id = %self.id))]
    pub fn record_outcome(
        &mut self,
        actual_indoor: f64,
        applied_outlet: Option<f64>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Option<FeedbackOutcome>> {
        let Some(pending) = self.pending.as_ref() else {
            debug!("outcome without a pending prediction, ignored");
            return Ok(None);
        };

        let cycle_hours = self.config.cycle_hours();
        let elapsed = timestamp
            .map(|t| (t - pending.made_at).num_milliseconds() as f64 / 3_600_000.0)
            .filter(|h| *h > 0.0)
            .unwrap_or(cycle_hours);

        let mut context = pending.context.clone();
        let mut predicted = pending.predicted_indoor;
        let outlet_changed = applied_outlet
            .filter(|o| o.is_finite())
            .filter(|o| Some(*o) != context.outlet_temp);
        if outlet_changed.is_some() || (elapsed - cycle_hours).abs() > 1.0 / 60.0 {
            if let Some(o) = outlet_changed {
                context.outlet_temp = Some(o);
            }
            if let (Some(outlet), Some(outdoor), Some(indoor)) =
                (context.outlet_temp, context.outdoor_temp, context.current_indoor)
            {
                predicted = self
                    .learner
                    .model()
                    .predict_indoor_after(indoor, outlet, outdoor, &context.external, elapsed);
            }
        }
        context.elapsed_hours = Some(elapsed);

        let outcome = self
            .learner
            .update_prediction_feedback(predicted, actual_indoor, context, timestamp)?;
        self.pending = None;

        if outcome.step.as_ref().is_some_and(|s| s.max_delta() > 0.0) {
            self.baseline_source = BaselineSource::Calibrated;
        }
        self.remember(&outcome.events);

        let now = timestamp.unwrap_or_else(Utc::now);
        let mut outcome = outcome;
        if let Some(event) = self.persist(now) {
            outcome.events.push(event);
        }
        Ok(Some(outcome))
    }

    /// Feed back an externally computed prediction, bypassing the pending
    /// slot.
    ///
    /// # Errors
    ///
    /// See [`AdaptiveLearner::update_prediction_feedback`].
    pub fn record_feedback(
        &mut self,
        predicted: f64,
        actual: f64,
        context: PredictionContext,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<FeedbackOutcome> {
        let mut outcome = self
            .learner
            .update_prediction_feedback(predicted, actual, context, timestamp)?;
        if outcome.step.as_ref().is_some_and(|s| s.max_delta() > 0.0) {
            self.baseline_source = BaselineSource::Calibrated;
        }
        self.remember(&outcome.events);
        if let Some(event) = self.persist(timestamp.unwrap_or_else(Utc::now)) {
            outcome.events.push(event);
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Telemetry & persistence
    // -----------------------------------------------------------------------

    /// Telemetry relative to now. Pure read.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot_at(Utc::now())
    }

    /// Telemetry relative to `now`.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> TelemetrySnapshot {
        let events: Vec<ControlEvent> = self.recent_events.iter().cloned().collect();
        TelemetrySnapshot::collect(
            &self.id,
            &self.learner,
            self.baseline_source,
            &self.operational,
            &events,
            now,
        )
    }

    /// Document that [`persist`](Self::persist) writes.
    pub fn persisted_state(&self, now: DateTime<Utc>) -> PersistedState {
        let tracker = self.learner.tracker();
        PersistedState {
            baseline_parameters: BaselineParameters {
                source: self.baseline_source,
                values: self.learner.model().coefficients().clone(),
            },
            learning_state: self.learner.state().clone(),
            prediction_metrics: tracker.metrics_at(now),
            prediction_samples: tracker.samples().to_vec(),
            operational_state: self.operational.clone(),
            saved_at: now,
        }
    }

    /// Write state to the store. Returns the failure event, if any.
    fn persist(&mut self, now: DateTime<Utc>) -> Option<ControlEvent> {
        let state = self.persisted_state(now);
        match self.store.set(&self.id, &state) {
            Ok(()) => {
                debug!(backend = self.store.backend(), "state persisted");
                None
            }
            Err(err) => {
                self.operational.persistence_failures += 1;
                warn!(
                    error = %err,
                    failures = self.operational.persistence_failures,
                    "state persistence failed, will retry next cycle"
                );
                let event = ControlEvent::PersistenceFailed {
                    error: err.to_string(),
                    failure_count: self.operational.persistence_failures,
                };
                self.remember(std::slice::from_ref(&event));
                Some(event)
            }
        }
    }

    fn remember(&mut self, events: &[ControlEvent]) {
        for event in events {
            if self.recent_events.len() == EVENT_RING_CAPACITY {
                self.recent_events.pop_front();
            }
            self.recent_events.push_back(event.clone());
        }
    }
}
