//! Read-only telemetry snapshot.
//!
//! [`TelemetrySnapshot`] gathers everything a monitoring surface shows:
//! coefficients, learning progress, windowed accuracy, tier breakdowns and a
//! coarse [`ModelHealth`] verdict. Building one has no side effects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::ControlEvent;
use crate::learner::{AdaptiveLearner, LearningStatus};
use crate::physics::ThermalCoefficients;
use crate::state::{BaselineSource, OperationalState};
use crate::tracker::{AccuracyBreakdown, PredictionTracker, WindowMetrics};

/// 24h MAE at or below which the model is healthy (°C).
pub const GOOD_MAE: f64 = 0.3;

/// 24h MAE at or below which the model is usable (°C).
pub const FAIR_MAE: f64 = 0.6;

/// Recent window MAE above `previous * ratio + slack` counts as worsening.
const WORSENING_RATIO: f64 = 1.5;
const WORSENING_SLACK: f64 = 0.05;

/// Coarse model quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelHealth {
    Good,
    Fair,
    Degraded,
    /// Fewer samples than one learning window.
    InsufficientData,
}

impl std::fmt::Display for ModelHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelHealth::Good => write!(f, "good"),
            ModelHealth::Fair => write!(f, "fair"),
            ModelHealth::Degraded => write!(f, "degraded"),
            ModelHealth::InsufficientData => write!(f, "insufficient_data"),
        }
    }
}

/// Classify model health from the 24h MAE and the trend between the newest
/// `window` samples and the `window` before them.
///
/// A low MAE with a sharply worsening trend is downgraded to `Fair`.
pub fn classify_health(tracker: &PredictionTracker, now: DateTime<Utc>, window: usize) -> ModelHealth {
    if window == 0 || tracker.len() < window {
        return ModelHealth::InsufficientData;
    }
    let metrics = tracker.metrics_at(now);
    let Some(mae) = metrics.last_24h.mae.or(metrics.all_time.mae) else {
        return ModelHealth::InsufficientData;
    };
    let worsening = match (tracker.trailing_mae(window, 0), tracker.trailing_mae(window, window)) {
        (Some(recent), Some(previous)) => recent > previous * WORSENING_RATIO + WORSENING_SLACK,
        _ => false,
    };

    if mae <= GOOD_MAE && !worsening {
        ModelHealth::Good
    } else if mae <= FAIR_MAE {
        ModelHealth::Fair
    } else {
        ModelHealth::Degraded
    }
}

/// Everything a monitoring surface needs, at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub controller_id: String,
    pub taken_at: DateTime<Utc>,
    pub coefficients: ThermalCoefficients,
    pub baseline_source: BaselineSource,
    pub learning_status: LearningStatus,
    pub learning_confidence: f64,
    pub learning_rate: f64,
    pub cycle_count: u64,
    pub parameter_updates: usize,
    pub model_health: ModelHealth,
    pub all_time: WindowMetrics,
    pub last_24h: WindowMetrics,
    pub accuracy_all_time: AccuracyBreakdown,
    pub accuracy_24h: AccuracyBreakdown,
    pub good_control_percentage: f64,
    pub good_control_percentage_24h: f64,
    pub total_predictions: usize,
    /// Timestamp of the newest prediction sample.
    pub last_updated: Option<DateTime<Utc>>,
    pub operational: OperationalState,
    pub recent_events: Vec<ControlEvent>,
}

impl TelemetrySnapshot {
    /// Assemble a snapshot relative to `now`.
    pub fn collect(
        controller_id: &str,
        learner: &AdaptiveLearner,
        baseline_source: BaselineSource,
        operational: &OperationalState,
        recent_events: &[ControlEvent],
        now: DateTime<Utc>,
    ) -> Self {
        let tracker = learner.tracker();
        let metrics = tracker.metrics_at(now);
        let learning = learner.learning_metrics();
        let accuracy_all_time = tracker.get_simplified_accuracy_breakdown();
        let accuracy_24h = tracker.accuracy_breakdown_24h_at(now);

        Self {
            controller_id: controller_id.to_string(),
            taken_at: now,
            coefficients: learning.coefficients,
            baseline_source,
            learning_status: learning.status,
            learning_confidence: learning.learning_confidence,
            learning_rate: learning.learning_rate,
            cycle_count: learning.cycle_count,
            parameter_updates: learning.parameter_updates,
            model_health: classify_health(tracker, now, learner.config().recent_error_window),
            good_control_percentage: accuracy_all_time.good_control_percentage(),
            good_control_percentage_24h: accuracy_24h.good_control_percentage(),
            all_time: metrics.all_time,
            last_24h: metrics.last_24h,
            accuracy_all_time,
            accuracy_24h,
            total_predictions: metrics.total_predictions,
            last_updated: metrics.last_updated,
            operational: operational.clone(),
            recent_events: recent_events.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PredictionContext;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn tracker_with(errors: &[f64]) -> PredictionTracker {
        let mut tracker = PredictionTracker::new();
        let start = now() - Duration::minutes(30 * errors.len() as i64);
        for (i, e) in errors.iter().enumerate() {
            tracker
                .add_prediction(
                    20.0,
                    20.0 + e,
                    PredictionContext::default(),
                    Some(start + Duration::minutes(30 * i as i64)),
                )
                .unwrap();
        }
        tracker
    }

    #[test]
    fn too_few_samples() {
        assert_eq!(
            classify_health(&tracker_with(&[0.1; 5]), now(), 10),
            ModelHealth::InsufficientData
        );
    }

    #[test]
    fn steady_small_errors_are_good() {
        assert_eq!(classify_health(&tracker_with(&[0.1; 20]), now(), 10), ModelHealth::Good);
    }

    #[test]
    fn worsening_trend_downgrades() {
        let mut errors = vec![0.02; 10];
        errors.extend([0.45; 10]);
        assert_eq!(classify_health(&tracker_with(&errors), now(), 10), ModelHealth::Fair);
    }

    #[test]
    fn large_errors_are_degraded() {
        assert_eq!(classify_health(&tracker_with(&[1.2; 12]), now(), 10), ModelHealth::Degraded);
    }

    #[test]
    fn display_names() {
        assert_eq!(ModelHealth::InsufficientData.to_string(), "insufficient_data");
    }
}
