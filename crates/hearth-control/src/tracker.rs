//! Prediction accuracy tracking.
//!
//! [`PredictionTracker`] is an append-only log of
//! `(predicted, actual, context, timestamp)` samples. Every statistic it
//! reports (windowed MAE/RMSE, accuracy tiers, good-control percentage) is
//! recomputed from the log on demand, so the numbers can never drift from
//! the data they summarise.
//!
//! All time-windowed queries have an `*_at(now)` form taking an explicit
//! reference time; the plain forms use `Utc::now()`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ValidationError;
use crate::physics::FLOAT_SLACK;
use crate::types::PredictionContext;

/// Errors below this magnitude count as exactly zero.
pub const PERFECT_EPSILON: f64 = 1e-12;

/// Upper bound (inclusive) of the tolerable tier, °C.
pub const TOLERABLE_ERROR: f64 = 0.1;

/// Legacy tier upper bounds (inclusive), °C.
const LEGACY_EXCELLENT: f64 = 0.1;
const LEGACY_VERY_GOOD: f64 = 0.2;
const LEGACY_GOOD: f64 = 0.5;
const LEGACY_ACCEPTABLE: f64 = 1.0;

// ---------------------------------------------------------------------------
// Sample and metric types
// ---------------------------------------------------------------------------

/// One recorded prediction and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSample {
    pub predicted_temp: f64,
    pub actual_temp: f64,
    /// `actual_temp - predicted_temp`.
    pub error: f64,
    pub context: PredictionContext,
    pub timestamp: DateTime<Utc>,
}

/// Error statistics over one time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowMetrics {
    pub sample_count: usize,
    /// `None` when the window holds no samples.
    pub mae: Option<f64>,
    /// `None` when the window holds no samples.
    pub rmse: Option<f64>,
}

impl WindowMetrics {
    fn from_errors<'a>(errors: impl Iterator<Item = &'a f64>) -> Self {
        let (mut n, mut abs_sum, mut sq_sum) = (0usize, 0.0f64, 0.0f64);
        for e in errors {
            n += 1;
            abs_sum += e.abs();
            sq_sum += e * e;
        }
        if n == 0 {
            return Self::default();
        }
        Self {
            sample_count: n,
            mae: Some(abs_sum / n as f64),
            rmse: Some((sq_sum / n as f64).sqrt()),
        }
    }
}

/// Count and share of samples in one accuracy tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TierStat {
    pub count: usize,
    /// Percentage (0-100) of the samples considered.
    pub percentage: f64,
}

impl TierStat {
    fn of(count: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            0.0
        } else {
            count as f64 * 100.0 / total as f64
        };
        Self { count, percentage }
    }
}

/// Three-tier accuracy classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyBreakdown {
    /// `|error| == 0`.
    pub perfect: TierStat,
    /// `0 < |error| <= 0.1`.
    pub tolerable: TierStat,
    /// `|error| > 0.1`.
    pub poor: TierStat,
    pub total: usize,
}

impl AccuracyBreakdown {
    fn from_errors<'a>(errors: impl Iterator<Item = &'a f64>) -> Self {
        let (mut perfect, mut tolerable, mut poor) = (0usize, 0usize, 0usize);
        for e in errors {
            let abs = e.abs();
            if abs < PERFECT_EPSILON {
                perfect += 1;
            } else if abs <= TOLERABLE_ERROR + FLOAT_SLACK {
                tolerable += 1;
            } else {
                poor += 1;
            }
        }
        let total = perfect + tolerable + poor;
        Self {
            perfect: TierStat::of(perfect, total),
            tolerable: TierStat::of(tolerable, total),
            poor: TierStat::of(poor, total),
            total,
        }
    }

    /// `perfect + tolerable` percentage.
    #[inline]
    pub fn good_control_percentage(&self) -> f64 {
        self.perfect.percentage + self.tolerable.percentage
    }
}

/// Five-tier breakdown kept for dashboards built against the old metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyAccuracyBreakdown {
    /// `<= 0.1`
    pub excellent: TierStat,
    /// `<= 0.2`
    pub very_good: TierStat,
    /// `<= 0.5`
    pub good: TierStat,
    /// `<= 1.0`
    pub acceptable: TierStat,
    /// `> 1.0`
    pub poor: TierStat,
}

impl LegacyAccuracyBreakdown {
    fn from_errors<'a>(errors: impl Iterator<Item = &'a f64>) -> Self {
        let mut counts = [0usize; 5];
        for e in errors {
            let abs = e.abs() - FLOAT_SLACK;
            let tier = if abs <= LEGACY_EXCELLENT {
                0
            } else if abs <= LEGACY_VERY_GOOD {
                1
            } else if abs <= LEGACY_GOOD {
                2
            } else if abs <= LEGACY_ACCEPTABLE {
                3
            } else {
                4
            };
            counts[tier] += 1;
        }
        let total: usize = counts.iter().sum();
        Self {
            excellent: TierStat::of(counts[0], total),
            very_good: TierStat::of(counts[1], total),
            good: TierStat::of(counts[2], total),
            acceptable: TierStat::of(counts[3], total),
            poor: TierStat::of(counts[4], total),
        }
    }
}

/// Full metric set reported by [`PredictionTracker::get_metrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionMetrics {
    pub last_1h: WindowMetrics,
    pub last_6h: WindowMetrics,
    pub last_24h: WindowMetrics,
    pub all_time: WindowMetrics,
    pub accuracy_breakdown: LegacyAccuracyBreakdown,
    pub total_predictions: usize,
    /// Timestamp of the newest sample.
    pub last_updated: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// PredictionTracker
// ---------------------------------------------------------------------------

/// Append-only prediction log with derived accuracy statistics.
#[derive(Debug, Clone, Default)]
pub struct PredictionTracker {
    samples: Vec<PredictionSample>,
}

impl PredictionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker seeded with previously recorded samples (e.g. after a
    /// restart). Samples are sorted by timestamp; non-finite ones are
    /// dropped.
    pub fn from_samples(mut samples: Vec<PredictionSample>) -> Self {
        samples.retain(|s| s.error.is_finite() && s.predicted_temp.is_finite());
        samples.sort_by_key(|s| s.timestamp);
        Self { samples }
    }

    /// Append a sample. `timestamp` defaults to now.
    ///
    /// # Errors
    ///
    /// [`ValidationError::NonFiniteValue`] when either temperature is NaN or
    /// infinite; the log is left unchanged.
    pub fn add_prediction(
        &mut self,
        predicted: f64,
        actual: f64,
        context: PredictionContext,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<&PredictionSample, ValidationError> {
        if !predicted.is_finite() || !actual.is_finite() {
            warn!(predicted, actual, "rejecting non-finite prediction sample");
            return Err(ValidationError::NonFiniteValue(format!(
                "prediction sample (predicted={predicted}, actual={actual})"
            )));
        }
        let sample = PredictionSample {
            predicted_temp: predicted,
            actual_temp: actual,
            error: actual - predicted,
            context,
            timestamp: timestamp.unwrap_or_else(Utc::now),
        };
        debug!(
            predicted,
            actual,
            error = sample.error,
            total = self.samples.len() + 1,
            "prediction recorded"
        );
        self.samples.push(sample);
        Ok(&self.samples[self.samples.len() - 1])
    }

    /// All samples in insertion order.
    pub fn samples(&self) -> &[PredictionSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Most recently added sample.
    pub fn last(&self) -> Option<&PredictionSample> {
        self.samples.last()
    }

    /// Errors of samples with `timestamp >= now - window`.
    fn errors_since(&self, now: DateTime<Utc>, window: Duration) -> impl Iterator<Item = &f64> + '_ {
        let cutoff = now - window;
        self.samples
            .iter()
            .filter(move |s| s.timestamp >= cutoff)
            .map(|s| &s.error)
    }

    /// Metrics relative to the current time.
    pub fn get_metrics(&self) -> PredictionMetrics {
        self.metrics_at(Utc::now())
    }

    /// Metrics relative to `now`.
    pub fn metrics_at(&self, now: DateTime<Utc>) -> PredictionMetrics {
        let all = self.samples.iter().map(|s| &s.error);
        PredictionMetrics {
            last_1h: WindowMetrics::from_errors(self.errors_since(now, Duration::hours(1))),
            last_6h: WindowMetrics::from_errors(self.errors_since(now, Duration::hours(6))),
            last_24h: WindowMetrics::from_errors(self.errors_since(now, Duration::hours(24))),
            all_time: WindowMetrics::from_errors(all.clone()),
            accuracy_breakdown: LegacyAccuracyBreakdown::from_errors(all),
            total_predictions: self.samples.len(),
            last_updated: self.samples.iter().map(|s| s.timestamp).max(),
        }
    }

    /// Three-tier breakdown of the whole log.
    pub fn get_simplified_accuracy_breakdown(&self) -> AccuracyBreakdown {
        AccuracyBreakdown::from_errors(self.samples.iter().map(|s| &s.error))
    }

    /// Three-tier breakdown of the trailing 24 hours.
    pub fn get_24h_accuracy_breakdown(&self) -> AccuracyBreakdown {
        self.accuracy_breakdown_24h_at(Utc::now())
    }

    /// Three-tier breakdown of samples with `timestamp >= now - 24h`. When
    /// the log spans less than a day this is every sample.
    pub fn accuracy_breakdown_24h_at(&self, now: DateTime<Utc>) -> AccuracyBreakdown {
        AccuracyBreakdown::from_errors(self.errors_since(now, Duration::hours(24)))
    }

    /// `perfect + tolerable` percentage over the whole log.
    pub fn get_good_control_percentage(&self) -> f64 {
        self.get_simplified_accuracy_breakdown().good_control_percentage()
    }

    /// `perfect + tolerable` percentage over the trailing 24 hours.
    pub fn get_24h_good_control_percentage(&self) -> f64 {
        self.get_24h_accuracy_breakdown().good_control_percentage()
    }

    /// [`get_24h_good_control_percentage`](Self::get_24h_good_control_percentage)
    /// relative to `now`.
    pub fn good_control_percentage_24h_at(&self, now: DateTime<Utc>) -> f64 {
        self.accuracy_breakdown_24h_at(now).good_control_percentage()
    }

    /// MAE of the `count` samples that precede the newest `skip` samples.
    /// `None` if fewer than `count` such samples exist.
    pub fn trailing_mae(&self, count: usize, skip: usize) -> Option<f64> {
        if count == 0 || self.samples.len() < count + skip {
            return None;
        }
        let end = self.samples.len() - skip;
        WindowMetrics::from_errors(self.samples[end - count..end].iter().map(|s| &s.error)).mae
    }
}
