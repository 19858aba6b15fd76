//! Shared test helpers for the hearth-control integration test suite.
//!
//! Provides a deterministic noise source, a fixed reference clock, and a
//! simulated building whose "true" coefficients are hidden from the
//! controller under test.

use chrono::{DateTime, TimeZone, Utc};
use hearth_control::physics::{ThermalCoefficients, ThermalModel};
use hearth_control::types::{ExternalHeat, PredictionContext};

// ---------------------------------------------------------------------------
// Random number generator (simple LCG for deterministic reproducibility)
// ---------------------------------------------------------------------------

/// A minimal linear congruential generator for deterministic test data.
pub struct Lcg {
    state: u64,
}

impl Lcg {
    /// Create a new LCG with the given seed.
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate the next u64 value.
    pub fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    /// Generate a uniform f64 in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Generate a uniform f64 in [lo, hi).
    pub fn next_f64_range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }
}

// ---------------------------------------------------------------------------
// Clock and scenario builders
// ---------------------------------------------------------------------------

/// Fixed reference instant used as "now" in windowed tests.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
}

/// eff 0.1, loss 0.08, tau 4 h, no external weights.
pub fn scenario_model() -> ThermalModel {
    ThermalModel::new(ThermalCoefficients::new(4.0, 0.08, 0.1))
}

/// Complete context for a 30 minute cycle.
pub fn cycle_context(outlet: f64, outdoor: f64, indoor: f64) -> PredictionContext {
    PredictionContext::new(outlet, outdoor, indoor).with_elapsed_hours(0.5)
}

// ---------------------------------------------------------------------------
// Simulated building
// ---------------------------------------------------------------------------

/// A building that evolves under fixed "true" coefficients.
pub struct SimulatedHouse {
    truth: ThermalModel,
    pub indoor: f64,
}

impl SimulatedHouse {
    pub fn new(truth: ThermalCoefficients, indoor: f64) -> Self {
        Self {
            truth: ThermalModel::new(truth),
            indoor,
        }
    }

    /// Advance `hours` with constant conditions and return the new indoor
    /// temperature.
    pub fn step(&mut self, outlet: f64, outdoor: f64, external: &ExternalHeat, hours: f64) -> f64 {
        self.indoor = self
            .truth
            .predict_indoor_after(self.indoor, outlet, outdoor, external, hours);
        self.indoor
    }
}

/// Mean absolute value.
pub fn mean_abs(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|v| v.abs()).sum::<f64>() / values.len() as f64
}
