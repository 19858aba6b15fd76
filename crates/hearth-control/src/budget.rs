//! Iteration budget enforcement for the outlet search.
//!
//! [`BudgetEnforcer`] tracks the number of bisection steps against a
//! [`SearchBudget`]. The solver calls
//! [`check_iteration`](BudgetEnforcer::check_iteration) at the top of each
//! iteration; once the cap is reached it reports
//! [`ControlError::SearchNonConvergence`] carrying the remaining interval
//! width and the best candidate so the caller can degrade gracefully.

use std::time::Instant;

use crate::error::{ControlError, Result};
use crate::types::SearchBudget;

/// Enforces the iteration cap of one outlet search.
///
/// Create one per search; the enforcer is not `Clone`, so
/// each search owns exactly one.
///
/// # Example
///
/// ```
/// use hearth_control::budget::BudgetEnforcer;
/// use hearth_control::types::SearchBudget;
///
/// let mut enforcer = BudgetEnforcer::new(SearchBudget::default());
///
/// // At the top of each bisection step:
/// enforcer.check_iteration(30.0, 40.0).unwrap();
/// assert_eq!(enforcer.iterations_used(), 1);
/// ```
pub struct BudgetEnforcer {
    /// Monotonic clock snapshot taken when the enforcer was created.
    start_time: Instant,

    /// The limits to enforce.
    budget: SearchBudget,

    /// Iterations consumed so far. Never exceeds `budget.max_iterations`.
    iterations_used: usize,
}

impl BudgetEnforcer {
    /// Create a new enforcer with the given budget.
    pub fn new(budget: SearchBudget) -> Self {
        Self {
            start_time: Instant::now(),
            budget,
            iterations_used: 0,
        }
    }

    /// Claim the next iteration.
    ///
    /// `interval_width` and `best_outlet` describe the search state and are
    /// only used to build the error.
    ///
    /// # Errors
    ///
    /// [`ControlError::SearchNonConvergence`] if `max_iterations` steps have
    /// already run. The counter is not incremented in that case.
    pub fn check_iteration(&mut self, interval_width: f64, best_outlet: f64) -> Result<()> {
        if self.iterations_used >= self.budget.max_iterations {
            return Err(ControlError::SearchNonConvergence {
                iterations: self.iterations_used,
                interval_width,
                best_outlet,
            });
        }
        self.iterations_used += 1;
        Ok(())
    }

    /// `true` when `interval_width` is below the configured resolution.
    #[inline]
    pub fn interval_collapsed(&self, interval_width: f64) -> bool {
        interval_width < self.budget.min_resolution
    }

    /// `true` when `equilibrium_error` is within tolerance.
    #[inline]
    pub fn within_tolerance(&self, equilibrium_error: f64) -> bool {
        equilibrium_error.abs() <= self.budget.tolerance
    }

    /// Wall-clock microseconds elapsed since the enforcer was created.
    #[inline]
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Number of iterations consumed so far.
    #[inline]
    pub fn iterations_used(&self) -> usize {
        self.iterations_used
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_budget() -> SearchBudget {
        SearchBudget {
            max_iterations: 5,
            tolerance: 0.1,
            min_resolution: 0.05,
        }
    }

    #[test]
    fn iterations_within_budget() {
        let mut enforcer = BudgetEnforcer::new(tiny_budget());
        for _ in 0..5 {
            enforcer.check_iteration(1.0, 40.0).unwrap();
        }
        assert_eq!(enforcer.iterations_used(), 5);
    }

    #[test]
    fn iteration_limit_exceeded() {
        let mut enforcer = BudgetEnforcer::new(tiny_budget());
        for _ in 0..5 {
            enforcer.check_iteration(1.0, 40.0).unwrap();
        }
        // 6th iteration should fail
        let err = enforcer.check_iteration(0.7, 41.5).unwrap_err();
        match err {
            ControlError::SearchNonConvergence {
                iterations,
                interval_width,
                best_outlet,
            } => {
                assert_eq!(iterations, 5);
                assert_eq!(interval_width, 0.7);
                assert_eq!(best_outlet, 41.5);
            }
            other => panic!("expected SearchNonConvergence, got {other:?}"),
        }
        assert_eq!(enforcer.iterations_used(), 5);
    }

    #[test]
    fn zero_budget_rejects_first_iteration() {
        let mut enforcer = BudgetEnforcer::new(SearchBudget {
            max_iterations: 0,
            ..tiny_budget()
        });
        assert!(enforcer.check_iteration(10.0, 30.0).is_err());
    }

    #[test]
    fn resolution_and_tolerance_checks() {
        let enforcer = BudgetEnforcer::new(tiny_budget());
        assert!(enforcer.interval_collapsed(0.04));
        assert!(!enforcer.interval_collapsed(0.05));
        assert!(enforcer.within_tolerance(-0.1));
        assert!(!enforcer.within_tolerance(0.11));
    }

    #[test]
    fn elapsed_us_does_not_panic() {
        let enforcer = BudgetEnforcer::new(tiny_budget());
        let _ = enforcer.elapsed_us();
    }
}
