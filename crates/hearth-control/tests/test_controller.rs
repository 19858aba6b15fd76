//! Integration tests for the controller: full decide/observe cycles,
//! restart persistence through the JSON file store, shadow mode, telemetry
//! snapshots, and shared use across threads.

mod helpers;

use std::sync::Arc;
use std::thread;

use approx::assert_relative_eq;
use chrono::Duration;
use hearth_control::config::ControlConfig;
use hearth_control::learner::LearningStatus;
use hearth_control::physics::ThermalCoefficients;
use hearth_control::state::{BaselineSource, JsonFileStateStore, MemoryStateStore};
use hearth_control::telemetry::ModelHealth;
use hearth_control::traits::StateStore;
use hearth_control::types::CycleInputs;
use hearth_control::ThermalController;
use tempfile::tempdir;

use helpers::{t0, SimulatedHouse};

// ---------------------------------------------------------------------------
// Helper: run n cycles against a simulated house
// ---------------------------------------------------------------------------

fn run_cycles(controller: &mut ThermalController, house: &mut SimulatedHouse, start: usize, n: usize) {
    for i in start..start + n {
        let now = t0() + Duration::minutes(30 * i as i64);
        let inputs = CycleInputs::new(21.0, house.indoor, 5.0);
        let decision = controller.decide_at(&inputs, now).unwrap();
        let actual = house.step(decision.outlet_temp, 5.0, &inputs.external, 0.5);
        controller
            .record_outcome(actual, None, Some(now + Duration::minutes(30)))
            .unwrap()
            .expect("pending prediction");
    }
}

fn assert_coefficients_close(a: &ThermalCoefficients, b: &ThermalCoefficients) {
    assert_relative_eq!(a.thermal_time_constant, b.thermal_time_constant, epsilon = 1e-12);
    assert_relative_eq!(a.heat_loss_coefficient, b.heat_loss_coefficient, epsilon = 1e-12);
    assert_relative_eq!(a.outlet_effectiveness, b.outlet_effectiveness, epsilon = 1e-12);
    assert_eq!(a.external_source_weights.len(), b.external_source_weights.len());
}

fn house() -> SimulatedHouse {
    SimulatedHouse::new(ThermalCoefficients::new(5.0, 0.07, 0.12), 19.5)
}

// ---------------------------------------------------------------------------
// Restart persistence
// ---------------------------------------------------------------------------

#[test]
fn test_state_survives_restart() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(JsonFileStateStore::new(dir.path()).unwrap());
    let mut house = house();

    let (coefficients, history_len) = {
        let mut controller = ThermalController::new("heat-pump-1", ControlConfig::default(), store.clone()).unwrap();
        run_cycles(&mut controller, &mut house, 0, 14);
        assert_eq!(controller.learner().state().cycle_count, 15);
        assert_eq!(controller.baseline_source(), BaselineSource::Calibrated);
        (
            controller.model().coefficients().clone(),
            controller.learner().state().parameter_history.len(),
        )
    };
    assert!(dir.path().join("heat-pump-1.json").exists());

    let mut resumed = ThermalController::new("heat-pump-1", ControlConfig::default(), store).unwrap();
    assert_eq!(resumed.learner().state().cycle_count, 15);
    assert_coefficients_close(resumed.model().coefficients(), &coefficients);
    assert_eq!(resumed.learner().state().parameter_history.len(), history_len);
    assert_eq!(resumed.learner().tracker().len(), 14);
    assert_eq!(resumed.baseline_source(), BaselineSource::Calibrated);
    assert_eq!(resumed.learner().status(), LearningStatus::FirstCycleSkip);

    let restored = resumed.model().coefficients().clone();

    // Nothing was pending across the restart.
    assert!(resumed.record_outcome(21.0, None, None).unwrap().is_none());

    let now = t0() + Duration::minutes(30 * 14);
    let inputs = CycleInputs::new(21.0, house.indoor, 5.0);
    let decision = resumed.decide_at(&inputs, now).unwrap();
    let actual = house.step(decision.outlet_temp, 5.0, &inputs.external, 0.5);
    let outcome = resumed
        .record_outcome(actual, None, Some(now + Duration::minutes(30)))
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, LearningStatus::FirstCycleSkip);
    assert_eq!(resumed.model().coefficients(), &restored);
    assert_eq!(resumed.learner().state().cycle_count, 16);
}

#[test]
fn test_all_time_metrics_survive_restart() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let mut house = house();
    let end = t0() + Duration::hours(100);

    let before = {
        let mut controller = ThermalController::new("hourly", ControlConfig::default(), store.clone()).unwrap();
        for h in 0..100 {
            let now = t0() + Duration::hours(h);
            let inputs = CycleInputs::new(21.0, house.indoor, 5.0);
            let decision = controller.decide_at(&inputs, now).unwrap();
            let actual = house.step(decision.outlet_temp, 5.0, &inputs.external, 0.5);
            controller
                .record_outcome(actual, None, Some(now + Duration::minutes(30)))
                .unwrap()
                .expect("pending prediction");
        }
        controller.snapshot_at(end)
    };
    assert_eq!(before.total_predictions, 100);

    let resumed = ThermalController::new("hourly", ControlConfig::default(), store).unwrap();
    let after = resumed.snapshot_at(end);
    assert_eq!(resumed.learner().tracker().len(), 100);
    assert_eq!(after.total_predictions, 100);
    assert_eq!(after.all_time.sample_count, 100);
    assert_relative_eq!(after.all_time.mae.unwrap(), before.all_time.mae.unwrap(), epsilon = 1e-12);
    assert_eq!(after.last_24h.sample_count, before.last_24h.sample_count);
    assert_eq!(after.cycle_count, 101);
}

#[test]
fn test_fresh_store_uses_configured_coefficients() {
    let config = ControlConfig {
        initial_coefficients: ThermalCoefficients::new(6.0, 0.05, 0.2),
        ..Default::default()
    };
    let controller = ThermalController::new("fresh", config, Arc::new(MemoryStateStore::new())).unwrap();
    assert_eq!(controller.model().coefficients().thermal_time_constant, 6.0);
    assert_eq!(controller.baseline_source(), BaselineSource::Config);
    assert_eq!(controller.learner().state().cycle_count, 1);
}

// ---------------------------------------------------------------------------
// Shadow mode
// ---------------------------------------------------------------------------

#[test]
fn test_shadow_mode_still_learns() {
    let config = ControlConfig {
        shadow_mode: true,
        ..Default::default()
    };
    let mut controller = ThermalController::new("shadow", config, Arc::new(MemoryStateStore::new())).unwrap();

    let decision = controller
        .decide_at(&CycleInputs::new(21.0, 20.0, 5.0), t0())
        .unwrap();
    assert!(!decision.applied);

    // The building actually ran a different outlet.
    let outcome = controller
        .record_outcome(20.3, Some(30.0), Some(t0() + Duration::minutes(30)))
        .unwrap()
        .unwrap();
    let sample = controller.learner().tracker().last().unwrap();
    assert_eq!(sample.context.outlet_temp, Some(30.0));
    assert!((outcome.error - sample.error).abs() < 1e-12);
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

#[test]
fn test_snapshot_reflects_cycles() {
    let mut controller =
        ThermalController::new("snap", ControlConfig::default(), Arc::new(MemoryStateStore::new())).unwrap();
    let empty = controller.snapshot_at(t0());
    assert_eq!(empty.total_predictions, 0);
    assert_eq!(empty.model_health, ModelHealth::InsufficientData);

    let mut house = house();
    run_cycles(&mut controller, &mut house, 0, 12);

    let now = t0() + Duration::hours(6);
    let snap = controller.snapshot_at(now);
    assert_eq!(snap.controller_id, "snap");
    assert_eq!(snap.total_predictions, 12);
    assert_eq!(snap.cycle_count, 13);
    assert_eq!(snap.learning_status, LearningStatus::Active);
    assert_ne!(snap.model_health, ModelHealth::InsufficientData);
    assert!(snap.last_24h.mae.is_some());
    assert!(!snap.recent_events.is_empty());
    assert_eq!(snap.operational.last_target, Some(21.0));

    // Taking a snapshot changes nothing.
    assert_eq!(controller.snapshot_at(now), snap);
}

// ---------------------------------------------------------------------------
// Validation and sharing
// ---------------------------------------------------------------------------

#[test]
fn test_rejects_bad_ids_and_inputs() {
    assert!(ThermalController::new("../etc", ControlConfig::default(), Arc::new(MemoryStateStore::new())).is_err());

    let mut controller =
        ThermalController::new("ok", ControlConfig::default(), Arc::new(MemoryStateStore::new())).unwrap();
    assert!(controller.decide(&CycleInputs::new(f64::NAN, 20.0, 5.0)).is_err());
    assert!(controller.pending_prediction().is_none());
}

#[test]
fn test_shared_controller_serializes_cycles() {
    let shared =
        ThermalController::new("shared", ControlConfig::default(), Arc::new(MemoryStateStore::new()))
            .unwrap()
            .into_shared();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                for i in 0..5 {
                    let now = t0() + Duration::minutes(30 * (t * 5 + i));
                    let mut controller = shared.lock();
                    controller
                        .decide_at(&CycleInputs::new(21.0, 20.5, 3.0), now)
                        .unwrap();
                    controller
                        .record_outcome(20.6, None, Some(now + Duration::minutes(30)))
                        .unwrap()
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let controller = shared.lock();
    assert_eq!(controller.learner().tracker().len(), 20);
    assert_eq!(controller.learner().state().cycle_count, 21);
}
