//! Adaptive thermal control for heat-pump outlet temperatures.
//!
//! Every control cycle the engine picks a bounded outlet-temperature
//! setpoint that brings the indoor temperature to a target, using a
//! first-order physics model of the building whose coefficients are
//! re-calibrated online from its own prediction errors.
//!
//! # Components
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | [`ThermalModel`](physics::ThermalModel) | [`physics`] | equilibrium and trajectory prediction |
//! | [`AdaptiveLearner`](learner::AdaptiveLearner) | [`learner`] | gradient calibration of coefficients |
//! | [`OutletSolver`](solver::OutletSolver) | [`solver`], [`correction`] | bounded inversion and course correction |
//! | [`PredictionTracker`](tracker::PredictionTracker) | [`tracker`] | accuracy log and statistics |
//! | [`ForecastAligner`](forecast::ForecastAligner) | [`forecast`] | hourly forecast to cycle steps |
//! | [`StateStore`](traits::StateStore) | [`traits`], [`state`] | restart-safe persistence |
//! | [`ThermalController`](controller::ThermalController) | [`controller`] | one cycle, end to end |
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use hearth_control::config::ControlConfig;
//! use hearth_control::controller::ThermalController;
//! use hearth_control::state::MemoryStateStore;
//! use hearth_control::types::CycleInputs;
//!
//! let store = Arc::new(MemoryStateStore::new());
//! let mut controller = ThermalController::new("living-room", ControlConfig::default(), store).unwrap();
//!
//! let decision = controller.decide(&CycleInputs::new(21.0, 20.4, 5.0)).unwrap();
//! assert!(decision.outlet_temp >= 25.0 && decision.outlet_temp <= 60.0);
//!
//! // One cycle later:
//! let outcome = controller.record_outcome(20.6, None, None).unwrap();
//! assert!(outcome.is_some());
//! ```

pub mod budget;
pub mod config;
pub mod controller;
pub mod correction;
pub mod error;
pub mod events;
pub mod forecast;
pub mod learner;
pub mod physics;
pub mod solver;
pub mod state;
pub mod telemetry;
pub mod tracker;
pub mod traits;
pub mod types;
pub mod validation;

pub use config::ControlConfig;
pub use controller::{SharedController, ThermalController};
pub use error::{ControlError, Result, ValidationError};
pub use physics::{ThermalCoefficients, ThermalModel};
pub use types::{CycleInputs, ExternalHeat, OutletDecision};
