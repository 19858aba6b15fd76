//! Persisted controller state and two reference stores.
//!
//! [`PersistedState`] is the document a controller writes after every
//! decision and feedback event. [`MemoryStateStore`] keeps it in a
//! `parking_lot::RwLock<HashMap>` (serialised, so a load goes through the
//! same decode path as a real store); [`JsonFileStateStore`] writes one
//! `<controller_id>.json` per controller, atomically via rename.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ControlError, Result};
use crate::learner::LearningState;
use crate::physics::ThermalCoefficients;
use crate::tracker::{PredictionMetrics, PredictionSample};
use crate::traits::StateStore;
use crate::validation::validate_controller_id;

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Where the persisted coefficients came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineSource {
    /// Still the configured initial coefficients.
    Config,
    /// Produced by the learner.
    Calibrated,
}

/// Coefficients plus their provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineParameters {
    pub source: BaselineSource,
    pub values: ThermalCoefficients,
}

/// Runtime facts worth surviving a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationalState {
    pub last_outlet: Option<f64>,
    pub last_target: Option<f64>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Failed writes since the controller was created.
    pub persistence_failures: u64,
    pub shadow_mode: bool,
}

/// Everything a controller needs to resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub baseline_parameters: BaselineParameters,
    pub learning_state: LearningState,
    pub prediction_metrics: PredictionMetrics,
    /// The full prediction log, so every metric survives a restart.
    #[serde(default, alias = "recent_samples")]
    pub prediction_samples: Vec<PredictionSample>,
    #[serde(default)]
    pub operational_state: OperationalState,
    pub saved_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// MemoryStateStore
// ---------------------------------------------------------------------------

/// In-process store. Documents are kept as JSON text.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    documents: RwLock<HashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored controllers.
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Drop the state of one controller.
    pub fn remove(&self, controller_id: &str) -> bool {
        self.documents.write().remove(controller_id).is_some()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, controller_id: &str) -> Result<Option<PersistedState>> {
        let documents = self.documents.read();
        documents
            .get(controller_id)
            .map(|json| serde_json::from_str(json).map_err(ControlError::from))
            .transpose()
    }

    fn set(&self, controller_id: &str, state: &PersistedState) -> Result<()> {
        validate_controller_id(controller_id)?;
        let json = serde_json::to_string(state)?;
        self.documents.write().insert(controller_id.to_string(), json);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// JsonFileStateStore
// ---------------------------------------------------------------------------

/// One pretty-printed JSON file per controller in a directory.
///
/// Writes go to `<id>.json.tmp` first and are renamed over `<id>.json`, so a
/// crash mid-write leaves the previous document intact.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    dir: PathBuf,
}

impl JsonFileStateStore {
    /// Store rooted at `dir`, created if missing.
    ///
    /// # Errors
    ///
    /// [`ControlError::Io`] if the directory cannot be created.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document for `controller_id`.
    pub fn path_for(&self, controller_id: &str) -> Result<PathBuf> {
        validate_controller_id(controller_id)?;
        Ok(self.dir.join(format!("{controller_id}.json")))
    }
}

impl StateStore for JsonFileStateStore {
    fn get(&self, controller_id: &str) -> Result<Option<PersistedState>> {
        let path = self.path_for(controller_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let state = serde_json::from_str(&text)?;
        debug!(path = %path.display(), "state loaded");
        Ok(Some(state))
    }

    fn set(&self, controller_id: &str, state: &PersistedState) -> Result<()> {
        let path = self.path_for(controller_id)?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(state)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path).map_err(|e| {
            ControlError::Persistence(format!("rename {} -> {}: {e}", tmp.display(), path.display()))
        })?;
        debug!(path = %path.display(), "state saved");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "json-file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LearnerConfig;
    use tempfile::tempdir;

    fn sample_state() -> PersistedState {
        let mut learning_state = LearningState::new(&LearnerConfig::default());
        learning_state.cycle_count = 42;
        PersistedState {
            baseline_parameters: BaselineParameters {
                source: BaselineSource::Calibrated,
                values: ThermalCoefficients::default(),
            },
            learning_state,
            prediction_metrics: PredictionMetrics::default(),
            prediction_samples: Vec::new(),
            operational_state: OperationalState {
                last_outlet: Some(38.5),
                ..Default::default()
            },
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn memory_store_roundtrip() -> Result<()> {
        let store = MemoryStateStore::new();
        assert!(store.get("hp")?.is_none());
        store.set("hp", &sample_state())?;
        let loaded = store.get("hp")?.expect("state");
        assert_eq!(loaded.learning_state.cycle_count, 42);
        assert!(loaded.learning_state.is_first_cycle_since_load);
        assert_eq!(store.len(), 1);
        assert!(store.remove("hp"));
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn memory_store_rejects_bad_id() {
        let store = MemoryStateStore::new();
        assert!(matches!(
            store.set("", &sample_state()),
            Err(ControlError::InvalidInput(_))
        ));
    }

    #[test]
    fn file_store_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let store = JsonFileStateStore::new(dir.path().join("state"))?;
        assert!(store.get("living")?.is_none());
        store.set("living", &sample_state())?;
        assert!(store.path_for("living")?.exists());
        assert!(!dir.path().join("state/living.json.tmp").exists());
        let loaded = store.get("living")?.expect("state");
        assert_eq!(loaded.operational_state.last_outlet, Some(38.5));
        assert_eq!(loaded.baseline_parameters.source, BaselineSource::Calibrated);
        Ok(())
    }

    #[test]
    fn file_store_overwrites() -> Result<()> {
        let dir = tempdir()?;
        let store = JsonFileStateStore::new(dir.path())?;
        let mut state = sample_state();
        store.set("a", &state)?;
        state.learning_state.cycle_count = 43;
        store.set("a", &state)?;
        assert_eq!(store.get("a")?.map(|s| s.learning_state.cycle_count), Some(43));
        Ok(())
    }

    #[test]
    fn file_store_corrupt_document_is_error() -> Result<()> {
        let dir = tempdir()?;
        let store = JsonFileStateStore::new(dir.path())?;
        fs::write(dir.path().join("bad.json"), "{ nope")?;
        assert!(matches!(store.get("bad"), Err(ControlError::Serialization(_))));
        Ok(())
    }

    #[test]
    fn file_store_rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let store = JsonFileStateStore::new(dir.path()).unwrap();
        assert!(store.path_for("../escape").is_err());
    }
}
