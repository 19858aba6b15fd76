//! Durable state store interface.
//!
//! The engine does not mandate a storage technology: anything that can keep
//! a structured document per controller id and hand it back after a restart
//! can implement [`StateStore`]. Two reference implementations live in
//! [`state`](crate::state).

use crate::error::Result;
use crate::state::PersistedState;

/// Key -> document store for learned controller state.
///
/// Implementations must be safe to share across threads. A failed `set` is
/// not fatal to the caller: the controller logs it, counts it and retries on
/// the next cycle.
pub trait StateStore: Send + Sync {
    /// Load the state saved under `controller_id`.
    ///
    /// Returns `Ok(None)` when nothing has been saved yet.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`](crate::error::ControlError) if the backing
    /// store cannot be read or the document cannot be decoded.
    fn get(&self, controller_id: &str) -> Result<Option<PersistedState>>;

    /// Replace the state saved under `controller_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`](crate::error::ControlError) if the write
    /// does not complete.
    fn set(&self, controller_id: &str, state: &PersistedState) -> Result<()>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}
