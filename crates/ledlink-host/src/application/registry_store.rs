//! Shared access to the registry.
//!
//! Sessions, the dispatcher, the button engine and the API bridge all hold a
//! clone of one [`RegistryStore`].  Readers proceed concurrently; writers are
//! exclusive.  Guards must never be held across a device round-trip.

use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use ledlink_core::{Controller, ControllerInput, GroupStateView, Registry, RegistryError, RegistrySnapshot};

#[derive(Debug, Clone, Default)]
pub struct RegistryStore {
    inner: Arc<RwLock<Registry>>,
}

impl RegistryStore {
    pub fn new(registry: Registry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(registry)),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner.write().await
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.inner.read().await.snapshot()
    }

    pub async fn groups_state(&self) -> Vec<GroupStateView> {
        self.inner.read().await.groups_state_view()
    }

    /// Upserts each controller in order, stopping at the first rejection.
    ///
    /// # Errors
    ///
    /// Returns the first [`RegistryError`]; controllers before it stay stored.
    pub async fn seed_controllers(
        &self,
        inputs: impl IntoIterator<Item = ControllerInput>,
    ) -> Result<Vec<Controller>, RegistryError> {
        let mut registry = self.inner.write().await;
        inputs
            .into_iter()
            .map(|input| registry.upsert_controller(input))
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
