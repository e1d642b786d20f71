use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::errors::{SandboxError, SandboxResult};

/// Bounds concurrent invocations of each module.
#[derive(Clone)]
pub struct ModuleGuard {
    permits_per_module: usize,
    slots: Arc<DashMap<String, Arc<Semaphore>>>,
}

impl ModuleGuard {
    pub fn new(permits_per_module: u32) -> Self {
        Self {
            permits_per_module: permits_per_module.max(1) as usize,
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Waits up to `patience` for a slot; a module that stays saturated is
    /// reported as busy instead of queueing requests without bound.
    pub async fn acquire(&self, module: &str, patience: Duration) -> SandboxResult<OwnedSemaphorePermit> {
        let semaphore = self.semaphore(module);
        match tokio::time::timeout(patience, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(SandboxError::Busy(module.to_string())),
            Err(_elapsed) => Err(SandboxError::Busy(module.to_string())),
        }
    }

    pub fn available(&self, module: &str) -> usize {
        self.semaphore(module).available_permits()
    }

    fn semaphore(&self, module: &str) -> Arc<Semaphore> {
        match self.slots.entry(module.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let semaphore = Arc::new(Semaphore::new(self.permits_per_module));
                entry.insert(semaphore.clone());
                semaphore
            }
        }
    }
}
