use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use wasmtime::Module;

/// Content address of a module: lowercase hex SHA-256 of its bytes.
pub fn module_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A compiled module together with its content address.
#[derive(Clone)]
pub struct ModuleHandle {
    hash: Arc<str>,
    module: Module,
}

impl ModuleHandle {
    pub(crate) fn new(hash: &str, module: Module) -> Self {
        Self {
            hash: Arc::from(hash),
            module,
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub(crate) fn module(&self) -> &Module {
        &self.module
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle").field("hash", &self.hash).finish()
    }
}

/// Compiled modules keyed by content hash. Inserting a module never
/// disturbs readers holding handles to other modules.
#[derive(Clone, Default)]
pub struct ModuleCache {
    modules: Arc<DashMap<String, ModuleHandle>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: &str) -> Option<ModuleHandle> {
        self.modules.get(hash).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.modules.contains_key(hash)
    }

    /// Keeps the first handle stored under a hash; a racing compile of the
    /// same bytes gets the existing handle back.
    pub fn insert(&self, handle: ModuleHandle) -> ModuleHandle {
        self.modules
            .entry(handle.hash().to_string())
            .or_insert(handle)
            .value()
            .clone()
    }

    pub fn remove(&self, hash: &str) -> Option<ModuleHandle> {
        self.modules.remove(hash).map(|(_, handle)| handle)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self.modules.iter().map(|e| e.key().clone()).collect();
        hashes.sort();
        hashes
    }
}
