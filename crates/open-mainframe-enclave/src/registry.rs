//! Live enclave registry, keyed by token.

use std::sync::Arc;

use dashmap::DashMap;

use crate::enclave::{Enclave, EnclaveSnapshot};
use crate::error::{EnclaveError, Result};

/// Process-wide map from token key to enclave.
#[derive(Debug, Default)]
pub struct EnclaveRegistry {
    enclaves: DashMap<String, Arc<Enclave>>,
}

impl EnclaveRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an enclave. Returns its key.
    pub fn remember(&self, enclave: &Arc<Enclave>) -> String {
        let key = enclave.key();
        self.enclaves.insert(key.clone(), Arc::clone(enclave));
        key
    }

    /// The enclave already registered under `key`, or the one `make`
    /// builds, inserted atomically. The flag is `true` when `make` ran.
    pub fn remember_or_get(
        &self,
        key: String,
        make: impl FnOnce() -> Arc<Enclave>,
    ) -> (Arc<Enclave>, bool) {
        let mut created = false;
        let enclave = self
            .enclaves
            .entry(key)
            .or_insert_with(|| {
                created = true;
                make()
            })
            .clone();
        (enclave, created)
    }

    /// Look up an enclave by key.
    pub fn find(&self, key: &str) -> Result<Arc<Enclave>> {
        self.get(key).ok_or_else(|| EnclaveError::EnclaveNotFound {
            key: key.to_string(),
        })
    }

    /// Look up an enclave by key, `None` when absent.
    pub fn get(&self, key: &str) -> Option<Arc<Enclave>> {
        self.enclaves.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Remove an enclave. Only the exact instance registered under its key
    /// is removed.
    pub fn forget(&self, enclave: &Arc<Enclave>) -> bool {
        self.enclaves
            .remove_if(&enclave.key(), |_, known| Arc::ptr_eq(known, enclave))
            .is_some()
    }

    /// Whether a key is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.enclaves.contains_key(key)
    }

    /// Number of registered enclaves.
    pub fn len(&self) -> usize {
        self.enclaves.len()
    }

    /// No enclave registered.
    pub fn is_empty(&self) -> bool {
        self.enclaves.is_empty()
    }

    /// Snapshots of all registered enclaves, sorted by key.
    pub fn snapshot(&self) -> Vec<EnclaveSnapshot> {
        let enclaves: Vec<Arc<Enclave>> = self
            .enclaves
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut snapshots: Vec<EnclaveSnapshot> =
            enclaves.iter().map(|enclave| enclave.snapshot()).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::EnclaveToken;

    fn enclave(byte: u8) -> Arc<Enclave> {
        Arc::new(Enclave::new(EnclaveToken::new(vec![byte; 8]), true))
    }

    #[test]
    fn test_remember_find_forget() {
        let registry = EnclaveRegistry::new();
        let e = enclave(1);
        let key = registry.remember(&e);
        assert_eq!(key, "0101010101010101");
        assert!(Arc::ptr_eq(&registry.find(&key).unwrap(), &e));
        assert!(registry.forget(&e));
        assert!(!registry.forget(&e));
        assert!(matches!(
            registry.find(&key),
            Err(EnclaveError::EnclaveNotFound { .. })
        ));
    }

    #[test]
    fn test_forget_ignores_other_instance() {
        let registry = EnclaveRegistry::new();
        let first = enclave(2);
        let second = enclave(2);
        registry.remember(&first);
        assert!(!registry.forget(&second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remember_or_get_keeps_first() {
        let registry = EnclaveRegistry::new();
        let first = enclave(4);
        let (kept, created) = registry.remember_or_get(first.key(), || Arc::clone(&first));
        assert!(created);
        assert!(Arc::ptr_eq(&kept, &first));

        let (kept, created) = registry.remember_or_get(first.key(), || enclave(4));
        assert!(!created);
        assert!(Arc::ptr_eq(&kept, &first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_sorted() {
        let registry = EnclaveRegistry::new();
        registry.remember(&enclave(9));
        registry.remember(&enclave(3));
        let keys: Vec<String> = registry.snapshot().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["0303030303030303", "0909090909090909"]);
    }
}
