//! Process-wide owner of every tenant index.
//!
//! Lock order: the registry map lock is only held to look up, insert or
//! remove a slot, never while touching an index. Each slot carries its own
//! reader/writer lock, so work on one tenant never blocks another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rayon::prelude::*;
use serde::Serialize;

use crate::semantic::index::{IndexError, TenantIndex};
use crate::semantic::snapshot::SnapshotError;
use crate::storage::StorageManager;
use crate::tenant::TenantId;

const SNAPSHOT_EXT: &str = ".index";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No index for tenant {0}")]
    UnknownTenant(TenantId),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// One tenant's index plus the lock that orders its snapshot writes.
#[derive(Debug)]
pub struct TenantSlot {
    index: RwLock<TenantIndex>,
    persist: Mutex<()>,
}

impl TenantSlot {
    fn new(index: TenantIndex) -> Self {
        Self {
            index: RwLock::new(index),
            persist: Mutex::new(()),
        }
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, TenantIndex>, RegistryError> {
        self.index
            .read()
            .map_err(|e| RegistryError::Internal(format!("Lock poisoned: {}", e)))
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, TenantIndex>, RegistryError> {
        self.index
            .write()
            .map_err(|e| RegistryError::Internal(format!("Lock poisoned: {}", e)))
    }

    fn persist_lock(&self) -> Result<MutexGuard<'_, ()>, RegistryError> {
        self.persist
            .lock()
            .map_err(|e| RegistryError::Internal(format!("Lock poisoned: {}", e)))
    }
}

/// Size figures reported for a tenant index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub indexed_products: usize,
    pub index_size_mb: f64,
}

/// Outcome of scanning a snapshot directory.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LoadReport {
    pub loaded: Vec<TenantId>,
    pub skipped: Vec<String>,
}

pub struct IndexRegistry {
    dimensions: usize,
    model_id: [u8; 32],
    slots: RwLock<HashMap<TenantId, Arc<TenantSlot>>>,
}

impl IndexRegistry {
    pub fn new(dimensions: usize, model_id: [u8; 32]) -> Self {
        Self {
            dimensions,
            model_id,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn slots_read(
        &self,
    ) -> Result<RwLockReadGuard<'_, HashMap<TenantId, Arc<TenantSlot>>>, RegistryError> {
        self.slots
            .read()
            .map_err(|e| RegistryError::Internal(format!("Lock poisoned: {}", e)))
    }

    fn slots_write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<TenantId, Arc<TenantSlot>>>, RegistryError> {
        self.slots
            .write()
            .map_err(|e| RegistryError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// The tenant's index, if one exists.
    pub fn get(&self, tenant: &TenantId) -> Result<Option<Arc<TenantSlot>>, RegistryError> {
        Ok(self.slots_read()?.get(tenant).cloned())
    }

    /// The tenant's index, created empty on first reference. Every caller
    /// gets the same slot until the tenant is evicted.
    pub fn get_or_create(&self, tenant: &TenantId) -> Result<Arc<TenantSlot>, RegistryError> {
        if let Some(slot) = self.get(tenant)? {
            return Ok(slot);
        }

        let mut slots = self.slots_write()?;
        let slot = slots.entry(tenant.clone()).or_insert_with(|| {
            log::info!("Created new index for tenant {tenant}");
            Arc::new(TenantSlot::new(TenantIndex::new(self.dimensions)))
        });
        Ok(slot.clone())
    }

    pub fn contains(&self, tenant: &TenantId) -> bool {
        self.slots_read()
            .map(|slots| slots.contains_key(tenant))
            .unwrap_or(false)
    }

    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self
            .slots_read()
            .map(|slots| slots.keys().cloned().collect())
            .unwrap_or_default();
        tenants.sort();
        tenants
    }

    pub fn stats(&self, tenant: &TenantId) -> Result<IndexStats, RegistryError> {
        let indexed_products = match self.get(tenant)? {
            Some(slot) => slot.read()?.len(),
            None => 0,
        };
        let bytes = indexed_products * self.dimensions * std::mem::size_of::<f32>();
        let index_size_mb = (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;

        Ok(IndexStats {
            indexed_products,
            index_size_mb,
        })
    }

    /// Scan `storage` for snapshots and register every readable one.
    /// Unreadable or incompatible snapshots are logged and skipped.
    pub fn load_all(&self, storage: &dyn StorageManager) -> Result<LoadReport, RegistryError> {
        let mut files: Vec<String> = storage
            .list()
            .into_iter()
            .filter(|name| name.ends_with(SNAPSHOT_EXT))
            .collect();
        files.sort();

        let decoded: Vec<(String, Result<(TenantId, TenantIndex), String>)> = files
            .into_par_iter()
            .map(|file| {
                let result = self.read_snapshot(storage, &file);
                (file, result)
            })
            .collect();

        let mut report = LoadReport::default();
        let mut slots = self.slots_write()?;
        for (file, result) in decoded {
            match result {
                Ok((tenant, index)) => {
                    log::info!("Loaded index for tenant {tenant}: {} vectors", index.len());
                    slots.insert(tenant.clone(), Arc::new(TenantSlot::new(index)));
                    report.loaded.push(tenant);
                }
                Err(err) => {
                    log::warn!("Skipping snapshot {file}: {err}");
                    report.skipped.push(file);
                }
            }
        }

        Ok(report)
    }

    fn read_snapshot(
        &self,
        storage: &dyn StorageManager,
        file: &str,
    ) -> Result<(TenantId, TenantIndex), String> {
        let stem = file.strip_suffix(SNAPSHOT_EXT).unwrap_or(file);
        let tenant = TenantId::new(stem).map_err(|e| e.to_string())?;
        let bytes = storage.read(file).map_err(|e| e.to_string())?;
        let index = TenantIndex::deserialize(&bytes, &self.model_id, self.dimensions)
            .map_err(|e| e.to_string())?;
        Ok((tenant, index))
    }

    /// Load one tenant's snapshot on demand, replacing any in-memory index.
    /// Returns false if no snapshot exists.
    pub fn load(&self, tenant: &TenantId, storage: &dyn StorageManager) -> Result<bool, RegistryError> {
        let file = snapshot_name(tenant);
        if !storage.exists(&file) {
            return Ok(false);
        }

        let bytes = storage.read(&file)?;
        let index = TenantIndex::deserialize(&bytes, &self.model_id, self.dimensions)?;

        match self.get(tenant)? {
            Some(slot) => *slot.write()? = index,
            None => {
                self.slots_write()?
                    .insert(tenant.clone(), Arc::new(TenantSlot::new(index)));
            }
        }
        Ok(true)
    }

    /// Write the tenant's index as a new snapshot, atomically replacing the
    /// previous one.
    pub fn save(&self, tenant: &TenantId, storage: &dyn StorageManager) -> Result<(), RegistryError> {
        let slot = self
            .get(tenant)?
            .ok_or_else(|| RegistryError::UnknownTenant(tenant.clone()))?;

        // saves of one tenant are ordered so an older snapshot never lands last
        let _persist = slot.persist_lock()?;
        let (bytes, count) = {
            let index = slot.read()?;
            (index.serialize(&self.model_id)?, index.len())
        };

        storage.write(&snapshot_name(tenant), &bytes)?;
        log::info!("Saved index for tenant {tenant}: {count} vectors");
        Ok(())
    }

    /// Drop the tenant's index from memory and storage. Handles obtained
    /// earlier observe an empty index afterwards.
    pub fn evict(&self, tenant: &TenantId, storage: &dyn StorageManager) -> Result<bool, RegistryError> {
        let removed = self.slots_write()?.remove(tenant);

        if let Some(slot) = &removed {
            let _persist = slot.persist_lock()?;
            slot.write()?.remove();
            storage.delete(&snapshot_name(tenant))?;
        } else {
            storage.delete(&snapshot_name(tenant))?;
        }

        log::info!("Removed index for tenant {tenant}");
        Ok(removed.is_some())
    }
}

pub fn snapshot_name(tenant: &TenantId) -> String {
    format!("{tenant}{SNAPSHOT_EXT}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendLocal;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn registry() -> IndexRegistry {
        IndexRegistry::new(2, [7u8; 32])
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let registry = registry();
        let a = registry.get_or_create(&tenant("acme")).unwrap();
        a.write().unwrap().upsert("1", vec![1.0, 0.0]).unwrap();

        let b = registry.get_or_create(&tenant("acme")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.read().unwrap().len(), 1);
        assert_eq!(b.read().unwrap().dimensions(), 2);
    }

    #[test]
    fn test_get_does_not_create() {
        let registry = registry();
        assert!(registry.get(&tenant("acme")).unwrap().is_none());
        assert!(!registry.contains(&tenant("acme")));
    }

    #[test]
    fn test_save_and_load_all() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = BackendLocal::new(tmp.path()).unwrap();

        let registry = registry();
        for (t, v) in [("acme", vec![1.0, 0.0]), ("globex", vec![0.0, 1.0])] {
            let slot = registry.get_or_create(&tenant(t)).unwrap();
            slot.write().unwrap().upsert("p1", v).unwrap();
            registry.save(&tenant(t), &storage).unwrap();
        }

        let fresh = self::registry();
        let report = fresh.load_all(&storage).unwrap();

        assert_eq!(report.loaded, vec![tenant("acme"), tenant("globex")]);
        assert!(report.skipped.is_empty());
        let acme = fresh.get(&tenant("acme")).unwrap().unwrap();
        assert_eq!(acme.read().unwrap().get("p1").unwrap(), &[1.0, 0.0]);
    }

    #[test]
    fn test_load_all_skips_unreadable() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = BackendLocal::new(tmp.path()).unwrap();

        let registry = registry();
        registry.get_or_create(&tenant("good")).unwrap();
        registry.save(&tenant("good"), &storage).unwrap();
        storage.write("broken.index", b"not a snapshot").unwrap();
        storage.write("notes.txt", b"ignored").unwrap();

        // same dimension, different model
        let other = IndexRegistry::new(2, [9u8; 32]);
        other.get_or_create(&tenant("stale")).unwrap();
        other.save(&tenant("stale"), &storage).unwrap();

        let fresh = self::registry();
        let report = fresh.load_all(&storage).unwrap();

        assert_eq!(report.loaded, vec![tenant("good")]);
        assert_eq!(
            report.skipped,
            vec!["broken.index".to_string(), "stale.index".to_string()]
        );
        assert!(!fresh.contains(&tenant("broken")));
    }

    #[test]
    fn test_save_unknown_tenant() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = BackendLocal::new(tmp.path()).unwrap();

        let result = registry().save(&tenant("ghost"), &storage);
        assert!(matches!(result, Err(RegistryError::UnknownTenant(_))));
    }

    #[test]
    fn test_evict_removes_memory_and_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = BackendLocal::new(tmp.path()).unwrap();

        let registry = registry();
        let slot = registry.get_or_create(&tenant("acme")).unwrap();
        slot.write().unwrap().upsert("1", vec![1.0, 0.0]).unwrap();
        registry.save(&tenant("acme"), &storage).unwrap();
        assert!(storage.exists("acme.index"));

        assert!(registry.evict(&tenant("acme"), &storage).unwrap());

        assert!(!registry.contains(&tenant("acme")));
        assert!(!storage.exists("acme.index"));
        assert!(slot.read().unwrap().is_empty());
        assert!(!registry.evict(&tenant("acme"), &storage).unwrap());
    }

    #[test]
    fn test_load_on_demand() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = BackendLocal::new(tmp.path()).unwrap();

        let registry = registry();
        assert!(!registry.load(&tenant("acme"), &storage).unwrap());

        let slot = registry.get_or_create(&tenant("acme")).unwrap();
        slot.write().unwrap().upsert("1", vec![1.0, 0.0]).unwrap();
        registry.save(&tenant("acme"), &storage).unwrap();
        slot.write().unwrap().upsert("2", vec![0.0, 1.0]).unwrap();

        assert!(registry.load(&tenant("acme"), &storage).unwrap());
        assert_eq!(slot.read().unwrap().len(), 1);
    }

    #[test]
    fn test_stats() {
        let registry = IndexRegistry::new(512, [0u8; 32]);
        let slot = registry.get_or_create(&tenant("acme")).unwrap();
        {
            let mut index = slot.write().unwrap();
            for i in 0..1024 {
                let mut v = vec![0.0; 512];
                v[i % 512] = 1.0;
                index.upsert(i.to_string(), v).unwrap();
            }
        }

        let stats = registry.stats(&tenant("acme")).unwrap();
        assert_eq!(stats.indexed_products, 1024);
        assert!((stats.index_size_mb - 2.0).abs() < f64::EPSILON);

        let empty = registry.stats(&tenant("nobody")).unwrap();
        assert_eq!(empty.indexed_products, 0);
    }

    #[test]
    fn test_concurrent_tenants() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let id = tenant(&format!("t{}", t % 4));
                    for i in 0..50 {
                        let slot = registry.get_or_create(&id).unwrap();
                        slot.write()
                            .unwrap()
                            .upsert(format!("{t}-{i}"), vec![1.0, i as f32])
                            .unwrap();
                        let _ = slot.read().unwrap().search(&[1.0, 0.0], 5).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(registry.tenants().len(), 4);
        for t in 0..4 {
            let slot = registry.get(&tenant(&format!("t{t}"))).unwrap().unwrap();
            assert_eq!(slot.read().unwrap().len(), 100);
        }
    }
}
