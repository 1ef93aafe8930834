//! Storage Manager (C2): the content-addressed resource bank.
//!
//! Grounded in `StorageManager.cpp`. Holds a `Mutex`-guarded bank map plus
//! budget counters; calls out to the Asset Manager for garbage collection
//! are made with the lock released first, matching the original's
//! lock-drop-before-callback discipline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, error, info, warn};

use crate::asset_manager::AssetManager;
use crate::error::StorageError;
use crate::resource::Resource;

const BYTES_IN_MB: u64 = 1024 * 1024;
/// Leave a few MB of headroom on the filesystem, matching `SYSTEM_STORAGE_BUFFER`.
const SYSTEM_STORAGE_BUFFER_BYTES: u64 = 5 * BYTES_IN_MB;
const BUDGET_FILE_NAME: &str = "budget.config";

fn subtract_saturating(original: u64, amount: u64) -> u64 {
    original.saturating_sub(amount)
}

struct Bank {
    resources: HashMap<String, Arc<Resource>>,
    allocated_bytes: u64,
    budget_mb: u64,
}

pub struct StorageManager {
    working_directory: Utf8PathBuf,
    /// Set once, just after the owning [`AssetManager`] is constructed
    /// (`Arc::new_cyclic` can't be used here because `AssetManager::start`
    /// needs to run fallible async setup before the back-reference exists).
    /// See `set_asset_manager`.
    asset_manager: OnceLock<Weak<AssetManager>>,
    bank: Mutex<Bank>,
    /// Bytes promised by outstanding [`ReservationToken`]s; included in
    /// `allocated_bytes` bookkeeping but tracked separately for diagnostics.
    reserved_bytes: AtomicI64,
}

impl StorageManager {
    /// `StorageManager::create` + `init`: scan `working_directory`,
    /// reloading or erasing each subdirectory, and read `budget.config`.
    /// The back-reference to the owning [`AssetManager`] is wired in later
    /// via `set_asset_manager`, once that `Arc` exists.
    pub fn create(working_directory: Utf8PathBuf) -> Result<Arc<Self>, StorageError> {
        std::fs::create_dir_all(&working_directory).map_err(|source| StorageError::Io {
            path: working_directory.clone(),
            source,
        })?;

        let mut resources = HashMap::new();
        let mut allocated_bytes = 0u64;
        if let Ok(entries) = std::fs::read_dir(&working_directory) {
            for entry in entries.filter_map(|e| e.ok()) {
                let path = match Utf8PathBuf::from_path_buf(entry.path()) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if !path.is_dir() {
                    continue;
                }
                match Resource::create_from_storage(&path) {
                    Some(resource) => {
                        info!(resource = %resource.path(), "loaded stored resource");
                        allocated_bytes += resource.size_bytes();
                        resources.insert(resource.id().to_string(), Arc::new(resource));
                    }
                    None => {
                        error!(directory = %path, "failed to load stored resource, cleaning it up");
                        let _ = std::fs::remove_dir_all(&path);
                    }
                }
            }
        }

        let budget_mb = read_budget_file(&working_directory).unwrap_or(crate::config::defaults::DEFAULT_BUDGET_MB);

        Ok(Arc::new(Self {
            working_directory,
            asset_manager: OnceLock::new(),
            bank: Mutex::new(Bank {
                resources,
                allocated_bytes,
                budget_mb,
            }),
            reserved_bytes: AtomicI64::new(0),
        }))
    }

    /// Wire in the back-reference once the owning `AssetManager`'s `Arc`
    /// exists. Must be called exactly once, before any call that might need
    /// to free space (`reserve_space`, `register_and_acquire_resource`,
    /// `set_budget`).
    pub fn set_asset_manager(&self, asset_manager: Weak<AssetManager>) {
        if self.asset_manager.set(asset_manager).is_err() {
            warn!("set_asset_manager called more than once, ignoring");
        }
    }

    fn asset_manager(&self) -> Option<Arc<AssetManager>> {
        self.asset_manager.get()?.upgrade()
    }

    /// `purgeUnreferenced`: called once after Requesters are restored at
    /// startup, to erase any Resource nobody re-acquired.
    pub fn purge_unreferenced(&self) {
        let mut bank = self.bank.lock().unwrap();
        let mut freed = 0u64;
        bank.resources.retain(|_, resource| {
            if resource.ref_count() <= 0 {
                freed += resource.size_bytes();
                resource.erase();
                false
            } else {
                true
            }
        });
        bank.allocated_bytes = subtract_saturating(bank.allocated_bytes, freed);
        crate::metrics::ALLOCATED_BYTES.set(bank.allocated_bytes as i64);
    }

    fn available_budget_locked(&self, bank: &Bank) -> u64 {
        let disk_free = fs2::available_space(self.working_directory.as_std_path()).unwrap_or(0);
        let available_disk = subtract_saturating(disk_free, SYSTEM_STORAGE_BUFFER_BYTES);
        let budget_bytes = bank.budget_mb * BYTES_IN_MB;
        if budget_bytes < bank.allocated_bytes {
            return 0;
        }
        std::cmp::min(budget_bytes - bank.allocated_bytes, available_disk)
    }

    pub fn available_budget(&self) -> u64 {
        let bank = self.bank.lock().unwrap();
        self.available_budget_locked(&bank)
    }

    /// `reserveSpace`: request garbage collection synchronously if the
    /// budget is short, then hand back a release-on-drop token.
    pub async fn reserve_space(self: &Arc<Self>, requested: u64) -> Option<ReservationToken> {
        let shortfall = {
            let bank = self.bank.lock().unwrap();
            let available = self.available_budget_locked(&bank);
            requested.saturating_sub(available)
        };

        if shortfall > 0 {
            let Some(asset_manager) = self.asset_manager() else {
                error!("asset manager is gone, cannot free requested space");
                return None;
            };
            if !asset_manager.free_up_space(shortfall).await {
                error!(requested, "failed to clear requested space");
                return None;
            }
        }

        let mut bank = self.bank.lock().unwrap();
        bank.allocated_bytes += requested;
        self.reserved_bytes.fetch_add(requested as i64, Ordering::SeqCst);
        crate::metrics::ALLOCATED_BYTES.set(bank.allocated_bytes as i64);
        Some(ReservationToken {
            storage_manager: Arc::downgrade(self),
            bytes: requested,
            released: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn free_reserved_space(&self, bytes: u64) {
        let mut bank = self.bank.lock().unwrap();
        bank.allocated_bytes = subtract_saturating(bank.allocated_bytes, bytes);
        self.reserved_bytes.fetch_sub(bytes as i64, Ordering::SeqCst);
        crate::metrics::ALLOCATED_BYTES.set(bank.allocated_bytes as i64);
    }

    /// `registerAndAcquireResource`: consumes the token, then either shares
    /// an existing Resource with this id or adopts `source_path` as a new one.
    pub fn register_and_acquire_resource(
        self: &Arc<Self>,
        token: ReservationToken,
        id: &str,
        source_path: &Utf8Path,
    ) -> Option<Arc<Resource>> {
        token.release();

        let mut bank = self.bank.lock().unwrap();
        if let Some(existing) = bank.resources.get(id) {
            warn!(%source_path, "attempting to register a resource id that already exists, discarding duplicate");
            let _ = std::fs::remove_dir_all(source_path);
            existing.increment_ref_count();
            return Some(existing.clone());
        }

        let resource = match Resource::create(&self.working_directory, id, source_path) {
            Ok(r) => Arc::new(r),
            Err(err) => {
                error!(resource = id, %err, "failed to register resource");
                return None;
            }
        };
        resource.increment_ref_count();
        // `release()` above already removed the reserved estimate from
        // `allocated_bytes`; fold in the actual on-disk size now, which may
        // differ from the estimate (e.g. after unpack).
        bank.allocated_bytes += resource.size_bytes();
        let budget_bytes = bank.budget_mb * BYTES_IN_MB;
        let overage = if bank.allocated_bytes > budget_bytes {
            Some(bank.allocated_bytes - budget_bytes)
        } else {
            None
        };
        crate::metrics::ALLOCATED_BYTES.set(bank.allocated_bytes as i64);
        bank.resources.insert(id.to_string(), resource.clone());
        drop(bank);

        if let Some(overage) = overage {
            self.request_garbage_collection(overage);
        }

        Some(resource)
    }

    pub fn acquire_resource(&self, id: &str) -> Option<Arc<Resource>> {
        let bank = self.bank.lock().unwrap();
        let resource = bank.resources.get(id)?;
        resource.increment_ref_count();
        Some(resource.clone())
    }

    /// `releaseResource`: decrement ref count; erase and return bytes freed
    /// once it reaches zero.
    pub fn release_resource(&self, resource: &Arc<Resource>) -> u64 {
        let mut bank = self.bank.lock().unwrap();
        if resource.decrement_ref_count() > 0 {
            return 0;
        }
        debug!(resource = resource.id(), "no remaining usage, deleting");
        let size = resource.size_bytes();
        bank.resources.remove(resource.id());
        resource.erase();
        bank.allocated_bytes = subtract_saturating(bank.allocated_bytes, size);
        crate::metrics::ALLOCATED_BYTES.set(bank.allocated_bytes as i64);
        size
    }

    fn request_garbage_collection(&self, requested: u64) {
        let Some(asset_manager) = self.asset_manager() else {
            error!("asset manager is gone, cannot request garbage collection");
            return;
        };
        asset_manager.queue_free_up_space(requested);
    }

    pub fn get_budget(&self) -> u64 {
        self.bank.lock().unwrap().budget_mb
    }

    /// `setBudget`: persist the new value, and request GC if shrinking
    /// below current allocation.
    pub fn set_budget(&self, budget_mb: u64) {
        if let Err(err) = write_budget_file(&self.working_directory, budget_mb) {
            warn!(%err, "failed to persist budget.config");
        }
        let overage = {
            let mut bank = self.bank.lock().unwrap();
            let new_bytes = budget_mb * BYTES_IN_MB;
            let overage = (bank.allocated_bytes > new_bytes).then(|| bank.allocated_bytes - new_bytes);
            bank.budget_mb = budget_mb;
            overage
        };
        if let Some(overage) = overage {
            self.request_garbage_collection(overage);
        }
    }

    pub fn working_directory(&self) -> &Utf8Path {
        &self.working_directory
    }
}

fn read_budget_file(working_directory: &Utf8Path) -> Option<u64> {
    let contents = std::fs::read_to_string(working_directory.join(BUDGET_FILE_NAME)).ok()?;
    let value: u64 = contents.trim().parse().ok()?;
    (value > 0).then_some(value)
}

fn write_budget_file(working_directory: &Utf8Path, budget_mb: u64) -> std::io::Result<()> {
    std::fs::write(working_directory.join(BUDGET_FILE_NAME), budget_mb.to_string())
}

/// Release-on-drop promise of `bytes` of budget. The type makes it
/// impossible to forget to release: either `release()` consumes it
/// explicitly (on success) or `Drop` releases it (on failure/cancel).
pub struct ReservationToken {
    storage_manager: Weak<StorageManager>,
    bytes: u64,
    released: std::sync::atomic::AtomicBool,
}

impl ReservationToken {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    fn release(self) {
        self.released.store(true, Ordering::SeqCst);
        if let Some(sm) = self.storage_manager.upgrade() {
            sm.free_reserved_space(self.bytes);
        }
    }
}

impl Drop for ReservationToken {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sm) = self.storage_manager.upgrade() {
            sm.free_reserved_space(self.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_without_shortfall_increments_allocation() {
        let dir = camino_tempfile::tempdir().unwrap();
        let sm = StorageManager::create(dir.path().to_path_buf()).unwrap();
        let token = sm.reserve_space(1024).await.unwrap();
        assert_eq!(sm.bank.lock().unwrap().allocated_bytes, 1024);
        drop(token);
        assert_eq!(sm.bank.lock().unwrap().allocated_bytes, 0);
    }

    #[test]
    fn register_and_acquire_resource_shares_existing_id() {
        let dir = camino_tempfile::tempdir().unwrap();
        let sm = StorageManager::create(dir.path().to_path_buf()).unwrap();

        let staged_a = dir.path().join("a");
        std::fs::write(&staged_a, b"hello").unwrap();
        let token_a = futures::executor::block_on(sm.reserve_space(5)).unwrap();
        let first = sm.register_and_acquire_resource(token_a, "shared-id", &staged_a).unwrap();
        assert_eq!(first.ref_count(), 1);

        let staged_b = dir.path().join("b");
        std::fs::write(&staged_b, b"world").unwrap();
        let token_b = futures::executor::block_on(sm.reserve_space(5)).unwrap();
        let second = sm.register_and_acquire_resource(token_b, "shared-id", &staged_b).unwrap();
        assert_eq!(second.ref_count(), 2);
        assert!(!staged_b.exists());
    }

    #[test]
    fn budget_roundtrips_through_file() {
        let dir = camino_tempfile::tempdir().unwrap();
        let sm = StorageManager::create(dir.path().to_path_buf()).unwrap();
        sm.set_budget(750);
        assert_eq!(sm.get_budget(), 750);
        assert_eq!(read_budget_file(dir.path()), Some(750));
    }
}
