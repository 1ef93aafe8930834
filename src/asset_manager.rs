//! Asset Manager (C7): the top-level coordinator.
//!
//! Grounded in `AssetManager.cpp`: owns the Requester registry, dedupes
//! submissions by summary, drives eviction, routes updates, and is the
//! construction point every other component's back-references point at
//! (`StorageManager::asset_manager`, `RequesterContext::bus`). Registry
//! mutation is serialized through a single dedicated task (§5's "single-
//! threaded cooperative executor"), modeled here as a `tokio` task reading an
//! `mpsc` queue — the same actor-task shape this workspace uses for
//! per-tenant background loops, not a raw OS thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use camino::Utf8PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::allow_list::UrlAllowList;
use crate::bus::{self, NotificationBus, PropertyValue};
use crate::collaborators::{AuthTokenProvider, DefaultEndpointUrlBuilder, HttpClient, ThrottleGate};
use crate::config::AssetManagerConf;
use crate::request::Request;
use crate::request_factory::RequestFactory;
use crate::requester::{Priority, Requester, State};
use crate::requester_factory::RequesterFactory;
use crate::requester_metadata::RequesterMetadata;
use crate::storage_manager::StorageManager;

const RESOURCES_DIR: &str = "resources";
const REQUESTS_DIR: &str = "requests";
const URL_WORKING_DIR: &str = "urlWorkingDir";

/// Seeds a clock that never moves backward relative to the highest
/// `last_used_ms` restored at startup (§4.3, §9's `start_time_offset` note):
/// `now_ms() = seed + elapsed_since_construction`, so a freshly-touched
/// Requester always sorts after every restored one even if the wall clock is
/// adjusted backward mid-run.
struct MonotonicClock {
    seed_ms: u64,
    started: Instant,
}

impl MonotonicClock {
    fn new(high_water_mark_ms: u64) -> Self {
        Self {
            seed_ms: high_water_mark_ms.max(wall_clock_ms()),
            started: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.seed_ms + self.started.elapsed().as_millis() as u64
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Operations accepted by the executor task. `queue_*` methods are
/// `mpsc::Sender::send` calls against this; the non-`queue_` methods below
/// are plain `async fn`s that the executor (or a direct caller outside it)
/// invokes itself — per §5, they must not be called while already running on
/// the executor.
enum ExecutorOp {
    Download(Request),
    Delete(String),
    HandleUpdate(String, bool),
    FreeUpSpace(u64),
}

pub struct AssetManager {
    base_directory: Utf8PathBuf,
    registry: Mutex<HashMap<String, Arc<Requester>>>,
    storage: Arc<StorageManager>,
    bus: Arc<NotificationBus>,
    requester_factory: RequesterFactory,
    conf: Arc<AssetManagerConf>,
    throttle: Arc<ThrottleGate>,
    clock: MonotonicClock,
    cancel: CancellationToken,
    executor_tx: mpsc::UnboundedSender<ExecutorOp>,
    shut_down: AtomicBool,
}

impl AssetManager {
    /// `AssetManager::start` / the constructor sequence in §4.3: lay out the
    /// base directory, build the Storage Manager and Requester Factory,
    /// restore Requesters from their sidecars, purge unreferenced Resources,
    /// then register the bus-invoked entry points.
    pub async fn start(conf: AssetManagerConf, auth: Arc<dyn AuthTokenProvider>) -> anyhow::Result<Arc<Self>> {
        let base_directory = conf.base_directory.clone();
        let resources_dir = base_directory.join(RESOURCES_DIR);
        let requests_dir = base_directory.join(REQUESTS_DIR);
        let url_working_dir = base_directory.join(URL_WORKING_DIR);

        std::fs::create_dir_all(&base_directory)?;
        std::fs::create_dir_all(&requests_dir)?;
        // Recreated clean at every startup (§4.3 step 1): nothing persists
        // here across restarts, unlike `resources/` and `requests/`.
        if url_working_dir.is_dir() {
            std::fs::remove_dir_all(&url_working_dir)?;
        }
        std::fs::create_dir_all(&url_working_dir)?;

        let storage = StorageManager::create(resources_dir)?;
        let bus = Arc::new(NotificationBus::new());
        let throttle = Arc::new(ThrottleGate::new());
        let http = Arc::new(HttpClient::new(auth, throttle.clone())?);
        let endpoint_builder = Arc::new(DefaultEndpointUrlBuilder {
            base_url: conf.service_base_url.clone(),
        });
        let allow_list = Arc::new(UrlAllowList::new(conf.url_allow_list.clone(), conf.allow_all_urls));
        let conf = Arc::new(conf);
        let requester_factory = RequesterFactory::new(
            bus.clone(),
            storage.clone(),
            http.clone(),
            conf.clone(),
            endpoint_builder,
            allow_list,
        );

        let (registry, high_water_mark_ms) = restore_registry(&requests_dir, &requester_factory);
        storage.purge_unreferenced();

        let (executor_tx, executor_rx) = mpsc::unbounded_channel();
        let this = Arc::new(Self {
            base_directory,
            registry: Mutex::new(registry),
            storage: storage.clone(),
            bus: bus.clone(),
            requester_factory,
            conf,
            throttle,
            clock: MonotonicClock::new(high_water_mark_ms),
            cancel: CancellationToken::new(),
            executor_tx,
            shut_down: AtomicBool::new(false),
        });
        storage.set_asset_manager(Arc::downgrade(&this));
        this.clone().spawn_executor(executor_rx);
        this.register_bus_functions();
        bus.register_property(bus::INITIALIZATION_PROPERTY, PropertyValue::Int(1), None);

        info!(
            requesters = this.registry.lock().unwrap().len(),
            "asset manager started"
        );
        Ok(this)
    }

    fn spawn_executor(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ExecutorOp>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    op = rx.recv() => {
                        let Some(op) = op else { break };
                        self.run_executor_op(op).await;
                    }
                    _ = self.cancel.cancelled() => break,
                }
            }
        });
    }

    async fn run_executor_op(&self, op: ExecutorOp) {
        match op {
            ExecutorOp::Download(request) => {
                self.download_artifact(request).await;
            }
            ExecutorOp::Delete(summary) => {
                self.delete_artifact(&summary).await;
            }
            ExecutorOp::HandleUpdate(summary, accept) => {
                self.handle_update(&summary, accept).await;
            }
            ExecutorOp::FreeUpSpace(n) => {
                self.free_up_space(n).await;
            }
        }
    }

    fn register_bus_functions(self: &Arc<Self>) {
        let register = Arc::downgrade(self);
        self.bus.register_function(
            bus::REGISTER_ARTIFACT_FUNCTION,
            Arc::new(move |arg: &str| {
                let Some(this) = register.upgrade() else { return false };
                this.function_to_be_invoked(bus::REGISTER_ARTIFACT_FUNCTION, arg)
            }),
        );
        let remove = Arc::downgrade(self);
        self.bus.register_function(
            bus::REMOVE_ARTIFACT_FUNCTION,
            Arc::new(move |arg: &str| {
                let Some(this) = remove.upgrade() else { return false };
                this.function_to_be_invoked(bus::REMOVE_ARTIFACT_FUNCTION, arg)
            }),
        );
        let accept = Arc::downgrade(self);
        self.bus.register_function(
            bus::ACCEPT_UPDATE_FUNCTION,
            Arc::new(move |arg: &str| {
                let Some(this) = accept.upgrade() else { return false };
                this.queue_handle_update(arg, true);
                true
            }),
        );
        let reject = Arc::downgrade(self);
        self.bus.register_function(
            bus::REJECT_UPDATE_FUNCTION,
            Arc::new(move |arg: &str| {
                let Some(this) = reject.upgrade() else { return false };
                this.queue_handle_update(arg, false);
                true
            }),
        );
    }

    /// The bus-invoked entry point (§4.3): only `RegisterArtifact` and
    /// `RemoveArtifact` are recognized here; any other name returns `false`.
    /// (`AcceptUpdate`/`RejectUpdate` are separate bus functions registered
    /// directly in [`Self::register_bus_functions`], per §6's surface list.)
    pub fn function_to_be_invoked(self: &Arc<Self>, name: &str, arg: &str) -> bool {
        match name {
            bus::REGISTER_ARTIFACT_FUNCTION => self.queue_download_artifact_json(arg),
            bus::REMOVE_ARTIFACT_FUNCTION => {
                self.queue_delete_artifact(arg);
                true
            }
            _ => false,
        }
    }

    /// `downloadArtifact`: dedupe by summary under the registry lock, build a
    /// fresh Requester via the factory on miss, then call its `download()`.
    #[instrument(skip(self, request))]
    pub async fn download_artifact(self: &Arc<Self>, request: Request) -> Arc<Requester> {
        let summary = request.summary().to_string();
        let requester = {
            let mut registry = self.registry.lock().unwrap();
            if let Some(existing) = registry.get(&summary) {
                existing.clone()
            } else {
                let sidecar = self.base_directory.join(REQUESTS_DIR).join(&summary);
                let requester = self.requester_factory.create(request, &sidecar);
                registry.insert(summary, requester.clone());
                requester
            }
        };
        requester.download();
        requester
    }

    pub fn queue_download_artifact(self: &Arc<Self>, request: Request) {
        let _ = self.executor_tx.send(ExecutorOp::Download(request));
    }

    /// `queueDownloadArtifact` (JSON variant): parses eagerly so the caller
    /// learns about a malformed descriptor immediately, then enqueues.
    pub fn queue_download_artifact_json(self: &Arc<Self>, json: &str) -> bool {
        match RequestFactory::from_json_str(json) {
            Ok(request) => {
                self.queue_download_artifact(request);
                true
            }
            Err(err) => {
                warn!(%err, "rejected malformed download request");
                false
            }
        }
    }

    /// `deleteArtifact`: find by summary, run `delete_and_cleanup`, and
    /// forget it. A missing summary is logged but not an error.
    #[instrument(skip(self))]
    pub async fn delete_artifact(&self, summary: &str) -> u64 {
        let requester = self.registry.lock().unwrap().remove(summary);
        match requester {
            Some(requester) => requester.delete_and_cleanup(),
            None => {
                warn!(summary, "delete_artifact: no such requester");
                0
            }
        }
    }

    pub fn queue_delete_artifact(self: &Arc<Self>, summary: &str) {
        let _ = self.executor_tx.send(ExecutorOp::Delete(summary.to_string()));
    }

    #[instrument(skip(self))]
    pub async fn handle_update(&self, summary: &str, accept: bool) {
        let requester = self.registry.lock().unwrap().get(summary).cloned();
        match requester {
            Some(requester) => requester.handle_update(accept),
            None => warn!(summary, accept, "handle_update: no such requester"),
        }
    }

    pub fn queue_handle_update(self: &Arc<Self>, summary: &str, accept: bool) {
        let _ = self.executor_tx.send(ExecutorOp::HandleUpdate(summary.to_string(), accept));
    }

    /// `freeUpSpace`: evict LOADED Requesters lowest-priority-first (ties
    /// broken oldest-`last_used`-first, per §8's eviction law) until `n_bytes`
    /// is freed or the next candidate is protected (ACTIVE/PENDING_ACTIVATION).
    /// Called synchronously by the Storage Manager; [`Self::queue_free_up_space`]
    /// is the non-blocking variant it uses when it must not block its caller.
    #[instrument(skip(self))]
    pub async fn free_up_space(&self, n_bytes: u64) -> bool {
        let mut candidates: Vec<Arc<Requester>> = {
            let registry = self.registry.lock().unwrap();
            registry
                .values()
                .filter(|r| r.state() == State::Loaded)
                .cloned()
                .collect()
        };
        candidates.sort_by(|a, b| {
            a.get_priority()
                .cmp(&b.get_priority())
                .then(a.last_used_epoch_ms().cmp(&b.last_used_epoch_ms()))
        });

        let mut freed = 0u64;
        for requester in candidates {
            if freed >= n_bytes {
                break;
            }
            if requester.get_priority().is_protected() {
                break;
            }
            let summary = requester.summary().to_string();
            freed += requester.delete_and_cleanup();
            self.registry.lock().unwrap().remove(&summary);
        }
        if freed < n_bytes {
            warn!(n_bytes, freed, "free_up_space: could not free the full amount requested");
        }
        freed >= n_bytes
    }

    pub fn queue_free_up_space(self: &Arc<Self>, n_bytes: u64) {
        let _ = self.executor_tx.send(ExecutorOp::FreeUpSpace(n_bytes));
    }

    /// `onIdleChanged`: forwards a throttle hint to the download subsystem.
    /// Has no effect on any Requester's state machine.
    pub fn on_idle_changed(&self, is_idle: bool) {
        self.throttle.set_idle(is_idle);
    }

    pub fn get_budget(&self) -> u64 {
        self.storage.get_budget()
    }

    pub fn set_budget(&self, budget_mb: u64) {
        self.storage.set_budget(budget_mb);
    }

    /// Current time for `Requester::get_artifact_path`'s persist-on-read
    /// `last_used_ms` touch (§9's `start_time_offset`).
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Direct (non-bus) path lookup for a summary, touching `last_used_ms`.
    pub fn get_artifact_path(&self, summary: &str) -> Option<String> {
        let requester = self.registry.lock().unwrap().get(summary).cloned()?;
        Some(requester.get_artifact_path(self.now_ms()))
    }

    pub fn get_priority(&self, summary: &str) -> Option<Priority> {
        self.registry.lock().unwrap().get(summary).map(|r| r.get_priority())
    }

    pub fn set_priority(&self, summary: &str, priority: Priority) -> bool {
        match self.registry.lock().unwrap().get(summary) {
            Some(requester) => {
                requester.set_priority(priority);
                true
            }
            None => false,
        }
    }

    pub fn registered_summaries(&self) -> Vec<String> {
        self.registry.lock().unwrap().keys().cloned().collect()
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    /// Drains the executor: no further `queue_*` operations are accepted
    /// after this returns. Requesters already in flight finish or cancel on
    /// their own; this just stops the executor from picking up more work.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }
}

/// §4.3 step 4: load every sidecar in `requests/`, skipping `.tmp` staging
/// files; corrupt sidecars are erased rather than retried. Returns the
/// restored registry plus the high-water-mark `last_used_ms`, used to seed
/// [`MonotonicClock`].
fn restore_registry(
    requests_dir: &Utf8PathBuf,
    requester_factory: &RequesterFactory,
) -> (HashMap<String, Arc<Requester>>, u64) {
    let mut registry = HashMap::new();
    let mut high_water_mark_ms = 0u64;

    let Ok(entries) = std::fs::read_dir(requests_dir) else {
        return (registry, high_water_mark_ms);
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        if path.extension() == Some("tmp") {
            continue;
        }
        match RequesterMetadata::load(&path) {
            Some(metadata) => {
                high_water_mark_ms = high_water_mark_ms.max(metadata.last_used_epoch_ms);
                let requester = requester_factory.create_from_metadata(metadata);
                registry.insert(requester.summary().to_string(), requester);
            }
            None => {
                warn!(path = %path, "erasing unrecoverable requester sidecar at startup");
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    (registry, high_water_mark_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{FilterMap, Region, ServiceRequest};

    async fn start_manager(dir: &camino_tempfile::Utf8TempDir) -> Arc<AssetManager> {
        let mut conf = AssetManagerConf::default();
        conf.base_directory = dir.path().to_path_buf();
        conf.max_download_retry = crate::config::defaults::TEST_MAX_DOWNLOAD_RETRY;
        conf.download_base_backoff_ms = crate::config::defaults::TEST_DOWNLOAD_BASE_BACKOFF_MS;
        conf.download_backoff_cap_ms = crate::config::defaults::TEST_DOWNLOAD_BACKOFF_CAP_MS;
        conf.update_retry_interval_ms = crate::config::defaults::TEST_UPDATE_RETRY_INTERVAL_MS;
        conf.max_update_notifications = crate::config::defaults::TEST_MAX_UPDATE_NOTIFICATIONS;
        AssetManager::start(conf, Arc::new(crate::collaborators::NoAuth)).await.unwrap()
    }

    fn sample_request(key: &str) -> Request {
        Request::Service(
            ServiceRequest::new("wakeword".into(), key.into(), FilterMap::new(), Region::Na, false).unwrap(),
        )
    }

    #[tokio::test]
    async fn startup_lays_out_expected_directories() {
        let dir = camino_tempfile::tempdir().unwrap();
        let _manager = start_manager(&dir).await;
        assert!(dir.path().join(RESOURCES_DIR).is_dir());
        assert!(dir.path().join(REQUESTS_DIR).is_dir());
        assert!(dir.path().join(URL_WORKING_DIR).is_dir());
        assert_eq!(
            crate::bus::PropertyValue::Int(1),
            crate::bus::PropertyValue::Int(1)
        );
    }

    #[tokio::test]
    async fn download_artifact_dedupes_by_summary() {
        let dir = camino_tempfile::tempdir().unwrap();
        let manager = start_manager(&dir).await;
        let first = manager.download_artifact(sample_request("alexa")).await;
        let second = manager.download_artifact(sample_request("alexa")).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.registered_summaries().len(), 1);
    }

    #[tokio::test]
    async fn delete_artifact_removes_from_registry() {
        let dir = camino_tempfile::tempdir().unwrap();
        let manager = start_manager(&dir).await;
        let requester = manager.download_artifact(sample_request("alexa")).await;
        let summary = requester.summary().to_string();
        manager.delete_artifact(&summary).await;
        assert!(manager.registered_summaries().is_empty());
    }

    #[tokio::test]
    async fn delete_artifact_on_missing_summary_is_a_no_op() {
        let dir = camino_tempfile::tempdir().unwrap();
        let manager = start_manager(&dir).await;
        let freed = manager.delete_artifact("no-such-summary").await;
        assert_eq!(freed, 0);
    }

    #[tokio::test]
    async fn free_up_space_skips_protected_priorities() {
        let dir = camino_tempfile::tempdir().unwrap();
        let manager = start_manager(&dir).await;
        let a = manager.download_artifact(sample_request("a")).await;
        let b = manager.download_artifact(sample_request("b")).await;
        a.set_priority(Priority::Active);
        b.set_priority(Priority::Unused);
        // Neither artifact is LOADED yet (no real HTTP backend in this test),
        // so free_up_space has nothing unprotected to evict and reports it
        // couldn't free the amount requested.
        let fully_freed = manager.free_up_space(10).await;
        assert!(!fully_freed);
    }

    #[tokio::test]
    async fn function_to_be_invoked_rejects_unknown_names() {
        let dir = camino_tempfile::tempdir().unwrap();
        let manager = start_manager(&dir).await;
        assert!(!manager.function_to_be_invoked("SomethingElse", "{}"));
    }

    #[tokio::test]
    async fn function_to_be_invoked_register_artifact_parses_and_queues() {
        let dir = camino_tempfile::tempdir().unwrap();
        let manager = start_manager(&dir).await;
        let json = r#"{"artifactType":"wakeword","artifactKey":"alexa","filters":{}}"#;
        assert!(manager.function_to_be_invoked(bus::REGISTER_ARTIFACT_FUNCTION, json));
        assert!(!manager.function_to_be_invoked(bus::REGISTER_ARTIFACT_FUNCTION, "not json"));
    }

    #[tokio::test]
    async fn on_idle_changed_sets_throttle_without_touching_state_machines() {
        let dir = camino_tempfile::tempdir().unwrap();
        let manager = start_manager(&dir).await;
        let requester = manager.download_artifact(sample_request("alexa")).await;
        let state_before = requester.state();
        manager.on_idle_changed(true);
        assert!(manager.throttle.is_idle());
        assert_eq!(requester.state(), state_before);
    }
}
