//! Registry of models and the lazy-start policy for their workers.
//!
//! Locking: one mutex guards the id -> model map and is never held across an
//! await. Each model has its own async start lock, held across the whole
//! check-and-start sequence, and a small state mutex for the worker state, so
//! a slow start or a long prediction on one model never blocks another.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use log::{info, warn};
use tokio::task::JoinHandle;

use super::config::RegistryConfig;
use super::error::{Result, ServeError};
use super::fit_job::FitJob;
use super::models::{self, ModelRecord, TrainingRequest};
use super::worker::ipc_types::{IpcEndpoint, Payload};
use super::worker::worker_bridge::{LaunchSpec, WorkerBridge};

/// Shared reference to the registry.
pub type SharedModelRegistry = Arc<ModelRegistry>;

#[derive(Debug)]
enum WorkerState {
    Stopped,
    Starting,
    Running(Arc<WorkerBridge>),
    /// Stop signal sent, waiting for the supervisor to see the exit.
    Stopping(Arc<WorkerBridge>),
}

impl WorkerState {
    fn bridge(&self) -> Option<&Arc<WorkerBridge>> {
        match self {
            WorkerState::Running(bridge) | WorkerState::Stopping(bridge) => Some(bridge),
            WorkerState::Stopped | WorkerState::Starting => None,
        }
    }
}

fn lock_state(state: &Mutex<WorkerState>) -> MutexGuard<'_, WorkerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A trained model and its (possibly absent) worker.
#[derive(Debug)]
pub struct Model {
    record: ModelRecord,
    config: Arc<RegistryConfig>,
    start_lock: tokio::sync::Mutex<()>,
    state: Arc<Mutex<WorkerState>>,
    epochs: AtomicU64,
}

impl Model {
    fn new(record: ModelRecord, config: Arc<RegistryConfig>) -> Self {
        Self {
            record,
            config,
            start_lock: tokio::sync::Mutex::new(()),
            state: Arc::new(Mutex::new(WorkerState::Stopped)),
            epochs: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Snapshot of the record with the current `running` flag.
    pub fn record(&self) -> ModelRecord {
        let mut record = self.record.clone();
        record.running = self.is_running();
        record
    }

    pub fn is_running(&self) -> bool {
        matches!(&*lock_state(&self.state), WorkerState::Running(bridge) if bridge.is_alive())
    }

    /// Pid of the live worker, if any.
    pub fn worker_pid(&self) -> Option<u32> {
        lock_state(&self.state)
            .bridge()
            .filter(|bridge| bridge.is_alive())
            .and_then(|bridge| bridge.pid())
    }

    /// Start the worker unless one is already running.
    ///
    /// Concurrent callers serialize on the start lock; the losers find the
    /// winner's bridge and return without starting another.
    pub async fn ensure_running(&self) -> Result<()> {
        let _start = self.start_lock.lock().await;

        let draining = match &*lock_state(&self.state) {
            WorkerState::Running(bridge) if bridge.is_alive() => return Ok(()),
            WorkerState::Stopping(bridge) if bridge.is_alive() => Some(Arc::clone(bridge)),
            _ => None,
        };
        if let Some(bridge) = draining {
            self.wait_for_exit(&bridge).await;
        }

        *lock_state(&self.state) = WorkerState::Starting;
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let spec = LaunchSpec {
            model_id: self.record.id.clone(),
            program: self.config.predict_worker.clone(),
            endpoint: IpcEndpoint::for_model(&self.config.socket_dir, &self.record.id),
            artifact: self.record.artifact_path(),
            connect_timeout: self.config.connect_timeout,
            call_timeout: self.config.call_timeout,
            epoch,
        };

        let state = Arc::clone(&self.state);
        let on_exit = move || {
            let mut state = lock_state(&state);
            if state.bridge().map(|bridge| bridge.epoch()) == Some(epoch) {
                *state = WorkerState::Stopped;
            }
        };

        match WorkerBridge::start(spec, on_exit).await {
            Ok(bridge) => {
                let mut state = lock_state(&self.state);
                // The supervisor cancels before it takes the state lock, so a
                // worker that already died is caught here and never published.
                *state = if bridge.is_alive() {
                    WorkerState::Running(Arc::new(bridge))
                } else {
                    WorkerState::Stopped
                };
                Ok(())
            }
            Err(e) => {
                *lock_state(&self.state) = WorkerState::Stopped;
                Err(e)
            }
        }
    }

    /// Forward `payload` to the running worker and return its reply.
    pub async fn call(&self, payload: Payload) -> Result<Payload> {
        let bridge = match &*lock_state(&self.state) {
            WorkerState::Running(bridge) => Arc::clone(bridge),
            _ => return Err(ServeError::WorkerUnavailable(self.record.id.clone())),
        };
        bridge.call(payload).await
    }

    /// Send the graceful stop signal. Returns without waiting for the exit.
    /// A start in progress completes first, then its worker is stopped.
    pub async fn stop(&self) -> Result<()> {
        let _start = self.start_lock.lock().await;
        self.signal_stop()
    }

    /// Caller holds `start_lock`, so the state is never `Starting`.
    fn signal_stop(&self) -> Result<()> {
        let mut state = lock_state(&self.state);
        let bridge = match &*state {
            WorkerState::Running(bridge) if bridge.is_alive() => Arc::clone(bridge),
            _ => return Ok(()),
        };
        bridge.stop()?;
        *state = WorkerState::Stopping(bridge);
        Ok(())
    }

    /// Stop the worker and wait until it is confirmed dead.
    pub async fn stop_and_wait(&self) -> Result<()> {
        let _start = self.start_lock.lock().await;
        self.signal_stop()?;
        let bridge = lock_state(&self.state).bridge().cloned();
        if let Some(bridge) = bridge {
            self.wait_for_exit(&bridge).await;
        }
        Ok(())
    }

    async fn wait_for_exit(&self, bridge: &WorkerBridge) {
        let grace = self.config.stop_grace;
        if tokio::time::timeout(grace, bridge.exited()).await.is_err() {
            warn!("model {} ignored stop for {grace:?}, killing it", self.record.id);
            if let Err(e) = bridge.kill() {
                warn!("could not kill model {}: {e}", self.record.id);
            }
            bridge.exited().await;
        }
    }
}

/// Concurrency-safe map of model id -> model, backed by the model directory.
#[derive(Debug)]
pub struct ModelRegistry {
    config: Arc<RegistryConfig>,
    models: Mutex<HashMap<String, Arc<Model>>>,
}

impl ModelRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config: Arc::new(config),
            models: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn models(&self) -> MutexGuard<'_, HashMap<String, Arc<Model>>> {
        self.models.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached(&self, id: &str) -> Option<Arc<Model>> {
        self.models().get(id).cloned()
    }

    fn model_dir(&self, id: &str) -> PathBuf {
        self.config.model_root.join(id)
    }

    /// Look a model up, loading its metadata from disk if it is not cached.
    /// Never starts a worker.
    pub async fn load(&self, id: &str) -> Result<Arc<Model>> {
        if let Some(model) = self.cached(id) {
            return Ok(model);
        }
        if !is_valid_id(id) {
            return Err(ServeError::NotFound(id.to_string()));
        }

        let dir = self.model_dir(id);
        let path = models::metadata_path(&dir, id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ServeError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut record: ModelRecord = serde_json::from_slice(&bytes)
            .map_err(|source| ServeError::InvalidMetadata { path, source })?;

        if !record.id.is_empty() && record.id != id {
            warn!("metadata for model {id} names model {}, using {id}", record.id);
        }
        record.id = id.to_string();
        record.directory = dir;
        record.trained = true;
        record.running = false;

        let model = Arc::new(Model::new(record, Arc::clone(&self.config)));
        // A racing loader may have inserted first; keep that one so every
        // caller shares the same start lock.
        let model = Arc::clone(self.models().entry(id.to_string()).or_insert(model));
        Ok(model)
    }

    /// Look a model up and make sure its worker is running.
    pub async fn get(&self, id: &str) -> Result<Arc<Model>> {
        let model = self.load(id).await?;
        model.ensure_running().await?;
        Ok(model)
    }

    /// Allocate a record for a new model. Nothing touches disk and the record
    /// is not cached until its fit succeeds.
    pub fn create(&self) -> ModelRecord {
        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.model_dir(&id);
        ModelRecord::unstarted(id, dir)
    }

    /// `create` a record and fit it on a background task.
    pub fn submit_fit(
        self: &Arc<Self>,
        request: TrainingRequest,
    ) -> (ModelRecord, JoinHandle<Result<ModelRecord>>) {
        let record = self.create();
        let job = FitJob::new(record.clone(), request);
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move { job.run(&registry).await });
        (record, handle)
    }

    /// Snapshot of every cached model, unordered.
    pub fn list(&self) -> Vec<ModelRecord> {
        let models: Vec<Arc<Model>> = self.models().values().cloned().collect();
        models.iter().map(|model| model.record()).collect()
    }

    /// Snapshot of the models whose worker is running.
    pub fn running(&self) -> Vec<ModelRecord> {
        self.list().into_iter().filter(|record| record.running).collect()
    }

    /// Load every model directory under the root. Entries that fail to load
    /// are logged and skipped. Returns the number of models loaded.
    pub async fn index_all(&self) -> Result<usize> {
        let root = &self.config.model_root;
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("model directory {} does not exist", root.display());
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut loaded = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("stopped scanning {}: {e}", root.display());
                    break;
                }
            };
            match entry.file_type().await {
                Ok(kind) if kind.is_dir() => {}
                _ => continue,
            }
            let Some(id) = entry.file_name().to_str().map(str::to_owned) else {
                warn!("skipping non-utf8 model directory {}", entry.path().display());
                continue;
            };
            match self.load(&id).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!("skipping model {id}: {e}"),
            }
        }

        info!("indexed {loaded} models from {}", root.display());
        Ok(loaded)
    }

    /// Send the graceful stop to a model's worker, without starting it first.
    pub async fn stop(&self, id: &str) -> Result<()> {
        self.load(id).await?.stop().await
    }

    /// Administrative delete: stop the worker, wait until it is gone, then
    /// evict the model from the cache. Files on disk are left alone.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let model = self
            .cached(id)
            .ok_or_else(|| ServeError::NotFound(id.to_string()))?;
        model.stop_and_wait().await?;
        self.models().remove(id);
        Ok(())
    }

    /// Stop every worker and wait for all of them to exit.
    pub async fn shutdown(&self) {
        let models: Vec<Arc<Model>> = self.models().values().cloned().collect();
        let results = join_all(models.iter().map(|model| model.stop_and_wait())).await;
        for (model, result) in models.iter().zip(results) {
            if let Err(e) = result {
                warn!("error stopping model {}: {e}", model.id());
            }
        }
    }
}

/// Ids name a single directory under the model root.
fn is_valid_id(id: &str) -> bool {
    let mut components = Path::new(id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !id.contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::worker::process_manager::WorkerProgram;
    use std::time::Duration;

    fn registry(root: &Path) -> ModelRegistry {
        let config = RegistryConfig::new(
            root,
            WorkerProgram::new("/bin/false"),
            WorkerProgram::new("/bin/false"),
        )
        .with_socket_dir(root.join("sockets"))
        .with_connect_timeout(Duration::from_millis(500));
        ModelRegistry::new(config)
    }

    fn write_metadata(root: &Path, id: &str, body: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{id}.json")), body).unwrap();
    }

    const VALID: &str = r#"{"model_id": "good", "metadata": {"name": "iris"},
        "performance": {"algorithm": "LogisticRegression", "score": 0.8}}"#;

    #[tokio::test]
    async fn test_unknown_model_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path());

        let err = registry.get("missing").await.unwrap_err();
        assert!(err.is_not_found(), "{err:?}");
    }

    #[tokio::test]
    async fn test_path_like_ids_are_not_found() {
        let root = tempfile::tempdir().unwrap();
        write_metadata(root.path(), "good", VALID);
        let registry = registry(root.path());

        for id in ["", "..", "../good", "good/../good", "/etc", "a/b"] {
            let err = registry.load(id).await.unwrap_err();
            assert!(err.is_not_found(), "{id:?}: {err:?}");
        }
    }

    #[tokio::test]
    async fn test_load_marks_trained_and_caches() {
        let root = tempfile::tempdir().unwrap();
        write_metadata(root.path(), "good", VALID);
        let registry = registry(root.path());

        let first = registry.load("good").await.unwrap();
        let record = first.record();
        assert!(record.trained);
        assert!(!record.running);
        assert_eq!(record.performance.score, 0.8);
        assert_eq!(record.directory(), root.path().join("good"));

        let second = registry.load("good").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_an_io_kind_error() {
        let root = tempfile::tempdir().unwrap();
        write_metadata(root.path(), "bad", "{not json");
        let registry = registry(root.path());

        let err = registry.load("bad").await.unwrap_err();
        assert!(matches!(err, ServeError::InvalidMetadata { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_index_all_skips_broken_entries() {
        let root = tempfile::tempdir().unwrap();
        write_metadata(root.path(), "good", VALID);
        write_metadata(root.path(), "bad", "{not json");
        std::fs::create_dir_all(root.path().join("empty")).unwrap();
        std::fs::write(root.path().join("stray.txt"), "x").unwrap();
        let registry = registry(root.path());

        assert_eq!(registry.index_all().await.unwrap(), 1);
        let ids: Vec<String> = registry.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn test_index_all_on_missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(&root.path().join("nope"));
        assert_eq!(registry.index_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_allocates_unique_uncached_records() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path());

        let a = registry.create();
        let b = registry.create();
        assert_ne!(a.id, b.id);
        assert_eq!(a.directory(), root.path().join(&a.id));
        assert!(!a.trained);
        assert!(!root.path().join(&a.id).exists());
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_failed_launch_leaves_model_stopped() {
        let root = tempfile::tempdir().unwrap();
        write_metadata(root.path(), "good", VALID);
        let registry = registry(root.path());

        // /bin/false exits before binding its socket.
        let err = registry.get("good").await.unwrap_err();
        assert!(matches!(err, ServeError::LaunchFailure { .. }), "{err:?}");

        let model = registry.load("good").await.unwrap();
        assert!(!model.is_running());
        let err = model.call(Payload::from("{}")).await.unwrap_err();
        assert!(matches!(err, ServeError::WorkerUnavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_connect_deadline_leaves_model_stopped_and_retryable() {
        let root = tempfile::tempdir().unwrap();
        write_metadata(root.path(), "good", VALID);
        let config = RegistryConfig::new(
            root.path(),
            WorkerProgram::new("/bin/sh").with_args(["-c", "exec sleep 30", "worker"]),
            WorkerProgram::new("/bin/false"),
        )
        .with_socket_dir(root.path().join("sockets"))
        .with_connect_timeout(Duration::from_millis(200));
        let registry = ModelRegistry::new(config);

        for _ in 0..2 {
            let err = registry.get("good").await.unwrap_err();
            assert!(matches!(err, ServeError::LaunchFailure { .. }), "{err:?}");
            let model = registry.load("good").await.unwrap();
            assert!(!model.is_running());
            assert_eq!(model.worker_pid(), None);
        }
    }

    #[tokio::test]
    async fn test_stop_and_remove_without_worker() {
        let root = tempfile::tempdir().unwrap();
        write_metadata(root.path(), "good", VALID);
        let registry = registry(root.path());

        registry.stop("good").await.unwrap();
        registry.remove("good").await.unwrap();
        assert!(registry.list().is_empty());
        assert!(registry.remove("good").await.unwrap_err().is_not_found());
    }
}
