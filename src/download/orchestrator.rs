//! Per-model download tasks and their reconciliation with the inventory.
//!
//! The inventory and the task registry share one lock, so a `Downloading` entry and its
//! registered task are always added and removed together. No lock is held across an await.

use crate::config::schema::{DownloadConfig, StorageConfig};
use crate::download::{DownloadEvent, ModelTransfer, ProgressReporter};
use crate::error::{LocalmindError, Result};
use crate::models::{
    directory_size, scan_installed, InstalledModel, Inventory, ModelDescriptor, ModelStatus,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

/// Cancellable unit of work bound to one model identifier
struct DownloadTask {
    task_id: u64,
    cancel_token: CancellationToken,
}

#[derive(Default)]
struct State {
    inventory: Inventory,
    tasks: HashMap<String, DownloadTask>,
}

impl State {
    /// Whether `task_id` is still the registered task for `id`
    fn owns(&self, id: &str, task_id: u64) -> bool {
        self.tasks.get(id).is_some_and(|t| t.task_id == task_id)
    }
}

struct Shared {
    state: Mutex<State>,
    transfer: Arc<dyn ModelTransfer>,
    storage_root: PathBuf,
    manifest_file: String,
    file_patterns: Vec<String>,
    settle_delay: Duration,
    events: broadcast::Sender<DownloadEvent>,
    next_task_id: AtomicU64,
}

/// Drives independent, cancellable downloads and keeps inventory status in sync with them
#[derive(Clone)]
pub struct DownloadOrchestrator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DownloadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOrchestrator")
            .field("storage_root", &self.shared.storage_root)
            .field("active", &self.active_downloads())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: DownloadEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn apply_progress(&self, id: &str, task_id: u64, cancel: &CancellationToken, fraction: f64) {
        {
            let mut state = self.lock();
            if cancel.is_cancelled() || !state.owns(id, task_id) {
                return;
            }
            match state.inventory.get_mut(id) {
                Some(entry) if entry.status().is_downloading() => {
                    entry.set_status(ModelStatus::Downloading(fraction));
                }
                _ => return,
            }
        }

        tracing::debug!("{id}: {:.1}%", fraction * 100.0);
        self.emit(DownloadEvent::Progress {
            model_id: id.to_string(),
            progress: fraction,
        });
    }

    /// Commit a task's outcome. A cancelled task commits nothing.
    ///
    /// Returns whether the model was recorded as installed.
    fn finish(
        &self,
        id: &str,
        task_id: u64,
        cancel: &CancellationToken,
        outcome: Result<(PathBuf, u64)>,
    ) -> bool {
        let event = {
            let mut state = self.lock();
            if !state.owns(id, task_id) {
                // cancel() already deregistered us and removed the entry
                tracing::debug!("{id}: task {task_id} exited after cancellation");
                return false;
            }
            state.tasks.remove(id);

            let outcome = if cancel.is_cancelled() {
                Err(LocalmindError::Cancelled)
            } else {
                outcome
            };

            match outcome {
                Err(LocalmindError::Cancelled) => {
                    state.inventory.remove(id);
                    DownloadEvent::Cancelled {
                        model_id: id.to_string(),
                    }
                }
                Ok((path, size_bytes)) => {
                    if let Some(entry) = state.inventory.get_mut(id) {
                        entry.set_path(path.clone());
                        entry.set_size_bytes(Some(size_bytes));
                        entry.set_status(ModelStatus::Installed);
                    }
                    DownloadEvent::Installed {
                        model_id: id.to_string(),
                        path,
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    if let Some(entry) = state.inventory.get_mut(id) {
                        entry.set_status(ModelStatus::Error(message.clone()));
                    }
                    DownloadEvent::Failed {
                        model_id: id.to_string(),
                        error: message,
                    }
                }
            }
        };

        match &event {
            DownloadEvent::Installed { path, .. } => {
                tracing::info!("Installed {id} at {}", path.display());
            }
            DownloadEvent::Failed { error, .. } => tracing::error!("Download of {id} failed: {error}"),
            _ => tracing::info!("Download of {id} cancelled"),
        }
        let installed = matches!(event, DownloadEvent::Installed { .. });
        self.emit(event);
        installed
    }

    /// Remove files a cancelled task already moved into place, unless a newer task owns `id`
    async fn discard(&self, id: &str, path: PathBuf) {
        if self.lock().tasks.contains_key(id) {
            return;
        }

        let root = self.storage_root.clone();
        let removed = path.clone();
        let result = tokio::task::spawn_blocking(move || remove_model_dir(&root, &removed)).await;
        match result {
            Ok(Ok(())) => tracing::debug!("Discarded {} after cancellation", path.display()),
            Ok(Err(e)) => tracing::warn!("{e}"),
            Err(e) => tracing::warn!("Discard task for {id} failed: {e}"),
        }
    }
}

impl DownloadOrchestrator {
    /// Create an orchestrator writing into `storage_root`
    #[must_use]
    pub fn new(
        transfer: Arc<dyn ModelTransfer>,
        storage_root: PathBuf,
        storage: &StorageConfig,
        download: &DownloadConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                transfer,
                storage_root,
                manifest_file: storage.manifest_file.clone(),
                file_patterns: download.file_patterns.clone(),
                settle_delay: download.settle_delay(),
                events,
                next_task_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to download change notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.shared.events.subscribe()
    }

    #[must_use]
    pub fn storage_root(&self) -> &Path {
        &self.shared.storage_root
    }

    /// Start downloading `descriptor`.
    ///
    /// Returns `false` without doing anything if the model is already installed or downloading.
    /// An entry in `Error` is reset to `Downloading(0)` and reused. Must be called from within
    /// a tokio runtime.
    pub fn request_download(&self, descriptor: &ModelDescriptor) -> Result<bool> {
        let id = descriptor.id.clone();
        let relative = descriptor
            .relative_path()
            .ok_or_else(|| LocalmindError::InvalidIdentifier(id.clone()))?;

        {
            let mut state = self.shared.lock();

            match state.inventory.get_mut(&id) {
                Some(entry) if entry.status().is_installed() || entry.status().is_downloading() => {
                    tracing::debug!("{id} is already {}, ignoring request", entry.status());
                    return Ok(false);
                }
                Some(entry) => {
                    tracing::info!("Retrying download of {id}");
                    entry.set_status(ModelStatus::Downloading(0.0));
                }
                None => {
                    state.inventory.insert(InstalledModel::new(
                        descriptor.clone(),
                        self.shared.storage_root.join(relative),
                        ModelStatus::Downloading(0.0),
                    ));
                }
            }

            let task_id = self.shared.next_task_id.fetch_add(1, Ordering::Relaxed);
            let cancel_token = CancellationToken::new();
            // Registered before the task can observe the lock, so it always finds itself.
            // The task is detached and exits through its token.
            tokio::spawn(run_download(
                Arc::clone(&self.shared),
                id.clone(),
                task_id,
                cancel_token.clone(),
            ));
            state.tasks.insert(
                id.clone(),
                DownloadTask {
                    task_id,
                    cancel_token,
                },
            );
        }

        tracing::info!("Starting download of {id}");
        self.shared.emit(DownloadEvent::Started { model_id: id });
        Ok(true)
    }

    /// Cancel an in-flight download and drop its inventory entry entirely
    pub fn cancel(&self, id: &str) -> Result<()> {
        {
            let mut state = self.shared.lock();
            let task = state
                .tasks
                .remove(id)
                .ok_or_else(|| LocalmindError::NotFound(format!("No active download for '{id}'")))?;
            task.cancel_token.cancel();
            state.inventory.remove(id);
        }

        tracing::info!("Cancellation requested for {id}");
        self.shared.emit(DownloadEvent::Cancelled {
            model_id: id.to_string(),
        });
        Ok(())
    }

    /// Remove an installed model from disk and from the inventory.
    ///
    /// If the files cannot be removed the inventory is left untouched.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let path = {
            let state = self.shared.lock();
            let entry = state
                .inventory
                .get(id)
                .filter(|e| e.status().is_installed())
                .ok_or_else(|| LocalmindError::NotFound(format!("Model '{id}' is not installed")))?;
            entry.path().to_path_buf()
        };

        let root = self.shared.storage_root.clone();
        let removed = path.clone();
        tokio::task::spawn_blocking(move || remove_model_dir(&root, &removed))
            .await
            .map_err(|e| LocalmindError::Storage(format!("Delete task failed: {e}")))??;

        {
            let mut state = self.shared.lock();
            if state.inventory.get(id).is_some_and(|e| e.status().is_installed()) {
                state.inventory.remove(id);
            }
        }

        tracing::info!("Deleted {id} from {}", path.display());
        self.shared.emit(DownloadEvent::Deleted {
            model_id: id.to_string(),
        });
        Ok(())
    }

    /// Rebuild the installed subset of the inventory from the storage root.
    ///
    /// Returns the number of installed models.
    pub async fn reconcile(&self) -> Result<usize> {
        let root = self.shared.storage_root.clone();
        let manifest = self.shared.manifest_file.clone();
        let records = tokio::task::spawn_blocking(move || scan_installed(&root, &manifest))
            .await
            .map_err(|e| LocalmindError::Storage(format!("Reconcile task failed: {e}")))??;

        let installed = self.shared.lock().inventory.replace_installed(records);
        tracing::info!(
            "Reconciled {} with {installed} installed model(s)",
            self.shared.storage_root.display()
        );

        self.shared.emit(DownloadEvent::Reconciled { installed });
        Ok(installed)
    }

    /// Record the models listed by the catalog
    pub fn set_available(&self, descriptors: Vec<ModelDescriptor>) {
        self.shared.lock().inventory.set_available(descriptors);
    }

    /// Point-in-time copy of the inventory
    #[must_use]
    pub fn snapshot(&self) -> Inventory {
        self.shared.lock().inventory.clone()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<InstalledModel> {
        self.shared.lock().inventory.get(id).cloned()
    }

    #[must_use]
    pub fn status_of(&self, id: &str) -> Option<ModelStatus> {
        self.shared.lock().inventory.status_of(id)
    }

    /// Identifiers with a registered download task, sorted
    #[must_use]
    pub fn active_downloads(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.lock().tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether every registered task has a `Downloading` entry and vice versa
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let state = self.shared.lock();
        let downloading = state.inventory.downloading();
        downloading.len() == state.tasks.len()
            && downloading.iter().all(|e| state.tasks.contains_key(e.id()))
    }
}

async fn run_download(shared: Arc<Shared>, id: String, task_id: u64, cancel: CancellationToken) {
    let (progress, mut progress_rx) = ProgressReporter::channel();

    let fetched = {
        let fetch = shared.transfer.fetch(&id, &shared.file_patterns, progress);
        tokio::pin!(fetch);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break Err(LocalmindError::Cancelled),
                Some(fraction) = progress_rx.recv() => {
                    shared.apply_progress(&id, task_id, &cancel, fraction);
                }
                result = &mut fetch => break result,
            }
        }
    };

    // Progress emitted right before completion is applied in order
    while let Ok(fraction) = progress_rx.try_recv() {
        shared.apply_progress(&id, task_id, &cancel, fraction);
    }

    let persisted = fetched.as_ref().ok().cloned();
    let outcome = match fetched {
        Ok(path) => settle(&shared, &id, task_id, &cancel, path).await,
        Err(e) => Err(e),
    };

    let installed = shared.finish(&id, task_id, &cancel, outcome);
    if let Some(path) = persisted.filter(|_| !installed && cancel.is_cancelled()) {
        shared.discard(&id, path).await;
    }
}

/// Show the 100% frame for the settle delay, then measure the installed size
async fn settle(
    shared: &Shared,
    id: &str,
    task_id: u64,
    cancel: &CancellationToken,
    path: PathBuf,
) -> Result<(PathBuf, u64)> {
    shared.apply_progress(id, task_id, cancel, 1.0);

    if !shared.settle_delay.is_zero() {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(LocalmindError::Cancelled),
            () = tokio::time::sleep(shared.settle_delay) => {}
        }
    }

    let measured = path.clone();
    let size_bytes = tokio::task::spawn_blocking(move || directory_size(&measured))
        .await
        .unwrap_or(0);

    Ok((path, size_bytes))
}

/// Delete a model directory and its organization directory if that is left empty
fn remove_model_dir(storage_root: &Path, path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("{} was already gone", path.display());
        }
        Err(e) => {
            return Err(LocalmindError::Storage(format!(
                "Failed to delete {}: {e}",
                path.display()
            )))
        }
    }

    if let Some(org_dir) = path.parent().filter(|p| *p != storage_root) {
        let is_empty = fs::read_dir(org_dir).is_ok_and(|mut entries| entries.next().is_none());
        if is_empty {
            let _ = fs::remove_dir(org_dir);
        }
    }

    Ok(())
}
