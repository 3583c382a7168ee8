use async_trait::async_trait;
use localmind::config::schema::{DownloadConfig, StorageConfig};
use localmind::download::{DownloadEvent, DownloadOrchestrator, ModelTransfer, ProgressReporter};
use localmind::models::{ModelDescriptor, ModelStatus};
use localmind::{LocalmindError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{timeout, Duration};

/// Transfer whose outcome is decided by the test, per model identifier
struct ScriptedTransfer {
    root: PathBuf,
    progress_steps: Vec<f64>,
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl ScriptedTransfer {
    fn new(root: &Path, progress_steps: Vec<f64>) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            progress_steps,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Release the in-flight fetch for `id`; returns false if none is waiting
    fn complete(&self, id: &str, success: bool) -> bool {
        let sender = self.pending.lock().unwrap().remove(id);
        sender.is_some_and(|tx| tx.send(success).is_ok())
    }

    fn forget(&self, id: &str) {
        self.pending.lock().unwrap().remove(id);
    }

    fn is_waiting(&self, id: &str) -> bool {
        self.pending.lock().unwrap().contains_key(id)
    }
}

#[async_trait]
impl ModelTransfer for ScriptedTransfer {
    async fn fetch(
        &self,
        model_id: &str,
        _file_patterns: &[String],
        progress: ProgressReporter,
    ) -> Result<PathBuf> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(model_id.to_string(), tx);

        for step in &self.progress_steps {
            progress.report(*step);
        }

        match rx.await {
            Ok(true) => {
                let path = self.root.join(model_id);
                std::fs::create_dir_all(&path)?;
                std::fs::write(path.join("config.json"), "{}")?;
                std::fs::write(path.join("model.safetensors"), vec![0u8; 64])?;
                Ok(path)
            }
            Ok(false) => Err(LocalmindError::Transport("connection reset".to_string())),
            Err(_) => Err(LocalmindError::Cancelled),
        }
    }
}

fn orchestrator(
    root: &Path,
    transfer: Arc<ScriptedTransfer>,
    settle_delay_ms: u64,
) -> DownloadOrchestrator {
    let download = DownloadConfig {
        settle_delay_ms,
        ..DownloadConfig::default()
    };
    DownloadOrchestrator::new(transfer, root.to_path_buf(), &StorageConfig::default(), &download)
}

/// Let spawned tasks run up to their next suspension point
async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}

async fn wait_terminal(rx: &mut broadcast::Receiver<DownloadEvent>, id: &str) -> DownloadEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if event.is_terminal() && event.model_id() == Some(id) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("Timeout waiting for terminal download event")
}

#[tokio::test]
async fn test_request_twice_starts_one_task() {
    let temp_dir = TempDir::new().unwrap();
    let transfer = ScriptedTransfer::new(temp_dir.path(), vec![]);
    let orchestrator = orchestrator(temp_dir.path(), transfer, 0);
    let descriptor = ModelDescriptor::from_id("acme/foo");

    assert!(orchestrator.request_download(&descriptor).unwrap());
    assert!(!orchestrator.request_download(&descriptor).unwrap());

    assert_eq!(orchestrator.active_downloads(), vec!["acme/foo"]);
    assert_eq!(orchestrator.snapshot().len(), 1);
    assert!(orchestrator.is_consistent());
}

#[tokio::test]
async fn test_progress_then_installed() {
    let temp_dir = TempDir::new().unwrap();
    let transfer = ScriptedTransfer::new(temp_dir.path(), vec![0.25, 0.5, 0.75]);
    let orchestrator = orchestrator(temp_dir.path(), transfer.clone(), 0);
    let mut rx = orchestrator.subscribe();

    orchestrator
        .request_download(&ModelDescriptor::from_id("acme/foo"))
        .unwrap();
    settle().await;
    assert!(transfer.complete("acme/foo", true));

    let mut progress = Vec::new();
    let terminal = timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await.unwrap() {
                DownloadEvent::Progress { progress: p, .. } => progress.push(p),
                event if event.is_terminal() => return event,
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    assert!(matches!(terminal, DownloadEvent::Installed { .. }));
    assert_eq!(progress, vec![0.25, 0.5, 0.75, 1.0]);

    let entry = orchestrator.get("acme/foo").unwrap();
    assert_eq!(entry.status(), &ModelStatus::Installed);
    assert_eq!(entry.path(), temp_dir.path().join("acme/foo"));
    assert_eq!(entry.size_bytes(), Some(66));
    assert!(orchestrator.active_downloads().is_empty());
}

#[tokio::test]
async fn test_settle_delay_shows_full_progress_first() {
    let temp_dir = TempDir::new().unwrap();
    let transfer = ScriptedTransfer::new(temp_dir.path(), vec![]);
    let orchestrator = orchestrator(temp_dir.path(), transfer.clone(), 200);
    let mut rx = orchestrator.subscribe();

    orchestrator
        .request_download(&ModelDescriptor::from_id("acme/foo"))
        .unwrap();
    settle().await;
    transfer.complete("acme/foo", true);

    timeout(Duration::from_secs(5), async {
        loop {
            if let DownloadEvent::Progress { progress, .. } = rx.recv().await.unwrap() {
                if progress >= 1.0 {
                    return;
                }
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(
        orchestrator.status_of("acme/foo"),
        Some(ModelStatus::Downloading(1.0))
    );
    assert!(orchestrator.is_consistent());

    let terminal = wait_terminal(&mut rx, "acme/foo").await;
    assert!(matches!(terminal, DownloadEvent::Installed { .. }));
}

#[tokio::test]
async fn test_cancel_during_settle_delay_removes_entry() {
    let temp_dir = TempDir::new().unwrap();
    let transfer = ScriptedTransfer::new(temp_dir.path(), vec![]);
    let orchestrator = orchestrator(temp_dir.path(), transfer.clone(), 5_000);

    orchestrator
        .request_download(&ModelDescriptor::from_id("acme/foo"))
        .unwrap();
    settle().await;
    transfer.complete("acme/foo", true);

    timeout(Duration::from_secs(5), async {
        while orchestrator.status_of("acme/foo") != Some(ModelStatus::Downloading(1.0)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    orchestrator.cancel("acme/foo").unwrap();
    settle().await;

    assert!(orchestrator.get("acme/foo").is_none());
    assert!(orchestrator.is_consistent());

    // Files already moved into place are discarded, so a rescan does not resurrect the model
    let model_dir = temp_dir.path().join("acme/foo");
    timeout(Duration::from_secs(5), async {
        while model_dir.exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Timeout waiting for cancelled files to be removed");

    assert_eq!(orchestrator.reconcile().await.unwrap(), 0);
    assert!(orchestrator.get("acme/foo").is_none());
}

#[tokio::test]
async fn test_failed_download_can_be_retried() {
    let temp_dir = TempDir::new().unwrap();
    let transfer = ScriptedTransfer::new(temp_dir.path(), vec![]);
    let orchestrator = orchestrator(temp_dir.path(), transfer.clone(), 0);
    let mut rx = orchestrator.subscribe();
    let descriptor = ModelDescriptor::from_id("acme/foo");

    orchestrator.request_download(&descriptor).unwrap();
    settle().await;
    transfer.complete("acme/foo", false);

    let terminal = wait_terminal(&mut rx, "acme/foo").await;
    assert!(matches!(terminal, DownloadEvent::Failed { .. }));
    assert!(matches!(
        orchestrator.status_of("acme/foo"),
        Some(ModelStatus::Error(_))
    ));

    assert!(orchestrator.request_download(&descriptor).unwrap());
    settle().await;
    transfer.complete("acme/foo", true);

    let terminal = wait_terminal(&mut rx, "acme/foo").await;
    assert!(matches!(terminal, DownloadEvent::Installed { .. }));
    assert_eq!(orchestrator.snapshot().len(), 1);
}

#[tokio::test]
async fn test_reconcile_example() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    std::fs::create_dir_all(root.join("acme/foo")).unwrap();
    std::fs::write(root.join("acme/foo/config.json"), "{}").unwrap();
    std::fs::create_dir_all(root.join("acme/bar")).unwrap();

    let transfer = ScriptedTransfer::new(root, vec![]);
    let orchestrator = orchestrator(root, transfer, 0);

    assert_eq!(orchestrator.reconcile().await.unwrap(), 1);

    let inventory = orchestrator.snapshot();
    assert_eq!(inventory.len(), 1);
    assert!(inventory.get("acme/foo").unwrap().status().is_installed());
    assert!(!inventory.contains("acme/bar"));
}

#[tokio::test]
async fn test_reconcile_keeps_in_flight_downloads() {
    let temp_dir = TempDir::new().unwrap();
    let transfer = ScriptedTransfer::new(temp_dir.path(), vec![]);
    let orchestrator = orchestrator(temp_dir.path(), transfer, 0);

    orchestrator
        .request_download(&ModelDescriptor::from_id("acme/foo"))
        .unwrap();
    orchestrator.reconcile().await.unwrap();

    assert!(orchestrator
        .status_of("acme/foo")
        .is_some_and(|s| s.is_downloading()));
    assert!(orchestrator.is_consistent());
}

#[tokio::test]
async fn test_delete_installed_model() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    std::fs::create_dir_all(root.join("acme/foo")).unwrap();
    std::fs::write(root.join("acme/foo/config.json"), "{}").unwrap();

    let transfer = ScriptedTransfer::new(root, vec![]);
    let orchestrator = orchestrator(root, transfer, 0);
    orchestrator.reconcile().await.unwrap();

    orchestrator.delete("acme/foo").await.unwrap();

    assert!(orchestrator.get("acme/foo").is_none());
    assert!(!root.join("acme").exists());
    assert_eq!(orchestrator.reconcile().await.unwrap(), 0);
}

#[tokio::test]
async fn test_delete_failure_keeps_entry() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    std::fs::create_dir_all(root.join("acme/foo")).unwrap();
    std::fs::write(root.join("acme/foo/config.json"), "{}").unwrap();

    let transfer = ScriptedTransfer::new(root, vec![]);
    let orchestrator = orchestrator(root, transfer, 0);
    orchestrator.reconcile().await.unwrap();

    // A plain file where the model directory was makes removal fail
    std::fs::remove_dir_all(root.join("acme/foo")).unwrap();
    std::fs::write(root.join("acme/foo"), "not a directory").unwrap();

    let err = orchestrator.delete("acme/foo").await.unwrap_err();
    assert!(matches!(err, LocalmindError::Storage(_)));
    assert!(orchestrator
        .status_of("acme/foo")
        .is_some_and(|s| s.is_installed()));
}

#[tokio::test]
async fn test_delete_requires_installed() {
    let temp_dir = TempDir::new().unwrap();
    let transfer = ScriptedTransfer::new(temp_dir.path(), vec![]);
    let orchestrator = orchestrator(temp_dir.path(), transfer, 0);

    orchestrator
        .request_download(&ModelDescriptor::from_id("acme/foo"))
        .unwrap();

    let err = orchestrator.delete("acme/foo").await.unwrap_err();
    assert!(matches!(err, LocalmindError::NotFound(_)));
    assert!(orchestrator.get("acme/foo").is_some());

    let err = orchestrator.delete("acme/missing").await.unwrap_err();
    assert!(matches!(err, LocalmindError::NotFound(_)));
}

#[tokio::test]
async fn test_catalog_models_report_available() {
    let temp_dir = TempDir::new().unwrap();
    let transfer = ScriptedTransfer::new(temp_dir.path(), vec![]);
    let orchestrator = orchestrator(temp_dir.path(), transfer, 0);

    orchestrator.set_available(vec![ModelDescriptor::from_id("acme/remote")]);

    assert_eq!(
        orchestrator.status_of("acme/remote"),
        Some(ModelStatus::Available)
    );
    assert_eq!(orchestrator.status_of("acme/unknown"), None);
}

/// Expected status per identifier, mirrored alongside the orchestrator
#[derive(Debug, Clone, Copy, PartialEq)]
enum Expected {
    Absent,
    Downloading,
    Installed,
    Error,
}

fn observed(orchestrator: &DownloadOrchestrator, id: &str) -> Expected {
    match orchestrator.status_of(id) {
        None | Some(ModelStatus::Available) => Expected::Absent,
        Some(ModelStatus::Downloading(_)) => Expected::Downloading,
        Some(ModelStatus::Installed) => Expected::Installed,
        Some(ModelStatus::Error(_)) => Expected::Error,
    }
}

#[tokio::test]
async fn test_randomized_operations_preserve_invariants() {
    const IDS: [&str; 3] = ["acme/a", "acme/b", "beta/c"];

    let temp_dir = TempDir::new().unwrap();
    let transfer = ScriptedTransfer::new(temp_dir.path(), vec![0.5]);
    let orchestrator = orchestrator(temp_dir.path(), transfer.clone(), 0);
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut expected: HashMap<&str, Expected> = IDS.iter().map(|id| (*id, Expected::Absent)).collect();

    for step in 0..300 {
        let id = IDS[rng.gen_range(0..IDS.len())];
        let before = expected[id];

        match rng.gen_range(0..5) {
            0 => {
                let launched = orchestrator
                    .request_download(&ModelDescriptor::from_id(id))
                    .unwrap();
                let should_launch = matches!(before, Expected::Absent | Expected::Error);
                assert_eq!(launched, should_launch, "step {step}: request {id} from {before:?}");
                if launched {
                    expected.insert(id, Expected::Downloading);
                    settle().await;
                }
            }
            1 => {
                let result = orchestrator.cancel(id);
                if before == Expected::Downloading {
                    assert!(result.is_ok(), "step {step}: cancel {id}");
                    transfer.forget(id);
                    expected.insert(id, Expected::Absent);
                } else {
                    assert!(matches!(result, Err(LocalmindError::NotFound(_))));
                }
            }
            op @ (2 | 3) => {
                if before == Expected::Downloading && transfer.is_waiting(id) {
                    let success = op == 2;
                    // Fresh receiver so earlier terminal events for this id are not seen
                    let mut rx = orchestrator.subscribe();
                    assert!(transfer.complete(id, success));
                    let terminal = wait_terminal(&mut rx, id).await;
                    if success {
                        assert!(matches!(terminal, DownloadEvent::Installed { .. }));
                        expected.insert(id, Expected::Installed);
                    } else {
                        assert!(matches!(terminal, DownloadEvent::Failed { .. }));
                        expected.insert(id, Expected::Error);
                    }
                }
            }
            _ => {
                let result = orchestrator.delete(id).await;
                if before == Expected::Installed {
                    assert!(result.is_ok(), "step {step}: delete {id}");
                    expected.insert(id, Expected::Absent);
                } else {
                    assert!(result.is_err());
                }
            }
        }

        for id in IDS {
            assert_eq!(observed(&orchestrator, id), expected[id], "step {step}: status of {id}");
        }
        assert!(orchestrator.is_consistent(), "step {step}: registry out of sync");
    }
}
