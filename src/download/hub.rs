use crate::download::{ModelTransfer, ProgressReporter};
use crate::error::{LocalmindError, Result};
use crate::models::split_identifier;
use async_trait::async_trait;
use futures_util::StreamExt;
use hf_hub::api::tokio::Api;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;

/// Hidden first-level directory holding in-flight transfers
pub const STAGING_DIR: &str = ".partial";

/// Transfers model repositories from the Hugging Face Hub into `storage_root/org/name`
pub struct HubTransfer {
    api: Api,
    client: reqwest::Client,
    storage_root: PathBuf,
    manifest_file: String,
    min_free_space_mb: u64,
    staging_counter: AtomicU64,
}

impl std::fmt::Debug for HubTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubTransfer")
            .field("storage_root", &self.storage_root)
            .field("manifest_file", &self.manifest_file)
            .finish_non_exhaustive()
    }
}

/// Staging directory removed on drop unless persisted
struct StagingDir {
    path: PathBuf,
    keep: bool,
}

impl StagingDir {
    fn create(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&path).map_err(|e| {
            LocalmindError::Storage(format!("Failed to create {}: {e}", path.display()))
        })?;
        Ok(Self { path, keep: false })
    }

    /// Move the staged files onto `target`, replacing any stale directory there
    fn persist(mut self, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.exists() {
            fs::remove_dir_all(target).map_err(|e| {
                LocalmindError::Storage(format!("Failed to replace {}: {e}", target.display()))
            })?;
        }
        fs::rename(&self.path, target).map_err(|e| {
            LocalmindError::Storage(format!(
                "Failed to move download into {}: {e}",
                target.display()
            ))
        })?;
        self.keep = true;
        Ok(())
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.keep || !self.path.exists() {
            return;
        }

        tracing::debug!("Removing staging directory {}", self.path.display());
        let path = std::mem::take(&mut self.path);
        // Off the async worker when dropped inside the runtime, e.g. by a cancelled fetch
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || fs::remove_dir_all(path));
            }
            Err(_) => {
                let _ = fs::remove_dir_all(path);
            }
        }
    }
}

/// Persist `staging` onto `target` on the blocking pool
async fn persist_staged(staging: StagingDir, target: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || staging.persist(&target))
        .await
        .map_err(|e| LocalmindError::Storage(format!("Persist task failed: {e}")))?
}

impl HubTransfer {
    /// Create new transfer rooted at `storage_root`
    pub fn new(storage_root: PathBuf, manifest_file: &str, min_free_space_mb: u64) -> Result<Self> {
        let api = Api::new().map_err(|e| {
            LocalmindError::Transport(format!("Failed to initialize HuggingFace API: {e}"))
        })?;

        Ok(Self {
            api,
            client: reqwest::Client::new(),
            storage_root,
            manifest_file: manifest_file.to_string(),
            min_free_space_mb,
            staging_counter: AtomicU64::new(0),
        })
    }

    /// Download one file into `dest`, reporting overall progress for slot `index` of `count`
    async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        index: usize,
        count: usize,
        progress: &ProgressReporter,
    ) -> Result<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LocalmindError::Transport(format!("Failed to start download: {e}")))?;

        if !response.status().is_success() {
            return Err(LocalmindError::Transport(format!(
                "Download failed with status {}: {url}",
                response.status()
            )));
        }

        let total = response.content_length();
        if let Some(total) = total {
            self.check_disk_space(total)?;
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = tokio::fs::File::create(dest).await.map_err(|e| {
            LocalmindError::Storage(format!("Failed to create {}: {e}", dest.display()))
        })?;
        let mut file = tokio::io::BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut received = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| LocalmindError::Transport(format!("Download error: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| LocalmindError::Storage(format!("Failed to write chunk: {e}")))?;

            received += chunk.len() as u64;
            if let Some(total) = total.filter(|t| *t > 0) {
                progress.report(overall_fraction(index, count, received, total));
            }
        }

        file.flush()
            .await
            .map_err(|e| LocalmindError::Storage(format!("Failed to flush file: {e}")))?;

        progress.report(overall_fraction(index + 1, count, 0, 1));
        Ok(received)
    }

    /// Check if enough disk space is available for `required_bytes` plus the configured margin
    fn check_disk_space(&self, required_bytes: u64) -> Result<()> {
        let stats = nix::sys::statvfs::statvfs(&self.storage_root)
            .map_err(|e| LocalmindError::Storage(format!("Failed to check disk space: {e}")))?;

        #[allow(clippy::unnecessary_cast)]
        let available_bytes = stats.blocks_available() as u64 * stats.fragment_size() as u64;
        let required_with_buffer = required_bytes + self.min_free_space_mb * 1_024 * 1_024;

        if available_bytes < required_with_buffer {
            return Err(LocalmindError::Storage(format!(
                "Not enough disk space: {} MB required, {} MB available",
                required_with_buffer / (1_024 * 1_024),
                available_bytes / (1_024 * 1_024)
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl ModelTransfer for HubTransfer {
    async fn fetch(
        &self,
        model_id: &str,
        file_patterns: &[String],
        progress: ProgressReporter,
    ) -> Result<PathBuf> {
        let (org, name) = split_identifier(model_id)
            .ok_or_else(|| LocalmindError::InvalidIdentifier(model_id.to_string()))?;

        let repo = self.api.model(model_id.to_string());
        let info = repo
            .info()
            .await
            .map_err(|e| LocalmindError::Transport(format!("Failed to list {model_id}: {e}")))?;

        let files = select_files(
            info.siblings.into_iter().map(|s| s.rfilename).collect(),
            file_patterns,
            &self.manifest_file,
        );
        if !files.iter().any(|f| f == &self.manifest_file) {
            return Err(LocalmindError::NotFound(format!(
                "{model_id} has no {}, it cannot be used as a local model",
                self.manifest_file
            )));
        }

        fs::create_dir_all(&self.storage_root)?;
        let staging_name = format!(
            "{org}--{name}-{}",
            self.staging_counter.fetch_add(1, Ordering::Relaxed)
        );
        let staging = StagingDir::create(self.storage_root.join(STAGING_DIR).join(staging_name))?;

        tracing::info!("Downloading {} file(s) of {model_id}", files.len());

        let mut total_bytes = 0u64;
        for (index, file) in files.iter().enumerate() {
            if Path::new(file)
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
            {
                tracing::warn!("Skipping suspicious repository path {file}");
                continue;
            }

            let dest = staging.path.join(file);
            total_bytes += self
                .download_file(&repo.url(file), &dest, index, files.len(), &progress)
                .await?;
        }

        let target = self.storage_root.join(org).join(name);
        persist_staged(staging, target.clone()).await?;

        tracing::info!(
            "Downloaded {model_id} ({}) into {}",
            crate::download::format_bytes(total_bytes),
            target.display()
        );

        Ok(target)
    }
}

/// Files to transfer: those matching any pattern, plus the manifest, manifest last
fn select_files(all: Vec<String>, patterns: &[String], manifest_file: &str) -> Vec<String> {
    let mut files: Vec<String> = all
        .into_iter()
        .filter(|f| f == manifest_file || patterns.iter().any(|p| wildcard_match(p, f)))
        .collect();
    files.sort_by_key(|f| (f == manifest_file, f.clone()));
    files
}

#[allow(clippy::cast_precision_loss)]
fn overall_fraction(index: usize, count: usize, received: u64, total: u64) -> f64 {
    if count == 0 {
        return 1.0;
    }
    let within = (received as f64 / total.max(1) as f64).min(1.0);
    (index as f64 + within) / count as f64
}

/// Glob-style match where `*` matches any run of characters (including none)
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] != '*' && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
