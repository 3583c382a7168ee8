use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct StorageConfig {
    /// Root of the `organization/modelName/` tree. Defaults to the XDG data dir.
    pub models_dir: Option<PathBuf>,
    /// Sentinel file marking a complete model directory
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DownloadConfig {
    #[serde(default = "default_file_patterns")]
    pub file_patterns: Vec<String>,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_min_free_space_mb")]
    pub min_free_space_mb: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct CatalogConfig {
    #[serde(default = "default_hub_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_author")]
    pub author: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_catalog_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct InferenceConfig {
    /// Base URL of an OpenAI-compatible server (llama-server, mlx_lm.server, ...)
    #[serde(default = "default_inference_endpoint")]
    pub endpoint: String,
    pub system_prompt: Option<String>,
    #[serde(default = "default_inference_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct GenerationConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

// Default value functions
fn default_manifest_file() -> String {
    "config.json".to_string()
}
fn default_file_patterns() -> Vec<String> {
    ["*.safetensors", "*.json", "tokenizer.model", "*.txt"]
        .iter()
        .map(ToString::to_string)
        .collect()
}
const fn default_settle_delay_ms() -> u64 {
    300
}
const fn default_min_free_space_mb() -> u64 {
    100
}
fn default_hub_endpoint() -> String {
    "https://huggingface.co".to_string()
}
fn default_author() -> String {
    "mlx-community".to_string()
}
const fn default_page_size() -> u32 {
    50
}
const fn default_max_pages() -> u32 {
    4
}
const fn default_catalog_timeout_secs() -> u64 {
    30
}
fn default_inference_endpoint() -> String {
    "http://127.0.0.1:8080/v1".to_string()
}
const fn default_inference_timeout_secs() -> u64 {
    300
}
const fn default_temperature() -> f32 {
    0.6
}
const fn default_top_p() -> f32 {
    0.9
}
const fn default_max_tokens() -> u32 {
    1024
}
const fn default_flush_interval_ms() -> u64 {
    100
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            models_dir: None,
            manifest_file: default_manifest_file(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            file_patterns: default_file_patterns(),
            settle_delay_ms: default_settle_delay_ms(),
            min_free_space_mb: default_min_free_space_mb(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            endpoint: default_hub_endpoint(),
            author: default_author(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            timeout_secs: default_catalog_timeout_secs(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_inference_endpoint(),
            system_prompt: None,
            timeout_secs: default_inference_timeout_secs(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl DownloadConfig {
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl GenerationConfig {
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}
