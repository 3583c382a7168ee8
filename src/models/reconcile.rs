//! Rebuilds the installed view of the inventory from what is actually on disk.
//!
//! Layout: `storage_root/<organization>/<modelName>/` is an installed model if and only if it
//! contains the manifest file. This layout is the only persisted state.

use crate::error::{LocalmindError, Result};
use crate::models::descriptor::{split_identifier, ModelDescriptor};
use crate::models::inventory::InstalledModel;
use crate::models::status::ModelStatus;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Scan `storage_root` for installed models.
///
/// A missing root means nothing is installed yet. Unreadable or malformed entries are skipped.
pub fn scan_installed(storage_root: &Path, manifest_file: &str) -> Result<Vec<InstalledModel>> {
    if !storage_root.exists() {
        tracing::debug!(
            "Storage root {} does not exist, nothing installed",
            storage_root.display()
        );
        return Ok(Vec::new());
    }

    let organizations = fs::read_dir(storage_root).map_err(|e| {
        LocalmindError::Storage(format!(
            "Failed to read {}: {e}",
            storage_root.display()
        ))
    })?;

    let mut installed = Vec::new();

    for org_entry in organizations.flatten() {
        let org_path = org_entry.path();
        if !org_path.is_dir() {
            continue;
        }
        let Some(org_name) = org_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let Ok(models) = fs::read_dir(&org_path) else {
            tracing::warn!("Skipping unreadable directory {}", org_path.display());
            continue;
        };

        for model_entry in models.flatten() {
            let model_path = model_entry.path();
            if !model_path.is_dir() || !model_path.join(manifest_file).is_file() {
                continue;
            }
            let Some(model_name) = model_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let id = format!("{org_name}/{model_name}");
            if split_identifier(&id).is_none() {
                continue;
            }

            let size_bytes = directory_size(&model_path);
            let descriptor = ModelDescriptor::local(org_name, model_name, size_bytes);
            installed.push(InstalledModel::new(
                descriptor,
                model_path,
                ModelStatus::Installed,
            ));
        }
    }

    installed.sort_by(|a, b| a.id().cmp(b.id()));
    tracing::info!(
        "Found {} installed model(s) under {}",
        installed.len(),
        storage_root.display()
    );

    Ok(installed)
}

/// Recursive byte sum of every file below `path`; unreadable entries count as zero
#[must_use]
pub fn directory_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_root_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let installed = scan_installed(&temp_dir.path().join("absent"), "config.json").unwrap();
        assert!(installed.is_empty());
    }

    #[test]
    fn test_manifest_marks_installed() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        fs::create_dir_all(root.join("acme/foo")).unwrap();
        fs::write(root.join("acme/foo/config.json"), "{}").unwrap();
        fs::create_dir_all(root.join("acme/bar")).unwrap();

        let installed = scan_installed(root, "config.json").unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].id(), "acme/foo");
        assert!(installed[0].status().is_installed());
        assert_eq!(installed[0].path(), root.join("acme/foo"));
    }

    #[test]
    fn test_size_is_recursive() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        fs::create_dir_all(root.join("acme/foo/nested")).unwrap();
        fs::write(root.join("acme/foo/config.json"), "{}").unwrap();
        fs::write(root.join("acme/foo/model.safetensors"), vec![0u8; 100]).unwrap();
        fs::write(root.join("acme/foo/nested/extra.bin"), vec![0u8; 50]).unwrap();

        let installed = scan_installed(root, "config.json").unwrap();
        assert_eq!(installed[0].size_bytes(), Some(152));
        assert_eq!(installed[0].descriptor().size_bytes, Some(152));
    }

    #[test]
    fn test_stray_files_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        fs::write(root.join("README.md"), "not a model").unwrap();
        fs::create_dir_all(root.join("acme")).unwrap();
        fs::write(root.join("acme/config.json"), "{}").unwrap();
        fs::create_dir_all(root.join("acme/deep/model")).unwrap();
        fs::write(root.join("acme/deep/model/config.json"), "{}").unwrap();

        let installed = scan_installed(root, "config.json").unwrap();
        assert!(installed.is_empty());
    }

    #[test]
    fn test_custom_manifest_name() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        fs::create_dir_all(root.join("acme/foo")).unwrap();
        fs::write(root.join("acme/foo/config.json"), "{}").unwrap();
        fs::create_dir_all(root.join("acme/gguf")).unwrap();
        fs::write(root.join("acme/gguf/model.gguf"), "weights").unwrap();

        let installed = scan_installed(root, "model.gguf").unwrap();
        let ids: Vec<&str> = installed.iter().map(InstalledModel::id).collect();
        assert_eq!(ids, vec!["acme/gguf"]);
    }

    #[test]
    fn test_sorted_by_identifier() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        for id in ["zeta/one", "alpha/two", "alpha/one"] {
            fs::create_dir_all(root.join(id)).unwrap();
            fs::write(root.join(id).join("config.json"), "{}").unwrap();
        }

        let installed = scan_installed(root, "config.json").unwrap();
        let ids: Vec<&str> = installed.iter().map(InstalledModel::id).collect();
        assert_eq!(ids, vec!["alpha/one", "alpha/two", "zeta/one"]);
    }

    #[test]
    fn test_directory_size_of_missing_path() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(directory_size(&temp_dir.path().join("nope")), 0);
    }
}
