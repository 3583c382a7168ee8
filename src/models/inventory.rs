use crate::models::descriptor::ModelDescriptor;
use crate::models::status::ModelStatus;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Mutable per-model record owned by the [`Inventory`].
///
/// Status and path are only written by the download orchestrator and the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstalledModel {
    descriptor: ModelDescriptor,
    path: PathBuf,
    status: ModelStatus,
    size_bytes: Option<u64>,
}

impl InstalledModel {
    pub(crate) fn new(descriptor: ModelDescriptor, path: PathBuf, status: ModelStatus) -> Self {
        let size_bytes = descriptor.size_bytes;
        Self {
            descriptor,
            path,
            status,
            size_bytes,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    #[must_use]
    pub const fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn status(&self) -> &ModelStatus {
        &self.status
    }

    #[must_use]
    pub const fn size_bytes(&self) -> Option<u64> {
        self.size_bytes
    }

    pub(crate) fn set_status(&mut self, status: ModelStatus) {
        self.status = status;
    }

    pub(crate) fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    pub(crate) fn set_size_bytes(&mut self, size_bytes: Option<u64>) {
        self.size_bytes = size_bytes;
    }
}

/// In-memory record set of remote-available and local models, keyed by identifier
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    entries: BTreeMap<String, InstalledModel>,
    available: Vec<ModelDescriptor>,
}

impl Inventory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&InstalledModel> {
        self.entries.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Status of a model: its entry's status, `Available` for catalog-only models
    #[must_use]
    pub fn status_of(&self, id: &str) -> Option<ModelStatus> {
        self.entries.get(id).map_or_else(
            || {
                self.available
                    .iter()
                    .any(|d| d.id == id)
                    .then_some(ModelStatus::Available)
            },
            |entry| Some(entry.status.clone()),
        )
    }

    /// All entries, ordered by identifier
    pub fn entries(&self) -> impl Iterator<Item = &InstalledModel> {
        self.entries.values()
    }

    /// Installed entries, ordered by identifier
    #[must_use]
    pub fn installed(&self) -> Vec<&InstalledModel> {
        self.entries
            .values()
            .filter(|e| e.status.is_installed())
            .collect()
    }

    #[must_use]
    pub fn downloading(&self) -> Vec<&InstalledModel> {
        self.entries
            .values()
            .filter(|e| e.status.is_downloading())
            .collect()
    }

    /// Models listed by the catalog
    #[must_use]
    pub fn available(&self) -> &[ModelDescriptor] {
        &self.available
    }

    pub fn set_available(&mut self, descriptors: Vec<ModelDescriptor>) {
        self.available = descriptors;
    }

    pub(crate) fn insert(&mut self, record: InstalledModel) {
        self.entries.insert(record.id().to_string(), record);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<InstalledModel> {
        self.entries.remove(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut InstalledModel> {
        self.entries.get_mut(id)
    }

    /// Replace the installed subset with `records`.
    ///
    /// Downloading and Error entries are kept and win over an on-disk record with the same id.
    /// Returns the number of installed entries afterwards.
    pub(crate) fn replace_installed(&mut self, records: Vec<InstalledModel>) -> usize {
        self.entries.retain(|_, e| !e.status.is_installed());
        for record in records {
            if !self.entries.contains_key(record.id()) {
                self.insert(record);
            }
        }
        self.installed().len()
    }
}
