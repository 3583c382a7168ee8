use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Immutable description of a model artifact, from the catalog or synthesized from disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Stable identifier, `organization/modelName`
    pub id: String,
    pub name: String,
    pub author: String,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub likes: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A named group of models published on the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    /// Catalog slug used to filter `list_models`
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub model_ids: Vec<String>,
}

impl ModelDescriptor {
    /// Synthesize a descriptor from an identifier alone; catalog fields are defaulted
    #[must_use]
    pub fn from_id(id: &str) -> Self {
        let (author, name) = split_identifier(id).unwrap_or(("", id));
        Self {
            id: id.to_string(),
            name: name.to_string(),
            author: author.to_string(),
            downloads: 0,
            likes: 0,
            last_modified: None,
            size_bytes: None,
            collections: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// Synthesize a descriptor for a model found on disk
    #[must_use]
    pub fn local(organization: &str, model_name: &str, size_bytes: u64) -> Self {
        Self {
            size_bytes: Some(size_bytes),
            ..Self::from_id(&format!("{organization}/{model_name}"))
        }
    }

    /// Path of this model relative to the storage root, if the identifier is well formed
    #[must_use]
    pub fn relative_path(&self) -> Option<PathBuf> {
        split_identifier(&self.id).map(|(org, name)| PathBuf::from(org).join(name))
    }
}

/// Split `organization/modelName` into its two path components.
///
/// Rejects anything that would not map onto exactly two plain directory names.
#[must_use]
pub fn split_identifier(id: &str) -> Option<(&str, &str)> {
    let (org, name) = id.split_once('/')?;
    let valid = |part: &str| {
        !part.is_empty()
            && part != "."
            && part != ".."
            && !part.contains(['/', '\\'])
            && !part.starts_with('.')
    };

    (valid(org) && valid(name)).then_some((org, name))
}
