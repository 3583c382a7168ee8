pub mod hub;

use crate::error::Result;
use crate::models::{Collection, ModelDescriptor};
use async_trait::async_trait;

pub use hub::HubCatalog;

/// Filter for [`CatalogClient::list_models`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelQuery {
    /// Restrict to the models of one collection
    pub collection: Option<String>,
    /// Free-text search on model identifiers
    pub search: Option<String>,
}

impl ModelQuery {
    #[must_use]
    pub fn collection(slug: impl Into<String>) -> Self {
        Self {
            collection: Some(slug.into()),
            search: None,
        }
    }

    #[must_use]
    pub fn search(text: impl Into<String>) -> Self {
        Self {
            collection: None,
            search: Some(text.into()),
        }
    }
}

/// Remote listing of models and collections.
///
/// Fails with `Transport` on network errors and `Decode` on malformed responses.
/// Pagination is handled by the implementation.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn list_collections(&self) -> Result<Vec<Collection>>;

    async fn list_models(&self, query: &ModelQuery) -> Result<Vec<ModelDescriptor>>;
}
