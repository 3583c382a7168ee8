use crate::catalog::{CatalogClient, ModelQuery};
use crate::config::schema::CatalogConfig;
use crate::error::{LocalmindError, Result};
use crate::models::{Collection, ModelDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::LINK;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// Catalog backed by the Hugging Face Hub JSON API
pub struct HubCatalog {
    client: reqwest::Client,
    endpoint: String,
    author: String,
    page_size: u32,
    max_pages: u32,
}

impl std::fmt::Debug for HubCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubCatalog")
            .field("client", &"Client { ... }")
            .field("endpoint", &self.endpoint)
            .field("author", &self.author)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HubModel {
    id: String,
    author: Option<String>,
    #[serde(default)]
    downloads: u64,
    #[serde(default)]
    likes: u64,
    last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HubCollection {
    slug: String,
    title: String,
    description: Option<String>,
    #[serde(default)]
    items: Vec<HubCollectionItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HubCollectionItem {
    id: String,
    #[serde(rename = "type")]
    item_type: String,
    author: Option<String>,
    #[serde(default)]
    downloads: u64,
    #[serde(default)]
    likes: u64,
    last_modified: Option<DateTime<Utc>>,
}

impl From<HubModel> for ModelDescriptor {
    fn from(model: HubModel) -> Self {
        let base = Self::from_id(&model.id);
        Self {
            author: model.author.unwrap_or(base.author.clone()),
            downloads: model.downloads,
            likes: model.likes,
            last_modified: model.last_modified,
            tags: model.tags,
            ..base
        }
    }
}

impl HubCollectionItem {
    fn into_descriptor(self, collection: &str) -> ModelDescriptor {
        let base = ModelDescriptor::from_id(&self.id);
        ModelDescriptor {
            author: self.author.unwrap_or(base.author.clone()),
            downloads: self.downloads,
            likes: self.likes,
            last_modified: self.last_modified,
            collections: vec![collection.to_string()],
            ..base
        }
    }
}

impl From<HubCollection> for Collection {
    fn from(collection: HubCollection) -> Self {
        Self {
            model_ids: collection
                .items
                .into_iter()
                .filter(|item| item.item_type == "model")
                .map(|item| item.id)
                .collect(),
            id: collection.slug,
            title: collection.title,
            description: collection.description,
        }
    }
}

impl HubCatalog {
    /// Create new catalog client from config
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("localmind/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LocalmindError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            author: config.author.clone(),
            page_size: config.page_size,
            max_pages: config.max_pages.max(1),
        })
    }

    /// GET a URL and decode its JSON body, returning the `rel="next"` link if any
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<(T, Option<String>)> {
        tracing::debug!("GET {url}");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LocalmindError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LocalmindError::Transport(format!(
                "Catalog request failed with status {status}: {url}"
            )));
        }

        let next = response
            .headers()
            .get(LINK)
            .and_then(|value| value.to_str().ok())
            .and_then(next_page_url);

        let body = response
            .text()
            .await
            .map_err(|e| LocalmindError::Transport(e.to_string()))?;

        let value = serde_json::from_str(&body)
            .map_err(|e| LocalmindError::Decode(format!("Failed to parse catalog response: {e}")))?;

        Ok((value, next))
    }

    fn models_url(&self, search: Option<&str>) -> Result<String> {
        let mut url = reqwest::Url::parse(&format!("{}/api/models", self.endpoint))
            .map_err(|e| LocalmindError::Config(format!("Invalid catalog endpoint: {e}")))?;

        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("author", &self.author)
                .append_pair("sort", "downloads")
                .append_pair("direction", "-1")
                .append_pair("limit", &self.page_size.to_string());
            if let Some(search) = search {
                pairs.append_pair("search", search);
            }
        }

        Ok(url.into())
    }

    async fn list_collection_models(&self, slug: &str) -> Result<Vec<ModelDescriptor>> {
        let url = format!("{}/api/collections/{slug}", self.endpoint);
        let (collection, _) = self.get_json::<HubCollection>(&url).await?;

        Ok(collection
            .items
            .into_iter()
            .filter(|item| item.item_type == "model")
            .map(|item| item.into_descriptor(slug))
            .collect())
    }
}

#[async_trait]
impl CatalogClient for HubCatalog {
    async fn list_collections(&self) -> Result<Vec<Collection>> {
        let url = format!(
            "{}/api/collections?owner={}&limit={}",
            self.endpoint, self.author, self.page_size
        );
        let (collections, _) = self.get_json::<Vec<HubCollection>>(&url).await?;

        tracing::info!("Catalog returned {} collection(s)", collections.len());
        Ok(collections.into_iter().map(Collection::from).collect())
    }

    async fn list_models(&self, query: &ModelQuery) -> Result<Vec<ModelDescriptor>> {
        if let Some(slug) = &query.collection {
            let mut models = self.list_collection_models(slug).await?;
            if let Some(search) = &query.search {
                let needle = search.to_lowercase();
                models.retain(|m| m.id.to_lowercase().contains(&needle));
            }
            return Ok(models);
        }

        let mut models = Vec::new();
        let mut next = Some(self.models_url(query.search.as_deref())?);
        let mut pages = 0;

        while let Some(url) = next {
            let (page, next_url) = self.get_json::<Vec<HubModel>>(&url).await?;
            models.extend(page.into_iter().map(ModelDescriptor::from));

            pages += 1;
            if pages >= self.max_pages {
                break;
            }
            next = next_url;
        }

        tracing::info!("Catalog returned {} model(s) in {pages} page(s)", models.len());
        Ok(models)
    }
}

/// Extract the `rel="next"` target from an RFC 8288 `Link` header
fn next_page_url(header: &str) -> Option<String> {
    header.split(',').find_map(|link| {
        let mut parts = link.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|param| {
            let param = param.trim();
            param == "rel=\"next\"" || param == "rel=next"
        });

        is_next
            .then(|| target.strip_prefix('<')?.strip_suffix('>'))
            .flatten()
            .map(ToString::to_string)
    })
}
