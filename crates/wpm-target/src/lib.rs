//! Target CMS data-API seam: find/create/update against the destination
//! collections, plus an in-memory implementation for tests.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use wpm_core::TargetRecord;

pub const CRATE_NAME: &str = "wpm-target";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("duplicate slug {slug} in collection {collection}")]
    DuplicateSlug { collection: String, slug: String },
    #[error("no record with id {id} in collection {collection}")]
    NotFound { collection: String, id: i64 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Exact,
    CaseInsensitive,
}

/// Data API the migration writes through. `update` replaces the full
/// mapped field set, not a sparse patch.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn find_first(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        mode: MatchMode,
    ) -> Result<Option<TargetRecord>, StoreError>;

    async fn create(
        &self,
        collection: &str,
        fields: Map<String, Value>,
    ) -> Result<TargetRecord, StoreError>;

    async fn update(
        &self,
        collection: &str,
        id: i64,
        fields: Map<String, Value>,
    ) -> Result<TargetRecord, StoreError>;
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    #[serde(default)]
    docs: Vec<TargetRecord>,
}

#[derive(Debug, Deserialize)]
struct DocResponse {
    doc: TargetRecord,
}

/// REST implementation against the destination CMS data API.
#[derive(Debug)]
pub struct RestTargetStore {
    client: reqwest::Client,
    base_url: String,
}

impl RestTargetStore {
    pub fn new(base_url: impl Into<String>, api_key: &str) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("users API-Key {api_key}"))
            .context("building authorization header")?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn decode<T: serde::de::DeserializeOwned>(url: &str, body: &[u8]) -> Result<T, StoreError> {
        serde_json::from_slice(body).map_err(|source| StoreError::Decode {
            url: url.to_string(),
            source,
        })
    }

    async fn check(resp: reqwest::Response) -> Result<(String, Vec<u8>), StoreError> {
        let status = resp.status();
        let url = resp.url().to_string();
        if !status.is_success() {
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok((url, body))
    }
}

#[async_trait]
impl TargetStore for RestTargetStore {
    async fn find_first(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        mode: MatchMode,
    ) -> Result<Option<TargetRecord>, StoreError> {
        // The target API has no case-insensitive equals; `like` is a
        // contains match, so over-fetch and narrow client-side.
        let (op, limit) = match mode {
            MatchMode::Exact => ("equals", 1),
            MatchMode::CaseInsensitive => ("like", 10),
        };
        let url = format!("{}/api/{}", self.base_url, collection);
        let resp = self
            .client
            .get(&url)
            .query(&[
                (format!("where[{field}][{op}]"), value.to_string()),
                ("limit".to_string(), limit.to_string()),
            ])
            .send()
            .await?;
        let (url, body) = Self::check(resp).await?;
        let found: FindResponse = Self::decode(&url, &body)?;
        Ok(match mode {
            MatchMode::Exact => found.docs.into_iter().next(),
            MatchMode::CaseInsensitive => first_ci_equal(found.docs, field, value),
        })
    }

    async fn create(
        &self,
        collection: &str,
        fields: Map<String, Value>,
    ) -> Result<TargetRecord, StoreError> {
        let url = format!("{}/api/{}", self.base_url, collection);
        debug!(collection, "creating target record");
        let resp = self.client.post(&url).json(&fields).send().await?;
        let (url, body) = Self::check(resp).await?;
        let created: DocResponse = Self::decode(&url, &body)?;
        Ok(created.doc)
    }

    async fn update(
        &self,
        collection: &str,
        id: i64,
        fields: Map<String, Value>,
    ) -> Result<TargetRecord, StoreError> {
        let url = format!("{}/api/{}/{}", self.base_url, collection, id);
        debug!(collection, id, "updating target record");
        let resp = self.client.patch(&url).json(&fields).send().await?;
        let (url, body) = Self::check(resp).await?;
        let updated: DocResponse = Self::decode(&url, &body)?;
        Ok(updated.doc)
    }
}

/// Keep only a doc whose field equals the value case-insensitively.
/// A substring-only `like` hit must not count as a match.
fn first_ci_equal(docs: Vec<TargetRecord>, field: &str, value: &str) -> Option<TargetRecord> {
    docs.into_iter()
        .find(|doc| record_field(doc, field).is_some_and(|have| have.eq_ignore_ascii_case(value)))
}

/// In-memory store with the same semantics: auto-increment ids per store,
/// slug uniqueness per collection. Drives the pipeline tests.
#[derive(Debug, Default)]
pub struct MemoryTargetStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: i64,
    collections: HashMap<String, Vec<TargetRecord>>,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing slug checks. Test setup only.
    pub async fn seed(&self, collection: &str, record: TargetRecord) {
        let mut inner = self.inner.lock().await;
        inner.next_id = inner.next_id.max(record.id);
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(record);
    }

    pub async fn records(&self, collection: &str) -> Vec<TargetRecord> {
        let inner = self.inner.lock().await;
        inner.collections.get(collection).cloned().unwrap_or_default()
    }
}

fn record_field<'a>(record: &'a TargetRecord, field: &str) -> Option<&'a str> {
    if field == "slug" {
        Some(record.slug.as_str())
    } else {
        record.field_str(field)
    }
}

fn slug_of(fields: &Map<String, Value>) -> String {
    fields
        .get("slug")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn find_first(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        mode: MatchMode,
    ) -> Result<Option<TargetRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let records = match inner.collections.get(collection) {
            Some(records) => records,
            None => return Ok(None),
        };
        let found = records.iter().find(|record| {
            record_field(record, field).is_some_and(|have| match mode {
                MatchMode::Exact => have == value,
                MatchMode::CaseInsensitive => have.eq_ignore_ascii_case(value),
            })
        });
        Ok(found.cloned())
    }

    async fn create(
        &self,
        collection: &str,
        mut fields: Map<String, Value>,
    ) -> Result<TargetRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        let slug = slug_of(&fields);
        if !slug.is_empty()
            && inner
                .collections
                .get(collection)
                .is_some_and(|records| records.iter().any(|r| r.slug == slug))
        {
            return Err(StoreError::DuplicateSlug {
                collection: collection.to_string(),
                slug,
            });
        }
        fields.remove("slug");
        inner.next_id += 1;
        let record = TargetRecord {
            id: inner.next_id,
            slug,
            fields,
        };
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        collection: &str,
        id: i64,
        mut fields: Map<String, Value>,
    ) -> Result<TargetRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        let records = inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id,
            })?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id,
            })?;
        let slug = slug_of(&fields);
        if !slug.is_empty() {
            record.slug = slug;
        }
        fields.remove("slug");
        record.fields = fields;
        Ok(record.clone())
    }
}
