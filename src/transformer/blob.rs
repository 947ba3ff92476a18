// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Remote object store backend for the virtual file system. The whole
//! `bucket/prefix` subtree is materialized eagerly into an in-memory mirror
//! at construction; reads are served from the mirror and mutations fail.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transformer::vfs::{clean_path, MemoryFileSystem, VirtualFileSystem, WalkFn};

/// One listed object: its full name within the bucket and its size. Objects
/// with a trailing `/` and zero size are directory markers.
#[derive(Clone, Debug, PartialEq)]
pub struct BlobEntry {
    pub name: String,
    pub size: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<BlobEntry>>;
    async fn fetch(&self, bucket: &str, name: &str) -> Result<Vec<u8>>;
}

/// Read-only mirror of one bucket prefix.
#[derive(Debug)]
pub struct BlobFileSystem {
    mirror: MemoryFileSystem,
    empty_folders: BTreeSet<String>,
}

impl BlobFileSystem {
    pub async fn materialize(store: &dyn BlobStore, bucket: &str, root_path: &str) -> Result<Self> {
        let source_root = clean_path(root_path);
        let prefix = format!("{source_root}/");

        let mirror = MemoryFileSystem::new();
        mirror.mkdir_all(&source_root)?;
        let mut empty_folders = BTreeSet::new();

        for entry in store.list(bucket, &prefix).await? {
            let target = clean_path(&entry.name);
            if target == source_root {
                continue;
            }
            if entry.size == 0 && entry.name.ends_with('/') {
                mirror.mkdir_all(&target)?;
                empty_folders.insert(target);
                continue;
            }
            let data = store.fetch(bucket, &entry.name).await?;
            debug!(bytes = data.len(), path = %target, "mirrored blob object");
            mirror.write_file(&target, &data)?;
        }

        Ok(BlobFileSystem {
            mirror,
            empty_folders,
        })
    }
}

impl VirtualFileSystem for BlobFileSystem {
    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.mirror.read_file(path)
    }

    fn exists(&self, path: &str) -> bool {
        self.mirror.exists(path) || self.empty_folders.contains(&clean_path(path))
    }

    fn is_dir(&self, path: &str) -> bool {
        self.empty_folders.contains(&clean_path(path)) || self.mirror.is_dir(path)
    }

    fn read_dir(&self, path: &str) -> Result<Vec<String>> {
        if self.empty_folders.contains(&clean_path(path)) {
            return Ok(Vec::new());
        }
        self.mirror.read_dir(path)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        self.mirror.glob(pattern)
    }

    fn walk(&self, root: &str, visit: &mut WalkFn) -> Result<()> {
        self.mirror.walk(root, visit)
    }
}

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Bearer tokens from the ambient metadata service. Absence of the service
/// downgrades every request to anonymous.
pub struct AmbientTokenSource {
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl AmbientTokenSource {
    pub fn new(http: reqwest::Client) -> Self {
        AmbientTokenSource {
            http,
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Option<String> {
        let mut cached = self.cached.lock().await;
        if let Some(existing) = cached.as_ref() {
            if existing.expires_at > Instant::now() {
                return Some(existing.token.clone());
            }
        }
        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?;
        let token: MetadataToken = response.json().await.ok()?;
        let expires_at = Instant::now() + Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at,
        });
        Some(token.access_token)
    }
}

#[derive(Deserialize)]
struct ListedObject {
    name: String,
    #[serde(default)]
    size: Option<String>,
}

#[derive(Deserialize)]
struct ListPage {
    #[serde(default)]
    items: Vec<ListedObject>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

/// Talks to the bucket's JSON API with ambient credentials.
pub struct HttpBlobStore {
    http: reqwest::Client,
    tokens: Arc<AmbientTokenSource>,
    endpoint: String,
}

impl HttpBlobStore {
    pub fn new(http: reqwest::Client) -> Self {
        let tokens = Arc::new(AmbientTokenSource::new(http.clone()));
        HttpBlobStore {
            http,
            tokens,
            endpoint: "https://storage.googleapis.com".to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    async fn get(&self, url: String) -> Result<reqwest::Response> {
        let mut request = self.http.get(&url);
        if let Some(token) = self.tokens.token().await {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| Error::BlobStore(format!("request {url:?} failed: {err}")))?;
        if !response.status().is_success() {
            return Err(Error::BlobStore(format!(
                "request {url:?} returned {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<BlobEntry>> {
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{}/storage/v1/b/{}/o?prefix={}&fields=items(name,size),nextPageToken",
                self.endpoint,
                bucket,
                urlencode(prefix)
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencode(token)));
            }
            let page: ListPage = self
                .get(url)
                .await?
                .json()
                .await
                .map_err(|err| Error::BlobStore(format!("invalid list response: {err}")))?;
            for item in page.items {
                let size = item
                    .size
                    .as_deref()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                entries.push(BlobEntry {
                    name: item.name,
                    size,
                });
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn fetch(&self, bucket: &str, name: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/storage/v1/b/{}/o/{}?alt=media",
            self.endpoint,
            bucket,
            urlencode(name)
        );
        let response = self.get(url).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| Error::BlobStore(format!("failed to read object body: {err}")))?;
        Ok(bytes.to_vec())
    }
}

fn urlencode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}
