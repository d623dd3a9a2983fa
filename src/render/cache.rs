//! Render cache storage
//!
//! Entries are keyed by `(network, token, kind)` and never expire on their
//! own; only an explicit delete removes them.
//!
//! Layout on disk:
//! - `<dir>/<networkId>-<tokenId>.html`
//! - `<dir>/<networkId>-<tokenId>.png`
//! - `<dir>/<networkId>-<tokenId>.json`
//!
//! The filesystem store runs its I/O on tokio's blocking pool so a slow disk
//! never stalls the request workers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::module::{NetworkId, TokenId};

/// Output kind of a render request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderKind {
    Html,
    Image,
    Json,
}

impl RenderKind {
    pub const ALL: [RenderKind; 3] = [RenderKind::Html, RenderKind::Image, RenderKind::Json];

    pub fn extension(self) -> &'static str {
        match self {
            RenderKind::Html => "html",
            RenderKind::Image => "png",
            RenderKind::Json => "json",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            RenderKind::Html => "text/html; charset=utf-8",
            RenderKind::Image => "image/png",
            RenderKind::Json => "application/json",
        }
    }
}

impl fmt::Display for RenderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RenderKind::Html => "html",
            RenderKind::Image => "image",
            RenderKind::Json => "json",
        };
        f.write_str(name)
    }
}

impl FromStr for RenderKind {
    type Err = anyhow::Error;

    /// Accepts kind names, file extensions and the route segments
    /// (`render`, `image`, `metadata`)
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "html" | "render" => Ok(RenderKind::Html),
            "image" | "png" => Ok(RenderKind::Image),
            "json" | "metadata" => Ok(RenderKind::Json),
            other => anyhow::bail!("Unknown render kind: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub network_id: NetworkId,
    pub token_id: TokenId,
    pub kind: RenderKind,
}

impl CacheKey {
    pub fn new(network_id: NetworkId, token_id: TokenId, kind: RenderKind) -> Self {
        Self {
            network_id,
            token_id,
            kind,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}-{}.{}", self.network_id, self.token_id, self.kind.extension())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Storage backend for rendered content
#[async_trait]
pub trait RenderStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>>;

    /// Store content, replacing any previous entry
    async fn put(&self, key: &CacheKey, content: Bytes) -> Result<()>;

    /// Remove an entry; returns whether one existed
    async fn delete(&self, key: &CacheKey) -> Result<bool>;
}

/// One file per entry in a flat directory
pub struct FilesystemRenderStore {
    dir: Arc<PathBuf>,
}

impl FilesystemRenderStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory: {}", dir.display()))?;
        Ok(Self { dir: Arc::new(dir) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run blocking file work for `key` off the async workers
    async fn blocking<T, F>(&self, key: &CacheKey, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path, PathBuf) -> Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking({
            let dir = Arc::clone(&self.dir);
            let path = self.dir.join(key.file_name());
            move || work(&dir, path)
        })
        .await
        .with_context(|| format!("Cache task for {} did not complete", key))?
    }
}

#[async_trait]
impl RenderStore for FilesystemRenderStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let key = *key;
        self.blocking(&key, move |_, path| match fs::read(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read cache entry {}", key)),
        })
        .await
    }

    async fn put(&self, key: &CacheKey, content: Bytes) -> Result<()> {
        let key = *key;
        self.blocking(&key, move |dir, path| {
            // Write to a temp file in the same directory, then rename over
            // the entry, so readers never see a partial file
            let mut file =
                tempfile::NamedTempFile::new_in(dir).context("Failed to create temp file")?;
            file.write_all(&content).context("Failed to write cache entry")?;
            file.as_file().sync_all().context("Failed to sync cache entry")?;
            file.persist(&path)
                .with_context(|| format!("Failed to persist cache entry {}", key))?;

            debug!(key = %key, size_bytes = content.len(), "Stored cache entry");
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let key = *key;
        self.blocking(&key, move |_, path| match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete cache entry {}", key)),
        })
        .await
    }
}

/// Process-local store; entries are lost on restart
#[derive(Debug, Default)]
pub struct MemoryRenderStore {
    entries: RwLock<HashMap<CacheKey, Vec<u8>>>,
}

impl MemoryRenderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RenderStore for MemoryRenderStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &CacheKey, content: Bytes) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(*key, content.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        Ok(entries.remove(key).is_some())
    }
}
