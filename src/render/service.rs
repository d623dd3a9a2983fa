//! Render pipeline
//!
//! `render(network, token, kind)`:
//! 1. cache lookup, returned as-is on hit
//! 2. token lookup in the network's ledger (missing tokens are never cached)
//! 3. html: resolve + compose + wrap in the current template
//!    image: visibility gate, limiter admission, compose, isolated snapshot
//!    json: NFT-style metadata document
//! 4. cache write, subject to the mutable policy
//!
//! Concurrent misses on the same key may both compute and both write; the
//! output is deterministic so the last write wins.

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::cache::{CacheKey, RenderKind, RenderStore};
use super::flags::FlagStore;
use super::limiter::ConcurrencyLimiter;
use super::snapshot::{SnapshotError, Snapshotter, PLACEHOLDER_PNG};
use super::stats::RenderStats;
use crate::compose::{self, CompositionError, CompositionRoot};
use crate::ledger::ModuleStore;
use crate::logging::{operations, services, status};
use crate::module::{Module, ModuleName, NetworkId, Seed, TokenId};
use crate::resolver::{DependencyResolver, ResolveError, ResolvedClosure};
use crate::template::TemplateStore;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Token {token_id} does not exist on network {network_id}")]
    NotFound {
        network_id: NetworkId,
        token_id: TokenId,
    },

    #[error("Module \"{0}\" does not exist")]
    ModuleNotFound(ModuleName),

    #[error("Network {0} is not available")]
    NetworkUnavailable(NetworkId),

    #[error("Max capacity reached, please try again later")]
    CapacityExceeded,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Composition(#[from] CompositionError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("Render storage error: {0:#}")]
    Storage(anyhow::Error),
}

/// What to do with closures that still contain non-finalized modules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutablePolicy {
    /// Cache everything; entries only go away through invalidation
    #[default]
    Cache,
    /// Never cache output whose closure can still change
    Bypass,
}

impl FromStr for MutablePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "cache" => Ok(Self::Cache),
            "bypass" => Ok(Self::Bypass),
            other => anyhow::bail!(
                "Unknown mutable policy \"{}\" (expected \"cache\" or \"bypass\")",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderSource {
    Cache,
    Rendered,
    Placeholder,
}

impl fmt::Display for RenderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RenderSource::Cache => "hit",
            RenderSource::Rendered => "miss",
            RenderSource::Placeholder => "placeholder",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Rendered {
    pub kind: RenderKind,
    pub content: Bytes,
    pub source: RenderSource,
}

impl Rendered {
    pub fn content_type(&self) -> &'static str {
        self.kind.content_type()
    }

    /// Strong ETag over the content
    pub fn etag(&self) -> String {
        let digest = Sha256::digest(&self.content);
        format!("\"{}\"", hex::encode(&digest[..16]))
    }
}

/// Module plus its derived closure facts
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInspection {
    pub module: Module,
    pub all_dependencies: Vec<ModuleName>,
    pub is_mutable: bool,
}

/// Unsaved module sent for preview
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    /// Name the draft would be saved under; lets an edit of an existing
    /// module detect the cycle it would introduce
    #[serde(default)]
    pub name: Option<ModuleName>,
    #[serde(default)]
    pub dependencies: Vec<ModuleName>,
    pub code: String,
    #[serde(default)]
    pub is_invocable: bool,
}

/// A token resolved to the module it renders and the seed to render it with
#[derive(Debug, Clone)]
struct RenderTarget {
    module: Module,
    seed: Seed,
    invocation: bool,
}

pub struct RenderService {
    networks: BTreeMap<NetworkId, Arc<dyn ModuleStore>>,
    store: Arc<dyn RenderStore>,
    snapshotter: Arc<dyn Snapshotter>,
    templates: Arc<TemplateStore>,
    flags: Arc<FlagStore>,
    limiter: ConcurrencyLimiter,
    stats: Arc<RenderStats>,
    policy: MutablePolicy,
    web_url_root: String,
    placeholder: Bytes,
}

impl RenderService {
    pub fn new(store: Arc<dyn RenderStore>, snapshotter: Arc<dyn Snapshotter>) -> Self {
        Self {
            networks: BTreeMap::new(),
            store,
            snapshotter,
            templates: Arc::new(TemplateStore::default()),
            flags: Arc::new(FlagStore::memory()),
            limiter: ConcurrencyLimiter::new(2),
            stats: Arc::new(RenderStats::new()),
            policy: MutablePolicy::default(),
            web_url_root: "http://localhost:3000".to_string(),
            placeholder: Bytes::from_static(PLACEHOLDER_PNG),
        }
    }

    pub fn with_network(mut self, network_id: NetworkId, ledger: Arc<dyn ModuleStore>) -> Self {
        self.networks.insert(network_id, ledger);
        self
    }

    pub fn with_templates(mut self, templates: Arc<TemplateStore>) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_flags(mut self, flags: Arc<FlagStore>) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_limiter(mut self, limiter: ConcurrencyLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_policy(mut self, policy: MutablePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_web_url_root(mut self, web_url_root: impl Into<String>) -> Self {
        self.web_url_root = web_url_root.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_placeholder(mut self, placeholder: Vec<u8>) -> Self {
        self.placeholder = Bytes::from(placeholder);
        self
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    pub fn flags(&self) -> &Arc<FlagStore> {
        &self.flags
    }

    pub fn stats(&self) -> &Arc<RenderStats> {
        &self.stats
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn network_ids(&self) -> Vec<NetworkId> {
        self.networks.keys().copied().collect()
    }

    pub fn network(&self, network_id: NetworkId) -> Result<&Arc<dyn ModuleStore>, RenderError> {
        self.networks
            .get(&network_id)
            .ok_or(RenderError::NetworkUnavailable(network_id))
    }

    pub async fn render(
        &self,
        network_id: NetworkId,
        token_id: TokenId,
        kind: RenderKind,
    ) -> Result<Rendered, RenderError> {
        let ledger = self.network(network_id)?;
        let key = CacheKey::new(network_id, token_id, kind);

        match self.store.get(&key).await {
            Ok(Some(content)) => {
                self.stats.record_hit();
                debug!(
                    service = services::RENDER,
                    operation = operations::RENDER,
                    status = status::HIT,
                    network_id,
                    token_id,
                    kind = %kind,
                    size_bytes = content.len(),
                    "cache hit"
                );
                return Ok(Rendered {
                    kind,
                    content: Bytes::from(content),
                    source: RenderSource::Cache,
                });
            }
            Ok(None) => {}
            Err(e) => warn!("Cache read failed for {}, rendering instead: {:#}", key, e),
        }
        self.stats.record_miss();

        let Some(target) = find_target(ledger.as_ref(), token_id) else {
            self.stats.record_not_found();
            debug!(
                service = services::RENDER,
                operation = operations::RENDER,
                status = status::NOT_FOUND,
                network_id,
                token_id,
                kind = %kind,
                "token not found"
            );
            return Err(RenderError::NotFound {
                network_id,
                token_id,
            });
        };

        let (content, mutable) = match kind {
            RenderKind::Html => {
                let closure = DependencyResolver::new(ledger.as_ref()).resolve(&target.module.name)?;
                let html = self.compose_document(&target, &closure)?;
                (Bytes::from(html), mutable_output(&target, &closure))
            }
            RenderKind::Json => {
                let document = self.metadata_document(network_id, token_id, &target)?;
                (Bytes::from(document), !target.module.is_finalized)
            }
            RenderKind::Image => {
                if !self.flags.is_visible(network_id, &target.module.name) {
                    self.stats.record_placeholder();
                    debug!(
                        service = services::RENDER,
                        operation = operations::RENDER,
                        status = status::PLACEHOLDER,
                        network_id,
                        token_id,
                        module = %target.module.name,
                        "module not featured, serving placeholder"
                    );
                    return Ok(Rendered {
                        kind,
                        content: self.placeholder.clone(),
                        source: RenderSource::Placeholder,
                    });
                }

                let closure = DependencyResolver::new(ledger.as_ref()).resolve(&target.module.name)?;
                let image = self.snapshot(network_id, token_id, &target, &closure).await?;
                (Bytes::from(image), mutable_output(&target, &closure))
            }
        };

        if self.policy == MutablePolicy::Bypass && mutable {
            debug!(key = %key, "Closure is mutable, not caching");
        } else if let Err(e) = self.store.put(&key, content.clone()).await {
            warn!("Failed to cache {}: {:#}", key, e);
        }

        info!(
            service = services::RENDER,
            operation = operations::RENDER,
            status = status::MISS,
            network_id,
            token_id,
            kind = %kind,
            size_bytes = content.len(),
            "rendered"
        );

        Ok(Rendered {
            kind,
            content,
            source: RenderSource::Rendered,
        })
    }

    /// Compose and wrap an unsaved module with the preview seed
    ///
    /// Malformed code yields an empty document rather than an error.
    pub fn preview(
        &self,
        network_id: NetworkId,
        request: &PreviewRequest,
    ) -> Result<String, RenderError> {
        let ledger = self.network(network_id)?;
        let name = request.name.clone().unwrap_or_else(ModuleName::unsaved);

        let closure = DependencyResolver::new(ledger.as_ref())
            .resolve_dependencies(&name, &request.dependencies)?;

        let root = CompositionRoot {
            name: &name,
            code: &request.code,
            dependencies: &request.dependencies,
            is_invocable: request.is_invocable,
        };

        match compose::compose_root(root, &closure, &Seed::preview()) {
            Ok(program) => {
                self.stats.record_composition();
                debug!(
                    service = services::RENDER,
                    operation = operations::PREVIEW,
                    status = status::SUCCESS,
                    network_id,
                    modules = closure.len(),
                    "composed preview"
                );
                Ok(self.templates.current().wrap(&program))
            }
            Err(CompositionError::MalformedCode { module, source }) => {
                debug!(
                    service = services::RENDER,
                    operation = operations::PREVIEW,
                    status = status::ERROR,
                    network_id,
                    module = %module,
                    "malformed code in preview: {}",
                    source
                );
                Ok(String::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn inspect(
        &self,
        network_id: NetworkId,
        name: &ModuleName,
    ) -> Result<ModuleInspection, RenderError> {
        let ledger = self.network(network_id)?;
        let module = ledger
            .get_module(name)
            .ok_or_else(|| RenderError::ModuleNotFound(name.clone()))?;

        let closure = DependencyResolver::new(ledger.as_ref()).resolve(name)?;
        debug!(
            service = services::RENDER,
            operation = operations::INSPECT,
            network_id,
            module = %name,
            dependencies = closure.len(),
            "inspected module"
        );

        Ok(ModuleInspection {
            is_mutable: closure.is_mutable(),
            all_dependencies: closure.names(),
            module,
        })
    }

    /// Drop one cache entry; returns whether it existed
    pub async fn invalidate(
        &self,
        network_id: NetworkId,
        token_id: TokenId,
        kind: RenderKind,
    ) -> Result<bool, RenderError> {
        self.network(network_id)?;
        let key = CacheKey::new(network_id, token_id, kind);
        let removed = self
            .store
            .delete(&key)
            .await
            .with_context(|| format!("Failed to invalidate {}", key))
            .map_err(RenderError::Storage)?;

        if removed {
            self.stats.record_invalidation();
        }
        info!(
            service = services::RENDER,
            operation = operations::INVALIDATE,
            network_id,
            token_id,
            kind = %kind,
            removed,
            "invalidated cache entry"
        );
        Ok(removed)
    }

    fn compose_document(
        &self,
        target: &RenderTarget,
        closure: &ResolvedClosure,
    ) -> Result<String, RenderError> {
        let program = compose::compose(&target.module, closure, &target.seed)?;
        self.stats.record_composition();
        Ok(self.templates.current().wrap(&program))
    }

    async fn snapshot(
        &self,
        network_id: NetworkId,
        token_id: TokenId,
        target: &RenderTarget,
        closure: &ResolvedClosure,
    ) -> Result<Vec<u8>, RenderError> {
        // Held until this function returns, whatever the outcome
        let Some(_permit) = self.limiter.try_acquire() else {
            self.stats.record_capacity_rejection();
            warn!(
                service = services::RENDER,
                operation = operations::SNAPSHOT,
                status = status::REJECTED,
                network_id,
                token_id,
                active = self.limiter.active(),
                max = self.limiter.max(),
                "snapshot capacity reached"
            );
            return Err(RenderError::CapacityExceeded);
        };

        let html = self.compose_document(target, closure)?;
        let result = self.snapshotter.capture(&html).await;
        self.stats.record_snapshot(result.is_ok());

        match result {
            Ok(image) => Ok(image),
            Err(e) => {
                warn!(
                    service = services::RENDER,
                    operation = operations::SNAPSHOT,
                    status = status::ERROR,
                    network_id,
                    token_id,
                    "snapshot failed: {}",
                    e
                );
                Err(e.into())
            }
        }
    }

    fn metadata_document(
        &self,
        network_id: NetworkId,
        token_id: TokenId,
        target: &RenderTarget,
    ) -> Result<Vec<u8>, RenderError> {
        let root = &self.web_url_root;
        let module = &target.module;
        let external_url = if target.invocation {
            format!("{}/modules/invocation/{}", root, token_id)
        } else {
            format!("{}/modules/{}", root, module.name)
        };

        let document = serde_json::json!({
            "name": format!("{}@{}", module.name, token_id),
            "description": module.metadata().description,
            "image": format!("{}/network/{}/tokens/{}/image", root, network_id, token_id),
            "external_url": external_url,
            "animation_url": format!("{}/network/{}/tokens/{}/render", root, network_id, token_id),
            "attributes": [
                { "trait_type": "module", "value": module.name.as_str() },
                { "trait_type": "dependencies", "value": module.dependencies.len() },
                { "trait_type": "finalized", "value": module.is_finalized },
            ],
        });

        serde_json::to_vec(&document)
            .context("Failed to serialize token metadata")
            .map_err(RenderError::Storage)
    }
}

/// Rendered output can change when the root itself is still editable or its
/// closure is mutable
fn mutable_output(target: &RenderTarget, closure: &ResolvedClosure) -> bool {
    !target.module.is_finalized || closure.is_mutable()
}

/// Invocation tokens render their module with the invocation's seed; module
/// tokens render with the preview seed
fn find_target(ledger: &dyn ModuleStore, token_id: TokenId) -> Option<RenderTarget> {
    if let Some(invocation) = ledger.get_invocation(token_id) {
        let module = ledger.get_module(&invocation.module_name)?;
        return Some(RenderTarget {
            module,
            seed: invocation.seed,
            invocation: true,
        });
    }

    ledger.module_by_token(token_id).map(|module| RenderTarget {
        module,
        seed: Seed::preview(),
        invocation: false,
    })
}
