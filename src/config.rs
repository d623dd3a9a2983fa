use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::module::NetworkId;
use crate::render::MutablePolicy;

/// Complete service configuration (loaded from TOML file)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CodeModulesConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub snapshot: SnapshotConfig,

    #[serde(default)]
    pub flags: FlagsConfig,

    #[serde(default)]
    pub template: TemplateConfig,

    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:3000")
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Public URL prefix used in token metadata links
    #[serde(default = "default_web_url_root")]
    pub web_url_root: String,

    /// Bearer token for admin routes; admin routes are disabled when unset
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            web_url_root: default_web_url_root(),
            admin_token: None,
        }
    }
}

/// Render cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache directory path
    #[serde(default = "default_cache_dir")]
    pub dir: String,

    /// What to do with output of modules that are not fully finalized:
    /// "cache" (explicit invalidation only) or "bypass" (never cached)
    #[serde(default = "default_mutable_policy")]
    pub mutable_policy: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            mutable_policy: default_mutable_policy(),
        }
    }
}

/// Headless browser snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Maximum simultaneous browser instances
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Bound on one snapshot (e.g., "30s", "500ms")
    #[serde(default = "default_snapshot_timeout")]
    pub timeout: String,

    /// Browser executable (name on PATH or absolute path)
    #[serde(default = "default_browser")]
    pub browser: String,

    #[serde(default = "default_viewport")]
    pub viewport_width: u32,

    #[serde(default = "default_viewport")]
    pub viewport_height: u32,

    /// PNG served for modules that are neither featured nor whitelisted
    #[serde(default)]
    pub placeholder: Option<String>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            timeout: default_snapshot_timeout(),
            browser: default_browser(),
            viewport_width: default_viewport(),
            viewport_height: default_viewport(),
            placeholder: None,
        }
    }
}

impl SnapshotConfig {
    pub fn timeout(&self) -> Result<Duration> {
        parse_duration(&self.timeout).context("Invalid snapshot.timeout")
    }
}

/// Featured / whitelisted flag storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagsConfig {
    #[serde(default = "default_flags_dir")]
    pub dir: String,
}

impl Default for FlagsConfig {
    fn default() -> Self {
        Self {
            dir: default_flags_dir(),
        }
    }
}

/// Initial HTML template; the built-in template is used when unset
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TemplateConfig {
    #[serde(default)]
    pub file: Option<String>,
}

/// One served network and the ledger snapshot backing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub id: NetworkId,

    /// Path to a JSON ledger snapshot
    pub ledger: String,
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_web_url_root() -> String {
    "http://localhost:3000".to_string()
}

fn default_cache_dir() -> String {
    ".code-modules/nft-cache".to_string()
}

fn default_mutable_policy() -> String {
    "cache".to_string()
}

fn default_max_instances() -> usize {
    2
}

fn default_snapshot_timeout() -> String {
    "30s".to_string()
}

fn default_browser() -> String {
    "chromium".to_string()
}

fn default_viewport() -> u32 {
    350
}

fn default_flags_dir() -> String {
    ".code-modules/node-storage".to_string()
}

impl CodeModulesConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: CodeModulesConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Generate example configuration as TOML string
    pub fn example() -> Result<String> {
        let config = CodeModulesConfig {
            server: ServerConfig {
                admin_token: Some("change-me".to_string()),
                ..Default::default()
            },
            snapshot: SnapshotConfig {
                placeholder: Some("images/non-featured.png".to_string()),
                ..Default::default()
            },
            template: TemplateConfig {
                file: Some("template.html".to_string()),
            },
            networks: vec![
                NetworkConfig {
                    id: 1,
                    ledger: "ledger/mainnet.json".to_string(),
                },
                NetworkConfig {
                    id: 5777,
                    ledger: "ledger/local.json".to_string(),
                },
            ],
            ..Default::default()
        };

        toml::to_string_pretty(&config).context("Failed to serialize example config")
    }

    pub fn mutable_policy(&self) -> Result<MutablePolicy> {
        self.cache
            .mutable_policy
            .parse()
            .context("Invalid cache.mutable_policy")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache.dir.is_empty() {
            anyhow::bail!("cache.dir must be set");
        }

        if self.flags.dir.is_empty() {
            anyhow::bail!("flags.dir must be set");
        }

        self.mutable_policy()?;

        if self.snapshot.max_instances == 0 {
            anyhow::bail!("snapshot.max_instances must be at least 1");
        }

        self.snapshot.timeout()?;

        if self.snapshot.viewport_width == 0 || self.snapshot.viewport_height == 0 {
            anyhow::bail!("snapshot viewport dimensions must be non-zero");
        }

        if let Some(token) = &self.server.admin_token {
            if token.trim().is_empty() {
                anyhow::bail!("server.admin_token must not be empty when set");
            }
        }

        let mut seen = HashSet::new();
        for network in &self.networks {
            if !seen.insert(network.id) {
                anyhow::bail!("Duplicate network id in [[networks]]: {}", network.id);
            }
            if network.ledger.is_empty() {
                anyhow::bail!("networks.ledger must be set for network {}", network.id);
            }
        }

        Ok(())
    }
}

/// Parse duration string (e.g., "500ms", "30s", "2m")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow!("Empty duration string"));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        let unit_start = s.char_indices().last().map(|(i, _)| i).unwrap_or(0);
        s.split_at(unit_start)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| anyhow!("Invalid duration: {}", s))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        _ => return Err(anyhow!("Invalid duration unit: {}. Use: ms, s, m", unit)),
    };

    if duration.is_zero() {
        return Err(anyhow!("Duration must be greater than zero: {}", s));
    }

    Ok(duration)
}
