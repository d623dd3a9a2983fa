use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::CodeModulesConfig;

pub const CONFIG_FILE_NAME: &str = "code-modules.toml";

/// Find `code-modules.toml` in `start_dir` or any ancestor, then fall back to
/// the user config directory (`~/.config/code-modules/config.toml` on Linux)
pub fn discover_config(start_dir: &Path) -> Option<PathBuf> {
    let found = start_dir
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file());

    found.or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join("code-modules").join("config.toml"))
            .filter(|global| global.is_file())
    })
}

/// Load the explicit config file, or a discovered one, or defaults
pub fn load_config_with_discovery(explicit_path: Option<&str>) -> Result<CodeModulesConfig> {
    let path = match explicit_path {
        Some(path) => PathBuf::from(path),
        None => {
            let current_dir = std::env::current_dir()
                .context("Failed to get current directory for config discovery")?;
            match discover_config(&current_dir) {
                Some(path) => path,
                None => {
                    warn!("No configuration file found, using defaults");
                    return Ok(CodeModulesConfig::default());
                }
            }
        }
    };

    info!("Using config: {}", path.display());
    CodeModulesConfig::from_file(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_discover_in_ancestor() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(temp.path().join(CONFIG_FILE_NAME), "").unwrap();

        assert_eq!(
            discover_config(&nested),
            Some(temp.path().join(CONFIG_FILE_NAME))
        );
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing.toml");
        assert!(load_config_with_discovery(missing.to_str()).is_err());
    }

    #[test]
    fn test_explicit_path_loads() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[snapshot]\nmax_instances = 5\n").unwrap();

        let config = load_config_with_discovery(path.to_str()).unwrap();
        assert_eq!(config.snapshot.max_instances, 5);
    }
}
