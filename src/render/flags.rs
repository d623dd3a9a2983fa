//! Featured / whitelisted module flags
//!
//! Flags gate the expensive image path. They persist as empty marker files
//! (`featured-<name>`, `whitelisted-<networkId>-<name>`) and are mirrored in
//! memory so lookups never touch the disk.
//!
//! Names that are not safe as file names are stored in their fixed-width
//! `0x…` form instead.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

use crate::module::{ModuleName, NetworkId, NAME_WIDTH};

const FEATURED_PREFIX: &str = "featured-";
const WHITELISTED_PREFIX: &str = "whitelisted-";

#[derive(Debug, Default)]
struct Flags {
    featured: BTreeSet<ModuleName>,
    whitelisted: BTreeMap<NetworkId, BTreeSet<ModuleName>>,
}

#[derive(Debug, Default)]
pub struct FlagStore {
    /// None keeps flags in memory only
    dir: Option<PathBuf>,
    flags: RwLock<Flags>,
}

impl FlagStore {
    /// Open (creating if needed) a flag directory and load its markers
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create flags directory: {}", dir.display()))?;

        let mut flags = Flags::default();
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read flags directory: {}", dir.display()))?;

        for entry in entries {
            let entry = entry.context("Failed to read flags directory entry")?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };

            if let Some(rest) = file_name.strip_prefix(FEATURED_PREFIX) {
                match decode_name(rest) {
                    Some(name) => {
                        flags.featured.insert(name);
                    }
                    None => warn!("Ignoring unreadable flag file: {}", file_name),
                }
            } else if let Some(rest) = file_name.strip_prefix(WHITELISTED_PREFIX) {
                let parsed = rest.split_once('-').and_then(|(network, name)| {
                    Some((network.parse::<NetworkId>().ok()?, decode_name(name)?))
                });
                match parsed {
                    Some((network_id, name)) => {
                        flags.whitelisted.entry(network_id).or_default().insert(name);
                    }
                    None => warn!("Ignoring unreadable flag file: {}", file_name),
                }
            }
        }

        info!(
            featured = flags.featured.len(),
            whitelisted = flags.whitelisted.values().map(BTreeSet::len).sum::<usize>(),
            "Loaded module flags from {}",
            dir.display()
        );

        Ok(Self {
            dir: Some(dir),
            flags: RwLock::new(flags),
        })
    }

    pub fn memory() -> Self {
        Self::default()
    }

    pub fn featured(&self) -> Vec<ModuleName> {
        self.read().featured.iter().cloned().collect()
    }

    pub fn is_featured(&self, name: &ModuleName) -> bool {
        self.read().featured.contains(name)
    }

    pub fn add_featured(&self, name: &ModuleName) -> Result<()> {
        self.touch(&featured_file(name))?;
        self.write().featured.insert(name.clone());
        debug!(module = %name, "Featured module");
        Ok(())
    }

    /// Returns whether the flag was set
    pub fn remove_featured(&self, name: &ModuleName) -> Result<bool> {
        self.unlink(&featured_file(name))?;
        Ok(self.write().featured.remove(name))
    }

    pub fn whitelisted(&self, network_id: NetworkId) -> Vec<ModuleName> {
        self.read()
            .whitelisted
            .get(&network_id)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_whitelisted(&self, network_id: NetworkId, name: &ModuleName) -> bool {
        self.read()
            .whitelisted
            .get(&network_id)
            .is_some_and(|names| names.contains(name))
    }

    pub fn add_whitelisted(&self, network_id: NetworkId, name: &ModuleName) -> Result<()> {
        self.touch(&whitelisted_file(network_id, name))?;
        self.write()
            .whitelisted
            .entry(network_id)
            .or_default()
            .insert(name.clone());
        debug!(network_id, module = %name, "Whitelisted module");
        Ok(())
    }

    pub fn remove_whitelisted(&self, network_id: NetworkId, name: &ModuleName) -> Result<bool> {
        self.unlink(&whitelisted_file(network_id, name))?;
        let mut flags = self.write();
        let removed = flags
            .whitelisted
            .get_mut(&network_id)
            .is_some_and(|names| names.remove(name));
        Ok(removed)
    }

    /// Whether image rendering is allowed for a module on a network
    pub fn is_visible(&self, network_id: NetworkId, name: &ModuleName) -> bool {
        self.is_featured(name) || self.is_whitelisted(network_id, name)
    }

    fn touch(&self, file_name: &str) -> Result<()> {
        if let Some(dir) = &self.dir {
            let path = dir.join(file_name);
            fs::write(&path, b"")
                .with_context(|| format!("Failed to write flag file: {}", path.display()))?;
        }
        Ok(())
    }

    fn unlink(&self, file_name: &str) -> Result<()> {
        if let Some(dir) = &self.dir {
            let path = dir.join(file_name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to remove flag file: {}", path.display()))
                }
            }
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Flags> {
        self.flags.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Flags> {
        self.flags.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn featured_file(name: &ModuleName) -> String {
    format!("{}{}", FEATURED_PREFIX, encode_name(name))
}

fn whitelisted_file(network_id: NetworkId, name: &ModuleName) -> String {
    format!("{}{}-{}", WHITELISTED_PREFIX, network_id, encode_name(name))
}

fn encode_name(name: &ModuleName) -> String {
    let s = name.as_str();
    let safe = s != "."
        && s != ".."
        && !s.starts_with('.')
        && s.chars().all(|c| c.is_alphanumeric() || "-_.@+".contains(c));
    if safe {
        s.to_string()
    } else {
        name.to_hex()
    }
}

fn decode_name(s: &str) -> Option<ModuleName> {
    if s.starts_with("0x") && s.len() == 2 + NAME_WIDTH * 2 {
        ModuleName::from_hex(s).ok()
    } else {
        ModuleName::new(s).ok()
    }
}
