//! Module data model
//!
//! Module names are stored by the ledger as fixed-width 32-byte values padded
//! with trailing NUL bytes. Everything in this crate keys modules by the
//! trimmed, human-readable form held in [`ModuleName`].

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Width of an encoded module name in the ledger
pub const NAME_WIDTH: usize = 32;

/// Seed used for preview composition (no minted invocation)
pub const PREVIEW_SEED: &str = "0x00";

pub type NetworkId = u64;
pub type TokenId = u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("Module name is empty")]
    Empty,

    #[error("Module name is {0} bytes, maximum is 32")]
    TooLong(usize),

    #[error("Module name contains a NUL byte")]
    InteriorNul,

    #[error("Module name is not valid UTF-8")]
    InvalidUtf8,

    #[error("Invalid hex-encoded module name: {0}")]
    InvalidHex(String),
}

/// Trimmed module name, unique within a network
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ModuleName(String);

impl ModuleName {
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();

        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if name.len() > NAME_WIDTH {
            return Err(NameError::TooLong(name.len()));
        }
        if name.contains('\0') {
            return Err(NameError::InteriorNul);
        }

        Ok(Self(name))
    }

    /// Decode a fixed-width ledger name, dropping the trailing NUL padding
    pub fn from_fixed_bytes(bytes: &[u8]) -> Result<Self, NameError> {
        if bytes.len() > NAME_WIDTH {
            return Err(NameError::TooLong(bytes.len()));
        }

        let end = bytes
            .iter()
            .rposition(|b| *b != 0)
            .map(|pos| pos + 1)
            .unwrap_or(0);

        let name = std::str::from_utf8(&bytes[..end]).map_err(|_| NameError::InvalidUtf8)?;
        Self::new(name)
    }

    /// Decode a `0x`-prefixed hex string as produced by the ledger
    pub fn from_hex(hex_str: &str) -> Result<Self, NameError> {
        let digits = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        let bytes = hex::decode(digits).map_err(|e| NameError::InvalidHex(e.to_string()))?;
        Self::from_fixed_bytes(&bytes)
    }

    pub fn to_fixed_bytes(&self) -> [u8; NAME_WIDTH] {
        let mut out = [0u8; NAME_WIDTH];
        out[..self.0.len()].copy_from_slice(self.0.as_bytes());
        out
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.to_fixed_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Root name used when composing a draft that has no name yet
    pub fn unsaved() -> Self {
        Self("<unsaved>".to_string())
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ModuleName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// Names arrive either as plain strings or as full-width hex from ledger exports.
impl<'de> Deserialize<'de> for ModuleName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let is_fixed_hex = raw
            .strip_prefix("0x")
            .map(|digits| digits.len() == NAME_WIDTH * 2 && hex::decode(digits).is_ok())
            .unwrap_or(false);

        if is_fixed_hex {
            ModuleName::from_hex(&raw).map_err(serde::de::Error::custom)
        } else {
            ModuleName::new(raw).map_err(serde::de::Error::custom)
        }
    }
}

/// Opaque per-invocation input driving composed-program output
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seed(String);

impl Seed {
    pub fn new(seed: impl Into<String>) -> Self {
        Self(seed.into())
    }

    pub fn preview() -> Self {
        Self(PREVIEW_SEED.to_string())
    }

    /// Deterministic seed for a freshly minted invocation
    pub fn derive(module: &ModuleName, token_id: TokenId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(module.to_fixed_bytes());
        hasher.update(token_id.to_be_bytes());
        Self(format!("0x{}", hex::encode(hasher.finalize())))
    }

    pub fn is_preview(&self) -> bool {
        self.0 == PREVIEW_SEED
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ledger record of an authored module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub name: ModuleName,
    pub token_id: TokenId,
    pub owner: String,
    /// Base64 encoding of a single function literal
    pub code: String,
    /// Positional argument order for composition
    #[serde(default)]
    pub dependencies: Vec<ModuleName>,
    #[serde(rename = "metadataJSON", default = "default_metadata_json")]
    pub metadata_json: String,
    #[serde(default)]
    pub is_invocable: bool,
    #[serde(default)]
    pub is_finalized: bool,
    /// Mint cap; zero admits no invocations
    #[serde(default)]
    pub invocations_max: u64,
    #[serde(default)]
    pub invocations_num: u64,
}

impl Module {
    /// Parsed metadata; a malformed blob yields empty metadata
    pub fn metadata(&self) -> ModuleMetadata {
        serde_json::from_str(&self.metadata_json).unwrap_or_default()
    }
}

fn default_metadata_json() -> String {
    "{}".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    #[serde(default)]
    pub description: String,
}

/// A minted instance of an invocable module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub token_id: TokenId,
    pub module_name: ModuleName,
    pub seed: Seed,
    pub owner: String,
}
