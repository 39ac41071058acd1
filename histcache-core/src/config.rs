//! Cache settings and record identity.
//!
//! Settings are loaded from TOML (or built in code) and are immutable once a
//! cache is constructed. The record identity is derived deterministically from
//! a namespace plus the parameters that distinguish one dataset from another
//! (symbol, exchange, ...), so two caches fetching the same thing share a
//! record.

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do when a persisted record cannot be read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptPolicy {
    /// Move the record aside, log a warning and rebuild from empty.
    #[default]
    Quarantine,
    /// Abort the update with `CacheError::Corrupt`.
    Fail,
}

/// Settings shared by every cache flavour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Directory holding one sub-directory per record.
    pub root: PathBuf,

    /// Pause between dispatching successive chunk fetches.
    pub stagger_delay_ms: u64,

    /// Name of the column holding chunk-key values in every table.
    pub index_column: String,

    pub on_corrupt: CorruptPolicy,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            root: default_root(),
            stagger_delay_ms: 0,
            index_column: "index".to_string(),
            on_corrupt: CorruptPolicy::default(),
        }
    }
}

/// `~/.cache/histcache` (platform equivalent), or `./.histcache` when the
/// platform has no cache directory.
pub fn default_root() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("histcache"))
        .unwrap_or_else(|| PathBuf::from(".histcache"))
}

impl CacheSettings {
    /// Settings rooted at `root`, everything else default.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn stagger_delay(&self) -> Duration {
        Duration::from_millis(self.stagger_delay_ms)
    }

    /// Parse settings from a TOML string. Missing keys take defaults.
    pub fn from_toml(content: &str) -> CacheResult<Self> {
        let settings: Self = toml::from_str(content)
            .map_err(|e| CacheError::Config(format!("parse settings TOML: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file.
    pub fn from_file(path: &Path) -> CacheResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::Config(format!("read settings file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.index_column.trim().is_empty() {
            return Err(CacheError::Config("index_column must not be empty".into()));
        }
        if self.root.as_os_str().is_empty() {
            return Err(CacheError::Config("root must not be empty".into()));
        }
        Ok(())
    }
}

/// What a cache fetches: a namespace (typically the dataset name) plus the
/// parameters that select one series within it.
///
/// Uses `BTreeMap` so parameter order never changes the derived key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheIdentity {
    pub namespace: String,
    pub params: BTreeMap<String, String>,
}

impl CacheIdentity {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Derive the stable storage key.
    ///
    /// Without parameters the key is the namespace slug. With parameters it is
    /// `{namespace}__{params}-{digest}`, where the digest is a blake3 hash of
    /// the canonical JSON of the identity, so lossy slugging cannot collide.
    pub fn cache_key(&self) -> CacheResult<CacheKey> {
        let namespace = slugify(&self.namespace);
        if namespace.is_empty() {
            return Err(CacheError::Config(format!(
                "namespace '{}' has no usable characters",
                self.namespace
            )));
        }
        if self.params.is_empty() {
            return Ok(CacheKey(namespace));
        }

        let json = serde_json::to_string(self)
            .map_err(|e| CacheError::Config(format!("identity serialization: {e}")))?;
        let digest = blake3::hash(json.as_bytes()).to_hex().to_string();
        let params = slugify(
            &self
                .params
                .iter()
                .map(|(k, v)| format!("{k}-{v}"))
                .collect::<Vec<_>>()
                .join("_"),
        );
        Ok(CacheKey(format!("{namespace}__{params}-{}", &digest[..12])))
    }
}

/// Filesystem-safe record key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-derived key, e.g. one listed from a store.
    pub fn parse(raw: &str) -> CacheResult<Self> {
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(CacheError::Config(format!("invalid cache key '{raw}'")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase ASCII alphanumerics; every other run of characters becomes one `-`.
fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}
