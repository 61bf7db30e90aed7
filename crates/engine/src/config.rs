//! Engine configuration, loaded from TOML.
//!
//! ```toml
//! [addressing]
//! algorithm = "blake3"
//! cache_capacity = 10000
//!
//! [codec]
//! max_batch_entries = 500
//! max_batch_bytes = 1048576
//!
//! [merge]
//! no_base_fallback = "take_remote"
//! conflict_policy = "mark_for_review"
//! prefer_newest = true
//!
//! [writeback]
//! overlay_root = "/srv/packs"
//! backup_dir = "/srv/backups"
//! pack_format = 15
//! backup_required = true
//! backup_retention_days = 7
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use modlocale_core::cid::{DEFAULT_CACHE_CAPACITY, HashAlgorithm};
use modlocale_core::codec::{CodecLimits, DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_BATCH_ENTRIES};

use crate::merge::{ConflictPolicy, NoBaseFallback};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub addressing: AddressingConfig,

    #[serde(default)]
    pub codec: CodecConfig,

    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub writeback: WritebackConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddressingConfig {
    #[serde(default)]
    pub algorithm: HashAlgorithm,

    /// Maximum number of cached content entries. Zero disables the cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for AddressingConfig {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::default(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

const fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodecConfig {
    #[serde(default = "default_max_batch_entries")]
    pub max_batch_entries: usize,

    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_batch_entries: default_max_batch_entries(),
            max_batch_bytes: default_max_batch_bytes(),
        }
    }
}

impl CodecConfig {
    pub fn limits(&self) -> CodecLimits {
        CodecLimits {
            max_entries: self.max_batch_entries,
            max_bytes: self.max_batch_bytes,
        }
    }
}

const fn default_max_batch_entries() -> usize {
    DEFAULT_MAX_BATCH_ENTRIES
}

const fn default_max_batch_bytes() -> usize {
    DEFAULT_MAX_BATCH_BYTES
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    #[serde(default)]
    pub no_base_fallback: NoBaseFallback,

    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Timestamp resolution direction: newer wins when true.
    #[serde(default = "default_true")]
    pub prefer_newest: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            no_base_fallback: NoBaseFallback::default(),
            conflict_policy: ConflictPolicy::default(),
            prefer_newest: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WritebackConfig {
    /// Directory receiving overlay resource packs.
    #[serde(default)]
    pub overlay_root: Option<PathBuf>,

    /// Directory receiving archive backups.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,

    #[serde(default = "default_pack_format")]
    pub pack_format: u32,

    #[serde(default = "default_pack_description")]
    pub pack_description: String,

    #[serde(default = "default_true")]
    pub backup_required: bool,

    #[serde(default = "default_backup_retention_days")]
    pub backup_retention_days: u32,
}

impl Default for WritebackConfig {
    fn default() -> Self {
        Self {
            overlay_root: None,
            backup_dir: None,
            pack_format: default_pack_format(),
            pack_description: default_pack_description(),
            backup_required: true,
            backup_retention_days: default_backup_retention_days(),
        }
    }
}

const fn default_pack_format() -> u32 {
    15
}

fn default_pack_description() -> String {
    "Localization overlay".to_string()
}

const fn default_backup_retention_days() -> u32 {
    7
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub path: Option<PathBuf>,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(p) => write!(f, "{}: {}", p.display(), self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for crate::error::EngineError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl EngineConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::from_toml_str(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start].chars().filter(|&c| c == '\n').count() + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError { path: None, message }
        })
    }

    /// Fill unset writeback directories with `overlays/` and `backups/`
    /// under `root`.
    pub fn with_workspace(mut self, root: &Path) -> Self {
        if self.writeback.overlay_root.is_none() {
            self.writeback.overlay_root = Some(root.join("overlays"));
        }
        if self.writeback.backup_dir.is_none() {
            self.writeback.backup_dir = Some(root.join("backups"));
        }
        self
    }
}
