//! Configuration file support (`.manifold.toml`).
//!
//! All knobs the core consults live here, merged from an optional TOML file
//! over built-in defaults. Durations accept humantime strings ("90s",
//! "24h") or integer milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use manifold_backoff::PauseConfig;
use serde::{Deserialize, Serialize};

use crate::types::{RenderStrategy, deserialize_duration, serialize_duration};

/// File name looked up in the process working directory.
pub const CONFIG_FILE: &str = ".manifold.toml";

/// Cache behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for resolved-revision entries; resolution caching is brief.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_revision_ttl")]
    pub revision_ttl: Duration,

    /// TTL for rendered-manifest entries.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_manifest_ttl")]
    pub manifest_ttl: Duration,

    /// Failure memoization policy.
    #[serde(default)]
    pub pause: PauseConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            revision_ttl: default_revision_ttl(),
            manifest_ttl: default_manifest_ttl(),
            pause: PauseConfig::default(),
        }
    }
}

/// Resource caps applied under adversarial inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Concurrent render slots; zero disables throttling.
    #[serde(default = "default_parallelism_limit")]
    pub parallelism_limit: usize,

    /// Cap on extracted chart bytes; zero disables the cap.
    #[serde(default = "default_extract_cap")]
    pub chart_max_extracted_bytes: u64,

    /// Cap on extracted OCI artifact bytes; zero disables the cap.
    #[serde(default = "default_extract_cap")]
    pub oci_max_extracted_bytes: u64,

    /// Combined size budget for non-script files in a raw directory render.
    #[serde(default = "default_combined_manifest_bytes")]
    pub max_combined_manifest_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            parallelism_limit: default_parallelism_limit(),
            chart_max_extracted_bytes: default_extract_cap(),
            oci_max_extracted_bytes: default_extract_cap(),
            max_combined_manifest_bytes: default_combined_manifest_bytes(),
        }
    }
}

/// Working-tree handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Root under which per-repository working trees and per-request
    /// extraction directories are created.
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,

    /// Skip the post-acquisition symlink validation walk.
    #[serde(default)]
    pub allow_out_of_bounds_symlinks: bool,

    /// Check out submodules along with the requested revision.
    #[serde(default)]
    pub submodules: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            scratch_root: default_scratch_root(),
            allow_out_of_bounds_symlinks: false,
            submodules: false,
        }
    }
}

/// Sidecar plugin discovery and streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Directory enumerated for plugin sockets.
    #[serde(default = "default_sock_dir")]
    pub sock_dir: PathBuf,

    /// Globs always excluded from streamed archives, on top of any
    /// request-supplied exclusions.
    #[serde(default)]
    pub tar_exclusions: Vec<String>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            sock_dir: default_sock_dir(),
            tar_exclusions: Vec::new(),
        }
    }
}

/// Render strategy toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Strategy display names ("Template", "Overlay", ...) for which
    /// generation is disabled; explicit requests demote to RawDirectory.
    #[serde(default)]
    pub disabled_strategies: Vec<String>,
}

impl RenderConfig {
    pub fn is_disabled(&self, strategy: &RenderStrategy) -> bool {
        let name = strategy.to_string();
        self.disabled_strategies.iter().any(|s| *s == name)
    }
}

/// Top-level configuration of the manifest generation core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub tree: TreeConfig,
    #[serde(default)]
    pub plugin: PluginConfig,
    #[serde(default)]
    pub render: RenderConfig,
}

impl CoreConfig {
    /// Load `.manifold.toml` from the given directory, falling back to
    /// defaults when the file does not exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }
}

fn default_revision_ttl() -> Duration {
    Duration::from_secs(3 * 60)
}

fn default_manifest_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_parallelism_limit() -> usize {
    0
}

fn default_extract_cap() -> u64 {
    1024 * 1024 * 1024
}

fn default_combined_manifest_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_scratch_root() -> PathBuf {
    PathBuf::from("/tmp/_manifold")
}

fn default_sock_dir() -> PathBuf {
    PathBuf::from("/var/run/manifold/plugins")
}
