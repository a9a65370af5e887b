//! Server configuration.
//!
//! Configuration lives in `config/vectoriadb.yml` under the base path. A
//! default file is written on first start so operators always have a
//! template to edit. CLI flags override individual values.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const INDEXES_DIR: &str = "indexes";
pub const LOGS_DIR: &str = "logs";
pub const CONFIG_DIR: &str = "config";
pub const CONFIG_YAML: &str = "vectoriadb.yml";

/// The service mode the node starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeKind {
    Build,
    Search,
}

impl ModeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModeKind::Build => "build",
            ModeKind::Search => "search",
        }
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Vector dimensionality, shared by every index on the node.
    pub dimensions: usize,
    /// Index graph parameter, passed through to the builder and reader.
    pub max_connections_per_vertex: usize,
    /// Index graph parameter, passed through to the builder and reader.
    pub max_candidates_returned: usize,
    /// Compression parameter, passed through.
    pub compression_ratio: u32,
    /// Distance scaling, passed through.
    pub distance_multiplier: f32,
    /// Explicit build-pool size; `None` means use the derived default.
    pub index_building_max_memory: Option<u64>,
    /// Explicit disk-cache size; `None` means use the derived default.
    pub disk_cache_memory: Option<u64>,
    /// Root of `indexes/`, `logs/` and `config/`.
    pub base_path: PathBuf,
    /// Mode the node starts in.
    pub default_mode: ModeKind,
}

impl Config {
    pub fn indexes_path(&self) -> PathBuf {
        self.base_path.join(INDEXES_DIR)
    }

    pub fn logs_path(&self) -> PathBuf {
        self.base_path.join(LOGS_DIR)
    }

    /// Load configuration from `<base>/config/vectoriadb.yml`, seeding the
    /// file with defaults when it does not exist yet.
    pub fn load(base_path: &Path) -> Result<Self> {
        fs::create_dir_all(base_path.join(INDEXES_DIR))?;
        fs::create_dir_all(base_path.join(LOGS_DIR))?;
        let config_dir = base_path.join(CONFIG_DIR);
        fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join(CONFIG_YAML);
        if !config_path.exists() {
            tracing::info!(
                "Server config file {} does not exist. Using default one.",
                config_path.display()
            );
            fs::write(&config_path, DEFAULT_CONFIG_YAML)
                .with_context(|| format!("seeding default config at {}", config_path.display()))?;
        }

        let raw = fs::read_to_string(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        let file: ConfigFile = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing {}", config_path.display()))?;

        Self::from_file(file, base_path)
    }

    fn from_file(file: ConfigFile, base_path: &Path) -> Result<Self> {
        let index = file.vectoriadb.index;
        let server = file.vectoriadb.server;

        let Some(dimensions) = index.dimensions else {
            bail!("required property vectoriadb.index.dimensions is not set");
        };
        if dimensions == 0 {
            bail!("vectoriadb.index.dimensions must be positive");
        }

        let index_building_max_memory = index
            .building
            .max_memory_consumption
            .as_deref()
            .map(parse_memory)
            .transpose()
            .context("vectoriadb.index.building.max-memory-consumption")?;
        let disk_cache_memory = index
            .search
            .disk_cache_memory_consumption
            .as_deref()
            .map(parse_memory)
            .transpose()
            .context("vectoriadb.index.search.disk-cache-memory-consumption")?;

        let base_path = match server.base_path {
            Some(p) => p,
            None => base_path.to_path_buf(),
        };

        Ok(Config {
            dimensions,
            max_connections_per_vertex: index.max_connections_per_vertex,
            max_candidates_returned: index.max_candidates_returned,
            compression_ratio: index.compression_ratio,
            distance_multiplier: index.distance_multiplier,
            index_building_max_memory,
            disk_cache_memory,
            base_path,
            default_mode: server.default_mode,
        })
    }
}

/// Parse a memory size with an optional `b`, `k`/`kb`, `m`/`mb`, `g`/`gb`
/// suffix (case-insensitive). A bare number is taken as bytes.
pub fn parse_memory(value: &str) -> Result<u64> {
    let lower = value.trim().to_ascii_lowercase();

    let (digits, multiplier) = if let Some(rest) = lower.strip_suffix("kb") {
        (rest, 1024)
    } else if let Some(rest) = lower.strip_suffix("mb") {
        (rest, 1024 * 1024)
    } else if let Some(rest) = lower.strip_suffix("gb") {
        (rest, 1024 * 1024 * 1024)
    } else if let Some(rest) = lower.strip_suffix('k') {
        (rest, 1024)
    } else if let Some(rest) = lower.strip_suffix('m') {
        (rest, 1024 * 1024)
    } else if let Some(rest) = lower.strip_suffix('g') {
        (rest, 1024 * 1024 * 1024)
    } else if let Some(rest) = lower.strip_suffix('b') {
        (rest, 1)
    } else {
        (lower.as_str(), 1)
    };

    let number: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid memory size `{value}`"))?;
    Ok(number * multiplier)
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    vectoriadb: VectoriaSection,
}

#[derive(Debug, Deserialize)]
struct VectoriaSection {
    #[serde(default)]
    index: IndexSection,
    #[serde(default)]
    server: ServerSection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct IndexSection {
    dimensions: Option<usize>,
    #[serde(default = "default_max_connections")]
    max_connections_per_vertex: usize,
    #[serde(default = "default_max_candidates")]
    max_candidates_returned: usize,
    #[serde(default = "default_compression_ratio")]
    compression_ratio: u32,
    #[serde(default = "default_distance_multiplier")]
    distance_multiplier: f32,
    #[serde(default)]
    building: BuildingSection,
    #[serde(default)]
    search: SearchSection,
}

impl Default for IndexSection {
    fn default() -> Self {
        IndexSection {
            dimensions: None,
            max_connections_per_vertex: default_max_connections(),
            max_candidates_returned: default_max_candidates(),
            compression_ratio: default_compression_ratio(),
            distance_multiplier: default_distance_multiplier(),
            building: BuildingSection::default(),
            search: SearchSection::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct BuildingSection {
    max_memory_consumption: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct SearchSection {
    disk_cache_memory_consumption: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ServerSection {
    base_path: Option<PathBuf>,
    #[serde(default = "default_mode")]
    default_mode: ModeKind,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            base_path: None,
            default_mode: default_mode(),
        }
    }
}

fn default_max_connections() -> usize {
    16
}

fn default_max_candidates() -> usize {
    128
}

fn default_compression_ratio() -> u32 {
    32
}

fn default_distance_multiplier() -> f32 {
    1.0
}

fn default_mode() -> ModeKind {
    ModeKind::Build
}

const DEFAULT_CONFIG_YAML: &str = "\
vectoriadb:
  index:
    dimensions: 128
    max-connections-per-vertex: 16
    max-candidates-returned: 128
    compression-ratio: 32
    distance-multiplier: 1.0
  server:
    default-mode: build
";

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_memory_suffixes() {
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert_eq!(parse_memory("512b").unwrap(), 512);
        assert_eq!(parse_memory("2k").unwrap(), 2048);
        assert_eq!(parse_memory("2kb").unwrap(), 2048);
        assert_eq!(parse_memory("3m").unwrap(), 3 * 1024 * 1024);
        assert_eq!(parse_memory("3MB").unwrap(), 3 * 1024 * 1024);
        assert_eq!(parse_memory("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1Gb").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_rejects_garbage() {
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("12q").is_err());
        assert!(parse_memory("").is_err());
    }

    #[test]
    fn test_load_seeds_default_config() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();

        assert_eq!(config.dimensions, 128);
        assert_eq!(config.default_mode, ModeKind::Build);
        assert!(dir.path().join("config").join(CONFIG_YAML).exists());
        assert!(dir.path().join("indexes").is_dir());
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn test_load_parses_overrides() {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join(CONFIG_YAML),
            "vectoriadb:\n  index:\n    dimensions: 3\n    building:\n      max-memory-consumption: \"64m\"\n  server:\n    default-mode: search\n",
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.dimensions, 3);
        assert_eq!(config.default_mode, ModeKind::Search);
        assert_eq!(config.index_building_max_memory, Some(64 * 1024 * 1024));
        assert_eq!(config.disk_cache_memory, None);
    }

    #[test]
    fn test_missing_dimensions_is_an_error() {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join(CONFIG_YAML), "vectoriadb:\n  server:\n    default-mode: build\n").unwrap();

        assert!(Config::load(dir.path()).is_err());
    }
}
