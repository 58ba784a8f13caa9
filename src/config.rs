use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    pub store: StoreConfig,
    pub git: GitConfig,
    pub embedded: EmbeddedConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Git,
    Embedded,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    pub backend: Backend,
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitConfig {
    /// zlib level written to `core.compression` at init.
    pub compression: i32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddedConfig {
    /// zstd level for stored payloads.
    pub compression_level: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Git,
            path: PathBuf::from("."),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self { compression: 9 }
    }
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            compression_level: 3,
        }
    }
}

#[derive(Deserialize)]
struct PartialConfig {
    store: Option<PartialStoreConfig>,
    git: Option<PartialGitConfig>,
    embedded: Option<PartialEmbeddedConfig>,
}

#[derive(Deserialize)]
struct PartialStoreConfig {
    backend: Option<Backend>,
    path: Option<PathBuf>,
}

#[derive(Deserialize)]
struct PartialGitConfig {
    compression: Option<i32>,
}

#[derive(Deserialize)]
struct PartialEmbeddedConfig {
    compression_level: Option<i32>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        // 1. Global Config (~/.config/zeitdb/config.toml)
        if let Some(dir) = dirs::config_dir() {
            let global_path = dir.join("zeitdb/config.toml");
            if global_path.exists() {
                config.merge_file(&global_path)?;
            }
        }

        // 2. Local Config (.zeitdb.toml)
        let local_path = Path::new(".zeitdb.toml");
        if local_path.exists() {
            config.merge_file(local_path)?;
        }

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config = Config::default();
        config.merge_str(content)?;
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        self.merge_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Applies only the keys present in `content`.
    fn merge_str(&mut self, content: &str) -> Result<()> {
        let partial: PartialConfig = toml::from_str(content)?;
        if let Some(s) = partial.store {
            if let Some(backend) = s.backend {
                self.store.backend = backend;
            }
            if let Some(path) = s.path {
                self.store.path = path;
            }
        }
        if let Some(g) = partial.git {
            if let Some(compression) = g.compression {
                self.git.compression = compression;
            }
        }
        if let Some(e) = partial.embedded {
            if let Some(level) = e.compression_level {
                self.embedded.compression_level = level;
            }
        }
        Ok(())
    }
}
