//! Layered configuration of the cache-wide defaults.
//!
//! Layers are merged in order, later ones winning:
//!
//! 1. built-in [`QueryDefaults`] and [`MutationDefaults`],
//! 2. `stash.{toml,yaml,yml,json}` in the platform configuration directory,
//! 3. files added with [`Loader::file`],
//! 4. `STASH_` environment variables, nested with `__`
//!    (`STASH_QUERY__STALE_TIME=1000`, `STASH_MUTATION__GC_TIME=never`).
//!
//! ```no_run
//! let config = stash_config::Config::load().unwrap();
//! println!("queries go stale after {:?}", config.query.stale_time);
//! ```

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use stash_mutation::MutationDefaults;
use stash_query::QueryDefaults;
use std::path::{Path, PathBuf};

const APPLICATION: &str = "stash";
const ENV_PREFIX: &str = "STASH_";
const ENV_SEPARATOR: &str = "__";
const EXTENSIONS: [&str; 4] = ["toml", "yaml", "yml", "json"];

/// Cache-wide defaults for both caches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub query: QueryDefaults,
    pub mutation: MutationDefaults,
}

impl Config {
    /// Loads with the default layers.
    pub fn load() -> Result<Self> {
        Loader::new().load()
    }

    pub fn loader() -> Loader {
        Loader::new()
    }
}

/// Builds the provider stack for [`Config`].
#[derive(Clone, Debug)]
pub struct Loader {
    config_dir: Option<PathBuf>,
    files: Vec<PathBuf>,
    env_prefix: Option<String>,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    pub fn new() -> Self {
        Self {
            config_dir: ProjectDirs::from("", "", APPLICATION).map(|dirs| dirs.config_dir().to_path_buf()),
            files: Vec::new(),
            env_prefix: Some(ENV_PREFIX.to_string()),
        }
    }

    /// Search `dir` instead of the platform configuration directory.
    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    pub fn no_config_dir(mut self) -> Self {
        self.config_dir = None;
        self
    }

    /// Merge an explicit file. Unlike the discovered files it must exist.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    pub fn no_env(mut self) -> Self {
        self.env_prefix = None;
        self
    }

    /// The merged provider stack, for callers that want to add their own layers.
    pub fn figment(&self) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(dir) = &self.config_dir {
            for extension in EXTENSIONS {
                let path = dir.join(APPLICATION).with_extension(extension);
                if path.is_file() {
                    figment = merge_file(figment, &path)?;
                }
            }
        }
        for path in &self.files {
            if !path.is_file() {
                exn::bail!(ErrorKind::NotFound(path.clone()));
            }
            figment = merge_file(figment, path)?;
        }
        if let Some(prefix) = &self.env_prefix {
            figment = figment.merge(Env::prefixed(prefix).split(ENV_SEPARATOR));
        }
        Ok(figment)
    }

    pub fn load(&self) -> Result<Config> {
        self.figment()?.extract().or_raise(|| ErrorKind::Load)
    }
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    tracing::debug!(path = %path.display(), "merging configuration file");
    let extension = path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
    Ok(match extension.as_deref() {
        Some("toml") => figment.merge(Toml::file(path)),
        Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
        Some("json") => figment.merge(Json::file(path)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
    })
}
