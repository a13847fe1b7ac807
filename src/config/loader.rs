//! Configuration loading from disk.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::schema::ServiceConfig;
use crate::config::tree::{ConfigTree, LookupError};
use crate::config::validation::{validate_config, ValidationError};
use crate::environment::Environment;

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: toml::de::Error },
    Lookup(LookupError),
    Validation(Vec<ValidationError>),
    Schema(toml::de::Error),
    /// Rejected by the application's own config check.
    User(anyhow::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "cannot read configuration file {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "cannot parse configuration file {}:\n{}", path.display(), source)
            }
            ConfigError::Lookup(e) => write!(f, "{}", e),
            ConfigError::Validation(errors) => {
                write!(f, "configuration validation failed:")?;
                for err in errors {
                    write!(f, "\n  {}", err)?;
                }
                Ok(())
            }
            ConfigError::Schema(e) => write!(f, "configuration does not match schema: {}", e),
            ConfigError::User(e) => write!(f, "application configuration error: {:#}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Lookup(e) => Some(e),
            ConfigError::Schema(e) => Some(e),
            ConfigError::User(e) => Some(e.as_ref()),
            ConfigError::Validation(_) => None,
        }
    }
}

impl From<LookupError> for ConfigError {
    fn from(e: LookupError) -> Self {
        ConfigError::Lookup(e)
    }
}

/// A parsed and validated configuration file.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    path: PathBuf,
    env: Environment,
    tree: ConfigTree,
    service: ServiceConfig,
}

impl LoadedConfig {
    /// Validate `tree` for `env` and extract the typed section.
    pub fn from_tree(path: PathBuf, env: Environment, tree: ConfigTree) -> Result<Self, ConfigError> {
        validate_config(&tree, env).map_err(ConfigError::Validation)?;
        let service = tree
            .section(&[env.as_str()])?
            .deserialize::<ServiceConfig>()
            .map_err(ConfigError::Schema)?;
        Ok(Self {
            path,
            env,
            tree,
            service,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn env(&self) -> Environment {
        self.env
    }

    /// The whole document.
    pub fn tree(&self) -> &ConfigTree {
        &self.tree
    }

    /// The section of the active environment.
    pub fn env_section(&self) -> Result<ConfigTree, LookupError> {
        self.tree.section(&[self.env.as_str()])
    }

    pub fn service(&self) -> &ServiceConfig {
        &self.service
    }
}

/// Read and parse a configuration file without validating it.
pub fn read_config(path: &Path) -> Result<ConfigTree, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    ConfigTree::parse(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path, env: Environment) -> Result<LoadedConfig, ConfigError> {
    let tree = read_config(path)?;
    LoadedConfig::from_tree(path.to_path_buf(), env, tree)
}
