//! Deployment environment and command-line flags.
//!
//! # Responsibilities
//! - Resolve the deployment environment tag (dev/test/prod) once per context
//! - Parse command-line flags, including options registered by hooks
//!
//! # Design Decisions
//! - Resolution is cached: later calls never re-read the process environment
//!   unless a reset is forced
//! - A failed resolution leaves the cached value untouched
//! - Go-style single-dash long options (`-env prod`) are accepted

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use thiserror::Error;

/// Default name of the variable consulted when no candidate is supplied.
pub const ENV_VARIABLE: &str = "ENV";

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "./conf/config.toml";

/// Deployment environment. Selects the configuration section in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Environment {
    Dev,
    Test,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Test => "test",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(Environment::Dev),
            "test" => Ok(Environment::Test),
            "prod" => Ok(Environment::Prod),
            other => Err(EnvError::Invalid(other.to_string())),
        }
    }
}

/// Error type for environment resolution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("wrong environment definition: {0:?}, correct variants: dev, test, prod")]
    Invalid(String),
    #[error("environment is not resolved yet")]
    Unresolved,
}

/// Holds the resolved environment for one application context.
pub struct EnvironmentRegistry {
    variable: String,
    current: Mutex<Option<Environment>>,
}

impl EnvironmentRegistry {
    /// Registry reading the standard `ENV` variable.
    pub fn new() -> Self {
        Self::with_variable(ENV_VARIABLE)
    }

    /// Registry reading a custom variable name.
    pub fn with_variable(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            current: Mutex::new(None),
        }
    }

    /// Name of the process environment variable this registry falls back to.
    pub fn variable(&self) -> &str {
        &self.variable
    }

    /// Resolve the environment.
    ///
    /// Without `force_reset` a cached value wins. Otherwise an explicit
    /// `candidate` is validated and cached; with no candidate the
    /// environment variable is read and validated.
    pub fn resolve(
        &self,
        force_reset: bool,
        candidate: Option<&str>,
    ) -> Result<Environment, EnvError> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if !force_reset {
            if let Some(env) = *current {
                return Ok(env);
            }
        }

        let resolved = match candidate {
            Some(tag) => tag.parse::<Environment>()?,
            None => std::env::var(&self.variable)
                .unwrap_or_default()
                .parse::<Environment>()?,
        };
        *current = Some(resolved);
        Ok(resolved)
    }

    /// The cached environment, if any.
    pub fn current(&self) -> Result<Environment, EnvError> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ok_or(EnvError::Unresolved)
    }

    /// Forget the cached value.
    pub fn reset(&self) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Whether the fallback variable is unset or empty.
    pub fn variable_is_empty(&self) -> bool {
        std::env::var_os(&self.variable).map_or(true, |v| v.is_empty())
    }
}

impl Default for EnvironmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in command-line options.
#[derive(Debug, Parser)]
#[command(about = "Service bootstrap toolkit")]
pub struct Cli {
    /// dev|test|prod environment. Selects the configuration section in use.
    /// Falls back to the ENV variable, then to "prod".
    #[arg(long)]
    pub env: Option<String>,

    /// Path to the configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

/// Flat view of every parsed option, hook-registered ones included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLineFlags {
    values: BTreeMap<String, String>,
}

impl CommandLineFlags {
    /// Parse `args` (program name first) with the built-in options plus
    /// whatever `extend` registers.
    pub fn parse<I, T>(
        args: I,
        extend: impl FnOnce(clap::Command) -> clap::Command,
    ) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let command = extend(Cli::command());
        let args = normalize_single_dash(&command, args.into_iter().map(Into::into).collect());
        let matches = command.try_get_matches_from(args)?;
        let cli = Cli::from_arg_matches(&matches)?;

        let mut values = collect_values(&matches);
        values.remove("env");
        if let Some(env) = cli.env.filter(|e| !e.is_empty()) {
            values.insert("env".to_string(), env);
        }
        values.insert("config".to_string(), cli.config.display().to_string());
        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Explicit `--env` value, if one was given.
    pub fn env(&self) -> Option<&str> {
        self.get("env")
    }

    /// Configuration file path (defaulted).
    pub fn config_path(&self) -> PathBuf {
        PathBuf::from(self.get("config").unwrap_or(DEFAULT_CONFIG_PATH))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn collect_values(matches: &ArgMatches) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for id in matches.ids() {
        let name = id.as_str();
        if let Ok(Some(value)) = matches.try_get_one::<String>(name) {
            values.insert(name.to_string(), value.clone());
        } else if let Ok(Some(value)) = matches.try_get_one::<PathBuf>(name) {
            values.insert(name.to_string(), value.display().to_string());
        } else if let Ok(Some(value)) = matches.try_get_one::<bool>(name) {
            values.insert(name.to_string(), value.to_string());
        }
    }
    values
}

/// Rewrite `-name[=value]` into `--name[=value]` for registered long options.
fn normalize_single_dash(command: &clap::Command, args: Vec<OsString>) -> Vec<OsString> {
    let longs: Vec<&str> = command.get_arguments().filter_map(|a| a.get_long()).collect();
    let mut out = Vec::with_capacity(args.len());
    let mut rest_is_positional = false;
    for (i, arg) in args.into_iter().enumerate() {
        if i == 0 || rest_is_positional {
            out.push(arg);
            continue;
        }
        let Some(text) = arg.to_str() else {
            out.push(arg);
            continue;
        };
        if text == "--" {
            rest_is_positional = true;
            out.push(arg);
            continue;
        }
        let rewritten = text
            .strip_prefix('-')
            .filter(|rest| !rest.starts_with('-'))
            .filter(|rest| {
                let name = rest.split('=').next().unwrap_or_default();
                longs.contains(&name)
            })
            .map(|rest| OsString::from(format!("--{rest}")));
        out.push(rewritten.unwrap_or(arg));
    }
    out
}
