//! Typed path-based reader over a parsed configuration document.

use thiserror::Error;
use toml::Value;

/// Lookup failure on a [`ConfigTree`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("configuration item {path:?} not found")]
    NotFound { path: String },
    #[error("configuration item {path:?} must be {expected}")]
    TypeMismatch { path: String, expected: &'static str },
}

impl LookupError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LookupError::NotFound { .. })
    }
}

/// A configuration section with its dotted location in the document.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigTree {
    prefix: Vec<String>,
    value: Value,
}

impl ConfigTree {
    /// Wrap a document root.
    pub fn new(root: toml::Table) -> Self {
        Self {
            prefix: Vec::new(),
            value: Value::Table(root),
        }
    }

    /// Parse TOML text into a tree.
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        Ok(Self::new(text.parse::<toml::Table>()?))
    }

    /// Dotted location of this section ("" for the root).
    pub fn location(&self) -> String {
        self.prefix.join(".")
    }

    pub fn get_str(&self, path: &[&str]) -> Result<&str, LookupError> {
        self.lookup(path)?
            .as_str()
            .ok_or_else(|| self.mismatch(path, "a string"))
    }

    pub fn get_int(&self, path: &[&str]) -> Result<i64, LookupError> {
        self.lookup(path)?
            .as_integer()
            .ok_or_else(|| self.mismatch(path, "an integer"))
    }

    pub fn get_bool(&self, path: &[&str]) -> Result<bool, LookupError> {
        self.lookup(path)?
            .as_bool()
            .ok_or_else(|| self.mismatch(path, "a boolean"))
    }

    /// Sub-section at `path`; must be a table.
    pub fn section(&self, path: &[&str]) -> Result<ConfigTree, LookupError> {
        let value = self.lookup(path)?;
        if !value.is_table() {
            return Err(self.mismatch(path, "a section"));
        }
        let mut prefix = self.prefix.clone();
        prefix.extend(path.iter().map(|p| p.to_string()));
        Ok(ConfigTree {
            prefix,
            value: value.clone(),
        })
    }

    /// Like [`section`](Self::section) but a missing section is `None`.
    pub fn optional_section(&self, path: &[&str]) -> Result<Option<ConfigTree>, LookupError> {
        match self.section(path) {
            Ok(tree) => Ok(Some(tree)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn contains(&self, path: &[&str]) -> bool {
        self.lookup(path).is_ok()
    }

    /// Deserialize this section into a typed value.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T, toml::de::Error> {
        self.value.clone().try_into()
    }

    fn lookup(&self, path: &[&str]) -> Result<&Value, LookupError> {
        let mut current = &self.value;
        for (depth, key) in path.iter().enumerate() {
            let table = current
                .as_table()
                .ok_or_else(|| self.mismatch(&path[..depth], "a section"))?;
            current = table.get(*key).ok_or_else(|| LookupError::NotFound {
                path: self.dotted(&path[..=depth]),
            })?;
        }
        Ok(current)
    }

    fn mismatch(&self, path: &[&str], expected: &'static str) -> LookupError {
        LookupError::TypeMismatch {
            path: self.dotted(path),
            expected,
        }
    }

    fn dotted(&self, path: &[&str]) -> String {
        self.prefix
            .iter()
            .map(String::as_str)
            .chain(path.iter().copied())
            .collect::<Vec<_>>()
            .join(".")
    }
}
