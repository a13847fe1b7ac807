//! Resolution of the unprivileged identity used by the setuid restart.

use nix::unistd::{Gid, Group, Uid, User};
use thiserror::Error;

use crate::config::schema::SetuidConfig;

#[derive(Debug, Error)]
pub enum SetuidError {
    #[error("unknown user {0:?}")]
    UnknownUser(String),
    #[error("unknown group {0:?}")]
    UnknownGroup(String),
    #[error("cannot look up {name:?}: {source}")]
    Lookup {
        name: String,
        #[source]
        source: nix::Error,
    },
}

/// Credentials the restarted child runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetuidTarget {
    pub uid: Uid,
    pub gid: Gid,
}

impl SetuidTarget {
    /// Look up `user` and `group` in the system databases.
    ///
    /// An empty `group` selects the user's primary group.
    pub fn resolve(user: &str, group: &str) -> Result<Self, SetuidError> {
        let entry = User::from_name(user)
            .map_err(|source| SetuidError::Lookup {
                name: user.to_string(),
                source,
            })?
            .ok_or_else(|| SetuidError::UnknownUser(user.to_string()))?;

        let gid = if group.is_empty() {
            entry.gid
        } else {
            Group::from_name(group)
                .map_err(|source| SetuidError::Lookup {
                    name: group.to_string(),
                    source,
                })?
                .ok_or_else(|| SetuidError::UnknownGroup(group.to_string()))?
                .gid
        };

        Ok(Self { uid: entry.uid, gid })
    }

    pub fn from_config(config: &SetuidConfig) -> Result<Self, SetuidError> {
        Self::resolve(&config.user, &config.group)
    }

    pub fn uid_raw(&self) -> u32 {
        self.uid.as_raw()
    }

    pub fn gid_raw(&self) -> u32 {
        self.gid.as_raw()
    }
}
