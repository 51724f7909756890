// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with the command-layer configuration

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::process::Command;

pub const ZFS: &str = "/usr/sbin/zfs";
pub const ZPOOL: &str = "/usr/sbin/zpool";

/// The flavor of ZFS tooling installed on the host.
///
/// This selects which property columns are requested from `zfs list` and
/// `zpool get`, and how their values are formatted.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Oracle Solaris. Lacks several accounting properties, and `zpool get`
    /// only reports human-readable sizes.
    Solaris,
    /// OpenZFS and illumos.
    OpenZfs,
}

impl Default for Platform {
    fn default() -> Self {
        if cfg!(target_os = "solaris") {
            Platform::Solaris
        } else {
            Platform::OpenZfs
        }
    }
}

fn default_zfs() -> Utf8PathBuf {
    Utf8PathBuf::from(ZFS)
}

fn default_zpool() -> Utf8PathBuf {
    Utf8PathBuf::from(ZPOOL)
}

/// Configuration for invoking the ZFS tools
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path to the `zfs` binary.
    #[serde(default = "default_zfs")]
    pub zfs: Utf8PathBuf,
    /// Path to the `zpool` binary.
    #[serde(default = "default_zpool")]
    pub zpool: Utf8PathBuf,
    /// Optional privilege wrapper (e.g. `/usr/bin/pfexec`) which prefixes
    /// every invocation.
    #[serde(default)]
    pub pfexec: Option<Utf8PathBuf>,
    #[serde(default)]
    pub platform: Platform,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            zfs: default_zfs(),
            zpool: default_zpool(),
            pfexec: None,
            platform: Platform::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

impl Config {
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(config)
    }

    pub(crate) fn zfs_command(&self) -> Command {
        self.command(&self.zfs)
    }

    pub(crate) fn zpool_command(&self) -> Command {
        self.command(&self.zpool)
    }

    fn command(&self, binary: &Utf8Path) -> Command {
        match &self.pfexec {
            Some(pfexec) => {
                let mut cmd = Command::new(pfexec);
                cmd.arg(binary);
                cmd
            }
            None => Command::new(binary),
        }
    }
}
