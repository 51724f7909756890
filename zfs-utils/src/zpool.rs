// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities for managing Zpools.

use crate::config::Config;
use crate::host::{output_rows, BoxedExecutor, ExecutionError, Output};
use crate::property::{property_list, ParseError, ZpoolProperty};
use crate::zfs::{self, Dataset, Properties, Zfs};

use slog::{info, o, warn, Logger};
use std::str::FromStr;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Zpool execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZpoolHealth {
    /// The device is online and functioning.
    Online,
    /// One or more components are degraded or faulted, but sufficient
    /// replicas exist to continue functioning.
    Degraded,
    /// One or more components are degraded or faulted, and insufficient
    /// replicas exist to continue functioning.
    Faulted,
    /// The device was explicitly taken offline by "zpool offline".
    Offline,
    /// The device was physically removed.
    Removed,
    /// The device could not be opened.
    Unavailable,
}

impl FromStr for ZpoolHealth {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONLINE" => Ok(ZpoolHealth::Online),
            "DEGRADED" => Ok(ZpoolHealth::Degraded),
            "FAULTED" => Ok(ZpoolHealth::Faulted),
            "OFFLINE" => Ok(ZpoolHealth::Offline),
            "REMOVED" => Ok(ZpoolHealth::Removed),
            "UNAVAIL" => Ok(ZpoolHealth::Unavailable),
            _ => Err(ParseError(format!("Unrecognized zpool 'health': {s}"))),
        }
    }
}

/// Describes a Zpool.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ZpoolInfo {
    pub name: String,
    /// `None` if the pool did not report its health.
    pub health: Option<ZpoolHealth>,
    pub allocated: u64,
    pub size: u64,
    pub free: u64,
    /// Percentage.
    pub fragmentation: u64,
    pub readonly: bool,
    pub freeing: u64,
    pub leaked: u64,
    pub dedupratio: f64,
}

impl ZpoolInfo {
    /// Builds a pool from the rows of `zpool get -H <props> <name>`, each of
    /// which is `name, property, value, source`.
    ///
    /// Properties other than those the crate tracks are skipped.
    pub fn from_rows<R, S>(
        name: &str,
        rows: &[R],
        exact_sizes: bool,
    ) -> Result<ZpoolInfo, ParseError>
    where
        R: AsRef<[S]>,
        S: AsRef<str>,
    {
        let mut pool =
            ZpoolInfo { name: name.to_string(), ..Default::default() };
        for row in rows {
            let row = row.as_ref();
            let [_, property, value, ..] = row else {
                return Err(ParseError(format!(
                    "Expected at least 3 columns in zpool get output, found {}",
                    row.len()
                )));
            };
            let Ok(property) = property.as_ref().parse::<ZpoolProperty>()
            else {
                continue;
            };
            property.apply(&mut pool, value.as_ref(), exact_sizes)?;
        }
        Ok(pool)
    }

    /// Lists every dataset in this pool.
    pub fn datasets(&self, zfs: &Zfs) -> Result<Vec<Dataset>, zfs::Error> {
        zfs.datasets(Some(&self.name))
    }

    /// Lists every snapshot in this pool.
    pub fn snapshots(&self, zfs: &Zfs) -> Result<Vec<Dataset>, zfs::Error> {
        zfs.snapshots(Some(&self.name))
    }
}

/// Wraps commands for interacting with Zpools.
pub struct Zpool {
    log: Logger,
    executor: BoxedExecutor,
    config: Config,
}

impl Zpool {
    pub fn new(log: &Logger, executor: BoxedExecutor, config: Config) -> Self {
        Self { log: log.new(o!("component" => "Zpool")), executor, config }
    }

    fn execute<I, S>(&self, args: I) -> Result<Output, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = self.config.zpool_command();
        cmd.args(args);
        Ok(self.executor.execute(&mut cmd)?)
    }

    /// Retrieves the properties of a single pool.
    pub fn get(&self, name: &str) -> Result<ZpoolInfo, Error> {
        let platform = self.config.platform;
        let props = property_list(platform.zpool_properties());
        let flags = if platform.exact_zpool_sizes() { "-Hp" } else { "-H" };
        let output = self.execute(["get", flags, props.as_str(), name])?;
        let pool = ZpoolInfo::from_rows(
            name,
            &output_rows(&output),
            platform.exact_zpool_sizes(),
        )?;
        Ok(pool)
    }

    /// Lists every imported pool.
    pub fn list(&self) -> Result<Vec<ZpoolInfo>, Error> {
        let output = self.execute(["list", "-Ho", "name"])?;
        output_rows(&output)
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .map(|name| self.get(&name))
            .collect()
    }

    /// Creates a pool from `vdevs`, which are passed through verbatim
    /// (e.g. `mirror`, `/dev/dsk/c1t0d0`).
    pub fn create(
        &self,
        name: &str,
        properties: &Properties,
        vdevs: &[&str],
    ) -> Result<ZpoolInfo, Error> {
        let mut args = vec!["create".to_string()];
        for (k, v) in properties {
            args.push("-o".to_string());
            args.push(format!("{k}={v}"));
        }
        args.push(name.to_string());
        args.extend(vdevs.iter().map(|vdev| vdev.to_string()));
        self.execute(args)?;
        info!(self.log, "created zpool"; "name" => name, "vdevs" => ?vdevs);
        self.get(name)
    }

    pub fn destroy(&self, name: &str) -> Result<(), Error> {
        self.execute(["destroy", name]).inspect_err(|err| {
            warn!(
                self.log,
                "failed to destroy zpool";
                "name" => name,
                "err" => %err,
            );
        })?;
        info!(self.log, "destroyed zpool"; "name" => name);
        Ok(())
    }
}
