// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities for poking at ZFS datasets.

use crate::config::Config;
use crate::diff::{parse_inode_changes, DiffError, InodeChange};
use crate::host::{
    output_rows, BoxedChild, BoxedExecutor, ExecutionError, Output,
};
use crate::property::{property_list, DatasetProperty, ParseError};

use slog::{info, o, warn, Logger};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::process::Command;

/// Properties applied at creation time with `-o key=value`.
///
/// Ordered, so that the generated command line is deterministic.
pub type Properties = BTreeMap<String, String>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("ZFS execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Dataset not found: {name}")]
    DatasetNotFound { name: String },

    #[error("Dataset {name} is a {found}, not a snapshot")]
    NotASnapshot { name: String, found: DatasetType },

    #[error("Dataset {name} is a {found}, not a filesystem")]
    NotAFilesystem { name: String, found: DatasetType },
}

#[derive(
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
)]
#[strum(serialize_all = "lowercase")]
pub enum DatasetType {
    #[default]
    Filesystem,
    Snapshot,
    Volume,
    Bookmark,
}

/// A ZFS dataset: a filesystem, volume, snapshot or bookmark.
///
/// Fields mirror the native ZFS properties of the same name; see zfs(8).
/// Properties the platform does not report are left zeroed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub origin: String,
    pub used: u64,
    pub available: u64,
    pub mountpoint: String,
    pub compression: String,
    pub dataset_type: DatasetType,
    pub volsize: u64,
    pub quota: u64,
    pub referenced: u64,
    pub written: u64,
    pub logicalused: u64,
    pub usedbydataset: u64,
}

impl Dataset {
    /// Builds a dataset from one row of `zfs list -Hp -o <properties>`.
    pub fn from_row<S: AsRef<str>>(
        properties: &[DatasetProperty],
        row: &[S],
    ) -> Result<Dataset, ParseError> {
        if row.len() != properties.len() {
            return Err(ParseError(format!(
                "Expected {} columns in zfs list output, found {}",
                properties.len(),
                row.len(),
            )));
        }
        let mut dataset = Dataset::default();
        for (property, value) in properties.iter().zip(row) {
            property.apply(&mut dataset, value.as_ref())?;
        }
        Ok(dataset)
    }

    fn expect_snapshot(&self) -> Result<(), Error> {
        if self.dataset_type != DatasetType::Snapshot {
            return Err(Error::NotASnapshot {
                name: self.name.clone(),
                found: self.dataset_type,
            });
        }
        Ok(())
    }

    fn expect_filesystem(&self) -> Result<(), Error> {
        if self.dataset_type != DatasetType::Filesystem {
            return Err(Error::NotAFilesystem {
                name: self.name.clone(),
                found: self.dataset_type,
            });
        }
        Ok(())
    }
}

bitflags::bitflags! {
    /// Options for [Zfs::destroy].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DestroyFlags: u8 {
        /// `-r`: destroy all children.
        const RECURSIVE = 0b0001;
        /// `-R`: destroy all dependents, including clones outside the
        /// hierarchy.
        const RECURSIVE_CLONES = 0b0010;
        /// `-d`: defer snapshot deletion until it is released.
        const DEFER_DELETION = 0b0100;
        /// `-f`: force an unmount of any file systems.
        const FORCE_UMOUNT = 0b1000;
    }
}

impl DestroyFlags {
    fn args(&self) -> Vec<&'static str> {
        [
            (DestroyFlags::RECURSIVE, "-r"),
            (DestroyFlags::RECURSIVE_CLONES, "-R"),
            (DestroyFlags::DEFER_DELETION, "-d"),
            (DestroyFlags::FORCE_UMOUNT, "-f"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, arg)| arg)
        .collect()
    }
}

bitflags::bitflags! {
    /// Options for [Zfs::send_snapshot].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SendFlags: u8 {
        /// `-w`: send encrypted datasets as-is.
        const RAW = 0b00001;
        /// `-R`: a replication stream of all descendants.
        const REPLICATE = 0b00010;
        /// `-p`: include dataset properties.
        const PROPERTIES = 0b00100;
        /// `-c`: keep on-disk compression.
        const COMPRESSED = 0b01000;
        /// `-L`: allow records larger than 128KiB.
        const LARGE_BLOCKS = 0b10000;
    }
}

impl SendFlags {
    fn args(&self) -> Vec<&'static str> {
        [
            (SendFlags::RAW, "-w"),
            (SendFlags::REPLICATE, "-R"),
            (SendFlags::PROPERTIES, "-p"),
            (SendFlags::COMPRESSED, "-c"),
            (SendFlags::LARGE_BLOCKS, "-L"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, arg)| arg)
        .collect()
    }
}

/// The form of an incremental send stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncrementalKind {
    /// `-i`: only the difference between the two snapshots.
    Stream,
    /// `-I`: includes every intermediate snapshot as well.
    Package,
}

impl IncrementalKind {
    fn arg(&self) -> &'static str {
        match self {
            IncrementalKind::Stream => "-i",
            IncrementalKind::Package => "-I",
        }
    }
}

fn property_args(properties: &Properties) -> Vec<String> {
    properties
        .iter()
        .flat_map(|(k, v)| ["-o".to_string(), format!("{k}={v}")])
        .collect()
}

/// Wraps commands for interacting with ZFS datasets.
pub struct Zfs {
    log: Logger,
    executor: BoxedExecutor,
    config: Config,
}

impl Zfs {
    pub fn new(log: &Logger, executor: BoxedExecutor, config: Config) -> Self {
        Self { log: log.new(o!("component" => "Zfs")), executor, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn properties(&self) -> &'static [DatasetProperty] {
        self.config.platform.dataset_properties()
    }

    /// Runs `zfs <args>`.
    ///
    /// `subject` names the dataset the command operates on, so that a
    /// "does not exist" failure can be reported as such.
    fn execute<I, S>(&self, subject: &str, args: I) -> Result<Output, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = self.config.zfs_command();
        cmd.args(args);
        self.executor.execute(&mut cmd).map_err(|err| match err.stderr() {
            Some(stderr) if stderr.contains("dataset does not exist") => {
                Error::DatasetNotFound { name: subject.to_string() }
            }
            _ => Error::from(err),
        })
    }

    fn parse_datasets(&self, output: &Output) -> Result<Vec<Dataset>, Error> {
        output_rows(output)
            .iter()
            .map(|row| {
                Dataset::from_row(self.properties(), row).map_err(Error::from)
            })
            .collect()
    }

    fn list_by_type(
        &self,
        ty: &str,
        filter: Option<&str>,
    ) -> Result<Vec<Dataset>, Error> {
        let props = property_list(self.properties());
        let mut args = vec!["list", "-rHp", "-t", ty, "-o", props.as_str()];
        args.extend(filter);
        let output = self.execute(filter.unwrap_or(""), args)?;
        self.parse_datasets(&output)
    }

    /// Lists all datasets, optionally restricted to `filter` and its
    /// descendants.
    pub fn datasets(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<Dataset>, Error> {
        self.list_by_type("all", filter)
    }

    /// Lists all snapshots.
    pub fn snapshots(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<Dataset>, Error> {
        self.list_by_type("snapshot", filter)
    }

    /// Lists all filesystems.
    pub fn filesystems(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<Dataset>, Error> {
        self.list_by_type("filesystem", filter)
    }

    /// Lists all volumes.
    pub fn volumes(&self, filter: Option<&str>) -> Result<Vec<Dataset>, Error> {
        self.list_by_type("volume", filter)
    }

    /// Lists the snapshots of `dataset` and its descendants.
    pub fn dataset_snapshots(
        &self,
        dataset: &Dataset,
    ) -> Result<Vec<Dataset>, Error> {
        self.snapshots(Some(&dataset.name))
    }

    /// Retrieves a single dataset.
    pub fn get_dataset(&self, name: &str) -> Result<Dataset, Error> {
        let props = property_list(self.properties());
        let output =
            self.execute(name, ["list", "-Hp", "-o", props.as_str(), name])?;
        self.parse_datasets(&output)?.into_iter().next().ok_or_else(|| {
            Error::Parse(ParseError(format!("No output listing {name}")))
        })
    }

    /// Lists the descendants of `dataset`, down to `depth` levels if
    /// provided. The dataset itself is not included.
    pub fn children(
        &self,
        dataset: &Dataset,
        depth: Option<u64>,
    ) -> Result<Vec<Dataset>, Error> {
        let props = property_list(self.properties());
        let mut args: Vec<String> = ["list", "-rHp", "-t", "all", "-o"]
            .into_iter()
            .map(String::from)
            .collect();
        args.push(props);
        if let Some(depth) = depth {
            args.push("-d".to_string());
            args.push(depth.to_string());
        }
        args.push(dataset.name.clone());

        let output = self.execute(&dataset.name, args)?;
        let mut datasets = self.parse_datasets(&output)?;
        if !datasets.is_empty() {
            datasets.remove(0);
        }
        Ok(datasets)
    }

    /// Creates a new filesystem.
    pub fn create_filesystem(
        &self,
        name: &str,
        properties: &Properties,
    ) -> Result<Dataset, Error> {
        let mut args = vec!["create".to_string()];
        args.extend(property_args(properties));
        args.push(name.to_string());
        self.execute(name, args)?;
        info!(self.log, "created filesystem"; "name" => name);
        self.get_dataset(name)
    }

    /// Creates a new volume of `size` bytes, creating parents as needed.
    pub fn create_volume(
        &self,
        name: &str,
        size: u64,
        properties: &Properties,
    ) -> Result<Dataset, Error> {
        let mut args = vec![
            "create".to_string(),
            "-p".to_string(),
            "-V".to_string(),
            size.to_string(),
        ];
        args.extend(property_args(properties));
        args.push(name.to_string());
        self.execute(name, args)?;
        info!(self.log, "created volume"; "name" => name, "size" => size);
        self.get_dataset(name)
    }

    /// Clones `snapshot` into a new filesystem named `dest`.
    pub fn clone_snapshot(
        &self,
        snapshot: &Dataset,
        dest: &str,
        properties: &Properties,
    ) -> Result<Dataset, Error> {
        snapshot.expect_snapshot()?;
        let mut args = vec!["clone".to_string(), "-p".to_string()];
        args.extend(property_args(properties));
        args.push(snapshot.name.clone());
        args.push(dest.to_string());
        self.execute(&snapshot.name, args)?;
        info!(
            self.log,
            "cloned snapshot";
            "snapshot" => &snapshot.name,
            "clone" => dest,
        );
        self.get_dataset(dest)
    }

    /// Takes a snapshot `<dataset>@<name>`, and of every descendant when
    /// `recursive` is set.
    pub fn snapshot(
        &self,
        dataset: &Dataset,
        name: &str,
        recursive: bool,
    ) -> Result<Dataset, Error> {
        let snapshot_name = format!("{}@{}", dataset.name, name);
        let mut args = vec!["snapshot"];
        if recursive {
            args.push("-r");
        }
        args.push(&snapshot_name);
        self.execute(&dataset.name, args)?;
        info!(self.log, "created snapshot"; "name" => &snapshot_name);
        self.get_dataset(&snapshot_name)
    }

    /// Rolls the parent filesystem back to `snapshot`.
    ///
    /// ZFS refuses unless `snapshot` is the most recent one, or
    /// `destroy_more_recent` is set.
    pub fn rollback(
        &self,
        snapshot: &Dataset,
        destroy_more_recent: bool,
    ) -> Result<(), Error> {
        snapshot.expect_snapshot()?;
        let mut args = vec!["rollback"];
        if destroy_more_recent {
            args.push("-r");
        }
        args.push(&snapshot.name);
        self.execute(&snapshot.name, args)?;
        info!(self.log, "rolled back"; "snapshot" => &snapshot.name);
        Ok(())
    }

    /// Renames `dataset` to `new_name`.
    ///
    /// `create_parent` creates missing ancestors of `new_name`;
    /// `recursive` renames the snapshots of descendants too.
    pub fn rename(
        &self,
        dataset: &Dataset,
        new_name: &str,
        create_parent: bool,
        recursive: bool,
    ) -> Result<Dataset, Error> {
        let mut args = vec!["rename"];
        if create_parent {
            args.push("-p");
        }
        if recursive {
            args.push("-r");
        }
        args.push(&dataset.name);
        args.push(new_name);
        self.execute(&dataset.name, args)?;
        info!(
            self.log,
            "renamed dataset";
            "from" => &dataset.name,
            "to" => new_name,
        );
        self.get_dataset(new_name)
    }

    /// Mounts a filesystem.
    ///
    /// `overlay` permits mounting over a non-empty directory; `options` are
    /// temporary mount options, joined with commas.
    pub fn mount(
        &self,
        dataset: &Dataset,
        overlay: bool,
        options: &[&str],
    ) -> Result<Dataset, Error> {
        dataset.expect_filesystem()?;
        let joined = options.join(",");
        let mut args = vec!["mount"];
        if overlay {
            args.push("-O");
        }
        if !options.is_empty() {
            args.push("-o");
            args.push(&joined);
        }
        args.push(&dataset.name);
        self.execute(&dataset.name, args)?;
        self.get_dataset(&dataset.name)
    }

    /// Unmounts a filesystem.
    pub fn unmount(
        &self,
        dataset: &Dataset,
        force: bool,
    ) -> Result<Dataset, Error> {
        dataset.expect_filesystem()?;
        let mut args = vec!["umount"];
        if force {
            args.push("-f");
        }
        args.push(&dataset.name);
        self.execute(&dataset.name, args)?;
        self.get_dataset(&dataset.name)
    }

    /// Destroys a dataset.
    pub fn destroy(
        &self,
        dataset: &Dataset,
        flags: DestroyFlags,
    ) -> Result<(), Error> {
        let mut args = vec!["destroy"];
        args.extend(flags.args());
        args.push(&dataset.name);
        self.execute(&dataset.name, args)?;
        info!(
            self.log,
            "destroyed dataset";
            "name" => &dataset.name,
            "flags" => ?flags,
        );
        Ok(())
    }

    /// Sets `key=value` on the dataset.
    pub fn set_property(
        &self,
        dataset: &Dataset,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        let assignment = format!("{key}={value}");
        self.execute(
            &dataset.name,
            ["set", assignment.as_str(), dataset.name.as_str()],
        )?;
        Ok(())
    }

    /// Gets the raw value of a property, or `None` if it has no value.
    pub fn get_property(
        &self,
        dataset: &Dataset,
        key: &str,
    ) -> Result<Option<String>, Error> {
        let output = self.execute(
            &dataset.name,
            ["get", "-Hp", "-o", "value", key, dataset.name.as_str()],
        )?;
        let rows = output_rows(&output);
        let value = rows
            .first()
            .and_then(|row| row.first())
            .ok_or_else(|| {
                ParseError(format!(
                    "No value for '{key}' on {}",
                    dataset.name
                ))
            })?;
        if value == crate::property::NONE_SENTINEL {
            return Ok(None);
        }
        Ok(Some(value.to_string()))
    }

    /// Writes a full send stream of `snapshot` to `output`.
    pub fn send_snapshot<W: Write>(
        &self,
        snapshot: &Dataset,
        output: &mut W,
        flags: SendFlags,
    ) -> Result<(), Error> {
        snapshot.expect_snapshot()?;
        let mut args = vec!["send"];
        args.extend(flags.args());
        args.push(&snapshot.name);
        self.send(args, output)
    }

    /// Writes an incremental send stream from `base` to `target` to
    /// `output`.
    pub fn send_snapshot_incremental<W: Write>(
        &self,
        base: &Dataset,
        target: &Dataset,
        output: &mut W,
        flags: SendFlags,
        kind: IncrementalKind,
    ) -> Result<(), Error> {
        base.expect_snapshot()?;
        target.expect_snapshot()?;
        let mut args = vec!["send"];
        args.extend(flags.args());
        args.extend([kind.arg(), base.name.as_str(), target.name.as_str()]);
        self.send(args, output)
    }

    fn send<W: Write>(
        &self,
        args: Vec<&str>,
        output: &mut W,
    ) -> Result<(), Error> {
        let mut cmd = self.config.zfs_command();
        cmd.args(args);
        let mut child = self.executor.spawn(&mut cmd)?;
        let command = child.command_str();

        let copied = match child.stdout() {
            Some(mut stdout) => std::io::copy(&mut stdout, output),
            None => Ok(0),
        };
        let bytes = self.finish_stream(&mut child, copied)?;
        info!(self.log, "sent stream"; "command" => command, "bytes" => bytes);
        Ok(())
    }

    /// Waits for a child whose stdin or stdout was just streamed.
    ///
    /// A child that exits early breaks the pipe, so its failure is reported
    /// ahead of the failed copy.
    fn finish_stream(
        &self,
        child: &mut BoxedChild,
        copied: std::io::Result<u64>,
    ) -> Result<u64, ExecutionError> {
        let command = child.command_str();
        let waited = child.wait();
        match (copied, waited) {
            (Ok(bytes), Ok(_)) => Ok(bytes),
            (Err(err), Ok(_)) => Err(ExecutionError::Stream { command, err }),
            (Ok(_), Err(failure)) => Err(failure),
            (Err(err), Err(failure)) => {
                warn!(
                    self.log,
                    "stream interrupted by failed command";
                    "command" => command,
                    "err" => %err,
                );
                Err(failure)
            }
        }
    }

    /// Receives a send stream read from `input` into the dataset `name`.
    pub fn receive_snapshot<R: Read>(
        &self,
        input: &mut R,
        name: &str,
    ) -> Result<Dataset, Error> {
        let mut cmd = self.config.zfs_command();
        cmd.args(["receive", name]);
        let mut child = self.executor.spawn(&mut cmd)?;

        // The child's stdin is dropped at the end of this block, so that
        // it observes EOF before we wait.
        let copied = match child.stdin() {
            Some(mut stdin) => {
                std::io::copy(input, &mut stdin).and_then(|bytes| {
                    stdin.flush()?;
                    Ok(bytes)
                })
            }
            None => Ok(0),
        };
        let bytes = self.finish_stream(&mut child, copied)?;
        info!(self.log, "received stream"; "name" => name, "bytes" => bytes);
        self.get_dataset(name)
    }

    fn diff_command(&self, snapshot: &str, dataset: &str) -> Command {
        let mut cmd = self.config.zfs_command();
        cmd.args(["diff", "-FHt", snapshot, dataset]);
        cmd
    }

    /// Reports every inode changed between `snapshot` and `dataset`, which
    /// is either a later snapshot of the same filesystem or the filesystem
    /// itself.
    pub fn diff(
        &self,
        snapshot: &str,
        dataset: &str,
    ) -> Result<Vec<InodeChange>, DiffError> {
        let mut cmd = self.diff_command(snapshot, dataset);
        let output = self.executor.execute(&mut cmd)?;
        parse_inode_changes(&output_rows(&output))
    }

    /// As [Self::diff], without blocking the async runtime while the
    /// command runs.
    pub async fn diff_async(
        &self,
        snapshot: &str,
        dataset: &str,
    ) -> Result<Vec<InodeChange>, DiffError> {
        let mut cmd =
            tokio::process::Command::from(self.diff_command(snapshot, dataset));
        let output = self.executor.execute_async(&mut cmd).await?;
        parse_inode_changes(&output_rows(&output))
    }
}
