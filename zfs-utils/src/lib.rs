// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrappers around the `zfs` and `zpool` commands.
//!
//! Every command is run through a [host::Executor], so that callers choose
//! between the real host ([host::HostExecutor]) and a scripted fake
//! ([host::FakeExecutor]).

pub mod config;
pub mod diff;
pub mod host;
pub mod property;
pub mod zfs;
pub mod zpool;

pub use config::{Config, Platform};
pub use diff::{ChangeType, DiffError, InodeChange, InodeType};
pub use zfs::{Dataset, DatasetType, Zfs};
pub use zpool::{Zpool, ZpoolInfo};

#[cfg(test)]
pub(crate) fn test_log() -> slog::Logger {
    use slog::Drain;

    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    slog::Logger::root(drain, slog::o!())
}
