// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process plumbing: running commands on the host, or faking them in tests.

mod byte_queue;
mod error;
mod executor;
mod input;
mod output;

pub use byte_queue::ByteQueue;
pub use error::{CommandFailureInfo, ExecutionError};
pub use executor::{
    command_to_string, BoxedChild, BoxedExecutor, BoxedSpawnFn, BoxedWaitFn,
    Child, Executor, FakeChild, FakeExecutor, HostExecutor, SpawnedChild,
    StaticHandler,
};
pub use input::Input;
pub use output::{output_rows, output_to_exec_error, Output, OutputExt};
