// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::host::{
    byte_queue::ByteQueue, error::ExecutionError, input::Input,
    output::output_to_exec_error, output::Output, output::OutputExt,
};

use async_trait::async_trait;
use itertools::Itertools;
use slog::{debug, error, info, Logger};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::str::from_utf8;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub fn command_to_string(command: &Command) -> String {
    Input::from(command).to_string()
}

/// Per-executor command counter and logger.
///
/// Each command gets the next id, which ties its "running" and "finished"
/// log lines together.
struct CommandLog {
    log: Logger,
    counter: AtomicU64,
}

impl CommandLog {
    fn new(log: Logger) -> Self {
        Self { log, counter: AtomicU64::new(0) }
    }

    fn start(&self, command: &Command) -> u64 {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        info!(
            self.log,
            "running command via executor";
            "id" => id,
            "command" => %Input::from(command),
        );
        let envs = command
            .get_envs()
            .map(|(k, v)| format!("{k:?}={v:?}"))
            .join(" ");
        if !envs.is_empty() {
            debug!(self.log, "command environment"; "id" => id, "envs" => envs);
        }
        id
    }

    /// Logs a completed command, and turns a non-zero exit into an error.
    fn finish(
        &self,
        id: u64,
        command: String,
        output: Output,
    ) -> Result<Output, ExecutionError> {
        let success = output.status.success();
        info!(
            self.log,
            "finished running command via executor";
            "id" => id,
            "result" => if success { "OK" } else { "ERROR" },
            "status" => output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string()),
        );
        let streams = [("stdout", &output.stdout), ("stderr", &output.stderr)];
        for (name, bytes) in streams {
            if !bytes.is_empty() {
                debug!(
                    self.log,
                    "finished command output";
                    "id" => id,
                    "stream" => name,
                    "content" => from_utf8(bytes).unwrap_or("<Not valid UTF-8>"),
                );
            }
        }

        if !success {
            return Err(output_to_exec_error(command, &output));
        }
        Ok(output)
    }

    fn start_failed(
        &self,
        id: u64,
        command: String,
        err: std::io::Error,
    ) -> ExecutionError {
        error!(self.log, "could not start program"; "id" => id, "err" => %err);
        ExecutionError::ExecutionStart { command, err }
    }
}

/// Describes the commonly-used "safe-to-reference" type describing the
/// Executor as a trait object.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Describes an "executor", which can run [Command]s and return a response.
///
/// - In production, this is usually simply a [HostExecutor].
/// - Under test, this can be customized, and a [FakeExecutor] may be used.
///
/// Every command run through an executor is logged to the executor's own
/// [Logger]; there is no process-wide logging hook.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executes a task, waiting for it to complete, and returning output.
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError>;

    /// Executes a task, waiting for it to complete, and returning output.
    fn execute(&self, command: &mut Command) -> Result<Output, ExecutionError>;

    /// Spawns a task, without waiting for it to complete.
    ///
    /// The child's stdin, stdout and stderr are all piped.
    fn spawn(
        &self,
        command: &mut Command,
    ) -> Result<BoxedChild, ExecutionError>;
}

/// Handler called when spawning a fake child process
pub type SpawnFn = dyn FnMut(&mut FakeChild) + Send + Sync;
pub type BoxedSpawnFn = Box<SpawnFn>;

/// Handler called when awaiting a fake child process
pub type WaitFn = dyn FnMut(&mut FakeChild) -> Output + Send + Sync;
pub type BoxedWaitFn = Box<WaitFn>;

struct FakeExecutorInner {
    commands: CommandLog,
    spawn_handler: Mutex<BoxedSpawnFn>,
    wait_handler: Mutex<BoxedWaitFn>,
}

impl FakeExecutorInner {
    fn wait(&self, child: &mut FakeChild) -> Result<Output, ExecutionError> {
        let output = self.wait_handler.lock().unwrap()(child);
        self.commands.finish(child.id, child.command_str(), output)
    }
}

/// An executor which can expect certain inputs, and respond with specific
/// outputs.
///
/// Running a command calls the spawn handler and then the wait handler; a
/// spawned child only reaches the wait handler once it is waited on.
pub struct FakeExecutor {
    inner: Arc<FakeExecutorInner>,
}

impl FakeExecutor {
    pub fn new(log: Logger) -> Arc<FakeExecutor> {
        Arc::new(Self {
            inner: Arc::new(FakeExecutorInner {
                commands: CommandLog::new(log),
                spawn_handler: Mutex::new(Box::new(|_child| ())),
                wait_handler: Mutex::new(Box::new(|_child| Output::success())),
            }),
        })
    }

    /// Set the spawn handler to an arbitrary function.
    pub fn set_spawn_handler(&self, f: BoxedSpawnFn) {
        *self.inner.spawn_handler.lock().unwrap() = f;
    }

    /// Set the wait handler to an arbitrary function.
    pub fn set_wait_handler(&self, f: BoxedWaitFn) {
        *self.inner.wait_handler.lock().unwrap() = f;
    }

    /// Perform some type coercion to access a commonly-used trait object.
    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }

    fn spawn_fake(&self, command: &Command) -> Box<FakeChild> {
        let id = self.inner.commands.start(command);
        let mut child = FakeChild::new(id, command, self.inner.clone());
        self.inner.spawn_handler.lock().unwrap()(&mut child);
        child
    }

    fn run_fake(&self, command: &Command) -> Result<Output, ExecutionError> {
        let mut child = self.spawn_fake(command);
        self.inner.wait(&mut child)
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    // NOTE: We aren't actually performing any async operations -- it's up to
    // the caller to control the (synchronous) handlers.
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        self.run_fake(command.as_std())
    }

    fn execute(&self, command: &mut Command) -> Result<Output, ExecutionError> {
        self.run_fake(command)
    }

    fn spawn(
        &self,
        command: &mut Command,
    ) -> Result<BoxedChild, ExecutionError> {
        Ok(self.spawn_fake(command))
    }
}

/// Runs commands on the real host.
pub struct HostExecutor {
    commands: Arc<CommandLog>,
}

impl HostExecutor {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self { commands: Arc::new(CommandLog::new(log)) })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        let id = self.commands.start(command.as_std());
        let command_str = command_to_string(command.as_std());
        match command.output().await {
            Ok(output) => self.commands.finish(id, command_str, output),
            Err(err) => Err(self.commands.start_failed(id, command_str, err)),
        }
    }

    fn execute(&self, command: &mut Command) -> Result<Output, ExecutionError> {
        let id = self.commands.start(command);
        let command_str = command_to_string(command);
        match command.output() {
            Ok(output) => self.commands.finish(id, command_str, output),
            Err(err) => Err(self.commands.start_failed(id, command_str, err)),
        }
    }

    fn spawn(
        &self,
        command: &mut Command,
    ) -> Result<BoxedChild, ExecutionError> {
        let id = self.commands.start(command);
        let command_str = command_to_string(command);
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                self.commands.start_failed(id, command_str.clone(), err)
            })?;
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut bytes = Vec::new();
                pipe.read_to_end(&mut bytes).map(|_| bytes)
            })
        });
        Ok(Box::new(SpawnedChild {
            commands: self.commands.clone(),
            id,
            command_str,
            child: Some(child),
            stderr,
        }))
    }
}

/// A wrapper around a spawned [Child] process.
pub type BoxedChild = Box<dyn Child>;

/// A child process spawned by the executor.
///
/// Its stdio handles can each be taken once; [Child::wait] collects whatever
/// remains along with the exit status.
pub trait Child: Send {
    /// The command line used to spawn this child, for diagnostics.
    fn command_str(&self) -> String;

    /// Accesses the stdin of the spawned child, as a Writer.
    fn stdin(&mut self) -> Option<Box<dyn Write + Send>>;

    /// Accesses the stdout of the spawned child, as a Reader.
    fn stdout(&mut self) -> Option<Box<dyn Read + Send>>;

    /// Accesses the stderr of the spawned child, as a Reader.
    fn stderr(&mut self) -> Option<Box<dyn Read + Send>>;

    /// Waits for the child to complete, and returns the output.
    fn wait(&mut self) -> Result<Output, ExecutionError>;
}

/// A real, host-controlled child process
///
/// Stderr is read on a background thread from the moment the child is
/// spawned, so the child never blocks on a full stderr pipe while the
/// caller is busy with stdin or stdout.
pub struct SpawnedChild {
    commands: Arc<CommandLog>,
    id: u64,
    command_str: String,
    child: Option<std::process::Child>,
    stderr: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
}

impl SpawnedChild {
    fn handle(&mut self) -> Option<&mut std::process::Child> {
        self.child.as_mut()
    }

    /// Blocks until the child closes stderr, and returns everything it
    /// wrote there.
    fn collect_stderr(&mut self) -> Option<std::io::Result<Vec<u8>>> {
        let reader = self.stderr.take()?;
        Some(reader.join().unwrap_or_else(|_| {
            Err(std::io::Error::other("stderr reader panicked"))
        }))
    }
}

impl Child for SpawnedChild {
    fn command_str(&self) -> String {
        self.command_str.clone()
    }

    fn stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        let stdin = self.handle()?.stdin.take()?;
        Some(Box::new(stdin))
    }

    fn stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        let stdout = self.handle()?.stdout.take()?;
        Some(Box::new(stdout))
    }

    // Waits for the child to close stderr.
    fn stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        let stderr = self.collect_stderr()?.ok()?;
        Some(Box::new(std::io::Cursor::new(stderr)))
    }

    fn wait(&mut self) -> Result<Output, ExecutionError> {
        let command = self.command_str.clone();
        let Some(child) = self.child.take() else {
            return Err(ExecutionError::ExecutionStart {
                command,
                err: std::io::Error::other("child already awaited"),
            });
        };
        let mut output = match child.wait_with_output() {
            Ok(output) => output,
            Err(err) => {
                return Err(ExecutionError::ExecutionStart { command, err });
            }
        };
        match self.collect_stderr() {
            Some(Ok(stderr)) => output.stderr = stderr,
            Some(Err(err)) => {
                return Err(ExecutionError::Stream { command, err });
            }
            None => (),
        }
        self.commands.finish(self.id, command, output)
    }
}

/// A child spawned by a [FakeExecutor].
pub struct FakeChild {
    id: u64,
    command: Command,
    executor: Arc<FakeExecutorInner>,
    stdin: ByteQueue,
    stdout: ByteQueue,
    stderr: ByteQueue,
}

impl FakeChild {
    fn new(
        id: u64,
        command: &Command,
        executor: Arc<FakeExecutorInner>,
    ) -> Box<Self> {
        // Command is neither Clone nor Copy, so rebuild the parts handlers
        // may inspect.
        let mut copy = Command::new(command.get_program());
        copy.args(command.get_args());
        copy.envs(command.get_envs().filter_map(|(k, v)| v.map(|v| (k, v))));

        Box::new(FakeChild {
            id,
            command: copy,
            executor,
            stdin: ByteQueue::new(),
            stdout: ByteQueue::new(),
            stderr: ByteQueue::new(),
        })
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Everything the caller has written to the child's stdin so far.
    pub fn stdin_queue(&self) -> &ByteQueue {
        &self.stdin
    }

    /// Bytes the caller will read back from the child's stdout.
    pub fn stdout_queue(&self) -> &ByteQueue {
        &self.stdout
    }
}

impl Child for FakeChild {
    fn command_str(&self) -> String {
        command_to_string(&self.command)
    }

    fn stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        Some(Box::new(self.stdin.clone()))
    }

    fn stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        Some(Box::new(self.stdout.clone()))
    }

    fn stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        Some(Box::new(self.stderr.clone()))
    }

    fn wait(&mut self) -> Result<Output, ExecutionError> {
        let executor = self.executor.clone();
        executor.wait(self)
    }
}

/// Answers a fixed, ordered script of commands.
///
/// Every command run by the executor must equal the next scripted [Input].
/// Dropping the handler while part of the script never ran fails the test.
///
/// See: [Self::register] for integration with a [FakeExecutor].
#[derive(Default)]
pub struct StaticHandler {
    script: VecDeque<(Input, Output)>,
    seen: usize,
}

impl StaticHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the script as the wait handler of a [FakeExecutor].
    pub fn register(mut self, executor: &FakeExecutor) {
        executor.set_wait_handler(Box::new(move |child| -> Output {
            self.answer(child.command())
        }));
    }

    /// Expects a static "input" to exactly produce some "output".
    pub fn expect(&mut self, input: Input, output: Output) {
        self.script.push_back((input, output));
    }

    /// A helper for [Self::expect] which quietly succeeds.
    pub fn expect_ok<S: AsRef<str>>(&mut self, input: S) {
        self.expect(Input::shell(input), Output::success())
    }

    /// A helper for [Self::expect] which succeeds, printing `stdout`.
    pub fn expect_stdout<S: AsRef<str>, T: AsRef<str>>(
        &mut self,
        input: S,
        stdout: T,
    ) {
        self.expect(Input::shell(input), Output::success().set_stdout(stdout))
    }

    /// A helper for [Self::expect] which quietly fails.
    pub fn expect_fail<S: AsRef<str>>(&mut self, input: S) {
        self.expect(Input::shell(input), Output::failure())
    }

    fn answer(&mut self, command: &Command) -> Output {
        let observed = Input::from(command);
        let call = self.seen;
        self.seen += 1;
        let Some((expected, output)) = self.script.pop_front() else {
            panic!("Unexpected command #{call}: {observed}");
        };
        assert_eq!(observed, expected, "Unexpected input for command #{call}");
        output
    }
}

impl Drop for StaticHandler {
    fn drop(&mut self) {
        let Some((next, _)) = self.script.front() else {
            return;
        };
        let errmsg = format!(
            "Only saw {} calls, {} more expected\nNext would have been: {next}",
            self.seen,
            self.script.len(),
        );
        if std::thread::panicking() {
            eprintln!("{errmsg}");
        } else {
            panic!("{errmsg}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_log;

    #[test]
    fn static_handler_replays_script() {
        let executor = FakeExecutor::new(test_log());
        let mut handler = StaticHandler::new();
        handler.expect_stdout("/usr/sbin/zpool list -Ho name", "tank\n");
        handler.expect_fail("/usr/sbin/zpool destroy tank");
        handler.register(&executor);

        let mut list = Command::new("/usr/sbin/zpool");
        list.args(["list", "-Ho", "name"]);
        let output = executor.execute(&mut list).unwrap();
        assert_eq!(output.stdout, b"tank\n");

        let mut destroy = Command::new("/usr/sbin/zpool");
        destroy.args(["destroy", "tank"]);
        let err = executor.execute(&mut destroy).unwrap_err();
        assert!(
            matches!(&err, ExecutionError::CommandFailure(info)
                if info.command == "/usr/sbin/zpool destroy tank"),
            "{err}"
        );
    }

    #[test]
    #[should_panic(expected = "Unexpected input")]
    fn static_handler_rejects_other_commands() {
        let executor = FakeExecutor::new(test_log());
        let mut handler = StaticHandler::new();
        handler.expect_ok("/usr/sbin/zfs list");
        handler.register(&executor);

        let mut cmd = Command::new("/usr/sbin/zfs");
        cmd.arg("destroy");
        let _ = executor.execute(&mut cmd);
    }

    #[test]
    #[should_panic(expected = "Only saw 0 calls")]
    fn static_handler_requires_every_command() {
        let mut handler = StaticHandler::new();
        handler.expect_ok("/usr/sbin/zfs list");
        drop(handler);
    }

    #[test]
    fn host_executor_reports_failure() {
        let executor = HostExecutor::new(test_log());
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf out; printf err >&2; exit 3"]);

        let info = match executor.execute(&mut cmd) {
            Err(ExecutionError::CommandFailure(info)) => info,
            other => panic!("unexpected result: {other:?}"),
        };
        assert_eq!(info.status.code(), Some(3));
        assert_eq!(info.stdout, "out");
        assert_eq!(info.stderr, "err");
    }

    #[test]
    fn host_executor_spawn_pipes_stdio() {
        let executor = HostExecutor::new(test_log());
        let mut cmd = Command::new("cat");
        let mut child = executor.spawn(&mut cmd).unwrap();

        let mut stdin = child.stdin().unwrap();
        stdin.write_all(b"piped").unwrap();
        drop(stdin);

        let mut out = String::new();
        child.stdout().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "piped");
        child.wait().unwrap();
    }

    #[test]
    fn host_executor_spawn_drains_stderr() {
        // Fills stderr well past a pipe's capacity before touching stdin.
        let executor = HostExecutor::new(test_log());
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "head -c 262144 /dev/zero >&2; cat; exit 2"]);
        let mut child = executor.spawn(&mut cmd).unwrap();

        let mut stdin = child.stdin().unwrap();
        stdin.write_all(b"piped").unwrap();
        drop(stdin);

        let mut out = String::new();
        child.stdout().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "piped");

        let Err(ExecutionError::CommandFailure(info)) = child.wait() else {
            panic!("expected the exit status to be reported");
        };
        assert_eq!(info.stderr.len(), 262144);
    }
}
