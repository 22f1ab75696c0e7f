use std::io;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::rules::ResourceEnvelope;

use super::IsolationError;
use super::capture::{Capture, CapturedStream, OutputBudget};
use super::keeper::StatusReader;
use super::procfs::{self, StatEntry};

/// Exit status and rusage of a reaped process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub cpu_time: Duration,
    /// Bytes
    pub max_rss: u64,
}

impl ExitInfo {
    pub(super) fn from_raw(status: libc::c_int, usage: &libc::rusage) -> Self {
        let timeval = |tv: libc::timeval| {
            Duration::from_secs(tv.tv_sec.max(0) as u64)
                + Duration::from_micros(tv.tv_usec.max(0) as u64)
        };
        Self {
            exit_code: libc::WIFEXITED(status).then(|| libc::WEXITSTATUS(status)),
            signal: libc::WIFSIGNALED(status).then(|| libc::WTERMSIG(status)),
            cpu_time: timeval(usage.ru_utime) + timeval(usage.ru_stime),
            // kilobytes on Linux
            max_rss: (usage.ru_maxrss.max(0) as u64).saturating_mul(1024),
        }
    }
}

fn wait4(pid: i32, flags: libc::c_int) -> io::Result<Option<ExitInfo>> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain old data
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: both out-pointers are valid for the duration of the call
        let ret = unsafe { libc::wait4(pid, &mut status, flags, &mut usage) };
        match ret {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            0 => return Ok(None),
            _ => return Ok(Some(ExitInfo::from_raw(status, &usage))),
        }
    }
}

/// Sends `signal` to a whole process group, ignoring an already empty group
fn kill_group(pgid: i32, signal: libc::c_int) {
    // SAFETY: killpg has no memory safety preconditions
    if unsafe { libc::killpg(pgid, signal) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log::warn!("killpg({pgid}, {signal}) failed: {err}");
        }
    }
}

fn kill_pids(pids: &[i32], signal: libc::c_int) {
    for &pid in pids {
        // SAFETY: as above; a vanished pid only yields ESRCH
        unsafe { libc::kill(pid, signal) };
    }
}

/// Link to a keeper process sitting between the handle and the program
struct KeeperLink {
    status: StatusReader,
    /// An init process of the job's pid namespace runs below the keeper
    nested: bool,
}

/// The live isolation context of one sandboxed execution
///
/// The spawned process leads its own session, so its pid is also the
/// process group id. It is either the sandboxed command itself or a keeper
/// that reports the command's exit status. A handle dropped before its
/// process was reaped kills the whole group and reaps it.
pub struct SandboxHandle {
    pid: i32,
    started: Instant,
    budget: Arc<OutputBudget>,
    stdout: Option<Capture>,
    stderr: Option<Capture>,
    keeper: Option<KeeperLink>,
    exit: Option<ExitInfo>,
}

impl SandboxHandle {
    /// Spawns a command whose `pre_exec` already calls `setsid`
    pub(super) fn spawn(
        command: Command,
        envelope: &ResourceEnvelope,
    ) -> Result<Self, IsolationError> {
        Self::start(command, envelope, None)
    }

    /// Spawns a command whose `pre_exec` forks the program below a keeper
    pub(super) fn spawn_kept(
        command: Command,
        envelope: &ResourceEnvelope,
        status: StatusReader,
        nested: bool,
    ) -> Result<Self, IsolationError> {
        Self::start(command, envelope, Some(KeeperLink { status, nested }))
    }

    fn start(
        mut command: Command,
        envelope: &ResourceEnvelope,
        keeper: Option<KeeperLink>,
    ) -> Result<Self, IsolationError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(IsolationError::Spawn)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Reaping goes through wait4 to get the rusage; `Child` neither waits nor kills on drop
        let mut handle = Self {
            pid: child.id() as i32,
            started: Instant::now(),
            budget: Arc::new(OutputBudget::new(envelope.output_bytes)),
            stdout: None,
            stderr: None,
            keeper,
            exit: None,
        };
        drop(child);

        if let Some(pipe) = stdout {
            let capture = Capture::start("stdout", pipe, envelope.output_bytes, handle.budget.clone())
                .map_err(IsolationError::Spawn)?;
            handle.stdout = Some(capture);
        }
        if let Some(pipe) = stderr {
            let capture = Capture::start("stderr", pipe, envelope.output_bytes, handle.budget.clone())
                .map_err(IsolationError::Spawn)?;
            handle.stderr = Some(capture);
        }

        log::debug!("Spawned sandboxed process {}", handle.pid);
        Ok(handle)
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn pgid(&self) -> i32 {
        self.pid
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn output_exceeded(&self) -> bool {
        self.budget.exceeded()
    }

    /// Bytes read from both streams so far, including discarded ones
    pub fn output_seen(&self) -> u64 {
        self.budget.seen()
    }

    /// Reaps the process if it has exited
    pub fn try_reap(&mut self) -> io::Result<Option<ExitInfo>> {
        if self.exit.is_none() {
            if let Some(exit) = wait4(self.pid, libc::WNOHANG)? {
                self.exit = Some(self.program_exit(exit));
            }
        }
        Ok(self.exit)
    }

    pub fn reap(&mut self) -> io::Result<ExitInfo> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let exit = wait4(self.pid, 0)?
            .ok_or_else(|| io::Error::other("wait4 returned without a status"))?;
        let exit = self.program_exit(exit);
        self.exit = Some(exit);
        Ok(exit)
    }

    /// The keeper's report on the program, or the reaped process' own status
    fn program_exit(&mut self, reaped: ExitInfo) -> ExitInfo {
        match &mut self.keeper {
            Some(keeper) => keeper.status.read().unwrap_or(reaped),
            None => reaped,
        }
    }

    fn tree_entries(&self) -> Vec<StatEntry> {
        procfs::process_tree(self.pid, self.pgid()).unwrap_or_else(|e| {
            log::warn!("Failed to list processes of sandbox {}: {e}", self.pid);
            Vec::new()
        })
    }

    /// Live pids of the group and of the spawned process' descendants
    pub fn tree(&self) -> Vec<i32> {
        self.tree_entries().iter().map(|e| e.pid).collect()
    }

    /// Like `tree`, without the keeper and the namespace init
    pub fn payload(&self) -> Vec<i32> {
        self.tree_entries()
            .iter()
            .filter(|e| !self.is_keeper(e))
            .map(|e| e.pid)
            .collect()
    }

    fn is_keeper(&self, entry: &StatEntry) -> bool {
        match &self.keeper {
            Some(keeper) => entry.pid == self.pid || (keeper.nested && entry.ppid == self.pid),
            None => false,
        }
    }

    /// Signals the sandboxed program: its process group and every payload pid
    ///
    /// A keeper blocks SIGTERM and is spared SIGKILL, so it can still reap
    /// the program and clean up after it.
    pub fn signal_payload(&self, signal: libc::c_int) {
        if self.keeper.is_none() || signal != libc::SIGKILL {
            kill_group(self.pgid(), signal);
        }
        kill_pids(&self.payload(), signal);
    }

    /// SIGKILL to the group and the whole tree, keeper included
    pub fn kill_all(&self) {
        kill_group(self.pgid(), libc::SIGKILL);
        kill_pids(&self.tree(), libc::SIGKILL);
    }

    /// SIGKILL to whatever is left of the process group
    pub fn kill_leftovers(&self) {
        kill_group(self.pgid(), libc::SIGKILL);
    }

    /// Stops capturing; waits up to `timeout` for both pipes to close
    pub fn take_output(&mut self, timeout: Duration) -> (CapturedStream, CapturedStream) {
        let stdout = self.stdout.take().map(|c| c.finish(timeout)).unwrap_or_default();
        let stderr = self.stderr.take().map(|c| c.finish(timeout)).unwrap_or_default();
        (stdout, stderr)
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.exit.is_some() {
            // leftovers of the group are killed even after the process was reaped
            self.kill_leftovers();
            return;
        }

        self.kill_all();
        match self.reap() {
            Ok(_) => log::warn!("Sandboxed process {} killed on handle drop", self.pid),
            Err(e) => log::error!("Failed to reap sandboxed process {}: {e}", self.pid),
        }
    }
}
