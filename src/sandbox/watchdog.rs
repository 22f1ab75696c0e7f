use std::thread;
use std::time::{Duration, Instant};

use crate::config::WatchdogConfig;
use crate::rules::ResourceEnvelope;

use super::handle::{ExitInfo, SandboxHandle};
use super::{IsolationError, KillCause, RawOutcome, procfs};

/// Upper bound for collecting output once the process group is gone
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(1);
/// Polling step while waiting out the grace period
const GRACE_STEP: Duration = Duration::from_millis(10);

/// Supervises a sandboxed process until it exits or breaks its envelope
///
/// Wall time, resident memory of the whole process tree and the shared output
/// budget are polled; CPU time is left to the kernel rlimit and recognized
/// afterwards from the terminating signal.
#[derive(Debug, Clone)]
pub struct Watchdog {
    poll_interval: Duration,
    grace: Duration,
}

impl From<&WatchdogConfig> for Watchdog {
    fn from(config: &WatchdogConfig) -> Self {
        Self::new(config.poll_interval(), config.grace())
    }
}

impl Watchdog {
    pub fn new(poll_interval: Duration, grace: Duration) -> Self {
        Self {
            poll_interval,
            grace,
        }
    }

    pub fn supervise(
        &self,
        mut handle: SandboxHandle,
        envelope: &ResourceEnvelope,
    ) -> Result<RawOutcome, IsolationError> {
        let pid = handle.pid();
        let mut cause = None;
        let mut peak_rss = 0;

        let exit = loop {
            if let Some(exit) = handle.try_reap().map_err(IsolationError::Supervise)? {
                break exit;
            }

            let elapsed = handle.elapsed();
            if elapsed >= envelope.wall_time {
                cause = Some(KillCause::WallTime);
                break self.terminate(&mut handle)?;
            }

            let rss = procfs::tree_rss(&handle.payload());
            peak_rss = peak_rss.max(rss);
            if rss > envelope.memory_bytes {
                cause = Some(KillCause::Memory);
                break self.terminate(&mut handle)?;
            }

            if handle.output_exceeded() {
                cause = Some(KillCause::Output);
                break self.terminate(&mut handle)?;
            }

            thread::sleep(self.poll_interval.min(envelope.wall_time - elapsed));
        };
        let elapsed = handle.elapsed();

        // Group members outliving the main process would otherwise keep the pipes open
        handle.kill_leftovers();

        if cause.is_none() && cpu_limit_hit(&exit, envelope) {
            cause = Some(KillCause::CpuTime);
        }
        match cause {
            Some(KillCause::Output) => log::info!(
                "Sandboxed process {pid} killed: output limit exceeded ({} bytes written)",
                handle.output_seen()
            ),
            Some(cause) => log::info!("Sandboxed process {pid} killed: {cause} limit exceeded"),
            None => {}
        }

        let (stdout, stderr) = handle.take_output(CAPTURE_TIMEOUT);
        Ok(RawOutcome {
            exit_code: exit.exit_code,
            signal: exit.signal,
            elapsed,
            cpu_time: exit.cpu_time,
            peak_memory: peak_rss.max(exit.max_rss),
            stdout,
            stderr,
            output_exceeded: handle.output_exceeded(),
            kill_cause: cause,
        })
    }

    /// SIGTERM to the program, SIGKILL once the grace period is over
    ///
    /// A keeper left alive by SIGKILL gets another grace period to reap the
    /// program before it is killed as well.
    fn terminate(&self, handle: &mut SandboxHandle) -> Result<ExitInfo, IsolationError> {
        handle.signal_payload(libc::SIGTERM);
        if let Some(exit) = self.wait_grace(handle)? {
            return Ok(exit);
        }

        log::debug!("Sandboxed process {} ignored SIGTERM", handle.pid());
        handle.signal_payload(libc::SIGKILL);
        if let Some(exit) = self.wait_grace(handle)? {
            return Ok(exit);
        }

        log::warn!("Sandbox {} did not exit after SIGKILL, killing its keeper", handle.pid());
        handle.kill_all();
        handle.reap().map_err(IsolationError::Supervise)
    }

    fn wait_grace(&self, handle: &mut SandboxHandle) -> Result<Option<ExitInfo>, IsolationError> {
        let deadline = Instant::now() + self.grace;
        loop {
            if let Some(exit) = handle.try_reap().map_err(IsolationError::Supervise)? {
                return Ok(Some(exit));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(GRACE_STEP.min(deadline - now));
        }
    }
}

fn cpu_limit_hit(exit: &ExitInfo, envelope: &ResourceEnvelope) -> bool {
    match exit.signal {
        Some(libc::SIGXCPU) => true,
        // the hard limit sits one second above the soft one
        Some(libc::SIGKILL) => exit.cpu_time >= envelope.cpu_time,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    use super::*;

    fn envelope() -> ResourceEnvelope {
        ResourceEnvelope {
            cpu_time: Duration::from_secs(5),
            wall_time: Duration::from_secs(5),
            memory_bytes: 256 << 20,
            processes: 16,
            output_bytes: 4096,
            open_files: 64,
            file_size_bytes: 1 << 20,
        }
    }

    fn spawn_sh(script: &str, envelope: &ResourceEnvelope) -> SandboxHandle {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);
        // SAFETY: setsid is async-signal-safe
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        SandboxHandle::spawn(command, envelope).unwrap()
    }

    fn watchdog() -> Watchdog {
        Watchdog::new(Duration::from_millis(20), Duration::from_millis(100))
    }

    #[test]
    fn test_normal_exit() {
        let envelope = envelope();
        let handle = spawn_sh("echo out; echo err >&2; exit 7", &envelope);
        let outcome = watchdog().supervise(handle, &envelope).unwrap();

        assert_eq!(outcome.exit_code, Some(7));
        assert_eq!(outcome.signal, None);
        assert_eq!(outcome.kill_cause, None);
        assert_eq!(outcome.stdout.to_string_lossy(), "out\n");
        assert_eq!(outcome.stderr.to_string_lossy(), "err\n");
        assert!(outcome.peak_memory > 0);
    }

    #[test]
    fn test_wall_time_kill() {
        let mut envelope = envelope();
        envelope.wall_time = Duration::from_millis(300);
        let handle = spawn_sh("sleep 30", &envelope);

        let started = Instant::now();
        let outcome = watchdog().supervise(handle, &envelope).unwrap();

        assert_eq!(outcome.kill_cause, Some(KillCause::WallTime));
        assert!(outcome.signal.is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_sigterm_is_escalated() {
        let mut envelope = envelope();
        envelope.wall_time = Duration::from_millis(200);
        let handle = spawn_sh("trap '' TERM; while :; do :; done", &envelope);

        let outcome = watchdog().supervise(handle, &envelope).unwrap();
        assert_eq!(outcome.kill_cause, Some(KillCause::WallTime));
        assert_eq!(outcome.signal, Some(libc::SIGKILL));
    }

    #[test]
    fn test_output_budget_kill() {
        let mut envelope = envelope();
        envelope.output_bytes = 1000;
        let handle = spawn_sh("while :; do echo spam; done", &envelope);

        let outcome = watchdog().supervise(handle, &envelope).unwrap();
        assert_eq!(outcome.kill_cause, Some(KillCause::Output));
        assert!(outcome.output_exceeded);
        assert!(outcome.stdout.data.len() <= 1000);
        assert!(outcome.stdout.truncated);
    }

    #[test]
    fn test_background_children_are_killed() {
        let envelope = envelope();
        let handle = spawn_sh("sleep 30 & echo started", &envelope);

        let started = Instant::now();
        let outcome = watchdog().supervise(handle, &envelope).unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.to_string_lossy(), "started\n");
        // the sleeping child held stdout; it must not stall output collection
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_cpu_limit_recognized_from_signal() {
        let exit = ExitInfo {
            exit_code: None,
            signal: Some(libc::SIGXCPU),
            cpu_time: Duration::from_secs(1),
            max_rss: 0,
        };
        assert!(cpu_limit_hit(&exit, &envelope()));

        let exit = ExitInfo {
            signal: Some(libc::SIGKILL),
            cpu_time: Duration::from_millis(10),
            ..exit
        };
        assert!(!cpu_limit_hit(&exit, &envelope()));
    }
}
