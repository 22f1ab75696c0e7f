mod capture;
mod embedded;
mod external;
mod handle;
mod isolator;
mod keeper;
pub mod procfs;
mod watchdog;

pub use capture::CapturedStream;
pub use embedded::EmbeddedJail;
pub use external::ExternalJail;
pub use handle::{ExitInfo, SandboxHandle};
pub use isolator::Isolator;
pub use watchdog::Watchdog;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::IsolatorConfig;

/// Character devices every sandboxed program gets, writable
const DEVICE_NODES: [&str; 3] = ["/dev/null", "/dev/zero", "/dev/urandom"];

/// uid and gid sandboxed programs see inside their user namespace (`nobody`)
const JAIL_ID: u32 = 65534;

/// The jail mechanism itself failed, as opposed to the program inside it
#[derive(Error, Debug)]
pub enum IsolationError {
    #[error("failed to set up the jail: {0}")]
    Setup(String),
    #[error("failed to spawn sandboxed process: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to supervise sandboxed process: {0}")]
    Supervise(#[source] io::Error),
}

/// Why the watchdog (or the kernel CPU limit) ended a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillCause {
    WallTime,
    CpuTime,
    Memory,
    Output,
}

impl fmt::Display for KillCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WallTime => "wall time",
            Self::CpuTime => "cpu time",
            Self::Memory => "memory",
            Self::Output => "output",
        })
    }
}

/// Exit status and resource usage of one sandboxed execution
#[derive(Debug, Clone)]
pub struct RawOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub elapsed: Duration,
    pub cpu_time: Duration,
    /// Bytes
    pub peak_memory: u64,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub output_exceeded: bool,
    pub kill_cause: Option<KillCause>,
}

impl RawOutcome {
    pub fn exited_cleanly(&self) -> bool {
        self.kill_cause.is_none() && self.signal.is_none() && self.exit_code == Some(0)
    }
}

/// A fully substituted command plus the filesystem view it needs
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    /// `KEY=VALUE` pairs, applied on top of a cleared environment
    pub env: Vec<String>,
    pub writable_paths: Vec<PathBuf>,
    pub readonly_paths: Vec<PathBuf>,
}

/// Creates the isolator selected in the configuration
pub fn create_isolator(config: &IsolatorConfig) -> Result<Box<dyn Isolator>, IsolationError> {
    match config {
        IsolatorConfig::Embedded(embedded) => {
            log::info!("Creating EmbeddedJail (namespaces: {})", embedded.namespaces);
            Ok(Box::new(EmbeddedJail::build(embedded.clone())?))
        }
        IsolatorConfig::External(external) => {
            log::info!(
                "Creating ExternalJail using {}",
                external.nsjail_path.display()
            );
            Ok(Box::new(ExternalJail::build(external.clone())?))
        }
    }
}
