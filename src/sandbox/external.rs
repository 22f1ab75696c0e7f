use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::ExternalConfig;
use crate::rules::{ByteSize, ResourceEnvelope};

use super::{CommandSpec, DEVICE_NODES, IsolationError, Isolator, JAIL_ID, SandboxHandle};

/// Confinement delegated to an `nsjail` binary
///
/// nsjail enters the namespaces and applies the rlimits itself; this side
/// only translates the envelope into its command line. Without `--chroot`
/// nsjail starts from an empty tmpfs root, so the program sees nothing but
/// the bind mounts listed here. The nsjail process leads the supervised
/// session, so the watchdog's group kill reaches it.
pub struct ExternalJail {
    config: ExternalConfig,
}

impl ExternalJail {
    pub fn build(config: ExternalConfig) -> Result<Self, IsolationError> {
        if !config.nsjail_path.is_file() {
            return Err(IsolationError::Setup(format!(
                "nsjail binary not found at {}",
                config.nsjail_path.display()
            )));
        }
        Ok(Self { config })
    }

    /// Command line arguments passed to nsjail, excluding the binary itself
    pub fn nsjail_args(&self, spec: &CommandSpec, envelope: &ResourceEnvelope) -> Vec<String> {
        let address_space =
            (envelope.memory_bytes as f64 * self.config.memory_headroom / (1024.0 * 1024.0)).ceil();
        let file_size = ByteSize(envelope.file_size_bytes).megabytes_ceil().max(1);
        // nsjail's own timer backs up the watchdog, never preempts it
        let time_limit = envelope.wall_time.as_secs().saturating_add(1);
        let cpu = envelope.cpu_time.as_secs_f64().ceil().max(1.0) as u64;

        let mut args: Vec<String> = vec![
            "--mode".into(),
            "o".into(),
            "--really_quiet".into(),
            "--user".into(),
            JAIL_ID.to_string(),
            "--group".into(),
            JAIL_ID.to_string(),
            "--cwd".into(),
            spec.cwd.display().to_string(),
            "--time_limit".into(),
            time_limit.to_string(),
            "--rlimit_as".into(),
            format!("{address_space}"),
            "--rlimit_cpu".into(),
            cpu.to_string(),
            "--rlimit_core".into(),
            "0".into(),
            "--rlimit_fsize".into(),
            file_size.to_string(),
            "--rlimit_nofile".into(),
            envelope.open_files.to_string(),
            "--rlimit_nproc".into(),
            envelope.processes.to_string(),
            "--env".into(),
            format!("PATH={}", self.config.path_env),
            "--env".into(),
            format!("HOME={}", spec.cwd.display()),
        ];
        for pair in &spec.env {
            args.extend(["--env".to_string(), pair.clone()]);
        }

        let readonly: Vec<&PathBuf> = self
            .config
            .readonly_paths
            .iter()
            .chain(&spec.readonly_paths)
            .filter(|p| p.exists())
            .collect();
        for path in readonly {
            args.extend(["--bindmount_ro".to_string(), path.display().to_string()]);
        }
        let devices = DEVICE_NODES.into_iter().map(Path::new).filter(|p| p.exists());
        for path in devices.chain(spec.writable_paths.iter().map(PathBuf::as_path)) {
            args.extend(["--bindmount".to_string(), path.display().to_string()]);
        }

        args.push("--".into());
        args.extend(spec.argv.iter().cloned());
        args
    }
}

impl Isolator for ExternalJail {
    fn name(&self) -> &'static str {
        "ExternalJail"
    }

    fn spawn(
        &self,
        spec: &CommandSpec,
        envelope: &ResourceEnvelope,
    ) -> Result<SandboxHandle, IsolationError> {
        if spec.argv.is_empty() {
            return Err(IsolationError::Setup("empty command".to_string()));
        }

        let mut command = Command::new(&self.config.nsjail_path);
        command.args(self.nsjail_args(spec, envelope)).env_clear();
        // SAFETY: setsid is async-signal-safe
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        SandboxHandle::spawn(command, envelope)
    }
}
