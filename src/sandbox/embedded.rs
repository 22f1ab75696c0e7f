use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use crate::config::EmbeddedConfig;
use crate::rules::ResourceEnvelope;

use super::keeper::{self, Keeper};
use super::{CommandSpec, DEVICE_NODES, IsolationError, Isolator, JAIL_ID, SandboxHandle};

const ROOT_TMPFS_OPTIONS: &CStr = c"size=16m,mode=0755";

/// Confinement built from kernel primitives directly
///
/// Each execution gets fresh user, mount, pid, network, IPC and UTS
/// namespaces. Inside them a tmpfs becomes the new root, holding read-only
/// binds of the toolchain paths and writable binds of the job directories at
/// their host paths. The spawned process stays outside the pid namespace as
/// a keeper; the program runs below the namespace's init, so nothing it
/// starts survives it or sees a host process. Resource limits are applied
/// as rlimits right before `exec`.
pub struct EmbeddedJail {
    config: EmbeddedConfig,
    uid: libc::uid_t,
    gid: libc::gid_t,
}

impl EmbeddedJail {
    pub fn build(mut config: EmbeddedConfig) -> Result<Self, IsolationError> {
        if config.namespaces {
            fs::create_dir_all(&config.root_mountpoint).map_err(|e| {
                IsolationError::Setup(format!(
                    "cannot create jail root {}: {e}",
                    config.root_mountpoint.display()
                ))
            })?;
            config.root_mountpoint = fs::canonicalize(&config.root_mountpoint)
                .map_err(|e| IsolationError::Setup(format!("cannot resolve jail root: {e}")))?;
        } else {
            log::warn!(
                "EmbeddedJail runs WITHOUT namespaces: only rlimits, a private session and \
                 orphan cleanup apply, the process limit is not enforced"
            );
        }

        // SAFETY: getuid/getgid cannot fail
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Ok(Self { config, uid, gid })
    }

    fn plan(
        &self,
        spec: &CommandSpec,
        envelope: &ResourceEnvelope,
        status: &OwnedFd,
    ) -> Result<JailPlan, IsolationError> {
        let limits = RlimitPlan::new(envelope, self.config.memory_headroom, self.config.namespaces);
        let keeper = Keeper::new(status, self.config.namespaces);
        if !self.config.namespaces {
            return Ok(JailPlan {
                namespaces: None,
                keeper,
                limits,
            });
        }

        let root = &self.config.root_mountpoint;
        let mut binds: BTreeMap<PathBuf, bool> = BTreeMap::new();
        for path in self.config.readonly_paths.iter().chain(&spec.readonly_paths) {
            if path.exists() {
                binds.entry(path.clone()).or_insert(false);
            } else {
                log::debug!("Skipping missing read-only path {}", path.display());
            }
        }
        for path in DEVICE_NODES.iter().map(PathBuf::from) {
            if path.exists() {
                binds.insert(path, true);
            }
        }
        for path in &spec.writable_paths {
            if !path.exists() {
                return Err(IsolationError::Setup(format!(
                    "writable path {} does not exist",
                    path.display()
                )));
            }
            binds.insert(path.clone(), true);
        }

        let mut mounts = binds
            .into_iter()
            .map(|(path, writable)| BindMount::new(root, &path, writable))
            .collect::<Result<Vec<_>, _>>()?;
        // parents before children
        mounts.sort_by_key(|m| m.depth);

        Ok(JailPlan {
            namespaces: Some(NamespacePlan {
                uid_map: format!("{JAIL_ID} {} 1\n", self.uid).into_bytes(),
                gid_map: format!("{JAIL_ID} {} 1\n", self.gid).into_bytes(),
                root: c_path(root)?,
                mounts,
                cwd: c_path(&spec.cwd)?,
            }),
            keeper,
            limits,
        })
    }
}

impl Isolator for EmbeddedJail {
    fn name(&self) -> &'static str {
        "EmbeddedJail"
    }

    fn spawn(
        &self,
        spec: &CommandSpec,
        envelope: &ResourceEnvelope,
    ) -> Result<SandboxHandle, IsolationError> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| IsolationError::Setup("empty command".to_string()))?;
        let (status, status_writer) = keeper::status_pipe().map_err(IsolationError::Spawn)?;
        let plan = self.plan(spec, envelope, &status_writer)?;
        let nested = plan.namespaces.is_some();

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .env("PATH", &self.config.path_env)
            .env("HOME", &spec.cwd);
        for pair in &spec.env {
            match pair.split_once('=') {
                Some((key, value)) => {
                    command.env(key, value);
                }
                None => log::warn!("Ignoring malformed environment entry {pair:?}"),
            }
        }
        if plan.namespaces.is_none() {
            command.current_dir(&spec.cwd);
        }

        // SAFETY: `enter` only issues async-signal-safe system calls on
        // memory prepared before the fork
        unsafe {
            command.pre_exec(move || plan.enter());
        }
        let handle = SandboxHandle::spawn_kept(command, envelope, status, nested);
        // the keeper holds its own copy now
        drop(status_writer);
        handle
    }
}

fn c_path(path: &Path) -> Result<CString, IsolationError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| IsolationError::Setup(format!("path {} contains a NUL byte", path.display())))
}

/// Mount flags of `path` that a bind remount inside a user namespace must keep
fn locked_flags(path: &Path) -> Result<libc::c_ulong, IsolationError> {
    let c = c_path(path)?;
    // SAFETY: statvfs is plain old data and `c` is a valid C string
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c.as_ptr(), &mut stat) } != 0 {
        let e = io::Error::last_os_error();
        return Err(IsolationError::Setup(format!("statvfs {}: {e}", path.display())));
    }

    let mapping = [
        (libc::ST_NOSUID, libc::MS_NOSUID),
        (libc::ST_NODEV, libc::MS_NODEV),
        (libc::ST_NOEXEC, libc::MS_NOEXEC),
        (libc::ST_NOATIME, libc::MS_NOATIME),
        (libc::ST_NODIRATIME, libc::MS_NODIRATIME),
        (libc::ST_RELATIME, libc::MS_RELATIME),
    ];
    Ok(mapping
        .iter()
        .filter(|(st, _)| stat.f_flag & *st != 0)
        .fold(0, |acc, (_, ms)| acc | ms))
}

struct BindMount {
    source: CString,
    target: CString,
    /// Directories to create under the new root, outermost first
    create_dirs: Vec<CString>,
    is_dir: bool,
    /// `None` for writable binds
    readonly_flags: Option<libc::c_ulong>,
    depth: usize,
}

impl BindMount {
    fn new(root: &Path, path: &Path, writable: bool) -> Result<Self, IsolationError> {
        if !path.is_absolute() {
            return Err(IsolationError::Setup(format!(
                "bind path {} is not absolute",
                path.display()
            )));
        }
        let is_dir = fs::metadata(path)
            .map_err(|e| IsolationError::Setup(format!("{}: {e}", path.display())))?
            .is_dir();

        let mut create_dirs = Vec::new();
        let mut target = root.to_path_buf();
        let components: Vec<_> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name),
                _ => None,
            })
            .collect();
        for (i, name) in components.iter().enumerate() {
            target.push(name);
            if is_dir || i + 1 < components.len() {
                create_dirs.push(c_path(&target)?);
            }
        }

        let readonly_flags = if writable {
            None
        } else {
            Some(locked_flags(path)?)
        };

        Ok(Self {
            source: c_path(path)?,
            target: c_path(&target)?,
            create_dirs,
            is_dir,
            readonly_flags,
            depth: components.len(),
        })
    }
}

struct RlimitPlan {
    cpu_secs: libc::rlim_t,
    address_space: libc::rlim_t,
    processes: Option<libc::rlim_t>,
    open_files: libc::rlim_t,
    file_size: libc::rlim_t,
}

impl RlimitPlan {
    fn new(envelope: &ResourceEnvelope, headroom: f64, limit_processes: bool) -> Self {
        let cpu_secs = envelope.cpu_time.as_secs_f64().ceil().max(1.0) as libc::rlim_t;
        let address_space = (envelope.memory_bytes as f64 * headroom) as libc::rlim_t;
        Self {
            cpu_secs,
            address_space,
            // counted per user, which outside a user namespace includes the service itself
            processes: limit_processes.then_some(envelope.processes as libc::rlim_t),
            open_files: envelope.open_files as libc::rlim_t,
            file_size: envelope.file_size_bytes as libc::rlim_t,
        }
    }

    fn apply(&self) -> io::Result<()> {
        set_rlimit(libc::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1)?;
        set_rlimit(libc::RLIMIT_AS, self.address_space, self.address_space)?;
        if let Some(n) = self.processes {
            set_rlimit(libc::RLIMIT_NPROC, n, n)?;
        }
        set_rlimit(libc::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        set_rlimit(libc::RLIMIT_FSIZE, self.file_size, self.file_size)?;
        set_rlimit(libc::RLIMIT_CORE, 0, 0)
    }
}

struct NamespacePlan {
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
    root: CString,
    mounts: Vec<BindMount>,
    cwd: CString,
}

/// Everything the child does between `fork` and `exec`
///
/// Runs in the forked child: no allocation, no locks, no logging.
struct JailPlan {
    namespaces: Option<NamespacePlan>,
    keeper: Keeper,
    limits: RlimitPlan,
}

impl JailPlan {
    fn enter(&self) -> io::Result<()> {
        // SAFETY: every call below is an async-signal-safe system call on
        // pointers that stay valid for the duration of the call
        unsafe {
            check(libc::setsid())?;
            check(libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0))?;
            check(libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, 0, 0, 0))?;
            if let Some(ns) = &self.namespaces {
                ns.enter()?;
            }
            // only the program returns from here
            self.keeper.fork_payload()?;
        }
        self.limits.apply()
    }
}

impl NamespacePlan {
    unsafe fn enter(&self) -> io::Result<()> {
        unsafe {
            check(libc::unshare(libc::CLONE_NEWUSER))?;
            write_proc(c"/proc/self/setgroups", b"deny")?;
            write_proc(c"/proc/self/uid_map", &self.uid_map)?;
            write_proc(c"/proc/self/gid_map", &self.gid_map)?;

            // the pid namespace applies to the children of this process
            check(libc::unshare(
                libc::CLONE_NEWNS
                    | libc::CLONE_NEWPID
                    | libc::CLONE_NEWNET
                    | libc::CLONE_NEWIPC
                    | libc::CLONE_NEWUTS,
            ))?;
            check(libc::mount(
                std::ptr::null(),
                c"/".as_ptr(),
                std::ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                std::ptr::null(),
            ))?;
            check(libc::mount(
                c"tmpfs".as_ptr(),
                self.root.as_ptr(),
                c"tmpfs".as_ptr(),
                libc::MS_NOSUID | libc::MS_NODEV,
                ROOT_TMPFS_OPTIONS.as_ptr().cast(),
            ))?;

            for mount in &self.mounts {
                bind(mount)?;
            }

            check(libc::chroot(self.root.as_ptr()))?;
            check(libc::chdir(self.cwd.as_ptr()))?;
        }
        Ok(())
    }
}

unsafe fn bind(mount: &BindMount) -> io::Result<()> {
    unsafe {
        for dir in &mount.create_dirs {
            if libc::mkdir(dir.as_ptr(), 0o755) != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EEXIST) {
                    return Err(err);
                }
            }
        }
        if !mount.is_dir {
            let fd = libc::open(
                mount.target.as_ptr(),
                libc::O_WRONLY | libc::O_CREAT | libc::O_CLOEXEC,
                0o644,
            );
            check(fd)?;
            libc::close(fd);
        }

        check(libc::mount(
            mount.source.as_ptr(),
            mount.target.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND | libc::MS_REC,
            std::ptr::null(),
        ))?;

        if let Some(locked) = mount.readonly_flags {
            check(libc::mount(
                std::ptr::null(),
                mount.target.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND
                    | libc::MS_REMOUNT
                    | libc::MS_RDONLY
                    | libc::MS_NOSUID
                    | libc::MS_NODEV
                    | locked,
                std::ptr::null(),
            ))?;
        }
    }
    Ok(())
}

unsafe fn write_proc(path: &CStr, data: &[u8]) -> io::Result<()> {
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        check(fd)?;
        let written = libc::write(fd, data.as_ptr().cast(), data.len());
        let result = if written == data.len() as isize {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        };
        libc::close(fd);
        result
    }
}

fn set_rlimit(
    resource: libc::__rlimit_resource_t,
    soft: libc::rlim_t,
    hard: libc::rlim_t,
) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft,
        rlim_max: hard,
    };
    // SAFETY: `limit` outlives the call
    check(unsafe { libc::setrlimit(resource, &limit) })
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::EmbeddedConfig;
    use crate::sandbox::Watchdog;

    fn envelope() -> ResourceEnvelope {
        ResourceEnvelope {
            cpu_time: Duration::from_millis(1500),
            wall_time: Duration::from_secs(5),
            memory_bytes: 128 << 20,
            processes: 64,
            output_bytes: 4096,
            open_files: 32,
            file_size_bytes: 1 << 20,
        }
    }

    fn plain_jail() -> EmbeddedJail {
        EmbeddedJail::build(EmbeddedConfig {
            namespaces: false,
            ..EmbeddedConfig::default()
        })
        .unwrap()
    }

    fn watchdog() -> Watchdog {
        Watchdog::new(Duration::from_millis(20), Duration::from_millis(100))
    }

    /// A namespaced jail, `None` where unprivileged user namespaces are disabled
    fn namespaced_jail(root: &Path) -> Option<EmbeddedJail> {
        let jail = EmbeddedJail::build(EmbeddedConfig {
            namespaces: true,
            root_mountpoint: root.to_path_buf(),
            ..EmbeddedConfig::default()
        })
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        match jail.run(&spec("true", dir.path()), &envelope(), &watchdog()) {
            Ok(outcome) if outcome.exited_cleanly() => Some(jail),
            other => {
                eprintln!("user namespaces unavailable, skipping: {:?}", other.map(|o| o.stderr));
                None
            }
        }
    }

    /// Starts a daemon in a new session that writes `marker` unless it is killed
    const ESCAPING_DAEMON: &str = "(setsid sh -c 'sleep 0.5; echo escaped > marker' &); exit 0";

    fn assert_daemon_killed(jail: &EmbeddedJail) {
        let dir = tempfile::tempdir().unwrap();
        let outcome = jail
            .run(&spec(ESCAPING_DAEMON, dir.path()), &envelope(), &watchdog())
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.elapsed < Duration::from_millis(500));

        std::thread::sleep(Duration::from_secs(1));
        assert!(!dir.path().join("marker").exists(), "daemon outlived the job");
    }

    fn spec(script: &str, cwd: &Path) -> CommandSpec {
        CommandSpec {
            argv: vec!["/bin/sh".into(), "-c".into(), script.into()],
            cwd: cwd.to_path_buf(),
            env: vec!["GREETING=hi".into()],
            writable_paths: vec![cwd.to_path_buf()],
            readonly_paths: vec![],
        }
    }

    #[test]
    fn test_rlimit_plan() {
        let plan = RlimitPlan::new(&envelope(), 2.0, true);
        assert_eq!(plan.cpu_secs, 2);
        assert_eq!(plan.address_space, 256 << 20);
        assert_eq!(plan.processes, Some(64));

        let plan = RlimitPlan::new(&envelope(), 2.0, false);
        assert_eq!(plan.processes, None);
    }

    #[test]
    fn test_bind_mount_layout() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        fs::write(&file, "x").unwrap();
        let root = Path::new("/jail");

        let mount = BindMount::new(root, &file, true).unwrap();
        assert!(!mount.is_dir);
        assert!(mount.readonly_flags.is_none());
        let last = mount.create_dirs.last().unwrap().to_str().unwrap();
        assert_eq!(Path::new(last), root.join(dir.path().strip_prefix("/").unwrap()));
        assert_eq!(
            Path::new(mount.target.to_str().unwrap()),
            root.join(file.strip_prefix("/").unwrap())
        );

        let mount = BindMount::new(root, Path::new("/usr"), false).unwrap();
        assert!(mount.is_dir);
        assert!(mount.readonly_flags.is_some());
        assert_eq!(mount.depth, 1);

        assert!(BindMount::new(root, Path::new("relative"), true).is_err());
    }

    #[test]
    fn test_environment_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let jail = plain_jail();
        let outcome = jail
            .run(
                &spec("echo $GREETING; pwd; echo ${SECRET:-unset}", dir.path()),
                &envelope(),
                &watchdog(),
            )
            .unwrap();

        let cwd = fs::canonicalize(dir.path()).unwrap();
        assert_eq!(
            outcome.stdout.to_string_lossy(),
            format!("hi\n{}\nunset\n", cwd.display())
        );
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[test]
    fn test_cpu_rlimit() {
        let dir = tempfile::tempdir().unwrap();
        let jail = plain_jail();
        let mut envelope = envelope();
        envelope.cpu_time = Duration::from_secs(1);
        envelope.wall_time = Duration::from_secs(10);

        let outcome = jail
            .run(&spec("while :; do :; done", dir.path()), &envelope, &watchdog())
            .unwrap();
        assert_eq!(outcome.kill_cause, Some(crate::sandbox::KillCause::CpuTime));
        assert!(outcome.elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec("", dir.path());
        spec.argv.clear();
        assert!(matches!(
            plain_jail().spawn(&spec, &envelope()),
            Err(IsolationError::Setup(_))
        ));
    }

    #[test]
    fn test_escaped_daemon_is_killed() {
        assert_daemon_killed(&plain_jail());
    }

    #[test]
    fn test_escaped_daemon_is_killed_with_namespaces() {
        let root = tempfile::tempdir().unwrap();
        if let Some(jail) = namespaced_jail(root.path()) {
            assert_daemon_killed(&jail);
        }
    }

    #[test]
    fn test_exit_status_comes_from_the_program() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = plain_jail()
            .run(&spec("kill -SEGV $$", dir.path()), &envelope(), &watchdog())
            .unwrap();
        assert_eq!(outcome.signal, Some(libc::SIGSEGV));
        assert_eq!(outcome.exit_code, None);
    }

    #[test]
    fn test_host_processes_are_out_of_reach() {
        let root = tempfile::tempdir().unwrap();
        let Some(jail) = namespaced_jail(root.path()) else {
            return;
        };
        let mut victim = Command::new("sleep").arg("30").spawn().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let script = format!("kill -9 {} 2>/dev/null; echo rc=$?; id -u", victim.id());
        let outcome = jail.run(&spec(&script, dir.path()), &envelope(), &watchdog()).unwrap();

        let alive = victim.try_wait().unwrap().is_none();
        victim.kill().unwrap();
        victim.wait().unwrap();
        assert!(alive, "the sandboxed program killed a host process");
        assert_eq!(outcome.stdout.to_string_lossy(), format!("rc=1\n{JAIL_ID}\n"));
    }

    #[test]
    fn test_namespaced_wall_time_kill() {
        let root = tempfile::tempdir().unwrap();
        let Some(jail) = namespaced_jail(root.path()) else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let mut envelope = envelope();
        envelope.wall_time = Duration::from_millis(300);

        let outcome = jail
            .run(&spec("trap '' TERM; while :; do :; done", dir.path()), &envelope, &watchdog())
            .unwrap();
        assert_eq!(outcome.kill_cause, Some(crate::sandbox::KillCause::WallTime));
        assert_eq!(outcome.signal, Some(libc::SIGKILL));
        assert!(outcome.elapsed < Duration::from_secs(2));
    }
}
