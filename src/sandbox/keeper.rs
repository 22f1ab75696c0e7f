//! The process left behind in the jail after the sandboxed program is forked.
//!
//! The spawned child never execs itself. It forks the program, becomes the
//! reaper of everything the program leaves behind and reports the program's
//! exit status and rusage through a pipe before it exits. With namespaces an
//! init process of a fresh pid namespace sits in between, so the kernel takes
//! every process of the job down with it.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use super::handle::ExitInfo;

const CHILDREN_FILE: &std::ffi::CStr = c"/proc/thread-self/children";
/// Descriptor range closed by hand when `close_range` is unavailable
const FALLBACK_FD_LIMIT: RawFd = 1024;

#[repr(C)]
#[derive(Clone, Copy)]
struct StatusRecord {
    status: libc::c_int,
    usage: libc::rusage,
}

const RECORD_SIZE: usize = std::mem::size_of::<StatusRecord>();

/// Read end of the status pipe
pub(super) struct StatusReader(File);

impl StatusReader {
    /// The first record written, `None` if the keeper died before writing one
    pub(super) fn read(&mut self) -> Option<ExitInfo> {
        let mut buf = [0u8; RECORD_SIZE];
        if let Err(e) = self.0.read_exact(&mut buf) {
            log::debug!("No exit record from the keeper: {e}");
            return None;
        }
        // SAFETY: StatusRecord is plain old data and `buf` holds exactly one
        let record: StatusRecord = unsafe { std::ptr::read_unaligned(buf.as_ptr().cast()) };
        Some(ExitInfo::from_raw(record.status, &record.usage))
    }
}

/// Creates the status pipe; only the write end is inherited across `fork`
pub(super) fn status_pipe() -> io::Result<(StatusReader, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for both ends
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 just created both descriptors and nothing else owns them
    let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    // read once the keeper is reaped; a missing record must not block
    // SAFETY: plain fcntl on a descriptor we own
    let flags = unsafe { libc::fcntl(reader.as_raw_fd(), libc::F_GETFL) };
    if flags == -1
        || unsafe { libc::fcntl(reader.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1
    {
        return Err(io::Error::last_os_error());
    }
    Ok((StatusReader(File::from(reader)), writer))
}

/// The keeper side of the fork, prepared before the first `fork`
pub(super) struct Keeper {
    status_fd: RawFd,
    /// The keeper already unshared a pid namespace, its child becomes init
    nested: bool,
}

impl Keeper {
    pub(super) fn new(status: &OwnedFd, nested: bool) -> Self {
        Self {
            status_fd: status.as_raw_fd(),
            nested,
        }
    }

    /// Forks the sandboxed program
    ///
    /// Returns only in the program's process, which then goes on to `exec`.
    /// Runs between `fork` and `exec` of the spawned child: async-signal-safe
    /// calls only.
    pub(super) unsafe fn fork_payload(&self) -> io::Result<()> {
        unsafe {
            // the watchdog's SIGTERM goes to the whole group; it is meant for the program
            set_sigterm_blocked(true)?;
            check(libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1 as libc::c_ulong, 0, 0, 0))?;

            let keeper = libc::getpid();
            let child = fork()?;
            if child != 0 {
                self.keep(child);
            }

            if !self.nested {
                return enter_payload(keeper);
            }
            // pid 1 of the new namespace
            check(libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0))?;
            let init = libc::getpid();
            let payload = fork()?;
            if payload != 0 {
                self.init(payload);
            }
            enter_payload(init)
        }
    }

    unsafe fn keep(&self, child: libc::pid_t) -> ! {
        unsafe {
            close_fds_except(self.status_fd);
            if self.nested {
                // the namespace init reports the program; this record only
                // matters if init itself was killed first
                if let Some((status, usage)) = wait_for(child) {
                    write_record(self.status_fd, status, &usage);
                }
            } else {
                reap_until(child, self.status_fd);
                kill_orphans();
            }
            libc::_exit(0)
        }
    }

    /// Leaving init tears down the namespace and every process in it
    unsafe fn init(&self, payload: libc::pid_t) -> ! {
        unsafe {
            close_fds_except(self.status_fd);
            reap_until(payload, self.status_fd);
            libc::_exit(0)
        }
    }
}

unsafe fn enter_payload(parent: libc::pid_t) -> io::Result<()> {
    unsafe {
        check(libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0))?;
        if libc::getppid() != parent {
            libc::_exit(1);
        }
        set_sigterm_blocked(false)
    }
}

unsafe fn fork() -> io::Result<libc::pid_t> {
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        pid => Ok(pid),
    }
}

unsafe fn set_sigterm_blocked(blocked: bool) -> io::Result<()> {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGTERM);
        let how = if blocked { libc::SIG_BLOCK } else { libc::SIG_UNBLOCK };
        check(libc::sigprocmask(how, &set, std::ptr::null_mut()))
    }
}

/// Closes stdio and the spawn error pipe along with everything else
unsafe fn close_fds_except(keep: RawFd) {
    let close_range = |first: RawFd, last: libc::c_uint| unsafe {
        libc::syscall(libc::SYS_close_range, first as libc::c_uint, last, 0 as libc::c_uint) == 0
    };
    let closed = (keep == 0 || close_range(0, (keep - 1) as libc::c_uint))
        && close_range(keep + 1, libc::c_uint::MAX);
    if !closed {
        for fd in (0..FALLBACK_FD_LIMIT).filter(|&fd| fd != keep) {
            unsafe { libc::close(fd) };
        }
    }
}

unsafe fn wait_for(pid: libc::pid_t) -> Option<(libc::c_int, libc::rusage)> {
    unsafe {
        let mut status = 0;
        let mut usage: libc::rusage = std::mem::zeroed();
        loop {
            if libc::wait4(pid, &mut status, 0, &mut usage) == pid {
                return Some((status, usage));
            }
            if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return None;
            }
        }
    }
}

/// Reaps children until `payload` is among them and reports its status
unsafe fn reap_until(payload: libc::pid_t, status_fd: RawFd) {
    unsafe {
        let mut status = 0;
        let mut usage: libc::rusage = std::mem::zeroed();
        loop {
            match libc::wait4(-1, &mut status, 0, &mut usage) {
                pid if pid == payload => {
                    write_record(status_fd, status, &usage);
                    return;
                }
                -1 if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) => return,
                _ => {}
            }
        }
    }
}

unsafe fn write_record(fd: RawFd, status: libc::c_int, usage: &libc::rusage) {
    let record = StatusRecord {
        status,
        usage: *usage,
    };
    // a record fits into the pipe buffer and is written in one piece
    unsafe { libc::write(fd, (&record as *const StatusRecord).cast(), RECORD_SIZE) };
}

/// Kills whatever got reparented to the keeper until it has no children left
unsafe fn kill_orphans() {
    let mut buf = [0u8; 4096];
    loop {
        unsafe {
            let fd = libc::open(CHILDREN_FILE.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC);
            if fd >= 0 {
                let n = libc::read(fd, buf.as_mut_ptr().cast(), buf.len());
                libc::close(fd);
                if n > 0 {
                    for_each_pid(&buf[..n as usize], |pid| {
                        libc::kill(pid, libc::SIGKILL);
                    });
                }
            }
            if libc::waitpid(-1, std::ptr::null_mut(), 0) == -1
                && io::Error::last_os_error().raw_os_error() != Some(libc::EINTR)
            {
                return;
            }
        }
    }
}

/// Calls `f` for every whitespace separated decimal in `list`
fn for_each_pid(list: &[u8], mut f: impl FnMut(libc::pid_t)) {
    let mut current: Option<libc::pid_t> = None;
    for &b in list.iter().chain(std::iter::once(&b' ')) {
        if b.is_ascii_digit() {
            let digit = libc::pid_t::from(b - b'0');
            current = Some(current.unwrap_or(0).saturating_mul(10).saturating_add(digit));
        } else if let Some(pid) = current.take() {
            f(pid);
        }
    }
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
    use std::io::Write;

    use super::*;

    #[test]
    fn test_for_each_pid() {
        let mut pids = Vec::new();
        for_each_pid(b"12 345 6\n", |pid| pids.push(pid));
        assert_eq!(pids, vec![12, 345, 6]);

        pids.clear();
        for_each_pid(b"", |pid| pids.push(pid));
        assert!(pids.is_empty());
    }

    #[test]
    fn test_status_record_round_trip_through_pipe() {
        let (mut reader, writer) = status_pipe().unwrap();
        // exited with code 3 after one second of user time
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        usage.ru_utime.tv_sec = 1;
        usage.ru_maxrss = 2048;
        unsafe { write_record(writer.as_raw_fd(), 3 << 8, &usage) };

        let exit = reader.read().unwrap();
        assert_eq!(exit.exit_code, Some(3));
        assert_eq!(exit.signal, None);
        assert_eq!(exit.cpu_time, std::time::Duration::from_secs(1));
        assert_eq!(exit.max_rss, 2048 * 1024);
    }

    #[test]
    fn test_missing_record_does_not_block() {
        let (mut reader, writer) = status_pipe().unwrap();
        assert!(reader.read().is_none());

        // a torn record counts as missing too
        let mut file = File::from(writer);
        file.write_all(&[0u8; 3]).unwrap();
        drop(file);
        assert!(reader.read().is_none());
    }
}
