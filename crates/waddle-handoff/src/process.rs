//! Launching the next process generation with file descriptor passing.
//!
//! The child gets the original arguments, the working directory the process
//! started in, the current environment with a fresh `LISTEN_FDS`, and the
//! listener descriptors placed at fd 3..3+N right after the standard streams.

use std::ffi::{CString, OsStr, OsString};
use std::fs;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::inherit::{LISTEN_FDS, LISTEN_FDS_START};

/// Arguments and working directory of the process as it was started.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    args: Vec<OsString>,
    working_dir: Option<PathBuf>,
}

impl LaunchContext {
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }
}

static LAUNCH_CONTEXT: OnceLock<LaunchContext> = OnceLock::new();

/// Record the process arguments and working directory.
///
/// The first call wins; later calls return the recorded context even if the
/// working directory has changed since. Call it first thing in `main`.
/// Constructing a [`Net`](crate::Net) calls it as well.
pub fn capture_launch_context() -> &'static LaunchContext {
    LAUNCH_CONTEXT.get_or_init(|| LaunchContext {
        args: std::env::args_os().collect(),
        working_dir: std::env::current_dir().ok(),
    })
}

/// Locate `program` the way a shell would.
///
/// Names containing a slash are checked directly (relative ones against
/// `working_dir`); bare names are searched in `path_var`. The result is
/// absolute but not canonicalized, so a symlink is followed at exec time.
pub(crate) fn look_path(
    program: &Path,
    working_dir: Option<&Path>,
    path_var: Option<&OsStr>,
) -> io::Result<PathBuf> {
    if program.as_os_str().is_empty() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "empty program name"));
    }

    if program.as_os_str().as_bytes().contains(&b'/') {
        let candidate = match working_dir {
            Some(dir) if program.is_relative() => dir.join(program),
            _ => program.to_path_buf(),
        };
        check_executable(&candidate)?;
        return absolute(candidate);
    }

    let not_found = || {
        io::Error::new(
            io::ErrorKind::NotFound,
            "executable file not found in $PATH",
        )
    };
    let path_var = path_var.filter(|p| !p.is_empty()).ok_or_else(not_found)?;

    for dir in std::env::split_paths(path_var) {
        let dir = if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir
        };
        let candidate = dir.join(program);
        if check_executable(&candidate).is_ok() {
            return absolute(candidate);
        }
    }

    Err(not_found())
}

fn check_executable(path: &Path) -> io::Result<()> {
    let meta = fs::metadata(path)?;
    if meta.is_dir() || meta.permissions().mode() & 0o111 == 0 {
        return Err(io::Error::from(io::ErrorKind::PermissionDenied));
    }
    Ok(())
}

fn absolute(path: PathBuf) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// The current environment minus any `LISTEN_FDS`, plus `LISTEN_FDS=count`.
pub(crate) fn child_environment(
    vars: impl IntoIterator<Item = (OsString, OsString)>,
    count: usize,
) -> Vec<(OsString, OsString)> {
    let mut env: Vec<(OsString, OsString)> = vars
        .into_iter()
        .filter(|(key, _)| key != LISTEN_FDS)
        .collect();
    env.push((LISTEN_FDS.into(), count.to_string().into()));
    env
}

/// Everything the forked child needs, allocated before the fork.
struct ExecPlan {
    program: CString,
    _args: Vec<CString>,
    arg_ptrs: Vec<*const libc::c_char>,
    _env: Vec<CString>,
    env_ptrs: Vec<*const libc::c_char>,
    working_dir: Option<CString>,
    fds: Vec<RawFd>,
}

impl ExecPlan {
    fn new(
        program: &Path,
        args: &[OsString],
        env: &[(OsString, OsString)],
        working_dir: Option<&Path>,
        fds: &[OwnedFd],
    ) -> io::Result<Self> {
        let program = cstring(program.as_os_str().as_bytes())?;

        let args: Vec<CString> = args
            .iter()
            .map(|a| cstring(a.as_bytes()))
            .collect::<io::Result<_>>()?;
        let env: Vec<CString> = env
            .iter()
            .map(|(k, v)| {
                let mut entry = k.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(v.as_bytes());
                cstring(&entry)
            })
            .collect::<io::Result<_>>()?;

        let arg_ptrs = null_terminated(&args);
        let env_ptrs = null_terminated(&env);
        let working_dir = working_dir
            .map(|d| cstring(d.as_os_str().as_bytes()))
            .transpose()?;

        Ok(Self {
            program,
            _args: args,
            arg_ptrs,
            _env: env,
            env_ptrs,
            working_dir,
            fds: fds.iter().map(AsRawFd::as_raw_fd).collect(),
        })
    }

    /// Lowest descriptor above the range the listeners are moved into.
    fn floor(&self) -> RawFd {
        LISTEN_FDS_START + self.fds.len() as RawFd
    }
}

fn cstring(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Start `program` with `fds` at descriptors 3.. and return its pid.
///
/// `args[0]` is passed as the child's argv[0]. An exec failure in the child
/// is reported back through a close-on-exec socket and returned here.
pub(crate) fn spawn(
    program: &Path,
    args: &[OsString],
    env: &[(OsString, OsString)],
    working_dir: Option<&Path>,
    fds: &[OwnedFd],
) -> io::Result<i32> {
    let plan = ExecPlan::new(program, args, env, working_dir, fds)?;
    let mut scratch: Vec<RawFd> = vec![-1; plan.fds.len()];

    // Both ends must sit above the target range or the child would clobber them.
    let (report_rx, report_tx) = UnixStream::pair()?;
    let report_rx = move_above(report_rx.into(), plan.floor())?;
    let report_tx = move_above(report_tx.into(), plan.floor())?;

    // SAFETY: the child only makes async-signal-safe calls before execve or _exit.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }

    if pid == 0 {
        // SAFETY: in the forked child; see exec_child.
        unsafe {
            let errno = exec_child(&plan, &mut scratch);
            let bytes = errno.to_ne_bytes();
            libc::write(
                report_tx.as_raw_fd(),
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
            );
            libc::_exit(127);
        }
    }

    drop(report_tx);
    let mut report = Vec::with_capacity(4);
    UnixStream::from(report_rx).read_to_end(&mut report)?;

    if let Ok(bytes) = <[u8; 4]>::try_from(report.as_slice()) {
        // SAFETY: reaping our own child, which has exited or is about to.
        unsafe { libc::waitpid(pid, std::ptr::null_mut(), 0) };
        return Err(io::Error::from_raw_os_error(i32::from_ne_bytes(bytes)));
    }

    Ok(pid)
}

fn move_above(fd: OwnedFd, floor: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: fd is open; the duplicate is owned by the returned OwnedFd.
    let moved = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
    if moved < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(moved) })
}

/// Runs in the forked child. Returns errno on failure; never returns on success.
///
/// Listener descriptors are first moved above the target range so placing
/// one at fd 3+i cannot overwrite another that still has to be moved.
unsafe fn exec_child(plan: &ExecPlan, scratch: &mut [RawFd]) -> libc::c_int {
    let errno = || io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL);

    let mut mask: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut mask);
    libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    for (slot, &fd) in scratch.iter_mut().zip(&plan.fds) {
        let moved = libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, plan.floor());
        if moved < 0 {
            return errno();
        }
        *slot = moved;
    }

    for (i, &fd) in scratch.iter().enumerate() {
        let target = LISTEN_FDS_START + i as RawFd;
        if libc::dup2(fd, target) < 0 {
            return errno();
        }
        let flags = libc::fcntl(target, libc::F_GETFD);
        if flags < 0 || libc::fcntl(target, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
            return errno();
        }
    }

    if let Some(dir) = &plan.working_dir {
        if libc::chdir(dir.as_ptr()) < 0 {
            return errno();
        }
    }

    libc::execve(
        plan.program.as_ptr(),
        plan.arg_ptrs.as_ptr(),
        plan.env_ptrs.as_ptr(),
    );
    errno()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn write_script(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    fn wait(pid: i32) -> i32 {
        let mut status = 0;
        let reaped = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(reaped, pid);
        assert!(libc::WIFEXITED(status));
        libc::WEXITSTATUS(status)
    }

    #[test]
    fn test_launch_context_is_stable() {
        let first = capture_launch_context();
        let second = capture_launch_context();
        assert!(std::ptr::eq(first, second));
        assert!(!first.args().is_empty());
    }

    #[test]
    fn test_look_path_searches_path_entries() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir(&bin).unwrap();
        write_script(&bin, "server", 0o755);

        let path_var = std::env::join_paths([dir.path().join("missing"), bin.clone()]).unwrap();
        let found = look_path(Path::new("server"), None, Some(&path_var)).unwrap();
        assert_eq!(found, bin.join("server"));
    }

    #[test]
    fn test_look_path_skips_non_executables() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "server", 0o644);

        let path_var = dir.path().as_os_str().to_os_string();
        let err = look_path(Path::new("server"), None, Some(&path_var)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let err = look_path(&dir.path().join("server"), None, None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_look_path_relative_to_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "server", 0o755);

        let found = look_path(Path::new("./server"), Some(dir.path()), None).unwrap();
        assert_eq!(found, dir.path().join("./server"));
    }

    #[test]
    fn test_look_path_keeps_symlink() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "server-v2", 0o755);
        let link = dir.path().join("server");
        symlink(dir.path().join("server-v2"), &link).unwrap();

        assert_eq!(look_path(&link, None, None).unwrap(), link);
    }

    #[test]
    fn test_child_environment_replaces_count() {
        let vars = vec![
            (OsString::from("HOME"), OsString::from("/home/waddle")),
            (OsString::from("LISTEN_FDS"), OsString::from("7")),
            (OsString::from("LISTEN_FDS_EXTRA"), OsString::from("kept")),
            (OsString::from("LISTEN_FDS"), OsString::from("9")),
        ];
        let env = child_environment(vars, 2);

        let counts: Vec<_> = env.iter().filter(|(k, _)| k == "LISTEN_FDS").collect();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].1, "2");
        assert_eq!(env.last().unwrap().0, "LISTEN_FDS");
        assert!(env.iter().any(|(k, v)| k == "LISTEN_FDS_EXTRA" && v == "kept"));
        assert!(env.iter().any(|(k, _)| k == "HOME"));
    }

    #[test]
    fn test_spawn_places_descriptors_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fds = vec![OwnedFd::from(listener)];
        let script = format!(
            "printf '%s' \"$LISTEN_FDS:$(pwd)\" > {0}; [ -e /dev/fd/3 ] && printf ':fd3' >> {0}",
            out.display()
        );
        let args: Vec<OsString> = vec!["sh".into(), "-c".into(), script.into()];
        let env = child_environment(std::env::vars_os(), fds.len());

        let pid = spawn(
            Path::new("/bin/sh"),
            &args,
            &env,
            Some(dir.path()),
            &fds,
        )
        .unwrap();
        assert_eq!(wait(pid), 0);

        let written = fs::read_to_string(&out).unwrap();
        let expected_dir = fs::canonicalize(dir.path()).unwrap();
        let mut parts = written.split(':');
        assert_eq!(parts.next(), Some("1"));
        assert_eq!(
            fs::canonicalize(parts.next().unwrap()).unwrap(),
            expected_dir
        );
        assert_eq!(parts.next(), Some("fd3"));
    }

    #[test]
    fn test_spawn_reports_exec_failure() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-there");
        let args = vec![OsString::from("not-there")];

        let err = spawn(&missing, &args, &[], None, &[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
