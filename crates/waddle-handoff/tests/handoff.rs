//! Process handoff end to end, with `/bin/sh` standing in for the next
//! generation of the service.

use std::fs;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use waddle_handoff::{Error, Net};

fn wait(pid: i32) -> i32 {
    let mut status = 0;
    let reaped = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(reaped, pid, "waitpid failed");
    assert!(libc::WIFEXITED(status), "child did not exit normally");
    libc::WEXITSTATUS(status)
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

#[test]
fn test_child_receives_active_listeners() {
    let dir = tempfile::tempdir().unwrap();
    let net = Net::builder()
        .listen_fds("0")
        .working_dir(dir.path())
        .args(sh(
            "{ printf '%s\\n' \"$LISTEN_FDS\"; \
               [ -e /dev/fd/3 ] && echo fd3; \
               [ -e /dev/fd/4 ] && echo fd4; } > report",
        ))
        .build();

    net.listen("tcp", "127.0.0.1:0").unwrap();
    net.listen("tcp4", "127.0.0.1:0").unwrap();
    assert_eq!(net.active_count(), 2);

    let pid = net.start_process().unwrap();
    assert_eq!(wait(pid), 0);

    // The child ran in the configured working directory.
    let report = fs::read_to_string(dir.path().join("report")).unwrap();
    assert_eq!(report.lines().collect::<Vec<_>>(), vec!["2", "fd3", "fd4"]);
}

#[test]
fn test_claimed_inherited_listener_is_passed_on() {
    // Stand-in for a listener this process inherited at fd 620.
    let parent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = parent.local_addr().unwrap().port();
    assert_eq!(unsafe { libc::dup2(parent.as_raw_fd(), 620) }, 620);
    drop(parent);

    let dir = tempfile::tempdir().unwrap();
    let net = Net::builder()
        .fd_start(620)
        .listen_fds("1")
        .working_dir(dir.path())
        .args(sh(
            "{ printf '%s\\n' \"$LISTEN_FDS\"; [ -e /dev/fd/3 ] && echo fd3; } > report",
        ))
        .build();

    let claimed = net.listen("tcp", &format!("127.0.0.1:{port}")).unwrap();
    assert_eq!(claimed.as_raw_fd(), 620);
    assert_eq!(net.unclaimed_count(), 0);
    // The registry keeps its own descriptor once the caller lets go.
    drop(claimed);

    let pid = net.start_process().unwrap();
    assert_eq!(wait(pid), 0);

    let report = fs::read_to_string(dir.path().join("report")).unwrap();
    assert_eq!(report.lines().collect::<Vec<_>>(), vec!["1", "fd3"]);

    // The socket is still listening in this process.
    assert!(std::net::TcpStream::connect(("127.0.0.1", port)).is_ok());
}

#[test]
fn test_start_process_runs_once() {
    let dir = tempfile::tempdir().unwrap();
    let net = Net::builder()
        .listen_fds("0")
        .working_dir(dir.path())
        .args(sh("echo started >> starts"))
        .build();
    net.listen("tcp", "127.0.0.1:0").unwrap();

    let first = net.start_process().unwrap();
    let second = net.start_process().unwrap();
    assert_eq!(first, second);
    assert_eq!(wait(first), 0);

    let starts = fs::read_to_string(dir.path().join("starts")).unwrap();
    assert_eq!(starts.lines().count(), 1);
}

#[test]
fn test_start_process_without_listeners() {
    let dir = tempfile::tempdir().unwrap();
    let net = Net::builder()
        .listen_fds("0")
        .working_dir(dir.path())
        .args(sh("printf '%s' \"$LISTEN_FDS\" > count"))
        .build();

    let pid = net.start_process().unwrap();
    assert_eq!(wait(pid), 0);
    assert_eq!(fs::read_to_string(dir.path().join("count")).unwrap(), "0");
}

#[test]
fn test_path_prefix_locates_new_binary() {
    let dir = tempfile::tempdir().unwrap();
    let release = dir.path().join("release");
    fs::create_dir(&release).unwrap();
    let tool = release.join("tool");
    fs::write(&tool, "#!/bin/sh\necho \"$@\" > \"$(dirname \"$0\")/ran\"\n").unwrap();
    fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

    let mut prefix = release.clone().into_os_string();
    prefix.push("/");
    let net = Net::builder()
        .listen_fds("0")
        .path_prefix(prefix)
        .working_dir(dir.path())
        .args(["tool", "--flag", "value"])
        .build();

    let pid = net.start_process().unwrap();
    assert_eq!(wait(pid), 0);
    assert_eq!(
        fs::read_to_string(release.join("ran")).unwrap().trim(),
        "--flag value"
    );
}

#[test]
fn test_missing_binary_is_reported_and_replayed() {
    let net = Net::builder()
        .listen_fds("0")
        .working_dir(Path::new("/"))
        .args(["waddle-handoff-no-such-binary"])
        .build();
    net.listen("tcp", "127.0.0.1:0").unwrap();

    let first = net.start_process().unwrap_err();
    assert!(matches!(first, Error::PathResolution { .. }));

    let second = net.start_process().unwrap_err();
    assert_eq!(first.to_string(), second.to_string());
    assert_eq!(net.active_count(), 1);
}
