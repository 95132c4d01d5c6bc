//! Listener inheritance from file descriptors.
//!
//! Checks the `LISTEN_FDS` environment variable (compatible with systemd
//! socket activation). Descriptors `3..3 + LISTEN_FDS` are wrapped as
//! listeners. Fails if the env says fds exist but one of them is invalid.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::listener::Listener;

/// Environment variable carrying the number of inherited listeners.
pub const LISTEN_FDS: &str = "LISTEN_FDS";

/// First inherited descriptor, right after stdin, stdout and stderr.
pub const LISTEN_FDS_START: RawFd = 3;

/// Parse the inherited count. Absent or empty means nothing was passed down.
pub(crate) fn parse_count(value: Option<&str>) -> Result<usize> {
    match value {
        None | Some("") => Ok(0),
        Some(v) => v.parse().map_err(|_| Error::Config {
            key: LISTEN_FDS,
            value: v.to_string(),
        }),
    }
}

/// Wrap descriptors `fd_start..fd_start + count`, appending each to `inherited`.
///
/// Stops at the first bad descriptor. Listeners loaded before it stay in
/// `inherited`.
pub(crate) fn load(fd_start: RawFd, count: usize, inherited: &mut Vec<Option<Listener>>) -> Result<()> {
    if count == 0 {
        debug!("No inherited listeners");
        return Ok(());
    }

    let end = RawFd::try_from(count)
        .ok()
        .and_then(|count| fd_start.checked_add(count))
        .ok_or_else(|| Error::Config {
            key: LISTEN_FDS,
            value: count.to_string(),
        })?;

    for fd in fd_start..end {
        let owned = claim_fd(fd).map_err(|e| Error::inherit(fd, e))?;
        let listener = Listener::from_inherited(owned).map_err(|e| Error::inherit(fd, e))?;

        let addr = listener.local_addr().ok();
        info!(
            fd,
            network = %listener.network(),
            addr = ?addr.map(|a| a.to_string()),
            "Inherited listener from parent process"
        );
        inherited.push(Some(listener));
    }

    Ok(())
}

/// Take ownership of an inherited descriptor after checking it is open.
fn claim_fd(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: F_GETFD only queries descriptor flags.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the descriptor is open and was handed to this process by its
    // parent for exclusive use; nothing else in the process refers to it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
